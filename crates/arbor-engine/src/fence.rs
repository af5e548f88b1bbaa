use serde::{Deserialize, Serialize};

use arbor_broker::Envelope;
use arbor_core::{flags, Dirent};

/// One accumulated mutation: set `key` to a dirent, or unlink it when the
/// dirent is `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub key: String,
    pub dirent: Option<Dirent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Waiting for participants.
    Open,
    /// All participants reported; queued for commit.
    Ready,
    /// Promoted into (or merged into) the running commit.
    Processing,
}

/// A named, possibly multi-participant commit request.
///
/// The fence accumulates ops and request envelopes until `nprocs`
/// contributions have arrived; it stays registered until the matching
/// `setroot` or `error` event is observed locally, which is when the
/// retained envelopes are answered.
#[derive(Debug)]
pub struct Fence {
    name: String,
    nprocs: u32,
    flags: u32,
    received: u32,
    names: Vec<String>,
    ops: Vec<Op>,
    envelopes: Vec<Envelope>,
    state: FenceState,
}

impl Fence {
    pub fn new(name: impl Into<String>, nprocs: u32, fence_flags: u32) -> Self {
        let name = name.into();
        Self {
            names: vec![name.clone()],
            name,
            nprocs,
            flags: fence_flags,
            received: 0,
            ops: Vec::new(),
            envelopes: Vec::new(),
            state: FenceState::Open,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nprocs(&self) -> u32 {
        self.nprocs
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Later requests for the same fence OR their flags in.
    pub fn or_flags(&mut self, fence_flags: u32) {
        self.flags |= fence_flags;
    }

    pub fn no_merge(&self) -> bool {
        self.flags & flags::NO_MERGE != 0
    }

    pub fn state(&self) -> FenceState {
        self.state
    }

    pub fn set_state(&mut self, state: FenceState) {
        self.state = state;
    }

    /// Retain a request envelope to answer when the fence completes.
    pub fn add_envelope(&mut self, env: Envelope) {
        self.envelopes.push(env);
    }

    pub fn take_envelopes(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.envelopes)
    }

    /// Record one participant's contribution, in arrival order. Returns
    /// true when this contribution made the fence ready.
    pub fn add_ops(&mut self, ops: Vec<Op>) -> bool {
        self.ops.extend(ops);
        self.received += 1;
        if self.state == FenceState::Open && self.received >= self.nprocs {
            self.state = FenceState::Ready;
            true
        } else {
            false
        }
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub(crate) fn take_names(&mut self) -> Vec<String> {
        std::mem::take(&mut self.names)
    }

    pub(crate) fn take_ops(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ready_only_after_nprocs_contributions() {
        let mut f = Fence::new("f1", 2, 0);
        assert_eq!(f.state(), FenceState::Open);

        assert!(!f.add_ops(vec![Op { key: "x".into(), dirent: None }]));
        assert_eq!(f.state(), FenceState::Open);

        assert!(f.add_ops(vec![Op { key: "y".into(), dirent: None }]));
        assert_eq!(f.state(), FenceState::Ready);
        assert_eq!(f.received(), 2);
        assert_eq!(f.ops().len(), 2);
    }

    #[test]
    fn ops_keep_arrival_order() {
        let mut f = Fence::new("f1", 2, 0);
        f.add_ops(vec![Op { key: "a".into(), dirent: None }]);
        f.add_ops(vec![Op { key: "b".into(), dirent: None }]);
        let keys: Vec<&str> = f.ops().iter().map(|op| op.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn flags_accumulate() {
        let mut f = Fence::new("f1", 1, 0);
        assert!(!f.no_merge());
        f.or_flags(flags::NO_MERGE);
        assert!(f.no_merge());
    }

    #[test]
    fn op_wire_form() {
        let op = Op {
            key: "a/b".into(),
            dirent: Some(Dirent::FileVal(json!(42))),
        };
        let v = serde_json::to_value(&op).unwrap();
        assert_eq!(v, json!({ "key": "a/b", "dirent": { "FILEVAL": 42 } }));

        let unlink: Op = serde_json::from_value(json!({ "key": "a", "dirent": null })).unwrap();
        assert_eq!(unlink.dirent, None);
    }
}
