//! Suspended continuations.
//!
//! A wait owns a resume value and a usecount. Each condition source the wait
//! is registered on (a cache entry's valid or clean set, the watchlist)
//! increments the usecount; each firing decrements it, and at zero the
//! resume value is handed back to the caller to be executed exactly once.
//! Condition sources hold [`WaitId`]s, never pointers, so there are no
//! ownership cycles between the cache and its waiters.

use std::collections::{HashMap, HashSet};

/// Opaque handle to a registered wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaitId(u64);

#[derive(Debug)]
struct WaitState<R> {
    usecount: u32,
    resume: R,
}

/// Registry of pending waits, generic over the resume payload.
#[derive(Debug, Default)]
pub struct WaitRegistry<R> {
    next: u64,
    waits: HashMap<WaitId, WaitState<R>>,
}

impl<R> WaitRegistry<R> {
    pub fn new() -> Self {
        Self {
            next: 0,
            waits: HashMap::new(),
        }
    }

    /// Register a new wait with usecount zero. The caller must attach it to
    /// at least one condition source (via [`incref`](Self::incref)) or
    /// discard it.
    pub fn create(&mut self, resume: R) -> WaitId {
        let id = WaitId(self.next);
        self.next += 1;
        self.waits.insert(id, WaitState { usecount: 0, resume });
        id
    }

    /// Record one more condition source holding this wait.
    pub fn incref(&mut self, id: WaitId) {
        if let Some(w) = self.waits.get_mut(&id) {
            w.usecount += 1;
        }
    }

    /// One condition fired. Returns the resume value once the last
    /// registration is released.
    pub fn decref(&mut self, id: WaitId) -> Option<R> {
        let w = self.waits.get_mut(&id)?;
        w.usecount = w.usecount.saturating_sub(1);
        if w.usecount == 0 {
            self.waits.remove(&id).map(|w| w.resume)
        } else {
            None
        }
    }

    pub fn usecount(&self, id: WaitId) -> u32 {
        self.waits.get(&id).map(|w| w.usecount).unwrap_or(0)
    }

    /// Remove a wait unconditionally, returning its resume value.
    pub fn discard(&mut self, id: WaitId) -> Option<R> {
        self.waits.remove(&id).map(|w| w.resume)
    }

    /// Remove every listed wait regardless of usecount, in order.
    ///
    /// This is the run-queue primitive behind the watchlist: all queued
    /// waits fire, and a resume action that still needs to wait re-queues
    /// itself.
    pub fn take_many(&mut self, ids: &[WaitId]) -> Vec<R> {
        ids.iter()
            .filter_map(|id| self.waits.remove(id).map(|w| w.resume))
            .collect()
    }

    /// Ids of waits whose resume value matches the predicate.
    pub fn ids_matching(&self, pred: impl Fn(&R) -> bool) -> Vec<WaitId> {
        let mut ids: Vec<WaitId> = self
            .waits
            .iter()
            .filter(|(_, w)| pred(&w.resume))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Drop a set of waits outright (disconnect / unwatch cleanup).
    pub fn remove_ids(&mut self, ids: &HashSet<WaitId>) {
        for id in ids {
            self.waits.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.waits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }
}
