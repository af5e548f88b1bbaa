use std::sync::Arc;

use serde_json::Value;

use crate::wait::WaitId;

/// One cached object under a blob ref.
///
/// Invariants: an entry without an object is invalid; a dirty entry is
/// always valid; because blobs are content-addressed and immutable, an
/// entry that has gone clean under a ref is never dirtied again.
#[derive(Debug, Default)]
pub struct CacheEntry {
    object: Option<Arc<Value>>,
    size: usize,
    dirty: bool,
    store_pending: bool,
    last_use_epoch: u64,
    waiters_valid: Vec<WaitId>,
    waiters_clean: Vec<WaitId>,
}

impl CacheEntry {
    /// An incomplete entry: a fault has been issued but no object yet.
    pub fn incomplete(epoch: u64) -> Self {
        Self {
            last_use_epoch: epoch,
            ..Self::default()
        }
    }

    /// A valid, clean entry (e.g. primed from a setroot event).
    pub fn valid(object: Value, size: usize, epoch: u64) -> Self {
        Self {
            object: Some(Arc::new(object)),
            size,
            last_use_epoch: epoch,
            ..Self::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.object.is_some()
    }

    pub fn object(&self) -> Option<&Arc<Value>> {
        self.object.as_ref()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Install the object, making the entry valid. Returns the waiters that
    /// were parked on validity; the caller releases them.
    pub fn set_object(&mut self, object: Value, size: usize) -> Vec<WaitId> {
        self.object = Some(Arc::new(object));
        self.size = size;
        std::mem::take(&mut self.waiters_valid)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Mark the entry as not yet acknowledged by the content store.
    pub fn set_dirty(&mut self) {
        debug_assert!(self.object.is_some(), "dirty entry must be valid");
        self.dirty = true;
    }

    /// The content store acknowledged the blob. Returns the waiters parked
    /// on cleanliness.
    pub fn clear_dirty(&mut self) -> Vec<WaitId> {
        self.dirty = false;
        std::mem::take(&mut self.waiters_clean)
    }

    pub fn is_store_pending(&self) -> bool {
        self.store_pending
    }

    pub fn set_store_pending(&mut self, pending: bool) {
        self.store_pending = pending;
    }

    pub fn last_use_epoch(&self) -> u64 {
        self.last_use_epoch
    }

    pub fn touch(&mut self, epoch: u64) {
        if epoch > self.last_use_epoch {
            self.last_use_epoch = epoch;
        }
    }

    pub fn wait_valid(&mut self, id: WaitId) {
        self.waiters_valid.push(id);
    }

    pub fn wait_clean(&mut self, id: WaitId) {
        self.waiters_clean.push(id);
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters_valid.is_empty() || !self.waiters_clean.is_empty()
    }

    /// Drain every waiter parked on validity (used to fail a load).
    pub fn drain_valid_waiters(&mut self) -> Vec<WaitId> {
        std::mem::take(&mut self.waiters_valid)
    }

    pub(crate) fn remove_waiters(&mut self, ids: &std::collections::HashSet<WaitId>) -> usize {
        let before = self.waiters_valid.len() + self.waiters_clean.len();
        self.waiters_valid.retain(|id| !ids.contains(id));
        self.waiters_clean.retain(|id| !ids.contains(id));
        before - (self.waiters_valid.len() + self.waiters_clean.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::WaitRegistry;
    use serde_json::json;

    #[test]
    fn incomplete_then_valid() {
        let mut e = CacheEntry::incomplete(3);
        assert!(!e.is_valid());
        assert!(e.object().is_none());

        let mut reg: WaitRegistry<u8> = WaitRegistry::new();
        let w = reg.create(0);
        reg.incref(w);
        e.wait_valid(w);
        assert!(e.has_waiters());

        let woken = e.set_object(json!({ "a": 1 }), 8);
        assert_eq!(woken, vec![w]);
        assert!(e.is_valid());
        assert!(!e.has_waiters());
    }

    #[test]
    fn dirty_implies_valid() {
        let mut e = CacheEntry::valid(json!(1), 1, 0);
        e.set_dirty();
        assert!(e.is_dirty());
        assert!(e.is_valid());

        let mut reg: WaitRegistry<u8> = WaitRegistry::new();
        let w = reg.create(0);
        reg.incref(w);
        e.wait_clean(w);

        let woken = e.clear_dirty();
        assert_eq!(woken, vec![w]);
        assert!(!e.is_dirty());
    }

    #[test]
    fn touch_never_regresses() {
        let mut e = CacheEntry::incomplete(5);
        e.touch(3);
        assert_eq!(e.last_use_epoch(), 5);
        e.touch(9);
        assert_eq!(e.last_use_epoch(), 9);
    }
}
