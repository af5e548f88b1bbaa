//! Arbor cache - content-addressed object cache and the wait registry that
//! parks suspended requests on cache conditions.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use arbor_core::{BlobRef, KvsError, Result};

mod entry;
pub mod wait;

pub use entry::CacheEntry;
pub use wait::{WaitId, WaitRegistry};

/// Blobref-keyed cache of decoded objects.
///
/// A ref appears at most once; entries are created on demand by lookup or
/// commit and reaped lazily by epoch-based expiry.
#[derive(Debug, Default)]
pub struct ObjectCache {
    entries: HashMap<BlobRef, CacheEntry>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an entry, refreshing its last-use epoch.
    pub fn lookup(&mut self, blobref: &BlobRef, epoch: u64) -> Option<&mut CacheEntry> {
        let entry = self.entries.get_mut(blobref)?;
        entry.touch(epoch);
        Some(entry)
    }

    /// Peek without refreshing the use epoch.
    pub fn peek(&self, blobref: &BlobRef) -> Option<&CacheEntry> {
        self.entries.get(blobref)
    }

    pub fn insert(&mut self, blobref: BlobRef, entry: CacheEntry) -> Result<()> {
        if self.entries.contains_key(&blobref) {
            return Err(KvsError::Protocol(format!("duplicate cache insert: {blobref}")));
        }
        self.entries.insert(blobref, entry);
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Drop entries idle for more than `max_age` epochs.
    ///
    /// Only valid, clean, waiter-free entries are removable; `max_age = 0`
    /// forces a full drop of everything else eligible.
    pub fn expire(&mut self, epoch: u64, max_age: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| {
            !(e.is_valid()
                && !e.is_dirty()
                && !e.has_waiters()
                && epoch.saturating_sub(e.last_use_epoch()) > max_age)
        });
        before - self.entries.len()
    }

    /// Remove the given waiter ids from every entry's waiter sets.
    pub fn purge_waiters(&mut self, ids: &HashSet<WaitId>) -> usize {
        self.entries
            .values_mut()
            .map(|e| e.remove_waiters(ids))
            .sum()
    }

    /// Drop an entry outright, whatever its state (failed load cleanup).
    pub fn evict(&mut self, blobref: &BlobRef) -> Option<CacheEntry> {
        self.entries.remove(blobref)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for e in self.entries.values() {
            stats.count += 1;
            if !e.is_valid() {
                stats.incomplete += 1;
            }
            if e.is_dirty() {
                stats.dirty += 1;
            }
            if e.is_valid() {
                stats.total_bytes += e.size();
                stats.obj_size.push(e.size() as f64);
            }
        }
        stats
    }
}

/// Point-in-time cache statistics for the stats probe.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub count: usize,
    pub incomplete: usize,
    pub dirty: usize,
    pub total_bytes: usize,
    pub obj_size: SizeStats,
}

/// Streaming min/mean/stddev/max accumulator over object sizes.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SizeStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    #[serde(skip)]
    sum: f64,
    #[serde(skip)]
    sumsq: f64,
}

impl SizeStats {
    pub fn push(&mut self, v: f64) {
        if self.count == 0 || v < self.min {
            self.min = v;
        }
        if v > self.max {
            self.max = v;
        }
        self.count += 1;
        self.sum += v;
        self.sumsq += v * v;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let n = self.count as f64;
        ((self.sumsq - self.sum * self.sum / n) / (n - 1.0)).max(0.0).sqrt()
    }
}
