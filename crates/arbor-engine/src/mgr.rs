use std::collections::{HashMap, VecDeque};

use tracing::debug;

use arbor_cache::{ObjectCache, WaitId};
use arbor_core::{BlobRef, Encoder, KvsError, Result};

use crate::commit::{Commit, ProcessStatus};
use crate::fence::{Fence, FenceState};

/// Owner of the fence table, the ready queue, and the single in-flight
/// commit.
///
/// Fences stay registered until the matching `setroot` or `error` event is
/// observed locally; only their ops and name lists move into a commit.
#[derive(Debug, Default)]
pub struct CommitMgr {
    fences: HashMap<String, Fence>,
    ready: VecDeque<String>,
    current: Option<Commit>,
    noop_stores: u64,
}

impl CommitMgr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fence(&mut self, fence: Fence) -> Result<()> {
        if self.fences.contains_key(fence.name()) {
            return Err(KvsError::Protocol(format!("duplicate fence: {}", fence.name())));
        }
        self.fences.insert(fence.name().to_string(), fence);
        Ok(())
    }

    pub fn lookup_fence_mut(&mut self, name: &str) -> Option<&mut Fence> {
        self.fences.get_mut(name)
    }

    pub fn contains_fence(&self, name: &str) -> bool {
        self.fences.contains_key(name)
    }

    /// Remove a completed fence, handing back its retained envelopes.
    pub fn remove_fence(&mut self, name: &str) -> Option<Fence> {
        self.fences.remove(name)
    }

    pub fn fence_count(&self) -> usize {
        self.fences.len()
    }

    /// Queue a fence that has gone ready.
    pub fn queue_ready(&mut self, name: &str) {
        self.ready.push_back(name.to_string());
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.current.is_some()
    }

    /// Promote the next ready fence into the in-flight commit. With `merge`
    /// set, consecutive ready fences without `NO_MERGE` are folded in, their
    /// op lists concatenated in queue order and their names unioned.
    ///
    /// Returns false when a commit is already in flight or nothing is ready.
    pub fn start_ready_commit(&mut self, merge: bool) -> bool {
        if self.current.is_some() {
            return false;
        }
        let Some(head) = self.ready.pop_front() else {
            return false;
        };

        let mut batch = vec![head];
        let head_blocks_merge = self
            .fences
            .get(&batch[0])
            .map(Fence::no_merge)
            .unwrap_or(true);
        if merge && !head_blocks_merge {
            while let Some(next) = self.ready.front() {
                if self.fences.get(next).map(Fence::no_merge).unwrap_or(true) {
                    break;
                }
                if let Some(next) = self.ready.pop_front() {
                    batch.push(next);
                }
            }
        }

        let mut names = Vec::new();
        let mut ops = Vec::new();
        for name in &batch {
            if let Some(fence) = self.fences.get_mut(name) {
                fence.set_state(FenceState::Processing);
                names.extend(fence.take_names());
                ops.extend(fence.take_ops());
            }
        }
        if batch.len() > 1 {
            debug!(commits = batch.len(), ops = ops.len(), "aggregated commits");
        }

        self.current = Some(Commit::new(names, ops));
        true
    }

    pub fn current(&self) -> Option<&Commit> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Commit> {
        self.current.as_mut()
    }

    /// Drive the in-flight commit one step.
    pub fn process_current(
        &mut self,
        cache: &mut ObjectCache,
        epoch: u64,
        rootdir: &BlobRef,
        encoder: &dyn Encoder,
        woken: &mut Vec<WaitId>,
    ) -> Option<ProcessStatus> {
        let commit = self.current.as_mut()?;
        Some(commit.process(cache, epoch, rootdir, encoder, &mut self.noop_stores, woken))
    }

    /// The commit reached a terminal state; drop it from the pipeline.
    pub fn take_current(&mut self) -> Option<Commit> {
        self.current.take()
    }

    pub fn noop_stores(&self) -> u64 {
        self.noop_stores
    }

    pub fn clear_noop_stores(&mut self) {
        self.noop_stores = 0;
    }
}
