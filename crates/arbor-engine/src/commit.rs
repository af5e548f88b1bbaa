use std::collections::BTreeMap;

use serde_json::Value;

use arbor_cache::{CacheEntry, ObjectCache, WaitId};
use arbor_core::{as_directory, path, BlobRef, Dirent, Encoder, KvsError, Result};

use crate::fence::Op;

/// Outcome of one `process` invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessStatus {
    /// The new root ref; all staged blobs are clean.
    Finished(BlobRef),
    /// These refs must be faulted in before ops can be applied.
    LoadMissingRefs(Vec<BlobRef>),
    /// Staged entries are still awaiting content-store acknowledgment.
    DirtyCacheEntries(Vec<BlobRef>),
    /// The commit failed; errnum is sticky.
    Error(i32),
}

/// A ready fence promoted into a restartable state machine.
///
/// `process` is idempotent: it re-applies the op list from the current root
/// until every needed ref is cached, stages the rewritten directories as
/// dirty cache entries, and then reports dirty refs until the store has
/// acknowledged them all. Calling it again without intervening state change
/// yields the same answer.
#[derive(Debug)]
pub struct Commit {
    names: Vec<String>,
    ops: Vec<Op>,
    newroot: Option<BlobRef>,
    dirty: Vec<BlobRef>,
    errnum: Option<i32>,
}

impl Commit {
    pub(crate) fn new(names: Vec<String>, ops: Vec<Op>) -> Self {
        Self {
            names,
            ops,
            newroot: None,
            dirty: Vec::new(),
            errnum: None,
        }
    }

    /// Fence names covered by this commit (more than one after a merge).
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn newroot(&self) -> Option<BlobRef> {
        self.newroot
    }

    /// Fail the commit from outside (e.g. a store RPC error).
    pub fn set_errnum(&mut self, errnum: i32) {
        self.errnum = Some(errnum);
    }

    pub fn process(
        &mut self,
        cache: &mut ObjectCache,
        epoch: u64,
        rootdir: &BlobRef,
        encoder: &dyn Encoder,
        noop_stores: &mut u64,
        woken: &mut Vec<WaitId>,
    ) -> ProcessStatus {
        if let Some(errnum) = self.errnum {
            return ProcessStatus::Error(errnum);
        }
        if self.newroot.is_none() {
            match self.apply(cache, epoch, rootdir, encoder, noop_stores, woken) {
                Ok(Applied::NewRoot(blobref)) => self.newroot = Some(blobref),
                Ok(Applied::Missing(refs)) => return ProcessStatus::LoadMissingRefs(refs),
                Err(e) => {
                    let errnum = e.errno();
                    self.errnum = Some(errnum);
                    return ProcessStatus::Error(errnum);
                }
            }
        }
        let still_dirty: Vec<BlobRef> = self
            .dirty
            .iter()
            .filter(|r| cache.peek(r).is_some_and(CacheEntry::is_dirty))
            .copied()
            .collect();
        if !still_dirty.is_empty() {
            return ProcessStatus::DirtyCacheEntries(still_dirty);
        }
        match self.newroot {
            Some(blobref) => ProcessStatus::Finished(blobref),
            None => ProcessStatus::Error(arbor_core::errno::EPROTO),
        }
    }

    /// Re-apply every op against the current root, copy-on-write, then hash
    /// and stage the rewritten directories bottom-up.
    fn apply(
        &mut self,
        cache: &mut ObjectCache,
        epoch: u64,
        rootdir: &BlobRef,
        encoder: &dyn Encoder,
        noop_stores: &mut u64,
        woken: &mut Vec<WaitId>,
    ) -> Result<Applied> {
        let Some(root_obj) = cache.lookup(rootdir, epoch).and_then(|e| e.object().cloned())
        else {
            return Ok(Applied::Missing(vec![*rootdir]));
        };
        let mut root = DirNode::from_value(&root_obj)?;

        let mut missing: Vec<BlobRef> = Vec::new();
        for op in &self.ops {
            let components = path::split(&op.key)?;
            apply_op(
                &mut root,
                &components,
                op.dirent.as_ref(),
                cache,
                epoch,
                &mut missing,
            )?;
        }
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Ok(Applied::Missing(missing));
        }

        self.dirty.clear();
        let blobref = stage_dir(root, cache, epoch, encoder, &mut self.dirty, noop_stores, woken)?;
        self.dirty.sort();
        self.dirty.dedup();
        Ok(Applied::NewRoot(blobref))
    }
}

enum Applied {
    NewRoot(BlobRef),
    Missing(Vec<BlobRef>),
}

/// A directory materialized for rewriting: untouched entries stay as raw
/// dirent JSON, entries on a mutated path become child nodes.
#[derive(Debug, Default)]
struct DirNode {
    entries: BTreeMap<String, Node>,
}

#[derive(Debug)]
enum Node {
    Leaf(Value),
    Dir(DirNode),
}

impl DirNode {
    fn from_value(value: &Value) -> Result<Self> {
        let map = as_directory(value)?;
        Ok(Self {
            entries: map
                .iter()
                .map(|(k, v)| (k.clone(), Node::Leaf(v.clone())))
                .collect(),
        })
    }
}

fn apply_op(
    root: &mut DirNode,
    components: &[String],
    dirent: Option<&Dirent>,
    cache: &mut ObjectCache,
    epoch: u64,
    missing: &mut Vec<BlobRef>,
) -> Result<()> {
    let mut dir = root;
    for comp in &components[..components.len() - 1] {
        let slot = dir
            .entries
            .entry(comp.clone())
            .or_insert_with(|| Node::Dir(DirNode::default()));
        if let Node::Leaf(raw) = slot {
            let child = match Dirent::from_value(raw)? {
                Dirent::DirRef(r) => match cache.lookup(&r, epoch).and_then(|e| e.object().cloned())
                {
                    Some(obj) => DirNode::from_value(&obj)?,
                    None => {
                        // Abort this op; the whole batch is re-applied once
                        // the ref has been faulted in.
                        missing.push(r);
                        return Ok(());
                    }
                },
                Dirent::DirVal(v) => DirNode::from_value(&v)?,
                // A value or link in the middle of the path is displaced by
                // a fresh directory.
                _ => DirNode::default(),
            };
            *slot = Node::Dir(child);
        }
        dir = match slot {
            Node::Dir(d) => d,
            Node::Leaf(_) => return Err(KvsError::NotDirectory),
        };
    }

    let last = &components[components.len() - 1];
    match dirent {
        Some(d) => {
            dir.entries.insert(last.clone(), Node::Leaf(d.to_value()?));
        }
        None => {
            // Unlinking a missing key is a no-op.
            dir.entries.remove(last);
        }
    }
    Ok(())
}

/// Hash a rewritten directory and stage it in the cache, depth-first, so
/// child refs exist before the parent encoding that names them.
fn stage_dir(
    dir: DirNode,
    cache: &mut ObjectCache,
    epoch: u64,
    encoder: &dyn Encoder,
    dirty: &mut Vec<BlobRef>,
    noop_stores: &mut u64,
    woken: &mut Vec<WaitId>,
) -> Result<BlobRef> {
    let mut map = serde_json::Map::new();
    for (name, node) in dir.entries {
        match node {
            Node::Leaf(raw) => {
                map.insert(name, raw);
            }
            Node::Dir(child) => {
                let child_ref = stage_dir(child, cache, epoch, encoder, dirty, noop_stores, woken)?;
                map.insert(name, Dirent::DirRef(child_ref).to_value()?);
            }
        }
    }
    let value = Value::Object(map);
    let bytes = encoder.encode(&value)?;
    let blobref = encoder.algorithm().digest(&bytes);

    match cache.lookup(&blobref, epoch) {
        Some(entry) if entry.is_valid() => {
            if entry.is_dirty() {
                // Already staged (identical subtree or an earlier commit);
                // still gate on its cleanliness.
                dirty.push(blobref);
            } else {
                // Content-addressed no-op: the blob is already stored.
                *noop_stores += 1;
            }
        }
        Some(entry) => {
            // An incomplete entry from an in-flight fault. The ref was
            // reachable from the existing tree, so the store has the blob;
            // fill the entry and let the caller release its waiters.
            woken.extend(entry.set_object(value, bytes.len()));
            *noop_stores += 1;
        }
        None => {
            let mut entry = CacheEntry::valid(value, bytes.len(), epoch);
            entry.set_dirty();
            entry.set_store_pending(true);
            cache.insert(blobref, entry)?;
            dirty.push(blobref);
        }
    }
    Ok(blobref)
}
