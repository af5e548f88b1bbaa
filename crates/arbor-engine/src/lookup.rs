use std::sync::Arc;

use serde_json::Value;

use arbor_cache::ObjectCache;
use arbor_core::{as_directory, flags, path, BlobRef, Dirent, KvsError, Result};

/// Outcome of driving a lookup one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Terminal: the resolved value, or `None` when the key does not exist.
    Done(Option<Value>),
    /// Non-terminal: the caller must fault in this ref and re-run.
    Missing(BlobRef),
    /// Terminal: a logical lookup error.
    Error(KvsError),
}

#[derive(Debug, Clone)]
enum Cursor {
    Ref(BlobRef),
    Inline(Arc<Value>),
}

/// Resumable walk from a root ref through a slash-separated key.
///
/// The cursor (remaining components, current directory, symlink count)
/// persists across [`Step::Missing`] returns, so a resumed lookup continues
/// where it faulted instead of starting over.
#[derive(Debug)]
pub struct Lookup {
    root: BlobRef,
    components: Vec<String>,
    idx: usize,
    cursor: Cursor,
    links: usize,
    flags: u32,
}

impl Lookup {
    pub fn new(
        current_root: &BlobRef,
        requested_root: Option<&BlobRef>,
        key: &str,
        lookup_flags: u32,
    ) -> Result<Self> {
        let root = *requested_root.unwrap_or(current_root);
        Ok(Self {
            root,
            components: path::split(key)?,
            idx: 0,
            cursor: Cursor::Ref(root),
            links: 0,
            flags: lookup_flags,
        })
    }

    /// The root this lookup resolves against (reported back to the client).
    pub fn root(&self) -> &BlobRef {
        &self.root
    }

    pub fn run(&mut self, cache: &mut ObjectCache, epoch: u64) -> Step {
        loop {
            let dir: Arc<Value> = match &self.cursor {
                Cursor::Ref(blobref) => {
                    let blobref = *blobref;
                    match load_object(cache, &blobref, epoch) {
                        Some(obj) => obj,
                        None => return Step::Missing(blobref),
                    }
                }
                Cursor::Inline(v) => Arc::clone(v),
            };
            let map = match as_directory(&dir) {
                Ok(m) => m,
                Err(e) => return Step::Error(e),
            };

            let name = &self.components[self.idx];
            let Some(raw) = map.get(name) else {
                return Step::Done(None);
            };
            let dirent = match Dirent::from_value(raw) {
                Ok(d) => d,
                Err(e) => return Step::Error(e),
            };

            if self.idx + 1 < self.components.len() {
                match dirent {
                    Dirent::DirRef(r) => {
                        self.cursor = Cursor::Ref(r);
                        self.idx += 1;
                    }
                    Dirent::DirVal(v) => {
                        self.cursor = Cursor::Inline(Arc::new(v));
                        self.idx += 1;
                    }
                    Dirent::LinkVal(target) => {
                        if let Err(e) = self.chase(&target, true) {
                            return Step::Error(e);
                        }
                    }
                    Dirent::FileRef(_) | Dirent::FileVal(_) => {
                        return Step::Error(KvsError::NotDirectory);
                    }
                }
                continue;
            }

            return self.finish(dirent, cache, epoch);
        }
    }

    /// Resolve the terminal dirent according to the request flags.
    fn finish(&mut self, dirent: Dirent, cache: &mut ObjectCache, epoch: u64) -> Step {
        if let Dirent::LinkVal(target) = &dirent {
            if self.flags & flags::READLINK != 0 {
                return dirent_step(&dirent);
            }
            if self.flags & flags::TREEOBJ == 0 {
                let target = target.clone();
                return match self.chase(&target, false) {
                    Ok(()) => self.run(cache, epoch),
                    Err(e) => Step::Error(e),
                };
            }
        }
        if self.flags & flags::TREEOBJ != 0 {
            return dirent_step(&dirent);
        }

        let want_dir = self.flags & flags::READDIR != 0;
        match dirent {
            Dirent::FileVal(v) => {
                if want_dir {
                    Step::Error(KvsError::NotDirectory)
                } else {
                    Step::Done(Some(v))
                }
            }
            Dirent::FileRef(r) => {
                if want_dir {
                    return Step::Error(KvsError::NotDirectory);
                }
                match load_object(cache, &r, epoch) {
                    Some(obj) => Step::Done(Some((*obj).clone())),
                    None => Step::Missing(r),
                }
            }
            Dirent::DirVal(v) => {
                if want_dir {
                    Step::Done(Some(v))
                } else {
                    Step::Error(KvsError::IsDirectory)
                }
            }
            Dirent::DirRef(r) => {
                if !want_dir {
                    return Step::Error(KvsError::IsDirectory);
                }
                match load_object(cache, &r, epoch) {
                    Some(obj) => Step::Done(Some((*obj).clone())),
                    None => Step::Missing(r),
                }
            }
            Dirent::LinkVal(_) => dirent_step(&dirent),
        }
    }

    /// Restart the walk at the root with the link target prepended to
    /// whatever components remain.
    fn chase(&mut self, target: &str, mid_path: bool) -> Result<()> {
        self.links += 1;
        if self.links > path::SYMLINK_MAX {
            return Err(KvsError::SymlinkLoop);
        }
        let rest: &[String] = if mid_path {
            &self.components[self.idx + 1..]
        } else {
            &[]
        };
        let key = path::join(target, rest);
        self.components = path::split(&key)?;
        self.idx = 0;
        self.cursor = Cursor::Ref(self.root);
        Ok(())
    }
}

fn load_object(cache: &mut ObjectCache, blobref: &BlobRef, epoch: u64) -> Option<Arc<Value>> {
    cache.lookup(blobref, epoch).and_then(|e| e.object().cloned())
}

fn dirent_step(dirent: &Dirent) -> Step {
    match dirent.to_value() {
        Ok(v) => Step::Done(Some(v)),
        Err(e) => Step::Error(e),
    }
}
