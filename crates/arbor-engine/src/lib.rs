//! Arbor engine - the lookup walk, fence accumulation, and the commit
//! pipeline that turns batches of mutations into new tree roots.

mod commit;
mod fence;
mod lookup;
mod mgr;

pub use commit::{Commit, ProcessStatus};
pub use fence::{Fence, FenceState, Op};
pub use lookup::{Lookup, Step};
pub use mgr::CommitMgr;
