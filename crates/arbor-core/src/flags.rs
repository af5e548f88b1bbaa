//! Request flag bits shared across the wire protocol.

/// Target must resolve to a directory; the directory object is returned.
pub const READDIR: u32 = 1;
/// Do not follow a terminal symlink; return the link dirent itself.
pub const READLINK: u32 = 2;
/// Return the raw dirent for the terminal component.
pub const TREEOBJ: u32 = 4;
/// Watch: reply immediately with the current value.
pub const FIRST: u32 = 8;
/// Watch: reply at most once.
pub const ONCE: u32 = 16;
/// Fence: never merge this fence with its neighbors.
pub const NO_MERGE: u32 = 32;
