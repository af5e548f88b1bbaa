//! Arbor core - blob references, the dirent object model, and canonical
//! encoding for the hierarchical coordination namespace.

use thiserror::Error;

mod blobref;
mod dirent;
mod encode;
pub mod flags;
pub mod path;

pub use blobref::{BlobRef, HashAlgorithm, REF_HEX_LEN, REF_LEN};
pub use dirent::{as_directory, empty_directory, Dirent};
pub use encode::{Encoder, JsonEncoder};

/// Core error type shared across the arbor crates.
///
/// Every variant projects to a wire `errnum` so commit failures and lookup
/// errors can cross the broker as plain integers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvsError {
    #[error("malformed payload: {0}")]
    Protocol(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("no such key")]
    NotFound,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("too many levels of symbolic links")]
    SymlinkLoop,

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, KvsError>;

/// Wire errno values, mirroring the POSIX numbers clients expect.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENOTDIR: i32 = 20;
    pub const EISDIR: i32 = 21;
    pub const EINVAL: i32 = 22;
    pub const ENOSYS: i32 = 38;
    pub const ELOOP: i32 = 40;
    pub const EPROTO: i32 = 71;
}

impl KvsError {
    /// Project the error onto its wire errnum.
    pub fn errno(&self) -> i32 {
        match self {
            KvsError::Protocol(_) => errno::EPROTO,
            KvsError::InvalidKey(_) => errno::EINVAL,
            KvsError::NotFound => errno::ENOENT,
            KvsError::NotDirectory => errno::ENOTDIR,
            KvsError::IsDirectory => errno::EISDIR,
            KvsError::SymlinkLoop => errno::ELOOP,
            KvsError::NotSupported(_) => errno::ENOSYS,
            KvsError::Io(_) => errno::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_projection_is_stable() {
        assert_eq!(KvsError::NotFound.errno(), errno::ENOENT);
        assert_eq!(KvsError::NotDirectory.errno(), errno::ENOTDIR);
        assert_eq!(KvsError::IsDirectory.errno(), errno::EISDIR);
        assert_eq!(KvsError::SymlinkLoop.errno(), errno::ELOOP);
        assert_eq!(KvsError::Protocol("x".into()).errno(), errno::EPROTO);
        assert_eq!(KvsError::InvalidKey("x".into()).errno(), errno::EINVAL);
    }
}
