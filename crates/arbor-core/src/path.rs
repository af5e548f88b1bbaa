//! Key path handling.
//!
//! Keys are slash-separated. Leading and trailing slashes are normalized
//! away; an empty key or an empty interior component (`a//b`) is rejected.

use crate::{KvsError, Result};

/// Bound on symlink chases before a lookup reports `ELOOP`.
pub const SYMLINK_MAX: usize = 8;

/// Split a key into its path components.
pub fn split(key: &str) -> Result<Vec<String>> {
    let trimmed = key.trim_matches('/');
    if trimmed.is_empty() {
        return Err(KvsError::InvalidKey(key.to_string()));
    }
    let components: Vec<String> = trimmed.split('/').map(str::to_string).collect();
    if components.iter().any(String::is_empty) {
        return Err(KvsError::InvalidKey(key.to_string()));
    }
    Ok(components)
}

/// Join a symlink target with the remaining components of the original key.
pub fn join(target: &str, rest: &[String]) -> String {
    if rest.is_empty() {
        target.to_string()
    } else {
        format!("{}/{}", target, rest.join("/"))
    }
}
