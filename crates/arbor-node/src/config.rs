use serde::{Deserialize, Serialize};
use tracing::warn;

use arbor_core::HashAlgorithm;

/// Per-instance module options.
///
/// Parsed from `key=value` module arguments; unknown or malformed options
/// are logged and skipped so a bad argument never keeps the store down.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Options {
    /// Merge consecutive ready fences into one commit.
    pub commit_merge: bool,
    /// Heartbeats of idleness before a cache entry may expire.
    pub max_lastuse_age: u64,
    /// Content hash algorithm; must match the content store.
    pub hash: HashAlgorithm,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            commit_merge: true,
            max_lastuse_age: 5,
            hash: HashAlgorithm::default(),
        }
    }
}

impl Options {
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut opts = Self::default();
        for arg in args {
            let arg = arg.as_ref();
            match arg.split_once('=') {
                Some(("commit-merge", v)) => opts.commit_merge = v != "0",
                Some(("max-lastuse-age", v)) => match v.parse() {
                    Ok(n) => opts.max_lastuse_age = n,
                    Err(_) => warn!(arg, "malformed option value"),
                },
                Some(("hash", v)) => match v.parse() {
                    Ok(h) => opts.hash = h,
                    Err(_) => warn!(arg, "unknown hash algorithm"),
                },
                _ => warn!(arg, "unknown option"),
            }
        }
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = Options::default();
        assert!(opts.commit_merge);
        assert_eq!(opts.max_lastuse_age, 5);
        assert_eq!(opts.hash, HashAlgorithm::Blake3);
    }

    #[test]
    fn parses_module_args() {
        let opts = Options::from_args(["commit-merge=0", "max-lastuse-age=9", "hash=sha256"]);
        assert!(!opts.commit_merge);
        assert_eq!(opts.max_lastuse_age, 9);
        assert_eq!(opts.hash, HashAlgorithm::Sha256);
    }

    #[test]
    fn ignores_unknown_args() {
        let opts = Options::from_args(["bogus=1", "commit-merge=1"]);
        assert!(opts.commit_merge);
    }

    #[test]
    fn deserializes_kebab_case() {
        let opts: Options =
            serde_json::from_value(serde_json::json!({ "commit-merge": false })).unwrap();
        assert!(!opts.commit_merge);
    }
}
