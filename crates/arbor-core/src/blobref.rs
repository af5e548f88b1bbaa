use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::KvsError;

/// Digest width in bytes.
pub const REF_LEN: usize = 32;
/// Printable (hex) width of a ref.
pub const REF_HEX_LEN: usize = 2 * REF_LEN;

/// Content hash naming an immutable blob in the content store.
///
/// Equality is byte-equality; the printable form is fixed-width lowercase
/// hex, which is also the serde representation so refs travel through JSON
/// payloads as plain strings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobRef([u8; REF_LEN]);

impl BlobRef {
    pub fn from_bytes(bytes: [u8; REF_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; REF_LEN] {
        &self.0
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobRef({})", self)
    }
}

impl FromStr for BlobRef {
    type Err = KvsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != REF_HEX_LEN {
            return Err(KvsError::Protocol(format!("bad blobref length: {}", s.len())));
        }
        let raw = hex::decode(s).map_err(|e| KvsError::Protocol(format!("bad blobref: {e}")))?;
        let mut bytes = [0u8; REF_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

impl Serialize for BlobRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlobRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Configured content hash algorithm.
///
/// The content store is the authority for refs; the local algorithm must
/// agree with it or staged blobs will come back under different names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Blake3,
    Sha256,
}

impl HashAlgorithm {
    pub fn digest(&self, bytes: &[u8]) -> BlobRef {
        match self {
            HashAlgorithm::Blake3 => {
                let hash = blake3::hash(bytes);
                BlobRef(*hash.as_bytes())
            }
            HashAlgorithm::Sha256 => {
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                hasher.update(bytes);
                let mut out = [0u8; REF_LEN];
                out.copy_from_slice(&hasher.finalize());
                BlobRef(out)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Blake3 => "blake3",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = KvsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blake3" => Ok(HashAlgorithm::Blake3),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(KvsError::Protocol(format!("unknown hash algorithm: {other}"))),
        }
    }
}
