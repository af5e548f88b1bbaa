use serde_json::Value;

use crate::{BlobRef, HashAlgorithm, KvsError, Result};

/// Canonical object encoding behind a seam, so an alternative encoding
/// (e.g. CBOR) could be plugged in without touching the engines.
pub trait Encoder: Send {
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
    fn algorithm(&self) -> HashAlgorithm;

    /// Hash the canonical encoding of `value`.
    fn hash(&self, value: &Value) -> Result<BlobRef> {
        Ok(self.algorithm().digest(&self.encode(value)?))
    }
}

/// Compact JSON with lexicographically sorted object keys.
///
/// serde_json's map type keeps keys ordered, so serializing the same logical
/// object always yields the same bytes regardless of insertion order. The
/// content store must be configured with the same canonicalization or refs
/// will not line up.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder {
    algorithm: HashAlgorithm,
}

impl JsonEncoder {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }
}

impl Encoder for JsonEncoder {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| KvsError::Protocol(format!("encode: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| KvsError::Protocol(format!("decode: {e}")))
    }

    fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}
