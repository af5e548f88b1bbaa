//! Request, response, and event payloads.
//!
//! Everything crosses the broker as JSON values; these structs pin down the
//! field names and defaults of each topic's payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use arbor_core::{BlobRef, KvsError, Result};
use arbor_engine::Op;

/// `kvs.get` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    /// Snapshot root to resolve against; defaults to the current root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootdir: Option<BlobRef>,
    pub key: String,
    #[serde(default)]
    pub flags: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    /// The root the value was resolved against.
    pub rootdir: BlobRef,
    pub val: Value,
}

/// `kvs.watch` request; also the re-armed payload between replies, with
/// `val` updated to the last reported value and `FIRST` cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRequest {
    pub key: String,
    #[serde(default)]
    pub val: Value,
    #[serde(default)]
    pub flags: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchResponse {
    pub val: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnwatchRequest {
    pub key: String,
}

/// `kvs.fence` and `kvs.relayfence` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FenceRequest {
    pub name: String,
    pub nprocs: u32,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub ops: Vec<Op>,
}

/// `kvs.getroot` and `kvs.sync` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootResponse {
    pub rootseq: u64,
    pub rootdir: BlobRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub rootseq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropcacheResponse {
    pub dropped: usize,
    pub size: usize,
}

/// `kvs.setroot` event; `root` optionally carries the root object so
/// followers can prime their caches without a fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetrootEvent {
    pub rootseq: u64,
    pub rootdir: BlobRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<Value>,
    pub names: Vec<String>,
}

/// `kvs.error` event: the named fences failed with `errnum`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub names: Vec<String>,
    pub errnum: i32,
}

/// `hb` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub epoch: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjSizeStats {
    pub count: usize,
    pub min: f64,
    pub mean: f64,
    pub stddev: f64,
    pub max: f64,
}

/// `kvs.stats.get` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub cache_bytes_total: usize,
    pub cache_objects: usize,
    pub cache_incomplete: usize,
    pub cache_dirty: usize,
    pub obj_size: ObjSizeStats,
    pub watchers: usize,
    pub noop_stores: u64,
    pub faults: u64,
    pub store_revision: u64,
}

pub fn decode<T: DeserializeOwned>(payload: &Value) -> Result<T> {
    serde_json::from_value(payload.clone()).map_err(|e| KvsError::Protocol(e.to_string()))
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Value> {
    serde_json::to_value(msg).map_err(|e| KvsError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_request_defaults() {
        let req: GetRequest = decode(&json!({ "key": "a/b" })).unwrap();
        assert_eq!(req.rootdir, None);
        assert_eq!(req.flags, 0);
    }

    #[test]
    fn watch_request_defaults_to_null_value() {
        let req: WatchRequest = decode(&json!({ "key": "k" })).unwrap();
        assert_eq!(req.val, Value::Null);
    }

    #[test]
    fn fence_request_round_trip() {
        let payload = json!({
            "name": "f1",
            "nprocs": 2,
            "flags": 0,
            "ops": [{ "key": "a", "dirent": { "FILEVAL": 1 } }],
        });
        let req: FenceRequest = decode(&payload).unwrap();
        assert_eq!(req.ops.len(), 1);
        assert_eq!(encode(&req).unwrap(), payload);
    }

    #[test]
    fn setroot_event_omits_absent_root() {
        let r = arbor_core::HashAlgorithm::Blake3.digest(b"root");
        let ev = SetrootEvent {
            rootseq: 3,
            rootdir: r,
            root: None,
            names: vec!["f".into()],
        };
        let v = encode(&ev).unwrap();
        assert!(v.get("root").is_none());
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        assert!(decode::<GetRequest>(&json!({ "flags": 1 })).is_err());
        assert!(decode::<FenceRequest>(&json!("nope")).is_err());
    }
}
