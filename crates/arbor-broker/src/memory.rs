//! In-process loopback fabric and memory content store.
//!
//! A [`LoopbackHub`] collects everything instances send (events, RPCs,
//! forwards, responses) into shared queues; a test harness drains those
//! queues and feeds them back into instance inboxes, playing the role of
//! the real broker's routing layer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use bytes::Bytes;
use serde_json::Value;
use uuid::Uuid;

use arbor_core::{BlobRef, HashAlgorithm, KvsError};

use crate::{Broker, ContentService, Envelope, RpcTag, Target};

/// Memory-backed immutable blob store keyed by content hash.
#[derive(Debug)]
pub struct MemoryContentStore {
    algorithm: HashAlgorithm,
    blobs: RwLock<HashMap<BlobRef, Bytes>>,
}

impl MemoryContentStore {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            blobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn load_blob(&self, blobref: &BlobRef) -> Option<Bytes> {
        read_lock(&self.blobs).get(blobref).cloned()
    }

    /// Hash and store; storing the same bytes twice is a no-op.
    pub fn store_blob(&self, bytes: Bytes) -> BlobRef {
        let blobref = self.algorithm.digest(&bytes);
        write_lock(&self.blobs).entry(blobref).or_insert(bytes);
        blobref
    }

    /// Store under a declared ref, rejecting a hash mismatch so a corrupt
    /// blob never lands in the store.
    pub fn put_verified(&self, expected: BlobRef, bytes: Bytes) -> Result<(), KvsError> {
        let computed = self.algorithm.digest(&bytes);
        if computed != expected {
            return Err(KvsError::Protocol(format!(
                "blob hash mismatch: expected {expected}, computed {computed}"
            )));
        }
        write_lock(&self.blobs).entry(expected).or_insert(bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        read_lock(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        read_lock(&self.blobs).is_empty()
    }
}

#[async_trait::async_trait]
impl ContentService for MemoryContentStore {
    async fn load(&self, blobref: &BlobRef) -> Result<Bytes, i32> {
        self.load_blob(blobref).ok_or(arbor_core::errno::ENOENT)
    }

    async fn store(&self, bytes: Bytes) -> Result<BlobRef, i32> {
        Ok(self.store_blob(bytes))
    }
}

/// An RPC captured by the hub, waiting for the harness to service it.
#[derive(Debug, Clone)]
pub struct OutboundRpc {
    pub origin: u32,
    pub service: String,
    pub payload: Bytes,
    pub target: Target,
    pub tag: RpcTag,
}

/// A fire-and-forget send captured by the hub.
#[derive(Debug, Clone)]
pub struct OutboundForward {
    pub origin: u32,
    pub service: String,
    pub payload: Value,
    pub target: Target,
}

/// A reply an instance produced for some request envelope.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub topic: String,
    pub sender: String,
    pub msgid: Uuid,
    pub result: Result<Value, i32>,
}

#[derive(Debug, Default)]
struct HubState {
    events: VecDeque<(String, Value)>,
    rpcs: VecDeque<OutboundRpc>,
    forwards: VecDeque<OutboundForward>,
    responses: VecDeque<CapturedResponse>,
}

/// Shared routing state for a set of loopback instances.
#[derive(Clone)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
    store: Arc<MemoryContentStore>,
}

impl LoopbackHub {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            store: Arc::new(MemoryContentStore::new(algorithm)),
        }
    }

    /// A broker handle for the instance at `rank`.
    pub fn broker(&self, rank: u32) -> LoopbackBroker {
        LoopbackBroker {
            rank,
            state: Arc::clone(&self.state),
        }
    }

    pub fn store(&self) -> &MemoryContentStore {
        &self.store
    }

    pub fn take_events(&self) -> Vec<(String, Value)> {
        lock(&self.state).events.drain(..).collect()
    }

    pub fn take_rpcs(&self) -> Vec<OutboundRpc> {
        lock(&self.state).rpcs.drain(..).collect()
    }

    pub fn take_forwards(&self) -> Vec<OutboundForward> {
        lock(&self.state).forwards.drain(..).collect()
    }

    pub fn take_responses(&self) -> Vec<CapturedResponse> {
        lock(&self.state).responses.drain(..).collect()
    }

    pub fn is_quiescent(&self) -> bool {
        let s = lock(&self.state);
        s.events.is_empty() && s.rpcs.is_empty() && s.forwards.is_empty()
    }
}

/// [`Broker`] implementation writing into a shared [`LoopbackHub`].
pub struct LoopbackBroker {
    rank: u32,
    state: Arc<Mutex<HubState>>,
}

impl Broker for LoopbackBroker {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn subscribe(&mut self, _prefix: &str) {
        // The hub broadcasts every event to every instance.
    }

    fn respond(&mut self, request: &Envelope, result: Result<Value, i32>) {
        lock(&self.state).responses.push_back(CapturedResponse {
            topic: request.topic.clone(),
            sender: request.sender.clone(),
            msgid: request.msgid,
            result,
        });
    }

    fn publish(&mut self, topic: &str, payload: Value) {
        lock(&self.state).events.push_back((topic.to_string(), payload));
    }

    fn rpc(&mut self, service: &str, payload: Bytes, target: Target, tag: RpcTag) {
        lock(&self.state).rpcs.push_back(OutboundRpc {
            origin: self.rank,
            service: service.to_string(),
            payload,
            target,
            tag,
        });
    }

    fn forward(&mut self, service: &str, payload: Value, target: Target) {
        lock(&self.state).forwards.push_back(OutboundForward {
            origin: self.rank,
            service: service.to_string(),
            payload,
            target,
        });
    }
}

// Lock helpers that survive a panicked test without cascading.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read_lock<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn store_round_trip_and_idempotence() {
        let store = MemoryContentStore::new(HashAlgorithm::Blake3);
        let blobref = store.store_blob(Bytes::from_static(b"{}"));
        assert_eq!(store.store_blob(Bytes::from_static(b"{}")), blobref);
        assert_eq!(store.len(), 1);
        assert_eq!(store.load_blob(&blobref).unwrap(), Bytes::from_static(b"{}"));
    }

    #[test]
    fn put_verified_rejects_mismatch() {
        let store = MemoryContentStore::new(HashAlgorithm::Blake3);
        let wrong = HashAlgorithm::Blake3.digest(b"other");
        assert!(store.put_verified(wrong, Bytes::from_static(b"{}")).is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn content_service_surface() {
        let store = MemoryContentStore::new(HashAlgorithm::Blake3);
        let missing = HashAlgorithm::Blake3.digest(b"nope");
        assert_eq!(store.load(&missing).await, Err(arbor_core::errno::ENOENT));

        let blobref = store.store(Bytes::from_static(b"[1,2]")).await.unwrap();
        assert_eq!(store.load(&blobref).await.unwrap(), Bytes::from_static(b"[1,2]"));
    }

    #[test]
    fn hub_captures_broker_traffic() {
        let hub = LoopbackHub::new(HashAlgorithm::Blake3);
        let mut broker = hub.broker(3);

        broker.publish("kvs.setroot", json!({ "rootseq": 1 }));
        broker.rpc(
            "content.load",
            Bytes::from_static(b""),
            Target::Any,
            RpcTag::GetRoot,
        );
        broker.forward("kvs.relayfence", json!({ "name": "f" }), Target::Leader);

        let env = Envelope::new("kvs.get", "client-1", json!({ "key": "a" }));
        broker.respond(&env, Err(arbor_core::errno::ENOENT));

        assert_eq!(hub.take_events().len(), 1);
        let rpcs = hub.take_rpcs();
        assert_eq!(rpcs.len(), 1);
        assert_eq!(rpcs[0].origin, 3);
        assert_eq!(hub.take_forwards().len(), 1);
        let responses = hub.take_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].sender, "client-1");
        assert!(hub.is_quiescent());
    }
}
