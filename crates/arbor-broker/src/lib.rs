//! Arbor broker - the messaging seam the store is built against.
//!
//! The real cluster substrate (request/response, events, point-to-point RPC)
//! lives outside this workspace; the [`Broker`] trait captures exactly what
//! the store consumes. [`memory`] provides an in-process loopback fabric and
//! a memory content store so a multi-instance cluster can run inside tests.

use bytes::Bytes;
use serde_json::Value;
use uuid::Uuid;

use arbor_core::BlobRef;

pub mod memory;

pub use memory::{LoopbackBroker, LoopbackHub, MemoryContentStore};

/// A request as delivered by the broker: topic, originating sender route,
/// message id, and the decoded JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub sender: String,
    pub msgid: Uuid,
    pub payload: Value,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, sender: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            sender: sender.into(),
            msgid: Uuid::new_v4(),
            payload,
        }
    }
}

/// Where a point-to-point message should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Any instance able to serve it (content store traffic).
    Any,
    /// The rank-0 instance.
    Leader,
    /// The next instance toward rank 0.
    Upstream,
}

/// Correlation tag carried through an RPC and returned with its reply, so
/// the single-threaded service can pick up where it left off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcTag {
    ContentLoad(BlobRef),
    ContentStore(BlobRef),
    GetRoot,
}

/// Completion of an outstanding RPC, delivered into the service inbox.
#[derive(Debug, Clone)]
pub struct RpcReply {
    pub tag: RpcTag,
    pub result: Result<Bytes, i32>,
}

/// The broker surface consumed by a store instance.
///
/// All calls are fire-and-forget from the caller's point of view; replies
/// and events come back through the instance's inbox. This keeps handlers
/// synchronous and suspension explicit, per the cooperative scheduling
/// model.
pub trait Broker: Send {
    /// This instance's rank; rank 0 is the leader.
    fn rank(&self) -> u32;

    /// Subscribe to an event topic prefix.
    fn subscribe(&mut self, prefix: &str);

    /// Answer a request envelope with a payload or a wire errnum.
    fn respond(&mut self, request: &Envelope, result: Result<Value, i32>);

    /// Broadcast an event to every subscribed instance (including self).
    fn publish(&mut self, topic: &str, payload: Value);

    /// Issue an RPC whose completion arrives later as an [`RpcReply`]
    /// carrying `tag`.
    fn rpc(&mut self, service: &str, payload: Bytes, target: Target, tag: RpcTag);

    /// Fire-and-forget point-to-point send with no reply expected.
    fn forward(&mut self, service: &str, payload: Value, target: Target);
}

/// The immutable blob service behind `content.load` / `content.store`.
///
/// Both operations are idempotent; `store` is the authority for refs and
/// must agree with the locally configured hash algorithm.
#[async_trait::async_trait]
pub trait ContentService: Send + Sync {
    async fn load(&self, blobref: &BlobRef) -> Result<Bytes, i32>;
    async fn store(&self, bytes: Bytes) -> Result<BlobRef, i32>;
}
