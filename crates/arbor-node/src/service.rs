use std::collections::HashSet;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, error, warn};

use arbor_broker::{Broker, Envelope, RpcReply, RpcTag, Target};
use arbor_cache::{CacheEntry, ObjectCache, WaitId, WaitRegistry};
use arbor_core::{empty_directory, errno, flags, BlobRef, Encoder, JsonEncoder, KvsError};
use arbor_engine::{CommitMgr, Fence, Lookup, Op, ProcessStatus, Step};

use crate::config::Options;
use crate::proto::{
    self, DropcacheResponse, ErrorEvent, FenceRequest, GetRequest, GetResponse, HeartbeatEvent,
    ObjSizeStats, RootResponse, SetrootEvent, StatsResponse, SyncRequest, UnwatchRequest,
    WatchRequest, WatchResponse,
};

/// Include the root object in `kvs.setroot` events to prime follower caches.
const EVENT_INCLUDES_ROOTDIR: bool = true;

/// A unit of work delivered into the service inbox.
#[derive(Debug)]
pub enum Message {
    Request(Envelope),
    Event { topic: String, payload: Value },
    RpcReply(RpcReply),
}

/// What to do when a parked wait fires.
#[derive(Debug)]
enum Resume {
    /// Re-dispatch a stored request envelope from scratch (watchers, sync).
    Request(Envelope),
    /// Resume a parked lookup where it faulted.
    Lookup { env: Envelope, lookup: Lookup },
    /// Re-drive the in-flight commit.
    Commit,
}

/// One store instance: all mutable state lives here and is touched by
/// exactly one logical task. Handlers are synchronous; anything that cannot
/// complete parks itself in the wait registry and returns to the loop.
pub struct KvsService<B: Broker> {
    broker: B,
    rank: u32,
    options: Options,
    encoder: Box<dyn Encoder>,
    cache: ObjectCache,
    waits: WaitRegistry<Resume>,
    watchlist: Vec<WaitId>,
    mgr: CommitMgr,
    rootdir: BlobRef,
    rootseq: u64,
    epoch: u64,
    watchlist_lastrun_epoch: u64,
    faults: u64,
    initialized: bool,
    init_backlog: Vec<Message>,
}

impl<B: Broker> KvsService<B> {
    pub fn new(broker: B, options: Options) -> Self {
        let rank = broker.rank();
        // Placeholder until bootstrap: the ref of an empty directory.
        let rootdir = options.hash.digest(b"{}");
        Self {
            broker,
            rank,
            encoder: Box::new(JsonEncoder::new(options.hash)),
            options,
            cache: ObjectCache::new(),
            waits: WaitRegistry::new(),
            watchlist: Vec::new(),
            mgr: CommitMgr::new(),
            rootdir,
            rootseq: 0,
            epoch: 0,
            watchlist_lastrun_epoch: 0,
            faults: 0,
            initialized: false,
            init_backlog: Vec::new(),
        }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn rootseq(&self) -> u64 {
        self.rootseq
    }

    pub fn rootdir(&self) -> &BlobRef {
        &self.rootdir
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn faults(&self) -> u64 {
        self.faults
    }

    pub fn watcher_count(&self) -> usize {
        self.watchlist.len()
    }

    pub fn cache_count(&self) -> usize {
        self.cache.count()
    }

    /// Subscribe and bootstrap the root: rank 0 creates and stores the
    /// empty root; everyone else asks upstream and buffers traffic until
    /// the answer arrives.
    pub fn start(&mut self) {
        self.broker.subscribe("hb");
        self.broker.subscribe("kvs.");
        if self.rank == 0 {
            if let Err(e) = self.store_initial_root() {
                error!(err = %e, "storing initial root");
            }
            self.initialized = true;
        } else {
            self.broker
                .rpc("kvs.getroot", Bytes::new(), Target::Upstream, RpcTag::GetRoot);
        }
    }

    /// Drive the service from an inbox until it closes.
    pub async fn run(mut self, mut inbox: tokio::sync::mpsc::Receiver<Message>) {
        self.start();
        while let Some(msg) = inbox.recv().await {
            self.dispatch(msg);
        }
        debug!(rank = self.rank, "inbox closed; shutting down");
    }

    pub fn dispatch(&mut self, msg: Message) {
        if !self.initialized {
            let is_init_reply =
                matches!(&msg, Message::RpcReply(r) if matches!(r.tag, RpcTag::GetRoot));
            if !is_init_reply {
                self.init_backlog.push(msg);
                return;
            }
        }
        match msg {
            Message::Request(env) => self.handle_request(env),
            Message::Event { topic, payload } => self.handle_event(&topic, payload),
            Message::RpcReply(reply) => self.handle_rpc_reply(reply),
        }
        // The check half of the commit pipeline: run after every message so
        // the ready queue never waits on the reactor going idle.
        self.drive_commits();
    }

    fn handle_request(&mut self, env: Envelope) {
        match env.topic.as_str() {
            "kvs.get" => self.handle_get(env, None),
            "kvs.watch" => self.handle_watch(env, None),
            "kvs.unwatch" => self.handle_unwatch(env),
            "kvs.fence" => self.handle_fence(env),
            "kvs.relayfence" => self.handle_relayfence(env),
            "kvs.getroot" => self.handle_getroot(env),
            "kvs.sync" => self.handle_sync(env),
            "kvs.dropcache" => self.handle_dropcache_request(env),
            "kvs.disconnect" => self.handle_disconnect(env),
            "kvs.stats.get" => self.handle_stats_get(env),
            "kvs.stats.clear" => {
                self.stats_clear();
                self.broker.respond(&env, Ok(Value::Null));
            }
            other => {
                warn!(topic = other, "unhandled request topic");
                self.broker.respond(&env, Err(errno::ENOSYS));
            }
        }
    }

    fn handle_event(&mut self, topic: &str, payload: Value) {
        match topic {
            "kvs.setroot" => self.handle_setroot_event(payload),
            "kvs.error" => self.handle_error_event(payload),
            "kvs.dropcache" => {
                let size = self.cache.count();
                let dropped = self.cache.expire(self.epoch, 0);
                warn!(dropped, size, "dropped cache entries");
            }
            "kvs.stats.clear" => self.stats_clear(),
            "hb" => self.handle_heartbeat(payload),
            _ => {}
        }
    }

    fn handle_rpc_reply(&mut self, reply: RpcReply) {
        match reply.tag {
            RpcTag::ContentLoad(blobref) => self.handle_content_load_reply(blobref, reply.result),
            RpcTag::ContentStore(blobref) => self.handle_content_store_reply(blobref, reply.result),
            RpcTag::GetRoot => self.handle_getroot_reply(reply.result),
        }
    }

    // ------------------------------------------------------------------
    // Root pointer

    fn store_initial_root(&mut self) -> arbor_core::Result<()> {
        let root = empty_directory();
        let bytes = self.encoder.encode(&root)?;
        let blobref = self.encoder.algorithm().digest(&bytes);
        if self.cache.peek(&blobref).is_none() {
            let mut entry = CacheEntry::valid(root, bytes.len(), self.epoch);
            entry.set_dirty();
            self.cache.insert(blobref, entry)?;
            self.broker.rpc(
                "content.store",
                Bytes::from(bytes),
                Target::Any,
                RpcTag::ContentStore(blobref),
            );
        }
        self.set_root(blobref, 0);
        Ok(())
    }

    /// Adopt a new root when it advances the version, and fire the
    /// watchlist so watchers re-evaluate against it.
    fn set_root(&mut self, rootdir: BlobRef, rootseq: u64) {
        if rootseq == 0 || rootseq > self.rootseq {
            self.rootdir = rootdir;
            self.rootseq = rootseq;
            self.run_watchlist();
        }
    }

    fn run_watchlist(&mut self) {
        let queued = std::mem::take(&mut self.watchlist);
        let resumes = self.waits.take_many(&queued);
        self.watchlist_lastrun_epoch = self.epoch;
        for resume in resumes {
            self.dispatch_resume(resume);
        }
    }

    fn dispatch_resume(&mut self, resume: Resume) {
        match resume {
            Resume::Request(env) => self.handle_request(env),
            Resume::Lookup { env, lookup } => match env.topic.as_str() {
                "kvs.get" => self.handle_get(env, Some(lookup)),
                "kvs.watch" => self.handle_watch(env, Some(lookup)),
                other => warn!(topic = other, "resumed unexpected topic"),
            },
            Resume::Commit => self.continue_commit(),
        }
    }

    fn release_waits(&mut self, woken: Vec<WaitId>) {
        let mut resumes = Vec::new();
        for id in woken {
            if let Some(resume) = self.waits.decref(id) {
                resumes.push(resume);
            }
        }
        for resume in resumes {
            self.dispatch_resume(resume);
        }
    }

    // ------------------------------------------------------------------
    // Content store traffic

    /// Ensure `blobref` has a cache entry, faulting it in if needed, and
    /// park `wait` on its validity when it is not valid yet. Returns whether
    /// the entry is valid now.
    fn load(&mut self, blobref: &BlobRef, wait: Option<WaitId>) -> bool {
        if self.cache.peek(blobref).is_none() {
            if let Err(e) = self.cache.insert(*blobref, CacheEntry::incomplete(self.epoch)) {
                error!(err = %e, "cache insert");
            }
            self.broker.rpc(
                "content.load",
                Bytes::from(blobref.to_string()),
                Target::Any,
                RpcTag::ContentLoad(*blobref),
            );
            self.faults += 1;
            debug!(%blobref, "fault");
        }
        let Some(entry) = self.cache.lookup(blobref, self.epoch) else {
            return false;
        };
        if entry.is_valid() {
            return true;
        }
        if let Some(wait) = wait {
            entry.wait_valid(wait);
            self.waits.incref(wait);
        }
        false
    }

    fn handle_content_load_reply(&mut self, blobref: BlobRef, result: Result<Bytes, i32>) {
        match result {
            Ok(bytes) => {
                let value = match self.encoder.decode(&bytes) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(%blobref, err = %e, "content.load decode");
                        return self.fail_load(&blobref, errno::EPROTO);
                    }
                };
                let woken = match self.cache.lookup(&blobref, self.epoch) {
                    Some(entry) if !entry.is_valid() => entry.set_object(value, bytes.len()),
                    Some(_) => Vec::new(), // already primed (e.g. by setroot)
                    None => {
                        warn!(%blobref, "load reply for unknown entry");
                        Vec::new()
                    }
                };
                self.release_waits(woken);
            }
            Err(errnum) => {
                warn!(%blobref, errnum, "content.load failed");
                self.fail_load(&blobref, errnum);
            }
        }
    }

    /// A fault could not be satisfied: evict the incomplete entry so later
    /// requests retry, and answer everything parked on it with the errno.
    fn fail_load(&mut self, blobref: &BlobRef, errnum: i32) {
        let woken = match self.cache.lookup(blobref, self.epoch) {
            Some(entry) => entry.drain_valid_waiters(),
            None => Vec::new(),
        };
        if self.cache.peek(blobref).map(|e| !e.is_valid()).unwrap_or(false) {
            self.cache.evict(blobref);
        }
        // Fire each wait immediately, whatever its remaining usecount.
        let mut resumes = Vec::new();
        for id in woken {
            if let Some(resume) = self.waits.discard(id) {
                resumes.push(resume);
            }
        }
        for resume in resumes {
            match resume {
                Resume::Request(env) | Resume::Lookup { env, .. } => {
                    self.broker.respond(&env, Err(errnum));
                }
                Resume::Commit => self.fail_current_commit(errnum),
            }
        }
    }

    fn handle_content_store_reply(&mut self, blobref: BlobRef, result: Result<Bytes, i32>) {
        match result {
            Ok(bytes) => {
                let stored = std::str::from_utf8(&bytes)
                    .ok()
                    .and_then(|s| s.trim().parse::<BlobRef>().ok());
                match stored {
                    Some(stored) if stored == blobref => {
                        let woken = match self.cache.lookup(&blobref, self.epoch) {
                            Some(entry) => entry.clear_dirty(),
                            None => Vec::new(),
                        };
                        self.release_waits(woken);
                    }
                    Some(stored) => {
                        // The store is the ref authority; disagreement means
                        // the local canonicalization is misconfigured.
                        error!(expected = %blobref, got = %stored, "content store ref mismatch");
                        self.fail_store(errno::EPROTO);
                    }
                    None => {
                        error!(%blobref, "bad content.store reply");
                        self.fail_store(errno::EPROTO);
                    }
                }
            }
            Err(errnum) => {
                error!(%blobref, errnum, "content.store failed");
                self.fail_store(errnum);
            }
        }
    }

    /// Surface an asynchronous store failure as a commit error instead of
    /// letting the commit hang on entries that will never go clean.
    fn fail_store(&mut self, errnum: i32) {
        if self.mgr.is_processing() {
            self.fail_current_commit(errnum);
        }
    }

    // ------------------------------------------------------------------
    // Commit pipeline (leader)

    fn drive_commits(&mut self) {
        if self.rank != 0 {
            return;
        }
        while !self.mgr.is_processing() && self.mgr.has_ready() {
            if !self.mgr.start_ready_commit(self.options.commit_merge) {
                break;
            }
            self.continue_commit();
        }
    }

    fn continue_commit(&mut self) {
        let mut woken = Vec::new();
        let rootdir = self.rootdir;
        let Some(status) = self.mgr.process_current(
            &mut self.cache,
            self.epoch,
            &rootdir,
            self.encoder.as_ref(),
            &mut woken,
        ) else {
            return;
        };
        self.release_waits(woken);

        match status {
            ProcessStatus::LoadMissingRefs(refs) => {
                let wait = self.waits.create(Resume::Commit);
                for blobref in &refs {
                    self.load(blobref, Some(wait));
                }
                if self.waits.usecount(wait) == 0 {
                    self.waits.discard(wait);
                    self.continue_commit();
                }
            }
            ProcessStatus::DirtyCacheEntries(refs) => {
                let wait = self.waits.create(Resume::Commit);
                for blobref in &refs {
                    self.flush_dirty_entry(blobref, wait);
                }
                if self.waits.usecount(wait) == 0 {
                    self.waits.discard(wait);
                    self.continue_commit();
                }
            }
            ProcessStatus::Error(errnum) => self.finish_commit_error(errnum),
            ProcessStatus::Finished(newroot) => self.finish_commit_success(newroot),
        }
    }

    /// Kick off the store RPC for a staged entry (once) and park the commit
    /// on its clean event.
    fn flush_dirty_entry(&mut self, blobref: &BlobRef, wait: WaitId) {
        let pending_object = match self.cache.lookup(blobref, self.epoch) {
            Some(entry) if entry.is_store_pending() => {
                entry.set_store_pending(false);
                entry.object().cloned()
            }
            _ => None,
        };
        if let Some(object) = pending_object {
            match self.encoder.encode(&object) {
                Ok(bytes) => self.broker.rpc(
                    "content.store",
                    Bytes::from(bytes),
                    Target::Any,
                    RpcTag::ContentStore(*blobref),
                ),
                Err(e) => error!(err = %e, "encode staged blob"),
            }
        }
        if let Some(entry) = self.cache.lookup(blobref, self.epoch) {
            if entry.is_dirty() {
                entry.wait_clean(wait);
                self.waits.incref(wait);
            }
        }
    }

    fn finish_commit_success(&mut self, newroot: BlobRef) {
        let Some(commit) = self.mgr.take_current() else {
            return;
        };
        let names = commit.names().to_vec();
        self.set_root(newroot, self.rootseq + 1);
        self.send_setroot_event(names);
    }

    fn finish_commit_error(&mut self, errnum: i32) {
        let Some(commit) = self.mgr.take_current() else {
            return;
        };
        error!(errnum, names = ?commit.names(), "commit failed");
        self.send_error_event(commit.names().to_vec(), errnum);
    }

    /// Fail the in-flight commit from outside the state machine, dropping
    /// any waits it has parked on cache entries.
    fn fail_current_commit(&mut self, errnum: i32) {
        let ids = self.waits.ids_matching(|r| matches!(r, Resume::Commit));
        let idset: HashSet<WaitId> = ids.into_iter().collect();
        self.cache.purge_waiters(&idset);
        self.waits.remove_ids(&idset);
        if let Some(commit) = self.mgr.current_mut() {
            commit.set_errnum(errnum);
        }
        self.finish_commit_error(errnum);
    }

    fn send_setroot_event(&mut self, names: Vec<String>) {
        let root = if EVENT_INCLUDES_ROOTDIR {
            self.cache
                .lookup(&self.rootdir, self.epoch)
                .and_then(|e| e.object().cloned())
                .map(|o| (*o).clone())
        } else {
            None
        };
        let event = SetrootEvent {
            rootseq: self.rootseq,
            rootdir: self.rootdir,
            root,
            names,
        };
        match proto::encode(&event) {
            Ok(payload) => self.broker.publish("kvs.setroot", payload),
            Err(e) => error!(err = %e, "encode setroot event"),
        }
    }

    fn send_error_event(&mut self, names: Vec<String>, errnum: i32) {
        match proto::encode(&ErrorEvent { names, errnum }) {
            Ok(payload) => self.broker.publish("kvs.error", payload),
            Err(e) => error!(err = %e, "encode error event"),
        }
    }

    // ------------------------------------------------------------------
    // Events

    fn handle_setroot_event(&mut self, payload: Value) {
        let ev: SetrootEvent = match proto::decode(&payload) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(err = %e, "setroot event decode");
                return;
            }
        };
        self.finalize_fences(&ev.names, 0);
        if let Some(root) = ev.root {
            self.prime_root(&ev.rootdir, root);
        }
        self.set_root(ev.rootdir, ev.rootseq);
    }

    /// Store the event's inline root object as valid and clean; it is
    /// already in the content store.
    fn prime_root(&mut self, rootdir: &BlobRef, root: Value) {
        let size = self.encoder.encode(&root).map(|b| b.len()).unwrap_or(0);
        match self.cache.lookup(rootdir, self.epoch) {
            Some(entry) => {
                let mut woken = if entry.is_valid() {
                    Vec::new()
                } else {
                    entry.set_object(root, size)
                };
                if entry.is_dirty() {
                    woken.extend(entry.clear_dirty());
                }
                self.release_waits(woken);
            }
            None => {
                if let Err(e) = self.cache.insert(*rootdir, CacheEntry::valid(root, size, self.epoch)) {
                    error!(err = %e, "priming root");
                }
            }
        }
    }

    fn handle_error_event(&mut self, payload: Value) {
        let ev: ErrorEvent = match proto::decode(&payload) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(err = %e, "error event decode");
                return;
            }
        };
        self.finalize_fences(&ev.names, ev.errnum);
    }

    /// Answer and drop every named fence. The same path runs on every node,
    /// so each instance responds to the clients it retained envelopes for.
    fn finalize_fences(&mut self, names: &[String], errnum: i32) {
        for name in names {
            if let Some(mut fence) = self.mgr.remove_fence(name) {
                for env in fence.take_envelopes() {
                    let result = if errnum == 0 { Ok(Value::Null) } else { Err(errnum) };
                    self.broker.respond(&env, result);
                }
            }
        }
    }

    fn handle_heartbeat(&mut self, payload: Value) {
        let hb: HeartbeatEvent = match proto::decode(&payload) {
            Ok(hb) => hb,
            Err(e) => {
                warn!(err = %e, "hb decode");
                return;
            }
        };
        if hb.epoch > self.epoch {
            self.epoch = hb.epoch;
        }
        // Touch objects reached through watched keys so they never expire
        // out from under an active watcher.
        if self.epoch - self.watchlist_lastrun_epoch > self.options.max_lastuse_age {
            self.run_watchlist();
        }
        let rootdir = self.rootdir;
        self.load(&rootdir, None);
        self.cache.expire(self.epoch, self.options.max_lastuse_age);
    }

    // ------------------------------------------------------------------
    // Requests

    fn handle_get(&mut self, env: Envelope, resumed: Option<Lookup>) {
        let mut lookup = match resumed {
            Some(lookup) => lookup,
            None => {
                let req: GetRequest = match proto::decode(&env.payload) {
                    Ok(req) => req,
                    Err(e) => return self.broker.respond(&env, Err(e.errno())),
                };
                match Lookup::new(&self.rootdir, req.rootdir.as_ref(), &req.key, req.flags) {
                    Ok(lookup) => lookup,
                    Err(e) => return self.broker.respond(&env, Err(e.errno())),
                }
            }
        };
        match lookup.run(&mut self.cache, self.epoch) {
            Step::Missing(blobref) => self.park_lookup(env, lookup, blobref),
            Step::Done(Some(val)) => {
                let result = proto::encode(&GetResponse {
                    rootdir: *lookup.root(),
                    val,
                })
                .map_err(|e| e.errno());
                self.broker.respond(&env, result);
            }
            Step::Done(None) => self.broker.respond(&env, Err(errno::ENOENT)),
            Step::Error(e) => self.broker.respond(&env, Err(e.errno())),
        }
    }

    /// Park a stalled lookup on the missing entry and issue the fault.
    fn park_lookup(&mut self, env: Envelope, lookup: Lookup, blobref: BlobRef) {
        let wait = self.waits.create(Resume::Lookup { env, lookup });
        if self.load(&blobref, Some(wait)) {
            // The entry turned out valid; resume immediately.
            if let Some(resume) = self.waits.discard(wait) {
                self.dispatch_resume(resume);
            }
        }
    }

    fn handle_watch(&mut self, env: Envelope, resumed: Option<Lookup>) {
        let req: WatchRequest = match proto::decode(&env.payload) {
            Ok(req) => req,
            Err(e) => return self.broker.respond(&env, Err(e.errno())),
        };
        let mut lookup = match resumed {
            Some(lookup) => lookup,
            None => match Lookup::new(&self.rootdir, None, &req.key, req.flags) {
                Ok(lookup) => lookup,
                Err(e) => return self.broker.respond(&env, Err(e.errno())),
            },
        };
        // An unset key watches as null, so creation fires the watcher.
        let val = match lookup.run(&mut self.cache, self.epoch) {
            Step::Missing(blobref) => return self.park_lookup(env, lookup, blobref),
            Step::Done(v) => v.unwrap_or(Value::Null),
            Step::Error(e) => return self.broker.respond(&env, Err(e.errno())),
        };

        let replied = req.flags & flags::FIRST != 0 || val != req.val;
        if replied {
            let result = proto::encode(&WatchResponse { val: val.clone() }).map_err(|e| e.errno());
            self.broker.respond(&env, result);
        }
        if !replied || req.flags & flags::ONCE == 0 {
            // Re-arm on the watchlist with the just-seen value and FIRST
            // cleared; the next setroot re-runs the lookup.
            let rearmed = WatchRequest {
                key: req.key,
                val,
                flags: req.flags & !flags::FIRST,
            };
            match proto::encode(&rearmed) {
                Ok(payload) => {
                    let mut next = env.clone();
                    next.payload = payload;
                    let wait = self.waits.create(Resume::Request(next));
                    self.waits.incref(wait);
                    self.watchlist.push(wait);
                }
                Err(e) => error!(err = %e, "encode watch re-arm"),
            }
        }
    }

    fn handle_unwatch(&mut self, env: Envelope) {
        let req: UnwatchRequest = match proto::decode(&env.payload) {
            Ok(req) => req,
            Err(e) => return self.broker.respond(&env, Err(e.errno())),
        };
        let destroyed = self.destroy_matching_waits(|e| {
            e.topic == "kvs.watch"
                && e.sender == env.sender
                && proto::decode::<WatchRequest>(&e.payload)
                    .map(|w| w.key == req.key)
                    .unwrap_or(false)
        });
        debug!(key = %req.key, destroyed, "unwatch");
        self.broker.respond(&env, Ok(Value::Null));
    }

    fn handle_disconnect(&mut self, env: Envelope) {
        let destroyed = self.destroy_matching_waits(|e| e.sender == env.sender);
        debug!(sender = %env.sender, destroyed, "disconnect");
    }

    /// Destroy pending waits whose stored envelope matches, wherever they
    /// are registered: the watchlist and every cache entry's waiter sets.
    fn destroy_matching_waits(&mut self, pred: impl Fn(&Envelope) -> bool) -> usize {
        let ids = self.waits.ids_matching(|resume| match resume {
            Resume::Request(env) | Resume::Lookup { env, .. } => pred(env),
            Resume::Commit => false,
        });
        let idset: HashSet<WaitId> = ids.into_iter().collect();
        self.cache.purge_waiters(&idset);
        self.watchlist.retain(|id| !idset.contains(id));
        self.waits.remove_ids(&idset);
        idset.len()
    }

    fn handle_fence(&mut self, env: Envelope) {
        let req: FenceRequest = match proto::decode(&env.payload) {
            Ok(req) => req,
            Err(e) => return self.broker.respond(&env, Err(e.errno())),
        };
        if req.nprocs == 0 {
            return self.broker.respond(&env, Err(errno::EINVAL));
        }
        if let Err(e) = self.ensure_fence(&req) {
            return self.broker.respond(&env, Err(e.errno()));
        }
        let payload = env.payload.clone();
        if let Some(fence) = self.mgr.lookup_fence_mut(&req.name) {
            fence.add_envelope(env);
        }
        if self.rank == 0 {
            self.accumulate_fence_ops(&req.name, req.ops);
        } else {
            // Relay to the leader; the local fence keeps the envelope so
            // this instance answers its own client on the broadcast event.
            self.broker.forward("kvs.relayfence", payload, Target::Leader);
        }
    }

    fn handle_relayfence(&mut self, env: Envelope) {
        if self.rank != 0 {
            warn!("relayfence delivered to non-leader");
            return;
        }
        let req: FenceRequest = match proto::decode(&env.payload) {
            Ok(req) => req,
            Err(e) => {
                warn!(err = %e, "relayfence decode");
                return;
            }
        };
        if let Err(e) = self.ensure_fence(&req) {
            warn!(name = %req.name, err = %e, "relayfence registration");
            return;
        }
        self.accumulate_fence_ops(&req.name, req.ops);
    }

    /// Create the named fence on first sight, or fold new flags into it.
    fn ensure_fence(&mut self, req: &FenceRequest) -> arbor_core::Result<()> {
        if self.mgr.contains_fence(&req.name) {
            if let Some(fence) = self.mgr.lookup_fence_mut(&req.name) {
                fence.or_flags(req.flags);
            }
            Ok(())
        } else {
            self.mgr
                .add_fence(Fence::new(req.name.clone(), req.nprocs, req.flags))
        }
    }

    fn accumulate_fence_ops(&mut self, name: &str, ops: Vec<Op>) {
        let became_ready = self
            .mgr
            .lookup_fence_mut(name)
            .map(|fence| fence.add_ops(ops))
            .unwrap_or(false);
        if became_ready {
            self.mgr.queue_ready(name);
        }
    }

    fn handle_getroot(&mut self, env: Envelope) {
        let result = proto::encode(&RootResponse {
            rootseq: self.rootseq,
            rootdir: self.rootdir,
        })
        .map_err(|e| e.errno());
        self.broker.respond(&env, result);
    }

    fn handle_sync(&mut self, env: Envelope) {
        let req: SyncRequest = match proto::decode(&env.payload) {
            Ok(req) => req,
            Err(e) => return self.broker.respond(&env, Err(e.errno())),
        };
        if self.rootseq < req.rootseq {
            // Stall until the root catches up; every setroot fires the
            // watchlist and re-dispatches this request.
            let wait = self.waits.create(Resume::Request(env));
            self.waits.incref(wait);
            self.watchlist.push(wait);
            return;
        }
        let result = proto::encode(&RootResponse {
            rootseq: self.rootseq,
            rootdir: self.rootdir,
        })
        .map_err(|e| e.errno());
        self.broker.respond(&env, result);
    }

    fn handle_dropcache_request(&mut self, env: Envelope) {
        let size = self.cache.count();
        let dropped = self.cache.expire(self.epoch, 0);
        warn!(dropped, size, "dropped cache entries");
        let result = proto::encode(&DropcacheResponse { dropped, size }).map_err(|e| e.errno());
        self.broker.respond(&env, result);
    }

    fn handle_stats_get(&mut self, env: Envelope) {
        let cs = self.cache.stats();
        let resp = StatsResponse {
            cache_bytes_total: cs.total_bytes,
            cache_objects: cs.count,
            cache_incomplete: cs.incomplete,
            cache_dirty: cs.dirty,
            obj_size: ObjSizeStats {
                count: cs.obj_size.count,
                min: cs.obj_size.min,
                mean: cs.obj_size.mean(),
                stddev: cs.obj_size.stddev(),
                max: cs.obj_size.max,
            },
            watchers: self.watchlist.len(),
            noop_stores: self.mgr.noop_stores(),
            faults: self.faults,
            store_revision: self.rootseq,
        };
        let result = proto::encode(&resp).map_err(|e| e.errno());
        self.broker.respond(&env, result);
    }

    fn stats_clear(&mut self) {
        self.faults = 0;
        self.mgr.clear_noop_stores();
    }

    fn handle_getroot_reply(&mut self, result: Result<Bytes, i32>) {
        let parsed = result
            .map_err(|errnum| KvsError::Io(format!("getroot failed: errno {errnum}")))
            .and_then(|bytes| {
                serde_json::from_slice::<RootResponse>(&bytes)
                    .map_err(|e| KvsError::Protocol(e.to_string()))
            });
        match parsed {
            Ok(resp) => {
                self.set_root(resp.rootdir, resp.rootseq);
                self.initialized = true;
                let backlog = std::mem::take(&mut self.init_backlog);
                for msg in backlog {
                    self.dispatch(msg);
                }
            }
            Err(e) => error!(err = %e, "getroot handshake"),
        }
    }
}
