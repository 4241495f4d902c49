//! In-memory stores for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::provider::{compare_and_set, DurableStore, RemoteStore, WriteRequest};
use showsync_common::{ActorId, EntityId, Error, FieldMap, Operation, Result, VersionedEntity};

/// A failure the memory remote store can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Network,
    Timeout,
    Unavailable,
    RateLimited,
    NotPermitted,
    Invalid,
}

impl Fault {
    fn into_error(self) -> Error {
        match self {
            Fault::Network => Error::Network("injected: connection reset".to_string()),
            Fault::Timeout => Error::Timeout("injected: deadline exceeded".to_string()),
            Fault::Unavailable => Error::Unavailable("injected: 503".to_string()),
            Fault::RateLimited => Error::RateLimited("injected: 429".to_string()),
            Fault::NotPermitted => Error::NotPermitted("injected: forbidden".to_string()),
            Fault::Invalid => Error::InvalidInput("injected: rejected by validation".to_string()),
        }
    }
}

#[derive(Default)]
struct RemoteInner {
    entities: HashMap<EntityId, VersionedEntity>,
    faults: VecDeque<Fault>,
    accepted: Vec<WriteRequest>,
    offline: bool,
    latency: Option<Duration>,
}

/// In-memory remote store.
///
/// Useful for testing and development. Supports scripted faults, an
/// offline switch, artificial latency, and edits made "by another client"
/// so conflicts can be reproduced deterministically.
pub struct MemoryRemoteStore {
    inner: Mutex<RemoteInner>,
    calls: AtomicUsize,
}

impl MemoryRemoteStore {
    /// Create a new empty remote store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RemoteInner::default()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Insert an entity as-is, bypassing version checks.
    pub async fn seed(&self, entity: VersionedEntity) {
        self.inner.lock().await.entities.insert(entity.id.clone(), entity);
    }

    /// Toggle reachability. While offline every call fails with a network error.
    pub async fn set_online(&self, online: bool) {
        self.inner.lock().await.offline = !online;
    }

    /// Queue a fault returned by the next remote call.
    pub async fn inject(&self, fault: Fault) {
        self.inner.lock().await.faults.push_back(fault);
    }

    /// Queue the same fault `count` times.
    pub async fn inject_n(&self, fault: Fault, count: usize) {
        let mut inner = self.inner.lock().await;
        for _ in 0..count {
            inner.faults.push_back(fault);
        }
    }

    /// Delay every call by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().await.latency = latency;
    }

    /// Apply an update on behalf of another client at the current version.
    pub async fn apply_external(
        &self,
        id: &EntityId,
        patch: FieldMap,
        actor: ActorId,
        modified_at: DateTime<Utc>,
    ) -> Result<VersionedEntity> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .entities
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("Entity not found: {}", id)))?;
        let request = WriteRequest {
            entity_id: id.clone(),
            kind: current.kind,
            operation: Operation::Update,
            payload: patch,
            expected_version: current.version,
            actor,
            modified_at,
        };
        let next = compare_and_set(Some(current), &request)?;
        inner.entities.insert(id.clone(), next.clone());
        Ok(next)
    }

    /// Current copy without going through faults or latency.
    pub async fn snapshot(&self, id: &EntityId) -> Option<VersionedEntity> {
        self.inner.lock().await.entities.get(id).cloned()
    }

    /// Writes the store accepted, in the order they were applied.
    pub async fn accepted_writes(&self) -> Vec<WriteRequest> {
        self.inner.lock().await.accepted.clone()
    }

    /// Number of read/write calls received, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn before_call(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = {
            let mut inner = self.inner.lock().await;
            if inner.offline {
                return Err(Error::Network("remote unreachable".to_string()));
            }
            if let Some(fault) = inner.faults.pop_front() {
                return Err(fault.into_error());
            }
            inner.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, id: &EntityId) -> Result<VersionedEntity> {
        self.before_call().await?;
        self.inner
            .lock()
            .await
            .entities
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Entity not found: {}", id)))
    }

    async fn write(&self, request: &WriteRequest) -> Result<VersionedEntity> {
        self.before_call().await?;
        let mut inner = self.inner.lock().await;
        let next = compare_and_set(inner.entities.get(&request.entity_id), request)?;
        inner.entities.insert(request.entity_id.clone(), next.clone());
        inner.accepted.push(request.clone());
        Ok(next)
    }
}

/// In-memory durable store.
///
/// Data survives as long as the value does, which is enough to simulate a
/// process restart by reopening the queue on the same store.
pub struct MemoryDurableStore {
    blobs: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// Make subsequent writes fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful blob writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Default for MemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn write_blob(&self, key: &str, data: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("injected: disk full")));
        }
        self.blobs.lock().await.insert(key.to_string(), data.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_blob(&self, key: &str) -> Result<Option<String>> {
        Ok(self.blobs.lock().await.get(key).cloned())
    }

    async fn remove_blob(&self, key: &str) -> Result<()> {
        self.blobs.lock().await.remove(key);
        Ok(())
    }
}
