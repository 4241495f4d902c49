//! Core sync engine that orchestrates the mutation pipeline.
//!
//! The engine owns the queue, the read cache, the audit trail and the
//! event bus, and drains queued mutations to the remote store through the
//! retry executor and the conflict resolver. There is no global instance:
//! callers `open` an engine, share it (usually behind an `Arc`) and
//! `shutdown` it when done.

use futures::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use showsync_common::{
    entity_cache_key, ActorId, EntityId, EntityKind, Error, FieldMap, Operation, Record, Result,
    VersionedEntity,
};
use showsync_storage::{DurableStore, RemoteStore, WriteRequest};

use crate::audit::{
    AuditAction, AuditEvent, AuditFilter, AuditTrail, ExportFormat, DEFAULT_AUDIT_CAPACITY,
};
use crate::cache::{with_cache, TtlCache};
use crate::conflict::{ConflictReport, ConflictResolver, ConflictStrategy, Resolution};
use crate::events::{Connectivity, EventBus, QueueStatus, SyncEvent, SyncStats};
use crate::mutation::{MutationId, MutationRecord, MutationStatus};
use crate::queue::MutationQueue;
use crate::retry::{Backoff, RetryConfig, RetryExecutor};
use crate::scheduler::{SyncMode, SyncReport, SyncScheduler, SyncTrigger};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Attempts per remote call, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff: Backoff,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Deadline for a single remote call; 0 disables it.
    pub call_timeout_ms: u64,
    /// Drain cycles a mutation may fail transiently before dead-lettering.
    pub max_retry_cycles: u32,
    /// Re-resolutions after a racing write before giving up as unresolved.
    pub max_resolution_attempts: u32,
    pub conflict_strategy: ConflictStrategy,
    pub sync_mode: SyncMode,
    pub cache_ttl_ms: u64,
    pub audit_capacity: usize,
    /// Who local edits are attributed to.
    pub actor: ActorId,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            backoff: Backoff::Exponential,
            max_delay_ms: 30_000,
            jitter: false,
            call_timeout_ms: 10_000,
            max_retry_cycles: 5,
            max_resolution_attempts: 3,
            conflict_strategy: ConflictStrategy::FieldMerge,
            sync_mode: SyncMode::Manual,
            cache_ttl_ms: 300_000,
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
            actor: ActorId::default(),
        }
    }
}

impl SyncConfig {
    pub fn with_actor(mut self, actor: ActorId) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_retry_cycles(mut self, cycles: u32) -> Self {
        self.max_retry_cycles = cycles;
        self
    }

    /// Retry policy for remote calls.
    pub fn retry_config(&self) -> RetryConfig {
        let call_timeout =
            (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms));
        RetryConfig::new(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_backoff(self.backoff)
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter(self.jitter)
            .with_call_timeout(call_timeout)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

type EntityReader =
    Box<dyn Fn((EntityKind, EntityId)) -> BoxFuture<'static, Result<VersionedEntity>> + Send + Sync>;

/// Remote reads through the retry executor, answered from `cache` when fresh.
fn cached_reader(
    remote: Arc<dyn RemoteStore>,
    retry: RetryExecutor,
    cache: Arc<TtlCache<VersionedEntity>>,
    ttl: Duration,
) -> EntityReader {
    Box::new(with_cache(
        cache,
        move |(_, id): (EntityKind, EntityId)| {
            let remote = remote.clone();
            let retry = retry.clone();
            async move {
                retry
                    .execute(|| {
                        let remote = remote.clone();
                        let id = id.clone();
                        async move { remote.read(&id).await }
                    })
                    .await
            }
        },
        |(kind, id): &(EntityKind, EntityId)| entity_cache_key(*kind, id),
        ttl,
    ))
}

/// One pattern per kind matching every cache key under its prefix.
fn kind_patterns() -> Result<HashMap<EntityKind, Regex>> {
    EntityKind::ALL
        .into_iter()
        .map(|kind| {
            let pattern = format!("^{}", regex::escape(&kind.cache_prefix()));
            Regex::new(&pattern)
                .map(|regex| (kind, regex))
                .map_err(|e| Error::Invariant(format!("Bad cache pattern for {}: {}", kind, e)))
        })
        .collect()
}

/// Counters behind `SyncStats`.
struct EngineState {
    connectivity: Connectivity,
    last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
    total_synced: u64,
    total_conflicts: u64,
    total_failed: u64,
}

/// What the drain loop should do after a mutation.
enum Flow {
    Continue,
    /// Remote unreachable; end the cycle.
    Stop,
}

/// Main sync engine for the offline mutation pipeline.
pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    queue: Arc<RwLock<MutationQueue>>,
    cache: Arc<TtlCache<VersionedEntity>>,
    invalidation: HashMap<EntityKind, Regex>,
    reader: EntityReader,
    resolver: ConflictResolver,
    retry_executor: RetryExecutor,
    audit: Arc<RwLock<AuditTrail>>,
    events: EventBus,
    state: RwLock<EngineState>,
    draining: AtomicBool,
    drain_lock: Mutex<()>,
    scheduler: RwLock<Option<SyncScheduler>>,
    config: SyncConfig,
}

impl SyncEngine {
    /// Open the engine, restoring the queue and audit trail from `durable`.
    ///
    /// The engine starts online; call `set_online(false)` if the transport
    /// layer knows otherwise.
    pub async fn open(
        remote: Arc<dyn RemoteStore>,
        durable: Arc<dyn DurableStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        let queue = MutationQueue::open(durable.clone(), config.max_retry_cycles).await?;
        let audit = AuditTrail::open(durable, config.audit_capacity).await?;
        let retry_executor = RetryExecutor::new(config.retry_config());
        let invalidation = kind_patterns()?;
        let cache = Arc::new(TtlCache::new());
        let reader = cached_reader(
            remote.clone(),
            retry_executor.clone(),
            cache.clone(),
            config.cache_ttl(),
        );

        info!(
            "Sync engine opened against {} store ({} queued mutations)",
            remote.name(),
            queue.len()
        );

        let engine = Self {
            remote,
            queue: Arc::new(RwLock::new(queue)),
            cache,
            invalidation,
            reader,
            resolver: ConflictResolver::new(config.conflict_strategy),
            retry_executor,
            audit: Arc::new(RwLock::new(audit)),
            events: EventBus::new(),
            state: RwLock::new(EngineState {
                connectivity: Connectivity::new(true),
                last_sync_at: None,
                total_synced: 0,
                total_conflicts: 0,
                total_failed: 0,
            }),
            draining: AtomicBool::new(false),
            drain_lock: Mutex::new(()),
            scheduler: RwLock::new(None),
            config,
        };
        engine.refresh_status().await;
        Ok(engine)
    }

    /// Publish to a shared bus instead of a private one.
    pub async fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self.refresh_status().await;
        self
    }

    /// Use a caller-provided cache, e.g. one on a manual clock.
    pub fn with_cache(mut self, cache: Arc<TtlCache<VersionedEntity>>) -> Self {
        self.reader = cached_reader(
            self.remote.clone(),
            self.retry_executor.clone(),
            cache.clone(),
            self.config.cache_ttl(),
        );
        self.cache = cache;
        self
    }

    /// Start the background scheduler for the configured sync mode.
    pub async fn start_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let (scheduler, handle) = SyncScheduler::new(self.config.sync_mode);
        *self.scheduler.write().await = Some(scheduler);

        let engine: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(handle.run(move |trigger| {
            let engine = engine.clone();
            async move {
                match engine.upgrade() {
                    Some(engine) => engine.drain(trigger).await,
                    None => Ok(SyncReport::skipped(trigger)),
                }
            }
        }))
    }

    /// Stop the scheduler. Queue and audit state are already durable.
    pub async fn shutdown(&self) {
        if let Some(scheduler) = self.scheduler.write().await.take() {
            scheduler.shutdown().await;
        }
        info!("Sync engine shut down");
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TtlCache<VersionedEntity>> {
        &self.cache
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ---- edits ----

    /// Queue an edit against the entity's current local view.
    pub async fn enqueue(
        &self,
        operation: Operation,
        kind: EntityKind,
        entity_id: EntityId,
        payload: FieldMap,
    ) -> Result<MutationRecord> {
        let base_version = {
            let queue = self.queue.read().await;
            queue.view(&entity_id).map(|v| v.version).unwrap_or(0)
        };
        self.enqueue_at(operation, kind, entity_id, payload, base_version)
            .await
    }

    /// Queue an edit computed against an explicit remote version.
    pub async fn enqueue_at(
        &self,
        operation: Operation,
        kind: EntityKind,
        entity_id: EntityId,
        payload: FieldMap,
        base_version: u64,
    ) -> Result<MutationRecord> {
        let record = self
            .queue
            .write()
            .await
            .enqueue(
                operation,
                kind,
                entity_id,
                payload,
                base_version,
                self.config.actor.clone(),
            )
            .await?;

        self.audit(
            AuditEvent::new(
                AuditAction::Enqueued,
                record.actor.clone(),
                format!("{} of {} queued", record.operation, record.entity_id),
            )
            .for_mutation(&record),
        )
        .await;
        self.events.publish(SyncEvent::MutationQueued {
            id: record.id,
            entity_id: record.entity_id.clone(),
        });
        self.refresh_status().await;

        if let Some(scheduler) = self.scheduler.read().await.as_ref() {
            scheduler.notify_change().await;
        }
        Ok(record)
    }

    /// Queue creation of a typed record.
    pub async fn create_record<R: Record>(
        &self,
        entity_id: EntityId,
        record: &R,
    ) -> Result<MutationRecord> {
        let fields = record.to_fields()?;
        self.enqueue(Operation::Create, R::KIND, entity_id, fields)
            .await
    }

    /// Queue deletion of an entity.
    pub async fn delete(&self, kind: EntityKind, entity_id: EntityId) -> Result<MutationRecord> {
        self.enqueue(Operation::Delete, kind, entity_id, FieldMap::new())
            .await
    }

    // ---- reads ----

    /// Read an entity: local view with pending edits first, then the read
    /// cache, then the remote store.
    pub async fn read_entity(
        &self,
        kind: EntityKind,
        entity_id: &EntityId,
    ) -> Result<VersionedEntity> {
        {
            let queue = self.queue.read().await;
            if queue.has_live_mutations(entity_id) {
                if let Some(view) = queue.view(entity_id) {
                    return Ok(view);
                }
            }
        }

        let key = entity_cache_key(kind, entity_id);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        if !self.is_online().await {
            return self
                .queue
                .read()
                .await
                .confirmed(entity_id)
                .ok_or_else(|| Error::Network(format!("Offline and {} is not cached", entity_id)));
        }

        let entity = (self.reader)((kind, entity_id.clone())).await?;
        if entity.kind != kind {
            self.cache.invalidate(&key);
            return Err(Error::InvalidInput(format!(
                "{} is a {} entity, not {}",
                entity_id, entity.kind, kind
            )));
        }
        self.queue.write().await.observe_remote(entity.clone()).await?;
        Ok(entity)
    }

    /// Read and decode a typed record.
    pub async fn read_record<R: Record>(&self, entity_id: &EntityId) -> Result<R> {
        let entity = self.read_entity(R::KIND, entity_id).await?;
        if entity.deleted {
            return Err(Error::NotFound(format!("Entity was deleted: {}", entity_id)));
        }
        R::from_entity(&entity)
    }

    /// Optimistic local view of an entity, if it is known.
    pub async fn view(&self, entity_id: &EntityId) -> Option<VersionedEntity> {
        self.queue.read().await.view(entity_id)
    }

    /// All live mutations in FIFO order.
    pub async fn mutations(&self) -> Vec<MutationRecord> {
        self.queue.read().await.records().to_vec()
    }

    pub async fn mutation(&self, id: MutationId) -> Option<MutationRecord> {
        self.queue.read().await.get(id).cloned()
    }

    // ---- connectivity & status ----

    /// Report connectivity. Regaining it triggers a drain when a scheduler runs.
    pub async fn set_online(&self, online: bool) {
        let changed = self.state.write().await.connectivity.set(online);
        if !changed {
            return;
        }
        info!("Connectivity {}", if online { "regained" } else { "lost" });
        self.events.publish(SyncEvent::ConnectivityChanged { online });
        self.refresh_status().await;

        if online {
            if let Some(scheduler) = self.scheduler.read().await.as_ref() {
                scheduler.trigger(SyncTrigger::ConnectivityRegained);
            }
        }
    }

    pub async fn is_online(&self) -> bool {
        self.state.read().await.connectivity.is_online()
    }

    /// Latest queue status snapshot.
    pub fn status(&self) -> QueueStatus {
        self.events.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<QueueStatus> {
        self.events.watch_status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn stats(&self) -> SyncStats {
        let queue_stats = self.queue.read().await.stats();
        let state = self.state.read().await;
        SyncStats {
            queued_count: queue_stats.pending(),
            failed_count: queue_stats.needs_attention(),
            is_online: state.connectivity.is_online(),
            offline_for: state.connectivity.offline_for(),
            since_last_online: state.connectivity.since_last_online(),
            last_sync_at: state.last_sync_at,
            total_synced: state.total_synced,
            total_conflicts: state.total_conflicts,
            total_failed: state.total_failed,
        }
    }

    // ---- failed operations ----

    /// Dead-letter and unresolved mutations awaiting a decision.
    pub async fn failed_operations(&self) -> Vec<MutationRecord> {
        self.queue.read().await.get_failed_operations()
    }

    /// Put a failed mutation back in line.
    pub async fn retry_operation(&self, id: MutationId) -> Result<MutationRecord> {
        let record = self.queue.write().await.retry_failed_operation(id).await?;
        self.audit(
            AuditEvent::new(
                AuditAction::Retried,
                self.config.actor.clone(),
                format!("Mutation {} requeued by user", id),
            )
            .for_mutation(&record),
        )
        .await;
        self.refresh_status().await;
        Ok(record)
    }

    /// Drop a failed mutation for good. The drop is recorded in the audit trail.
    pub async fn discard_operation(&self, id: MutationId) -> Result<MutationRecord> {
        let record = self.queue.write().await.discard(id).await?;
        warn!("Mutation {} on {} discarded", record.id, record.entity_id);
        self.audit(
            AuditEvent::new(
                AuditAction::Discarded,
                self.config.actor.clone(),
                format!(
                    "Discarded {} {} of {} ({}) with payload {}",
                    record.status,
                    record.operation,
                    record.entity_id,
                    record
                        .last_error
                        .as_ref()
                        .map(|f| f.message.as_str())
                        .unwrap_or("no error"),
                    serde_json::to_string(&record.payload)?
                ),
            )
            .for_mutation(&record),
        )
        .await;
        self.refresh_status().await;
        Ok(record)
    }

    /// Withdraw a mutation that has not been sent yet.
    pub async fn cancel_operation(&self, id: MutationId) -> Result<MutationRecord> {
        let record = self.queue.write().await.cancel(id).await?;
        self.audit(
            AuditEvent::new(
                AuditAction::Cancelled,
                self.config.actor.clone(),
                format!("{} of {} cancelled", record.operation, record.entity_id),
            )
            .for_mutation(&record),
        )
        .await;
        self.refresh_status().await;
        Ok(record)
    }

    /// Drop every queued mutation. Returns how many were dropped.
    pub async fn clear_queue(&self) -> Result<usize> {
        let dropped = self.queue.write().await.clear().await?;
        warn!("Mutation queue cleared ({} mutations dropped)", dropped.len());
        for record in &dropped {
            self.audit(
                AuditEvent::new(
                    AuditAction::Cleared,
                    self.config.actor.clone(),
                    format!(
                        "{} of {} dropped by queue clear",
                        record.operation, record.entity_id
                    ),
                )
                .for_mutation(record),
            )
            .await;
        }
        self.refresh_status().await;
        Ok(dropped.len())
    }

    // ---- audit ----

    pub async fn audit_query(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        self.audit.read().await.query(filter)
    }

    pub async fn conflict_reports(&self) -> Vec<ConflictReport> {
        self.audit.read().await.conflicts().to_vec()
    }

    pub async fn export_audit(&self, format: ExportFormat, filter: &AuditFilter) -> Result<String> {
        self.audit.read().await.export(format, filter)
    }

    // ---- draining ----

    /// Drain now, as a user-requested "retry now".
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.drain(SyncTrigger::Manual).await
    }

    /// Run one drain cycle.
    ///
    /// Returns a skipped report when offline or when another drain is
    /// already running.
    pub async fn drain(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        if !self.is_online().await {
            debug!("Offline, {:?} drain skipped", trigger);
            return Ok(SyncReport::skipped(trigger));
        }
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("Drain already running, {:?} drain skipped", trigger);
            return Ok(SyncReport::skipped(trigger));
        };

        self.draining.store(true, Ordering::SeqCst);
        self.refresh_status().await;
        let result = self.drain_cycle(trigger).await;
        self.draining.store(false, Ordering::SeqCst);
        self.refresh_status().await;

        match &result {
            Ok(report) => {
                let mut state = self.state.write().await;
                state.last_sync_at = Some(chrono::Utc::now());
                state.total_synced += (report.succeeded + report.merged) as u64;
                state.total_failed += (report.failed + report.dead_lettered) as u64;
                drop(state);
                self.events.publish(SyncEvent::SyncCompleted {
                    report: report.clone(),
                });
            }
            Err(e) => error!("Drain aborted: {}", e),
        }
        result
    }

    async fn drain_cycle(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        let start = Instant::now();
        let mut report = SyncReport::new(trigger);
        let mut cursor = self.queue.read().await.drain();

        info!("Starting {:?} drain", trigger);

        loop {
            let next = {
                let queue = self.queue.read().await;
                cursor.next(&queue)
            };
            let Some(record) = next else {
                break;
            };

            if let Flow::Stop = self.process(record, &mut report).await? {
                info!("Remote unreachable, ending drain early");
                break;
            }
        }

        report.duration = start.elapsed();
        info!(
            "Drain completed in {:?}: {} succeeded, {} merged, {} failed, {} dead-lettered, {} unresolved",
            report.duration,
            report.succeeded,
            report.merged,
            report.failed,
            report.dead_lettered,
            report.unresolved
        );
        Ok(report)
    }

    /// Send one mutation and settle its outcome.
    async fn process(&self, record: MutationRecord, report: &mut SyncReport) -> Result<Flow> {
        let record = self.queue.write().await.mark_sending(record.id).await?;
        debug!(
            "Sending mutation {} ({} {} base v{}, attempt {})",
            record.id, record.operation, record.entity_id, record.base_version, record.attempts
        );
        self.audit(
            AuditEvent::new(
                AuditAction::Sent,
                record.actor.clone(),
                format!(
                    "{} of {} sent against v{} (attempt {})",
                    record.operation, record.entity_id, record.base_version, record.attempts
                ),
            )
            .for_mutation(&record),
        )
        .await;

        let request = WriteRequest {
            entity_id: record.entity_id.clone(),
            kind: record.kind,
            operation: record.operation,
            payload: record.payload.clone(),
            expected_version: record.base_version,
            actor: record.actor.clone(),
            modified_at: record.created_at,
        };

        match self.send(&request).await {
            Ok(entity) => {
                self.complete(&record, entity).await?;
                report.succeeded += 1;
                Ok(Flow::Continue)
            }
            Err(Error::VersionConflict { current, .. }) => {
                self.resolve_conflict(record, *current, report).await
            }
            Err(e) => self.fail(&record, e, report).await,
        }
    }

    /// Remote write through the retry executor.
    async fn send(&self, request: &WriteRequest) -> Result<VersionedEntity> {
        let remote = self.remote.clone();
        self.retry_executor
            .execute(|| {
                let remote = remote.clone();
                let request = request.clone();
                async move { remote.write(&request).await }
            })
            .await
    }

    /// Resolve a conflict and write the merge, re-resolving on further races.
    async fn resolve_conflict(
        &self,
        record: MutationRecord,
        mut current: VersionedEntity,
        report: &mut SyncReport,
    ) -> Result<Flow> {
        let max_attempts = self.config.max_resolution_attempts.max(1);

        for attempt in 1..=max_attempts {
            self.queue
                .write()
                .await
                .observe_remote(current.clone())
                .await?;

            let resolved = match self.resolver.resolve(&record, &current) {
                Ok(resolved) => resolved.with_attempt(attempt),
                Err(e) => {
                    error!("Conflict on {} cannot be resolved: {}", record.entity_id, e);
                    self.park_unresolved(&record, &e, report).await?;
                    return Ok(Flow::Continue);
                }
            };
            self.state.write().await.total_conflicts += 1;
            self.record_conflict(resolved.clone()).await;

            if resolved.resolution == Resolution::Unresolved {
                let err = conflict_error(&record, &current);
                self.park_unresolved(&record, &err, report).await?;
                return Ok(Flow::Continue);
            }

            let Some(operation) = resolved.write_operation else {
                // Remote copy already reflects the outcome
                self.complete(&record, current).await?;
                report.merged += 1;
                return Ok(Flow::Continue);
            };

            let request = WriteRequest {
                entity_id: record.entity_id.clone(),
                kind: record.kind,
                operation,
                payload: resolved.merged_payload.clone(),
                expected_version: current.version,
                actor: record.actor.clone(),
                modified_at: record.created_at,
            };

            match self.send(&request).await {
                Ok(entity) => {
                    self.complete(&record, entity).await?;
                    report.merged += 1;
                    return Ok(Flow::Continue);
                }
                Err(Error::VersionConflict { current: latest, .. }) => {
                    warn!(
                        "Merged write for {} raced with another writer (attempt {}/{})",
                        record.entity_id, attempt, max_attempts
                    );
                    current = *latest;
                }
                Err(e) => return self.fail(&record, e, report).await,
            }
        }

        let err = conflict_error(&record, &current);
        warn!(
            "Conflict on {} still racing after {} resolutions",
            record.entity_id, max_attempts
        );
        self.park_unresolved(&record, &err, report).await?;
        Ok(Flow::Continue)
    }

    /// Adopt the confirmed snapshot and tell everyone about it.
    async fn complete(&self, record: &MutationRecord, entity: VersionedEntity) -> Result<()> {
        self.queue
            .write()
            .await
            .mark_succeeded(record.id, entity.clone())
            .await?;

        match self.invalidation.get(&record.kind) {
            Some(pattern) => {
                self.cache.invalidate_pattern(pattern);
            }
            None => self.cache.clear(),
        }

        debug!(
            "Mutation {} confirmed, {} now at v{}",
            record.id, entity.id, entity.version
        );
        self.audit(
            AuditEvent::new(
                AuditAction::Succeeded,
                record.actor.clone(),
                format!(
                    "{} of {} confirmed at v{}",
                    record.operation, record.entity_id, entity.version
                ),
            )
            .for_mutation(record),
        )
        .await;
        self.events.publish(SyncEvent::EntityUpdated {
            mutation_id: record.id,
            entity,
        });
        Ok(())
    }

    async fn fail(&self, record: &MutationRecord, err: Error, report: &mut SyncReport) -> Result<Flow> {
        let retryable = err.is_transient();
        let status = self
            .queue
            .write()
            .await
            .mark_failed(record.id, &err, retryable)
            .await?;

        let action = if status == MutationStatus::DeadLetter {
            error!("Mutation {} dead-lettered: {}", record.id, err);
            report.dead_lettered += 1;
            AuditAction::DeadLettered
        } else {
            warn!("Mutation {} failed, will retry: {}", record.id, err);
            report.failed += 1;
            AuditAction::Failed
        };

        self.audit(
            AuditEvent::new(action, record.actor.clone(), err.to_string()).for_mutation(record),
        )
        .await;
        self.events.publish(SyncEvent::MutationFailed {
            id: record.id,
            entity_id: record.entity_id.clone(),
            status,
            message: err.to_string(),
        });

        Ok(if matches!(err, Error::Network(_)) {
            Flow::Stop
        } else {
            Flow::Continue
        })
    }

    async fn park_unresolved(
        &self,
        record: &MutationRecord,
        err: &Error,
        report: &mut SyncReport,
    ) -> Result<()> {
        self.queue
            .write()
            .await
            .mark_unresolved(record.id, err)
            .await?;
        report.unresolved += 1;
        self.audit(
            AuditEvent::new(
                AuditAction::Unresolved,
                record.actor.clone(),
                format!("Mutation parked for manual reconciliation: {}", err),
            )
            .for_mutation(record),
        )
        .await;
        self.events.publish(SyncEvent::MutationFailed {
            id: record.id,
            entity_id: record.entity_id.clone(),
            status: MutationStatus::Unresolved,
            message: err.to_string(),
        });
        Ok(())
    }

    async fn record_conflict(&self, report: ConflictReport) {
        self.events.publish(SyncEvent::ConflictResolved {
            report_id: report.id.clone(),
            entity_id: report.entity_id.clone(),
            resolution: report.resolution,
        });
        if let Err(e) = self.audit.write().await.record_conflict(report).await {
            warn!("Failed to persist audit trail: {}", e);
        }
    }

    /// Append to the audit trail. The event stays in memory if persisting
    /// fails and is written out with the next append.
    async fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.write().await.record(event).await {
            warn!("Failed to persist audit trail: {}", e);
        }
    }

    async fn refresh_status(&self) {
        let stats = self.queue.read().await.stats();
        let is_online = self.state.read().await.connectivity.is_online();
        self.events.set_status(QueueStatus {
            queued_count: stats.pending(),
            failed_count: stats.needs_attention(),
            is_online,
            draining: self.draining.load(Ordering::SeqCst),
        });
    }
}

fn conflict_error(record: &MutationRecord, current: &VersionedEntity) -> Error {
    Error::VersionConflict {
        entity_id: record.entity_id.to_string(),
        expected: record.base_version,
        current: Box::new(current.clone()),
    }
}
