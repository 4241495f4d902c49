//! Durable, ordered queue of pending local edits.
//!
//! The queue exclusively owns the ordered list of mutation records and the
//! optimistic per-entity view derived from them. Every mutating method
//! persists the whole queue to the durable store before returning, so a
//! restart resumes exactly where the previous process stopped.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use showsync_common::{
    ActorId, EntityId, EntityKind, Error, FieldMap, Operation, Result, VersionedEntity,
};
use showsync_storage::DurableStore;

use crate::mutation::{FailureInfo, MutationId, MutationRecord, MutationStatus};

const FORMAT_VERSION: u32 = 1;

/// Serialized form of the queue.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueSnapshot {
    format_version: u32,
    next_id: u64,
    records: Vec<MutationRecord>,
    #[serde(default)]
    confirmed: Vec<VersionedEntity>,
    #[serde(default)]
    views: Vec<VersionedEntity>,
}

/// Counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub sending: usize,
    pub failed_retryable: usize,
    pub dead_letter: usize,
    pub unresolved: usize,
}

impl QueueStats {
    /// Records still owed to the remote store.
    pub fn pending(&self) -> usize {
        self.queued + self.sending + self.failed_retryable
    }

    /// Records waiting for a user decision.
    pub fn needs_attention(&self) -> usize {
        self.dead_letter + self.unresolved
    }

    pub fn total(&self) -> usize {
        self.pending() + self.needs_attention()
    }
}

/// Iteration state for one drain cycle.
///
/// Yields records in FIFO order, at most once per cycle, and only the
/// oldest live record of each entity, so an entity's history is sent
/// strictly in enqueue order.
#[derive(Debug, Default)]
pub struct DrainCursor {
    attempted: HashSet<MutationId>,
}

impl DrainCursor {
    /// Next record to send, if any is eligible.
    pub fn next(&mut self, queue: &MutationQueue) -> Option<MutationRecord> {
        let record = queue.next_drainable(&self.attempted)?;
        self.attempted.insert(record.id);
        Some(record)
    }

    /// Number of records handed out so far.
    pub fn yielded(&self) -> usize {
        self.attempted.len()
    }
}

/// Durable mutation queue with optimistic entity views.
pub struct MutationQueue {
    store: Arc<dyn DurableStore>,
    records: Vec<MutationRecord>,
    /// Last snapshot confirmed by the remote store, per entity.
    confirmed: HashMap<EntityId, VersionedEntity>,
    /// Confirmed snapshot with every live record applied on top.
    views: HashMap<EntityId, VersionedEntity>,
    next_id: u64,
    max_cycles: u32,
}

impl MutationQueue {
    /// Open the queue, restoring any previously persisted state.
    ///
    /// Records found in flight are put back in line: the send may or may
    /// not have reached the remote, and the version check sorts it out.
    ///
    /// # Errors
    /// - Durable store read failure
    /// - Persisted queue that cannot be decoded (never silently dropped)
    pub async fn open(store: Arc<dyn DurableStore>, max_cycles: u32) -> Result<Self> {
        let snapshot = match store.load_queue().await? {
            Some(content) => serde_json::from_str::<QueueSnapshot>(&content).map_err(|e| {
                Error::Serialization(format!("Persisted mutation queue is unreadable: {}", e))
            })?,
            None => QueueSnapshot::default(),
        };

        if snapshot.format_version > FORMAT_VERSION {
            return Err(Error::Serialization(format!(
                "Mutation queue format {} is newer than supported {}",
                snapshot.format_version, FORMAT_VERSION
            )));
        }

        let mut records = snapshot.records;
        records.sort_by_key(|r| r.id);
        let mut in_flight = 0;
        for record in records.iter_mut() {
            if record.status == MutationStatus::Sending {
                record.reset_in_flight();
                in_flight += 1;
            }
        }

        let next_id = records
            .iter()
            .map(|r| r.id.0 + 1)
            .max()
            .unwrap_or(1)
            .max(snapshot.next_id)
            .max(1);

        let queue = Self {
            store,
            records,
            confirmed: snapshot.confirmed.into_iter().map(|e| (e.id.clone(), e)).collect(),
            views: snapshot.views.into_iter().map(|e| (e.id.clone(), e)).collect(),
            next_id,
            max_cycles: max_cycles.max(1),
        };

        if !queue.records.is_empty() {
            let stats = queue.stats();
            info!(
                "Mutation queue restored: {} pending, {} needing attention",
                stats.pending(),
                stats.needs_attention()
            );
        }
        if in_flight > 0 {
            warn!("{} mutations were in flight at shutdown, requeued", in_flight);
            queue.persist().await?;
        }

        Ok(queue)
    }

    /// Append an edit, persist it, and apply it to the optimistic view.
    ///
    /// # Errors
    /// - Empty payload for create/update, or kind mismatch with known entity
    /// - Durable store write failure (the append is rolled back)
    pub async fn enqueue(
        &mut self,
        operation: Operation,
        kind: EntityKind,
        entity_id: EntityId,
        payload: FieldMap,
        base_version: u64,
        actor: ActorId,
    ) -> Result<MutationRecord> {
        if operation != Operation::Delete && payload.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{} of {} carries no fields",
                operation, entity_id
            )));
        }
        if payload.keys().any(|k| k.is_empty()) {
            return Err(Error::InvalidInput("Field names cannot be empty".to_string()));
        }

        let previous_view = self.views.get(&entity_id).cloned();
        let current = previous_view
            .clone()
            .or_else(|| self.confirmed.get(&entity_id).cloned());

        if let Some(current) = &current {
            if current.kind != kind {
                return Err(Error::InvalidInput(format!(
                    "{} is a {} entity, not {}",
                    entity_id, current.kind, kind
                )));
            }
        }

        let base_snapshot: FieldMap = payload
            .keys()
            .map(|k| {
                let value = current
                    .as_ref()
                    .map(|e| e.field_or_null(k))
                    .unwrap_or(serde_json::Value::Null);
                (k.clone(), value)
            })
            .collect();

        let record = MutationRecord::new(
            MutationId(self.next_id),
            entity_id.clone(),
            kind,
            operation,
            payload,
            base_version,
            base_snapshot,
            actor,
        );

        let view = apply_to_view(current, &record);
        self.next_id += 1;
        self.records.push(record.clone());
        self.views.insert(entity_id.clone(), view);

        if let Err(e) = self.persist().await {
            self.records.pop();
            self.next_id -= 1;
            match previous_view {
                Some(view) => self.views.insert(entity_id, view),
                None => self.views.remove(&entity_id),
            };
            warn!("Failed to persist mutation {}: {}", record.id, e);
            return Err(e);
        }

        debug!(
            "Queued mutation {} ({} {} base v{})",
            record.id, record.operation, record.entity_id, record.base_version
        );
        Ok(record)
    }

    /// Start a drain cycle.
    pub fn drain(&self) -> DrainCursor {
        DrainCursor::default()
    }

    fn next_drainable(&self, attempted: &HashSet<MutationId>) -> Option<MutationRecord> {
        let mut seen: HashSet<&EntityId> = HashSet::new();
        for record in &self.records {
            // Dead letters no longer hold back later edits of their entity
            if record.status == MutationStatus::DeadLetter {
                continue;
            }
            if !seen.insert(&record.entity_id) {
                continue;
            }
            if record.is_drainable() && !attempted.contains(&record.id) {
                return Some(record.clone());
            }
        }
        None
    }

    /// Mark a record as in flight.
    pub async fn mark_sending(&mut self, id: MutationId) -> Result<MutationRecord> {
        self.update_record(id, |record| {
            record.mark_sending()?;
            Ok(record.clone())
        })
        .await
    }

    /// Remove a record the remote accepted and adopt the confirmed snapshot.
    ///
    /// Later queued edits of the same entity that were made on top of this
    /// one are rebased onto the new version when this write was the only
    /// change to the remote copy, or when it was our own merge and none of
    /// the fields they touch moved underneath them.
    pub async fn mark_succeeded(
        &mut self,
        id: MutationId,
        confirmed: VersionedEntity,
    ) -> Result<MutationRecord> {
        let index = self.index_of(id)?;
        if confirmed.id != self.records[index].entity_id {
            return Err(Error::Invariant(format!(
                "Mutation {} confirmed with snapshot of {}",
                id, confirmed.id
            )));
        }
        self.records[index].mark_succeeded()?;
        let record = self.records.remove(index);

        if confirmed.modified_by == record.actor {
            let sole_writer = confirmed.version == record.base_version + 1;
            for later in self
                .records
                .iter_mut()
                .filter(|r| r.entity_id == record.entity_id && r.is_pending())
                .filter(|r| r.base_version == record.base_version)
                .filter(|r| sole_writer || fields_unchanged(r, &confirmed))
            {
                debug!(
                    "Rebasing mutation {} from v{} to v{}",
                    later.id, later.base_version, confirmed.version
                );
                later.base_version = confirmed.version;
            }
        }

        self.adopt_confirmed(confirmed);
        self.rebuild_view(&record.entity_id);
        self.persist().await?;
        Ok(record)
    }

    /// Record a failed send. Returns the record's new status.
    pub async fn mark_failed(
        &mut self,
        id: MutationId,
        error: &Error,
        retryable: bool,
    ) -> Result<MutationStatus> {
        let max_cycles = self.max_cycles;
        self.update_record(id, |record| {
            record.mark_failed(FailureInfo::from_error(error), retryable, max_cycles)
        })
        .await
    }

    /// Park a record whose conflict needs manual reconciliation.
    pub async fn mark_unresolved(&mut self, id: MutationId, error: &Error) -> Result<()> {
        self.update_record(id, |record| {
            record.mark_unresolved(FailureInfo::from_error(error))
        })
        .await
    }

    /// Records waiting for a user decision (dead-letter or unresolved).
    pub fn get_failed_operations(&self) -> Vec<MutationRecord> {
        self.records
            .iter()
            .filter(|r| r.needs_attention())
            .cloned()
            .collect()
    }

    /// Put a dead-letter or unresolved record back in line.
    pub async fn retry_failed_operation(&mut self, id: MutationId) -> Result<MutationRecord> {
        let record = self
            .update_record(id, |record| {
                record.requeue()?;
                Ok(record.clone())
            })
            .await?;
        info!("Mutation {} requeued for retry", id);
        Ok(record)
    }

    /// Drop a record that has not been sent yet.
    pub async fn cancel(&mut self, id: MutationId) -> Result<MutationRecord> {
        let index = self.index_of(id)?;
        if self.records[index].status != MutationStatus::Queued {
            return Err(Error::Queue(format!(
                "Mutation {} is {} and can no longer be cancelled",
                id, self.records[index].status
            )));
        }
        self.remove_at(index).await
    }

    /// Drop a dead-letter or unresolved record for good.
    pub async fn discard(&mut self, id: MutationId) -> Result<MutationRecord> {
        let index = self.index_of(id)?;
        if !self.records[index].needs_attention() {
            return Err(Error::Queue(format!(
                "Mutation {} is {}; only dead-letter or unresolved mutations can be discarded",
                id, self.records[index].status
            )));
        }
        self.remove_at(index).await
    }

    /// Drop every record and optimistic view. Returns the dropped records.
    pub async fn clear(&mut self) -> Result<Vec<MutationRecord>> {
        let dropped = std::mem::take(&mut self.records);
        let ids: Vec<EntityId> = self.views.keys().cloned().collect();
        for id in ids {
            self.rebuild_view(&id);
        }
        self.persist().await?;
        Ok(dropped)
    }

    /// Fold a snapshot read from the remote into the confirmed state.
    pub async fn observe_remote(&mut self, entity: VersionedEntity) -> Result<()> {
        let id = entity.id.clone();
        if self.adopt_confirmed(entity) {
            self.rebuild_view(&id);
            self.persist().await?;
        }
        Ok(())
    }

    /// Optimistic view of an entity: confirmed state plus live local edits.
    pub fn view(&self, id: &EntityId) -> Option<VersionedEntity> {
        self.views.get(id).cloned()
    }

    /// Last remote-confirmed snapshot of an entity.
    pub fn confirmed(&self, id: &EntityId) -> Option<VersionedEntity> {
        self.confirmed.get(id).cloned()
    }

    /// Whether any live record targets the entity.
    pub fn has_live_mutations(&self, id: &EntityId) -> bool {
        self.records.iter().any(|r| &r.entity_id == id)
    }

    pub fn get(&self, id: MutationId) -> Option<&MutationRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// All live records in FIFO order.
    pub fn records(&self) -> &[MutationRecord] {
        &self.records
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for record in &self.records {
            match record.status {
                MutationStatus::Queued => stats.queued += 1,
                MutationStatus::Sending => stats.sending += 1,
                MutationStatus::FailedRetryable => stats.failed_retryable += 1,
                MutationStatus::DeadLetter => stats.dead_letter += 1,
                MutationStatus::Unresolved => stats.unresolved += 1,
                MutationStatus::Succeeded => {}
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    async fn remove_at(&mut self, index: usize) -> Result<MutationRecord> {
        let record = self.records.remove(index);
        self.rebuild_view(&record.entity_id);
        if let Err(e) = self.persist().await {
            self.records.insert(index, record);
            let entity_id = self.records[index].entity_id.clone();
            self.rebuild_view(&entity_id);
            return Err(e);
        }
        Ok(record)
    }

    /// Keep the newer of the stored and offered snapshots. Returns whether
    /// the offered one was adopted.
    fn adopt_confirmed(&mut self, entity: VersionedEntity) -> bool {
        match self.confirmed.get(&entity.id) {
            Some(existing) if existing.version > entity.version => {
                warn!(
                    "Ignoring stale snapshot of {} (v{} < v{})",
                    entity.id, entity.version, existing.version
                );
                false
            }
            _ => {
                self.confirmed.insert(entity.id.clone(), entity);
                true
            }
        }
    }

    fn rebuild_view(&mut self, id: &EntityId) {
        let mut view = self.confirmed.get(id).cloned();
        for record in self.records.iter().filter(|r| &r.entity_id == id) {
            view = Some(apply_to_view(view, record));
        }
        match view {
            Some(view) => self.views.insert(id.clone(), view),
            None => self.views.remove(id),
        };
    }

    fn index_of(&self, id: MutationId) -> Result<usize> {
        self.records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(format!("Mutation not found: {}", id)))
    }

    /// Change one record and persist, putting the record back as it was if
    /// either step fails.
    async fn update_record<T>(
        &mut self,
        id: MutationId,
        change: impl FnOnce(&mut MutationRecord) -> Result<T>,
    ) -> Result<T> {
        let index = self.index_of(id)?;
        let previous = self.records[index].clone();
        let outcome = match change(&mut self.records[index]) {
            Ok(value) => self.persist().await.map(|()| value),
            Err(e) => Err(e),
        };
        if outcome.is_err() {
            self.records[index] = previous;
        }
        outcome
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = QueueSnapshot {
            format_version: FORMAT_VERSION,
            next_id: self.next_id,
            records: self.records.clone(),
            confirmed: self.confirmed.values().cloned().collect(),
            views: self.views.values().cloned().collect(),
        };
        let json = serde_json::to_string(&snapshot)?;
        self.store.persist_queue(&json).await
    }
}

/// Whether every field `record` touches still holds the value it was
/// computed against.
fn fields_unchanged(record: &MutationRecord, confirmed: &VersionedEntity) -> bool {
    !confirmed.deleted
        && record
            .base_snapshot
            .iter()
            .all(|(field, value)| confirmed.field_or_null(field) == *value)
}

/// Apply a record's edit to an entity view. The view keeps its confirmed
/// version; only the remote store advances versions.
fn apply_to_view(view: Option<VersionedEntity>, record: &MutationRecord) -> VersionedEntity {
    let mut view = view.unwrap_or_else(|| {
        VersionedEntity::new(record.entity_id.clone(), record.kind)
            .with_version(record.base_version)
    });
    match record.operation {
        Operation::Create => {
            view.deleted = false;
            view.apply_patch(&record.payload);
        }
        Operation::Update => view.apply_patch(&record.payload),
        Operation::Delete => view.deleted = true,
    }
    view.modified_at = record.created_at;
    view.modified_by = record.actor.clone();
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use showsync_storage::MemoryDurableStore;

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    fn fields(pairs: &[(&str, serde_json::Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn open_queue(store: Arc<MemoryDurableStore>) -> MutationQueue {
        MutationQueue::open(store, 3).await.unwrap()
    }

    async fn update(queue: &mut MutationQueue, entity: &str, field: &str, value: i64) -> MutationRecord {
        let base = queue.view(&id(entity)).map(|v| v.version).unwrap_or(0);
        queue
            .enqueue(
                Operation::Update,
                EntityKind::Show,
                id(entity),
                fields(&[(field, json!(value))]),
                base,
                ActorId::new("me"),
            )
            .await
            .unwrap()
    }

    fn confirmed(entity: &str, version: u64, pairs: &[(&str, serde_json::Value)]) -> VersionedEntity {
        let mut entity = VersionedEntity::new(id(entity), EntityKind::Show)
            .with_version(version)
            .with_fields(fields(pairs));
        entity.modified_by = ActorId::new("me");
        entity
    }

    #[tokio::test]
    async fn test_enqueue_persists_and_applies_optimistically() {
        let store = Arc::new(MemoryDurableStore::new());
        let mut queue = open_queue(store.clone()).await;
        queue
            .observe_remote(confirmed("show-1", 2, &[("fee", json!(100))]))
            .await
            .unwrap();

        let record = update(&mut queue, "show-1", "fee", 500).await;
        assert_eq!(record.base_version, 2);
        assert_eq!(record.base_snapshot.get("fee"), Some(&json!(100)));

        let view = queue.view(&id("show-1")).unwrap();
        assert_eq!(view.field("fee"), Some(&json!(500)));
        assert_eq!(view.version, 2);
        assert!(store.load_queue().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_enqueue_rolls_back_when_persist_fails() {
        let store = Arc::new(MemoryDurableStore::new());
        let mut queue = open_queue(store.clone()).await;
        store.set_fail_writes(true);

        let result = queue
            .enqueue(
                Operation::Create,
                EntityKind::Show,
                id("show-1"),
                fields(&[("city", json!("Rome"))]),
                0,
                ActorId::new("me"),
            )
            .await;

        assert!(result.is_err());
        assert!(queue.is_empty());
        assert!(queue.view(&id("show-1")).is_none());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_update() {
        let mut queue = open_queue(Arc::new(MemoryDurableStore::new())).await;
        let result = queue
            .enqueue(
                Operation::Update,
                EntityKind::Show,
                id("show-1"),
                FieldMap::new(),
                0,
                ActorId::new("me"),
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_drain_is_fifo_and_one_per_entity() {
        let mut queue = open_queue(Arc::new(MemoryDurableStore::new())).await;
        let a1 = update(&mut queue, "show-a", "fee", 1).await;
        let b1 = update(&mut queue, "show-b", "fee", 1).await;
        let a2 = update(&mut queue, "show-a", "fee", 2).await;

        let mut cursor = queue.drain();
        assert_eq!(cursor.next(&queue).map(|r| r.id), Some(a1.id));
        assert_eq!(cursor.next(&queue).map(|r| r.id), Some(b1.id));
        // a2 waits behind a1, which was handed out but not completed
        assert!(cursor.next(&queue).is_none());

        queue.mark_sending(a1.id).await.unwrap();
        queue
            .mark_succeeded(a1.id, confirmed("show-a", 1, &[("fee", json!(1))]))
            .await
            .unwrap();
        assert_eq!(cursor.next(&queue).map(|r| r.id), Some(a2.id));
    }

    #[tokio::test]
    async fn test_failed_head_blocks_entity_for_the_cycle() {
        let mut queue = open_queue(Arc::new(MemoryDurableStore::new())).await;
        let first = update(&mut queue, "show-a", "fee", 1).await;
        update(&mut queue, "show-a", "fee", 2).await;

        let mut cursor = queue.drain();
        let head = cursor.next(&queue).unwrap();
        assert_eq!(head.id, first.id);
        queue.mark_sending(head.id).await.unwrap();
        let status = queue
            .mark_failed(head.id, &Error::Network("down".into()), true)
            .await
            .unwrap();
        assert_eq!(status, MutationStatus::FailedRetryable);
        assert!(cursor.next(&queue).is_none());

        // Next cycle retries the head first
        let mut cursor = queue.drain();
        assert_eq!(cursor.next(&queue).map(|r| r.id), Some(first.id));
    }

    #[tokio::test]
    async fn test_dead_letter_unblocks_following_mutation() {
        let mut queue = open_queue(Arc::new(MemoryDurableStore::new())).await;
        let first = update(&mut queue, "show-a", "fee", 1).await;
        let second = update(&mut queue, "show-a", "fee", 2).await;

        queue.mark_sending(first.id).await.unwrap();
        queue
            .mark_failed(first.id, &Error::NotPermitted("no".into()), false)
            .await
            .unwrap();

        let mut cursor = queue.drain();
        assert_eq!(cursor.next(&queue).map(|r| r.id), Some(second.id));
        assert_eq!(queue.get_failed_operations().len(), 1);
    }

    #[tokio::test]
    async fn test_success_rebases_chained_edit() {
        let mut queue = open_queue(Arc::new(MemoryDurableStore::new())).await;
        queue
            .observe_remote(confirmed("show-1", 2, &[("fee", json!(100))]))
            .await
            .unwrap();
        let first = update(&mut queue, "show-1", "fee", 500).await;
        let second = update(&mut queue, "show-1", "city", 7).await;
        assert_eq!(second.base_version, 2);

        queue.mark_sending(first.id).await.unwrap();
        queue
            .mark_succeeded(first.id, confirmed("show-1", 3, &[("fee", json!(500))]))
            .await
            .unwrap();

        assert_eq!(queue.get(second.id).unwrap().base_version, 3);
        let view = queue.view(&id("show-1")).unwrap();
        assert_eq!(view.version, 3);
        assert_eq!(view.field("city"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn test_no_rebase_when_remote_moved_further() {
        let mut queue = open_queue(Arc::new(MemoryDurableStore::new())).await;
        queue
            .observe_remote(confirmed("show-1", 2, &[]))
            .await
            .unwrap();
        let first = update(&mut queue, "show-1", "fee", 500).await;
        let second = update(&mut queue, "show-1", "fee", 600).await;

        // Another writer's fee won the merge
        queue.mark_sending(first.id).await.unwrap();
        queue
            .mark_succeeded(first.id, confirmed("show-1", 4, &[("fee", json!(700))]))
            .await
            .unwrap();

        assert_eq!(queue.get(second.id).unwrap().base_version, 2);
    }

    #[tokio::test]
    async fn test_own_merge_rebases_untouched_fields_only() {
        let mut queue = open_queue(Arc::new(MemoryDurableStore::new())).await;
        queue
            .observe_remote(confirmed("show-1", 2, &[("fee", json!(100)), ("venue", json!(1))]))
            .await
            .unwrap();
        let first = update(&mut queue, "show-1", "fee", 500).await;
        let city = update(&mut queue, "show-1", "city", 7).await;
        let venue = update(&mut queue, "show-1", "venue", 2).await;

        // Merged write at v4 absorbed a remote venue change made at v3
        queue.mark_sending(first.id).await.unwrap();
        queue
            .mark_succeeded(
                first.id,
                confirmed("show-1", 4, &[("fee", json!(500)), ("venue", json!(9))]),
            )
            .await
            .unwrap();

        assert_eq!(queue.get(city.id).unwrap().base_version, 4);
        assert_eq!(queue.get(venue.id).unwrap().base_version, 2);
    }

    #[tokio::test]
    async fn test_own_merge_does_not_rebase_when_written_by_others() {
        let mut queue = open_queue(Arc::new(MemoryDurableStore::new())).await;
        queue
            .observe_remote(confirmed("show-1", 2, &[]))
            .await
            .unwrap();
        let first = update(&mut queue, "show-1", "fee", 500).await;
        let second = update(&mut queue, "show-1", "city", 7).await;

        let mut snapshot = confirmed("show-1", 4, &[("fee", json!(500))]);
        snapshot.modified_by = ActorId::new("someone-else");
        queue.mark_sending(first.id).await.unwrap();
        queue.mark_succeeded(first.id, snapshot).await.unwrap();

        assert_eq!(queue.get(second.id).unwrap().base_version, 2);
    }

    #[tokio::test]
    async fn test_mark_sending_rolls_back_when_persist_fails() {
        let store = Arc::new(MemoryDurableStore::new());
        let mut queue = open_queue(store.clone()).await;
        let record = update(&mut queue, "show-1", "fee", 500).await;

        store.set_fail_writes(true);
        assert!(queue.mark_sending(record.id).await.is_err());
        let restored = queue.get(record.id).unwrap();
        assert_eq!(restored.status, MutationStatus::Queued);
        assert_eq!(restored.attempts, record.attempts);

        // Still eligible once the disk recovers
        store.set_fail_writes(false);
        let mut cursor = queue.drain();
        assert_eq!(cursor.next(&queue).map(|r| r.id), Some(record.id));
        queue.mark_sending(record.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_failed_rolls_back_when_persist_fails() {
        let store = Arc::new(MemoryDurableStore::new());
        let mut queue = open_queue(store.clone()).await;
        let record = update(&mut queue, "show-1", "fee", 500).await;
        queue.mark_sending(record.id).await.unwrap();

        store.set_fail_writes(true);
        let result = queue
            .mark_failed(record.id, &Error::NotPermitted("no".into()), false)
            .await;
        assert!(result.is_err());
        assert_eq!(queue.get(record.id).unwrap().status, MutationStatus::Sending);
        assert!(queue.get_failed_operations().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_only_while_queued() {
        let mut queue = open_queue(Arc::new(MemoryDurableStore::new())).await;
        queue
            .observe_remote(confirmed("show-1", 1, &[("fee", json!(100))]))
            .await
            .unwrap();
        let record = update(&mut queue, "show-1", "fee", 500).await;

        queue.mark_sending(record.id).await.unwrap();
        assert!(matches!(queue.cancel(record.id).await, Err(Error::Queue(_))));

        let other = update(&mut queue, "show-1", "fee", 900).await;
        queue.cancel(other.id).await.unwrap();
        // View falls back to confirmed + the remaining in-flight edit
        assert_eq!(queue.view(&id("show-1")).unwrap().field("fee"), Some(&json!(500)));
    }

    #[tokio::test]
    async fn test_discard_rebuilds_view() {
        let mut queue = open_queue(Arc::new(MemoryDurableStore::new())).await;
        queue
            .observe_remote(confirmed("show-1", 1, &[("fee", json!(100))]))
            .await
            .unwrap();
        let record = update(&mut queue, "show-1", "fee", 500).await;

        assert!(queue.discard(record.id).await.is_err());

        queue.mark_sending(record.id).await.unwrap();
        queue
            .mark_failed(record.id, &Error::InvalidInput("fee".into()), false)
            .await
            .unwrap();
        queue.discard(record.id).await.unwrap();

        assert!(queue.is_empty());
        assert_eq!(queue.view(&id("show-1")).unwrap().field("fee"), Some(&json!(100)));
    }

    #[tokio::test]
    async fn test_retry_failed_operation() {
        let mut queue = open_queue(Arc::new(MemoryDurableStore::new())).await;
        let record = update(&mut queue, "show-1", "fee", 500).await;
        queue.mark_sending(record.id).await.unwrap();
        queue
            .mark_failed(record.id, &Error::NotFound("gone".into()), false)
            .await
            .unwrap();

        let retried = queue.retry_failed_operation(record.id).await.unwrap();
        assert_eq!(retried.status, MutationStatus::Queued);
        assert!(queue.get_failed_operations().is_empty());
    }

    #[tokio::test]
    async fn test_restart_resumes_and_requeues_in_flight() {
        let store = Arc::new(MemoryDurableStore::new());
        let (sent, waiting) = {
            let mut queue = open_queue(store.clone()).await;
            let sent = update(&mut queue, "show-1", "fee", 500).await;
            let waiting = update(&mut queue, "show-2", "fee", 700).await;
            queue.mark_sending(sent.id).await.unwrap();
            (sent, waiting)
        };

        let mut queue = open_queue(store).await;
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get(sent.id).unwrap().status, MutationStatus::Queued);
        assert_eq!(queue.view(&id("show-2")).unwrap().field("fee"), Some(&json!(700)));

        // Ids keep growing after the restart
        let next = update(&mut queue, "show-3", "fee", 1).await;
        assert!(next.id > waiting.id);
    }

    #[tokio::test]
    async fn test_unreadable_queue_is_an_error() {
        let store = Arc::new(MemoryDurableStore::new());
        store.persist_queue("{not json").await.unwrap();
        assert!(MutationQueue::open(store, 3).await.is_err());
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let mut queue = open_queue(Arc::new(MemoryDurableStore::new())).await;
        let a = update(&mut queue, "show-1", "fee", 1).await;
        update(&mut queue, "show-2", "fee", 2).await;
        queue.mark_sending(a.id).await.unwrap();
        queue
            .mark_failed(a.id, &Error::NotPermitted("x".into()), false)
            .await
            .unwrap();

        let stats = queue.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.total(), 2);

        let dropped = queue.clear().await.unwrap();
        assert_eq!(dropped.len(), 2);
        assert!(queue.view(&id("show-1")).is_none());
    }
}
