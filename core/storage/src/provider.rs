//! Store trait definitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use showsync_common::{
    ActorId, EntityId, EntityKind, Error, FieldMap, Operation, Result, VersionedEntity,
};

/// Durable-store key holding the serialized mutation queue.
pub const QUEUE_KEY: &str = "mutation_queue";
/// Durable-store key holding the serialized audit trail.
pub const AUDIT_KEY: &str = "audit_log";

/// A conditional write against the remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub operation: Operation,
    pub payload: FieldMap,
    /// Version the writer believes the remote copy is at.
    pub expected_version: u64,
    pub actor: ActorId,
    /// Client wall-clock time of the edit; becomes the entity's `modified_at`.
    pub modified_at: DateTime<Utc>,
}

/// Remote document store with optimistic concurrency.
///
/// Implementations must handle their own authentication and transport.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the store name (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Read the current copy of an entity.
    ///
    /// # Errors
    /// - Entity not found
    /// - Network/I/O errors
    async fn read(&self, id: &EntityId) -> Result<VersionedEntity>;

    /// Apply a write if the remote copy is still at `expected_version`.
    ///
    /// # Postconditions
    /// - On success the returned snapshot has `version == expected_version + 1`
    ///
    /// # Errors
    /// - `Error::VersionConflict` carrying the current remote snapshot
    /// - Validation, permission, not-found errors (permanent)
    /// - Network/timeout/rate-limit errors (transient)
    async fn write(&self, request: &WriteRequest) -> Result<VersionedEntity>;
}

/// Device-local durable blob storage.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Atomically replace the blob stored under `key`.
    async fn write_blob(&self, key: &str, data: &str) -> Result<()>;

    /// Read the blob stored under `key`, if any.
    async fn read_blob(&self, key: &str) -> Result<Option<String>>;

    /// Remove the blob stored under `key`. Missing keys are not an error.
    async fn remove_blob(&self, key: &str) -> Result<()>;

    /// Persist the serialized mutation queue.
    async fn persist_queue(&self, serialized: &str) -> Result<()> {
        self.write_blob(QUEUE_KEY, serialized).await
    }

    /// Load the serialized mutation queue, if one was persisted.
    async fn load_queue(&self) -> Result<Option<String>> {
        self.read_blob(QUEUE_KEY).await
    }
}

/// Compare-and-set shared by the bundled remote stores.
///
/// Given the stored copy (if any) and a write request, produce the new
/// copy or the error the remote would report.
pub fn compare_and_set(
    existing: Option<&VersionedEntity>,
    request: &WriteRequest,
) -> Result<VersionedEntity> {
    if request.payload.keys().any(|k| k.is_empty()) {
        return Err(Error::InvalidInput("Field names cannot be empty".to_string()));
    }

    let conflict = |current: &VersionedEntity| Error::VersionConflict {
        entity_id: request.entity_id.to_string(),
        expected: request.expected_version,
        current: Box::new(current.clone()),
    };

    match (existing, request.operation) {
        (None, Operation::Create) => {
            if request.expected_version != 0 {
                return Err(Error::InvalidInput(format!(
                    "Create of {} must expect version 0",
                    request.entity_id
                )));
            }
            Ok(VersionedEntity {
                id: request.entity_id.clone(),
                kind: request.kind,
                fields: request.payload.clone(),
                version: 1,
                modified_at: request.modified_at,
                modified_by: request.actor.clone(),
                deleted: false,
            })
        }
        (None, _) => Err(Error::NotFound(format!("Entity not found: {}", request.entity_id))),
        (Some(current), _) if current.kind != request.kind => Err(Error::InvalidInput(format!(
            "{} is a {} entity, not {}",
            request.entity_id, current.kind, request.kind
        ))),
        (Some(current), Operation::Create) => Err(conflict(current)),
        (Some(current), _) if current.version != request.expected_version => {
            Err(conflict(current))
        }
        (Some(current), _) if current.deleted => Err(Error::NotFound(format!(
            "Entity was deleted: {}",
            request.entity_id
        ))),
        (Some(current), operation) => {
            let mut next = current.clone();
            if operation == Operation::Delete {
                next.deleted = true;
            } else {
                next.apply_patch(&request.payload);
            }
            next.version = current.version + 1;
            // Never move the entity's clock backwards, a merged write may
            // carry an edit older than the remote change it absorbed
            next.modified_at = request.modified_at.max(current.modified_at);
            next.modified_by = request.actor.clone();
            Ok(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(operation: Operation, expected_version: u64) -> WriteRequest {
        WriteRequest {
            entity_id: EntityId::new("show-1").unwrap(),
            kind: EntityKind::Show,
            operation,
            payload: FieldMap::from([("fee".to_string(), json!(500))]),
            expected_version,
            actor: ActorId::new("client-a"),
            modified_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_starts_at_version_one() {
        let created = compare_and_set(None, &request(Operation::Create, 0)).unwrap();
        assert_eq!(created.version, 1);
        assert_eq!(created.field("fee"), Some(&json!(500)));
        assert_eq!(created.modified_by.as_str(), "client-a");
    }

    #[test]
    fn test_update_keeps_newer_modified_at() {
        let mut current = compare_and_set(None, &request(Operation::Create, 0)).unwrap();
        let later = Utc::now() + chrono::Duration::minutes(5);
        current.modified_at = later;

        let updated = compare_and_set(Some(&current), &request(Operation::Update, 1)).unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.modified_at, later);
    }

    #[test]
    fn test_update_requires_matching_version() {
        let current = compare_and_set(None, &request(Operation::Create, 0)).unwrap();

        let err = compare_and_set(Some(&current), &request(Operation::Update, 0)).unwrap_err();
        assert_eq!(err.conflict_snapshot().map(|e| e.version), Some(1));

        let updated = compare_and_set(Some(&current), &request(Operation::Update, 1)).unwrap();
        assert_eq!(updated.version, 2);
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let current = compare_and_set(None, &request(Operation::Create, 0)).unwrap();
        let deleted = compare_and_set(Some(&current), &request(Operation::Delete, 1)).unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.version, 2);

        let err = compare_and_set(Some(&deleted), &request(Operation::Update, 2)).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_update_missing_entity_is_not_found() {
        let err = compare_and_set(None, &request(Operation::Update, 0)).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_create_over_existing_conflicts() {
        let current = compare_and_set(None, &request(Operation::Create, 0)).unwrap();
        let err = compare_and_set(Some(&current), &request(Operation::Create, 0)).unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));
    }
}
