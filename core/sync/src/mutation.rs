//! Queued mutation records and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use showsync_common::{
    ActorId, EntityId, EntityKind, Error, ErrorClass, FieldMap, Operation, Result,
};

/// Queue-assigned identifier. Ids grow with generation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MutationId(pub u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MutationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(MutationId)
            .map_err(|_| Error::InvalidInput(format!("Invalid mutation id: {}", s)))
    }
}

/// Lifecycle state of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationStatus {
    /// Waiting for the next drain.
    Queued,
    /// A remote write is in flight.
    Sending,
    /// Accepted by the remote store.
    Succeeded,
    /// Last send failed transiently; retried on the next drain.
    FailedRetryable,
    /// Removed from automatic retry, awaiting manual retry or discard.
    DeadLetter,
    /// Conflict could not be resolved automatically.
    Unresolved,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Queued => "queued",
            MutationStatus::Sending => "sending",
            MutationStatus::Succeeded => "succeeded",
            MutationStatus::FailedRetryable => "failed-retryable",
            MutationStatus::DeadLetter => "dead-letter",
            MutationStatus::Unresolved => "unresolved",
        }
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error attached to a failed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl FailureInfo {
    pub fn from_error(err: &Error) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
            at: Utc::now(),
        }
    }
}

/// One queued intent to change an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    pub id: MutationId,
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub operation: Operation,
    pub payload: FieldMap,
    /// Remote version the edit was computed against.
    pub base_version: u64,
    /// Local values of the touched fields just before the edit.
    #[serde(default)]
    pub base_snapshot: FieldMap,
    pub status: MutationStatus,
    /// Send attempts across all drain cycles.
    pub attempts: u32,
    /// Drain cycles that ended in a retryable failure since the last manual retry.
    #[serde(default)]
    pub cycles: u32,
    pub created_at: DateTime<Utc>,
    pub actor: ActorId,
    #[serde(default)]
    pub last_error: Option<FailureInfo>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl MutationRecord {
    /// Create a freshly queued record.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: MutationId,
        entity_id: EntityId,
        kind: EntityKind,
        operation: Operation,
        payload: FieldMap,
        base_version: u64,
        base_snapshot: FieldMap,
        actor: ActorId,
    ) -> Self {
        Self {
            id,
            entity_id,
            kind,
            operation,
            payload,
            base_version,
            base_snapshot,
            status: MutationStatus::Queued,
            attempts: 0,
            cycles: 0,
            created_at: Utc::now(),
            actor,
            last_error: None,
            last_attempt_at: None,
        }
    }

    /// Still owed to the remote store.
    pub fn is_pending(&self) -> bool {
        matches!(
            self.status,
            MutationStatus::Queued | MutationStatus::Sending | MutationStatus::FailedRetryable
        )
    }

    /// Eligible to be picked up by a drain.
    pub fn is_drainable(&self) -> bool {
        matches!(
            self.status,
            MutationStatus::Queued | MutationStatus::FailedRetryable
        )
    }

    /// Waiting for the user to retry or discard.
    pub fn needs_attention(&self) -> bool {
        matches!(
            self.status,
            MutationStatus::DeadLetter | MutationStatus::Unresolved
        )
    }

    /// Mark as in flight.
    pub fn mark_sending(&mut self) -> Result<()> {
        if !self.is_drainable() {
            return Err(self.bad_transition(MutationStatus::Sending));
        }
        self.status = MutationStatus::Sending;
        self.attempts += 1;
        self.last_attempt_at = Some(Utc::now());
        Ok(())
    }

    /// Mark as accepted by the remote.
    pub fn mark_succeeded(&mut self) -> Result<()> {
        if self.status != MutationStatus::Sending {
            return Err(self.bad_transition(MutationStatus::Succeeded));
        }
        self.status = MutationStatus::Succeeded;
        self.last_error = None;
        Ok(())
    }

    /// Record a failed send. Retryable failures count against
    /// `max_cycles`; reaching it, or any permanent failure, dead-letters
    /// the record. Returns the new status.
    pub fn mark_failed(
        &mut self,
        failure: FailureInfo,
        retryable: bool,
        max_cycles: u32,
    ) -> Result<MutationStatus> {
        if self.status != MutationStatus::Sending {
            return Err(self.bad_transition(MutationStatus::FailedRetryable));
        }
        self.last_error = Some(failure);
        self.status = if retryable {
            self.cycles += 1;
            if self.cycles >= max_cycles {
                MutationStatus::DeadLetter
            } else {
                MutationStatus::FailedRetryable
            }
        } else {
            MutationStatus::DeadLetter
        };
        Ok(self.status)
    }

    /// Park the record after a conflict that needs a human.
    pub fn mark_unresolved(&mut self, failure: FailureInfo) -> Result<()> {
        if self.status != MutationStatus::Sending {
            return Err(self.bad_transition(MutationStatus::Unresolved));
        }
        self.status = MutationStatus::Unresolved;
        self.last_error = Some(failure);
        Ok(())
    }

    /// Put a parked record back in line with its retry-cycle count reset.
    pub fn requeue(&mut self) -> Result<()> {
        if !self.needs_attention() {
            return Err(self.bad_transition(MutationStatus::Queued));
        }
        self.status = MutationStatus::Queued;
        self.cycles = 0;
        Ok(())
    }

    /// Put an in-flight record back in line, e.g. after a restart.
    pub(crate) fn reset_in_flight(&mut self) {
        if self.status == MutationStatus::Sending {
            self.status = MutationStatus::Queued;
        }
    }

    fn bad_transition(&self, to: MutationStatus) -> Error {
        Error::Queue(format!(
            "Mutation {} cannot move from {} to {}",
            self.id, self.status, to
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> MutationRecord {
        MutationRecord::new(
            MutationId(1),
            EntityId::new("show-1").unwrap(),
            EntityKind::Show,
            Operation::Update,
            FieldMap::from([("fee".to_string(), json!(500))]),
            2,
            FieldMap::from([("fee".to_string(), json!(100))]),
            ActorId::new("client-a"),
        )
    }

    fn failure() -> FailureInfo {
        FailureInfo::from_error(&Error::Network("down".into()))
    }

    #[test]
    fn test_record_creation() {
        let rec = record();
        assert_eq!(rec.status, MutationStatus::Queued);
        assert_eq!(rec.attempts, 0);
        assert!(rec.is_pending());
        assert!(rec.is_drainable());
    }

    #[test]
    fn test_send_then_succeed() {
        let mut rec = record();
        rec.mark_sending().unwrap();
        assert_eq!(rec.attempts, 1);
        assert!(rec.last_attempt_at.is_some());
        assert!(!rec.is_drainable());

        rec.mark_succeeded().unwrap();
        assert_eq!(rec.status, MutationStatus::Succeeded);
        assert!(!rec.is_pending());
    }

    #[test]
    fn test_retryable_failures_reach_dead_letter() {
        let mut rec = record();
        for cycle in 1..=3 {
            rec.mark_sending().unwrap();
            let status = rec.mark_failed(failure(), true, 3).unwrap();
            if cycle < 3 {
                assert_eq!(status, MutationStatus::FailedRetryable);
            } else {
                assert_eq!(status, MutationStatus::DeadLetter);
            }
        }
        assert_eq!(rec.attempts, 3);
        assert!(rec.needs_attention());
        assert!(rec.mark_sending().is_err());
    }

    #[test]
    fn test_permanent_failure_dead_letters_immediately() {
        let mut rec = record();
        rec.mark_sending().unwrap();
        let err = Error::NotPermitted("read-only tour".into());
        let status = rec.mark_failed(FailureInfo::from_error(&err), false, 5).unwrap();
        assert_eq!(status, MutationStatus::DeadLetter);
        assert_eq!(rec.last_error.as_ref().map(|f| f.class), Some(ErrorClass::Permanent));
    }

    #[test]
    fn test_requeue_resets_cycles() {
        let mut rec = record();
        rec.mark_sending().unwrap();
        rec.mark_failed(failure(), true, 1).unwrap();
        assert_eq!(rec.status, MutationStatus::DeadLetter);

        rec.requeue().unwrap();
        assert_eq!(rec.status, MutationStatus::Queued);
        assert_eq!(rec.cycles, 0);
        assert_eq!(rec.attempts, 1);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut rec = record();
        assert!(rec.mark_succeeded().is_err());
        assert!(rec.requeue().is_err());
        assert!(rec.mark_unresolved(failure()).is_err());
    }

    #[test]
    fn test_mutation_id_parse() {
        assert_eq!("42".parse::<MutationId>().unwrap(), MutationId(42));
        assert!("abc".parse::<MutationId>().is_err());
    }

    #[test]
    fn test_record_serialization() {
        let rec = record();
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"status\":\"queued\""));
        let restored: MutationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, rec);
    }
}
