//! Append-only audit trail of pipeline activity.
//!
//! Events are kept in a bounded ring; conflict reports are never pruned.
//! Both are persisted through the durable store after every append.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use showsync_common::{ActorId, EntityId, Error, Result};
use showsync_storage::{DurableStore, AUDIT_KEY};

use crate::conflict::{ConflictReport, Resolution};
use crate::mutation::{MutationId, MutationRecord};

/// Default number of events retained.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAction {
    Enqueued,
    Sent,
    Succeeded,
    ConflictResolved,
    Failed,
    DeadLettered,
    Retried,
    Discarded,
    Cancelled,
    Unresolved,
    Cleared,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Enqueued => "enqueued",
            AuditAction::Sent => "sent",
            AuditAction::Succeeded => "succeeded",
            AuditAction::ConflictResolved => "conflict-resolved",
            AuditAction::Failed => "failed",
            AuditAction::DeadLettered => "dead-lettered",
            AuditAction::Retried => "retried",
            AuditAction::Discarded => "discarded",
            AuditAction::Cancelled => "cancelled",
            AuditAction::Unresolved => "unresolved",
            AuditAction::Cleared => "cleared",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        const ALL: [AuditAction; 11] = [
            AuditAction::Enqueued,
            AuditAction::Sent,
            AuditAction::Succeeded,
            AuditAction::ConflictResolved,
            AuditAction::Failed,
            AuditAction::DeadLettered,
            AuditAction::Retried,
            AuditAction::Discarded,
            AuditAction::Cancelled,
            AuditAction::Unresolved,
            AuditAction::Cleared,
        ];
        ALL.into_iter()
            .find(|a| a.as_str() == name)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown audit action: {}", name)))
    }

    fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditAction::DeadLettered
            | AuditAction::Unresolved
            | AuditAction::Discarded
            | AuditAction::Failed => AuditSeverity::Warning,
            AuditAction::Cleared => AuditSeverity::Critical,
            _ => AuditSeverity::Info,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Critical => "critical",
        }
    }
}

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Assigned by the trail on append.
    pub id: u64,
    pub at: DateTime<Utc>,
    pub action: AuditAction,
    pub severity: AuditSeverity,
    pub actor: ActorId,
    #[serde(default)]
    pub entity_id: Option<EntityId>,
    #[serde(default)]
    pub mutation_id: Option<MutationId>,
    pub description: String,
}

impl AuditEvent {
    pub fn new(action: AuditAction, actor: ActorId, description: impl Into<String>) -> Self {
        Self {
            id: 0,
            at: Utc::now(),
            action,
            severity: action.default_severity(),
            actor,
            entity_id: None,
            mutation_id: None,
            description: description.into(),
        }
    }

    /// Attach the mutation (and its entity) the event is about.
    pub fn for_mutation(mut self, record: &MutationRecord) -> Self {
        self.entity_id = Some(record.entity_id.clone());
        self.mutation_id = Some(record.id);
        self
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }
}

/// Query over the retained events. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub entity_id: Option<EntityId>,
    pub action: Option<AuditAction>,
    pub min_severity: Option<AuditSeverity>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        self.entity_id
            .as_ref()
            .map_or(true, |id| event.entity_id.as_ref() == Some(id))
            && self.action.map_or(true, |a| event.action == a)
            && self.min_severity.map_or(true, |s| event.severity >= s)
            && self.since.map_or(true, |t| event.at >= t)
            && self.until.map_or(true, |t| event.at <= t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuditSnapshot {
    next_id: u64,
    events: Vec<AuditEvent>,
    conflicts: Vec<ConflictReport>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuditExport<'a> {
    events: Vec<&'a AuditEvent>,
    conflicts: &'a [ConflictReport],
}

/// Persistent audit trail.
pub struct AuditTrail {
    store: Arc<dyn DurableStore>,
    events: VecDeque<AuditEvent>,
    conflicts: Vec<ConflictReport>,
    capacity: usize,
    next_id: u64,
}

impl AuditTrail {
    /// Open the trail, restoring persisted events and reports.
    pub async fn open(store: Arc<dyn DurableStore>, capacity: usize) -> Result<Self> {
        let snapshot = match store.read_blob(AUDIT_KEY).await? {
            Some(content) => serde_json::from_str::<AuditSnapshot>(&content)?,
            None => AuditSnapshot::default(),
        };
        let capacity = capacity.max(1);
        let mut events: VecDeque<AuditEvent> = snapshot.events.into();
        while events.len() > capacity {
            events.pop_front();
        }
        let next_id = events
            .back()
            .map(|e| e.id + 1)
            .unwrap_or(1)
            .max(snapshot.next_id);

        Ok(Self {
            store,
            events,
            conflicts: snapshot.conflicts,
            capacity,
            next_id,
        })
    }

    /// Append an event and persist the trail.
    pub async fn record(&mut self, mut event: AuditEvent) -> Result<()> {
        event.id = self.next_id;
        self.next_id += 1;
        debug!("Audit {} #{}: {}", event.action, event.id, event.description);
        self.events.push_back(event);
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        self.persist().await
    }

    /// Append a conflict report, with a matching event, and persist.
    pub async fn record_conflict(&mut self, report: ConflictReport) -> Result<()> {
        let action = match report.resolution {
            Resolution::Unresolved => AuditAction::Unresolved,
            _ => AuditAction::ConflictResolved,
        };
        let mut event = AuditEvent::new(
            action,
            report.local_mutation.actor.clone(),
            format!(
                "Conflict on {} resolved as {} (attempt {}, {} field diffs)",
                report.entity_id,
                report.resolution,
                report.attempt,
                report.field_diffs.len()
            ),
        )
        .for_mutation(&report.local_mutation);
        event.at = report.resolved_at;
        self.conflicts.push(report);
        self.record(event).await
    }

    /// Retained events, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &AuditEvent> {
        self.events.iter()
    }

    /// Every conflict report ever recorded, oldest first.
    pub fn conflicts(&self) -> &[ConflictReport] {
        &self.conflicts
    }

    pub fn conflicts_for(&self, entity_id: &EntityId) -> Vec<&ConflictReport> {
        self.conflicts
            .iter()
            .filter(|r| &r.entity_id == entity_id)
            .collect()
    }

    /// Matching events, newest first.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        self.events
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Render retained events (and, for JSON, conflict reports).
    pub fn export(&self, format: ExportFormat, filter: &AuditFilter) -> Result<String> {
        let events: Vec<&AuditEvent> = self.events.iter().filter(|e| filter.matches(e)).collect();
        match format {
            ExportFormat::Json => {
                let conflicts: &[ConflictReport] = &self.conflicts;
                Ok(serde_json::to_string_pretty(&AuditExport { events, conflicts })?)
            }
            ExportFormat::Csv => {
                let mut out = String::from("id,at,action,severity,actor,entity,mutation,description\n");
                for e in events {
                    let row = [
                        e.id.to_string(),
                        e.at.to_rfc3339(),
                        e.action.to_string(),
                        e.severity.as_str().to_string(),
                        e.actor.to_string(),
                        e.entity_id.as_ref().map(|id| id.to_string()).unwrap_or_default(),
                        e.mutation_id.map(|id| id.to_string()).unwrap_or_default(),
                        e.description.clone(),
                    ];
                    let cells: Vec<String> = row.iter().map(|c| csv_cell(c)).collect();
                    out.push_str(&cells.join(","));
                    out.push('\n');
                }
                Ok(out)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = AuditSnapshot {
            next_id: self.next_id,
            events: self.events.iter().cloned().collect(),
            conflicts: self.conflicts.clone(),
        };
        let json = serde_json::to_string(&snapshot)?;
        self.store.write_blob(AUDIT_KEY, &json).await
    }
}

fn csv_cell(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictResolver;
    use serde_json::json;
    use showsync_common::{EntityKind, FieldMap, Operation, VersionedEntity};
    use showsync_storage::MemoryDurableStore;

    fn record(entity: &str) -> MutationRecord {
        MutationRecord::new(
            MutationId(7),
            EntityId::new(entity).unwrap(),
            EntityKind::Show,
            Operation::Update,
            FieldMap::from([("fee".to_string(), json!(500))]),
            1,
            FieldMap::new(),
            ActorId::new("me"),
        )
    }

    fn event(action: AuditAction, entity: &str) -> AuditEvent {
        AuditEvent::new(action, ActorId::new("me"), "test").for_mutation(&record(entity))
    }

    #[tokio::test]
    async fn test_ring_is_bounded() {
        let store = Arc::new(MemoryDurableStore::new());
        let mut trail = AuditTrail::open(store, 3).await.unwrap();
        for _ in 0..5 {
            trail.record(event(AuditAction::Sent, "show-1")).await.unwrap();
        }
        assert_eq!(trail.len(), 3);
        let ids: Vec<u64> = trail.events().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_conflicts_are_never_pruned() {
        let store = Arc::new(MemoryDurableStore::new());
        let mut trail = AuditTrail::open(store, 1).await.unwrap();
        let local = record("show-1");
        let remote = VersionedEntity::new(local.entity_id.clone(), EntityKind::Show).with_version(1);
        for _ in 0..3 {
            let report = ConflictResolver::default().resolve(&local, &remote).unwrap();
            trail.record_conflict(report).await.unwrap();
        }
        assert_eq!(trail.len(), 1);
        assert_eq!(trail.conflicts().len(), 3);
        assert_eq!(trail.conflicts_for(&local.entity_id).len(), 3);
    }

    #[tokio::test]
    async fn test_query_filters() {
        let store = Arc::new(MemoryDurableStore::new());
        let mut trail = AuditTrail::open(store, 100).await.unwrap();
        trail.record(event(AuditAction::Enqueued, "show-1")).await.unwrap();
        trail.record(event(AuditAction::Enqueued, "show-2")).await.unwrap();
        trail.record(event(AuditAction::DeadLettered, "show-1")).await.unwrap();

        let by_entity = trail.query(&AuditFilter {
            entity_id: Some(EntityId::new("show-1").unwrap()),
            ..Default::default()
        });
        assert_eq!(by_entity.len(), 2);
        assert_eq!(by_entity[0].action, AuditAction::DeadLettered);

        let warnings = trail.query(&AuditFilter {
            min_severity: Some(AuditSeverity::Warning),
            ..Default::default()
        });
        assert_eq!(warnings.len(), 1);

        let limited = trail.query(&AuditFilter {
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_persisted_across_reopen() {
        let store = Arc::new(MemoryDurableStore::new());
        {
            let mut trail = AuditTrail::open(store.clone(), 10).await.unwrap();
            trail.record(event(AuditAction::Discarded, "show-1")).await.unwrap();
        }
        let mut trail = AuditTrail::open(store, 10).await.unwrap();
        assert_eq!(trail.len(), 1);
        trail.record(event(AuditAction::Sent, "show-1")).await.unwrap();
        assert_eq!(trail.events().last().map(|e| e.id), Some(2));
    }

    #[tokio::test]
    async fn test_csv_export_escapes() {
        let store = Arc::new(MemoryDurableStore::new());
        let mut trail = AuditTrail::open(store, 10).await.unwrap();
        trail
            .record(AuditEvent::new(
                AuditAction::Cleared,
                ActorId::new("me"),
                "cleared \"all\", really",
            ))
            .await
            .unwrap();

        let csv = trail.export(ExportFormat::Csv, &AuditFilter::default()).unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("id,at,action"));
        let row = lines.next().unwrap();
        assert!(row.contains(",cleared,critical,me,,,"));
        assert!(row.ends_with("\"cleared \"\"all\"\", really\""));

        let json = trail.export(ExportFormat::Json, &AuditFilter::default()).unwrap();
        assert!(json.contains("\"conflicts\""));
    }

    #[test]
    fn test_action_parse() {
        assert_eq!(AuditAction::parse("dead-lettered").unwrap(), AuditAction::DeadLettered);
        assert!(AuditAction::parse("exploded").is_err());
    }
}
