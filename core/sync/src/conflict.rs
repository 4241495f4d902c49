//! Conflict resolution between a queued mutation and the remote copy.
//!
//! Resolution is a pure function of the mutation and the remote snapshot:
//! resolving the same pair twice yields the same merged payload, the same
//! label and the same field diffs. Only the report id and timestamp differ.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use showsync_common::{EntityId, Error, FieldMap, Operation, Result, VersionedEntity};

use crate::mutation::MutationRecord;

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Three-way merge per field, last write wins on overlapping edits.
    #[default]
    FieldMerge,
    /// Prefer local version, overwrite remote.
    PreferLocal,
    /// Prefer remote version, drop the local edit.
    PreferRemote,
    /// Leave every conflict for the user.
    Manual,
}

/// Outcome label of a resolved conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// Local and remote edits combined.
    AppliedMerge,
    /// The local edit was written over the remote changes.
    LocalWins,
    /// The remote copy was kept; nothing is written.
    RemoteWins,
    /// Needs manual reconciliation.
    Unresolved,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::AppliedMerge => "applied-merge",
            Resolution::LocalWins => "local-wins",
            Resolution::RemoteWins => "remote-wins",
            Resolution::Unresolved => "unresolved",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

/// Both values of a field edited on both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub local: Value,
    pub remote: Value,
    pub winner: Side,
}

/// Record of one conflict and how it was settled. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub id: String,
    pub entity_id: EntityId,
    pub local_mutation: MutationRecord,
    pub remote_snapshot: VersionedEntity,
    pub strategy: ConflictStrategy,
    pub resolution: Resolution,
    pub field_diffs: BTreeMap<String, FieldDiff>,
    /// Patch to write on top of the remote copy, if any.
    pub merged_payload: FieldMap,
    /// Operation to send with `merged_payload`; `None` means no write.
    pub write_operation: Option<Operation>,
    /// Resolution round for this mutation, starting at 1.
    pub attempt: u32,
    #[serde(default)]
    pub reason: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

impl ConflictReport {
    fn new(
        mutation: &MutationRecord,
        remote: &VersionedEntity,
        strategy: ConflictStrategy,
        resolution: Resolution,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_id: mutation.entity_id.clone(),
            local_mutation: mutation.clone(),
            remote_snapshot: remote.clone(),
            strategy,
            resolution,
            field_diffs: BTreeMap::new(),
            merged_payload: FieldMap::new(),
            write_operation: None,
            attempt: 1,
            reason: None,
            resolved_at: Utc::now(),
        }
    }

    fn writing(mut self, operation: Operation, payload: FieldMap) -> Self {
        self.write_operation = Some(operation);
        self.merged_payload = payload;
        self
    }

    fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Whether the resolution requires a remote write.
    pub fn needs_write(&self) -> bool {
        self.write_operation.is_some()
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Decides apply, merge or surface for a mutation against the remote copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Resolve with the configured strategy.
    pub fn resolve(
        &self,
        mutation: &MutationRecord,
        remote: &VersionedEntity,
    ) -> Result<ConflictReport> {
        self.resolve_with(mutation, remote, self.strategy)
    }

    /// Resolve with an explicit strategy.
    ///
    /// # Errors
    /// - Remote copy is a different entity or kind
    /// - Mutation claims a base version the remote never reached
    pub fn resolve_with(
        &self,
        mutation: &MutationRecord,
        remote: &VersionedEntity,
        strategy: ConflictStrategy,
    ) -> Result<ConflictReport> {
        if mutation.entity_id != remote.id || mutation.kind != remote.kind {
            return Err(Error::Invariant(format!(
                "Mutation {} targets {} {}, remote copy is {} {}",
                mutation.id, mutation.kind, mutation.entity_id, remote.kind, remote.id
            )));
        }
        if mutation.base_version > remote.version {
            return Err(Error::Invariant(format!(
                "Mutation {} was based on v{} but the remote is only at v{}",
                mutation.id, mutation.base_version, remote.version
            )));
        }

        let report = |resolution| ConflictReport::new(mutation, remote, strategy, resolution);

        if remote.deleted {
            return Ok(match mutation.operation {
                Operation::Delete => {
                    report(Resolution::RemoteWins).because("entity already deleted remotely")
                }
                _ => report(Resolution::Unresolved).because("entity was deleted remotely"),
            });
        }

        let fresh_create = mutation.operation == Operation::Create && remote.version == 0;
        if mutation.base_version == remote.version
            && (mutation.operation != Operation::Create || fresh_create)
        {
            return Ok(report(Resolution::LocalWins)
                .writing(mutation.operation, mutation.payload.clone()));
        }

        // A create that met an existing record is sent as an update
        let operation = match mutation.operation {
            Operation::Create => Operation::Update,
            other => other,
        };

        match strategy {
            ConflictStrategy::Manual => {
                Ok(report(Resolution::Unresolved).because("manual resolution requested"))
            }
            ConflictStrategy::PreferLocal => {
                let mut resolved =
                    report(Resolution::LocalWins).writing(operation, mutation.payload.clone());
                resolved.field_diffs = overlapping_fields(mutation, remote, Side::Local);
                Ok(resolved)
            }
            ConflictStrategy::PreferRemote => {
                let mut resolved = report(Resolution::RemoteWins);
                resolved.field_diffs = overlapping_fields(mutation, remote, Side::Remote);
                Ok(resolved)
            }
            ConflictStrategy::FieldMerge if operation == Operation::Delete => {
                if local_is_later(mutation, remote) {
                    Ok(report(Resolution::LocalWins)
                        .writing(Operation::Delete, FieldMap::new())
                        .because("delete is newer than the remote edit"))
                } else {
                    Ok(report(Resolution::RemoteWins)
                        .because("remote edit is newer than the delete"))
                }
            }
            ConflictStrategy::FieldMerge => Ok(field_merge(mutation, remote, operation, report)),
        }
    }
}

fn local_is_later(mutation: &MutationRecord, remote: &VersionedEntity) -> bool {
    // Ties go to the remote
    mutation.created_at > remote.modified_at
}

fn base_value(mutation: &MutationRecord, field: &str) -> Value {
    mutation
        .base_snapshot
        .get(field)
        .cloned()
        .unwrap_or(Value::Null)
}

/// Three-way merge of the touched fields.
fn field_merge(
    mutation: &MutationRecord,
    remote: &VersionedEntity,
    operation: Operation,
    report: impl Fn(Resolution) -> ConflictReport,
) -> ConflictReport {
    let local_later = local_is_later(mutation, remote);
    let mut merged = FieldMap::new();
    let mut diffs = BTreeMap::new();

    for (field, local) in &mutation.payload {
        let remote_value = remote.field_or_null(field);
        if &remote_value == local {
            continue;
        }
        if remote_value == base_value(mutation, field) {
            merged.insert(field.clone(), local.clone());
            continue;
        }
        let winner = if local_later { Side::Local } else { Side::Remote };
        if winner == Side::Local {
            merged.insert(field.clone(), local.clone());
        }
        diffs.insert(
            field.clone(),
            FieldDiff {
                local: local.clone(),
                remote: remote_value,
                winner,
            },
        );
    }

    let resolution = if merged.is_empty() {
        Resolution::RemoteWins
    } else if diffs.values().any(|d| d.winner == Side::Remote) || diffs.is_empty() {
        Resolution::AppliedMerge
    } else {
        Resolution::LocalWins
    };

    let mut resolved = report(resolution);
    resolved.field_diffs = diffs;
    if !merged.is_empty() {
        resolved = resolved.writing(operation, merged);
    }
    resolved
}

/// Touched fields whose remote value changed and differs from the local one.
fn overlapping_fields(
    mutation: &MutationRecord,
    remote: &VersionedEntity,
    winner: Side,
) -> BTreeMap<String, FieldDiff> {
    mutation
        .payload
        .iter()
        .filter_map(|(field, local)| {
            let remote_value = remote.field_or_null(field);
            (&remote_value != local && remote_value != base_value(mutation, field)).then(|| {
                (
                    field.clone(),
                    FieldDiff {
                        local: local.clone(),
                        remote: remote_value,
                        winner,
                    },
                )
            })
        })
        .collect()
}
