//! Subscriber notifications.
//!
//! `EventBus` carries two channels: a broadcast of discrete `SyncEvent`s
//! and a watch holding the latest `QueueStatus` snapshot. Cloning the bus
//! shares both channels, so several engines can publish to the same
//! subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};

use showsync_common::{EntityId, VersionedEntity};

use crate::conflict::Resolution;
use crate::mutation::{MutationId, MutationStatus};
use crate::scheduler::SyncReport;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something subscribers may want to react to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    MutationQueued {
        id: MutationId,
        entity_id: EntityId,
    },
    /// The remote accepted a write; carries the new snapshot.
    EntityUpdated {
        mutation_id: MutationId,
        entity: VersionedEntity,
    },
    ConflictResolved {
        report_id: String,
        entity_id: EntityId,
        resolution: Resolution,
    },
    MutationFailed {
        id: MutationId,
        entity_id: EntityId,
        status: MutationStatus,
        message: String,
    },
    ConnectivityChanged {
        online: bool,
    },
    SyncCompleted {
        report: SyncReport,
    },
}

/// Snapshot pushed to UI subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Records still owed to the remote.
    pub queued_count: usize,
    /// Records waiting for retry or discard by the user.
    pub failed_count: usize,
    pub is_online: bool,
    pub draining: bool,
}

/// Pub/sub hub for pipeline events and queue status.
#[derive(Debug, Clone)]
pub struct EventBus {
    events: broadcast::Sender<SyncEvent>,
    status: watch::Sender<QueueStatus>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Bus whose event channel buffers `capacity` events per lagging subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (status, _) = watch::channel(QueueStatus::default());
        Self { events, status }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<QueueStatus> {
        self.status.subscribe()
    }

    /// Deliver an event to current subscribers. Returns how many received it.
    pub fn publish(&self, event: SyncEvent) -> usize {
        // No subscribers is not an error
        self.events.send(event).unwrap_or(0)
    }

    /// Replace the status snapshot, waking watchers only on change.
    pub fn set_status(&self, status: QueueStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    pub fn status(&self) -> QueueStatus {
        *self.status.borrow()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks online/offline transitions for statistics.
#[derive(Debug)]
pub(crate) struct Connectivity {
    online: bool,
    changed_at: Instant,
    last_online_at: Option<Instant>,
}

impl Connectivity {
    pub(crate) fn new(online: bool) -> Self {
        let now = Instant::now();
        Self {
            online,
            changed_at: now,
            last_online_at: online.then_some(now),
        }
    }

    /// Record the current state. Returns whether it changed.
    pub(crate) fn set(&mut self, online: bool) -> bool {
        if self.online == online {
            return false;
        }
        let now = Instant::now();
        if self.online {
            self.last_online_at = Some(now);
        }
        self.online = online;
        self.changed_at = now;
        true
    }

    pub(crate) fn is_online(&self) -> bool {
        self.online
    }

    pub(crate) fn offline_for(&self) -> Option<Duration> {
        (!self.online).then(|| self.changed_at.elapsed())
    }

    pub(crate) fn since_last_online(&self) -> Option<Duration> {
        if self.online {
            Some(Duration::ZERO)
        } else {
            self.last_online_at.map(|t| t.elapsed())
        }
    }
}

/// Pipeline statistics.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub queued_count: usize,
    pub failed_count: usize,
    pub is_online: bool,
    /// How long the engine has been offline, if it is.
    pub offline_for: Option<Duration>,
    /// Time since connectivity was last seen; zero while online.
    pub since_last_online: Option<Duration>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub total_synced: u64,
    pub total_conflicts: u64,
    pub total_failed: u64,
}
