//! ShowSync Sync Engine
//!
//! This module provides the offline-first mutation pipeline, including:
//! - Durable mutation queue with optimistic local views
//! - Retry strategy with linear or exponential backoff
//! - TTL read cache with pattern invalidation
//! - Field-level conflict resolution with an append-only audit trail
//! - Sync orchestration with manual, on-demand and periodic scheduling

pub mod audit;
pub mod cache;
pub mod conflict;
pub mod engine;
pub mod events;
pub mod mutation;
pub mod queue;
pub mod retry;
pub mod scheduler;

// Re-export main types
pub use audit::{AuditAction, AuditEvent, AuditFilter, AuditSeverity, AuditTrail, ExportFormat};
pub use cache::{with_cache, CacheEntry, Clock, ManualClock, SystemClock, TtlCache};
pub use conflict::{
    ConflictReport, ConflictResolver, ConflictStrategy, FieldDiff, Resolution, Side,
};
pub use engine::{SyncConfig, SyncEngine};
pub use events::{EventBus, QueueStatus, SyncEvent, SyncStats};
pub use mutation::{FailureInfo, MutationId, MutationRecord, MutationStatus};
pub use queue::{DrainCursor, MutationQueue, QueueStats};
pub use retry::{retry, retry_with_config, Backoff, RetryConfig, RetryExecutor};
pub use scheduler::{
    SyncMode, SyncReport, SyncRequest, SyncScheduler, SyncSchedulerHandle, SyncTrigger,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _resolver = ConflictResolver::default();
        let _cache: TtlCache<String> = TtlCache::new();
        let _bus = EventBus::new();
    }
}
