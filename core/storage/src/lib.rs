//! Storage collaborators for ShowSync.
//!
//! This module provides trait-based interfaces for the two stores the
//! mutation pipeline talks to: the remote document store (the arbiter of
//! entity versions) and the device-local durable store that keeps the
//! mutation queue and audit log across restarts.
//!
//! # Design Principles
//! - Store isolation: no backend-specific logic in the sync engine
//! - Async operations: every I/O call is async and may suspend
//! - Optimistic concurrency: remote writes are compare-and-set on `version`

pub mod local;
pub mod memory;
pub mod provider;

pub use local::{FileDurableStore, FileRemoteStore};
pub use memory::{Fault, MemoryDurableStore, MemoryRemoteStore};
pub use provider::{DurableStore, RemoteStore, WriteRequest, AUDIT_KEY, QUEUE_KEY};
