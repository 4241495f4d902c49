//! Common utilities and types shared across ShowSync modules.
//!
//! This module provides the versioned entity model and the error taxonomy
//! used throughout the offline mutation pipeline.

pub mod error;
pub mod types;

pub use error::{Error, ErrorClass, Result};
pub use types::{
    entity_cache_key, ActorId, EntityId, EntityKind, FieldMap, Operation, Record, Show,
    VersionedEntity,
};
