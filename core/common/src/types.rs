//! Common types used throughout ShowSync.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Domain fields of an entity, keyed by field name.
///
/// A `BTreeMap` keeps field iteration (and therefore field diffs and
/// serialized output) in a stable order.
pub type FieldMap = BTreeMap<String, Value>;

/// Opaque identifier of a syncable record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    /// Create a new EntityId from a string.
    ///
    /// # Preconditions
    /// - `id` must be non-empty
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "EntityId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the user or device that performed a write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(actor: impl Into<String>) -> Self {
        Self(actor.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self("local".to_string())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Known kinds of syncable records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Show,
    Finance,
    Travel,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Show, EntityKind::Finance, EntityKind::Travel];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Show => "show",
            EntityKind::Finance => "finance",
            EntityKind::Travel => "travel",
        }
    }

    /// Prefix shared by every cache key derived from this kind.
    pub fn cache_prefix(&self) -> String {
        format!("{}:", self.as_str())
    }

    /// Parse a kind from its lowercase name.
    pub fn parse(name: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == name)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown entity kind: {}", name)))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of write a mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A syncable record with optimistic-concurrency metadata.
///
/// `version` starts at 0 and is bumped by exactly one on every successful
/// remote write. Deletes leave a tombstone so the version keeps growing
/// across delete and never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    #[serde(default)]
    pub fields: FieldMap,
    pub version: u64,
    pub modified_at: DateTime<Utc>,
    pub modified_by: ActorId,
    #[serde(default)]
    pub deleted: bool,
}

impl VersionedEntity {
    /// Create an empty, never-written entity.
    pub fn new(id: EntityId, kind: EntityKind) -> Self {
        Self {
            id,
            kind,
            fields: FieldMap::new(),
            version: 0,
            modified_at: Utc::now(),
            modified_by: ActorId::default(),
            deleted: false,
        }
    }

    /// Builder-style field initialisation.
    pub fn with_fields(mut self, fields: FieldMap) -> Self {
        self.fields = fields;
        self
    }

    /// Builder-style version initialisation.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Look up a single field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Field value, treating a missing field as `null`.
    pub fn field_or_null(&self, name: &str) -> Value {
        self.fields.get(name).cloned().unwrap_or(Value::Null)
    }

    /// Overlay `patch` onto the current fields.
    pub fn apply_patch(&mut self, patch: &FieldMap) {
        for (key, value) in patch {
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// Key of this entity in the read cache.
    pub fn cache_key(&self) -> String {
        entity_cache_key(self.kind, &self.id)
    }
}

/// Cache key for a single entity, `<kind>:<id>`.
pub fn entity_cache_key(kind: EntityKind, id: &EntityId) -> String {
    format!("{}{}", kind.cache_prefix(), id)
}

/// A typed view over the field map of a given entity kind.
pub trait Record: Serialize + DeserializeOwned {
    const KIND: EntityKind;

    /// Serialize into a field map suitable for a mutation payload.
    fn to_fields(&self) -> crate::Result<FieldMap> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(crate::Error::InvalidInput(format!(
                "{} record must serialize to an object, got {}",
                Self::KIND,
                other
            ))),
        }
    }

    /// Decode the typed record from an entity's fields.
    fn from_entity(entity: &VersionedEntity) -> crate::Result<Self> {
        if entity.kind != Self::KIND {
            return Err(crate::Error::InvalidInput(format!(
                "Expected a {} entity, got {}",
                Self::KIND,
                entity.kind
            )));
        }
        let object: serde_json::Map<String, Value> = entity
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(serde_json::from_value(Value::Object(object))?)
    }
}

/// A scheduled show on a tour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Show {
    pub city: String,
    pub country: String,
    pub date: String,
    pub fee: f64,
    pub fee_currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
}

impl Record for Show {
    const KIND: EntityKind = EntityKind::Show;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_id_rejects_empty() {
        assert!(EntityId::new("").is_err());
        assert!(EntityId::new("   ").is_err());
        assert_eq!(EntityId::new("show-1").unwrap().as_str(), "show-1");
    }

    #[test]
    fn test_kind_parse_and_prefix() {
        assert_eq!(EntityKind::parse("finance").unwrap(), EntityKind::Finance);
        assert!(EntityKind::parse("venue").is_err());
        assert_eq!(EntityKind::Show.cache_prefix(), "show:");
    }

    #[test]
    fn test_apply_patch_overlays_fields() {
        let mut entity = VersionedEntity::new(EntityId::new("show-1").unwrap(), EntityKind::Show)
            .with_fields(FieldMap::from([
                ("fee".to_string(), json!(100)),
                ("city".to_string(), json!("Lyon")),
            ]));
        entity.apply_patch(&FieldMap::from([("fee".to_string(), json!(500))]));

        assert_eq!(entity.field("fee"), Some(&json!(500)));
        assert_eq!(entity.field("city"), Some(&json!("Lyon")));
        assert_eq!(entity.field_or_null("venue"), Value::Null);
        assert_eq!(entity.cache_key(), "show:show-1");
    }

    #[test]
    fn test_show_record_conversion() {
        let show = Show {
            city: "Madrid".into(),
            country: "ES".into(),
            date: "2026-05-01".into(),
            fee: 1500.0,
            fee_currency: "EUR".into(),
            venue: None,
        };
        let fields = show.to_fields().unwrap();
        assert_eq!(fields.get("feeCurrency"), Some(&json!("EUR")));
        assert!(!fields.contains_key("venue"));

        let entity = VersionedEntity::new(EntityId::new("show-9").unwrap(), EntityKind::Show)
            .with_fields(fields);
        assert_eq!(Show::from_entity(&entity).unwrap(), show);
    }

    #[test]
    fn test_record_rejects_wrong_kind() {
        let entity = VersionedEntity::new(EntityId::new("t-1").unwrap(), EntityKind::Travel);
        assert!(Show::from_entity(&entity).is_err());
    }

    #[test]
    fn test_entity_serialization_shape() {
        let entity = VersionedEntity::new(EntityId::new("show-1").unwrap(), EntityKind::Show)
            .with_version(3);
        let json = serde_json::to_value(&entity).unwrap();
        assert_eq!(json["kind"], json!("show"));
        assert_eq!(json["version"], json!(3));
        assert!(json.get("modifiedBy").is_some());
    }

    proptest::proptest! {
        #[test]
        fn prop_patch_values_win(
            base in proptest::collection::btree_map("[a-e]", 0i64..10, 0..5),
            patch in proptest::collection::btree_map("[a-e]", 0i64..10, 0..5),
        ) {
            let mut entity = VersionedEntity::new(EntityId::new("p").unwrap(), EntityKind::Show)
                .with_fields(base.iter().map(|(k, v)| (k.clone(), json!(v))).collect());
            let patch: FieldMap = patch.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            entity.apply_patch(&patch);

            for (key, value) in &patch {
                proptest::prop_assert_eq!(entity.field(key), Some(value));
            }
            for key in base.keys() {
                proptest::prop_assert!(entity.field(key).is_some());
            }
        }
    }
}
