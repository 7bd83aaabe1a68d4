//! Managed object record.
//!
//! # Invariants
//! - `id` is stable and never reused for another object.
//! - `entity` names an entity of the stack's model.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Stable identifier for every managed object.
pub type ObjectId = Uuid;

/// Attribute values keyed by attribute name.
pub type Attributes = BTreeMap<String, Value>;

/// One object of the object graph, as seen by a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedObject {
    pub id: ObjectId,
    pub entity: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl ManagedObject {
    /// Creates a new object with a generated stable ID.
    pub fn new(entity: impl Into<String>, attributes: Attributes) -> Self {
        Self::with_id(Uuid::new_v4(), entity, attributes)
    }

    /// Creates an object with a caller-provided stable ID.
    ///
    /// Used by the store when materializing persisted rows.
    pub fn with_id(id: ObjectId, entity: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            id,
            entity: entity.into(),
            attributes,
        }
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }

    /// Returns a string attribute, or `None` when missing or not a string.
    pub fn get_str(&self, attribute: &str) -> Option<&str> {
        self.get(attribute).and_then(Value::as_str)
    }

    /// Returns an integer attribute, or `None` when missing or not an integer.
    pub fn get_i64(&self, attribute: &str) -> Option<i64> {
        self.get(attribute).and_then(Value::as_i64)
    }
}

/// Builds an attribute bag from `(name, value)` pairs.
///
/// ```
/// use datastack_core::attributes;
/// use serde_json::json;
///
/// let attrs = attributes([("name", json!("Joshua Ivanof")), ("remoteID", json!(1))]);
/// assert_eq!(attrs.len(), 2);
/// ```
pub fn attributes<K, I>(pairs: I) -> Attributes
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value))
        .collect()
}
