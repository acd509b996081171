//! Mutation types for expressing changes.
//!
//! Local changes are captured as [`PendingMutation`]s grouped into
//! transactions. Authoritative changes arrive from the sync source as
//! [`ChangeMessage`]s. Both are applied to a record map the same way.

use crate::{Key, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a pending mutation.
pub type MutationId = Uuid;

/// The kind of change a mutation makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    #[default]
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Insert => write!(f, "insert"),
            OperationType::Update => write!(f, "update"),
            OperationType::Delete => write!(f, "delete"),
        }
    }
}

/// Marker stored as `modified` and `changes` of a delete.
pub fn tombstone() -> Value {
    json!({ "_deleted": true })
}

/// One atomic change to one key, waiting for the backend to confirm it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub mutation_id: MutationId,
    pub key: Key,
    #[serde(rename = "type")]
    pub operation: OperationType,
    /// Record before the change (empty for inserts)
    pub original: Record,
    /// Record after the change, or the tombstone for deletes
    pub modified: Value,
    /// Full record for inserts, changed fields for updates, tombstone for deletes
    pub changes: Value,
    /// Caller supplied metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Backend metadata known for this key when the mutation was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingMutation {
    fn new(
        key: Key,
        operation: OperationType,
        original: Record,
        modified: Value,
        changes: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            mutation_id: Uuid::new_v4(),
            key,
            operation,
            original,
            modified,
            changes,
            metadata: None,
            sync_metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create an insert of a full record.
    pub fn insert(key: impl Into<Key>, record: Record) -> Self {
        let value = Value::Object(record);
        Self::new(
            key.into(),
            OperationType::Insert,
            Record::new(),
            value.clone(),
            value,
        )
    }

    /// Create an update from the record before the change and the changed fields.
    pub fn update(key: impl Into<Key>, original: Record, changes: Record) -> Self {
        let mut modified = original.clone();
        merge_into(&mut modified, &changes);
        Self::new(
            key.into(),
            OperationType::Update,
            original,
            Value::Object(modified),
            Value::Object(changes),
        )
    }

    /// Create a delete of the given record.
    pub fn delete(key: impl Into<Key>, original: Record) -> Self {
        Self::new(
            key.into(),
            OperationType::Delete,
            original,
            tombstone(),
            tombstone(),
        )
    }

    /// Builder-style method to attach caller metadata.
    pub fn with_metadata(mut self, metadata: Option<Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Builder-style method to attach backend metadata.
    pub fn with_sync_metadata(mut self, sync_metadata: Option<Value>) -> Self {
        self.sync_metadata = sync_metadata;
        self
    }

    /// Apply this mutation to a record map.
    pub fn apply_to(&self, records: &mut BTreeMap<Key, Record>) {
        match self.operation {
            OperationType::Insert | OperationType::Update => {
                let entry = records.entry(self.key.clone()).or_default();
                if let Value::Object(changes) = &self.changes {
                    merge_into(entry, changes);
                }
            }
            OperationType::Delete => {
                records.remove(&self.key);
            }
        }
    }
}

/// A change notification delivered by the sync source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
    /// Key of the changed record; derived from the value when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Key>,
    pub value: Value,
    #[serde(rename = "type", default)]
    pub operation: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ChangeMessage {
    pub fn insert(key: impl Into<Key>, value: Value) -> Self {
        Self {
            key: Some(key.into()),
            value,
            operation: OperationType::Insert,
            metadata: None,
        }
    }

    pub fn update(key: impl Into<Key>, value: Value) -> Self {
        Self {
            key: Some(key.into()),
            value,
            operation: OperationType::Update,
            metadata: None,
        }
    }

    pub fn delete(key: impl Into<Key>) -> Self {
        Self {
            key: Some(key.into()),
            value: Value::Null,
            operation: OperationType::Delete,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Shallow merge: every top-level field of `changes` overwrites `target`.
pub(crate) fn merge_into(target: &mut Record, changes: &Record) {
    for (field, value) in changes {
        target.insert(field.clone(), value.clone());
    }
}
