//! Point-in-time export of a collection.
//!
//! A snapshot captures the synced data, its metadata and the live
//! transactions. Maps are `BTreeMap`s so the serialized form is stable.

use crate::{
    collection::Collection, error::Result, CollectionId, Error, Key, PendingMutation, Record,
    TransactionId, TransactionState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A live transaction as it appears in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSnapshot {
    pub id: TransactionId,
    pub state: TransactionState,
    pub created_at: DateTime<Utc>,
    pub mutations: Vec<PendingMutation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything a collection holds at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSnapshot {
    pub format_version: u32,
    pub collection_id: CollectionId,
    /// Whether the first sync round had been merged
    pub ready: bool,
    pub synced: BTreeMap<Key, Record>,
    pub synced_metadata: BTreeMap<Key, Value>,
    /// Live transactions, oldest first
    pub transactions: Vec<TransactionSnapshot>,
}

impl CollectionSnapshot {
    pub fn new(collection_id: impl Into<CollectionId>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            collection_id: collection_id.into(),
            ready: false,
            synced: BTreeMap::new(),
            synced_metadata: BTreeMap::new(),
            transactions: Vec::new(),
        }
    }

    /// Transactions that have not settled yet.
    pub fn pending_count(&self) -> usize {
        self.transactions
            .iter()
            .filter(|t| !t.state.is_terminal())
            .count()
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

impl Collection {
    /// Export the collection's current synced data and live transactions.
    pub fn export_state(&self) -> CollectionSnapshot {
        let ready = self.has_first_commit();
        let state = self.inner().state.lock();

        let mut snapshot = CollectionSnapshot::new(self.id());
        snapshot.ready = ready;
        snapshot.synced = state.synced.records.clone();
        snapshot.synced_metadata = state
            .synced
            .metadata
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        snapshot.transactions = state
            .coordinator
            .store()
            .iter()
            .map(|tx| TransactionSnapshot {
                id: tx.id(),
                state: tx.state(),
                created_at: tx.created_at(),
                mutations: tx.mutations().to_vec(),
                error: tx.error().map(|e| e.to_string()),
            })
            .collect();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mutation_fn, ChangeMessage, CollectionConfig, InsertOptions, MutationFnParams,
        PersistError, SyncParams, SyncSource,
    };
    use serde_json::json;

    struct Seeded;

    impl SyncSource for Seeded {
        fn sync(&self, params: SyncParams) {
            let writer = params.writer;
            writer.begin().unwrap();
            writer
                .write(ChangeMessage::insert("b", json!({"text": "Bob"})).with_metadata(json!({"rev": 2})))
                .unwrap();
            writer
                .write(ChangeMessage::insert("a", json!({"text": "Alice"})))
                .unwrap();
            writer.commit().unwrap();
        }
    }

    fn seeded() -> Collection {
        Collection::new(
            CollectionConfig::new("people")
                .with_sync(Seeded)
                .with_on_insert(mutation_fn(|_: MutationFnParams| async {
                    Ok::<_, PersistError>(())
                })),
        )
        .unwrap()
    }

    #[test]
    fn empty_snapshot() {
        let snapshot = CollectionSnapshot::new("people");
        assert_eq!(snapshot.format_version, SNAPSHOT_FORMAT_VERSION);
        assert!(!snapshot.ready);
        assert_eq!(snapshot.pending_count(), 0);
    }

    #[test]
    fn export_synced_data() {
        let snapshot = seeded().export_state();

        assert!(snapshot.ready);
        assert_eq!(snapshot.synced.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(snapshot.synced_metadata["b"], json!({"rev": 2}));
        assert!(snapshot.transactions.is_empty());
    }

    #[tokio::test]
    async fn export_includes_live_transactions() {
        let collection = seeded();
        collection
            .insert(json!({"text": "Carol"}), InsertOptions::with_key("c"))
            .unwrap();

        let snapshot = collection.export_state();
        assert_eq!(snapshot.pending_count(), 1);
        assert_eq!(snapshot.transactions[0].mutations[0].key, "c");
        // synced data is exported without the overlay
        assert!(!snapshot.synced.contains_key("c"));

        let restored = CollectionSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(snapshot, restored);
    }

    #[tokio::test]
    async fn local_data_alone_is_not_ready() {
        struct Silent;
        impl SyncSource for Silent {
            fn sync(&self, _params: SyncParams) {}
        }

        let collection = Collection::new(
            CollectionConfig::new("people")
                .with_sync(Silent)
                .with_on_insert(mutation_fn(|_: MutationFnParams| async {
                    Ok::<_, PersistError>(())
                })),
        )
        .unwrap();
        collection
            .insert(json!({"text": "Dave"}), InsertOptions::with_key("d"))
            .unwrap();

        assert!(collection.is_ready());
        assert!(!collection.export_state().ready);
    }

    #[test]
    fn deterministic_serialization() {
        let first = seeded().export_state().to_json().unwrap();
        let second = seeded().export_state().to_json().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn reject_future_format_version() {
        let json = r#"{
            "formatVersion": 999,
            "collectionId": "people",
            "ready": false,
            "synced": {},
            "syncedMetadata": {},
            "transactions": []
        }"#;

        let result = CollectionSnapshot::from_json(json);
        assert!(matches!(result, Err(Error::InvalidSnapshot(_))));
    }
}
