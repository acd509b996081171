//! Ingestion of authoritative data from a sync source.
//!
//! A sync source delivers rounds of changes through a [`SyncWriter`]:
//! `begin`, any number of `write`s, then `commit`. Committed rounds queue up
//! in a [`SyncQueue`] until the collection is allowed to fold them into its
//! [`SyncedData`].

use crate::{
    collection::{Collection, CollectionInner},
    error::Result,
    key::generate_key,
    mutation::merge_into,
    ChangeMessage, CollectionId, Error, Key, OperationType, Record,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Weak;

/// Upstream source of authoritative data for one collection.
pub trait SyncSource: Send + Sync {
    /// Called once when the collection is constructed.
    ///
    /// Implementations keep the writer and drive `begin/write/commit`
    /// whenever they have data, from any task or thread.
    fn sync(&self, params: SyncParams);

    /// Backend metadata to attach to newly inserted records.
    fn sync_metadata(&self) -> Option<Value> {
        None
    }
}

/// What a sync source receives on registration.
pub struct SyncParams {
    pub collection_id: CollectionId,
    pub writer: SyncWriter,
}

/// Ingestion handle bound to one collection.
///
/// Holds the collection weakly; once the collection is dropped every call
/// fails with [`Error::CollectionClosed`].
#[derive(Clone)]
pub struct SyncWriter {
    collection: Weak<CollectionInner>,
}

impl SyncWriter {
    pub(crate) fn new(collection: Weak<CollectionInner>) -> Self {
        Self { collection }
    }

    fn target(&self) -> Result<Collection> {
        self.collection
            .upgrade()
            .map(Collection::from_inner)
            .ok_or(Error::CollectionClosed)
    }

    /// Open a new round. Fails if a round is already open.
    pub fn begin(&self) -> Result<()> {
        self.target()?.begin_sync()
    }

    /// Append a change to the open round.
    pub fn write(&self, change: ChangeMessage) -> Result<()> {
        self.target()?.write_sync(change)
    }

    /// Commit the open round and try to merge it.
    pub fn commit(&self) -> Result<()> {
        self.target()?.commit_sync()
    }

    /// The collection this writer feeds, if it is still alive.
    pub fn collection(&self) -> Option<Collection> {
        self.target().ok()
    }
}

impl std::fmt::Debug for SyncWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWriter")
            .field("alive", &(self.collection.strong_count() > 0))
            .finish()
    }
}

/// One round of changes between `begin` and `commit`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingSync {
    pub committed: bool,
    pub changes: Vec<ChangeMessage>,
}

/// Rounds received but not yet merged, oldest first.
///
/// At most one round is open at a time, and it is always the newest.
#[derive(Debug, Default)]
pub struct SyncQueue {
    rounds: Vec<PendingSync>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.rounds.last().is_some_and(|r| !r.committed) {
            return Err(Error::SyncAlreadyOpen);
        }
        self.rounds.push(PendingSync::default());
        Ok(())
    }

    pub fn write(&mut self, change: ChangeMessage) -> Result<()> {
        let round = self.open_round()?;
        if change.operation != OperationType::Delete && !change.value.is_object() {
            return Err(Error::InvalidRecord(format!(
                "{} change value must be an object",
                change.operation
            )));
        }
        round.changes.push(change);
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.open_round()?.committed = true;
        Ok(())
    }

    fn open_round(&mut self) -> Result<&mut PendingSync> {
        let round = self.rounds.last_mut().ok_or(Error::NoPendingSync)?;
        if round.committed {
            return Err(Error::SyncAlreadyCommitted);
        }
        Ok(round)
    }

    /// Whether any committed round is waiting to be merged.
    pub fn has_committed(&self) -> bool {
        self.rounds.iter().any(|r| r.committed)
    }

    /// Remove every committed round and return their changes in order.
    /// An open round stays queued.
    pub fn take_committed(&mut self) -> Vec<ChangeMessage> {
        let (committed, open): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.rounds).into_iter().partition(|r| r.committed);
        self.rounds = open;
        committed.into_iter().flat_map(|r| r.changes).collect()
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}

/// The last authoritative state confirmed by the backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncedData {
    pub records: BTreeMap<Key, Record>,
    pub metadata: HashMap<Key, Value>,
}

impl SyncedData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one change in and return the key it touched.
    ///
    /// Inserts replace the record, updates merge onto it, deletes remove it
    /// along with its metadata.
    pub fn apply(&mut self, change: ChangeMessage) -> Key {
        let key = change.key.unwrap_or_else(|| generate_key(&change.value));
        match change.operation {
            OperationType::Insert => {
                if let Value::Object(record) = change.value {
                    self.records.insert(key.clone(), record);
                }
            }
            OperationType::Update => {
                if let Value::Object(changes) = change.value {
                    merge_into(self.records.entry(key.clone()).or_default(), &changes);
                }
            }
            OperationType::Delete => {
                self.records.remove(&key);
                self.metadata.remove(&key);
                return key;
            }
        }
        if let Some(metadata) = change.metadata {
            self.metadata.insert(key.clone(), metadata);
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn protocol_order_is_enforced() {
        let mut queue = SyncQueue::new();

        assert_eq!(
            queue.write(ChangeMessage::delete("k")),
            Err(Error::NoPendingSync)
        );
        assert_eq!(queue.commit(), Err(Error::NoPendingSync));

        queue.begin().unwrap();
        assert_eq!(queue.begin(), Err(Error::SyncAlreadyOpen));
        queue.write(ChangeMessage::insert("k", json!({"a": 1}))).unwrap();
        queue.commit().unwrap();

        assert_eq!(queue.commit(), Err(Error::SyncAlreadyCommitted));
        assert_eq!(
            queue.write(ChangeMessage::delete("k")),
            Err(Error::SyncAlreadyCommitted)
        );

        // a new round may start once the previous one is committed
        queue.begin().unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn write_rejects_non_object_values() {
        let mut queue = SyncQueue::new();
        queue.begin().unwrap();

        let err = queue.write(ChangeMessage::insert("k", json!(5))).unwrap_err();
        assert!(matches!(err, Error::InvalidRecord(_)));
        queue.write(ChangeMessage::delete("k")).unwrap();
    }

    #[test]
    fn take_committed_keeps_open_round() {
        let mut queue = SyncQueue::new();
        queue.begin().unwrap();
        queue.write(ChangeMessage::insert("a", json!({}))).unwrap();
        queue.commit().unwrap();
        queue.begin().unwrap();
        queue.write(ChangeMessage::insert("b", json!({}))).unwrap();
        queue.commit().unwrap();
        queue.begin().unwrap();
        queue.write(ChangeMessage::insert("c", json!({}))).unwrap();

        assert!(queue.has_committed());
        let changes = queue.take_committed();
        let keys: Vec<_> = changes.iter().filter_map(|c| c.key.clone()).collect();
        assert_eq!(keys, vec!["a", "b"]);

        assert_eq!(queue.len(), 1);
        assert!(!queue.has_committed());
        queue.commit().unwrap();
        assert_eq!(queue.take_committed().len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn synced_data_apply_semantics() {
        let mut data = SyncedData::new();

        data.apply(ChangeMessage::insert("k", json!({"a": 1, "b": 2})).with_metadata(json!({"rev": 1})));
        data.apply(ChangeMessage::update("k", json!({"b": 3})));
        assert_eq!(Value::Object(data.records["k"].clone()), json!({"a": 1, "b": 3}));
        assert_eq!(data.metadata["k"], json!({"rev": 1}));

        // insert overwrites instead of merging
        data.apply(ChangeMessage::insert("k", json!({"c": 4})));
        assert_eq!(Value::Object(data.records["k"].clone()), json!({"c": 4}));

        data.apply(ChangeMessage::delete("k"));
        assert!(data.records.is_empty());
        assert!(data.metadata.is_empty());
    }

    #[test]
    fn change_without_key_is_hashed() {
        let mut data = SyncedData::new();
        let value = json!({"text": "Buy milk"});
        let key = data.apply(ChangeMessage {
            key: None,
            value: value.clone(),
            operation: OperationType::Insert,
            metadata: None,
        });

        assert_eq!(key, generate_key(&value));
        assert!(data.records.contains_key(&key));
    }
}
