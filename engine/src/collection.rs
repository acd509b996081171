//! Collection - the optimistic overlay over a synced replica.
//!
//! A collection owns the authoritative records delivered by its sync source
//! and the live transactions created by local mutations. Reads see the
//! overlay: synced records with every non-terminal transaction applied in
//! creation order. The overlay is cached and recomputed on the next read
//! after either input changes.
//!
//! Authoritative rounds are only merged while no transaction is in flight;
//! otherwise they wait in the queue until the last in-flight transaction
//! settles.

use crate::{
    draft::{track_many, Draft},
    error::Result,
    key::{generate_key, KeyResolver, RecordRef},
    mutation::merge_into,
    schema::validate_now,
    sync::{SyncParams, SyncQueue, SyncWriter, SyncedData},
    transaction::{TransactionCoordinator, TransactionHost, TransactionType},
    ChangeMessage, CollectionConfig, Error, Key, OperationType, PendingMutation,
    PersistError, Record, Transaction,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

type FirstCommitCallback = Box<dyn FnOnce() + Send>;

/// A record as seen through the overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub key: Key,
    /// Handle to pass back into `update`/`delete`
    pub record_ref: RecordRef,
    pub value: Value,
}

/// Options for `insert`.
#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    /// Keys for the inserted records, by position. Records past the end get
    /// a generated key.
    pub keys: Vec<Key>,
    pub metadata: Option<Value>,
}

impl InsertOptions {
    pub fn with_key(key: impl Into<Key>) -> Self {
        Self {
            keys: vec![key.into()],
            metadata: None,
        }
    }
}

/// Options for `update`.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub metadata: Option<Value>,
}

/// Options for `delete`.
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub metadata: Option<Value>,
}

/// What to delete: a key, or a record handed out by the collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Key(Key),
    Ref(RecordRef),
}

impl From<&str> for Target {
    fn from(key: &str) -> Self {
        Target::Key(key.to_string())
    }
}

impl From<String> for Target {
    fn from(key: String) -> Self {
        Target::Key(key)
    }
}

impl From<RecordRef> for Target {
    fn from(record_ref: RecordRef) -> Self {
        Target::Ref(record_ref)
    }
}

impl From<&Row> for Target {
    fn from(row: &Row) -> Self {
        Target::Ref(row.record_ref)
    }
}

pub(crate) struct CollectionState {
    pub(crate) synced: SyncedData,
    syncs: SyncQueue,
    pub(crate) coordinator: TransactionCoordinator,
    resolver: KeyResolver,
    /// Cached overlay; `None` when an input changed since the last read
    view: Option<BTreeMap<Key, Record>>,
    first_commit_seen: bool,
    first_commit_callbacks: Vec<FirstCommitCallback>,
}

impl CollectionState {
    fn new() -> Self {
        Self {
            synced: SyncedData::new(),
            syncs: SyncQueue::new(),
            coordinator: TransactionCoordinator::new(),
            resolver: KeyResolver::new(),
            view: None,
            first_commit_seen: false,
            first_commit_callbacks: Vec::new(),
        }
    }

    fn invalidate(&mut self) {
        self.view = None;
    }

    fn compose(&mut self) -> BTreeMap<Key, Record> {
        let mut view = self.synced.records.clone();
        for transaction in self.coordinator.store().active() {
            for mutation in transaction.mutations() {
                mutation.apply_to(&mut view);
            }
        }
        self.resolver.retain(|key| view.contains_key(key));
        for key in view.keys() {
            self.resolver.track(key);
        }
        view
    }

    fn ensure_view(&mut self) {
        if self.view.is_none() {
            let view = self.compose();
            self.view = Some(view);
        }
    }

    fn view_record(&self, key: &str) -> Option<&Record> {
        self.view.as_ref().and_then(|view| view.get(key))
    }

    fn rows(&mut self) -> Vec<Row> {
        self.ensure_view();
        let CollectionState { view, resolver, .. } = self;
        view.iter()
            .flatten()
            .map(|(key, record)| Row {
                key: key.clone(),
                record_ref: resolver.track(key),
                value: Value::Object(record.clone()),
            })
            .collect()
    }

    fn is_ready(&mut self) -> bool {
        self.ensure_view();
        self.first_commit_seen || self.view.as_ref().is_some_and(|view| !view.is_empty())
    }

    /// Fold every committed round into the synced data, if no transaction is
    /// in flight. Returns the first-commit callbacks to fire once the lock is
    /// released.
    fn try_merge(&mut self, id: &str, ready: &watch::Sender<bool>) -> Vec<FirstCommitCallback> {
        if !self.coordinator.store().all_settled() {
            if self.syncs.has_committed() {
                debug!(
                    collection = %id,
                    in_flight = self.coordinator.store().active().count(),
                    "merge deferred until transactions settle"
                );
            }
            return Vec::new();
        }

        let pruned = self.coordinator.store_mut().prune_settled();
        if pruned > 0 {
            self.invalidate();
        }
        if !self.syncs.has_committed() {
            return Vec::new();
        }

        let changes = self.syncs.take_committed();
        let count = changes.len();
        for change in changes {
            let key = self.synced.apply(change);
            if self.synced.records.contains_key(&key) {
                self.resolver.track(&key);
            } else {
                self.resolver.invalidate(&key);
            }
        }
        self.invalidate();
        debug!(collection = %id, changes = count, "merged synced changes");

        if self.first_commit_seen {
            return Vec::new();
        }
        self.first_commit_seen = true;
        ready.send_replace(true);
        info!(collection = %id, records = self.synced.records.len(), "first commit merged");
        std::mem::take(&mut self.first_commit_callbacks)
    }
}

pub(crate) struct CollectionInner {
    config: CollectionConfig,
    pub(crate) state: Mutex<CollectionState>,
    ready: watch::Sender<bool>,
}

impl TransactionHost for CollectionInner {
    fn settle(&self, transaction: &Transaction, outcome: std::result::Result<(), PersistError>) {
        let callbacks = {
            let mut state = self.state.lock();
            if let Err(err) = transaction.finish(outcome) {
                warn!(transaction = %transaction.id(), error = %err, "could not settle transaction");
            }
            state.invalidate();
            state.try_merge(&self.config.id, &self.ready)
        };
        for callback in callbacks {
            callback();
        }
    }
}

/// An optimistic collection. Clones share the same instance.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl Collection {
    /// Create a collection and register it with its sync source.
    pub fn new(config: CollectionConfig) -> Result<Self> {
        let sync = config.sync.clone().ok_or(Error::MissingSyncConfig)?;
        let (ready, _) = watch::channel(false);
        let collection = Self {
            inner: Arc::new(CollectionInner {
                config,
                state: Mutex::new(CollectionState::new()),
                ready,
            }),
        };

        debug!(collection = %collection.id(), "registering with sync source");
        sync.sync(SyncParams {
            collection_id: collection.id().to_string(),
            writer: SyncWriter::new(Arc::downgrade(&collection.inner)),
        });
        Ok(collection)
    }

    pub(crate) fn from_inner(inner: Arc<CollectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &CollectionInner {
        &self.inner
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Snapshot of the overlay keyed by record key.
    pub fn state(&self) -> BTreeMap<Key, Value> {
        let mut state = self.inner.state.lock();
        state.ensure_view();
        state
            .view
            .iter()
            .flatten()
            .map(|(key, record)| (key.clone(), Value::Object(record.clone())))
            .collect()
    }

    /// Snapshot of the overlay as rows, in key order.
    pub fn to_array(&self) -> Vec<Row> {
        self.inner.state.lock().rows()
    }

    /// One row of the overlay.
    pub fn get(&self, key: &str) -> Option<Row> {
        let mut state = self.inner.state.lock();
        state.ensure_view();
        let value = Value::Object(state.view_record(key)?.clone());
        Some(Row {
            key: key.to_string(),
            record_ref: state.resolver.track(key),
            value,
        })
    }

    /// Current handle of a key in the overlay.
    pub fn record_ref(&self, key: &str) -> Option<RecordRef> {
        let mut state = self.inner.state.lock();
        state.ensure_view();
        state.resolver.ref_for(key)
    }

    /// Snapshot of the authoritative records only.
    pub fn synced_state(&self) -> BTreeMap<Key, Value> {
        let state = self.inner.state.lock();
        state
            .synced
            .records
            .iter()
            .map(|(key, record)| (key.clone(), Value::Object(record.clone())))
            .collect()
    }

    /// Backend metadata last received for a key.
    pub fn synced_metadata(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().synced.metadata.get(key).cloned()
    }

    /// Live transactions, oldest first. Settled ones stay listed until the
    /// next merge attempt.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.inner
            .state
            .lock()
            .coordinator
            .store()
            .iter()
            .cloned()
            .collect()
    }

    /// Whether the overlay holds data or a first round has been merged.
    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().is_ready()
    }

    /// [`state`](Self::state), once the collection is ready.
    pub async fn state_when_ready(&self) -> BTreeMap<Key, Value> {
        self.wait_ready().await;
        self.state()
    }

    /// [`to_array`](Self::to_array), once the collection is ready.
    pub async fn to_array_when_ready(&self) -> Vec<Row> {
        self.wait_ready().await;
        self.to_array()
    }

    async fn wait_ready(&self) {
        let mut rx = self.inner.ready.subscribe();
        if self.is_ready() {
            return;
        }
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Whether the first authoritative round has been merged.
    pub fn has_first_commit(&self) -> bool {
        self.inner.state.lock().first_commit_seen
    }

    /// Wait until the first authoritative round has been merged. Local
    /// optimistic data does not count.
    pub(crate) async fn wait_first_commit(&self) {
        let mut rx = self.inner.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Run `callback` once the first authoritative round has been merged.
    ///
    /// Callbacks registered before that fire together, in registration
    /// order. A callback registered afterwards runs immediately and
    /// synchronously, on the caller's thread, before this returns.
    pub fn on_first_commit(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        if state.first_commit_seen {
            drop(state);
            callback();
            return;
        }
        state.first_commit_callbacks.push(Box::new(callback));
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Insert one record.
    pub fn insert(&self, record: Value, options: InsertOptions) -> Result<Transaction> {
        self.insert_many(vec![record], options)
    }

    /// Insert several records in one transaction.
    pub fn insert_many(&self, records: Vec<Value>, options: InsertOptions) -> Result<Transaction> {
        let persist = self.inner.config.mutation_fn(OperationType::Insert)?;
        let runtime = current_runtime()?;
        if records.is_empty() {
            return Err(Error::EmptyTransaction);
        }
        if options.keys.len() > records.len() {
            return Err(Error::KeyCountMismatch {
                keys: options.keys.len(),
                records: records.len(),
            });
        }

        let sync_metadata = self
            .inner
            .config
            .sync
            .as_ref()
            .and_then(|sync| sync.sync_metadata());

        let mut mutations = Vec::with_capacity(records.len());
        for (position, value) in records.into_iter().enumerate() {
            let value = match &self.inner.config.schema {
                Some(schema) => validate_now(schema.as_ref(), &value, OperationType::Insert)?,
                None => value,
            };
            let key = match options.keys.get(position) {
                Some(key) => key.clone(),
                None => generate_key(&value),
            };
            let record = into_record(value)?;
            mutations.push(
                PendingMutation::insert(key, record)
                    .with_metadata(options.metadata.clone())
                    .with_sync_metadata(sync_metadata.clone()),
            );
        }

        self.commit_transaction(mutations, &runtime, persist, |_| Ok(()))
    }

    /// Update one record through a draft.
    pub fn update<F>(&self, record: RecordRef, options: UpdateOptions, mutator: F) -> Result<Transaction>
    where
        F: FnOnce(&mut Draft<'_>),
    {
        self.update_many(&[record], options, |drafts| {
            if let Some(draft) = drafts.first_mut() {
                mutator(draft);
            }
        })
    }

    /// Update several records with one mutator over their drafts.
    ///
    /// Records the mutator leaves untouched are skipped. Fails with
    /// [`Error::NoChanges`] if nothing changed at all.
    pub fn update_many<F>(
        &self,
        records: &[RecordRef],
        options: UpdateOptions,
        mutator: F,
    ) -> Result<Transaction>
    where
        F: FnOnce(&mut [Draft<'_>]),
    {
        let persist = self.inner.config.mutation_fn(OperationType::Update)?;
        let runtime = current_runtime()?;
        if records.is_empty() {
            return Err(Error::EmptyTransaction);
        }

        let (keys, baselines, sync_metadata) = {
            let mut state = self.inner.state.lock();
            state.ensure_view();
            let keys = records
                .iter()
                .map(|r| state.resolver.resolve(*r))
                .collect::<Result<Vec<_>>>()?;
            let baselines: Vec<Record> = keys
                .iter()
                .map(|key| state.view_record(key).cloned().unwrap_or_default())
                .collect();
            let sync_metadata: Vec<Option<Value>> = keys
                .iter()
                .map(|key| state.synced.metadata.get(key).cloned())
                .collect();
            (keys, baselines, sync_metadata)
        };

        // The mutator is caller code; it runs without the state lock.
        let diffs = track_many(&baselines, mutator);

        let mut mutations = Vec::new();
        for (((key, baseline), diff), sync_metadata) in
            keys.into_iter().zip(baselines).zip(diffs).zip(sync_metadata)
        {
            let Some(changes) = diff else { continue };
            if let Some(schema) = &self.inner.config.schema {
                let mut merged = baseline.clone();
                merge_into(&mut merged, &changes);
                validate_now(schema.as_ref(), &Value::Object(merged), OperationType::Update)?;
            }
            mutations.push(
                PendingMutation::update(key, baseline, changes)
                    .with_metadata(options.metadata.clone())
                    .with_sync_metadata(sync_metadata),
            );
        }
        if mutations.is_empty() {
            return Err(Error::NoChanges);
        }

        // Refs must still be tracked; a delete may have landed meanwhile.
        self.commit_transaction(mutations, &runtime, persist, |state| {
            records
                .iter()
                .try_for_each(|r| state.resolver.resolve(*r).map(|_| ()))
        })
    }

    /// Delete one record by key or handle.
    pub fn delete(&self, target: impl Into<Target>, options: DeleteOptions) -> Result<Transaction> {
        self.delete_many([target], options)
    }

    /// Delete several records in one transaction.
    pub fn delete_many<I, T>(&self, targets: I, options: DeleteOptions) -> Result<Transaction>
    where
        I: IntoIterator<Item = T>,
        T: Into<Target>,
    {
        let persist = self.inner.config.mutation_fn(OperationType::Delete)?;
        let runtime = current_runtime()?;
        let targets: Vec<Target> = targets.into_iter().map(Into::into).collect();
        if targets.is_empty() {
            return Err(Error::EmptyTransaction);
        }

        let (transaction, keys) = {
            let mut state = self.inner.state.lock();
            state.ensure_view();

            let mut mutations = Vec::with_capacity(targets.len());
            for target in targets {
                let key = match target {
                    Target::Key(key) => key,
                    Target::Ref(r) => state.resolver.resolve(r)?,
                };
                let original = state.view_record(&key).cloned().unwrap_or_default();
                let sync_metadata = state.synced.metadata.get(&key).cloned();
                mutations.push(
                    PendingMutation::delete(key, original)
                        .with_metadata(options.metadata.clone())
                        .with_sync_metadata(sync_metadata),
                );
            }
            let keys: Vec<Key> = mutations.iter().map(|m| m.key.clone()).collect();

            let transaction = state.coordinator.apply_transaction(
                &self.inner.config.id,
                mutations,
                TransactionType::Ordered,
            )?;
            for key in &keys {
                state.resolver.invalidate(key);
            }
            state.invalidate();
            (transaction, keys)
        };

        debug!(collection = %self.id(), keys = ?keys, "delete applied optimistically");
        TransactionCoordinator::submit(
            &runtime,
            transaction.clone(),
            persist,
            Arc::downgrade(&self.inner),
        );
        Ok(transaction)
    }

    fn commit_transaction<C>(
        &self,
        mutations: Vec<PendingMutation>,
        runtime: &tokio::runtime::Handle,
        persist: crate::MutationFn,
        check: C,
    ) -> Result<Transaction>
    where
        C: FnOnce(&mut CollectionState) -> Result<()>,
    {
        let transaction = {
            let mut state = self.inner.state.lock();
            state.ensure_view();
            check(&mut state)?;
            let transaction = state.coordinator.apply_transaction(
                &self.inner.config.id,
                mutations,
                TransactionType::Ordered,
            )?;
            state.invalidate();
            transaction
        };

        TransactionCoordinator::submit(
            runtime,
            transaction.clone(),
            persist,
            Arc::downgrade(&self.inner),
        );
        Ok(transaction)
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    pub(crate) fn begin_sync(&self) -> Result<()> {
        self.inner.state.lock().syncs.begin()?;
        debug!(collection = %self.id(), "sync round opened");
        Ok(())
    }

    pub(crate) fn write_sync(&self, change: ChangeMessage) -> Result<()> {
        self.inner.state.lock().syncs.write(change)
    }

    pub(crate) fn commit_sync(&self) -> Result<()> {
        let callbacks = {
            let mut state = self.inner.state.lock();
            state.syncs.commit()?;
            debug!(collection = %self.id(), "sync round committed");
            state.try_merge(&self.inner.config.id, &self.inner.ready)
        };
        for callback in callbacks {
            callback();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn current_runtime() -> Result<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)
}

fn into_record(value: Value) -> Result<Record> {
    match value {
        Value::Object(record) => Ok(record),
        other => Err(Error::InvalidRecord(format!(
            "records must be JSON objects, got {other}"
        ))),
    }
}
