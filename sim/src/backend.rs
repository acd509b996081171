//! In-process loopback backend.
//!
//! Plays both sides of a real backend: it is the collection's sync source,
//! and it provides the persistence functions. An accepted write is applied
//! to the backend's own table and echoed back through the sync source as
//! one round, before the persistence call resolves.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_engine::{
    mutation_fn, ChangeMessage, MutationFn, MutationFnParams, OperationType, PendingMutation,
    PersistError, SyncParams, SyncSource, SyncWriter,
};

#[derive(Debug, Clone, PartialEq)]
struct Row {
    value: Value,
    rev: u64,
}

#[derive(Default)]
struct Shared {
    writer: Option<SyncWriter>,
    table: BTreeMap<String, Row>,
    rev: u64,
}

/// Backend that answers after `latency` and rejects every `fail_every`th call.
pub struct LoopbackBackend {
    latency: Duration,
    fail_every: u64,
    calls: AtomicU64,
    shared: Mutex<Shared>,
}

impl LoopbackBackend {
    pub fn new(latency: Duration, fail_every: u64) -> Self {
        Self {
            latency,
            fail_every,
            calls: AtomicU64::new(0),
            shared: Mutex::new(Shared::default()),
        }
    }

    /// Seed a row the collection receives on registration.
    pub fn with_row(self, key: impl Into<String>, value: Value) -> Self {
        {
            let mut shared = self.shared.lock();
            shared.rev += 1;
            let rev = shared.rev;
            shared.table.insert(key.into(), Row { value, rev });
        }
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Current table contents, as the backend sees them.
    pub fn table(&self) -> BTreeMap<String, Value> {
        self.shared
            .lock()
            .table
            .iter()
            .map(|(key, row)| (key.clone(), row.value.clone()))
            .collect()
    }

    /// Persistence function backed by this instance.
    pub fn mutation_fn(self: &Arc<Self>) -> MutationFn {
        let backend = self.clone();
        mutation_fn(move |params: MutationFnParams| {
            let backend = backend.clone();
            async move { backend.persist(params).await }
        })
    }

    async fn persist(&self, params: MutationFnParams) -> Result<(), PersistError> {
        tokio::time::sleep(self.latency).await;

        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_every > 0 && call % self.fail_every == 0 {
            tracing::warn!(
                call,
                operation = %params.operation,
                "injecting persistence failure"
            );
            return Err(PersistError::new(format!("injected failure on call {call}")));
        }

        self.accept(&params.mutations);
        tracing::debug!(
            call,
            operation = %params.operation,
            mutations = params.mutations.len(),
            "persisted and echoed"
        );
        Ok(())
    }

    /// Apply `mutations` to the table and echo them as one sync round.
    fn accept(&self, mutations: &[PendingMutation]) {
        let mut shared = self.shared.lock();
        let mut changes = Vec::with_capacity(mutations.len());

        for mutation in mutations {
            shared.rev += 1;
            let rev = shared.rev;
            let change = match mutation.operation {
                OperationType::Insert => {
                    shared.table.insert(
                        mutation.key.clone(),
                        Row {
                            value: mutation.modified.clone(),
                            rev,
                        },
                    );
                    ChangeMessage::insert(mutation.key.clone(), mutation.modified.clone())
                }
                OperationType::Update => {
                    shared.table.insert(
                        mutation.key.clone(),
                        Row {
                            value: mutation.modified.clone(),
                            rev,
                        },
                    );
                    ChangeMessage::update(mutation.key.clone(), mutation.changes.clone())
                }
                OperationType::Delete => {
                    shared.table.remove(&mutation.key);
                    ChangeMessage::delete(mutation.key.clone())
                }
            };
            changes.push(change.with_metadata(json!({ "rev": rev })));
        }

        // The lock is held across the round so concurrent echoes never interleave.
        if let Some(writer) = &shared.writer {
            if let Err(err) = deliver(writer, changes) {
                tracing::warn!(error = %err, "echo not delivered");
            }
        }
    }
}

impl SyncSource for LoopbackBackend {
    fn sync(&self, params: SyncParams) {
        let mut shared = self.shared.lock();
        let initial = shared
            .table
            .iter()
            .map(|(key, row)| {
                ChangeMessage::insert(key.clone(), row.value.clone())
                    .with_metadata(json!({ "rev": row.rev }))
            })
            .collect();

        tracing::info!(
            collection = %params.collection_id,
            rows = shared.table.len(),
            "collection connected to loopback backend"
        );
        if let Err(err) = deliver(&params.writer, initial) {
            tracing::warn!(error = %err, "initial load not delivered");
        }
        shared.writer = Some(params.writer);
    }

    fn sync_metadata(&self) -> Option<Value> {
        Some(json!({ "origin": "loopback" }))
    }
}

fn deliver(writer: &SyncWriter, changes: Vec<ChangeMessage>) -> tandem_engine::error::Result<()> {
    writer.begin()?;
    for change in changes {
        writer.write(change)?;
    }
    writer.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_engine::{
        Collection, CollectionConfig, DeleteOptions, Error, InsertOptions, TransactionState,
        UpdateOptions,
    };

    fn collection(backend: &Arc<LoopbackBackend>) -> Collection {
        Collection::new(
            CollectionConfig::new("todos")
                .with_shared_sync(backend.clone())
                .with_on_insert(backend.mutation_fn())
                .with_on_update(backend.mutation_fn())
                .with_on_delete(backend.mutation_fn()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn seeded_rows_arrive_on_registration() {
        let backend = Arc::new(
            LoopbackBackend::new(Duration::ZERO, 0).with_row("w", json!({"text": "welcome"})),
        );
        let todos = collection(&backend);

        assert!(todos.is_ready());
        assert_eq!(todos.state()["w"], json!({"text": "welcome"}));
        assert_eq!(todos.synced_metadata("w"), Some(json!({"rev": 1})));
    }

    #[tokio::test]
    async fn accepted_writes_are_echoed() {
        let backend = Arc::new(LoopbackBackend::new(Duration::from_millis(1), 0));
        let todos = collection(&backend);

        let tx = todos
            .insert(json!({"text": "Buy milk"}), InsertOptions::with_key("m"))
            .unwrap();
        assert_eq!(tx.mutations()[0].sync_metadata, Some(json!({"origin": "loopback"})));
        tx.is_persisted().await.unwrap();

        assert_eq!(todos.synced_state()["m"], json!({"text": "Buy milk"}));
        assert_eq!(backend.table()["m"], json!({"text": "Buy milk"}));

        let r = todos.record_ref("m").unwrap();
        todos
            .update(r, UpdateOptions::default(), |d| d.set("completed", true))
            .unwrap()
            .is_persisted()
            .await
            .unwrap();
        assert_eq!(
            todos.synced_state()["m"],
            json!({"text": "Buy milk", "completed": true})
        );

        todos
            .delete("m", DeleteOptions::default())
            .unwrap()
            .is_persisted()
            .await
            .unwrap();
        assert!(todos.synced_state().is_empty());
        assert!(backend.table().is_empty());
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn every_nth_call_is_rejected() {
        let backend = Arc::new(LoopbackBackend::new(Duration::ZERO, 2));
        let todos = collection(&backend);

        let first = todos
            .insert(json!({"n": 1}), InsertOptions::with_key("a"))
            .unwrap();
        first.is_persisted().await.unwrap();

        let second = todos
            .insert(json!({"n": 2}), InsertOptions::with_key("b"))
            .unwrap();
        let err = second.is_persisted().await.unwrap_err();

        assert_eq!(second.state(), TransactionState::Failed);
        assert_eq!(err, Error::Persistence("injected failure on call 2".into()));
        assert!(todos.state().contains_key("a"));
        assert!(!todos.state().contains_key("b"));
        assert!(!backend.table().contains_key("b"));
    }
}
