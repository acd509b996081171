//! Property-based tests for tandem-engine

use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tandem_engine::{
    mutation_fn, track_single, ChangeMessage, Collection, CollectionConfig, DeleteOptions,
    InsertOptions, MutationFnParams, PersistError, Record, SyncParams, SyncSource, SyncWriter,
    UpdateOptions,
};

/// Seeds `count` records on registration and keeps the writer for later rounds.
#[derive(Clone)]
struct Seeded {
    count: usize,
    writer: Arc<Mutex<Option<SyncWriter>>>,
}

impl Seeded {
    fn new(count: usize) -> Self {
        Self {
            count,
            writer: Arc::default(),
        }
    }

    /// Commit one round holding `change`.
    fn round(&self, change: ChangeMessage) {
        let writer = self.writer.lock().clone().unwrap();
        writer.begin().unwrap();
        writer.write(change).unwrap();
        writer.commit().unwrap();
    }
}

impl SyncSource for Seeded {
    fn sync(&self, params: SyncParams) {
        let writer = params.writer;
        writer.begin().unwrap();
        for i in 0..self.count {
            writer
                .write(ChangeMessage::insert(seed_key(i), seed_value(i)))
                .unwrap();
        }
        writer.commit().unwrap();
        *self.writer.lock() = Some(writer);
    }
}

fn seed_key(i: usize) -> String {
    format!("seed-{i}")
}

fn seed_value(i: usize) -> Value {
    json!({"n": i, "done": false})
}

#[derive(Debug, Clone)]
enum Op {
    Insert(String),
    Update(String),
    Delete,
    /// Remote round on a key no local op touches
    Merge(String),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(Op::Insert),
        "[a-z]{1,8}".prop_map(Op::Update),
        Just(Op::Delete),
        "[a-z]{1,8}".prop_map(Op::Merge),
    ]
}

/// Persistence that never resolves, so every transaction stays live.
fn collection(count: usize) -> Collection {
    collection_with(Seeded::new(count))
}

fn collection_with(sync: Seeded) -> Collection {
    let never = mutation_fn(|_: MutationFnParams| async {
        futures::future::pending::<()>().await;
        Ok::<_, PersistError>(())
    });
    Collection::new(
        CollectionConfig::new("items")
            .with_sync(sync)
            .with_on_insert(never.clone())
            .with_on_update(never.clone())
            .with_on_delete(never),
    )
    .unwrap()
}

fn object(value: Value) -> Record {
    match value {
        Value::Object(record) => record,
        _ => Record::new(),
    }
}

proptest! {
    #[test]
    fn prop_overlay_is_synced_plus_mutations(ops in prop::collection::vec(arb_op(), 1..16)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _guard = runtime.enter();
        let sync = Seeded::new(ops.len());
        let collection = collection_with(sync.clone());

        // independent model of the expected overlay
        let mut expected: BTreeMap<String, Value> =
            (0..ops.len()).map(|i| (seed_key(i), seed_value(i))).collect();
        let mut submitted = 0;

        for (i, op) in ops.iter().enumerate() {
            match op {
                Op::Insert(text) => {
                    let key = format!("new-{i}");
                    collection
                        .insert(json!({"text": text}), InsertOptions::with_key(key.clone()))
                        .unwrap();
                    expected.insert(key, json!({"text": text}));
                }
                Op::Update(note) => {
                    let r = collection.record_ref(&seed_key(i)).unwrap();
                    collection
                        .update(r, UpdateOptions::default(), |d| {
                            d.set("done", true);
                            d.set("note", note.clone());
                        })
                        .unwrap();
                    expected.insert(seed_key(i), json!({"n": i, "done": true, "note": note}));
                }
                Op::Delete => {
                    collection.delete(seed_key(i), DeleteOptions::default()).unwrap();
                    expected.remove(&seed_key(i));
                }
                Op::Merge(text) => {
                    let key = format!("remote-{i}");
                    sync.round(ChangeMessage::insert(key.clone(), json!({"text": text})));
                    // deferred while any transaction is live
                    if submitted == 0 {
                        expected.insert(key, json!({"text": text}));
                    }
                    continue;
                }
            }
            submitted += 1;
        }

        prop_assert_eq!(&collection.state(), &expected);

        // replaying the live mutations over the synced data gives the same view
        let mut replayed: BTreeMap<String, Record> = collection
            .synced_state()
            .into_iter()
            .map(|(k, v)| (k, object(v)))
            .collect();
        for tx in collection.transactions() {
            for mutation in tx.mutations() {
                mutation.apply_to(&mut replayed);
            }
        }
        let replayed: BTreeMap<String, Value> =
            replayed.into_iter().map(|(k, v)| (k, Value::Object(v))).collect();
        prop_assert_eq!(collection.state(), replayed);
        prop_assert_eq!(collection.transactions().len(), submitted);
    }

    #[test]
    fn prop_state_is_idempotent(count in 0usize..20) {
        let collection = collection(count);
        let first = collection.state();
        let second = collection.state();
        prop_assert_eq!(first.len(), count);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_draft_diff_is_minimal(
        baseline in prop::collection::btree_map("[a-e]", 0i64..4, 0..5),
        edits in prop::collection::vec(("[a-e]", 0i64..4), 0..8),
    ) {
        let baseline: Record = baseline
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect();

        let mut shadow = baseline.clone();
        for (field, value) in &edits {
            shadow.insert(field.clone(), Value::from(*value));
        }

        let changes = track_single(&baseline, |draft| {
            for (field, value) in &edits {
                draft.set(field.clone(), *value);
            }
        });

        for (field, value) in &changes {
            prop_assert_ne!(baseline.get(field), Some(value));
            prop_assert_eq!(shadow.get(field), Some(value));
        }
        for (field, value) in &shadow {
            if baseline.get(field) != Some(value) {
                prop_assert!(changes.contains_key(field));
            }
        }
    }
}
