//! # Tandem Engine
//!
//! An optimistic overlay for locally replicated collections.
//!
//! A collection keeps two things: the records its sync source has confirmed,
//! and the local transactions still waiting for the backend. Reads return
//! the overlay of both, so a local change is visible the moment it is made
//! and disappears again if the backend rejects it.
//!
//! ## Core Concepts
//!
//! ### Ingestion
//!
//! A [`SyncSource`] receives a [`SyncWriter`] once, at construction, and
//! feeds authoritative rounds through `begin`, `write` and `commit`. Rounds
//! are merged only while no local transaction is in flight, so confirmed
//! data never overwrites an optimistic change mid-flight.
//!
//! ### Transactions
//!
//! [`Collection::insert`], [`Collection::update`] and [`Collection::delete`]
//! each create one [`Transaction`] of [`PendingMutation`]s and hand it to
//! the matching persistence function ([`MutationFn`]) on the current tokio
//! runtime. The transaction is the handle to await:
//! - [`TransactionState::Pending`] - applied to the overlay
//! - [`TransactionState::Persisting`] - persistence function running
//! - [`TransactionState::Completed`] - accepted by the backend
//! - [`TransactionState::Failed`] - rejected; its effect is retracted
//!
//! ### Drafts
//!
//! Updates never take a replacement record. A mutator edits a [`Draft`] of
//! the current value and only the fields that differ afterwards become the
//! mutation.
//!
//! ## Quick Start
//!
//! ```rust
//! use serde_json::json;
//! use tandem_engine::{
//!     mutation_fn, ChangeMessage, Collection, CollectionConfig, InsertOptions,
//!     MutationFnParams, PersistError, SyncParams, SyncSource, UpdateOptions,
//! };
//!
//! // 1. A sync source that delivers one round right away
//! struct Seed;
//!
//! impl SyncSource for Seed {
//!     fn sync(&self, params: SyncParams) {
//!         let writer = params.writer;
//!         writer.begin().unwrap();
//!         writer
//!             .write(ChangeMessage::insert("k1", json!({"text": "Buy milk", "completed": false})))
//!             .unwrap();
//!         writer.commit().unwrap();
//!     }
//! }
//!
//! // 2. Create the collection
//! let persist = mutation_fn(|_: MutationFnParams| async { Ok::<_, PersistError>(()) });
//! let todos = Collection::new(
//!     CollectionConfig::new("todos")
//!         .with_sync(Seed)
//!         .with_on_insert(persist.clone())
//!         .with_on_update(persist),
//! )
//! .unwrap();
//! assert!(todos.is_ready());
//!
//! // 3. Mutate optimistically
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! runtime.block_on(async {
//!     let row = todos.get("k1").unwrap();
//!     let tx = todos
//!         .update(row.record_ref, UpdateOptions::default(), |draft| {
//!             draft.set("completed", true)
//!         })
//!         .unwrap();
//!     assert_eq!(todos.state()["k1"]["completed"], json!(true));
//!
//!     tx.is_persisted().await.unwrap();
//!
//!     todos
//!         .insert(json!({"text": "Walk dog"}), InsertOptions::default())
//!         .unwrap();
//!     assert_eq!(todos.to_array().len(), 2);
//! });
//! ```
//!
//! ## Sharing
//!
//! A [`CollectionRegistry`] hands out one instance per identifier and
//! resolves [`CollectionRegistry::acquire`] once the first round is merged.
//!
//! ## Persistence
//!
//! Use [`Collection::export_state`] with [`CollectionSnapshot`] to inspect
//! or store a collection. Snapshots serialize to JSON with deterministic
//! ordering.

pub mod collection;
pub mod config;
pub mod draft;
pub mod error;
pub mod key;
pub mod mutation;
pub mod registry;
pub mod schema;
pub mod snapshot;
pub mod sync;
pub mod transaction;

// Re-export main types at crate root
pub use collection::{Collection, DeleteOptions, InsertOptions, Row, Target, UpdateOptions};
pub use config::CollectionConfig;
pub use draft::{track_many, track_single, Draft};
pub use error::Error;
pub use key::{generate_key, KeyResolver, RecordRef};
pub use mutation::{tombstone, ChangeMessage, MutationId, OperationType, PendingMutation};
pub use registry::CollectionRegistry;
pub use schema::{
    FieldDef, FieldSchema, FieldType, SchemaResult, StandardSchema, ValidationIssue,
};
pub use snapshot::{CollectionSnapshot, TransactionSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use sync::{PendingSync, SyncParams, SyncQueue, SyncSource, SyncWriter, SyncedData};
pub use transaction::{
    mutation_fn, MutationFn, MutationFnParams, PersistError, Transaction, TransactionCoordinator,
    TransactionId, TransactionState, TransactionStore, TransactionType,
};

/// Type aliases for clarity
pub type Key = String;
pub type CollectionId = String;
pub type Record = serde_json::Map<String, serde_json::Value>;
