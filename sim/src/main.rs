//! Tandem Sim - drives a collection against an in-process loopback backend.
//!
//! Runs a short scripted session (insert, toggle, delete) and logs the
//! overlay, the synced data and every transaction outcome along the way.
//! Set `TANDEM_FAIL_EVERY` to watch rejected writes roll back.

mod backend;
mod config;

use crate::backend::LoopbackBackend;
use crate::config::Config;
use serde_json::json;
use std::sync::Arc;
use tandem_engine::{
    Collection, CollectionConfig, CollectionRegistry, DeleteOptions, InsertOptions, Transaction,
    UpdateOptions,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_sim=debug,tandem_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        collection = %config.collection,
        latency_ms = config.latency.as_millis() as u64,
        fail_every = config.fail_every,
        "Starting Tandem simulation"
    );

    let backend = Arc::new(
        LoopbackBackend::new(config.latency, config.fail_every)
            .with_row("welcome", json!({"text": "Try tandem", "completed": false})),
    );

    let registry = CollectionRegistry::new();
    let todos = registry
        .acquire(
            CollectionConfig::new(config.collection.clone())
                .with_shared_sync(backend.clone())
                .with_on_insert(backend.mutation_fn())
                .with_on_update(backend.mutation_fn())
                .with_on_delete(backend.mutation_fn()),
        )
        .await?;
    todos.on_first_commit(|| tracing::info!("first commit observed"));
    log_state("ready", &todos);

    // 1. Insert
    let tx = todos.insert(
        json!({"text": "Buy milk", "completed": false}),
        InsertOptions::default(),
    )?;
    log_state("after optimistic insert", &todos);
    settle(&tx).await;
    log_state("after insert settled", &todos);

    // 2. Toggle every record
    let refs: Vec<_> = todos.to_array().iter().map(|row| row.record_ref).collect();
    let tx = todos.update_many(&refs, UpdateOptions::default(), |drafts| {
        for draft in drafts.iter_mut() {
            let done = draft.get("completed").and_then(|v| v.as_bool()).unwrap_or(false);
            draft.set("completed", !done);
        }
    })?;
    log_state("after optimistic toggle", &todos);
    settle(&tx).await;
    log_state("after toggle settled", &todos);

    // 3. Delete the seeded row
    let tx = todos.delete("welcome", DeleteOptions::default())?;
    log_state("after optimistic delete", &todos);
    settle(&tx).await;
    log_state("after delete settled", &todos);

    tracing::info!(
        persistence_calls = backend.calls(),
        backend_rows = backend.table().len(),
        "Simulation finished"
    );
    println!("{}", todos.export_state().to_json_pretty()?);

    Ok(())
}

async fn settle(tx: &Transaction) {
    match tx.is_persisted().await {
        Ok(()) => tracing::info!(transaction = %tx.id(), "transaction completed"),
        Err(err) => tracing::warn!(transaction = %tx.id(), error = %err, "transaction rolled back"),
    }
}

fn log_state(stage: &str, collection: &Collection) {
    let rows = collection.to_array();
    let pending = collection
        .transactions()
        .iter()
        .filter(|tx| !tx.is_terminal())
        .count();
    tracing::info!(stage, rows = rows.len(), pending, "overlay");
    for row in rows {
        tracing::debug!(key = %row.key, record = %row.record_ref, value = %row.value, "row");
    }
}
