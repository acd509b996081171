//! Error types for the Tandem engine.

use crate::{key::RecordRef, mutation::OperationType, schema::ValidationIssue, TransactionState};
use thiserror::Error;

/// All possible errors from the Tandem engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Configuration errors
    #[error("collection requires a sync source")]
    MissingSyncConfig,

    #[error("no {operation} function configured for this collection")]
    MissingMutationFn { operation: OperationType },

    #[error("persistence requires a running tokio runtime")]
    NoRuntime,

    #[error("got {keys} keys for {records} records")]
    KeyCountMismatch { keys: usize, records: usize },

    #[error("a transaction needs at least one mutation")]
    EmptyTransaction,

    #[error("all mutations in a transaction must share one operation type")]
    MixedOperations,

    // Ingestion protocol errors
    #[error("a sync transaction is already open")]
    SyncAlreadyOpen,

    #[error("no pending sync transaction")]
    NoPendingSync,

    #[error("the pending sync transaction is already committed")]
    SyncAlreadyCommitted,

    #[error("collection was dropped")]
    CollectionClosed,

    // Validation errors
    #[error("{operation} failed validation: {}", format_issues(.issues))]
    Validation {
        operation: OperationType,
        issues: Vec<ValidationIssue>,
    },

    #[error("schema validation must be synchronous")]
    AsyncValidation,

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    // Resolution errors
    #[error("record {0} is not tracked by this collection")]
    NotTracked(RecordRef),

    #[error("update produced no changes")]
    NoChanges,

    // Transaction errors
    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("invalid transaction transition from {from} to {to}")]
    InvalidTransition {
        from: TransactionState,
        to: TransactionState,
    },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
