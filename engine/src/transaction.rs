//! Transactions: batches of pending mutations and their lifecycle.
//!
//! ```text
//! pending ──► persisting ──► completed
//!    │             │
//!    └─────────────┴───────► failed
//! ```
//!
//! A transaction is visible in the collection's view from the moment it is
//! created until it reaches a terminal state. Terminal transactions never
//! change again.
//!
//! The [`TransactionCoordinator`] creates transactions and hands them to the
//! backend persistence function on the tokio runtime. When the function
//! resolves, the owning collection settles the transaction through
//! [`TransactionHost`].

use crate::{error::Result, CollectionId, Error, OperationType, PendingMutation};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique identifier for a transaction.
pub type TransactionId = Uuid;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    /// Created; the view already reflects it
    Pending,
    /// Persistence function in flight
    Persisting,
    /// Backend accepted the mutations
    Completed,
    /// Backend rejected the mutations; their effect is retracted
    Failed,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Completed | TransactionState::Failed)
    }

    fn can_transition_to(self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Pending, Persisting) | (Pending | Persisting, Completed | Failed)
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Pending => write!(f, "pending"),
            TransactionState::Persisting => write!(f, "persisting"),
            TransactionState::Completed => write!(f, "completed"),
            TransactionState::Failed => write!(f, "failed"),
        }
    }
}

/// How the mutations of a transaction are applied. Only ordered application
/// exists: mutations apply in sequence, later ones shadowing earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    #[default]
    Ordered,
}

/// Rejection reason returned by a persistence function.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PersistError {
    pub message: String,
}

impl PersistError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<PersistError> for Error {
    fn from(err: PersistError) -> Self {
        Error::Persistence(err.message)
    }
}

/// What a persistence function receives.
#[derive(Debug, Clone)]
pub struct MutationFnParams {
    pub transaction_id: TransactionId,
    pub collection_id: CollectionId,
    pub operation: OperationType,
    pub mutations: Vec<PendingMutation>,
}

/// Backend persistence function for one operation type.
pub type MutationFn = Arc<
    dyn Fn(MutationFnParams) -> BoxFuture<'static, std::result::Result<(), PersistError>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [`MutationFn`].
pub fn mutation_fn<F, Fut>(f: F) -> MutationFn
where
    F: Fn(MutationFnParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), PersistError>> + Send + 'static,
{
    Arc::new(move |params| f(params).boxed())
}

struct TransactionInner {
    id: TransactionId,
    collection_id: CollectionId,
    operation: OperationType,
    mutations: Vec<PendingMutation>,
    created_at: DateTime<Utc>,
    state: watch::Sender<TransactionState>,
    error: Mutex<Option<Error>>,
}

/// Handle to a transaction. Clones share the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    fn new(
        collection_id: CollectionId,
        operation: OperationType,
        mutations: Vec<PendingMutation>,
    ) -> Self {
        let (state, _) = watch::channel(TransactionState::Pending);
        Self {
            inner: Arc::new(TransactionInner {
                id: Uuid::new_v4(),
                collection_id,
                operation,
                mutations,
                created_at: Utc::now(),
                state,
                error: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    pub fn collection_id(&self) -> &str {
        &self.inner.collection_id
    }

    pub fn operation(&self) -> OperationType {
        self.inner.operation
    }

    /// Mutations in application order.
    pub fn mutations(&self) -> &[PendingMutation] {
        &self.inner.mutations
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn state(&self) -> TransactionState {
        *self.inner.state.borrow()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Rejection reason of a failed transaction.
    pub fn error(&self) -> Option<Error> {
        self.inner.error.lock().clone()
    }

    /// Wait until the transaction is terminal.
    ///
    /// Resolves to `Ok(())` once completed, or to the rejection reason once
    /// failed. Returns immediately for a transaction that already settled.
    pub async fn is_persisted(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let state = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        match state {
            TransactionState::Completed => Ok(()),
            _ => Err(self
                .error()
                .unwrap_or_else(|| Error::Persistence("transaction did not complete".into()))),
        }
    }

    pub(crate) fn transition(&self, to: TransactionState) -> Result<()> {
        let mut outcome = Ok(());
        self.inner.state.send_if_modified(|current| {
            if current.can_transition_to(to) {
                *current = to;
                true
            } else {
                outcome = Err(Error::InvalidTransition { from: *current, to });
                false
            }
        });
        if outcome.is_ok() {
            debug!(
                collection = %self.inner.collection_id,
                transaction = %self.inner.id,
                state = %to,
                "transaction state changed"
            );
        }
        outcome
    }

    /// Move to the terminal state matching a persistence outcome.
    pub(crate) fn finish(&self, outcome: std::result::Result<(), PersistError>) -> Result<()> {
        match outcome {
            Ok(()) => self.transition(TransactionState::Completed),
            Err(err) => {
                if self.is_terminal() {
                    return Err(Error::InvalidTransition {
                        from: self.state(),
                        to: TransactionState::Failed,
                    });
                }
                warn!(
                    collection = %self.inner.collection_id,
                    transaction = %self.inner.id,
                    error = %err,
                    "persistence rejected transaction"
                );
                *self.inner.error.lock() = Some(err.into());
                self.transition(TransactionState::Failed)
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("collection_id", &self.inner.collection_id)
            .field("operation", &self.inner.operation)
            .field("state", &self.state())
            .field("mutations", &self.inner.mutations.len())
            .finish()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Live transactions in creation order.
#[derive(Debug, Default)]
pub struct TransactionStore {
    transactions: Vec<Transaction>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter()
    }

    /// Transactions still visible in the view.
    pub fn active(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter().filter(|t| !t.is_terminal())
    }

    /// True when there is no transaction or every transaction is terminal.
    pub fn all_settled(&self) -> bool {
        self.transactions.iter().all(Transaction::is_terminal)
    }

    /// Remove terminal transactions, returning how many were removed.
    pub fn prune_settled(&mut self) -> usize {
        let before = self.transactions.len();
        self.transactions.retain(|t| !t.is_terminal());
        before - self.transactions.len()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

/// Settles transactions once their persistence call returns.
pub(crate) trait TransactionHost: Send + Sync + 'static {
    fn settle(&self, transaction: &Transaction, outcome: std::result::Result<(), PersistError>);
}

/// Creates transactions and submits them for persistence.
#[derive(Debug, Default)]
pub struct TransactionCoordinator {
    store: TransactionStore,
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &TransactionStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut TransactionStore {
        &mut self.store
    }

    /// Create a pending transaction and register it as live.
    ///
    /// All mutations must share one operation type.
    pub fn apply_transaction(
        &mut self,
        collection_id: &str,
        mutations: Vec<PendingMutation>,
        _kind: TransactionType,
    ) -> Result<Transaction> {
        let operation = match mutations.first() {
            Some(first) => first.operation,
            None => return Err(Error::EmptyTransaction),
        };
        if mutations.iter().any(|m| m.operation != operation) {
            return Err(Error::MixedOperations);
        }

        let transaction = Transaction::new(collection_id.to_string(), operation, mutations);
        debug!(
            collection = %collection_id,
            transaction = %transaction.id(),
            operation = %operation,
            mutations = transaction.mutations().len(),
            "transaction created"
        );
        self.store.push(transaction.clone());
        Ok(transaction)
    }

    /// Run `persist` for `transaction` on `runtime` and settle it on `host`.
    ///
    /// A panicking persistence function counts as a rejection. If the host is
    /// gone by then, the transaction is settled on its own.
    pub(crate) fn submit<H: TransactionHost>(
        runtime: &tokio::runtime::Handle,
        transaction: Transaction,
        persist: MutationFn,
        host: Weak<H>,
    ) {
        runtime.spawn(async move {
            if let Err(err) = transaction.transition(TransactionState::Persisting) {
                warn!(transaction = %transaction.id(), error = %err, "transaction not persisted");
                return;
            }

            let params = MutationFnParams {
                transaction_id: transaction.id(),
                collection_id: transaction.collection_id().to_string(),
                operation: transaction.operation(),
                mutations: transaction.mutations().to_vec(),
            };
            // The call itself may panic before handing back a future.
            let call = async move { persist(params).await };
            let outcome = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => Err(PersistError::new("persistence function panicked")),
            };

            match host.upgrade() {
                Some(host) => host.settle(&transaction, outcome),
                None => {
                    let _ = transaction.finish(outcome);
                }
            }
        });
    }
}
