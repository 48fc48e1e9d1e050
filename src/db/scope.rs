//! Ambient transaction scopes.
//!
//! [`run_in_transaction`] begins a transaction, attaches it to a child
//! [`Context`] and runs a unit of work with that context. Any code further
//! down the call chain that resolves a handle from the child context executes
//! inside the same transaction. Nested calls find the scope already attached
//! and simply run their work; only the outermost call commits or rolls back.

use crate::context::Context;
use crate::error::DbError;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Something that can begin, commit and roll back physical transactions.
pub trait TransactionBackend: Send + Sync {
    type Tx: Send + 'static;

    /// Tag identifying this backend's scopes inside a [`Context`].
    ///
    /// Two backends with different keys never see each other's scopes.
    fn scope_key(&self) -> u128;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx, sqlx::Error>> + Send;

    fn commit(&self, tx: Self::Tx) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn rollback(&self, tx: Self::Tx) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
}

/// A live transaction attached to a context.
///
/// Clones share the same slot. The outermost [`run_in_transaction`] call
/// empties the slot when it finishes, after which the scope is dead.
pub struct TransactionScope<T> {
    id: Arc<str>,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for TransactionScope<T> {
    fn clone(&self) -> Self {
        Self {
            id: Arc::clone(&self.id),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> std::fmt::Debug for TransactionScope<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<T> TransactionScope<T> {
    fn new(tx: T) -> Self {
        Self {
            id: format!("tx_{}", Uuid::new_v4().simple()).into(),
            slot: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Identifier used in logs, `tx_<uuid>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lock the slot. `None` inside means the transaction is finished.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.slot.lock().await
    }

    pub(crate) async fn take(&self) -> Option<T> {
        self.slot.lock().await.take()
    }
}

/// Run `work` inside a transaction on `backend`.
///
/// If `ctx` already carries a scope for `backend`, `work` runs with `ctx`
/// as is and its result is returned untouched. Otherwise a transaction is
/// begun and `work` runs with a child context carrying it:
///
/// - `Ok` commits; a failed commit is returned as [`DbError::Commit`].
/// - `Err` rolls back and returns the original error, even if the rollback
///   itself fails.
/// - A panic rolls back and then resumes unwinding with the original payload.
pub async fn run_in_transaction<B, F, Fut, R, E>(backend: &B, ctx: &Context, work: F) -> Result<R, E>
where
    B: TransactionBackend,
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: From<DbError>,
{
    let key = backend.scope_key();
    if let Some(scope) = ctx.keyed_value::<TransactionScope<B::Tx>>(key) {
        debug!(transaction_id = %scope.id(), "Joining ambient transaction");
        return work(ctx.clone()).await;
    }

    let tx = backend
        .begin()
        .await
        .map_err(|source| DbError::Begin { source })?;
    let scope = TransactionScope::new(tx);
    let transaction_id = scope.id().to_string();
    info!(transaction_id = %transaction_id, "Began transaction");

    let child = ctx.with_keyed_value(key, scope.clone());
    let outcome = AssertUnwindSafe(async move { work(child).await })
        .catch_unwind()
        .await;
    let tx = scope.take().await;

    match outcome {
        Err(panic) => {
            if let Some(tx) = tx {
                rollback_logged(backend, tx, &transaction_id, "unit of work panicked").await;
            }
            std::panic::resume_unwind(panic)
        }
        Ok(Err(err)) => {
            if let Some(tx) = tx {
                rollback_logged(backend, tx, &transaction_id, "unit of work failed").await;
            }
            Err(err)
        }
        Ok(Ok(value)) => {
            let Some(tx) = tx else {
                return Err(DbError::transaction(
                    "Transaction was finished before its scope ended",
                    transaction_id,
                )
                .into());
            };
            if let Err(source) = backend.commit(tx).await {
                error!(transaction_id = %transaction_id, error = %source, "Error committing transaction");
                return Err(DbError::Commit { source }.into());
            }
            info!(transaction_id = %transaction_id, "Committed transaction");
            Ok(value)
        }
    }
}

async fn rollback_logged<B: TransactionBackend>(
    backend: &B,
    tx: B::Tx,
    transaction_id: &str,
    reason: &'static str,
) {
    match backend.rollback(tx).await {
        Ok(()) => info!(transaction_id, reason, "Rolled back transaction"),
        Err(source) => {
            let err = DbError::Rollback { source };
            error!(transaction_id, reason, error = ?err, "Error rolling back transaction");
        }
    }
}
