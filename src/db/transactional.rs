//! Ambient transactions carried on a [`Context`].
//!
//! `begin` opens a transaction and returns a child context holding it; any
//! statement issued through a [`StatementExecutor`](super::StatementExecutor)
//! with that context (or one derived from it) runs inside the transaction.
//! `commit` and `rollback` finish it.
//!
//! The handle in the context is shared, but the transaction itself sits behind
//! a lock and is taken out when finished, so it can be committed or rolled
//! back once. A handle that is dropped without either is rolled back by the
//! driver when its connection is returned.

use crate::context::{self, Context, ContextKey};
use crate::db::pool::ConnectionPool;
use crate::error::{DbError, DbResult};
use sqlx::{Postgres, Transaction};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Context slot for the ambient transaction.
pub(crate) const TX_KEY: ContextKey = ContextKey::new("greddit_db.ambient_transaction");

/// Shared handle to an open transaction.
#[derive(Clone)]
pub struct TxHandle {
    inner: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
}

impl TxHandle {
    fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Lock the handle for the duration of one statement.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Option<Transaction<'static, Postgres>>> {
        self.inner.lock().await
    }

    async fn take(&self) -> DbResult<Transaction<'static, Postgres>> {
        self.inner
            .lock()
            .await
            .take()
            .ok_or(DbError::TransactionFinished)
    }

    /// Whether commit or rollback already happened.
    pub async fn is_finished(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

impl std::fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxHandle").finish_non_exhaustive()
    }
}

/// Result of looking for an ambient transaction in a context.
#[derive(Debug)]
pub enum TxLookup {
    Found(TxHandle),
    /// Nothing in the transaction slot.
    NotPresent,
    /// Something other than a transaction occupies the slot.
    WrongType,
}

/// Opens, finds and finishes ambient transactions.
#[derive(Debug, Clone)]
pub struct Transactional {
    pool: ConnectionPool,
}

impl Transactional {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Open a transaction and return a child of `parent` carrying it.
    ///
    /// Beginning on a context that already carries a transaction opens a
    /// second, independent transaction that shadows the first for everything
    /// derived from the returned context.
    pub async fn begin<'a>(&self, parent: impl Into<Option<&'a Context>>) -> DbResult<Context> {
        let parent = context::require(parent)?;

        if matches!(Self::lookup(parent)?, TxLookup::Found(_)) {
            warn!("Beginning a transaction inside another transaction");
        }

        let tx = parent.run(self.pool.inner().begin()).await?;
        debug!("Transaction started");
        Ok(parent.with_value(TX_KEY, TxHandle::new(tx)))
    }

    /// Find the ambient transaction in `ctx`.
    pub fn lookup<'a>(ctx: impl Into<Option<&'a Context>>) -> DbResult<TxLookup> {
        let ctx = context::require(ctx)?;
        Ok(match ctx.value(&TX_KEY) {
            None => TxLookup::NotPresent,
            Some(value) => match value.downcast_ref::<TxHandle>() {
                Some(handle) => TxLookup::Found(handle.clone()),
                None => TxLookup::WrongType,
            },
        })
    }

    /// Resolve the transaction for an explicit commit or rollback, where an
    /// empty slot is an error.
    fn require_tx(ctx: &Context) -> DbResult<TxHandle> {
        match Self::lookup(ctx)? {
            TxLookup::Found(handle) => Ok(handle),
            TxLookup::NotPresent => Err(DbError::NoTransaction),
            TxLookup::WrongType => Err(DbError::WrongTransactionType),
        }
    }

    /// Commit the ambient transaction of `ctx`.
    pub async fn commit<'a>(&self, ctx: impl Into<Option<&'a Context>>) -> DbResult<()> {
        let ctx = context::require(ctx)?;
        let handle = Self::require_tx(ctx)?;
        let tx = handle.take().await?;
        ctx.run(tx.commit()).await?;
        debug!("Transaction committed");
        Ok(())
    }

    /// Roll back the ambient transaction of `ctx`.
    ///
    /// Runs even if `ctx` is already cancelled, so it can sit on cleanup paths.
    pub async fn rollback<'a>(&self, ctx: impl Into<Option<&'a Context>>) -> DbResult<()> {
        let ctx = context::require(ctx)?;
        let handle = Self::require_tx(ctx)?;
        let tx = handle.take().await?;
        tx.rollback().await?;
        debug!("Transaction rolled back");
        Ok(())
    }

    /// Run `f` as one unit of work: commit if it returns `Ok`, roll back if it
    /// returns `Err`. The closure receives the transactional context.
    pub async fn in_transaction<'a, F, Fut, T>(
        &self,
        parent: impl Into<Option<&'a Context>>,
        f: F,
    ) -> DbResult<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let ctx = self.begin(parent).await?;
        match f(ctx.clone()).await {
            Ok(value) => {
                self.commit(&ctx).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback(&ctx).await {
                    warn!(error = %rollback_err, "Rollback after failed unit of work failed");
                }
                Err(err)
            }
        }
    }
}
