//! Migration runner.
//!
//! The first catalog file creates the ledger table and is executed on every
//! run, outside the ledger. Every later file is applied at most once: the
//! pending suffix is applied in a single transaction, each file followed by
//! its ledger row, and any failure rolls the whole batch back.

use crate::context::Context;
use crate::db::ConnectionPool;
use crate::error::{DbError, DbResult};
use crate::migrate::catalog::{MigrationCatalog, MigrationFile};
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tracing::{debug, error, info, warn};

/// Ledger table created by the bootstrap file.
pub const LEDGER_TABLE: &str = "schema_migrations";

/// Lifecycle of one runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Uninitialized,
    LedgerEnsured,
    Applying,
    Synced,
    Failed,
}

/// What a completed run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Ordinals applied by this run, in order.
    pub applied: Vec<i64>,
    /// Highest ordinal in the ledger after the run.
    pub latest: Option<i64>,
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub ordinal: i64,
    pub applied_at: DateTime<Utc>,
}

/// Read-only view of the ledger against the catalog.
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub ledger_exists: bool,
    pub applied: Vec<AppliedMigration>,
    /// File names not yet applied, in application order.
    pub pending: Vec<String>,
}

/// Ledger summary: number of rows and highest ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LedgerSummary {
    count: i64,
    max: Option<i64>,
}

/// Pick the candidates that still need applying.
///
/// The ledger must hold a prefix of `candidates`: its row count is the index
/// where the pending suffix starts, and the highest ordinal within that prefix
/// must equal the ledger's highest ordinal. In a catalog whose names do not
/// sort numerically, the last applied file need not carry that ordinal.
fn pending<'c>(
    candidates: &'c [MigrationFile],
    ledger: LedgerSummary,
) -> DbResult<&'c [MigrationFile]> {
    let Some(max) = ledger.max else {
        if ledger.count != 0 {
            return Err(DbError::ledger_out_of_sync(format!(
                "{} rows but no highest ordinal",
                ledger.count
            )));
        }
        return Ok(candidates);
    };

    let count = usize::try_from(ledger.count).unwrap_or(usize::MAX);
    if count == 0 || count > candidates.len() {
        return Err(DbError::ledger_out_of_sync(format!(
            "ledger has {} rows up to ordinal {}, catalog has {} migrations",
            ledger.count,
            max,
            candidates.len()
        )));
    }

    let (applied, todo) = candidates.split_at(count);
    let applied_max = applied.iter().map(MigrationFile::ordinal).max();
    if applied_max != Some(max) {
        return Err(DbError::ledger_out_of_sync(format!(
            "ledger has {} rows up to ordinal {}, but the first {} catalog entries top out at {}",
            ledger.count,
            max,
            count,
            applied_max.unwrap_or_default()
        )));
    }

    Ok(todo)
}

/// Brings the schema to the catalog's latest version.
pub struct MigrationRunner {
    pool: ConnectionPool,
    catalog: MigrationCatalog,
    state: MigrationState,
}

impl MigrationRunner {
    pub fn new(pool: ConnectionPool, catalog: MigrationCatalog) -> Self {
        Self {
            pool,
            catalog,
            state: MigrationState::Uninitialized,
        }
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    fn transition(&mut self, next: MigrationState) {
        debug!(from = ?self.state, to = ?next, "Migration state change");
        self.state = next;
    }

    /// Run the migrations. Consumes the runner: a process migrates once.
    pub async fn run(mut self, ctx: &Context) -> DbResult<MigrationReport> {
        let result = self.sync(ctx).await;
        match &result {
            Ok(report) => {
                self.transition(MigrationState::Synced);
                info!(
                    applied = report.applied.len(),
                    latest = ?report.latest,
                    "Schema is up to date"
                );
            }
            Err(e) => {
                self.transition(MigrationState::Failed);
                error!(error = %e, "Migration failed");
            }
        }
        result
    }

    async fn sync(&mut self, ctx: &Context) -> DbResult<MigrationReport> {
        let catalog = self.catalog.clone();
        let (bootstrap, candidates) = catalog.split_bootstrap()?;

        info!(file = %bootstrap.file_name(), "Ensuring migration ledger");
        let pool = &self.pool;
        ctx.run(async {
            pool.execute_raw(bootstrap.sql())
                .await
                .map_err(|e| DbError::migration(bootstrap.file_name(), e))
        })
        .await?;
        self.transition(MigrationState::LedgerEnsured);

        let ledger = self.summarize_ledger(ctx).await?;
        let todo = pending(candidates, ledger)?;
        if todo.is_empty() {
            debug!(latest = ?ledger.max, "No pending migrations");
            return Ok(MigrationReport {
                applied: Vec::new(),
                latest: ledger.max,
            });
        }

        self.transition(MigrationState::Applying);
        info!(
            count = todo.len(),
            from = %todo[0].file_name(),
            "Applying migrations"
        );
        self.apply(ctx, todo).await?;

        Ok(MigrationReport {
            applied: todo.iter().map(MigrationFile::ordinal).collect(),
            latest: todo.last().map(MigrationFile::ordinal),
        })
    }

    async fn summarize_ledger(&self, ctx: &Context) -> DbResult<LedgerSummary> {
        let (count, max) = ctx
            .run(
                sqlx::query_as::<_, (i64, Option<i64>)>(
                    "SELECT COUNT(*), MAX(id) FROM schema_migrations",
                )
                .fetch_one(self.pool.inner()),
            )
            .await?;
        Ok(LedgerSummary { count, max })
    }

    /// Apply `files` as one transaction.
    async fn apply(&self, ctx: &Context, files: &[MigrationFile]) -> DbResult<()> {
        let mut tx = ctx.run(self.pool.inner().begin()).await?;

        if let Err(err) = Self::apply_in(ctx, &mut tx, files).await {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback of failed migration batch failed");
            }
            return Err(err);
        }

        ctx.run(tx.commit()).await
    }

    async fn apply_in(
        ctx: &Context,
        tx: &mut Transaction<'static, Postgres>,
        files: &[MigrationFile],
    ) -> DbResult<()> {
        for file in files {
            debug!(file = %file.file_name(), ordinal = file.ordinal(), "Applying migration");

            ctx.run(async {
                sqlx::raw_sql(file.sql())
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| DbError::migration(file.file_name(), e))
            })
            .await?;

            ctx.run(async {
                sqlx::query("INSERT INTO schema_migrations (id) VALUES ($1)")
                    .bind(file.ordinal())
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| DbError::migration(file.file_name(), e))
            })
            .await?;
        }
        Ok(())
    }

    /// Report applied and pending migrations without executing anything.
    pub async fn status(&self, ctx: &Context) -> DbResult<MigrationStatus> {
        let (_, candidates) = self.catalog.split_bootstrap()?;

        let ledger_exists = ctx
            .run(
                sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
                    .bind(LEDGER_TABLE)
                    .fetch_one(self.pool.inner()),
            )
            .await?;

        if !ledger_exists {
            return Ok(MigrationStatus {
                ledger_exists,
                applied: Vec::new(),
                pending: candidates
                    .iter()
                    .map(|f| f.file_name().to_string())
                    .collect(),
            });
        }

        let rows = ctx
            .run(
                sqlx::query_as::<_, (i64, DateTime<Utc>)>(
                    "SELECT id, applied_at FROM schema_migrations ORDER BY id",
                )
                .fetch_all(self.pool.inner()),
            )
            .await?;
        let applied: Vec<AppliedMigration> = rows
            .into_iter()
            .map(|(ordinal, applied_at)| AppliedMigration {
                ordinal,
                applied_at,
            })
            .collect();

        let ledger = LedgerSummary {
            count: applied.len() as i64,
            max: applied.iter().map(|a| a.ordinal).max(),
        };
        let todo = pending(candidates, ledger)?;

        Ok(MigrationStatus {
            ledger_exists,
            applied,
            pending: todo.iter().map(|f| f.file_name().to_string()).collect(),
        })
    }
}
