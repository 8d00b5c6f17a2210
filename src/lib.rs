//! greddit persistence layer.
//!
//! This library provides the pieces every greddit repository and service sits on:
//! a shared PostgreSQL connection pool, an embedded schema migration runner, and
//! ambient transactions that repositories join transparently through the
//! statement executor.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod migrate;

pub use config::Config;
pub use context::{Context, ContextKey};
pub use db::{ConnectionPool, StatementExecutor, Transactional};
pub use error::{DbError, DbResult};
pub use migrate::{MigrationCatalog, MigrationRunner};
