//! Database access layer.
//!
//! This module provides:
//! - The shared PostgreSQL connection pool
//! - Ambient transactions carried on a [`Context`](crate::context::Context)
//! - The statement executor every repository issues SQL through

pub mod executor;
pub mod pool;
pub mod transactional;

pub use executor::{Statement, StatementExecutor};
pub use pool::ConnectionPool;
pub use transactional::{Transactional, TxHandle, TxLookup};
