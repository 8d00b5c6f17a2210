//! Schema migrations.
//!
//! - Catalog: discovers `<digits>_<description>.sql` files and orders them
//! - Runner: applies the unapplied suffix atomically and records it in the ledger

pub mod catalog;
pub mod runner;

pub use catalog::{MigrationCatalog, MigrationFile};
pub use runner::{
    AppliedMigration, LEDGER_TABLE, MigrationReport, MigrationRunner, MigrationState,
    MigrationStatus,
};
