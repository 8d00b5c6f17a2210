//! Error types for the persistence layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Driver errors raised by individual statements are carried through untouched so
//! callers can inspect constraint violations themselves.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("No migration files found in the catalog")]
    NoMigrationsFound,

    #[error("Malformed migration file name: {file_name}")]
    MalformedMigrationName { file_name: String },

    #[error("Duplicate migration ordinal {ordinal}: {first} and {second}")]
    DuplicateMigrationOrdinal {
        ordinal: i64,
        first: String,
        second: String,
    },

    #[error("Error executing migration {file_name}: {source}")]
    Migration {
        file_name: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Migration ledger out of sync: {message}")]
    LedgerOutOfSync { message: String },

    #[error("Context is required but none was given")]
    NilContext,

    #[error("No transaction in context")]
    NoTransaction,

    #[error("Value in the transaction slot of the context is not a transaction")]
    WrongTransactionType,

    #[error("Transaction already committed or rolled back")]
    TransactionFinished,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a migration error tagged with the offending file.
    pub fn migration(file_name: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Migration {
            file_name: file_name.into(),
            source,
        }
    }

    pub fn malformed_name(file_name: impl Into<String>) -> Self {
        Self::MalformedMigrationName {
            file_name: file_name.into(),
        }
    }

    pub fn ledger_out_of_sync(message: impl Into<String>) -> Self {
        Self::LedgerOutOfSync {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::NoMigrationsFound => Some("Check that the migration directory is embedded"),
            Self::MalformedMigrationName { .. } => {
                Some("Migration files must be named <digits>_<description>.sql")
            }
            _ => None,
        }
    }

    /// Errors that must abort process startup.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::NoMigrationsFound
                | Self::MalformedMigrationName { .. }
                | Self::DuplicateMigrationOrdinal { .. }
                | Self::Migration { .. }
                | Self::LedgerOutOfSync { .. }
        )
    }

    /// Errors caused by misuse of the context or transaction API.
    pub fn is_programming_defect(&self) -> bool {
        matches!(
            self,
            Self::NilContext | Self::WrongTransactionType | Self::TransactionFinished
        )
    }

    /// The raw driver error, if this error came from the database.
    pub fn as_sqlx(&self) -> Option<&sqlx::Error> {
        match self {
            Self::Database(err) => Some(err),
            Self::Migration { source, .. } => Some(source),
            _ => None,
        }
    }

    /// SQLSTATE code of the underlying database error, if any.
    pub fn sql_state(&self) -> Option<String> {
        match self.as_sqlx()? {
            sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
            _ => None,
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_migration_error_names_file() {
        let err = DbError::migration("004_forum_posts.sql", sqlx::Error::RowNotFound);
        assert!(err.to_string().contains("004_forum_posts.sql"));
        assert!(err.as_sqlx().is_some());
    }

    #[test]
    fn test_startup_fatal_classification() {
        assert!(DbError::NoMigrationsFound.is_startup_fatal());
        assert!(DbError::malformed_name("x_y.sql").is_startup_fatal());
        assert!(DbError::connection("err", "sugg").is_startup_fatal());
        assert!(!DbError::NoTransaction.is_startup_fatal());
        let row_not_found = DbError::Database(sqlx::Error::RowNotFound);
        assert!(!row_not_found.is_startup_fatal());
    }

    #[test]
    fn test_programming_defect_classification() {
        assert!(DbError::NilContext.is_programming_defect());
        assert!(DbError::WrongTransactionType.is_programming_defect());
        assert!(!DbError::NoTransaction.is_programming_defect());
        assert!(!DbError::Cancelled.is_programming_defect());
    }

    #[test]
    fn test_database_error_passes_through() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err.as_sqlx(), Some(sqlx::Error::RowNotFound)));
        assert_eq!(err.sql_state(), None);
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::connection("refused", "Check the server");
        assert_eq!(err.suggestion(), Some("Check the server"));
        assert_eq!(DbError::Cancelled.suggestion(), None);
    }
}
