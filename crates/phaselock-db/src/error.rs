//! Error types for the data layer.
//!
//! Backend errors are wrapped in [`DbError`] and converted into the
//! collaborator error types ([`LedgerError`], [`BlobError`]) at the trait
//! boundary, so the evolution loop never sees `sqlx` or `fred` types.

use phaselock_core::blob::BlobError;
use phaselock_ledger::LedgerError;

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A `Dragonfly`/Redis operation failed.
    #[error("Dragonfly error: {0}")]
    Dragonfly(#[from] fred::error::Error),

    /// A stored row holds a value that does not decode.
    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow {
        /// Table the row came from.
        table: &'static str,
        /// What failed to decode.
        reason: String,
    },

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<DbError> for LedgerError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Config(reason) => Self::Unavailable { reason },
            other => Self::Backend {
                message: other.to_string(),
            },
        }
    }
}

impl From<DbError> for BlobError {
    fn from(err: DbError) -> Self {
        Self::Unavailable {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_stay_retryable() {
        let ledger: LedgerError = DbError::Config(String::from("bad url")).into();
        assert!(ledger.is_retryable());

        let ledger: LedgerError = DbError::CorruptRow {
            table: "commitments",
            reason: String::from("digest"),
        }
        .into();
        assert!(matches!(ledger, LedgerError::Backend { .. }));

        let blob: BlobError = DbError::Config(String::from("bad url")).into();
        assert!(blob.is_retryable());
    }
}
