//! Error types for the node binary.
//!
//! [`NodeError`] wraps every failure mode during node startup and the
//! run itself, so `main` can propagate with `?`.

/// Top-level error for the node binary.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Configuration loading or validation failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: phaselock_core::config::ConfigError,
    },

    /// The evolution loop failed.
    #[error("runner error: {source}")]
    Runner {
        /// The underlying runner error.
        #[from]
        source: phaselock_core::runner::RunnerError,
    },

    /// A storage backend failed.
    #[error("database error: {source}")]
    Db {
        /// The underlying data layer error.
        #[from]
        source: phaselock_db::DbError,
    },

    /// NATS connection or messaging failed.
    #[error("NATS error: {message}")]
    Nats {
        /// Description of the NATS failure.
        message: String,
    },

    /// The log filter could not be installed.
    #[error("logging error: {message}")]
    Logging {
        /// Description of the failure.
        message: String,
    },
}
