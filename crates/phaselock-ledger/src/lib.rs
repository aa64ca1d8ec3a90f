//! Ledger collaborator for Phaselock state commitments.
//!
//! A node anchors its macrostate by submitting `{digest, evolution_count}`
//! pairs to an external ledger. The ledger's own storage layout and
//! validator rules live outside this workspace; this crate fixes the
//! interface the node talks to and ships an in-memory implementation used
//! by tests and single-node runs.
//!
//! # Architecture
//!
//! - [`client`] -- The [`LedgerClient`] trait and the [`LedgerEvent`] stream.
//! - [`memory`] -- [`InMemoryLedger`]: append-only record with confirmation
//!   and failure injection.
//!
//! # Submission Semantics
//!
//! Each digest may be submitted once. A repeated digest yields
//! [`LedgerError::DuplicateDigest`]; callers treat that as success when
//! [`LedgerClient::is_confirmed`] reports the digest confirmed. Transient
//! failures ([`LedgerError::is_retryable`]) are retried by the caller.
//!
//! # Usage
//!
//! ```
//! use phaselock_ledger::{InMemoryLedger, LedgerClient};
//! use phaselock_types::Digest;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let ledger = InMemoryLedger::new();
//! let digest = Digest::of(b"state");
//! let tx = ledger.submit_commitment(digest, 100).await.unwrap();
//! assert!(!ledger.is_confirmed(digest).await.unwrap());
//! ledger.confirm(digest).await.unwrap();
//! assert!(ledger.is_confirmed(digest).await.unwrap());
//! # let _ = tx;
//! # });
//! ```

pub mod client;
pub mod memory;

// Re-export primary types at crate root.
pub use client::{LedgerClient, LedgerEvent};
pub use memory::{InMemoryLedger, LedgerRecord};

use phaselock_types::Digest;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors returned by ledger collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The ledger could not be reached or timed out.
    #[error("ledger unavailable: {reason}")]
    Unavailable {
        /// What went wrong.
        reason: String,
    },

    /// The digest was already submitted.
    #[error("digest {digest} already submitted")]
    DuplicateDigest {
        /// The repeated digest.
        digest: Digest,
    },

    /// The digest is unknown to the ledger.
    #[error("digest {digest} not found")]
    UnknownDigest {
        /// The digest that was looked up.
        digest: Digest,
    },

    /// The ledger refused the submission.
    #[error("submission rejected: {reason}")]
    Rejected {
        /// Why the ledger refused.
        reason: String,
    },

    /// A storage backend behind the ledger failed.
    #[error("ledger backend error: {message}")]
    Backend {
        /// Backend error description.
        message: String,
    },
}

impl LedgerError {
    /// Whether retrying the same call might succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Backend { .. })
    }
}
