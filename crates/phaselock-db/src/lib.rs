//! Data layer for Phaselock (`Dragonfly` + `PostgreSQL`).
//!
//! `Dragonfly` holds exported snapshots as content-addressed blobs.
//! `PostgreSQL` holds the commitment ledger. Both implement the
//! collaborator traits the evolution loop is written against, so the node
//! binary can swap them in for the in-memory versions.
//!
//! ```text
//! Evolution loop
//!     |
//!     +-- checkpoint export --> DragonflyBlobStore (BlobStore)
//!     |
//!     +-- commitment -------> PostgresLedger     (LedgerClient)
//! ```
//!
//! # Modules
//!
//! - [`dragonfly`] -- `Dragonfly` connection and [`DragonflyBlobStore`]
//! - [`postgres`] -- `PostgreSQL` connection pool and migrations
//! - [`commitment_store`] -- [`PostgresLedger`] over the `commitments` table
//! - [`error`] -- Shared error types

pub mod commitment_store;
pub mod dragonfly;
pub mod error;
pub mod postgres;

// Re-export primary types for convenience.
pub use commitment_store::{CommitmentRow, PostgresLedger};
pub use dragonfly::{DragonflyBlobStore, DragonflyPool};
pub use error::DbError;
pub use postgres::PostgresPool;
