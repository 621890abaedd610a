//! Storage contract for the credit ledger.
//!
//! The contract is transaction-first:
//! - [`LedgerStore::begin`] hands out a [`LedgerTx`]; every mutation goes through one
//! - locks are taken per [`LockKey`] and held until commit or drop
//! - dropping a transaction without committing discards all of its writes
//!
//! Backends:
//! - [`memory::InMemoryLedgerStore`] for tests and single-process deployments
//! - `postgres::PostgresLedgerStore` (feature `postgres`) as the system of record
//!
//! Reconciliation pre-images go to an [`ArchiveStore`].

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

pub mod archive;
mod error;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use archive::{ArchiveStore, FsArchiveStore, InMemoryArchiveStore};
pub use error::{StorageError, StorageResult};
pub use model::{
    audit_digest, AggregateRow, AggregatedRating, AllocationState, ArchiveRecord, AuditAppend,
    AuditFilter, AuditRecord, DeletedRows, LockKey, RaterMatterTally, RatingRow, SpendRow,
    TargetSnapshot, VoterScopeTally, VoterSnapshot,
};
pub use traits::{LedgerStore, LedgerTx, QueryWindow};
