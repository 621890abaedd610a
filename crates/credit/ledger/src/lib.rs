//! Credit-bounded allocation ledger.
//!
//! - [`LedgerUpdateService`] applies rating changes under a per-(rater, matter) lock
//! - [`AllocationEngine`] applies vote/clap changes with aggregate, spend and snapshot upkeep
//! - [`OverspendReconciler`] proportionally shrinks allocations after entitlement drops
//! - [`LeaderboardReader`] and [`DecisionSnapshotter`] serve the read side
//!
//! All mutating entry points take a `&mut dyn LedgerTx`; the convenience
//! wrappers that open their own transaction say so in their names or docs.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod allocation;
mod leaderboard;
mod ports;
mod rating;
mod reconciler;
mod reduction;

pub use allocation::{AllocationChange, AllocationEngine, AllocationOutcome, SpendPolicy};
pub use leaderboard::{
    order_entries, time_weighted_value, DecisionSnapshotter, LeaderboardEntry, LeaderboardInput,
    LeaderboardOrdering, LeaderboardQuery, LeaderboardReader,
};
pub use ports::{
    AllocationNotice, EligibilitySource, EntitlementSource, Notifier, StaticEntitlements,
    TargetDirectory,
};
pub use rating::{
    LedgerUpdateService, MatterBases, RatingOutcome, RatingUpdate, TransferReport, UpdateOptions,
};
pub use reconciler::{OverspendReconciler, PairFailure, ReconcileReport, ReconcilerConfig};
pub use reduction::{plan_reduction, Reduction, ReductionPlan};
