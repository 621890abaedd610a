use crate::model::{
    AggregateRow, AggregatedRating, AllocationState, ArchiveRecord, AuditAppend, AuditFilter,
    AuditRecord, DeletedRows, LockKey, RaterMatterTally, RatingRow, SpendRow, TargetSnapshot,
    VoterScopeTally, VoterSnapshot,
};
use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credit_types::{AllocationKind, IdentityId, Matter, RatingKey, ScopeId, TargetId};

/// Generic query window for paged reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

/// Entry point to the ledger store.
///
/// Reads here are unlocked point-in-time views meant for projections and
/// candidate discovery. Anything feeding an entitlement decision must go
/// through a [`LedgerTx`] after taking the relevant lock.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> StorageResult<Box<dyn LedgerTx>>;

    /// Σ|value| per (rater, matter) for every pair with a non-zero row.
    async fn rating_tallies(&self) -> StorageResult<Vec<RaterMatterTally>>;

    /// Σ|current_value| per (voter, scope) for every pair with a non-zero allocation.
    async fn allocation_tallies(&self, kind: AllocationKind)
        -> StorageResult<Vec<VoterScopeTally>>;

    /// Every row of a matter, in insertion order.
    async fn ratings_for_matter(&self, matter: Matter) -> StorageResult<Vec<RatingRow>>;

    /// Every allocation of a kind, in insertion order.
    async fn allocations_of_kind(&self, kind: AllocationKind)
        -> StorageResult<Vec<AllocationState>>;

    async fn aggregated_rating(
        &self,
        target: &TargetId,
        matter: Matter,
        category: &str,
    ) -> StorageResult<AggregatedRating>;

    async fn aggregates_for_scope(
        &self,
        kind: AllocationKind,
        scope: &ScopeId,
    ) -> StorageResult<Vec<AggregateRow>>;

    /// A target's snapshot history, oldest first, optionally cut at `until` (inclusive).
    async fn target_snapshots(
        &self,
        kind: AllocationKind,
        target: &TargetId,
        until: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<TargetSnapshot>>;

    /// Audit entries newest-first.
    async fn list_audit(&self, filter: AuditFilter) -> StorageResult<Vec<AuditRecord>>;

    /// Most recent pre-image reference for a label.
    async fn latest_archive(&self, label: &str) -> StorageResult<Option<ArchiveRecord>>;
}

/// A live transaction.
///
/// Writes become visible to other transactions only on [`LedgerTx::commit`].
/// Dropping the handle rolls back and releases every lock.
#[async_trait]
pub trait LedgerTx: Send {
    /// Block until the key is held by this transaction. Re-entrant.
    async fn lock(&mut self, key: LockKey) -> StorageResult<()>;

    async fn get_rating(&mut self, key: &RatingKey) -> StorageResult<Option<RatingRow>>;

    /// All of a rater's rows on a matter, in insertion order.
    async fn ratings_for_rater_matter(
        &mut self,
        rater: &IdentityId,
        matter: Matter,
    ) -> StorageResult<Vec<RatingRow>>;

    /// All rows given by a rater across matters, in insertion order.
    async fn ratings_given_by(&mut self, rater: &IdentityId) -> StorageResult<Vec<RatingRow>>;

    async fn put_rating(
        &mut self,
        key: &RatingKey,
        value: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<RatingRow>;

    async fn get_allocation(
        &mut self,
        kind: AllocationKind,
        rater: &IdentityId,
        target: &TargetId,
    ) -> StorageResult<Option<AllocationState>>;

    /// A voter's allocations inside one scope, in insertion order.
    async fn allocations_for_voter_scope(
        &mut self,
        kind: AllocationKind,
        voter: &IdentityId,
        scope: &ScopeId,
    ) -> StorageResult<Vec<AllocationState>>;

    async fn put_allocation(
        &mut self,
        kind: AllocationKind,
        rater: &IdentityId,
        target: &TargetId,
        scope: &ScopeId,
        value: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<AllocationState>;

    async fn get_aggregate(
        &mut self,
        kind: AllocationKind,
        target: &TargetId,
    ) -> StorageResult<Option<AggregateRow>>;

    /// Add `change` to the target's running sum, creating the row if needed.
    async fn apply_aggregate_change(
        &mut self,
        kind: AllocationKind,
        target: &TargetId,
        scope: &ScopeId,
        change: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<AggregateRow>;

    async fn set_decision_snapshot(
        &mut self,
        kind: AllocationKind,
        target: &TargetId,
        value: i64,
    ) -> StorageResult<()>;

    async fn append_spend(&mut self, row: SpendRow) -> StorageResult<()>;

    /// Σ amount for the rater with `timestamp > since`.
    async fn spend_since(
        &mut self,
        kind: AllocationKind,
        rater: &IdentityId,
        since: DateTime<Utc>,
    ) -> StorageResult<i64>;

    async fn append_target_snapshot(&mut self, snapshot: TargetSnapshot) -> StorageResult<()>;

    async fn append_voter_snapshot(&mut self, snapshot: VoterSnapshot) -> StorageResult<()>;

    async fn append_audit(&mut self, event: AuditAppend) -> StorageResult<()>;

    async fn record_archive(&mut self, record: ArchiveRecord) -> StorageResult<()>;

    /// Remove allocation state, spend rows, snapshots and the aggregate of a target.
    async fn delete_target(
        &mut self,
        kind: AllocationKind,
        target: &TargetId,
    ) -> StorageResult<DeletedRows>;

    async fn commit(self: Box<Self>) -> StorageResult<()>;
}
