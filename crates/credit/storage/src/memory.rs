//! In-memory ledger store.
//!
//! Transactions stage their writes privately and publish them in one step
//! under the state write lock on commit. Row-level serialization comes from
//! a table of per-[`LockKey`] async mutexes whose guards live inside the
//! transaction, so dropping a transaction releases its locks.

use crate::model::{
    audit_digest, AggregateRow, AggregatedRating, AllocationState, ArchiveRecord, AuditAppend,
    AuditFilter, AuditRecord, DeletedRows, LockKey, RaterMatterTally, RatingRow, SpendRow,
    TargetSnapshot, VoterScopeTally, VoterSnapshot,
};
use crate::traits::{LedgerStore, LedgerTx, QueryWindow};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credit_types::{AllocationKind, IdentityId, Matter, RatingKey, ScopeId, TargetId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

type AllocKey = (AllocationKind, IdentityId, TargetId);
type AggKey = (AllocationKind, TargetId);

/// Sequence numbers handed to rows created inside an uncommitted transaction.
const PROVISIONAL_SEQ_BASE: u64 = u64::MAX / 2;

#[derive(Debug, Default)]
struct LedgerState {
    ratings: HashMap<RatingKey, RatingRow>,
    allocations: HashMap<AllocKey, AllocationState>,
    aggregates: HashMap<AggKey, AggregateRow>,
    spend: Vec<SpendRow>,
    target_snapshots: Vec<TargetSnapshot>,
    voter_snapshots: Vec<VoterSnapshot>,
    audits: Vec<AuditRecord>,
    archives: Vec<ArchiveRecord>,
    next_seq: u64,
}

impl LedgerState {
    fn take_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[derive(Debug, Default)]
struct LockTable {
    slots: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

impl LockTable {
    fn slot(&self, key: &LockKey) -> StorageResult<Arc<AsyncMutex<()>>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| StorageError::Backend("lock table poisoned".to_string()))?;
        Ok(slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }
}

/// In-memory [`LedgerStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<LedgerState>>,
    locks: Arc<LockTable>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every spend row, oldest first.
    pub async fn spend_rows(&self) -> Vec<SpendRow> {
        self.state.read().await.spend.clone()
    }

    /// Every voter snapshot, oldest first.
    pub async fn voter_snapshots(&self) -> Vec<VoterSnapshot> {
        self.state.read().await.voter_snapshots.clone()
    }

    /// Σ current_value over allocation states on a target.
    pub async fn allocation_sum(&self, kind: AllocationKind, target: &TargetId) -> i64 {
        self.state
            .read()
            .await
            .allocations
            .values()
            .filter(|s| s.kind == kind && &s.target == target)
            .map(|s| s.current_value)
            .sum()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> StorageResult<Box<dyn LedgerTx>> {
        Ok(Box::new(InMemoryTx {
            shared: self.state.clone(),
            locks: self.locks.clone(),
            guards: BTreeMap::new(),
            staged: Staged::default(),
        }))
    }

    async fn rating_tallies(&self) -> StorageResult<Vec<RaterMatterTally>> {
        let state = self.state.read().await;
        let mut tallies: BTreeMap<(IdentityId, Matter), i64> = BTreeMap::new();
        for row in state.ratings.values().filter(|r| r.value != 0) {
            let tally = tallies
                .entry((row.key.rater().clone(), row.key.matter()))
                .or_default();
            *tally = tally.saturating_add(row.value.saturating_abs());
        }
        Ok(tallies
            .into_iter()
            .map(|((rater, matter), tally)| RaterMatterTally {
                rater,
                matter,
                tally,
            })
            .collect())
    }

    async fn allocation_tallies(
        &self,
        kind: AllocationKind,
    ) -> StorageResult<Vec<VoterScopeTally>> {
        let state = self.state.read().await;
        let mut tallies: BTreeMap<(IdentityId, ScopeId), i64> = BTreeMap::new();
        for s in state
            .allocations
            .values()
            .filter(|s| s.kind == kind && s.current_value != 0)
        {
            let tally = tallies
                .entry((s.rater.clone(), s.scope.clone()))
                .or_default();
            *tally = tally.saturating_add(s.current_value.saturating_abs());
        }
        Ok(tallies
            .into_iter()
            .map(|((voter, scope), tally)| VoterScopeTally {
                kind,
                voter,
                scope,
                tally,
            })
            .collect())
    }

    async fn ratings_for_matter(&self, matter: Matter) -> StorageResult<Vec<RatingRow>> {
        let state = self.state.read().await;
        let mut rows: Vec<RatingRow> = state
            .ratings
            .values()
            .filter(|r| r.key.matter() == matter)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.seq);
        Ok(rows)
    }

    async fn allocations_of_kind(
        &self,
        kind: AllocationKind,
    ) -> StorageResult<Vec<AllocationState>> {
        let state = self.state.read().await;
        let mut rows: Vec<AllocationState> = state
            .allocations
            .values()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.seq);
        Ok(rows)
    }

    async fn aggregated_rating(
        &self,
        target: &TargetId,
        matter: Matter,
        category: &str,
    ) -> StorageResult<AggregatedRating> {
        let state = self.state.read().await;
        Ok(state
            .ratings
            .values()
            .filter(|r| {
                r.value != 0
                    && r.key.target() == target
                    && r.key.matter() == matter
                    && r.key.category() == category
            })
            .fold(AggregatedRating::default(), |acc, r| AggregatedRating {
                rating: acc.rating + r.value,
                contributor_count: acc.contributor_count + 1,
            }))
    }

    async fn aggregates_for_scope(
        &self,
        kind: AllocationKind,
        scope: &ScopeId,
    ) -> StorageResult<Vec<AggregateRow>> {
        let state = self.state.read().await;
        let mut rows: Vec<AggregateRow> = state
            .aggregates
            .values()
            .filter(|a| a.kind == kind && &a.scope == scope)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.target.cmp(&b.target));
        Ok(rows)
    }

    async fn target_snapshots(
        &self,
        kind: AllocationKind,
        target: &TargetId,
        until: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<TargetSnapshot>> {
        let state = self.state.read().await;
        let mut rows: Vec<TargetSnapshot> = state
            .target_snapshots
            .iter()
            .filter(|s| s.kind == kind && &s.target == target)
            .filter(|s| until.map_or(true, |until| s.timestamp <= until))
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.timestamp);
        Ok(rows)
    }

    async fn list_audit(&self, filter: AuditFilter) -> StorageResult<Vec<AuditRecord>> {
        let state = self.state.read().await;
        let mut values: Vec<AuditRecord> = state
            .audits
            .iter()
            .filter(|a| filter.actor.as_ref().map_or(true, |actor| &a.actor == actor))
            .filter(|a| filter.target.as_ref().map_or(true, |t| &a.target == t))
            .cloned()
            .collect();
        values.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(apply_window(values, filter.window))
    }

    async fn latest_archive(&self, label: &str) -> StorageResult<Option<ArchiveRecord>> {
        let state = self.state.read().await;
        Ok(state
            .archives
            .iter()
            .filter(|a| a.label == label)
            .max_by_key(|a| a.taken_at)
            .cloned())
    }
}

#[derive(Debug)]
struct AggregateDelta {
    scope: ScopeId,
    change: i64,
    last_increased: Option<DateTime<Utc>>,
    decision_snapshot: Option<i64>,
    first_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Staged {
    ratings: HashMap<RatingKey, RatingRow>,
    allocations: HashMap<AllocKey, AllocationState>,
    aggregates: HashMap<AggKey, AggregateDelta>,
    spend: Vec<SpendRow>,
    target_snapshots: Vec<TargetSnapshot>,
    voter_snapshots: Vec<VoterSnapshot>,
    audits: Vec<AuditAppend>,
    archives: Vec<ArchiveRecord>,
    deleted: Vec<AggKey>,
    provisional: u64,
}

impl Staged {
    fn next_provisional(&mut self) -> u64 {
        self.provisional += 1;
        PROVISIONAL_SEQ_BASE + self.provisional
    }

    fn is_deleted(&self, kind: AllocationKind, target: &TargetId) -> bool {
        self.deleted.iter().any(|(k, t)| *k == kind && t == target)
    }
}

struct InMemoryTx {
    shared: Arc<RwLock<LedgerState>>,
    locks: Arc<LockTable>,
    guards: BTreeMap<LockKey, OwnedMutexGuard<()>>,
    staged: Staged,
}

impl InMemoryTx {
    async fn merged_aggregate(
        &self,
        kind: AllocationKind,
        target: &TargetId,
    ) -> Option<AggregateRow> {
        let key = (kind, target.clone());
        let base = if self.staged.is_deleted(kind, target) {
            None
        } else {
            self.shared.read().await.aggregates.get(&key).cloned()
        };
        match (base, self.staged.aggregates.get(&key)) {
            (base, None) => base,
            (base, Some(delta)) => {
                let mut row = base.unwrap_or_else(|| AggregateRow {
                    kind,
                    target: target.clone(),
                    scope: delta.scope.clone(),
                    summed_value: 0,
                    last_increased: None,
                    decision_time_snapshot_value: None,
                    created_at: delta.first_seen,
                });
                row.summed_value += delta.change;
                if delta.last_increased.is_some() {
                    row.last_increased = delta.last_increased;
                }
                if delta.decision_snapshot.is_some() {
                    row.decision_time_snapshot_value = delta.decision_snapshot;
                }
                Some(row)
            }
        }
    }
}

#[async_trait]
impl LedgerTx for InMemoryTx {
    async fn lock(&mut self, key: LockKey) -> StorageResult<()> {
        if self.guards.contains_key(&key) {
            return Ok(());
        }
        let slot = self.locks.slot(&key)?;
        let guard = slot.lock_owned().await;
        self.guards.insert(key, guard);
        Ok(())
    }

    async fn get_rating(&mut self, key: &RatingKey) -> StorageResult<Option<RatingRow>> {
        if let Some(row) = self.staged.ratings.get(key) {
            return Ok(Some(row.clone()));
        }
        Ok(self.shared.read().await.ratings.get(key).cloned())
    }

    async fn ratings_for_rater_matter(
        &mut self,
        rater: &IdentityId,
        matter: Matter,
    ) -> StorageResult<Vec<RatingRow>> {
        let mut merged: HashMap<RatingKey, RatingRow> = self
            .shared
            .read()
            .await
            .ratings
            .values()
            .filter(|r| r.key.rater() == rater && r.key.matter() == matter)
            .map(|r| (r.key.clone(), r.clone()))
            .collect();
        for (key, row) in &self.staged.ratings {
            if key.rater() == rater && key.matter() == matter {
                merged.insert(key.clone(), row.clone());
            }
        }
        let mut rows: Vec<RatingRow> = merged.into_values().collect();
        rows.sort_by_key(|r| r.seq);
        Ok(rows)
    }

    async fn ratings_given_by(&mut self, rater: &IdentityId) -> StorageResult<Vec<RatingRow>> {
        let mut merged: HashMap<RatingKey, RatingRow> = self
            .shared
            .read()
            .await
            .ratings
            .values()
            .filter(|r| r.key.rater() == rater)
            .map(|r| (r.key.clone(), r.clone()))
            .collect();
        for (key, row) in &self.staged.ratings {
            if key.rater() == rater {
                merged.insert(key.clone(), row.clone());
            }
        }
        let mut rows: Vec<RatingRow> = merged.into_values().collect();
        rows.sort_by_key(|r| r.seq);
        Ok(rows)
    }

    async fn put_rating(
        &mut self,
        key: &RatingKey,
        value: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<RatingRow> {
        let existing_seq = match self.staged.ratings.get(key) {
            Some(row) => Some(row.seq),
            None => self.shared.read().await.ratings.get(key).map(|r| r.seq),
        };
        let seq = match existing_seq {
            Some(seq) => seq,
            None => self.staged.next_provisional(),
        };
        let row = RatingRow {
            key: key.clone(),
            value,
            last_modified: at,
            seq,
        };
        self.staged.ratings.insert(key.clone(), row.clone());
        Ok(row)
    }

    async fn get_allocation(
        &mut self,
        kind: AllocationKind,
        rater: &IdentityId,
        target: &TargetId,
    ) -> StorageResult<Option<AllocationState>> {
        let key = (kind, rater.clone(), target.clone());
        if let Some(state) = self.staged.allocations.get(&key) {
            return Ok(Some(state.clone()));
        }
        if self.staged.is_deleted(kind, target) {
            return Ok(None);
        }
        Ok(self.shared.read().await.allocations.get(&key).cloned())
    }

    async fn allocations_for_voter_scope(
        &mut self,
        kind: AllocationKind,
        voter: &IdentityId,
        scope: &ScopeId,
    ) -> StorageResult<Vec<AllocationState>> {
        let mut merged: HashMap<AllocKey, AllocationState> = self
            .shared
            .read()
            .await
            .allocations
            .iter()
            .filter(|(_, s)| s.kind == kind && &s.rater == voter && &s.scope == scope)
            .filter(|(_, s)| !self.staged.is_deleted(kind, &s.target))
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        for (key, state) in &self.staged.allocations {
            if state.kind == kind && &state.rater == voter && &state.scope == scope {
                merged.insert(key.clone(), state.clone());
            }
        }
        let mut rows: Vec<AllocationState> = merged.into_values().collect();
        rows.sort_by_key(|s| s.seq);
        Ok(rows)
    }

    async fn put_allocation(
        &mut self,
        kind: AllocationKind,
        rater: &IdentityId,
        target: &TargetId,
        scope: &ScopeId,
        value: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<AllocationState> {
        let existing_seq = self
            .get_allocation(kind, rater, target)
            .await?
            .map(|s| s.seq);
        let seq = match existing_seq {
            Some(seq) => seq,
            None => self.staged.next_provisional(),
        };
        let state = AllocationState {
            kind,
            rater: rater.clone(),
            target: target.clone(),
            scope: scope.clone(),
            current_value: value,
            updated_at: at,
            seq,
        };
        self.staged
            .allocations
            .insert((kind, rater.clone(), target.clone()), state.clone());
        Ok(state)
    }

    async fn get_aggregate(
        &mut self,
        kind: AllocationKind,
        target: &TargetId,
    ) -> StorageResult<Option<AggregateRow>> {
        Ok(self.merged_aggregate(kind, target).await)
    }

    async fn apply_aggregate_change(
        &mut self,
        kind: AllocationKind,
        target: &TargetId,
        scope: &ScopeId,
        change: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<AggregateRow> {
        let delta = self
            .staged
            .aggregates
            .entry((kind, target.clone()))
            .or_insert_with(|| AggregateDelta {
                scope: scope.clone(),
                change: 0,
                last_increased: None,
                decision_snapshot: None,
                first_seen: at,
            });
        delta.change += change;
        if change > 0 {
            delta.last_increased = Some(at);
        }
        self.merged_aggregate(kind, target).await.ok_or_else(|| {
            StorageError::InvariantViolation(format!("aggregate for {target} vanished"))
        })
    }

    async fn set_decision_snapshot(
        &mut self,
        kind: AllocationKind,
        target: &TargetId,
        value: i64,
    ) -> StorageResult<()> {
        let current = self
            .merged_aggregate(kind, target)
            .await
            .ok_or_else(|| StorageError::NotFound(format!("aggregate {kind}:{target}")))?;
        let delta = self
            .staged
            .aggregates
            .entry((kind, target.clone()))
            .or_insert_with(|| AggregateDelta {
                scope: current.scope.clone(),
                change: 0,
                last_increased: None,
                decision_snapshot: None,
                first_seen: current.created_at,
            });
        delta.decision_snapshot = Some(value);
        Ok(())
    }

    async fn append_spend(&mut self, row: SpendRow) -> StorageResult<()> {
        self.staged.spend.push(row);
        Ok(())
    }

    async fn spend_since(
        &mut self,
        kind: AllocationKind,
        rater: &IdentityId,
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let matches =
            |row: &SpendRow| row.kind == kind && &row.rater == rater && row.timestamp > since;
        let committed: i64 = self
            .shared
            .read()
            .await
            .spend
            .iter()
            .filter(|row| matches(row) && !self.staged.is_deleted(kind, &row.target))
            .map(|row| row.amount)
            .sum();
        let staged: i64 = self
            .staged
            .spend
            .iter()
            .filter(|row| matches(row))
            .map(|row| row.amount)
            .sum();
        Ok(committed + staged)
    }

    async fn append_target_snapshot(&mut self, snapshot: TargetSnapshot) -> StorageResult<()> {
        self.staged.target_snapshots.push(snapshot);
        Ok(())
    }

    async fn append_voter_snapshot(&mut self, snapshot: VoterSnapshot) -> StorageResult<()> {
        self.staged.voter_snapshots.push(snapshot);
        Ok(())
    }

    async fn append_audit(&mut self, event: AuditAppend) -> StorageResult<()> {
        self.staged.audits.push(event);
        Ok(())
    }

    async fn record_archive(&mut self, record: ArchiveRecord) -> StorageResult<()> {
        self.staged.archives.push(record);
        Ok(())
    }

    async fn delete_target(
        &mut self,
        kind: AllocationKind,
        target: &TargetId,
    ) -> StorageResult<DeletedRows> {
        let mut deleted = DeletedRows::default();
        if !self.staged.is_deleted(kind, target) {
            let shared = self.shared.read().await;
            deleted.allocations = shared
                .allocations
                .values()
                .filter(|s| s.kind == kind && &s.target == target)
                .count() as u64;
            deleted.spend_rows = shared
                .spend
                .iter()
                .filter(|r| r.kind == kind && &r.target == target)
                .count() as u64;
            deleted.snapshots = shared
                .target_snapshots
                .iter()
                .filter(|s| s.kind == kind && &s.target == target)
                .count() as u64
                + shared
                    .voter_snapshots
                    .iter()
                    .filter(|s| s.kind == kind && &s.target == target)
                    .count() as u64;
            deleted.aggregates = u64::from(shared.aggregates.contains_key(&(kind, target.clone())));
        }

        let staged = &mut self.staged;
        let before = staged.allocations.len();
        staged
            .allocations
            .retain(|(k, _, t), _| !(*k == kind && t == target));
        deleted.allocations += (before - staged.allocations.len()) as u64;
        let before = staged.spend.len();
        staged
            .spend
            .retain(|r| !(r.kind == kind && &r.target == target));
        deleted.spend_rows += (before - staged.spend.len()) as u64;
        staged
            .target_snapshots
            .retain(|s| !(s.kind == kind && &s.target == target));
        staged
            .voter_snapshots
            .retain(|s| !(s.kind == kind && &s.target == target));
        staged.aggregates.remove(&(kind, target.clone()));
        if !staged.is_deleted(kind, target) {
            staged.deleted.push((kind, target.clone()));
        }
        Ok(deleted)
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let InMemoryTx {
            shared,
            guards,
            staged,
            ..
        } = *self;
        let mut state = shared.write().await;

        for (kind, target) in &staged.deleted {
            state
                .allocations
                .retain(|(k, _, t), _| !(k == kind && t == target));
            state
                .spend
                .retain(|r| !(&r.kind == kind && &r.target == target));
            state
                .target_snapshots
                .retain(|s| !(&s.kind == kind && &s.target == target));
            state
                .voter_snapshots
                .retain(|s| !(&s.kind == kind && &s.target == target));
            state.aggregates.remove(&(*kind, target.clone()));
        }

        let mut ratings: Vec<RatingRow> = staged.ratings.into_values().collect();
        ratings.sort_by_key(|r| r.seq);
        for mut row in ratings {
            let existing = state.ratings.get(&row.key).map(|r| r.seq);
            row.seq = match existing {
                Some(seq) => seq,
                None => state.take_seq(),
            };
            state.ratings.insert(row.key.clone(), row);
        }

        let mut allocations: Vec<(AllocKey, AllocationState)> =
            staged.allocations.into_iter().collect();
        allocations.sort_by_key(|(_, s)| s.seq);
        for (key, mut allocation) in allocations {
            let existing = state.allocations.get(&key).map(|s| s.seq);
            allocation.seq = match existing {
                Some(seq) => seq,
                None => state.take_seq(),
            };
            state.allocations.insert(key, allocation);
        }

        for ((kind, target), delta) in staged.aggregates {
            let row = state
                .aggregates
                .entry((kind, target.clone()))
                .or_insert_with(|| AggregateRow {
                    kind,
                    target,
                    scope: delta.scope.clone(),
                    summed_value: 0,
                    last_increased: None,
                    decision_time_snapshot_value: None,
                    created_at: delta.first_seen,
                });
            row.summed_value += delta.change;
            if delta.last_increased.is_some() {
                row.last_increased = delta.last_increased;
            }
            if delta.decision_snapshot.is_some() {
                row.decision_time_snapshot_value = delta.decision_snapshot;
            }
        }

        state.spend.extend(staged.spend);
        state.target_snapshots.extend(staged.target_snapshots);
        state.voter_snapshots.extend(staged.voter_snapshots);
        state.archives.extend(staged.archives);

        for event in staged.audits {
            let event_id = format!("audit-{}", Uuid::new_v4());
            let digest = audit_digest(&event, &event_id)?;
            let sequence = state.audits.len() as u64 + 1;
            state.audits.push(AuditRecord {
                event_id,
                sequence,
                actor: event.actor,
                target: event.target,
                event_type: event.event_type,
                old_value: event.old_value,
                new_value: event.new_value,
                reason: event.reason,
                timestamp: event.timestamp,
                payload: event.payload,
                digest,
            });
        }

        drop(state);
        drop(guards);
        Ok(())
    }
}

fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}
