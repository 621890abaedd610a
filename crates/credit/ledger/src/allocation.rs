//! Allocation writes for the aggregate-keeping specializations (votes, claps).

use crate::ports::EntitlementSource;
use chrono::{DateTime, Duration, Utc};
use credit_storage::{
    AggregateRow, AuditAppend, DeletedRows, LedgerStore, LedgerTx, LockKey, SpendRow,
    TargetSnapshot, VoterSnapshot,
};
use credit_types::{
    AllocationKind, ChangeReason, Clock, CreditBasis, CreditError, CreditResult, IdentityId,
    ScopeId, TargetId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How consumed credit is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendPolicy {
    /// Σ|current value| over the voter's allocations in the scope.
    ScopeCumulative,
    /// Σ spend rows newer than `now - window`, across scopes.
    RollingWindow(Duration),
}

/// A requested allocation value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationChange {
    pub kind: AllocationKind,
    pub rater: IdentityId,
    pub target: TargetId,
    pub scope: ScopeId,
    pub new_value: i64,
    pub basis: CreditBasis,
    pub reason: ChangeReason,
    #[serde(default)]
    pub skip_entitlement_check: bool,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationOutcome {
    pub old_value: i64,
    pub new_value: i64,
    pub applied: bool,
    /// Consumed credit under the active policy, after the change.
    pub credit_spent: i64,
    pub aggregate: Option<AggregateRow>,
}

/// Applies allocation changes and keeps aggregates, spend rows, snapshots
/// and audit entries in step with them.
#[derive(Clone)]
pub struct AllocationEngine {
    entitlements: Arc<dyn EntitlementSource>,
    clock: Arc<dyn Clock>,
}

impl AllocationEngine {
    pub fn new(entitlements: Arc<dyn EntitlementSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entitlements,
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn entitlement(
        &self,
        rater: &IdentityId,
        basis: &CreditBasis,
    ) -> CreditResult<i64> {
        self.entitlements.entitlement(rater, basis).await
    }

    /// Credit consumed by a voter under `policy`, read inside `tx`.
    pub async fn spent(
        &self,
        tx: &mut dyn LedgerTx,
        kind: AllocationKind,
        rater: &IdentityId,
        scope: &ScopeId,
        policy: SpendPolicy,
    ) -> CreditResult<i64> {
        match policy {
            SpendPolicy::ScopeCumulative => Ok(tx
                .allocations_for_voter_scope(kind, rater, scope)
                .await?
                .iter()
                .fold(0_i64, |acc, s| acc.saturating_add(s.current_value.saturating_abs()))),
            SpendPolicy::RollingWindow(window) => {
                let since = self.clock.now() - window;
                Ok(tx.spend_since(kind, rater, since).await?)
            }
        }
    }

    /// Apply one allocation change inside the caller's transaction.
    ///
    /// Lock order: the voter-level key for the policy, then the target's
    /// aggregate. Both are held until the transaction ends.
    pub async fn apply(
        &self,
        tx: &mut dyn LedgerTx,
        change: &AllocationChange,
        policy: SpendPolicy,
    ) -> CreditResult<AllocationOutcome> {
        if change.new_value == i64::MIN {
            return Err(CreditError::Validation(format!(
                "{} value {} is out of range",
                change.kind, change.new_value
            )));
        }
        if let Some(deadline) = change.deadline {
            if self.clock.now() >= deadline {
                return Err(CreditError::DeadlineExceeded(format!(
                    "{} by {} on {} not started before {deadline}",
                    change.kind, change.rater, change.target
                )));
            }
        }

        let voter_key = match policy {
            SpendPolicy::ScopeCumulative => LockKey::VoterScope {
                kind: change.kind,
                voter: change.rater.clone(),
                scope: change.scope.clone(),
            },
            SpendPolicy::RollingWindow(_) => LockKey::VoterWindow {
                kind: change.kind,
                voter: change.rater.clone(),
            },
        };
        tx.lock(voter_key).await?;
        tx.lock(LockKey::TargetAggregate {
            kind: change.kind,
            target: change.target.clone(),
        })
        .await?;

        let current_value = tx
            .get_allocation(change.kind, &change.rater, &change.target)
            .await?
            .map_or(0, |s| s.current_value);
        let spent = self
            .spent(tx, change.kind, &change.rater, &change.scope, policy)
            .await?;

        if change.new_value == current_value {
            return Ok(AllocationOutcome {
                old_value: current_value,
                new_value: current_value,
                applied: false,
                credit_spent: spent,
                aggregate: tx.get_aggregate(change.kind, &change.target).await?,
            });
        }

        let diff = change.new_value.abs() - current_value.abs();
        if !change.skip_entitlement_check {
            let entitlement = self.entitlement(&change.rater, &change.basis).await?;
            if spent.saturating_add(diff) > entitlement {
                return Err(CreditError::InsufficientCredit {
                    needed: diff,
                    available: entitlement.saturating_sub(spent),
                });
            }
        }

        let now = self.clock.now();
        tx.put_allocation(
            change.kind,
            &change.rater,
            &change.target,
            &change.scope,
            change.new_value,
            now,
        )
        .await?;
        let aggregate = tx
            .apply_aggregate_change(
                change.kind,
                &change.target,
                &change.scope,
                change.new_value - current_value,
                now,
            )
            .await?;

        // Rolling windows only ever age spend out; handing magnitude back
        // would let a voter re-spend it inside the same window.
        let spend_amount = match policy {
            SpendPolicy::ScopeCumulative => diff,
            SpendPolicy::RollingWindow(_) => diff.max(0),
        };
        tx.append_spend(SpendRow {
            kind: change.kind,
            rater: change.rater.clone(),
            target: change.target.clone(),
            scope: change.scope.clone(),
            amount: spend_amount,
            timestamp: now,
        })
        .await?;
        tx.append_target_snapshot(TargetSnapshot {
            kind: change.kind,
            target: change.target.clone(),
            scope: change.scope.clone(),
            value: aggregate.summed_value,
            timestamp: now,
        })
        .await?;
        tx.append_voter_snapshot(VoterSnapshot {
            kind: change.kind,
            voter: change.rater.clone(),
            target: change.target.clone(),
            scope: change.scope.clone(),
            value: change.new_value,
            timestamp: now,
        })
        .await?;
        tx.append_audit(AuditAppend {
            actor: change.rater.clone(),
            target: change.target.clone(),
            event_type: format!("{}_edit", change.kind),
            old_value: current_value,
            new_value: change.new_value,
            reason: change.reason,
            timestamp: now,
            payload: serde_json::json!({
                "scope": change.scope,
                "basis": change.basis,
            }),
        })
        .await?;

        Ok(AllocationOutcome {
            old_value: current_value,
            new_value: change.new_value,
            applied: true,
            credit_spent: spent.saturating_add(spend_amount),
            aggregate: Some(aggregate),
        })
    }

    /// Remove every allocation trace of a deleted target, in its own transaction.
    pub async fn delete_target(
        &self,
        store: &dyn LedgerStore,
        kind: AllocationKind,
        target: &TargetId,
    ) -> CreditResult<DeletedRows> {
        let mut tx = store.begin().await?;
        tx.lock(LockKey::TargetAggregate {
            kind,
            target: target.clone(),
        })
        .await?;
        let deleted = tx.delete_target(kind, target).await?;
        tx.commit().await?;
        tracing::info!(
            kind = %kind,
            target = %target,
            allocations = deleted.allocations,
            spend_rows = deleted.spend_rows,
            "deleted target allocations"
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::StaticEntitlements;
    use credit_storage::memory::InMemoryLedgerStore;
    use credit_types::ManualClock;

    fn vote(rater: &str, target: &str, value: i64) -> AllocationChange {
        AllocationChange {
            kind: AllocationKind::Vote,
            rater: rater.into(),
            target: target.into(),
            scope: "wave-1".into(),
            new_value: value,
            basis: CreditBasis::Tdh,
            reason: ChangeReason::UserEdit,
            skip_entitlement_check: false,
            deadline: None,
        }
    }

    async fn apply(
        store: &InMemoryLedgerStore,
        engine: &AllocationEngine,
        change: AllocationChange,
        policy: SpendPolicy,
    ) -> CreditResult<AllocationOutcome> {
        let mut tx = store.begin().await?;
        let outcome = engine.apply(tx.as_mut(), &change, policy).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    #[tokio::test]
    async fn votes_keep_aggregate_equal_to_allocation_sum() {
        let store = InMemoryLedgerStore::new();
        let entitlements = Arc::new(StaticEntitlements::new());
        entitlements.set("alice", CreditBasis::Tdh, 100);
        entitlements.set("bob", CreditBasis::Tdh, 100);
        let engine = AllocationEngine::new(entitlements, Arc::new(ManualClock::new(Utc::now())));

        for change in [
            vote("alice", "drop-1", 10),
            vote("bob", "drop-1", -4),
            vote("alice", "drop-1", 3),
            vote("bob", "drop-2", 7),
        ] {
            apply(&store, &engine, change, SpendPolicy::ScopeCumulative)
                .await
                .unwrap();
        }

        let rows = store
            .aggregates_for_scope(AllocationKind::Vote, &"wave-1".into())
            .await
            .unwrap();
        for row in rows {
            assert_eq!(
                row.summed_value,
                store.allocation_sum(AllocationKind::Vote, &row.target).await
            );
        }
        let drop_1 = store
            .target_snapshots(AllocationKind::Vote, &"drop-1".into(), None)
            .await
            .unwrap();
        let values: Vec<i64> = drop_1.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![10, 6, -1]);
        assert_eq!(store.voter_snapshots().await.len(), 4);
    }

    #[tokio::test]
    async fn cumulative_spend_rows_reconstruct_outstanding_allocation() {
        let store = InMemoryLedgerStore::new();
        let entitlements = Arc::new(StaticEntitlements::new());
        entitlements.set("alice", CreditBasis::Tdh, 20);
        let engine = AllocationEngine::new(entitlements, Arc::new(ManualClock::new(Utc::now())));

        for value in [8, -3, 0, 5] {
            apply(&store, &engine, vote("alice", "drop-1", value), SpendPolicy::ScopeCumulative)
                .await
                .unwrap();
        }
        let total: i64 = store.spend_rows().await.iter().map(|r| r.amount).sum();
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn rolling_window_ages_out_old_spend() {
        let store = InMemoryLedgerStore::new();
        let entitlements = Arc::new(StaticEntitlements::new());
        entitlements.set("alice", CreditBasis::Tdh, 5);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = AllocationEngine::new(entitlements, clock.clone());
        let policy = SpendPolicy::RollingWindow(Duration::days(30));
        let clap = |target: &str, value: i64| AllocationChange {
            kind: AllocationKind::Clap,
            ..vote("alice", target, value)
        };

        apply(&store, &engine, clap("chat-1", 5), policy).await.unwrap();
        let err = apply(&store, &engine, clap("chat-2", 1), policy)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CreditError::InsufficientCredit {
                needed: 1,
                available: 0
            }
        );

        clock.advance(Duration::days(31));
        let outcome = apply(&store, &engine, clap("chat-2", 5), policy)
            .await
            .unwrap();
        assert_eq!(outcome.credit_spent, 5);
    }

    #[tokio::test]
    async fn delete_target_clears_its_rows() {
        let store = InMemoryLedgerStore::new();
        let entitlements = Arc::new(StaticEntitlements::new());
        entitlements.set("alice", CreditBasis::Tdh, 10);
        let engine = AllocationEngine::new(entitlements, Arc::new(ManualClock::new(Utc::now())));
        apply(&store, &engine, vote("alice", "drop-1", 4), SpendPolicy::ScopeCumulative)
            .await
            .unwrap();

        let deleted = engine
            .delete_target(&store, AllocationKind::Vote, &"drop-1".into())
            .await
            .unwrap();
        assert_eq!(deleted.allocations, 1);
        assert_eq!(deleted.spend_rows, 1);
        assert_eq!(deleted.snapshots, 2);
        assert!(store.spend_rows().await.is_empty());
    }

    #[tokio::test]
    async fn over_limit_voter_cannot_shrink_a_vote() {
        let store = InMemoryLedgerStore::new();
        let entitlements = Arc::new(StaticEntitlements::new());
        entitlements.set("alice", CreditBasis::Tdh, 10);
        let engine =
            AllocationEngine::new(entitlements.clone(), Arc::new(ManualClock::new(Utc::now())));
        apply(&store, &engine, vote("alice", "drop-1", 10), SpendPolicy::ScopeCumulative)
            .await
            .unwrap();
        entitlements.set("alice", CreditBasis::Tdh, 3);

        let err = apply(&store, &engine, vote("alice", "drop-1", -9), SpendPolicy::ScopeCumulative)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CreditError::InsufficientCredit {
                needed: -1,
                available: -7
            }
        );
        assert_eq!(store.allocation_sum(AllocationKind::Vote, &"drop-1".into()).await, 10);

        let outcome = apply(&store, &engine, vote("alice", "drop-1", 2), SpendPolicy::ScopeCumulative)
            .await
            .unwrap();
        assert_eq!(outcome.credit_spent, 2);
    }
}
