use super::{ensure_member, notify_owner, resolve_target, AllocationRequest};
use credit_ledger::{
    AllocationChange, AllocationEngine, AllocationNotice, AllocationOutcome, EligibilitySource,
    Notifier, SpendPolicy, TargetDirectory,
};
use credit_storage::LedgerStore;
use credit_types::{
    AllocationKind, ChangeReason, CreditError, CreditResult, IdentityId, ScopeId, ScopeKind,
    TargetKind,
};
use std::sync::Arc;

/// Signed votes on participatory targets, bounded by the voter's
/// cumulative spend within the scope.
#[derive(Clone)]
pub struct VoteUseCase {
    store: Arc<dyn LedgerStore>,
    directory: Arc<dyn TargetDirectory>,
    eligibility: Arc<dyn EligibilitySource>,
    notifier: Arc<dyn Notifier>,
    engine: AllocationEngine,
}

impl VoteUseCase {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        directory: Arc<dyn TargetDirectory>,
        eligibility: Arc<dyn EligibilitySource>,
        notifier: Arc<dyn Notifier>,
        engine: AllocationEngine,
    ) -> Self {
        Self {
            store,
            directory,
            eligibility,
            notifier,
            engine,
        }
    }

    pub async fn vote(&self, request: &AllocationRequest) -> CreditResult<AllocationOutcome> {
        let now = self.engine.clock().now();
        let (target, scope) = resolve_target(self.directory.as_ref(), &request.target).await?;

        scope.ensure_open(now)?;
        if target.kind != TargetKind::Participatory {
            return Err(CreditError::Forbidden(format!(
                "target {} does not accept votes",
                target.id
            )));
        }
        if !scope.voting_window_contains(now) {
            return Err(CreditError::Forbidden(format!(
                "voting period of scope {} is not open",
                scope.id
            )));
        }
        ensure_member(
            self.eligibility.as_ref(),
            &request.actor,
            scope.voting_group.as_ref(),
            "vote",
        )
        .await?;
        if scope.kind == ScopeKind::Chat {
            return Err(CreditError::Forbidden(format!(
                "scope {} does not allow voting",
                scope.id
            )));
        }
        if scope.forbid_negative && request.value < 0 {
            return Err(CreditError::Forbidden(format!(
                "scope {} does not allow negative votes",
                scope.id
            )));
        }
        if scope.forbid_self_allocation && request.actor == target.owner {
            return Err(CreditError::Forbidden(format!(
                "{} cannot vote for their own target",
                request.actor
            )));
        }

        let change = AllocationChange {
            kind: AllocationKind::Vote,
            rater: request.actor.clone(),
            target: target.id.clone(),
            scope: scope.id.clone(),
            new_value: request.value,
            basis: scope.credit_basis.clone(),
            reason: ChangeReason::UserEdit,
            skip_entitlement_check: false,
            deadline: request.deadline,
        };
        let mut tx = self.store.begin().await?;
        let outcome = self
            .engine
            .apply(tx.as_mut(), &change, SpendPolicy::ScopeCumulative)
            .await?;
        tx.commit().await?;

        if outcome.applied {
            tracing::info!(
                voter = %request.actor,
                target = %target.id,
                scope = %scope.id,
                old = outcome.old_value,
                new = outcome.new_value,
                "vote recorded"
            );
            notify_owner(
                self.notifier.as_ref(),
                AllocationNotice {
                    kind: AllocationKind::Vote,
                    actor: request.actor.clone(),
                    target: target.id,
                    target_owner: target.owner,
                    value: outcome.new_value,
                    scope: scope.id,
                    visibility_group: scope.visibility_group,
                },
            )
            .await;
        }
        Ok(outcome)
    }

    /// Entitlement on the scope's basis minus Σ|vote| in the scope.
    pub async fn credit_left(&self, voter: &IdentityId, scope: &ScopeId) -> CreditResult<i64> {
        let info = self
            .directory
            .scope(scope)
            .await?
            .ok_or_else(|| CreditError::NotFound(format!("scope {scope}")))?;
        let entitlement = self.engine.entitlement(voter, &info.credit_basis).await?;
        let mut tx = self.store.begin().await?;
        let spent = self
            .engine
            .spent(
                tx.as_mut(),
                AllocationKind::Vote,
                voter,
                scope,
                SpendPolicy::ScopeCumulative,
            )
            .await?;
        Ok(entitlement - spent)
    }
}
