use super::{ensure_member, notify_owner, resolve_target, AllocationRequest};
use chrono::Duration;
use credit_ledger::{
    AllocationChange, AllocationEngine, AllocationNotice, AllocationOutcome, EligibilitySource,
    Notifier, SpendPolicy, TargetDirectory,
};
use credit_storage::LedgerStore;
use credit_types::{
    AllocationKind, ChangeReason, CreditBasis, CreditError, CreditResult, IdentityId, TargetKind,
};
use std::sync::Arc;

/// Claps on chat targets, bounded by spend inside a trailing window.
#[derive(Clone)]
pub struct ClapUseCase {
    store: Arc<dyn LedgerStore>,
    directory: Arc<dyn TargetDirectory>,
    eligibility: Arc<dyn EligibilitySource>,
    notifier: Arc<dyn Notifier>,
    engine: AllocationEngine,
    basis: CreditBasis,
    window: Duration,
}

impl ClapUseCase {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        directory: Arc<dyn TargetDirectory>,
        eligibility: Arc<dyn EligibilitySource>,
        notifier: Arc<dyn Notifier>,
        engine: AllocationEngine,
        basis: CreditBasis,
        window: Duration,
    ) -> Self {
        Self {
            store,
            directory,
            eligibility,
            notifier,
            engine,
            basis,
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn clap(&self, request: &AllocationRequest) -> CreditResult<AllocationOutcome> {
        let now = self.engine.clock().now();
        let (target, scope) = resolve_target(self.directory.as_ref(), &request.target).await?;

        scope.ensure_open(now)?;
        if target.kind != TargetKind::Chat {
            return Err(CreditError::Forbidden(format!(
                "target {} is not a chat target",
                target.id
            )));
        }
        ensure_member(
            self.eligibility.as_ref(),
            &request.actor,
            scope.chat_group.as_ref(),
            "clap",
        )
        .await?;
        if !scope.chat_enabled {
            return Err(CreditError::Forbidden(format!(
                "chat and claps are disabled in scope {}",
                scope.id
            )));
        }
        if scope.forbid_negative && request.value < 0 {
            return Err(CreditError::Forbidden(format!(
                "scope {} does not allow negative claps",
                scope.id
            )));
        }
        if request.actor == target.owner {
            return Err(CreditError::Forbidden(format!(
                "{} cannot clap on their own target",
                request.actor
            )));
        }

        let change = AllocationChange {
            kind: AllocationKind::Clap,
            rater: request.actor.clone(),
            target: target.id.clone(),
            scope: scope.id.clone(),
            new_value: request.value,
            basis: self.basis.clone(),
            reason: ChangeReason::UserEdit,
            skip_entitlement_check: false,
            deadline: request.deadline,
        };
        let mut tx = self.store.begin().await?;
        let outcome = self
            .engine
            .apply(tx.as_mut(), &change, SpendPolicy::RollingWindow(self.window))
            .await?;
        tx.commit().await?;

        if outcome.applied {
            tracing::info!(
                clapper = %request.actor,
                target = %target.id,
                old = outcome.old_value,
                new = outcome.new_value,
                "claps recorded"
            );
            notify_owner(
                self.notifier.as_ref(),
                AllocationNotice {
                    kind: AllocationKind::Clap,
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

    /// Entitlement minus clap spend inside the trailing window.
    pub async fn credit_left(&self, clapper: &IdentityId) -> CreditResult<i64> {
        let entitlement = self.engine.entitlement(clapper, &self.basis).await?;
        let since = self.engine.clock().now() - self.window;
        let mut tx = self.store.begin().await?;
        let spent = tx.spend_since(AllocationKind::Clap, clapper, since).await?;
        Ok(entitlement - spent)
    }
}
