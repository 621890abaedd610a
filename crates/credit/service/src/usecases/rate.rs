use super::{ensure_member, resolve_target};
use credit_ledger::{
    EligibilitySource, LedgerUpdateService, RatingOutcome, RatingUpdate, TargetDirectory,
    UpdateOptions,
};
use credit_storage::LockKey;
use credit_types::{CreditError, CreditResult, IdentityId, Matter, RatingKey, TargetId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One entry of a bulk rating request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkRatingItem {
    pub target: TargetId,
    pub category: String,
    pub value: i64,
}

/// Ratings on identities (rep, CIC) and drops.
#[derive(Clone)]
pub struct RateUseCase {
    ratings: LedgerUpdateService,
    directory: Arc<dyn TargetDirectory>,
    eligibility: Arc<dyn EligibilitySource>,
}

impl RateUseCase {
    pub fn new(
        ratings: LedgerUpdateService,
        directory: Arc<dyn TargetDirectory>,
        eligibility: Arc<dyn EligibilitySource>,
    ) -> Self {
        Self {
            ratings,
            directory,
            eligibility,
        }
    }

    pub fn ratings(&self) -> &LedgerUpdateService {
        &self.ratings
    }

    pub async fn rate(
        &self,
        rater: &IdentityId,
        target: &TargetId,
        matter: Matter,
        category: &str,
        value: i64,
    ) -> CreditResult<RatingOutcome> {
        let key = RatingKey::new(rater.clone(), target.clone(), matter, category)?;
        self.check_target(&key).await?;
        self.ratings
            .rate(&RatingUpdate::new(key, value), UpdateOptions::default())
            .await
    }

    /// Apply every item in one transaction under a single (rater, matter)
    /// lock. Items are checked against the running total in order; the first
    /// failure discards the whole batch.
    pub async fn rate_bulk(
        &self,
        rater: &IdentityId,
        matter: Matter,
        items: &[BulkRatingItem],
    ) -> CreditResult<Vec<RatingOutcome>> {
        let mut updates = Vec::with_capacity(items.len());
        for item in items {
            let key = RatingKey::new(rater.clone(), item.target.clone(), matter, &item.category)?;
            self.check_target(&key).await?;
            updates.push(RatingUpdate::new(key, item.value));
        }

        let store = self.ratings.store();
        let mut tx = store.begin().await?;
        tx.lock(LockKey::RaterMatter {
            rater: rater.clone(),
            matter,
        })
        .await?;
        let mut outcomes = Vec::with_capacity(updates.len());
        for update in &updates {
            outcomes.push(
                self.ratings
                    .update_rating(tx.as_mut(), update, UpdateOptions::default())
                    .await?,
            );
        }
        tx.commit().await?;

        tracing::info!(
            rater = %rater,
            matter = %matter,
            items = outcomes.len(),
            applied = outcomes.iter().filter(|o| o.applied).count(),
            "bulk rating applied"
        );
        Ok(outcomes)
    }

    /// Drop ratings follow the drop's scope: it must exist, be open and in
    /// its voting period, the rater must be in the voting group and must not
    /// own the drop.
    async fn check_target(&self, key: &RatingKey) -> CreditResult<()> {
        if key.matter().targets_identity() {
            return Ok(());
        }
        let (target, scope) = resolve_target(self.directory.as_ref(), key.target()).await?;
        let now = self.ratings.clock().now();
        scope.ensure_open(now)?;
        if &target.owner == key.rater() {
            return Err(CreditError::Forbidden(format!(
                "{} cannot rate their own drop",
                key.rater()
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
            key.rater(),
            scope.voting_group.as_ref(),
            "rate",
        )
        .await
    }
}
