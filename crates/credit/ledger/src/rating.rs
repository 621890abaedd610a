//! Rating ledger updates.
//!
//! [`LedgerUpdateService::update_rating`] is the single write path for
//! [`RatingRow`]s: it serializes on the (rater, matter) lock, checks the
//! change against the rater's entitlement, and writes the row plus one audit
//! entry. Reconciliation and identity merges reuse it with the check or the
//! audit turned off.

use crate::ports::EntitlementSource;
use chrono::{DateTime, Utc};
use credit_storage::{
    AggregatedRating, AuditAppend, LedgerStore, LedgerTx, LockKey, RatingRow,
};
use credit_types::{
    ChangeReason, Clock, CreditBasis, CreditError, CreditResult, IdentityId, Matter, RatingKey,
    TargetId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Credit basis bounding each rating matter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatterBases {
    #[serde(default)]
    pub rep: CreditBasis,
    #[serde(default)]
    pub cic: CreditBasis,
    #[serde(default)]
    pub drop_rating: CreditBasis,
}

impl Default for MatterBases {
    fn default() -> Self {
        Self {
            rep: CreditBasis::TdhPlusXtdh,
            cic: CreditBasis::TdhPlusXtdh,
            drop_rating: CreditBasis::TdhPlusXtdh,
        }
    }
}

impl MatterBases {
    pub fn basis_for(&self, matter: Matter) -> &CreditBasis {
        match matter {
            Matter::Rep => &self.rep,
            Matter::Cic => &self.cic,
            Matter::DropRating => &self.drop_rating,
        }
    }
}

/// A requested rating value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingUpdate {
    pub key: RatingKey,
    pub new_value: i64,
}

impl RatingUpdate {
    pub fn new(key: RatingKey, new_value: i64) -> Self {
        Self { key, new_value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    pub skip_entitlement_check: bool,
    pub skip_audit: bool,
    pub reason: ChangeReason,
    /// Fail with `DeadlineExceeded` instead of waiting for the lock past this instant.
    pub deadline: Option<DateTime<Utc>>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            skip_entitlement_check: false,
            skip_audit: false,
            reason: ChangeReason::UserEdit,
            deadline: None,
        }
    }
}

impl UpdateOptions {
    pub fn with_reason(reason: ChangeReason) -> Self {
        Self {
            reason,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingOutcome {
    pub key: RatingKey,
    pub old_value: i64,
    pub new_value: i64,
    /// False when the request matched the stored value and nothing was written.
    pub applied: bool,
    /// Σ|value| on the (rater, matter) pair after the call.
    pub credit_spent: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    pub moved: u64,
    /// Ratings dropped because the destination would have rated itself.
    pub dropped: u64,
}

/// Write path for the rating ledger.
#[derive(Clone)]
pub struct LedgerUpdateService {
    store: Arc<dyn LedgerStore>,
    entitlements: Arc<dyn EntitlementSource>,
    clock: Arc<dyn Clock>,
    bases: MatterBases,
}

impl LedgerUpdateService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        entitlements: Arc<dyn EntitlementSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            entitlements,
            clock,
            bases: MatterBases::default(),
        }
    }

    pub fn with_bases(mut self, bases: MatterBases) -> Self {
        self.bases = bases;
        self
    }

    pub fn store(&self) -> Arc<dyn LedgerStore> {
        Arc::clone(&self.store)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn bases(&self) -> &MatterBases {
        &self.bases
    }

    /// Entitlement of `rater` on `matter`.
    pub async fn entitlement(&self, rater: &IdentityId, matter: Matter) -> CreditResult<i64> {
        self.entitlements
            .entitlement(rater, self.bases.basis_for(matter))
            .await
    }

    /// Apply one rating change inside the caller's transaction.
    ///
    /// Takes the (rater, matter) lock before reading anything the entitlement
    /// decision depends on. Writing the stored value again is a no-op.
    pub async fn update_rating(
        &self,
        tx: &mut dyn LedgerTx,
        update: &RatingUpdate,
        opts: UpdateOptions,
    ) -> CreditResult<RatingOutcome> {
        let key = &update.key;
        let new_value = update.new_value;
        if new_value == i64::MIN {
            return Err(CreditError::Validation(format!(
                "rating value {new_value} is out of range"
            )));
        }
        if let Some(deadline) = opts.deadline {
            if self.clock.now() >= deadline {
                return Err(CreditError::DeadlineExceeded(format!(
                    "rating update for {key} not started before {deadline}"
                )));
            }
        }

        tx.lock(LockKey::RaterMatter {
            rater: key.rater().clone(),
            matter: key.matter(),
        })
        .await?;

        let rows = tx
            .ratings_for_rater_matter(key.rater(), key.matter())
            .await?;
        let current_value = rows
            .iter()
            .find(|row| &row.key == key)
            .map_or(0, |row| row.value);
        let total_spent = tally(&rows);

        if new_value == current_value {
            tracing::debug!(key = %key, value = new_value, "rating unchanged, skipping write");
            return Ok(RatingOutcome {
                key: key.clone(),
                old_value: current_value,
                new_value,
                applied: false,
                credit_spent: total_spent,
            });
        }

        let delta = new_value.abs() - current_value.abs();
        let spent_after = total_spent.saturating_add(delta);
        if !opts.skip_entitlement_check {
            let entitlement = self.entitlement(key.rater(), key.matter()).await?;
            if spent_after > entitlement {
                return Err(CreditError::InsufficientCredit {
                    needed: delta,
                    available: entitlement.saturating_sub(total_spent),
                });
            }
        }

        let now = self.clock.now();
        tx.put_rating(key, new_value, now).await?;

        if !opts.skip_audit {
            tx.append_audit(AuditAppend {
                actor: key.rater().clone(),
                target: key.target().clone(),
                event_type: "rating_edit".to_string(),
                old_value: current_value,
                new_value,
                reason: opts.reason,
                timestamp: now,
                payload: serde_json::json!({
                    "matter": key.matter(),
                    "category": key.category(),
                }),
            })
            .await?;
        }

        Ok(RatingOutcome {
            key: key.clone(),
            old_value: current_value,
            new_value,
            applied: true,
            credit_spent: spent_after,
        })
    }

    /// Apply one rating change in a transaction of its own.
    pub async fn rate(
        &self,
        update: &RatingUpdate,
        opts: UpdateOptions,
    ) -> CreditResult<RatingOutcome> {
        let mut tx = self.store.begin().await?;
        let outcome = self.update_rating(tx.as_mut(), update, opts).await?;
        tx.commit().await?;
        if outcome.applied {
            tracing::info!(
                key = %outcome.key,
                old = outcome.old_value,
                new = outcome.new_value,
                reason = %opts.reason,
                "rating updated"
            );
        }
        Ok(outcome)
    }

    /// Σ|value| of a rater's rows on a matter.
    pub async fn credit_spent(&self, rater: &IdentityId, matter: Matter) -> CreditResult<i64> {
        let mut tx = self.store.begin().await?;
        let rows = tx.ratings_for_rater_matter(rater, matter).await?;
        Ok(tally(&rows))
    }

    /// Entitlement minus spend; negative while over the limit.
    pub async fn credit_left(&self, rater: &IdentityId, matter: Matter) -> CreditResult<i64> {
        let entitlement = self.entitlement(rater, matter).await?;
        let spent = self.credit_spent(rater, matter).await?;
        Ok(entitlement - spent)
    }

    pub async fn aggregated_rating(
        &self,
        target: &TargetId,
        matter: Matter,
        category: &str,
    ) -> CreditResult<AggregatedRating> {
        Ok(self
            .store
            .aggregated_rating(target, matter, category)
            .await?)
    }

    /// Move every rating given by `source` onto `destination`.
    ///
    /// Source rows are zeroed without audit; destination rows receive the
    /// source value added to whatever they held, audited as an identity merge.
    /// Entitlement is not checked on either side; the reconciler brings the
    /// destination back under its limit.
    pub async fn transfer_ratings(
        &self,
        source: &IdentityId,
        destination: &IdentityId,
    ) -> CreditResult<TransferReport> {
        if source == destination {
            return Err(CreditError::Validation(
                "rating transfer needs two different identities".to_string(),
            ));
        }
        let mut tx = self.store.begin().await?;

        let mut keys: Vec<LockKey> = Matter::ALL
            .iter()
            .flat_map(|matter| {
                [source, destination].map(|rater| LockKey::RaterMatter {
                    rater: rater.clone(),
                    matter: *matter,
                })
            })
            .collect();
        keys.sort();
        for key in keys {
            tx.lock(key).await?;
        }

        let given: Vec<RatingRow> = tx
            .ratings_given_by(source)
            .await?
            .into_iter()
            .filter(|row| row.value != 0)
            .collect();

        let zero_opts = UpdateOptions {
            skip_entitlement_check: true,
            skip_audit: true,
            reason: ChangeReason::IdentityMerge,
            deadline: None,
        };
        let merge_opts = UpdateOptions {
            skip_entitlement_check: true,
            skip_audit: false,
            reason: ChangeReason::IdentityMerge,
            deadline: None,
        };

        let mut report = TransferReport::default();
        for row in given {
            self.update_rating(tx.as_mut(), &RatingUpdate::new(row.key.clone(), 0), zero_opts)
                .await?;

            let destination_key = match row.key.with_rater(destination.clone()) {
                Ok(key) => key,
                Err(CreditError::Forbidden(_)) => {
                    report.dropped += 1;
                    continue;
                }
                Err(other) => return Err(other),
            };
            let existing = tx
                .get_rating(&destination_key)
                .await?
                .map_or(0, |r| r.value);
            let merged = existing.checked_add(row.value).ok_or_else(|| {
                CreditError::Validation(format!("merged rating on {destination_key} overflows"))
            })?;
            self.update_rating(
                tx.as_mut(),
                &RatingUpdate::new(destination_key, merged),
                merge_opts,
            )
            .await?;
            report.moved += 1;
        }

        tx.commit().await?;
        tracing::info!(
            source = %source,
            destination = %destination,
            moved = report.moved,
            dropped = report.dropped,
            "transferred ratings"
        );
        Ok(report)
    }
}

/// Σ|value|, saturating at `i64::MAX`.
fn tally(rows: &[RatingRow]) -> i64 {
    rows.iter()
        .fold(0_i64, |acc, row| acc.saturating_add(row.value.saturating_abs()))
}
