//! Out-of-band clawback of allocations that exceed a shrunken entitlement.
//!
//! Each run walks every (rater, matter) rating pair and every (voter, scope)
//! vote pair whose tally is over the current entitlement. Before the first
//! mutation of a partition (a matter, or the vote ledger) the partition's
//! full state is written to the [`ArchiveStore`] as JSON Lines. Every pair is
//! then reduced in its own transaction under the same lock the user-facing
//! write path takes, so a failure on one pair is logged and skipped.

use crate::allocation::{AllocationChange, AllocationEngine, SpendPolicy};
use crate::ports::{EntitlementSource, TargetDirectory};
use crate::rating::{LedgerUpdateService, RatingUpdate, UpdateOptions};
use crate::reduction::plan_reduction;
use chrono::Duration;
use credit_storage::{ArchiveRecord, ArchiveStore, LedgerStore, LockKey};
use credit_types::{
    AllocationKind, ChangeReason, Clock, CreditError, CreditResult, IdentityId, Matter, ScopeId,
    ScopeInfo, ScopePhase,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// A partition archived more recently than this is not archived again.
    /// Zero archives on every run that mutates.
    pub min_archive_interval: Duration,
    /// Also reconcile vote allocations per (voter, scope).
    pub reconcile_votes: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            min_archive_interval: Duration::zero(),
            reconcile_votes: true,
        }
    }
}

/// A pair the run could not bring under its limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairFailure {
    pub rater: IdentityId,
    /// Matter name for ratings, `vote@<scope>` for allocations.
    pub partition: String,
    pub error: CreditError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub pairs_examined: u64,
    pub pairs_reduced: u64,
    pub rows_reduced: u64,
    pub magnitude_removed: i64,
    pub failures: Vec<PairFailure>,
    pub archives: Vec<ArchiveRecord>,
}

impl ReconcileReport {
    pub fn merge(&mut self, other: ReconcileReport) {
        self.pairs_examined += other.pairs_examined;
        self.pairs_reduced += other.pairs_reduced;
        self.rows_reduced += other.rows_reduced;
        self.magnitude_removed += other.magnitude_removed;
        self.failures.extend(other.failures);
        self.archives.extend(other.archives);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of reducing one pair.
#[derive(Debug, Default)]
struct PairOutcome {
    rows: u64,
    removed: i64,
}

pub struct OverspendReconciler {
    store: Arc<dyn LedgerStore>,
    archive: Arc<dyn ArchiveStore>,
    ratings: LedgerUpdateService,
    allocations: AllocationEngine,
    entitlements: Arc<dyn EntitlementSource>,
    directory: Arc<dyn TargetDirectory>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
}

impl OverspendReconciler {
    pub fn new(
        ratings: LedgerUpdateService,
        allocations: AllocationEngine,
        entitlements: Arc<dyn EntitlementSource>,
        directory: Arc<dyn TargetDirectory>,
        archive: Arc<dyn ArchiveStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store: ratings.store(),
            archive,
            ratings,
            allocations,
            entitlements,
            directory,
            clock,
            config: ReconcilerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one full pass over ratings and, when enabled, vote allocations.
    ///
    /// Only a failure to list the tallies aborts the run.
    pub async fn reconcile(&self) -> CreditResult<ReconcileReport> {
        let run_id = self.run_id();
        let mut report = self.reconcile_ratings_in_run(&run_id).await?;
        if self.config.reconcile_votes {
            report.merge(
                self.reconcile_allocations_in_run(AllocationKind::Vote, &run_id)
                    .await?,
            );
        }
        tracing::info!(
            run_id = %run_id,
            examined = report.pairs_examined,
            reduced = report.pairs_reduced,
            rows = report.rows_reduced,
            removed = report.magnitude_removed,
            failures = report.failures.len(),
            "reconciliation pass finished"
        );
        Ok(report)
    }

    pub async fn reconcile_ratings(&self) -> CreditResult<ReconcileReport> {
        self.reconcile_ratings_in_run(&self.run_id()).await
    }

    pub async fn reconcile_allocations(
        &self,
        kind: AllocationKind,
    ) -> CreditResult<ReconcileReport> {
        self.reconcile_allocations_in_run(kind, &self.run_id()).await
    }

    fn run_id(&self) -> String {
        format!(
            "{}-{}",
            self.clock.now().format("%Y%m%dT%H%M%SZ"),
            Uuid::new_v4().simple()
        )
    }

    async fn reconcile_ratings_in_run(&self, run_id: &str) -> CreditResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut over: BTreeMap<Matter, Vec<(IdentityId, i64)>> = BTreeMap::new();

        for tally in self.store.rating_tallies().await? {
            report.pairs_examined += 1;
            match self.ratings.entitlement(&tally.rater, tally.matter).await {
                Ok(entitlement) if tally.tally > entitlement => over
                    .entry(tally.matter)
                    .or_default()
                    .push((tally.rater, entitlement)),
                Ok(_) => {}
                Err(error) => {
                    tracing::error!(rater = %tally.rater, matter = %tally.matter, error = %error, "entitlement lookup failed");
                    report.failures.push(PairFailure {
                        rater: tally.rater,
                        partition: tally.matter.to_string(),
                        error,
                    });
                }
            }
        }

        for (matter, pairs) in over {
            let label = format!("ratings/{matter}");
            match self.archive_ratings(&label, matter, run_id).await {
                Ok(record) => report.archives.extend(record),
                Err(error) => {
                    tracing::error!(label = %label, error = %error, "pre-image archive failed; matter left untouched");
                    report
                        .failures
                        .extend(pairs.into_iter().map(|(rater, _)| PairFailure {
                            rater,
                            partition: matter.to_string(),
                            error: error.clone(),
                        }));
                    continue;
                }
            }

            for (rater, entitlement) in pairs {
                match self.reduce_rating_pair(&rater, matter, entitlement).await {
                    Ok(outcome) => {
                        if outcome.rows > 0 {
                            report.pairs_reduced += 1;
                            report.rows_reduced += outcome.rows;
                            report.magnitude_removed += outcome.removed;
                        }
                    }
                    Err(error) => {
                        tracing::error!(rater = %rater, matter = %matter, error = %error, "rating pair reconciliation failed");
                        report.failures.push(PairFailure {
                            rater,
                            partition: matter.to_string(),
                            error,
                        });
                    }
                }
            }
        }
        Ok(report)
    }

    async fn reduce_rating_pair(
        &self,
        rater: &IdentityId,
        matter: Matter,
        entitlement: i64,
    ) -> CreditResult<PairOutcome> {
        let mut tx = self.store.begin().await?;
        tx.lock(LockKey::RaterMatter {
            rater: rater.clone(),
            matter,
        })
        .await?;
        // Re-read under the lock; a user edit may have landed since the tally.
        let rows = tx.ratings_for_rater_matter(rater, matter).await?;
        let values: Vec<i64> = rows.iter().map(|row| row.value).collect();
        let plan = plan_reduction(&values, entitlement);
        if plan.is_empty() {
            return Ok(PairOutcome::default());
        }

        let opts = UpdateOptions {
            skip_entitlement_check: true,
            ..UpdateOptions::with_reason(ChangeReason::LostCredit)
        };
        for reduction in &plan.reductions {
            let update = RatingUpdate::new(rows[reduction.index].key.clone(), reduction.new_value);
            self.ratings.update_rating(tx.as_mut(), &update, opts).await?;
        }
        tx.commit().await?;

        tracing::info!(
            rater = %rater,
            matter = %matter,
            prior = plan.prior_tally,
            entitlement = plan.entitlement,
            removed = plan.removed(),
            "reduced over-limit ratings"
        );
        Ok(PairOutcome {
            rows: plan.reductions.len() as u64,
            removed: plan.removed(),
        })
    }

    async fn reconcile_allocations_in_run(
        &self,
        kind: AllocationKind,
        run_id: &str,
    ) -> CreditResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let now = self.clock.now();
        let mut over: Vec<(IdentityId, ScopeInfo, i64)> = Vec::new();
        let mut scopes: BTreeMap<ScopeId, ScopeInfo> = BTreeMap::new();

        for tally in self.store.allocation_tallies(kind).await? {
            report.pairs_examined += 1;
            let partition = format!("{kind}@{}", tally.scope);
            let checked = async {
                let scope = match scopes.get(&tally.scope) {
                    Some(scope) => scope.clone(),
                    None => {
                        let scope = self.directory.scope(&tally.scope).await?.ok_or_else(|| {
                            CreditError::NotFound(format!("scope {}", tally.scope))
                        })?;
                        scopes.insert(tally.scope.clone(), scope.clone());
                        scope
                    }
                };
                if scope.phase(now) != ScopePhase::Open {
                    return Ok(None);
                }
                let entitlement = self
                    .entitlements
                    .entitlement(&tally.voter, &scope.credit_basis)
                    .await?;
                Ok::<_, CreditError>((tally.tally > entitlement).then_some((scope, entitlement)))
            }
            .await;
            match checked {
                Ok(Some((scope, entitlement))) => over.push((tally.voter, scope, entitlement)),
                Ok(None) => {}
                Err(error) => {
                    tracing::error!(voter = %tally.voter, partition = %partition, error = %error, "allocation tally check failed");
                    report.failures.push(PairFailure {
                        rater: tally.voter,
                        partition,
                        error,
                    });
                }
            }
        }

        if over.is_empty() {
            return Ok(report);
        }
        let label = format!("allocations/{kind}");
        match self.archive_allocations(&label, kind, run_id).await {
            Ok(record) => report.archives.extend(record),
            Err(error) => {
                tracing::error!(label = %label, error = %error, "pre-image archive failed; allocations left untouched");
                report
                    .failures
                    .extend(over.into_iter().map(|(voter, scope, _)| PairFailure {
                        rater: voter,
                        partition: format!("{kind}@{}", scope.id),
                        error: error.clone(),
                    }));
                return Ok(report);
            }
        }

        for (voter, scope, entitlement) in over {
            match self
                .reduce_allocation_pair(kind, &voter, &scope.id, &scope.credit_basis, entitlement)
                .await
            {
                Ok(outcome) => {
                    if outcome.rows > 0 {
                        report.pairs_reduced += 1;
                        report.rows_reduced += outcome.rows;
                        report.magnitude_removed += outcome.removed;
                    }
                }
                Err(error) => {
                    tracing::error!(voter = %voter, scope = %scope.id, error = %error, "allocation pair reconciliation failed");
                    report.failures.push(PairFailure {
                        rater: voter,
                        partition: format!("{kind}@{}", scope.id),
                        error,
                    });
                }
            }
        }
        Ok(report)
    }

    async fn reduce_allocation_pair(
        &self,
        kind: AllocationKind,
        voter: &IdentityId,
        scope: &ScopeId,
        basis: &credit_types::CreditBasis,
        entitlement: i64,
    ) -> CreditResult<PairOutcome> {
        let mut tx = self.store.begin().await?;
        tx.lock(LockKey::VoterScope {
            kind,
            voter: voter.clone(),
            scope: scope.clone(),
        })
        .await?;
        let rows = tx.allocations_for_voter_scope(kind, voter, scope).await?;
        let values: Vec<i64> = rows.iter().map(|row| row.current_value).collect();
        let plan = plan_reduction(&values, entitlement);
        if plan.is_empty() {
            return Ok(PairOutcome::default());
        }

        for reduction in &plan.reductions {
            let change = AllocationChange {
                kind,
                rater: voter.clone(),
                target: rows[reduction.index].target.clone(),
                scope: scope.clone(),
                new_value: reduction.new_value,
                basis: basis.clone(),
                reason: ChangeReason::LostCredit,
                skip_entitlement_check: true,
                deadline: None,
            };
            self.allocations
                .apply(tx.as_mut(), &change, SpendPolicy::ScopeCumulative)
                .await?;
        }
        tx.commit().await?;

        tracing::info!(
            voter = %voter,
            scope = %scope,
            prior = plan.prior_tally,
            entitlement = plan.entitlement,
            removed = plan.removed(),
            "reduced over-limit allocations"
        );
        Ok(PairOutcome {
            rows: plan.reductions.len() as u64,
            removed: plan.removed(),
        })
    }

    async fn archive_ratings(
        &self,
        label: &str,
        matter: Matter,
        run_id: &str,
    ) -> CreditResult<Option<ArchiveRecord>> {
        if self.archived_recently(label).await? {
            return Ok(None);
        }
        let rows = self.store.ratings_for_matter(matter).await?;
        let row_count = rows.len() as u64;
        let body = to_json_lines(&rows)?;
        self.write_archive(label, run_id, body, row_count).await.map(Some)
    }

    async fn archive_allocations(
        &self,
        label: &str,
        kind: AllocationKind,
        run_id: &str,
    ) -> CreditResult<Option<ArchiveRecord>> {
        if self.archived_recently(label).await? {
            return Ok(None);
        }
        let rows = self.store.allocations_of_kind(kind).await?;
        let row_count = rows.len() as u64;
        let body = to_json_lines(&rows)?;
        self.write_archive(label, run_id, body, row_count).await.map(Some)
    }

    async fn archived_recently(&self, label: &str) -> CreditResult<bool> {
        if self.config.min_archive_interval <= Duration::zero() {
            return Ok(false);
        }
        let latest = self.store.latest_archive(label).await?;
        Ok(latest.is_some_and(|record| {
            self.clock.now() - record.taken_at < self.config.min_archive_interval
        }))
    }

    async fn write_archive(
        &self,
        label: &str,
        run_id: &str,
        body: Vec<u8>,
        row_count: u64,
    ) -> CreditResult<ArchiveRecord> {
        let key = format!("{label}/{run_id}.jsonl");
        let url = self
            .archive
            .put_object(&key, "application/x-ndjson", body)
            .await?;
        let record = ArchiveRecord {
            label: label.to_string(),
            url,
            taken_at: self.clock.now(),
            row_count,
        };
        let mut tx = self.store.begin().await?;
        tx.record_archive(record.clone()).await?;
        tx.commit().await?;
        tracing::info!(label = %label, url = %record.url, rows = row_count, "archived pre-image");
        Ok(record)
    }
}

fn to_json_lines<T: Serialize>(rows: &[T]) -> CreditResult<Vec<u8>> {
    let mut body = Vec::new();
    for row in rows {
        let line = serde_json::to_vec(row)
            .map_err(|e| CreditError::Storage(format!("pre-image serialization: {e}")))?;
        body.extend_from_slice(&line);
        body.push(b'\n');
    }
    Ok(body)
}
