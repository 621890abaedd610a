//! Read-side projections over aggregates and snapshot history.

use crate::ports::TargetDirectory;
use chrono::{DateTime, Utc};
use credit_storage::{LedgerStore, LockKey, TargetSnapshot};
use credit_types::{
    AllocationKind, Clock, CreditError, CreditResult, ScopeId, ScopeInfo, ScopePhase, TargetId,
};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderboardOrdering {
    /// Current summed value, highest first.
    Rank,
    /// Rank over a target subset; targets without votes sort by creation time.
    Realtime,
    /// Value captured at decision time.
    Prediction,
    /// Decision-time value minus current value.
    Trend,
}

impl LeaderboardOrdering {
    fn meaningful_in(self, phase: ScopePhase) -> bool {
        match self {
            Self::Rank | Self::Realtime => phase != ScopePhase::Historical,
            Self::Prediction | Self::Trend => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardQuery {
    pub scope: ScopeId,
    pub ordering: LeaderboardOrdering,
    #[serde(default)]
    pub subset: Option<Vec<TargetId>>,
}

impl LeaderboardQuery {
    pub fn new(scope: impl Into<ScopeId>, ordering: LeaderboardOrdering) -> Self {
        Self {
            scope: scope.into(),
            ordering,
            subset: None,
        }
    }

    pub fn with_subset(mut self, targets: impl IntoIterator<Item = TargetId>) -> Self {
        self.subset = Some(targets.into_iter().collect());
        self
    }
}

/// One target's figures before ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardInput {
    pub target: TargetId,
    pub summed_value: i64,
    pub decision_value: Option<i64>,
    pub last_increased: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// Competition rank: equal scores share a rank, the next rank skips.
    pub rank: u64,
    pub target: TargetId,
    /// The figure the ordering sorted on.
    pub score: i64,
    pub summed_value: i64,
    pub decision_value: Option<i64>,
}

fn score(input: &LeaderboardInput, ordering: LeaderboardOrdering) -> i64 {
    match ordering {
        LeaderboardOrdering::Rank | LeaderboardOrdering::Realtime => input.summed_value,
        LeaderboardOrdering::Prediction => input.decision_value.unwrap_or(input.summed_value),
        LeaderboardOrdering::Trend => {
            input.decision_value.unwrap_or(input.summed_value) - input.summed_value
        }
    }
}

/// Order `inputs` by score descending, then earliest activity, then target id.
pub fn order_entries(
    inputs: Vec<LeaderboardInput>,
    ordering: LeaderboardOrdering,
) -> Vec<LeaderboardEntry> {
    let mut scored: Vec<(i64, LeaderboardInput)> = inputs
        .into_iter()
        .map(|input| (score(&input, ordering), input))
        .collect();
    scored.sort_by(|(a_score, a), (b_score, b)| {
        Reverse(a_score)
            .cmp(&Reverse(b_score))
            .then_with(|| {
                a.last_increased
                    .unwrap_or(a.created_at)
                    .cmp(&b.last_increased.unwrap_or(b.created_at))
            })
            .then_with(|| a.target.cmp(&b.target))
    });

    let mut entries = Vec::with_capacity(scored.len());
    let mut rank = 0;
    let mut previous = None;
    for (position, (score, input)) in scored.into_iter().enumerate() {
        if previous != Some(score) {
            rank = position as u64 + 1;
            previous = Some(score);
        }
        entries.push(LeaderboardEntry {
            rank,
            target: input.target,
            score,
            summed_value: input.summed_value,
            decision_value: input.decision_value,
        });
    }
    entries
}

/// Floored time-weighted mean of a step series over `[start, end]`.
///
/// `history` must be oldest first. The value before the first snapshot is zero.
pub fn time_weighted_value(
    history: &[TargetSnapshot],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> i64 {
    let value_at = |at: DateTime<Utc>| {
        history
            .iter()
            .take_while(|s| s.timestamp <= at)
            .last()
            .map_or(0, |s| s.value)
    };
    if end <= start {
        return value_at(end);
    }

    let mut cursor = start;
    let mut current = value_at(start);
    let mut integral: i128 = 0;
    for snapshot in history
        .iter()
        .filter(|s| s.timestamp > start && s.timestamp <= end)
    {
        let span = (snapshot.timestamp - cursor).num_milliseconds();
        integral += i128::from(current) * i128::from(span);
        cursor = snapshot.timestamp;
        current = snapshot.value;
    }
    integral += i128::from(current) * i128::from((end - cursor).num_milliseconds());

    let total = i128::from((end - start).num_milliseconds());
    if total == 0 {
        return current;
    }
    i64::try_from(integral.div_euclid(total)).unwrap_or(current)
}

/// Serves the four leaderboard orderings for a scope.
#[derive(Clone)]
pub struct LeaderboardReader {
    store: Arc<dyn LedgerStore>,
    directory: Arc<dyn TargetDirectory>,
    clock: Arc<dyn Clock>,
}

impl LeaderboardReader {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        directory: Arc<dyn TargetDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            directory,
            clock,
        }
    }

    pub async fn read(&self, query: &LeaderboardQuery) -> CreditResult<Vec<LeaderboardEntry>> {
        let scope = require_scope(self.directory.as_ref(), &query.scope).await?;
        let phase = scope.phase(self.clock.now());
        if !query.ordering.meaningful_in(phase) {
            return Err(CreditError::Validation(format!(
                "{:?} ordering is not available on historical scope {}",
                query.ordering, scope.id
            )));
        }

        let mut inputs: BTreeMap<TargetId, LeaderboardInput> = self
            .directory
            .targets_in_scope(&scope.id)
            .await?
            .into_iter()
            .map(|t| {
                let input = LeaderboardInput {
                    target: t.id.clone(),
                    summed_value: 0,
                    decision_value: None,
                    last_increased: None,
                    created_at: t.created_at,
                };
                (t.id, input)
            })
            .collect();
        for row in self
            .store
            .aggregates_for_scope(AllocationKind::Vote, &scope.id)
            .await?
        {
            let input = inputs
                .entry(row.target.clone())
                .or_insert_with(|| LeaderboardInput {
                    target: row.target.clone(),
                    summed_value: 0,
                    decision_value: None,
                    last_increased: None,
                    created_at: row.created_at,
                });
            input.summed_value = row.summed_value;
            input.decision_value = row.decision_time_snapshot_value;
            input.last_increased = row.last_increased;
        }

        if let Some(subset) = &query.subset {
            let wanted: BTreeSet<&TargetId> = subset.iter().collect();
            inputs.retain(|target, _| wanted.contains(target));
        }
        Ok(order_entries(inputs.into_values().collect(), query.ordering))
    }
}

async fn require_scope(directory: &dyn TargetDirectory, id: &ScopeId) -> CreditResult<ScopeInfo> {
    directory
        .scope(id)
        .await?
        .ok_or_else(|| CreditError::NotFound(format!("scope {id}")))
}

/// Freezes each aggregate's decision-time value once its scope is decided.
#[derive(Clone)]
pub struct DecisionSnapshotter {
    store: Arc<dyn LedgerStore>,
    directory: Arc<dyn TargetDirectory>,
    clock: Arc<dyn Clock>,
}

impl DecisionSnapshotter {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        directory: Arc<dyn TargetDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            directory,
            clock,
        }
    }

    /// Capture decision values for one decided scope. Aggregates that already
    /// carry one are left alone. Returns how many were set.
    pub async fn capture(&self, scope: &ScopeId) -> CreditResult<u64> {
        let scope = require_scope(self.directory.as_ref(), scope).await?;
        let decision = match scope.decision_time {
            Some(at) if at <= self.clock.now() => at,
            _ => {
                return Err(CreditError::Validation(format!(
                    "scope {} has not reached its decision time",
                    scope.id
                )))
            }
        };

        let mut captured = 0;
        for row in self
            .store
            .aggregates_for_scope(AllocationKind::Vote, &scope.id)
            .await?
        {
            if row.decision_time_snapshot_value.is_some() {
                continue;
            }
            let history = self
                .store
                .target_snapshots(AllocationKind::Vote, &row.target, Some(decision))
                .await?;
            let value = match scope.time_lock() {
                Some(lock) => time_weighted_value(&history, decision - lock, decision),
                None => history.last().map_or(0, |s| s.value),
            };

            let mut tx = self.store.begin().await?;
            tx.lock(LockKey::TargetAggregate {
                kind: AllocationKind::Vote,
                target: row.target.clone(),
            })
            .await?;
            tx.set_decision_snapshot(AllocationKind::Vote, &row.target, value)
                .await?;
            tx.commit().await?;
            captured += 1;
        }

        if captured > 0 {
            tracing::info!(scope = %scope.id, decision = %decision, captured, "captured decision-time values");
        }
        Ok(captured)
    }

    /// Capture every decided scope the directory knows about.
    pub async fn capture_due(&self) -> CreditResult<u64> {
        let now = self.clock.now();
        let mut total = 0;
        for scope in self.directory.scopes().await? {
            if scope.phase(now) == ScopePhase::Open {
                continue;
            }
            match self.capture(&scope.id).await {
                Ok(captured) => total += captured,
                Err(error) => {
                    tracing::error!(scope = %scope.id, error = %error, "decision capture failed")
                }
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn input(target: &str, summed: i64, decision: Option<i64>, minutes: i64) -> LeaderboardInput {
        LeaderboardInput {
            target: target.into(),
            summed_value: summed,
            decision_value: decision,
            last_increased: None,
            created_at: t0() + Duration::minutes(minutes),
        }
    }

    fn snap(value: i64, minutes: i64) -> TargetSnapshot {
        TargetSnapshot {
            kind: AllocationKind::Vote,
            target: "drop-1".into(),
            scope: "wave-1".into(),
            value,
            timestamp: t0() + Duration::minutes(minutes),
        }
    }

    fn targets(entries: &[LeaderboardEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.target.as_str()).collect()
    }

    #[test]
    fn rank_breaks_ties_by_earliest_activity() {
        let entries = order_entries(
            vec![
                input("late", 10, None, 5),
                input("top", 30, None, 9),
                input("early", 10, None, 1),
            ],
            LeaderboardOrdering::Rank,
        );
        assert_eq!(targets(&entries), vec!["top", "early", "late"]);
        let ranks: Vec<u64> = entries.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 2]);
    }

    #[test]
    fn prediction_and_trend_use_decision_value() {
        let inputs = vec![
            input("a", 50, Some(10), 0),
            input("b", 5, Some(40), 1),
            input("c", 20, Some(20), 2),
        ];
        let prediction = order_entries(inputs.clone(), LeaderboardOrdering::Prediction);
        assert_eq!(targets(&prediction), vec!["b", "c", "a"]);

        let trend = order_entries(inputs, LeaderboardOrdering::Trend);
        assert_eq!(targets(&trend), vec!["b", "c", "a"]);
        let scores: Vec<i64> = trend.iter().map(|e| e.score).collect();
        assert_eq!(scores, vec![35, 0, -40]);
    }

    #[test]
    fn time_weighted_value_integrates_steps() {
        let history = vec![snap(10, 0), snap(30, 30)];
        // 10 for 30 minutes, 30 for 30 minutes
        assert_eq!(time_weighted_value(&history, t0(), t0() + Duration::minutes(60)), 20);
        // window entirely after the last change
        assert_eq!(
            time_weighted_value(&history, t0() + Duration::minutes(40), t0() + Duration::minutes(50)),
            30
        );
        // nothing before the first snapshot counts as zero
        assert_eq!(
            time_weighted_value(&history, t0() - Duration::minutes(30), t0() + Duration::minutes(30)),
            5
        );
    }

    #[test]
    fn time_weighted_value_floors_negative_means() {
        let history = vec![snap(-1, 0), snap(0, 1)];
        assert_eq!(time_weighted_value(&history, t0(), t0() + Duration::minutes(3)), -1);
    }
}
