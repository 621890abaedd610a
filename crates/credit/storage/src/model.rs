use crate::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use credit_types::{AllocationKind, ChangeReason, IdentityId, Matter, RatingKey, ScopeId, TargetId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One rating: the current signed value for a validated key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingRow {
    pub key: RatingKey,
    pub value: i64,
    pub last_modified: DateTime<Utc>,
    /// Insertion order; stable for the lifetime of the row.
    pub seq: u64,
}

/// Latest applied value of one voter on one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationState {
    pub kind: AllocationKind,
    pub rater: IdentityId,
    pub target: TargetId,
    pub scope: ScopeId,
    pub current_value: i64,
    pub updated_at: DateTime<Utc>,
    pub seq: u64,
}

/// Running sum of allocations on one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub kind: AllocationKind,
    pub target: TargetId,
    pub scope: ScopeId,
    pub summed_value: i64,
    /// Last time the sum went up; ties in rank order break on this.
    pub last_increased: Option<DateTime<Utc>>,
    pub decision_time_snapshot_value: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Append-only spend entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendRow {
    pub kind: AllocationKind,
    pub rater: IdentityId,
    pub target: TargetId,
    pub scope: ScopeId,
    pub amount: i64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate value of a target right after a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSnapshot {
    pub kind: AllocationKind,
    pub target: TargetId,
    pub scope: ScopeId,
    pub value: i64,
    pub timestamp: DateTime<Utc>,
}

/// A voter's value on a target right after a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterSnapshot {
    pub kind: AllocationKind,
    pub voter: IdentityId,
    pub target: TargetId,
    pub scope: ScopeId,
    pub value: i64,
    pub timestamp: DateTime<Utc>,
}

/// Audit append payload. Ids, sequencing and digests are assigned by storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditAppend {
    pub actor: IdentityId,
    pub target: TargetId,
    pub event_type: String,
    pub old_value: i64,
    pub new_value: i64,
    pub reason: ChangeReason,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

/// Persisted audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_id: String,
    pub sequence: u64,
    pub actor: IdentityId,
    pub target: TargetId,
    pub event_type: String,
    pub old_value: i64,
    pub new_value: i64,
    pub reason: ChangeReason,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    /// blake3 over the record content, excluding sequence.
    pub digest: String,
}

/// Reference to a durable reconciliation pre-image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub label: String,
    pub url: String,
    pub taken_at: DateTime<Utc>,
    pub row_count: u64,
}

/// Audit query.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<IdentityId>,
    pub target: Option<TargetId>,
    pub window: crate::QueryWindow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaterMatterTally {
    pub rater: IdentityId,
    pub matter: Matter,
    /// Σ |value| across the rater's rows on the matter.
    pub tally: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterScopeTally {
    pub kind: AllocationKind,
    pub voter: IdentityId,
    pub scope: ScopeId,
    pub tally: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedRating {
    pub rating: i64,
    pub contributor_count: u64,
}

/// What a target-deletion cascade removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRows {
    pub allocations: u64,
    pub spend_rows: u64,
    pub snapshots: u64,
    pub aggregates: u64,
}

/// Serialization point for concurrent writers.
///
/// Voter-level keys are always acquired before target-level keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    RaterMatter {
        rater: IdentityId,
        matter: Matter,
    },
    VoterScope {
        kind: AllocationKind,
        voter: IdentityId,
        scope: ScopeId,
    },
    VoterWindow {
        kind: AllocationKind,
        voter: IdentityId,
    },
    TargetAggregate {
        kind: AllocationKind,
        target: TargetId,
    },
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::RaterMatter { rater, matter } => write!(f, "rating:{rater}:{matter}"),
            LockKey::VoterScope { kind, voter, scope } => write!(f, "{kind}:voter:{voter}:{scope}"),
            LockKey::VoterWindow { kind, voter } => write!(f, "{kind}:window:{voter}"),
            LockKey::TargetAggregate { kind, target } => write!(f, "{kind}:target:{target}"),
        }
    }
}

/// Content digest of an audit entry.
pub fn audit_digest(event: &AuditAppend, event_id: &str) -> StorageResult<String> {
    let serializable = serde_json::json!({
        "event_id": event_id,
        "actor": event.actor,
        "target": event.target,
        "event_type": event.event_type,
        "old_value": event.old_value,
        "new_value": event.new_value,
        "reason": event.reason,
        "timestamp": event.timestamp,
        "payload": event.payload,
    });
    let serialized = serde_json::to_vec(&serializable)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&serialized).to_hex().to_string())
}
