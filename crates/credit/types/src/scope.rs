use crate::{CreditError, CreditResult, GroupId, IdentityId, ScopeId, TargetId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two allocation specializations that keep per-target aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationKind {
    /// Bounded by cumulative spend within a scope.
    Vote,
    /// Bounded by spend inside a trailing time window.
    Clap,
}

impl AllocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationKind::Vote => "vote",
            AllocationKind::Clap => "clap",
        }
    }
}

impl fmt::Display for AllocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which externally computed metric bounds an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CreditBasis {
    Tdh,
    Xtdh,
    TdhPlusXtdh,
    /// Reputation, optionally narrowed to one category and/or one creditor.
    Rep {
        #[serde(default)]
        category: Option<String>,
        #[serde(default)]
        creditor: Option<IdentityId>,
    },
}

impl Default for CreditBasis {
    fn default() -> Self {
        CreditBasis::TdhPlusXtdh
    }
}

impl fmt::Display for CreditBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreditBasis::Tdh => f.write_str("tdh"),
            CreditBasis::Xtdh => f.write_str("xtdh"),
            CreditBasis::TdhPlusXtdh => f.write_str("tdh+xtdh"),
            CreditBasis::Rep { category, creditor } => {
                f.write_str("rep")?;
                if let Some(category) = category {
                    write!(f, "/{category}")?;
                }
                if let Some(creditor) = creditor {
                    write!(f, "@{creditor}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Approve,
    Rank,
    /// Discussion only; votes are not accepted.
    Chat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Competes in the scope's leaderboard and accepts votes.
    Participatory,
    /// A chat message; accepts claps only.
    Chat,
}

/// Lifecycle of a scope as seen by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopePhase {
    Open,
    /// Decision time reached; writes are rejected.
    Locked,
    /// Read-only; only decision-time orderings are meaningful.
    Historical,
}

/// Scope descriptor resolved from the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeInfo {
    pub id: ScopeId,
    pub kind: ScopeKind,
    #[serde(default)]
    pub credit_basis: CreditBasis,
    #[serde(default)]
    pub voting_group: Option<GroupId>,
    /// Who may see the scope; notifications about it are limited to this group.
    #[serde(default)]
    pub visibility_group: Option<GroupId>,
    #[serde(default)]
    pub chat_group: Option<GroupId>,
    #[serde(default = "default_true")]
    pub chat_enabled: bool,
    #[serde(default)]
    pub forbid_negative: bool,
    #[serde(default)]
    pub forbid_self_allocation: bool,
    #[serde(default)]
    pub voting_starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub voting_ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decision_time: Option<DateTime<Utc>>,
    /// Width of the averaging window used for decision-time capture.
    #[serde(default)]
    pub time_lock_secs: Option<i64>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl ScopeInfo {
    /// A permissive open scope; callers tighten it with struct update syntax.
    pub fn open(id: ScopeId, kind: ScopeKind) -> Self {
        Self {
            id,
            kind,
            credit_basis: CreditBasis::default(),
            voting_group: None,
            visibility_group: None,
            chat_group: None,
            chat_enabled: true,
            forbid_negative: false,
            forbid_self_allocation: false,
            voting_starts_at: None,
            voting_ends_at: None,
            decision_time: None,
            time_lock_secs: None,
            archived_at: None,
        }
    }

    pub fn phase(&self, now: DateTime<Utc>) -> ScopePhase {
        if self.archived_at.is_some_and(|at| at <= now) {
            ScopePhase::Historical
        } else if self.decision_time.is_some_and(|at| at <= now) {
            ScopePhase::Locked
        } else {
            ScopePhase::Open
        }
    }

    /// Reject writes unless the scope is open.
    pub fn ensure_open(&self, now: DateTime<Utc>) -> CreditResult<()> {
        match self.phase(now) {
            ScopePhase::Open => Ok(()),
            ScopePhase::Locked => Err(CreditError::Locked(format!(
                "scope {} has been decided",
                self.id
            ))),
            ScopePhase::Historical => Err(CreditError::Locked(format!(
                "scope {} is historical",
                self.id
            ))),
        }
    }

    /// Whether `now` falls inside the configured voting period.
    pub fn voting_window_contains(&self, now: DateTime<Utc>) -> bool {
        let started = self.voting_starts_at.map_or(true, |at| at <= now);
        let not_ended = self.voting_ends_at.map_or(true, |at| now <= at);
        started && not_ended
    }

    pub fn time_lock(&self) -> Option<Duration> {
        self.time_lock_secs
            .filter(|secs| *secs > 0)
            .map(Duration::seconds)
    }
}

/// Target descriptor resolved from the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub id: TargetId,
    pub scope_id: ScopeId,
    pub owner: IdentityId,
    pub kind: TargetKind,
    pub created_at: DateTime<Utc>,
}
