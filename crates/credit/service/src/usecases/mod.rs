//! Orchestration use-cases: precondition chains in front of the ledger.
//!
//! Each use-case resolves the target and its scope, walks its checks in a
//! fixed order (the first failure wins), and only then opens a transaction.
//! Notifications go out after commit and never fail the call.

mod clapping;
mod rate;
mod vote;

pub use clapping::ClapUseCase;
pub use rate::{BulkRatingItem, RateUseCase};
pub use vote::VoteUseCase;

use chrono::{DateTime, Utc};
use credit_ledger::{AllocationNotice, EligibilitySource, Notifier, TargetDirectory};
use credit_types::{
    CreditError, CreditResult, GroupId, IdentityId, ScopeInfo, TargetId, TargetInfo,
};
use serde::{Deserialize, Serialize};

/// A vote or clap as submitted by an actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub actor: IdentityId,
    pub target: TargetId,
    pub value: i64,
    /// Give up instead of waiting on locks past this instant.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl AllocationRequest {
    pub fn new(actor: impl Into<IdentityId>, target: impl Into<TargetId>, value: i64) -> Self {
        Self {
            actor: actor.into(),
            target: target.into(),
            value,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

async fn resolve_target(
    directory: &dyn TargetDirectory,
    id: &TargetId,
) -> CreditResult<(TargetInfo, ScopeInfo)> {
    let target = directory
        .target(id)
        .await?
        .ok_or_else(|| CreditError::NotFound(format!("target {id}")))?;
    let scope = directory
        .scope(&target.scope_id)
        .await?
        .ok_or_else(|| CreditError::NotFound(format!("scope {}", target.scope_id)))?;
    Ok((target, scope))
}

async fn ensure_member(
    eligibility: &dyn EligibilitySource,
    identity: &IdentityId,
    group: Option<&GroupId>,
    action: &str,
) -> CreditResult<()> {
    let Some(group) = group else {
        return Ok(());
    };
    if eligibility.is_eligible(identity, group).await? {
        Ok(())
    } else {
        Err(CreditError::Forbidden(format!(
            "{identity} is not eligible to {action} in group {group}"
        )))
    }
}

async fn notify_owner(notifier: &dyn Notifier, notice: AllocationNotice) {
    if notice.actor == notice.target_owner {
        return;
    }
    let (actor, target) = (notice.actor.clone(), notice.target.clone());
    if let Err(error) = notifier.notify(notice).await {
        tracing::warn!(actor = %actor, target = %target, error = %error, "allocation notice not delivered");
    }
}
