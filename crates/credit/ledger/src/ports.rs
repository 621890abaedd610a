//! Contracts for the collaborators the ledger depends on but does not own.

use async_trait::async_trait;
use credit_types::{
    AllocationKind, CreditBasis, CreditResult, GroupId, IdentityId, ScopeId, ScopeInfo, TargetId,
    TargetInfo,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Supplies the credit ceiling of an identity. Treated as a pure read.
#[async_trait]
pub trait EntitlementSource: Send + Sync {
    async fn entitlement(&self, identity: &IdentityId, basis: &CreditBasis) -> CreditResult<i64>;
}

/// Resolves group membership. Consulted before any lock is taken.
#[async_trait]
pub trait EligibilitySource: Send + Sync {
    async fn is_eligible(&self, identity: &IdentityId, group: &GroupId) -> CreditResult<bool>;
}

/// Read access to targets and scopes owned by the content system.
#[async_trait]
pub trait TargetDirectory: Send + Sync {
    async fn target(&self, id: &TargetId) -> CreditResult<Option<TargetInfo>>;
    async fn scope(&self, id: &ScopeId) -> CreditResult<Option<ScopeInfo>>;
    async fn targets_in_scope(&self, scope: &ScopeId) -> CreditResult<Vec<TargetInfo>>;
    async fn scopes(&self) -> CreditResult<Vec<ScopeInfo>>;
}

/// Payload handed to the notifier after a committed allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationNotice {
    pub kind: AllocationKind,
    pub actor: IdentityId,
    pub target: TargetId,
    pub target_owner: IdentityId,
    pub value: i64,
    pub scope: ScopeId,
    pub visibility_group: Option<GroupId>,
}

/// Fire-and-forget delivery. Failures are logged by the caller, never propagated.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: AllocationNotice) -> CreditResult<()>;
}

/// Entitlements held in a table, keyed by identity and basis.
///
/// A missing `TdhPlusXtdh` entry falls back to the sum of the `Tdh` and
/// `Xtdh` entries. Anything else missing is zero.
#[derive(Debug, Default)]
pub struct StaticEntitlements {
    values: RwLock<HashMap<(IdentityId, CreditBasis), i64>>,
}

impl StaticEntitlements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, identity: impl Into<IdentityId>, basis: CreditBasis, value: i64) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert((identity.into(), basis), value);
    }

    fn lookup(&self, identity: &IdentityId, basis: &CreditBasis) -> Option<i64> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(&(identity.clone(), basis.clone())).copied()
    }
}

#[async_trait]
impl EntitlementSource for StaticEntitlements {
    async fn entitlement(&self, identity: &IdentityId, basis: &CreditBasis) -> CreditResult<i64> {
        if let Some(value) = self.lookup(identity, basis) {
            return Ok(value);
        }
        if *basis == CreditBasis::TdhPlusXtdh {
            let tdh = self.lookup(identity, &CreditBasis::Tdh).unwrap_or(0);
            let xtdh = self.lookup(identity, &CreditBasis::Xtdh).unwrap_or(0);
            return Ok(tdh.saturating_add(xtdh));
        }
        Ok(0)
    }
}
