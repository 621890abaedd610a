//! Reference implementations of the ledger's collaborator ports.
//!
//! These back the daemon's in-memory mode and the scenario tests. Production
//! deployments plug their own directory, eligibility and notification
//! services in through [`crate::Collaborators`].

use async_trait::async_trait;
use credit_ledger::{AllocationNotice, EligibilitySource, Notifier, TargetDirectory};
use credit_types::{
    CreditError, CreditResult, GroupId, GroupPredicate, IdentityFacts, IdentityId, ScopeId,
    ScopeInfo, TargetId, TargetInfo,
};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Scopes and targets held in memory.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    scopes: RwLock<BTreeMap<ScopeId, ScopeInfo>>,
    targets: RwLock<BTreeMap<TargetId, TargetInfo>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_scope(&self, scope: ScopeInfo) {
        self.scopes.write().await.insert(scope.id.clone(), scope);
    }

    pub async fn upsert_target(&self, target: TargetInfo) {
        self.targets.write().await.insert(target.id.clone(), target);
    }

    pub async fn remove_target(&self, id: &TargetId) -> Option<TargetInfo> {
        self.targets.write().await.remove(id)
    }
}

#[async_trait]
impl TargetDirectory for InMemoryDirectory {
    async fn target(&self, id: &TargetId) -> CreditResult<Option<TargetInfo>> {
        Ok(self.targets.read().await.get(id).cloned())
    }

    async fn scope(&self, id: &ScopeId) -> CreditResult<Option<ScopeInfo>> {
        Ok(self.scopes.read().await.get(id).cloned())
    }

    async fn targets_in_scope(&self, scope: &ScopeId) -> CreditResult<Vec<TargetInfo>> {
        Ok(self
            .targets
            .read()
            .await
            .values()
            .filter(|t| &t.scope_id == scope)
            .cloned()
            .collect())
    }

    async fn scopes(&self) -> CreditResult<Vec<ScopeInfo>> {
        Ok(self.scopes.read().await.values().cloned().collect())
    }
}

/// Eligibility by interpreting each group's [`GroupPredicate`] against
/// stored [`IdentityFacts`].
///
/// An identity without facts is evaluated against empty facts carrying only
/// its id. An unknown group is an upstream failure, not a silent denial.
#[derive(Debug, Default)]
pub struct PredicateEligibility {
    groups: RwLock<HashMap<GroupId, GroupPredicate>>,
    facts: RwLock<HashMap<IdentityId, IdentityFacts>>,
}

impl PredicateEligibility {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn define_group(&self, group: impl Into<GroupId>, predicate: GroupPredicate) {
        self.groups.write().await.insert(group.into(), predicate);
    }

    pub async fn set_facts(&self, identity: impl Into<IdentityId>, facts: IdentityFacts) {
        self.facts.write().await.insert(identity.into(), facts);
    }
}

#[async_trait]
impl EligibilitySource for PredicateEligibility {
    async fn is_eligible(&self, identity: &IdentityId, group: &GroupId) -> CreditResult<bool> {
        let predicate = self
            .groups
            .read()
            .await
            .get(group)
            .cloned()
            .ok_or_else(|| CreditError::Upstream(format!("unknown group {group}")))?;
        let facts = self
            .facts
            .read()
            .await
            .get(identity)
            .cloned()
            .unwrap_or_else(|| IdentityFacts::for_identity(identity.clone()));
        Ok(predicate.evaluate(&facts))
    }
}

/// Logs each notice; the daemon's default notifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notice: AllocationNotice) -> CreditResult<()> {
        tracing::info!(
            kind = %notice.kind,
            actor = %notice.actor,
            target = %notice.target,
            owner = %notice.target_owner,
            value = notice.value,
            scope = %notice.scope,
            "allocation notice"
        );
        Ok(())
    }
}

/// Keeps every notice in memory; can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: RwLock<Vec<AllocationNotice>>,
    failing: RwLock<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notices(&self) -> Vec<AllocationNotice> {
        self.notices.read().await.clone()
    }

    pub async fn set_failing(&self, failing: bool) {
        *self.failing.write().await = failing;
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: AllocationNotice) -> CreditResult<()> {
        if *self.failing.read().await {
            return Err(CreditError::Upstream("notification transport down".into()));
        }
        self.notices.write().await.push(notice);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credit_types::{CreditBasis, ScopeKind};

    #[tokio::test]
    async fn predicate_eligibility_interprets_groups() {
        let eligibility = PredicateEligibility::new();
        eligibility
            .define_group(
                "holders",
                GroupPredicate::MinCredit {
                    basis: CreditBasis::Tdh,
                    at_least: 10,
                },
            )
            .await;
        eligibility
            .set_facts(
                "alice",
                IdentityFacts::for_identity("alice".into()).with_credit(&CreditBasis::Tdh, 12),
            )
            .await;

        let holders = GroupId::from("holders");
        assert!(eligibility
            .is_eligible(&"alice".into(), &holders)
            .await
            .unwrap());
        assert!(!eligibility.is_eligible(&"bob".into(), &holders).await.unwrap());
        assert!(matches!(
            eligibility
                .is_eligible(&"alice".into(), &"missing".into())
                .await,
            Err(CreditError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn directory_lists_targets_by_scope() {
        let directory = InMemoryDirectory::new();
        directory
            .upsert_scope(ScopeInfo::open("wave-1".into(), ScopeKind::Rank))
            .await;
        for (id, scope) in [("d1", "wave-1"), ("d2", "wave-2"), ("d3", "wave-1")] {
            directory
                .upsert_target(TargetInfo {
                    id: id.into(),
                    scope_id: scope.into(),
                    owner: "carol".into(),
                    kind: credit_types::TargetKind::Participatory,
                    created_at: chrono::Utc::now(),
                })
                .await;
        }
        let ids: Vec<String> = directory
            .targets_in_scope(&"wave-1".into())
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id.0)
            .collect();
        assert_eq!(ids, vec!["d1", "d3"]);
        assert_eq!(directory.scopes().await.unwrap().len(), 1);
    }
}
