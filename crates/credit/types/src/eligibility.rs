use crate::{CreditBasis, IdentityId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What an eligibility predicate may inspect about an identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityFacts {
    pub identity: Option<IdentityId>,
    /// Credit balances keyed by [`CreditBasis`] display form (`tdh`, `xtdh`, ...).
    #[serde(default)]
    pub credit: BTreeMap<String, i64>,
    /// Received reputation keyed by category.
    #[serde(default)]
    pub rep: BTreeMap<String, i64>,
    #[serde(default)]
    pub attributes: BTreeSet<String>,
}

impl IdentityFacts {
    pub fn for_identity(identity: IdentityId) -> Self {
        Self {
            identity: Some(identity),
            ..Self::default()
        }
    }

    pub fn with_credit(mut self, basis: &CreditBasis, value: i64) -> Self {
        self.credit.insert(basis.to_string(), value);
        self
    }

    pub fn with_rep(mut self, category: impl Into<String>, value: i64) -> Self {
        self.rep.insert(category.into(), value);
        self
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attributes.insert(attribute.into());
        self
    }

    fn credit_for(&self, basis: &CreditBasis) -> i64 {
        if let Some(value) = self.credit.get(&basis.to_string()) {
            return *value;
        }
        if *basis == CreditBasis::TdhPlusXtdh {
            let tdh = self.credit.get("tdh").copied().unwrap_or(0);
            let xtdh = self.credit.get("xtdh").copied().unwrap_or(0);
            return tdh.saturating_add(xtdh);
        }
        0
    }

    fn rep_for(&self, category: Option<&str>) -> i64 {
        match category {
            Some(category) => self.rep.get(category).copied().unwrap_or(0),
            None => self.rep.values().fold(0_i64, |acc, v| acc.saturating_add(*v)),
        }
    }
}

/// Group membership expressed as a tagged-union predicate tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GroupPredicate {
    Everyone,
    Nobody,
    Member { identity: IdentityId },
    MinCredit { basis: CreditBasis, at_least: i64 },
    MinRep {
        #[serde(default)]
        category: Option<String>,
        at_least: i64,
    },
    HasAttribute { attribute: String },
    All { of: Vec<GroupPredicate> },
    Any { of: Vec<GroupPredicate> },
    Not { predicate: Box<GroupPredicate> },
}

impl GroupPredicate {
    pub fn evaluate(&self, facts: &IdentityFacts) -> bool {
        match self {
            GroupPredicate::Everyone => true,
            GroupPredicate::Nobody => false,
            GroupPredicate::Member { identity } => facts.identity.as_ref() == Some(identity),
            GroupPredicate::MinCredit { basis, at_least } => facts.credit_for(basis) >= *at_least,
            GroupPredicate::MinRep { category, at_least } => {
                facts.rep_for(category.as_deref()) >= *at_least
            }
            GroupPredicate::HasAttribute { attribute } => facts.attributes.contains(attribute),
            GroupPredicate::All { of } => of.iter().all(|p| p.evaluate(facts)),
            GroupPredicate::Any { of } => of.iter().any(|p| p.evaluate(facts)),
            GroupPredicate::Not { predicate } => !predicate.evaluate(facts),
        }
    }
}
