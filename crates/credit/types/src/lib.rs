//! Shared vocabulary for the credit-bounded allocation ledger.
//!
//! Everything here is plain data plus validation:
//! - identifiers for identities, targets, scopes and groups
//! - the closed [`Matter`] type and validated [`RatingKey`]s
//! - scope/target descriptors and the scope lifecycle [`ScopePhase`]
//! - the eligibility predicate AST
//! - the domain error taxonomy

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod clock;
mod eligibility;
mod error;
mod ids;
mod matter;
mod scope;

pub use clock::{Clock, ManualClock, SystemClock};
pub use eligibility::{GroupPredicate, IdentityFacts};
pub use error::{CreditError, CreditResult, ErrorKind};
pub use ids::{GroupId, IdentityId, ScopeId, TargetId};
pub use matter::{ChangeReason, Matter, RatingKey, MAX_CATEGORY_LEN};
pub use scope::{
    AllocationKind, CreditBasis, ScopeInfo, ScopeKind, ScopePhase, TargetInfo, TargetKind,
};
