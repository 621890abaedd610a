use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for ledger operations.
pub type CreditResult<T> = Result<T, CreditError>;

/// Domain error taxonomy shared by every ledger surface.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreditError {
    /// Malformed matter, category or value.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Target or scope does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Ineligible actor, self-target, closed window or disallowed allocation kind.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("insufficient credit: would spend {needed}, only {available} left")]
    InsufficientCredit { needed: i64, available: i64 },

    /// The scope has already been decided.
    #[error("locked: {0}")]
    Locked(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// An external collaborator (entitlement, eligibility, directory) failed.
    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

/// Stable discriminator for [`CreditError`], suitable for metrics labels and API mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    InsufficientCredit,
    Locked,
    DeadlineExceeded,
    Upstream,
    Storage,
}

impl CreditError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CreditError::Validation(_) => ErrorKind::Validation,
            CreditError::NotFound(_) => ErrorKind::NotFound,
            CreditError::Forbidden(_) => ErrorKind::Forbidden,
            CreditError::InsufficientCredit { .. } => ErrorKind::InsufficientCredit,
            CreditError::Locked(_) => ErrorKind::Locked,
            CreditError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            CreditError::Upstream(_) => ErrorKind::Upstream,
            CreditError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether a retry of the same request could succeed without any caller change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CreditError::DeadlineExceeded(_) | CreditError::Upstream(_) | CreditError::Storage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_credit_message_carries_amounts() {
        let err = CreditError::InsufficientCredit {
            needed: 4,
            available: 2,
        };
        assert_eq!(
            err.to_string(),
            "insufficient credit: would spend 4, only 2 left"
        );
        assert_eq!(err.kind(), ErrorKind::InsufficientCredit);
        assert!(!err.is_transient());
    }

    #[test]
    fn storage_failures_are_transient() {
        assert!(CreditError::Storage("connection reset".into()).is_transient());
        assert!(!CreditError::Locked("decided".into()).is_transient());
    }
}
