//! Error types for the credit daemon

use credit_storage::StorageError;
use credit_types::CreditError;
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Ledger operation failed
    #[error("Ledger error: {0}")]
    Credit(#[from] CreditError),

    /// Storage backend could not be opened or initialised
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Scheduler error
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for DaemonError {
    fn from(e: config::ConfigError) -> Self {
        DaemonError::Config(e.to_string())
    }
}

/// Result type alias for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaemonError::Config("missing url".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing url");

        let err: DaemonError = CreditError::InsufficientCredit {
            needed: 4,
            available: 2,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Ledger error: insufficient credit: would spend 4, only 2 left"
        );
    }
}
