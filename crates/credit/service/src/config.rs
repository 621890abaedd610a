//! Configuration for creditd

use credit_ledger::{MatterBases, ReconcilerConfig, StaticEntitlements};
use credit_types::{CreditBasis, IdentityId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreditConfig {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Ledger policy
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Reconciler and scheduler configuration
    #[serde(default)]
    pub reconciler: ReconcilerSection,

    /// Static entitlement table for the reference entitlement source
    #[serde(default)]
    pub entitlements: Vec<EntitlementEntry>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for development/testing)
    #[default]
    Memory,

    /// PostgreSQL storage
    Postgres {
        /// Connection URL
        url: String,

        /// Maximum connections in pool
        #[serde(default = "default_pool_size")]
        max_connections: u32,

        /// Connection timeout in seconds
        #[serde(default = "default_connection_timeout")]
        connect_timeout_secs: u64,
    },
}

/// Ledger policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Trailing window bounding clap spend
    #[serde(default = "default_rolling_window_days")]
    pub rolling_window_days: i64,

    /// Credit basis bounding claps
    #[serde(default)]
    pub clap_basis: CreditBasis,

    /// Credit basis per rating matter
    #[serde(default)]
    pub matter_bases: MatterBases,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rolling_window_days: default_rolling_window_days(),
            clap_basis: CreditBasis::default(),
            matter_bases: MatterBases::default(),
        }
    }
}

impl LedgerConfig {
    pub fn rolling_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.rolling_window_days.max(1))
    }
}

/// Reconciler and scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerSection {
    /// Seconds between scheduled passes
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,

    /// Root directory for pre-image archives; in-memory when unset
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,

    /// Skip re-archiving a partition archived more recently than this
    #[serde(default)]
    pub min_archive_interval_hours: u64,

    /// Also reconcile vote allocations
    #[serde(default = "default_true")]
    pub reconcile_votes: bool,
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
            archive_dir: None,
            min_archive_interval_hours: 0,
            reconcile_votes: true,
        }
    }
}

impl ReconcilerSection {
    pub fn to_reconciler_config(&self) -> ReconcilerConfig {
        let hours = i64::try_from(self.min_archive_interval_hours).unwrap_or(i64::MAX / 3600);
        ReconcilerConfig {
            min_archive_interval: chrono::Duration::hours(hours),
            reconcile_votes: self.reconcile_votes,
        }
    }
}

/// One row of the static entitlement table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementEntry {
    pub identity: IdentityId,
    pub basis: CreditBasis,
    pub value: i64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_rolling_window_days() -> i64 {
    30
}

fn default_reconcile_interval() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

impl CreditConfig {
    /// Load configuration: defaults, then the optional file, then `CREDIT__*` variables
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&CreditConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // CREDIT__RECONCILER__INTERVAL_SECS=600
        builder = builder.add_source(
            config::Environment::with_prefix("CREDIT")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Build the reference entitlement source from the configured table
    pub fn static_entitlements(&self) -> StaticEntitlements {
        let entitlements = StaticEntitlements::new();
        for entry in &self.entitlements {
            entitlements.set(entry.identity.clone(), entry.basis.clone(), entry.value);
        }
        entitlements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credit_ledger::EntitlementSource;

    #[test]
    fn test_default_config() {
        let config = CreditConfig::default();
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.ledger.rolling_window_days, 30);
        assert_eq!(config.ledger.clap_basis, CreditBasis::TdhPlusXtdh);
        assert!(config.entitlements.is_empty());
    }

    #[test]
    fn test_reconciler_defaults() {
        let config = ReconcilerSection::default();
        assert_eq!(config.interval_secs, 3600);
        assert!(config.archive_dir.is_none());
        let reconciler = config.to_reconciler_config();
        assert_eq!(reconciler.min_archive_interval, chrono::Duration::zero());
        assert!(reconciler.reconcile_votes);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = CreditConfig::load(None).unwrap();
        assert_eq!(config.reconciler.interval_secs, 3600);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_storage_config_tagged() {
        let storage: StorageConfig = serde_json::from_value(serde_json::json!({
            "type": "postgres",
            "url": "postgres://localhost/credit"
        }))
        .unwrap();
        match storage {
            StorageConfig::Postgres {
                url,
                max_connections,
                connect_timeout_secs,
            } => {
                assert_eq!(url, "postgres://localhost/credit");
                assert_eq!(max_connections, 10);
                assert_eq!(connect_timeout_secs, 5);
            }
            StorageConfig::Memory => panic!("expected postgres"),
        }
    }

    #[tokio::test]
    async fn test_static_entitlements_from_table() {
        let config = CreditConfig {
            entitlements: vec![EntitlementEntry {
                identity: "alice".into(),
                basis: CreditBasis::Tdh,
                value: 42,
            }],
            ..Default::default()
        };
        let source = config.static_entitlements();
        assert_eq!(
            source
                .entitlement(&"alice".into(), &CreditBasis::Tdh)
                .await
                .unwrap(),
            42
        );
    }
}
