//! Assembly of the service graph from its collaborators.

use crate::adapters::{InMemoryDirectory, PredicateEligibility, TracingNotifier};
use crate::config::{CreditConfig, StorageConfig};
use crate::error::DaemonResult;
use crate::usecases::{ClapUseCase, RateUseCase, VoteUseCase};
use credit_ledger::{
    AllocationEngine, DecisionSnapshotter, EligibilitySource, EntitlementSource,
    LeaderboardReader, LedgerUpdateService, Notifier, OverspendReconciler, TargetDirectory,
};
use credit_storage::memory::InMemoryLedgerStore;
use credit_storage::{ArchiveStore, FsArchiveStore, InMemoryArchiveStore, LedgerStore};
use credit_types::{Clock, SystemClock};
use std::sync::Arc;

/// Everything the ledger needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn LedgerStore>,
    pub archive: Arc<dyn ArchiveStore>,
    pub entitlements: Arc<dyn EntitlementSource>,
    pub eligibility: Arc<dyn EligibilitySource>,
    pub directory: Arc<dyn TargetDirectory>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// In-process reference implementations of every port.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryLedgerStore::new()),
            archive: Arc::new(InMemoryArchiveStore::new()),
            entitlements: Arc::new(credit_ledger::StaticEntitlements::new()),
            eligibility: Arc::new(PredicateEligibility::new()),
            directory: Arc::new(InMemoryDirectory::new()),
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(SystemClock),
        }
    }

    /// Storage, archive and entitlements per configuration; the remaining
    /// ports use the reference implementations.
    pub async fn from_config(config: &CreditConfig) -> DaemonResult<Self> {
        let store = open_store(&config.storage).await?;
        let archive: Arc<dyn ArchiveStore> = match &config.reconciler.archive_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                Arc::new(FsArchiveStore::new(dir.clone()))
            }
            None => Arc::new(InMemoryArchiveStore::new()),
        };
        Ok(Self {
            store,
            archive,
            entitlements: Arc::new(config.static_entitlements()),
            ..Self::in_memory()
        })
    }
}

async fn open_store(storage: &StorageConfig) -> DaemonResult<Arc<dyn LedgerStore>> {
    match storage {
        StorageConfig::Memory => Ok(Arc::new(InMemoryLedgerStore::new())),
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
        } => {
            let store = credit_storage::postgres::PostgresLedgerStore::connect_with_options(
                url,
                *max_connections,
                *connect_timeout_secs,
            )
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StorageConfig::Postgres { .. } => Err(crate::error::DaemonError::Config(
            "postgres storage requires the `postgres` feature".to_string(),
        )),
    }
}

/// The assembled service graph.
#[derive(Clone)]
pub struct CreditServices {
    pub store: Arc<dyn LedgerStore>,
    pub ratings: LedgerUpdateService,
    pub allocations: AllocationEngine,
    pub votes: VoteUseCase,
    pub claps: ClapUseCase,
    pub rates: RateUseCase,
    pub reconciler: Arc<OverspendReconciler>,
    pub leaderboard: LeaderboardReader,
    pub snapshotter: DecisionSnapshotter,
}

impl CreditServices {
    pub fn assemble(deps: Collaborators, config: &CreditConfig) -> Self {
        let ratings = LedgerUpdateService::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.entitlements),
            Arc::clone(&deps.clock),
        )
        .with_bases(config.ledger.matter_bases.clone());
        let allocations =
            AllocationEngine::new(Arc::clone(&deps.entitlements), Arc::clone(&deps.clock));

        let votes = VoteUseCase::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.directory),
            Arc::clone(&deps.eligibility),
            Arc::clone(&deps.notifier),
            allocations.clone(),
        );
        let claps = ClapUseCase::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.directory),
            Arc::clone(&deps.eligibility),
            Arc::clone(&deps.notifier),
            allocations.clone(),
            config.ledger.clap_basis.clone(),
            config.ledger.rolling_window(),
        );
        let rates = RateUseCase::new(
            ratings.clone(),
            Arc::clone(&deps.directory),
            Arc::clone(&deps.eligibility),
        );
        let reconciler = OverspendReconciler::new(
            ratings.clone(),
            allocations.clone(),
            Arc::clone(&deps.entitlements),
            Arc::clone(&deps.directory),
            Arc::clone(&deps.archive),
            Arc::clone(&deps.clock),
        )
        .with_config(config.reconciler.to_reconciler_config());
        let leaderboard = LeaderboardReader::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.directory),
            Arc::clone(&deps.clock),
        );
        let snapshotter = DecisionSnapshotter::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.directory),
            Arc::clone(&deps.clock),
        );

        Self {
            store: deps.store,
            ratings,
            allocations,
            votes,
            claps,
            rates,
            reconciler: Arc::new(reconciler),
            leaderboard,
            snapshotter,
        }
    }
}
