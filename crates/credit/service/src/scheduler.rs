//! Reconciliation scheduler

use crate::config::ReconcilerSection;
use crate::error::DaemonResult;
use crate::services::CreditServices;
use credit_ledger::{DecisionSnapshotter, OverspendReconciler, ReconcileReport};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Runs decision capture and overspend reconciliation on an interval or on demand.
pub struct Scheduler {
    interval: Duration,
    reconciler: Arc<OverspendReconciler>,
    snapshotter: DecisionSnapshotter,
    trigger_tx: mpsc::Sender<()>,
    running: Arc<RwLock<bool>>,
    stopped: Notify,
    last_report: RwLock<Option<ReconcileReport>>,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        config: &ReconcilerSection,
        services: &CreditServices,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(10);

        let scheduler = Arc::new(Self {
            interval: Duration::from_secs(config.interval_secs.max(1)),
            reconciler: Arc::clone(&services.reconciler),
            snapshotter: services.snapshotter.clone(),
            trigger_tx,
            running: Arc::new(RwLock::new(false)),
            stopped: Notify::new(),
            last_report: RwLock::new(None),
        });

        (scheduler, trigger_rx)
    }

    /// Request an immediate pass
    pub async fn trigger(&self) {
        let _ = self.trigger_tx.send(()).await;
    }

    /// One pass: capture due decision values, then reconcile.
    pub async fn tick(&self) -> DaemonResult<ReconcileReport> {
        let captured = self.snapshotter.capture_due().await?;
        if captured > 0 {
            tracing::debug!(captured, "decision values captured");
        }
        let report = self.reconciler.reconcile().await?;
        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    pub async fn last_report(&self) -> Option<ReconcileReport> {
        self.last_report.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Run until [`Scheduler::stop`] is called or the trigger channel closes
    pub async fn start(self: Arc<Self>, mut trigger_rx: mpsc::Receiver<()>) {
        {
            let mut running = self.running.write().await;
            *running = true;
        }

        tracing::info!(interval_secs = self.interval.as_secs(), "Scheduler started");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Reconciliation failed");
                    }
                }
                Some(_) = trigger_rx.recv() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Triggered reconciliation failed");
                    }
                }
                _ = self.stopped.notified() => {}
                else => break,
            }

            let running = self.running.read().await;
            if !*running {
                break;
            }
        }

        tracing::info!("Scheduler stopped");
    }

    /// Stop the scheduler
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        self.stopped.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CreditConfig;
    use crate::services::Collaborators;

    #[tokio::test]
    async fn test_tick_on_empty_ledger() {
        let config = CreditConfig::default();
        let services = CreditServices::assemble(Collaborators::in_memory(), &config);
        let (scheduler, _rx) = Scheduler::new(&config.reconciler, &services);

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.pairs_examined, 0);
        assert!(report.is_clean());
        assert_eq!(scheduler.last_report().await, Some(report));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let config = CreditConfig::default();
        let services = CreditServices::assemble(Collaborators::in_memory(), &config);
        let (scheduler, rx) = Scheduler::new(&config.reconciler, &services);

        let handle = tokio::spawn(Arc::clone(&scheduler).start(rx));
        scheduler.trigger().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.last_report().await.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(scheduler.is_running().await);

        scheduler.stop().await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!scheduler.is_running().await);
    }
}
