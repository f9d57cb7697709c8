//! Scheduled reconciliation jobs
//!
//! Each job runs on its own ticker task, and the job body runs inside that
//! task behind the job's [`RunLock`]. Ticks missed while a run is still going
//! are skipped, so a job never overlaps itself, and stopping the ticker
//! cancels any run in progress. Different jobs may run concurrently and only
//! meet in the catalog store.

use crate::{config::Config, db::Database, network::NetworkClient, vpn::SubscriptionLifecycle};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

mod node_sync;
mod plan;
mod wallets;

pub use node_sync::*;
pub use plan::*;
pub use wallets::*;

/// At-most-one-concurrent-run guard for a job
#[derive(Clone, Default)]
pub struct RunLock {
    inner: Arc<AsyncMutex<()>>,
}

impl RunLock {
    /// Create an unlocked run lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock without waiting. `None` when a run is in progress.
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        self.inner.clone().try_lock_owned().ok()
    }
}

/// Run `job` under `lock`, or skip it if the lock is held.
///
/// Returns whether the job ran.
pub async fn run_exclusive<F>(name: &str, lock: &RunLock, job: F) -> bool
where
    F: Future<Output = ()>,
{
    let Some(_guard) = lock.try_acquire() else {
        debug!("[{}] Previous run still in progress, skipping tick", name);
        return false;
    };
    job.await;
    true
}

/// Owns the tickers of every reconciliation job
pub struct Scheduler {
    config: Arc<Config>,
    node_sync: Arc<NodeSyncEngine>,
    wallets: Arc<WalletLifecycleManager>,
    plan: Arc<PlanMembershipManager>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build the job set
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        network: Arc<NetworkClient>,
        subscriptions: Arc<SubscriptionLifecycle>,
    ) -> Self {
        let node_sync = Arc::new(NodeSyncEngine::new(config.clone(), db.clone(), network.clone()));
        let wallets = Arc::new(WalletLifecycleManager::new(
            config.clone(),
            db.clone(),
            network.clone(),
            subscriptions,
        ));
        let plan = Arc::new(PlanMembershipManager::new(config.clone(), db, network));

        Self {
            config,
            node_sync,
            wallets,
            plan,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one ticker task per job
    pub fn start(&self) {
        let scheduler = &self.config.scheduler;
        info!(
            "Starting scheduler: node sync every {}s, fee grants every {}s, enrollment every {}s, plan every {}s",
            scheduler.node_sync_interval_secs,
            scheduler.fee_grant_interval_secs,
            scheduler.enrollment_interval_secs,
            scheduler.plan_interval_secs
        );

        let node_sync = self.node_sync.clone();
        let node_sync_handle = spawn_job("node-sync", scheduler.node_sync_interval_secs, move || {
            let engine = node_sync.clone();
            async move { engine.run().await }
        });

        let wallets = self.wallets.clone();
        let fee_grant_handle = spawn_job("fee-grant", scheduler.fee_grant_interval_secs, move || {
            let manager = wallets.clone();
            async move { manager.run_fee_grants().await }
        });

        let wallets = self.wallets.clone();
        let enrollment_handle = spawn_job("enrollment", scheduler.enrollment_interval_secs, move || {
            let manager = wallets.clone();
            async move { manager.run_enrollment().await }
        });

        let plan = self.plan.clone();
        let plan_handle = spawn_job("plan-membership", scheduler.plan_interval_secs, move || {
            let manager = plan.clone();
            async move { manager.run().await }
        });

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.extend([node_sync_handle, fee_grant_handle, enrollment_handle, plan_handle]);
    }

    /// Abort every ticker along with its in-flight run
    pub fn stop(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for handle in handles.drain(..) {
            handle.abort();
        }
        info!("Scheduler stopped");
    }
}

/// Tick every `period_secs`, running `make_job()` behind a per-job [`RunLock`]
fn spawn_job<M, F>(name: &'static str, period_secs: u64, make_job: M) -> JoinHandle<()>
where
    M: Fn() -> F + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(run_ticker(name, Duration::from_secs(period_secs.max(1)), make_job))
}

async fn run_ticker<M, F>(name: &'static str, period: Duration, make_job: M)
where
    M: Fn() -> F,
    F: Future<Output = ()>,
{
    let lock = RunLock::new();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        run_exclusive(name, &lock, make_job()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_run_lock_skips_overlapping_tick() {
        let lock = RunLock::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let first = tokio::spawn({
            let lock = lock.clone();
            let runs = runs.clone();
            async move {
                run_exclusive("test", &lock, async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                })
                .await
            }
        });

        started_rx.await.unwrap();

        let overlapping = run_exclusive("test", &lock, {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
        assert!(!overlapping);

        release_tx.send(()).unwrap();
        assert!(first.await.unwrap());

        let after = run_exclusive("test", &lock, {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
        assert!(after);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    /// Sets its flag when dropped, i.e. when the run is cancelled or finishes
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_abort_cancels_in_flight_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let started_tx = Arc::new(Mutex::new(Some(started_tx)));

        let handle = spawn_job("test", 1, {
            let runs = runs.clone();
            let dropped = dropped.clone();
            move || {
                let runs = runs.clone();
                let flag = DropFlag(dropped.clone());
                let started_tx = started_tx.clone();
                async move {
                    let _flag = flag;
                    runs.fetch_add(1, Ordering::SeqCst);
                    if let Some(tx) = started_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    std::future::pending::<()>().await;
                }
            }
        });

        started_rx.await.unwrap();
        assert!(!dropped.load(Ordering::SeqCst));

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
