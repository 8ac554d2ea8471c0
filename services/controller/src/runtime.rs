//! The controller run loop.
//!
//! Reconciles for the same extension are serialized through a per-name
//! lock; different extensions reconcile in parallel. Work arrives from the
//! periodic resync tick and from prompt requeues after progressing or
//! transiently failing passes, with exponential backoff on failure. An
//! extension that keeps failing spends its retry budget and is deferred to
//! the resync tick instead of looping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use helion_reconcile::{Backoff, RetryBudget};

use crate::cluster::ClusterState;
use crate::config::Config;
use crate::reconciler::{ReconcileOutcome, Reconciler};

/// Delay before re-reconciling a progressing rollout.
const PROGRESS_REQUEUE: Duration = Duration::from_secs(5);

/// The long-running controller runtime.
pub struct ControllerRuntime {
    reconciler: Arc<Reconciler>,
    state: Arc<dyn ClusterState>,
    config: Config,
    /// Per-extension reconcile locks; reconciles for one extension are
    /// serialized, extensions run in parallel.
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    /// Per-extension requeue backoff.
    backoffs: Arc<Mutex<HashMap<String, Backoff>>>,
    /// Shared transient-failure budget; spent budgets defer to resync.
    retry_budget: Arc<Mutex<RetryBudget>>,
}

impl ControllerRuntime {
    pub fn new(
        config: Config,
        reconciler: Arc<Reconciler>,
        state: Arc<dyn ClusterState>,
    ) -> Self {
        let retry_budget = RetryBudget::new(config.max_transient_retries, config.retry_window);
        Self {
            reconciler,
            state,
            config,
            locks: Arc::new(Mutex::new(HashMap::new())),
            backoffs: Arc::new(Mutex::new(HashMap::new())),
            retry_budget: Arc::new(Mutex::new(retry_budget)),
        }
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            resync_secs = self.config.reconcile_interval.as_secs(),
            "Starting extension controller"
        );
        let mut resync = tokio::time::interval(self.config.reconcile_interval);

        loop {
            tokio::select! {
                _ = resync.tick() => {
                    self.resync_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Controller shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Reconcile every known extension once, in parallel.
    async fn resync_all(&self) {
        // The resync is the escape hatch for spent budgets: expired strike
        // windows are dropped so deferred extensions get another chance.
        self.retry_budget.lock().await.compact();

        let extensions = match self.state.list_extensions().await {
            Ok(extensions) => extensions,
            Err(e) => {
                error!(error = %e, "Failed to list extensions");
                return;
            }
        };
        debug!(count = extensions.len(), "Resync pass");

        let mut handles = Vec::new();
        for extension in extensions {
            let name = extension.name.clone();
            let reconciler = Arc::clone(&self.reconciler);
            let state = Arc::clone(&self.state);
            let locks = Arc::clone(&self.locks);
            let backoffs = Arc::clone(&self.backoffs);
            let retry_budget = Arc::clone(&self.retry_budget);
            handles.push(tokio::spawn(async move {
                reconcile_one(name, reconciler, state, locks, backoffs, retry_budget).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Enqueue a single reconcile outside the resync tick (e.g. from a
    /// watch event).
    pub async fn reconcile_now(&self, name: &str) {
        reconcile_one(
            name.to_string(),
            Arc::clone(&self.reconciler),
            Arc::clone(&self.state),
            Arc::clone(&self.locks),
            Arc::clone(&self.backoffs),
            Arc::clone(&self.retry_budget),
        )
        .await;
    }
}

/// One serialized reconcile for one extension, with follow-up requeues
/// until it stops progressing or spends its retry budget.
async fn reconcile_one(
    name: String,
    reconciler: Arc<Reconciler>,
    state: Arc<dyn ClusterState>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    backoffs: Arc<Mutex<HashMap<String, Backoff>>>,
    retry_budget: Arc<Mutex<RetryBudget>>,
) {
    let lock = {
        let mut locks = locks.lock().await;
        Arc::clone(locks.entry(name.clone()).or_default())
    };
    // The critical section: at most one reconcile per extension at a time.
    // A pass already in flight keeps requeueing itself, so a contended tick
    // has nothing to add.
    let Ok(_guard) = lock.try_lock() else {
        debug!(extension = %name, "Reconcile already in flight, skipping");
        return;
    };

    loop {
        let extension = match state.list_extensions().await {
            Ok(extensions) => extensions.into_iter().find(|e| e.name == name),
            Err(e) => {
                error!(extension = %name, error = %e, "Failed to read extension");
                return;
            }
        };
        let Some(extension) = extension else {
            debug!(extension = %name, "Extension is gone, cleaning up cache");
            if let Err(e) = reconciler.cleanup(&name) {
                error!(extension = %name, error = %e, "Cache cleanup failed");
            }
            return;
        };

        match reconciler.reconcile(&extension).await {
            ReconcileOutcome::Done => {
                backoffs.lock().await.remove(&name);
                retry_budget.lock().await.settle(&name);
                return;
            }
            ReconcileOutcome::Progressing => {
                backoffs.lock().await.remove(&name);
                tokio::time::sleep(PROGRESS_REQUEUE).await;
            }
            ReconcileOutcome::TransientFailure => {
                if !retry_budget.lock().await.allow_retry(&name) {
                    warn!(
                        extension = %name,
                        "Transient retry budget spent, deferring to resync"
                    );
                    return;
                }
                let delay = {
                    let mut backoffs = backoffs.lock().await;
                    backoffs.entry(name.clone()).or_default().next_delay()
                };
                debug!(extension = %name, delay_secs = delay.as_secs(), "Backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
