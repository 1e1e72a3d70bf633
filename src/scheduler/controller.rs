//! Controller loop: owns the tracker and everything that feeds it.
//!
//! Three things run for the lifetime of a controller: the work loop that
//! takes reconciliation requests off the queue, the watch pump that feeds
//! store changes to the completion handler, and (after the first
//! reconciliation) the resync loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, Semaphore, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reconciler::Reconciler;
use super::resync::resync_once;
use super::tracker::KeyedAdmissionTracker;
use super::watch::{CompletionWatchHandler, WatchEvent};
use super::work_queue::{WorkQueue, WorkReceiver};
use crate::error::{Error, Result};
use crate::executor::PromotionExecutor;
use crate::model::PromotionKey;
use crate::store::PromotionStore;

/// Configuration for the controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How often free stages with pending promotions are retried.
    pub resync_interval: Duration,
    /// Upper bound on reconciliations running at once.
    pub max_concurrent_reconciles: usize,
    /// Delay before a reconciliation that errored is tried again.
    pub retry_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(10),
            max_concurrent_reconciles: 4,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

pub struct Controller {
    store: Arc<dyn PromotionStore>,
    tracker: Arc<KeyedAdmissionTracker>,
    reconciler: Arc<Reconciler>,
    watch: Arc<CompletionWatchHandler>,
    queue: WorkQueue,
    receiver: Mutex<Option<WorkReceiver>>,
    config: ControllerConfig,
    shutdown: CancellationToken,
}

impl Controller {
    pub fn new(
        store: Arc<dyn PromotionStore>,
        executor: Arc<dyn PromotionExecutor>,
        config: ControllerConfig,
    ) -> Self {
        let tracker = Arc::new(KeyedAdmissionTracker::new());
        let (queue, receiver) = WorkQueue::new();
        let shutdown = CancellationToken::new();
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            executor,
            Arc::clone(&tracker),
            queue.clone(),
            config.resync_interval,
            shutdown.clone(),
        ));
        let watch = Arc::new(CompletionWatchHandler::new(
            Arc::clone(&tracker),
            Arc::clone(&store),
            queue.clone(),
        ));
        Self {
            store,
            tracker,
            reconciler,
            watch,
            queue,
            receiver: Mutex::new(Some(receiver)),
            config,
            shutdown,
        }
    }

    pub fn tracker(&self) -> Arc<KeyedAdmissionTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        Arc::clone(&self.reconciler)
    }

    /// Ask for `key` to be reconciled.
    pub fn submit(&self, key: PromotionKey) -> bool {
        self.queue.submit(key, "external")
    }

    /// Signal the controller to shut down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// A token that fires on shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until [`Controller::shutdown`] is called.
    ///
    /// # Errors
    ///
    /// Fails if the controller is already running, or if the store cannot
    /// be subscribed to or listed at startup.
    pub async fn run(&self) -> Result<()> {
        let mut receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Other("controller is already running".to_string()))?;

        // Subscribe before listing so nothing falls between the two.
        let events = self.store.subscribe().await?;
        let pump = self.spawn_watch_pump(events);

        let backlog = self.store.list_non_terminal().await?;
        info!(promotions = backlog.len(), "controller started");
        for promotion in backlog {
            self.queue.submit(promotion.key(), "startup");
        }

        let limiter = Arc::new(Semaphore::new(self.config.max_concurrent_reconciles.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = receiver.recv() => {
                    let Some(key) = next else { break };
                    let permit = tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        permit = Arc::clone(&limiter).acquire_owned() => permit
                            .map_err(|e| Error::Other(format!("reconcile limiter closed: {e}")))?,
                    };
                    let reconciler = Arc::clone(&self.reconciler);
                    let queue = self.queue.clone();
                    let cancel = self.shutdown.child_token();
                    let backoff = self.config.retry_backoff;
                    tasks.spawn(async move {
                        let result = reconciler.reconcile(&key, cancel.clone()).await;
                        // A backoff must not hold a slot.
                        drop(permit);
                        match result {
                            Ok(outcome) => debug!(promotion = %key, ?outcome, "reconciled"),
                            Err(e) => {
                                error!(promotion = %key, error = %e, "reconcile failed, will retry");
                                tokio::select! {
                                    _ = cancel.cancelled() => {}
                                    _ = tokio::time::sleep(backoff) => {
                                        queue.submit(key, "retry");
                                    }
                                }
                            }
                        }
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "reconcile task panicked");
                    }
                }
            }
        }

        info!("controller shutting down");
        self.shutdown.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "reconcile task panicked");
            }
        }
        let _ = pump.await;
        self.reconciler.join_resync().await;
        info!("controller stopped");
        Ok(())
    }

    fn spawn_watch_pump(&self, mut events: broadcast::Receiver<WatchEvent>) -> JoinHandle<()> {
        let watch = Arc::clone(&self.watch);
        let tracker = Arc::clone(&self.tracker);
        let store = Arc::clone(&self.store);
        let queue = self.queue.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(event) => watch.handle(event).await,
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "watch stream lagged, resyncing all stages");
                            resync_once(&tracker, store.as_ref(), &queue).await;
                        }
                        Err(RecvError::Closed) => {
                            warn!("watch stream closed; relying on resync");
                            return;
                        }
                    },
                }
            }
        })
    }
}
