//! Reconciliation entrypoint: one call per promotion request.
//!
//! The first call after startup loads the whole non-terminal backlog into
//! the tracker before anything is admitted, so that priority order holds
//! across restarts. After that, each call asks the tracker for admission and
//! runs the executor only if admitted.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::resync::spawn_resync;
use super::tracker::KeyedAdmissionTracker;
use super::watch::enqueue_next;
use super::work_queue::WorkQueue;
use crate::error::{Error, Result};
use crate::executor::PromotionExecutor;
use crate::model::{Phase, Promotion, PromotionKey, StageKey};
use crate::store::PromotionStore;
use crate::telemetry::metrics;
use crate::telemetry::promotion::{record_phase_transition, start_promotion_span};

/// What a single reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Promotion gone, finished, malformed, or already being driven here.
    /// Nothing to do.
    Skipped,
    /// Not admitted; another promotion holds the stage or is ahead in line.
    Queued,
    /// Admitted, but cancelled before it started running.
    Cancelled,
    /// Admitted and executed to this final phase.
    Completed(Phase),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    Uninitialized,
    Initializing,
    Ready,
}

pub struct Reconciler {
    store: Arc<dyn PromotionStore>,
    executor: Arc<dyn PromotionExecutor>,
    tracker: Arc<KeyedAdmissionTracker>,
    queue: WorkQueue,
    init: Mutex<InitState>,
    resync_interval: Duration,
    shutdown: CancellationToken,
    resync: StdMutex<Option<JoinHandle<()>>>,
    /// Promotions whose executor is running in this process.
    in_flight: Arc<StdMutex<HashSet<PromotionKey>>>,
}

/// Marks a promotion as being driven; unmarks it on drop.
struct InFlight {
    set: Arc<StdMutex<HashSet<PromotionKey>>>,
    key: PromotionKey,
}

impl InFlight {
    fn claim(set: &Arc<StdMutex<HashSet<PromotionKey>>>, key: &PromotionKey) -> Option<Self> {
        let fresh = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        fresh.then(|| Self {
            set: Arc::clone(set),
            key: key.clone(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn PromotionStore>,
        executor: Arc<dyn PromotionExecutor>,
        tracker: Arc<KeyedAdmissionTracker>,
        queue: WorkQueue,
        resync_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            executor,
            tracker,
            queue,
            init: Mutex::new(InitState::Uninitialized),
            resync_interval,
            shutdown,
            resync: StdMutex::new(None),
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    /// Load the backlog into the tracker and start the resync loop, once.
    ///
    /// Concurrent callers wait here until the first one has finished.
    pub async fn ensure_initialized(&self) -> Result<()> {
        let mut state = self.init.lock().await;
        if *state == InitState::Ready {
            return Ok(());
        }
        *state = InitState::Initializing;

        let items = match self.store.list_non_terminal().await {
            Ok(items) => items,
            Err(e) => {
                *state = InitState::Uninitialized;
                return Err(e);
            }
        };
        let count = items.len();
        match self.tracker.initialize(items) {
            Ok(()) | Err(Error::AlreadyInitialized) => {}
            Err(e) => {
                *state = InitState::Uninitialized;
                return Err(e);
            }
        }

        let handle = spawn_resync(
            Arc::clone(&self.tracker),
            Arc::clone(&self.store),
            self.queue.clone(),
            self.resync_interval,
            self.shutdown.child_token(),
        );
        *self.resync.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        *state = InitState::Ready;
        info!(promotions = count, "reconciler ready");
        Ok(())
    }

    /// Reconcile one promotion.
    ///
    /// `cancel` aborts the executor. A promotion cancelled before it was
    /// recorded as `Running` is never marked `Running`.
    pub async fn reconcile(
        &self,
        key: &PromotionKey,
        cancel: CancellationToken,
    ) -> Result<ReconcileOutcome> {
        self.ensure_initialized().await?;

        let Some(promotion) = self.store.get(key).await? else {
            debug!(promotion = %key, "promotion no longer exists");
            return Ok(ReconcileOutcome::Skipped);
        };
        let Some(stage) = promotion.stage_key() else {
            warn!(promotion = %key, "promotion has no stage, ignoring");
            return Ok(ReconcileOutcome::Skipped);
        };

        if promotion.is_terminal() {
            // A missed completion event can leave a finished promotion
            // holding its stage.
            if self.tracker.conclude(&stage, key) {
                self.hand_off(&stage).await;
            }
            return Ok(ReconcileOutcome::Skipped);
        }

        // Admission is idempotent, so a duplicate request for the active
        // promotion is admitted again; only one of them may drive it. The
        // claim comes first so a duplicate never touches the tracker.
        let Some(_claim) = InFlight::claim(&self.in_flight, key) else {
            debug!(promotion = %key, "already being driven");
            return Ok(ReconcileOutcome::Skipped);
        };

        if !self.tracker.try_activate(&stage, &promotion) {
            debug!(promotion = %key, stage = %stage, "waiting for stage");
            return Ok(ReconcileOutcome::Queued);
        }

        // The copy admitted above may be stale. Read it again now that no
        // one else can drive it.
        let current = match self.store.get(key).await {
            Ok(Some(current)) if !current.is_terminal() => current,
            Ok(_) => {
                debug!(promotion = %key, "admitted promotion already finished or gone");
                self.release(&stage, key).await;
                return Ok(ReconcileOutcome::Skipped);
            }
            Err(e) => {
                self.release(&stage, key).await;
                return Err(e);
            }
        };

        let span = start_promotion_span(&current);
        self.drive(stage, current, cancel, span.clone())
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        stage: StageKey,
        promotion: Promotion,
        cancel: CancellationToken,
        span: tracing::Span,
    ) -> Result<ReconcileOutcome> {
        let key = promotion.key();

        // A promotion found Running was admitted before a restart; it goes
        // straight back to the executor.
        if promotion.phase == Phase::Pending {
            if cancel.is_cancelled() {
                info!(promotion = %key, "cancelled before start");
                self.release(&stage, &key).await;
                return Ok(ReconcileOutcome::Cancelled);
            }
            if let Err(e) = self.store.update_phase(&key, Phase::Running, None).await {
                error!(promotion = %key, error = %e, "could not mark promotion running");
                self.release(&stage, &key).await;
                return Err(e);
            }
            record_phase_transition(&span, "pending", "running");
        }

        let (phase, message, duration_ms) =
            match self.executor.execute(&promotion, cancel.clone()).await {
                Ok(execution) => (execution.phase, execution.message, execution.duration_ms),
                Err(e) if cancel.is_cancelled() => {
                    // Stays Running in the store and keeps the stage; the
                    // next process picks it back up.
                    warn!(promotion = %key, error = %e, "execution interrupted");
                    return Ok(ReconcileOutcome::Cancelled);
                }
                Err(e) => (Phase::Failed, Some(e.to_string()), 0),
            };
        let phase = if phase.is_terminal() {
            phase
        } else {
            warn!(promotion = %key, phase = %phase, "executor returned a non-final phase");
            Phase::Failed
        };

        metrics::promotion_duration_ms()
            .record(duration_ms as f64, &[KeyValue::new("phase", phase.to_string())]);

        let persisted = self
            .store
            .update_phase(&key, phase, message.as_deref())
            .await;
        match &persisted {
            Ok(_) => {
                record_phase_transition(&span, "running", &phase.to_string());
                // The completion watch will see the transition too;
                // concluding twice is harmless.
                self.tracker.conclude(&stage, &key);
            }
            Err(e) => {
                error!(promotion = %key, error = %e, "could not record promotion outcome");
                self.release(&stage, &key).await;
            }
        }

        persisted.map(|_| ReconcileOutcome::Completed(phase))
    }

    /// Conclude `key` and enqueue whoever is next, without waiting for a
    /// watch event that may never come.
    async fn release(&self, stage: &StageKey, key: &PromotionKey) {
        if self.tracker.conclude(stage, key) {
            self.hand_off(stage).await;
        }
    }

    async fn hand_off(&self, stage: &StageKey) {
        if let Err(e) = enqueue_next(
            &self.tracker,
            self.store.as_ref(),
            &self.queue,
            stage,
            "reconcile",
        )
        .await
        {
            warn!(stage = %stage, error = %e, "could not pick next promotion, leaving it to resync");
        }
    }

    /// Wait for the resync loop to exit after shutdown.
    pub async fn join_resync(&self) {
        let handle = self
            .resync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
