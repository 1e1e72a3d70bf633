//! Completion watch: frees a stage when its promotion finishes and hands the
//! stage to the next promotion in line.

use std::sync::Arc;

use tracing::{debug, warn};

use super::tracker::KeyedAdmissionTracker;
use super::work_queue::WorkQueue;
use crate::error::Result;
use crate::model::{Promotion, PromotionKey, StageKey};
use crate::store::PromotionStore;
use crate::telemetry::metrics;

pub use crate::store::WatchEvent;

pub struct CompletionWatchHandler {
    tracker: Arc<KeyedAdmissionTracker>,
    store: Arc<dyn PromotionStore>,
    queue: WorkQueue,
}

impl CompletionWatchHandler {
    pub fn new(
        tracker: Arc<KeyedAdmissionTracker>,
        store: Arc<dyn PromotionStore>,
        queue: WorkQueue,
    ) -> Self {
        Self {
            tracker,
            store,
            queue,
        }
    }

    /// React to one change in the store.
    pub async fn handle(&self, event: WatchEvent) {
        match event {
            WatchEvent::Created { item } => {
                if !item.is_terminal() {
                    self.queue.submit(item.key(), "watch");
                }
            }
            WatchEvent::Updated { old, new } => {
                if new.is_terminal() && !old.is_terminal() {
                    self.finished(&new).await;
                }
            }
            WatchEvent::Deleted { item } => self.finished(&item).await,
        }
    }

    async fn finished(&self, item: &Promotion) {
        let Some(stage) = item.stage_key() else {
            return;
        };
        self.tracker.conclude(&stage, &item.key());
        if let Err(e) = self.enqueue_next(&stage).await {
            warn!(stage = %stage, error = %e, "could not pick next promotion, leaving it to resync");
        }
    }

    /// See [`enqueue_next`].
    pub async fn enqueue_next(&self, stage: &StageKey) -> Result<Option<PromotionKey>> {
        enqueue_next(&self.tracker, self.store.as_ref(), &self.queue, stage, "watch").await
    }
}

/// Submit a reconciliation for the promotion that should hold `stage` next.
///
/// Does nothing while the stage is held. Pending entries that are gone from
/// the store, or already finished there, are discarded on the way. At most
/// one promotion is submitted; it is returned.
pub async fn enqueue_next(
    tracker: &KeyedAdmissionTracker,
    store: &dyn PromotionStore,
    queue: &WorkQueue,
    stage: &StageKey,
    source: &'static str,
) -> Result<Option<PromotionKey>> {
    loop {
        if let Some(holder) = tracker.active(stage) {
            debug!(stage = %stage, holder = %holder, "stage is held, nothing to enqueue");
            return Ok(None);
        }
        let Some(head) = tracker.peek_pending(stage) else {
            return Ok(None);
        };
        let id = head.key();

        // The tracker's copy may be stale; ask the store.
        match store.get(&id).await? {
            Some(current) if !current.is_terminal() => {
                queue.submit(id.clone(), source);
                debug!(stage = %stage, promotion = %id, "next promotion enqueued");
                return Ok(Some(id));
            }
            _ => {
                if tracker.discard_pending(stage, &id) {
                    debug!(stage = %stage, promotion = %id, "discarded stale pending promotion");
                    metrics::pending_pruned().add(1, &[]);
                }
            }
        }
    }
}
