//! Periodic retry of stalled stages.
//!
//! If a watch event is missed, a free stage with pending promotions would
//! otherwise wait forever. Every tick, each such stage gets its next
//! promotion enqueued again.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::tracker::KeyedAdmissionTracker;
use super::watch::enqueue_next;
use super::work_queue::WorkQueue;
use crate::store::PromotionStore;

/// Spawn the retry loop. It runs until `cancel` fires.
pub fn spawn_resync(
    tracker: Arc<KeyedAdmissionTracker>,
    store: Arc<dyn PromotionStore>,
    queue: WorkQueue,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; startup already enqueued
        // the backlog.
        ticker.tick().await;

        info!(interval_ms = interval.as_millis() as u64, "resync loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("resync loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let submitted = resync_once(&tracker, store.as_ref(), &queue).await;
                    if submitted > 0 {
                        debug!(submitted, "resync enqueued stalled stages");
                    }
                }
            }
        }
    })
}

/// One pass over every free stage with pending promotions. Returns how many
/// reconciliations were submitted.
pub async fn resync_once(
    tracker: &KeyedAdmissionTracker,
    store: &dyn PromotionStore,
    queue: &WorkQueue,
) -> usize {
    let mut submitted = 0;
    for head in tracker.pending_heads() {
        let Some(stage) = head.stage_key() else {
            continue;
        };
        match enqueue_next(tracker, store, queue, &stage, "resync").await {
            Ok(Some(_)) => submitted += 1,
            Ok(None) => {}
            Err(e) => warn!(stage = %stage, error = %e, "resync failed for stage"),
        }
    }
    submitted
}
