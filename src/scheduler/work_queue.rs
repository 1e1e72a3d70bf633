//! Reconciliation work queue.
//!
//! Requests are keyed by promotion identity. A promotion that is already
//! waiting in the queue is not queued a second time; once a worker takes it,
//! it can be submitted again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tracing::trace;

use crate::model::PromotionKey;
use crate::telemetry::metrics;

/// Sending half. Cheap to clone.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<PromotionKey>,
    queued: Arc<Mutex<HashSet<PromotionKey>>>,
}

/// Receiving half, owned by the controller loop.
pub struct WorkReceiver {
    rx: mpsc::UnboundedReceiver<PromotionKey>,
    queued: Arc<Mutex<HashSet<PromotionKey>>>,
}

impl WorkQueue {
    pub fn new() -> (WorkQueue, WorkReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(Mutex::new(HashSet::new()));
        (
            WorkQueue {
                tx,
                queued: Arc::clone(&queued),
            },
            WorkReceiver { rx, queued },
        )
    }

    /// Request a reconciliation of `key`. `source` labels the metric.
    ///
    /// Returns false if the request was folded into one already queued, or
    /// the receiver is gone.
    pub fn submit(&self, key: PromotionKey, source: &'static str) -> bool {
        {
            let mut queued = self.queued.lock().unwrap_or_else(PoisonError::into_inner);
            if !queued.insert(key.clone()) {
                trace!(promotion = %key, "reconcile already queued");
                return false;
            }
        }
        if self.tx.send(key.clone()).is_err() {
            self.queued
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            return false;
        }
        metrics::reconcile_submitted().add(1, &[KeyValue::new("source", source)]);
        true
    }

    /// Number of requests waiting to be taken.
    pub fn len(&self) -> usize {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WorkReceiver {
    /// Next request, or `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<PromotionKey> {
        let key = self.rx.recv().await?;
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        Some(key)
    }

    /// Like [`WorkReceiver::recv`] but never waits.
    pub fn try_recv(&mut self) -> Option<PromotionKey> {
        let key = self.rx.try_recv().ok()?;
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        Some(key)
    }
}
