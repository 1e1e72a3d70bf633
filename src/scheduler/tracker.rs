//! Keyed admission tracker: who holds each stage, and who is waiting.
//!
//! Per stage there is at most one active promotion and a priority queue of
//! pending ones. A promotion becomes active only when it is at the head of
//! its stage's queue and nothing else holds the stage; the decision is made
//! lazily, when someone asks to activate it.
//!
//! All state sits behind one lock and no method does I/O while holding it.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Phase, Promotion, PromotionKey, StageKey, higher_priority};
use crate::queue::PriorityQueue;
use crate::telemetry::metrics;

#[derive(Default)]
pub struct KeyedAdmissionTracker {
    state: RwLock<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    initialized: bool,
    active: HashMap<StageKey, PromotionKey>,
    pending: HashMap<StageKey, PriorityQueue<Promotion>>,
}

/// Point-in-time counts, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    pub active: usize,
    pub pending: usize,
}

fn new_queue() -> PriorityQueue<Promotion> {
    PriorityQueue::new(higher_priority, [])
}

impl KeyedAdmissionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the tracker from every non-terminal promotion in the store.
    ///
    /// A `Running` promotion was admitted by an earlier process and is put
    /// straight back as active, without re-checking queue order. If a stage
    /// has more than one `Running` promotion, the first one seen wins and
    /// the rest wait as pending.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyInitialized`] on any call after the first.
    pub fn initialize(&self, items: impl IntoIterator<Item = Promotion>) -> Result<()> {
        let mut guard = self.write();
        if guard.initialized {
            return Err(Error::AlreadyInitialized);
        }
        let st = &mut *guard;

        for item in items {
            if item.is_terminal() {
                continue;
            }
            let Some(key) = item.stage_key() else {
                warn!(promotion = %item.key(), "skipping promotion without a stage");
                continue;
            };
            let id = item.key();

            if item.phase == Phase::Running && !st.active.contains_key(&key) {
                debug!(stage = %key, promotion = %id, "reinstating running promotion");
                st.active.insert(key, id);
                continue;
            }
            if st.active.get(&key) == Some(&id) {
                continue;
            }
            if item.phase == Phase::Running {
                warn!(
                    stage = %key,
                    promotion = %id,
                    "stage already has a running promotion, queueing this one"
                );
            }
            st.pending.entry(key).or_insert_with(new_queue).push(item);
        }

        st.initialized = true;
        let stats = st.stats();
        info!(
            active = stats.active,
            pending = stats.pending,
            "admission tracker initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    /// Ask for `item` to hold `key`. Returns true iff it is (now) active.
    ///
    /// Fails closed: an item whose stage key cannot be derived, or whose
    /// key differs from `key`, is never admitted.
    pub fn try_activate(&self, key: &StageKey, item: &Promotion) -> bool {
        let id = item.key();
        match item.stage_key() {
            Some(derived) if &derived == key => {}
            derived => {
                warn!(
                    stage = %key,
                    promotion = %id,
                    derived = ?derived,
                    "refusing admission: promotion does not belong to stage"
                );
                record_attempt("rejected");
                return false;
            }
        }

        let mut guard = self.write();
        let st = &mut *guard;

        if st.active.get(key) == Some(&id) {
            record_attempt("already_active");
            return true;
        }

        let queue = st.pending.entry(key.clone()).or_insert_with(new_queue);
        queue.push(item.clone());

        if let Some(holder) = st.active.get(key) {
            debug!(stage = %key, promotion = %id, holder = %holder, "stage busy");
            record_attempt("contended");
            return false;
        }

        match queue.peek() {
            Some(head) if head.key() == id => {
                queue.pop();
                if queue.is_empty() {
                    st.pending.remove(key);
                }
                st.active.insert(key.clone(), id.clone());
                info!(stage = %key, promotion = %id, "promotion admitted");
                record_attempt("admitted");
                true
            }
            head => {
                debug!(
                    stage = %key,
                    promotion = %id,
                    head = ?head.map(|h| h.key()),
                    "promotion is not first in line"
                );
                record_attempt("contended");
                false
            }
        }
    }

    /// Release `key` if `id` holds it. Returns whether anything changed;
    /// calling it again for the same promotion is a no-op.
    pub fn conclude(&self, key: &StageKey, id: &PromotionKey) -> bool {
        let mut st = self.write();
        if st.active.get(key) != Some(id) {
            return false;
        }
        st.active.remove(key);
        drop(st);

        info!(stage = %key, promotion = %id, "stage released");
        metrics::admissions_concluded().add(1, &[]);
        true
    }

    /// The promotion currently holding `key`.
    pub fn active(&self, key: &StageKey) -> Option<PromotionKey> {
        self.read().active.get(key).cloned()
    }

    /// The first pending promotion for `key`, left in place.
    pub fn peek_pending(&self, key: &StageKey) -> Option<Promotion> {
        self.read().pending.get(key).and_then(|q| q.peek())
    }

    /// Drop the head of `key`'s queue, but only if it is still `id`.
    ///
    /// The caller looked at the head without holding the lock; if another
    /// thread moved the queue on in the meantime, nothing is removed.
    pub fn discard_pending(&self, key: &StageKey, id: &PromotionKey) -> bool {
        let mut guard = self.write();
        let st = &mut *guard;
        let Some(queue) = st.pending.get(key) else {
            return false;
        };
        if queue.peek().map(|h| h.key()).as_ref() != Some(id) {
            return false;
        }
        queue.pop();
        if queue.is_empty() {
            st.pending.remove(key);
        }
        true
    }

    /// The head of every pending queue whose stage is free.
    pub fn pending_heads(&self) -> Vec<Promotion> {
        let st = self.read();
        let mut heads: Vec<Promotion> = st
            .pending
            .iter()
            .filter(|(key, _)| !st.active.contains_key(*key))
            .filter_map(|(_, q)| q.peek())
            .collect();
        heads.sort_by(|a, b| a.key().cmp(&b.key()));
        heads
    }

    pub fn pending_depth(&self, key: &StageKey) -> usize {
        self.read().pending.get(key).map_or(0, |q| q.depth())
    }

    pub fn stats(&self) -> TrackerStats {
        self.read().stats()
    }

    fn read(&self) -> RwLockReadGuard<'_, TrackerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TrackerState {
    fn stats(&self) -> TrackerStats {
        TrackerStats {
            active: self.active.len(),
            pending: self.pending.values().map(|q| q.depth()).sum(),
        }
    }
}

fn record_attempt(result: &'static str) {
    metrics::admission_attempts().add(1, &[KeyValue::new("result", result)]);
}
