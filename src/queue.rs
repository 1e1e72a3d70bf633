//! Thread-safe, deduplicating priority queue.
//!
//! A binary heap ordered by a caller-supplied "outranks" predicate. Items are
//! deduplicated on [`Identified::identity`], with a hash index so the check
//! does not scan the heap.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::model::Identified;

/// `higher_priority(a, b)` returns true iff `a` strictly outranks `b`.
///
/// Must be a total, irreflexive order.
pub type HigherPriorityFn<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

pub struct PriorityQueue<T: Identified> {
    higher_priority: HigherPriorityFn<T>,
    inner: Mutex<Heap<T>>,
}

struct Heap<T: Identified> {
    items: Vec<T>,
    ids: HashSet<T::Id>,
}

impl<T> PriorityQueue<T>
where
    T: Identified + Clone + 'static,
{
    /// Create a queue ordered by `higher_priority`, seeded with `initial`.
    pub fn new<F>(higher_priority: F, initial: impl IntoIterator<Item = T>) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let queue = Self {
            higher_priority: Box::new(higher_priority),
            inner: Mutex::new(Heap {
                items: Vec::new(),
                ids: HashSet::new(),
            }),
        };
        for item in initial {
            queue.push(item);
        }
        queue
    }

    /// Like [`PriorityQueue::new`], for callers whose ordering function is
    /// only known at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if no ordering function is given.
    pub fn try_new(
        higher_priority: Option<HigherPriorityFn<T>>,
        initial: impl IntoIterator<Item = T>,
    ) -> Result<Self> {
        let higher_priority = higher_priority.ok_or_else(|| {
            Error::InvalidArgument("priority queue needs an ordering function".to_string())
        })?;
        Ok(Self::new(higher_priority, initial))
    }

    /// Insert a copy of `item`. Returns false, leaving the queue untouched,
    /// if an item with the same identity is already queued.
    pub fn push(&self, item: T) -> bool {
        let mut heap = self.lock();
        if !heap.ids.insert(item.identity()) {
            return false;
        }
        heap.items.push(item);
        let last = heap.items.len() - 1;
        self.sift_up(&mut heap.items, last);
        true
    }

    /// Remove and return the highest-priority item.
    pub fn pop(&self) -> Option<T> {
        let mut heap = self.lock();
        if heap.items.is_empty() {
            return None;
        }
        let top = heap.items.swap_remove(0);
        if !heap.items.is_empty() {
            self.sift_down(&mut heap.items, 0);
        }
        heap.ids.remove(&top.identity());
        Some(top)
    }

    /// The highest-priority item, left in place.
    pub fn peek(&self) -> Option<T> {
        self.lock().items.first().cloned()
    }

    pub fn depth(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    pub fn contains(&self, id: &T::Id) -> bool {
        self.lock().ids.contains(id)
    }

    fn lock(&self) -> MutexGuard<'_, Heap<T>> {
        // Every mutation leaves the heap valid before it can panic.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sift_up(&self, items: &mut [T], mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !(self.higher_priority)(&items[idx], &items[parent]) {
                break;
            }
            items.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&self, items: &mut [T], mut idx: usize) {
        let len = items.len();
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut best = idx;
            if left < len && (self.higher_priority)(&items[left], &items[best]) {
                best = left;
            }
            if right < len && (self.higher_priority)(&items[right], &items[best]) {
                best = right;
            }
            if best == idx {
                return;
            }
            items.swap(idx, best);
            idx = best;
        }
    }
}

impl<T: Identified> std::fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let depth = self
            .inner
            .lock()
            .map(|h| h.items.len())
            .unwrap_or_else(|e| e.into_inner().items.len());
        f.debug_struct("PriorityQueue").field("depth", &depth).finish()
    }
}
