//! Integration tests for the reconciler, completion watch and controller,
//! against the in-memory store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use stagegate::error::{Error, Result};
use stagegate::executor::{Execution, PromotionExecutor};
use stagegate::model::{NewPromotion, Phase, Promotion, PromotionKey, StageKey};
use stagegate::scheduler::resync::{resync_once, spawn_resync};
use stagegate::scheduler::{
    CompletionWatchHandler, Controller, ControllerConfig, KeyedAdmissionTracker,
    ReconcileOutcome, Reconciler, WatchEvent, WorkQueue, WorkReceiver, enqueue_next,
};
use stagegate::store::{MemoryStore, PromotionStore};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn promo(stage: &str, name: &str, secs: i64) -> Promotion {
    Promotion::pending("ns", stage, name, Utc.timestamp_opt(secs, 0).unwrap())
}

fn key(name: &str) -> PromotionKey {
    PromotionKey::new("ns", name)
}

fn prod() -> StageKey {
    StageKey::new("ns", "prod")
}

/// Executor that records what ran and flags overlapping runs on a stage.
#[derive(Default)]
struct RecordingExecutor {
    running: Mutex<HashMap<String, usize>>,
    order: Mutex<Vec<String>>,
    overlaps: AtomicUsize,
    failing: HashSet<String>,
    delay: Duration,
}

impl RecordingExecutor {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }

    fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    fn leave(&self, stage: &str) {
        *self.running.lock().unwrap().entry(stage.to_string()).or_default() -= 1;
    }
}

#[async_trait]
impl PromotionExecutor for RecordingExecutor {
    async fn execute(&self, promotion: &Promotion, cancel: CancellationToken) -> Result<Execution> {
        {
            let mut running = self.running.lock().unwrap();
            let n = running.entry(promotion.stage.clone()).or_default();
            *n += 1;
            if *n > 1 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.leave(&promotion.stage);
                return Err(Error::Other("cancelled".to_string()));
            }
            _ = tokio::time::sleep(self.delay) => {}
        }

        self.leave(&promotion.stage);
        self.order.lock().unwrap().push(promotion.name.clone());
        if self.failing.contains(&promotion.name) {
            Ok(Execution::failed("step exploded", 1))
        } else {
            Ok(Execution::succeeded(1))
        }
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    tracker: Arc<KeyedAdmissionTracker>,
    queue: WorkQueue,
    receiver: WorkReceiver,
    reconciler: Arc<Reconciler>,
    executor: Arc<RecordingExecutor>,
    shutdown: CancellationToken,
}

fn harness(items: Vec<Promotion>, executor: RecordingExecutor) -> Harness {
    let store = Arc::new(MemoryStore::new());
    for item in items {
        store.insert(item);
    }
    let tracker = Arc::new(KeyedAdmissionTracker::new());
    let (queue, receiver) = WorkQueue::new();
    let executor = Arc::new(executor);
    let shutdown = CancellationToken::new();
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        executor.clone(),
        Arc::clone(&tracker),
        queue.clone(),
        Duration::from_secs(3600),
        shutdown.clone(),
    ));
    Harness {
        store,
        tracker,
        queue,
        receiver,
        reconciler,
        executor,
        shutdown,
    }
}

/// A `MemoryStore` with knobs for reads and change feeds that misbehave.
struct FlakyStore {
    inner: MemoryStore,
    /// Served once, in place of the real row, by the next `get` for its key.
    stale: Mutex<Option<Promotion>>,
    /// `get` for the promotion with this name always fails.
    broken: Option<String>,
    /// Unrelated changes published right after every terminal transition.
    burst: usize,
    noise: AtomicUsize,
}

impl FlakyStore {
    fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            stale: Mutex::new(None),
            broken: None,
            burst: 0,
            noise: AtomicUsize::new(0),
        }
    }

    fn serve_stale_once(&self, promotion: Promotion) {
        *self.stale.lock().unwrap() = Some(promotion);
    }
}

#[async_trait]
impl PromotionStore for FlakyStore {
    async fn list_non_terminal(&self) -> Result<Vec<Promotion>> {
        self.inner.list_non_terminal().await
    }

    async fn get(&self, key: &PromotionKey) -> Result<Option<Promotion>> {
        if self.broken.as_deref() == Some(key.name.as_str()) {
            return Err(Error::Other("store unavailable".to_string()));
        }
        {
            let mut stale = self.stale.lock().unwrap();
            if stale.as_ref().is_some_and(|p| &p.key() == key) {
                return Ok(stale.take());
            }
        }
        self.inner.get(key).await
    }

    async fn update_phase(
        &self,
        key: &PromotionKey,
        phase: Phase,
        message: Option<&str>,
    ) -> Result<Promotion> {
        let updated = self.inner.update_phase(key, phase, message).await?;
        if phase.is_terminal() {
            for _ in 0..self.burst {
                let n = self.noise.fetch_add(1, Ordering::SeqCst);
                self.inner.insert(Promotion {
                    phase: Phase::Succeeded,
                    ..promo("noise", &format!("noise-{n}"), 0)
                });
            }
        }
        Ok(updated)
    }

    async fn create(&self, new: NewPromotion) -> Result<Promotion> {
        self.inner.create(new).await
    }

    async fn delete(&self, key: &PromotionKey) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn subscribe(&self) -> Result<broadcast::Receiver<WatchEvent>> {
        self.inner.subscribe().await
    }
}

async fn phase_of(store: &MemoryStore, name: &str) -> Option<Phase> {
    store.get(&key(name)).await.unwrap().map(|p| p.phase)
}

// ---------------------------------------------------------------------------
// Next-item selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deleted_head_is_discarded_and_next_is_enqueued() {
    let mut h = harness(
        vec![promo("prod", "a", 1), promo("prod", "b", 2), promo("prod", "c", 3)],
        RecordingExecutor::default(),
    );
    h.tracker
        .initialize(h.store.list_non_terminal().await.unwrap())
        .unwrap();

    h.store.delete(&key("a")).await.unwrap();

    let next = enqueue_next(&h.tracker, h.store.as_ref(), &h.queue, &prod(), "watch")
        .await
        .unwrap();
    assert_eq!(next, Some(key("b")));
    assert_eq!(h.receiver.try_recv(), Some(key("b")));
    assert!(h.receiver.try_recv().is_none());
    assert_eq!(h.tracker.pending_depth(&prod()), 2);
}

#[tokio::test]
async fn finished_heads_are_discarded_until_a_live_one() {
    let mut h = harness(
        vec![promo("prod", "a", 1), promo("prod", "b", 2), promo("prod", "c", 3)],
        RecordingExecutor::default(),
    );
    h.tracker
        .initialize(h.store.list_non_terminal().await.unwrap())
        .unwrap();

    h.store
        .update_phase(&key("a"), Phase::Failed, Some("aborted"))
        .await
        .unwrap();
    h.store.delete(&key("b")).await.unwrap();

    let next = enqueue_next(&h.tracker, h.store.as_ref(), &h.queue, &prod(), "watch")
        .await
        .unwrap();
    assert_eq!(next, Some(key("c")));
    assert_eq!(h.receiver.try_recv(), Some(key("c")));
    assert_eq!(h.tracker.pending_depth(&prod()), 1);
}

#[tokio::test]
async fn nothing_is_enqueued_while_stage_is_held() {
    let mut h = harness(
        vec![promo("prod", "a", 1), promo("prod", "b", 2)],
        RecordingExecutor::default(),
    );
    h.tracker
        .initialize(h.store.list_non_terminal().await.unwrap())
        .unwrap();
    assert!(h.tracker.try_activate(&prod(), &promo("prod", "a", 1)));

    let next = enqueue_next(&h.tracker, h.store.as_ref(), &h.queue, &prod(), "watch")
        .await
        .unwrap();
    assert_eq!(next, None);
    assert!(h.receiver.try_recv().is_none());
}

#[tokio::test]
async fn completion_event_releases_stage_and_enqueues_next() {
    let mut h = harness(
        vec![promo("prod", "a", 1), promo("prod", "b", 2)],
        RecordingExecutor::default(),
    );
    h.tracker
        .initialize(h.store.list_non_terminal().await.unwrap())
        .unwrap();
    let a = promo("prod", "a", 1);
    assert!(h.tracker.try_activate(&prod(), &a));

    let watch = CompletionWatchHandler::new(
        Arc::clone(&h.tracker),
        h.store.clone(),
        h.queue.clone(),
    );

    // A non-terminal update changes nothing.
    let running = Promotion {
        phase: Phase::Running,
        ..a.clone()
    };
    watch
        .handle(WatchEvent::Updated {
            old: a.clone(),
            new: running.clone(),
        })
        .await;
    assert_eq!(h.tracker.active(&prod()), Some(key("a")));

    let done = Promotion {
        phase: Phase::Succeeded,
        ..a.clone()
    };
    watch
        .handle(WatchEvent::Updated {
            old: running,
            new: done.clone(),
        })
        .await;
    assert_eq!(h.tracker.active(&prod()), None);
    assert_eq!(h.receiver.try_recv(), Some(key("b")));

    // Seeing the same transition again leaves the tracker alone.
    watch
        .handle(WatchEvent::Updated {
            old: a,
            new: done,
        })
        .await;
    assert_eq!(h.tracker.active(&prod()), None);
    assert_eq!(h.tracker.pending_depth(&prod()), 1);
}

#[tokio::test]
async fn deleting_active_promotion_releases_stage() {
    let mut h = harness(
        vec![promo("prod", "a", 1), promo("prod", "b", 2)],
        RecordingExecutor::default(),
    );
    h.tracker
        .initialize(h.store.list_non_terminal().await.unwrap())
        .unwrap();
    let a = promo("prod", "a", 1);
    assert!(h.tracker.try_activate(&prod(), &a));

    let watch = CompletionWatchHandler::new(
        Arc::clone(&h.tracker),
        h.store.clone(),
        h.queue.clone(),
    );
    h.store.delete(&key("a")).await.unwrap();
    watch.handle(WatchEvent::Deleted { item: a }).await;

    assert_eq!(h.tracker.active(&prod()), None);
    assert_eq!(h.receiver.try_recv(), Some(key("b")));
}

#[tokio::test]
async fn resync_enqueues_only_free_stages() {
    let mut h = harness(
        vec![
            promo("prod", "a", 1),
            promo("prod", "b", 2),
            promo("qa", "q", 1),
            promo("dev", "d", 1),
        ],
        RecordingExecutor::default(),
    );
    h.tracker
        .initialize(h.store.list_non_terminal().await.unwrap())
        .unwrap();
    // qa is busy; dev's only entry has vanished.
    assert!(h.tracker.try_activate(&StageKey::new("ns", "qa"), &promo("qa", "q", 1)));
    h.store.delete(&key("d")).await.unwrap();

    let submitted = resync_once(&h.tracker, h.store.as_ref(), &h.queue).await;
    assert_eq!(submitted, 1);
    assert_eq!(h.receiver.try_recv(), Some(key("a")));
    assert!(h.receiver.try_recv().is_none());
    assert_eq!(h.tracker.pending_depth(&StageKey::new("ns", "dev")), 0);
}

#[tokio::test]
async fn resync_loop_recovers_stage_whose_completion_was_missed() {
    let mut h = harness(
        vec![promo("prod", "a", 1), promo("prod", "b", 2)],
        RecordingExecutor::default(),
    );
    h.tracker
        .initialize(h.store.list_non_terminal().await.unwrap())
        .unwrap();

    // a ran and finished, but nothing handed the stage on to b.
    assert!(h.tracker.try_activate(&prod(), &promo("prod", "a", 1)));
    h.store.update_phase(&key("a"), Phase::Running, None).await.unwrap();
    h.store.update_phase(&key("a"), Phase::Succeeded, None).await.unwrap();
    assert!(h.tracker.conclude(&prod(), &key("a")));

    let cancel = CancellationToken::new();
    let handle = spawn_resync(
        Arc::clone(&h.tracker),
        h.store.clone(),
        h.queue.clone(),
        Duration::from_millis(200),
        cancel.clone(),
    );

    // The immediate first tick is skipped.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.receiver.try_recv().is_none());

    let next = tokio::time::timeout(Duration::from_secs(2), h.receiver.recv())
        .await
        .expect("resync never submitted the stalled stage");
    assert_eq!(next, Some(key("b")));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("resync loop did not stop on cancellation")
        .unwrap();
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconcile_admits_oldest_first_and_records_outcome() {
    let h = harness(
        vec![promo("prod", "a", 1), promo("prod", "b", 2)],
        RecordingExecutor::default(),
    );

    let b = h
        .reconciler
        .reconcile(&key("b"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(b, ReconcileOutcome::Queued);
    assert_eq!(phase_of(&h.store, "b").await, Some(Phase::Pending));

    let a = h
        .reconciler
        .reconcile(&key("a"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(a, ReconcileOutcome::Completed(Phase::Succeeded));
    assert_eq!(phase_of(&h.store, "a").await, Some(Phase::Succeeded));
    assert_eq!(h.tracker.active(&prod()), None);

    let b = h
        .reconciler
        .reconcile(&key("b"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(b, ReconcileOutcome::Completed(Phase::Succeeded));
    assert_eq!(h.executor.order(), vec!["a", "b"]);
    h.shutdown.cancel();
    h.reconciler.join_resync().await;
}

#[tokio::test]
async fn executor_failure_fails_promotion_and_frees_stage() {
    let h = harness(
        vec![promo("prod", "a", 1), promo("prod", "b", 2)],
        RecordingExecutor::failing(&["a"]),
    );

    let a = h
        .reconciler
        .reconcile(&key("a"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(a, ReconcileOutcome::Completed(Phase::Failed));

    let stored = h.store.get(&key("a")).await.unwrap().unwrap();
    assert_eq!(stored.phase, Phase::Failed);
    assert_eq!(stored.message.as_deref(), Some("step exploded"));
    assert_eq!(h.tracker.active(&prod()), None);

    let b = h
        .reconciler
        .reconcile(&key("b"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(b, ReconcileOutcome::Completed(Phase::Succeeded));
    h.shutdown.cancel();
}

#[tokio::test]
async fn cancelled_before_start_is_never_marked_running() {
    let mut h = harness(
        vec![promo("prod", "a", 1), promo("prod", "b", 2)],
        RecordingExecutor::default(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let a = h.reconciler.reconcile(&key("a"), cancel).await.unwrap();
    assert_eq!(a, ReconcileOutcome::Cancelled);
    assert_eq!(phase_of(&h.store, "a").await, Some(Phase::Pending));
    assert_eq!(h.tracker.active(&prod()), None);
    assert!(h.executor.order().is_empty());
    // The stage was handed on rather than left idle.
    assert_eq!(h.receiver.try_recv(), Some(key("b")));
    h.shutdown.cancel();
}

#[tokio::test]
async fn running_promotion_survives_restart_and_is_driven_to_completion() {
    let running = Promotion {
        phase: Phase::Running,
        ..promo("prod", "r", 10)
    };
    let h = harness(
        vec![running, promo("prod", "p", 1)],
        RecordingExecutor::default(),
    );

    // p is older, but r was already running before the restart.
    let p = h
        .reconciler
        .reconcile(&key("p"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(p, ReconcileOutcome::Queued);
    assert_eq!(h.tracker.active(&prod()), Some(key("r")));

    let r = h
        .reconciler
        .reconcile(&key("r"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(r, ReconcileOutcome::Completed(Phase::Succeeded));
    assert_eq!(phase_of(&h.store, "r").await, Some(Phase::Succeeded));
    h.shutdown.cancel();
}

#[tokio::test]
async fn missing_or_finished_promotions_are_skipped() {
    let done = Promotion {
        phase: Phase::Succeeded,
        ..promo("prod", "done", 1)
    };
    let h = harness(vec![done], RecordingExecutor::default());

    for name in ["done", "ghost"] {
        let outcome = h
            .reconciler
            .reconcile(&key(name), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Skipped);
    }
    assert!(h.executor.order().is_empty());
    h.shutdown.cancel();
}

#[tokio::test]
async fn duplicate_request_for_running_promotion_does_not_run_it_twice() {
    let h = harness(
        vec![promo("prod", "a", 1)],
        RecordingExecutor::with_delay(Duration::from_millis(200)),
    );

    let reconciler = Arc::clone(&h.reconciler);
    let first = tokio::spawn(async move {
        reconciler
            .reconcile(&key("a"), CancellationToken::new())
            .await
            .unwrap()
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = h
        .reconciler
        .reconcile(&key("a"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second, ReconcileOutcome::Skipped);
    assert_eq!(
        first.await.unwrap(),
        ReconcileOutcome::Completed(Phase::Succeeded)
    );
    assert_eq!(h.executor.order(), vec!["a"]);
    assert_eq!(h.executor.overlaps.load(Ordering::SeqCst), 0);
    h.shutdown.cancel();
}

#[tokio::test]
async fn concurrent_first_reconciles_initialize_once() {
    let h = harness(
        vec![promo("prod", "a", 1), promo("prod", "b", 2), promo("prod", "c", 3)],
        RecordingExecutor::with_delay(Duration::from_millis(20)),
    );

    let handles: Vec<_> = ["c", "b", "a"]
        .into_iter()
        .map(|name| {
            let reconciler = Arc::clone(&h.reconciler);
            tokio::spawn(async move {
                reconciler
                    .reconcile(&key(name), CancellationToken::new())
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }
    // Whatever order they ran in, only a could be admitted.
    assert_eq!(
        outcomes,
        vec![
            ReconcileOutcome::Queued,
            ReconcileOutcome::Queued,
            ReconcileOutcome::Completed(Phase::Succeeded),
        ]
    );
    assert!(h.tracker.is_initialized());
    h.shutdown.cancel();
}

struct Parts {
    store: Arc<FlakyStore>,
    tracker: Arc<KeyedAdmissionTracker>,
    receiver: WorkReceiver,
    reconciler: Reconciler,
    executor: Arc<RecordingExecutor>,
    shutdown: CancellationToken,
}

fn over_flaky_store(items: Vec<Promotion>) -> Parts {
    let inner = MemoryStore::new();
    for item in items {
        inner.insert(item);
    }
    let store = Arc::new(FlakyStore::new(inner));
    let tracker = Arc::new(KeyedAdmissionTracker::new());
    let (queue, receiver) = WorkQueue::new();
    let executor = Arc::new(RecordingExecutor::default());
    let shutdown = CancellationToken::new();
    let reconciler = Reconciler::new(
        store.clone(),
        executor.clone(),
        Arc::clone(&tracker),
        queue,
        Duration::from_secs(3600),
        shutdown.clone(),
    );
    Parts {
        store,
        tracker,
        receiver,
        reconciler,
        executor,
        shutdown,
    }
}

#[tokio::test]
async fn stale_read_of_finished_promotion_does_not_run_it_again() {
    let mut p = over_flaky_store(vec![promo("prod", "a", 1), promo("prod", "b", 2)]);

    let first = p
        .reconciler
        .reconcile(&key("a"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first, ReconcileOutcome::Completed(Phase::Succeeded));

    // A lagging read still reports a as running.
    let finished = p.store.get(&key("a")).await.unwrap().unwrap();
    p.store.serve_stale_once(Promotion {
        phase: Phase::Running,
        finished_at: None,
        ..finished
    });

    let second = p
        .reconciler
        .reconcile(&key("a"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second, ReconcileOutcome::Skipped);
    assert_eq!(p.executor.order(), vec!["a"]);
    assert_eq!(p.tracker.active(&prod()), None);
    // The stage was handed on, not left blocked.
    assert_eq!(p.receiver.try_recv(), Some(key("b")));
    p.shutdown.cancel();
}

#[tokio::test]
async fn finished_holder_seen_through_stale_read_releases_stage() {
    let running = Promotion {
        phase: Phase::Running,
        ..promo("prod", "a", 1)
    };
    let mut p = over_flaky_store(vec![running.clone(), promo("prod", "b", 2)]);
    p.reconciler.ensure_initialized().await.unwrap();
    assert_eq!(p.tracker.active(&prod()), Some(key("a")));

    // a finishes behind the scheduler's back; its event is never seen.
    p.store
        .update_phase(&key("a"), Phase::Succeeded, None)
        .await
        .unwrap();
    p.store.serve_stale_once(running);

    let outcome = p
        .reconciler
        .reconcile(&key("a"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Skipped);
    assert!(p.executor.order().is_empty());
    assert_eq!(p.tracker.active(&prod()), None);
    assert_eq!(p.receiver.try_recv(), Some(key("b")));
    p.shutdown.cancel();
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

async fn wait_for_drain(store: &MemoryStore) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if store.list_non_terminal().await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("promotions did not all finish");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn controller_runs_each_stage_serially_in_priority_order() {
    let store = Arc::new(MemoryStore::new());
    for p in [
        promo("prod", "c", 3),
        promo("prod", "a", 1),
        promo("qa", "q1", 1),
        promo("prod", "b", 1),
        promo("qa", "q2", 2),
    ] {
        store.insert(p);
    }
    let executor = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(20)));

    let controller = Arc::new(Controller::new(
        store.clone(),
        executor.clone(),
        ControllerConfig {
            resync_interval: Duration::from_millis(50),
            max_concurrent_reconciles: 8,
            retry_backoff: Duration::from_millis(20),
        },
    ));
    let ctrl = Arc::clone(&controller);
    let run = tokio::spawn(async move { ctrl.run().await });

    wait_for_drain(&store).await;

    let prod_order: Vec<String> = executor
        .order()
        .into_iter()
        .filter(|n| !n.starts_with('q'))
        .collect();
    assert_eq!(prod_order, vec!["a", "b", "c"]);
    let qa_order: Vec<String> = executor
        .order()
        .into_iter()
        .filter(|n| n.starts_with('q'))
        .collect();
    assert_eq!(qa_order, vec!["q1", "q2"]);
    assert_eq!(executor.overlaps.load(Ordering::SeqCst), 0);

    controller.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn controller_picks_up_promotions_created_while_running() {
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(10)));
    let controller = Arc::new(Controller::new(
        store.clone(),
        executor.clone(),
        ControllerConfig {
            resync_interval: Duration::from_millis(50),
            ..ControllerConfig::default()
        },
    ));
    let ctrl = Arc::clone(&controller);
    let run = tokio::spawn(async move { ctrl.run().await });

    // Give the controller a moment to subscribe.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for (name, secs) in [("x", 1), ("y", 2)] {
        store.insert(promo("prod", name, secs));
    }

    wait_for_drain(&store).await;
    assert_eq!(executor.order().len(), 2);
    assert_eq!(executor.overlaps.load(Ordering::SeqCst), 0);

    controller.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn controller_cannot_run_twice() {
    let store = Arc::new(MemoryStore::new());
    let controller = Arc::new(Controller::new(
        store,
        Arc::new(RecordingExecutor::default()),
        ControllerConfig::default(),
    ));
    let ctrl = Arc::clone(&controller);
    let first = tokio::spawn(async move { ctrl.run().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(controller.run().await.is_err());

    controller.shutdown();
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn lagged_watch_stream_triggers_an_immediate_resync() {
    // Two unread changes are all the feed holds; every completion is
    // followed by a burst of unrelated ones, so its event is lost.
    let inner = MemoryStore::with_capacity(2);
    for p in [promo("prod", "a", 1), promo("prod", "b", 2)] {
        inner.insert(p);
    }
    let store = Arc::new(FlakyStore {
        burst: 8,
        ..FlakyStore::new(inner)
    });
    let executor = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(20)));

    // The periodic resync never fires within the test.
    let controller = Arc::new(Controller::new(
        store.clone(),
        executor.clone(),
        ControllerConfig {
            resync_interval: Duration::from_secs(3600),
            max_concurrent_reconciles: 4,
            retry_backoff: Duration::from_secs(3600),
        },
    ));
    let ctrl = Arc::clone(&controller);
    let run = tokio::spawn(async move { ctrl.run().await });

    wait_for_drain(&store.inner).await;
    assert_eq!(executor.order(), vec!["a", "b"]);

    controller.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn failing_reconcile_does_not_hold_a_slot_while_backing_off() {
    let inner = MemoryStore::new();
    inner.insert(promo("qa", "bad", 1));
    inner.insert(promo("prod", "ok", 1));
    let store = Arc::new(FlakyStore {
        broken: Some("bad".to_string()),
        ..FlakyStore::new(inner)
    });
    let executor = Arc::new(RecordingExecutor::default());

    // One slot, and "bad" (queued first) fails and backs off for a long time.
    let controller = Arc::new(Controller::new(
        store.clone(),
        executor.clone(),
        ControllerConfig {
            resync_interval: Duration::from_secs(3600),
            max_concurrent_reconciles: 1,
            retry_backoff: Duration::from_secs(3600),
        },
    ));
    let ctrl = Arc::clone(&controller);
    let run = tokio::spawn(async move { ctrl.run().await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while phase_of(&store.inner, "ok").await != Some(Phase::Succeeded) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("ok was starved by a backing-off reconcile");
    assert_eq!(executor.order(), vec!["ok"]);

    controller.shutdown();
    run.await.unwrap().unwrap();
}
