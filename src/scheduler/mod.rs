//! Admission scheduling: at most one running promotion per stage, admitted
//! in priority order.

pub mod controller;
pub mod reconciler;
pub mod resync;
pub mod tracker;
pub mod watch;
pub mod work_queue;

pub use controller::{Controller, ControllerConfig};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use tracker::{KeyedAdmissionTracker, TrackerStats};
pub use watch::{CompletionWatchHandler, WatchEvent, enqueue_next};
pub use work_queue::{WorkQueue, WorkReceiver};
