//! # stagegate
//!
//! Admission scheduler for GitOps promotions.
//!
//! Promotions move a stage to a new piece of freight. Promotions for the
//! same stage never run concurrently: per stage, one is active and the rest
//! wait in a priority queue (oldest first). A completion watch hands the
//! stage to the next promotion, and a periodic resync recovers from missed
//! events.

pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod model;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod telemetry;
