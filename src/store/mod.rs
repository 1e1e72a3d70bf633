//! The durable store promotions live in, as seen by the scheduler.
//!
//! The scheduler never owns promotions: it lists them once at startup,
//! re-fetches them to check staleness, records phase changes, and follows
//! a stream of change notifications.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::model::{NewPromotion, Phase, Promotion, PromotionKey};

/// A change observed in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    Created { item: Promotion },
    Updated { old: Promotion, new: Promotion },
    Deleted { item: Promotion },
}

impl WatchEvent {
    /// The promotion as it is after the change (or was, for deletions).
    pub fn promotion(&self) -> &Promotion {
        match self {
            WatchEvent::Created { item } | WatchEvent::Deleted { item } => item,
            WatchEvent::Updated { new, .. } => new,
        }
    }
}

#[async_trait]
pub trait PromotionStore: Send + Sync {
    /// Every promotion that is not yet `Succeeded` or `Failed`.
    async fn list_non_terminal(&self) -> Result<Vec<Promotion>>;

    /// Current state of a promotion, `None` if it no longer exists.
    async fn get(&self, key: &PromotionKey) -> Result<Option<Promotion>>;

    /// Move a promotion to `phase`, recording `message` alongside it.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` if the promotion is gone, `Error::InvalidTransition`
    /// if its current phase cannot move to `phase`.
    async fn update_phase(
        &self,
        key: &PromotionKey,
        phase: Phase,
        message: Option<&str>,
    ) -> Result<Promotion>;

    /// Store a new `Pending` promotion.
    async fn create(&self, new: NewPromotion) -> Result<Promotion>;

    /// Remove a promotion. Returns false if it did not exist.
    async fn delete(&self, key: &PromotionKey) -> Result<bool>;

    /// Subscribe to change notifications from this point on.
    async fn subscribe(&self) -> Result<broadcast::Receiver<WatchEvent>>;
}
