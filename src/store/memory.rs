//! In-process promotion store.
//!
//! Backs the test suite. Change notifications go out on a
//! broadcast channel, mirroring what the Postgres store does with
//! LISTEN/NOTIFY.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::broadcast;

use super::{PromotionStore, WatchEvent};
use crate::error::{Error, Result};
use crate::model::{NewPromotion, Phase, Promotion, PromotionKey};
use crate::telemetry::metrics;

const EVENT_CAPACITY: usize = 1024;

pub struct MemoryStore {
    items: RwLock<HashMap<PromotionKey, Promotion>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }

    /// A store whose subscribers lag once more than `capacity` changes are
    /// unread.
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            items: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Store `promotion` as-is, replacing any promotion with the same key.
    ///
    /// Unlike [`PromotionStore::create`] this keeps the caller's phase and
    /// timestamps, which is how tests stage a backlog.
    pub fn insert(&self, promotion: Promotion) {
        let previous = self
            .items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(promotion.key(), promotion.clone());
        let event = match previous {
            Some(old) => WatchEvent::Updated {
                old,
                new: promotion,
            },
            None => WatchEvent::Created { item: promotion },
        };
        self.publish(event);
    }

    pub fn len(&self) -> usize {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, event: WatchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PromotionStore for MemoryStore {
    async fn list_non_terminal(&self) -> Result<Vec<Promotion>> {
        let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<Promotion> = items.values().filter(|p| !p.is_terminal()).cloned().collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(out)
    }

    async fn get(&self, key: &PromotionKey) -> Result<Option<Promotion>> {
        Ok(self
            .items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn update_phase(
        &self,
        key: &PromotionKey,
        phase: Phase,
        message: Option<&str>,
    ) -> Result<Promotion> {
        let (old, new) = {
            let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
            let current = items
                .get_mut(key)
                .ok_or_else(|| Error::NotFound(format!("promotion {key}")))?;
            if !current.phase.can_transition_to(phase) {
                return Err(Error::InvalidTransition {
                    from: current.phase.to_string(),
                    to: phase.to_string(),
                });
            }
            let old = current.clone();
            let now = Utc::now();
            current.phase = phase;
            current.message = message.map(str::to_string);
            current.updated_at = now;
            if phase.is_terminal() {
                current.finished_at = Some(now);
            }
            (old, current.clone())
        };

        metrics::phase_transitions().add(
            1,
            &[
                KeyValue::new("from", old.phase.to_string()),
                KeyValue::new("to", phase.to_string()),
            ],
        );
        self.publish(WatchEvent::Updated {
            old,
            new: new.clone(),
        });
        Ok(new)
    }

    async fn create(&self, new: NewPromotion) -> Result<Promotion> {
        let promotion = new.into_promotion(Utc::now())?;
        {
            let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
            let key = promotion.key();
            if items.contains_key(&key) {
                return Err(Error::InvalidArgument(format!(
                    "promotion {key} already exists"
                )));
            }
            items.insert(key, promotion.clone());
        }
        self.publish(WatchEvent::Created {
            item: promotion.clone(),
        });
        Ok(promotion)
    }

    async fn delete(&self, key: &PromotionKey) -> Result<bool> {
        let removed = self
            .items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match removed {
            Some(item) => {
                self.publish(WatchEvent::Deleted { item });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn subscribe(&self) -> Result<broadcast::Receiver<WatchEvent>> {
        Ok(self.events.subscribe())
    }
}
