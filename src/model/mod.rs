//! Core data model.
//!
//! A promotion asks for a stage to move to a new piece of freight. Promotions
//! for the same stage are mutually exclusive at execution time; the stage is
//! the scheduling key.

pub mod priority;
pub mod promotion;

pub use priority::higher_priority;
pub use promotion::{NewPromotion, Phase, Promotion, PromotionKey, StageKey};

use std::hash::Hash;

/// Anything with a stable identity that a [`PriorityQueue`] can deduplicate on.
///
/// [`PriorityQueue`]: crate::queue::PriorityQueue
pub trait Identified {
    type Id: Clone + Eq + Hash + std::fmt::Debug;

    fn identity(&self) -> Self::Id;
}
