//! Admission order for promotions within a stage.

use super::promotion::Promotion;

/// Returns true iff `a` strictly outranks `b`.
///
/// Older promotions go first; promotions created at the same instant are
/// ordered by name so the order is total and deterministic.
pub fn higher_priority(a: &Promotion, b: &Promotion) -> bool {
    match a.created_at.cmp(&b.created_at) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => a.name < b.name,
    }
}
