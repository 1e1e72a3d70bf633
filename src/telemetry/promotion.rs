//! Promotion execution span helpers.

use tracing::Span;

use crate::model::Promotion;

/// Start a span covering one reconciliation of a promotion.
///
/// `promotion.phase` is declared empty and filled in by
/// [`record_phase_transition`].
pub fn start_promotion_span(promotion: &Promotion) -> Span {
    tracing::info_span!(
        "promotion.reconcile",
        "promotion.namespace" = %promotion.namespace,
        "promotion.name" = %promotion.name,
        "promotion.stage" = %promotion.stage,
        "promotion.freight" = %promotion.freight,
        "promotion.phase" = tracing::field::Empty,
    )
}

/// Record a phase transition on the given span.
pub fn record_phase_transition(span: &Span, from: &str, to: &str) {
    span.record("promotion.phase", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "phase_transition");
    });
}
