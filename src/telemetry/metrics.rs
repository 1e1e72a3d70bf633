//! Metric instrument factories for stagegate.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"stagegate"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for stagegate instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("stagegate")
}

/// Counter: admission attempts.
/// Labels: `result` ("admitted" | "already_active" | "contended" | "rejected").
pub fn admission_attempts() -> Counter<u64> {
    meter()
        .u64_counter("stagegate.admission.attempts")
        .with_description("Number of admission attempts by outcome")
        .build()
}

/// Counter: stages released by a promotion concluding.
pub fn admissions_concluded() -> Counter<u64> {
    meter()
        .u64_counter("stagegate.admission.concluded")
        .with_description("Number of active promotions concluded")
        .build()
}

/// Counter: reconciliation requests submitted to the work queue.
/// Labels: `source` ("startup" | "watch" | "reconcile" | "resync" | "retry" | "external").
pub fn reconcile_submitted() -> Counter<u64> {
    meter()
        .u64_counter("stagegate.reconcile.submitted")
        .with_description("Number of reconciliation requests submitted")
        .build()
}

/// Counter: stale pending entries discarded during next-item selection.
pub fn pending_pruned() -> Counter<u64> {
    meter()
        .u64_counter("stagegate.pending.pruned")
        .with_description("Number of stale pending promotions discarded")
        .build()
}

/// Counter: promotion phase transitions.
/// Labels: `from`, `to`.
pub fn phase_transitions() -> Counter<u64> {
    meter()
        .u64_counter("stagegate.promotion.phase_transitions")
        .with_description("Number of promotion phase transitions")
        .build()
}

/// Histogram: promotion execution duration in milliseconds.
/// Labels: `phase` (final phase).
pub fn promotion_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("stagegate.promotion.duration_ms")
        .with_description("Promotion execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
