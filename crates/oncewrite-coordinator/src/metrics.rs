//! Coordinator metrics.
//!
//! These complement the structured logging emitted at every resolution decision.

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Idempotency Metrics
// ============================================================================

/// Resolution outcomes, labelled by operation and outcome.
pub const IDEMPOTENCY_CHECK: &str = "oncewrite_idempotency_check_total";

/// Reclamation attempts of stale or failed entries, labelled by operation and result.
pub const IDEMPOTENCY_RECLAIM: &str = "oncewrite_idempotency_reclaim_total";

/// Duration of guarded work, labelled by operation and result.
pub const WORK_DURATION: &str = "oncewrite_work_duration_seconds";

// ============================================================================
// Store Metrics
// ============================================================================

/// Key store calls retried after a transient failure.
pub const STORE_RETRY: &str = "oncewrite_store_retry_total";

/// Registers all coordinator metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(IDEMPOTENCY_CHECK, "Idempotency resolution outcomes");
    describe_counter!(
        IDEMPOTENCY_RECLAIM,
        "Reclamations of stale in-progress or failed idempotency entries"
    );
    describe_histogram!(WORK_DURATION, "Duration of guarded work in seconds");
    describe_counter!(STORE_RETRY, "Key store calls retried after transient failures");
}

/// Records the outcome of an idempotency check.
///
/// Outcomes: `no_key`, `proceed`, `replay`, `conflict`, `in_progress`.
pub fn record_idempotency_check(operation: &str, outcome: &'static str) {
    counter!(
        IDEMPOTENCY_CHECK,
        "operation" => operation.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Records a reclamation attempt (`success`, `race_detected`, `vanished`).
pub fn record_idempotency_reclaim(operation: &str, result: &'static str) {
    counter!(
        IDEMPOTENCY_RECLAIM,
        "operation" => operation.to_string(),
        "result" => result
    )
    .increment(1);
}

/// Records the duration of a unit of guarded work.
pub fn record_work_duration(operation: &str, result: &'static str, duration_secs: f64) {
    histogram!(
        WORK_DURATION,
        "operation" => operation.to_string(),
        "result" => result
    )
    .record(duration_secs);
}

/// Records a key store retry.
pub fn record_store_retry(op: &'static str) {
    counter!(STORE_RETRY, "op" => op).increment(1);
}
