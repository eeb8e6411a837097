//! Metric instrument factories for loreforge.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"loreforge"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for loreforge instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("loreforge")
}

/// Counter: number of jobs enqueued.
/// Labels: `queue`, `result` ("ok" | "duplicate").
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("loreforge.jobs.enqueued")
        .with_description("Number of jobs enqueued")
        .build()
}

/// Counter: job state transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("loreforge.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: jobs that permanently failed.
/// Labels: `queue`, `kind` ("timed_out" | "exhausted" | "rejected" | "invalid_payload").
pub fn jobs_failed() -> Counter<u64> {
    meter()
        .u64_counter("loreforge.jobs.failed")
        .with_description("Number of jobs that permanently failed")
        .build()
}

/// Counter: queue-level operations (create, send, read, archive, delete).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("loreforge.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: external status checks by classified result.
/// Labels: `status` ("pending" | "succeeded" | "failed" | "error").
pub fn poll_checks() -> Counter<u64> {
    meter()
        .u64_counter("loreforge.poll.checks")
        .with_description("External operation status checks")
        .build()
}

/// Counter: notifications pushed to owner channels.
/// Labels: `kind`.
pub fn notifications_emitted() -> Counter<u64> {
    meter()
        .u64_counter("loreforge.notifications.emitted")
        .with_description("Notifications pushed to owner channels")
        .build()
}

/// Histogram: job execution duration in milliseconds.
/// Labels: `queue`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("loreforge.jobs.duration_ms")
        .with_description("Job execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
