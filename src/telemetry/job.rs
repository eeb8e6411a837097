//! Job execution span helpers.
//!
//! Provides span creation and state-transition recording for jobs flowing
//! through a worker.

use tracing::Span;

use crate::model::JobId;

/// Start a span for job execution.
///
/// The `job.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_job_span(queue: &str, job_id: &JobId) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.queue" = queue,
        "job.id" = %job_id,
        "job.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the current span.
///
/// Emits a tracing `info` event scoped to the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
