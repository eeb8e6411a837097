//! The durable queue abstraction.
//!
//! Queues are explicitly constructed, injected values — never module-level
//! singletons. [`crate::db::queue::PgQueue`] is the production backend;
//! [`mem::MemQueue`] backs deterministic tests and local development.

pub mod mem;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Result;
use crate::model::{Job, JobId, NewJob, RepeatableJob};

/// What happened when a job was enqueued.
#[derive(Debug)]
pub enum EnqueueResult {
    /// New job created and queued.
    Created(Job),
    /// A job with the same dedupe id is already scheduled-but-not-finished
    /// on this queue; the enqueue was ignored.
    Deduplicated { existing: JobId },
}

/// A named, typed channel of durable work items.
///
/// Claim semantics guarantee that a job id is never concurrently active
/// twice. No cross-job ordering is guaranteed; retries and delays reorder
/// freely.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue a job. If the builder carries a dedupe id and a
    /// scheduled-but-not-finished job with that id exists on the same queue,
    /// the enqueue is ignored and the existing id returned.
    async fn enqueue(&self, new: NewJob) -> Result<EnqueueResult>;

    /// Claim the next due job on `queue_name`, transitioning it to active
    /// and incrementing its attempt count. `None` when nothing is claimable.
    async fn claim(&self, queue_name: &str) -> Result<Option<Job>>;

    /// Retire an active job as completed, recording its outcome. Removes the
    /// record when `remove_on_complete` is set.
    async fn complete(&self, id: JobId, outcome: Option<serde_json::Value>) -> Result<()>;

    /// Put an active job back for another attempt after `delay`. `note` is
    /// recorded as the job's last error/progress marker.
    async fn reschedule(&self, id: JobId, delay: Duration, note: Option<String>) -> Result<()>;

    /// Retire an active job as permanently failed. Removes the record when
    /// `remove_on_fail` is set.
    async fn fail(&self, id: JobId, error: &str) -> Result<()>;

    /// Fetch a job by id.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Find the most recent job with the given dedupe id on a queue, in any
    /// state. Used by run-exactly-once registration, which is why terminal
    /// jobs count.
    async fn find_by_dedupe(&self, queue_name: &str, dedupe_id: &str) -> Result<Option<Job>>;

    /// Replace a job's payload in place. Poll handlers use this to record
    /// the external job id and the last observed status between attempts.
    async fn update_payload(&self, id: JobId, payload: serde_json::Value) -> Result<()>;

    /// Add a repeatable registration. Returns false if a registration with
    /// the same job id already exists (no-op, not an error).
    async fn add_repeatable(&self, registration: RepeatableJob) -> Result<bool>;

    /// All current repeatable registrations.
    async fn list_repeatable(&self) -> Result<Vec<RepeatableJob>>;

    /// Advance a repeatable's next fire time from `expected_next` to `next`.
    /// Returns false when another scheduler already advanced it — the caller
    /// lost the claim for this tick and must not enqueue.
    async fn advance_repeatable(
        &self,
        job_id: &str,
        expected_next: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool>;

    /// Wait until work may be available on `queue_name`, or until `timeout`.
    /// Wakeups may be spurious; callers re-check by claiming.
    async fn wait_ready(&self, queue_name: &str, timeout: Duration);
}
