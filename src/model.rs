//! Core data model.
//!
//! A job is one unit of queued work: a payload, retry options, and a
//! lifecycle state. The engine doesn't interpret payloads; each worker
//! deserializes them into its own typed representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::retry::Backoff;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work tracked by a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at enqueue.
    pub id: JobId,

    /// The logical channel this job belongs to. Determines which worker
    /// handles it.
    pub queue_name: String,

    /// Arbitrary payload for the worker. The engine doesn't interpret this.
    pub payload: serde_json::Value,

    /// Retry, dedupe, and cleanup options fixed at enqueue.
    pub options: JobOptions,

    /// Number of execution attempts so far. Incremented on every claim.
    pub attempts_made: u32,

    /// Current lifecycle state.
    pub state: State,

    /// Error or progress note from the most recent attempt.
    pub last_error: Option<String>,

    /// Result data recorded on completion. Opaque to the engine.
    pub outcome: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Ready for execution, waiting for a worker.
    Waiting,
    /// A worker is executing this attempt.
    Active,
    /// Waiting out a backoff or enqueue delay before becoming claimable.
    Delayed,
    /// Done successfully. Terminal.
    Completed,
    /// Permanently failed: retries exhausted, timed out, or discarded. Terminal.
    Failed,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Waiting, Active)
                | (Delayed, Waiting) // backoff elapsed
                | (Delayed, Active)  // claimed directly once due
                | (Active, Completed)
                | (Active, Delayed)  // retryable failure or still pending
                | (Active, Failed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Waiting => "waiting",
            State::Active => "active",
            State::Delayed => "delayed",
            State::Completed => "completed",
            State::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for State {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(State::Waiting),
            "active" => Ok(State::Active),
            "delayed" => Ok(State::Delayed),
            "completed" => Ok(State::Completed),
            "failed" => Ok(State::Failed),
            other => Err(crate::error::Error::Other(format!(
                "unknown job state: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-job options fixed at enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Maximum execution attempts before the job goes failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay strategy between attempts.
    #[serde(default)]
    pub backoff: Backoff,

    /// Remove the job record as soon as it completes.
    #[serde(default)]
    pub remove_on_complete: bool,

    /// Remove the job record as soon as it permanently fails.
    #[serde(default)]
    pub remove_on_fail: bool,

    /// Caller-assigned identity. While a job with this id is
    /// scheduled-but-not-yet-finished on the same queue, enqueues with the
    /// same id are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_id: Option<String>,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
            remove_on_complete: false,
            remove_on_fail: false,
            dedupe_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Repeatable registration
// ---------------------------------------------------------------------------

/// A recurring job registration. Fired by the scheduler each time the cron
/// expression matches; registration is idempotent by `job_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatableJob {
    /// Caller-assigned identity (e.g. "trial-expiration-sweep").
    pub job_id: String,
    pub queue_name: String,
    /// Cron expression, `sec min hour dom month dow` form.
    pub cron: String,
    pub payload: serde_json::Value,
    /// Next time this registration fires.
    pub next_run_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for enqueueing jobs. The queue's public API for producers.
pub struct NewJob {
    pub(crate) queue_name: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) options: JobOptions,
    pub(crate) delay: Option<Duration>,
}

impl NewJob {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            payload: serde_json::Value::Null,
            options: JobOptions::default(),
            delay: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.options.max_attempts = n.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.options.backoff = backoff;
        self
    }

    pub fn dedupe_id(mut self, id: impl Into<String>) -> Self {
        self.options.dedupe_id = Some(id.into());
        self
    }

    /// Delay before the job first becomes claimable.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn remove_on_complete(mut self) -> Self {
        self.options.remove_on_complete = true;
        self
    }

    pub fn remove_on_fail(mut self) -> Self {
        self.options.remove_on_fail = true;
        self
    }
}
