//! In-memory queue backend.
//!
//! Not durable — state dies with the process. Exists for deterministic
//! tests (construct a fresh queue per test, drive the clock with tokio's
//! paused time) and for local development without Postgres. Due-times use
//! [`tokio::time::Instant`] so `tokio::time::advance` moves them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Job, JobId, NewJob, RepeatableJob, State};
use crate::queue::{EnqueueResult, Queue};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

struct StoredJob {
    job: Job,
    due_at: Instant,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, StoredJob>,
    repeatables: HashMap<String, RepeatableJob>,
}

/// In-memory [`Queue`] implementation.
pub struct MemQueue {
    inner: Mutex<Inner>,
    ready: Notify,
}

impl MemQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ready: Notify::new(),
        }
    }

    /// Jobs currently in `state` on `queue_name`, for tests and inspection.
    pub async fn list_by_state(&self, queue_name: &str, state: State) -> Vec<Job> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|s| s.job.queue_name == queue_name && s.job.state == state)
            .map(|s| s.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }
}

impl Default for MemQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_transition(from: State, to: State) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

#[async_trait]
impl Queue for MemQueue {
    async fn enqueue(&self, new: NewJob) -> Result<EnqueueResult> {
        let mut inner = self.inner.lock().await;

        // Dedupe: a scheduled-but-not-finished job with the same id wins.
        if let Some(ref dedupe_id) = new.options.dedupe_id {
            let existing = inner.jobs.values().find(|s| {
                s.job.queue_name == new.queue_name
                    && s.job.options.dedupe_id.as_deref() == Some(dedupe_id)
                    && !s.job.state.is_terminal()
            });
            if let Some(existing) = existing {
                metrics::jobs_enqueued().add(
                    1,
                    &[
                        KeyValue::new("queue", new.queue_name.clone()),
                        KeyValue::new("result", "duplicate"),
                    ],
                );
                return Ok(EnqueueResult::Deduplicated {
                    existing: existing.job.id,
                });
            }
        }

        let now = Utc::now();
        let (state, due_at) = match new.delay {
            Some(delay) => (State::Delayed, Instant::now() + delay),
            None => (State::Waiting, Instant::now()),
        };

        let job = Job {
            id: JobId::new(),
            queue_name: new.queue_name.clone(),
            payload: new.payload,
            options: new.options,
            attempts_made: 0,
            state,
            last_error: None,
            outcome: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        inner.jobs.insert(job.id.0, StoredJob {
            job: job.clone(),
            due_at,
        });
        drop(inner);

        metrics::jobs_enqueued().add(
            1,
            &[
                KeyValue::new("queue", new.queue_name),
                KeyValue::new("result", "ok"),
            ],
        );
        self.ready.notify_waiters();
        Ok(EnqueueResult::Created(job))
    }

    async fn claim(&self, queue_name: &str) -> Result<Option<Job>> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let candidate = inner
            .jobs
            .values()
            .filter(|s| {
                s.job.queue_name == queue_name
                    && matches!(s.job.state, State::Waiting | State::Delayed)
                    && s.due_at <= now
            })
            .min_by_key(|s| s.due_at)
            .map(|s| s.job.id.0);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let stored = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        validate_transition(stored.job.state, State::Active)?;
        let from = stored.job.state;
        stored.job.state = State::Active;
        stored.job.attempts_made += 1;
        stored.job.updated_at = Utc::now();
        let job = stored.job.clone();
        drop(inner);

        metrics::job_state_transitions().add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", "active"),
            ],
        );
        Ok(Some(job))
    }

    async fn complete(&self, id: JobId, outcome: Option<serde_json::Value>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .jobs
            .get_mut(&id.0)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        validate_transition(stored.job.state, State::Completed)?;

        if stored.job.options.remove_on_complete {
            inner.jobs.remove(&id.0);
        } else {
            let now = Utc::now();
            stored.job.state = State::Completed;
            stored.job.outcome = outcome;
            stored.job.updated_at = now;
            stored.job.finished_at = Some(now);
        }
        drop(inner);

        metrics::job_state_transitions().add(
            1,
            &[KeyValue::new("from", "active"), KeyValue::new("to", "completed")],
        );
        Ok(())
    }

    async fn reschedule(&self, id: JobId, delay: Duration, note: Option<String>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .jobs
            .get_mut(&id.0)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        validate_transition(stored.job.state, State::Delayed)?;

        stored.job.state = State::Delayed;
        stored.job.last_error = note;
        stored.job.updated_at = Utc::now();
        stored.due_at = Instant::now() + delay;
        drop(inner);

        metrics::job_state_transitions().add(
            1,
            &[KeyValue::new("from", "active"), KeyValue::new("to", "delayed")],
        );
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .jobs
            .get_mut(&id.0)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        validate_transition(stored.job.state, State::Failed)?;

        if stored.job.options.remove_on_fail {
            inner.jobs.remove(&id.0);
        } else {
            let now = Utc::now();
            stored.job.state = State::Failed;
            stored.job.last_error = Some(error.to_string());
            stored.job.updated_at = now;
            stored.job.finished_at = Some(now);
        }
        drop(inner);

        metrics::job_state_transitions().add(
            1,
            &[KeyValue::new("from", "active"), KeyValue::new("to", "failed")],
        );
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(&id.0).map(|s| s.job.clone()))
    }

    async fn find_by_dedupe(&self, queue_name: &str, dedupe_id: &str) -> Result<Option<Job>> {
        let inner = self.inner.lock().await;
        let job = inner
            .jobs
            .values()
            .filter(|s| {
                s.job.queue_name == queue_name
                    && s.job.options.dedupe_id.as_deref() == Some(dedupe_id)
            })
            .max_by_key(|s| s.job.created_at)
            .map(|s| s.job.clone());
        Ok(job)
    }

    async fn update_payload(&self, id: JobId, payload: serde_json::Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .jobs
            .get_mut(&id.0)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        stored.job.payload = payload;
        stored.job.updated_at = Utc::now();
        Ok(())
    }

    async fn add_repeatable(&self, registration: RepeatableJob) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.repeatables.contains_key(&registration.job_id) {
            return Ok(false);
        }
        inner
            .repeatables
            .insert(registration.job_id.clone(), registration);
        Ok(true)
    }

    async fn list_repeatable(&self) -> Result<Vec<RepeatableJob>> {
        let inner = self.inner.lock().await;
        let mut regs: Vec<RepeatableJob> = inner.repeatables.values().cloned().collect();
        regs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(regs)
    }

    async fn advance_repeatable(
        &self,
        job_id: &str,
        expected_next: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.repeatables.get_mut(job_id) {
            Some(reg) if reg.next_run_at == expected_next => {
                reg.next_run_at = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn wait_ready(&self, _queue_name: &str, timeout: Duration) {
        tokio::select! {
            _ = self.ready.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }
}
