//! Recurring-job scheduler.
//!
//! Registrations are idempotent by job id so every process start can call
//! `ensure_scheduled` for its full roster without creating duplicate cron
//! entries. Firing advances `next_run_at` with a guarded compare-and-set,
//! so overlapping tick loops enqueue each occurrence once.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{NewJob, RepeatableJob};
use crate::queue::{EnqueueResult, Queue};

fn parse_cron(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr).map_err(|source| Error::Cron {
        expr: expr.to_string(),
        source,
    })
}

/// Next fire time strictly after `after`, if the schedule has one.
pub fn next_occurrence(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

pub struct Scheduler {
    queue: Arc<dyn Queue>,
    tick: Duration,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn Queue>) -> Self {
        Self {
            queue,
            tick: Duration::from_secs(30),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Register a recurring job. Safe to call on every deploy/restart:
    /// existing registrations are compared by job id and left alone.
    pub async fn ensure_scheduled(
        &self,
        job_id: &str,
        queue_name: &str,
        cron_expr: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        // Fail fast on a bad expression before touching the registry.
        let schedule = parse_cron(cron_expr)?;

        let existing = self.queue.list_repeatable().await?;
        if existing.iter().any(|r| r.job_id == job_id) {
            debug!(job_id, "recurring job already registered");
            return Ok(());
        }

        let next = next_occurrence(&schedule, Utc::now())
            .ok_or_else(|| Error::Other(format!("cron {cron_expr:?} never fires")))?;
        let added = self
            .queue
            .add_repeatable(RepeatableJob {
                job_id: job_id.to_string(),
                queue_name: queue_name.to_string(),
                cron: cron_expr.to_string(),
                payload,
                next_run_at: next,
            })
            .await?;

        if added {
            info!(job_id, cron = cron_expr, next_run_at = %next, "recurring job registered");
        } else {
            // Lost the check-then-act race to another process. Fine:
            // registration is advisory and startup-granular.
            debug!(job_id, "recurring job already registered");
        }
        Ok(())
    }

    /// Register a job that runs exactly once ever, identified by `job_id`.
    /// Checked against existing jobs in any state, so the record must not be
    /// configured to remove itself on completion.
    pub async fn ensure_once(
        &self,
        job_id: &str,
        queue_name: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        if self.queue.find_by_dedupe(queue_name, job_id).await?.is_some() {
            debug!(job_id, "one-shot job already exists");
            return Ok(());
        }
        let new = NewJob::new(queue_name).payload(payload).dedupe_id(job_id);
        match self.queue.enqueue(new).await? {
            EnqueueResult::Created(job) => {
                info!(job_id, id = %job.id, "one-shot job enqueued");
            }
            EnqueueResult::Deduplicated { existing } => {
                debug!(job_id, %existing, "one-shot job already exists");
            }
        }
        Ok(())
    }

    /// Enqueue every registration due at `now`. Returns how many fired.
    /// Takes `now` explicitly so ticks are testable without a wall clock.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut fired = 0;
        for reg in self.queue.list_repeatable().await? {
            if reg.next_run_at > now {
                continue;
            }

            let schedule = match parse_cron(&reg.cron) {
                Ok(s) => s,
                Err(e) => {
                    error!(job_id = %reg.job_id, "stored cron does not parse: {e}");
                    continue;
                }
            };
            // Year-bounded schedules can run dry; park them far in the
            // future rather than refiring every tick.
            let next = next_occurrence(&schedule, now)
                .unwrap_or_else(|| now + ChronoDuration::days(36_500));

            if !self
                .queue
                .advance_repeatable(&reg.job_id, reg.next_run_at, next)
                .await?
            {
                // Another scheduler claimed this occurrence.
                continue;
            }

            // Per-occurrence identity: a second process that somehow also
            // advanced cannot double-enqueue the same fire.
            let dedupe = format!("{}:{}", reg.job_id, reg.next_run_at.timestamp());
            let new = NewJob::new(&reg.queue_name)
                .payload(reg.payload.clone())
                .dedupe_id(&dedupe);
            match self.queue.enqueue(new).await {
                Ok(EnqueueResult::Created(job)) => {
                    info!(job_id = %reg.job_id, id = %job.id, "recurring job fired");
                    fired += 1;
                }
                Ok(EnqueueResult::Deduplicated { existing }) => {
                    warn!(job_id = %reg.job_id, %existing, "occurrence already enqueued");
                }
                Err(e) => {
                    error!(job_id = %reg.job_id, "failed to enqueue occurrence: {e}");
                }
            }
        }
        Ok(fired)
    }

    /// Signal the tick loop to shut down.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Tick until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(tick_secs = self.tick.as_secs(), "scheduler started");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("scheduler shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.tick) => {}
            }
            if let Err(e) = self.fire_due(Utc::now()).await {
                error!("scheduler tick error: {e}");
            }
        }
    }
}
