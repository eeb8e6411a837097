//! Postgres-backed durable queue.
//!
//! Two pieces, one transaction boundary: a `jobs` table holding state,
//! attempts, and dedupe identity, and a pgmq queue carrying delivery
//! (send with delay for backoff, read with a visibility timeout for the
//! claim lease). Repeatable registrations live in `scheduled_jobs`.
//! Jobs survive process restarts; an in-flight claim that dies reappears
//! when its visibility timeout lapses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{Job, JobId, JobOptions, NewJob, RepeatableJob, State};
use crate::queue::{EnqueueResult, Queue};
use crate::telemetry::metrics;

/// Durable [`Queue`] backed by Postgres + pgmq.
pub struct PgQueue {
    db: Arc<Db>,
    /// Visibility timeout (seconds) for claim leases.
    visibility_timeout: i32,
}

impl PgQueue {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            visibility_timeout: 60,
        }
    }

    pub fn with_visibility_timeout(mut self, seconds: i32) -> Self {
        self.visibility_timeout = seconds;
        self
    }

    /// List jobs for the operator CLI, newest first.
    pub async fn list_jobs(
        &self,
        state: Option<State>,
        queue_name: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT id, queue_name, payload, options, state, attempts_made, last_error, outcome, created_at, updated_at, finished_at
             FROM jobs
             WHERE ($1::text IS NULL OR state = $1)
               AND ($2::text IS NULL OR queue_name = $2)
             ORDER BY created_at DESC
             LIMIT $3",
        )
        .bind(state.map(|s| s.to_string()))
        .bind(queue_name)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    /// Create the pgmq queue for a channel (idempotent). Call once per
    /// queue name at startup.
    pub async fn ensure_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.db.pool())
            .await?;
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue_name.to_string()),
                KeyValue::new("operation", "create"),
            ],
        );
        Ok(())
    }
}

fn validate_transition(from: State, to: State) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

/// pgmq delay granularity is whole seconds; round sub-second backoffs up
/// so they never become immediate redelivery.
fn delay_seconds(delay: Duration) -> i32 {
    delay.as_millis().div_ceil(1_000) as i32
}

#[async_trait]
impl Queue for PgQueue {
    async fn enqueue(&self, new: NewJob) -> Result<EnqueueResult> {
        let mut tx = self.db.pool().begin().await?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        let options_json = serde_json::to_value(&new.options)?;
        let delay = new.delay.map(delay_seconds).unwrap_or(0);
        let state = if delay > 0 { "delayed" } else { "waiting" };

        if let Some(ref dedupe_id) = new.options.dedupe_id {
            // The unique partial index on (queue_name, dedupe_id) rejects a
            // second scheduled-but-not-finished job with the same identity.
            let inserted: Option<(Uuid,)> = sqlx::query_as(
                "INSERT INTO jobs (id, queue_name, payload, options, dedupe_id, state, attempts_made, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $7)
                 ON CONFLICT (queue_name, dedupe_id) WHERE dedupe_id IS NOT NULL AND state NOT IN ('completed', 'failed')
                 DO NOTHING
                 RETURNING id",
            )
            .bind(id)
            .bind(&new.queue_name)
            .bind(&new.payload)
            .bind(&options_json)
            .bind(dedupe_id)
            .bind(state)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            if inserted.is_none() {
                let existing: (Uuid,) = sqlx::query_as(
                    "SELECT id FROM jobs
                     WHERE queue_name = $1 AND dedupe_id = $2
                     AND state NOT IN ('completed', 'failed')
                     LIMIT 1",
                )
                .bind(&new.queue_name)
                .bind(dedupe_id)
                .fetch_one(&mut *tx)
                .await?;

                tx.rollback().await?;
                metrics::jobs_enqueued().add(
                    1,
                    &[
                        KeyValue::new("queue", new.queue_name.clone()),
                        KeyValue::new("result", "duplicate"),
                    ],
                );
                return Ok(EnqueueResult::Deduplicated {
                    existing: JobId(existing.0),
                });
            }
        } else {
            sqlx::query(
                "INSERT INTO jobs (id, queue_name, payload, options, dedupe_id, state, attempts_made, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, NULL, $5, 0, $6, $6)",
            )
            .bind(id)
            .bind(&new.queue_name)
            .bind(&new.payload)
            .bind(&options_json)
            .bind(state)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        // Inserted — hand delivery to pgmq within the same transaction.
        let message = serde_json::json!({ "job_id": id });
        let msg_id: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(&new.queue_name)
            .bind(&message)
            .bind(delay)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("UPDATE jobs SET pgmq_msg_id = $1 WHERE id = $2")
            .bind(msg_id.0)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        metrics::jobs_enqueued().add(
            1,
            &[
                KeyValue::new("queue", new.queue_name.clone()),
                KeyValue::new("result", "ok"),
            ],
        );

        let job = self
            .get(JobId(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        Ok(EnqueueResult::Created(job))
    }

    async fn claim(&self, queue_name: &str) -> Result<Option<Job>> {
        let msg: Option<(i64, serde_json::Value)> = sqlx::query_as(
            "SELECT msg_id, message FROM pgmq.read($1, $2, 1)",
        )
        .bind(queue_name)
        .bind(self.visibility_timeout)
        .fetch_optional(self.db.pool())
        .await?;

        let Some((msg_id, message)) = msg else {
            return Ok(None);
        };

        let job_id = message
            .get("job_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| Error::Other("bad pgmq payload: missing job_id".to_string()))?;

        let row: Option<JobRow> = sqlx::query_as(
            "UPDATE jobs
             SET state = 'active', attempts_made = attempts_made + 1, pgmq_msg_id = $2, updated_at = now()
             WHERE id = $1 AND state IN ('waiting', 'delayed')
             RETURNING id, queue_name, payload, options, state, attempts_made, last_error, outcome, created_at, updated_at, finished_at",
        )
        .bind(job_id)
        .bind(msg_id)
        .fetch_optional(self.db.pool())
        .await?;

        let Some(row) = row else {
            // Stale message: the job already finished or was removed.
            sqlx::query("SELECT pgmq.delete($1, $2)")
                .bind(queue_name)
                .bind(msg_id)
                .execute(self.db.pool())
                .await?;
            return Ok(None);
        };

        metrics::job_state_transitions().add(
            1,
            &[KeyValue::new("from", "waiting"), KeyValue::new("to", "active")],
        );
        row.try_into_job().map(Some)
    }

    async fn complete(&self, id: JobId, outcome: Option<serde_json::Value>) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        let row: Option<(String, serde_json::Value, String, Option<i64>)> = sqlx::query_as(
            "SELECT queue_name, options, state, pgmq_msg_id FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((queue_name, options_json, state, msg_id)) = row else {
            return Err(Error::NotFound(format!("job {id}")));
        };
        validate_transition(state.parse()?, State::Completed)?;
        let options: JobOptions = serde_json::from_value(options_json)?;

        if let Some(msg_id) = msg_id {
            sqlx::query("SELECT pgmq.archive($1, $2)")
                .bind(&queue_name)
                .bind(msg_id)
                .execute(&mut *tx)
                .await?;
        }

        if options.remove_on_complete {
            sqlx::query("DELETE FROM jobs WHERE id = $1")
                .bind(id.0)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(
                "UPDATE jobs SET state = 'completed', outcome = $2, updated_at = now(), finished_at = now()
                 WHERE id = $1",
            )
            .bind(id.0)
            .bind(&outcome)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        metrics::job_state_transitions().add(
            1,
            &[KeyValue::new("from", "active"), KeyValue::new("to", "completed")],
        );
        Ok(())
    }

    async fn reschedule(&self, id: JobId, delay: Duration, note: Option<String>) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        let row: Option<(String, String, Option<i64>)> = sqlx::query_as(
            "SELECT queue_name, state, pgmq_msg_id FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((queue_name, state, msg_id)) = row else {
            return Err(Error::NotFound(format!("job {id}")));
        };
        validate_transition(state.parse()?, State::Delayed)?;

        // Replace the in-flight message with a delayed one.
        if let Some(msg_id) = msg_id {
            sqlx::query("SELECT pgmq.delete($1, $2)")
                .bind(&queue_name)
                .bind(msg_id)
                .execute(&mut *tx)
                .await?;
        }
        let message = serde_json::json!({ "job_id": id.0 });
        let new_msg: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(&queue_name)
            .bind(&message)
            .bind(delay_seconds(delay))
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE jobs SET state = 'delayed', last_error = $2, pgmq_msg_id = $3, updated_at = now()
             WHERE id = $1",
        )
        .bind(id.0)
        .bind(&note)
        .bind(new_msg.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        metrics::job_state_transitions().add(
            1,
            &[KeyValue::new("from", "active"), KeyValue::new("to", "delayed")],
        );
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        let row: Option<(String, serde_json::Value, String, Option<i64>)> = sqlx::query_as(
            "SELECT queue_name, options, state, pgmq_msg_id FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((queue_name, options_json, state, msg_id)) = row else {
            return Err(Error::NotFound(format!("job {id}")));
        };
        validate_transition(state.parse()?, State::Failed)?;
        let options: JobOptions = serde_json::from_value(options_json)?;

        if let Some(msg_id) = msg_id {
            sqlx::query("SELECT pgmq.archive($1, $2)")
                .bind(&queue_name)
                .bind(msg_id)
                .execute(&mut *tx)
                .await?;
        }

        if options.remove_on_fail {
            sqlx::query("DELETE FROM jobs WHERE id = $1")
                .bind(id.0)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(
                "UPDATE jobs SET state = 'failed', last_error = $2, updated_at = now(), finished_at = now()
                 WHERE id = $1",
            )
            .bind(id.0)
            .bind(error)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        metrics::job_state_transitions().add(
            1,
            &[KeyValue::new("from", "active"), KeyValue::new("to", "failed")],
        );
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, queue_name, payload, options, state, attempts_made, last_error, outcome, created_at, updated_at, finished_at
             FROM jobs WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(JobRow::try_into_job).transpose()
    }

    async fn find_by_dedupe(&self, queue_name: &str, dedupe_id: &str) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, queue_name, payload, options, state, attempts_made, last_error, outcome, created_at, updated_at, finished_at
             FROM jobs WHERE queue_name = $1 AND dedupe_id = $2
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(queue_name)
        .bind(dedupe_id)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(JobRow::try_into_job).transpose()
    }

    async fn update_payload(&self, id: JobId, payload: serde_json::Value) -> Result<()> {
        let rows = sqlx::query("UPDATE jobs SET payload = $2, updated_at = now() WHERE id = $1")
            .bind(id.0)
            .bind(&payload)
            .execute(self.db.pool())
            .await?
            .rows_affected();
        if rows == 0 {
            return Err(Error::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    async fn add_repeatable(&self, registration: RepeatableJob) -> Result<bool> {
        let rows = sqlx::query(
            "INSERT INTO scheduled_jobs (job_id, queue_name, cron, payload, next_run_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(&registration.job_id)
        .bind(&registration.queue_name)
        .bind(&registration.cron)
        .bind(&registration.payload)
        .bind(registration.next_run_at)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    async fn list_repeatable(&self) -> Result<Vec<RepeatableJob>> {
        let rows: Vec<(String, String, String, serde_json::Value, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT job_id, queue_name, cron, payload, next_run_at
                 FROM scheduled_jobs ORDER BY job_id",
            )
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows
            .into_iter()
            .map(|(job_id, queue_name, cron, payload, next_run_at)| RepeatableJob {
                job_id,
                queue_name,
                cron,
                payload,
                next_run_at,
            })
            .collect())
    }

    async fn advance_repeatable(
        &self,
        job_id: &str,
        expected_next: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE scheduled_jobs SET next_run_at = $3 WHERE job_id = $1 AND next_run_at = $2",
        )
        .bind(job_id)
        .bind(expected_next)
        .bind(next)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    async fn wait_ready(&self, _queue_name: &str, timeout: Duration) {
        // Claiming is poll-driven; pgmq's visibility timeout handles
        // redelivery of claims that died mid-flight.
        tokio::time::sleep(timeout).await;
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue_name: String,
    payload: serde_json::Value,
    options: serde_json::Value,
    state: String,
    attempts_made: i32,
    last_error: Option<String>,
    outcome: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            queue_name: self.queue_name,
            payload: self.payload,
            options: serde_json::from_value(self.options)?,
            attempts_made: self.attempts_made as u32,
            state: self.state.parse()?,
            last_error: self.last_error,
            outcome: self.outcome,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        })
    }
}
