//! Generic worker engine.
//!
//! A worker binds one queue name to one typed handler and drives the job
//! lifecycle: claim, execute, retire. Handlers return a [`Verdict`] instead
//! of throwing — the engine never has to inspect error values to tell
//! "still working" apart from "broken".

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::Result;
use crate::model::Job;
use crate::queue::Queue;
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// What a handler decided about one attempt.
#[derive(Debug)]
pub enum Verdict {
    /// The job is done; record the outcome and stop.
    Done(Option<serde_json::Value>),
    /// External work is still running. Reschedule the next check; if the
    /// attempt budget is exhausted this becomes a timeout, not an error.
    Pending { note: Option<String> },
    /// Transient failure. Reschedule with backoff until attempts run out.
    Retry(String),
    /// Permanent failure. Short-circuits remaining attempts.
    Discard(String),
}

/// Why a job permanently failed.
#[derive(Debug, Clone)]
pub enum Failure {
    /// Attempt budget exhausted while the external operation was still
    /// pending.
    TimedOut { attempts: u32 },
    /// Transient-failure retries used up.
    Exhausted { attempts: u32, last_error: String },
    /// The handler discarded the job outright.
    Rejected { reason: String },
}

impl Failure {
    /// User-facing message. Timeouts read differently from vendor failures.
    pub fn message(&self) -> String {
        match self {
            Failure::TimedOut { .. } => "timed out".to_string(),
            Failure::Exhausted { last_error, .. } => last_error.clone(),
            Failure::Rejected { reason } => reason.clone(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Failure::TimedOut { .. } => "timed_out",
            Failure::Exhausted { .. } => "exhausted",
            Failure::Rejected { .. } => "rejected",
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::TimedOut { attempts } => {
                write!(f, "timed out after {attempts} attempts")
            }
            Failure::Exhausted {
                attempts,
                last_error,
            } => write!(f, "exhausted {attempts} attempts: {last_error}"),
            Failure::Rejected { reason } => write!(f, "rejected: {reason}"),
        }
    }
}

/// One attempt's worth of work for a typed payload.
#[async_trait]
pub trait Handler<P>: Send + Sync {
    async fn handle(&self, job: &Job, payload: P) -> Verdict;
}

#[async_trait]
impl<P, F, Fut> Handler<P> for F
where
    P: Send + 'static,
    F: Fn(Job, P) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Verdict> + Send + 'static,
{
    async fn handle(&self, job: &Job, payload: P) -> Verdict {
        (self)(job.clone(), payload).await
    }
}

/// Runs after a job permanently fails: persist the terminal state of the
/// affected entities and notify the owner. Infallible from the worker's
/// perspective — implementations log their own delivery problems.
#[async_trait]
pub trait FailureHook<P>: Send + Sync {
    async fn on_permanent_failure(&self, job: &Job, payload: &P, failure: &Failure);
}

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Poll interval fallback when the queue reports nothing ready.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// The worker loop: claim jobs from one queue, execute the handler, retire
/// the job by verdict. One handler invocation at a time per queue; workers
/// for different queues run as independent tasks.
pub struct Worker<P> {
    queue: Arc<dyn Queue>,
    queue_name: String,
    handler: Arc<dyn Handler<P>>,
    failure_hook: Option<Arc<dyn FailureHook<P>>>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl<P> Clone for Worker<P> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            queue_name: self.queue_name.clone(),
            handler: Arc::clone(&self.handler),
            failure_hook: self.failure_hook.clone(),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<P> Worker<P>
where
    P: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(
        queue: Arc<dyn Queue>,
        queue_name: impl Into<String>,
        handler: impl Handler<P> + 'static,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            handler: Arc::new(handler),
            failure_hook: None,
            config: WorkerConfig::default(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_failure_hook(mut self, hook: impl FailureHook<P> + 'static) -> Self {
        self.failure_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Signal the worker to shut down after the current job.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run the worker loop until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(queue = %self.queue_name, "worker started");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(queue = %self.queue_name, "worker shutting down");
                    return Ok(());
                }
                _ = self.queue.wait_ready(&self.queue_name, self.config.poll_interval) => {}
            }

            // Drain everything claimable before waiting again.
            loop {
                match self.process_one().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        error!(queue = %self.queue_name, "claim error: {e}");
                        break;
                    }
                }
            }
        }
    }

    /// Claim and execute a single job. Returns false when nothing was
    /// claimable. Public so tests can drive the lifecycle deterministically.
    pub async fn process_one(&self) -> Result<bool> {
        let Some(job) = self.queue.claim(&self.queue_name).await? else {
            return Ok(false);
        };
        let span = start_job_span(&self.queue_name, &job.id);
        self.execute(job).instrument(span).await;
        Ok(true)
    }

    async fn execute(&self, job: Job) {
        let start = Instant::now();

        let payload: P = match serde_json::from_value(job.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                // Programming error, not a vendor hiccup. No retry, and no
                // typed payload to route a notification from.
                error!(
                    job_id = %job.id,
                    queue = %job.queue_name,
                    error = %e,
                    "payload does not deserialize; failing permanently"
                );
                metrics::jobs_failed().add(
                    1,
                    &[
                        KeyValue::new("queue", job.queue_name.clone()),
                        KeyValue::new("kind", "invalid_payload"),
                    ],
                );
                if let Err(e) = self.queue.fail(job.id, &format!("bad payload: {e}")).await {
                    error!(job_id = %job.id, "failed to mark job failed: {e}");
                }
                return;
            }
        };

        // The handler runs in its own task so a panic is contained at the
        // per-job boundary instead of tearing down the worker.
        let handler = Arc::clone(&self.handler);
        let handler_job = job.clone();
        let handler_payload = payload.clone();
        let joined = tokio::spawn(async move {
            handler.handle(&handler_job, handler_payload).await
        })
        .await;

        let verdict = match joined {
            Ok(verdict) => verdict,
            Err(join_err) => {
                warn!(job_id = %job.id, "handler panicked: {join_err}");
                Verdict::Retry(format!("handler panicked: {join_err}"))
            }
        };

        let duration_ms = start.elapsed().as_millis() as f64;
        metrics::job_duration_ms().record(
            duration_ms,
            &[KeyValue::new("queue", job.queue_name.clone())],
        );

        match verdict {
            Verdict::Done(outcome) => {
                record_state_transition(&tracing::Span::current(), "active", "completed");
                info!(job_id = %job.id, attempt = job.attempts_made, duration_ms, "job completed");
                if let Err(e) = self.queue.complete(job.id, outcome).await {
                    error!(job_id = %job.id, "failed to mark job completed: {e}");
                }
            }
            Verdict::Pending { note } => {
                self.reschedule_or_fail(&job, &payload, true, note).await;
            }
            Verdict::Retry(err) => {
                self.reschedule_or_fail(&job, &payload, false, Some(err)).await;
            }
            Verdict::Discard(reason) => {
                self.permanent_failure(&job, &payload, Failure::Rejected { reason })
                    .await;
            }
        }
    }

    /// Retire a non-terminal attempt: reschedule if budget remains, fail
    /// permanently otherwise. `still_pending` picks the timeout
    /// classification over retry exhaustion.
    async fn reschedule_or_fail(
        &self,
        job: &Job,
        payload: &P,
        still_pending: bool,
        note: Option<String>,
    ) {
        let attempts = job.attempts_made;
        let max = job.options.max_attempts;

        if attempts >= max {
            let failure = if still_pending {
                Failure::TimedOut { attempts }
            } else {
                Failure::Exhausted {
                    attempts,
                    last_error: note.unwrap_or_else(|| "unknown error".to_string()),
                }
            };
            self.permanent_failure(job, payload, failure).await;
            return;
        }

        let delay = job.options.backoff.next_delay(attempts);
        debug!(
            job_id = %job.id,
            attempt = attempts,
            max_attempts = max,
            delay_ms = delay.as_millis() as u64,
            "rescheduling"
        );
        record_state_transition(&tracing::Span::current(), "active", "delayed");
        if let Err(e) = self.queue.reschedule(job.id, delay, note).await {
            error!(job_id = %job.id, "failed to reschedule: {e}");
        }
    }

    async fn permanent_failure(&self, job: &Job, payload: &P, failure: Failure) {
        error!(
            job_id = %job.id,
            queue = %job.queue_name,
            attempts = job.attempts_made,
            payload = %job.payload,
            %failure,
            "job permanently failed"
        );
        record_state_transition(&tracing::Span::current(), "active", "failed");
        metrics::jobs_failed().add(
            1,
            &[
                KeyValue::new("queue", job.queue_name.clone()),
                KeyValue::new("kind", failure.kind()),
            ],
        );

        if let Err(e) = self.queue.fail(job.id, &failure.message()).await {
            error!(job_id = %job.id, "failed to mark job failed: {e}");
        }

        // Fire-and-forget: the hook notifies the owner and marks entities;
        // its problems never re-fail the job.
        if let Some(hook) = &self.failure_hook {
            hook.on_permanent_failure(job, payload, &failure).await;
        }
    }
}
