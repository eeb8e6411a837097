//! External-operation poll state machine.
//!
//! The shape behind every "delegate slow work to a third party, then check
//! back" flow: GPU image generation, audio transcription. Submit returns an
//! external job id; a polling job then checks status at a fixed cadence
//! until the vendor reports a terminal state or the attempt budget — derived
//! from a wall-clock timeout — runs out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Job, NewJob};
use crate::notify::{Notification, NotificationSink};
use crate::queue::{EnqueueResult, Queue};
use crate::retry::{Backoff, attempts_for_budget};
use crate::telemetry::metrics;
use crate::worker::{Failure, FailureHook, Handler, Verdict};
use opentelemetry::KeyValue;

/// Canonical three-way classification of a vendor status.
#[derive(Debug, Clone)]
pub enum PollStatus {
    /// Still running. `stage` is the vendor's progress snapshot (status
    /// string, percentage, queue position) — whatever the client should see.
    Pending { stage: Option<String> },
    /// Finished; the output payload is ready to finalize.
    Succeeded(serde_json::Value),
    /// Terminal vendor failure (failed, cancelled). No further polling.
    Failed(String),
}

/// Vendor adapter: submit work, check on it. Implementations wrap one
/// provider's protocol and map its raw statuses onto [`PollStatus`].
#[async_trait]
pub trait PollClient: Send + Sync {
    async fn submit(&self, request: &serde_json::Value) -> Result<String>;
    async fn check(&self, external_id: &str) -> Result<PollStatus>;
}

/// Domain-side completion: persist the fetched output and flip the affected
/// entities. `finalize` may run more than once for the same external job
/// under at-least-once delivery — implementations upsert keyed by the
/// external job id.
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn finalize(&self, payload: &PollPayload, output: serde_json::Value) -> Result<()>;
    async fn mark_failed(&self, payload: &PollPayload, reason: &str) -> Result<()>;
}

/// Event kinds emitted on the owner's channel during a poll flow.
#[derive(Debug, Clone)]
pub struct PollEvents {
    pub update: String,
    pub completed: String,
    pub failed: String,
}

/// Payload carried by a polling job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollPayload {
    /// The requesting actor; notifications go to their channel.
    pub owner_id: String,
    /// Domain entities this operation will fill in or fail.
    pub entity_ids: Vec<Uuid>,
    /// The original request, kept for submit-on-first-attempt and diagnosis.
    pub request: serde_json::Value,
    /// Assigned by the vendor once submitted.
    #[serde(default)]
    pub external_id: Option<String>,
    /// Last stage a progress notification was emitted for.
    #[serde(default)]
    pub last_stage: Option<String>,
}

/// Everything needed to start one poll flow.
pub struct PollSpec {
    pub queue_name: String,
    pub owner_id: String,
    pub entity_ids: Vec<Uuid>,
    pub request: serde_json::Value,
    /// The provider's recommended check cadence.
    pub poll_interval: Duration,
    /// Give up after this much wall-clock time still pending.
    pub max_wait: Duration,
}

/// Submit the request to the vendor, then enqueue the polling job with a
/// fixed-interval backoff and a budget-derived attempt count.
pub async fn begin(
    queue: &dyn Queue,
    client: &dyn PollClient,
    spec: PollSpec,
) -> Result<Job> {
    let external_id = client.submit(&spec.request).await?;
    info!(
        queue = %spec.queue_name,
        external_id = %external_id,
        owner_id = %spec.owner_id,
        "external job submitted"
    );

    let payload = PollPayload {
        owner_id: spec.owner_id,
        entity_ids: spec.entity_ids,
        request: spec.request,
        external_id: Some(external_id),
        last_stage: None,
    };
    let new = NewJob::new(&spec.queue_name)
        .payload(serde_json::to_value(&payload)?)
        .max_attempts(attempts_for_budget(spec.max_wait, spec.poll_interval))
        .backoff(Backoff::fixed(spec.poll_interval));

    match queue.enqueue(new).await? {
        EnqueueResult::Created(job) => Ok(job),
        EnqueueResult::Deduplicated { existing } => Err(Error::Other(format!(
            "poll job unexpectedly deduplicated against {existing}"
        ))),
    }
}

/// The generic polling handler. One instance serves every job on its queue;
/// vendor specifics live entirely in the [`PollClient`] and [`Finalizer`].
pub struct PollHandler {
    queue: Arc<dyn Queue>,
    client: Arc<dyn PollClient>,
    finalizer: Arc<dyn Finalizer>,
    sink: Arc<dyn NotificationSink>,
    events: PollEvents,
}

impl PollHandler {
    pub fn new(
        queue: Arc<dyn Queue>,
        client: Arc<dyn PollClient>,
        finalizer: Arc<dyn Finalizer>,
        sink: Arc<dyn NotificationSink>,
        events: PollEvents,
    ) -> Self {
        Self {
            queue,
            client,
            finalizer,
            sink,
            events,
        }
    }

    /// Standard failure hook for this flow: mark entities failed, notify the
    /// owner once. Covers both timeout and vendor-terminal paths.
    pub fn failure_hook(&self) -> PollFailureHook {
        PollFailureHook {
            finalizer: Arc::clone(&self.finalizer),
            sink: Arc::clone(&self.sink),
            failed_event: self.events.failed.clone(),
        }
    }

    /// Persist payload changes between attempts. Best-effort: losing an
    /// update means at worst a repeated progress notification.
    async fn store_payload(&self, job: &Job, payload: &PollPayload) {
        let value = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(job_id = %job.id, "poll payload does not serialize: {e}");
                return;
            }
        };
        if let Err(e) = self.queue.update_payload(job.id, value).await {
            warn!(job_id = %job.id, "failed to store poll payload: {e}");
        }
    }
}

#[async_trait]
impl Handler<PollPayload> for PollHandler {
    async fn handle(&self, job: &Job, mut payload: PollPayload) -> Verdict {
        // Producers may enqueue before submitting; first attempt submits.
        let external_id = match payload.external_id.clone() {
            Some(id) => id,
            None => match self.client.submit(&payload.request).await {
                Ok(id) => {
                    info!(job_id = %job.id, external_id = %id, "external job submitted");
                    payload.external_id = Some(id.clone());
                    self.store_payload(job, &payload).await;
                    id
                }
                Err(e) => return Verdict::Retry(format!("submit failed: {e}")),
            },
        };

        let status = match self.client.check(&external_id).await {
            Ok(status) => status,
            Err(e) => {
                // Transport blip, not a vendor verdict.
                metrics::poll_checks().add(1, &[KeyValue::new("status", "error")]);
                return Verdict::Retry(format!("status check failed: {e}"));
            }
        };

        match status {
            PollStatus::Pending { stage } => {
                metrics::poll_checks().add(1, &[KeyValue::new("status", "pending")]);
                // Fan out progress at most once per observed stage change,
                // never once per attempt.
                if stage != payload.last_stage {
                    self.sink
                        .notify(
                            &payload.owner_id,
                            Notification::new(
                                &self.events.update,
                                serde_json::json!({
                                    "jobId": job.id,
                                    "externalId": external_id,
                                    "stage": stage,
                                    "entityIds": payload.entity_ids,
                                }),
                            ),
                        )
                        .await;
                    payload.last_stage = stage;
                    self.store_payload(job, &payload).await;
                }
                Verdict::Pending {
                    note: payload.last_stage,
                }
            }
            PollStatus::Succeeded(output) => {
                metrics::poll_checks().add(1, &[KeyValue::new("status", "succeeded")]);
                // Finalize in the same attempt, right after the result is
                // fetched. A failure here retries the whole check; the
                // finalizer's upsert absorbs the re-run.
                if let Err(e) = self.finalizer.finalize(&payload, output).await {
                    return Verdict::Retry(format!("finalize failed: {e}"));
                }
                self.sink
                    .notify(
                        &payload.owner_id,
                        Notification::new(
                            &self.events.completed,
                            serde_json::json!({
                                "jobId": job.id,
                                "externalId": external_id,
                                "entityIds": payload.entity_ids,
                            }),
                        ),
                    )
                    .await;
                Verdict::Done(Some(serde_json::json!({ "externalId": external_id })))
            }
            PollStatus::Failed(reason) => {
                metrics::poll_checks().add(1, &[KeyValue::new("status", "failed")]);
                // Terminal vendor verdict: no further polls even with budget
                // remaining. The failure hook marks entities and notifies.
                Verdict::Discard(reason)
            }
        }
    }
}

/// Marks entities failed and notifies the owner exactly once per permanent
/// failure, with the timeout message kept distinct from the vendor's.
pub struct PollFailureHook {
    finalizer: Arc<dyn Finalizer>,
    sink: Arc<dyn NotificationSink>,
    failed_event: String,
}

#[async_trait]
impl FailureHook<PollPayload> for PollFailureHook {
    async fn on_permanent_failure(&self, job: &Job, payload: &PollPayload, failure: &Failure) {
        let reason = failure.message();
        if let Err(e) = self.finalizer.mark_failed(payload, &reason).await {
            warn!(job_id = %job.id, "failed to mark entities failed: {e}");
        }
        self.sink
            .notify(
                &payload.owner_id,
                Notification::new(
                    &self.failed_event,
                    serde_json::json!({
                        "jobId": job.id,
                        "externalId": payload.external_id,
                        "entityIds": payload.entity_ids,
                        "reason": reason,
                        "timedOut": matches!(failure, Failure::TimedOut { .. }),
                    }),
                ),
            )
            .await;
    }
}
