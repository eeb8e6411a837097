//! Poll state machine tests: scripted vendor statuses driven through a
//! worker over an in-memory queue.

use async_trait::async_trait;
use loreforge::error::Result;
use loreforge::model::{Job, State};
use loreforge::notify::{Notification, NotificationSink};
use loreforge::poll::{
    Finalizer, PollClient, PollEvents, PollHandler, PollPayload, PollSpec, PollStatus, begin,
};
use loreforge::queue::mem::MemQueue;
use loreforge::queue::{EnqueueResult, Queue};
use loreforge::retry::Backoff;
use loreforge::worker::Worker;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct ScriptedClient {
    script: Mutex<VecDeque<Result<PollStatus>>>,
    checks: AtomicUsize,
    submits: AtomicUsize,
}

impl ScriptedClient {
    fn new(script: Vec<Result<PollStatus>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            checks: AtomicUsize::new(0),
            submits: AtomicUsize::new(0),
        })
    }

    fn pending(stage: &str) -> Result<PollStatus> {
        Ok(PollStatus::Pending {
            stage: Some(stage.to_string()),
        })
    }
}

#[async_trait]
impl PollClient for ScriptedClient {
    async fn submit(&self, _request: &serde_json::Value) -> Result<String> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        Ok("ext-42".to_string())
    }

    async fn check(&self, _external_id: &str) -> Result<PollStatus> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .expect("script exhausted")
    }
}

#[derive(Default)]
struct RecordingFinalizer {
    finalized: Mutex<Vec<serde_json::Value>>,
    failed: Mutex<Vec<String>>,
}

#[async_trait]
impl Finalizer for RecordingFinalizer {
    async fn finalize(&self, _payload: &PollPayload, output: serde_json::Value) -> Result<()> {
        self.finalized.lock().unwrap().push(output);
        Ok(())
    }

    async fn mark_failed(&self, _payload: &PollPayload, reason: &str) -> Result<()> {
        self.failed.lock().unwrap().push(reason.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<(String, Notification)>>,
}

impl RecordingSink {
    fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, n)| n.kind == kind)
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, owner_id: &str, notification: Notification) {
        self.events
            .lock()
            .unwrap()
            .push((owner_id.to_string(), notification));
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    mem: Arc<MemQueue>,
    client: Arc<ScriptedClient>,
    finalizer: Arc<RecordingFinalizer>,
    sink: Arc<RecordingSink>,
    worker: Worker<PollPayload>,
}

fn events() -> PollEvents {
    PollEvents {
        update: "generation.update".to_string(),
        completed: "generation.completed".to_string(),
        failed: "generation.failed".to_string(),
    }
}

fn harness(script: Vec<Result<PollStatus>>) -> Harness {
    let mem = Arc::new(MemQueue::new());
    let queue: Arc<dyn Queue> = mem.clone();
    let client = ScriptedClient::new(script);
    let finalizer = Arc::new(RecordingFinalizer::default());
    let sink = Arc::new(RecordingSink::default());

    let handler = PollHandler::new(
        queue.clone(),
        client.clone(),
        finalizer.clone(),
        sink.clone(),
        events(),
    );
    let hook = handler.failure_hook();
    let worker = Worker::new(queue, "image", handler).with_failure_hook(hook);

    Harness {
        mem,
        client,
        finalizer,
        sink,
        worker,
    }
}

impl Harness {
    async fn begin(&self, poll_interval: Duration, max_wait: Duration) -> Job {
        begin(
            self.mem.as_ref(),
            self.client.as_ref(),
            PollSpec {
                queue_name: "image".to_string(),
                owner_id: "user-7".to_string(),
                entity_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
                request: json!({"model": "dreamshaper", "prompt": "a dragon's hoard"}),
                poll_interval,
                max_wait,
            },
        )
        .await
        .unwrap()
    }

    /// Drive attempts until the job reaches a terminal state or disappears.
    async fn drive(&self, job: &Job, poll_interval: Duration) {
        loop {
            assert!(self.worker.process_one().await.unwrap(), "job not claimable");
            match self.mem.get(job.id).await.unwrap() {
                Some(j) if j.state.is_terminal() => return,
                None => return,
                Some(_) => tokio::time::advance(poll_interval).await,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// State machine paths
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn pending_then_succeeded_finalizes_without_consuming_budget() {
    let h = harness(vec![
        ScriptedClient::pending("QUEUED"),
        ScriptedClient::pending("IN_PROGRESS"),
        Ok(PollStatus::Succeeded(json!({"url": "https://img/1.png"}))),
    ]);

    let job = h.begin(Duration::from_secs(2), Duration::from_secs(300)).await;
    assert_eq!(job.options.max_attempts, 150);

    h.drive(&job, Duration::from_secs(2)).await;

    // Two reschedules, then completion — not attempt exhaustion.
    let done = h.mem.get(job.id).await.unwrap().unwrap();
    assert_eq!(done.state, State::Completed);
    assert_eq!(done.attempts_made, 3);
    assert_eq!(h.client.checks.load(Ordering::SeqCst), 3);
    assert_eq!(
        h.finalizer.finalized.lock().unwrap().as_slice(),
        &[json!({"url": "https://img/1.png"})]
    );
    assert_eq!(h.sink.count("generation.completed"), 1);
    assert_eq!(h.sink.count("generation.failed"), 0);
}

#[tokio::test(start_paused = true)]
async fn vendor_failure_short_circuits_remaining_attempts() {
    let h = harness(vec![
        ScriptedClient::pending("QUEUED"),
        Ok(PollStatus::Failed("generation failed".to_string())),
    ]);

    let job = h.begin(Duration::from_secs(2), Duration::from_secs(300)).await;
    h.drive(&job, Duration::from_secs(2)).await;

    // Stopped at attempt 2 with a vendor failure, not a timeout.
    let failed = h.mem.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.state, State::Failed);
    assert_eq!(failed.attempts_made, 2);
    assert_eq!(failed.last_error.as_deref(), Some("generation failed"));
    assert_eq!(h.client.checks.load(Ordering::SeqCst), 2);

    assert_eq!(
        h.finalizer.failed.lock().unwrap().as_slice(),
        &["generation failed".to_string()]
    );
    assert_eq!(h.sink.count("generation.failed"), 1);

    let events = h.sink.events.lock().unwrap();
    let (_, failure) = events
        .iter()
        .find(|(_, n)| n.kind == "generation.failed")
        .unwrap();
    assert_eq!(failure.payload["timedOut"], json!(false));
}

#[tokio::test(start_paused = true)]
async fn always_pending_times_out_with_exactly_one_failure_event() {
    let h = harness(vec![
        Ok(PollStatus::Pending { stage: None }),
        Ok(PollStatus::Pending { stage: None }),
        Ok(PollStatus::Pending { stage: None }),
    ]);

    // 6s budget at 2s cadence = 3 attempts.
    let job = h.begin(Duration::from_secs(2), Duration::from_secs(6)).await;
    assert_eq!(job.options.max_attempts, 3);

    h.drive(&job, Duration::from_secs(2)).await;

    let failed = h.mem.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.state, State::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("timed out"));
    assert_eq!(h.client.checks.load(Ordering::SeqCst), 3);

    assert_eq!(h.sink.count("generation.failed"), 1);
    assert_eq!(
        h.finalizer.failed.lock().unwrap().as_slice(),
        &["timed out".to_string()]
    );

    let events = h.sink.events.lock().unwrap();
    let (owner, failure) = events
        .iter()
        .find(|(_, n)| n.kind == "generation.failed")
        .unwrap();
    assert_eq!(owner, "user-7");
    assert_eq!(failure.payload["timedOut"], json!(true));
    assert_eq!(failure.payload["reason"], json!("timed out"));
}

// ---------------------------------------------------------------------------
// Progress notifications
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn progress_is_notified_once_per_stage_change() {
    let h = harness(vec![
        ScriptedClient::pending("QUEUED"),
        ScriptedClient::pending("QUEUED"),
        ScriptedClient::pending("DREAMING"),
        Ok(PollStatus::Succeeded(json!({"url": "https://img/2.png"}))),
    ]);

    let job = h.begin(Duration::from_secs(2), Duration::from_secs(300)).await;
    h.drive(&job, Duration::from_secs(2)).await;

    // QUEUED and DREAMING — the repeated QUEUED observation stays quiet.
    assert_eq!(h.sink.count("generation.update"), 2);
}

#[tokio::test(start_paused = true)]
async fn transport_error_is_retried_not_surfaced() {
    let h = harness(vec![
        Err(loreforge::error::Error::Other("connection reset".to_string())),
        ScriptedClient::pending("QUEUED"),
        Ok(PollStatus::Succeeded(json!({"url": "https://img/3.png"}))),
    ]);

    let job = h.begin(Duration::from_secs(2), Duration::from_secs(300)).await;
    h.drive(&job, Duration::from_secs(2)).await;

    let done = h.mem.get(job.id).await.unwrap().unwrap();
    assert_eq!(done.state, State::Completed);
    // The blip never reached the owner's channel.
    assert_eq!(h.sink.count("generation.failed"), 0);
}

// ---------------------------------------------------------------------------
// Submit-on-first-attempt
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn submits_lazily_when_enqueued_without_external_id() {
    let h = harness(vec![Ok(PollStatus::Succeeded(json!({"text": "done"})))]);

    let payload = PollPayload {
        owner_id: "user-7".to_string(),
        entity_ids: vec![Uuid::new_v4()],
        request: json!({"audio": "session-recording.ogg"}),
        external_id: None,
        last_stage: None,
    };
    let new = loreforge::model::NewJob::new("image")
        .payload(serde_json::to_value(&payload).unwrap())
        .max_attempts(10)
        .backoff(Backoff::fixed(Duration::from_secs(2)));
    let job = match h.mem.enqueue(new).await.unwrap() {
        EnqueueResult::Created(job) => job,
        _ => panic!("expected Created"),
    };

    assert!(h.worker.process_one().await.unwrap());

    assert_eq!(h.client.submits.load(Ordering::SeqCst), 1);
    assert_eq!(h.client.checks.load(Ordering::SeqCst), 1);
    let done = h.mem.get(job.id).await.unwrap().unwrap();
    assert_eq!(done.state, State::Completed);
    let stored: PollPayload = serde_json::from_value(done.payload).unwrap();
    assert_eq!(stored.external_id.as_deref(), Some("ext-42"));
}

// ---------------------------------------------------------------------------
// End-to-end: the image generation scenario
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn image_generation_end_to_end() {
    // Vendor reports IN_PROGRESS four times (with moving progress), then
    // COMPLETED with the output URL.
    let h = harness(vec![
        ScriptedClient::pending("IN_PROGRESS:10"),
        ScriptedClient::pending("IN_PROGRESS:35"),
        ScriptedClient::pending("IN_PROGRESS:60"),
        ScriptedClient::pending("IN_PROGRESS:85"),
        Ok(PollStatus::Succeeded(json!({"url": "https://img/hoard.png"}))),
    ]);

    let job = h.begin(Duration::from_secs(2), Duration::from_secs(300)).await;
    assert_eq!(job.options.max_attempts, 150);

    h.drive(&job, Duration::from_secs(2)).await;

    // 5 handler invocations: 4 pending observations + the completion.
    assert_eq!(h.client.checks.load(Ordering::SeqCst), 5);
    // One update per IN_PROGRESS observation, one completion, no failures.
    assert_eq!(h.sink.count("generation.update"), 4);
    assert_eq!(h.sink.count("generation.completed"), 1);
    assert_eq!(h.sink.count("generation.failed"), 0);
    // Exactly one finalize call.
    assert_eq!(h.finalizer.finalized.lock().unwrap().len(), 1);

    let done = h.mem.get(job.id).await.unwrap().unwrap();
    assert_eq!(done.state, State::Completed);
    assert_eq!(done.attempts_made, 5);
}
