//! Recurring-job scheduler tests: idempotent registration and firing.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use loreforge::model::State;
use loreforge::queue::Queue;
use loreforge::queue::mem::MemQueue;
use loreforge::schedule::{Scheduler, next_occurrence};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;

const HOURLY: &str = "0 0 * * * *";

fn scheduler(mem: &Arc<MemQueue>) -> Scheduler {
    let queue: Arc<dyn Queue> = mem.clone();
    Scheduler::new(queue)
}

// ---------------------------------------------------------------------------
// Idempotent registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ensure_scheduled_twice_registers_once() {
    let mem = Arc::new(MemQueue::new());
    let sched = scheduler(&mem);

    sched
        .ensure_scheduled("end-trial-job", "sweeps", HOURLY, json!({}))
        .await
        .unwrap();
    sched
        .ensure_scheduled("end-trial-job", "sweeps", HOURLY, json!({}))
        .await
        .unwrap();

    let regs = mem.list_repeatable().await.unwrap();
    assert_eq!(regs.len(), 1);
    assert_eq!(regs[0].job_id, "end-trial-job");
    assert_eq!(regs[0].cron, HOURLY);
}

#[tokio::test]
async fn distinct_job_ids_register_separately() {
    let mem = Arc::new(MemQueue::new());
    let sched = scheduler(&mem);

    sched
        .ensure_scheduled("end-trial-job", "sweeps", HOURLY, json!({}))
        .await
        .unwrap();
    sched
        .ensure_scheduled("context-resync", "sweeps", "0 0 4 * * *", json!({}))
        .await
        .unwrap();

    assert_eq!(mem.list_repeatable().await.unwrap().len(), 2);
}

#[tokio::test]
async fn ensure_scheduled_rejects_bad_cron() {
    let mem = Arc::new(MemQueue::new());
    let sched = scheduler(&mem);

    let err = sched
        .ensure_scheduled("broken", "sweeps", "not a cron", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, loreforge::error::Error::Cron { .. }));
    assert!(mem.list_repeatable().await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Firing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fire_due_enqueues_and_advances() {
    let mem = Arc::new(MemQueue::new());
    let sched = scheduler(&mem);

    sched
        .ensure_scheduled("end-trial-job", "sweeps", HOURLY, json!({"sweep": "trials"}))
        .await
        .unwrap();
    let reg = mem.list_repeatable().await.unwrap().remove(0);

    // Not due yet.
    assert_eq!(
        sched
            .fire_due(reg.next_run_at - ChronoDuration::seconds(1))
            .await
            .unwrap(),
        0
    );

    // Due now: fires exactly once and advances.
    assert_eq!(sched.fire_due(reg.next_run_at).await.unwrap(), 1);
    assert_eq!(sched.fire_due(reg.next_run_at).await.unwrap(), 0);

    let advanced = mem.list_repeatable().await.unwrap().remove(0);
    assert!(advanced.next_run_at > reg.next_run_at);

    let fired = mem.claim("sweeps").await.unwrap().expect("occurrence enqueued");
    assert_eq!(fired.payload, json!({"sweep": "trials"}));
}

#[tokio::test]
async fn competing_schedulers_fire_an_occurrence_once() {
    let mem = Arc::new(MemQueue::new());
    let a = scheduler(&mem);
    let b = scheduler(&mem);

    a.ensure_scheduled("end-trial-job", "sweeps", HOURLY, json!({}))
        .await
        .unwrap();
    let due = mem.list_repeatable().await.unwrap()[0].next_run_at;

    let fired = a.fire_due(due).await.unwrap() + b.fire_due(due).await.unwrap();
    assert_eq!(fired, 1);
    assert_eq!(mem.list_by_state("sweeps", State::Waiting).await.len(), 1);
}

// ---------------------------------------------------------------------------
// One-shot registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ensure_once_enqueues_exactly_once() {
    let mem = Arc::new(MemQueue::new());
    let sched = scheduler(&mem);

    sched
        .ensure_once("backfill-tags", "maintenance", json!({"since": "2026-01-01"}))
        .await
        .unwrap();
    sched
        .ensure_once("backfill-tags", "maintenance", json!({"since": "2026-01-01"}))
        .await
        .unwrap();

    assert_eq!(
        mem.list_by_state("maintenance", State::Waiting).await.len(),
        1
    );
}

#[tokio::test]
async fn ensure_once_stays_done_after_completion() {
    let mem = Arc::new(MemQueue::new());
    let sched = scheduler(&mem);

    sched
        .ensure_once("backfill-tags", "maintenance", json!({}))
        .await
        .unwrap();
    let job = mem.claim("maintenance").await.unwrap().unwrap();
    mem.complete(job.id, None).await.unwrap();

    // A later restart re-runs the registration; the finished job blocks it.
    sched
        .ensure_once("backfill-tags", "maintenance", json!({}))
        .await
        .unwrap();
    assert!(mem.claim("maintenance").await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Cron arithmetic
// ---------------------------------------------------------------------------

#[test]
fn next_occurrence_is_strictly_after() {
    let schedule = Schedule::from_str("0 0 4 * * *").unwrap();
    let after: DateTime<Utc> = "2026-03-01T00:00:00Z".parse().unwrap();

    let next = next_occurrence(&schedule, after).unwrap();
    assert_eq!(next, "2026-03-01T04:00:00Z".parse::<DateTime<Utc>>().unwrap());

    let following = next_occurrence(&schedule, next).unwrap();
    assert_eq!(
        following,
        "2026-03-02T04:00:00Z".parse::<DateTime<Utc>>().unwrap()
    );
}
