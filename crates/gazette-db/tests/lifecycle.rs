//! End-to-end task lifecycle through the store layer — the same guarded
//! transitions the worker performs, without spawning any agent process.

use chrono::Utc;
use gazette_core::event::TaskEventKind;
use gazette_core::routing::{FrozenRouting, Profile};
use gazette_core::task::{EnqueueRequest, FailureClass, TaskKind, TaskPayload, TaskStatus};
use gazette_db::event_store::EventStore;
use gazette_db::task_store::{CancelOutcome, CommitOutcome, RetrySchedule, TaskStore};

fn test_db() -> redb::Database {
    let dir = tempfile::tempdir().unwrap();
    let db = gazette_db::open_db(&dir.path().join("lifecycle.redb")).unwrap();
    std::mem::forget(dir);
    db
}

fn request() -> EnqueueRequest {
    EnqueueRequest::new(
        TaskKind::StoryDetails,
        TaskPayload::new("summarize the story", vec![]),
    )
}

fn routing() -> FrozenRouting {
    FrozenRouting {
        agent: "claude".into(),
        profile: Profile::Fast,
        model: "claude-haiku".into(),
        command_template: "claude -p {prompt_file} --model {model}".into(),
        resolved_at: Utc::now(),
    }
}

fn schedule() -> RetrySchedule {
    RetrySchedule {
        run_after: Utc::now(),
        timeout_secs: 600,
    }
}

/// Happy path: queued -> claimed -> succeeded, with routing frozen at claim.
#[test]
fn happy_path() {
    let db = test_db();
    let store = TaskStore::new(&db);

    let task = store.enqueue(request()).unwrap();
    assert_eq!(task.status.label(), "queued");
    assert_eq!(task.attempt_count, 0);

    let claimed = store.claim_next("w1", Utc::now()).unwrap().unwrap();
    assert_eq!(claimed.id, task.id);
    assert_eq!(claimed.status.owner(), Some("w1"));
    assert!(claimed.heartbeat_at.is_some());

    let frozen = store.freeze_routing(task.id, "w1", &routing()).unwrap();
    assert_eq!(frozen.unwrap().model, "claude-haiku");

    assert!(store.complete(task.id, "w1", "result.json").unwrap());
    let done = store.get(task.id).unwrap().unwrap();
    assert_eq!(done.status.label(), "succeeded");
    assert_eq!(done.result_path.as_deref(), Some("result.json"));
    assert!(done.status.is_terminal());

    let events = EventStore::new(&db).for_task(task.id).unwrap();
    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TaskEventKind::Enqueued,
            TaskEventKind::Claimed,
            TaskEventKind::RoutingFrozen,
            TaskEventKind::Succeeded,
        ]
    );
}

/// Retryable failures re-queue with the attempt count incremented, and
/// exhaustion lands in failed — never silently stuck in queued.
#[test]
fn retry_until_exhausted() {
    let db = test_db();
    let store = TaskStore::new(&db);
    let task = store.enqueue(request().with_max_attempts(2)).unwrap();

    // Attempt 1 fails retryably.
    store.claim_next("w1", Utc::now()).unwrap().unwrap();
    let outcome = store
        .record_failure(
            task.id,
            "w1",
            FailureClass::OtherFailure,
            "exploded",
            Some(1),
            schedule(),
            serde_json::json!({}),
        )
        .unwrap();
    assert_eq!(outcome, CommitOutcome::Retried);
    let row = store.get(task.id).unwrap().unwrap();
    assert_eq!(row.status.label(), "queued");
    assert_eq!(row.attempt_count, 1);
    assert_eq!(row.last_failure_class, Some(FailureClass::OtherFailure));

    // Attempt 2 fails: budget exhausted.
    store.claim_next("w1", Utc::now()).unwrap().unwrap();
    let outcome = store
        .record_failure(
            task.id,
            "w1",
            FailureClass::OtherFailure,
            "exploded again",
            Some(1),
            schedule(),
            serde_json::json!({}),
        )
        .unwrap();
    assert_eq!(outcome, CommitOutcome::Failed);
    let row = store.get(task.id).unwrap().unwrap();
    assert_eq!(row.status.label(), "failed");
    assert_eq!(row.attempt_count, 2);
    assert!(row.attempt_count <= row.max_attempts);
}

/// Non-retryable classes fail immediately regardless of remaining budget.
#[test]
fn model_not_available_is_fatal() {
    let db = test_db();
    let store = TaskStore::new(&db);
    let task = store.enqueue(request().with_max_attempts(5)).unwrap();

    store.claim_next("w1", Utc::now()).unwrap().unwrap();
    let outcome = store
        .record_failure(
            task.id,
            "w1",
            FailureClass::ModelNotAvailable,
            "unknown model",
            Some(1),
            schedule(),
            serde_json::json!({}),
        )
        .unwrap();
    assert_eq!(outcome, CommitOutcome::Failed);
    let row = store.get(task.id).unwrap().unwrap();
    assert_eq!(row.status.label(), "failed");
    assert_eq!(row.attempt_count, 1);
}

/// Timeout edge: claimed -> timeout -> queued while attempts remain, then
/// timeout -> failed on exhaustion; both edges are in the event log.
#[test]
fn timeout_requeues_then_fails() {
    let db = test_db();
    let store = TaskStore::new(&db);
    let task = store.enqueue(request().with_max_attempts(2)).unwrap();

    store.claim_next("w1", Utc::now()).unwrap().unwrap();
    let outcome = store
        .record_timeout(
            task.id,
            "w1",
            None,
            RetrySchedule {
                run_after: Utc::now(),
                timeout_secs: 900,
            },
        )
        .unwrap();
    assert_eq!(outcome, CommitOutcome::Retried);
    let row = store.get(task.id).unwrap().unwrap();
    assert_eq!(row.status.label(), "queued");
    assert_eq!(row.timeout_secs, 900);

    store.claim_next("w1", Utc::now()).unwrap().unwrap();
    let outcome = store.record_timeout(task.id, "w1", None, schedule()).unwrap();
    assert_eq!(outcome, CommitOutcome::Failed);
    let row = store.get(task.id).unwrap().unwrap();
    assert_eq!(row.status.label(), "failed");
    assert_eq!(row.last_failure_class, Some(FailureClass::TimeoutOrProbe));
    assert_eq!(row.attempt_count, 2);

    let events = EventStore::new(&db).for_task(task.id).unwrap();
    let transitions: Vec<_> = events
        .iter()
        .filter_map(|e| match (&e.status_from, &e.status_to) {
            (Some(from), Some(to)) => Some((from.clone(), to.clone())),
            _ => None,
        })
        .collect();
    assert!(transitions.contains(&("claimed".into(), "timeout".into())));
    assert!(transitions.contains(&("timeout".into(), "queued".into())));
    assert!(transitions.contains(&("timeout".into(), "failed".into())));
}

/// Routing frozen at first claim survives retries untouched.
#[test]
fn routing_survives_retries() {
    let db = test_db();
    let store = TaskStore::new(&db);
    let task = store.enqueue(request().with_max_attempts(3)).unwrap();

    store.claim_next("w1", Utc::now()).unwrap().unwrap();
    let original = routing();
    store.freeze_routing(task.id, "w1", &original).unwrap();
    store
        .record_failure(
            task.id,
            "w1",
            FailureClass::OutputInvalid,
            "bad output",
            Some(0),
            schedule(),
            serde_json::json!({}),
        )
        .unwrap();

    // Second attempt: a different routing is offered (as if config changed),
    // but the frozen decision wins.
    store.claim_next("w1", Utc::now()).unwrap().unwrap();
    let changed = FrozenRouting {
        model: "claude-opus".into(),
        ..routing()
    };
    let effective = store
        .freeze_routing(task.id, "w1", &changed)
        .unwrap()
        .unwrap();
    assert_eq!(effective.model, original.model);

    let row = store.get(task.id).unwrap().unwrap();
    assert_eq!(row.routing.unwrap().model, "claude-haiku");
}

/// Cancel: queued cancels directly; claimed records the request and the
/// owning worker commits the cancel at its next checkpoint.
#[test]
fn cancel_paths() {
    let db = test_db();
    let store = TaskStore::new(&db);

    let queued = store.enqueue(request()).unwrap();
    assert_eq!(store.cancel(queued.id).unwrap(), CancelOutcome::Canceled);
    assert_eq!(
        store.get(queued.id).unwrap().unwrap().status.label(),
        "canceled"
    );

    let claimed = store.enqueue(request()).unwrap();
    store.claim_next("w1", Utc::now()).unwrap().unwrap();
    assert_eq!(
        store.cancel(claimed.id).unwrap(),
        CancelOutcome::CancelRequested
    );
    let row = store.get(claimed.id).unwrap().unwrap();
    assert!(row.cancel_requested);
    assert_eq!(row.status.label(), "claimed");

    // The worker notices at its heartbeat checkpoint and commits.
    assert_eq!(store.heartbeat(claimed.id, "w1").unwrap(), Some(true));
    assert!(store.finish_cancel(claimed.id, "w1").unwrap());
    assert_eq!(
        store.get(claimed.id).unwrap().unwrap().status.label(),
        "canceled"
    );

    // Terminal states reject caller cancels.
    assert!(store.cancel(claimed.id).is_err());
}

/// Manual retry re-queues with a fresh budget and cleared failure fields.
#[test]
fn manual_retry() {
    let db = test_db();
    let store = TaskStore::new(&db);
    let task = store.enqueue(request().with_max_attempts(1)).unwrap();

    store.claim_next("w1", Utc::now()).unwrap().unwrap();
    store.freeze_routing(task.id, "w1", &routing()).unwrap();
    store
        .record_failure(
            task.id,
            "w1",
            FailureClass::OtherFailure,
            "boom",
            Some(2),
            schedule(),
            serde_json::json!({}),
        )
        .unwrap();
    assert_eq!(store.get(task.id).unwrap().unwrap().status.label(), "failed");

    let retried = store.retry(task.id).unwrap();
    assert_eq!(retried.status.label(), "queued");
    assert_eq!(retried.attempt_count, 0);
    assert!(retried.error_summary.is_none());
    assert!(retried.last_failure_class.is_none());
    // Frozen routing is preserved.
    assert_eq!(retried.routing.unwrap().model, "claude-haiku");

    // Retry from a non-terminal status is a caller error.
    assert!(store.retry(task.id).is_err());
}

/// Stale claims are reclaimed by timestamp; fresh claims are left alone.
#[test]
fn stale_reclaim() {
    let db = test_db();
    let store = TaskStore::new(&db);
    let task = store.enqueue(request()).unwrap();

    store.claim_next("w1", Utc::now()).unwrap().unwrap();

    // Heartbeat is fresh: nothing to reclaim.
    assert_eq!(store.reclaim_stale(600, Utc::now()).unwrap(), 0);

    // Pretend ten minutes pass without a heartbeat.
    let later = Utc::now() + chrono::Duration::seconds(601);
    assert_eq!(store.reclaim_stale(600, later).unwrap(), 1);

    let row = store.get(task.id).unwrap().unwrap();
    assert_eq!(row.status.label(), "queued");
    assert!(row.heartbeat_at.is_none());

    // The old owner's commit now bounces.
    assert!(!store.complete(task.id, "w1", "late.json").unwrap());
    let events = EventStore::new(&db).for_task(task.id).unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.kind == TaskEventKind::StaleReclaimed)
    );
    assert!(
        events
            .iter()
            .any(|e| e.kind == TaskEventKind::RejectedTransition)
    );
}

/// A cancel requested against a crashed worker's claim resolves to canceled
/// at reclaim time instead of re-queueing.
#[test]
fn stale_reclaim_honors_cancel_request() {
    let db = test_db();
    let store = TaskStore::new(&db);
    let task = store.enqueue(request()).unwrap();

    store.claim_next("w1", Utc::now()).unwrap().unwrap();
    store.cancel(task.id).unwrap();

    let later = Utc::now() + chrono::Duration::seconds(7200);
    assert_eq!(store.reclaim_stale(3600, later).unwrap(), 1);
    assert_eq!(
        store.get(task.id).unwrap().unwrap().status.label(),
        "canceled"
    );
}

/// Terminal states never regress: a straggling worker cannot resurrect a
/// finished task through any guarded path.
#[test]
fn terminal_states_are_immutable() {
    let db = test_db();
    let store = TaskStore::new(&db);
    let task = store.enqueue(request()).unwrap();

    store.claim_next("w1", Utc::now()).unwrap().unwrap();
    assert!(store.complete(task.id, "w1", "out.json").unwrap());

    assert!(!store.complete(task.id, "w1", "again.json").unwrap());
    assert_eq!(
        store
            .record_failure(
                task.id,
                "w1",
                FailureClass::OtherFailure,
                "late failure",
                None,
                schedule(),
                serde_json::json!({}),
            )
            .unwrap(),
        CommitOutcome::Rejected
    );
    assert_eq!(
        store.record_timeout(task.id, "w1", None, schedule()).unwrap(),
        CommitOutcome::Rejected
    );
    assert!(!store.finish_cancel(task.id, "w1").unwrap());

    let row = store.get(task.id).unwrap().unwrap();
    assert_eq!(row.status.label(), "succeeded");
    assert_eq!(row.result_path.as_deref(), Some("out.json"));
}

/// A cancel request that lands mid-attempt wins over the retry path when
/// the worker commits the attempt's failure.
#[test]
fn cancel_request_preempts_retry() {
    let db = test_db();
    let store = TaskStore::new(&db);
    let task = store.enqueue(request().with_max_attempts(5)).unwrap();

    store.claim_next("w1", Utc::now()).unwrap().unwrap();
    store.cancel(task.id).unwrap();

    let outcome = store
        .record_failure(
            task.id,
            "w1",
            FailureClass::OtherFailure,
            "failed mid-cancel",
            Some(1),
            schedule(),
            serde_json::json!({}),
        )
        .unwrap();
    assert_eq!(outcome, CommitOutcome::Canceled);
    assert_eq!(
        store.get(task.id).unwrap().unwrap().status.label(),
        "canceled"
    );
}

/// Enqueue rejects a zero attempt budget.
#[test]
fn zero_max_attempts_rejected() {
    let db = test_db();
    let store = TaskStore::new(&db);
    assert!(store.enqueue(request().with_max_attempts(0)).is_err());
}

/// Status checks used by the dashboard.
#[test]
fn status_counts() {
    let db = test_db();
    let store = TaskStore::new(&db);
    store.enqueue(request()).unwrap();
    store.enqueue(request()).unwrap();
    store.enqueue(request()).unwrap();
    store.claim_next("w1", Utc::now()).unwrap();

    let counts = store.status_counts().unwrap();
    assert_eq!(counts.get("queued"), Some(&2));
    assert_eq!(counts.get("claimed"), Some(&1));
}
