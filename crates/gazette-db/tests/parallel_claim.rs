//! Concurrency tests for atomic task claiming.
//!
//! Validates that the guarded queued -> claimed transition prevents
//! double-dispatch under concurrent access from multiple worker threads.

use chrono::Utc;
use gazette_core::event::TaskEventKind;
use gazette_core::task::{EnqueueRequest, TaskKind, TaskPayload};
use gazette_db::event_store::EventStore;
use gazette_db::task_store::TaskStore;
use std::collections::HashSet;
use std::sync::Arc;

fn test_db() -> redb::Database {
    let dir = tempfile::tempdir().unwrap();
    let db = gazette_db::open_db(&dir.path().join("parallel.redb")).unwrap();
    // Leak the tempdir so the file outlives the test
    std::mem::forget(dir);
    db
}

fn request(prompt: &str) -> EnqueueRequest {
    EnqueueRequest::new(TaskKind::Highlights, TaskPayload::new(prompt, vec![]))
}

/// 10 threads drain a pool of 10 tasks through a shared Arc<Database>.
/// Each task must be claimed exactly once.
#[test]
fn concurrent_claims_no_double_dispatch() {
    let db = Arc::new(test_db());

    {
        let store = TaskStore::new(&db);
        for i in 0..10 {
            store.enqueue(request(&format!("task {i}"))).unwrap();
        }
    }

    let mut handles = Vec::new();
    for thread_id in 0..10 {
        let db = Arc::clone(&db);
        handles.push(std::thread::spawn(move || {
            let store = TaskStore::new(&db);
            let worker_id = format!("worker-{thread_id}");
            let mut claimed = Vec::new();

            loop {
                match store.claim_next(&worker_id, Utc::now()) {
                    Ok(Some(task)) => claimed.push(task.id.0),
                    Ok(None) => break,
                    Err(_) => {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                        continue;
                    }
                }
            }
            claimed
        }));
    }

    let mut all_claimed: Vec<i64> = Vec::new();
    for handle in handles {
        all_claimed.extend(handle.join().unwrap());
    }

    let unique: HashSet<i64> = all_claimed.iter().cloned().collect();
    assert_eq!(
        unique.len(),
        all_claimed.len(),
        "duplicate task claims detected: {all_claimed:?}"
    );
    assert_eq!(unique.len(), 10, "not all tasks were claimed");
}

/// Two workers race for one seeded task: exactly one guarded transition
/// succeeds, the loser observes no error.
#[test]
fn two_workers_race_single_task() {
    let db = Arc::new(test_db());
    let task = {
        let store = TaskStore::new(&db);
        store.enqueue(request("the only task")).unwrap()
    };

    let mut handles = Vec::new();
    for thread_id in 0..2 {
        let db = Arc::clone(&db);
        handles.push(std::thread::spawn(move || {
            let store = TaskStore::new(&db);
            store
                .try_claim(task.id, &format!("worker-{thread_id}"), Utc::now())
                .unwrap()
        }));
    }

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_some()).count();
    assert_eq!(winners, 1, "exactly one claim must win");

    // The losing attempt is recorded as a rejected transition, not an error.
    let events = EventStore::new(&db).for_task(task.id).unwrap();
    let rejected = events
        .iter()
        .filter(|e| e.kind == TaskEventKind::RejectedTransition)
        .count();
    assert_eq!(rejected, 1);
}

/// A worker committing against a claim it no longer holds gets `false` and
/// a rejected-transition event — never an error.
#[test]
fn stolen_claim_commit_is_rejected() {
    let db = test_db();
    let store = TaskStore::new(&db);
    let task = store.enqueue(request("contested")).unwrap();

    let claimed = store.claim_next("worker-a", Utc::now()).unwrap().unwrap();
    assert_eq!(claimed.id, task.id);

    // worker-b was never the owner; its commit must bounce.
    let committed = store.complete(task.id, "worker-b", "out.json").unwrap();
    assert!(!committed);

    let events = EventStore::new(&db).for_task(task.id).unwrap();
    let rejected: Vec<_> = events
        .iter()
        .filter(|e| e.kind == TaskEventKind::RejectedTransition)
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].detail["observed_owner"], "worker-a");

    // The rightful owner still commits fine.
    assert!(store.complete(task.id, "worker-a", "out.json").unwrap());
}

/// Claim preference: highest priority first, then earliest creation.
#[test]
fn claim_order_priority_then_age() {
    let db = test_db();
    let store = TaskStore::new(&db);

    let low = store.enqueue(request("low").with_priority(1)).unwrap();
    let high_old = store.enqueue(request("high old").with_priority(9)).unwrap();
    let high_new = store.enqueue(request("high new").with_priority(9)).unwrap();

    let first = store.claim_next("w", Utc::now()).unwrap().unwrap();
    assert_eq!(first.id, high_old.id);
    let second = store.claim_next("w", Utc::now()).unwrap().unwrap();
    assert_eq!(second.id, high_new.id);
    let third = store.claim_next("w", Utc::now()).unwrap().unwrap();
    assert_eq!(third.id, low.id);
    assert!(store.claim_next("w", Utc::now()).unwrap().is_none());
}

/// Tasks scheduled in the future (retry backoff) are not claimable yet.
#[test]
fn run_after_gates_claims() {
    let db = test_db();
    let store = TaskStore::new(&db);
    let task = store.enqueue(request("deferred")).unwrap();

    // Claim as-of a time before the task was created: nothing eligible.
    let before = task.run_after - chrono::Duration::seconds(60);
    assert!(store.claim_next("w", before).unwrap().is_none());

    assert!(store.claim_next("w", Utc::now()).unwrap().is_some());
}
