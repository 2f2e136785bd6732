//! Durable task queue with optimistic-concurrency transitions.
//!
//! Every mutation is a guarded update: "set status to X only where the
//! current status equals the expected prior status and the claim owner
//! matches", executed inside one redb write transaction together with its
//! event append. redb's single-writer transactions provide the atomic
//! read-check-write; there is no other concurrency control anywhere.
//!
//! A rejected guard is not an error: it means another worker already moved
//! the row. The rejection itself is appended as a `rejected_transition`
//! event and the caller simply moves on.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gazette_core::event::{TaskEvent, TaskEventKind};
use gazette_core::routing::FrozenRouting;
use gazette_core::task::{EnqueueRequest, FailureClass, Task, TaskId, TaskStatus};
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde_json::json;
use std::collections::HashMap;

use crate::event_store::{EVENTS_TABLE, append_in_txn};

/// Tasks table: i64 task ID -> JSON-serialized Task.
pub const TASKS_TABLE: TableDefinition<i64, &str> = TableDefinition::new("tasks");

/// Auto-increment counter table, shared with the event and attempt logs.
pub const COUNTER_TABLE: TableDefinition<&str, i64> = TableDefinition::new("counters");

const NEXT_TASK_ID_KEY: &str = "next_task_id";

/// Outcome of a guarded failure/timeout commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Re-queued for another attempt.
    Retried,
    /// Terminal `failed`.
    Failed,
    /// Cancel request honored; terminal `canceled`.
    Canceled,
    /// Guard failed — the task is no longer ours.
    Rejected,
}

/// Retry scheduling computed by the worker for the next attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub run_after: DateTime<Utc>,
    pub timeout_secs: u64,
}

/// Outcome of the caller-facing cancel operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Was `queued`; now terminally `canceled`.
    Canceled,
    /// Was `claimed`; flag recorded, owning worker will honor it.
    CancelRequested,
}

pub struct TaskStore<'a> {
    db: &'a Database,
}

impl<'a> TaskStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Access the underlying database reference.
    pub fn db(&self) -> &'a Database {
        self.db
    }

    /// Create a queued task, assigning it an auto-incremented ID.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<Task> {
        if request.max_attempts == 0 {
            bail!("max_attempts must be >= 1");
        }
        let now = Utc::now();
        let task = Task {
            id: TaskId(0), // assigned below
            kind: request.kind,
            priority: request.priority,
            status: TaskStatus::Queued,
            payload: request.payload,
            routing_request: request.routing,
            routing: None,
            attempt_count: 0,
            max_attempts: request.max_attempts,
            timeout_secs: request.timeout_secs,
            run_after: now,
            cancel_requested: false,
            heartbeat_at: None,
            last_failure_class: None,
            error_summary: None,
            last_exit_code: None,
            result_path: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        let write_txn = self.db.begin_write()?;
        let task = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut counters = write_txn.open_table(COUNTER_TABLE)?;
            let mut events = write_txn.open_table(EVENTS_TABLE)?;

            let next_id = counters
                .get(NEXT_TASK_ID_KEY)?
                .map(|v| v.value())
                .unwrap_or(1);
            let mut task = task;
            task.id = TaskId(next_id);
            counters.insert(NEXT_TASK_ID_KEY, next_id + 1)?;

            let json = serde_json::to_string(&task)?;
            tasks.insert(next_id, json.as_str())?;

            append_in_txn(
                &mut events,
                &mut counters,
                TaskEvent::new(task.id, TaskEventKind::Enqueued)
                    .with_transition("", "queued")
                    .with_detail(json!({
                        "kind": task.kind.label(),
                        "priority": task.priority,
                        "max_attempts": task.max_attempts,
                        "timeout_secs": task.timeout_secs,
                    })),
            )?;
            task
        };
        write_txn.commit()?;
        Ok(task)
    }

    /// Get a task by ID.
    pub fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let read_txn = self.db.begin_read()?;
        let tasks = read_txn.open_table(TASKS_TABLE)?;
        match tasks.get(id.0)? {
            Some(guard) => {
                let task: Task = serde_json::from_str(guard.value())?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// List all tasks, optionally filtered by status label.
    pub fn list(&self, status_filter: Option<&str>) -> Result<Vec<Task>> {
        let read_txn = self.db.begin_read()?;
        let tasks = read_txn.open_table(TASKS_TABLE)?;
        let mut result = Vec::new();

        let iter = tasks.iter()?;
        for entry in iter {
            let (_, value) = entry?;
            let task: Task = serde_json::from_str(value.value())?;
            if let Some(status) = status_filter
                && task.status.label() != status
            {
                continue;
            }
            result.push(task);
        }
        Ok(result)
    }

    /// Claim the best ready task for this worker.
    ///
    /// Selects the preferred candidate (highest priority, then earliest
    /// creation, then lowest ID) and attempts the guarded
    /// `queued -> claimed` transition on it. Losing the race to another
    /// worker is not an error: the rejection is logged and the next
    /// candidate is tried. Best-effort ordering only, since claims race.
    pub fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Task>> {
        let mut skip: Vec<TaskId> = Vec::new();
        loop {
            let Some(candidate) = self.select_candidate(now, &skip)? else {
                return Ok(None);
            };
            if let Some(task) = self.try_claim(candidate.id, worker_id, now)? {
                return Ok(Some(task));
            }
            // Lost the race on this one; move on.
            skip.push(candidate.id);
        }
    }

    /// Guarded `queued -> claimed` on one specific task.
    ///
    /// Records the owner and a fresh heartbeat. The attempt count is *not*
    /// incremented here — it counts finished attempts. Returns None (after
    /// appending a rejected-transition event) if the guard fails.
    pub fn try_claim(
        &self,
        id: TaskId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let write_txn = self.db.begin_write()?;
        let claimed = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut counters = write_txn.open_table(COUNTER_TABLE)?;
            let mut events = write_txn.open_table(EVENTS_TABLE)?;

            match Self::load(&tasks, id)? {
                Some(mut task) if task.status.is_claimable() && task.run_after <= now => {
                    task.status = TaskStatus::Claimed {
                        worker_id: worker_id.to_string(),
                        claimed_at: now,
                    };
                    task.heartbeat_at = Some(now);
                    task.updated_at = now;
                    let json = serde_json::to_string(&task)?;
                    tasks.insert(task.id.0, json.as_str())?;
                    append_in_txn(
                        &mut events,
                        &mut counters,
                        TaskEvent::new(task.id, TaskEventKind::Claimed)
                            .with_transition("queued", "claimed")
                            .with_detail(json!({
                                "worker_id": worker_id,
                                "attempt_count": task.attempt_count,
                            })),
                    )?;
                    Some(task)
                }
                other => {
                    Self::reject(
                        &mut events,
                        &mut counters,
                        id,
                        worker_id,
                        "queued",
                        "claimed",
                        other.as_ref(),
                    )?;
                    None
                }
            }
        };
        write_txn.commit()?;
        Ok(claimed)
    }

    fn select_candidate(&self, now: DateTime<Utc>, skip: &[TaskId]) -> Result<Option<Task>> {
        let read_txn = self.db.begin_read()?;
        let tasks = read_txn.open_table(TASKS_TABLE)?;
        let mut candidate: Option<Task> = None;

        let iter = tasks.iter()?;
        for entry in iter {
            let (_, value) = entry?;
            let task: Task = serde_json::from_str(value.value())?;
            if !task.status.is_claimable() || task.run_after > now || skip.contains(&task.id) {
                continue;
            }
            let better = match &candidate {
                None => true,
                Some(best) => {
                    (task.priority, std::cmp::Reverse(task.created_at))
                        > (best.priority, std::cmp::Reverse(best.created_at))
                }
            };
            if better {
                candidate = Some(task);
            }
        }
        Ok(candidate)
    }

    /// Freeze routing into the task at first claim.
    ///
    /// A no-op (returning the stored routing) if the task already carries
    /// one — retries reuse the frozen decision verbatim.
    pub fn freeze_routing(
        &self,
        id: TaskId,
        worker_id: &str,
        routing: &FrozenRouting,
    ) -> Result<Option<FrozenRouting>> {
        let write_txn = self.db.begin_write()?;
        let frozen = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut counters = write_txn.open_table(COUNTER_TABLE)?;
            let mut events = write_txn.open_table(EVENTS_TABLE)?;

            match Self::load(&tasks, id)? {
                Some(mut task) if task.status.owner() == Some(worker_id) => {
                    if let Some(existing) = task.routing.clone() {
                        Some(existing)
                    } else {
                        task.routing = Some(routing.clone());
                        task.updated_at = Utc::now();
                        let json = serde_json::to_string(&task)?;
                        tasks.insert(id.0, json.as_str())?;
                        append_in_txn(
                            &mut events,
                            &mut counters,
                            TaskEvent::new(id, TaskEventKind::RoutingFrozen).with_detail(json!({
                                "agent": routing.agent,
                                "profile": routing.profile.label(),
                                "model": routing.model,
                            })),
                        )?;
                        Some(routing.clone())
                    }
                }
                other => {
                    Self::reject(
                        &mut events,
                        &mut counters,
                        id,
                        worker_id,
                        "claimed",
                        "claimed",
                        other.as_ref(),
                    )?;
                    None
                }
            }
        };
        write_txn.commit()?;
        Ok(frozen)
    }

    /// Refresh the heartbeat on a claim we own. Returns the current
    /// cancel-requested flag, or None if the task is no longer ours.
    pub fn heartbeat(&self, id: TaskId, worker_id: &str) -> Result<Option<bool>> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            match Self::load(&tasks, id)? {
                Some(mut task) if task.status.owner() == Some(worker_id) => {
                    let now = Utc::now();
                    task.heartbeat_at = Some(now);
                    task.updated_at = now;
                    let cancel_requested = task.cancel_requested;
                    let json = serde_json::to_string(&task)?;
                    tasks.insert(id.0, json.as_str())?;
                    Some(cancel_requested)
                }
                _ => None,
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Guarded `claimed -> succeeded`. Stores the result reference.
    pub fn complete(&self, id: TaskId, worker_id: &str, result_path: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let committed = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut counters = write_txn.open_table(COUNTER_TABLE)?;
            let mut events = write_txn.open_table(EVENTS_TABLE)?;

            match Self::load(&tasks, id)? {
                Some(mut task) if task.status.owner() == Some(worker_id) => {
                    let now = Utc::now();
                    task.status = TaskStatus::Succeeded;
                    task.result_path = Some(result_path.to_string());
                    task.last_failure_class = None;
                    task.error_summary = None;
                    task.finished_at = Some(now);
                    task.updated_at = now;
                    let json = serde_json::to_string(&task)?;
                    tasks.insert(id.0, json.as_str())?;
                    append_in_txn(
                        &mut events,
                        &mut counters,
                        TaskEvent::new(id, TaskEventKind::Succeeded)
                            .with_transition("claimed", "succeeded")
                            .with_detail(json!({ "result_path": result_path })),
                    )?;
                    true
                }
                other => {
                    Self::reject(
                        &mut events,
                        &mut counters,
                        id,
                        worker_id,
                        "claimed",
                        "succeeded",
                        other.as_ref(),
                    )?;
                    false
                }
            }
        };
        write_txn.commit()?;
        Ok(committed)
    }

    /// Guarded commit of a classified failure.
    ///
    /// Increments the attempt count atomically with recording the failure,
    /// then re-queues (retryable class, attempts remain), cancels (a cancel
    /// request arrived mid-attempt), or fails terminally. `schedule` is
    /// applied only on the re-queue path.
    pub fn record_failure(
        &self,
        id: TaskId,
        worker_id: &str,
        class: FailureClass,
        error_summary: &str,
        exit_code: Option<i32>,
        schedule: RetrySchedule,
        detail: serde_json::Value,
    ) -> Result<CommitOutcome> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut counters = write_txn.open_table(COUNTER_TABLE)?;
            let mut events = write_txn.open_table(EVENTS_TABLE)?;

            match Self::load(&tasks, id)? {
                Some(mut task) if task.status.owner() == Some(worker_id) => {
                    let now = Utc::now();
                    task.attempt_count += 1;
                    task.last_failure_class = Some(class);
                    task.error_summary = Some(error_summary.to_string());
                    task.last_exit_code = exit_code;
                    task.updated_at = now;

                    let outcome = if task.cancel_requested {
                        task.status = TaskStatus::Canceled;
                        task.finished_at = Some(now);
                        append_in_txn(
                            &mut events,
                            &mut counters,
                            TaskEvent::new(id, TaskEventKind::Canceled)
                                .with_transition("claimed", "canceled")
                                .with_detail(json!({ "honored_by": worker_id })),
                        )?;
                        CommitOutcome::Canceled
                    } else if class.is_retryable() && task.can_retry() {
                        task.status = TaskStatus::Queued;
                        task.run_after = schedule.run_after;
                        task.timeout_secs = schedule.timeout_secs;
                        task.heartbeat_at = None;
                        append_in_txn(
                            &mut events,
                            &mut counters,
                            TaskEvent::new(id, TaskEventKind::RetryScheduled)
                                .with_transition("claimed", "queued")
                                .with_detail(json!({
                                    "failure_class": class.label(),
                                    "attempt_count": task.attempt_count,
                                    "run_after": schedule.run_after.to_rfc3339(),
                                    "error_summary": error_summary,
                                    "detail": detail,
                                })),
                        )?;
                        CommitOutcome::Retried
                    } else {
                        task.status = TaskStatus::Failed;
                        task.finished_at = Some(now);
                        append_in_txn(
                            &mut events,
                            &mut counters,
                            TaskEvent::new(id, TaskEventKind::Failed)
                                .with_transition("claimed", "failed")
                                .with_detail(json!({
                                    "failure_class": class.label(),
                                    "attempt_count": task.attempt_count,
                                    "last_exit_code": exit_code,
                                    "error_summary": error_summary,
                                    "detail": detail,
                                })),
                        )?;
                        CommitOutcome::Failed
                    };

                    let json = serde_json::to_string(&task)?;
                    tasks.insert(id.0, json.as_str())?;
                    outcome
                }
                other => {
                    Self::reject(
                        &mut events,
                        &mut counters,
                        id,
                        worker_id,
                        "claimed",
                        "queued|failed",
                        other.as_ref(),
                    )?;
                    CommitOutcome::Rejected
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Guarded commit of a timed-out attempt.
    ///
    /// Walks `claimed -> timeout -> queued|failed` in one transaction so the
    /// row can never rest in `timeout` under normal operation; both edges
    /// appear in the event log.
    pub fn record_timeout(
        &self,
        id: TaskId,
        worker_id: &str,
        exit_code: Option<i32>,
        schedule: RetrySchedule,
    ) -> Result<CommitOutcome> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut counters = write_txn.open_table(COUNTER_TABLE)?;
            let mut events = write_txn.open_table(EVENTS_TABLE)?;

            match Self::load(&tasks, id)? {
                Some(mut task) if task.status.owner() == Some(worker_id) => {
                    let now = Utc::now();
                    task.attempt_count += 1;
                    task.last_failure_class = Some(FailureClass::TimeoutOrProbe);
                    task.error_summary = Some(format!(
                        "attempt exceeded its {}s budget",
                        task.timeout_secs
                    ));
                    task.last_exit_code = exit_code;
                    task.updated_at = now;

                    append_in_txn(
                        &mut events,
                        &mut counters,
                        TaskEvent::new(id, TaskEventKind::TimedOut)
                            .with_transition("claimed", "timeout")
                            .with_detail(json!({
                                "timeout_secs": task.timeout_secs,
                                "attempt_count": task.attempt_count,
                            })),
                    )?;

                    let outcome = if task.cancel_requested {
                        task.status = TaskStatus::Canceled;
                        task.finished_at = Some(now);
                        append_in_txn(
                            &mut events,
                            &mut counters,
                            TaskEvent::new(id, TaskEventKind::Canceled)
                                .with_transition("timeout", "canceled")
                                .with_detail(json!({ "honored_by": worker_id })),
                        )?;
                        CommitOutcome::Canceled
                    } else if task.can_retry() {
                        task.status = TaskStatus::Queued;
                        task.run_after = schedule.run_after;
                        task.timeout_secs = schedule.timeout_secs;
                        task.heartbeat_at = None;
                        append_in_txn(
                            &mut events,
                            &mut counters,
                            TaskEvent::new(id, TaskEventKind::RetryScheduled)
                                .with_transition("timeout", "queued")
                                .with_detail(json!({
                                    "failure_class": FailureClass::TimeoutOrProbe.label(),
                                    "attempt_count": task.attempt_count,
                                    "next_timeout_secs": schedule.timeout_secs,
                                    "run_after": schedule.run_after.to_rfc3339(),
                                })),
                        )?;
                        CommitOutcome::Retried
                    } else {
                        task.status = TaskStatus::Failed;
                        task.finished_at = Some(now);
                        append_in_txn(
                            &mut events,
                            &mut counters,
                            TaskEvent::new(id, TaskEventKind::Failed)
                                .with_transition("timeout", "failed")
                                .with_detail(json!({
                                    "failure_class": FailureClass::TimeoutOrProbe.label(),
                                    "attempt_count": task.attempt_count,
                                })),
                        )?;
                        CommitOutcome::Failed
                    };

                    let json = serde_json::to_string(&task)?;
                    tasks.insert(id.0, json.as_str())?;
                    outcome
                }
                other => {
                    Self::reject(
                        &mut events,
                        &mut counters,
                        id,
                        worker_id,
                        "claimed",
                        "timeout",
                        other.as_ref(),
                    )?;
                    CommitOutcome::Rejected
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Caller-facing cancel. A `queued` task cancels directly; a `claimed`
    /// task only records the request — the owning worker honors it at its
    /// next checkpoint. Any other status is an error to the caller.
    pub fn cancel(&self, id: TaskId) -> Result<CancelOutcome> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut counters = write_txn.open_table(COUNTER_TABLE)?;
            let mut events = write_txn.open_table(EVENTS_TABLE)?;

            let Some(mut task) = Self::load(&tasks, id)? else {
                bail!("task not found: {id}");
            };
            let now = Utc::now();
            match task.status {
                TaskStatus::Queued => {
                    task.status = TaskStatus::Canceled;
                    task.finished_at = Some(now);
                    task.updated_at = now;
                    let json = serde_json::to_string(&task)?;
                    tasks.insert(id.0, json.as_str())?;
                    append_in_txn(
                        &mut events,
                        &mut counters,
                        TaskEvent::new(id, TaskEventKind::Canceled)
                            .with_transition("queued", "canceled"),
                    )?;
                    CancelOutcome::Canceled
                }
                TaskStatus::Claimed { .. } => {
                    task.cancel_requested = true;
                    task.updated_at = now;
                    let json = serde_json::to_string(&task)?;
                    tasks.insert(id.0, json.as_str())?;
                    append_in_txn(
                        &mut events,
                        &mut counters,
                        TaskEvent::new(id, TaskEventKind::CancelRequested)
                            .with_transition("claimed", "claimed"),
                    )?;
                    CancelOutcome::CancelRequested
                }
                ref status => bail!("task {id} cannot be canceled from status {}", status.label()),
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Worker-side cancel commit, once a cancel request has been observed
    /// and the external process terminated.
    pub fn finish_cancel(&self, id: TaskId, worker_id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let committed = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut counters = write_txn.open_table(COUNTER_TABLE)?;
            let mut events = write_txn.open_table(EVENTS_TABLE)?;

            match Self::load(&tasks, id)? {
                Some(mut task) if task.status.owner() == Some(worker_id) => {
                    let now = Utc::now();
                    task.status = TaskStatus::Canceled;
                    task.finished_at = Some(now);
                    task.updated_at = now;
                    let json = serde_json::to_string(&task)?;
                    tasks.insert(id.0, json.as_str())?;
                    append_in_txn(
                        &mut events,
                        &mut counters,
                        TaskEvent::new(id, TaskEventKind::Canceled)
                            .with_transition("claimed", "canceled")
                            .with_detail(json!({ "honored_by": worker_id })),
                    )?;
                    true
                }
                other => {
                    Self::reject(
                        &mut events,
                        &mut counters,
                        id,
                        worker_id,
                        "claimed",
                        "canceled",
                        other.as_ref(),
                    )?;
                    false
                }
            }
        };
        write_txn.commit()?;
        Ok(committed)
    }

    /// Release a claim back to the queue without finishing the attempt
    /// (worker shutdown mid-execution). The attempt count is untouched.
    pub fn release(&self, id: TaskId, worker_id: &str, reason: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let released = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut counters = write_txn.open_table(COUNTER_TABLE)?;
            let mut events = write_txn.open_table(EVENTS_TABLE)?;

            match Self::load(&tasks, id)? {
                Some(mut task) if task.status.owner() == Some(worker_id) => {
                    let now = Utc::now();
                    task.status = TaskStatus::Queued;
                    task.heartbeat_at = None;
                    task.run_after = now;
                    task.updated_at = now;
                    let json = serde_json::to_string(&task)?;
                    tasks.insert(id.0, json.as_str())?;
                    append_in_txn(
                        &mut events,
                        &mut counters,
                        TaskEvent::new(id, TaskEventKind::Released)
                            .with_transition("claimed", "queued")
                            .with_detail(json!({
                                "worker_id": worker_id,
                                "reason": reason,
                            })),
                    )?;
                    true
                }
                other => {
                    Self::reject(
                        &mut events,
                        &mut counters,
                        id,
                        worker_id,
                        "claimed",
                        "queued",
                        other.as_ref(),
                    )?;
                    false
                }
            }
        };
        write_txn.commit()?;
        Ok(released)
    }

    /// Manual operator retry: re-queue a settled task with a fresh attempt
    /// budget. Frozen routing is kept — it never changes after first claim.
    pub fn retry(&self, id: TaskId) -> Result<Task> {
        let write_txn = self.db.begin_write()?;
        let task = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut counters = write_txn.open_table(COUNTER_TABLE)?;
            let mut events = write_txn.open_table(EVENTS_TABLE)?;

            let Some(mut task) = Self::load(&tasks, id)? else {
                bail!("task not found: {id}");
            };
            if !task.status.is_retriable_manually() {
                bail!(
                    "only failed/timeout/canceled tasks can be retried, got {}",
                    task.status.label()
                );
            }
            let previous = task.status.label();
            let now = Utc::now();
            task.status = TaskStatus::Queued;
            task.attempt_count = 0;
            task.run_after = now;
            task.cancel_requested = false;
            task.heartbeat_at = None;
            task.last_failure_class = None;
            task.error_summary = None;
            task.last_exit_code = None;
            task.finished_at = None;
            task.updated_at = now;
            let json = serde_json::to_string(&task)?;
            tasks.insert(id.0, json.as_str())?;
            append_in_txn(
                &mut events,
                &mut counters,
                TaskEvent::new(id, TaskEventKind::ManualRetry).with_transition(previous, "queued"),
            )?;
            task
        };
        write_txn.commit()?;
        Ok(task)
    }

    /// Reclaim claims whose heartbeat went stale (worker crash recovery).
    ///
    /// Uses the same guarded mechanism as everything else; a reclaimed task
    /// with a pending cancel request resolves straight to `canceled`.
    pub fn reclaim_stale(&self, stale_after_secs: u64, now: DateTime<Utc>) -> Result<u32> {
        let threshold = ChronoDuration::seconds(stale_after_secs as i64);
        let write_txn = self.db.begin_write()?;
        let mut reclaimed = 0;
        {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut counters = write_txn.open_table(COUNTER_TABLE)?;
            let mut events = write_txn.open_table(EVENTS_TABLE)?;

            let mut stale: Vec<Task> = Vec::new();
            {
                let iter = tasks.iter()?;
                for entry in iter {
                    let (_, value) = entry?;
                    let task: Task = serde_json::from_str(value.value())?;
                    let TaskStatus::Claimed { claimed_at, .. } = &task.status else {
                        continue;
                    };
                    let last_seen = task.heartbeat_at.unwrap_or(*claimed_at);
                    if now - last_seen > threshold {
                        stale.push(task);
                    }
                }
            }

            for mut task in stale {
                let id = task.id;
                let observed_worker = task.status.owner().unwrap_or("").to_string();
                let (to_status, to_label) = if task.cancel_requested {
                    task.finished_at = Some(now);
                    (TaskStatus::Canceled, "canceled")
                } else {
                    (TaskStatus::Queued, "queued")
                };
                task.status = to_status;
                task.heartbeat_at = None;
                task.run_after = now;
                task.updated_at = now;
                let json = serde_json::to_string(&task)?;
                tasks.insert(id.0, json.as_str())?;
                append_in_txn(
                    &mut events,
                    &mut counters,
                    TaskEvent::new(id, TaskEventKind::StaleReclaimed)
                        .with_transition("claimed", to_label)
                        .with_detail(json!({
                            "observed_worker_id": observed_worker,
                            "stale_after_secs": stale_after_secs,
                        })),
                )?;
                reclaimed += 1;
            }
        }
        write_txn.commit()?;
        Ok(reclaimed)
    }

    /// Count tasks by status label.
    pub fn status_counts(&self) -> Result<HashMap<String, usize>> {
        let read_txn = self.db.begin_read()?;
        let tasks = read_txn.open_table(TASKS_TABLE)?;
        let mut counts = HashMap::new();

        let iter = tasks.iter()?;
        for entry in iter {
            let (_, value) = entry?;
            let task: Task = serde_json::from_str(value.value())?;
            *counts.entry(task.status.label().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn load(tasks: &Table<'_, i64, &str>, id: TaskId) -> Result<Option<Task>> {
        match tasks.get(id.0)? {
            Some(guard) => {
                let task: Task = serde_json::from_str(guard.value())
                    .context("failed to deserialize task row")?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Append a rejected-transition event. The guard failing is expected
    /// behavior under racing workers, never an error.
    fn reject(
        events: &mut Table<'_, i64, &str>,
        counters: &mut Table<'_, &str, i64>,
        id: TaskId,
        worker_id: &str,
        expected: &str,
        attempted: &str,
        observed: Option<&Task>,
    ) -> Result<()> {
        append_in_txn(
            events,
            counters,
            TaskEvent::new(id, TaskEventKind::RejectedTransition).with_detail(json!({
                "worker_id": worker_id,
                "expected_status": expected,
                "attempted_status": attempted,
                "observed_status": observed.map(|t| t.status.label()),
                "observed_owner": observed.and_then(|t| t.status.owner()),
            })),
        )?;
        Ok(())
    }
}
