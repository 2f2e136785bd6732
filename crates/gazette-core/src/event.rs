//! Append-only task event records.
//!
//! Every state transition — including rejected ones — is appended here and
//! never mutated or deleted. The log is the audit trail behind `task show`
//! and the input for watchdog-style drift detection outside the core.

use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Enqueued,
    Claimed,
    RoutingFrozen,
    Succeeded,
    Failed,
    RetryScheduled,
    TimedOut,
    CancelRequested,
    Canceled,
    ManualRetry,
    StaleReclaimed,
    /// Claim released back to the queue without a finished attempt
    /// (worker shutdown mid-execution).
    Released,
    /// A guarded update found the row already moved by someone else.
    RejectedTransition,
}

impl TaskEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskEventKind::Enqueued => "enqueued",
            TaskEventKind::Claimed => "claimed",
            TaskEventKind::RoutingFrozen => "routing_frozen",
            TaskEventKind::Succeeded => "succeeded",
            TaskEventKind::Failed => "failed",
            TaskEventKind::RetryScheduled => "retry_scheduled",
            TaskEventKind::TimedOut => "timed_out",
            TaskEventKind::CancelRequested => "cancel_requested",
            TaskEventKind::Canceled => "canceled",
            TaskEventKind::ManualRetry => "manual_retry",
            TaskEventKind::StaleReclaimed => "stale_reclaimed",
            TaskEventKind::Released => "released",
            TaskEventKind::RejectedTransition => "rejected_transition",
        }
    }
}

impl fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One appended event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Assigned by the store on append.
    pub id: i64,
    pub task_id: TaskId,
    pub kind: TaskEventKind,
    pub status_from: Option<String>,
    pub status_to: Option<String>,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl TaskEvent {
    pub fn new(task_id: TaskId, kind: TaskEventKind) -> Self {
        Self {
            id: 0,
            task_id,
            kind,
            status_from: None,
            status_to: None,
            at: Utc::now(),
            detail: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_transition(mut self, from: &str, to: &str) -> Self {
        self.status_from = Some(from.to_string());
        self.status_to = Some(to.to_string());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self.at.format("%H:%M:%S%.3f");
        match (&self.status_from, &self.status_to) {
            (Some(from), Some(to)) => {
                write!(f, "[{ts}] {} {}: {from} -> {to}", self.task_id, self.kind)
            }
            _ => write!(f, "[{ts}] {} {}", self.task_id, self.kind),
        }
    }
}
