use crate::contract::SourceIndexEntry;
use crate::routing::FrozenRouting;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique task identifier, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{:06}", self.0)
    }
}

/// What kind of content-generation work a task requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Highlights,
    StoryDetails,
    MonitorAnswer,
    Qa,
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Highlights => "highlights",
            TaskKind::StoryDetails => "story_details",
            TaskKind::MonitorAnswer => "monitor_answer",
            TaskKind::Qa => "qa",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "highlights" => Ok(TaskKind::Highlights),
            "story_details" => Ok(TaskKind::StoryDetails),
            "monitor_answer" => Ok(TaskKind::MonitorAnswer),
            "qa" => Ok(TaskKind::Qa),
            other => Err(format!("unknown task kind: {other:?}")),
        }
    }
}

/// Normalized failure classes driving retry policy.
///
/// Classification order over raw process output is fixed in
/// `classify::RULES`; reordering changes observed retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    ModelNotAvailable,
    TimeoutOrProbe,
    AccessOrAuth,
    BillingOrQuota,
    OutputInvalid,
    OtherFailure,
    /// Bad routing request; assigned directly, never by the classifier.
    ConfigurationError,
}

impl FailureClass {
    pub fn label(&self) -> &'static str {
        match self {
            FailureClass::ModelNotAvailable => "model_not_available",
            FailureClass::TimeoutOrProbe => "timeout_or_probe",
            FailureClass::AccessOrAuth => "access_or_auth",
            FailureClass::BillingOrQuota => "billing_or_quota",
            FailureClass::OutputInvalid => "output_invalid",
            FailureClass::OtherFailure => "other_failure",
            FailureClass::ConfigurationError => "configuration_error",
        }
    }

    /// Whether a task with attempts remaining is re-queued after this class.
    ///
    /// `model_not_available` is final for the task's frozen routing, and a
    /// `configuration_error` can never be fixed by retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FailureClass::ModelNotAvailable | FailureClass::ConfigurationError
        )
    }

    /// Whether this class feeds the consecutive-failure drift counter.
    ///
    /// Auth and quota outages must never look like model drift, and a
    /// timeout carries no signal about the routed model at all.
    pub fn counts_toward_drift(&self) -> bool {
        matches!(
            self,
            FailureClass::ModelNotAvailable
                | FailureClass::OutputInvalid
                | FailureClass::OtherFailure
        )
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Task status as a state machine.
///
/// Transitions:
///   queued -> claimed -> succeeded
///   claimed -> queued          (retryable failure, attempts remain)
///   claimed -> failed          (fatal class, or attempts exhausted)
///   claimed -> timeout -> queued | failed
///   queued | claimed -> canceled
///   failed | timeout | canceled -> queued   (manual retry)
///
/// Terminal states never regress. Every transition goes through the store's
/// guarded update; a bare status write does not exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    Queued,
    Claimed {
        worker_id: String,
        claimed_at: DateTime<Utc>,
    },
    Succeeded,
    Failed,
    Timeout,
    Canceled,
}

impl TaskStatus {
    /// Short label for display and filtering.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Claimed { .. } => "claimed",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// Whether a worker may claim a task in this status.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::Queued)
    }

    /// Whether the manual `retry` operation applies.
    pub fn is_retriable_manually(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Canceled
        )
    }

    /// The worker holding the claim, if any.
    pub fn owner(&self) -> Option<&str> {
        match self {
            TaskStatus::Claimed { worker_id, .. } => Some(worker_id),
            _ => None,
        }
    }
}

/// Requested routing hints, carried until frozen at first claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRequest {
    pub agent: Option<String>,
    pub profile: Option<crate::routing::Profile>,
    pub model: Option<String>,
}

/// Prompt, source material, and type-specific parameters for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub prompt: String,
    /// Ordered source entries; the workdir index is rebuilt from these on
    /// every attempt, so they ride with the task row.
    pub sources: Vec<SourceIndexEntry>,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl TaskPayload {
    pub fn new(prompt: impl Into<String>, sources: Vec<SourceIndexEntry>) -> Self {
        Self {
            prompt: prompt.into(),
            sources,
            params: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.source_id.as_str()).collect()
    }
}

/// One unit of orchestrated work in the durable queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    /// Higher priority is claimed first; ties break on creation order.
    pub priority: i32,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub routing_request: RoutingRequest,
    /// Frozen at first claim; immutable for the rest of the task's life,
    /// including manual retries.
    pub routing: Option<FrozenRouting>,
    /// Finished attempts. Incremented inside the guarded transition that
    /// records each failure, never at claim.
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Per-attempt wall-clock budget. Grows after timeouts (capped).
    pub timeout_secs: u64,
    /// Earliest claimable instant; pushed forward by retry backoff.
    pub run_after: DateTime<Utc>,
    /// Set by `cancel` on a claimed task; honored by the owning worker at
    /// its next checkpoint.
    pub cancel_requested: bool,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub last_failure_class: Option<FailureClass>,
    pub error_summary: Option<String>,
    pub last_exit_code: Option<i32>,
    /// Persisted output reference, set only on success.
    pub result_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Whether another attempt fits in the budget.
    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

/// Enqueue payload; the store assigns id, timestamps, and queued status.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub kind: TaskKind,
    pub payload: TaskPayload,
    pub priority: i32,
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub routing: RoutingRequest,
}

impl EnqueueRequest {
    pub fn new(kind: TaskKind, payload: TaskPayload) -> Self {
        Self {
            kind,
            payload,
            priority: 0,
            max_attempts: 3,
            timeout_secs: 600,
            routing: RoutingRequest::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_routing(mut self, routing: RoutingRequest) -> Self {
        self.routing = routing;
        self
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_kind() -> impl Strategy<Value = TaskKind> {
        prop_oneof![
            Just(TaskKind::Highlights),
            Just(TaskKind::StoryDetails),
            Just(TaskKind::MonitorAnswer),
            Just(TaskKind::Qa),
        ]
    }

    proptest! {
        /// Kind labels round-trip through FromStr.
        #[test]
        fn kind_label_roundtrip(kind in arb_kind()) {
            let parsed: TaskKind = kind.label().parse().unwrap();
            prop_assert_eq!(kind, parsed);
        }

        /// attempt_count >= max_attempts always means no retry.
        #[test]
        fn retry_budget_bounded(attempts in 0u32..10, max in 1u32..5) {
            let request = EnqueueRequest::new(
                TaskKind::Qa,
                TaskPayload::new("p", vec![]),
            ).with_max_attempts(max);
            let mut task = Task {
                id: TaskId(1),
                kind: request.kind,
                priority: request.priority,
                status: TaskStatus::Queued,
                payload: request.payload,
                routing_request: request.routing,
                routing: None,
                attempt_count: 0,
                max_attempts: request.max_attempts,
                timeout_secs: request.timeout_secs,
                run_after: Utc::now(),
                cancel_requested: false,
                heartbeat_at: None,
                last_failure_class: None,
                error_summary: None,
                last_exit_code: None,
                result_path: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                finished_at: None,
            };
            task.attempt_count = attempts;
            if attempts >= max {
                prop_assert!(!task.can_retry());
            } else {
                prop_assert!(task.can_retry());
            }
        }

        /// Status serialization round-trips.
        #[test]
        fn status_serde_roundtrip(label_idx in 0usize..6) {
            let status = match label_idx {
                0 => TaskStatus::Queued,
                1 => TaskStatus::Claimed {
                    worker_id: "w".into(),
                    claimed_at: Utc::now(),
                },
                2 => TaskStatus::Succeeded,
                3 => TaskStatus::Failed,
                4 => TaskStatus::Timeout,
                _ => TaskStatus::Canceled,
            };
            let json = serde_json::to_string(&status).unwrap();
            let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(status.label(), parsed.label());
        }
    }
}
