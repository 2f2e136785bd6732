//! The worker control loop.
//!
//! Each iteration: claim -> materialize the workdir contract (freezing
//! routing at first claim) -> invoke the backend under the per-attempt
//! deadline, refreshing heartbeats while it runs -> validate -> classify ->
//! commit through a guarded transition -> append attempt telemetry.
//!
//! Failures never propagate to the caller as errors: they end up in the
//! task row, the event log, and the attempt record. A rejected guard means
//! "task no longer mine" and the worker just moves on.

use crate::backend::{AgentBackend, ExecutionOutcome, ExecutionRequest};
use crate::sanitize::sanitize_preview;
use crate::subprocess::TerminationPolicy;
use crate::validator::validate_output;
use crate::workdir::WorkdirManager;
use anyhow::Result;
use chrono::{DateTime, Utc};
use gazette_core::classify::{FailureEvidence, classify};
use gazette_core::config::WorkerConfig;
use gazette_core::drift::DriftTracker;
use gazette_core::routing::{self, FrozenRouting, RoutingConfig};
use gazette_core::task::{FailureClass, Task};
use gazette_db::attempt_store::{AttemptRecord, AttemptStore};
use gazette_db::task_store::{CommitOutcome, RetrySchedule, TaskStore};
use rand::Rng;
use redb::Database;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bounds for one `run` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerOptions {
    /// Stop after processing this many tasks (None = unlimited).
    pub max_tasks: Option<u32>,
    /// Consecutive empty polls before exiting (None = poll forever).
    pub max_idle_polls: Option<u32>,
}

/// Aggregate counters for CLI reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub retried: u32,
    pub timeouts: u32,
    pub canceled: u32,
    pub released: u32,
    pub idle_polls: u32,
}

impl WorkerSummary {
    fn merge(&mut self, other: &WorkerSummary) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.retried += other.retried;
        self.timeouts += other.timeouts;
        self.canceled += other.canceled;
        self.released += other.released;
        self.idle_polls += other.idle_polls;
    }
}

/// Consumes queued tasks and drives agent attempts to a committed outcome.
pub struct Worker {
    db: Arc<Database>,
    backend: Arc<dyn AgentBackend>,
    workdir: WorkdirManager,
    routing: RoutingConfig,
    config: WorkerConfig,
    worker_id: String,
    shutdown: CancellationToken,
    drift: DriftTracker,
}

impl Worker {
    pub fn new(
        db: Arc<Database>,
        backend: Arc<dyn AgentBackend>,
        workdir: WorkdirManager,
        routing: RoutingConfig,
        config: WorkerConfig,
        worker_id: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            db,
            backend,
            workdir,
            routing,
            config,
            worker_id: worker_id.into(),
            shutdown,
            drift: DriftTracker::new(),
        }
    }

    /// Drift counters observed by this worker, for dashboards and tests.
    pub fn drift(&self) -> &DriftTracker {
        &self.drift
    }

    /// Run until the queue is idle, the task bound is reached, or shutdown.
    pub async fn run(&mut self, options: WorkerOptions) -> Result<WorkerSummary> {
        tracing::info!(
            worker_id = %self.worker_id,
            backend = self.backend.name(),
            max_tasks = ?options.max_tasks,
            "worker started"
        );
        let mut aggregate = WorkerSummary::default();
        let mut consecutive_idle = 0;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Some(max) = options.max_tasks
                && aggregate.processed >= max
            {
                break;
            }

            let summary = self.run_once().await?;
            aggregate.merge(&summary);

            if summary.processed == 0 {
                consecutive_idle += 1;
                if let Some(limit) = options.max_idle_polls
                    && consecutive_idle >= limit
                {
                    break;
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                }
            } else {
                consecutive_idle = 0;
            }
        }

        tracing::info!(
            worker_id = %self.worker_id,
            processed = aggregate.processed,
            succeeded = aggregate.succeeded,
            failed = aggregate.failed,
            "worker stopped"
        );
        Ok(aggregate)
    }

    /// Process at most one task from the queue.
    pub async fn run_once(&mut self) -> Result<WorkerSummary> {
        let mut summary = WorkerSummary::default();
        let db = Arc::clone(&self.db);
        let store = TaskStore::new(&db);

        if self.config.stale_claim_secs > 0 {
            let reclaimed = store.reclaim_stale(self.config.stale_claim_secs, Utc::now())?;
            if reclaimed > 0 {
                tracing::info!(reclaimed, "reclaimed stale claims");
            }
        }
        if self.shutdown.is_cancelled() {
            summary.idle_polls = 1;
            return Ok(summary);
        }

        let Some(task) = store.claim_next(&self.worker_id, Utc::now())? else {
            summary.idle_polls = 1;
            return Ok(summary);
        };

        summary.processed = 1;
        tracing::info!(
            task_id = %task.id,
            kind = task.kind.label(),
            attempt = task.attempt_count + 1,
            "claimed task"
        );
        self.process_claimed(&store, task, &mut summary).await?;
        Ok(summary)
    }

    async fn process_claimed(
        &mut self,
        store: &TaskStore<'_>,
        task: Task,
        summary: &mut WorkerSummary,
    ) -> Result<()> {
        let attempt_no = task.attempt_count + 1;
        let started_at = Utc::now();

        // Routing: reuse the frozen decision, or resolve and freeze it now.
        let routing = match task.routing.clone() {
            Some(frozen) => match store.freeze_routing(task.id, &self.worker_id, &frozen)? {
                Some(frozen) => frozen,
                None => return Ok(()), // no longer ours
            },
            None => match routing::resolve(&self.routing, &task.routing_request) {
                Ok(resolved) => match store.freeze_routing(task.id, &self.worker_id, &resolved)? {
                    Some(frozen) => frozen,
                    None => return Ok(()),
                },
                Err(error) => {
                    // configuration_error bypasses the classifier entirely.
                    let outcome = store.record_failure(
                        task.id,
                        &self.worker_id,
                        FailureClass::ConfigurationError,
                        &sanitize_preview(&error.to_string()),
                        None,
                        self.retry_schedule(task.attempt_count, task.timeout_secs, false),
                        serde_json::json!({"error": "routing_unresolvable"}),
                    )?;
                    if outcome == CommitOutcome::Failed {
                        summary.failed = 1;
                    }
                    tracing::warn!(task_id = %task.id, %error, "routing configuration error");
                    return Ok(());
                }
            },
        };

        // Materialize the per-attempt contract.
        let materialized = match self.workdir.materialize(&task, attempt_no) {
            Ok(materialized) => materialized,
            Err(error) => {
                let outcome = store.record_failure(
                    task.id,
                    &self.worker_id,
                    FailureClass::OtherFailure,
                    &sanitize_preview(&format!("workdir materialization failed: {error:#}")),
                    None,
                    self.retry_schedule(task.attempt_count, task.timeout_secs, false),
                    serde_json::json!({}),
                )?;
                match outcome {
                    CommitOutcome::Retried => summary.retried = 1,
                    CommitOutcome::Failed => summary.failed = 1,
                    CommitOutcome::Canceled => summary.canceled = 1,
                    CommitOutcome::Rejected => {}
                }
                return Ok(());
            }
        };

        let exec_cancel = CancellationToken::new();
        let request = ExecutionRequest {
            manifest_path: materialized.manifest_path.clone(),
            manifest: materialized.manifest.clone(),
            prompt: task.payload.prompt.clone(),
            routing: routing.clone(),
            timeout: Duration::from_secs(task.timeout_secs),
            termination: TerminationPolicy {
                term_grace: self.config.term_grace(),
                kill_grace: self.config.kill_grace(),
            },
            cancel: exec_cancel.clone(),
        };

        // Invoke, refreshing the heartbeat while the attempt is in flight.
        // The heartbeat checkpoint is also where cancel requests and
        // shutdown are noticed.
        let mut lost_claim = false;
        let mut cancel_requested = false;
        let mut shutdown_signaled = false;
        let backend = Arc::clone(&self.backend);
        let execute = backend.execute(&request);
        tokio::pin!(execute);
        let period = self.config.heartbeat_interval().max(Duration::from_millis(100));
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.tick().await; // first tick is immediate

        let outcome = loop {
            tokio::select! {
                result = &mut execute => break result,
                _ = heartbeat.tick() => {
                    match store.heartbeat(task.id, &self.worker_id)? {
                        Some(requested) => {
                            if requested {
                                cancel_requested = true;
                                exec_cancel.cancel();
                            }
                        }
                        None => {
                            lost_claim = true;
                            exec_cancel.cancel();
                        }
                    }
                }
                _ = self.shutdown.cancelled(), if !shutdown_signaled => {
                    shutdown_signaled = true;
                    exec_cancel.cancel();
                }
            }
        };

        let execution = match outcome {
            Ok(execution) => execution,
            Err(error) => {
                // Backend-internal fault (e.g. executable not found) — the
                // process never produced evidence to classify.
                let error_summary =
                    sanitize_preview(&format!("backend fault: {error:#}"));
                let outcome = store.record_failure(
                    task.id,
                    &self.worker_id,
                    FailureClass::OtherFailure,
                    &error_summary,
                    None,
                    self.retry_schedule(task.attempt_count, task.timeout_secs, false),
                    serde_json::json!({"backend": self.backend.name()}),
                )?;
                self.drift
                    .record_failure(&routing.agent, routing.profile, FailureClass::OtherFailure);
                match outcome {
                    CommitOutcome::Retried => summary.retried = 1,
                    CommitOutcome::Failed => summary.failed = 1,
                    CommitOutcome::Canceled => summary.canceled = 1,
                    CommitOutcome::Rejected => {}
                }
                self.record_attempt(
                    &task,
                    attempt_no,
                    &routing,
                    outcome_label(outcome),
                    Some(FailureClass::OtherFailure),
                    None,
                    false,
                    0.0,
                    Some(error_summary),
                    String::new(),
                    String::new(),
                    started_at,
                )?;
                return Ok(());
            }
        };

        if lost_claim {
            // Reclaimed from under us (stale heartbeat); nothing to commit.
            tracing::warn!(task_id = %task.id, "claim lost mid-attempt");
            return Ok(());
        }

        if execution.canceled {
            if cancel_requested {
                if store.finish_cancel(task.id, &self.worker_id)? {
                    summary.canceled = 1;
                }
                self.record_attempt(
                    &task,
                    attempt_no,
                    &routing,
                    "canceled",
                    None,
                    Some(execution.exit_code),
                    false,
                    execution.wall_time.as_secs_f64(),
                    None,
                    sanitize_preview(&execution.read_stdout()),
                    sanitize_preview(&execution.read_stderr()),
                    started_at,
                )?;
            } else {
                // Shutdown: hand the task back without burning an attempt.
                if store.release(task.id, &self.worker_id, "worker_shutdown")? {
                    summary.released = 1;
                }
            }
            return Ok(());
        }

        self.commit_execution(
            store,
            &task,
            attempt_no,
            &routing,
            &execution,
            &materialized.manifest.output_result_path,
            started_at,
            summary,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_execution(
        &mut self,
        store: &TaskStore<'_>,
        task: &Task,
        attempt_no: u32,
        routing: &FrozenRouting,
        execution: &ExecutionOutcome,
        result_path: &std::path::Path,
        started_at: DateTime<Utc>,
        summary: &mut WorkerSummary,
    ) -> Result<()> {
        let stdout_preview = sanitize_preview(&execution.read_stdout());
        let stderr_preview = sanitize_preview(&execution.read_stderr());

        if execution.timed_out {
            let schedule = self.retry_schedule(task.attempt_count, task.timeout_secs, true);
            let outcome =
                store.record_timeout(task.id, &self.worker_id, Some(execution.exit_code), schedule)?;
            self.drift
                .record_failure(&routing.agent, routing.profile, FailureClass::TimeoutOrProbe);
            match outcome {
                CommitOutcome::Retried => {
                    summary.retried = 1;
                    summary.timeouts = 1;
                }
                CommitOutcome::Failed => {
                    summary.failed = 1;
                    summary.timeouts = 1;
                }
                CommitOutcome::Canceled => summary.canceled = 1,
                CommitOutcome::Rejected => {}
            }
            self.record_attempt(
                task,
                attempt_no,
                routing,
                outcome_label(outcome),
                Some(FailureClass::TimeoutOrProbe),
                Some(execution.exit_code),
                true,
                execution.wall_time.as_secs_f64(),
                Some(format!("attempt exceeded its {}s budget", task.timeout_secs)),
                stdout_preview,
                stderr_preview,
                started_at,
            )?;
            return Ok(());
        }

        // Exit status 0 plus a valid result file is the only success path.
        let validation = if execution.exit_code == 0 {
            let allowed: HashSet<String> = task
                .payload
                .sources
                .iter()
                .map(|s| s.source_id.clone())
                .collect();
            match validate_output(result_path, &allowed) {
                Ok(_) => None,
                Err(error) => Some(error),
            }
        } else {
            None
        };

        if execution.exit_code == 0 && validation.is_none() {
            let result_path = result_path.display().to_string();
            if store.complete(task.id, &self.worker_id, &result_path)? {
                summary.succeeded = 1;
                self.drift.record_success(&routing.agent, routing.profile);
                tracing::info!(task_id = %task.id, attempt = attempt_no, "task succeeded");
            }
            self.record_attempt(
                task,
                attempt_no,
                routing,
                "succeeded",
                None,
                Some(0),
                false,
                execution.wall_time.as_secs_f64(),
                None,
                stdout_preview,
                stderr_preview,
                started_at,
            )?;
            return Ok(());
        }

        // Failed attempt: classify from the captured evidence.
        let (error_summary, output_invalid) = match &validation {
            Some(validation_error) => (validation_error.to_string(), true),
            None => (
                format!("agent exited with code {}", execution.exit_code),
                false,
            ),
        };
        let evidence = FailureEvidence::new(
            &stdout_preview,
            &stderr_preview,
            execution.exit_code,
            false,
            output_invalid,
        );
        let classification = classify(&evidence);
        let error_summary = sanitize_preview(&error_summary);

        let schedule = self.retry_schedule(task.attempt_count, task.timeout_secs, false);
        let outcome = store.record_failure(
            task.id,
            &self.worker_id,
            classification.class,
            &error_summary,
            Some(execution.exit_code),
            schedule,
            serde_json::json!({
                "matched_rule": classification.matched_rule,
                "matched_pattern": classification.matched_pattern,
                "resolved_agent": routing.agent,
                "resolved_model": routing.model,
            }),
        )?;
        self.drift
            .record_failure(&routing.agent, routing.profile, classification.class);
        tracing::warn!(
            task_id = %task.id,
            attempt = attempt_no,
            class = classification.class.label(),
            %error_summary,
            "attempt failed"
        );
        match outcome {
            CommitOutcome::Retried => summary.retried = 1,
            CommitOutcome::Failed => summary.failed = 1,
            CommitOutcome::Canceled => summary.canceled = 1,
            CommitOutcome::Rejected => {}
        }
        self.record_attempt(
            task,
            attempt_no,
            routing,
            outcome_label(outcome),
            Some(classification.class),
            Some(execution.exit_code),
            false,
            execution.wall_time.as_secs_f64(),
            Some(error_summary),
            stdout_preview,
            stderr_preview,
            started_at,
        )?;
        Ok(())
    }

    /// Exponential backoff with full jitter; optionally grows the timeout
    /// budget for the next attempt (after a timeout).
    fn retry_schedule(
        &self,
        finished_attempts: u32,
        timeout_secs: u64,
        grow_timeout: bool,
    ) -> RetrySchedule {
        let exponent = finished_attempts.min(16);
        let max_delay = self
            .config
            .retry_base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.config.retry_max_secs);
        let delay_secs = if max_delay == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_delay)
        };
        let next_timeout = if grow_timeout {
            (timeout_secs.saturating_mul(3) / 2).min(self.config.timeout_retry_cap_secs)
        } else {
            timeout_secs
        };
        RetrySchedule {
            run_after: Utc::now() + chrono::Duration::seconds(delay_secs as i64),
            timeout_secs: next_timeout,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_attempt(
        &self,
        task: &Task,
        attempt_no: u32,
        routing: &FrozenRouting,
        outcome: &str,
        failure_class: Option<FailureClass>,
        exit_code: Option<i32>,
        timed_out: bool,
        wall_time_secs: f64,
        error_summary: Option<String>,
        stdout_preview: String,
        stderr_preview: String,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        AttemptStore::new(&self.db).append(AttemptRecord {
            id: 0,
            task_id: task.id,
            attempt_no,
            worker_id: self.worker_id.clone(),
            agent: routing.agent.clone(),
            model: routing.model.clone(),
            profile: routing.profile.label().to_string(),
            outcome: outcome.to_string(),
            failure_class,
            exit_code,
            timed_out,
            wall_time_secs,
            error_summary,
            stdout_preview,
            stderr_preview,
            started_at,
            finished_at: Utc::now(),
        })?;
        Ok(())
    }
}

fn outcome_label(outcome: CommitOutcome) -> &'static str {
    match outcome {
        CommitOutcome::Retried => "queued",
        CommitOutcome::Failed => "failed",
        CommitOutcome::Canceled => "canceled",
        CommitOutcome::Rejected => "rejected",
    }
}
