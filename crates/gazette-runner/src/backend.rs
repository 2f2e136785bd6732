//! Agent backend abstraction: "run this task attempt as an external
//! process" (or pretend to, for benchmarks and tests).
//!
//! `execute` returns an outcome for every ordinary process failure —
//! non-zero exit, timeout, cancellation. `Err` is reserved for
//! backend-internal faults such as a missing executable.

use crate::subprocess::TerminationPolicy;
use anyhow::Result;
use async_trait::async_trait;
use gazette_core::contract::TaskManifest;
use gazette_core::routing::FrozenRouting;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a backend needs to run one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub manifest_path: PathBuf,
    pub manifest: TaskManifest,
    pub prompt: String,
    pub routing: FrozenRouting,
    /// Per-attempt wall-clock budget.
    pub timeout: Duration,
    pub termination: TerminationPolicy,
    /// Fired by the worker when a cancel request or shutdown arrives
    /// mid-attempt; the backend escalates termination exactly as it would
    /// for a timeout.
    pub cancel: CancellationToken,
}

/// Execution result, successful or not.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
    pub canceled: bool,
    pub wall_time: Duration,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl ExecutionOutcome {
    /// Captured stdout, empty if the file was never written.
    pub fn read_stdout(&self) -> String {
        read_lossy(&self.stdout_path)
    }

    /// Captured stderr, empty if the file was never written.
    pub fn read_stderr(&self) -> String {
        read_lossy(&self.stderr_path)
    }
}

fn read_lossy(path: &std::path::Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => String::new(),
    }
}

/// Trait implemented by all agent backends.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Human-readable backend name for logs and attempt records.
    fn name(&self) -> &str;

    /// Run one task attempt to completion (or termination).
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome>;
}
