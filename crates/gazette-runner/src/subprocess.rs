//! Subprocess supervision with a wall-clock deadline and two-phase
//! termination.
//!
//! stdout/stderr go straight to the contract's log files so output is
//! preserved regardless of how the process ends. On deadline expiry (or a
//! cancel request) the process gets a graceful stop signal, a grace
//! interval, then a forced kill.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Exit code reported for attempts the supervisor had to terminate.
pub const EXIT_CODE_TERMINATED: i32 = 124;

/// Two-phase termination intervals.
#[derive(Debug, Clone, Copy)]
pub struct TerminationPolicy {
    /// How long the process gets after the graceful stop signal.
    pub term_grace: Duration,
    /// How long to wait after the forced kill.
    pub kill_grace: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            term_grace: Duration::from_secs(10),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// What to run and where its output lands.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

/// How one supervised process ended.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    /// The wall-clock deadline expired.
    pub timed_out: bool,
    /// The cancel token fired before the process finished.
    pub canceled: bool,
    pub wall_time: Duration,
}

/// Run a process under a deadline. Spawn failure (e.g. executable not
/// found) is the only `Err`; an ordinary non-zero exit is an `Ok` outcome.
pub async fn run_with_deadline(
    spec: &ProcessSpec,
    timeout: Duration,
    policy: TerminationPolicy,
    cancel: &CancellationToken,
) -> Result<ProcessOutcome> {
    let (program, args) = spec
        .argv
        .split_first()
        .context("empty argv for agent process")?;

    let stdout_file = open_log(&spec.stdout_path)?;
    let stderr_file = open_log(&spec.stderr_path)?;

    tracing::debug!(program, ?timeout, "spawning agent process");

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file));
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn agent process: {program}"))?;

    let start = Instant::now();
    tokio::select! {
        status = child.wait() => {
            let status = status.context("failed to wait on agent process")?;
            let outcome = ProcessOutcome {
                exit_code: status.code().unwrap_or(-1),
                timed_out: false,
                canceled: false,
                wall_time: start.elapsed(),
            };
            tracing::debug!(exit_code = outcome.exit_code, "agent process completed");
            Ok(outcome)
        }
        _ = tokio::time::sleep(timeout) => {
            tracing::warn!(program, ?timeout, "agent process hit its deadline");
            terminate(&mut child, policy).await;
            Ok(ProcessOutcome {
                exit_code: EXIT_CODE_TERMINATED,
                timed_out: true,
                canceled: false,
                wall_time: start.elapsed(),
            })
        }
        _ = cancel.cancelled() => {
            tracing::info!(program, "cancel requested, terminating agent process");
            terminate(&mut child, policy).await;
            Ok(ProcessOutcome {
                exit_code: EXIT_CODE_TERMINATED,
                timed_out: false,
                canceled: true,
                wall_time: start.elapsed(),
            })
        }
    }
}

fn open_log(path: &std::path::Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::File::create(path).with_context(|| format!("failed to open {}", path.display()))
}

/// Two-phase stop: graceful signal, grace interval, forced kill.
async fn terminate(child: &mut Child, policy: TerminationPolicy) {
    send_graceful_stop(child);
    if tokio::time::timeout(policy.term_grace, child.wait())
        .await
        .is_ok()
    {
        return;
    }

    tracing::warn!("agent process ignored graceful stop, killing");
    let _ = child.start_kill();
    let _ = tokio::time::timeout(policy.kill_grace, child.wait()).await;
}

#[cfg(unix)]
fn send_graceful_stop(child: &Child) {
    if let Some(pid) = child.id() {
        // SIGTERM first; SIGKILL only if the grace interval passes.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_graceful_stop(_child: &Child) {
    // No portable graceful signal; the grace interval still applies before
    // the forced kill.
}
