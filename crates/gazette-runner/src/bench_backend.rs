//! Deterministic benchmark backend.
//!
//! Synthesizes outcomes without spawning any process, so queue throughput
//! and every failure path can be measured independently of real agent
//! latency. The behavior is chosen by a `benchmark_case` key in the task
//! input metadata:
//!
//! - `success` (default) — valid result file, exit 0
//! - `timeout`           — no result, reported as a deadline hit
//! - `auth_error`        — auth signature on stderr, exit 1
//! - `invalid_output`    — truncated JSON result, exit 0
//! - `unknown_source`    — result citing a source id outside the index

use crate::backend::{AgentBackend, ExecutionOutcome, ExecutionRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use gazette_core::contract::{
    AgentOutput, OutputBlock, read_sources_index, read_task_input, write_agent_output,
};
use std::time::Duration;

pub struct BenchmarkBackend;

impl BenchmarkBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BenchmarkBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentBackend for BenchmarkBackend {
    fn name(&self) -> &str {
        "benchmark"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let manifest = &request.manifest;
        let task_input =
            read_task_input(&manifest.task_input_path).context("benchmark backend input")?;
        let sources =
            read_sources_index(&manifest.sources_index_path).context("benchmark backend index")?;
        let first_source = sources
            .first()
            .map(|s| s.source_id.clone())
            .unwrap_or_else(|| "article:missing".to_string());

        let case = task_input
            .metadata
            .get("benchmark_case")
            .and_then(|v| v.as_str())
            .unwrap_or("success")
            .to_lowercase();

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = 0;
        let mut timed_out = false;

        match case.as_str() {
            "timeout" => {
                timed_out = true;
                exit_code = 124;
            }
            "auth_error" => {
                stderr.push_str("permission denied: invalid api key\n");
                exit_code = 1;
            }
            "invalid_output" => {
                std::fs::write(&manifest.output_result_path, "{\"blocks\":[")?;
                stdout.push_str("wrote result\n");
            }
            "unknown_source" => {
                write_agent_output(
                    &manifest.output_result_path,
                    &AgentOutput {
                        blocks: vec![OutputBlock {
                            text: "cites a source outside the index".into(),
                            source_ids: vec!["unknown-id".into()],
                        }],
                        metadata: serde_json::json!({ "backend": "benchmark" }),
                    },
                )?;
                stdout.push_str("wrote result\n");
            }
            _ => {
                write_agent_output(
                    &manifest.output_result_path,
                    &AgentOutput {
                        blocks: vec![OutputBlock {
                            text: format!("Benchmark output for {}", task_input.task_type),
                            source_ids: vec![first_source],
                        }],
                        metadata: serde_json::json!({ "backend": "benchmark" }),
                    },
                )?;
                stdout.push_str("wrote result\n");
            }
        }

        std::fs::write(&manifest.output_stdout_path, stdout)?;
        std::fs::write(&manifest.output_stderr_path, stderr)?;

        Ok(ExecutionOutcome {
            exit_code,
            timed_out,
            canceled: false,
            wall_time: Duration::from_millis(0),
            stdout_path: manifest.output_stdout_path.clone(),
            stderr_path: manifest.output_stderr_path.clone(),
        })
    }
}
