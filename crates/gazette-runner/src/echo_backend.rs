//! Null backend for unit tests: echoes the prompt into a valid result file
//! citing the first source, exit 0, no process.

use crate::backend::{AgentBackend, ExecutionOutcome, ExecutionRequest};
use anyhow::Result;
use async_trait::async_trait;
use gazette_core::contract::{
    AgentOutput, OutputBlock, read_sources_index, read_task_input, write_agent_output,
};
use std::time::Duration;

pub struct EchoBackend;

impl EchoBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let manifest = &request.manifest;
        let task_input = read_task_input(&manifest.task_input_path)?;
        let sources = read_sources_index(&manifest.sources_index_path)?;

        let text = if task_input.prompt.trim().is_empty() {
            format!("{} output", task_input.task_type)
        } else {
            task_input.prompt.clone()
        };
        let source_ids: Vec<String> = sources
            .first()
            .map(|s| vec![s.source_id.clone()])
            .unwrap_or_default();

        write_agent_output(
            &manifest.output_result_path,
            &AgentOutput {
                blocks: vec![OutputBlock { text, source_ids }],
                metadata: serde_json::json!({ "backend": "echo" }),
            },
        )?;
        std::fs::write(&manifest.output_stdout_path, "echo\n")?;
        std::fs::write(&manifest.output_stderr_path, "")?;

        Ok(ExecutionOutcome {
            exit_code: 0,
            timed_out: false,
            canceled: false,
            wall_time: Duration::from_millis(0),
            stdout_path: manifest.output_stdout_path.clone(),
            stderr_path: manifest.output_stderr_path.clone(),
        })
    }
}
