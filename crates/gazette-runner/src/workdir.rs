//! Per-attempt workdir materialization.
//!
//! Layout under the root, one tree per attempt so no two attempts ever
//! share a contract:
//!
//! ```text
//! <root>/<task-id>/attempt-<n>/
//!   input/task_input.json
//!   input/sources_index.json
//!   input/task_prompt.txt        (written by the CLI backend)
//!   output/agent_result.json     (written by the external process)
//!   output/agent_stdout.log
//!   output/agent_stderr.log
//!   meta/task_manifest.json
//! ```

use anyhow::{Context, Result};
use gazette_core::contract::{
    CONTRACT_VERSION, TaskInput, TaskManifest, write_manifest, write_sources_index,
    write_task_input,
};
use gazette_core::task::Task;
use std::path::{Path, PathBuf};

/// Materialized contract paths for one attempt.
#[derive(Debug, Clone)]
pub struct MaterializedAttempt {
    pub manifest_path: PathBuf,
    pub manifest: TaskManifest,
}

/// Creates the deterministic per-attempt directory layout.
#[derive(Debug, Clone)]
pub struct WorkdirManager {
    root: PathBuf,
}

impl WorkdirManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write the manifest and input files for one attempt of a task.
    pub fn materialize(&self, task: &Task, attempt: u32) -> Result<MaterializedAttempt> {
        let base_dir = self
            .root
            .join(task.id.to_string())
            .join(format!("attempt-{attempt}"));
        let input_dir = base_dir.join("input");
        let output_dir = base_dir.join("output");
        let meta_dir = base_dir.join("meta");
        for dir in [&input_dir, &output_dir, &meta_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let task_input_path = input_dir.join("task_input.json");
        let sources_index_path = input_dir.join("sources_index.json");
        let manifest_path = meta_dir.join("task_manifest.json");

        write_task_input(
            &task_input_path,
            &TaskInput {
                task_type: task.kind.label().to_string(),
                prompt: task.payload.prompt.clone(),
                metadata: task.payload.params.clone(),
            },
        )?;
        write_sources_index(&sources_index_path, &task.payload.sources)?;

        let manifest = TaskManifest {
            contract_version: CONTRACT_VERSION,
            task_id: task.id.to_string(),
            task_type: task.kind.label().to_string(),
            attempt,
            workdir: base_dir.clone(),
            task_input_path,
            sources_index_path,
            output_result_path: output_dir.join("agent_result.json"),
            output_stdout_path: output_dir.join("agent_stdout.log"),
            output_stderr_path: output_dir.join("agent_stderr.log"),
        };
        write_manifest(&manifest_path, &manifest)?;

        Ok(MaterializedAttempt {
            manifest_path,
            manifest,
        })
    }
}
