//! File-based contract between the orchestrator and external agent processes.
//!
//! JSON files are the only channel across the process boundary: the manifest
//! enumerates every other path, the agent reads its inputs from the paths it
//! names, and writes exactly one result file. Never assume in-process object
//! identity across this boundary — everything round-trips through serde.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Bumped whenever a manifest field changes meaning.
pub const CONTRACT_VERSION: u32 = 2;

/// One allowed source entry for strict source mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIndexEntry {
    pub source_id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub published_at: Option<String>,
}

/// Task input payload consumed by the agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub task_type: String,
    pub prompt: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One output block with mandatory source mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputBlock {
    pub text: String,
    pub source_ids: Vec<String>,
}

/// Top-level result payload written by the agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub blocks: Vec<OutputBlock>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Manifest materialized for exactly one task attempt.
///
/// Every path is absolute; the external process discovers all of its inputs
/// and its output location from this one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManifest {
    pub contract_version: u32,
    pub task_id: String,
    pub task_type: String,
    pub attempt: u32,
    pub workdir: PathBuf,
    pub task_input_path: PathBuf,
    pub sources_index_path: PathBuf,
    pub output_result_path: PathBuf,
    pub output_stdout_path: PathBuf,
    pub output_stderr_path: PathBuf,
}

/// Persist a JSON document with stable formatting.
pub fn write_json<T: Serialize>(path: &Path, payload: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(payload)?;
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path, what: &str) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {what} at {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid {what} at {}", path.display()))
}

pub fn write_task_input(path: &Path, input: &TaskInput) -> Result<()> {
    write_json(path, input)
}

pub fn read_task_input(path: &Path) -> Result<TaskInput> {
    let input: TaskInput = read_json(path, "task input")?;
    if input.task_type.trim().is_empty() {
        bail!("task_input.task_type must be a non-empty string");
    }
    Ok(input)
}

#[derive(Serialize, Deserialize)]
struct SourcesIndexFile {
    sources: Vec<SourceIndexEntry>,
}

pub fn write_sources_index(path: &Path, sources: &[SourceIndexEntry]) -> Result<()> {
    write_json(
        path,
        &SourcesIndexFile {
            sources: sources.to_vec(),
        },
    )
}

pub fn read_sources_index(path: &Path) -> Result<Vec<SourceIndexEntry>> {
    let file: SourcesIndexFile = read_json(path, "sources index")?;
    for entry in &file.sources {
        if entry.source_id.trim().is_empty() {
            bail!("sources_index.source_id must be a non-empty string");
        }
    }
    Ok(file.sources)
}

pub fn write_agent_output(path: &Path, output: &AgentOutput) -> Result<()> {
    write_json(path, output)
}

pub fn write_manifest(path: &Path, manifest: &TaskManifest) -> Result<()> {
    write_json(path, manifest)
}

pub fn read_manifest(path: &Path) -> Result<TaskManifest> {
    let manifest: TaskManifest = read_json(path, "task manifest")?;
    if manifest.contract_version < 1 {
        bail!("task_manifest.contract_version must be >= 1");
    }
    Ok(manifest)
}
