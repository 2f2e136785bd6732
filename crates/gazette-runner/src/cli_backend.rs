//! CLI subprocess backend: runs the frozen command template as an external
//! agent process against the attempt's workdir contract.

use crate::backend::{AgentBackend, ExecutionOutcome, ExecutionRequest};
use crate::subprocess::{ProcessSpec, run_with_deadline};
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::path::Path;

const OUTPUT_SCHEMA_EXAMPLE: &str = r#"{
  "blocks": [
    {
      "text": "<highlight or analysis text>",
      "source_ids": ["article:<id>"]
    }
  ],
  "metadata": {}
}"#;

/// Placeholders a command template may use. At least one of the discovery
/// placeholders (`{prompt}`, `{prompt_file}`, `{manifest}`) is required, or
/// the process would have no way to find its inputs.
const DISCOVERY_PLACEHOLDERS: &[&str] = &["{prompt}", "{prompt_file}", "{manifest}"];

pub struct CliProcessBackend;

impl CliProcessBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CliProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentBackend for CliProcessBackend {
    fn name(&self) -> &str {
        "cli"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let enriched = build_enriched_prompt(&request.prompt, &request.manifest_path);

        let prompt_file = request.manifest.workdir.join("input").join("task_prompt.txt");
        std::fs::write(&prompt_file, &enriched)?;

        let argv = render_command(
            &request.routing.command_template,
            &RenderValues {
                model: &request.routing.model,
                prompt: &enriched,
                prompt_file: &prompt_file,
                manifest: &request.manifest_path,
            },
        )?;

        tracing::info!(
            agent = %request.routing.agent,
            model = %request.routing.model,
            task_id = %request.manifest.task_id,
            attempt = request.manifest.attempt,
            "invoking CLI agent"
        );

        let spec = ProcessSpec {
            argv,
            env: vec![
                ("GAZETTE_AGENT".into(), request.routing.agent.clone()),
                ("GAZETTE_MODEL".into(), request.routing.model.clone()),
                (
                    "GAZETTE_PROFILE".into(),
                    request.routing.profile.label().into(),
                ),
            ],
            stdout_path: request.manifest.output_stdout_path.clone(),
            stderr_path: request.manifest.output_stderr_path.clone(),
        };

        let outcome =
            run_with_deadline(&spec, request.timeout, request.termination, &request.cancel).await?;

        Ok(ExecutionOutcome {
            exit_code: outcome.exit_code,
            timed_out: outcome.timed_out,
            canceled: outcome.canceled,
            wall_time: outcome.wall_time,
            stdout_path: request.manifest.output_stdout_path.clone(),
            stderr_path: request.manifest.output_stderr_path.clone(),
        })
    }
}

/// Wrap the task prompt with the discovery steps and the output contract.
fn build_enriched_prompt(base_prompt: &str, manifest_path: &Path) -> String {
    format!(
        "{base_prompt}\n\
         \n\
         Your task manifest is at: {manifest}\n\
         \n\
         Steps:\n\
         1. Read the manifest JSON - it contains paths to all input/output files.\n\
         2. Read sources_index_path from the manifest - each source has a source_id,\n\
         \x20  title, url, and source. Use these as your source material.\n\
         3. Write the result to output_result_path from the manifest.\n\
         4. The output file must follow this JSON schema exactly:\n\
         {schema}\n\
         5. Each block.source_ids must only reference source_ids from the index.\n\
         \n\
         Do not search the web. Write only the output JSON file.\n",
        manifest = manifest_path.display(),
        schema = OUTPUT_SCHEMA_EXAMPLE,
    )
}

struct RenderValues<'a> {
    model: &'a str,
    prompt: &'a str,
    prompt_file: &'a Path,
    manifest: &'a Path,
}

/// Render the command template into an argv. Tokens are split on
/// whitespace first, then placeholders substituted per token, so a prompt
/// containing spaces stays a single argument — no shell is involved.
fn render_command(template: &str, values: &RenderValues<'_>) -> Result<Vec<String>> {
    let stripped = template.trim();
    if stripped.is_empty() {
        bail!("command template is empty");
    }
    if !DISCOVERY_PLACEHOLDERS.iter().any(|p| stripped.contains(p)) {
        bail!(
            "command template must include one of {}",
            DISCOVERY_PLACEHOLDERS.join(", ")
        );
    }

    let prompt_file = values.prompt_file.display().to_string();
    let manifest = values.manifest.display().to_string();
    let argv: Vec<String> = stripped
        .split_whitespace()
        .map(|token| {
            token
                .replace("{model}", values.model)
                .replace("{prompt}", values.prompt)
                .replace("{prompt_file}", &prompt_file)
                .replace("{manifest}", &manifest)
        })
        .collect();
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn values<'a>(prompt_file: &'a PathBuf, manifest: &'a PathBuf) -> RenderValues<'a> {
        RenderValues {
            model: "claude-haiku",
            prompt: "do the thing",
            prompt_file,
            manifest,
        }
    }

    #[test]
    fn render_substitutes_per_token() {
        let prompt_file = PathBuf::from("/w/input/task_prompt.txt");
        let manifest = PathBuf::from("/w/meta/task_manifest.json");
        let argv = render_command(
            "claude -p {prompt} --model={model} --manifest {manifest}",
            &values(&prompt_file, &manifest),
        )
        .unwrap();
        assert_eq!(
            argv,
            vec![
                "claude",
                "-p",
                "do the thing",
                "--model=claude-haiku",
                "--manifest",
                "/w/meta/task_manifest.json",
            ]
        );
    }

    #[test]
    fn prompt_with_spaces_stays_one_argument() {
        let prompt_file = PathBuf::from("/p");
        let manifest = PathBuf::from("/m");
        let argv =
            render_command("agent {prompt}", &values(&prompt_file, &manifest)).unwrap();
        assert_eq!(argv.len(), 2);
        assert_eq!(argv[1], "do the thing");
    }

    #[test]
    fn template_without_discovery_placeholder_rejected() {
        let prompt_file = PathBuf::from("/p");
        let manifest = PathBuf::from("/m");
        assert!(render_command("agent --model {model}", &values(&prompt_file, &manifest)).is_err());
        assert!(render_command("   ", &values(&prompt_file, &manifest)).is_err());
    }

    #[test]
    fn enriched_prompt_names_manifest_and_schema() {
        let prompt = build_enriched_prompt("Summarize.", Path::new("/w/meta/task_manifest.json"));
        assert!(prompt.starts_with("Summarize."));
        assert!(prompt.contains("/w/meta/task_manifest.json"));
        assert!(prompt.contains("\"source_ids\""));
        assert!(prompt.contains("output_result_path"));
    }
}
