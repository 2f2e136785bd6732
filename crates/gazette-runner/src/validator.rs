//! Result-file validation: schema plus strict source mapping.
//!
//! Every rejection here is one condition — `output_invalid` — for the
//! failure classifier. The validator never decides retryability.

use gazette_core::contract::{AgentOutput, OutputBlock};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Why a result file was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MissingFile(PathBuf),
    InvalidJson(String),
    EmptyBlocks,
    EmptyBlockText { index: usize },
    MissingSourceIds { index: usize },
    UnknownSourceIds { index: usize, ids: Vec<String> },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingFile(path) => {
                write!(f, "output file not found: {}", path.display())
            }
            ValidationError::InvalidJson(message) => {
                write!(f, "output is not a valid result document: {message}")
            }
            ValidationError::EmptyBlocks => write!(f, "output contains no blocks"),
            ValidationError::EmptyBlockText { index } => {
                write!(f, "blocks[{index}].text is empty")
            }
            ValidationError::MissingSourceIds { index } => {
                write!(f, "blocks[{index}] has empty or missing source_ids")
            }
            ValidationError::UnknownSourceIds { index, ids } => {
                write!(
                    f,
                    "blocks[{index}] contains unknown source_ids: {}",
                    ids.join(", ")
                )
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate the result file an agent produced against the source index it
/// was given. Returns the parsed output on success.
pub fn validate_output(
    output_path: &Path,
    allowed_source_ids: &HashSet<String>,
) -> Result<AgentOutput, ValidationError> {
    if !output_path.exists() {
        return Err(ValidationError::MissingFile(output_path.to_path_buf()));
    }
    let text = std::fs::read_to_string(output_path)
        .map_err(|e| ValidationError::InvalidJson(e.to_string()))?;
    let output: AgentOutput =
        serde_json::from_str(&text).map_err(|e| ValidationError::InvalidJson(e.to_string()))?;

    if output.blocks.is_empty() {
        return Err(ValidationError::EmptyBlocks);
    }
    for (index, block) in output.blocks.iter().enumerate() {
        validate_block(index, block, allowed_source_ids)?;
    }
    Ok(output)
}

fn validate_block(
    index: usize,
    block: &OutputBlock,
    allowed_source_ids: &HashSet<String>,
) -> Result<(), ValidationError> {
    if block.text.trim().is_empty() {
        return Err(ValidationError::EmptyBlockText { index });
    }
    if block.source_ids.is_empty() {
        return Err(ValidationError::MissingSourceIds { index });
    }
    let mut unknown: Vec<String> = block
        .source_ids
        .iter()
        .filter(|id| !allowed_source_ids.contains(*id))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        unknown.sort();
        return Err(ValidationError::UnknownSourceIds { index, ids: unknown });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn write(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("agent_result.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn valid_output_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"{"blocks":[{"text":"a highlight","source_ids":["article:1"]}],"metadata":{}}"#,
        );
        let output = validate_output(&path, &allowed(&["article:1", "article:2"])).unwrap();
        assert_eq!(output.blocks.len(), 1);
    }

    #[test]
    fn missing_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert_eq!(
            validate_output(&path, &allowed(&[])),
            Err(ValidationError::MissingFile(path))
        );
    }

    #[test]
    fn malformed_json_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"blocks":["#);
        assert!(matches!(
            validate_output(&path, &allowed(&[])),
            Err(ValidationError::InvalidJson(_))
        ));
    }

    #[test]
    fn wrong_shape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"result":"text"}"#);
        assert!(matches!(
            validate_output(&path, &allowed(&[])),
            Err(ValidationError::InvalidJson(_))
        ));
    }

    #[test]
    fn empty_blocks_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"blocks":[],"metadata":{}}"#);
        assert_eq!(
            validate_output(&path, &allowed(&["article:1"])),
            Err(ValidationError::EmptyBlocks)
        );
    }

    #[test]
    fn empty_text_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"blocks":[{"text":"  ","source_ids":["article:1"]}]}"#);
        assert_eq!(
            validate_output(&path, &allowed(&["article:1"])),
            Err(ValidationError::EmptyBlockText { index: 0 })
        );
    }

    #[test]
    fn missing_source_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"blocks":[{"text":"t","source_ids":[]}]}"#);
        assert_eq!(
            validate_output(&path, &allowed(&["article:1"])),
            Err(ValidationError::MissingSourceIds { index: 0 })
        );
    }

    #[test]
    fn unknown_source_ids_rejected_regardless_of_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"{"blocks":[
                {"text":"ok","source_ids":["article:1"]},
                {"text":"bad","source_ids":["article:1","unknown-id"]}
            ]}"#,
        );
        assert_eq!(
            validate_output(&path, &allowed(&["article:1"])),
            Err(ValidationError::UnknownSourceIds {
                index: 1,
                ids: vec!["unknown-id".into()],
            })
        );
    }
}
