//! JSONL wire formats.
//!
//! Three line shapes cross the repository boundary:
//! - [`ReferenceFileInput`]: import input, one reference per line;
//! - robot result lines: an [`Enhancement`] or a [`LinkedRobotError`];
//! - [`RobotResultValidationEntry`]: the per-line validation report.
//!
//! Blank lines are allowed everywhere and skipped by callers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::enhancements::{Enhancement, EnhancementContent, Visibility};
use crate::error::{Error, Result};
use crate::identifiers::ExternalIdentifier;
use crate::reference::Reference;

/// One enhancement as it appears in an import file: no ids yet, the
/// reference is implied by the surrounding line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementFileInput {
    pub source: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_version: Option<String>,
    #[serde(flatten)]
    pub content: EnhancementContent,
}

/// One reference as it appears in an import file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFileInput {
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub identifiers: Vec<ExternalIdentifier>,
    #[serde(default)]
    pub enhancements: Vec<EnhancementFileInput>,
}

/// A robot reporting that it could not enhance a reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedRobotError {
    pub reference_id: Uuid,
    pub message: String,
}

/// One line of a robot result file.
#[derive(Debug, Clone, PartialEq)]
pub enum RobotResultEntry {
    Enhancement(Box<Enhancement>),
    Error(LinkedRobotError),
}

impl RobotResultEntry {
    /// Parse a result line. A line carrying a `message` field is a robot
    /// error; anything else must parse as an enhancement.
    pub fn from_jsonl(line: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| Error::InvalidInput(format!("invalid JSON: {e}")))?;
        if value.get("message").is_some() {
            let error: LinkedRobotError = serde_json::from_value(value)
                .map_err(|e| Error::InvalidInput(format!("invalid robot error: {e}")))?;
            return Ok(RobotResultEntry::Error(error));
        }
        let enhancement: Enhancement = serde_json::from_value(value)
            .map_err(|e| Error::InvalidInput(format!("invalid enhancement: {e}")))?;
        Ok(RobotResultEntry::Enhancement(Box::new(enhancement)))
    }

    pub fn reference_id(&self) -> Uuid {
        match self {
            RobotResultEntry::Enhancement(enhancement) => enhancement.reference_id,
            RobotResultEntry::Error(error) => error.reference_id,
        }
    }
}

/// One line of a validation report. Success entries carry only the
/// reference id; failures carry error text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotResultValidationEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RobotResultValidationEntry {
    pub fn success(reference_id: Uuid) -> Self {
        Self {
            reference_id: Some(reference_id),
            error: None,
        }
    }

    pub fn failure(reference_id: Option<Uuid>, error: impl Into<String>) -> Self {
        Self {
            reference_id,
            error: Some(error.into()),
        }
    }

    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The outcome of ingesting one import line: the constructed reference (or
/// nothing), plus per-entry errors carrying the line ordinal.
#[derive(Debug, Clone, Default)]
pub struct ReferenceCreateResult {
    pub reference: Option<Reference>,
    pub errors: Vec<String>,
}

impl ReferenceCreateResult {
    pub fn failure(entry_ref: usize, error: impl Into<String>) -> Self {
        Self {
            reference: None,
            errors: vec![format!("Entry {entry_ref}: {}", error.into())],
        }
    }

    /// Joined error text for `ImportResult.failure_details`.
    pub fn error_str(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("\n"))
        }
    }
}

/// Serialize a reference (with identifiers and enhancements) to one JSONL
/// line for robot reference-data files.
pub fn reference_to_jsonl(reference: &Reference) -> Result<String> {
    Ok(serde_json::to_string(reference)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_file_input_parses_minimal_line() {
        let line = r#"{"identifiers": [{"identifier_type": "doi", "identifier": "10.1234/abc"}]}"#;
        let input: ReferenceFileInput = serde_json::from_str(line).unwrap();
        assert_eq!(input.identifiers.len(), 1);
        assert!(input.enhancements.is_empty());
        assert_eq!(input.visibility, Visibility::Public);
    }

    #[test]
    fn enhancement_file_input_flattens_content() {
        let line = r#"{
            "source": "importer",
            "enhancement_type": "abstract",
            "abstract": "We studied heat."
        }"#;
        let input: EnhancementFileInput = serde_json::from_str(line).unwrap();
        assert!(matches!(
            input.content,
            EnhancementContent::Abstract { .. }
        ));
    }

    #[test]
    fn robot_result_entry_discriminates_on_message() {
        let reference_id = Uuid::new_v4();
        let error_line = format!(
            r#"{{"reference_id": "{reference_id}", "message": "no full text found"}}"#
        );
        match RobotResultEntry::from_jsonl(&error_line).unwrap() {
            RobotResultEntry::Error(error) => {
                assert_eq!(error.reference_id, reference_id);
                assert_eq!(error.message, "no full text found");
            }
            RobotResultEntry::Enhancement(_) => panic!("expected robot error"),
        }

        let enhancement = Enhancement::new(
            reference_id,
            "robot",
            EnhancementContent::Abstract {
                r#abstract: "text".to_string(),
            },
        );
        let line = serde_json::to_string(&enhancement).unwrap();
        match RobotResultEntry::from_jsonl(&line).unwrap() {
            RobotResultEntry::Enhancement(parsed) => {
                assert_eq!(parsed.reference_id, reference_id);
            }
            RobotResultEntry::Error(_) => panic!("expected enhancement"),
        }
    }

    #[test]
    fn garbage_line_is_invalid_input() {
        assert!(RobotResultEntry::from_jsonl("not json").is_err());
    }

    #[test]
    fn validation_entry_shapes() {
        let id = Uuid::new_v4();
        let ok = RobotResultValidationEntry::success(id).to_jsonl();
        assert!(!ok.contains("error"));
        let failed = RobotResultValidationEntry::failure(None, "parse failure").to_jsonl();
        assert!(!failed.contains("reference_id"));
        assert!(failed.contains("parse failure"));
    }
}
