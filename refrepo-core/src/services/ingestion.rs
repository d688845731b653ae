//! Reference ingestion: one JSONL line in, one reference (or errors) out.

use tracing::debug;
use uuid::Uuid;

use crate::enhancements::Enhancement;
use crate::identifiers::{ExternalIdentifier, LinkedExternalIdentifier};
use crate::reference::Reference;
use crate::wire::{ReferenceCreateResult, ReferenceFileInput};

/// Parses import lines into references.
///
/// Validation is deliberately element-wise rather than all-or-nothing so
/// that one bad identifier produces a useful per-entry error and a partial
/// success instead of rejecting the whole line.
#[derive(Debug, Default, Clone, Copy)]
pub struct IngestionService;

impl IngestionService {
    pub fn new() -> Self {
        Self
    }

    /// Ingest a reference from one file line.
    ///
    /// `entry_ref` is the 1-based ordinal of the line within its batch and
    /// prefixes every collected error.
    pub fn ingest_reference(&self, record_str: &str, entry_ref: usize) -> ReferenceCreateResult {
        let input: ReferenceFileInput = match serde_json::from_str(record_str) {
            Ok(input) => input,
            Err(e) => {
                return ReferenceCreateResult::failure(entry_ref, format!("invalid JSON: {e}"));
            }
        };

        let mut errors = Vec::new();
        let reference_id = Uuid::new_v4();

        let mut identifiers = Vec::new();
        for (i, identifier) in input.identifiers.into_iter().enumerate() {
            match self.validate_identifier(identifier) {
                Ok(identifier) => {
                    identifiers.push(LinkedExternalIdentifier::new(reference_id, identifier));
                }
                Err(e) => errors.push(format!("Entry {entry_ref}, identifier {i}: {e}")),
            }
        }

        if identifiers.is_empty() {
            errors.push(format!(
                "Entry {entry_ref}: reference has no valid identifiers"
            ));
            return ReferenceCreateResult {
                reference: None,
                errors,
            };
        }

        let mut enhancements = Vec::new();
        for (i, enhancement_input) in input.enhancements.into_iter().enumerate() {
            if enhancement_input.source.trim().is_empty() {
                errors.push(format!(
                    "Entry {entry_ref}, enhancement {i}: source must not be empty"
                ));
                continue;
            }
            let mut enhancement = Enhancement::new(
                reference_id,
                enhancement_input.source,
                enhancement_input.content,
            );
            enhancement.visibility = enhancement_input.visibility;
            enhancement.robot_version = enhancement_input.robot_version;
            enhancements.push(enhancement);
        }

        let mut reference = Reference::new();
        reference.id = reference_id;
        reference.visibility = input.visibility;
        reference.identifiers = Some(identifiers);
        reference.enhancements = Some(enhancements);

        debug!(reference_id = %reference_id, entry_ref, "parsed reference from import line");

        ReferenceCreateResult {
            reference: Some(reference),
            errors,
        }
    }

    /// Re-validate a deserialized identifier's format rules.
    fn validate_identifier(
        &self,
        identifier: ExternalIdentifier,
    ) -> crate::error::Result<ExternalIdentifier> {
        identifier.validate()?;
        // DOIs may arrive with a doi.org prefix; normalize on the way in.
        if let ExternalIdentifier::Doi { identifier: value } = &identifier {
            return ExternalIdentifier::doi(value);
        }
        Ok(identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::ExternalIdentifierType;

    #[test]
    fn valid_line_produces_reference_with_fresh_id() {
        let service = IngestionService::new();
        let line = r#"{
            "identifiers": [{"identifier_type": "doi", "identifier": "10.1234/abc"}],
            "enhancements": [{
                "source": "importer",
                "enhancement_type": "abstract",
                "abstract": "We studied heat."
            }]
        }"#;
        let result = service.ingest_reference(line, 1);
        assert!(result.errors.is_empty());
        let reference = result.reference.unwrap();
        let identifiers = reference.identifiers.as_ref().unwrap();
        assert_eq!(identifiers.len(), 1);
        assert_eq!(identifiers[0].reference_id, reference.id);
        let enhancements = reference.enhancements.as_ref().unwrap();
        assert_eq!(enhancements[0].reference_id, reference.id);
    }

    #[test]
    fn parse_failure_carries_the_entry_ordinal() {
        let service = IngestionService::new();
        let result = service.ingest_reference("{not json", 7);
        assert!(result.reference.is_none());
        assert!(result.errors[0].starts_with("Entry 7:"));
    }

    #[test]
    fn bad_identifier_is_a_partial_failure() {
        let service = IngestionService::new();
        let line = r#"{
            "identifiers": [
                {"identifier_type": "doi", "identifier": "10.1234/abc"},
                {"identifier_type": "open_alex", "identifier": "not-openalex"}
            ]
        }"#;
        let result = service.ingest_reference(line, 1);
        let reference = result.reference.unwrap();
        assert_eq!(reference.identifiers.as_ref().unwrap().len(), 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("identifier 1"));
    }

    #[test]
    fn doi_url_prefix_is_normalized() {
        let service = IngestionService::new();
        let line = r#"{
            "identifiers": [{"identifier_type": "doi", "identifier": "https://doi.org/10.1234/abc"}]
        }"#;
        let result = service.ingest_reference(line, 1);
        let reference = result.reference.unwrap();
        let identifier = &reference.identifiers.as_ref().unwrap()[0].identifier;
        assert_eq!(identifier.identifier_type(), ExternalIdentifierType::Doi);
        assert_eq!(identifier.value(), "10.1234/abc");
    }

    #[test]
    fn all_identifiers_invalid_is_a_total_failure() {
        let service = IngestionService::new();
        let line = r#"{"identifiers": [{"identifier_type": "open_alex", "identifier": "nope"}]}"#;
        let result = service.ingest_reference(line, 3);
        assert!(result.reference.is_none());
        assert!(result
            .error_str()
            .unwrap()
            .contains("reference has no valid identifiers"));
    }
}
