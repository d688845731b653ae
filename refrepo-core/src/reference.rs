//! The reference aggregate and its duplicate decisions.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decisions::{DuplicateDetermination, ReferenceDuplicateDecision};
use crate::enhancements::{Enhancement, Visibility};
use crate::identifiers::{ExternalIdentifierType, LinkedExternalIdentifier};

/// Root aggregate for a scholarly work.
///
/// Relationship fields are `Option` to distinguish "not preloaded" from
/// "preloaded and empty"; stores populate them according to the
/// [`ReferenceInclude`](crate::store::ReferenceInclude) passed to the load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub id: Uuid,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifiers: Option<Vec<LinkedExternalIdentifier>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhancements: Option<Vec<Enhancement>>,
    /// Active duplicate decision, when preloaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_decision: Option<ReferenceDuplicateDecision>,
    /// References whose active decision points at this one, when preloaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_references: Option<Vec<Reference>>,
    /// The canonical reference, when preloaded and this one is a duplicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_reference: Option<Box<Reference>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Reference {
    pub fn new() -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            visibility: Visibility::Public,
            identifiers: Some(Vec::new()),
            enhancements: Some(Vec::new()),
            duplicate_decision: None,
            duplicate_references: None,
            canonical_reference: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this reference can act as a canonical: it has no active
    /// decision, or its active decision does not name another reference as
    /// its canonical.
    ///
    /// Requires `duplicate_decision` to be preloaded to say anything other
    /// than "no decision".
    pub fn canonical_like(&self) -> bool {
        match &self.duplicate_decision {
            None => true,
            Some(decision) => !matches!(
                decision.duplicate_determination,
                DuplicateDetermination::Duplicate | DuplicateDetermination::ExactDuplicate
            ),
        }
    }

    /// The canonical this reference duplicates, per its active decision.
    pub fn canonical_reference_id(&self) -> Option<Uuid> {
        self.duplicate_decision
            .as_ref()
            .and_then(|d| d.canonical_reference_id)
    }

    /// Whether every identifier and every enhancement of `other` is present
    /// on this reference, by identifier key and enhancement content hash.
    ///
    /// Used to short-circuit reimports of identical content.
    pub fn is_superset(&self, other: &Reference) -> bool {
        let own_keys: HashSet<_> = self
            .identifiers
            .iter()
            .flatten()
            .map(|i| i.identifier.key())
            .collect();
        let own_hashes: HashSet<_> = self
            .enhancements
            .iter()
            .flatten()
            .map(Enhancement::content_hash)
            .collect();

        other
            .identifiers
            .iter()
            .flatten()
            .all(|i| own_keys.contains(&i.identifier.key()))
            && other
                .enhancements
                .iter()
                .flatten()
                .all(|e| own_hashes.contains(&e.content_hash()))
    }

    /// Whether the reference has at least one identifier whose cardinality
    /// we can rely on (anything but `other`).
    pub fn has_well_known_identifier(&self) -> bool {
        self.identifiers
            .iter()
            .flatten()
            .any(|i| i.identifier.identifier_type() != ExternalIdentifierType::Other)
    }
}

impl Default for Reference {
    fn default() -> Self {
        Self::new()
    }
}

/// A reference paired with the changeset sub-reference that triggered an
/// automation evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceWithChangeset {
    /// The full deduplicated canonical reference.
    pub reference: Reference,
    /// The subset of identifiers/enhancements whose arrival caused the
    /// trigger.
    pub changeset: Reference,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enhancements::EnhancementContent;
    use crate::identifiers::ExternalIdentifier;

    fn reference_with(doi: &str, title: &str) -> Reference {
        let mut reference = Reference::new();
        reference.identifiers = Some(vec![LinkedExternalIdentifier::new(
            reference.id,
            ExternalIdentifier::doi(doi).unwrap(),
        )]);
        reference.enhancements = Some(vec![Enhancement::new(
            reference.id,
            "importer",
            EnhancementContent::Bibliographic {
                title: Some(title.to_string()),
                authorship: vec![],
                publication_year: None,
                publication_date: None,
                publisher: None,
            },
        )]);
        reference
    }

    #[test]
    fn superset_matches_identical_content() {
        let a = reference_with("10.1234/abc", "Heat and Health");
        let b = reference_with("10.1234/abc", "Heat and Health");
        assert!(a.is_superset(&b));
        assert!(b.is_superset(&a));
    }

    #[test]
    fn superset_rejects_extra_identifier() {
        let a = reference_with("10.1234/abc", "Heat and Health");
        let mut b = reference_with("10.1234/abc", "Heat and Health");
        b.identifiers
            .as_mut()
            .unwrap()
            .push(LinkedExternalIdentifier::new(
                b.id,
                ExternalIdentifier::pm_id(42),
            ));
        assert!(!a.is_superset(&b));
        assert!(b.is_superset(&a));
    }

    #[test]
    fn only_other_identifiers_are_not_well_known() {
        let mut reference = Reference::new();
        reference.identifiers = Some(vec![LinkedExternalIdentifier::new(
            reference.id,
            ExternalIdentifier::other("eppi", "12").unwrap(),
        )]);
        assert!(!reference.has_well_known_identifier());
    }

    #[test]
    fn no_decision_is_canonical_like() {
        let reference = Reference::new();
        assert!(reference.canonical_like());
    }
}
