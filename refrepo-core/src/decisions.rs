//! Duplicate decisions and the determination state machine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::projections::Fingerprint;

/// The verdict of a deduplication pass over one reference.
///
/// `Pending` and `Nominated` are intermediate; the rest are terminal for the
/// decision they live on. A reference is re-judged by creating a new
/// decision, never by mutating a terminal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateDetermination {
    /// Awaiting processing.
    Pending,
    /// Candidate canonicals were found and await determination.
    Nominated,
    /// Identical to an existing reference; not persisted beyond the decision.
    ExactDuplicate,
    /// Fingerprint too sparse to search; stored as its own canonical.
    BlurredFingerprint,
    /// This reference is a canonical.
    Canonical,
    /// This reference duplicates a canonical reference.
    Duplicate,
    /// The link could not be established (e.g. chain depth exceeded);
    /// awaiting human review.
    Decoupled,
}

impl DuplicateDetermination {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            DuplicateDetermination::Pending | DuplicateDetermination::Nominated
        )
    }

    /// Whether a decision in `self` may move to `next`.
    pub fn can_transition_to(self, next: DuplicateDetermination) -> bool {
        match self {
            DuplicateDetermination::Pending => matches!(
                next,
                DuplicateDetermination::ExactDuplicate
                    | DuplicateDetermination::BlurredFingerprint
                    | DuplicateDetermination::Nominated
                    | DuplicateDetermination::Canonical
                    | DuplicateDetermination::Duplicate
                    | DuplicateDetermination::Decoupled
            ),
            DuplicateDetermination::Nominated => matches!(
                next,
                DuplicateDetermination::Canonical
                    | DuplicateDetermination::Duplicate
                    | DuplicateDetermination::Decoupled
            ),
            _ => false,
        }
    }
}

/// A per-reference deduplication verdict.
///
/// At most one decision per reference has `active_decision = true`; the
/// store deactivates priors when a new decision is activated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDuplicateDecision {
    pub id: Uuid,
    pub reference_id: Uuid,
    pub duplicate_determination: DuplicateDetermination,
    /// Fingerprint computed at registration time, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    /// Candidate canonical ids nominated by the fingerprint search.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidate_canonical_ids: Vec<Uuid>,
    /// The canonical this reference duplicates; set iff the determination
    /// is `Duplicate` or `ExactDuplicate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_reference_id: Option<Uuid>,
    pub active_decision: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl ReferenceDuplicateDecision {
    pub fn new(reference_id: Uuid, determination: DuplicateDetermination) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            reference_id,
            duplicate_determination: determination,
            fingerprint: None,
            candidate_canonical_ids: Vec::new(),
            canonical_reference_id: None,
            active_decision: false,
            detail: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check that the canonical pointer is populated exactly when the
    /// determination requires one.
    pub fn validate(&self) -> Result<()> {
        let needs_canonical = matches!(
            self.duplicate_determination,
            DuplicateDetermination::Duplicate | DuplicateDetermination::ExactDuplicate
        );
        if needs_canonical != self.canonical_reference_id.is_some() {
            return Err(Error::InvalidInput(format!(
                "canonical_reference_id must be populated if and only if the \
                 determination is a duplicate (got {:?})",
                self.duplicate_determination
            )));
        }
        if self.canonical_reference_id == Some(self.reference_id) {
            return Err(Error::InvalidInput(
                "a reference cannot duplicate itself".to_string(),
            ));
        }
        Ok(())
    }

    /// Transition the determination, enforcing the state machine.
    pub fn transition(&mut self, next: DuplicateDetermination) -> Result<()> {
        if !self.duplicate_determination.can_transition_to(next) {
            return Err(Error::InvalidInput(format!(
                "invalid duplicate determination transition {:?} -> {next:?}",
                self.duplicate_determination
            )));
        }
        self.duplicate_determination = next;
        self.updated_at = chrono::Utc::now();
        Ok(())
    }
}

/// A manual override verdict, supplied through the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualDuplicateDetermination {
    Canonical,
    Duplicate,
}

/// Request to override a reference's duplicate status by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MakeDuplicateDecision {
    pub reference_id: Uuid,
    pub duplicate_determination: ManualDuplicateDetermination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_reference_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl MakeDuplicateDecision {
    /// Canonical pointer must be populated iff the determination is
    /// `duplicate`.
    pub fn validate(&self) -> Result<()> {
        let is_duplicate =
            self.duplicate_determination == ManualDuplicateDetermination::Duplicate;
        if is_duplicate != self.canonical_reference_id.is_some() {
            return Err(Error::InvalidInput(
                "canonical_reference_id must be populated if and only if \
                 duplicate_determination is duplicate"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_reaches_all_outcomes() {
        for next in [
            DuplicateDetermination::ExactDuplicate,
            DuplicateDetermination::BlurredFingerprint,
            DuplicateDetermination::Nominated,
            DuplicateDetermination::Canonical,
            DuplicateDetermination::Duplicate,
            DuplicateDetermination::Decoupled,
        ] {
            assert!(DuplicateDetermination::Pending.can_transition_to(next));
        }
    }

    #[test]
    fn nominated_cannot_regress() {
        assert!(!DuplicateDetermination::Nominated
            .can_transition_to(DuplicateDetermination::Pending));
        assert!(!DuplicateDetermination::Nominated
            .can_transition_to(DuplicateDetermination::ExactDuplicate));
        assert!(DuplicateDetermination::Nominated
            .can_transition_to(DuplicateDetermination::Decoupled));
    }

    #[test]
    fn terminal_states_are_frozen() {
        let mut decision =
            ReferenceDuplicateDecision::new(Uuid::new_v4(), DuplicateDetermination::Canonical);
        assert!(decision
            .transition(DuplicateDetermination::Duplicate)
            .is_err());
    }

    #[test]
    fn canonical_pointer_validation() {
        let mut decision =
            ReferenceDuplicateDecision::new(Uuid::new_v4(), DuplicateDetermination::Duplicate);
        assert!(decision.validate().is_err());
        decision.canonical_reference_id = Some(Uuid::new_v4());
        assert!(decision.validate().is_ok());
        decision.canonical_reference_id = Some(decision.reference_id);
        assert!(decision.validate().is_err());
    }
}
