//! Reference deduplication.
//!
//! The pipeline runs per reference in four phases: exact-duplicate
//! short-circuit at ingest, fingerprint candidacy against the search index,
//! deterministic canonical determination, and decision mapping with
//! chain-depth enforcement. A configured set of trusted unique identifier
//! types can shortcut the whole pipeline.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RepositoryConfig;
use crate::decisions::{
    DuplicateDetermination, MakeDuplicateDecision, ManualDuplicateDetermination,
    ReferenceDuplicateDecision,
};
use crate::error::{Error, Result};
use crate::identifiers::IdentifierKey;
use crate::projections::Fingerprint;
use crate::reference::Reference;
use crate::search::{CandidateCanonical, SearchStore};
use crate::store::{IdentifierMatch, ReferenceInclude, ReferenceScope};

/// Cap on candidate canonicals pulled per fingerprint search.
const MAX_CANDIDATE_CANONICALS: usize = 10;

/// A decision after mapping, with everything the caller needs to apply
/// side effects.
#[derive(Debug, Clone)]
pub struct MappedDecision {
    pub decision: ReferenceDuplicateDecision,
    /// Whether the canonical assignment changed relative to the prior
    /// active decision.
    pub changed: bool,
}

/// Outcome of processing one duplicate decision: the mapped decision plus
/// any dependent decisions that were decoupled along the way.
#[derive(Debug, Clone, Default)]
pub struct ProcessedDecisions {
    pub decisions: Vec<MappedDecision>,
}

/// Service for managing reference duplicate detection.
pub struct DeduplicationService {
    search_store: Arc<dyn SearchStore>,
    config: Arc<RepositoryConfig>,
}

impl DeduplicationService {
    pub fn new(search_store: Arc<dyn SearchStore>, config: Arc<RepositoryConfig>) -> Self {
        Self {
            search_store,
            config,
        }
    }

    // ========== Phase A: exact-duplicate short-circuit ==========

    /// Find an existing reference that is a superset of the given one.
    ///
    /// Not part of the regular dedup flow; used at ingest to avoid
    /// importing and reprocessing identical reimports. A reference may have
    /// more than one exact duplicate; this returns the first, preferring
    /// canonical-like candidates to keep trees flat.
    pub async fn find_exact_duplicate(
        &self,
        scope: &mut dyn ReferenceScope,
        reference: &Reference,
    ) -> Result<Option<Reference>> {
        let identifiers: Vec<IdentifierKey> = reference
            .identifiers
            .iter()
            .flatten()
            .map(|i| i.identifier.key())
            .collect();
        if identifiers.is_empty() {
            return Err(Error::InvalidInput(
                "reference must have identifiers to find duplicates".to_string(),
            ));
        }

        // We can't rely on low cardinality of "other" identifiers, so make
        // sure there's at least one well-known identifier type.
        if !reference.has_well_known_identifier() {
            warn!(
                reference_id = %reference.id,
                "reference has no non-other identifiers, exact duplicate search skipped"
            );
            return Ok(None);
        }

        let mut candidates = scope
            .find_references_with_identifiers(
                &identifiers,
                IdentifierMatch::Any,
                ReferenceInclude::CONTENT.with_decision(),
            )
            .await?;

        candidates.sort_by_key(|candidate| !candidate.canonical_like());
        Ok(candidates
            .into_iter()
            .find(|candidate| candidate.is_superset(reference)))
    }

    // ========== Registration ==========

    /// Register a duplicate decision for a freshly ingested reference.
    ///
    /// Exact duplicates and unsearchable fingerprints get their terminal
    /// determination immediately; everything else starts `Pending` and is
    /// processed by a queued task.
    pub async fn register_decision(
        &self,
        scope: &mut dyn ReferenceScope,
        reference: &Reference,
        exact_duplicate_of: Option<Uuid>,
    ) -> Result<ReferenceDuplicateDecision> {
        let fingerprint = Fingerprint::from_reference(reference);
        let mut decision = match exact_duplicate_of {
            Some(canonical_id) => {
                let mut decision = ReferenceDuplicateDecision::new(
                    reference.id,
                    DuplicateDetermination::ExactDuplicate,
                );
                decision.canonical_reference_id = Some(canonical_id);
                decision
            }
            None if !fingerprint.searchable() => ReferenceDuplicateDecision::new(
                reference.id,
                DuplicateDetermination::BlurredFingerprint,
            ),
            None => {
                ReferenceDuplicateDecision::new(reference.id, DuplicateDetermination::Pending)
            }
        };
        decision.fingerprint = Some(fingerprint);
        decision.validate()?;

        // Terminal at registration time: activate now. Pending decisions
        // only become active once mapped.
        if decision.duplicate_determination.is_terminal() {
            decision.active_decision = true;
        }
        scope.add_decision(&decision).await?;
        if decision.active_decision {
            scope
                .deactivate_decisions_for(decision.reference_id, decision.id)
                .await?;
        }
        Ok(decision)
    }

    // ========== Phase B: fingerprint candidacy ==========

    /// Nominate candidate canonicals for a pending decision.
    ///
    /// Returns the scored candidates; the decision records their ids and
    /// moves to `Nominated`, or straight to `Canonical` when the search
    /// comes back empty.
    pub async fn nominate_candidate_canonicals(
        &self,
        scope: &mut dyn ReferenceScope,
        decision: &mut ReferenceDuplicateDecision,
    ) -> Result<Vec<CandidateCanonical>> {
        let Some(fingerprint) = decision.fingerprint.clone() else {
            decision.transition(DuplicateDetermination::BlurredFingerprint)?;
            scope.update_decision(decision).await?;
            return Ok(Vec::new());
        };
        if !fingerprint.searchable() {
            decision.transition(DuplicateDetermination::BlurredFingerprint)?;
            scope.update_decision(decision).await?;
            return Ok(Vec::new());
        }

        let mut results = self
            .search_store
            .search_fingerprints(std::slice::from_ref(&fingerprint), MAX_CANDIDATE_CANONICALS)
            .await?;
        let mut candidates = results.pop().unwrap_or_default();
        // A reference's own indexed document is not a candidate for itself.
        candidates.retain(|c| c.reference_id != decision.reference_id);

        if candidates.is_empty() {
            decision.transition(DuplicateDetermination::Canonical)?;
        } else {
            decision.transition(DuplicateDetermination::Nominated)?;
            decision.candidate_canonical_ids =
                candidates.iter().map(|c| c.reference_id).collect();
        }
        scope.update_decision(decision).await?;
        Ok(candidates)
    }

    // ========== Phase C: canonical determination ==========

    /// Pick the canonical from the nominated candidates.
    ///
    /// A candidate at or above the confident-duplicate threshold makes the
    /// incoming reference a duplicate; ties break on (earlier `created_at`,
    /// lower id) so canonicalization is deterministic. Otherwise the
    /// incoming reference is canonical.
    pub async fn determine_canonical_from_candidates(
        &self,
        scope: &mut dyn ReferenceScope,
        decision: &mut ReferenceDuplicateDecision,
        candidates: &[CandidateCanonical],
    ) -> Result<()> {
        if decision.duplicate_determination != DuplicateDetermination::Nominated {
            return Ok(());
        }

        let confident: Vec<&CandidateCanonical> = candidates
            .iter()
            .filter(|c| c.score >= self.config.candidate_duplicate_score_threshold)
            .collect();

        if confident.is_empty() {
            decision.transition(DuplicateDetermination::Canonical)?;
            scope.update_decision(decision).await?;
            return Ok(());
        }

        let candidate_ids: Vec<Uuid> = confident.iter().map(|c| c.reference_id).collect();
        let candidate_references = scope
            .get_references(&candidate_ids, ReferenceInclude::NONE, false)
            .await?;

        let mut ranked: Vec<(&CandidateCanonical, &Reference)> = confident
            .iter()
            .filter_map(|candidate| {
                candidate_references
                    .iter()
                    .find(|r| r.id == candidate.reference_id)
                    .map(|r| (*candidate, r))
            })
            .collect();
        ranked.sort_by(|(a_score, a_ref), (b_score, b_ref)| {
            b_score
                .score
                .partial_cmp(&a_score.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a_ref.created_at.cmp(&b_ref.created_at))
                .then_with(|| a_ref.id.cmp(&b_ref.id))
        });

        match ranked.first() {
            Some((winner, _)) => {
                decision.transition(DuplicateDetermination::Duplicate)?;
                decision.canonical_reference_id = Some(winner.reference_id);
                decision.detail = Some(format!(
                    "fingerprint match with score {:.3}",
                    winner.score
                ));
            }
            None => {
                // Confident candidates that no longer exist in the store are
                // stale index entries; treat as no candidates.
                decision.transition(DuplicateDetermination::Canonical)?;
            }
        }
        scope.update_decision(decision).await?;
        Ok(())
    }

    // ========== Trusted-identifier shortcut ==========

    /// Pair the reference directly with an existing one sharing a trusted
    /// unique identifier, bypassing fingerprint search.
    ///
    /// Returns `None` when no trusted identifier is shared and the normal
    /// pipeline should run.
    pub async fn shortcut_with_trusted_identifiers(
        &self,
        scope: &mut dyn ReferenceScope,
        decision: &mut ReferenceDuplicateDecision,
    ) -> Result<Option<ProcessedDecisions>> {
        if self.config.trusted_unique_identifier_types.is_empty() {
            return Ok(None);
        }
        let reference = scope
            .get_reference(decision.reference_id, ReferenceInclude::CONTENT)
            .await?;
        let trusted_keys: Vec<IdentifierKey> = reference
            .identifiers
            .iter()
            .flatten()
            .map(|i| i.identifier.key())
            .filter(|key| {
                self.config
                    .trusted_unique_identifier_types
                    .contains(&key.identifier_type)
            })
            .collect();
        if trusted_keys.is_empty() {
            return Ok(None);
        }

        let mut matches = scope
            .find_references_with_identifiers(
                &trusted_keys,
                IdentifierMatch::Any,
                ReferenceInclude::NONE.with_decision(),
            )
            .await?;
        matches.retain(|m| m.id != reference.id);
        if matches.is_empty() {
            return Ok(None);
        }

        // Deterministic pairing target: earliest created, lowest id.
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let target = &matches[0];
        let canonical_id = if target.canonical_like() {
            target.id
        } else {
            target
                .canonical_reference_id()
                .ok_or_else(|| Error::Store("duplicate without canonical pointer".to_string()))?
        };
        if canonical_id == reference.id {
            return Ok(None);
        }

        info!(
            reference_id = %reference.id,
            canonical_id = %canonical_id,
            "trusted identifier shortcut pairing references"
        );
        decision.transition(DuplicateDetermination::Duplicate)?;
        decision.canonical_reference_id = Some(canonical_id);
        decision.detail = Some("trusted unique identifier match".to_string());
        scope.update_decision(decision).await?;

        let mapped = self.map_duplicate_decision(scope, decision.clone()).await?;
        Ok(Some(mapped))
    }

    // ========== Phase D: decision mapping ==========

    /// Persist a determined decision as the reference's active decision.
    ///
    /// Enforces the duplicate chain-depth bound: a duplicate may only point
    /// at a canonical-like reference, and a reference that becomes a
    /// duplicate sheds its own dependents by decoupling them for human
    /// review.
    pub async fn map_duplicate_decision(
        &self,
        scope: &mut dyn ReferenceScope,
        mut decision: ReferenceDuplicateDecision,
    ) -> Result<ProcessedDecisions> {
        if decision.duplicate_determination == DuplicateDetermination::Duplicate {
            let canonical_id = decision.canonical_reference_id.ok_or_else(|| {
                Error::InvalidInput("duplicate decision without canonical id".to_string())
            })?;
            let canonical = scope
                .get_reference(canonical_id, ReferenceInclude::NONE.with_decision())
                .await?;
            if !canonical.canonical_like() && self.config.max_reference_duplicate_depth <= 2 {
                // Linking under a duplicate would create a chain deeper than
                // the configured bound: refuse and decouple.
                warn!(
                    reference_id = %decision.reference_id,
                    canonical_id = %canonical_id,
                    "refusing duplicate link that would exceed the chain depth bound"
                );
                decision.duplicate_determination = DuplicateDetermination::Decoupled;
                decision.canonical_reference_id = None;
                decision.detail = Some(format!(
                    "target {canonical_id} is itself a duplicate; chain depth bound reached"
                ));
            }
        }

        let prior = scope.active_decision_for(decision.reference_id).await?;
        let changed = match &prior {
            Some(prior) if prior.id != decision.id => {
                prior.duplicate_determination != decision.duplicate_determination
                    || prior.canonical_reference_id != decision.canonical_reference_id
            }
            Some(_) => false,
            // First decision for the reference: its deduplicated projection
            // is new to the index, which counts as a change.
            None => true,
        };

        decision.active_decision = true;
        decision.updated_at = chrono::Utc::now();
        scope.update_decision(&decision).await?;
        scope
            .deactivate_decisions_for(decision.reference_id, decision.id)
            .await?;

        let mut processed = ProcessedDecisions {
            decisions: vec![MappedDecision {
                decision: decision.clone(),
                changed,
            }],
        };

        // Dependents of a reference that just stopped being canonical-like
        // cannot silently deepen the chain; decouple them for human review.
        if matches!(
            decision.duplicate_determination,
            DuplicateDetermination::Duplicate
        ) {
            let dependents = scope
                .active_decisions_pointing_to(decision.reference_id)
                .await?;
            for dependent in dependents {
                let mut decoupled = ReferenceDuplicateDecision::new(
                    dependent.reference_id,
                    DuplicateDetermination::Decoupled,
                );
                decoupled.active_decision = true;
                decoupled.detail = Some(format!(
                    "canonical {} became a duplicate of {}",
                    decision.reference_id,
                    decision
                        .canonical_reference_id
                        .map(|id| id.to_string())
                        .unwrap_or_default()
                ));
                scope.add_decision(&decoupled).await?;
                scope
                    .deactivate_decisions_for(decoupled.reference_id, decoupled.id)
                    .await?;
                processed.decisions.push(MappedDecision {
                    decision: decoupled,
                    changed: true,
                });
            }
        }

        Ok(processed)
    }

    // ========== Pipeline driver ==========

    /// Run phases B-D for a registered decision.
    ///
    /// Returns `None` when the decision is stale (no longer pending), which
    /// makes redelivered tasks harmless.
    pub async fn process_decision(
        &self,
        scope: &mut dyn ReferenceScope,
        decision_id: Uuid,
    ) -> Result<Option<ProcessedDecisions>> {
        let mut decision = scope.get_decision(decision_id).await?;
        if decision.duplicate_determination != DuplicateDetermination::Pending {
            info!(
                decision_id = %decision_id,
                determination = ?decision.duplicate_determination,
                "decision is no longer pending, skipping"
            );
            return Ok(None);
        }

        if let Some(processed) = self
            .shortcut_with_trusted_identifiers(scope, &mut decision)
            .await?
        {
            return Ok(Some(processed));
        }

        let candidates = self
            .nominate_candidate_canonicals(scope, &mut decision)
            .await?;
        self.determine_canonical_from_candidates(scope, &mut decision, &candidates)
            .await?;
        let processed = self.map_duplicate_decision(scope, decision).await?;
        Ok(Some(processed))
    }

    // ========== Manual override ==========

    /// Apply a manual duplicate decision from the admin surface.
    ///
    /// Runs through the same mapping as automatic decisions, so the chain
    /// depth bound applies and the outcome may come back `Decoupled`.
    pub async fn make_manual_decision(
        &self,
        scope: &mut dyn ReferenceScope,
        request: &MakeDuplicateDecision,
    ) -> Result<ProcessedDecisions> {
        request.validate()?;
        scope
            .verify_reference_ids(std::slice::from_ref(&request.reference_id))
            .await?;

        let mut decision =
            ReferenceDuplicateDecision::new(request.reference_id, DuplicateDetermination::Pending);
        decision.detail = request.detail.clone();
        scope.add_decision(&decision).await?;

        match request.duplicate_determination {
            ManualDuplicateDetermination::Canonical => {
                decision.transition(DuplicateDetermination::Canonical)?;
            }
            ManualDuplicateDetermination::Duplicate => {
                let canonical_id = request.canonical_reference_id.ok_or_else(|| {
                    Error::InvalidInput("manual duplicate requires a canonical id".to_string())
                })?;
                scope
                    .verify_reference_ids(std::slice::from_ref(&canonical_id))
                    .await?;
                decision.transition(DuplicateDetermination::Duplicate)?;
                decision.canonical_reference_id = Some(canonical_id);
            }
        }
        decision.validate()?;
        scope.update_decision(&decision).await?;
        self.map_duplicate_decision(scope, decision).await
    }
}
