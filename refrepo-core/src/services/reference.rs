//! The service which manages references.
//!
//! Composes ingestion, deduplication, enhancement and search behind
//! transactional scopes. Every public method here is a top-level unit of
//! work: it opens a scope, drives the sub-services, and commits; early
//! returns drop the scope, which rolls back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::{PercolationOperation, RepositoryConfig};
use crate::decisions::{DuplicateDetermination, MakeDuplicateDecision};
use crate::enhancements::Enhancement;
use crate::error::{Error, Result};
use crate::identifiers::IdentifierKey;
use crate::projections::deduplicated_reference;
use crate::reference::{Reference, ReferenceWithChangeset};
use crate::robots::{
    EnhancementRequest, PendingEnhancementStatus, Robot, RobotAutomation,
    RobotAutomationPercolationResult, RobotEnhancementBatchBundle,
};
use crate::search::{AnnotationFilter, PublicationYearRange, SearchPage, SearchStore};
use crate::services::deduplication::{DeduplicationService, MappedDecision};
use crate::services::enhancement::{EnhancementService, ENHANCEMENT_RESULT_PATH};
use crate::services::ingestion::IngestionService;
use crate::services::search::SearchService;
use crate::services::synchronizer::Synchronizer;
use crate::store::{IdentifierMatch, ReferenceInclude, ReferenceScope, ReferenceStore};
use crate::tasks::{Task, TaskQueue};
use crate::wire::{ReferenceCreateResult, RobotResultEntry, RobotResultValidationEntry};

/// Outcome of attaching an enhancement to a reference.
#[derive(Debug, Clone)]
pub enum AddEnhancementOutcome {
    /// Stored; carries the updated reference.
    Added(Box<Reference>),
    /// Exact duplicate of an existing enhancement on the reference.
    Discarded,
    /// Could not be stored; carries the reason.
    Failed(String),
}

/// Outcome of ingesting one import line.
#[derive(Debug)]
pub struct IngestOutcome {
    pub create_result: ReferenceCreateResult,
    /// The reference the entry resolved to: the new reference, or the
    /// existing canonical for an exact duplicate.
    pub reference_id: Option<Uuid>,
    pub decision_id: Option<Uuid>,
    /// A decision left `Pending` needs its processing task queued once the
    /// caller's scope has committed; queueing earlier races the worker
    /// against the uncommitted row.
    pub pending_decision_task: Option<Task>,
}

/// The service which manages references.
pub struct ReferenceService {
    store: Arc<dyn ReferenceStore>,
    search_store: Arc<dyn SearchStore>,
    blob_store: Arc<dyn BlobStore>,
    task_queue: Arc<dyn TaskQueue>,
    config: Arc<RepositoryConfig>,
    ingestion: IngestionService,
    deduplication: DeduplicationService,
    enhancement: EnhancementService,
    search: SearchService,
    synchronizer: Synchronizer,
}

impl ReferenceService {
    pub fn new(
        store: Arc<dyn ReferenceStore>,
        search_store: Arc<dyn SearchStore>,
        blob_store: Arc<dyn BlobStore>,
        task_queue: Arc<dyn TaskQueue>,
        config: Arc<RepositoryConfig>,
    ) -> Self {
        Self {
            ingestion: IngestionService::new(),
            deduplication: DeduplicationService::new(Arc::clone(&search_store), Arc::clone(&config)),
            enhancement: EnhancementService::new(Arc::clone(&blob_store), Arc::clone(&config)),
            search: SearchService::new(Arc::clone(&search_store)),
            synchronizer: Synchronizer::new(Arc::clone(&search_store)),
            store,
            search_store,
            blob_store,
            task_queue,
            config,
        }
    }

    // ========== Reads ==========

    pub async fn get_reference(&self, reference_id: Uuid) -> Result<Reference> {
        let mut scope = self.store.begin().await?;
        scope
            .get_reference(reference_id, ReferenceInclude::CONTENT)
            .await
    }

    /// Resolve identifier lookups (typed external identifiers or raw
    /// reference ids) to deduplicated canonical references.
    pub async fn lookup_references(&self, lookups: &[String]) -> Result<Vec<Reference>> {
        let mut identifier_keys = Vec::new();
        let mut reference_ids = Vec::new();
        for lookup in lookups {
            match lookup.parse::<Uuid>() {
                Ok(id) => reference_ids.push(id),
                Err(_) => identifier_keys.push(IdentifierKey::parse_lookup(lookup)?),
            }
        }

        let mut scope = self.store.begin().await?;
        let mut references = scope
            .find_references_with_identifiers(
                &identifier_keys,
                IdentifierMatch::Any,
                ReferenceInclude::NONE.with_decision(),
            )
            .await?;
        references.extend(
            scope
                .get_references(
                    &reference_ids,
                    ReferenceInclude::NONE.with_decision(),
                    false,
                )
                .await?,
        );

        // Pre-filter duplicates, then resolve each to its deduplicated
        // canonical and filter again in case several inputs share one.
        let mut seen = HashSet::new();
        references.retain(|r| seen.insert(r.id));
        let mut canonicals = Vec::new();
        let mut seen_canonicals = HashSet::new();
        for reference in references {
            let canonical = self
                .deduplicated_canonical_in_scope(scope.as_mut(), reference.id)
                .await?;
            if seen_canonicals.insert(canonical.id) {
                canonicals.push(canonical);
            }
        }
        Ok(canonicals)
    }

    /// The deduplicated canonical for a reference, following the duplicate
    /// redirect when needed.
    async fn deduplicated_canonical_in_scope(
        &self,
        scope: &mut dyn ReferenceScope,
        reference_id: Uuid,
    ) -> Result<Reference> {
        let mut current_id = reference_id;
        loop {
            let reference = scope
                .get_reference(current_id, ReferenceInclude::FULL)
                .await?;
            if reference.canonical_like() {
                return deduplicated_reference(&reference);
            }
            current_id = reference.canonical_reference_id().ok_or_else(|| {
                Error::Store(format!(
                    "reference {current_id} is a duplicate but has no canonical pointer"
                ))
            })?;
        }
    }

    // ========== Writes ==========

    /// Persist a reference aggregate and re-index its canonical.
    pub async fn merge_reference(&self, reference: &Reference) -> Result<()> {
        let mut scope = self.store.begin().await?;
        scope.merge_reference(reference).await?;
        self.synchronizer
            .reference_to_index(scope.as_mut(), reference.id)
            .await?;
        scope.commit().await
    }

    /// Add an enhancement to a reference and re-index its canonical.
    pub async fn add_enhancement(&self, enhancement: Enhancement) -> Result<AddEnhancementOutcome> {
        let mut scope = self.store.begin().await?;
        let reference_id = enhancement.reference_id;
        let enhancement_id = enhancement.id;
        let outcome = self
            .add_enhancement_in_scope(scope.as_mut(), enhancement)
            .await?;
        if matches!(outcome, AddEnhancementOutcome::Added(_)) {
            self.synchronizer
                .reference_to_index(scope.as_mut(), reference_id)
                .await?;
            self.dispatch_automations_for_enhancements_in_scope(
                scope.as_mut(),
                &[enhancement_id],
                &format!("Enhancement:{enhancement_id}"),
                None,
            )
            .await;
        }
        scope.commit().await?;
        Ok(outcome)
    }

    /// Attach an enhancement within an existing scope.
    ///
    /// Domain outcomes (duplicate content, invalid parents, missing
    /// reference) come back as [`AddEnhancementOutcome`] variants; only
    /// store-level failures are errors.
    pub(crate) async fn add_enhancement_in_scope(
        &self,
        scope: &mut dyn ReferenceScope,
        enhancement: Enhancement,
    ) -> Result<AddEnhancementOutcome> {
        let mut reference = match scope
            .get_reference(enhancement.reference_id, ReferenceInclude::DEDUPLICATED)
            .await
        {
            Ok(reference) => reference,
            Err(Error::NotFound { .. }) => {
                return Ok(AddEnhancementOutcome::Failed(
                    "Reference does not exist.".to_string(),
                ));
            }
            Err(e) => return Err(e),
        };

        let incoming_hash = enhancement.content_hash();
        if reference
            .enhancements
            .iter()
            .flatten()
            .any(|existing| existing.content_hash() == incoming_hash)
        {
            return Ok(AddEnhancementOutcome::Discarded);
        }

        if let Some(parent_ids) = &enhancement.derived_from {
            let valid_reference_ids: HashSet<Uuid> = reference
                .duplicate_references
                .iter()
                .flatten()
                .map(|r| r.id)
                .chain(std::iter::once(reference.id))
                .collect();
            let parents = match scope.get_enhancements(parent_ids).await {
                Ok(parents) => parents,
                Err(Error::NotFoundBy { value, .. }) => {
                    return Ok(AddEnhancementOutcome::Failed(format!(
                        "Enhancements with ids {value} do not exist."
                    )));
                }
                Err(e) => return Err(e),
            };
            if !parents
                .iter()
                .all(|parent| valid_reference_ids.contains(&parent.reference_id))
            {
                return Ok(AddEnhancementOutcome::Failed(
                    "All parent enhancements must belong to the same reference tree \
                     as the child enhancement."
                        .to_string(),
                ));
            }
        }

        // The reference is an aggregate of its enhancements; append and
        // merge the whole thing back.
        reference
            .enhancements
            .get_or_insert_with(Vec::new)
            .push(enhancement);
        scope.merge_reference(&reference).await?;
        Ok(AddEnhancementOutcome::Added(Box::new(reference)))
    }

    // ========== Ingestion ==========

    /// Ingest one import line within an existing scope: parse, run the
    /// exact-duplicate short-circuit, persist, and register the duplicate
    /// decision.
    pub(crate) async fn ingest_reference_in_scope(
        &self,
        scope: &mut dyn ReferenceScope,
        record_str: &str,
        entry_ref: usize,
    ) -> Result<IngestOutcome> {
        let create_result = self.ingestion.ingest_reference(record_str, entry_ref);
        let Some(reference) = create_result.reference.clone() else {
            return Ok(IngestOutcome {
                create_result,
                reference_id: None,
                decision_id: None,
                pending_decision_task: None,
            });
        };

        if self.config.deduplication {
            if let Some(canonical) = self
                .deduplication
                .find_exact_duplicate(scope, &reference)
                .await?
            {
                info!(
                    reference_id = %reference.id,
                    canonical_reference_id = %canonical.id,
                    "exact duplicate found during ingestion"
                );
                let decision = self
                    .deduplication
                    .register_decision(scope, &reference, Some(canonical.id))
                    .await?;
                // The incoming reference is not persisted beyond its
                // decision; the entry resolves to the existing canonical.
                return Ok(IngestOutcome {
                    create_result,
                    reference_id: Some(canonical.id),
                    decision_id: Some(decision.id),
                    pending_decision_task: None,
                });
            }
        }

        scope.merge_reference(&reference).await?;
        self.synchronizer
            .reference_to_index(scope, reference.id)
            .await?;

        let mut pending_decision_task = None;
        let decision = if self.config.deduplication {
            let decision = self
                .deduplication
                .register_decision(scope, &reference, None)
                .await?;
            match decision.duplicate_determination {
                DuplicateDetermination::Pending => {
                    pending_decision_task = Some(Task::ProcessDuplicateDecision {
                        decision_id: decision.id,
                    });
                }
                // Terminal at registration (blurred fingerprint): the new
                // canonical still triggers automations.
                _ => {
                    self.dispatch_automations_for_reference_in_scope(
                        scope,
                        reference.id,
                        &format!("DuplicateDecision:{}", decision.id),
                        None,
                    )
                    .await;
                }
            }
            Some(decision)
        } else {
            None
        };

        Ok(IngestOutcome {
            reference_id: Some(reference.id),
            decision_id: decision.map(|d| d.id),
            create_result,
            pending_decision_task,
        })
    }

    // ========== Duplicate decisions ==========

    /// Task body: run the dedup pipeline for one registered decision and
    /// apply its side effects.
    pub async fn process_duplicate_decision(&self, decision_id: Uuid) -> Result<()> {
        let mut scope = self.store.begin().await?;
        let Some(processed) = self
            .deduplication
            .process_decision(scope.as_mut(), decision_id)
            .await?
        else {
            return Ok(());
        };
        for mapped in &processed.decisions {
            self.apply_decision_side_effects(scope.as_mut(), mapped)
                .await?;
        }
        scope.commit().await
    }

    /// Apply a manual duplicate override.
    pub async fn make_manual_duplicate_decision(
        &self,
        request: &MakeDuplicateDecision,
    ) -> Result<crate::decisions::ReferenceDuplicateDecision> {
        let mut scope = self.store.begin().await?;
        let processed = self
            .deduplication
            .make_manual_decision(scope.as_mut(), request)
            .await?;
        for mapped in &processed.decisions {
            self.apply_decision_side_effects(scope.as_mut(), mapped)
                .await?;
        }
        scope.commit().await?;
        Ok(processed.decisions[0].decision.clone())
    }

    /// Re-project the affected canonical and, when the canonical assignment
    /// changed, percolate the new canonical-with-implied-changeset.
    /// Percolation failures are logged and do not poison the decision.
    async fn apply_decision_side_effects(
        &self,
        scope: &mut dyn ReferenceScope,
        mapped: &MappedDecision,
    ) -> Result<()> {
        if !mapped.decision.active_decision {
            return Ok(());
        }
        self.synchronizer
            .reference_to_index(scope, mapped.decision.reference_id)
            .await?;
        if mapped.changed {
            self.dispatch_automations_for_reference_in_scope(
                scope,
                mapped.decision.reference_id,
                &format!("DuplicateDecision:{}", mapped.decision.id),
                None,
            )
            .await;
        }
        Ok(())
    }

    /// Register fresh pending decisions for existing references and queue
    /// their processing. Used to re-run deduplication over already-imported
    /// data, e.g. after a configuration change.
    pub async fn invoke_deduplication_for_references(
        &self,
        reference_ids: &[Uuid],
    ) -> Result<()> {
        let mut scope = self.store.begin().await?;
        scope.verify_reference_ids(reference_ids).await?;
        let mut tasks = Vec::new();
        for reference_id in reference_ids {
            let reference = scope
                .get_reference(*reference_id, ReferenceInclude::CONTENT)
                .await?;
            let decision = self
                .deduplication
                .register_decision(scope.as_mut(), &reference, None)
                .await?;
            if decision.duplicate_determination == DuplicateDetermination::Pending {
                tasks.push(Task::ProcessDuplicateDecision {
                    decision_id: decision.id,
                });
            }
        }
        scope.commit().await?;
        for task in tasks {
            self.task_queue.enqueue(task).await?;
        }
        Ok(())
    }

    // ========== Robot automations ==========

    /// Percolate a reference's implied changeset and enqueue pending
    /// enhancements for matching automations.
    async fn dispatch_automations_for_reference_in_scope(
        &self,
        scope: &mut dyn ReferenceScope,
        reference_id: Uuid,
        source: &str,
        skip_robot_id: Option<Uuid>,
    ) {
        let changeset = match self
            .reference_with_implied_changeset(scope, reference_id)
            .await
        {
            Ok(changeset) => changeset,
            Err(e) => {
                warn!(reference_id = %reference_id, error = %e, "automation changeset load failed");
                return;
            }
        };
        if let Err(e) = self
            .detect_and_dispatch_automations(scope, &[changeset], source, skip_robot_id)
            .await
        {
            warn!(reference_id = %reference_id, error = %e, "automation percolation failed");
        }
    }

    /// Percolate imported enhancements (chunked) and enqueue pending
    /// enhancements for matching automations. Each changeset carries only
    /// the enhancement that arrived, on top of its deduplicated canonical.
    /// Failures are logged only.
    async fn dispatch_automations_for_enhancements_in_scope(
        &self,
        scope: &mut dyn ReferenceScope,
        enhancement_ids: &[Uuid],
        source: &str,
        skip_robot_id: Option<Uuid>,
    ) {
        let chunk_size = self
            .config
            .percolation_chunk_size(PercolationOperation::RobotAutomation)
            .max(1);
        for chunk in enhancement_ids.chunks(chunk_size) {
            let enhancements = match scope.get_enhancements(chunk).await {
                Ok(enhancements) => enhancements,
                Err(e) => {
                    warn!(error = %e, source, "automation changeset load failed");
                    continue;
                }
            };
            let mut changesets = Vec::new();
            for enhancement in enhancements {
                let reference_id = enhancement.reference_id;
                match self
                    .deduplicated_canonical_in_scope(scope, reference_id)
                    .await
                {
                    Ok(canonical) => {
                        let mut changeset = Reference::new();
                        changeset.id = reference_id;
                        changeset.identifiers = None;
                        changeset.enhancements = Some(vec![enhancement]);
                        changesets.push(ReferenceWithChangeset {
                            reference: canonical,
                            changeset,
                        });
                    }
                    Err(e) => {
                        warn!(reference_id = %reference_id, error = %e, "automation changeset load failed");
                    }
                }
            }
            if let Err(e) = self
                .detect_and_dispatch_automations(scope, &changesets, source, skip_robot_id)
                .await
            {
                warn!(error = %e, source, "automation percolation failed");
            }
        }
    }

    /// A canonical reference with its implied changeset: the reference
    /// itself, on top of its deduplicated canonical.
    async fn reference_with_implied_changeset(
        &self,
        scope: &mut dyn ReferenceScope,
        reference_id: Uuid,
    ) -> Result<ReferenceWithChangeset> {
        let changeset = scope
            .get_reference(reference_id, ReferenceInclude::CONTENT)
            .await?;
        let canonical = self
            .deduplicated_canonical_in_scope(scope, reference_id)
            .await?;
        Ok(ReferenceWithChangeset {
            reference: canonical,
            changeset,
        })
    }

    /// Percolate changesets, merge matches by robot, and create pending
    /// enhancements, skipping `skip_robot_id` to prevent self-loops.
    async fn detect_and_dispatch_automations(
        &self,
        scope: &mut dyn ReferenceScope,
        changesets: &[ReferenceWithChangeset],
        source: &str,
        skip_robot_id: Option<Uuid>,
    ) -> Result<()> {
        if changesets.is_empty() {
            return Ok(());
        }
        let results = self.search_store.percolate(changesets).await?;

        // Merge on robot id.
        let mut merged: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
        for result in results {
            merged
                .entry(result.robot_id)
                .or_default()
                .extend(result.reference_ids);
        }

        for (robot_id, reference_ids) in merged {
            if Some(robot_id) == skip_robot_id {
                warn!(
                    robot_id = %robot_id,
                    source,
                    "detected robot automation loop, skipping; this is likely a \
                     problem in the percolation query"
                );
                continue;
            }
            let mut reference_ids: Vec<Uuid> = reference_ids.into_iter().collect();
            reference_ids.sort();
            self.enhancement
                .create_pending_enhancements(
                    scope,
                    robot_id,
                    &reference_ids,
                    None,
                    Some(source.to_string()),
                )
                .await?;
        }
        Ok(())
    }

    /// Detect robot automations without dispatching, for inspection.
    pub async fn detect_robot_automations(
        &self,
        changesets: &[ReferenceWithChangeset],
    ) -> Result<Vec<RobotAutomationPercolationResult>> {
        let results = self.search_store.percolate(changesets).await?;
        let mut merged: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
        for result in results {
            merged
                .entry(result.robot_id)
                .or_default()
                .extend(result.reference_ids);
        }
        Ok(merged
            .into_iter()
            .map(|(robot_id, reference_ids)| {
                let mut reference_ids: Vec<Uuid> = reference_ids.into_iter().collect();
                reference_ids.sort();
                RobotAutomationPercolationResult {
                    robot_id,
                    reference_ids,
                }
            })
            .collect())
    }

    // ========== Enhancement requests & robot polling ==========

    pub async fn create_enhancement_request(
        &self,
        request: &EnhancementRequest,
    ) -> Result<EnhancementRequest> {
        let mut scope = self.store.begin().await?;
        self.enhancement.create_request(scope.as_mut(), request).await?;
        scope.commit().await?;
        Ok(request.clone())
    }

    pub async fn get_enhancement_request(&self, request_id: Uuid) -> Result<EnhancementRequest> {
        let mut scope = self.store.begin().await?;
        self.enhancement
            .request_with_calculated_status(scope.as_mut(), request_id)
            .await
    }

    /// Robot poll: lease a batch of pending enhancements. `None` when no
    /// eligible work exists, which the API surfaces as "no content".
    pub async fn poll_robot_enhancement_batch(
        &self,
        robot_id: Uuid,
        limit: usize,
        lease_duration: Option<Duration>,
    ) -> Result<Option<RobotEnhancementBatchBundle>> {
        let lease = lease_duration.unwrap_or_else(|| self.config.default_robot_lease_duration());
        let mut scope = self.store.begin().await?;
        scope.get_robot(robot_id).await?;
        let pending = self
            .enhancement
            .select_pendings_for_batch(scope.as_mut(), robot_id, limit)
            .await?;
        if pending.is_empty() {
            return Ok(None);
        }
        let (batch, expires_at) = self
            .enhancement
            .create_robot_batch(scope.as_mut(), robot_id, &pending, lease)
            .await?;
        let bundle = self.enhancement.bundle_for_robot(&batch, expires_at).await?;
        scope.commit().await?;
        Ok(Some(bundle))
    }

    pub async fn renew_robot_enhancement_batch_lease(
        &self,
        batch_id: Uuid,
        lease_duration: Option<Duration>,
    ) -> Result<(u64, chrono::DateTime<chrono::Utc>)> {
        let lease = lease_duration.unwrap_or_else(|| self.config.default_robot_lease_duration());
        let mut scope = self.store.begin().await?;
        let renewed = self
            .enhancement
            .renew_lease(scope.as_mut(), batch_id, lease)
            .await?;
        scope.commit().await?;
        Ok(renewed)
    }

    /// Sweep stale leases and create retries.
    pub async fn sweep_expired_leases(&self) -> Result<()> {
        let mut scope = self.store.begin().await?;
        let outcome = self
            .enhancement
            .expire_and_retry_stale_pendings(scope.as_mut(), chrono::Utc::now())
            .await?;
        scope.commit().await?;
        if outcome.expired > 0 {
            info!(
                expired = outcome.expired,
                replaced_with = outcome.replaced_with,
                "swept stale pending enhancements"
            );
        }
        Ok(())
    }

    // ========== Robot batch result ingestion ==========

    /// Validate and import a robot enhancement batch result.
    ///
    /// Streams the robot's result JSONL line by line, applies each valid
    /// enhancement, streams a per-line validation report to blob storage as
    /// the result is consumed, emits "missing" entries for expected
    /// references that never appeared, categorizes the batch's pending
    /// enhancements, re-indexes affected references, and finally percolates
    /// the imported enhancements with the batch's robot excluded.
    pub async fn process_robot_enhancement_batch_result(&self, batch_id: Uuid) -> Result<()> {
        let mut scope = self.store.begin().await?;
        let batch = scope.get_robot_batch(batch_id, true).await?;
        let result_file = batch
            .result_file
            .clone()
            .ok_or_else(|| Error::Store("robot enhancement batch has no result file".to_string()))?;
        let pending = match batch.pending_enhancements.clone() {
            Some(pending) if !pending.is_empty() => pending,
            _ => scope.find_pending_by_batch(batch_id).await?,
        };
        // An expired lease belongs to the sweep; a late result cannot
        // resurrect it.
        let pending: Vec<_> = pending
            .into_iter()
            .filter(|p| p.status != PendingEnhancementStatus::Expired)
            .collect();
        let pending_ids: Vec<Uuid> = pending.iter().map(|p| p.id).collect();
        scope
            .update_pending_status(&pending_ids, PendingEnhancementStatus::Importing)
            .await?;

        let expected: HashSet<Uuid> = pending.iter().map(|p| p.reference_id).collect();
        let mut attempted: HashSet<Uuid> = HashSet::new();
        let mut processed: HashSet<Uuid> = HashSet::new();
        let mut successful: HashSet<Uuid> = HashSet::new();
        let mut discarded: HashSet<Uuid> = HashSet::new();
        let mut imported_enhancement_ids: Vec<Uuid> = Vec::new();

        let mut reader = self.blob_store.stream_lines(&result_file).await?;
        let mut writer = self
            .blob_store
            .create(ENHANCEMENT_RESULT_PATH, &format!("{batch_id}_repo.jsonl"))
            .await?;

        let mut line_no: usize = 0;
        while let Some(line) = reader.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let entry = match RobotResultEntry::from_jsonl(&line) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(line_no, error = %e, "failed to parse enhancement result line");
                    writer
                        .write_line(
                            &RobotResultValidationEntry::failure(
                                None,
                                format!("Line {line_no}: {e}"),
                            )
                            .to_jsonl(),
                        )
                        .await?;
                    continue;
                }
            };

            let reference_id = entry.reference_id();
            if !expected.contains(&reference_id) {
                writer
                    .write_line(
                        &RobotResultValidationEntry::failure(
                            Some(reference_id),
                            "Reference is not in the requested batch.",
                        )
                        .to_jsonl(),
                    )
                    .await?;
                continue;
            }
            if !processed.insert(reference_id) {
                writer
                    .write_line(
                        &RobotResultValidationEntry::failure(
                            Some(reference_id),
                            "Duplicate entry for reference in result; only the first is applied.",
                        )
                        .to_jsonl(),
                    )
                    .await?;
                continue;
            }
            attempted.insert(reference_id);

            let validation_entry = match entry {
                RobotResultEntry::Error(robot_error) => RobotResultValidationEntry::failure(
                    Some(robot_error.reference_id),
                    robot_error.message,
                ),
                RobotResultEntry::Enhancement(enhancement) => {
                    let enhancement_id = enhancement.id;
                    match self
                        .add_enhancement_in_scope(scope.as_mut(), *enhancement)
                        .await?
                    {
                        AddEnhancementOutcome::Added(_) => {
                            successful.insert(reference_id);
                            imported_enhancement_ids.push(enhancement_id);
                            RobotResultValidationEntry::success(reference_id)
                        }
                        AddEnhancementOutcome::Discarded => {
                            discarded.insert(reference_id);
                            RobotResultValidationEntry::failure(
                                Some(reference_id),
                                "Exact duplicate enhancement already exists on reference.",
                            )
                        }
                        AddEnhancementOutcome::Failed(reason) => {
                            warn!(
                                line_no,
                                reference_id = %reference_id,
                                error = %reason,
                                "failed to add enhancement"
                            );
                            RobotResultValidationEntry::failure(Some(reference_id), reason)
                        }
                    }
                }
            };
            writer.write_line(&validation_entry.to_jsonl()).await?;
        }

        // Entries the robot never produced.
        for missing in expected.difference(&attempted) {
            writer
                .write_line(
                    &RobotResultValidationEntry::failure(
                        Some(*missing),
                        "Requested reference not in enhancement result.",
                    )
                    .to_jsonl(),
                )
                .await?;
        }
        let validation_file = writer.finish().await?;
        scope
            .set_robot_batch_validation_file(batch_id, &validation_file)
            .await?;

        // Categorize and settle pending enhancements.
        let categorized = self
            .enhancement
            .categorize_pendings(&pending, &successful, &discarded);
        scope
            .update_pending_status(&categorized.discarded, PendingEnhancementStatus::Discarded)
            .await?;
        scope
            .update_pending_status(&categorized.failed, PendingEnhancementStatus::Failed)
            .await?;
        scope
            .update_pending_status(&categorized.successful, PendingEnhancementStatus::Indexing)
            .await?;

        let successful_reference_ids: Vec<Uuid> = successful.iter().copied().collect();
        match self
            .synchronizer
            .references_to_index(scope.as_mut(), &successful_reference_ids)
            .await
        {
            Ok(()) => {
                scope
                    .update_pending_status(
                        &categorized.successful,
                        PendingEnhancementStatus::Completed,
                    )
                    .await?;
            }
            Err(e) => {
                // Indexing failure does not fail the batch; the imported
                // content is committed and a later sync repairs the index.
                warn!(robot_enhancement_batch_id = %batch_id, error = %e, "indexing failed");
                scope
                    .update_pending_status(
                        &categorized.successful,
                        PendingEnhancementStatus::IndexingFailed,
                    )
                    .await?;
            }
        }

        self.dispatch_automations_for_enhancements_in_scope(
            scope.as_mut(),
            &imported_enhancement_ids,
            &format!("RobotEnhancementBatch:{batch_id}"),
            Some(batch.robot_id),
        )
        .await;

        scope.commit().await
    }

    /// Mark a robot enhancement batch as failed and record the error.
    pub async fn mark_robot_enhancement_batch_failed(
        &self,
        batch_id: Uuid,
        error: &str,
    ) -> Result<()> {
        let mut scope = self.store.begin().await?;
        self.enhancement
            .mark_batch_failed(scope.as_mut(), batch_id, error)
            .await?;
        scope.commit().await
    }

    // ========== Robots & automations admin ==========

    pub async fn create_robot(&self, robot: &Robot) -> Result<()> {
        let mut scope = self.store.begin().await?;
        scope.add_robot(robot).await?;
        scope.commit().await
    }

    pub async fn get_robot(&self, robot_id: Uuid) -> Result<Robot> {
        let mut scope = self.store.begin().await?;
        scope.get_robot(robot_id).await
    }

    pub async fn update_robot(&self, robot: &Robot) -> Result<()> {
        let mut scope = self.store.begin().await?;
        scope.update_robot(robot).await?;
        scope.commit().await
    }

    pub async fn delete_robot(&self, robot_id: Uuid) -> Result<()> {
        let mut scope = self.store.begin().await?;
        scope.delete_robot(robot_id).await?;
        scope.commit().await
    }

    /// Add a robot automation, mirroring it into the percolator index.
    ///
    /// Indexing runs inside the transactional scope on purpose: the index
    /// validates the query, and a malformed one rolls the insert back.
    pub async fn add_robot_automation(&self, automation: &RobotAutomation) -> Result<()> {
        let mut scope = self.store.begin().await?;
        scope.get_robot(automation.robot_id).await?;
        scope.add_automation(automation).await?;
        self.synchronizer
            .automation_to_index(scope.as_mut(), automation.id)
            .await?;
        scope.commit().await
    }

    pub async fn update_robot_automation(&self, automation: &RobotAutomation) -> Result<()> {
        let mut scope = self.store.begin().await?;
        scope.get_automation(automation.id).await?;
        scope.get_robot(automation.robot_id).await?;
        scope.merge_automation(automation).await?;
        self.synchronizer
            .automation_to_index(scope.as_mut(), automation.id)
            .await?;
        scope.commit().await
    }

    pub async fn delete_robot_automation(&self, automation_id: Uuid) -> Result<()> {
        let mut scope = self.store.begin().await?;
        scope.delete_automation(automation_id).await?;
        self.search_store.delete_automation(automation_id).await?;
        scope.commit().await
    }

    pub async fn get_robot_automations(&self) -> Result<Vec<RobotAutomation>> {
        let mut scope = self.store.begin().await?;
        scope.all_automations().await
    }

    // ========== Search & indexing ==========

    pub async fn search_references(
        &self,
        query: &str,
        page: usize,
        annotations: Vec<AnnotationFilter>,
        publication_year_range: Option<PublicationYearRange>,
        sort: Vec<String>,
    ) -> Result<SearchPage> {
        self.search
            .search_with_query_string(query, page, annotations, publication_year_range, sort)
            .await
    }

    /// Re-index a set of references.
    pub async fn index_references(&self, reference_ids: &[Uuid]) -> Result<()> {
        let mut scope = self.store.begin().await?;
        self.synchronizer
            .references_to_index(scope.as_mut(), reference_ids)
            .await?;
        scope.commit().await
    }

    /// Re-index every reference in the store.
    pub async fn repopulate_reference_index(&self) -> Result<()> {
        let mut scope = self.store.begin().await?;
        let ids = scope.all_reference_ids().await?;
        self.synchronizer
            .references_to_index(scope.as_mut(), &ids)
            .await?;
        scope.commit().await
    }

    /// Rebuild the automation percolation index.
    pub async fn repopulate_robot_automation_index(&self) -> Result<()> {
        let mut scope = self.store.begin().await?;
        self.synchronizer
            .repopulate_automations(scope.as_mut())
            .await?;
        scope.commit().await
    }
}
