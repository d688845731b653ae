#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_docs_in_private_items)]

//! # In-memory search index
//!
//! [`SearchStore`] implementation holding the deduplicated reference
//! projection and the robot-automation percolator in process memory.
//!
//! This backend serves single-process deployments and the test suites; a
//! cluster-backed index implements the same trait. Query-string support is
//! a conservative subset of the usual syntax: whitespace-separated clauses
//! with optional `field:` qualifiers, all of which must match.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use refrepo_core::error::{Error, Result};
use refrepo_core::projections::{
    default_singly_projected_annotations, search_fields, Fingerprint, ReferenceSearchFields,
    SinglyProjectedAnnotation,
};
use refrepo_core::reference::{Reference, ReferenceWithChangeset};
use refrepo_core::robots::{RobotAutomation, RobotAutomationPercolationResult};
use refrepo_core::search::{
    CandidateCanonical, SearchPage, SearchRequest, SearchStore, SearchTotal, TotalRelation,
};

mod candidates;
mod percolator;
mod query;


use percolator::PercolatorQuery;

/// One indexed reference: the deduplicated projection plus its derived
/// search fields and fingerprint.
#[derive(Debug, Clone)]
pub(crate) struct IndexedReference {
    pub reference: Reference,
    pub fields: ReferenceSearchFields,
    pub fingerprint: Fingerprint,
}

/// A stored automation query, parsed once at index time.
#[derive(Debug, Clone)]
pub(crate) struct StoredAutomation {
    pub robot_id: Uuid,
    pub query: PercolatorQuery,
}

/// In-memory search index over deduplicated references, with a percolator
/// index for robot automations.
pub struct MemSearchIndex {
    singly_projected: Vec<SinglyProjectedAnnotation>,
    references: RwLock<HashMap<Uuid, IndexedReference>>,
    automations: RwLock<HashMap<Uuid, StoredAutomation>>,
}

impl MemSearchIndex {
    pub fn new() -> Self {
        Self::with_singly_projected(default_singly_projected_annotations())
    }

    pub fn with_singly_projected(singly_projected: Vec<SinglyProjectedAnnotation>) -> Self {
        Self {
            singly_projected,
            references: RwLock::new(HashMap::new()),
            automations: RwLock::new(HashMap::new()),
        }
    }

    pub fn reference_count(&self) -> usize {
        self.references.read().len()
    }

    pub fn automation_count(&self) -> usize {
        self.automations.read().len()
    }
}

impl Default for MemSearchIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchStore for MemSearchIndex {
    async fn index_reference(&self, reference: &Reference) -> Result<()> {
        let fields = search_fields(reference, &self.singly_projected);
        let fingerprint = Fingerprint::from_search_fields(&fields);
        self.references.write().insert(
            reference.id,
            IndexedReference {
                reference: reference.clone(),
                fields,
                fingerprint,
            },
        );
        Ok(())
    }

    async fn delete_reference(&self, id: Uuid) -> Result<()> {
        self.references.write().remove(&id);
        Ok(())
    }

    async fn get_reference(&self, id: Uuid) -> Result<Option<Reference>> {
        Ok(self
            .references
            .read()
            .get(&id)
            .map(|doc| doc.reference.clone()))
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchPage> {
        let parsed = query::parse_query_string(&request.query)?;
        let documents = self.references.read();

        let mut scored: Vec<(f64, &IndexedReference)> = documents
            .values()
            .filter_map(|doc| {
                query::matches(&parsed, doc, &request.fields)
                    .map(|score| (score, doc))
            })
            .filter(|(_, doc)| query::passes_filters(doc, request))
            .collect();

        query::sort_hits(&mut scored, &request.sort);

        let total = SearchTotal {
            value: scored.len() as u64,
            relation: TotalRelation::Eq,
        };
        let page = request.page.max(1);
        let page_size = request.page_size.max(1);
        let hits = scored
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .map(|(_, doc)| doc.reference.clone())
            .collect();

        Ok(SearchPage { hits, total, page })
    }

    async fn search_fingerprints(
        &self,
        fingerprints: &[Fingerprint],
        limit: usize,
    ) -> Result<Vec<Vec<CandidateCanonical>>> {
        let documents = self.references.read();
        Ok(fingerprints
            .iter()
            .map(|fingerprint| candidates::score_candidates(fingerprint, documents.values(), limit))
            .collect())
    }

    async fn index_automation(&self, automation: &RobotAutomation) -> Result<()> {
        let query = PercolatorQuery::parse(&automation.query).map_err(|e| {
            Error::MalformedIndexDocument(format!(
                "automation {} query rejected: {e}",
                automation.id
            ))
        })?;
        self.automations.write().insert(
            automation.id,
            StoredAutomation {
                robot_id: automation.robot_id,
                query,
            },
        );
        Ok(())
    }

    async fn delete_automation(&self, id: Uuid) -> Result<()> {
        self.automations.write().remove(&id);
        Ok(())
    }

    async fn percolate(
        &self,
        changesets: &[ReferenceWithChangeset],
    ) -> Result<Vec<RobotAutomationPercolationResult>> {
        let automations = self.automations.read();
        let mut results = Vec::new();
        for (automation_id, stored) in automations.iter() {
            let mut matched: Vec<Uuid> = changesets
                .iter()
                .filter(|changeset| stored.query.matches(changeset))
                .map(|changeset| changeset.reference.id)
                .collect();
            if !matched.is_empty() {
                matched.sort();
                matched.dedup();
                tracing::debug!(
                    automation_id = %automation_id,
                    robot_id = %stored.robot_id,
                    matches = matched.len(),
                    "automation percolation matched"
                );
                results.push(RobotAutomationPercolationResult {
                    robot_id: stored.robot_id,
                    reference_ids: matched,
                });
            }
        }
        Ok(results)
    }
}
