//! The search store capability.
//!
//! The search store holds the deduplicated projection of every canonical
//! reference plus a percolator index of robot-automation queries. Writes
//! pass through the synchronizer; reads serve full-text search, identifier
//! lookup and fingerprint candidacy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::projections::Fingerprint;
use crate::reference::{Reference, ReferenceWithChangeset};
use crate::robots::{RobotAutomation, RobotAutomationPercolationResult};

/// Inclusive publication-year bounds; either bound optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationYearRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i32>,
}

impl PublicationYearRange {
    pub fn contains(&self, year: i32) -> bool {
        self.start.is_none_or(|start| year >= start)
            && self.end.is_none_or(|end| year <= end)
    }
}

/// Filter on annotations. A scheme-only filter matches any positive boolean
/// label in the scheme; a label filter matches that specific positive label;
/// a score filter matches references whose inclusion score is at least the
/// given value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationFilter {
    pub scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
}

/// A full-text search request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Query in the index's native string syntax.
    pub query: String,
    /// Restrict bare terms to these fields; empty means all fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_year_range: Option<PublicationYearRange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<AnnotationFilter>,
    /// Field names to sort by; `-` prefix for descending. Empty sorts by
    /// relevance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<String>,
    /// 1-indexed page number.
    pub page: usize,
    pub page_size: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            fields: Vec::new(),
            publication_year_range: None,
            annotations: Vec::new(),
            sort: Vec::new(),
            page: 1,
            page_size: 20,
        }
    }
}

/// Whether a result total is exact or a lower bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TotalRelation {
    Eq,
    Gte,
}

/// Total-count information for a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTotal {
    pub value: u64,
    pub relation: TotalRelation,
}

/// One page of search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPage {
    pub hits: Vec<Reference>,
    pub total: SearchTotal,
    /// 1-indexed page number of this window.
    pub page: usize,
}

/// A candidate canonical surfaced by a fingerprint search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateCanonical {
    pub reference_id: Uuid,
    /// Relevance in `[0, 1]`.
    pub score: f64,
}

/// Derived deduplicated view of each canonical reference, plus a percolator
/// for robot-automation queries.
#[async_trait]
pub trait SearchStore: Send + Sync {
    /// Upsert the deduplicated projection of a canonical reference.
    async fn index_reference(&self, reference: &Reference) -> Result<()>;

    async fn delete_reference(&self, id: Uuid) -> Result<()>;

    /// The indexed document, for serving and verification.
    async fn get_reference(&self, id: Uuid) -> Result<Option<Reference>>;

    async fn search(&self, request: &SearchRequest) -> Result<SearchPage>;

    /// Candidate canonicals for each fingerprint, best first, capped at
    /// `limit` per fingerprint.
    async fn search_fingerprints(
        &self,
        fingerprints: &[Fingerprint],
        limit: usize,
    ) -> Result<Vec<Vec<CandidateCanonical>>>;

    /// Mirror a robot-automation percolator query into the index. Rejects
    /// malformed queries with
    /// [`Error::MalformedIndexDocument`](crate::error::Error::MalformedIndexDocument).
    async fn index_automation(&self, automation: &RobotAutomation) -> Result<()>;

    async fn delete_automation(&self, id: Uuid) -> Result<()>;

    /// Percolate changesets against the automation queries. Matches are per
    /// automation; the caller merges by robot.
    async fn percolate(
        &self,
        changesets: &[ReferenceWithChangeset],
    ) -> Result<Vec<RobotAutomationPercolationResult>>;
}
