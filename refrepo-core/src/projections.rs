//! Pure projection functions over the reference aggregate.
//!
//! These compute every derived view the repository serves: search fields,
//! fingerprints for dedup candidacy, the deduplicated canonical projection,
//! and the status projections for import batches and enhancement requests.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::enhancements::{
    Annotation, AnnotationType, AuthorPosition, Authorship, Enhancement, EnhancementContent,
};
use crate::error::{Error, Result};
use crate::imports::{ImportBatchStatus, ImportResultStatus};
use crate::reference::Reference;
use crate::robots::{EnhancementRequestStatus, PendingEnhancementStatus};

/// Name tokens shorter than this carry no matching signal, unless they are
/// single non-Latin characters (e.g. CJK ideographs).
const MIN_TOKEN_LENGTH: usize = 2;

/// An annotation key projected singly to the root of the search document:
/// (scheme, optional label).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinglyProjectedAnnotation {
    pub scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl SinglyProjectedAnnotation {
    pub fn scheme_wide(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            label: None,
        }
    }
}

/// Compile-time default for the singly-projected registry.
pub fn default_singly_projected_annotations() -> Vec<SinglyProjectedAnnotation> {
    vec![SinglyProjectedAnnotation::scheme_wide("inclusion:destiny")]
}

/// The searchable attributes of a reference, computed from its enhancements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSearchFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#abstract: Option<String>,
    /// Author display names ordered first, middle (by surname), last.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_year: Option<i32>,
    /// Qualified labels (`scheme/label`) of positive boolean annotations.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub annotations: BTreeSet<String>,
    /// Annotation schemes that contributed to this projection.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub evaluated_schemes: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inclusion_score: Option<f64>,
}

/// Compute the search fields for a reference.
///
/// Enhancements are walked in increasing priority: duplicates' enhancements
/// first, the canonical's own last, most recent last within each group, so
/// that later values win per attribute where present. Annotation schemes are
/// replaced wholesale by the highest-priority enhancement carrying them: an
/// annotation missing from a later enhancement of the same scheme counts as
/// removed, not coalesced.
pub fn search_fields(
    reference: &Reference,
    singly_projected: &[SinglyProjectedAnnotation],
) -> ReferenceSearchFields {
    let mut title = None;
    let mut publication_year = None;
    let mut r#abstract = None;
    let mut authorship: Vec<Authorship> = Vec::new();
    let mut annotations_by_scheme: BTreeMap<String, Vec<Annotation>> = BTreeMap::new();
    let mut singly: BTreeMap<(String, Option<String>), Annotation> = BTreeMap::new();

    for enhancement in priority_sorted_enhancements(reference) {
        match &enhancement.content {
            EnhancementContent::Bibliographic {
                title: new_title,
                authorship: new_authorship,
                publication_year: new_year,
                publication_date,
                ..
            } => {
                // Hydrate if present on the enhancement, otherwise keep the
                // prior value.
                title = new_title.clone().or(title);
                if !new_authorship.is_empty() {
                    authorship = new_authorship.clone();
                }
                publication_year = (*new_year)
                    .or_else(|| {
                        publication_date
                            .as_ref()
                            .map(|d| chrono::Datelike::year(d))
                    })
                    .or(publication_year);
            }
            EnhancementContent::Abstract {
                r#abstract: new_abstract,
            } => {
                r#abstract = Some(new_abstract.clone());
            }
            EnhancementContent::Annotation { annotations } => {
                let mut incoming: BTreeMap<String, Vec<Annotation>> = BTreeMap::new();
                for annotation in annotations {
                    for key in [
                        (annotation.scheme.clone(), None),
                        (annotation.scheme.clone(), Some(annotation.label.clone())),
                    ] {
                        let registered = singly_projected
                            .iter()
                            .any(|s| s.scheme == key.0 && s.label == key.1);
                        if registered {
                            singly.insert(key, annotation.clone());
                        }
                    }
                    incoming
                        .entry(annotation.scheme.clone())
                        .or_default()
                        .push(annotation.clone());
                }
                // Whole-scheme replacement.
                annotations_by_scheme.extend(incoming);
            }
            EnhancementContent::Location { .. } => {}
        }
    }

    let positive_annotations = annotations_by_scheme
        .values()
        .flatten()
        .filter(|a| a.annotation_type == AnnotationType::Boolean && a.value == Some(true))
        .map(Annotation::qualified_label)
        .collect();

    let inclusion_score = singly
        .get(&("inclusion:destiny".to_string(), None))
        .and_then(positive_annotation_score);

    ReferenceSearchFields {
        title,
        r#abstract,
        authors: order_authorship_by_position(&authorship),
        publication_year,
        annotations: positive_annotations,
        evaluated_schemes: annotations_by_scheme.keys().cloned().collect(),
        inclusion_score,
    }
}

/// Order a reference's enhancements by increasing projection priority.
///
/// Canonical-owned enhancements outrank duplicates'; within each group, most
/// recent wins. The highest priority enhancement lands at the end.
fn priority_sorted_enhancements(reference: &Reference) -> Vec<&Enhancement> {
    let mut enhancements: Vec<&Enhancement> = reference.enhancements.iter().flatten().collect();
    enhancements.sort_by_key(|e| (e.reference_id == reference.id, e.created_at));
    enhancements
}

/// Order authorship by position: first, middle (alphabetical), last.
fn order_authorship_by_position(authorship: &[Authorship]) -> Vec<String> {
    let mut sorted: Vec<&Authorship> = authorship.iter().collect();
    sorted.sort_by(|a, b| {
        let rank = |position: AuthorPosition| match position {
            AuthorPosition::First => -1,
            AuthorPosition::Middle => 0,
            AuthorPosition::Last => 1,
        };
        rank(a.position)
            .cmp(&rank(b.position))
            .then_with(|| a.display_name.cmp(&b.display_name))
    });
    sorted.into_iter().map(|a| a.display_name.clone()).collect()
}

/// Score of a singly-projected annotation. Boolean annotations yield their
/// truth score (inverted when false); explicit `inclusion_score` data wins.
fn positive_annotation_score(annotation: &Annotation) -> Option<f64> {
    if let Some(score) = annotation.data.get("inclusion_score").and_then(|v| v.as_f64()) {
        return Some(score);
    }
    match annotation.annotation_type {
        AnnotationType::Boolean => annotation.score.map(|score| {
            if annotation.value == Some(true) {
                score
            } else {
                1.0 - score
            }
        }),
        AnnotationType::Score => annotation.score,
    }
}

// ============================================================================
// Fingerprints
// ============================================================================

/// Derived projection used for dedup candidate lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Normalized title tokens, in title order.
    pub title_tokens: Vec<String>,
    /// Author names in positional order (first, middle by name, last).
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_year: Option<i32>,
}

impl Fingerprint {
    /// Compute the fingerprint view of a reference's search fields.
    pub fn from_search_fields(fields: &ReferenceSearchFields) -> Self {
        Self {
            title_tokens: fields
                .title
                .as_deref()
                .map(tokenize_title)
                .unwrap_or_default(),
            authors: fields.authors.clone(),
            publication_year: fields.publication_year,
        }
    }

    pub fn from_reference(reference: &Reference) -> Self {
        Self::from_search_fields(&search_fields(
            reference,
            &default_singly_projected_annotations(),
        ))
    }

    /// A fingerprint can drive a candidate search only when all three
    /// components carry signal.
    pub fn searchable(&self) -> bool {
        !self.title_tokens.is_empty()
            && !self.authors.is_empty()
            && self.publication_year.is_some()
    }
}

/// Lowercase a title and keep its meaningful letter tokens.
pub fn tokenize_title(title: &str) -> Vec<String> {
    title
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|token| is_meaningful_token(token))
        .collect()
}

/// Whether a token carries enough signal for matching. Keeps tokens at or
/// above the minimum length, plus single-character non-ASCII tokens (e.g.
/// CJK ideographs); single ASCII letters are treated as initials.
fn is_meaningful_token(token: &str) -> bool {
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (None, _) => false,
        (Some(c), None) => token.len() >= MIN_TOKEN_LENGTH || !c.is_ascii(),
        (Some(_), Some(_)) => token.chars().count() >= MIN_TOKEN_LENGTH,
    }
}

// ============================================================================
// Deduplicated projection
// ============================================================================

/// Union a canonical reference with its duplicates' identifiers and
/// enhancements, preserving the order of the canonical's own entries.
///
/// The output is flattened: `duplicate_references` is stripped. Requires
/// duplicates to be preloaded; each duplicate is deduplicated recursively to
/// support chain lengths over 1 if ever configured.
pub fn deduplicated_reference(reference: &Reference) -> Result<Reference> {
    let duplicates = reference.duplicate_references.as_ref().ok_or_else(|| {
        Error::Projection(
            "reference must have duplicates preloaded to be deduplicated".to_string(),
        )
    })?;

    let mut deduplicated = reference.clone();
    deduplicated.duplicate_references = None;
    deduplicated.canonical_reference = None;

    for duplicate in duplicates {
        let flattened = if duplicate.duplicate_references.is_some() {
            deduplicated_reference(duplicate)?
        } else {
            duplicate.clone()
        };
        if let Some(enhancements) = &mut deduplicated.enhancements {
            enhancements.extend(flattened.enhancements.into_iter().flatten());
        }
        if let Some(identifiers) = &mut deduplicated.identifiers {
            identifiers.extend(flattened.identifiers.into_iter().flatten());
        }
    }

    Ok(deduplicated)
}

// ============================================================================
// Status projections
// ============================================================================

/// Project an import batch's status from the statuses of its results.
pub fn import_batch_status(
    result_statuses: &HashSet<ImportResultStatus>,
) -> Result<ImportBatchStatus> {
    // No results or nothing begun -> created
    if result_statuses.is_empty()
        || result_statuses == &HashSet::from([ImportResultStatus::Created])
    {
        return Ok(ImportBatchStatus::Created);
    }
    if result_statuses.contains(&ImportResultStatus::Cancelled) {
        return Ok(ImportBatchStatus::Cancelled);
    }
    if result_statuses.contains(&ImportResultStatus::Started)
        || result_statuses.contains(&ImportResultStatus::Created)
    {
        return Ok(ImportBatchStatus::Started);
    }
    if result_statuses == &HashSet::from([ImportResultStatus::Completed]) {
        return Ok(ImportBatchStatus::Completed);
    }
    let failures = HashSet::from([
        ImportResultStatus::Failed,
        ImportResultStatus::PartiallyFailed,
    ]);
    if result_statuses.is_subset(&failures) {
        return Ok(ImportBatchStatus::Failed);
    }
    if result_statuses.contains(&ImportResultStatus::Completed)
        && !result_statuses.is_disjoint(&failures)
    {
        return Ok(ImportBatchStatus::PartiallyFailed);
    }
    Err(Error::Projection(format!(
        "could not resolve import batch status from {result_statuses:?}"
    )))
}

/// Project an enhancement request's status from its pending enhancements'
/// statuses. Expired pending enhancements carry no weight: each has either
/// a retry continuing the work or a terminal sibling that already counted.
pub fn enhancement_request_status(
    pending_statuses: &HashSet<PendingEnhancementStatus>,
) -> Option<EnhancementRequestStatus> {
    let mut statuses = pending_statuses.clone();
    statuses.remove(&PendingEnhancementStatus::Expired);

    // No pending enhancements -> no opinion; keep the stored status.
    if statuses.is_empty() {
        return None;
    }

    if statuses == HashSet::from([PendingEnhancementStatus::Pending]) {
        return Some(EnhancementRequestStatus::Received);
    }
    if statuses.iter().any(|s| !s.is_terminal()) {
        return Some(EnhancementRequestStatus::Processing);
    }
    if statuses == HashSet::from([PendingEnhancementStatus::Completed]) {
        return Some(EnhancementRequestStatus::Completed);
    }
    if statuses == HashSet::from([PendingEnhancementStatus::Failed]) {
        return Some(EnhancementRequestStatus::Failed);
    }
    Some(EnhancementRequestStatus::PartialFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enhancements::Visibility;
    use crate::identifiers::{ExternalIdentifier, LinkedExternalIdentifier};
    use uuid::Uuid;

    fn enhancement(
        reference_id: Uuid,
        content: EnhancementContent,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Enhancement {
        let mut e = Enhancement::new(reference_id, "test", content);
        e.created_at = created_at;
        e
    }

    fn biblio(title: &str, year: Option<i32>, authors: Vec<Authorship>) -> EnhancementContent {
        EnhancementContent::Bibliographic {
            title: Some(title.to_string()),
            authorship: authors,
            publication_year: year,
            publication_date: None,
            publisher: None,
        }
    }

    fn author(name: &str, position: AuthorPosition) -> Authorship {
        Authorship {
            display_name: name.to_string(),
            position,
            orcid: None,
        }
    }

    #[test]
    fn canonical_enhancements_outrank_duplicates() {
        let canonical_id = Uuid::new_v4();
        let duplicate_id = Uuid::new_v4();
        let t0 = chrono::Utc::now();
        let mut reference = Reference::new();
        reference.id = canonical_id;
        reference.enhancements = Some(vec![
            // Newer enhancement, but on the duplicate: must lose.
            enhancement(
                duplicate_id,
                biblio("From the duplicate", Some(2021), vec![]),
                t0 + chrono::Duration::hours(2),
            ),
            enhancement(
                canonical_id,
                biblio("From the canonical", Some(2020), vec![]),
                t0,
            ),
        ]);

        let fields = search_fields(&reference, &default_singly_projected_annotations());
        assert_eq!(fields.title.as_deref(), Some("From the canonical"));
        assert_eq!(fields.publication_year, Some(2020));
    }

    #[test]
    fn later_canonical_enhancement_wins_per_attribute() {
        let canonical_id = Uuid::new_v4();
        let t0 = chrono::Utc::now();
        let mut reference = Reference::new();
        reference.id = canonical_id;
        reference.enhancements = Some(vec![
            enhancement(canonical_id, biblio("Old title", Some(2019), vec![]), t0),
            // Newer, but missing the year: title updates, year is kept.
            enhancement(
                canonical_id,
                EnhancementContent::Bibliographic {
                    title: Some("New title".to_string()),
                    authorship: vec![],
                    publication_year: None,
                    publication_date: None,
                    publisher: None,
                },
                t0 + chrono::Duration::hours(1),
            ),
        ]);

        let fields = search_fields(&reference, &default_singly_projected_annotations());
        assert_eq!(fields.title.as_deref(), Some("New title"));
        assert_eq!(fields.publication_year, Some(2019));
    }

    #[test]
    fn annotation_schemes_replace_wholesale() {
        let canonical_id = Uuid::new_v4();
        let t0 = chrono::Utc::now();
        let note = |label: &str, value: bool| Annotation {
            annotation_type: AnnotationType::Boolean,
            scheme: "topics".to_string(),
            label: label.to_string(),
            value: Some(value),
            score: None,
            data: BTreeMap::new(),
        };
        let mut reference = Reference::new();
        reference.id = canonical_id;
        reference.enhancements = Some(vec![
            enhancement(
                canonical_id,
                EnhancementContent::Annotation {
                    annotations: vec![note("heat", true), note("cold", true)],
                },
                t0,
            ),
            // Later enhancement drops "cold": it must count as removed.
            enhancement(
                canonical_id,
                EnhancementContent::Annotation {
                    annotations: vec![note("heat", true)],
                },
                t0 + chrono::Duration::hours(1),
            ),
        ]);

        let fields = search_fields(&reference, &default_singly_projected_annotations());
        assert!(fields.annotations.contains("topics/heat"));
        assert!(!fields.annotations.contains("topics/cold"));
        assert!(fields.evaluated_schemes.contains("topics"));
    }

    #[test]
    fn inclusion_score_is_singly_projected() {
        let canonical_id = Uuid::new_v4();
        let mut reference = Reference::new();
        reference.id = canonical_id;
        reference.enhancements = Some(vec![enhancement(
            canonical_id,
            EnhancementContent::Annotation {
                annotations: vec![Annotation {
                    annotation_type: AnnotationType::Boolean,
                    scheme: "inclusion:destiny".to_string(),
                    label: "include".to_string(),
                    value: Some(false),
                    score: Some(0.8),
                    data: BTreeMap::new(),
                }],
            },
            chrono::Utc::now(),
        )]);

        let fields = search_fields(&reference, &default_singly_projected_annotations());
        // Negative verdict inverts the score.
        assert!((fields.inclusion_score.unwrap() - 0.2).abs() < 1e-9);
        // Negative booleans do not become positive labels.
        assert!(fields.annotations.is_empty());
    }

    #[test]
    fn authors_ordered_first_middle_last() {
        let ordered = order_authorship_by_position(&[
            author("Zimmer", AuthorPosition::Last),
            author("Doe", AuthorPosition::Middle),
            author("Adams", AuthorPosition::Middle),
            author("Smith", AuthorPosition::First),
        ]);
        assert_eq!(ordered, vec!["Smith", "Adams", "Doe", "Zimmer"]);
    }

    #[test]
    fn title_tokenization_drops_initials_and_punctuation() {
        assert_eq!(
            tokenize_title("Heat & Health: a 10-year review (J. Doe)"),
            vec!["heat", "health", "10", "year", "review", "doe"]
        );
    }

    #[test]
    fn fingerprint_searchable_needs_all_parts() {
        let mut fingerprint = Fingerprint {
            title_tokens: vec!["heat".to_string()],
            authors: vec!["Doe".to_string()],
            publication_year: Some(2020),
        };
        assert!(fingerprint.searchable());
        fingerprint.publication_year = None;
        assert!(!fingerprint.searchable());
    }

    #[test]
    fn deduplicated_projection_unions_and_flattens() {
        let mut canonical = Reference::new();
        canonical.identifiers = Some(vec![LinkedExternalIdentifier::new(
            canonical.id,
            ExternalIdentifier::doi("10.1/a").unwrap(),
        )]);
        canonical.enhancements = Some(vec![]);

        let mut duplicate = Reference::new();
        duplicate.identifiers = Some(vec![LinkedExternalIdentifier::new(
            duplicate.id,
            ExternalIdentifier::doi("10.1/b").unwrap(),
        )]);
        duplicate.enhancements = Some(vec![Enhancement::new(
            duplicate.id,
            "importer",
            EnhancementContent::Abstract {
                r#abstract: "dup abstract".to_string(),
            },
        )]);
        duplicate.duplicate_references = Some(vec![]);

        canonical.duplicate_references = Some(vec![duplicate]);

        let projected = deduplicated_reference(&canonical).unwrap();
        assert!(projected.duplicate_references.is_none());
        assert_eq!(projected.identifiers.as_ref().unwrap().len(), 2);
        assert_eq!(projected.enhancements.as_ref().unwrap().len(), 1);
        // Canonical's own identifier stays first.
        assert_eq!(
            projected.identifiers.as_ref().unwrap()[0]
                .identifier
                .value(),
            "10.1/a"
        );
    }

    #[test]
    fn deduplicated_projection_requires_preload() {
        let reference = Reference {
            duplicate_references: None,
            ..Reference::new()
        };
        assert!(deduplicated_reference(&reference).is_err());
    }

    #[test]
    fn import_batch_status_projection_table() {
        use ImportResultStatus as R;
        let set = |statuses: &[R]| statuses.iter().copied().collect::<HashSet<_>>();

        assert_eq!(
            import_batch_status(&set(&[])).unwrap(),
            ImportBatchStatus::Created
        );
        assert_eq!(
            import_batch_status(&set(&[R::Created])).unwrap(),
            ImportBatchStatus::Created
        );
        assert_eq!(
            import_batch_status(&set(&[R::Completed, R::Started])).unwrap(),
            ImportBatchStatus::Started
        );
        assert_eq!(
            import_batch_status(&set(&[R::Completed])).unwrap(),
            ImportBatchStatus::Completed
        );
        assert_eq!(
            import_batch_status(&set(&[R::Failed, R::PartiallyFailed])).unwrap(),
            ImportBatchStatus::Failed
        );
        assert_eq!(
            import_batch_status(&set(&[R::Completed, R::Failed])).unwrap(),
            ImportBatchStatus::PartiallyFailed
        );
        assert_eq!(
            import_batch_status(&set(&[R::Completed, R::Cancelled])).unwrap(),
            ImportBatchStatus::Cancelled
        );
    }

    #[test]
    fn enhancement_request_status_projection_table() {
        use PendingEnhancementStatus as P;
        let set = |statuses: &[P]| statuses.iter().copied().collect::<HashSet<_>>();

        assert_eq!(enhancement_request_status(&set(&[])), None);
        assert_eq!(enhancement_request_status(&set(&[P::Expired])), None);
        assert_eq!(
            enhancement_request_status(&set(&[P::Pending])),
            Some(EnhancementRequestStatus::Received)
        );
        assert_eq!(
            enhancement_request_status(&set(&[P::Pending, P::Completed])),
            Some(EnhancementRequestStatus::Processing)
        );
        assert_eq!(
            enhancement_request_status(&set(&[P::Indexing])),
            Some(EnhancementRequestStatus::Processing)
        );
        assert_eq!(
            enhancement_request_status(&set(&[P::Completed, P::Expired])),
            Some(EnhancementRequestStatus::Completed)
        );
        assert_eq!(
            enhancement_request_status(&set(&[P::Failed])),
            Some(EnhancementRequestStatus::Failed)
        );
        assert_eq!(
            enhancement_request_status(&set(&[P::Completed, P::Discarded])),
            Some(EnhancementRequestStatus::PartialFailed)
        );
        assert_eq!(
            enhancement_request_status(&set(&[P::Completed, P::IndexingFailed])),
            Some(EnhancementRequestStatus::PartialFailed)
        );
    }

    #[test]
    fn fingerprint_invariant_under_same_priority_reordering() {
        // Two enhancements on the same reference with identical timestamps
        // carry the same priority; the projected fingerprint must not depend
        // on their order in the vector.
        let canonical_id = Uuid::new_v4();
        let t0 = chrono::Utc::now();
        let a = enhancement(
            canonical_id,
            biblio(
                "Heat and Health",
                Some(2020),
                vec![author("Doe", AuthorPosition::First)],
            ),
            t0,
        );
        let b = enhancement(
            canonical_id,
            EnhancementContent::Abstract {
                r#abstract: "We studied heat.".to_string(),
            },
            t0,
        );

        let mut forward = Reference::new();
        forward.id = canonical_id;
        forward.enhancements = Some(vec![a.clone(), b.clone()]);
        let mut backward = Reference::new();
        backward.id = canonical_id;
        backward.enhancements = Some(vec![b, a]);

        assert_eq!(
            Fingerprint::from_reference(&forward),
            Fingerprint::from_reference(&backward)
        );
    }

    #[test]
    fn visibility_default_is_public() {
        assert_eq!(Visibility::default(), Visibility::Public);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Tokenization always yields lowercase tokens that carry
            /// matching signal, whatever the input title looks like.
            #[test]
            fn tokens_are_lowercase_and_meaningful(title in ".{0,200}") {
                for token in tokenize_title(&title) {
                    prop_assert!(!token.is_empty());
                    prop_assert_eq!(token.to_lowercase(), token.clone());
                    let single_latin = token.chars().count() == 1
                        && token.chars().next().unwrap().is_ascii();
                    prop_assert!(!single_latin || token.len() >= 2);
                }
            }

            /// Shuffling same-priority enhancements never changes the
            /// fingerprint: the projection depends on (owner, created_at)
            /// priority, not vector order.
            #[test]
            fn fingerprint_ignores_same_priority_order(seed in 0usize..6) {
                let canonical_id = Uuid::new_v4();
                let t0 = chrono::Utc::now();
                let base = vec![
                    enhancement(
                        canonical_id,
                        biblio("Heat and Health", Some(2020),
                               vec![author("Doe", AuthorPosition::First)]),
                        t0,
                    ),
                    enhancement(
                        canonical_id,
                        EnhancementContent::Abstract {
                            r#abstract: "We studied heat.".to_string(),
                        },
                        t0,
                    ),
                    enhancement(
                        canonical_id,
                        EnhancementContent::Location { locations: vec![] },
                        t0,
                    ),
                ];
                let mut reordered = base.clone();
                reordered.rotate_left(seed % 3);
                if seed >= 3 {
                    reordered.reverse();
                }

                let mut baseline = Reference::new();
                baseline.id = canonical_id;
                baseline.enhancements = Some(base);
                let mut shuffled = Reference::new();
                shuffled.id = canonical_id;
                shuffled.enhancements = Some(reordered);

                prop_assert_eq!(
                    Fingerprint::from_reference(&shuffled),
                    Fingerprint::from_reference(&baseline)
                );
            }
        }
    }
}
