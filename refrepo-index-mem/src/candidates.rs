//! Fingerprint candidate scoring for deduplication.

use std::collections::HashSet;

use refrepo_core::projections::Fingerprint;
use refrepo_core::search::CandidateCanonical;

use crate::IndexedReference;

/// Weights of the fingerprint components. Title tokens dominate; author
/// overlap and the publication year confirm.
const TITLE_WEIGHT: f64 = 0.5;
const AUTHOR_WEIGHT: f64 = 0.3;
const YEAR_WEIGHT: f64 = 0.2;

/// Candidates below this score are noise and never nominated.
const MIN_CANDIDATE_SCORE: f64 = 0.3;

/// Score every indexed reference against the fingerprint, best first.
pub(crate) fn score_candidates<'a>(
    fingerprint: &Fingerprint,
    documents: impl Iterator<Item = &'a IndexedReference>,
    limit: usize,
) -> Vec<CandidateCanonical> {
    if !fingerprint.searchable() {
        return Vec::new();
    }
    let mut scored: Vec<CandidateCanonical> = documents
        .filter(|doc| doc.fingerprint.searchable())
        .filter_map(|doc| {
            let score = fingerprint_similarity(fingerprint, &doc.fingerprint);
            (score >= MIN_CANDIDATE_SCORE).then_some(CandidateCanonical {
                reference_id: doc.reference.id,
                score,
            })
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.reference_id.cmp(&b.reference_id))
    });
    scored.truncate(limit);
    scored
}

fn fingerprint_similarity(a: &Fingerprint, b: &Fingerprint) -> f64 {
    let title = jaccard(&a.title_tokens, &b.title_tokens);
    let authors = jaccard(&a.authors, &b.authors);
    let year = match (a.publication_year, b.publication_year) {
        (Some(a_year), Some(b_year)) if a_year == b_year => 1.0,
        _ => 0.0,
    };
    TITLE_WEIGHT * title + AUTHOR_WEIGHT * authors + YEAR_WEIGHT * year
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    let a_set: HashSet<&String> = a.iter().collect();
    let b_set: HashSet<&String> = b.iter().collect();
    if a_set.is_empty() && b_set.is_empty() {
        return 0.0;
    }
    let intersection = a_set.intersection(&b_set).count() as f64;
    let union = a_set.union(&b_set).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_fingerprints_score_one() {
        let fingerprint = Fingerprint {
            title_tokens: vec!["heat".into(), "health".into()],
            authors: vec!["Doe".into(), "Smith".into()],
            publication_year: Some(2020),
        };
        assert!((fingerprint_similarity(&fingerprint, &fingerprint) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn year_mismatch_caps_the_score() {
        let a = Fingerprint {
            title_tokens: vec!["heat".into()],
            authors: vec!["Doe".into()],
            publication_year: Some(2020),
        };
        let b = Fingerprint {
            publication_year: Some(2021),
            ..a.clone()
        };
        let score = fingerprint_similarity(&a, &b);
        assert!((score - (TITLE_WEIGHT + AUTHOR_WEIGHT)).abs() < 1e-9);
    }
}
