//! Query-string parsing, matching, filtering and sorting.

use refrepo_core::error::{Error, Result};
use refrepo_core::search::SearchRequest;

use crate::IndexedReference;

/// One parsed clause: an optional field qualifier and a lowercased term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Clause {
    pub field: Option<String>,
    pub term: String,
}

/// Split a query string into clauses. `AND`/`OR` connectives are accepted
/// and ignored; clause semantics are conjunctive.
pub(crate) fn parse_query_string(query: &str) -> Result<Vec<Clause>> {
    let mut clauses = Vec::new();
    for raw in query.split_whitespace() {
        if raw.eq_ignore_ascii_case("and") || raw.eq_ignore_ascii_case("or") {
            continue;
        }
        let raw = raw.trim_matches('"');
        if raw.is_empty() {
            continue;
        }
        match raw.split_once(':') {
            // An annotation label like `topics/heat` may itself contain the
            // scheme separator; only a word-shaped prefix is a qualifier.
            Some((field, term))
                if !field.is_empty()
                    && field.chars().all(|c| c.is_alphanumeric() || c == '_')
                    && !term.is_empty() =>
            {
                clauses.push(Clause {
                    field: Some(field.to_lowercase()),
                    term: term.to_lowercase(),
                });
            }
            _ => clauses.push(Clause {
                field: None,
                term: raw.to_lowercase(),
            }),
        }
    }
    if clauses.is_empty() {
        return Err(Error::StoreQuery("empty query string".to_string()));
    }
    Ok(clauses)
}

/// Known document fields. A clause naming anything else simply never
/// matches, which is how an unmapped field behaves in the index.
const KNOWN_FIELDS: &[&str] = &[
    "title",
    "abstract",
    "authors",
    "annotations",
    "publication_year",
    "id",
];

fn field_values(doc: &IndexedReference, field: &str) -> Vec<String> {
    match field {
        "title" => doc.fields.title.iter().map(|t| t.to_lowercase()).collect(),
        "abstract" => doc
            .fields
            .r#abstract
            .iter()
            .map(|a| a.to_lowercase())
            .collect(),
        "authors" => doc.fields.authors.iter().map(|a| a.to_lowercase()).collect(),
        "annotations" => doc
            .fields
            .annotations
            .iter()
            .map(|a| a.to_lowercase())
            .collect(),
        "publication_year" => doc
            .fields
            .publication_year
            .iter()
            .map(|y| y.to_string())
            .collect(),
        "id" => vec![doc.reference.id.to_string()],
        _ => Vec::new(),
    }
}

/// Match a document against the clauses. Returns a relevance score when
/// every clause matches, `None` otherwise.
pub(crate) fn matches(
    clauses: &[Clause],
    doc: &IndexedReference,
    default_fields: &[String],
) -> Option<f64> {
    let mut score = 0.0;
    for clause in clauses {
        let fields: Vec<String> = match &clause.field {
            Some(field) => vec![field.clone()],
            None if default_fields.is_empty() => {
                KNOWN_FIELDS.iter().map(|f| (*f).to_string()).collect()
            }
            None => default_fields.to_vec(),
        };
        let mut clause_score = 0.0;
        for field in &fields {
            for value in field_values(doc, field) {
                if value.contains(&clause.term) {
                    // Exact value matches outrank substring hits.
                    clause_score += if value == clause.term { 2.0 } else { 1.0 };
                }
            }
        }
        if clause_score == 0.0 {
            return None;
        }
        score += clause_score;
    }
    Some(score / clauses.len() as f64)
}

/// Apply the request's structured filters.
pub(crate) fn passes_filters(doc: &IndexedReference, request: &SearchRequest) -> bool {
    if let Some(range) = &request.publication_year_range {
        match doc.fields.publication_year {
            Some(year) if range.contains(year) => {}
            _ => return false,
        }
    }
    for filter in &request.annotations {
        let matched = if let Some(min_score) = filter.min_score {
            doc.fields
                .inclusion_score
                .is_some_and(|score| score >= min_score)
        } else if let Some(label) = &filter.label {
            doc.fields
                .annotations
                .contains(&format!("{}/{label}", filter.scheme))
        } else {
            doc.fields
                .annotations
                .iter()
                .any(|qualified| qualified.starts_with(&format!("{}/", filter.scheme)))
        };
        if !matched {
            return false;
        }
    }
    true
}

/// Sort scored hits: by the requested fields (`-` prefix descending), then
/// relevance, with the id as the final tie-break for determinism.
pub(crate) fn sort_hits(scored: &mut [(f64, &IndexedReference)], sort: &[String]) {
    scored.sort_by(|(a_score, a_doc), (b_score, b_doc)| {
        for key in sort {
            let (field, descending) = match key.strip_prefix('-') {
                Some(field) => (field, true),
                None => (key.as_str(), false),
            };
            let ordering = match field {
                "publication_year" => a_doc
                    .fields
                    .publication_year
                    .cmp(&b_doc.fields.publication_year),
                "title" => a_doc.fields.title.cmp(&b_doc.fields.title),
                "created_at" => a_doc.reference.created_at.cmp(&b_doc.reference.created_at),
                _ => std::cmp::Ordering::Equal,
            };
            let ordering = if descending { ordering.reverse() } else { ordering };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        b_score
            .partial_cmp(a_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a_doc.reference.id.cmp(&b_doc.reference.id))
    });
}
