//! The robot-automation percolator.
//!
//! Automation queries are stored in a small JSON query syntax and
//! evaluated against the *changeset* part of each incoming
//! [`ReferenceWithChangeset`]: the identifiers and enhancements whose
//! arrival triggered the evaluation. Supported operators:
//!
//! - `{"match": {"<field>": <value>}}` — case-insensitive containment
//! - `{"term": {"<field>": <value>}}` — exact value
//! - `{"exists": {"field": "<field>"}}`
//! - `{"bool": {"must": [...], "should": [...], "must_not": [...]}}`
//!
//! Anything else is rejected at index time as a malformed document.

use std::fmt;

use refrepo_core::enhancements::EnhancementContent;
use refrepo_core::reference::ReferenceWithChangeset;

/// Fields a percolator query may address on the changeset.
const QUERYABLE_FIELDS: &[&str] = &[
    "enhancement_type",
    "source",
    "robot_version",
    "annotation_scheme",
    "annotations",
    "identifier_type",
    "title",
    "abstract",
];

/// A parse failure for an automation query.
#[derive(Debug)]
pub(crate) struct PercolatorParseError(String);

impl fmt::Display for PercolatorParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated automation query.
#[derive(Debug, Clone)]
pub(crate) enum PercolatorQuery {
    Match { field: String, value: String },
    Term { field: String, value: String },
    Exists { field: String },
    Bool {
        must: Vec<PercolatorQuery>,
        should: Vec<PercolatorQuery>,
        must_not: Vec<PercolatorQuery>,
    },
}

impl PercolatorQuery {
    pub fn parse(raw: &serde_json::Value) -> Result<Self, PercolatorParseError> {
        let object = raw
            .as_object()
            .ok_or_else(|| PercolatorParseError("query must be a JSON object".to_string()))?;
        if object.len() != 1 {
            return Err(PercolatorParseError(
                "query must have exactly one operator".to_string(),
            ));
        }
        let (operator, body) = object.iter().next().expect("checked length");
        match operator.as_str() {
            "match" | "term" => {
                let body = body.as_object().ok_or_else(|| {
                    PercolatorParseError(format!("{operator} body must be an object"))
                })?;
                if body.len() != 1 {
                    return Err(PercolatorParseError(format!(
                        "{operator} must name exactly one field"
                    )));
                }
                let (field, value) = body.iter().next().expect("checked length");
                Self::check_field(field)?;
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => {
                        return Err(PercolatorParseError(format!(
                            "{operator} value for {field} must be a scalar"
                        )));
                    }
                };
                if operator == "match" {
                    Ok(PercolatorQuery::Match {
                        field: field.clone(),
                        value: value.to_lowercase(),
                    })
                } else {
                    Ok(PercolatorQuery::Term {
                        field: field.clone(),
                        value,
                    })
                }
            }
            "exists" => {
                let field = body
                    .as_object()
                    .and_then(|b| b.get("field"))
                    .and_then(|f| f.as_str())
                    .ok_or_else(|| {
                        PercolatorParseError("exists requires a field name".to_string())
                    })?;
                Self::check_field(field)?;
                Ok(PercolatorQuery::Exists {
                    field: field.to_string(),
                })
            }
            "bool" => {
                let body = body.as_object().ok_or_else(|| {
                    PercolatorParseError("bool body must be an object".to_string())
                })?;
                let mut parsed = Self::Bool {
                    must: Vec::new(),
                    should: Vec::new(),
                    must_not: Vec::new(),
                };
                let Self::Bool {
                    must,
                    should,
                    must_not,
                } = &mut parsed
                else {
                    unreachable!()
                };
                for (key, clauses) in body {
                    let target: &mut Vec<PercolatorQuery> = match key.as_str() {
                        "must" => must,
                        "should" => should,
                        "must_not" => must_not,
                        other => {
                            return Err(PercolatorParseError(format!(
                                "unknown bool clause: {other}"
                            )));
                        }
                    };
                    let clauses = clauses.as_array().ok_or_else(|| {
                        PercolatorParseError(format!("bool.{key} must be an array"))
                    })?;
                    for clause in clauses {
                        target.push(Self::parse(clause)?);
                    }
                }
                Ok(parsed)
            }
            other => Err(PercolatorParseError(format!("unknown operator: {other}"))),
        }
    }

    fn check_field(field: &str) -> Result<(), PercolatorParseError> {
        if QUERYABLE_FIELDS.contains(&field) {
            Ok(())
        } else {
            Err(PercolatorParseError(format!(
                "unknown percolation field: {field}"
            )))
        }
    }

    /// Evaluate the query against a changeset.
    pub fn matches(&self, changeset: &ReferenceWithChangeset) -> bool {
        let document = ChangesetDocument::from_changeset(changeset);
        self.eval(&document)
    }

    fn eval(&self, document: &ChangesetDocument) -> bool {
        match self {
            PercolatorQuery::Match { field, value } => document
                .values(field)
                .iter()
                .any(|v| v.to_lowercase().contains(value)),
            PercolatorQuery::Term { field, value } => {
                document.values(field).iter().any(|v| v == value)
            }
            PercolatorQuery::Exists { field } => !document.values(field).is_empty(),
            PercolatorQuery::Bool {
                must,
                should,
                must_not,
            } => {
                must.iter().all(|q| q.eval(document))
                    && (should.is_empty() || should.iter().any(|q| q.eval(document)))
                    && !must_not.iter().any(|q| q.eval(document))
            }
        }
    }
}

/// Flattened field view of a changeset.
struct ChangesetDocument {
    enhancement_types: Vec<String>,
    sources: Vec<String>,
    robot_versions: Vec<String>,
    annotation_schemes: Vec<String>,
    annotations: Vec<String>,
    identifier_types: Vec<String>,
    titles: Vec<String>,
    abstracts: Vec<String>,
}

impl ChangesetDocument {
    fn from_changeset(changeset: &ReferenceWithChangeset) -> Self {
        let mut document = Self {
            enhancement_types: Vec::new(),
            sources: Vec::new(),
            robot_versions: Vec::new(),
            annotation_schemes: Vec::new(),
            annotations: Vec::new(),
            identifier_types: Vec::new(),
            titles: Vec::new(),
            abstracts: Vec::new(),
        };
        for identifier in changeset.changeset.identifiers.iter().flatten() {
            document
                .identifier_types
                .push(identifier.identifier.identifier_type().to_string());
        }
        for enhancement in changeset.changeset.enhancements.iter().flatten() {
            document.sources.push(enhancement.source.clone());
            if let Some(version) = &enhancement.robot_version {
                document.robot_versions.push(version.clone());
            }
            match &enhancement.content {
                EnhancementContent::Bibliographic { title, .. } => {
                    document.enhancement_types.push("bibliographic".to_string());
                    if let Some(title) = title {
                        document.titles.push(title.clone());
                    }
                }
                EnhancementContent::Abstract { r#abstract } => {
                    document.enhancement_types.push("abstract".to_string());
                    document.abstracts.push(r#abstract.clone());
                }
                EnhancementContent::Annotation { annotations } => {
                    document.enhancement_types.push("annotation".to_string());
                    for annotation in annotations {
                        document.annotation_schemes.push(annotation.scheme.clone());
                        document.annotations.push(annotation.qualified_label());
                    }
                }
                EnhancementContent::Location { .. } => {
                    document.enhancement_types.push("location".to_string());
                }
            }
        }
        document
    }

    fn values(&self, field: &str) -> &[String] {
        match field {
            "enhancement_type" => &self.enhancement_types,
            "source" => &self.sources,
            "robot_version" => &self.robot_versions,
            "annotation_scheme" => &self.annotation_schemes,
            "annotations" => &self.annotations,
            "identifier_type" => &self.identifier_types,
            "title" => &self.titles,
            "abstract" => &self.abstracts,
            _ => &[],
        }
    }
}
