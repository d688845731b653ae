//! Enhancements: content attached to a reference by importers and robots.
//!
//! Content is a tagged sum type. An enhancement is immutable after creation;
//! supersession happens by adding another enhancement with higher priority
//! in the search-fields projection.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Visibility of a reference or enhancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Restricted,
    Hidden,
}

/// Position of an author in the author list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorPosition {
    First,
    Middle,
    Last,
}

/// One author of a work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authorship {
    pub display_name: String,
    pub position: AuthorPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orcid: Option<String>,
}

/// Type discriminator of an annotation value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationType {
    Boolean,
    Score,
}

/// A single labelled judgement within an annotation scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub annotation_type: AnnotationType,
    /// Scheme the annotation belongs to, e.g. `inclusion:destiny`.
    pub scheme: String,
    pub label: String,
    /// Boolean verdict; meaningful for `boolean` annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<bool>,
    /// Confidence or score in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Free-form extra data, e.g. `{"inclusion_score": 0.93}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl Annotation {
    /// `scheme/label`, the form indexed for search.
    pub fn qualified_label(&self) -> String {
        format!("{}/{}", self.scheme, self.label)
    }
}

/// A location where a work can be accessed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landing_page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,
    #[serde(default)]
    pub is_oa: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
}

/// The payload of an enhancement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "enhancement_type", rename_all = "snake_case")]
pub enum EnhancementContent {
    Bibliographic {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        authorship: Vec<Authorship>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        publication_year: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        publication_date: Option<chrono::NaiveDate>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        publisher: Option<String>,
    },
    Abstract {
        r#abstract: String,
    },
    Annotation {
        annotations: Vec<Annotation>,
    },
    Location {
        locations: Vec<Location>,
    },
}

impl EnhancementContent {
    pub fn kind(&self) -> EnhancementType {
        match self {
            EnhancementContent::Bibliographic { .. } => EnhancementType::Bibliographic,
            EnhancementContent::Abstract { .. } => EnhancementType::Abstract,
            EnhancementContent::Annotation { .. } => EnhancementType::Annotation,
            EnhancementContent::Location { .. } => EnhancementType::Location,
        }
    }
}

/// Discriminator for [`EnhancementContent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementType {
    Bibliographic,
    Abstract,
    Annotation,
    Location,
}

/// A piece of content attached to a reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enhancement {
    pub id: Uuid,
    pub reference_id: Uuid,
    /// Who produced this enhancement (importer name, robot name).
    pub source: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_version: Option<String>,
    /// Enhancements this one was derived from. Parents must belong to the
    /// same duplicate tree as the reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<Vec<Uuid>>,
    pub content: EnhancementContent,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Enhancement {
    pub fn new(reference_id: Uuid, source: impl Into<String>, content: EnhancementContent) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            reference_id,
            source: source.into(),
            visibility: Visibility::Public,
            robot_version: None,
            derived_from: None,
            content,
            created_at: now,
            updated_at: now,
        }
    }

    /// Hash of the enhancement's content identity.
    ///
    /// Two enhancements with the same source, visibility and content hash
    /// equal regardless of id, reference or timestamps. The hash is computed
    /// over the canonical JSON encoding so it is stable across
    /// serializations of the same value.
    pub fn content_hash(&self) -> u64 {
        #[derive(Serialize)]
        struct HashView<'a> {
            source: &'a str,
            visibility: Visibility,
            content: &'a EnhancementContent,
        }
        let canonical = serde_json::to_string(&HashView {
            source: &self.source,
            visibility: self.visibility,
            content: &self.content,
        })
        .unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn biblio(title: &str) -> EnhancementContent {
        EnhancementContent::Bibliographic {
            title: Some(title.to_string()),
            authorship: vec![],
            publication_year: Some(2020),
            publication_date: None,
            publisher: None,
        }
    }

    #[test]
    fn content_hash_ignores_identity_fields() {
        let a = Enhancement::new(Uuid::new_v4(), "importer", biblio("Heat and Health"));
        let mut b = Enhancement::new(Uuid::new_v4(), "importer", biblio("Heat and Health"));
        b.created_at = a.created_at + chrono::Duration::hours(1);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_distinguishes_content_and_source() {
        let a = Enhancement::new(Uuid::new_v4(), "importer", biblio("Heat and Health"));
        let b = Enhancement::new(Uuid::new_v4(), "importer", biblio("Cold and Health"));
        let c = Enhancement::new(Uuid::new_v4(), "robot", biblio("Heat and Health"));
        assert_ne!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn content_round_trips_through_jsonl() {
        let content = EnhancementContent::Annotation {
            annotations: vec![Annotation {
                annotation_type: AnnotationType::Boolean,
                scheme: "inclusion:destiny".to_string(),
                label: "include".to_string(),
                value: Some(true),
                score: Some(0.93),
                data: BTreeMap::new(),
            }],
        };
        let enhancement = Enhancement::new(Uuid::new_v4(), "robot", content);
        let line = serde_json::to_string(&enhancement).unwrap();
        assert!(line.contains(r#""enhancement_type":"annotation""#));
        let back: Enhancement = serde_json::from_str(&line).unwrap();
        assert_eq!(back.content_hash(), enhancement.content_hash());
    }
}
