//! External identifiers for scholarly references.
//!
//! An identifier is one of a small set of well-known schemes (DOI, PubMed,
//! OpenAlex) or an `other` escape hatch carrying its own scheme name.
//! Validation happens at construction so that a stored identifier is always
//! well-formed.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

static DOI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^10\.\d{4,9}/[-._;()/:a-zA-Z0-9%<>\[\]+&]+$").expect("static pattern")
});

static OPENALEX_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^W\d+$").expect("static pattern"));

/// The type of identifier used to identify a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalIdentifierType {
    /// A DOI (Digital Object Identifier).
    Doi,
    /// A PubMed ID.
    PmId,
    /// An OpenAlex work ID.
    OpenAlex,
    /// Any other identifier, disambiguated by a scheme name.
    Other,
}

impl fmt::Display for ExternalIdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExternalIdentifierType::Doi => "doi",
            ExternalIdentifierType::PmId => "pm_id",
            ExternalIdentifierType::OpenAlex => "open_alex",
            ExternalIdentifierType::Other => "other",
        };
        f.write_str(s)
    }
}

/// An external identifier for a reference.
///
/// Serialized with an `identifier_type` discriminator so JSONL inputs read
/// naturally, e.g. `{"identifier_type": "doi", "identifier": "10.1234/abc"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "identifier_type", rename_all = "snake_case")]
pub enum ExternalIdentifier {
    Doi { identifier: String },
    PmId { identifier: u64 },
    OpenAlex { identifier: String },
    Other {
        identifier: String,
        other_identifier_name: String,
    },
}

/// Strip the URL part of a DOI if it exists.
pub fn remove_doi_url(value: &str) -> &str {
    value
        .trim()
        .trim_start_matches("https://doi.org/")
        .trim_start_matches("http://doi.org/")
}

impl ExternalIdentifier {
    /// Build a DOI identifier, stripping any `doi.org` URL prefix.
    pub fn doi(value: &str) -> Result<Self> {
        let stripped = remove_doi_url(value);
        if !DOI_PATTERN.is_match(stripped) {
            return Err(Error::InvalidInput(format!("invalid DOI: {value}")));
        }
        Ok(ExternalIdentifier::Doi {
            identifier: stripped.to_string(),
        })
    }

    pub fn pm_id(value: u64) -> Self {
        ExternalIdentifier::PmId { identifier: value }
    }

    pub fn open_alex(value: &str) -> Result<Self> {
        if !OPENALEX_PATTERN.is_match(value) {
            return Err(Error::InvalidInput(format!("invalid OpenAlex ID: {value}")));
        }
        Ok(ExternalIdentifier::OpenAlex {
            identifier: value.to_string(),
        })
    }

    pub fn other(scheme: &str, value: &str) -> Result<Self> {
        if scheme.trim().is_empty() {
            return Err(Error::InvalidInput(
                "other identifiers require a non-empty scheme name".to_string(),
            ));
        }
        Ok(ExternalIdentifier::Other {
            identifier: value.to_string(),
            other_identifier_name: scheme.to_string(),
        })
    }

    pub fn identifier_type(&self) -> ExternalIdentifierType {
        match self {
            ExternalIdentifier::Doi { .. } => ExternalIdentifierType::Doi,
            ExternalIdentifier::PmId { .. } => ExternalIdentifierType::PmId,
            ExternalIdentifier::OpenAlex { .. } => ExternalIdentifierType::OpenAlex,
            ExternalIdentifier::Other { .. } => ExternalIdentifierType::Other,
        }
    }

    /// The identifier value, rendered to a string.
    pub fn value(&self) -> String {
        match self {
            ExternalIdentifier::Doi { identifier }
            | ExternalIdentifier::OpenAlex { identifier }
            | ExternalIdentifier::Other { identifier, .. } => identifier.clone(),
            ExternalIdentifier::PmId { identifier } => identifier.to_string(),
        }
    }

    /// The scheme name for `other` identifiers.
    pub fn other_scheme(&self) -> Option<&str> {
        match self {
            ExternalIdentifier::Other {
                other_identifier_name,
                ..
            } => Some(other_identifier_name),
            _ => None,
        }
    }

    /// Re-check pattern constraints on a deserialized identifier.
    ///
    /// Serde gives us shape validation for free; this adds the per-scheme
    /// format rules.
    pub fn validate(&self) -> Result<()> {
        match self {
            ExternalIdentifier::Doi { identifier } => {
                if !DOI_PATTERN.is_match(remove_doi_url(identifier)) {
                    return Err(Error::InvalidInput(format!("invalid DOI: {identifier}")));
                }
            }
            ExternalIdentifier::OpenAlex { identifier } => {
                if !OPENALEX_PATTERN.is_match(identifier) {
                    return Err(Error::InvalidInput(format!(
                        "invalid OpenAlex ID: {identifier}"
                    )));
                }
            }
            ExternalIdentifier::Other {
                other_identifier_name,
                ..
            } => {
                if other_identifier_name.trim().is_empty() {
                    return Err(Error::InvalidInput(
                        "other identifiers require a non-empty scheme name".to_string(),
                    ));
                }
            }
            ExternalIdentifier::PmId { .. } => {}
        }
        Ok(())
    }

    /// The lookup key for this identifier: (type, value, other-scheme).
    pub fn key(&self) -> IdentifierKey {
        IdentifierKey {
            identifier_type: self.identifier_type(),
            value: self.value(),
            other_identifier_name: self.other_scheme().map(str::to_string),
        }
    }
}

/// A scheme-qualified identifier value used for lookups and uniqueness.
///
/// Uniqueness is per (type, value), and per (type, scheme, value) for
/// `other` identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentifierKey {
    pub identifier_type: ExternalIdentifierType,
    pub value: String,
    pub other_identifier_name: Option<String>,
}

impl IdentifierKey {
    /// Parse a lookup of the form `doi:10.1234/abc`, `pmid:123456`,
    /// `openalex:W42` or `other:<scheme>:<value>`.
    pub fn parse_lookup(raw: &str) -> Result<Self> {
        let (scheme, rest) = raw
            .split_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("invalid identifier lookup: {raw}")))?;
        let identifier = match scheme {
            "doi" => ExternalIdentifier::doi(rest)?,
            "pmid" => ExternalIdentifier::pm_id(
                rest.parse()
                    .map_err(|_| Error::InvalidInput(format!("invalid PubMed ID: {rest}")))?,
            ),
            "openalex" => ExternalIdentifier::open_alex(rest)?,
            "other" => {
                let (name, value) = rest.split_once(':').ok_or_else(|| {
                    Error::InvalidInput(format!("invalid other-identifier lookup: {raw}"))
                })?;
                ExternalIdentifier::other(name, value)?
            }
            _ => {
                return Err(Error::InvalidInput(format!(
                    "unknown identifier scheme: {scheme}"
                )));
            }
        };
        Ok(identifier.key())
    }
}

/// An external identifier which identifies a reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedExternalIdentifier {
    pub id: Uuid,
    pub reference_id: Uuid,
    pub identifier: ExternalIdentifier,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl LinkedExternalIdentifier {
    pub fn new(reference_id: Uuid, identifier: ExternalIdentifier) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            reference_id,
            identifier,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doi_url_prefix_is_stripped() {
        let id = ExternalIdentifier::doi("https://doi.org/10.1234/abc-def").unwrap();
        assert_eq!(id.value(), "10.1234/abc-def");
        assert_eq!(id.identifier_type(), ExternalIdentifierType::Doi);
    }

    #[test]
    fn invalid_doi_is_rejected() {
        assert!(ExternalIdentifier::doi("not-a-doi").is_err());
        assert!(ExternalIdentifier::doi("11.1234/abc").is_err());
    }

    #[test]
    fn openalex_pattern() {
        assert!(ExternalIdentifier::open_alex("W12345").is_ok());
        assert!(ExternalIdentifier::open_alex("12345").is_err());
        assert!(ExternalIdentifier::open_alex("w12345").is_err());
    }

    #[test]
    fn other_requires_scheme() {
        assert!(ExternalIdentifier::other("", "x").is_err());
        let id = ExternalIdentifier::other("eppi", "12").unwrap();
        assert_eq!(id.other_scheme(), Some("eppi"));
    }

    #[test]
    fn lookup_parsing_round_trips_each_scheme() {
        let key = IdentifierKey::parse_lookup("doi:10.1234/abc").unwrap();
        assert_eq!(key.identifier_type, ExternalIdentifierType::Doi);
        let key = IdentifierKey::parse_lookup("pmid:42").unwrap();
        assert_eq!(key.value, "42");
        let key = IdentifierKey::parse_lookup("other:eppi:99").unwrap();
        assert_eq!(key.other_identifier_name.as_deref(), Some("eppi"));
        assert!(IdentifierKey::parse_lookup("isbn:123").is_err());
    }

    #[test]
    fn serde_uses_identifier_type_tag() {
        let id = ExternalIdentifier::doi("10.1234/abc").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.contains(r#""identifier_type":"doi""#));
        let back: ExternalIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
