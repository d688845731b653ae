//! Query-string search over the reference index.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::Result;
use crate::search::{
    AnnotationFilter, PublicationYearRange, SearchPage, SearchRequest, SearchStore,
};

/// A field-qualified term like `title:heat`.
static FIELD_QUALIFIER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+:").expect("static pattern"));

/// Fields searched when the query string does not qualify any itself.
const DEFAULT_SEARCH_FIELDS: &[&str] = &["title", "abstract"];

/// Service for searching references.
pub struct SearchService {
    search_store: Arc<dyn SearchStore>,
}

impl SearchService {
    pub fn new(search_store: Arc<dyn SearchStore>) -> Self {
        Self { search_store }
    }

    /// Whether the query string specifies fields to search.
    ///
    /// Passive on purpose: a value that merely looks like `word:term`
    /// widens the search to all fields, which returns a superset at worst.
    fn query_string_specifies_fields(query_string: &str) -> bool {
        FIELD_QUALIFIER_PATTERN.is_match(query_string)
    }

    /// Search for references matching the query string.
    pub async fn search_with_query_string(
        &self,
        query: &str,
        page: usize,
        annotations: Vec<AnnotationFilter>,
        publication_year_range: Option<PublicationYearRange>,
        sort: Vec<String>,
    ) -> Result<SearchPage> {
        let mut request = SearchRequest::new(query);
        request.page = page.max(1);
        request.annotations = annotations;
        request.publication_year_range = publication_year_range;
        request.sort = sort;
        if !Self::query_string_specifies_fields(query) {
            request.fields = DEFAULT_SEARCH_FIELDS
                .iter()
                .map(|f| (*f).to_string())
                .collect();
        }
        self.search_store.search(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_terms_do_not_qualify_fields() {
        assert!(!SearchService::query_string_specifies_fields("heat health"));
        assert!(SearchService::query_string_specifies_fields("title:heat"));
        assert!(SearchService::query_string_specifies_fields(
            "heat AND annotations:topics/heat"
        ));
    }
}
