//! Search service and identifier lookup over the deduplicated index.

use refrepo_core::decisions::{MakeDuplicateDecision, ManualDuplicateDetermination};
use refrepo_core::search::{AnnotationFilter, PublicationYearRange};
use refrepo_test_utils::{annotation_enhancement, make_reference, TestHarness};

#[tokio::test]
async fn bare_query_searches_title_and_abstract_only() {
    let harness = TestHarness::new().await;
    let by_title = make_reference("10.6/a", "Heat and Health", &["Doe"], 2020);
    // "heat" appears only in this one's author name, not title/abstract.
    let by_author = make_reference("10.6/b", "Unrelated subject", &["Heater"], 2020);
    for reference in [&by_title, &by_author] {
        harness
            .repository
            .references
            .merge_reference(reference)
            .await
            .unwrap();
    }

    let page = harness
        .repository
        .references
        .search_references("heat", 1, vec![], None, vec![])
        .await
        .unwrap();
    assert_eq!(page.total.value, 1);
    assert_eq!(page.hits[0].id, by_title.id);

    // Qualified terms pass through to the named field.
    let page = harness
        .repository
        .references
        .search_references("authors:heater", 1, vec![], None, vec![])
        .await
        .unwrap();
    assert_eq!(page.total.value, 1);
    assert_eq!(page.hits[0].id, by_author.id);
}

#[tokio::test]
async fn filters_and_sort_compose() {
    let harness = TestHarness::new().await;
    let old = make_reference("10.6/old", "Heat waves", &["Doe"], 2005);
    let recent = make_reference("10.6/new", "Heat domes", &["Doe"], 2022);
    for reference in [&old, &recent] {
        harness
            .repository
            .references
            .merge_reference(reference)
            .await
            .unwrap();
    }
    harness
        .repository
        .references
        .add_enhancement(annotation_enhancement(recent.id, "topics", "heat", true))
        .await
        .unwrap();

    let page = harness
        .repository
        .references
        .search_references(
            "title:heat",
            1,
            vec![],
            Some(PublicationYearRange {
                start: Some(2010),
                end: None,
            }),
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(page.total.value, 1);
    assert_eq!(page.hits[0].id, recent.id);

    let page = harness
        .repository
        .references
        .search_references(
            "title:heat",
            1,
            vec![AnnotationFilter {
                scheme: "topics".to_string(),
                label: Some("heat".to_string()),
                min_score: None,
            }],
            None,
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(page.total.value, 1);

    let page = harness
        .repository
        .references
        .search_references(
            "title:heat",
            1,
            vec![],
            None,
            vec!["-publication_year".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(page.hits[0].id, recent.id);
    assert_eq!(page.hits[1].id, old.id);
}

#[tokio::test]
async fn invalid_query_surfaces_as_a_query_error() {
    let harness = TestHarness::new().await;
    let error = harness
        .repository
        .references
        .search_references("   ", 1, vec![], None, vec![])
        .await
        .unwrap_err();
    assert!(matches!(error, refrepo_core::error::Error::StoreQuery(_)));
}

#[tokio::test]
async fn identifier_lookup_resolves_duplicates_to_their_canonical() {
    let harness = TestHarness::new().await;
    let canonical = make_reference("10.7/a", "Heat", &["Doe"], 2020);
    let duplicate = make_reference("10.7/b", "Heat again", &["Doe"], 2020);
    for reference in [&canonical, &duplicate] {
        harness
            .repository
            .references
            .merge_reference(reference)
            .await
            .unwrap();
    }
    harness
        .repository
        .references
        .make_manual_duplicate_decision(&MakeDuplicateDecision {
            reference_id: duplicate.id,
            duplicate_determination: ManualDuplicateDetermination::Duplicate,
            canonical_reference_id: Some(canonical.id),
            detail: None,
        })
        .await
        .unwrap();

    // Looking up the duplicate's DOI lands on the deduplicated canonical.
    let found = harness
        .repository
        .references
        .lookup_references(&["doi:10.7/b".to_string()])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, canonical.id);
    let values: Vec<String> = found[0]
        .identifiers
        .as_ref()
        .unwrap()
        .iter()
        .map(|i| i.identifier.value())
        .collect();
    assert!(values.contains(&"10.7/a".to_string()));
    assert!(values.contains(&"10.7/b".to_string()));

    // Both identifiers resolving to the same canonical dedupe to one hit.
    let found = harness
        .repository
        .references
        .lookup_references(&["doi:10.7/a".to_string(), "doi:10.7/b".to_string()])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);

    // Raw reference ids are accepted alongside typed identifiers.
    let found = harness
        .repository
        .references
        .lookup_references(&[duplicate.id.to_string()])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, canonical.id);
}
