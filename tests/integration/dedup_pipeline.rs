//! Deduplication pipeline against real backends: blurred fingerprints,
//! chain depth, manual overrides, trusted identifier shortcuts.

use refrepo_core::config::RepositoryConfig;
use refrepo_core::decisions::{
    DuplicateDetermination, MakeDuplicateDecision, ManualDuplicateDetermination,
};
use refrepo_core::identifiers::ExternalIdentifierType;
use refrepo_core::imports::{ImportBatch, ImportRecord};
use refrepo_core::store::{ReferenceScope, ReferenceStore};
use refrepo_test_utils::{make_reference, reference_file_line, TestHarness};

async fn import_lines(harness: &TestHarness, name: &str, lines: &[String]) {
    let record = ImportRecord::new("test-processor", "1.0.0", "test", -1);
    harness
        .repository
        .imports
        .register_import(&record)
        .await
        .unwrap();
    let url = harness.write_batch_file(name, lines).await;
    harness
        .repository
        .imports
        .register_batch(&ImportBatch::new(record.id, url))
        .await
        .unwrap();
    harness.settle().await;
    harness.settle().await;
}

#[tokio::test]
async fn sparse_fingerprint_is_blurred_and_canonical() {
    let harness = TestHarness::new().await;
    // No authors and no year: the fingerprint cannot drive a search.
    let line = serde_json::json!({
        "identifiers": [{"identifier_type": "doi", "identifier": "10.2/sparse"}],
        "enhancements": [{
            "source": "test-importer",
            "enhancement_type": "bibliographic",
            "title": "An untitledish thing",
        }],
    })
    .to_string();
    import_lines(&harness, "sparse.jsonl", &[line]).await;

    let mut scope = harness.store.begin().await.unwrap();
    let ids = scope.all_reference_ids().await.unwrap();
    assert_eq!(ids.len(), 1);
    let decision = scope.active_decision_for(ids[0]).await.unwrap().unwrap();
    assert_eq!(
        decision.duplicate_determination,
        DuplicateDetermination::BlurredFingerprint
    );
    drop(scope);

    // Blurred references are their own canonicals and are indexed.
    assert_eq!(harness.search_index.reference_count(), 1);
}

#[tokio::test]
async fn only_other_identifiers_never_exact_match() {
    let harness = TestHarness::new().await;
    let line = serde_json::json!({
        "identifiers": [{
            "identifier_type": "other",
            "identifier": "id-1",
            "other_identifier_name": "eppi",
        }],
        "enhancements": [{
            "source": "test-importer",
            "enhancement_type": "bibliographic",
            "title": "Only other ids",
        }],
    })
    .to_string();
    import_lines(&harness, "other1.jsonl", &[line.clone()]).await;
    import_lines(&harness, "other2.jsonl", &[line]).await;

    // The identical reimport was not short-circuited: "other" identifiers
    // carry no cardinality guarantee, so both copies persist.
    let mut scope = harness.store.begin().await.unwrap();
    let ids = scope.all_reference_ids().await.unwrap();
    assert_eq!(ids.len(), 2);
    for id in ids {
        let decision = scope.active_decision_for(id).await.unwrap().unwrap();
        assert_ne!(
            decision.duplicate_determination,
            DuplicateDetermination::ExactDuplicate
        );
    }
}

#[tokio::test]
async fn duplicate_of_a_duplicate_is_decoupled() {
    let harness = TestHarness::new().await;
    let canonical = make_reference("10.3/a", "Chains", &["Doe"], 2020);
    let middle = make_reference("10.3/b", "Chains again", &["Doe"], 2020);
    let tail = make_reference("10.3/c", "Chains thrice", &["Doe"], 2020);
    for reference in [&canonical, &middle, &tail] {
        harness
            .repository
            .references
            .merge_reference(reference)
            .await
            .unwrap();
    }

    // middle duplicates canonical by hand.
    harness
        .repository
        .references
        .make_manual_duplicate_decision(&MakeDuplicateDecision {
            reference_id: middle.id,
            duplicate_determination: ManualDuplicateDetermination::Duplicate,
            canonical_reference_id: Some(canonical.id),
            detail: None,
        })
        .await
        .unwrap();

    // tail -> middle would make a chain of depth three: refused, decoupled.
    let decision = harness
        .repository
        .references
        .make_manual_duplicate_decision(&MakeDuplicateDecision {
            reference_id: tail.id,
            duplicate_determination: ManualDuplicateDetermination::Duplicate,
            canonical_reference_id: Some(middle.id),
            detail: None,
        })
        .await
        .unwrap();
    assert_eq!(
        decision.duplicate_determination,
        DuplicateDetermination::Decoupled
    );
    assert!(decision.canonical_reference_id.is_none());
}

#[tokio::test]
async fn demoting_a_canonical_decouples_its_dependents() {
    let harness = TestHarness::new().await;
    let a = make_reference("10.4/a", "Root", &["Doe"], 2020);
    let b = make_reference("10.4/b", "Dependent", &["Doe"], 2020);
    let c = make_reference("10.4/c", "New root", &["Doe"], 2020);
    for reference in [&a, &b, &c] {
        harness
            .repository
            .references
            .merge_reference(reference)
            .await
            .unwrap();
    }

    // b duplicates a; then a itself is declared a duplicate of c.
    harness
        .repository
        .references
        .make_manual_duplicate_decision(&MakeDuplicateDecision {
            reference_id: b.id,
            duplicate_determination: ManualDuplicateDetermination::Duplicate,
            canonical_reference_id: Some(a.id),
            detail: None,
        })
        .await
        .unwrap();
    harness
        .repository
        .references
        .make_manual_duplicate_decision(&MakeDuplicateDecision {
            reference_id: a.id,
            duplicate_determination: ManualDuplicateDetermination::Duplicate,
            canonical_reference_id: Some(c.id),
            detail: None,
        })
        .await
        .unwrap();

    // b's link would now be a chain through a: it is decoupled for review.
    let mut scope = harness.store.begin().await.unwrap();
    let b_decision = scope.active_decision_for(b.id).await.unwrap().unwrap();
    assert_eq!(
        b_decision.duplicate_determination,
        DuplicateDetermination::Decoupled
    );
    let a_decision = scope.active_decision_for(a.id).await.unwrap().unwrap();
    assert_eq!(a_decision.canonical_reference_id, Some(c.id));
}

#[tokio::test]
async fn trusted_identifier_shortcut_pairs_references_directly() {
    let config = RepositoryConfig {
        trusted_unique_identifier_types: vec![ExternalIdentifierType::Doi],
        // Kill the fingerprint path so only the shortcut can pair them.
        candidate_duplicate_score_threshold: 2.0,
        ..RepositoryConfig::default()
    };
    let harness = TestHarness::with_config(config).await;

    // The same DOI on two otherwise different works. The superset check
    // cannot exact-match them (content differs), so without the shortcut
    // they would both stay canonical.
    import_lines(
        &harness,
        "first.jsonl",
        &[reference_file_line("10.5/shared", "Original title", &["Doe"], 2020)],
    )
    .await;
    import_lines(
        &harness,
        "second.jsonl",
        &[reference_file_line("10.5/shared", "A different title", &["Poe"], 1999)],
    )
    .await;

    let mut scope = harness.store.begin().await.unwrap();
    let ids = scope.all_reference_ids().await.unwrap();
    assert_eq!(ids.len(), 2);
    let first_decision = scope.active_decision_for(ids[0]).await.unwrap().unwrap();
    let second_decision = scope.active_decision_for(ids[1]).await.unwrap().unwrap();
    assert_eq!(
        first_decision.duplicate_determination,
        DuplicateDetermination::Canonical
    );
    assert_eq!(
        second_decision.duplicate_determination,
        DuplicateDetermination::Duplicate
    );
    assert_eq!(second_decision.canonical_reference_id, Some(ids[0]));
    assert_eq!(
        second_decision.detail.as_deref(),
        Some("trusted unique identifier match")
    );
    drop(scope);

    // The pair collapsed to one indexed canonical.
    assert_eq!(harness.search_index.reference_count(), 1);
}
