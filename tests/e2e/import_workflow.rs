//! End-to-end import workflow: register a record, stream a batch, watch
//! the deduplication pipeline settle.

use refrepo_core::decisions::DuplicateDetermination;
use refrepo_core::imports::{ImportBatch, ImportBatchStatus, ImportRecord, ImportResultStatus};
use refrepo_core::search::SearchStore;
use refrepo_core::store::{ReferenceInclude, ReferenceScope, ReferenceStore};
use refrepo_test_utils::{reference_file_line, TestHarness};

async fn run_batch(harness: &TestHarness, record: &ImportRecord, lines: &[String], name: &str) -> ImportBatch {
    let url = harness.write_batch_file(name, lines).await;
    let batch = ImportBatch::new(record.id, url);
    harness
        .repository
        .imports
        .register_batch(&batch)
        .await
        .unwrap();
    // The batch task and its decision tasks run on the in-process worker.
    harness.settle().await;
    harness.settle().await;
    batch
}

#[tokio::test]
async fn happy_path_ingest_creates_canonical_reference() {
    let harness = TestHarness::new().await;
    let record = ImportRecord::new("pytest-processor", "1.0.0", "openalex", 1);
    harness
        .repository
        .imports
        .register_import(&record)
        .await
        .unwrap();

    let lines = vec![reference_file_line(
        "10.1234/abc",
        "Heat and Health",
        &["Doe", "Smith"],
        2020,
    )];
    let batch = run_batch(&harness, &record, &lines, "batch1.jsonl").await;

    let summary = harness
        .repository
        .imports
        .get_import_batch_summary(batch.id)
        .await
        .unwrap();
    assert_eq!(summary.results[&ImportResultStatus::Completed], 1);
    assert!(summary.failure_details.is_empty());
    assert_eq!(summary.import_batch_status, ImportBatchStatus::Completed);

    // One reference, with an active decision and an index entry.
    let mut scope = harness.store.begin().await.unwrap();
    let ids = scope.all_reference_ids().await.unwrap();
    assert_eq!(ids.len(), 1);
    let decision = scope.active_decision_for(ids[0]).await.unwrap().unwrap();
    assert_eq!(
        decision.duplicate_determination,
        DuplicateDetermination::Canonical
    );
    drop(scope);

    let indexed = harness.search_index.get_reference(ids[0]).await.unwrap();
    assert!(indexed.is_some());
    assert_eq!(harness.search_index.reference_count(), 1);
}

#[tokio::test]
async fn exact_duplicate_reimport_creates_no_new_reference() {
    let harness = TestHarness::new().await;
    let record = ImportRecord::new("pytest-processor", "1.0.0", "openalex", 2);
    harness
        .repository
        .imports
        .register_import(&record)
        .await
        .unwrap();

    let lines = vec![reference_file_line(
        "10.1234/abc",
        "Heat and Health",
        &["Doe", "Smith"],
        2020,
    )];
    run_batch(&harness, &record, &lines, "batch1.jsonl").await;

    let mut scope = harness.store.begin().await.unwrap();
    let canonical_id = scope.all_reference_ids().await.unwrap()[0];
    let canonical_before = scope
        .get_reference(canonical_id, ReferenceInclude::CONTENT)
        .await
        .unwrap();
    drop(scope);

    // Same content again, different file.
    let second = run_batch(&harness, &record, &lines, "batch2.jsonl").await;
    let summary = harness
        .repository
        .imports
        .get_import_batch_summary(second.id)
        .await
        .unwrap();
    assert_eq!(summary.results[&ImportResultStatus::Completed], 1);

    let mut scope = harness.store.begin().await.unwrap();
    // No new reference was persisted.
    assert_eq!(scope.all_reference_ids().await.unwrap().len(), 1);
    let canonical_after = scope
        .get_reference(canonical_id, ReferenceInclude::CONTENT)
        .await
        .unwrap();
    // The canonical's content is untouched.
    assert_eq!(
        canonical_before.identifiers.as_ref().unwrap().len(),
        canonical_after.identifiers.as_ref().unwrap().len()
    );
    assert_eq!(
        canonical_before.enhancements.as_ref().unwrap().len(),
        canonical_after.enhancements.as_ref().unwrap().len()
    );
    drop(scope);

    assert_eq!(harness.search_index.reference_count(), 1);
}

#[tokio::test]
async fn fingerprint_match_makes_second_reference_a_duplicate() {
    let harness = TestHarness::new().await;
    let record = ImportRecord::new("pytest-processor", "1.0.0", "openalex", 2);
    harness
        .repository
        .imports
        .register_import(&record)
        .await
        .unwrap();

    // Same work under two different DOIs.
    let first = vec![reference_file_line(
        "10.1/a",
        "Heat and Health",
        &["Doe", "Smith"],
        2020,
    )];
    run_batch(&harness, &record, &first, "batch1.jsonl").await;

    let second = vec![reference_file_line(
        "10.1/b",
        "Heat and Health",
        &["Doe", "Smith"],
        2020,
    )];
    run_batch(&harness, &record, &second, "batch2.jsonl").await;

    let mut scope = harness.store.begin().await.unwrap();
    let ids = scope.all_reference_ids().await.unwrap();
    assert_eq!(ids.len(), 2);
    let a_id = ids[0];
    let b_id = ids[1];

    let a_decision = scope.active_decision_for(a_id).await.unwrap().unwrap();
    assert_eq!(
        a_decision.duplicate_determination,
        DuplicateDetermination::Canonical
    );
    let b_decision = scope.active_decision_for(b_id).await.unwrap().unwrap();
    assert_eq!(
        b_decision.duplicate_determination,
        DuplicateDetermination::Duplicate
    );
    assert_eq!(b_decision.canonical_reference_id, Some(a_id));
    drop(scope);

    // The canonical's index entry carries the duplicate's identifier.
    let indexed = harness
        .search_index
        .get_reference(a_id)
        .await
        .unwrap()
        .unwrap();
    let values: Vec<String> = indexed
        .identifiers
        .as_ref()
        .unwrap()
        .iter()
        .map(|i| i.identifier.value())
        .collect();
    assert!(values.contains(&"10.1/a".to_string()));
    assert!(values.contains(&"10.1/b".to_string()));
    // The duplicate is not indexed under its own id.
    assert!(harness
        .search_index
        .get_reference(b_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn empty_batch_completes_with_empty_summary() {
    let harness = TestHarness::new().await;
    let record = ImportRecord::new("pytest-processor", "1.0.0", "openalex", 0);
    harness
        .repository
        .imports
        .register_import(&record)
        .await
        .unwrap();

    let batch = run_batch(&harness, &record, &[], "empty.jsonl").await;
    let summary = harness
        .repository
        .imports
        .get_import_batch_summary(batch.id)
        .await
        .unwrap();
    assert!(summary.results.is_empty());
    assert!(summary.failure_details.is_empty());
    assert_eq!(summary.import_batch_status, ImportBatchStatus::Completed);
}

#[tokio::test]
async fn unparseable_line_is_a_per_entry_failure() {
    let harness = TestHarness::new().await;
    let record = ImportRecord::new("pytest-processor", "1.0.0", "openalex", 2);
    harness
        .repository
        .imports
        .register_import(&record)
        .await
        .unwrap();

    let lines = vec![
        "this is not json".to_string(),
        reference_file_line("10.1234/ok", "Good entry", &["Doe"], 2021),
    ];
    let batch = run_batch(&harness, &record, &lines, "mixed.jsonl").await;

    let summary = harness
        .repository
        .imports
        .get_import_batch_summary(batch.id)
        .await
        .unwrap();
    assert_eq!(summary.results[&ImportResultStatus::Failed], 1);
    assert_eq!(summary.results[&ImportResultStatus::Completed], 1);
    assert_eq!(
        summary.import_batch_status,
        ImportBatchStatus::PartiallyFailed
    );
    assert_eq!(summary.failure_details.len(), 1);
    assert!(summary.failure_details[0].starts_with("Entry 1:"));
}

#[tokio::test]
async fn cancelled_batch_is_not_processed() {
    let harness = TestHarness::new().await;
    let record = ImportRecord::new("pytest-processor", "1.0.0", "openalex", 1);
    harness
        .repository
        .imports
        .register_import(&record)
        .await
        .unwrap();

    let url = harness
        .write_batch_file(
            "cancelled.jsonl",
            &[reference_file_line("10.9/z", "Never imported", &["Doe"], 2020)],
        )
        .await;
    let batch = ImportBatch::new(record.id, url);
    // Cancel before the worker can pick the task up: register enqueues,
    // cancellation wins the race by running first on this thread.
    harness
        .repository
        .imports
        .register_batch(&batch)
        .await
        .unwrap();
    harness
        .repository
        .imports
        .cancel_import_batch(batch.id)
        .await
        .unwrap();
    harness.settle().await;

    let loaded = harness
        .repository
        .imports
        .get_import_batch(batch.id)
        .await
        .unwrap();
    // Either the cancellation landed before processing started (no results)
    // or processing finished first; both are legal under the cancellation
    // contract. The batch must not be left in a non-terminal state.
    assert!(loaded.status.is_terminal());
}
