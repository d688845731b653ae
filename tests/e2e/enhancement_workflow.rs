//! End-to-end robot enhancement workflow: request, poll, lease, result
//! ingestion, expiry and retry.

use std::time::Duration;

use uuid::Uuid;

use refrepo_core::blob::BlobStore;
use refrepo_core::enhancements::EnhancementContent;
use refrepo_core::robots::{
    EnhancementRequest, EnhancementRequestStatus, PendingEnhancementStatus,
};
use refrepo_core::search::SearchStore;
use refrepo_core::store::{ReferenceScope, ReferenceStore};
use refrepo_test_utils::{make_reference, make_robot, TestHarness};

/// Seed a reference and a robot, returning (reference id, robot id).
async fn seed(harness: &TestHarness) -> (Uuid, Uuid) {
    let reference = make_reference("10.1234/abc", "Heat and Health", &["Doe"], 2020);
    harness
        .repository
        .references
        .merge_reference(&reference)
        .await
        .unwrap();
    let robot = make_robot("abstract-robot");
    harness
        .repository
        .references
        .create_robot(&robot)
        .await
        .unwrap();
    (reference.id, robot.id)
}

/// Write the robot's result JSONL to the batch's pre-allocated upload path.
async fn upload_result(harness: &TestHarness, batch_id: Uuid, lines: Vec<String>) {
    harness
        .blob_store
        .upload_lines(
            "robot_enhancement_batch_result_data",
            &format!("{batch_id}_robot.jsonl"),
            lines,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn robot_enhancement_round_trip() {
    let harness = TestHarness::new().await;
    let (reference_id, robot_id) = seed(&harness).await;

    let request = EnhancementRequest::new(robot_id, vec![reference_id]);
    harness
        .repository
        .references
        .create_enhancement_request(&request)
        .await
        .unwrap();
    assert_eq!(
        harness
            .repository
            .references
            .get_enhancement_request(request.id)
            .await
            .unwrap()
            .request_status,
        EnhancementRequestStatus::Received
    );

    // Poll as the robot.
    let bundle = harness
        .repository
        .references
        .poll_robot_enhancement_batch(robot_id, 1, Some(Duration::from_secs(600)))
        .await
        .unwrap()
        .expect("a batch should be leased");
    assert!(bundle.reference_data_url.contains("verb=download"));
    assert!(bundle.result_upload_url.contains("verb=upload"));

    // The reference data JSONL contains the hydrated target reference.
    let batch_id = bundle.robot_enhancement_batch_id;
    let mut scope = harness.store.begin().await.unwrap();
    let batch = scope.get_robot_batch(batch_id, true).await.unwrap();
    drop(scope);
    let mut reader = harness
        .blob_store
        .stream_lines(batch.reference_data_file.as_ref().unwrap())
        .await
        .unwrap();
    let line = reader.next_line().await.unwrap().unwrap();
    assert!(line.contains(&reference_id.to_string()));
    assert!(reader.next_line().await.unwrap().is_none());

    // Upload one enhancement and signal the result.
    let enhancement = refrepo_test_utils::abstract_enhancement(reference_id, "A new abstract.");
    upload_result(
        &harness,
        batch_id,
        vec![serde_json::to_string(&enhancement).unwrap()],
    )
    .await;
    harness
        .repository
        .references
        .process_robot_enhancement_batch_result(batch_id)
        .await
        .unwrap();

    // The pending enhancement completed and the request with it.
    let mut scope = harness.store.begin().await.unwrap();
    let pending = scope.find_pending_by_batch(batch_id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, PendingEnhancementStatus::Completed);
    drop(scope);
    assert_eq!(
        harness
            .repository
            .references
            .get_enhancement_request(request.id)
            .await
            .unwrap()
            .request_status,
        EnhancementRequestStatus::Completed
    );

    // The validation report records the success.
    let mut scope = harness.store.begin().await.unwrap();
    let batch = scope.get_robot_batch(batch_id, false).await.unwrap();
    drop(scope);
    let mut reader = harness
        .blob_store
        .stream_lines(batch.validation_result_file.as_ref().unwrap())
        .await
        .unwrap();
    let entry = reader.next_line().await.unwrap().unwrap();
    assert!(entry.contains(&reference_id.to_string()));
    assert!(!entry.contains("error"));

    // The search document reflects the new abstract.
    let indexed = harness
        .search_index
        .get_reference(reference_id)
        .await
        .unwrap()
        .unwrap();
    assert!(indexed
        .enhancements
        .as_ref()
        .unwrap()
        .iter()
        .any(|e| matches!(&e.content, EnhancementContent::Abstract { r#abstract } if r#abstract == "A new abstract.")));
}

#[tokio::test]
async fn derived_from_parents_must_share_the_duplicate_tree() {
    let harness = TestHarness::new().await;
    let (reference_id, _) = seed(&harness).await;
    let unrelated = make_reference("10.8/unrelated", "Elsewhere", &["Poe"], 1999);
    harness
        .repository
        .references
        .merge_reference(&unrelated)
        .await
        .unwrap();
    let parent = refrepo_test_utils::abstract_enhancement(unrelated.id, "Parent abstract.");
    harness
        .repository
        .references
        .add_enhancement(parent.clone())
        .await
        .unwrap();

    // A child on `reference_id` deriving from an enhancement on an
    // unrelated reference is rejected.
    let mut child = refrepo_test_utils::abstract_enhancement(reference_id, "Child abstract.");
    child.derived_from = Some(vec![parent.id]);
    let outcome = harness
        .repository
        .references
        .add_enhancement(child)
        .await
        .unwrap();
    match outcome {
        refrepo_core::services::reference::AddEnhancementOutcome::Failed(reason) => {
            assert!(reason.contains("same reference tree"));
        }
        other => panic!("expected a failed outcome, got {other:?}"),
    }

    // Deriving from an enhancement on the same reference is fine.
    let base = refrepo_test_utils::abstract_enhancement(reference_id, "Base abstract.");
    harness
        .repository
        .references
        .add_enhancement(base.clone())
        .await
        .unwrap();
    let mut child = refrepo_test_utils::abstract_enhancement(reference_id, "Derived abstract.");
    child.derived_from = Some(vec![base.id]);
    let outcome = harness
        .repository
        .references
        .add_enhancement(child)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        refrepo_core::services::reference::AddEnhancementOutcome::Added(_)
    ));
}

#[tokio::test]
async fn duplicate_enhancement_content_is_discarded() {
    let harness = TestHarness::new().await;
    let (reference_id, _) = seed(&harness).await;

    let enhancement = refrepo_test_utils::abstract_enhancement(reference_id, "Same text.");
    let outcome = harness
        .repository
        .references
        .add_enhancement(enhancement)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        refrepo_core::services::reference::AddEnhancementOutcome::Added(_)
    ));

    // Content-hash-equal enhancement (fresh id, same content) is discarded.
    let duplicate = refrepo_test_utils::abstract_enhancement(reference_id, "Same text.");
    let outcome = harness
        .repository
        .references
        .add_enhancement(duplicate)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        refrepo_core::services::reference::AddEnhancementOutcome::Discarded
    ));
}

#[tokio::test]
async fn polling_without_work_returns_no_content() {
    let harness = TestHarness::new().await;
    let (_, robot_id) = seed(&harness).await;

    let bundle = harness
        .repository
        .references
        .poll_robot_enhancement_batch(robot_id, 10, None)
        .await
        .unwrap();
    assert!(bundle.is_none());
}

#[tokio::test]
async fn duplicate_result_entries_apply_only_the_first() {
    let harness = TestHarness::new().await;
    let (reference_id, robot_id) = seed(&harness).await;
    let request = EnhancementRequest::new(robot_id, vec![reference_id]);
    harness
        .repository
        .references
        .create_enhancement_request(&request)
        .await
        .unwrap();

    let bundle = harness
        .repository
        .references
        .poll_robot_enhancement_batch(robot_id, 1, None)
        .await
        .unwrap()
        .unwrap();
    let batch_id = bundle.robot_enhancement_batch_id;

    let first = refrepo_test_utils::abstract_enhancement(reference_id, "First abstract.");
    let second = refrepo_test_utils::abstract_enhancement(reference_id, "Second abstract.");
    upload_result(
        &harness,
        batch_id,
        vec![
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap(),
        ],
    )
    .await;
    harness
        .repository
        .references
        .process_robot_enhancement_batch_result(batch_id)
        .await
        .unwrap();

    let indexed = harness
        .search_index
        .get_reference(reference_id)
        .await
        .unwrap()
        .unwrap();
    let abstracts: Vec<&str> = indexed
        .enhancements
        .as_ref()
        .unwrap()
        .iter()
        .filter_map(|e| match &e.content {
            EnhancementContent::Abstract { r#abstract } => Some(r#abstract.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(abstracts, vec!["First abstract."]);
}

#[tokio::test]
async fn surplus_result_entries_are_rejected_per_entry() {
    let harness = TestHarness::new().await;
    let (reference_id, robot_id) = seed(&harness).await;
    let request = EnhancementRequest::new(robot_id, vec![reference_id]);
    harness
        .repository
        .references
        .create_enhancement_request(&request)
        .await
        .unwrap();
    let bundle = harness
        .repository
        .references
        .poll_robot_enhancement_batch(robot_id, 1, None)
        .await
        .unwrap()
        .unwrap();
    let batch_id = bundle.robot_enhancement_batch_id;

    // A result for a reference that was never in the batch.
    let stranger = make_reference("10.9/stranger", "Unrelated", &["Poe"], 1999);
    harness
        .repository
        .references
        .merge_reference(&stranger)
        .await
        .unwrap();
    let surplus = refrepo_test_utils::abstract_enhancement(stranger.id, "Surplus.");
    let expected = refrepo_test_utils::abstract_enhancement(reference_id, "Expected.");
    upload_result(
        &harness,
        batch_id,
        vec![
            serde_json::to_string(&surplus).unwrap(),
            serde_json::to_string(&expected).unwrap(),
        ],
    )
    .await;
    harness
        .repository
        .references
        .process_robot_enhancement_batch_result(batch_id)
        .await
        .unwrap();

    // The surplus enhancement was not applied.
    let indexed = harness
        .search_index
        .get_reference(stranger.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!indexed
        .enhancements
        .as_ref()
        .unwrap()
        .iter()
        .any(|e| matches!(&e.content, EnhancementContent::Abstract { .. })));

    // The validation report carries a "not in batch" entry for it.
    let mut scope = harness.store.begin().await.unwrap();
    let batch = scope.get_robot_batch(batch_id, false).await.unwrap();
    drop(scope);
    let mut reader = harness
        .blob_store
        .stream_lines(batch.validation_result_file.as_ref().unwrap())
        .await
        .unwrap();
    let mut entries = Vec::new();
    while let Some(line) = reader.next_line().await.unwrap() {
        entries.push(line);
    }
    assert!(entries
        .iter()
        .any(|e| e.contains("not in the requested batch")));
}

#[tokio::test]
async fn missing_results_fail_their_pending_enhancements() {
    let harness = TestHarness::new().await;
    let (reference_id, robot_id) = seed(&harness).await;
    let other = make_reference("10.5/other", "Also requested", &["Lee"], 2021);
    harness
        .repository
        .references
        .merge_reference(&other)
        .await
        .unwrap();

    let request = EnhancementRequest::new(robot_id, vec![reference_id, other.id]);
    harness
        .repository
        .references
        .create_enhancement_request(&request)
        .await
        .unwrap();
    let bundle = harness
        .repository
        .references
        .poll_robot_enhancement_batch(robot_id, 10, None)
        .await
        .unwrap()
        .unwrap();
    let batch_id = bundle.robot_enhancement_batch_id;

    // The robot only answers for one of the two references.
    let only = refrepo_test_utils::abstract_enhancement(reference_id, "Only one.");
    upload_result(
        &harness,
        batch_id,
        vec![serde_json::to_string(&only).unwrap()],
    )
    .await;
    harness
        .repository
        .references
        .process_robot_enhancement_batch_result(batch_id)
        .await
        .unwrap();

    let mut scope = harness.store.begin().await.unwrap();
    let pending = scope.find_pending_by_batch(batch_id).await.unwrap();
    drop(scope);
    let statuses: Vec<(Uuid, PendingEnhancementStatus)> = pending
        .iter()
        .map(|p| (p.reference_id, p.status))
        .collect();
    assert!(statuses.contains(&(reference_id, PendingEnhancementStatus::Completed)));
    assert!(statuses.contains(&(other.id, PendingEnhancementStatus::Failed)));

    // Mixed terminal outcomes project a partial failure.
    assert_eq!(
        harness
            .repository
            .references
            .get_enhancement_request(request.id)
            .await
            .unwrap()
            .request_status,
        EnhancementRequestStatus::PartialFailed
    );
}

#[tokio::test]
async fn lease_expiry_creates_retries_until_the_budget_runs_out() {
    let harness = TestHarness::new().await;
    let (reference_id, robot_id) = seed(&harness).await;
    let request = EnhancementRequest::new(robot_id, vec![reference_id]);
    harness
        .repository
        .references
        .create_enhancement_request(&request)
        .await
        .unwrap();

    let mut last_pending_id = None;
    // Original lease plus three retries; the fourth expiry must not spawn
    // a replacement.
    for cycle in 0..4 {
        let bundle = harness
            .repository
            .references
            .poll_robot_enhancement_batch(robot_id, 1, Some(Duration::from_millis(10)))
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("cycle {cycle}: expected a batch"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        harness
            .repository
            .references
            .sweep_expired_leases()
            .await
            .unwrap();

        let mut scope = harness.store.begin().await.unwrap();
        let swept = scope
            .find_pending_by_batch(bundle.robot_enhancement_batch_id)
            .await
            .unwrap();
        drop(scope);
        assert_eq!(swept.len(), 1);
        last_pending_id = Some(swept[0].id);
        if cycle < 3 {
            assert_eq!(swept[0].status, PendingEnhancementStatus::Expired);
        } else {
            // Retry budget exhausted: the final expiry fails the work.
            assert_eq!(swept[0].status, PendingEnhancementStatus::Failed);
        }
    }

    // Each retry points at its predecessor; depth grew along the chain.
    let mut scope = harness.store.begin().await.unwrap();
    let depth = scope.retry_depth(last_pending_id.unwrap()).await.unwrap();
    drop(scope);
    assert_eq!(depth, 3);

    assert_eq!(
        harness
            .repository
            .references
            .get_enhancement_request(request.id)
            .await
            .unwrap()
            .request_status,
        EnhancementRequestStatus::Failed
    );
}

#[tokio::test]
async fn renewal_of_an_expired_lease_is_refused() {
    let harness = TestHarness::new().await;
    let (reference_id, robot_id) = seed(&harness).await;
    let request = EnhancementRequest::new(robot_id, vec![reference_id]);
    harness
        .repository
        .references
        .create_enhancement_request(&request)
        .await
        .unwrap();

    let bundle = harness
        .repository
        .references
        .poll_robot_enhancement_batch(robot_id, 1, Some(Duration::from_millis(10)))
        .await
        .unwrap()
        .unwrap();
    let batch_id = bundle.robot_enhancement_batch_id;

    // While processing, renewal extends the lease.
    let (renewed, _) = harness
        .repository
        .references
        .renew_robot_enhancement_batch_lease(batch_id, Some(Duration::from_millis(10)))
        .await
        .unwrap();
    assert_eq!(renewed, 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    harness
        .repository
        .references
        .sweep_expired_leases()
        .await
        .unwrap();

    // Once swept, the lease cannot be resurrected.
    let error = harness
        .repository
        .references
        .renew_robot_enhancement_batch_lease(batch_id, Some(Duration::from_secs(600)))
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        refrepo_core::error::Error::InvalidInput(_)
    ));
}

#[tokio::test]
async fn one_batch_never_holds_two_pendings_for_one_reference() {
    let harness = TestHarness::new().await;
    let (reference_id, robot_id) = seed(&harness).await;

    // Two requests targeting the same reference produce two pendings.
    for _ in 0..2 {
        let request = EnhancementRequest::new(robot_id, vec![reference_id]);
        harness
            .repository
            .references
            .create_enhancement_request(&request)
            .await
            .unwrap();
    }

    let bundle = harness
        .repository
        .references
        .poll_robot_enhancement_batch(robot_id, 10, None)
        .await
        .unwrap()
        .unwrap();
    let mut scope = harness.store.begin().await.unwrap();
    let leased = scope
        .find_pending_by_batch(bundle.robot_enhancement_batch_id)
        .await
        .unwrap();
    drop(scope);
    assert_eq!(leased.len(), 1);

    // The second pending stays eligible for a future batch.
    let second = harness
        .repository
        .references
        .poll_robot_enhancement_batch(robot_id, 10, None)
        .await
        .unwrap();
    assert!(second.is_some());
}
