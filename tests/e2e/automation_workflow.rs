//! Automation percolation: enhancement changesets trigger robots, with
//! self-loop prevention on result ingestion.

use std::time::Duration;

use uuid::Uuid;

use refrepo_core::blob::BlobStore;
use refrepo_core::robots::RobotAutomation;
use refrepo_core::store::{ReferenceScope, ReferenceStore};
use refrepo_test_utils::{abstract_enhancement, annotation_enhancement, make_reference, make_robot, TestHarness};

/// Pending work for a robot, by reference id.
async fn pending_for_robot(harness: &TestHarness, robot_id: Uuid) -> Vec<Uuid> {
    let mut scope = harness.store.begin().await.unwrap();
    let pending = scope.find_pending_for_robot(robot_id, 100).await.unwrap();
    drop(scope);
    pending.iter().map(|p| p.reference_id).collect()
}

#[tokio::test]
async fn new_enhancement_triggers_matching_automation() {
    let harness = TestHarness::new().await;
    let reference = make_reference("10.1/a", "Heat and Health", &["Doe"], 2020);
    harness
        .repository
        .references
        .merge_reference(&reference)
        .await
        .unwrap();

    let annotator = make_robot("annotator");
    harness
        .repository
        .references
        .create_robot(&annotator)
        .await
        .unwrap();
    let automation = RobotAutomation::new(
        annotator.id,
        serde_json::json!({"term": {"enhancement_type": "abstract"}}),
    );
    harness
        .repository
        .references
        .add_robot_automation(&automation)
        .await
        .unwrap();

    // Adding an abstract percolates and enqueues work for the annotator.
    harness
        .repository
        .references
        .add_enhancement(abstract_enhancement(reference.id, "An abstract."))
        .await
        .unwrap();

    assert_eq!(
        pending_for_robot(&harness, annotator.id).await,
        vec![reference.id]
    );
}

#[tokio::test]
async fn malformed_automation_query_rolls_back_the_insert() {
    let harness = TestHarness::new().await;
    let robot = make_robot("annotator");
    harness
        .repository
        .references
        .create_robot(&robot)
        .await
        .unwrap();

    let automation = RobotAutomation::new(
        robot.id,
        serde_json::json!({"wildcard": {"title": "heat*"}}),
    );
    let error = harness
        .repository
        .references
        .add_robot_automation(&automation)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        refrepo_core::error::Error::MalformedIndexDocument(_)
    ));

    // The transactional write rolled back with the index validation.
    let automations = harness
        .repository
        .references
        .get_robot_automations()
        .await
        .unwrap();
    assert!(automations.is_empty());
    assert_eq!(harness.search_index.automation_count(), 0);
}

#[tokio::test]
async fn result_ingestion_skips_the_producing_robot() {
    let harness = TestHarness::new().await;
    let reference = make_reference("10.1/a", "Heat and Health", &["Doe"], 2020);
    harness
        .repository
        .references
        .merge_reference(&reference)
        .await
        .unwrap();

    // One robot produces annotations; its own automation would match the
    // very annotations it uploads.
    let annotator = make_robot("annotator");
    harness
        .repository
        .references
        .create_robot(&annotator)
        .await
        .unwrap();
    let self_automation = RobotAutomation::new(
        annotator.id,
        serde_json::json!({"term": {"enhancement_type": "annotation"}}),
    );
    harness
        .repository
        .references
        .add_robot_automation(&self_automation)
        .await
        .unwrap();
    // A second robot with the same trigger still fires.
    let other = make_robot("downstream");
    harness
        .repository
        .references
        .create_robot(&other)
        .await
        .unwrap();
    let cross_automation = RobotAutomation::new(
        other.id,
        serde_json::json!({"term": {"enhancement_type": "annotation"}}),
    );
    harness
        .repository
        .references
        .add_robot_automation(&cross_automation)
        .await
        .unwrap();

    // Queue work for the annotator directly and run the poll/result cycle.
    let request = refrepo_core::robots::EnhancementRequest::new(annotator.id, vec![reference.id]);
    harness
        .repository
        .references
        .create_enhancement_request(&request)
        .await
        .unwrap();
    let bundle = harness
        .repository
        .references
        .poll_robot_enhancement_batch(annotator.id, 1, Some(Duration::from_secs(600)))
        .await
        .unwrap()
        .unwrap();
    let batch_id = bundle.robot_enhancement_batch_id;

    let enhancement = annotation_enhancement(reference.id, "topics", "heat", true);
    harness
        .blob_store
        .upload_lines(
            "robot_enhancement_batch_result_data",
            &format!("{batch_id}_robot.jsonl"),
            vec![serde_json::to_string(&enhancement).unwrap()],
        )
        .await
        .unwrap();
    harness
        .repository
        .references
        .process_robot_enhancement_batch_result(batch_id)
        .await
        .unwrap();

    // The producing robot is skipped; the downstream robot is enqueued.
    assert!(pending_for_robot(&harness, annotator.id).await.is_empty());
    assert_eq!(
        pending_for_robot(&harness, other.id).await,
        vec![reference.id]
    );

    // The enqueued work carries its triggering context.
    let mut scope = harness.store.begin().await.unwrap();
    let pending = scope.find_pending_for_robot(other.id, 10).await.unwrap();
    drop(scope);
    assert_eq!(
        pending[0].source.as_deref(),
        Some(format!("RobotEnhancementBatch:{batch_id}").as_str())
    );
}
