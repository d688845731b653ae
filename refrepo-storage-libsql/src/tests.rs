use uuid::Uuid;

use refrepo_core::decisions::{DuplicateDetermination, ReferenceDuplicateDecision};
use refrepo_core::enhancements::{Enhancement, EnhancementContent};
use refrepo_core::identifiers::{ExternalIdentifier, LinkedExternalIdentifier};
use refrepo_core::imports::{ImportBatch, ImportRecord, ImportResult, ImportResultStatus};
use refrepo_core::reference::Reference;
use refrepo_core::robots::{PendingEnhancement, PendingEnhancementStatus, Robot};
use refrepo_core::store::{IdentifierMatch, ReferenceInclude, ReferenceScope, ReferenceStore};

use crate::LibsqlReferenceStore;

async fn test_store() -> (tempfile::TempDir, LibsqlReferenceStore) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("refrepo.db");
    let store = LibsqlReferenceStore::open_local(path.to_str().unwrap())
        .await
        .unwrap();
    store.initialize_schema().await.unwrap();
    (dir, store)
}

fn reference_with_doi(doi: &str) -> Reference {
    let mut reference = Reference::new();
    reference.identifiers = Some(vec![LinkedExternalIdentifier::new(
        reference.id,
        ExternalIdentifier::doi(doi).unwrap(),
    )]);
    reference.enhancements = Some(vec![Enhancement::new(
        reference.id,
        "importer",
        EnhancementContent::Abstract {
            r#abstract: "We studied heat.".to_string(),
        },
    )]);
    reference
}

#[tokio::test]
async fn reference_aggregate_round_trips() {
    let (_dir, store) = test_store().await;
    let reference = reference_with_doi("10.1234/abc");

    let mut scope = store.begin().await.unwrap();
    scope.merge_reference(&reference).await.unwrap();
    scope.commit().await.unwrap();

    let mut scope = store.begin().await.unwrap();
    let loaded = scope
        .get_reference(reference.id, ReferenceInclude::CONTENT)
        .await
        .unwrap();
    assert_eq!(loaded.id, reference.id);
    assert_eq!(loaded.identifiers.as_ref().unwrap().len(), 1);
    assert_eq!(
        loaded.identifiers.as_ref().unwrap()[0].identifier.value(),
        "10.1234/abc"
    );
    assert_eq!(loaded.enhancements.as_ref().unwrap().len(), 1);
}

#[tokio::test]
async fn uncommitted_scope_rolls_back_on_drop() {
    let (_dir, store) = test_store().await;
    let reference = reference_with_doi("10.1234/abc");

    {
        let mut scope = store.begin().await.unwrap();
        scope.merge_reference(&reference).await.unwrap();
        // Dropped without commit.
    }

    let mut scope = store.begin().await.unwrap();
    let result = scope
        .get_reference(reference.id, ReferenceInclude::NONE)
        .await;
    assert!(matches!(
        result,
        Err(refrepo_core::error::Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn scope_reuse_after_commit_is_a_unit_of_work_error() {
    let (_dir, store) = test_store().await;
    let mut scope = store.begin().await.unwrap();
    scope.commit().await.unwrap();
    let result = scope.all_reference_ids().await;
    assert!(matches!(
        result,
        Err(refrepo_core::error::Error::UnitOfWork(_))
    ));
}

#[tokio::test]
async fn identifier_uniqueness_is_per_reference() {
    let (_dir, store) = test_store().await;
    let mut doubled = reference_with_doi("10.1234/abc");
    let copy = doubled.identifiers.as_ref().unwrap()[0].identifier.clone();
    doubled
        .identifiers
        .as_mut()
        .unwrap()
        .push(LinkedExternalIdentifier::new(doubled.id, copy));

    let mut scope = store.begin().await.unwrap();
    let error = scope.merge_reference(&doubled).await.unwrap_err();
    assert!(matches!(
        error,
        refrepo_core::error::Error::Duplicate { .. }
    ));
    drop(scope);

    // Two different references may share a value; dedup heals them later.
    let first = reference_with_doi("10.1234/abc");
    let second = reference_with_doi("10.1234/abc");
    let mut scope = store.begin().await.unwrap();
    scope.merge_reference(&first).await.unwrap();
    scope.merge_reference(&second).await.unwrap();
    scope.commit().await.unwrap();
}

#[tokio::test]
async fn find_references_with_identifiers_matches_any() {
    let (_dir, store) = test_store().await;
    let reference = reference_with_doi("10.1234/abc");

    let mut scope = store.begin().await.unwrap();
    scope.merge_reference(&reference).await.unwrap();
    scope.commit().await.unwrap();

    let mut scope = store.begin().await.unwrap();
    let keys = vec![
        ExternalIdentifier::doi("10.1234/abc").unwrap().key(),
        ExternalIdentifier::pm_id(999).key(),
    ];
    let found = scope
        .find_references_with_identifiers(&keys, IdentifierMatch::Any, ReferenceInclude::CONTENT)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, reference.id);
}

#[tokio::test]
async fn at_most_one_active_decision_per_reference() {
    let (_dir, store) = test_store().await;
    let reference_id = Uuid::new_v4();

    let mut first =
        ReferenceDuplicateDecision::new(reference_id, DuplicateDetermination::Canonical);
    first.active_decision = true;
    let mut second =
        ReferenceDuplicateDecision::new(reference_id, DuplicateDetermination::Canonical);
    second.active_decision = true;

    let mut scope = store.begin().await.unwrap();
    scope.add_decision(&first).await.unwrap();
    // Inserting a second active decision violates the partial unique index.
    let error = scope.add_decision(&second).await.unwrap_err();
    assert!(matches!(
        error,
        refrepo_core::error::Error::Duplicate { .. }
    ));
}

#[tokio::test]
async fn deactivate_then_activate_moves_the_active_decision() {
    let (_dir, store) = test_store().await;
    let reference_id = Uuid::new_v4();

    let mut first =
        ReferenceDuplicateDecision::new(reference_id, DuplicateDetermination::Canonical);
    first.active_decision = true;
    let mut second =
        ReferenceDuplicateDecision::new(reference_id, DuplicateDetermination::Pending);

    let mut scope = store.begin().await.unwrap();
    scope.add_decision(&first).await.unwrap();
    scope.add_decision(&second).await.unwrap();
    scope
        .deactivate_decisions_for(reference_id, second.id)
        .await
        .unwrap();
    second.duplicate_determination = DuplicateDetermination::Canonical;
    second.active_decision = true;
    scope.update_decision(&second).await.unwrap();
    scope.commit().await.unwrap();

    let mut scope = store.begin().await.unwrap();
    let active = scope
        .active_decision_for(reference_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.id, second.id);
}

#[tokio::test]
async fn duplicate_references_preload_follows_active_decisions() {
    let (_dir, store) = test_store().await;
    let canonical = reference_with_doi("10.1/a");
    let duplicate = reference_with_doi("10.1/b");

    let mut scope = store.begin().await.unwrap();
    scope.merge_reference(&canonical).await.unwrap();
    scope.merge_reference(&duplicate).await.unwrap();
    let mut decision =
        ReferenceDuplicateDecision::new(duplicate.id, DuplicateDetermination::Duplicate);
    decision.canonical_reference_id = Some(canonical.id);
    decision.active_decision = true;
    scope.add_decision(&decision).await.unwrap();
    scope.commit().await.unwrap();

    let mut scope = store.begin().await.unwrap();
    let loaded = scope
        .get_reference(canonical.id, ReferenceInclude::DEDUPLICATED)
        .await
        .unwrap();
    let duplicates = loaded.duplicate_references.as_ref().unwrap();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(duplicates[0].id, duplicate.id);
    assert_eq!(duplicates[0].identifiers.as_ref().unwrap().len(), 1);
}

#[tokio::test]
async fn import_hierarchy_round_trips() {
    let (_dir, store) = test_store().await;
    let record = ImportRecord::new("processor", "1.0.0", "openalex", -1);
    let batch = ImportBatch::new(record.id, "https://example.org/batch.jsonl");

    let mut scope = store.begin().await.unwrap();
    scope.add_import_record(&record).await.unwrap();
    scope.add_import_batch(&batch).await.unwrap();
    let mut result = ImportResult::new(batch.id);
    result.status = ImportResultStatus::Completed;
    result.reference_id = Some(Uuid::new_v4());
    scope.add_import_result(&result).await.unwrap();
    scope.commit().await.unwrap();

    let mut scope = store.begin().await.unwrap();
    let loaded = scope.get_import_batch(batch.id, true).await.unwrap();
    assert_eq!(loaded.import_results.as_ref().unwrap().len(), 1);
    let loaded_record = scope.get_import_record(record.id, true).await.unwrap();
    assert_eq!(loaded_record.batches.as_ref().unwrap().len(), 1);
}

#[tokio::test]
async fn batch_storage_url_unique_per_record() {
    let (_dir, store) = test_store().await;
    let record = ImportRecord::new("processor", "1.0.0", "openalex", -1);
    let first = ImportBatch::new(record.id, "https://example.org/batch.jsonl");
    let second = ImportBatch::new(record.id, "https://example.org/batch.jsonl");

    let mut scope = store.begin().await.unwrap();
    scope.add_import_record(&record).await.unwrap();
    scope.add_import_batch(&first).await.unwrap();
    let error = scope.add_import_batch(&second).await.unwrap_err();
    assert!(matches!(
        error,
        refrepo_core::error::Error::Duplicate { .. }
    ));
}

#[tokio::test]
async fn pending_enhancement_leasing_and_expiry() {
    let (_dir, store) = test_store().await;
    let robot = Robot::new("classifier", "https://robots.example.org", "d", "o");
    let reference_id = Uuid::new_v4();
    let pending = PendingEnhancement::new(reference_id, robot.id);

    let mut scope = store.begin().await.unwrap();
    scope.add_robot(&robot).await.unwrap();
    scope.add_pending_enhancements(&[pending.clone()]).await.unwrap();

    // Lease it into a batch.
    let batch_id = Uuid::new_v4();
    let expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
    let leased = scope
        .lease_pending(&[pending.id], batch_id, expires_at)
        .await
        .unwrap();
    assert_eq!(leased, 1);

    // The lease has already lapsed: renewal finds it, expiry claims it.
    let stale = scope.expire_stale_pending(chrono::Utc::now()).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].status, PendingEnhancementStatus::Expired);

    // Expired rows cannot be renewed.
    let renewed = scope
        .renew_leases(batch_id, chrono::Utc::now() + chrono::Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(renewed, 0);
}

#[tokio::test]
async fn retry_depth_walks_the_chain() {
    let (_dir, store) = test_store().await;
    let robot = Robot::new("classifier", "https://robots.example.org", "d", "o");
    let original = PendingEnhancement::new(Uuid::new_v4(), robot.id);
    let first_retry = original.retry();
    let second_retry = first_retry.retry();

    let mut scope = store.begin().await.unwrap();
    scope.add_robot(&robot).await.unwrap();
    scope
        .add_pending_enhancements(&[original.clone(), first_retry.clone(), second_retry.clone()])
        .await
        .unwrap();

    assert_eq!(scope.retry_depth(original.id).await.unwrap(), 0);
    assert_eq!(scope.retry_depth(first_retry.id).await.unwrap(), 1);
    assert_eq!(scope.retry_depth(second_retry.id).await.unwrap(), 2);
}

#[tokio::test]
async fn robot_name_unique() {
    let (_dir, store) = test_store().await;
    let first = Robot::new("classifier", "https://a.example.org", "d", "o");
    let second = Robot::new("classifier", "https://b.example.org", "d", "o");

    let mut scope = store.begin().await.unwrap();
    scope.add_robot(&first).await.unwrap();
    let error = scope.add_robot(&second).await.unwrap_err();
    assert!(matches!(
        error,
        refrepo_core::error::Error::Duplicate { .. }
    ));
}
