//! Factories and harness glue for the reference repository test suites.

use std::collections::BTreeMap;
use std::sync::{Arc, Once};

use tempfile::TempDir;
use uuid::Uuid;

use refrepo_core::blob::{BlobStore, FsBlobStore};
use refrepo_core::config::RepositoryConfig;
use refrepo_core::enhancements::{
    Annotation, AnnotationType, AuthorPosition, Authorship, Enhancement, EnhancementContent,
};
use refrepo_core::identifiers::{ExternalIdentifier, LinkedExternalIdentifier};
use refrepo_core::reference::Reference;
use refrepo_core::repository::Repository;
use refrepo_core::robots::Robot;
use refrepo_core::search::SearchStore;
use refrepo_core::store::ReferenceStore;
use refrepo_index_mem::MemSearchIndex;
use refrepo_storage_libsql::LibsqlReferenceStore;

/// A fully wired repository over temp-dir backends.
///
/// Holds the temp dirs alive for the duration of the test; dropping the
/// harness tears everything down.
pub struct TestHarness {
    pub repository: Arc<Repository>,
    pub store: Arc<LibsqlReferenceStore>,
    pub search_index: Arc<MemSearchIndex>,
    pub blob_store: Arc<FsBlobStore>,
    pub blob_dir: TempDir,
    _db_dir: TempDir,
}

static TRACING: Once = Once::new();

/// Initialize test logging once per process, honoring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(RepositoryConfig::default()).await
    }

    pub async fn with_config(config: RepositoryConfig) -> Self {
        init_tracing();
        let db_dir = tempfile::tempdir().expect("tempdir");
        let db_path = db_dir.path().join("refrepo.db");
        let store = Arc::new(
            LibsqlReferenceStore::open_local(db_path.to_str().expect("utf-8 path"))
                .await
                .expect("open store"),
        );
        store.initialize_schema().await.expect("schema");

        let search_index = Arc::new(MemSearchIndex::new());
        let blob_dir = tempfile::tempdir().expect("tempdir");
        let blob_store = Arc::new(FsBlobStore::new(
            blob_dir.path(),
            &config.default_blob_location,
            &config.default_blob_container,
            config.presigned_url_expiry_seconds,
        ));

        let repository = Repository::with_in_process_worker(
            config,
            Arc::clone(&store) as Arc<dyn ReferenceStore>,
            Arc::clone(&search_index) as Arc<dyn SearchStore>,
            Arc::clone(&blob_store) as Arc<dyn BlobStore>,
        );

        Self {
            repository,
            store,
            search_index,
            blob_store,
            blob_dir,
            _db_dir: db_dir,
        }
    }

    /// Write a JSONL batch file into the blob dir and return a `file://`
    /// URL an import batch can stream from.
    pub async fn write_batch_file(&self, name: &str, lines: &[String]) -> String {
        let path = self.blob_dir.path().join(name);
        tokio::fs::write(&path, format!("{}\n", lines.join("\n")))
            .await
            .expect("write batch file");
        format!("file://{}", path.display())
    }

    /// Wait for the in-process task worker to drain. Background tasks have
    /// no completion signal; a short settle loop keeps the tests honest
    /// without flaky sleeps.
    pub async fn settle(&self) {
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }
}

// ============================================================================
// Factories
// ============================================================================

/// An import-file line for a reference with the given DOI, title, authors
/// and year.
pub fn reference_file_line(doi: &str, title: &str, authors: &[&str], year: i32) -> String {
    let authorship: Vec<serde_json::Value> = authors
        .iter()
        .enumerate()
        .map(|(i, name)| {
            serde_json::json!({
                "display_name": name,
                "position": if i == 0 { "first" } else if i + 1 == authors.len() { "last" } else { "middle" },
            })
        })
        .collect();
    serde_json::json!({
        "identifiers": [{"identifier_type": "doi", "identifier": doi}],
        "enhancements": [{
            "source": "test-importer",
            "enhancement_type": "bibliographic",
            "title": title,
            "authorship": authorship,
            "publication_year": year,
        }],
    })
    .to_string()
}

/// A domain reference with one DOI and one bibliographic enhancement.
pub fn make_reference(doi: &str, title: &str, authors: &[&str], year: i32) -> Reference {
    let mut reference = Reference::new();
    reference.identifiers = Some(vec![LinkedExternalIdentifier::new(
        reference.id,
        ExternalIdentifier::doi(doi).expect("valid doi"),
    )]);
    reference.enhancements = Some(vec![Enhancement::new(
        reference.id,
        "test-importer",
        bibliographic_content(title, authors, year),
    )]);
    reference
}

pub fn bibliographic_content(title: &str, authors: &[&str], year: i32) -> EnhancementContent {
    EnhancementContent::Bibliographic {
        title: Some(title.to_string()),
        authorship: authors
            .iter()
            .enumerate()
            .map(|(i, name)| Authorship {
                display_name: (*name).to_string(),
                position: if i == 0 {
                    AuthorPosition::First
                } else if i + 1 == authors.len() {
                    AuthorPosition::Last
                } else {
                    AuthorPosition::Middle
                },
                orcid: None,
            })
            .collect(),
        publication_year: Some(year),
        publication_date: None,
        publisher: None,
    }
}

pub fn abstract_enhancement(reference_id: Uuid, text: &str) -> Enhancement {
    Enhancement::new(
        reference_id,
        "test-robot",
        EnhancementContent::Abstract {
            r#abstract: text.to_string(),
        },
    )
}

pub fn annotation_enhancement(
    reference_id: Uuid,
    scheme: &str,
    label: &str,
    value: bool,
) -> Enhancement {
    Enhancement::new(
        reference_id,
        "test-robot",
        EnhancementContent::Annotation {
            annotations: vec![Annotation {
                annotation_type: AnnotationType::Boolean,
                scheme: scheme.to_string(),
                label: label.to_string(),
                value: Some(value),
                score: Some(0.9),
                data: BTreeMap::new(),
            }],
        },
    )
}

pub fn make_robot(name: &str) -> Robot {
    Robot::new(
        name,
        format!("https://robots.example.org/{name}"),
        format!("Test robot {name}"),
        "test-suite",
    )
}
