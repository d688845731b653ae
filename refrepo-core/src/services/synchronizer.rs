//! Synchronizer: mirrors the transactional store into the search index.
//!
//! The transactional store is the source of truth; the index holds the
//! deduplicated projection of each canonical-like reference and the
//! percolator copy of each robot automation. Index writes happen inside the
//! caller's transactional scope so index validation failures roll the
//! transactional write back; the occasional committed-then-unindexed race is
//! corrected by re-running the sync.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::projections::deduplicated_reference;
use crate::search::SearchStore;
use crate::store::{ReferenceInclude, ReferenceScope};

/// Service to synchronize store models into the search index.
pub struct Synchronizer {
    search_store: Arc<dyn SearchStore>,
}

impl Synchronizer {
    pub fn new(search_store: Arc<dyn SearchStore>) -> Self {
        Self { search_store }
    }

    /// Synchronize one reference from the store to the index.
    ///
    /// A duplicate is not indexed under its own id: its entry is deleted and
    /// its canonical is synced instead, so the index only ever serves
    /// deduplicated canonicals.
    pub async fn reference_to_index(
        &self,
        scope: &mut dyn ReferenceScope,
        reference_id: Uuid,
    ) -> Result<()> {
        let mut current_id = reference_id;
        // Iterative rather than recursive: chains are depth-bounded, but a
        // loop avoids boxing the future.
        loop {
            let reference = scope
                .get_reference(current_id, ReferenceInclude::FULL)
                .await?;
            if !reference.canonical_like() {
                if let Some(canonical_id) = reference.canonical_reference_id() {
                    debug!(
                        reference_id = %reference.id,
                        canonical_id = %canonical_id,
                        "reference is a duplicate, syncing its canonical"
                    );
                    self.search_store.delete_reference(reference.id).await?;
                    current_id = canonical_id;
                    continue;
                }
            }
            let projected = deduplicated_reference(&reference)?;
            self.search_store.index_reference(&projected).await?;
            return Ok(());
        }
    }

    /// Synchronize a set of references.
    pub async fn references_to_index(
        &self,
        scope: &mut dyn ReferenceScope,
        reference_ids: &[Uuid],
    ) -> Result<()> {
        for reference_id in reference_ids {
            self.reference_to_index(scope, *reference_id).await?;
        }
        Ok(())
    }

    /// Mirror a robot automation's percolator query into the index.
    pub async fn automation_to_index(
        &self,
        scope: &mut dyn ReferenceScope,
        automation_id: Uuid,
    ) -> Result<()> {
        let automation = scope.get_automation(automation_id).await?;
        self.search_store.index_automation(&automation).await
    }

    /// Rebuild the automation percolation index from the store. The scale is
    /// assumed small enough to do this naively.
    pub async fn repopulate_automations(&self, scope: &mut dyn ReferenceScope) -> Result<()> {
        for automation in scope.all_automations().await? {
            self.search_store.index_automation(&automation).await?;
        }
        Ok(())
    }
}
