//! Reference, identifier and enhancement persistence.

use std::collections::HashSet;

use libsql::{params, params_from_iter, Row};
use uuid::Uuid;

use refrepo_core::enhancements::Enhancement;
use refrepo_core::error::{Error, Result};
use refrepo_core::identifiers::{ExternalIdentifier, IdentifierKey, LinkedExternalIdentifier};
use refrepo_core::reference::Reference;
use refrepo_core::store::{IdentifierMatch, ReferenceInclude};

use crate::scope::{
    enum_from_string, enum_to_string, from_json, from_micros, parse_uuid, placeholders, to_json,
    to_micros, LibsqlScope,
};

fn ids_to_strings(ids: &[Uuid]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

impl LibsqlScope {
    // ========== Writes ==========

    pub(crate) async fn insert_reference(&self, reference: &Reference) -> Result<()> {
        self.conn
            .execute(
                r#"INSERT INTO "references" (id, visibility, created_at, updated_at)
                   VALUES (?, ?, ?, ?)"#,
                params![
                    reference.id.to_string(),
                    enum_to_string(&reference.visibility)?,
                    to_micros(reference.created_at),
                    to_micros(reference.updated_at),
                ],
            )
            .await
            .map_err(|e| Self::map_store_error("Reference", "failed to insert reference", &e))?;
        self.replace_reference_children(reference).await
    }

    /// Idempotent aggregate upsert: the reference row plus its own
    /// identifiers and enhancements are replaced in place.
    pub(crate) async fn merge_reference_aggregate(&self, reference: &Reference) -> Result<()> {
        self.conn
            .execute(
                r#"INSERT INTO "references" (id, visibility, created_at, updated_at)
                   VALUES (?, ?, ?, ?)
                   ON CONFLICT(id) DO UPDATE SET
                       visibility = excluded.visibility,
                       updated_at = excluded.updated_at"#,
                params![
                    reference.id.to_string(),
                    enum_to_string(&reference.visibility)?,
                    to_micros(reference.created_at),
                    to_micros(chrono::Utc::now()),
                ],
            )
            .await
            .map_err(|e| Self::map_store_error("Reference", "failed to merge reference", &e))?;
        self.replace_reference_children(reference).await
    }

    /// Replace the reference's own identifier and enhancement rows with the
    /// aggregate's content. Rows belonging to other references (e.g. from a
    /// deduplicated projection) are never touched.
    async fn replace_reference_children(&self, reference: &Reference) -> Result<()> {
        if let Some(identifiers) = &reference.identifiers {
            self.conn
                .execute(
                    "DELETE FROM external_identifiers WHERE reference_id = ?",
                    params![reference.id.to_string()],
                )
                .await
                .map_err(|e| {
                    Self::map_store_error("LinkedExternalIdentifier", "failed to clear", &e)
                })?;
            for identifier in identifiers {
                if identifier.reference_id != reference.id {
                    continue;
                }
                self.insert_identifier(identifier).await?;
            }
        }
        if let Some(enhancements) = &reference.enhancements {
            self.conn
                .execute(
                    "DELETE FROM enhancements WHERE reference_id = ?",
                    params![reference.id.to_string()],
                )
                .await
                .map_err(|e| Self::map_store_error("Enhancement", "failed to clear", &e))?;
            for enhancement in enhancements {
                if enhancement.reference_id != reference.id {
                    continue;
                }
                self.insert_enhancement(enhancement).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn insert_identifier(
        &self,
        identifier: &LinkedExternalIdentifier,
    ) -> Result<()> {
        let key = identifier.identifier.key();
        self.conn
            .execute(
                r#"INSERT INTO external_identifiers
                   (id, reference_id, identifier_type, identifier_value,
                    other_identifier_name, payload, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
                params![
                    identifier.id.to_string(),
                    identifier.reference_id.to_string(),
                    enum_to_string(&key.identifier_type)?,
                    key.value,
                    key.other_identifier_name.unwrap_or_default(),
                    to_json(&identifier.identifier)?,
                    to_micros(identifier.created_at),
                    to_micros(identifier.updated_at),
                ],
            )
            .await
            .map_err(|e| {
                Self::map_store_error(
                    "LinkedExternalIdentifier",
                    "failed to insert identifier",
                    &e,
                )
            })?;
        Ok(())
    }

    async fn insert_enhancement(&self, enhancement: &Enhancement) -> Result<()> {
        self.conn
            .execute(
                r#"INSERT INTO enhancements
                   (id, reference_id, source, visibility, robot_version,
                    derived_from, content, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                params![
                    enhancement.id.to_string(),
                    enhancement.reference_id.to_string(),
                    enhancement.source.clone(),
                    enum_to_string(&enhancement.visibility)?,
                    enhancement.robot_version.clone(),
                    enhancement
                        .derived_from
                        .as_ref()
                        .map(to_json)
                        .transpose()?,
                    to_json(&enhancement.content)?,
                    to_micros(enhancement.created_at),
                    to_micros(enhancement.updated_at),
                ],
            )
            .await
            .map_err(|e| {
                Self::map_store_error("Enhancement", "failed to insert enhancement", &e)
            })?;
        Ok(())
    }

    // ========== Reads ==========

    /// Load the bare reference row, without relationships.
    async fn load_reference_row(&self, id: Uuid) -> Result<Reference> {
        let mut rows = self
            .conn
            .query(
                r#"SELECT id, visibility, created_at, updated_at
                   FROM "references" WHERE id = ?"#,
                params![id.to_string()],
            )
            .await
            .map_err(|e| Self::map_store_error("Reference", "failed to query reference", &e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("Reference", "failed to fetch reference", &e))?
            .ok_or(Error::NotFound {
                entity: "Reference",
                id,
            })?;
        Self::row_to_reference(&row)
    }

    pub(crate) async fn load_reference(
        &self,
        id: Uuid,
        include: ReferenceInclude,
    ) -> Result<Reference> {
        let mut reference = self.load_reference_row(id).await?;
        self.hydrate_reference(&mut reference, include).await?;
        Ok(reference)
    }

    pub(crate) async fn load_references(
        &self,
        ids: &[Uuid],
        include: ReferenceInclude,
        fail_on_missing: bool,
    ) -> Result<Vec<Reference>> {
        let mut references = Vec::with_capacity(ids.len());
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            match self.load_reference(*id, include).await {
                Ok(reference) => references.push(reference),
                Err(Error::NotFound { .. }) if !fail_on_missing => {}
                Err(e) => return Err(e),
            }
        }
        Ok(references)
    }

    pub(crate) async fn verify_reference_ids_exist(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            r#"SELECT id FROM "references" WHERE id IN ({})"#,
            placeholders(ids.len())
        );
        let mut rows = self
            .conn
            .query(&sql, params_from_iter(ids_to_strings(ids)))
            .await
            .map_err(|e| Self::map_store_error("Reference", "failed to verify ids", &e))?;
        let mut found = HashSet::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("Reference", "failed to fetch row", &e))?
        {
            let id: String = row
                .get(0)
                .map_err(|e| Error::Store(format!("failed to read id: {e}")))?;
            found.insert(parse_uuid(&id)?);
        }
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !found.contains(id))
            .map(|id| id.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::NotFoundBy {
                entity: "Reference",
                lookup: "ids",
                value: missing.join(", "),
            })
        }
    }

    pub(crate) async fn select_all_reference_ids(&self) -> Result<Vec<Uuid>> {
        let mut rows = self
            .conn
            .query(r#"SELECT id FROM "references" ORDER BY created_at"#, ())
            .await
            .map_err(|e| Self::map_store_error("Reference", "failed to list ids", &e))?;
        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("Reference", "failed to fetch row", &e))?
        {
            let id: String = row
                .get(0)
                .map_err(|e| Error::Store(format!("failed to read id: {e}")))?;
            ids.push(parse_uuid(&id)?);
        }
        Ok(ids)
    }

    pub(crate) async fn find_by_identifiers(
        &self,
        keys: &[IdentifierKey],
        _match_mode: IdentifierMatch,
        include: ReferenceInclude,
    ) -> Result<Vec<Reference>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let clause = std::iter::repeat_n(
            "(identifier_type = ? AND identifier_value = ? AND other_identifier_name = ?)",
            keys.len(),
        )
        .collect::<Vec<_>>()
        .join(" OR ");
        let sql = format!(
            "SELECT DISTINCT reference_id FROM external_identifiers WHERE {clause} \
             ORDER BY reference_id"
        );
        let mut bindings: Vec<String> = Vec::with_capacity(keys.len() * 3);
        for key in keys {
            bindings.push(enum_to_string(&key.identifier_type)?);
            bindings.push(key.value.clone());
            bindings.push(key.other_identifier_name.clone().unwrap_or_default());
        }
        let mut rows = self
            .conn
            .query(&sql, params_from_iter(bindings))
            .await
            .map_err(|e| {
                Self::map_store_error("Reference", "failed to search identifiers", &e)
            })?;
        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("Reference", "failed to fetch row", &e))?
        {
            let id: String = row
                .get(0)
                .map_err(|e| Error::Store(format!("failed to read reference_id: {e}")))?;
            ids.push(parse_uuid(&id)?);
        }
        self.load_references(&ids, include, false).await
    }

    pub(crate) async fn load_enhancements(&self, ids: &[Uuid]) -> Result<Vec<Enhancement>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, reference_id, source, visibility, robot_version, derived_from, \
                    content, created_at, updated_at
             FROM enhancements WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut rows = self
            .conn
            .query(&sql, params_from_iter(ids_to_strings(ids)))
            .await
            .map_err(|e| Self::map_store_error("Enhancement", "failed to query", &e))?;
        let mut enhancements = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("Enhancement", "failed to fetch row", &e))?
        {
            enhancements.push(Self::row_to_enhancement(&row)?);
        }
        if enhancements.len() != ids.len() {
            let found: HashSet<Uuid> = enhancements.iter().map(|e| e.id).collect();
            let missing: Vec<String> = ids
                .iter()
                .filter(|id| !found.contains(id))
                .map(|id| id.to_string())
                .collect();
            return Err(Error::NotFoundBy {
                entity: "Enhancement",
                lookup: "ids",
                value: missing.join(", "),
            });
        }
        Ok(enhancements)
    }

    // ========== Hydration ==========

    /// Populate the requested relationships. Preloaded-and-empty comes back
    /// as `Some(vec![])`, never `None`.
    async fn hydrate_reference(
        &self,
        reference: &mut Reference,
        include: ReferenceInclude,
    ) -> Result<()> {
        if include.identifiers {
            reference.identifiers = Some(self.load_identifiers_for(reference.id).await?);
        }
        if include.enhancements {
            reference.enhancements = Some(self.load_enhancements_for(reference.id).await?);
        }
        if include.duplicate_decision || include.canonical_reference {
            reference.duplicate_decision = self.load_active_decision(reference.id).await?;
        }
        if include.duplicate_references {
            let dependents = self.load_decisions_pointing_to(reference.id).await?;
            let mut duplicates = Vec::with_capacity(dependents.len());
            for dependent in dependents {
                // One level is enough: chains are bounded to direct
                // duplicates, so a duplicate has no duplicates of its own.
                let mut duplicate = self.load_reference_row(dependent.reference_id).await?;
                duplicate.identifiers = Some(self.load_identifiers_for(duplicate.id).await?);
                duplicate.enhancements = Some(self.load_enhancements_for(duplicate.id).await?);
                duplicates.push(duplicate);
            }
            reference.duplicate_references = Some(duplicates);
        }
        if include.canonical_reference {
            if let Some(canonical_id) = reference
                .duplicate_decision
                .as_ref()
                .and_then(|d| d.canonical_reference_id)
            {
                match self.load_reference_row(canonical_id).await {
                    Ok(canonical) => reference.canonical_reference = Some(Box::new(canonical)),
                    Err(Error::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn load_identifiers_for(
        &self,
        reference_id: Uuid,
    ) -> Result<Vec<LinkedExternalIdentifier>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, reference_id, payload, created_at, updated_at
                 FROM external_identifiers WHERE reference_id = ? ORDER BY created_at, id",
                params![reference_id.to_string()],
            )
            .await
            .map_err(|e| {
                Self::map_store_error("LinkedExternalIdentifier", "failed to query", &e)
            })?;
        let mut identifiers = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| {
            Self::map_store_error("LinkedExternalIdentifier", "failed to fetch row", &e)
        })? {
            identifiers.push(Self::row_to_identifier(&row)?);
        }
        Ok(identifiers)
    }

    async fn load_enhancements_for(&self, reference_id: Uuid) -> Result<Vec<Enhancement>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, reference_id, source, visibility, robot_version, derived_from, \
                        content, created_at, updated_at
                 FROM enhancements WHERE reference_id = ? ORDER BY created_at, id",
                params![reference_id.to_string()],
            )
            .await
            .map_err(|e| Self::map_store_error("Enhancement", "failed to query", &e))?;
        let mut enhancements = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("Enhancement", "failed to fetch row", &e))?
        {
            enhancements.push(Self::row_to_enhancement(&row)?);
        }
        Ok(enhancements)
    }

    // ========== Row mappers ==========

    fn row_to_reference(row: &Row) -> Result<Reference> {
        let id: String = row
            .get(0)
            .map_err(|e| Error::Store(format!("failed to read id: {e}")))?;
        let visibility: String = row
            .get(1)
            .map_err(|e| Error::Store(format!("failed to read visibility: {e}")))?;
        let created_at: i64 = row
            .get(2)
            .map_err(|e| Error::Store(format!("failed to read created_at: {e}")))?;
        let updated_at: i64 = row
            .get(3)
            .map_err(|e| Error::Store(format!("failed to read updated_at: {e}")))?;
        Ok(Reference {
            id: parse_uuid(&id)?,
            visibility: enum_from_string(&visibility)?,
            identifiers: None,
            enhancements: None,
            duplicate_decision: None,
            duplicate_references: None,
            canonical_reference: None,
            created_at: from_micros(created_at)?,
            updated_at: from_micros(updated_at)?,
        })
    }

    fn row_to_identifier(row: &Row) -> Result<LinkedExternalIdentifier> {
        let id: String = row
            .get(0)
            .map_err(|e| Error::Store(format!("failed to read id: {e}")))?;
        let reference_id: String = row
            .get(1)
            .map_err(|e| Error::Store(format!("failed to read reference_id: {e}")))?;
        let payload: String = row
            .get(2)
            .map_err(|e| Error::Store(format!("failed to read payload: {e}")))?;
        let created_at: i64 = row
            .get(3)
            .map_err(|e| Error::Store(format!("failed to read created_at: {e}")))?;
        let updated_at: i64 = row
            .get(4)
            .map_err(|e| Error::Store(format!("failed to read updated_at: {e}")))?;
        let identifier: ExternalIdentifier = from_json(&payload)?;
        Ok(LinkedExternalIdentifier {
            id: parse_uuid(&id)?,
            reference_id: parse_uuid(&reference_id)?,
            identifier,
            created_at: from_micros(created_at)?,
            updated_at: from_micros(updated_at)?,
        })
    }

    fn row_to_enhancement(row: &Row) -> Result<Enhancement> {
        let id: String = row
            .get(0)
            .map_err(|e| Error::Store(format!("failed to read id: {e}")))?;
        let reference_id: String = row
            .get(1)
            .map_err(|e| Error::Store(format!("failed to read reference_id: {e}")))?;
        let source: String = row
            .get(2)
            .map_err(|e| Error::Store(format!("failed to read source: {e}")))?;
        let visibility: String = row
            .get(3)
            .map_err(|e| Error::Store(format!("failed to read visibility: {e}")))?;
        let robot_version: Option<String> = row.get(4).ok();
        let derived_from: Option<String> = row.get(5).ok();
        let content: String = row
            .get(6)
            .map_err(|e| Error::Store(format!("failed to read content: {e}")))?;
        let created_at: i64 = row
            .get(7)
            .map_err(|e| Error::Store(format!("failed to read created_at: {e}")))?;
        let updated_at: i64 = row
            .get(8)
            .map_err(|e| Error::Store(format!("failed to read updated_at: {e}")))?;
        Ok(Enhancement {
            id: parse_uuid(&id)?,
            reference_id: parse_uuid(&reference_id)?,
            source,
            visibility: enum_from_string(&visibility)?,
            robot_version,
            derived_from: derived_from.map(|raw| from_json(&raw)).transpose()?,
            content: from_json(&content)?,
            created_at: from_micros(created_at)?,
            updated_at: from_micros(updated_at)?,
        })
    }
}
