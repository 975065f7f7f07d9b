use prompt_lineage_core::{
    check_invariants, format_timestamp, now_utc, parse_timestamp, ChangeKind, Invariant,
    InvariantViolation, MethodologyId, MethodologyKind, MethodologyRecord, NewMethodology,
    NewPrompt, PromptId, PromptRecord,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::{SqliteStore, StoreError};

pub(crate) const PROMPT_COLUMNS: &str = "id, title, content, parent_id, methodology_id, change_kind, \
     version_number, lineage_root_id, metadata_json, created_at, updated_at";

const METHODOLOGY_COLUMNS: &str = "id, name, description, path, kind, examples_json, \
     prompt_samples_json, created_at, updated_at";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteSummary {
    pub id: PromptId,
    /// Rows removed, including versions that cascaded with a deleted lineage root.
    pub removed: usize,
    pub was_lineage_root: bool,
}

impl SqliteStore {
    /// # Errors
    /// Returns a validation error for malformed input or a storage error when
    /// the name is already taken.
    pub fn insert_methodology(
        &mut self,
        methodology: &NewMethodology,
    ) -> Result<MethodologyRecord, StoreError> {
        methodology.validate()?;
        let record = self.with_transaction(|tx| {
            let now = format_timestamp(now_utc())?;
            tx.execute(
                "INSERT INTO methodologies(
                    name, description, path, kind, examples_json, prompt_samples_json,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    methodology.name.trim(),
                    methodology.description,
                    methodology.path,
                    methodology.kind.as_str(),
                    serde_json::to_string(&methodology.examples)?,
                    serde_json::to_string(&methodology.prompt_samples)?,
                    now,
                ],
            )?;
            let id = MethodologyId(tx.last_insert_rowid());
            find_methodology(tx, id)?.ok_or_else(|| StoreError::not_found("methodology", id))
        })?;
        info!(id = %record.id, name = %record.name, "inserted methodology");
        Ok(record)
    }

    /// # Errors
    /// Returns [`StoreError::NotFound`] when no methodology has this id.
    pub fn get_methodology(&self, id: MethodologyId) -> Result<MethodologyRecord, StoreError> {
        find_methodology(&self.conn, id)?.ok_or_else(|| StoreError::not_found("methodology", id))
    }

    /// # Errors
    /// Returns [`StoreError::NotFound`] when no methodology has this name.
    pub fn get_methodology_by_name(&self, name: &str) -> Result<MethodologyRecord, StoreError> {
        let sql = format!("SELECT {METHODOLOGY_COLUMNS} FROM methodologies WHERE name = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![name.trim()])?;
        match rows.next()? {
            Some(row) => read_methodology(row),
            None => Err(StoreError::not_found("methodology", name)),
        }
    }

    /// Methodologies ordered by taxonomy path, optionally filtered by kind.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_methodologies(
        &self,
        kind: Option<MethodologyKind>,
    ) -> Result<Vec<MethodologyRecord>, StoreError> {
        let sql = format!(
            "SELECT {METHODOLOGY_COLUMNS} FROM methodologies
             WHERE ?1 IS NULL OR kind = ?1
             ORDER BY path ASC, name ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![kind.map(MethodologyKind::as_str)])?;
        let mut methodologies = Vec::new();
        while let Some(row) = rows.next()? {
            methodologies.push(read_methodology(row)?);
        }
        Ok(methodologies)
    }

    /// # Errors
    /// Returns [`StoreError::NotFound`] when no methodology has this id.
    pub fn update_methodology_description(
        &mut self,
        id: MethodologyId,
        description: &str,
    ) -> Result<MethodologyRecord, StoreError> {
        self.with_transaction(|tx| {
            let changed = tx.execute(
                "UPDATE methodologies SET description = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.0, description, format_timestamp(now_utc())?],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("methodology", id));
            }
            find_methodology(tx, id)?.ok_or_else(|| StoreError::not_found("methodology", id))
        })
    }

    /// Insert a fully specified candidate after checking every lineage rule.
    ///
    /// Most callers want [`crate::LineageManager::save`], which computes the
    /// candidate from the current latest record.
    ///
    /// # Errors
    /// Returns a validation error, an [`InvariantViolation`], or a storage error.
    /// Nothing is written on error.
    pub fn insert_prompt(&mut self, candidate: &NewPrompt) -> Result<PromptRecord, StoreError> {
        self.with_transaction(|tx| insert_prompt_in(tx, candidate))
    }

    /// # Errors
    /// Returns [`StoreError::NotFound`] when no prompt has this id.
    pub fn get_prompt(&self, id: PromptId) -> Result<PromptRecord, StoreError> {
        find_prompt(&self.conn, id)?.ok_or_else(|| StoreError::not_found("prompt", id))
    }

    /// Delete one prompt.
    ///
    /// Children keep their row with `parent_id` cleared. Deleting a lineage
    /// root removes the whole lineage.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when no prompt has this id.
    pub fn delete_prompt(&mut self, id: PromptId) -> Result<DeleteSummary, StoreError> {
        let summary = self.with_transaction(|tx| {
            let record = find_prompt(tx, id)?.ok_or_else(|| StoreError::not_found("prompt", id))?;
            let before = count_prompts(tx)?;
            tx.execute("DELETE FROM prompts WHERE id = ?1", params![id.0])?;
            let after = count_prompts(tx)?;
            Ok(DeleteSummary {
                id,
                removed: before.saturating_sub(after),
                was_lineage_root: record.effective_lineage_root() == id,
            })
        })?;
        info!(id = %id, removed = summary.removed, "deleted prompt");
        Ok(summary)
    }

    /// Store an already-sealed credential, replacing any previous one.
    ///
    /// # Errors
    /// Returns an error when the provider name is blank or the write fails.
    pub fn put_credential(&mut self, provider: &str, ciphertext: &[u8]) -> Result<(), StoreError> {
        let provider = provider.trim();
        if provider.is_empty() {
            return Err(prompt_lineage_core::ValidationError::Malformed(
                "provider MUST be non-empty".to_string(),
            )
            .into());
        }
        self.with_transaction(|tx| {
            let now = format_timestamp(now_utc())?;
            tx.execute(
                "INSERT INTO provider_credentials(provider, ciphertext, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(provider) DO UPDATE SET
                   ciphertext = excluded.ciphertext,
                   updated_at = excluded.updated_at",
                params![provider, ciphertext, now],
            )?;
            Ok(())
        })?;
        debug!(provider, "stored provider credential");
        Ok(())
    }

    /// # Errors
    /// Returns an error when the read fails.
    pub fn get_credential(&self, provider: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let ciphertext = self
            .conn
            .query_row(
                "SELECT ciphertext FROM provider_credentials WHERE provider = ?1",
                params![provider.trim()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(ciphertext)
    }

    /// Returns whether a credential was removed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_credential(&mut self, provider: &str) -> Result<bool, StoreError> {
        self.with_transaction(|tx| {
            let removed = tx.execute(
                "DELETE FROM provider_credentials WHERE provider = ?1",
                params![provider.trim()],
            )?;
            Ok(removed > 0)
        })
    }

    /// Providers with a stored credential, sorted.
    ///
    /// # Errors
    /// Returns an error when the read fails.
    pub fn list_credential_providers(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt =
            self.conn.prepare("SELECT provider FROM provider_credentials ORDER BY provider")?;
        let providers =
            stmt.query_map([], |row| row.get::<_, String>(0))?.collect::<Result<Vec<_>, _>>()?;
        Ok(providers)
    }
}

/// Validate, check invariants, and insert `candidate` on an open transaction.
///
/// Initial records get their self-referencing lineage root in a follow-up
/// update, so the caller's transaction MUST cover both statements.
pub(crate) fn insert_prompt_in(
    conn: &Connection,
    candidate: &NewPrompt,
) -> Result<PromptRecord, StoreError> {
    candidate.validate()?;

    if let Some(methodology_id) = candidate.methodology_id {
        if find_methodology(conn, methodology_id)?.is_none() {
            return Err(StoreError::not_found("methodology", methodology_id));
        }
    }

    let parent = match candidate.parent_id {
        Some(parent_id) => find_prompt(conn, parent_id)?,
        None => None,
    };
    check_invariants(candidate, parent.as_ref())?;

    if let Some(root) = candidate.lineage_root_id {
        if version_slot_taken(conn, root, candidate.version_number)? {
            return Err(uniqueness_violation(root, candidate.version_number).into());
        }
    }

    let now = format_timestamp(now_utc())?;
    let inserted = conn.execute(
        "INSERT INTO prompts(
            title, content, parent_id, methodology_id, change_kind,
            version_number, lineage_root_id, metadata_json, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            candidate.title,
            candidate.content,
            candidate.parent_id.map(|id| id.0),
            candidate.methodology_id.map(|id| id.0),
            candidate.change_kind.as_str(),
            i64::from(candidate.version_number),
            candidate.lineage_root_id.map(|id| id.0),
            serde_json::to_string(&candidate.metadata)?,
            now,
        ],
    );
    if let Err(err) = inserted {
        return Err(map_unique_violation(err, candidate));
    }

    let id = PromptId(conn.last_insert_rowid());
    if candidate.change_kind == ChangeKind::Initial {
        conn.execute("UPDATE prompts SET lineage_root_id = ?1 WHERE id = ?1", params![id.0])?;
    }

    let record = find_prompt(conn, id)?.ok_or_else(|| StoreError::not_found("prompt", id))?;
    let expected_root = candidate.lineage_root_id.unwrap_or(id);
    if record.lineage_root_id != Some(expected_root) {
        return Err(InvariantViolation::new(
            Invariant::LineageIdentity,
            format!("record {id} was stored without lineage root {expected_root}"),
        )
        .into());
    }

    debug!(
        id = %record.id,
        version = record.version_number,
        lineage_root = %expected_root,
        change_kind = record.change_kind.as_str(),
        "inserted prompt"
    );
    Ok(record)
}

pub(crate) fn find_prompt(conn: &Connection, id: PromptId) -> Result<Option<PromptRecord>, StoreError> {
    let sql = format!("SELECT {PROMPT_COLUMNS} FROM prompts WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![id.0])?;
    match rows.next()? {
        Some(row) => Ok(Some(read_prompt(row)?)),
        None => Ok(None),
    }
}

pub(crate) fn find_methodology(
    conn: &Connection,
    id: MethodologyId,
) -> Result<Option<MethodologyRecord>, StoreError> {
    let sql = format!("SELECT {METHODOLOGY_COLUMNS} FROM methodologies WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![id.0])?;
    match rows.next()? {
        Some(row) => Ok(Some(read_methodology(row)?)),
        None => Ok(None),
    }
}

pub(crate) fn read_prompt(row: &Row<'_>) -> Result<PromptRecord, StoreError> {
    let change_kind_raw: String = row.get(5)?;
    let change_kind = ChangeKind::parse(&change_kind_raw)
        .ok_or_else(|| StoreError::CorruptRow(format!("unknown change_kind {change_kind_raw:?}")))?;
    let version_raw: i64 = row.get(6)?;
    let version_number = u32::try_from(version_raw)
        .map_err(|_| StoreError::CorruptRow(format!("version_number out of range: {version_raw}")))?;
    let metadata_json: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(PromptRecord {
        id: PromptId(row.get(0)?),
        title: row.get(1)?,
        content: row.get(2)?,
        parent_id: row.get::<_, Option<i64>>(3)?.map(PromptId),
        methodology_id: row.get::<_, Option<i64>>(4)?.map(MethodologyId),
        change_kind,
        version_number,
        lineage_root_id: row.get::<_, Option<i64>>(7)?.map(PromptId),
        metadata: serde_json::from_str::<Value>(&metadata_json)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn read_methodology(row: &Row<'_>) -> Result<MethodologyRecord, StoreError> {
    let kind_raw: String = row.get(4)?;
    let kind = MethodologyKind::parse(&kind_raw)
        .ok_or_else(|| StoreError::CorruptRow(format!("unknown methodology kind {kind_raw:?}")))?;
    let examples_json: String = row.get(5)?;
    let samples_json: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(MethodologyRecord {
        id: MethodologyId(row.get(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        path: row.get(3)?,
        kind,
        examples: serde_json::from_str(&examples_json)?,
        prompt_samples: serde_json::from_str(&samples_json)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn version_slot_taken(conn: &Connection, root: PromptId, version: u32) -> Result<bool, StoreError> {
    let taken = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM prompts
            WHERE lineage_root_id = ?1 AND version_number = ?2
        )",
        params![root.0, i64::from(version)],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(taken == 1)
}

fn count_prompts(conn: &Connection) -> Result<usize, StoreError> {
    let count = conn.query_row("SELECT COUNT(*) FROM prompts", [], |row| row.get::<_, i64>(0))?;
    usize::try_from(count).map_err(|_| StoreError::CorruptRow(format!("negative row count {count}")))
}

fn uniqueness_violation(root: PromptId, version: u32) -> InvariantViolation {
    InvariantViolation::new(
        Invariant::VersionUniqueness,
        format!("lineage {root} already has a version {version}"),
    )
}

fn map_unique_violation(err: rusqlite::Error, candidate: &NewPrompt) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &err {
        if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            && message.contains("lineage_root_id")
        {
            if let Some(root) = candidate.lineage_root_id {
                return uniqueness_violation(root, candidate.version_number).into();
            }
        }
    }
    err.into()
}
