use prompt_lineage_core::{PromptId, PromptRecord};
use rusqlite::{params, Connection, OptionalExtension, Params};

use crate::records::{read_prompt, PROMPT_COLUMNS};
use crate::{SqliteStore, StoreError};

impl SqliteStore {
    /// Newest version of every lineage, most recently created first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn latest_per_lineage(&self) -> Result<Vec<PromptRecord>, StoreError> {
        let sql = format!(
            "SELECT {PROMPT_COLUMNS} FROM latest_prompt_per_lineage
             ORDER BY created_at DESC, id DESC"
        );
        collect_prompts(&self.conn, &sql, [])
    }

    /// Most recent records across all lineages.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn history(&self, limit: usize) -> Result<Vec<PromptRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {PROMPT_COLUMNS} FROM prompts
             ORDER BY created_at DESC, id DESC
             LIMIT ?1"
        );
        collect_prompts(&self.conn, &sql, params![limit])
    }

    /// Every version of one lineage in version order.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when the lineage has no records.
    pub fn by_lineage(&self, root: PromptId) -> Result<Vec<PromptRecord>, StoreError> {
        let sql = format!(
            "SELECT {PROMPT_COLUMNS} FROM prompts
             WHERE lineage_root_id = ?1
             ORDER BY version_number ASC, id ASC"
        );
        let records = collect_prompts(&self.conn, &sql, params![root.0])?;
        if records.is_empty() {
            return Err(StoreError::not_found("lineage", root));
        }
        Ok(records)
    }

    /// The record a plain save would continue from, if any.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn latest_prompt(&self) -> Result<Option<PromptRecord>, StoreError> {
        match latest_prompt_id_in(&self.conn)? {
            Some(id) => Ok(Some(self.get_prompt(id)?)),
            None => Ok(None),
        }
    }
}

pub(crate) fn latest_prompt_id_in(conn: &Connection) -> Result<Option<PromptId>, StoreError> {
    let id = conn
        .query_row(
            "SELECT id FROM prompts ORDER BY created_at DESC, id DESC LIMIT 1",
            [],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(id.map(PromptId))
}

const LATEST_IN_LINEAGE_SQL: &str = "SELECT id FROM prompts
     WHERE lineage_root_id = ?1
     ORDER BY version_number DESC, id DESC
     LIMIT 1";

pub(crate) fn latest_in_lineage_id_in(
    conn: &Connection,
    root: PromptId,
) -> Result<Option<PromptId>, StoreError> {
    let id = conn
        .query_row(LATEST_IN_LINEAGE_SQL, params![root.0], |row| row.get::<_, i64>(0))
        .optional()?;
    Ok(id.map(PromptId))
}

fn collect_prompts<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<PromptRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(read_prompt(row)?);
    }
    Ok(records)
}
