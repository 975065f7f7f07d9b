use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use prompt_lineage_core::{format_timestamp, now_utc, PromptId, PromptRecord};
use rusqlite::DatabaseName;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::records::{read_prompt, PROMPT_COLUMNS};
use crate::{
    ContinueOnFailure, FailureHandler, MigrationEngine, MigrationRegistry, MigrationReport, SchemaStatus,
    SqliteStore, StoreError,
};

pub const PROMPTS_EXPORT_FILE: &str = "prompts.ndjson";
pub const METHODOLOGIES_EXPORT_FILE: &str = "methodologies.ndjson";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub applied_migrations: Vec<String>,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

/// A stored lineage that breaks one of the versioning rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineageIssue {
    pub lineage_root: PromptId,
    pub record: PromptId,
    pub problem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub lineage_issues: Vec<LineageIssue>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Write every prompt and methodology as NDJSON plus a digest manifest.
    ///
    /// Credential ciphertexts are not exported.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest, StoreError> {
        fs::create_dir_all(out_dir).map_err(|source| StoreError::io(out_dir, source))?;

        let prompts = self.all_prompts()?;
        let methodologies = self.list_methodologies(None)?;

        let prompt_digest = write_ndjson_file(&out_dir.join(PROMPTS_EXPORT_FILE), &prompts)?;
        let methodology_digest =
            write_ndjson_file(&out_dir.join(METHODOLOGIES_EXPORT_FILE), &methodologies)?;

        let manifest = ExportManifest {
            applied_migrations: self.applied_migrations()?.into_iter().collect(),
            exported_at: format_timestamp(now_utc())?,
            files: vec![
                ExportFileDigest {
                    path: PROMPTS_EXPORT_FILE.to_string(),
                    sha256: prompt_digest.0,
                    records: prompt_digest.1,
                },
                ExportFileDigest {
                    path: METHODOLOGIES_EXPORT_FILE.to_string(),
                    sha256: methodology_digest.0,
                    records: methodology_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join(MANIFEST_FILE);
        let manifest_json = serde_json::to_vec_pretty(&manifest)?;
        fs::write(&manifest_path, manifest_json)
            .map_err(|source| StoreError::io(&manifest_path, source))?;

        info!(
            dir = %out_dir.display(),
            prompts = prompts.len(),
            methodologies = methodologies.len(),
            "exported snapshot"
        );
        Ok(manifest)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<(), StoreError> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::io(parent, source))?;
        }

        self.conn.backup(DatabaseName::Main, out_file, None)?;
        info!(path = %out_file.display(), "created database backup");
        Ok(())
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<(), StoreError> {
        let registry = MigrationRegistry::bundled()?;
        self.restore_database_with(in_file, &registry, &mut ContinueOnFailure)?.into_result()?;
        Ok(())
    }

    /// Restore from a backup file, then bring it up to `registry`.
    ///
    /// Unit failures after the restore go to `handler` and are reported in the
    /// returned [`MigrationReport`], as with [`MigrationEngine::run`].
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, the restore fails, or
    /// the ledger of the restored database cannot be read.
    pub fn restore_database_with(
        &mut self,
        in_file: &Path,
        registry: &MigrationRegistry,
        handler: &mut dyn FailureHandler,
    ) -> Result<MigrationReport, StoreError> {
        if !in_file.exists() {
            return Err(StoreError::io(
                in_file,
                std::io::Error::new(std::io::ErrorKind::NotFound, "backup file does not exist"),
            ));
        }

        self.conn.restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)?;
        info!(path = %in_file.display(), "restored database backup");
        MigrationEngine::new(registry).run(self, handler)
    }

    /// Run quick-check, foreign-key-check, the lineage audit and a schema status check.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, StoreError> {
        let quick_check_message: String =
            self.conn.query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))?;

        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let foreign_key_violations = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let lineage_issues =
            if self.table_exists("prompts")? { audit_lineages(&self.all_prompts()?) } else { Vec::new() };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            lineage_issues,
            schema_status: self.schema_status()?,
        })
    }

    fn all_prompts(&self) -> Result<Vec<PromptRecord>, StoreError> {
        let sql = format!("SELECT {PROMPT_COLUMNS} FROM prompts ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(read_prompt(row)?);
        }
        Ok(records)
    }
}

/// Check stored lineages: roots reference themselves, versions run 1..=n
/// without gaps, and surviving parent links point one version back in the
/// same lineage. Deleting a middle version leaves a gap that is reported here.
fn audit_lineages(records: &[PromptRecord]) -> Vec<LineageIssue> {
    let by_id = records.iter().map(|record| (record.id, record)).collect::<BTreeMap<_, _>>();
    let mut lineages: BTreeMap<PromptId, Vec<&PromptRecord>> = BTreeMap::new();
    let mut issues = Vec::new();

    for record in records {
        let root = record.effective_lineage_root();
        lineages.entry(root).or_default().push(record);

        if record.lineage_root_id.is_none() {
            issues.push(LineageIssue {
                lineage_root: root,
                record: record.id,
                problem: "lineage root was never resolved".to_string(),
            });
        }

        if let Some(parent) = record.parent_id.and_then(|id| by_id.get(&id)) {
            if parent.effective_lineage_root() != root {
                issues.push(LineageIssue {
                    lineage_root: root,
                    record: record.id,
                    problem: format!(
                        "parent {} belongs to lineage {}",
                        parent.id,
                        parent.effective_lineage_root()
                    ),
                });
            }
            if parent.version_number.saturating_add(1) != record.version_number {
                issues.push(LineageIssue {
                    lineage_root: root,
                    record: record.id,
                    problem: format!(
                        "version {} does not follow parent version {}",
                        record.version_number, parent.version_number
                    ),
                });
            }
        }
    }

    for (root, mut members) in lineages {
        members.sort_by_key(|record| (record.version_number, record.id));
        if !members.iter().any(|record| record.id == root) {
            // Root rows cascade away with their lineage; a survivor without one
            // means the cascade did not run.
            issues.push(LineageIssue {
                lineage_root: root,
                record: members[0].id,
                problem: "lineage root record is missing".to_string(),
            });
        }
        for (expected, record) in (1_u32..).zip(&members) {
            if record.version_number != expected {
                issues.push(LineageIssue {
                    lineage_root: root,
                    record: record.id,
                    problem: format!("expected version {expected}, found {}", record.version_number),
                });
                break;
            }
        }
    }

    issues
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize), StoreError> {
    let file = File::create(path).map_err(|source| StoreError::io(path, source))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value)?;
        writer.write_all(line.as_bytes()).map_err(|source| StoreError::io(path, source))?;
        writer.write_all(b"\n").map_err(|source| StoreError::io(path, source))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().map_err(|source| StoreError::io(path, source))?;
    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};

    use anyhow::{Context, Result};
    use prompt_lineage_core::MethodologyRecord;
    use rusqlite::params;
    use ulid::Ulid;

    use super::*;
    use crate::{LineageManager, SaveMode};

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    #[test]
    fn export_writes_ndjson_with_matching_digests() -> Result<()> {
        let mut store = migrated_store()?;
        let mut lineage = LineageManager::new(&mut store);
        lineage.save("first", SaveMode::Continue)?;
        lineage.save("second", SaveMode::Continue)?;
        store.put_credential("openai", b"sealed")?;

        let out_dir = std::env::temp_dir().join(format!("prompt-lineage-export-{}", Ulid::new()));
        let manifest = store.export_snapshot(&out_dir)?;
        assert_eq!(manifest.applied_migrations.len(), MigrationRegistry::bundled()?.len());

        let prompts_entry = manifest
            .files
            .iter()
            .find(|file| file.path == PROMPTS_EXPORT_FILE)
            .context("manifest is missing the prompts file")?;
        assert_eq!(prompts_entry.records, 2);

        let file = File::open(out_dir.join(PROMPTS_EXPORT_FILE))?;
        let mut hasher = Sha256::new();
        let mut parsed = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
            parsed.push(serde_json::from_str::<PromptRecord>(&line)?);
        }
        assert_eq!(format!("{:x}", hasher.finalize()), prompts_entry.sha256);
        assert_eq!(parsed[1].parent_id, Some(parsed[0].id));

        let methodologies = fs::read_to_string(out_dir.join(METHODOLOGIES_EXPORT_FILE))?;
        let first = methodologies.lines().next().context("no methodologies exported")?;
        serde_json::from_str::<MethodologyRecord>(first)?;
        assert!(!methodologies.contains("sealed"));

        fs::remove_dir_all(&out_dir)?;
        Ok(())
    }

    #[test]
    fn backup_and_restore_database_round_trip() -> Result<()> {
        let mut source = migrated_store()?;
        let saved = LineageManager::new(&mut source).save("backed up", SaveMode::Continue)?;

        let backup_file =
            std::env::temp_dir().join(format!("prompt-lineage-backup-{}.sqlite3", Ulid::new()));
        source.backup_database(&backup_file)?;

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        target.restore_database(&backup_file)?;
        assert_eq!(target.history(10)?, vec![saved]);
        assert!(target.schema_status()?.up_to_date);

        fs::remove_file(&backup_file)?;
        Ok(())
    }

    #[test]
    fn restore_migrates_with_the_given_registry_and_handler() -> Result<()> {
        let mut source = migrated_store()?;
        let saved = LineageManager::new(&mut source).save("backed up", SaveMode::Continue)?;
        let backup_file =
            std::env::temp_dir().join(format!("prompt-lineage-backup-{}.sqlite3", Ulid::new()));
        source.backup_database(&backup_file)?;

        let bundled = MigrationRegistry::bundled()?;
        let extended = MigrationRegistry::from_units(bundled.units().iter().cloned().chain([
            crate::MigrationUnit::new(
                "20990101000000_create_prompt_tags.sql",
                "CREATE TABLE prompt_tags (prompt_id INTEGER NOT NULL REFERENCES prompts(id), tag TEXT NOT NULL);",
            )?,
            crate::MigrationUnit::new(
                "20990101000100_broken.sql",
                "ALTER TABLE no_such_table ADD COLUMN extra TEXT;",
            )?,
        ]))?;

        let mut failed = Vec::new();
        let mut handler = |failure: &crate::MigrationFailure| {
            failed.push(failure.unit.clone());
            crate::RecoveryDecision::Continue
        };
        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        let report = target.restore_database_with(&backup_file, &extended, &mut handler)?;
        fs::remove_file(&backup_file)?;

        assert_eq!(report.applied(), vec!["20990101000000_create_prompt_tags.sql"]);
        assert_eq!(failed, vec!["20990101000100_broken.sql".to_string()]);
        assert!(!report.reset_performed);
        assert!(target.table_exists("prompt_tags")?);
        assert_eq!(target.history(10)?, vec![saved]);
        Ok(())
    }

    #[test]
    fn restore_from_missing_file_is_an_io_error() -> Result<()> {
        let mut store = migrated_store()?;
        let missing = std::env::temp_dir().join(format!("prompt-lineage-missing-{}.sqlite3", Ulid::new()));
        assert!(matches!(store.restore_database(&missing), Err(StoreError::Io { .. })));
        Ok(())
    }

    #[test]
    fn integrity_check_is_clean_after_normal_saves() -> Result<()> {
        let mut store = migrated_store()?;
        let mut lineage = LineageManager::new(&mut store);
        lineage.save("a", SaveMode::Continue)?;
        lineage.save("b", SaveMode::Continue)?;
        lineage.save("c", SaveMode::NewLineage)?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert!(report.lineage_issues.is_empty());
        assert!(report.schema_status.up_to_date);
        Ok(())
    }

    #[test]
    fn integrity_check_reports_version_gaps() -> Result<()> {
        let mut store = migrated_store()?;
        let mut lineage = LineageManager::new(&mut store);
        lineage.save("a", SaveMode::Continue)?;
        let b = lineage.save("b", SaveMode::Continue)?;
        store.conn.execute("UPDATE prompts SET version_number = 5 WHERE id = ?1", params![b.id.0])?;

        let issues = store.integrity_check()?.lineage_issues;
        assert!(issues.iter().any(|issue| issue.record == b.id));
        Ok(())
    }
}
