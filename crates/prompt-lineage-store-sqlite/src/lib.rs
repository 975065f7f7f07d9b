use std::collections::BTreeSet;
use std::path::Path;

use prompt_lineage_core::{format_timestamp, now_utc};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

mod engine;
mod error;
mod lineage;
mod ops;
mod query;
mod records;
mod registry;

pub use engine::{
    ContinueOnFailure, FailureHandler, MigrationEngine, MigrationFailure, MigrationReport,
    RecoveryDecision, ResetOnFailure, UnitOutcome, UnitState,
};
pub use error::StoreError;
pub use lineage::{LineageManager, SaveMode};
pub use ops::{
    ExportFileDigest, ExportManifest, ForeignKeyViolation, IntegrityReport, LineageIssue,
    MANIFEST_FILE, METHODOLOGIES_EXPORT_FILE, PROMPTS_EXPORT_FILE,
};
pub use records::DeleteSummary;
pub use registry::{MigrationRegistry, MigrationUnit, RegistryError, INDEX_FILE};

const LEDGER_TABLE: &str = "schema_migrations";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
    Memory,
}

impl JournalMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Memory => "MEMORY",
        }
    }
}

/// Connection settings applied on open.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreOptions {
    pub busy_timeout_ms: u32,
    pub journal_mode: JournalMode,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { busy_timeout_ms: 5000, journal_mode: JournalMode::Wal }
    }
}

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub applied: Vec<String>,
    pub pending: Vec<String>,
    /// Ledger entries the current registry does not know about.
    pub unknown: Vec<String>,
    pub up_to_date: bool,
}

impl SqliteStore {
    /// Open a SQLite-backed prompt store with the default runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_options(path, &StoreOptions::default())
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_options(path: &Path, options: &StoreOptions) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            options.journal_mode.as_str(),
            options.busy_timeout_ms
        ))?;
        debug!(path = %path.display(), journal_mode = options.journal_mode.as_str(), "opened prompt store");
        Ok(Self { conn })
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// Commits when `f` returns `Ok`; any error rolls every write back.
    ///
    /// # Errors
    /// Returns the error produced by `f`, or a storage error from begin/commit.
    pub fn with_transaction<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Apply the bundled migration units, continuing past failures.
    ///
    /// # Errors
    /// Returns [`StoreError::MigrationFailure`] for the first unit that failed.
    pub fn migrate(&mut self) -> Result<MigrationReport, StoreError> {
        let registry = MigrationRegistry::bundled()?;
        MigrationEngine::new(&registry).run(self, &mut ContinueOnFailure)?.into_result()
    }

    /// Compare the ledger against the bundled registry.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus, StoreError> {
        self.schema_status_for(&MigrationRegistry::bundled()?)
    }

    /// # Errors
    /// Returns an error when the ledger cannot be read.
    pub fn schema_status_for(&self, registry: &MigrationRegistry) -> Result<SchemaStatus, StoreError> {
        let applied = self.applied_migrations()?;
        let pending = registry
            .pending(&applied)
            .into_iter()
            .map(|unit| unit.name().to_string())
            .collect::<Vec<_>>();
        let unknown = applied
            .iter()
            .filter(|name| !registry.contains(name))
            .cloned()
            .collect::<Vec<_>>();

        Ok(SchemaStatus {
            up_to_date: pending.is_empty(),
            applied: applied.into_iter().collect(),
            pending,
            unknown,
        })
    }

    /// Units `registry` would apply, without opening a transaction.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be read.
    pub fn pending_migrations(
        &self,
        registry: &MigrationRegistry,
    ) -> Result<Vec<String>, StoreError> {
        Ok(MigrationEngine::new(registry)
            .pending(self)?
            .into_iter()
            .map(|unit| unit.name().to_string())
            .collect())
    }

    /// Names recorded in the migration ledger; empty before the ledger exists.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be read.
    pub fn applied_migrations(&self) -> Result<BTreeSet<String>, StoreError> {
        if !self.table_exists(LEDGER_TABLE)? {
            return Ok(BTreeSet::new());
        }

        let mut stmt = self.conn.prepare("SELECT name FROM schema_migrations ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(names)
    }

    /// Drop every table and view this store manages, including the ledger.
    ///
    /// Returns the dropped object names.
    ///
    /// # Errors
    /// Returns an error when a drop fails; the store is left unchanged in that case.
    pub fn reset_store(&mut self) -> Result<Vec<String>, StoreError> {
        self.conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        let dropped = self.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "SELECT type, name FROM sqlite_master
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
                 ORDER BY CASE type WHEN 'view' THEN 0 ELSE 1 END, name",
            )?;
            let objects = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);

            for (kind, name) in &objects {
                let keyword = if kind == "view" { "VIEW" } else { "TABLE" };
                tx.execute_batch(&format!("DROP {keyword} IF EXISTS {};", quote_identifier(name)))?;
            }
            Ok(objects.into_iter().map(|(_, name)| name).collect::<Vec<_>>())
        });
        let restored = self.conn.execute_batch("PRAGMA foreign_keys = ON;");

        let dropped = dropped?;
        restored?;
        warn!(objects = ?dropped, "dropped all managed store objects");
        Ok(dropped)
    }

    pub(crate) fn apply_unit(&mut self, unit: &MigrationUnit) -> Result<(), StoreError> {
        self.with_transaction(|tx| {
            tx.execute_batch(unit.sql())?;
            if tx.is_autocommit() {
                return Err(StoreError::MigrationFailure {
                    unit: unit.name().to_string(),
                    message: "unit ended the migration transaction".to_string(),
                });
            }
            tx.execute(
                "INSERT INTO schema_migrations(name, applied_at) VALUES (?1, ?2)",
                params![unit.name(), format_timestamp(now_utc())?],
            )?;
            Ok(())
        })
    }

    pub(crate) fn table_exists(&self, table_name: &str) -> Result<bool, StoreError> {
        table_exists(&self.conn, table_name)
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, StoreError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table_name],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(exists == 1)
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
