use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Companion file listing unit filenames for a migrations directory.
pub const INDEX_FILE: &str = "index.json";

const TIMESTAMP_DIGITS: usize = 14;
const UNIT_SUFFIX: &str = ".sql";

const BUNDLED_UNITS: &[(&str, &str)] = &[
    (
        "20240301120000_create_migration_ledger.sql",
        include_str!("../migrations/20240301120000_create_migration_ledger.sql"),
    ),
    (
        "20240301120100_create_methodologies.sql",
        include_str!("../migrations/20240301120100_create_methodologies.sql"),
    ),
    (
        "20240301120200_create_prompts.sql",
        include_str!("../migrations/20240301120200_create_prompts.sql"),
    ),
    (
        "20240315090000_seed_methodologies.sql",
        include_str!("../migrations/20240315090000_seed_methodologies.sql"),
    ),
    (
        "20240402100000_add_prompt_versioning.sql",
        include_str!("../migrations/20240402100000_add_prompt_versioning.sql"),
    ),
    (
        "20240420080000_create_provider_credentials.sql",
        include_str!("../migrations/20240420080000_create_provider_credentials.sql"),
    ),
    (
        "20240510090000_index_latest_prompt_view.sql",
        include_str!("../migrations/20240510090000_index_latest_prompt_view.sql"),
    ),
];

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid migration unit name {0:?}: expected <14-digit timestamp>_<description>.sql")]
    InvalidName(String),
    #[error("duplicate migration unit {0}")]
    Duplicate(String),
    #[error("migration unit {unit} contains transaction control statement {statement:?}")]
    TransactionControl { unit: String, statement: String },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse migration index {}: {source}", path.display())]
    Index {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A single schema change script, applied at most once per store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    name: String,
    sql: String,
}

impl MigrationUnit {
    /// # Errors
    /// Returns [`RegistryError`] when the name does not follow the unit naming
    /// rule or the script manages its own transaction.
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Result<Self, RegistryError> {
        let name = name.into();
        let sql = sql.into();
        validate_unit_name(&name)?;
        if let Some(statement) = find_transaction_control(&sql) {
            return Err(RegistryError::TransactionControl { unit: name, statement });
        }
        Ok(Self { name, sql })
    }

    /// Skips script validation so the engine's own guards can be exercised.
    #[cfg(test)]
    pub(crate) fn unchecked(name: &str, sql: &str) -> Self {
        Self { name: name.to_string(), sql: sql.to_string() }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn timestamp(&self) -> &str {
        &self.name[..TIMESTAMP_DIGITS]
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.name[TIMESTAMP_DIGITS + 1..self.name.len() - UNIT_SUFFIX.len()]
    }
}

/// Ordered, validated set of migration units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRegistry {
    units: Vec<MigrationUnit>,
}

impl MigrationRegistry {
    /// Units compiled into this crate.
    ///
    /// # Errors
    /// Returns [`RegistryError`] if a bundled unit is malformed.
    pub fn bundled() -> Result<Self, RegistryError> {
        Self::from_units(
            BUNDLED_UNITS
                .iter()
                .map(|(name, sql)| MigrationUnit::new(*name, *sql))
                .collect::<Result<Vec<_>, _>>()?,
        )
    }

    /// Sorts units by name, which orders them by timestamp.
    ///
    /// # Errors
    /// Returns [`RegistryError::Duplicate`] when two units share a name.
    pub fn from_units(units: impl IntoIterator<Item = MigrationUnit>) -> Result<Self, RegistryError> {
        let mut units = units.into_iter().collect::<Vec<_>>();
        units.sort_by(|left, right| left.name.cmp(&right.name));
        for pair in units.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(RegistryError::Duplicate(pair[0].name.clone()));
            }
        }
        Ok(Self { units })
    }

    /// Load the units named in `dir/index.json`.
    ///
    /// # Errors
    /// Returns [`RegistryError`] when the index or a listed unit cannot be read
    /// or fails validation.
    pub fn from_index_dir(dir: &Path) -> Result<Self, RegistryError> {
        let index_path = dir.join(INDEX_FILE);
        let bytes = fs::read(&index_path)
            .map_err(|source| RegistryError::Io { path: index_path.clone(), source })?;
        let names: Vec<String> = serde_json::from_slice(&bytes)
            .map_err(|source| RegistryError::Index { path: index_path, source })?;

        let mut units = Vec::with_capacity(names.len());
        for name in names {
            // Validate before touching the filesystem so index entries cannot
            // point outside the directory.
            validate_unit_name(&name)?;
            let unit_path = dir.join(&name);
            let sql = fs::read_to_string(&unit_path)
                .map_err(|source| RegistryError::Io { path: unit_path, source })?;
            units.push(MigrationUnit::new(name, sql)?);
        }

        Self::from_units(units)
    }

    #[must_use]
    pub fn units(&self) -> &[MigrationUnit] {
        &self.units
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.units.iter().any(|unit| unit.name == name)
    }

    /// Units not yet in `applied`, in application order.
    #[must_use]
    pub fn pending<'a>(&'a self, applied: &BTreeSet<String>) -> Vec<&'a MigrationUnit> {
        self.units.iter().filter(|unit| !applied.contains(&unit.name)).collect()
    }
}

fn validate_unit_name(name: &str) -> Result<(), RegistryError> {
    let invalid = || RegistryError::InvalidName(name.to_string());

    let stem = name.strip_suffix(UNIT_SUFFIX).ok_or_else(invalid)?;
    if stem.len() <= TIMESTAMP_DIGITS + 1 || !stem.is_char_boundary(TIMESTAMP_DIGITS) {
        return Err(invalid());
    }
    let (timestamp, rest) = stem.split_at(TIMESTAMP_DIGITS);
    if !timestamp.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(invalid());
    }
    let description = rest.strip_prefix('_').ok_or_else(invalid)?;
    if description.is_empty()
        || !description
            .bytes()
            .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'_')
    {
        return Err(invalid());
    }
    Ok(())
}

/// First statement that would open, close, or nest a transaction.
///
/// Trigger bodies are skipped: their `BEGIN ... END` is part of the
/// `CREATE [TEMP|TEMPORARY] TRIGGER` statement, not transaction control. Only
/// the leading keywords mark a trigger; a column named `trigger` does not.
fn find_transaction_control(sql: &str) -> Option<String> {
    let without_comments = sql
        .lines()
        .map(|line| line.split_once("--").map_or(line, |(code, _)| code))
        .collect::<Vec<_>>()
        .join("\n");

    let mut in_trigger = false;
    for statement in without_comments.split(';') {
        let mut words = statement.split_whitespace().map(str::to_ascii_uppercase);
        let Some(first) = words.next() else {
            continue;
        };

        if in_trigger {
            if first == "END" {
                in_trigger = false;
            }
            continue;
        }

        match first.as_str() {
            "CREATE" => {
                let mut object =
                    words.skip_while(|word| matches!(word.as_str(), "TEMP" | "TEMPORARY"));
                in_trigger = object.next().as_deref() == Some("TRIGGER");
            }
            "BEGIN" | "COMMIT" | "END" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" => {
                return Some(statement.split_whitespace().collect::<Vec<_>>().join(" "));
            }
            _ => {}
        }
    }
    None
}
