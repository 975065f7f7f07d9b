use std::path::PathBuf;

use prompt_lineage_core::{InvariantViolation, PromptId, TransformError, ValidationError};

use crate::registry::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    InvariantViolation(#[from] InvariantViolation),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("latest record {0} disappeared before it could be used as a parent")]
    ParentNotFound(PromptId),
    #[error("migration unit {unit} failed: {message}")]
    MigrationFailure { unit: String, message: String },
    #[error(transparent)]
    TransformFailure(#[from] TransformError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("timestamp error: {0}")]
    Timestamp(String),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

impl StoreError {
    /// Stable machine-readable category, used in CLI error envelopes.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::NotFound { .. } => "not_found",
            Self::ParentNotFound(_) => "parent_not_found",
            Self::MigrationFailure { .. } => "migration_failure",
            Self::TransformFailure(_) => "transform_failure",
            Self::Registry(_) => "registry",
            Self::Sqlite(_) => "storage",
            Self::Io { .. } => "io",
            Self::Serialization(_) => "serialization",
            Self::Timestamp(_) => "timestamp",
            Self::CorruptRow(_) => "corrupt_row",
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

impl From<time::error::Format> for StoreError {
    fn from(value: time::error::Format) -> Self {
        Self::Timestamp(value.to_string())
    }
}

impl From<time::error::Parse> for StoreError {
    fn from(value: time::error::Parse) -> Self {
        Self::Timestamp(value.to_string())
    }
}
