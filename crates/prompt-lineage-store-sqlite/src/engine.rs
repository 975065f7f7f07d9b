use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::registry::{MigrationRegistry, MigrationUnit};
use crate::{SqliteStore, StoreError};

/// Lifecycle of a single unit during a run: `Pending -> Applying -> Applied | Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Applying,
    Applied,
    Failed,
}

impl UnitState {
    fn settle(self, succeeded: bool) -> Self {
        match (self, succeeded) {
            (Self::Applying, true) => Self::Applied,
            (Self::Applying, false) => Self::Failed,
            (other, _) => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitOutcome {
    pub unit: String,
    pub state: UnitState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationFailure {
    pub unit: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub outcomes: Vec<UnitOutcome>,
    pub failures: Vec<MigrationFailure>,
    pub reset_performed: bool,
}

impl MigrationReport {
    #[must_use]
    pub fn applied(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.state == UnitState::Applied)
            .map(|outcome| outcome.unit.as_str())
            .collect()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.reset_performed
    }

    /// Turn the first recorded failure into an error.
    ///
    /// # Errors
    /// Returns [`StoreError::MigrationFailure`] when any unit failed.
    pub fn into_result(self) -> Result<Self, StoreError> {
        match self.failures.first() {
            Some(failure) => Err(StoreError::MigrationFailure {
                unit: failure.unit.clone(),
                message: failure.message.clone(),
            }),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryDecision {
    /// Drop every managed table and end the run.
    ResetStore,
    /// Leave the failed unit pending and move on to later units.
    Continue,
}

/// Decides what happens after a unit fails. Consulted once per failure.
pub trait FailureHandler {
    fn on_failure(&mut self, failure: &MigrationFailure) -> RecoveryDecision;
}

impl<F> FailureHandler for F
where
    F: FnMut(&MigrationFailure) -> RecoveryDecision,
{
    fn on_failure(&mut self, failure: &MigrationFailure) -> RecoveryDecision {
        self(failure)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContinueOnFailure;

impl FailureHandler for ContinueOnFailure {
    fn on_failure(&mut self, _failure: &MigrationFailure) -> RecoveryDecision {
        RecoveryDecision::Continue
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResetOnFailure;

impl FailureHandler for ResetOnFailure {
    fn on_failure(&mut self, _failure: &MigrationFailure) -> RecoveryDecision {
        RecoveryDecision::ResetStore
    }
}

/// Applies pending units from a registry, one transaction per unit.
#[derive(Debug, Clone, Copy)]
pub struct MigrationEngine<'r> {
    registry: &'r MigrationRegistry,
}

impl<'r> MigrationEngine<'r> {
    #[must_use]
    pub fn new(registry: &'r MigrationRegistry) -> Self {
        Self { registry }
    }

    /// Units the ledger has not recorded, in application order.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be read.
    pub fn pending(&self, store: &SqliteStore) -> Result<Vec<&'r MigrationUnit>, StoreError> {
        let applied = store.applied_migrations()?;
        Ok(self.registry.pending(&applied))
    }

    /// Apply every pending unit in order.
    ///
    /// A failed unit leaves no partial effects. The handler then chooses to
    /// continue with later units or reset the store, which ends the run.
    ///
    /// # Errors
    /// Returns an error only when the ledger cannot be read or a requested
    /// reset fails; unit failures are reported in the [`MigrationReport`].
    pub fn run(
        &self,
        store: &mut SqliteStore,
        handler: &mut dyn FailureHandler,
    ) -> Result<MigrationReport, StoreError> {
        let pending = self.pending(store)?;
        let mut report = MigrationReport::default();
        if pending.is_empty() {
            debug!("schema is up to date; no migration units pending");
            return Ok(report);
        }

        info!(pending = pending.len(), "applying migration units");
        for unit in pending {
            let state = UnitState::Applying;
            debug!(unit = unit.name(), ?state, "applying migration unit");
            let result = store.apply_unit(unit);
            let state = state.settle(result.is_ok());
            report.outcomes.push(UnitOutcome { unit: unit.name().to_string(), state });

            let Err(err) = result else {
                info!(unit = unit.name(), "applied migration unit");
                continue;
            };

            let failure = MigrationFailure { unit: unit.name().to_string(), message: err.to_string() };
            warn!(unit = unit.name(), error = %failure.message, "migration unit failed");
            let decision = handler.on_failure(&failure);
            report.failures.push(failure);

            match decision {
                RecoveryDecision::Continue => {
                    warn!(unit = unit.name(), "continuing with later migration units");
                }
                RecoveryDecision::ResetStore => {
                    let dropped = store.reset_store()?;
                    warn!(dropped = dropped.len(), "store reset after migration failure");
                    report.reset_performed = true;
                    break;
                }
            }
        }

        Ok(report)
    }
}
