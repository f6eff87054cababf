use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use ledger_kernel_core::{SchemaVersion, StoreError, CURRENT_SCHEMA_VERSION};
use rusqlite::Transaction;

use crate::steps::BuiltinStep;

/// One structural transformation from `from_version()` to the next version.
///
/// Steps only ever run inside the migration envelope, which owns the transaction and
/// rolls it back if any step in the chain fails.
pub trait MigrationStep: Send + Sync {
    fn from_version(&self) -> SchemaVersion;

    fn to_version(&self) -> SchemaVersion {
        self.from_version() + 1
    }

    fn description(&self) -> &str;

    /// Apply the step's DDL and backfills.
    ///
    /// # Errors
    /// Returns an error when any statement of the step fails.
    fn apply(&self, tx: &Transaction<'_>) -> anyhow::Result<()>;
}

/// Migration steps keyed by `(from, to)`.
#[derive(Clone)]
pub struct MigrationRegistry {
    target: SchemaVersion,
    steps: BTreeMap<(SchemaVersion, SchemaVersion), Arc<dyn MigrationStep>>,
}

impl MigrationRegistry {
    #[must_use]
    pub fn new(target: SchemaVersion) -> Self {
        Self { target, steps: BTreeMap::new() }
    }

    /// Registry holding every built-in step up to [`CURRENT_SCHEMA_VERSION`].
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new(CURRENT_SCHEMA_VERSION);
        for step in BuiltinStep::ALL {
            registry.steps.insert((step.from_version(), step.to_version()), Arc::new(step));
        }
        registry
    }

    #[must_use]
    pub fn target_version(&self) -> SchemaVersion {
        self.target
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Add a step for a version pair that has none yet.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidMigrationChain`] when the step does not advance exactly
    /// one version, goes past the target, or its pair is already registered.
    pub fn register(&mut self, step: Arc<dyn MigrationStep>) -> Result<(), StoreError> {
        let key = self.checked_key(step.as_ref())?;
        if self.steps.contains_key(&key) {
            return Err(StoreError::InvalidMigrationChain(format!(
                "duplicate step for {}->{}",
                key.0, key.1
            )));
        }
        self.steps.insert(key, step);
        Ok(())
    }

    /// Swap the step registered for the same version pair, returning the previous one.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidMigrationChain`] under the same rules as [`Self::register`],
    /// except that the pair must already be present.
    pub fn replace(
        &mut self,
        step: Arc<dyn MigrationStep>,
    ) -> Result<Arc<dyn MigrationStep>, StoreError> {
        let key = self.checked_key(step.as_ref())?;
        match self.steps.insert(key, step) {
            Some(previous) => Ok(previous),
            None => {
                self.steps.remove(&key);
                Err(StoreError::InvalidMigrationChain(format!(
                    "no step registered for {}->{} to replace",
                    key.0, key.1
                )))
            }
        }
    }

    fn checked_key(
        &self,
        step: &dyn MigrationStep,
    ) -> Result<(SchemaVersion, SchemaVersion), StoreError> {
        let (from, to) = (step.from_version(), step.to_version());
        if to != from + 1 {
            return Err(StoreError::InvalidMigrationChain(format!(
                "step {from}->{to} must advance exactly one version"
            )));
        }
        if to > self.target {
            return Err(StoreError::InvalidMigrationChain(format!(
                "step {from}->{to} goes past target version {}",
                self.target
            )));
        }
        Ok((from, to))
    }

    /// Ordered steps that take a store from `from` to `to`.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidMigrationChain`] when the span is empty, reaches past the
    /// target, or has a gap.
    pub fn chain(
        &self,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> Result<Vec<&dyn MigrationStep>, StoreError> {
        if from >= to {
            return Err(StoreError::InvalidMigrationChain(format!(
                "from version {from} must be below to version {to}"
            )));
        }
        if to > self.target {
            return Err(StoreError::InvalidMigrationChain(format!(
                "to version {to} is past target version {}",
                self.target
            )));
        }

        (from..to)
            .map(|version| {
                self.steps.get(&(version, version + 1)).map(|step| &**step).ok_or_else(|| {
                    StoreError::InvalidMigrationChain(format!(
                        "missing step {version}->{}",
                        version + 1
                    ))
                })
            })
            .collect()
    }

    /// Confirm that an empty store can be brought all the way to the target.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidMigrationChain`] naming the first gap.
    pub fn validate(&self) -> Result<(), StoreError> {
        self.chain(0, self.target).map(|_| ())
    }
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Debug for MigrationRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRegistry")
            .field("target", &self.target)
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}
