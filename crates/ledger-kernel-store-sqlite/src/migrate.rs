use anyhow::Context;
use ledger_kernel_core::{SchemaVersion, StoreError};
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::registry::MigrationStep;
use crate::schema::{
    missing_element, now_rfc3339, record_schema_version, set_user_version,
    CREATE_SCHEMA_MIGRATIONS_SQL,
};
use crate::storage_error;

/// What one successful migration run did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub from_version: SchemaVersion,
    pub to_version: SchemaVersion,
    pub applied_versions: Vec<SchemaVersion>,
}

/// Run `steps` from `from` to `to` inside one immediate transaction.
///
/// Foreign-key enforcement is suspended for the run so table rebuilds do not cascade into
/// child tables, then restored whatever the outcome. The store's schema is validated
/// against the expected shape of `to` before commit; any failure leaves the connection
/// exactly as it was.
///
/// # Errors
/// - [`StoreError::InvalidMigrationChain`] when `steps` is not exactly `from..to`.
/// - [`StoreError::MigrationStepFailed`] naming the step that failed.
/// - [`StoreError::PostMigrationValidationFailed`] when the final shape is incomplete.
/// - [`StoreError::Storage`] for transaction or bookkeeping failures.
pub fn migrate(
    conn: &mut Connection,
    from: SchemaVersion,
    to: SchemaVersion,
    steps: &[&dyn MigrationStep],
) -> Result<MigrationOutcome, StoreError> {
    check_chain(from, to, steps)?;

    conn.pragma_update(None, "foreign_keys", false)
        .context("failed to suspend foreign keys for migration")
        .map_err(storage_error)?;
    let outcome = run_chain(conn, from, to, steps);
    let restored = conn
        .pragma_update(None, "foreign_keys", true)
        .context("failed to re-enable foreign keys after migration")
        .map_err(storage_error);

    let outcome = outcome?;
    restored?;
    tracing::info!(
        from = outcome.from_version,
        to = outcome.to_version,
        applied = outcome.applied_versions.len(),
        "schema migrated"
    );
    Ok(outcome)
}

fn check_chain(
    from: SchemaVersion,
    to: SchemaVersion,
    steps: &[&dyn MigrationStep],
) -> Result<(), StoreError> {
    if from >= to {
        return Err(StoreError::InvalidMigrationChain(format!(
            "from version {from} must be below to version {to}"
        )));
    }
    let expected = (to - from) as usize;
    if steps.len() != expected {
        return Err(StoreError::InvalidMigrationChain(format!(
            "{from}->{to} needs {expected} steps, got {}",
            steps.len()
        )));
    }
    for (version, step) in (from..to).zip(steps) {
        if step.from_version() != version || step.to_version() != version + 1 {
            return Err(StoreError::InvalidMigrationChain(format!(
                "expected step {version}->{}, got {}->{}",
                version + 1,
                step.from_version(),
                step.to_version()
            )));
        }
    }
    Ok(())
}

fn run_chain(
    conn: &mut Connection,
    from: SchemaVersion,
    to: SchemaVersion,
    steps: &[&dyn MigrationStep],
) -> Result<MigrationOutcome, StoreError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("failed to begin migration transaction")
        .map_err(storage_error)?;
    tx.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")
        .map_err(storage_error)?;

    for step in steps {
        tracing::debug!(
            from = step.from_version(),
            to = step.to_version(),
            description = step.description(),
            "applying migration step"
        );
        step.apply(&tx).map_err(|err| StoreError::MigrationStepFailed {
            from: step.from_version(),
            to: step.to_version(),
            cause: format!("{err:#}"),
        })?;
    }

    if let Some(missing) = missing_element(&tx, to).map_err(storage_error)? {
        return Err(StoreError::PostMigrationValidationFailed { version: to, missing });
    }

    let applied_at = now_rfc3339().map_err(storage_error)?;
    if from > 0 {
        record_schema_version(&tx, from, &applied_at).map_err(storage_error)?;
    }
    let applied_versions: Vec<SchemaVersion> = ((from + 1)..=to).collect();
    for version in &applied_versions {
        record_schema_version(&tx, *version, &applied_at).map_err(storage_error)?;
    }
    set_user_version(&tx, to).map_err(storage_error)?;

    tx.commit().context("failed to commit migration").map_err(storage_error)?;
    Ok(MigrationOutcome { from_version: from, to_version: to, applied_versions })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::{anyhow, Result};
    use ledger_kernel_core::{CheckName, CURRENT_SCHEMA_VERSION};
    use rusqlite::Transaction;

    use super::*;
    use crate::registry::MigrationRegistry;
    use crate::schema::detect_stored_version;

    struct FailingStep(SchemaVersion);

    impl MigrationStep for FailingStep {
        fn from_version(&self) -> SchemaVersion {
            self.0
        }

        fn description(&self) -> &str {
            "always fails"
        }

        fn apply(&self, tx: &Transaction<'_>) -> anyhow::Result<()> {
            tx.execute_batch("CREATE TABLE half_done (id INTEGER PRIMARY KEY);")?;
            Err(anyhow!("disk said no"))
        }
    }

    struct SkipsItsDdl(SchemaVersion);

    impl MigrationStep for SkipsItsDdl {
        fn from_version(&self) -> SchemaVersion {
            self.0
        }

        fn description(&self) -> &str {
            "forgets to alter anything"
        }

        fn apply(&self, _tx: &Transaction<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn seeded_v1() -> Result<Connection> {
        let mut conn = Connection::open_in_memory()?;
        let registry = MigrationRegistry::builtin();
        migrate(&mut conn, 0, 1, &registry.chain(0, 1)?)?;
        conn.execute_batch(
            "INSERT INTO categories (id, name, type) VALUES (1, '餐饮', 0);
             INSERT INTO accounts (id, name, balance) VALUES (1, 'cash', 500.0);
             INSERT INTO transactions (id, amount, categoryId, accountId, date, note, isIncome)
               VALUES (1, 12.5, 1, 1, 1700000000000, 'lunch', 0);",
        )?;
        Ok(conn)
    }

    #[test]
    fn empty_store_migrates_to_current_and_records_every_version() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        let registry = MigrationRegistry::builtin();
        let outcome =
            migrate(&mut conn, 0, CURRENT_SCHEMA_VERSION, &registry.chain(0, CURRENT_SCHEMA_VERSION)?)?;

        assert_eq!(outcome.applied_versions, (1..=CURRENT_SCHEMA_VERSION).collect::<Vec<_>>());
        assert_eq!(detect_stored_version(&conn)?, (CURRENT_SCHEMA_VERSION, false));
        let user_version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        assert_eq!(user_version, CURRENT_SCHEMA_VERSION);
        let foreign_keys: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        assert_eq!(foreign_keys, 1);
        Ok(())
    }

    #[test]
    fn v1_to_v6_keeps_rows_and_fills_defaults() -> Result<()> {
        let mut conn = seeded_v1()?;
        let registry = MigrationRegistry::builtin();
        migrate(&mut conn, 1, 6, &registry.chain(1, 6)?)?;

        let (name, level): (String, i64) =
            conn.query_row("SELECT name, level FROM categories WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
        assert_eq!(name, "餐饮");
        assert_eq!(level, 0);

        let row: (String, Option<i64>, i64, i64, i64) = conn.query_row(
            "SELECT note, toAccountId, createdBy, createdAt, isPrivate FROM transactions WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;
        assert_eq!(row, ("lunch".to_string(), None, 0, 1_700_000_000_000, 0));
        assert_eq!(detect_stored_version(&conn)?, (6, false));
        Ok(())
    }

    #[test]
    fn every_supported_version_reaches_current_without_violations() -> Result<()> {
        let registry = MigrationRegistry::builtin();
        for from in 1..CURRENT_SCHEMA_VERSION {
            let mut conn = seeded_v1()?;
            if from > 1 {
                migrate(&mut conn, 1, from, &registry.chain(1, from)?)?;
            }
            migrate(&mut conn, from, CURRENT_SCHEMA_VERSION, &registry.chain(from, CURRENT_SCHEMA_VERSION)?)?;

            let violations: Vec<_> = crate::integrity::check_all(&conn)?
                .into_iter()
                .filter(|result| result.check_name != CheckName::DurabilityMode && !result.passed)
                .collect();
            assert!(violations.is_empty(), "from v{from}: {violations:?}");
            assert_eq!(detect_stored_version(&conn)?, (CURRENT_SCHEMA_VERSION, false));
        }
        Ok(())
    }

    #[test]
    fn failed_step_rolls_back_everything() -> Result<()> {
        let mut conn = seeded_v1()?;
        let mut registry = MigrationRegistry::builtin();
        registry.replace(Arc::new(FailingStep(3)))?;

        let Err(err) = migrate(&mut conn, 1, 5, &registry.chain(1, 5)?) else {
            return Err(anyhow!("migration through a failing step should fail"));
        };
        let StoreError::MigrationStepFailed { from, to, cause } = err else {
            return Err(anyhow!("unexpected error: {err}"));
        };
        assert_eq!((from, to), (3, 4));
        assert!(cause.contains("disk said no"));

        assert_eq!(detect_stored_version(&conn)?, (1, false));
        assert!(!crate::schema::table_exists(&conn, "transaction_tags")?);
        assert!(!crate::schema::table_exists(&conn, "half_done")?);
        let notes: i64 = conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
        assert_eq!(notes, 1);
        Ok(())
    }

    #[test]
    fn step_that_leaves_shape_incomplete_fails_validation() -> Result<()> {
        let mut conn = seeded_v1()?;
        let mut registry = MigrationRegistry::builtin();
        registry.replace(Arc::new(SkipsItsDdl(2)))?;

        let Err(err) = migrate(&mut conn, 1, 3, &registry.chain(1, 3)?) else {
            return Err(anyhow!("incomplete shape should fail validation"));
        };
        assert_eq!(
            err,
            StoreError::PostMigrationValidationFailed {
                version: 3,
                missing: "column categories.parentId".to_string()
            }
        );
        assert_eq!(detect_stored_version(&conn)?, (1, false));
        Ok(())
    }

    #[test]
    fn rejects_steps_that_do_not_match_the_span() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        let registry = MigrationRegistry::builtin();
        let steps = registry.chain(0, 2)?;

        assert!(matches!(
            migrate(&mut conn, 0, 3, &steps),
            Err(StoreError::InvalidMigrationChain(_))
        ));
        assert!(matches!(
            migrate(&mut conn, 1, 3, &steps),
            Err(StoreError::InvalidMigrationChain(_))
        ));
        assert!(matches!(migrate(&mut conn, 2, 2, &[]), Err(StoreError::InvalidMigrationChain(_))));
        Ok(())
    }
}
