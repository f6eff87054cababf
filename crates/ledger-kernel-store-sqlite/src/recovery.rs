use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ledger_kernel_core::{IntegrityReport, StoreError, MIN_SUPPORTED_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};

use crate::backup::{remove_stale_staging, BackupHandle};
use crate::config::StoreConfig;
use crate::connection::Store;
use crate::migrate::MigrationOutcome;
use crate::registry::MigrationRegistry;
use crate::staging::{quarantine, sibling_path, staged_write};
use crate::storage_error;

/// Last state a session wrote to its marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Clean,
    Restoring,
}

impl SessionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Clean => "clean",
            Self::Restoring => "restoring",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "clean" => Some(Self::Clean),
            "restoring" => Some(Self::Restoring),
            _ => None,
        }
    }
}

/// `<db>.session`, rewritten atomically on open, close, and around restores.
#[derive(Debug, Clone)]
pub struct SessionMarker {
    path: PathBuf,
}

impl SessionMarker {
    #[must_use]
    pub fn for_store(db_path: &Path) -> Self {
        Self { path: sibling_path(db_path, ".session") }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no session ever ran. Unrecognised content counts as an open session.
    ///
    /// # Errors
    /// Returns an error when the marker exists but cannot be read.
    pub fn read(&self) -> Result<Option<SessionState>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(SessionState::parse(raw.trim()).unwrap_or_else(|| {
                tracing::warn!(path = %self.path.display(), "unrecognised session marker");
                SessionState::Open
            }))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read session marker {}", self.path.display())),
        }
    }

    /// # Errors
    /// Returns an error when the marker cannot be written.
    pub fn write(&self, state: SessionState) -> Result<()> {
        staged_write(&self.path, state.as_str().as_bytes())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartupOutcome {
    Ready,
    /// The store was damaged, moved aside, and rebuilt from a backup.
    Recovered { backup_id: String, quarantined: Option<PathBuf> },
    /// The store was damaged and no backup could be restored. It is now empty.
    DataLoss { cause: String, quarantined: Option<PathBuf> },
}

/// Everything startup found and did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartupReport {
    pub previous_session: Option<SessionState>,
    pub abnormal_shutdown: bool,
    pub stale_staging_removed: usize,
    pub outcome: StartupOutcome,
    pub pre_migration_backup: Option<BackupHandle>,
    pub migration: Option<MigrationOutcome>,
    pub integrity: IntegrityReport,
    pub scheduled_backup: Option<BackupHandle>,
}

impl StartupReport {
    /// # Errors
    /// Returns [`StoreError::DataLoss`] when startup had to recreate the store empty.
    pub fn ensure_no_data_loss(&self) -> Result<(), StoreError> {
        match &self.outcome {
            StartupOutcome::DataLoss { cause, .. } => {
                Err(StoreError::DataLoss { cause: cause.clone() })
            }
            StartupOutcome::Ready | StartupOutcome::Recovered { .. } => Ok(()),
        }
    }
}

/// Opens a store the way an application should at startup: detect a crashed or damaged
/// store, recover it from backups, migrate it, and check it.
#[derive(Debug, Clone)]
pub struct StoreBootstrap {
    config: StoreConfig,
    registry: MigrationRegistry,
}

impl StoreBootstrap {
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self::with_registry(config, MigrationRegistry::builtin())
    }

    #[must_use]
    pub fn with_registry(config: StoreConfig, registry: MigrationRegistry) -> Self {
        Self { config, registry }
    }

    /// # Errors
    /// - [`StoreError::WalUnavailable`] and [`StoreError::UnsupportedVersion`] are returned
    ///   as-is; recovery is not attempted for them.
    /// - [`StoreError::StoreUnopenable`] when the store is still unusable after recovery.
    /// - Migration and integrity errors from the opened store.
    pub fn open(self) -> Result<(Store, StartupReport), StoreError> {
        let marker = SessionMarker::for_store(&self.config.db_path);
        let previous_session = marker.read().map_err(storage_error)?;
        let abnormal_shutdown =
            matches!(previous_session, Some(SessionState::Open | SessionState::Restoring));
        if abnormal_shutdown {
            tracing::warn!(
                path = %self.config.db_path.display(),
                previous = ?previous_session,
                "previous session did not close cleanly"
            );
        }

        let backup_dir = self.config.backup_dir();
        let stale_staging_removed = remove_stale_staging(&backup_dir).unwrap_or_else(|err| {
            tracing::warn!(path = %backup_dir.display(), "failed to clear interrupted backups: {err:#}");
            0
        });

        let (store, outcome) = match self.open_and_probe() {
            Ok(store) => (store, StartupOutcome::Ready),
            Err(err) if err.is_hard_open_failure() => return Err(err),
            Err(err) => {
                tracing::warn!(path = %self.config.db_path.display(), "store failed its startup probe: {err}");
                let outcome = self.recover(&err.to_string())?;
                let store = self.open_and_probe().map_err(|err| {
                    StoreError::StoreUnopenable(format!("store still unusable after recovery: {err}"))
                })?;
                (store, outcome)
            }
        };

        let status = store.schema_status()?;
        let mut pre_migration_backup = None;
        if !status.is_current()
            && self.config.backup_before_migration
            && status.current_version >= MIN_SUPPORTED_SCHEMA_VERSION
        {
            match store.create_backup("pre-migration") {
                Ok(handle) => pre_migration_backup = Some(handle),
                Err(err) => tracing::warn!("pre-migration backup failed: {err}"),
            }
        }
        let migration = store.migrate_to_current()?;

        let integrity = store.run_integrity_pass()?;
        let scheduled_backup = match self.config.auto_backup_interval() {
            Some(interval) => store.create_backup_if_due(interval).unwrap_or_else(|err| {
                tracing::warn!("scheduled backup failed: {err}");
                None
            }),
            None => None,
        };

        let report = StartupReport {
            previous_session,
            abnormal_shutdown,
            stale_staging_removed,
            outcome,
            pre_migration_backup,
            migration,
            integrity,
            scheduled_backup,
        };
        Ok((store, report))
    }

    fn open_and_probe(&self) -> Result<Store, StoreError> {
        let store = Store::open_with_registry(self.config.clone(), self.registry.clone())?;
        match self.probe(&store) {
            Ok(()) => Ok(store),
            Err(err) => {
                store.abandon();
                Err(err)
            }
        }
    }

    fn probe(&self, store: &Store) -> Result<(), StoreError> {
        let report = store.quick_probe()?;
        if !report.quick_check_ok {
            return Err(StoreError::StoreUnopenable(format!(
                "quick_check failed: {}",
                report.quick_check_message
            )));
        }
        let stored = store.stored_version()?;
        let supported = self.registry.target_version();
        if stored > supported {
            return Err(StoreError::UnsupportedVersion { stored, supported });
        }
        Ok(())
    }

    /// Move the damaged store aside and rebuild it from the newest usable backup.
    fn recover(&self, cause: &str) -> Result<StartupOutcome, StoreError> {
        let db_path = &self.config.db_path;
        let quarantined =
            if db_path.exists() { quarantine(db_path).map_err(storage_error)? } else { None };
        if let Some(moved) = &quarantined {
            tracing::warn!(from = %db_path.display(), to = %moved.display(), "damaged store quarantined");
        }

        let store = Store::open_with_registry(self.config.clone(), self.registry.clone())?;
        store.migrate_to_current()?;

        for handle in store.list_backups()? {
            match store.restore_from_backup(&handle) {
                Ok(true) => {
                    tracing::info!(backup_id = %handle.id, "store recovered from backup");
                    store.close()?;
                    return Ok(StartupOutcome::Recovered { backup_id: handle.id, quarantined });
                }
                Ok(false) => {}
                Err(err) => tracing::warn!(backup_id = %handle.id, "restore failed: {err}"),
            }
        }

        tracing::error!(cause, "no usable backup; store recreated empty");
        store.close()?;
        Ok(StartupOutcome::DataLoss { cause: cause.to_string(), quarantined })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use ledger_kernel_core::CURRENT_SCHEMA_VERSION;

    use super::*;
    use crate::staging::remove_sidecars;

    fn config_in(dir: &Path) -> StoreConfig {
        StoreConfig::for_path(dir.join("ledger.sqlite3"))
    }

    fn account_count(store: &Store) -> Result<i64> {
        store.with_read_scope(|conn| -> Result<i64> {
            Ok(conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?)
        })
    }

    fn corrupt(path: &Path) -> Result<()> {
        remove_sidecars(path)?;
        fs::write(path, [0xa5_u8; 8192])?;
        Ok(())
    }

    #[test]
    fn fresh_store_opens_ready_at_current_version() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, report) = StoreBootstrap::new(config_in(dir.path())).open()?;

        assert_eq!(report.previous_session, None);
        assert!(!report.abnormal_shutdown);
        assert_eq!(report.outcome, StartupOutcome::Ready);
        assert!(report.pre_migration_backup.is_none());
        let Some(migration) = &report.migration else {
            return Err(anyhow!("a fresh store must be migrated"));
        };
        assert_eq!((migration.from_version, migration.to_version), (0, CURRENT_SCHEMA_VERSION));
        assert!(report.integrity.is_healthy());
        store.ensure_current()?;
        Ok(())
    }

    #[test]
    fn unclean_shutdown_is_reported_on_next_open() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, _) = StoreBootstrap::new(config_in(dir.path())).open()?;
        store.abandon();

        let (store, report) = StoreBootstrap::new(config_in(dir.path())).open()?;
        assert_eq!(report.previous_session, Some(SessionState::Open));
        assert!(report.abnormal_shutdown);
        assert_eq!(report.outcome, StartupOutcome::Ready);
        store.close()?;

        let (_store, report) = StoreBootstrap::new(config_in(dir.path())).open()?;
        assert_eq!(report.previous_session, Some(SessionState::Clean));
        assert!(!report.abnormal_shutdown);
        Ok(())
    }

    #[test]
    fn legacy_store_is_backed_up_then_migrated_with_balances_intact() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = Store::open(config_in(dir.path()))?;
            store.migrate_to(1)?;
            store.with_write_scope(|tx| -> Result<()> {
                tx.execute_batch(
                    "INSERT INTO accounts (id, name, balance) VALUES (1, 'cash', 200.0);
                     INSERT INTO transactions (amount, accountId, date, isIncome)
                       VALUES (500.0, 1, 1, 0), (300.0, 1, 2, 0);",
                )?;
                Ok(())
            })?;
            store.close()?;
        }

        let (store, report) = StoreBootstrap::new(config_in(dir.path())).open()?;
        let Some(backup) = &report.pre_migration_backup else {
            return Err(anyhow!("a pre-migration backup should have been taken"));
        };
        assert_eq!(backup.schema_version, 1);
        assert_eq!(backup.label, "pre-migration");
        assert_eq!(report.migration.as_ref().map(|outcome| outcome.from_version), Some(1));
        assert!(report.integrity.is_healthy());
        assert!(!report.integrity.repaired);

        let (balance, opening): (f64, f64) = store.with_read_scope(|conn| -> Result<_> {
            Ok(conn.query_row(
                "SELECT balance, openingBalance FROM accounts WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?)
        })?;
        assert!((balance - 200.0).abs() < 1e-9);
        assert!((opening - 1000.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn corrupted_store_is_recovered_from_latest_backup() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config_in(dir.path());
        let backup_id = {
            let (store, _) = StoreBootstrap::new(config.clone()).open()?;
            store.with_write_scope(|tx| -> Result<()> {
                tx.execute("INSERT INTO accounts (name) VALUES ('cash')", [])?;
                Ok(())
            })?;
            let handle = store.create_manual_backup("before crash")?;
            store.close()?;
            handle.id
        };
        corrupt(&config.db_path)?;

        let (store, report) = StoreBootstrap::new(config.clone()).open()?;
        let StartupOutcome::Recovered { backup_id: restored, quarantined } = &report.outcome else {
            return Err(anyhow!("expected recovery, got {:?}", report.outcome));
        };
        assert_eq!(restored, &backup_id);
        let Some(quarantined) = quarantined else {
            return Err(anyhow!("damaged file should have been moved aside"));
        };
        assert!(quarantined.exists());
        report.ensure_no_data_loss()?;
        assert_eq!(account_count(&store)?, 1);
        store.ensure_current()?;
        Ok(())
    }

    #[test]
    fn corrupted_store_without_backups_reports_data_loss() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config_in(dir.path());
        {
            let (store, _) = StoreBootstrap::new(config.clone()).open()?;
            store.close()?;
        }
        corrupt(&config.db_path)?;

        let (store, report) = StoreBootstrap::new(config).open()?;
        assert!(matches!(report.outcome, StartupOutcome::DataLoss { .. }));
        assert!(matches!(report.ensure_no_data_loss(), Err(StoreError::DataLoss { .. })));
        assert_eq!(account_count(&store)?, 0);
        store.ensure_current()?;
        Ok(())
    }

    #[test]
    fn newer_store_is_refused_without_recovery() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config_in(dir.path());
        {
            let (store, _) = StoreBootstrap::new(config.clone()).open()?;
            store.with_write_scope(|tx| -> Result<()> {
                tx.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (99, '2030-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })?;
            store.close()?;
        }

        let Err(err) = StoreBootstrap::new(config.clone()).open() else {
            return Err(anyhow!("a store from a newer build must be refused"));
        };
        assert_eq!(err, StoreError::UnsupportedVersion { stored: 99, supported: CURRENT_SCHEMA_VERSION });
        assert!(config.db_path.exists());
        Ok(())
    }

    #[test]
    fn marker_round_trips_and_tolerates_junk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let marker = SessionMarker::for_store(&dir.path().join("ledger.sqlite3"));
        assert_eq!(marker.read()?, None);
        marker.write(SessionState::Restoring)?;
        assert_eq!(marker.read()?, Some(SessionState::Restoring));
        fs::write(marker.path(), "???")?;
        assert_eq!(marker.read()?, Some(SessionState::Open));
        Ok(())
    }
}
