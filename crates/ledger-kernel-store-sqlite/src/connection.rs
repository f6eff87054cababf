use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use anyhow::{anyhow, Context};
use ledger_kernel_core::{SchemaStatus, SchemaVersion, StoreError, CURRENT_SCHEMA_VERSION};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;
use crate::migrate::{migrate, MigrationOutcome};
use crate::recovery::{SessionMarker, SessionState};
use crate::registry::MigrationRegistry;
use crate::schema::detect_stored_version;
use crate::staging::{parent_dir, FileSnapshot};
use crate::storage_error;

/// Counters describing how the store's connections have been used.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStats {
    pub reader_pool_size: usize,
    pub readers_open: usize,
    pub read_scopes: u64,
    pub write_scopes: u64,
    pub checkpoints: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    read_scopes: AtomicU64,
    write_scopes: AtomicU64,
    checkpoints: AtomicU64,
}

/// A ledger store: one writer connection plus a pool of read-only connections, sequenced
/// by a single gate.
///
/// Any number of read scopes may be live at once while no write scope is; a write scope,
/// a migration, and a restore are each exclusive. Scopes are not reentrant: do not open a
/// scope while the same thread already holds one.
pub struct Store {
    path: PathBuf,
    config: StoreConfig,
    registry: MigrationRegistry,
    gate: RwLock<()>,
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Option<Connection>>>,
    next_reader: AtomicUsize,
    marker: SessionMarker,
    stats: StatCounters,
    closed: bool,
}

/// Shared access to a read-only connection. Dropping it releases the gate.
pub struct ReadScope<'a> {
    conn: MappedMutexGuard<'a, Connection>,
    _gate: RwLockReadGuard<'a, ()>,
}

impl Deref for ReadScope<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

/// Exclusive access to the writer connection. Dropping it releases the gate.
pub struct WriteScope<'a> {
    conn: MutexGuard<'a, Connection>,
    _gate: RwLockWriteGuard<'a, ()>,
}

impl Deref for WriteScope<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for WriteScope<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Store {
    /// Open (creating if needed) the store at `config.db_path` with the built-in steps.
    ///
    /// # Errors
    /// Returns [`StoreError::StoreUnopenable`] when the file cannot be opened as a
    /// database and [`StoreError::WalUnavailable`] when WAL cannot be enabled.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Self::open_with_registry(config, MigrationRegistry::builtin())
    }

    /// # Errors
    /// As [`Self::open`], plus [`StoreError::InvalidMigrationChain`] for a gapped registry.
    pub fn open_with_registry(
        config: StoreConfig,
        registry: MigrationRegistry,
    ) -> Result<Self, StoreError> {
        config.validate().map_err(|err| StoreError::StoreUnopenable(format!("{err:#}")))?;
        registry.validate()?;

        let path = config.db_path.clone();
        let dir = parent_dir(&path);
        fs::create_dir_all(&dir).map_err(|err| {
            StoreError::StoreUnopenable(format!("failed to create {}: {err}", dir.display()))
        })?;

        let writer = open_writer(&path, &config)?;
        let marker = SessionMarker::for_store(&path);
        marker.write(SessionState::Open).map_err(storage_error)?;

        let readers = (0..config.reader_pool_size).map(|_| Mutex::new(None)).collect();
        tracing::debug!(path = %path.display(), "store opened");
        Ok(Self {
            path,
            config,
            registry,
            gate: RwLock::new(()),
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
            marker,
            stats: StatCounters::default(),
            closed: false,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub(crate) fn marker(&self) -> &SessionMarker {
        &self.marker
    }

    /// Acquire a read scope, opening a pooled read-only connection on first use.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when a read-only connection cannot be opened.
    pub fn read(&self) -> Result<ReadScope<'_>, StoreError> {
        let gate = self.gate.read();
        let slots = self.readers.len();
        let start = self.next_reader.fetch_add(1, Ordering::Relaxed);
        let mut slot = (0..slots)
            .find_map(|offset| self.readers[(start + offset) % slots].try_lock())
            .unwrap_or_else(|| self.readers[start % slots].lock());

        if slot.is_none() {
            *slot = Some(open_reader(&self.path, &self.config).map_err(storage_error)?);
        }
        let conn = MutexGuard::try_map(slot, Option::as_mut)
            .map_err(|_| StoreError::Storage("reader slot is empty".to_string()))?;

        self.stats.read_scopes.fetch_add(1, Ordering::Relaxed);
        Ok(ReadScope { conn, _gate: gate })
    }

    /// Acquire the exclusive write scope.
    ///
    /// # Errors
    /// Never fails today; the signature leaves room for a closed store.
    pub fn write(&self) -> Result<WriteScope<'_>, StoreError> {
        let gate = self.gate.write();
        let conn = self.writer.lock();
        self.stats.write_scopes.fetch_add(1, Ordering::Relaxed);
        Ok(WriteScope { conn, _gate: gate })
    }

    /// Run `f` against a read-only connection.
    ///
    /// # Errors
    /// Propagates scope acquisition failures and whatever `f` returns.
    pub fn with_read_scope<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let scope = self.read()?;
        f(&scope)
    }

    /// Run `f` inside one immediate transaction on the writer, committing on `Ok` and
    /// rolling back otherwise.
    ///
    /// # Errors
    /// Propagates scope and transaction failures and whatever `f` returns.
    pub fn with_write_scope<T, E>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut scope = self.write()?;
        let tx = scope
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin write transaction")
            .map_err(storage_error)?;
        let value = f(&tx)?;
        tx.commit().context("failed to commit write transaction").map_err(storage_error)?;
        Ok(value)
    }

    #[must_use]
    pub fn connection_stats(&self) -> ConnectionStats {
        ConnectionStats {
            reader_pool_size: self.readers.len(),
            readers_open: self.readers.iter().filter(|slot| slot.lock().is_some()).count(),
            read_scopes: self.stats.read_scopes.load(Ordering::Relaxed),
            write_scopes: self.stats.write_scopes.load(Ordering::Relaxed),
            checkpoints: self.stats.checkpoints.load(Ordering::Relaxed),
        }
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus, StoreError> {
        self.with_read_scope(|conn| {
            let (version, inferred) = detect_stored_version(conn).map_err(storage_error)?;
            Ok(SchemaStatus::new(version, inferred))
        })
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when schema metadata cannot be read.
    pub fn stored_version(&self) -> Result<SchemaVersion, StoreError> {
        Ok(self.schema_status()?.current_version)
    }

    /// Fail unless the store is at exactly the version this build writes.
    ///
    /// # Errors
    /// Returns [`StoreError::UnsupportedVersion`] for older and newer stores alike.
    pub fn ensure_current(&self) -> Result<(), StoreError> {
        let stored = self.stored_version()?;
        if stored != CURRENT_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedVersion {
                stored,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }
        Ok(())
    }

    /// Bring the store to the registry's target version. `Ok(None)` when already there.
    ///
    /// # Errors
    /// See [`Self::migrate_to`].
    pub fn migrate_to_current(&self) -> Result<Option<MigrationOutcome>, StoreError> {
        self.migrate_to(self.registry.target_version())
    }

    /// Migrate forward to `target` inside a file snapshot envelope. On any failure the
    /// store file is put back exactly as it was before the call.
    ///
    /// # Errors
    /// - [`StoreError::UnsupportedVersion`] when the store is newer than the registry.
    /// - [`StoreError::InvalidMigrationChain`] for a target past the registry or below the
    ///   stored version.
    /// - Any error from [`migrate`].
    pub fn migrate_to(&self, target: SchemaVersion) -> Result<Option<MigrationOutcome>, StoreError> {
        let newest = self.registry.target_version();
        if target > newest {
            return Err(StoreError::InvalidMigrationChain(format!(
                "target version {target} is past the registry target {newest}"
            )));
        }
        if self.stored_version()? == target {
            return Ok(None);
        }

        self.with_file_envelope("pre-migration", |conn| {
            let (stored, _) = detect_stored_version(conn).map_err(storage_error)?;
            if stored > newest {
                return Err(StoreError::UnsupportedVersion { stored, supported: newest });
            }
            if stored > target {
                return Err(StoreError::InvalidMigrationChain(format!(
                    "cannot migrate down from {stored} to {target}"
                )));
            }
            if stored == target {
                return Ok(None);
            }
            let steps = self.registry.chain(stored, target)?;
            migrate(conn, stored, target, &steps).map(Some)
        })
    }

    /// Run `op` with the whole store to itself, against a checkpointed file that is put
    /// back byte for byte if `op` fails.
    pub(crate) fn with_file_envelope<T>(
        &self,
        label: &str,
        op: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _gate = self.gate.write();
        let mut writer = self.writer.lock();
        self.drain_readers();

        checkpoint(&writer).map_err(storage_error)?;
        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        let snapshot = FileSnapshot::capture(&self.path, label).map_err(storage_error)?;

        match op(&mut writer) {
            Ok(value) => {
                match checkpoint(&writer) {
                    Ok(()) => {
                        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => tracing::warn!("checkpoint after {label} failed: {err:#}"),
                }
                if let Err(err) = snapshot.discard() {
                    tracing::warn!("failed to remove {label} snapshot: {err:#}");
                }
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "{label} operation failed, restoring snapshot: {err}");
                self.roll_back_to(&mut writer, snapshot)?;
                Err(err)
            }
        }
    }

    fn roll_back_to(&self, writer: &mut Connection, snapshot: FileSnapshot) -> Result<(), StoreError> {
        let kept = |err: anyhow::Error| {
            StoreError::Storage(format!(
                "failed to roll back {}: {err:#}; pre-image kept at {}",
                self.path.display(),
                snapshot.image_path().display()
            ))
        };

        let placeholder = Connection::open_in_memory()
            .context("failed to open placeholder connection")
            .map_err(kept)?;
        let live = std::mem::replace(writer, placeholder);
        live.close()
            .map_err(|(_, err)| anyhow!(err).context("failed to close writer"))
            .map_err(kept)?;
        snapshot.restore().map_err(kept)?;
        *writer = open_writer(&self.path, &self.config)?;

        if let Err(err) = snapshot.discard() {
            tracing::warn!("failed to remove rolled-back snapshot: {err:#}");
        }
        Ok(())
    }

    fn drain_readers(&self) {
        for slot in &self.readers {
            *slot.lock() = None;
        }
    }

    /// Checkpoint, close every connection, and mark the session clean.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when the checkpoint or marker write fails.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.shutdown()
    }

    /// Drop without checkpointing or touching the session marker.
    pub(crate) fn abandon(mut self) {
        self.closed = true;
    }

    fn shutdown(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        for slot in &mut self.readers {
            *slot.get_mut() = None;
        }
        checkpoint(self.writer.get_mut()).map_err(storage_error)?;
        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.marker.write(SessionState::Clean).map_err(storage_error)?;
        tracing::debug!(path = %self.path.display(), "store closed cleanly");
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!(path = %self.path.display(), "store did not close cleanly: {err}");
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("reader_pool_size", &self.readers.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn open_writer(path: &Path, config: &StoreConfig) -> Result<Connection, StoreError> {
    let unopenable =
        |err: rusqlite::Error| StoreError::StoreUnopenable(format!("{}: {err}", path.display()));

    let conn = Connection::open(path).map_err(unopenable)?;
    conn.busy_timeout(config.busy_timeout()).map_err(unopenable)?;

    let journal_mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .map_err(unopenable)?;
    if !journal_mode.eq_ignore_ascii_case("wal") {
        return Err(StoreError::WalUnavailable { journal_mode });
    }

    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA synchronous = FULL;
         PRAGMA temp_store = MEMORY;",
    )
    .map_err(unopenable)?;
    Ok(conn)
}

fn open_reader(path: &Path, config: &StoreConfig) -> anyhow::Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )
    .with_context(|| format!("failed to open read-only connection to {}", path.display()))?;
    conn.busy_timeout(config.busy_timeout())
        .context("failed to set busy timeout on read-only connection")?;
    Ok(conn)
}

/// Fold the WAL back into the main file and truncate it.
pub(crate) fn checkpoint(conn: &Connection) -> anyhow::Result<()> {
    let busy: i64 = conn
        .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0))
        .context("failed to run PRAGMA wal_checkpoint(TRUNCATE)")?;
    if busy != 0 {
        return Err(anyhow!("wal checkpoint was blocked by another connection"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use anyhow::{anyhow, Result};
    use sha2::{Digest, Sha256};

    use super::*;
    use crate::registry::MigrationStep;

    fn store_in(dir: &Path) -> Result<Store> {
        Ok(Store::open(StoreConfig::for_path(dir.join("ledger.sqlite3")))?)
    }

    fn file_sha256(path: &Path) -> Result<String> {
        Ok(format!("{:x}", Sha256::digest(fs::read(path)?)))
    }

    struct RefusesPlanningTables;

    impl MigrationStep for RefusesPlanningTables {
        fn from_version(&self) -> SchemaVersion {
            3
        }

        fn description(&self) -> &str {
            "fails halfway through"
        }

        fn apply(&self, tx: &Transaction<'_>) -> anyhow::Result<()> {
            tx.execute_batch("CREATE TABLE saving_goals (id INTEGER PRIMARY KEY);")?;
            Err(anyhow!("simulated failure"))
        }
    }

    #[test]
    fn open_enables_wal_and_foreign_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(dir.path())?;
        let scope = store.write()?;
        let journal_mode: String = scope.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let foreign_keys: i64 = scope.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        let synchronous: i64 = scope.query_row("PRAGMA synchronous", [], |row| row.get(0))?;
        assert_eq!(journal_mode, "wal");
        assert_eq!(foreign_keys, 1);
        assert_eq!(synchronous, 2);
        Ok(())
    }

    #[test]
    fn garbage_file_is_unopenable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ledger.sqlite3");
        fs::write(&path, [0x5a_u8; 4096])?;

        let Err(err) = Store::open(StoreConfig::for_path(&path)) else {
            return Err(anyhow!("garbage file should not open"));
        };
        assert!(matches!(err, StoreError::StoreUnopenable(_)), "{err}");
        Ok(())
    }

    #[test]
    fn fresh_store_migrates_to_current_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(dir.path())?;
        assert_eq!(store.stored_version()?, 0);
        assert!(matches!(store.ensure_current(), Err(StoreError::UnsupportedVersion { .. })));

        let Some(outcome) = store.migrate_to_current()? else {
            return Err(anyhow!("fresh store should need migration"));
        };
        assert_eq!(outcome.to_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(store.migrate_to_current()?, None);
        store.ensure_current()?;
        assert!(!dir.path().join("ledger.sqlite3.pre-migration").exists());
        Ok(())
    }

    #[test]
    fn failed_migration_leaves_file_byte_identical() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ledger.sqlite3");
        {
            let store = Store::open(StoreConfig::for_path(&path))?;
            store.migrate_to(3)?;
            store.with_write_scope(|tx| -> Result<()> {
                tx.execute_batch(
                    "INSERT INTO accounts (id, name, balance) VALUES (1, 'cash', 10.0);
                     INSERT INTO transactions (amount, accountId, date, isIncome)
                       VALUES (10.0, 1, 1, 1);",
                )?;
                Ok(())
            })?;
            store.close()?;
        }
        let before = file_sha256(&path)?;

        let mut registry = MigrationRegistry::builtin();
        registry.replace(Arc::new(RefusesPlanningTables))?;
        let store = Store::open_with_registry(StoreConfig::for_path(&path), registry)?;
        let Err(err) = store.migrate_to_current() else {
            return Err(anyhow!("migration through a failing step should fail"));
        };
        assert!(matches!(err, StoreError::MigrationStepFailed { from: 3, to: 4, .. }), "{err}");
        assert_eq!(store.stored_version()?, 3);
        assert_eq!(file_sha256(&path)?, before);
        assert!(!dir.path().join("ledger.sqlite3.pre-migration").exists());

        let balance: f64 = store.with_read_scope(|conn| {
            conn.query_row("SELECT balance FROM accounts WHERE id = 1", [], |row| row.get(0))
                .map_err(|err| StoreError::Storage(err.to_string()))
        })?;
        assert!((balance - 10.0).abs() < f64::EPSILON);
        store.close()?;
        assert_eq!(file_sha256(&path)?, before);
        Ok(())
    }

    #[test]
    fn write_scope_rolls_back_on_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(dir.path())?;
        store.migrate_to_current()?;

        let result = store.with_write_scope(|tx| -> Result<()> {
            tx.execute("INSERT INTO accounts (name) VALUES ('ghost')", [])?;
            Err(anyhow!("abort"))
        });
        assert!(result.is_err());

        let count: i64 = store.with_read_scope(|conn| -> Result<i64> {
            Ok(conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?)
        })?;
        assert_eq!(count, 0);
        Ok(())
    }

    #[test]
    fn drop_checkpoints_and_marks_session_clean() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ledger.sqlite3");
        {
            let store = Store::open(StoreConfig::for_path(&path))?;
            store.migrate_to_current()?;
            store.with_write_scope(|tx| -> Result<()> {
                tx.execute("INSERT INTO accounts (name) VALUES ('cash')", [])?;
                Ok(())
            })?;
            assert_eq!(store.marker().read()?, Some(SessionState::Open));
        }

        let wal_len = fs::metadata(crate::staging::wal_path(&path)).map(|meta| meta.len()).unwrap_or(0);
        assert_eq!(wal_len, 0);
        assert_eq!(SessionMarker::for_store(&path).read()?, Some(SessionState::Clean));
        Ok(())
    }

    #[test]
    fn concurrent_readers_see_committed_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(dir.path())?;
        store.migrate_to_current()?;
        store.with_write_scope(|tx| -> Result<()> {
            for index in 0..20 {
                tx.execute("INSERT INTO accounts (name) VALUES (?1)", [format!("account-{index}")])?;
            }
            Ok(())
        })?;

        let counts = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        store.with_read_scope(|conn| -> Result<i64> {
                            Ok(conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?)
                        })
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|_| Err(anyhow!("reader panicked"))))
                .collect::<Result<Vec<_>>>()
        })?;

        assert!(counts.iter().all(|count| *count == 20));
        let stats = store.connection_stats();
        assert_eq!(stats.reader_pool_size, 4);
        assert!(stats.readers_open >= 1);
        assert!(stats.read_scopes >= 8);
        Ok(())
    }
}
