use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ledger_kernel_core::{
    EntityTable, SchemaVersion, StoreError, CURRENT_SCHEMA_VERSION, MIN_SUPPORTED_SCHEMA_VERSION,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::config::RetentionPolicy;
use crate::connection::Store;
use crate::migrate::migrate;
use crate::recovery::SessionState;
use crate::schema::{detect_stored_version, now_rfc3339, parse_rfc3339, quote_ident, table_columns};
use crate::staging::{staged_write, sync_dir};
use crate::storage_error;

pub const BACKUP_FORMAT_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.json";
const STAGING_PREFIX: &str = ".tmp-";
const BLOB_KEY: &str = "$blob";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupFileDigest {
    pub table: EntityTable,
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

/// `manifest.json` of a backup directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupManifest {
    pub format_version: u32,
    pub backup_id: String,
    pub label: String,
    pub schema_version: SchemaVersion,
    pub created_at: String,
    pub files: Vec<BackupFileDigest>,
    /// SHA-256 over every file entry, see [`manifest_digest`].
    pub digest: String,
}

/// A backup found on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupHandle {
    pub id: String,
    pub label: String,
    pub created_at: String,
    pub schema_version: SchemaVersion,
    pub path: PathBuf,
    pub digest: String,
}

impl BackupHandle {
    fn from_manifest(manifest: &BackupManifest, path: PathBuf) -> Self {
        Self {
            id: manifest.backup_id.clone(),
            label: manifest.label.clone(),
            created_at: manifest.created_at.clone(),
            schema_version: manifest.schema_version,
            path,
            digest: manifest.digest.clone(),
        }
    }
}

/// Digest binding a manifest to its file list: SHA-256 over one
/// `"<path> <sha256> <records>\n"` line per file, in manifest order.
#[must_use]
pub fn manifest_digest(files: &[BackupFileDigest]) -> String {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(format!("{} {} {}\n", file.path, file.sha256, file.records).as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn value_to_json(value: ValueRef<'_>) -> Result<Value> {
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => serde_json::Number::from_f64(number)
            .map(Value::Number)
            .ok_or_else(|| anyhow!("non-finite REAL value {number} cannot be exported"))?,
        ValueRef::Text(bytes) => Value::String(
            std::str::from_utf8(bytes).context("TEXT value is not valid UTF-8")?.to_string(),
        ),
        ValueRef::Blob(bytes) => {
            let mut object = Map::new();
            object.insert(BLOB_KEY.to_string(), Value::String(hex::encode(bytes)));
            Value::Object(object)
        }
    })
}

fn value_from_json(value: &Value) -> Result<SqlValue> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(flag) => Ok(SqlValue::Integer(i64::from(*flag))),
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                Ok(SqlValue::Integer(integer))
            } else {
                number
                    .as_f64()
                    .map(SqlValue::Real)
                    .ok_or_else(|| anyhow!("number {number} does not fit a SQLite value"))
            }
        }
        Value::String(text) => Ok(SqlValue::Text(text.clone())),
        Value::Object(object) => match (object.len(), object.get(BLOB_KEY)) {
            (1, Some(Value::String(encoded))) => {
                Ok(SqlValue::Blob(hex::decode(encoded).context("invalid hex in blob value")?))
            }
            _ => Err(anyhow!("unexpected object value {value}")),
        },
        Value::Array(_) => Err(anyhow!("unexpected array value {value}")),
    }
}

fn export_table(conn: &Connection, table: EntityTable, path: &Path) -> Result<BackupFileDigest> {
    let file = File::create(path)
        .with_context(|| format!("failed to create backup file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    let mut stmt = conn
        .prepare(&format!("SELECT * FROM {} ORDER BY rowid", quote_ident(table.as_str())))
        .with_context(|| format!("failed to prepare export of {table}"))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let mut rows = stmt.query([])?;

    let mut records = 0_usize;
    while let Some(row) = rows.next()? {
        let mut object = Map::new();
        for (index, column) in columns.iter().enumerate() {
            let value = value_to_json(row.get_ref(index)?)
                .with_context(|| format!("failed to export {table}.{column}"))?;
            object.insert(column.clone(), value);
        }
        let line = serde_json::to_string(&Value::Object(object))
            .context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .with_context(|| format!("failed to write backup file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        records += 1;
    }

    writer.flush().with_context(|| format!("failed to flush backup file {}", path.display()))?;
    writer
        .get_ref()
        .sync_all()
        .with_context(|| format!("failed to fsync backup file {}", path.display()))?;

    Ok(BackupFileDigest {
        table,
        path: table.file_name(),
        sha256: format!("{:x}", hasher.finalize()),
        records,
    })
}

/// Export every table present at the stored version inside one read transaction.
fn export_tables(conn: &Connection, dir: &Path) -> Result<(SchemaVersion, Vec<BackupFileDigest>)> {
    let tx = conn.unchecked_transaction().context("failed to begin export transaction")?;
    let (schema_version, _) = detect_stored_version(&tx)?;
    if schema_version < MIN_SUPPORTED_SCHEMA_VERSION {
        return Err(anyhow!("store has no schema to back up"));
    }

    let files = EntityTable::present_at(schema_version)
        .into_iter()
        .map(|table| export_table(&tx, table, &dir.join(table.file_name())))
        .collect::<Result<Vec<_>>>()?;
    tx.commit().context("failed to end export transaction")?;
    Ok((schema_version, files))
}

fn read_manifest(dir: &Path) -> Result<BackupManifest> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = fs::read(&path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn verify_backup_dir(dir: &Path) -> Result<BackupManifest> {
    let manifest = read_manifest(dir)?;
    if manifest.format_version != BACKUP_FORMAT_VERSION {
        return Err(anyhow!(
            "unsupported backup format version {}; expected {BACKUP_FORMAT_VERSION}",
            manifest.format_version
        ));
    }
    if !(MIN_SUPPORTED_SCHEMA_VERSION..=CURRENT_SCHEMA_VERSION).contains(&manifest.schema_version) {
        return Err(anyhow!(
            "unsupported backup schema version {}; supported range is {MIN_SUPPORTED_SCHEMA_VERSION}..={CURRENT_SCHEMA_VERSION}",
            manifest.schema_version
        ));
    }

    let mut seen = BTreeSet::new();
    for file in &manifest.files {
        if !seen.insert(file.table) {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
        if file.path != file.table.file_name() {
            return Err(anyhow!("manifest entry {} does not match table {}", file.path, file.table));
        }
        if file.table.introduced_in() > manifest.schema_version {
            return Err(anyhow!(
                "table {} does not exist at schema version {}",
                file.table,
                manifest.schema_version
            ));
        }
    }
    for required in EntityTable::present_at(manifest.schema_version) {
        if !seen.contains(&required) {
            return Err(anyhow!("manifest is missing required file entry: {}", required.file_name()));
        }
    }

    for expected in &manifest.files {
        let file_path = dir.join(&expected.path);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }
        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {}: expected {}, got {}",
                expected.path,
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {}: expected {}, got {}",
                expected.path,
                expected.records,
                actual_records
            ));
        }
    }

    let digest = manifest_digest(&manifest.files);
    if digest != manifest.digest {
        return Err(anyhow!("manifest digest mismatch: expected {}, got {digest}", manifest.digest));
    }
    Ok(manifest)
}

/// Check a backup's manifest, file digests, and record counts.
///
/// # Errors
/// Returns [`StoreError::RestoreValidationFailed`] describing the first problem.
pub fn verify_backup(handle: &BackupHandle) -> Result<BackupManifest, StoreError> {
    verify_backup_dir(&handle.path)
        .map_err(|err| StoreError::RestoreValidationFailed(format!("{err:#}")))
}

fn created_at_of(handle: &BackupHandle) -> Result<OffsetDateTime> {
    parse_rfc3339(&handle.created_at)
}

/// Backups under `backup_dir`, newest first. Unreadable entries are skipped with a
/// warning.
///
/// # Errors
/// Returns [`StoreError::Storage`] when the directory exists but cannot be listed.
pub fn list_backups(backup_dir: &Path) -> Result<Vec<BackupHandle>, StoreError> {
    list_backup_dir(backup_dir).map_err(storage_error)
}

fn list_backup_dir(backup_dir: &Path) -> Result<Vec<BackupHandle>> {
    if !backup_dir.exists() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in fs::read_dir(backup_dir)
        .with_context(|| format!("failed to list backups in {}", backup_dir.display()))?
    {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        let path = entry.path();
        let handle = match read_manifest(&path) {
            Ok(manifest) => BackupHandle::from_manifest(&manifest, path),
            Err(err) => {
                tracing::warn!(path = %path.display(), "skipping unreadable backup: {err:#}");
                continue;
            }
        };
        match created_at_of(&handle) {
            Ok(created_at) => found.push((created_at, handle)),
            Err(err) => {
                tracing::warn!(path = %handle.path.display(), "skipping backup with bad timestamp: {err:#}");
            }
        }
    }

    found.sort_by(|left, right| right.0.cmp(&left.0).then_with(|| right.1.id.cmp(&left.1.id)));
    Ok(found.into_iter().map(|(_, handle)| handle).collect())
}

/// Delete backups the policy no longer keeps, oldest first. The newest backup always
/// survives. Returns the ids removed.
///
/// # Errors
/// Returns an error when listing or deleting fails.
pub fn prune_backups(
    backup_dir: &Path,
    policy: RetentionPolicy,
    now: OffsetDateTime,
) -> Result<Vec<String>> {
    let backups = list_backup_dir(backup_dir)?;
    let max_age = policy.max_age_days.map(|days| Duration::from_secs(days.saturating_mul(86_400)));

    let mut removed = Vec::new();
    for (index, handle) in backups.iter().enumerate().skip(1).rev() {
        let over_count = index >= policy.max_count;
        let too_old = match max_age {
            Some(max_age) => now - created_at_of(handle)? > max_age,
            None => false,
        };
        if over_count || too_old {
            fs::remove_dir_all(&handle.path)
                .with_context(|| format!("failed to remove backup {}", handle.path.display()))?;
            tracing::info!(backup_id = %handle.id, "pruned backup");
            removed.push(handle.id.clone());
        }
    }
    Ok(removed)
}

/// Whether the newest backup is at least `interval` old, or there is none.
///
/// # Errors
/// Returns an error when the directory cannot be listed.
pub fn backup_due(backup_dir: &Path, interval: Duration, now: OffsetDateTime) -> Result<bool> {
    let Some(newest) = list_backup_dir(backup_dir)?.into_iter().next() else {
        return Ok(true);
    };
    Ok(now - created_at_of(&newest)? >= interval)
}

/// Remove `.tmp-*` directories left by interrupted backups. Returns how many were removed.
///
/// # Errors
/// Returns an error when the directory cannot be listed or an entry cannot be removed.
pub fn remove_stale_staging(backup_dir: &Path) -> Result<usize> {
    if !backup_dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(backup_dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
            let path = entry.path();
            tracing::warn!(path = %path.display(), "removing interrupted backup");
            fs::remove_dir_all(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn import_table(conn: &Connection, table: EntityTable, path: &Path) -> Result<usize> {
    let columns = table_columns(conn, table.as_str())?;
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;

    let mut imported = 0;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let row: Map<String, Value> = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        if row.is_empty() {
            return Err(anyhow!("row {} of {} has no columns", index + 1, path.display()));
        }
        if let Some(unknown) = row.keys().find(|name| !columns.contains(name)) {
            return Err(anyhow!("row {} of {} has unknown column {unknown}", index + 1, path.display()));
        }

        let names = row.keys().map(|name| quote_ident(name)).collect::<Vec<_>>().join(", ");
        let placeholders = (1..=row.len()).map(|n| format!("?{n}")).collect::<Vec<_>>().join(", ");
        let sql =
            format!("INSERT INTO {} ({names}) VALUES ({placeholders})", quote_ident(table.as_str()));
        let values = row.values().map(value_from_json).collect::<Result<Vec<_>>>()?;
        conn.prepare_cached(&sql)?
            .execute(params_from_iter(values.iter()))
            .with_context(|| format!("failed to import row {} into {table}", index + 1))?;
        imported += 1;
    }
    Ok(imported)
}

fn copy_tables(live: &mut Connection, scratch: &Connection) -> Result<()> {
    let tables = EntityTable::present_at(CURRENT_SCHEMA_VERSION);
    let tx = live
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("failed to begin restore transaction")?;

    for table in tables.iter().rev() {
        tx.execute(&format!("DELETE FROM {}", quote_ident(table.as_str())), [])
            .with_context(|| format!("failed to clear {table}"))?;
    }

    for table in &tables {
        let columns = table_columns(scratch, table.as_str())?;
        let column_list = columns.iter().map(|name| quote_ident(name)).collect::<Vec<_>>().join(", ");
        let placeholders =
            (1..=columns.len()).map(|n| format!("?{n}")).collect::<Vec<_>>().join(", ");
        let quoted = quote_ident(table.as_str());

        let mut read = scratch.prepare(&format!("SELECT {column_list} FROM {quoted} ORDER BY rowid"))?;
        let mut write =
            tx.prepare(&format!("INSERT INTO {quoted} ({column_list}) VALUES ({placeholders})"))?;
        let mut rows = read.query([])?;
        while let Some(row) = rows.next()? {
            let values = (0..columns.len())
                .map(|index| row.get::<_, SqlValue>(index))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            write
                .execute(params_from_iter(values.iter()))
                .with_context(|| format!("failed to restore a row into {table}"))?;
        }
    }

    tx.commit().context("failed to commit restore transaction")
}

fn replace_live_contents(live: &mut Connection, scratch: &Connection) -> Result<(), StoreError> {
    let restore_failed = |err: anyhow::Error| StoreError::RestoreFailed(format!("{err:#}"));

    live.pragma_update(None, "foreign_keys", false)
        .context("failed to suspend foreign keys for restore")
        .map_err(restore_failed)?;
    let copied = copy_tables(live, scratch);
    let restored = live
        .pragma_update(None, "foreign_keys", true)
        .context("failed to re-enable foreign keys after restore");
    copied.map_err(restore_failed)?;
    restored.map_err(restore_failed)
}

impl Store {
    /// Write a full backup of the store and apply retention.
    ///
    /// # Errors
    /// Returns [`StoreError::BackupCreationFailed`] when anything is left unwritten; the
    /// partial backup is removed.
    pub fn create_backup(&self, label: &str) -> Result<BackupHandle, StoreError> {
        let handle = self
            .write_backup(label)
            .map_err(|err| StoreError::BackupCreationFailed(format!("{err:#}")))?;

        let backup_dir = self.config().backup_dir();
        if let Err(err) = prune_backups(&backup_dir, self.config().retention, OffsetDateTime::now_utc()) {
            tracing::warn!(path = %backup_dir.display(), "backup retention failed: {err:#}");
        }
        tracing::info!(
            backup_id = %handle.id,
            label = %handle.label,
            schema_version = handle.schema_version,
            "backup created"
        );
        Ok(handle)
    }

    /// # Errors
    /// As [`Self::create_backup`].
    pub fn create_manual_backup(&self, label: &str) -> Result<BackupHandle, StoreError> {
        self.create_backup(label)
    }

    /// Create a `scheduled` backup when the newest one is at least `interval` old.
    ///
    /// # Errors
    /// As [`Self::create_backup`].
    pub fn create_backup_if_due(&self, interval: Duration) -> Result<Option<BackupHandle>, StoreError> {
        let due = backup_due(&self.config().backup_dir(), interval, OffsetDateTime::now_utc())
            .map_err(|err| StoreError::BackupCreationFailed(format!("{err:#}")))?;
        if !due {
            return Ok(None);
        }
        self.create_backup("scheduled").map(Some)
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when the backup directory cannot be listed.
    pub fn list_backups(&self) -> Result<Vec<BackupHandle>, StoreError> {
        list_backups(&self.config().backup_dir())
    }

    /// # Errors
    /// As [`Self::list_backups`].
    pub fn latest_backup(&self) -> Result<Option<BackupHandle>, StoreError> {
        Ok(self.list_backups()?.into_iter().next())
    }

    fn write_backup(&self, label: &str) -> Result<BackupHandle> {
        if label.trim().is_empty() {
            return Err(anyhow!("backup label must not be empty"));
        }
        let backup_dir = self.config().backup_dir();
        fs::create_dir_all(&backup_dir)
            .with_context(|| format!("failed to create backup directory {}", backup_dir.display()))?;

        let id = Ulid::new().to_string();
        let staging = backup_dir.join(format!("{STAGING_PREFIX}{id}"));
        fs::create_dir(&staging)
            .with_context(|| format!("failed to create {}", staging.display()))?;

        let manifest = match self.populate_staging(&staging, &id, label) {
            Ok(manifest) => manifest,
            Err(err) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    tracing::warn!(path = %staging.display(), "failed to remove partial backup: {cleanup}");
                }
                return Err(err);
            }
        };

        let final_dir = backup_dir.join(&id);
        fs::rename(&staging, &final_dir).with_context(|| {
            format!("failed to move {} to {}", staging.display(), final_dir.display())
        })?;
        sync_dir(&backup_dir)?;
        Ok(BackupHandle::from_manifest(&manifest, final_dir))
    }

    fn populate_staging(&self, staging: &Path, id: &str, label: &str) -> Result<BackupManifest> {
        let created_at = now_rfc3339()?;
        let (schema_version, files) = self.with_read_scope(|conn| export_tables(conn, staging))?;

        let manifest = BackupManifest {
            format_version: BACKUP_FORMAT_VERSION,
            backup_id: id.to_string(),
            label: label.to_string(),
            schema_version,
            created_at,
            digest: manifest_digest(&files),
            files,
        };
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize backup manifest")?;
        staged_write(&staging.join(MANIFEST_FILE), &manifest_json)?;
        sync_dir(staging)?;
        Ok(manifest)
    }

    /// Replace the store's contents with a backup.
    ///
    /// Returns `Ok(false)`, leaving the store untouched, when the backup fails validation
    /// or cannot be brought to the current version.
    ///
    /// # Errors
    /// Returns [`StoreError::RestoreFailed`] when the swap itself fails; the store file is
    /// rolled back first.
    pub fn restore_from_backup(&self, handle: &BackupHandle) -> Result<bool, StoreError> {
        let manifest = match verify_backup(handle) {
            Ok(manifest) => manifest,
            Err(err) => {
                tracing::warn!(backup_id = %handle.id, "backup rejected: {err}");
                return Ok(false);
            }
        };
        if manifest.digest != handle.digest {
            tracing::warn!(backup_id = %handle.id, "backup changed since it was listed");
            return Ok(false);
        }

        let scratch = match self.build_scratch(&handle.path, &manifest) {
            Ok(scratch) => scratch,
            Err(err) => {
                tracing::warn!(backup_id = %handle.id, "backup could not be staged: {err:#}");
                return Ok(false);
            }
        };

        self.migrate_to_current()?;
        self.marker().write(SessionState::Restoring).map_err(storage_error)?;
        let replaced =
            self.with_file_envelope("pre-restore", |live| replace_live_contents(live, &scratch));
        self.marker().write(SessionState::Open).map_err(storage_error)?;
        replaced?;

        tracing::info!(
            backup_id = %handle.id,
            schema_version = manifest.schema_version,
            "store restored from backup"
        );
        Ok(true)
    }

    /// Load a verified backup into an in-memory store and migrate it to the registry
    /// target.
    fn build_scratch(&self, dir: &Path, manifest: &BackupManifest) -> Result<Connection> {
        let version = manifest.schema_version;
        let target = self.registry().target_version();
        let mut scratch = Connection::open_in_memory().context("failed to open scratch store")?;
        migrate(&mut scratch, 0, version, &self.registry().chain(0, version)?)?;

        let mut files: Vec<&BackupFileDigest> = manifest.files.iter().collect();
        files.sort_by_key(|file| file.table);
        scratch.pragma_update(None, "foreign_keys", false)?;
        let tx = scratch.transaction()?;
        for file in files {
            import_table(&tx, file.table, &dir.join(&file.path))?;
        }
        tx.commit().context("failed to commit scratch import")?;

        if version < target {
            migrate(&mut scratch, version, target, &self.registry().chain(version, target)?)?;
        } else {
            scratch.pragma_update(None, "foreign_keys", true)?;
        }
        Ok(scratch)
    }
}
