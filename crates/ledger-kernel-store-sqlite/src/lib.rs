//! SQLite persistence for the ledger: versioned migrations, integrity checks and repair,
//! backups, and crash recovery.
//!
//! Applications normally go through [`StoreBootstrap::open`], which detects a damaged or
//! abandoned store, recovers it from backups when needed, migrates it to
//! [`CURRENT_SCHEMA_VERSION`](ledger_kernel_core::CURRENT_SCHEMA_VERSION), and runs an
//! integrity pass before handing back the [`Store`].

mod backup;
mod config;
mod connection;
mod integrity;
mod migrate;
mod recovery;
mod registry;
mod repair;
mod schema;
mod staging;
mod steps;

use ledger_kernel_core::StoreError;

pub use backup::{
    backup_due, list_backups, manifest_digest, prune_backups, remove_stale_staging, verify_backup,
    BackupFileDigest, BackupHandle, BackupManifest, BACKUP_FORMAT_VERSION, MANIFEST_FILE,
};
pub use config::{RetentionPolicy, StoreConfig, DEFAULT_DB_PATH};
pub use connection::{ConnectionStats, ReadScope, Store, WriteScope};
pub use integrity::{
    check_all, check_balance_consistency, check_durability_mode, check_orphaned_account_references,
    check_orphaned_category_references, quick_probe, run_check, ProbeReport, RepairSummary,
};
pub use migrate::{migrate, MigrationOutcome};
pub use recovery::{SessionMarker, SessionState, StartupOutcome, StartupReport, StoreBootstrap};
pub use registry::{MigrationRegistry, MigrationStep};
pub use repair::{
    enable_wal_mode, fix_account_balance, fix_all_account_balances,
    fix_orphaned_account_references, fix_orphaned_category_references,
};
pub use steps::BuiltinStep;

/// Collapse an internal error into the public taxonomy, keeping a [`StoreError`] that is
/// already in the chain.
pub(crate) fn storage_error(err: anyhow::Error) -> StoreError {
    match err.downcast::<StoreError>() {
        Ok(store_err) => store_err,
        Err(err) => StoreError::Storage(format!("{err:#}")),
    }
}
