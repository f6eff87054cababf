use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ledger_kernel_core::MIN_SUPPORTED_SCHEMA_VERSION;
use ledger_kernel_store_sqlite::{
    BackupHandle, Store, StoreBootstrap, StoreConfig, DEFAULT_DB_PATH,
};
use serde_json::Value;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "LEDGER_KERNEL_LOG";

#[derive(Debug, Parser)]
#[command(name = "lk")]
#[command(about = "Ledger Kernel CLI")]
struct Cli {
    /// YAML store config; `--db` and `--backup-dir` override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    db: Option<PathBuf>,

    #[arg(long)]
    backup_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Repair(DbRepairArgs),
    Backup(DbBackupArgs),
    Backups,
    Restore(DbRestoreArgs),
    /// Full startup sequence: crash detection, recovery, migration, integrity pass.
    Open,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbRepairArgs {
    /// Only recompute this account's balance.
    #[arg(long)]
    account_id: Option<i64>,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long, default_value = "manual")]
    label: String,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct DbRestoreArgs {
    #[arg(long)]
    id: Option<String>,
    #[arg(long, default_value_t = false)]
    latest: bool,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn load_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::for_path(DEFAULT_DB_PATH),
    };
    if let Some(db) = &cli.db {
        config.db_path.clone_from(db);
    }
    if let Some(backup_dir) = &cli.backup_dir {
        config.backup_dir = Some(backup_dir.clone());
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    match cli.command {
        Command::Db { command } => run_db(command, config),
    }
}

fn run_db(command: DbCommand, config: StoreConfig) -> Result<()> {
    if let DbCommand::Open = command {
        return run_db_open(config);
    }

    let store = Store::open(config)?;
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(&store)?,
        DbCommand::Migrate(args) => run_db_migrate(&args, &store)?,
        DbCommand::IntegrityCheck => run_db_integrity_check(&store)?,
        DbCommand::Repair(args) => run_db_repair(&args, &store)?,
        DbCommand::Backup(args) => run_db_backup(&args, &store)?,
        DbCommand::Backups => run_db_backups(&store)?,
        DbCommand::Restore(args) => run_db_restore(&args, &store)?,
        DbCommand::Open => {}
    }
    store.close()?;
    Ok(())
}

fn run_db_schema_version(store: &Store) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &Store) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    let mut backup: Option<BackupHandle> = None;
    if !before.is_current()
        && store.config().backup_before_migration
        && before.current_version >= MIN_SUPPORTED_SCHEMA_VERSION
    {
        backup = Some(store.create_backup("pre-migration")?);
    }
    let outcome = store.migrate_to_current()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": outcome.map(|outcome| outcome.applied_versions).unwrap_or_default(),
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.is_current(),
        "pre_migration_backup": backup
    }))
}

fn run_db_integrity_check(store: &Store) -> Result<()> {
    let probe = store.quick_probe()?;
    let checks = store.check_all()?;
    let passed = probe.quick_check_ok && checks.iter().all(|result| result.passed);
    emit_json(serde_json::json!({
        "passed": passed,
        "probe": probe,
        "checks": checks,
        "schema_status": store.schema_status()?
    }))
}

fn run_db_repair(args: &DbRepairArgs, store: &Store) -> Result<()> {
    if let Some(account_id) = args.account_id {
        let balance = store.fix_account_balance(account_id)?;
        return emit_json(serde_json::json!({
            "account_id": account_id,
            "balance": balance
        }));
    }
    let report = store.run_integrity_pass()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_db_backup(args: &DbBackupArgs, store: &Store) -> Result<()> {
    let handle = store.create_manual_backup(&args.label)?;
    emit_json(serde_json::json!({
        "status": "ok",
        "backup": handle
    }))
}

fn run_db_backups(store: &Store) -> Result<()> {
    let backups = store.list_backups()?;
    emit_json(serde_json::json!({
        "backup_dir": store.config().backup_dir(),
        "backups": backups
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &Store) -> Result<()> {
    let backups = store.list_backups()?;
    let handle = if args.latest {
        backups.into_iter().next().ok_or_else(|| anyhow!("no backups to restore from"))?
    } else {
        let id = args.id.as_deref().ok_or_else(|| anyhow!("either --id or --latest is required"))?;
        backups
            .into_iter()
            .find(|handle| handle.id == id)
            .ok_or_else(|| anyhow!("backup not found: {id}"))?
    };

    tracing::info!(backup_id = %handle.id, "restoring store from backup");
    if !store.restore_from_backup(&handle)? {
        return Err(anyhow!("backup {} was rejected; the store was left unchanged", handle.id));
    }
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": handle,
        "current_version": status.current_version,
        "target_version": status.target_version
    }))
}

fn run_db_open(config: StoreConfig) -> Result<()> {
    let (store, report) = StoreBootstrap::new(config).open()?;
    let data_loss = report.ensure_no_data_loss();
    emit_json(serde_json::to_value(&report).context("failed to serialize startup report")?)?;
    store.close()?;
    data_loss.map_err(Into::into)
}
