use anyhow::{Context, Result};
use ledger_kernel_core::{
    balances_match, ledger_totals, CheckName, ForeignKeyViolation, IntegrityCheckResult,
    IntegrityReport, LedgerEntry, StoreError,
};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::connection::Store;
use crate::repair;
use crate::storage_error;

const CHECKS: [CheckName; 4] = [
    CheckName::DurabilityMode,
    CheckName::BalanceConsistency,
    CheckName::OrphanedCategoryReferences,
    CheckName::OrphanedAccountReferences,
];

/// Checks the repair pass knows how to act on.
const DATA_CHECKS: [CheckName; 3] = [
    CheckName::BalanceConsistency,
    CheckName::OrphanedCategoryReferences,
    CheckName::OrphanedAccountReferences,
];

/// Low-level health of the store file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
}

/// What one check-repair-recheck pass did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepairSummary {
    pub found: Vec<IntegrityCheckResult>,
    pub repaired: bool,
    pub remaining: Vec<IntegrityCheckResult>,
}

/// # Errors
/// Returns an error when the journal mode cannot be read.
pub fn check_durability_mode(conn: &Connection) -> Result<IntegrityCheckResult> {
    let journal_mode: String = conn
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .context("failed to read PRAGMA journal_mode")?;
    if journal_mode.eq_ignore_ascii_case("wal") {
        Ok(IntegrityCheckResult::passed(CheckName::DurabilityMode))
    } else {
        tracing::warn!(journal_mode = %journal_mode, "store is not in WAL mode");
        Ok(IntegrityCheckResult::failed(CheckName::DurabilityMode, Vec::new()))
    }
}

/// Flag every account whose stored balance differs from its opening balance plus ledger
/// by more than the tolerance.
///
/// # Errors
/// Returns an error when accounts or transactions cannot be read.
pub fn check_balance_consistency(conn: &Connection) -> Result<IntegrityCheckResult> {
    let totals = ledger_totals(&load_ledger_entries(conn)?);

    let mut stmt = conn
        .prepare("SELECT id, balance, openingBalance FROM accounts ORDER BY id")
        .context("failed to prepare account balance query")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?, row.get::<_, Option<f64>>(2)?))
    })?;

    let mut mismatched = Vec::new();
    for row in rows {
        let (account_id, balance, opening_balance) = row?;
        // No anchor yet: the stored balance is taken as given.
        let Some(opening_balance) = opening_balance else {
            continue;
        };
        let derived = opening_balance + totals.get(&account_id).copied().unwrap_or(0.0);
        if !balances_match(balance, derived) {
            mismatched.push(account_id);
        }
    }
    Ok(IntegrityCheckResult::from_affected(CheckName::BalanceConsistency, mismatched))
}

/// Flag transactions whose non-null `categoryId` names no category.
///
/// # Errors
/// Returns an error when the query fails.
pub fn check_orphaned_category_references(conn: &Connection) -> Result<IntegrityCheckResult> {
    let ids = query_ids(
        conn,
        "SELECT t.id FROM transactions t
         WHERE t.categoryId IS NOT NULL
           AND NOT EXISTS (SELECT 1 FROM categories c WHERE c.id = t.categoryId)
         ORDER BY t.id",
    )
    .context("failed to check orphaned category references")?;
    Ok(IntegrityCheckResult::from_affected(CheckName::OrphanedCategoryReferences, ids))
}

/// Flag transactions whose `accountId`, or non-null `toAccountId`, names no account.
///
/// # Errors
/// Returns an error when the query fails.
pub fn check_orphaned_account_references(conn: &Connection) -> Result<IntegrityCheckResult> {
    let ids = query_ids(
        conn,
        "SELECT t.id FROM transactions t
         WHERE NOT EXISTS (SELECT 1 FROM accounts a WHERE a.id = t.accountId)
            OR (t.toAccountId IS NOT NULL
                AND NOT EXISTS (SELECT 1 FROM accounts a WHERE a.id = t.toAccountId))
         ORDER BY t.id",
    )
    .context("failed to check orphaned account references")?;
    Ok(IntegrityCheckResult::from_affected(CheckName::OrphanedAccountReferences, ids))
}

/// # Errors
/// Returns an error when the check's queries fail.
pub fn run_check(conn: &Connection, check: CheckName) -> Result<IntegrityCheckResult> {
    match check {
        CheckName::DurabilityMode => check_durability_mode(conn),
        CheckName::BalanceConsistency => check_balance_consistency(conn),
        CheckName::OrphanedCategoryReferences => check_orphaned_category_references(conn),
        CheckName::OrphanedAccountReferences => check_orphaned_account_references(conn),
    }
}

/// Every check, in a fixed order.
///
/// # Errors
/// Returns an error when any check's queries fail.
pub fn check_all(conn: &Connection) -> Result<Vec<IntegrityCheckResult>> {
    CHECKS.into_iter().map(|check| run_check(conn, check)).collect()
}

/// `PRAGMA quick_check` plus `PRAGMA foreign_key_check`.
///
/// # Errors
/// Returns an error when either pragma cannot run, which on a damaged file is itself the
/// signal.
pub fn quick_probe(conn: &Connection) -> Result<ProbeReport> {
    let quick_check_message: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .context("failed to run PRAGMA quick_check")?;

    let mut stmt =
        conn.prepare("PRAGMA foreign_key_check").context("failed to prepare PRAGMA foreign_key_check")?;
    let rows = stmt.query_map([], |row| {
        Ok(ForeignKeyViolation {
            table: row.get(0)?,
            rowid: row.get::<_, Option<i64>>(1)?.unwrap_or_default(),
            parent: row.get(2)?,
            fk_index: row.get(3)?,
        })
    })?;

    let mut foreign_key_violations = Vec::new();
    for row in rows {
        foreign_key_violations.push(row?);
    }

    Ok(ProbeReport {
        quick_check_ok: quick_check_message == "ok",
        quick_check_message,
        foreign_key_violations,
    })
}

fn ledger_entry(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        account_id: row.get(0)?,
        to_account_id: row.get(1)?,
        amount: row.get(2)?,
        is_income: row.get(3)?,
    })
}

/// Every transaction reduced to its money movement.
pub(crate) fn load_ledger_entries(conn: &Connection) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn
        .prepare("SELECT accountId, toAccountId, amount, isIncome FROM transactions ORDER BY id")
        .context("failed to prepare ledger query")?;
    let entries = stmt
        .query_map([], ledger_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to read ledger")?;
    Ok(entries)
}

/// The transactions that touch `account_id`, on either side.
pub(crate) fn load_account_entries(conn: &Connection, account_id: i64) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn
        .prepare(
            "SELECT accountId, toAccountId, amount, isIncome FROM transactions
             WHERE accountId = ?1 OR toAccountId = ?1
             ORDER BY id",
        )
        .context("failed to prepare account ledger query")?;
    let entries = stmt
        .query_map(params![account_id], ledger_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to read ledger for account {account_id}"))?;
    Ok(entries)
}

fn query_ids(conn: &Connection, sql: &str) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt.query_map([], |row| row.get::<_, i64>(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

fn data_checks(conn: &Connection) -> Result<Vec<IntegrityCheckResult>> {
    DATA_CHECKS.into_iter().map(|check| run_check(conn, check)).collect()
}

impl Store {
    /// Run every check against a current store.
    ///
    /// # Errors
    /// Returns [`StoreError::UnsupportedVersion`] for a store that is not current.
    pub fn check_all(&self) -> Result<Vec<IntegrityCheckResult>, StoreError> {
        self.ensure_current()?;
        self.with_read_scope(|conn| check_all(conn).map_err(storage_error))
    }

    /// # Errors
    /// Returns [`StoreError::UnsupportedVersion`] for a store that is not current.
    pub fn run_check(&self, check: CheckName) -> Result<IntegrityCheckResult, StoreError> {
        self.ensure_current()?;
        self.with_read_scope(|conn| run_check(conn, check).map_err(storage_error))
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when the probe cannot run.
    pub fn quick_probe(&self) -> Result<ProbeReport, StoreError> {
        self.with_read_scope(|conn| quick_probe(conn).map_err(storage_error))
    }

    /// Check the data, repair every failure in one write transaction, and check once more.
    ///
    /// # Errors
    /// Returns [`StoreError::UnsupportedVersion`] for a store that is not current and
    /// [`StoreError::Storage`] when a query or repair statement fails.
    pub fn repair_pass(&self) -> Result<RepairSummary, StoreError> {
        self.ensure_current()?;
        let found = self.with_read_scope(|conn| data_checks(conn).map_err(storage_error))?;
        let failing: Vec<&IntegrityCheckResult> = found.iter().filter(|result| !result.passed).collect();
        if failing.is_empty() {
            return Ok(RepairSummary { found, repaired: false, remaining: Vec::new() });
        }

        for result in &failing {
            tracing::warn!(
                check = %result.check_name,
                affected = ?result.affected_record_ids,
                "integrity check failed; repairing"
            );
        }
        self.with_write_scope(|tx| -> Result<(), StoreError> {
            for result in &failing {
                match result.check_name {
                    CheckName::BalanceConsistency => {
                        for account_id in &result.affected_record_ids {
                            repair::fix_account_balance(tx, *account_id).map_err(storage_error)?;
                        }
                    }
                    CheckName::OrphanedCategoryReferences => {
                        repair::fix_orphaned_category_references(tx).map_err(storage_error)?;
                    }
                    CheckName::OrphanedAccountReferences => {
                        repair::fix_orphaned_account_references(tx).map_err(storage_error)?;
                    }
                    CheckName::DurabilityMode => {}
                }
            }
            Ok(())
        })?;

        let after = self.with_read_scope(|conn| data_checks(conn).map_err(storage_error))?;
        let remaining: Vec<IntegrityCheckResult> = after.into_iter().filter(|result| !result.passed).collect();
        for result in &remaining {
            tracing::warn!(
                check = %result.check_name,
                affected = ?result.affected_record_ids,
                "integrity violation survived repair"
            );
        }
        Ok(RepairSummary { found, repaired: true, remaining })
    }

    /// Detect and repair balance and reference problems.
    ///
    /// Returns whether anything was found and repaired.
    ///
    /// # Errors
    /// Returns [`StoreError::IntegrityViolation`] for the first problem that repair could
    /// not clear.
    pub fn check_and_fix_all_issues(&self) -> Result<bool, StoreError> {
        let summary = self.repair_pass()?;
        if let Some(first) = summary.remaining.into_iter().next() {
            return Err(first.into_violation());
        }
        Ok(summary.repaired)
    }

    /// Probe, check, repair, and re-check, reporting everything that was seen.
    ///
    /// # Errors
    /// Returns [`StoreError::UnsupportedVersion`] for a store that is not current and
    /// [`StoreError::Storage`] when a probe, check, or repair cannot run.
    pub fn run_integrity_pass(&self) -> Result<IntegrityReport, StoreError> {
        self.ensure_current()?;
        let probe = self.quick_probe()?;
        let checks = self.check_all()?;

        let mut repaired = false;
        let mut unresolved = Vec::new();
        let durability_failed =
            checks.iter().any(|result| result.check_name == CheckName::DurabilityMode && !result.passed);
        if durability_failed {
            self.enable_wal_mode()?;
            let recheck = self.run_check(CheckName::DurabilityMode)?;
            if recheck.passed {
                repaired = true;
            } else {
                unresolved.push(recheck);
            }
        }

        let summary = self.repair_pass()?;
        repaired |= summary.repaired;
        unresolved.extend(summary.remaining);

        let report = IntegrityReport {
            quick_check_ok: probe.quick_check_ok,
            quick_check_message: probe.quick_check_message,
            foreign_key_violations: probe.foreign_key_violations,
            checks,
            repaired,
            unresolved,
            schema_status: self.schema_status()?,
        };
        if report.is_healthy() {
            tracing::info!(repaired = report.repaired, "integrity pass complete");
        } else {
            tracing::warn!(
                quick_check = %report.quick_check_message,
                unresolved = report.unresolved.len(),
                "integrity pass left problems"
            );
        }
        Ok(report)
    }
}
