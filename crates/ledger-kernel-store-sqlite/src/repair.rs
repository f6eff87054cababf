use anyhow::{anyhow, Context, Result};
use ledger_kernel_core::{derive_balance, opening_balance_for, StoreError};
use rusqlite::{params, Connection, OptionalExtension};

use crate::connection::Store;
use crate::integrity::{check_balance_consistency, load_account_entries};
use crate::storage_error;

/// Overwrite one account's balance with its opening balance plus its ledger.
///
/// An account with no opening balance is first anchored at its stored balance. Running it
/// twice gives the same balance.
///
/// # Errors
/// Returns an error when the account does not exist or the update fails.
pub fn fix_account_balance(conn: &Connection, account_id: i64) -> Result<f64> {
    let (stored_balance, opening_balance): (f64, Option<f64>) = conn
        .query_row(
            "SELECT balance, openingBalance FROM accounts WHERE id = ?1",
            params![account_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .with_context(|| format!("failed to read account {account_id}"))?
        .ok_or_else(|| anyhow!("account {account_id} does not exist"))?;

    let entries = load_account_entries(conn, account_id)?;
    let opening_balance = match opening_balance {
        Some(opening_balance) => opening_balance,
        None => {
            let anchor = opening_balance_for(stored_balance, account_id, &entries);
            conn.execute(
                "UPDATE accounts SET openingBalance = ?1 WHERE id = ?2",
                params![anchor, account_id],
            )
            .with_context(|| format!("failed to anchor opening balance of account {account_id}"))?;
            anchor
        }
    };
    let balance = derive_balance(opening_balance, account_id, &entries);
    conn.execute("UPDATE accounts SET balance = ?1 WHERE id = ?2", params![balance, account_id])
        .with_context(|| format!("failed to update balance of account {account_id}"))?;

    tracing::info!(account_id, balance, "account balance recomputed");
    Ok(balance)
}

/// Recompute every account that fails the balance check.
///
/// # Errors
/// Returns an error when the check or an update fails.
pub fn fix_all_account_balances(conn: &Connection) -> Result<Vec<(i64, f64)>> {
    let mismatched = check_balance_consistency(conn)?.affected_record_ids;
    mismatched
        .into_iter()
        .map(|account_id| Ok((account_id, fix_account_balance(conn, account_id)?)))
        .collect()
}

/// Null out `categoryId` on transactions whose category is gone.
///
/// # Errors
/// Returns an error when the update fails.
pub fn fix_orphaned_category_references(conn: &Connection) -> Result<usize> {
    let cleared = conn
        .execute(
            "UPDATE transactions SET categoryId = NULL
             WHERE categoryId IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM categories c WHERE c.id = transactions.categoryId)",
            [],
        )
        .context("failed to clear orphaned category references")?;
    if cleared > 0 {
        tracing::info!(cleared, "orphaned category references cleared");
    }
    Ok(cleared)
}

/// Null out `toAccountId` on transfers whose target account is gone.
///
/// A missing owning account is left alone: `accountId` is required and has no safe
/// replacement.
///
/// # Errors
/// Returns an error when the update fails.
pub fn fix_orphaned_account_references(conn: &Connection) -> Result<usize> {
    let cleared = conn
        .execute(
            "UPDATE transactions SET toAccountId = NULL
             WHERE toAccountId IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM accounts a WHERE a.id = transactions.toAccountId)",
            [],
        )
        .context("failed to clear orphaned transfer targets")?;
    if cleared > 0 {
        tracing::info!(cleared, "orphaned transfer targets cleared");
    }
    Ok(cleared)
}

/// Switch the journal to WAL. Must run outside any transaction.
///
/// # Errors
/// Returns an error when SQLite refuses the switch.
pub fn enable_wal_mode(conn: &Connection) -> Result<()> {
    let journal_mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .context("failed to set PRAGMA journal_mode")?;
    if !journal_mode.eq_ignore_ascii_case("wal") {
        return Err(anyhow!("journal_mode stayed `{journal_mode}` after requesting WAL"));
    }
    Ok(())
}

impl Store {
    /// # Errors
    /// Returns [`StoreError::UnsupportedVersion`] for a store that is not current and
    /// [`StoreError::Storage`] when the account is missing or the update fails.
    pub fn fix_account_balance(&self, account_id: i64) -> Result<f64, StoreError> {
        self.ensure_current()?;
        self.with_write_scope(|tx| fix_account_balance(tx, account_id).map_err(storage_error))
    }

    /// # Errors
    /// As [`Self::fix_account_balance`].
    pub fn fix_all_account_balances(&self) -> Result<Vec<(i64, f64)>, StoreError> {
        self.ensure_current()?;
        self.with_write_scope(|tx| fix_all_account_balances(tx).map_err(storage_error))
    }

    /// # Errors
    /// As [`Self::fix_account_balance`].
    pub fn fix_orphaned_category_references(&self) -> Result<usize, StoreError> {
        self.ensure_current()?;
        self.with_write_scope(|tx| fix_orphaned_category_references(tx).map_err(storage_error))
    }

    /// # Errors
    /// As [`Self::fix_account_balance`].
    pub fn fix_orphaned_account_references(&self) -> Result<usize, StoreError> {
        self.ensure_current()?;
        self.with_write_scope(|tx| fix_orphaned_account_references(tx).map_err(storage_error))
    }

    /// # Errors
    /// Returns [`StoreError::WalUnavailable`] when the journal cannot be switched.
    pub fn enable_wal_mode(&self) -> Result<(), StoreError> {
        let scope = self.write()?;
        enable_wal_mode(&scope).map_err(|err| StoreError::WalUnavailable {
            journal_mode: format!("{err:#}"),
        })?;
        tracing::info!(path = %self.path().display(), "WAL journal mode enabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;
    use crate::config::StoreConfig;

    fn seeded_store(dir: &std::path::Path) -> Result<Store> {
        let store = Store::open(StoreConfig::for_path(dir.join("ledger.sqlite3")))?;
        store.migrate_to_current()?;
        store.with_write_scope(|tx| -> Result<()> {
            tx.execute_batch(
                "INSERT INTO accounts (id, name, balance) VALUES (1, 'cash', 100.0), (2, 'savings', 10.0);
                 INSERT INTO transactions (amount, accountId, date, isIncome, toAccountId) VALUES
                   (30.0, 1, 1, 0, 2), (5.5, 1, 2, 1, NULL), (2.0, 2, 3, 0, NULL);",
            )?;
            Ok(())
        })?;
        Ok(store)
    }

    #[test]
    fn fix_account_balance_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = seeded_store(dir.path())?;

        let first = store.fix_account_balance(1)?;
        let second = store.fix_account_balance(1)?;
        assert!((first - 75.5).abs() < 1e-9);
        assert!((first - second).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn fix_all_account_balances_touches_only_mismatches() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = seeded_store(dir.path())?;

        let fixed = store.fix_all_account_balances()?;
        assert_eq!(fixed.len(), 2);
        assert!((fixed[1].1 - 38.0).abs() < 1e-9);
        assert!(store.fix_all_account_balances()?.is_empty());
        Ok(())
    }

    #[test]
    fn unanchored_account_keeps_its_stored_balance() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = seeded_store(dir.path())?;
        store.with_write_scope(|tx| -> Result<()> {
            tx.execute("UPDATE accounts SET openingBalance = NULL, balance = 64.0 WHERE id = 1", [])?;
            Ok(())
        })?;

        assert!((store.fix_account_balance(1)? - 64.0).abs() < 1e-9);
        let opening: Option<f64> = store.with_read_scope(|conn| -> Result<_> {
            Ok(conn.query_row("SELECT openingBalance FROM accounts WHERE id = 1", [], |row| row.get(0))?)
        })?;
        let Some(opening) = opening else {
            return Err(anyhow!("repair should anchor the account"));
        };
        assert!((opening - 88.5).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn fixing_a_missing_account_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = seeded_store(dir.path())?;
        let Err(err) = store.fix_account_balance(404) else {
            return Err(anyhow!("missing account should not be fixable"));
        };
        assert!(err.to_string().contains("account 404 does not exist"));
        Ok(())
    }

    #[test]
    fn enable_wal_mode_is_a_no_op_on_a_wal_store() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = seeded_store(dir.path())?;
        store.enable_wal_mode()?;
        assert!(store.run_check(ledger_kernel_core::CheckName::DurabilityMode)?.passed);
        Ok(())
    }
}
