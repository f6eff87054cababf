use anyhow::{Context, Result};
use ledger_kernel_core::{ledger_totals, SchemaVersion};
use rusqlite::{params, Transaction};

use crate::integrity::load_ledger_entries;
use crate::registry::MigrationStep;
use crate::schema::BASELINE_SQL;

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS transaction_tags (
  id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
  transactionId INTEGER NOT NULL,
  tag TEXT NOT NULL,
  FOREIGN KEY(transactionId) REFERENCES transactions(id) ON UPDATE CASCADE ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS budget_category_relations (
  id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
  budgetId INTEGER NOT NULL,
  categoryId INTEGER NOT NULL,
  FOREIGN KEY(budgetId) REFERENCES budgets(id) ON UPDATE CASCADE ON DELETE CASCADE,
  FOREIGN KEY(categoryId) REFERENCES categories(id) ON UPDATE CASCADE ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS index_transaction_tags_transactionId ON transaction_tags(transactionId);
CREATE INDEX IF NOT EXISTS index_transaction_tags_tag ON transaction_tags(tag);
CREATE INDEX IF NOT EXISTS index_budget_category_relations_budgetId ON budget_category_relations(budgetId);
CREATE INDEX IF NOT EXISTS index_budget_category_relations_categoryId ON budget_category_relations(categoryId);
";

const MIGRATION_003_SQL: &str = r"
ALTER TABLE categories ADD COLUMN parentId INTEGER DEFAULT NULL;
ALTER TABLE categories ADD COLUMN level INTEGER NOT NULL DEFAULT 0;
CREATE INDEX IF NOT EXISTS index_categories_parentId ON categories(parentId);
UPDATE categories SET level = 0 WHERE parentId IS NULL;
";

const MIGRATION_004_SQL: &str = r"
CREATE TABLE IF NOT EXISTS saving_goals (
  id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
  name TEXT NOT NULL,
  targetAmount REAL NOT NULL,
  currentAmount REAL NOT NULL DEFAULT 0.0,
  accountId INTEGER,
  startDate INTEGER NOT NULL,
  targetDate INTEGER NOT NULL,
  priority INTEGER NOT NULL DEFAULT 3,
  iconUri TEXT,
  color INTEGER NOT NULL DEFAULT -13330461,
  note TEXT,
  autoSaveAmount REAL,
  autoSaveFrequencyDays INTEGER,
  lastAutoSaveDate INTEGER,
  createdAt INTEGER NOT NULL,
  updatedAt INTEGER NOT NULL,
  FOREIGN KEY(accountId) REFERENCES accounts(id) ON UPDATE NO ACTION ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS recurring_transactions (
  id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
  type INTEGER NOT NULL,
  amount REAL NOT NULL,
  description TEXT NOT NULL,
  categoryId INTEGER,
  fromAccountId INTEGER NOT NULL,
  toAccountId INTEGER,
  firstExecutionDate INTEGER NOT NULL,
  endDate INTEGER,
  recurrenceType INTEGER NOT NULL,
  customRecurrenceDays INTEGER,
  specificRecurrenceDay TEXT,
  weekdayMask INTEGER,
  lastExecutionDate INTEGER,
  nextExecutionDate INTEGER NOT NULL,
  totalExecutions INTEGER NOT NULL DEFAULT 0,
  maxExecutions INTEGER NOT NULL DEFAULT 0,
  status INTEGER NOT NULL DEFAULT 0,
  note TEXT,
  notifyBeforeExecution INTEGER NOT NULL DEFAULT 0,
  notifyDaysBefore INTEGER,
  templateDataJson TEXT,
  createdAt INTEGER NOT NULL,
  updatedAt INTEGER NOT NULL,
  FOREIGN KEY(categoryId) REFERENCES categories(id) ON UPDATE NO ACTION ON DELETE SET NULL,
  FOREIGN KEY(fromAccountId) REFERENCES accounts(id) ON UPDATE NO ACTION ON DELETE CASCADE,
  FOREIGN KEY(toAccountId) REFERENCES accounts(id) ON UPDATE NO ACTION ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS family_members (
  id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
  name TEXT NOT NULL,
  avatarUri TEXT,
  role INTEGER NOT NULL DEFAULT 2,
  email TEXT,
  phone TEXT,
  uniqueId TEXT,
  status INTEGER NOT NULL DEFAULT 0,
  lastActiveTime INTEGER,
  note TEXT,
  createdAt INTEGER NOT NULL,
  updatedAt INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS investments (
  id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
  name TEXT NOT NULL,
  type INTEGER NOT NULL,
  initialAmount REAL NOT NULL,
  currentValue REAL NOT NULL,
  totalReturn REAL NOT NULL DEFAULT 0.0,
  accountId INTEGER,
  institution TEXT,
  productCode TEXT,
  expectedAnnualReturn REAL,
  actualAnnualReturn REAL,
  riskLevel INTEGER,
  startDate INTEGER NOT NULL,
  endDate INTEGER,
  status INTEGER NOT NULL DEFAULT 0,
  redemptionDate INTEGER,
  lastValueUpdateDate INTEGER NOT NULL,
  autoUpdateFrequencyDays INTEGER,
  note TEXT,
  attachmentsJson TEXT,
  transactionHistoryJson TEXT,
  createdAt INTEGER NOT NULL,
  updatedAt INTEGER NOT NULL,
  FOREIGN KEY(accountId) REFERENCES accounts(id) ON UPDATE NO ACTION ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS financial_reports (
  id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
  title TEXT NOT NULL,
  type INTEGER NOT NULL,
  startDate INTEGER NOT NULL,
  endDate INTEGER NOT NULL,
  generatedDate INTEGER NOT NULL,
  totalIncome REAL NOT NULL DEFAULT 0.0,
  totalExpense REAL NOT NULL DEFAULT 0.0,
  netCashflow REAL NOT NULL DEFAULT 0.0,
  savingRate REAL,
  initialTotalAssets REAL,
  finalTotalAssets REAL,
  assetGrowthRate REAL,
  reportDataJson TEXT NOT NULL,
  configJson TEXT,
  pdfUri TEXT,
  shareUrl TEXT,
  status INTEGER NOT NULL DEFAULT 1,
  note TEXT,
  createdAt INTEGER NOT NULL,
  updatedAt INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS index_saving_goals_accountId ON saving_goals(accountId);
CREATE INDEX IF NOT EXISTS index_recurring_transactions_categoryId ON recurring_transactions(categoryId);
CREATE INDEX IF NOT EXISTS index_recurring_transactions_fromAccountId ON recurring_transactions(fromAccountId);
CREATE INDEX IF NOT EXISTS index_recurring_transactions_toAccountId ON recurring_transactions(toAccountId);
CREATE INDEX IF NOT EXISTS index_investments_accountId ON investments(accountId);
";

// Rebuild: SQLite cannot add a column carrying a foreign key with ON DELETE SET NULL.
const MIGRATION_005_SQL: &str = r"
CREATE TABLE transactions_new (
  id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
  amount REAL NOT NULL,
  categoryId INTEGER,
  accountId INTEGER NOT NULL,
  date INTEGER NOT NULL,
  note TEXT NOT NULL DEFAULT '',
  isIncome INTEGER NOT NULL DEFAULT 0,
  location TEXT NOT NULL DEFAULT '',
  imageUri TEXT NOT NULL DEFAULT '',
  toAccountId INTEGER,
  FOREIGN KEY(categoryId) REFERENCES categories(id) ON UPDATE NO ACTION ON DELETE SET NULL,
  FOREIGN KEY(accountId) REFERENCES accounts(id) ON UPDATE NO ACTION ON DELETE CASCADE,
  FOREIGN KEY(toAccountId) REFERENCES accounts(id) ON UPDATE NO ACTION ON DELETE SET NULL
);

INSERT INTO transactions_new
  (id, amount, categoryId, accountId, date, note, isIncome, location, imageUri, toAccountId)
SELECT id, amount, categoryId, accountId, date, note, isIncome, location, imageUri, NULL
FROM transactions;

DROP TABLE transactions;
ALTER TABLE transactions_new RENAME TO transactions;

CREATE INDEX IF NOT EXISTS index_transactions_categoryId ON transactions(categoryId);
CREATE INDEX IF NOT EXISTS index_transactions_accountId ON transactions(accountId);
CREATE INDEX IF NOT EXISTS index_transactions_date ON transactions(date);
CREATE INDEX IF NOT EXISTS index_transactions_toAccountId ON transactions(toAccountId);
";

const MIGRATION_006_SQL: &str = r"
ALTER TABLE transactions ADD COLUMN createdBy INTEGER NOT NULL DEFAULT 0;
ALTER TABLE transactions ADD COLUMN createdAt INTEGER NOT NULL DEFAULT 0;
ALTER TABLE transactions ADD COLUMN updatedAt INTEGER NOT NULL DEFAULT 0;
ALTER TABLE transactions ADD COLUMN isPrivate INTEGER NOT NULL DEFAULT 0;
UPDATE transactions SET createdAt = date, updatedAt = date;
CREATE INDEX IF NOT EXISTS index_transactions_createdBy ON transactions(createdBy);
";

const MIGRATION_007_SQL: &str = r"
CREATE TABLE IF NOT EXISTS account_categories (
  id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
  name TEXT NOT NULL,
  icon TEXT NOT NULL DEFAULT '',
  color INTEGER NOT NULL DEFAULT 0,
  sortOrder INTEGER NOT NULL DEFAULT 0,
  isDefault INTEGER NOT NULL DEFAULT 0
);

ALTER TABLE accounts ADD COLUMN categoryId INTEGER DEFAULT NULL;
ALTER TABLE accounts ADD COLUMN displayOrder INTEGER NOT NULL DEFAULT 0;
CREATE INDEX IF NOT EXISTS index_accounts_categoryId ON accounts(categoryId);
CREATE INDEX IF NOT EXISTS index_account_categories_sortOrder ON account_categories(sortOrder);
";

const MIGRATION_008_SQL: &str = r"
ALTER TABLE accounts ADD COLUMN openingBalance REAL DEFAULT NULL;

CREATE TRIGGER IF NOT EXISTS accounts_anchor_opening_balance
AFTER INSERT ON accounts
WHEN NEW.openingBalance IS NULL
BEGIN
  UPDATE accounts SET openingBalance = NEW.balance WHERE id = NEW.id;
END;
";

/// The migration steps shipped with this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinStep {
    Baseline,
    TagsAndBudgetRelations,
    CategoryHierarchy,
    PlanningTables,
    TransferAccounts,
    TransactionAudit,
    AccountCategories,
    OpeningBalances,
}

impl BuiltinStep {
    pub const ALL: [Self; 8] = [
        Self::Baseline,
        Self::TagsAndBudgetRelations,
        Self::CategoryHierarchy,
        Self::PlanningTables,
        Self::TransferAccounts,
        Self::TransactionAudit,
        Self::AccountCategories,
        Self::OpeningBalances,
    ];
}

impl MigrationStep for BuiltinStep {
    fn from_version(&self) -> SchemaVersion {
        match self {
            Self::Baseline => 0,
            Self::TagsAndBudgetRelations => 1,
            Self::CategoryHierarchy => 2,
            Self::PlanningTables => 3,
            Self::TransferAccounts => 4,
            Self::TransactionAudit => 5,
            Self::AccountCategories => 6,
            Self::OpeningBalances => 7,
        }
    }

    fn description(&self) -> &str {
        match self {
            Self::Baseline => "create categories, accounts, budgets, and transactions",
            Self::TagsAndBudgetRelations => "add transaction_tags and budget_category_relations",
            Self::CategoryHierarchy => "add categories.parentId and categories.level",
            Self::PlanningTables => {
                "add saving_goals, recurring_transactions, family_members, investments, and financial_reports"
            }
            Self::TransferAccounts => "rebuild transactions with toAccountId",
            Self::TransactionAudit => "add transaction createdBy, createdAt, updatedAt, and isPrivate",
            Self::AccountCategories => "add account_categories and account grouping columns",
            Self::OpeningBalances => "add accounts.openingBalance backfilled from the ledger and anchored on insert",
        }
    }

    fn apply(&self, tx: &Transaction<'_>) -> Result<()> {
        let sql = match self {
            Self::Baseline => BASELINE_SQL,
            Self::TagsAndBudgetRelations => MIGRATION_002_SQL,
            Self::CategoryHierarchy => MIGRATION_003_SQL,
            Self::PlanningTables => MIGRATION_004_SQL,
            Self::TransferAccounts => MIGRATION_005_SQL,
            Self::TransactionAudit => MIGRATION_006_SQL,
            Self::AccountCategories => MIGRATION_007_SQL,
            Self::OpeningBalances => MIGRATION_008_SQL,
        };
        tx.execute_batch(sql).with_context(|| format!("failed to {}", self.description()))?;

        if *self == Self::OpeningBalances {
            backfill_opening_balances(tx)?;
        }
        Ok(())
    }
}

/// Set each account's opening balance so its stored balance agrees with the ledger as
/// of this migration.
fn backfill_opening_balances(tx: &Transaction<'_>) -> Result<()> {
    let totals = ledger_totals(&load_ledger_entries(tx)?);

    let mut select = tx.prepare("SELECT id, balance FROM accounts ORDER BY id")?;
    let accounts = select
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to read account balances")?;

    let mut update = tx.prepare("UPDATE accounts SET openingBalance = ?1 WHERE id = ?2")?;
    for (account_id, balance) in accounts {
        let total = totals.get(&account_id).copied().unwrap_or(0.0);
        update
            .execute(params![balance - total, account_id])
            .with_context(|| format!("failed to backfill opening balance for account {account_id}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;
    use crate::schema::missing_element;

    fn apply_through(conn: &mut Connection, to: SchemaVersion) -> Result<()> {
        let tx = conn.transaction()?;
        for step in BuiltinStep::ALL.iter().take(to as usize) {
            step.apply(&tx)?;
        }
        tx.commit()?;
        Ok(())
    }

    #[test]
    fn each_step_produces_its_target_shape() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", false)?;
        for step in BuiltinStep::ALL {
            let tx = conn.transaction()?;
            step.apply(&tx)?;
            tx.commit()?;
            assert_eq!(missing_element(&conn, step.to_version())?, None, "{step:?}");
        }
        Ok(())
    }

    #[test]
    fn transfer_rebuild_keeps_rows_and_tags() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", false)?;
        apply_through(&mut conn, 4)?;
        conn.execute_batch(
            "INSERT INTO accounts (id, name, balance) VALUES (1, 'cash', 10.0);
             INSERT INTO transactions (id, amount, categoryId, accountId, date, note, isIncome)
               VALUES (5, 2.5, NULL, 1, 1700000000000, 'coffee', 0);
             INSERT INTO transaction_tags (transactionId, tag) VALUES (5, 'daily');",
        )?;

        let tx = conn.transaction()?;
        BuiltinStep::TransferAccounts.apply(&tx)?;
        tx.commit()?;

        let (note, to_account): (String, Option<i64>) = conn.query_row(
            "SELECT note, toAccountId FROM transactions WHERE id = 5",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!(note, "coffee");
        assert_eq!(to_account, None);
        let tags: i64 = conn.query_row("SELECT COUNT(*) FROM transaction_tags", [], |row| row.get(0))?;
        assert_eq!(tags, 1);
        Ok(())
    }

    #[test]
    fn audit_step_backfills_timestamps_from_transaction_date() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        apply_through(&mut conn, 5)?;
        conn.execute_batch(
            "INSERT INTO accounts (id, name) VALUES (1, 'cash');
             INSERT INTO transactions (amount, accountId, date, isIncome) VALUES (1.0, 1, 42, 1);",
        )?;

        let tx = conn.transaction()?;
        BuiltinStep::TransactionAudit.apply(&tx)?;
        tx.commit()?;

        let row: (i64, i64, i64, i64) = conn.query_row(
            "SELECT createdBy, createdAt, updatedAt, isPrivate FROM transactions",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        assert_eq!(row, (0, 42, 42, 0));
        Ok(())
    }

    #[test]
    fn opening_balance_backfill_keeps_existing_balances_consistent() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        apply_through(&mut conn, 7)?;
        conn.execute_batch(
            "INSERT INTO accounts (id, name, balance) VALUES (1, 'cash', 700.0), (2, 'card', 50.0);
             INSERT INTO transactions (amount, accountId, date, isIncome, toAccountId)
               VALUES (300.0, 1, 1, 0, NULL), (100.0, 1, 2, 1, NULL), (50.0, 1, 3, 0, 2);",
        )?;

        let tx = conn.transaction()?;
        BuiltinStep::OpeningBalances.apply(&tx)?;
        tx.commit()?;

        let opening = |id: i64| -> Result<f64> {
            Ok(conn.query_row("SELECT openingBalance FROM accounts WHERE id = ?1", [id], |row| {
                row.get(0)
            })?)
        };
        assert!((opening(1)? - 950.0).abs() < 1e-9);
        assert!(opening(2)?.abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn accounts_inserted_after_v8_are_anchored_at_their_balance() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        apply_through(&mut conn, 8)?;
        conn.execute_batch(
            "INSERT INTO accounts (id, name, balance) VALUES (1, 'cash', 1000.0);
             INSERT INTO accounts (id, name, balance, openingBalance) VALUES (2, 'card', 80.0, 20.0);",
        )?;

        let opening = |id: i64| -> Result<Option<f64>> {
            Ok(conn.query_row("SELECT openingBalance FROM accounts WHERE id = ?1", [id], |row| {
                row.get(0)
            })?)
        };
        assert_eq!(opening(1)?, Some(1000.0));
        assert_eq!(opening(2)?, Some(20.0));
        Ok(())
    }
}
