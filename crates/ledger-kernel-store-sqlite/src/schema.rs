use std::collections::BTreeMap;

use anyhow::{Context, Result};
use ledger_kernel_core::SchemaVersion;
use rusqlite::{params, Connection};
use time::OffsetDateTime;

pub(crate) const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

pub(crate) const BASELINE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS categories (
  id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
  name TEXT NOT NULL,
  type INTEGER NOT NULL DEFAULT 0,
  iconName TEXT NOT NULL DEFAULT '',
  color INTEGER NOT NULL DEFAULT 0,
  isCustom INTEGER NOT NULL DEFAULT 0,
  sortOrder INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS accounts (
  id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
  name TEXT NOT NULL,
  type INTEGER NOT NULL DEFAULT 0,
  balance REAL NOT NULL DEFAULT 0.0,
  currency TEXT NOT NULL DEFAULT 'CNY',
  exchangeRate REAL NOT NULL DEFAULT 1.0,
  color INTEGER NOT NULL DEFAULT 0,
  icon TEXT NOT NULL DEFAULT '',
  isDefault INTEGER NOT NULL DEFAULT 0,
  includeInTotal INTEGER NOT NULL DEFAULT 1,
  creditLimit REAL NOT NULL DEFAULT 0.0,
  billingDay INTEGER NOT NULL DEFAULT 1,
  dueDay INTEGER NOT NULL DEFAULT 15
);

CREATE TABLE IF NOT EXISTS budgets (
  id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
  name TEXT NOT NULL,
  amount REAL NOT NULL,
  startDate INTEGER NOT NULL,
  endDate INTEGER NOT NULL,
  period TEXT NOT NULL DEFAULT 'monthly',
  categories TEXT NOT NULL DEFAULT '',
  isActive INTEGER NOT NULL DEFAULT 1,
  notifyEnabled INTEGER NOT NULL DEFAULT 0,
  notifyThreshold INTEGER NOT NULL DEFAULT 80
);

CREATE TABLE IF NOT EXISTS transactions (
  id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
  amount REAL NOT NULL,
  categoryId INTEGER,
  accountId INTEGER NOT NULL,
  date INTEGER NOT NULL,
  note TEXT NOT NULL DEFAULT '',
  isIncome INTEGER NOT NULL DEFAULT 0,
  location TEXT NOT NULL DEFAULT '',
  imageUri TEXT NOT NULL DEFAULT '',
  FOREIGN KEY(categoryId) REFERENCES categories(id) ON UPDATE NO ACTION ON DELETE SET NULL,
  FOREIGN KEY(accountId) REFERENCES accounts(id) ON UPDATE NO ACTION ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS index_transactions_categoryId ON transactions(categoryId);
CREATE INDEX IF NOT EXISTS index_transactions_accountId ON transactions(accountId);
CREATE INDEX IF NOT EXISTS index_transactions_date ON transactions(date);
";

/// Columns each version adds, table by table. The shape at version `v` is the union of
/// every row introduced at or before `v`.
const SHAPE_DELTAS: &[(SchemaVersion, &str, &[&str])] = &[
    (1, "categories", &["id", "name", "type", "iconName", "color", "isCustom", "sortOrder"]),
    (
        1,
        "accounts",
        &[
            "id",
            "name",
            "type",
            "balance",
            "currency",
            "exchangeRate",
            "color",
            "icon",
            "isDefault",
            "includeInTotal",
            "creditLimit",
            "billingDay",
            "dueDay",
        ],
    ),
    (
        1,
        "budgets",
        &[
            "id",
            "name",
            "amount",
            "startDate",
            "endDate",
            "period",
            "categories",
            "isActive",
            "notifyEnabled",
            "notifyThreshold",
        ],
    ),
    (
        1,
        "transactions",
        &["id", "amount", "categoryId", "accountId", "date", "note", "isIncome", "location", "imageUri"],
    ),
    (2, "transaction_tags", &["id", "transactionId", "tag"]),
    (2, "budget_category_relations", &["id", "budgetId", "categoryId"]),
    (3, "categories", &["parentId", "level"]),
    (
        4,
        "saving_goals",
        &[
            "id",
            "name",
            "targetAmount",
            "currentAmount",
            "accountId",
            "startDate",
            "targetDate",
            "priority",
            "iconUri",
            "color",
            "note",
            "autoSaveAmount",
            "autoSaveFrequencyDays",
            "lastAutoSaveDate",
            "createdAt",
            "updatedAt",
        ],
    ),
    (
        4,
        "recurring_transactions",
        &[
            "id",
            "type",
            "amount",
            "description",
            "categoryId",
            "fromAccountId",
            "toAccountId",
            "firstExecutionDate",
            "endDate",
            "recurrenceType",
            "customRecurrenceDays",
            "specificRecurrenceDay",
            "weekdayMask",
            "lastExecutionDate",
            "nextExecutionDate",
            "totalExecutions",
            "maxExecutions",
            "status",
            "note",
            "notifyBeforeExecution",
            "notifyDaysBefore",
            "templateDataJson",
            "createdAt",
            "updatedAt",
        ],
    ),
    (
        4,
        "family_members",
        &[
            "id",
            "name",
            "avatarUri",
            "role",
            "email",
            "phone",
            "uniqueId",
            "status",
            "lastActiveTime",
            "note",
            "createdAt",
            "updatedAt",
        ],
    ),
    (
        4,
        "investments",
        &[
            "id",
            "name",
            "type",
            "initialAmount",
            "currentValue",
            "totalReturn",
            "accountId",
            "institution",
            "productCode",
            "expectedAnnualReturn",
            "actualAnnualReturn",
            "riskLevel",
            "startDate",
            "endDate",
            "status",
            "redemptionDate",
            "lastValueUpdateDate",
            "autoUpdateFrequencyDays",
            "note",
            "attachmentsJson",
            "transactionHistoryJson",
            "createdAt",
            "updatedAt",
        ],
    ),
    (
        4,
        "financial_reports",
        &[
            "id",
            "title",
            "type",
            "startDate",
            "endDate",
            "generatedDate",
            "totalIncome",
            "totalExpense",
            "netCashflow",
            "savingRate",
            "initialTotalAssets",
            "finalTotalAssets",
            "assetGrowthRate",
            "reportDataJson",
            "configJson",
            "pdfUri",
            "shareUrl",
            "status",
            "note",
            "createdAt",
            "updatedAt",
        ],
    ),
    (5, "transactions", &["toAccountId"]),
    (6, "transactions", &["createdBy", "createdAt", "updatedAt", "isPrivate"]),
    (7, "account_categories", &["id", "name", "icon", "color", "sortOrder", "isDefault"]),
    (7, "accounts", &["categoryId", "displayOrder"]),
    (8, "accounts", &["openingBalance"]),
];

/// Triggers each version relies on, by the version that introduced them.
const EXPECTED_TRIGGERS: &[(SchemaVersion, &str)] = &[(8, "accounts_anchor_opening_balance")];

/// Shape probes for stores that never recorded their version, newest first.
const LEGACY_MARKERS: &[(SchemaVersion, &str, Option<&str>)] = &[
    (8, "accounts", Some("openingBalance")),
    (7, "account_categories", None),
    (6, "transactions", Some("isPrivate")),
    (5, "transactions", Some("toAccountId")),
    (4, "saving_goals", None),
    (3, "categories", Some("parentId")),
    (2, "transaction_tags", None),
];

/// Tables and columns that must exist at `version`.
pub(crate) fn expected_shape(version: SchemaVersion) -> BTreeMap<&'static str, Vec<&'static str>> {
    let mut shape: BTreeMap<&'static str, Vec<&'static str>> = BTreeMap::new();
    for (introduced, table, columns) in SHAPE_DELTAS {
        if *introduced <= version {
            shape.entry(*table).or_default().extend_from_slice(columns);
        }
    }
    shape
}

/// First expected table, column, or trigger missing at `version`, if any.
pub(crate) fn missing_element(conn: &Connection, version: SchemaVersion) -> Result<Option<String>> {
    for (table, columns) in expected_shape(version) {
        let present = table_columns(conn, table)?;
        if present.is_empty() {
            return Ok(Some(format!("table {table}")));
        }
        if let Some(column) =
            columns.iter().find(|column| !present.iter().any(|name| name.as_str() == **column))
        {
            return Ok(Some(format!("column {table}.{column}")));
        }
    }
    for (introduced, trigger) in EXPECTED_TRIGGERS {
        if *introduced <= version && !trigger_exists(conn, trigger)? {
            return Ok(Some(format!("trigger {trigger}")));
        }
    }
    Ok(None)
}

fn trigger_exists(conn: &Connection, trigger: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'trigger' AND name = ?1)",
            params![trigger],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if trigger exists: {trigger}"))?;
    Ok(exists == 1)
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

/// Column names of `table`, empty when the table does not exist.
pub(crate) fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let rows = stmt.query_map(params![table], |row| row.get::<_, String>(0))?;
    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }
    Ok(columns)
}

pub(crate) fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    Ok(table_columns(conn, table)?.iter().any(|name| name == column))
}

fn recorded_schema_version(conn: &Connection) -> Result<SchemaVersion> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(0);
    }
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    SchemaVersion::try_from(version)
        .with_context(|| format!("schema_migrations holds an invalid version {version}"))
}

fn user_version(conn: &Connection) -> Result<SchemaVersion> {
    let version = conn
        .query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
        .context("failed to read PRAGMA user_version")?;
    SchemaVersion::try_from(version)
        .with_context(|| format!("PRAGMA user_version holds an invalid version {version}"))
}

fn infer_version_from_shape(conn: &Connection) -> Result<SchemaVersion> {
    if !table_exists(conn, "transactions")? && !table_exists(conn, "accounts")? {
        return Ok(0);
    }
    for (version, table, column) in LEGACY_MARKERS {
        let matched = match column {
            Some(column) => table_has_column(conn, table, column)?,
            None => table_exists(conn, table)?,
        };
        if matched {
            return Ok(*version);
        }
    }
    Ok(1)
}

/// Stored schema version plus whether it had to be inferred because the store never
/// recorded one in `schema_migrations`.
///
/// Falls back to `PRAGMA user_version`, then to the table shape.
pub(crate) fn detect_stored_version(conn: &Connection) -> Result<(SchemaVersion, bool)> {
    let recorded = recorded_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    let pragma_version = user_version(conn)?;
    if pragma_version > 0 {
        return Ok((pragma_version, true));
    }

    let inferred = infer_version_from_shape(conn)?;
    Ok((inferred, inferred > 0))
}

pub(crate) fn record_schema_version(
    conn: &Connection,
    version: SchemaVersion,
    applied_at: &str,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, applied_at],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

pub(crate) fn set_user_version(conn: &Connection, version: SchemaVersion) -> Result<()> {
    conn.pragma_update(None, "user_version", version)
        .with_context(|| format!("failed to set PRAGMA user_version to {version}"))
}

pub(crate) fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

/// Double-quoted SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_grows_monotonically_across_versions() {
        let mut previous = expected_shape(1);
        assert_eq!(previous.len(), 4);
        for version in 2..=ledger_kernel_core::CURRENT_SCHEMA_VERSION {
            let shape = expected_shape(version);
            for (table, columns) in &previous {
                let Some(current) = shape.get(table) else {
                    panic!("table {table} disappeared at version {version}");
                };
                assert!(columns.iter().all(|column| current.contains(column)));
            }
            previous = shape;
        }
        assert_eq!(previous.len(), 12);
    }

    #[test]
    fn baseline_matches_version_one_shape() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(BASELINE_SQL)?;
        assert_eq!(missing_element(&conn, 1)?, None);
        assert_eq!(missing_element(&conn, 2)?, Some("table budget_category_relations".to_string()));
        Ok(())
    }

    #[test]
    fn legacy_store_version_comes_from_user_version_then_shape() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        assert_eq!(detect_stored_version(&conn)?, (0, false));

        conn.execute_batch(BASELINE_SQL)?;
        assert_eq!(detect_stored_version(&conn)?, (1, true));

        conn.execute_batch("ALTER TABLE categories ADD COLUMN parentId INTEGER DEFAULT NULL;")?;
        assert_eq!(detect_stored_version(&conn)?, (3, true));

        set_user_version(&conn, 2)?;
        assert_eq!(detect_stored_version(&conn)?, (2, true));

        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        record_schema_version(&conn, 3, "2026-01-01T00:00:00Z")?;
        assert_eq!(detect_stored_version(&conn)?, (3, false));
        Ok(())
    }

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("isIncome"), "\"isIncome\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
