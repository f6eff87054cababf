use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Integer tag identifying the structural shape of a store.
pub type SchemaVersion = u32;

/// Schema version this build reads and writes.
pub const CURRENT_SCHEMA_VERSION: SchemaVersion = 8;

/// Oldest schema version that can still be migrated or restored.
pub const MIN_SUPPORTED_SCHEMA_VERSION: SchemaVersion = 1;

/// Largest absolute difference at which a stored balance still matches its ledger.
pub const BALANCE_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("migration step {from}->{to} failed: {cause}")]
    MigrationStepFailed { from: SchemaVersion, to: SchemaVersion, cause: String },
    #[error("post-migration validation failed at version {version}: missing {missing}")]
    PostMigrationValidationFailed { version: SchemaVersion, missing: String },
    #[error("invalid migration chain: {0}")]
    InvalidMigrationChain(String),
    #[error("schema version {stored} is not usable; this build requires version {supported}")]
    UnsupportedVersion { stored: SchemaVersion, supported: SchemaVersion },
    #[error("integrity violation in {check}: affected ids {affected_ids:?}")]
    IntegrityViolation { check: CheckName, affected_ids: Vec<i64> },
    #[error("backup creation failed: {0}")]
    BackupCreationFailed(String),
    #[error("backup rejected: {0}")]
    RestoreValidationFailed(String),
    #[error("restore failed and was rolled back: {0}")]
    RestoreFailed(String),
    #[error("store cannot be opened: {0}")]
    StoreUnopenable(String),
    #[error("write-ahead logging is unavailable (journal_mode is `{journal_mode}`)")]
    WalUnavailable { journal_mode: String },
    #[error("store was recreated empty and prior data is lost: {cause}")]
    DataLoss { cause: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// Failures that startup recovery must not paper over by restoring a backup.
    #[must_use]
    pub fn is_hard_open_failure(&self) -> bool {
        matches!(self, Self::WalUnavailable { .. } | Self::UnsupportedVersion { .. })
    }
}

/// Entity tables carried by backups, in parent-before-child order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityTable {
    Categories,
    AccountCategories,
    Accounts,
    Budgets,
    Transactions,
    TransactionTags,
    BudgetCategoryRelations,
    SavingGoals,
    RecurringTransactions,
    FamilyMembers,
    Investments,
    FinancialReports,
}

impl EntityTable {
    pub const ALL: [Self; 12] = [
        Self::Categories,
        Self::AccountCategories,
        Self::Accounts,
        Self::Budgets,
        Self::Transactions,
        Self::TransactionTags,
        Self::BudgetCategoryRelations,
        Self::SavingGoals,
        Self::RecurringTransactions,
        Self::FamilyMembers,
        Self::Investments,
        Self::FinancialReports,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Categories => "categories",
            Self::AccountCategories => "account_categories",
            Self::Accounts => "accounts",
            Self::Budgets => "budgets",
            Self::Transactions => "transactions",
            Self::TransactionTags => "transaction_tags",
            Self::BudgetCategoryRelations => "budget_category_relations",
            Self::SavingGoals => "saving_goals",
            Self::RecurringTransactions => "recurring_transactions",
            Self::FamilyMembers => "family_members",
            Self::Investments => "investments",
            Self::FinancialReports => "financial_reports",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|table| table.as_str() == value)
    }

    /// First schema version in which the table exists.
    #[must_use]
    pub fn introduced_in(self) -> SchemaVersion {
        match self {
            Self::Categories | Self::Accounts | Self::Budgets | Self::Transactions => 1,
            Self::TransactionTags | Self::BudgetCategoryRelations => 2,
            Self::SavingGoals
            | Self::RecurringTransactions
            | Self::FamilyMembers
            | Self::Investments
            | Self::FinancialReports => 4,
            Self::AccountCategories => 7,
        }
    }

    /// Tables that exist at `version`, in parent-before-child order.
    #[must_use]
    pub fn present_at(version: SchemaVersion) -> Vec<Self> {
        Self::ALL.into_iter().filter(|table| table.introduced_in() <= version).collect()
    }

    #[must_use]
    pub fn file_name(self) -> String {
        format!("{}.ndjson", self.as_str())
    }
}

impl Display for EntityTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    #[serde(rename = "wal_mode")]
    DurabilityMode,
    BalanceConsistency,
    OrphanedCategoryReferences,
    OrphanedAccountReferences,
}

impl CheckName {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DurabilityMode => "wal_mode",
            Self::BalanceConsistency => "balance_consistency",
            Self::OrphanedCategoryReferences => "orphaned_category_references",
            Self::OrphanedAccountReferences => "orphaned_account_references",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "wal_mode" => Some(Self::DurabilityMode),
            "balance_consistency" => Some(Self::BalanceConsistency),
            "orphaned_category_references" => Some(Self::OrphanedCategoryReferences),
            "orphaned_account_references" => Some(Self::OrphanedAccountReferences),
            _ => None,
        }
    }
}

impl Display for CheckName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one read-only check. Produced per run and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityCheckResult {
    pub check_name: CheckName,
    pub passed: bool,
    pub affected_record_ids: Vec<i64>,
}

impl IntegrityCheckResult {
    #[must_use]
    pub fn passed(check_name: CheckName) -> Self {
        Self { check_name, passed: true, affected_record_ids: Vec::new() }
    }

    #[must_use]
    pub fn failed(check_name: CheckName, affected_record_ids: Vec<i64>) -> Self {
        Self { check_name, passed: false, affected_record_ids }
    }

    /// A check passes exactly when nothing was flagged.
    #[must_use]
    pub fn from_affected(check_name: CheckName, affected_record_ids: Vec<i64>) -> Self {
        if affected_record_ids.is_empty() {
            Self::passed(check_name)
        } else {
            Self::failed(check_name, affected_record_ids)
        }
    }

    #[must_use]
    pub fn into_violation(self) -> StoreError {
        StoreError::IntegrityViolation {
            check: self.check_name,
            affected_ids: self.affected_record_ids,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: SchemaVersion,
    pub target_version: SchemaVersion,
    pub pending_versions: Vec<SchemaVersion>,
    pub inferred_from_legacy: bool,
}

impl SchemaStatus {
    #[must_use]
    pub fn new(current_version: SchemaVersion, inferred_from_legacy: bool) -> Self {
        let pending_versions = if current_version < CURRENT_SCHEMA_VERSION {
            ((current_version + 1)..=CURRENT_SCHEMA_VERSION).collect()
        } else {
            Vec::new()
        };
        Self {
            current_version,
            target_version: CURRENT_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        }
    }

    #[must_use]
    pub fn is_current(&self) -> bool {
        self.current_version == self.target_version
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

/// Composite result of one integrity pass over a store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub checks: Vec<IntegrityCheckResult>,
    pub repaired: bool,
    pub unresolved: Vec<IntegrityCheckResult>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.quick_check_ok && self.unresolved.is_empty()
    }
}

/// The part of a transaction row that moves money between accounts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub account_id: i64,
    pub to_account_id: Option<i64>,
    pub amount: f64,
    pub is_income: bool,
}

impl LedgerEntry {
    /// Signed contribution of this entry to `account_id`.
    ///
    /// Income credits the owning account and an expense debits it. A transfer is an
    /// expense that also credits `to_account_id`.
    #[must_use]
    pub fn effect_on(&self, account_id: i64) -> f64 {
        let mut effect = 0.0;
        if self.account_id == account_id {
            effect += if self.is_income { self.amount } else { -self.amount };
        }
        if !self.is_income && self.to_account_id == Some(account_id) {
            effect += self.amount;
        }
        effect
    }
}

#[must_use]
pub fn ledger_total(account_id: i64, entries: &[LedgerEntry]) -> f64 {
    entries.iter().map(|entry| entry.effect_on(account_id)).sum()
}

/// Balance an account must hold given its opening balance and its ledger.
#[must_use]
pub fn derive_balance(opening_balance: f64, account_id: i64, entries: &[LedgerEntry]) -> f64 {
    opening_balance + ledger_total(account_id, entries)
}

/// Opening balance that makes `stored_balance` agree with the ledger.
#[must_use]
pub fn opening_balance_for(stored_balance: f64, account_id: i64, entries: &[LedgerEntry]) -> f64 {
    stored_balance - ledger_total(account_id, entries)
}

/// Ledger totals for every account referenced by `entries`, computed in one pass.
#[must_use]
pub fn ledger_totals(entries: &[LedgerEntry]) -> BTreeMap<i64, f64> {
    let mut totals = BTreeMap::new();
    for entry in entries {
        let owner = if entry.is_income { entry.amount } else { -entry.amount };
        *totals.entry(entry.account_id).or_insert(0.0) += owner;
        if !entry.is_income {
            if let Some(target) = entry.to_account_id {
                *totals.entry(target).or_insert(0.0) += entry.amount;
            }
        }
    }
    totals
}

#[must_use]
pub fn balances_match(stored: f64, derived: f64) -> bool {
    (stored - derived).abs() <= BALANCE_TOLERANCE
}
