use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use strum::{AsRefStr, Display, EnumString};

use crate::error::SchemaShiftError;
use crate::scripts::ScriptKind;
use crate::session::{Dialect, QueryOutcome, Value, WarehouseSession};

pub const DEFAULT_DATABASE: &str = "METADATA";
pub const DEFAULT_SCHEMA: &str = "SCHEMACHANGE";
pub const DEFAULT_TABLE: &str = "CHANGE_HISTORY";

static BARE_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("valid identifier pattern"));
static QUOTED_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^"(?:[^"]|"")+"$"#).expect("valid quoted identifier pattern"));

/// A warehouse identifier. Bare words are folded to upper case the way the
/// warehouse resolves them; quoted identifiers are kept verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identifier(String);

impl Identifier {
    pub fn parse(s: &str) -> Result<Self, SchemaShiftError> {
        let s = s.trim();
        if QUOTED_IDENTIFIER.is_match(s) {
            Ok(Identifier(s.to_owned()))
        } else if BARE_IDENTIFIER.is_match(s) {
            Ok(Identifier(s.to_ascii_uppercase()))
        } else {
            Err(SchemaShiftError::InvalidIdentifier(s.to_owned()))
        }
    }

    /// Form used inside SQL text
    pub fn as_sql(&self) -> &str {
        &self.0
    }

    /// Name as the catalog stores it, for comparisons against metadata views
    pub fn name(&self) -> String {
        if self.is_quoted() {
            self.0[1..self.0.len() - 1].replace("\"\"", "\"")
        } else {
            self.0.clone()
        }
    }

    pub fn is_quoted(&self) -> bool {
        self.0.starts_with('"')
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeHistoryTable {
    pub database_name: Identifier,
    pub schema_name: Identifier,
    pub table_name: Identifier,
}

impl Default for ChangeHistoryTable {
    fn default() -> Self {
        ChangeHistoryTable {
            database_name: Identifier(DEFAULT_DATABASE.to_owned()),
            schema_name: Identifier(DEFAULT_SCHEMA.to_owned()),
            table_name: Identifier(DEFAULT_TABLE.to_owned()),
        }
    }
}

impl ChangeHistoryTable {
    /// Parse `[[database.]schema.]table`. Missing leading parts take the
    /// defaults.
    pub fn parse(s: &str) -> Result<Self, SchemaShiftError> {
        let parts = split_dotted(s);
        if parts.is_empty() || parts.len() > 3 {
            return Err(SchemaShiftError::InvalidHistoryTable(s.to_owned()));
        }

        let mut table = ChangeHistoryTable::default();
        let mut rev = parts.iter().rev();
        if let Some(part) = rev.next() {
            table.table_name = Identifier::parse(part)?;
        }
        if let Some(part) = rev.next() {
            table.schema_name = Identifier::parse(part)?;
        }
        if let Some(part) = rev.next() {
            table.database_name = Identifier::parse(part)?;
        }
        Ok(table)
    }

    pub fn fully_qualified(&self) -> String {
        format!("{}.{}.{}", self.database_name, self.schema_name, self.table_name)
    }
}

impl fmt::Display for ChangeHistoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fully_qualified())
    }
}

/// Split on dots that are not inside double quotes.
fn split_dotted(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '.' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

#[derive(AsRefStr, EnumString, Debug, Display, PartialEq, Eq, Copy, Clone)]
pub enum ExecutionStatus {
    #[strum(serialize = "Success")]
    Success,
    #[strum(serialize = "Failed")]
    Failed,
}

/// One row of the change history table.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeHistoryRecord {
    pub version: Option<String>,
    pub description: String,
    pub script_name: String,
    pub script_type: ScriptKind,
    pub checksum: Option<String>,
    pub execution_time_seconds: i64,
    pub status: ExecutionStatus,
    pub installed_by: String,
    pub installed_on: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedScript {
    pub version: Option<String>,
    pub checksum: Option<String>,
}

/// What the ledger knows about prior runs. Script names are lowercased.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerState {
    pub applied_versions: HashMap<String, AppliedScript>,
    pub repeatable_checksums: HashMap<String, String>,
    pub max_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Table was already present
    Existing,
    /// Table was created by this run, so there is no history yet
    Created,
    /// Table is missing and a dry run suppressed its creation
    DryRunSkipped,
}

impl EnsureOutcome {
    pub fn usable(&self) -> bool {
        !matches!(self, EnsureOutcome::DryRunSkipped)
    }

    pub fn has_history(&self) -> bool {
        matches!(self, EnsureOutcome::Existing)
    }
}

/// The warehouse-resident change history table. Rows are only ever
/// appended.
pub struct HistoryLedger {
    table: ChangeHistoryTable,
}

impl HistoryLedger {
    pub fn new(table: ChangeHistoryTable) -> Self {
        HistoryLedger { table }
    }

    pub fn table(&self) -> &ChangeHistoryTable {
        &self.table
    }

    pub fn ensure_table(
        &self,
        session: &mut dyn WarehouseSession,
        create_if_missing: bool,
        dry_run: bool,
    ) -> Result<EnsureOutcome, SchemaShiftError> {
        if self.table_exists(session)? {
            debug!("Change history table {} exists", self.table);
            return Ok(EnsureOutcome::Existing);
        }

        if !create_if_missing {
            return Err(SchemaShiftError::MissingHistoryTable(self.table.fully_qualified()));
        }

        if dry_run {
            info!("Dry run: change history table {} would be created", self.table);
            return Ok(EnsureOutcome::DryRunSkipped);
        }

        if !self.schema_exists(session)? {
            let sql = self.create_schema_sql(session.dialect());
            if let Some(sql) = sql {
                self.run(session, &sql, &[], "create change history schema")?;
                info!("Created schema {}.{}", self.table.database_name, self.table.schema_name);
            }
        }

        let sql = self.create_table_sql(session.dialect());
        self.run(session, &sql, &[], "create change history table")?;
        self.finish(session)?;
        info!("Created change history table {}", self.table);

        Ok(EnsureOutcome::Created)
    }

    pub fn table_exists(&self, session: &mut dyn WarehouseSession) -> Result<bool, SchemaShiftError> {
        let (sql, params) = match session.dialect() {
            Dialect::Snowflake => (
                format!(
                    "SELECT COUNT(*) FROM {}.INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                    self.table.database_name
                ),
                vec![
                    Value::from(self.table.schema_name.name()),
                    Value::from(self.table.table_name.name()),
                ],
            ),
            Dialect::Sqlite => (
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?".to_owned(),
                vec![Value::from(self.sqlite_table_name())],
            ),
        };
        self.count(session, &sql, &params, "check change history table").map(|n| n > 0)
    }

    fn schema_exists(&self, session: &mut dyn WarehouseSession) -> Result<bool, SchemaShiftError> {
        match session.dialect() {
            Dialect::Snowflake => {
                let sql = format!(
                    "SELECT COUNT(*) FROM {}.INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME = ?",
                    self.table.database_name
                );
                let params = [Value::from(self.table.schema_name.name())];
                self.count(session, &sql, &params, "check change history schema").map(|n| n > 0)
            }
            Dialect::Sqlite => Ok(true),
        }
    }

    fn create_schema_sql(&self, dialect: Dialect) -> Option<String> {
        match dialect {
            Dialect::Snowflake => Some(format!(
                "CREATE SCHEMA IF NOT EXISTS {}.{}",
                self.table.database_name, self.table.schema_name
            )),
            Dialect::Sqlite => None,
        }
    }

    fn create_table_sql(&self, dialect: Dialect) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                VERSION VARCHAR,
                DESCRIPTION VARCHAR,
                SCRIPT VARCHAR,
                SCRIPT_TYPE VARCHAR,
                CHECKSUM VARCHAR,
                EXECUTION_TIME NUMBER,
                STATUS VARCHAR,
                INSTALLED_BY VARCHAR,
                INSTALLED_ON TIMESTAMP_LTZ
            )",
            self.qualified_name(dialect)
        )
    }

    fn qualified_name(&self, dialect: Dialect) -> String {
        match dialect {
            Dialect::Snowflake => self.table.fully_qualified(),
            Dialect::Sqlite => format!("\"{}\"", self.sqlite_table_name().replace('"', "\"\"")),
        }
    }

    fn sqlite_table_name(&self) -> String {
        format!(
            "{}.{}.{}",
            self.table.database_name.name(),
            self.table.schema_name.name(),
            self.table.table_name.name()
        )
    }

    /// Applied versioned scripts keyed by lowercased script name, plus the
    /// version of the most recently installed one.
    pub fn fetch_versioned(
        &self,
        session: &mut dyn WarehouseSession,
    ) -> Result<(HashMap<String, AppliedScript>, Option<String>), SchemaShiftError> {
        let sql = format!(
            "SELECT VERSION, SCRIPT, CHECKSUM FROM {} WHERE SCRIPT_TYPE = ? AND STATUS = ? ORDER BY INSTALLED_ON DESC",
            self.qualified_name(session.dialect())
        );
        let params = [
            Value::from(ScriptKind::Versioned.as_ref()),
            Value::from(ExecutionStatus::Success.as_ref()),
        ];
        let outcome = self.run(session, &sql, &params, "fetch versioned history")?;
        self.finish(session)?;

        let mut applied = HashMap::new();
        let mut max_version = None;
        for row in outcome.rows {
            let mut cols = row.into_iter();
            let version = cols.next().and_then(|v| v.to_text());
            let Some(script) = cols.next().and_then(|v| v.to_text()) else {
                continue;
            };
            let checksum = cols.next().and_then(|v| v.to_text());

            if max_version.is_none() {
                max_version = version.clone();
            }
            applied
                .entry(script.to_lowercase())
                .or_insert(AppliedScript { version, checksum });
        }

        debug!(
            "Found {} applied versioned scripts, max version {:?}",
            applied.len(),
            max_version
        );
        Ok((applied, max_version))
    }

    /// Latest successful checksum per repeatable script, keyed by lowercased
    /// script name.
    pub fn fetch_repeatable_checksums(
        &self,
        session: &mut dyn WarehouseSession,
    ) -> Result<HashMap<String, String>, SchemaShiftError> {
        let sql = format!(
            "SELECT SCRIPT, CHECKSUM FROM {} WHERE SCRIPT_TYPE = ? AND STATUS = ? ORDER BY INSTALLED_ON DESC",
            self.qualified_name(session.dialect())
        );
        let params = [
            Value::from(ScriptKind::Repeatable.as_ref()),
            Value::from(ExecutionStatus::Success.as_ref()),
        ];
        let outcome = self.run(session, &sql, &params, "fetch repeatable history")?;
        self.finish(session)?;

        let mut checksums = HashMap::new();
        for row in outcome.rows {
            let mut cols = row.into_iter();
            let script = cols.next().and_then(|v| v.to_text());
            let checksum = cols.next().and_then(|v| v.to_text());
            if let (Some(script), Some(checksum)) = (script, checksum) {
                checksums.entry(script.to_lowercase()).or_insert(checksum);
            }
        }

        debug!("Found checksums for {} repeatable scripts", checksums.len());
        Ok(checksums)
    }

    pub fn fetch_state(&self, session: &mut dyn WarehouseSession) -> Result<LedgerState, SchemaShiftError> {
        let (applied_versions, max_version) = self.fetch_versioned(session)?;
        let repeatable_checksums = self.fetch_repeatable_checksums(session)?;
        Ok(LedgerState {
            applied_versions,
            repeatable_checksums,
            max_version,
        })
    }

    pub fn record(
        &self,
        session: &mut dyn WarehouseSession,
        entry: &ChangeHistoryRecord,
    ) -> Result<(), SchemaShiftError> {
        let sql = format!(
            "INSERT INTO {} (VERSION, DESCRIPTION, SCRIPT, SCRIPT_TYPE, CHECKSUM, EXECUTION_TIME, STATUS, INSTALLED_BY, INSTALLED_ON) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.qualified_name(session.dialect())
        );
        let params = [
            Value::from(entry.version.clone()),
            Value::from(entry.description.as_str()),
            Value::from(entry.script_name.as_str()),
            Value::from(entry.script_type.as_ref()),
            Value::from(entry.checksum.clone()),
            Value::from(entry.execution_time_seconds),
            Value::from(entry.status.as_ref()),
            Value::from(entry.installed_by.as_str()),
            Value::from(entry.installed_on.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
        ];
        self.run(session, &sql, &params, "record change history")?;
        self.finish(session)?;

        debug!(
            "Recorded {} {} as {}",
            entry.script_type.long_name(),
            entry.script_name,
            entry.status
        );
        Ok(())
    }

    fn count(
        &self,
        session: &mut dyn WarehouseSession,
        sql: &str,
        params: &[Value],
        context: &str,
    ) -> Result<i64, SchemaShiftError> {
        let outcome = self.run(session, sql, params, context)?;
        self.finish(session)?;
        Ok(outcome.scalar().and_then(Value::as_i64).unwrap_or(0))
    }

    fn run(
        &self,
        session: &mut dyn WarehouseSession,
        sql: &str,
        params: &[Value],
        context: &str,
    ) -> Result<QueryOutcome, SchemaShiftError> {
        session
            .execute(sql, params)
            .map_err(|e| SchemaShiftError::HistoryLedger(format!("{} on {} failed: {}", context, self.table, e)))
    }

    /// Ledger work is committed on its own so a later script rollback can
    /// never take a history row with it.
    fn finish(&self, session: &mut dyn WarehouseSession) -> Result<(), SchemaShiftError> {
        if session.autocommit() {
            return Ok(());
        }
        session
            .commit()
            .map_err(|e| SchemaShiftError::HistoryLedger(format!("commit on {} failed: {}", self.table, e)))
    }
}
