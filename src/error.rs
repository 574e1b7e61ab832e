use rusqlite::Error as RusqliteError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaShiftError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into SchemaShiftError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Configuration error: {0}")]
    ConfigError(#[from] Box<figment::Error>),

    #[error("Logger error: {0}")]
    LoggerError(#[from] flexi_logger::FlexiLoggerError),

    #[error("Invalid regular expression: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Invalid change history table name '{0}': expected [[database.]schema.]table")]
    InvalidHistoryTable(String),

    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("Duplicate script name '{name}': {first} and {second}")]
    DuplicateScriptName {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Duplicate version '{version}': {first} and {second}")]
    DuplicateVersion {
        version: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Version '{version}' of script {script} does not match validation pattern '{pattern}'")]
    InvalidVersion {
        script: String,
        version: String,
        pattern: String,
    },

    #[error("Versioned script {script} (version {version}) is older than the most recent applied version {max_version} and was never applied")]
    IgnoredVersionedScript {
        script: String,
        version: String,
        max_version: String,
    },

    #[error("Change history table {0} does not exist and table creation is disabled")]
    MissingHistoryTable(String),

    #[error("Failed to render {script}: {message}")]
    TemplateRender { script: String, message: String },

    #[error("Statement {index} (line {line}) of {script} failed: {message}")]
    Statement {
        script: String,
        index: usize,
        line: usize,
        message: String,
    },

    #[error("Change history error: {0}")]
    HistoryLedger(String),

    #[error("Warehouse session error: {0}")]
    Session(String),

    #[error("{failed} script(s) failed after applying {applied}: {summary}")]
    ScriptFailures {
        applied: usize,
        failed: usize,
        summary: String,
    },

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl From<figment::Error> for SchemaShiftError {
    fn from(err: figment::Error) -> Self {
        SchemaShiftError::ConfigError(Box::new(err))
    }
}

impl SchemaShiftError {
    /// Errors local to a single script. Everything else aborts the run.
    pub fn is_script_local(&self) -> bool {
        matches!(
            self,
            SchemaShiftError::TemplateRender { .. } | SchemaShiftError::Statement { .. }
        )
    }
}
