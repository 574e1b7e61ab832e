use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SchemaShiftError;
use crate::history::ChangeHistoryTable;
use crate::scripts::{version_regex, ScriptKind};
use crate::template::Variables;

pub const DEFAULT_CONFIG_FILE: &str = "schemashift-config.yml";
const ENV_PREFIX: &str = "SCHEMASHIFT_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub schemashift: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const SCHEMASHIFT_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            schemashift: Self::SCHEMASHIFT_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        // Invalid levels fall back to the default rather than failing the run
        let str_original = self.schemashift.clone();
        self.schemashift = self.schemashift.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.schemashift.as_str()) {
            eprintln!(
                "Config error: schemashift log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::SCHEMASHIFT_LEVEL
            );
            self.schemashift = Self::SCHEMASHIFT_LEVEL.to_owned();
        }
    }

    /// flexi_logger spec string
    pub fn log_spec(&self) -> String {
        format!("schemashift={}", self.schemashift)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ContinueOnError {
    pub versioned: bool,
    pub repeatable: bool,
    pub always: bool,
}

impl ContinueOnError {
    pub fn for_kind(&self, kind: ScriptKind) -> bool {
        match kind {
            ScriptKind::Versioned => self.versioned,
            ScriptKind::Repeatable => self.repeatable,
            ScriptKind::Always => self.always,
        }
    }
}

/// What a dry run does when the history table does not exist yet.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DryRunMissingHistory {
    /// Plan every script against empty history
    #[default]
    Plan,
    /// Stop without planning anything
    Skip,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// SQLite database file standing in for the warehouse
    pub database_path: PathBuf,
    /// Recorded as INSTALLED_BY. Defaults to the login user.
    pub user: Option<String>,
}

impl ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            database_path: PathBuf::from("schemashift.db"),
            user: None,
        }
    }

    pub fn user(&self) -> String {
        self.user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| "schemashift".to_owned())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub root_folder: PathBuf,
    pub modules_folder: Option<PathBuf>,
    pub vars: Variables,
    pub change_history_table: String,
    pub create_change_history_table: bool,
    pub dry_run: bool,
    pub dry_run_missing_history: DryRunMissingHistory,
    pub autocommit: bool,
    pub continue_on_error: ContinueOnError,
    pub version_number_validation_regex: Option<String>,
    pub raise_exception_on_ignored_versioned_script: bool,
    pub connection: ConnectionConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root_folder: PathBuf::from("."),
            modules_folder: None,
            vars: Variables::new(),
            change_history_table: ChangeHistoryTable::default().fully_qualified(),
            create_change_history_table: false,
            dry_run: false,
            dry_run_missing_history: DryRunMissingHistory::default(),
            autocommit: false,
            continue_on_error: ContinueOnError::default(),
            version_number_validation_regex: None,
            raise_exception_on_ignored_versioned_script: false,
            connection: ConnectionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Values given on the command line. Unset fields leave lower layers alone.
#[derive(Serialize, Debug, Clone, Default)]
pub struct CliOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_folder: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modules_folder: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vars: Option<Variables>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_history_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_change_history_table: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autocommit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingOverrides>,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct ConnectionOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct LoggingOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schemashift: Option<String>,
}

impl Config {
    /// Layers, lowest precedence first: defaults, config file, `SCHEMASHIFT_`
    /// environment variables, command line.
    ///
    /// An explicitly named config file must exist. Without one,
    /// `schemashift-config.yml` in the working directory is used if present.
    pub fn load(config_file: Option<&Path>, overrides: &CliOverrides) -> Result<Self, SchemaShiftError> {
        let figment = Self::figment(config_file, overrides)?;
        let mut config: Config = figment.extract()?;
        config.ensure_valid();
        Ok(config)
    }

    pub fn figment(config_file: Option<&Path>, overrides: &CliOverrides) -> Result<Figment, SchemaShiftError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        match config_file {
            Some(path) => {
                if !path.is_file() {
                    return Err(SchemaShiftError::Error(format!(
                        "Config file '{}' does not exist",
                        path.display()
                    )));
                }
                figment = Self::merge_file(figment, path);
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.is_file() {
                    figment = Self::merge_file(figment, default_path);
                }
            }
        }

        Ok(figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Serialized::globals(overrides)))
    }

    fn merge_file(figment: Figment, path: &Path) -> Figment {
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
        if is_toml {
            figment.merge(Toml::file(path))
        } else {
            figment.merge(Yaml::file(path))
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
    }

    pub fn history_table(&self) -> Result<ChangeHistoryTable, SchemaShiftError> {
        ChangeHistoryTable::parse(&self.change_history_table)
    }

    pub fn version_pattern(&self) -> Result<Option<Regex>, SchemaShiftError> {
        self.version_number_validation_regex
            .as_deref()
            .map(version_regex)
            .transpose()
    }

    /// Modules folder resolved against the root folder when relative
    pub fn modules_folder(&self) -> Option<PathBuf> {
        self.modules_folder.as_ref().map(|m| {
            if m.is_absolute() || m.exists() {
                m.clone()
            } else {
                self.root_folder.join(m)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.change_history_table, "METADATA.SCHEMACHANGE.CHANGE_HISTORY");
        assert_eq!(config.root_folder, PathBuf::from("."));
        assert_eq!(config.dry_run_missing_history, DryRunMissingHistory::Plan);
        assert!(!config.continue_on_error.for_kind(ScriptKind::Always));
        assert_eq!(config.logging.log_spec(), "schemashift=info");
    }

    #[test]
    fn test_yaml_file_env_and_cli_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
root_folder: migrations
change_history_table: audit.history
create_change_history_table: true
vars:
  db: ANALYTICS
  secrets:
    password: hunter2
continue_on_error:
  repeatable: true
"#,
            )?;
            jail.set_env("SCHEMASHIFT_DRY_RUN", "true");
            jail.set_env("SCHEMASHIFT_CONTINUE_ON_ERROR__ALWAYS", "true");

            let overrides = CliOverrides {
                change_history_table: Some("db.audit.cli_history".into()),
                ..Default::default()
            };
            let config = Config::load(None, &overrides).expect("config loads");

            assert_eq!(config.root_folder, PathBuf::from("migrations"));
            assert_eq!(config.change_history_table, "db.audit.cli_history");
            assert!(config.create_change_history_table);
            assert!(config.dry_run);
            assert_eq!(
                config.continue_on_error,
                ContinueOnError {
                    versioned: false,
                    repeatable: true,
                    always: true
                }
            );
            assert_eq!(config.vars["db"], serde_json::json!("ANALYTICS"));
            assert_eq!(config.vars["secrets"]["password"], serde_json::json!("hunter2"));
            Ok(())
        });
    }

    #[test]
    fn test_cli_vars_merge_with_file_vars() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "[vars]\na = 1\nb = 2\n")?;

            let mut vars = Variables::new();
            vars.insert("b".into(), serde_json::json!(20));
            let overrides = CliOverrides {
                vars: Some(vars),
                ..Default::default()
            };
            let config = Config::load(Some(Path::new("custom.toml")), &overrides).expect("config loads");

            assert_eq!(config.vars["a"], serde_json::json!(1));
            assert_eq!(config.vars["b"], serde_json::json!(20));
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_config_file() {
        Jail::expect_with(|_jail| {
            let err = Config::load(Some(Path::new("nope.yml")), &CliOverrides::default()).unwrap_err();
            assert!(matches!(err, SchemaShiftError::Error(_)));
            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level_falls_back() {
        Jail::expect_with(|jail| {
            jail.set_env("SCHEMASHIFT_LOGGING__SCHEMASHIFT", " LOUD ");
            let config = Config::load(None, &CliOverrides::default()).expect("config loads");
            assert_eq!(config.logging.schemashift, "info");

            jail.set_env("SCHEMASHIFT_LOGGING__SCHEMASHIFT", " DEBUG ");
            let config = Config::load(None, &CliOverrides::default()).expect("config loads");
            assert_eq!(config.logging.schemashift, "debug");
            Ok(())
        });
    }

    #[test]
    fn test_dry_run_missing_history_values() {
        Jail::expect_with(|jail| {
            jail.set_env("SCHEMASHIFT_DRY_RUN_MISSING_HISTORY", "skip");
            let config = Config::load(None, &CliOverrides::default()).expect("config loads");
            assert_eq!(config.dry_run_missing_history, DryRunMissingHistory::Skip);
            Ok(())
        });
    }

    #[test]
    fn test_derived_values() {
        let config = Config {
            change_history_table: "a.b.c.d".into(),
            version_number_validation_regex: Some(r"\d+".into()),
            ..Default::default()
        };
        assert!(config.history_table().is_err());

        let pattern = config.version_pattern().unwrap().unwrap();
        assert!(pattern.is_match("12"));
        assert!(!pattern.is_match("1.2"));

        let config = Config {
            version_number_validation_regex: Some("(".into()),
            ..Default::default()
        };
        assert!(matches!(config.version_pattern(), Err(SchemaShiftError::RegexError(_))));
    }
}
