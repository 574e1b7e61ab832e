use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use flexi_logger::{Logger, LoggerHandle};
use log::{debug, info};

use crate::config::{CliOverrides, Config, ConnectionOverrides, LoggingConfig, LoggingOverrides};
use crate::error::SchemaShiftError;
use crate::runner::MigrationRunner;
use crate::session::SqliteSession;
use crate::template::{JinjaRenderer, Variables};

#[derive(Parser)]
#[command(
    name = "schemashift",
    version,
    about = "SchemaShift: apply versioned, repeatable and always change scripts to a warehouse"
)]
pub struct Cli {
    /// Config file (YAML, or TOML with a .toml extension). Defaults to
    /// schemashift-config.yml in the working directory when present.
    #[arg(long = "config-file", global = true)]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: OverrideArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Apply pending change scripts (default if no command specified)
    Deploy,

    /// Print the rendered text of one change script
    Render {
        /// Script file name, e.g. V1.1__add_users.sql
        script: String,
    },

    /// Check the scripts folder and report on the change history table
    Verify,
}

#[derive(Args, Default)]
pub struct OverrideArgs {
    /// Root folder holding the change scripts
    #[arg(long = "root-folder", short = 'f', global = true)]
    pub root_folder: Option<PathBuf>,

    /// Folder of shared templates for include/import
    #[arg(long = "modules-folder", short = 'm', global = true)]
    pub modules_folder: Option<PathBuf>,

    /// Template variables as a JSON object, merged over configured vars
    #[arg(long = "vars", global = true, value_parser = parse_vars)]
    pub vars: Option<Variables>,

    /// Change history table as [[database.]schema.]table
    #[arg(long = "change-history-table", short = 'c', global = true)]
    pub change_history_table: Option<String>,

    /// Create the change history table if it does not exist
    #[arg(long = "create-change-history-table", global = true)]
    pub create_change_history_table: bool,

    /// Plan and render without executing or recording anything
    #[arg(long = "dry-run", global = true)]
    pub dry_run: bool,

    /// Let the warehouse commit every statement on its own
    #[arg(long = "autocommit", global = true)]
    pub autocommit: bool,

    /// SQLite database file to deploy to
    #[arg(long = "database-path", short = 'd', global = true)]
    pub database_path: Option<PathBuf>,

    /// Recorded as INSTALLED_BY in the change history
    #[arg(long = "user", global = true)]
    pub user: Option<String>,

    /// error, warn, info, debug or trace
    #[arg(long = "log-level", global = true)]
    pub log_level: Option<String>,
}

impl OverrideArgs {
    /// Only flags given on the command line override lower layers.
    pub fn to_overrides(&self) -> CliOverrides {
        let connection = (self.database_path.is_some() || self.user.is_some()).then(|| ConnectionOverrides {
            database_path: self.database_path.clone(),
            user: self.user.clone(),
        });
        let logging = self.log_level.clone().map(|level| LoggingOverrides {
            schemashift: Some(level),
        });

        CliOverrides {
            root_folder: self.root_folder.clone(),
            modules_folder: self.modules_folder.clone(),
            vars: self.vars.clone(),
            change_history_table: self.change_history_table.clone(),
            create_change_history_table: self.create_change_history_table.then_some(true),
            dry_run: self.dry_run.then_some(true),
            autocommit: self.autocommit.then_some(true),
            connection,
            logging,
        }
    }
}

fn parse_vars(s: &str) -> Result<Variables, String> {
    match serde_json::from_str::<serde_json::Value>(s) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err("vars must be a JSON object".to_owned()),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}

impl Cli {
    pub fn handle_command_line() -> Result<(), SchemaShiftError> {
        let args = Cli::parse();
        let config = Config::load(args.config_file.as_deref(), &args.overrides.to_overrides())?;
        let _logger = Self::start_logger(&config.logging)?;
        debug!(
            "Root folder: {}, change history table: {}, {} template variables",
            config.root_folder.display(),
            config.change_history_table,
            config.vars.len()
        );

        // Default to Deploy if no command specified
        match args.command.unwrap_or(Command::Deploy) {
            Command::Deploy => Self::deploy(&config),
            Command::Render { script } => Self::render(&config, &script),
            Command::Verify => Self::verify(&config),
        }
    }

    fn start_logger(logging: &LoggingConfig) -> Result<LoggerHandle, SchemaShiftError> {
        Ok(Logger::try_with_env_or_str(logging.log_spec())?
            .log_to_stderr()
            .format(flexi_logger::default_format)
            .start()?)
    }

    fn open_session(config: &Config) -> Result<SqliteSession, SchemaShiftError> {
        SqliteSession::open(
            &config.connection.database_path,
            config.autocommit,
            &config.connection.user(),
        )
    }

    fn deploy(config: &Config) -> Result<(), SchemaShiftError> {
        let mut session = Self::open_session(config)?;
        let modules_folder = config.modules_folder();
        let renderer = JinjaRenderer::new(&config.root_folder, modules_folder.as_deref());

        info!(
            "Deploying {} to {}{}",
            config.root_folder.display(),
            config.connection.database_path.display(),
            if config.dry_run { " (dry run)" } else { "" }
        );
        let summary = MigrationRunner::new(config, &renderer).run(&mut session)?;

        let verb = if config.dry_run { "would be applied" } else { "applied" };
        println!(
            "{} change script(s) {}, {} skipped",
            summary.applied_count, verb, summary.skipped_count
        );
        Ok(())
    }

    fn render(config: &Config, script: &str) -> Result<(), SchemaShiftError> {
        let modules_folder = config.modules_folder();
        let renderer = JinjaRenderer::new(&config.root_folder, modules_folder.as_deref());
        let content = MigrationRunner::new(config, &renderer).render_script(script)?;
        println!("{}", content);
        Ok(())
    }

    fn verify(config: &Config) -> Result<(), SchemaShiftError> {
        let mut session = Self::open_session(config)?;
        let modules_folder = config.modules_folder();
        let renderer = JinjaRenderer::new(&config.root_folder, modules_folder.as_deref());
        let report = MigrationRunner::new(config, &renderer).verify(&mut session)?;

        println!("Change scripts:        {}", report.script_count);
        println!("Change history table:  {}", report.history_table);
        if report.table_exists {
            println!("Applied versions:      {}", report.applied_versioned_count);
            println!(
                "Max applied version:   {}",
                report.max_version.as_deref().unwrap_or("-")
            );
        } else {
            println!("Table status:          missing");
        }
        Ok(())
    }
}
