use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info, warn, Level};
use logging_timer::timer;

use crate::config::{Config, DryRunMissingHistory};
use crate::error::SchemaShiftError;
use crate::executor::ScriptExecutor;
use crate::hash::Hash;
use crate::history::{ChangeHistoryRecord, ExecutionStatus, HistoryLedger, LedgerState};
use crate::planner::MigrationPlanner;
use crate::scripts::{Script, ScriptCatalog};
use crate::session::WarehouseSession;
use crate::template::TemplateRenderer;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub applied_count: usize,
    pub skipped_count: usize,
}

#[derive(Debug)]
pub struct ScriptFailure {
    pub script: String,
    pub error: SchemaShiftError,
}

/// State of the change history table and the script folder, as reported by
/// `verify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub history_table: String,
    pub table_exists: bool,
    pub script_count: usize,
    pub applied_versioned_count: usize,
    pub max_version: Option<String>,
}

pub struct MigrationRunner<'a> {
    config: &'a Config,
    renderer: &'a dyn TemplateRenderer,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(config: &'a Config, renderer: &'a dyn TemplateRenderer) -> Self {
        MigrationRunner { config, renderer }
    }

    fn scan(&self) -> Result<ScriptCatalog, SchemaShiftError> {
        let pattern = self.config.version_pattern()?;
        let modules_folder = self.config.modules_folder();
        ScriptCatalog::scan(&self.config.root_folder, modules_folder.as_deref(), pattern.as_ref())
    }

    /// Apply every pending script in plan order and record each outcome.
    ///
    /// Script-local failures are recorded, then either abort the run or are
    /// collected per the kind's continue-on-error flag. Any failure makes the
    /// run return `ScriptFailures` naming every failed script.
    pub fn run(&self, session: &mut dyn WarehouseSession) -> Result<RunSummary, SchemaShiftError> {
        let config = self.config;
        let ledger = HistoryLedger::new(config.history_table()?);
        let catalog = self.scan()?;
        info!(
            "Found {} change scripts under {}",
            catalog.len(),
            config.root_folder.display()
        );

        let outcome = ledger.ensure_table(session, config.create_change_history_table, config.dry_run)?;
        let state = if outcome.has_history() {
            ledger.fetch_state(session)?
        } else if outcome.usable() {
            LedgerState::default()
        } else {
            match config.dry_run_missing_history {
                DryRunMissingHistory::Plan => {
                    info!("Dry run: planning against empty history");
                    LedgerState::default()
                }
                DryRunMissingHistory::Skip => {
                    info!("Dry run: change history table {} is missing, nothing planned", ledger.table());
                    return Ok(RunSummary::default());
                }
            }
        };
        if let Some(max_version) = &state.max_version {
            info!("Max applied change script version: {}", max_version);
        }

        let planner = MigrationPlanner::new(&state, config.raise_exception_on_ignored_versioned_script);
        let plan = planner.plan(&catalog)?;
        let executor = ScriptExecutor::new(self.renderer, &config.vars);

        let mut summary = RunSummary {
            applied_count: 0,
            skipped_count: plan.skip_count(),
        };
        let mut failures: Vec<ScriptFailure> = Vec::new();

        for script in plan.scripts {
            let _tmr = timer!(Level::Debug; "MigrationRunner::apply", "{}", script.display_name);
            let start = Instant::now();

            let rendered = match executor.render(script) {
                Ok(rendered) => rendered,
                Err(e) if e.is_script_local() => {
                    error!("{}", e);
                    if !config.dry_run {
                        self.record(&ledger, session, script, None, start, ExecutionStatus::Failed)?;
                    }
                    failures.push(ScriptFailure {
                        script: script.display_name.clone(),
                        error: e,
                    });
                    if config.continue_on_error.for_kind(script.kind) {
                        continue;
                    }
                    break;
                }
                Err(e) => return Err(e),
            };

            if let Some(reason) = planner.decide(script, &rendered.checksum) {
                debug!("Skipping {}: {}", script.display_name, reason);
                summary.skipped_count += 1;
                continue;
            }

            if config.dry_run {
                info!(
                    "Dry run: would apply {} {} (checksum {})",
                    script.kind.long_name(),
                    script.display_name,
                    &rendered.checksum
                );
                debug!("{}", executor.redactor().redact(&rendered.content));
                summary.applied_count += 1;
                continue;
            }

            info!(
                "Applying {} {}{}",
                script.kind.long_name(),
                script.display_name,
                script.version().map(|v| format!(" (version {})", v)).unwrap_or_default()
            );
            let report = match executor.execute(session, &rendered) {
                Ok(report) => report,
                Err(e) => {
                    // commit or rollback failed, so the outcome is unknown
                    error!("Could not finish {}: {}", script.display_name, e);
                    self.record(&ledger, session, script, Some(&rendered.checksum), start, ExecutionStatus::Failed)?;
                    return Err(e);
                }
            };
            let status = if report.is_successful() {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::Failed
            };
            self.record(&ledger, session, script, Some(&rendered.checksum), start, status)?;

            match report.error() {
                None => {
                    info!(
                        "Applied {} in {:.3}s",
                        script.display_name,
                        report.total_execution_time.as_secs_f64()
                    );
                    summary.applied_count += 1;
                }
                Some(e) => {
                    failures.push(ScriptFailure {
                        script: script.display_name.clone(),
                        error: e,
                    });
                    if !config.continue_on_error.for_kind(script.kind) {
                        break;
                    }
                    warn!("Continuing after failure of {}", script.display_name);
                }
            }
        }

        if failures.is_empty() {
            info!(
                "Completed: {} applied, {} skipped",
                summary.applied_count, summary.skipped_count
            );
            return Ok(summary);
        }

        let summary_text = failures
            .iter()
            .map(|f| format!("{}: {}", f.script, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        Err(SchemaShiftError::ScriptFailures {
            applied: summary.applied_count,
            failed: failures.len(),
            summary: summary_text,
        })
    }

    fn record(
        &self,
        ledger: &HistoryLedger,
        session: &mut dyn WarehouseSession,
        script: &Script,
        checksum: Option<&str>,
        start: Instant,
        status: ExecutionStatus,
    ) -> Result<(), SchemaShiftError> {
        let entry = ChangeHistoryRecord {
            version: script.version.clone(),
            description: script.description.clone(),
            script_name: script.display_name.clone(),
            script_type: script.kind,
            checksum: checksum.map(str::to_owned),
            execution_time_seconds: start.elapsed().as_secs_f64().round() as i64,
            status,
            installed_by: session.user().to_owned(),
            installed_on: Utc::now(),
        };
        debug!(
            "Recording {} {} checksum {}",
            script.display_name,
            status,
            Hash::short_checksum(&checksum)
        );
        ledger.record(session, &entry)
    }

    /// Rendered text of one script, looked up by file name.
    pub fn render_script(&self, name: &str) -> Result<String, SchemaShiftError> {
        let catalog = self.scan()?;
        let script = catalog
            .find(name)
            .ok_or_else(|| SchemaShiftError::Error(format!("No change script named '{}'", name)))?;
        let executor = ScriptExecutor::new(self.renderer, &self.config.vars);
        let rendered = executor.render(script)?;
        Ok(rendered.content)
    }

    /// Check the scripts scan cleanly and report on the history table
    /// without changing anything.
    pub fn verify(&self, session: &mut dyn WarehouseSession) -> Result<VerifyReport, SchemaShiftError> {
        let catalog = self.scan()?;
        let ledger = HistoryLedger::new(self.config.history_table()?);
        let table_exists = ledger.table_exists(session)?;

        let (applied_versioned_count, max_version) = if table_exists {
            let (applied, max_version) = ledger.fetch_versioned(session)?;
            (applied.len(), max_version)
        } else {
            (0, None)
        };

        Ok(VerifyReport {
            history_table: ledger.table().fully_qualified(),
            table_exists,
            script_count: catalog.len(),
            applied_versioned_count,
            max_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContinueOnError;
    use crate::session::testing::ScriptedSession;
    use crate::session::{SqliteSession, Value};
    use crate::template::JinjaRenderer;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const HISTORY: &str = r#""METADATA.SCHEMACHANGE.CHANGE_HISTORY""#;

    #[derive(Debug, PartialEq)]
    struct Row {
        version: Option<String>,
        script: String,
        script_type: String,
        status: String,
        checksum: Option<String>,
    }

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    fn config(dir: &TempDir) -> Config {
        Config {
            root_folder: dir.path().to_path_buf(),
            create_change_history_table: true,
            ..Default::default()
        }
    }

    fn session() -> SqliteSession {
        SqliteSession::open_in_memory(false, "deployer").unwrap()
    }

    fn run(config: &Config, session: &mut SqliteSession) -> Result<RunSummary, SchemaShiftError> {
        let renderer = JinjaRenderer::new(&config.root_folder, None);
        MigrationRunner::new(config, &renderer).run(session)
    }

    fn history(session: &mut SqliteSession) -> Vec<Row> {
        let sql = format!(
            "SELECT VERSION, SCRIPT, SCRIPT_TYPE, STATUS, CHECKSUM, INSTALLED_BY FROM {} ORDER BY rowid",
            HISTORY
        );
        session
            .execute(&sql, &[])
            .unwrap()
            .rows
            .into_iter()
            .map(|row| {
                assert_eq!(row[5], Value::from("deployer"));
                Row {
                    version: row[0].to_text(),
                    script: row[1].to_text().unwrap(),
                    script_type: row[2].to_text().unwrap(),
                    status: row[3].to_text().unwrap(),
                    checksum: row[4].to_text(),
                }
            })
            .collect()
    }

    fn table_exists(session: &mut SqliteSession, name: &str) -> bool {
        session
            .execute("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?", &[Value::from(name)])
            .unwrap()
            .scalar()
            .and_then(Value::as_i64)
            == Some(1)
    }

    #[test]
    fn test_empty_folder() {
        let dir = TempDir::new().unwrap();
        let mut session = session();

        let summary = run(&config(&dir), &mut session).unwrap();
        assert_eq!(summary, RunSummary::default());
        assert!(history(&mut session).is_empty());
    }

    #[test]
    fn test_versioned_applied_once() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "V1__init.sql", "CREATE TABLE t(x INT);");
        let config = config(&dir);
        let mut session = session();

        let summary = run(&config, &mut session).unwrap();
        assert_eq!(summary, RunSummary { applied_count: 1, skipped_count: 0 });
        assert!(table_exists(&mut session, "t"));

        let rows = history(&mut session);
        assert_eq!(
            rows,
            vec![Row {
                version: Some("1".into()),
                script: "V1__init.sql".into(),
                script_type: "V".into(),
                status: "Success".into(),
                checksum: Some(Hash::compute_checksum("CREATE TABLE t(x INT);")),
            }]
        );

        let summary = run(&config, &mut session).unwrap();
        assert_eq!(summary, RunSummary { applied_count: 0, skipped_count: 1 });
        assert_eq!(history(&mut session).len(), 1);
    }

    #[test]
    fn test_repeatable_reapplied_only_on_change() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "R__seed.sql", "CREATE TABLE IF NOT EXISTS s(x INT);");
        let config = config(&dir);
        let mut session = session();

        assert_eq!(run(&config, &mut session).unwrap().applied_count, 1);
        assert_eq!(
            run(&config, &mut session).unwrap(),
            RunSummary { applied_count: 0, skipped_count: 1 }
        );

        write(dir.path(), "R__seed.sql", "CREATE TABLE IF NOT EXISTS s(x INT, y INT);");
        assert_eq!(run(&config, &mut session).unwrap().applied_count, 1);

        let rows = history(&mut session);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.script_type == "R" && r.version.is_none()));
        assert_ne!(rows[0].checksum, rows[1].checksum);
    }

    #[test]
    fn test_always_applied_every_run() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "A__touch.sql", "CREATE TABLE IF NOT EXISTS a(x INT);");
        let config = config(&dir);
        let mut session = session();

        for _ in 0..3 {
            assert_eq!(
                run(&config, &mut session).unwrap(),
                RunSummary { applied_count: 1, skipped_count: 0 }
            );
        }
        assert_eq!(history(&mut session).len(), 3);
    }

    #[test]
    fn test_newer_versions_applied_after_history() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "V1__a.sql", "CREATE TABLE a(x INT);");
        let config = config(&dir);
        let mut session = session();
        run(&config, &mut session).unwrap();

        write(dir.path(), "V1.1__b.sql", "CREATE TABLE b(x INT);");
        write(dir.path(), "V0.9__old.sql", "CREATE TABLE old(x INT);");
        let summary = run(&config, &mut session).unwrap();
        assert_eq!(summary, RunSummary { applied_count: 1, skipped_count: 2 });
        assert!(table_exists(&mut session, "b"));
        assert!(!table_exists(&mut session, "old"));
    }

    #[test]
    fn test_failure_aborts_by_default() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "V1__bad.sql", "CREATE TABLE ok(x INT);\nINSERT INTO missing VALUES (1);");
        write(dir.path(), "V2__good.sql", "CREATE TABLE good(x INT);");
        let config = config(&dir);
        let mut session = session();

        let err = run(&config, &mut session).unwrap_err();
        match err {
            SchemaShiftError::ScriptFailures { applied, failed, summary } => {
                assert_eq!((applied, failed), (0, 1));
                assert!(summary.contains("V1__bad.sql"));
                assert!(summary.contains("line 2"));
            }
            other => panic!("unexpected error {other:?}"),
        }

        let rows = history(&mut session);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "Failed");
        assert!(!table_exists(&mut session, "ok"));
        assert!(!table_exists(&mut session, "good"));
    }

    #[test]
    fn test_continue_on_error_attempts_remaining_scripts() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "V1__bad.sql", "INSERT INTO missing VALUES (1);");
        write(dir.path(), "V2__good.sql", "CREATE TABLE good(x INT);");
        write(dir.path(), "R__broken.sql", "SELECT {{ undefined_var }};");
        write(dir.path(), "A__fine.sql", "CREATE TABLE IF NOT EXISTS fine(x INT);");
        let config = Config {
            continue_on_error: ContinueOnError {
                versioned: true,
                repeatable: true,
                always: false,
            },
            ..config(&dir)
        };
        let mut session = session();

        let err = run(&config, &mut session).unwrap_err();
        assert!(matches!(err, SchemaShiftError::ScriptFailures { applied: 2, failed: 2, .. }));

        let rows = history(&mut session);
        let statuses: Vec<_> = rows.iter().map(|r| (r.script.as_str(), r.status.as_str())).collect();
        assert_eq!(
            statuses,
            vec![
                ("V1__bad.sql", "Failed"),
                ("V2__good.sql", "Success"),
                ("R__broken.sql", "Failed"),
                ("A__fine.sql", "Success"),
            ]
        );
        assert_eq!(rows[2].checksum, None);
    }

    #[test]
    fn test_ledger_failure_ignores_continue_on_error() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "V1__drop_history.sql", &format!("DROP TABLE {};", HISTORY));
        write(dir.path(), "V2__after.sql", "CREATE TABLE after_drop(x INT);");
        let config = Config {
            continue_on_error: ContinueOnError {
                versioned: true,
                repeatable: true,
                always: true,
            },
            ..config(&dir)
        };
        let mut session = session();

        let err = run(&config, &mut session).unwrap_err();
        assert!(matches!(err, SchemaShiftError::HistoryLedger(_)));
        assert!(!table_exists(&mut session, "after_drop"));
    }

    #[test]
    fn test_commit_failure_is_recorded_before_aborting() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "V1__load.sql", "CREATE TABLE loaded(x INT);");
        write(dir.path(), "V2__next.sql", "CREATE TABLE next_one(x INT);");
        let config = Config {
            continue_on_error: ContinueOnError {
                versioned: true,
                ..Default::default()
            },
            ..config(&dir)
        };
        let renderer = JinjaRenderer::new(&config.root_folder, None);
        let mut session = ScriptedSession::new();
        session
            .respond_count("INFORMATION_SCHEMA.TABLES", 1)
            .fail_commit_after("loaded", "commit lost");

        let err = MigrationRunner::new(&config, &renderer).run(&mut session).unwrap_err();
        assert!(matches!(err, SchemaShiftError::Session(ref msg) if msg == "commit lost"));

        let (sql, params) = session.executed.last().unwrap();
        assert!(sql.starts_with("INSERT INTO") && sql.contains("CHANGE_HISTORY"));
        assert_eq!(params[2], Value::from("V1__load.sql"));
        assert_eq!(params[6], Value::from("Failed"));
        assert!(session.executed_sql().iter().all(|sql| !sql.contains("next_one")));
    }

    #[test]
    fn test_missing_history_table_without_create() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "V1__init.sql", "CREATE TABLE t(x INT);");
        let config = Config {
            create_change_history_table: false,
            ..config(&dir)
        };
        let mut session = session();

        let err = run(&config, &mut session).unwrap_err();
        assert!(matches!(err, SchemaShiftError::MissingHistoryTable(_)));
        assert!(!table_exists(&mut session, "t"));
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "V1__init.sql", "CREATE TABLE t(x INT);");
        write(dir.path(), "A__always.sql", "CREATE TABLE IF NOT EXISTS a(x INT);");
        let config = Config {
            dry_run: true,
            ..config(&dir)
        };
        let mut session = session();

        let summary = run(&config, &mut session).unwrap();
        assert_eq!(summary, RunSummary { applied_count: 2, skipped_count: 0 });
        assert!(!table_exists(&mut session, "METADATA.SCHEMACHANGE.CHANGE_HISTORY"));
        assert!(!table_exists(&mut session, "t"));

        let config = Config {
            dry_run_missing_history: DryRunMissingHistory::Skip,
            ..config
        };
        assert_eq!(run(&config, &mut session).unwrap(), RunSummary::default());
    }

    #[test]
    fn test_dry_run_uses_existing_history() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "V1__init.sql", "CREATE TABLE t(x INT);");
        let config = config(&dir);
        let mut session = session();
        run(&config, &mut session).unwrap();

        write(dir.path(), "V2__next.sql", "CREATE TABLE u(x INT);");
        let dry = Config {
            dry_run: true,
            ..config
        };
        let summary = run(&dry, &mut session).unwrap();
        assert_eq!(summary, RunSummary { applied_count: 1, skipped_count: 1 });
        assert!(!table_exists(&mut session, "u"));
        assert_eq!(history(&mut session).len(), 1);
    }

    #[test]
    fn test_render_and_verify() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "V1__init.sql.jinja", "CREATE TABLE {{ name }}(x INT);");
        let mut config = config(&dir);
        config.vars.insert("name".into(), serde_json::json!("t"));
        let renderer = JinjaRenderer::new(&config.root_folder, None);
        let runner = MigrationRunner::new(&config, &renderer);
        let mut session = session();

        assert_eq!(runner.render_script("V1__init.sql").unwrap(), "CREATE TABLE t(x INT);");
        assert!(runner.render_script("V9__nope.sql").is_err());

        let report = runner.verify(&mut session).unwrap();
        assert!(!report.table_exists);
        assert_eq!(report.script_count, 1);

        runner.run(&mut session).unwrap();
        let report = runner.verify(&mut session).unwrap();
        assert_eq!(
            report,
            VerifyReport {
                history_table: "METADATA.SCHEMACHANGE.CHANGE_HISTORY".into(),
                table_exists: true,
                script_count: 1,
                applied_versioned_count: 1,
                max_version: Some("1".into()),
            }
        );
    }
}
