use std::time::{Duration, Instant};

use log::{debug, error, trace, Level};
use logging_timer::timer;

use crate::error::SchemaShiftError;
use crate::hash::Hash;
use crate::history::ExecutionStatus;
use crate::redact::Redactor;
use crate::scripts::Script;
use crate::session::WarehouseSession;
use crate::statements::{is_blank_or_comment_only, split_statements, Statement};
use crate::template::{TemplateRenderer, Variables};

/// A script rendered to SQL, with the checksum of the rendered text.
#[derive(Clone, Debug)]
pub struct RenderedScript<'a> {
    pub script: &'a Script,
    pub content: String,
    pub checksum: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub execution_time: Duration,
    pub query_id: Option<String>,
    pub rows_affected: Option<u64>,
}

impl ExecutionResult {
    fn success(execution_time: Duration, query_id: Option<String>, rows_affected: Option<u64>) -> Self {
        ExecutionResult {
            status: ExecutionStatus::Success,
            error: None,
            execution_time,
            query_id,
            rows_affected,
        }
    }

    fn failure(execution_time: Duration, message: String) -> Self {
        ExecutionResult {
            status: ExecutionStatus::Failed,
            error: Some(message),
            execution_time,
            query_id: None,
            rows_affected: None,
        }
    }
}

/// Outcome of running one script's statements. `results` holds one entry per
/// statement that was attempted; statements after a failure are absent.
#[derive(Clone, Debug)]
pub struct ExecutionReport {
    pub script: String,
    pub statements: Vec<Statement>,
    pub results: Vec<ExecutionResult>,
    pub success_count: usize,
    pub failure_count: usize,
    pub total_execution_time: Duration,
}

impl ExecutionReport {
    pub fn is_successful(&self) -> bool {
        self.failure_count == 0
    }

    /// The first failed statement as an error, if any.
    pub fn error(&self) -> Option<SchemaShiftError> {
        let (statement, result) = self
            .statements
            .iter()
            .zip(&self.results)
            .find(|(_, r)| r.status == ExecutionStatus::Failed)?;

        Some(SchemaShiftError::Statement {
            script: self.script.clone(),
            index: statement.index,
            line: statement.line_number,
            message: result.error.clone().unwrap_or_default(),
        })
    }
}

/// Renders scripts and runs their statements against a session.
pub struct ScriptExecutor<'a> {
    renderer: &'a dyn TemplateRenderer,
    variables: &'a Variables,
    redactor: Redactor,
}

impl<'a> ScriptExecutor<'a> {
    pub fn new(renderer: &'a dyn TemplateRenderer, variables: &'a Variables) -> Self {
        ScriptExecutor {
            renderer,
            variables,
            redactor: Redactor::from_variables(variables),
        }
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub fn render<'s>(&self, script: &'s Script) -> Result<RenderedScript<'s>, SchemaShiftError> {
        let content = self.renderer.render(&script.file_path, self.variables)?;
        if is_blank_or_comment_only(&content) {
            return Err(SchemaShiftError::TemplateRender {
                script: script.display_name.clone(),
                message: "rendered script contains no SQL statements".to_owned(),
            });
        }

        let checksum = Hash::compute_checksum(&content);
        trace!("Rendered {} with checksum {}", script.display_name, checksum);
        Ok(RenderedScript {
            script,
            content,
            checksum,
        })
    }

    /// Run every statement of a rendered script in order, stopping at the
    /// first failure.
    ///
    /// Outside autocommit mode the script runs as one transaction: committed
    /// when all statements succeed, rolled back otherwise. A failing commit or
    /// rollback is returned as an error.
    pub fn execute(
        &self,
        session: &mut dyn WarehouseSession,
        rendered: &RenderedScript,
    ) -> Result<ExecutionReport, SchemaShiftError> {
        let name = rendered.script.display_name.as_str();
        let _tmr = timer!(Level::Trace; "ScriptExecutor::execute", "{}", name);

        let statements = split_statements(&rendered.content);
        let mut report = ExecutionReport {
            script: name.to_owned(),
            statements: Vec::with_capacity(statements.len()),
            results: Vec::with_capacity(statements.len()),
            success_count: 0,
            failure_count: 0,
            total_execution_time: Duration::ZERO,
        };

        for statement in statements {
            let result = self.execute_statement(session, name, &statement);
            report.total_execution_time += result.execution_time;
            let failed = result.status == ExecutionStatus::Failed;
            if failed {
                report.failure_count += 1;
            } else {
                report.success_count += 1;
            }
            report.statements.push(statement);
            report.results.push(result);
            if failed {
                break;
            }
        }

        if !session.autocommit() {
            if report.is_successful() {
                session.commit()?;
            } else {
                session.rollback()?;
                debug!("Rolled back {}", name);
            }
        }

        Ok(report)
    }

    fn execute_statement(
        &self,
        session: &mut dyn WarehouseSession,
        script: &str,
        statement: &Statement,
    ) -> ExecutionResult {
        if statement.is_empty() {
            return ExecutionResult::success(Duration::ZERO, None, None);
        }

        debug!(
            "{} statement {} (line {}): {}",
            script,
            statement.index,
            statement.line_number,
            self.redactor.redact(&statement.sql_without_comments)
        );

        let start = Instant::now();
        let outcome = if statement.is_transfer {
            session.execute_file_transfer(&statement.sql)
        } else {
            session.execute(&statement.sql, &[])
        };
        let elapsed = start.elapsed();

        match outcome {
            Ok(outcome) => ExecutionResult::success(elapsed, outcome.query_id, outcome.rows_affected),
            Err(e) => {
                let message = self.redactor.redact(&e.to_string()).into_owned();
                error!(
                    "{} statement {} (line {}) failed: {}",
                    script, statement.index, statement.line_number, message
                );
                ExecutionResult::failure(elapsed, message)
            }
        }
    }
}
