use std::collections::VecDeque;

use crate::error::SchemaShiftError;

use super::{Dialect, QueryOutcome, Value, WarehouseSession};

/// Session double speaking the Snowflake dialect. Queries are matched by
/// substring against canned responses; everything else succeeds with no rows.
pub struct ScriptedSession {
    pub executed: Vec<(String, Vec<Value>)>,
    pub transfers: Vec<String>,
    pub commits: usize,
    pub rollbacks: usize,
    pub autocommit: bool,
    responses: Vec<(String, VecDeque<QueryOutcome>)>,
    failures: Vec<(String, String)>,
    commit_failures: Vec<(String, String)>,
}

impl ScriptedSession {
    pub fn new() -> Self {
        ScriptedSession {
            executed: Vec::new(),
            transfers: Vec::new(),
            commits: 0,
            rollbacks: 0,
            autocommit: false,
            responses: Vec::new(),
            failures: Vec::new(),
            commit_failures: Vec::new(),
        }
    }

    /// Queue a response for the next query containing `needle`. The last
    /// queued response for a needle is reused once the queue drains to one.
    pub fn respond(&mut self, needle: &str, outcome: QueryOutcome) -> &mut Self {
        match self.responses.iter_mut().find(|(n, _)| n == needle) {
            Some((_, queue)) => queue.push_back(outcome),
            None => self.responses.push((needle.to_owned(), VecDeque::from([outcome]))),
        }
        self
    }

    pub fn respond_count(&mut self, needle: &str, count: i64) -> &mut Self {
        self.respond(needle, QueryOutcome::with_rows(vec![vec![Value::Integer(count)]]))
    }

    pub fn fail_on(&mut self, needle: &str, message: &str) -> &mut Self {
        self.failures.push((needle.to_owned(), message.to_owned()));
        self
    }

    /// Fail `commit` while the most recent query contains `needle`.
    pub fn fail_commit_after(&mut self, needle: &str, message: &str) -> &mut Self {
        self.commit_failures.push((needle.to_owned(), message.to_owned()));
        self
    }

    pub fn executed_sql(&self) -> Vec<&str> {
        self.executed.iter().map(|(sql, _)| sql.as_str()).collect()
    }
}

impl WarehouseSession for ScriptedSession {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryOutcome, SchemaShiftError> {
        self.executed.push((sql.to_owned(), params.to_vec()));

        if let Some((_, message)) = self.failures.iter().find(|(needle, _)| sql.contains(needle.as_str())) {
            return Err(SchemaShiftError::Session(message.clone()));
        }

        let outcome = self
            .responses
            .iter_mut()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .and_then(|(_, queue)| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            });

        Ok(outcome.unwrap_or_default())
    }

    fn execute_file_transfer(&mut self, sql: &str) -> Result<QueryOutcome, SchemaShiftError> {
        self.transfers.push(sql.to_owned());
        Ok(QueryOutcome::default())
    }

    fn commit(&mut self) -> Result<(), SchemaShiftError> {
        let last = self.executed.last().map(|(sql, _)| sql.as_str()).unwrap_or_default();
        if let Some((_, message)) = self.commit_failures.iter().find(|(needle, _)| last.contains(needle.as_str())) {
            return Err(SchemaShiftError::Session(message.clone()));
        }
        self.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), SchemaShiftError> {
        self.rollbacks += 1;
        Ok(())
    }

    fn autocommit(&self) -> bool {
        self.autocommit
    }

    fn dialect(&self) -> Dialect {
        Dialect::Snowflake
    }

    fn user(&self) -> &str {
        "SCRIPTED_USER"
    }
}
