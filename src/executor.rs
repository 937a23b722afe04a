//! Candidate assessment and final SQL execution.
//!
//! Assessment executes every candidate in the latest round to set its
//! status before revision looks at it. The final executor picks the
//! first syntactically-correct candidate (or the first overall), runs
//! it under a bounded timeout, and never raises: failures land in the
//! outcome and the stage's error slot.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::backend::DatabaseBackend;
use crate::error::Result;
use crate::models::{ExecOutcome, ExecutionStatus, SqlCandidate};
use crate::stage::{PipelineState, Stage, StageError};

/// Execute one statement with a timeout, classifying the outcome.
pub async fn execute_with_timeout(
    backend: &Arc<dyn DatabaseBackend>,
    sql: &str,
    timeout: Duration,
) -> (ExecutionStatus, ExecOutcome) {
    if sql.trim().is_empty() {
        return (
            ExecutionStatus::Error,
            ExecOutcome::failure("empty SQL candidate"),
        );
    }
    match tokio::time::timeout(timeout, backend.execute(sql)).await {
        Ok(outcome) if outcome.success => (ExecutionStatus::SyntacticallyCorrect, outcome),
        Ok(outcome) => (ExecutionStatus::Error, outcome),
        Err(_) => (
            ExecutionStatus::Timeout,
            ExecOutcome::failure(format!(
                "execution exceeded {} second timeout",
                timeout.as_secs()
            )),
        ),
    }
}

/// Generic guidance for the caller; raw detail stays in the history.
pub fn friendly_error(outcome: &ExecOutcome) -> String {
    let raw = outcome.error.as_deref().unwrap_or("").to_lowercase();
    if raw.contains("no such table") || raw.contains("doesn't exist") {
        "The query referenced a table that does not exist in this database.".to_string()
    } else if raw.contains("no such column") || raw.contains("unknown column") {
        "The query referenced a column that does not exist in this database.".to_string()
    } else if raw.contains("syntax") {
        "The generated query was not valid SQL.".to_string()
    } else if raw.contains("timeout") {
        "The query took too long to run and was cancelled.".to_string()
    } else {
        "The question could not be answered against this database.".to_string()
    }
}

/// Runs every candidate in the latest round so revision sees real
/// execution statuses.
pub struct AssessStage {
    backend: Arc<dyn DatabaseBackend>,
    timeout: Duration,
}

impl AssessStage {
    pub fn new(backend: Arc<dyn DatabaseBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }
}

#[async_trait]
impl Stage for AssessStage {
    fn name(&self) -> &str {
        "assess_candidates"
    }

    async fn run(&self, state: &mut PipelineState) -> Result<()> {
        let Some(round) = state.rounds.last_mut() else {
            return Ok(());
        };
        for candidate in &mut round.candidates {
            let (status, outcome) =
                execute_with_timeout(&self.backend, &candidate.sql, self.timeout).await;
            candidate.status = status;
            candidate.execution_result = Some(outcome);
        }
        Ok(())
    }

    fn summary(&self, state: &PipelineState) -> serde_json::Value {
        let round = state.latest_round();
        let correct = round
            .map(|r| {
                r.candidates
                    .iter()
                    .filter(|c| c.status == ExecutionStatus::SyntacticallyCorrect)
                    .count()
            })
            .unwrap_or(0);
        serde_json::json!({
            "candidates": round.map(|r| r.candidates.len()).unwrap_or(0),
            "syntactically_correct": correct,
        })
    }
}

/// Picks and executes the final candidate.
pub struct ExecuteStage {
    backend: Arc<dyn DatabaseBackend>,
    timeout: Duration,
}

impl ExecuteStage {
    pub fn new(backend: Arc<dyn DatabaseBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }
}

/// First syntactically-correct candidate, else the first overall.
pub fn select_candidate(candidates: &[SqlCandidate]) -> Option<&SqlCandidate> {
    candidates
        .iter()
        .find(|c| c.status == ExecutionStatus::SyntacticallyCorrect)
        .or_else(|| candidates.first())
}

#[async_trait]
impl Stage for ExecuteStage {
    fn name(&self) -> &str {
        "execute_sql"
    }

    async fn run(&self, state: &mut PipelineState) -> Result<()> {
        let selected = state
            .latest_round()
            .and_then(|r| select_candidate(&r.candidates))
            .map(|c| c.sql.clone());

        let Some(sql) = selected else {
            state.errors.insert(
                self.name().to_string(),
                StageError {
                    kind: "backend".to_string(),
                    message: "no candidate available to execute".to_string(),
                },
            );
            return Ok(());
        };

        let (status, outcome) = execute_with_timeout(&self.backend, &sql, self.timeout).await;
        if status != ExecutionStatus::SyntacticallyCorrect {
            warn!(sql = %sql, error = ?outcome.error, "final execution failed");
            state.errors.insert(
                self.name().to_string(),
                StageError {
                    kind: "backend".to_string(),
                    message: outcome.error.clone().unwrap_or_default(),
                },
            );
        }
        state.final_sql = Some(sql);
        state.final_result = Some(outcome);
        Ok(())
    }

    fn summary(&self, state: &PipelineState) -> serde_json::Value {
        serde_json::json!({
            "sql": state.final_sql,
            "success": state.final_result.as_ref().map(|r| r.success).unwrap_or(false),
            "rowcount": state.final_result.as_ref().map(|r| r.rowcount).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_prefers_syntactically_correct() {
        let mut bad = SqlCandidate::new("SELECT * FROM nosuch");
        bad.status = ExecutionStatus::Error;
        let mut good = SqlCandidate::new("SELECT 1");
        good.status = ExecutionStatus::SyntacticallyCorrect;
        let candidates = vec![bad, good];
        assert_eq!(select_candidate(&candidates).unwrap().sql, "SELECT 1");
    }

    #[test]
    fn test_select_falls_back_to_first() {
        let mut a = SqlCandidate::new("SELECT a");
        a.status = ExecutionStatus::Error;
        let mut b = SqlCandidate::new("SELECT b");
        b.status = ExecutionStatus::Timeout;
        let candidates = vec![a, b];
        assert_eq!(select_candidate(&candidates).unwrap().sql, "SELECT a");
    }

    #[test]
    fn test_friendly_error_classes() {
        let missing = ExecOutcome::failure("no such table: departments");
        assert!(friendly_error(&missing).contains("table"));
        let column = ExecOutcome::failure("Unknown column 'x' in field list");
        assert!(friendly_error(&column).contains("column"));
        let syntax = ExecOutcome::failure("near \"FORM\": syntax error");
        assert!(friendly_error(&syntax).contains("valid SQL"));
        let timeout = ExecOutcome::failure("execution exceeded 60 second timeout");
        assert!(friendly_error(&timeout).contains("too long"));
    }
}
