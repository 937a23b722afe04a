//! Pipeline orchestration: question in, narrated answer out.
//!
//! Stages run strictly sequentially, each consuming the complete state
//! its predecessor produced. Failures accumulate in per-stage error
//! slots; only the terminal stage decides whether the run surfaces a
//! degraded-but-useful result or a generic user-visible failure.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::backend::DatabaseBackend;
use crate::engine::Engine;
use crate::error::Result;
use crate::executor::friendly_error;
use crate::models::AskResponse;
use crate::prompts;
use crate::stage::{run_stage, PipelineState, Stage};

/// Introspects the schema and assembles the readable schema text fed to
/// generation and revision prompts: a CREATE TABLE-like rendering with
/// retrieved column descriptions and example values inline.
pub struct SchemaStage {
    backend: Arc<dyn DatabaseBackend>,
}

impl SchemaStage {
    pub fn new(backend: Arc<dyn DatabaseBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Stage for SchemaStage {
    fn name(&self) -> &str {
        "assemble_schema"
    }

    async fn run(&self, state: &mut PipelineState) -> Result<()> {
        state.schema = self.backend.schema().await?;

        let mut text = String::new();
        for (table, columns) in &state.schema {
            text.push_str(&format!("CREATE TABLE `{table}` (\n"));
            for column in columns {
                let key = (table.clone(), column.clone());
                let mut line = format!("  `{column}`");

                if let Some(m) = state
                    .catalog_matches
                    .iter()
                    .find(|m| m.table == *table && m.column == *column)
                {
                    // First line of the document is the column name.
                    if let Some(desc) = m.description.lines().nth(1) {
                        line.push_str(&format!(" -- {desc}"));
                    }
                }

                if let Some(matches) = state.value_matches.get(&key) {
                    let examples: Vec<&str> = matches
                        .iter()
                        .take(3)
                        .map(|m| m.value.as_str())
                        .collect();
                    if !examples.is_empty() {
                        line.push_str(&format!(" -- examples: {}", examples.join(", ")));
                    }
                }

                line.push_str(",\n");
                text.push_str(&line);
            }
            text.push_str(");\n\n");
        }
        state.schema_text = text;
        Ok(())
    }

    fn summary(&self, state: &PipelineState) -> serde_json::Value {
        serde_json::json!({
            "tables": state.schema.len(),
            "schema_chars": state.schema_text.len(),
        })
    }
}

/// Terminal stage: narrates a successful result, or maps accumulated
/// failure into one generic user-facing message. Raw error detail stays
/// in the history.
pub struct RespondStage {
    engine: Arc<dyn Engine>,
}

impl RespondStage {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Stage for RespondStage {
    fn name(&self) -> &str {
        "narrate_response"
    }

    async fn run(&self, state: &mut PipelineState) -> Result<()> {
        let succeeded = state
            .final_result
            .as_ref()
            .map(|r| r.success)
            .unwrap_or(false);

        if !succeeded {
            state.response = Some(
                state
                    .final_result
                    .as_ref()
                    .map(friendly_error)
                    .unwrap_or_else(|| {
                        "The question could not be answered against this database.".to_string()
                    }),
            );
            return Ok(());
        }

        let rows = state.final_result.as_ref().and_then(|r| r.rows.as_ref());
        let preview = rows
            .map(|rows| {
                let shown: Vec<_> = rows.iter().take(20).cloned().collect();
                serde_json::to_string(&shown).unwrap_or_default()
            })
            .unwrap_or_else(|| "[]".to_string());

        let prompt = prompts::render(
            "narrate_response",
            &[
                ("QUESTION", state.task.question.as_str()),
                ("RESULT", preview.as_str()),
            ],
        )?;

        match self.engine.invoke(&prompt).await {
            Ok(narration) => state.response = Some(narration.trim().to_string()),
            Err(e) => {
                // Degraded but useful: rows without narration.
                warn!(error = %e, "narration failed, returning rows only");
                state.response = Some(format!(
                    "Query returned {} row(s).",
                    state
                        .final_result
                        .as_ref()
                        .map(|r| r.rowcount)
                        .unwrap_or(0)
                ));
            }
        }
        Ok(())
    }

    fn summary(&self, state: &PipelineState) -> serde_json::Value {
        serde_json::json!({ "response_chars": state.response.as_ref().map(String::len).unwrap_or(0) })
    }
}

/// The full stage sequence for one run.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Run every stage in order and fold the final state into the
    /// caller-facing response.
    pub async fn run(&self, mut state: PipelineState) -> AskResponse {
        for stage in &self.stages {
            run_stage(stage.as_ref(), &mut state).await;
        }
        into_response(state)
    }
}

fn into_response(state: PipelineState) -> AskResponse {
    let succeeded = state
        .final_result
        .as_ref()
        .map(|r| r.success)
        .unwrap_or(false);

    AskResponse {
        status: if succeeded { "ok" } else { "failed" }.to_string(),
        sql: state.final_sql.clone(),
        rows: state.final_result.as_ref().and_then(|r| r.rows.clone()),
        response: state.response.clone().unwrap_or_default(),
        execution_history: state.history.entries().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::RunHistory;
    use crate::models::{ExecOutcome, Task};

    #[test]
    fn test_failed_run_maps_to_generic_response() {
        let mut state = PipelineState::new(
            Task::new("db", "q", ""),
            RunHistory::new("test"),
        );
        state.final_sql = Some("SELECT * FROM nosuchtable".into());
        state.final_result = Some(ExecOutcome::failure("no such table: nosuchtable"));
        let response = into_response(state);
        assert_eq!(response.status, "failed");
        assert!(response.rows.is_none());
    }
}
