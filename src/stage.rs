//! Stage framework: uniform execute/log/error contract for pipeline
//! steps.
//!
//! A stage mutates the run's [`PipelineState`] and returns a `Result`.
//! The wrapper owns the cross-cutting behavior: timing, swallowing the
//! stage's error into its per-stage slot, and appending exactly one
//! history entry per run, success or failure, flushed immediately. A
//! stage failure never aborts the pipeline by itself; later stages
//! decide whether to act on the recorded errors.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{error, info};

use crate::backend::Schema;
use crate::catalog::CatalogMatch;
use crate::error::Result;
use crate::history::RunHistory;
use crate::models::{CandidateRound, ConversationTurn, ExecOutcome, HistoryEntry, Task};
use crate::values::ValueMatch;

/// Captured failure of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageError {
    pub kind: String,
    pub message: String,
}

/// The complete state of one pipeline run, passed explicitly from stage
/// to stage. Never shared between concurrent runs.
pub struct PipelineState {
    pub task: Task,
    pub conversation: Vec<ConversationTurn>,
    pub schema: Schema,
    pub schema_text: String,
    pub keywords: Vec<String>,
    pub value_matches: BTreeMap<(String, String), Vec<ValueMatch>>,
    pub catalog_matches: Vec<CatalogMatch>,
    pub rounds: Vec<CandidateRound>,
    pub final_sql: Option<String>,
    pub final_result: Option<ExecOutcome>,
    pub response: Option<String>,
    pub errors: BTreeMap<String, StageError>,
    pub history: RunHistory,
}

impl PipelineState {
    pub fn new(task: Task, history: RunHistory) -> Self {
        Self {
            task,
            conversation: Vec::new(),
            schema: Schema::new(),
            schema_text: String::new(),
            keywords: Vec::new(),
            value_matches: BTreeMap::new(),
            catalog_matches: Vec::new(),
            rounds: Vec::new(),
            final_sql: None,
            final_result: None,
            response: None,
            errors: BTreeMap::new(),
            history,
        }
    }

    pub fn latest_round(&self) -> Option<&CandidateRound> {
        self.rounds.last()
    }

    /// Next monotonic revision round name: `revise_1`, `revise_2`, ...
    pub fn next_revision_name(&self) -> String {
        let n = self
            .rounds
            .iter()
            .filter(|r| r.name.starts_with("revise_"))
            .count();
        format!("revise_{}", n + 1)
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, state: &mut PipelineState) -> Result<()>;

    /// Stage-specific fields for the history entry, read after `run`.
    fn summary(&self, _state: &PipelineState) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Run one stage under the uniform wrapper.
pub async fn run_stage(stage: &dyn Stage, state: &mut PipelineState) {
    let name = stage.name().to_string();
    info!(stage = %name, "stage start");
    let start = Instant::now();

    let result = stage.run(state).await;
    let elapsed = start.elapsed().as_secs_f64();

    let (status, error_text) = match &result {
        Ok(()) => {
            info!(stage = %name, elapsed_secs = elapsed, "stage complete");
            ("ok".to_string(), None)
        }
        Err(e) => {
            error!(stage = %name, elapsed_secs = elapsed, error = %e, "stage failed");
            state.errors.insert(
                name.clone(),
                StageError {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                },
            );
            ("error".to_string(), Some(e.to_string()))
        }
    };

    let details = stage.summary(state);
    state.history.append(HistoryEntry {
        tool_name: name,
        status,
        execution_time_secs: elapsed,
        recorded_at: Utc::now(),
        details,
        error: error_text,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AskdbError;

    struct OkStage;

    #[async_trait]
    impl Stage for OkStage {
        fn name(&self) -> &str {
            "ok_stage"
        }

        async fn run(&self, state: &mut PipelineState) -> Result<()> {
            state.keywords.push("done".to_string());
            Ok(())
        }

        fn summary(&self, state: &PipelineState) -> serde_json::Value {
            serde_json::json!({ "keywords": state.keywords.len() })
        }
    }

    struct FailingStage;

    #[async_trait]
    impl Stage for FailingStage {
        fn name(&self) -> &str {
            "failing_stage"
        }

        async fn run(&self, _state: &mut PipelineState) -> Result<()> {
            Err(AskdbError::Parse("bad output".into()))
        }
    }

    fn state() -> PipelineState {
        PipelineState::new(Task::new("db", "question", ""), RunHistory::new("test-run"))
    }

    #[tokio::test]
    async fn test_success_appends_one_entry_without_error_slot() {
        let mut state = state();
        run_stage(&OkStage, &mut state).await;
        assert_eq!(state.history.entries().len(), 1);
        assert_eq!(state.history.entries()[0].status, "ok");
        assert!(state.errors.is_empty());
        assert_eq!(state.history.entries()[0].details["keywords"], 1);
    }

    #[tokio::test]
    async fn test_failure_captured_nonfatally_with_one_entry() {
        let mut state = state();
        run_stage(&FailingStage, &mut state).await;
        assert_eq!(state.history.entries().len(), 1);
        assert_eq!(state.history.entries()[0].status, "error");
        let err = state.errors.get("failing_stage").unwrap();
        assert_eq!(err.kind, "parse");
        assert!(err.message.contains("bad output"));
    }

    #[tokio::test]
    async fn test_revision_round_names_are_monotonic() {
        let mut state = state();
        assert_eq!(state.next_revision_name(), "revise_1");
        state.rounds.push(CandidateRound {
            name: "generate".into(),
            candidates: vec![],
        });
        assert_eq!(state.next_revision_name(), "revise_1");
        state.rounds.push(CandidateRound {
            name: "revise_1".into(),
            candidates: vec![],
        });
        assert_eq!(state.next_revision_name(), "revise_2");
    }
}
