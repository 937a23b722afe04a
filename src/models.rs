//! Core data models that flow through the question-to-SQL pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of work: a question against a named database.
///
/// Only upstream context-enhancement mutates the derived fields;
/// from candidate generation onward the task is read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub question_id: String,
    pub db_id: String,
    pub question: String,
    /// Optional hint/evidence supplied by the caller.
    #[serde(default)]
    pub evidence: String,
    /// Question variants produced by upstream enhancement, if any.
    #[serde(default)]
    pub enhanced_questions: Vec<String>,
}

impl Task {
    pub fn new(
        db_id: impl Into<String>,
        question: impl Into<String>,
        evidence: impl Into<String>,
    ) -> Self {
        Self {
            question_id: uuid::Uuid::new_v4().to_string(),
            db_id: db_id.into(),
            question: question.into(),
            evidence: evidence.into(),
            enhanced_questions: Vec::new(),
        }
    }
}

/// Descriptive profile of one column, built once per database and read
/// by both retrieval indices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub table: String,
    pub column: String,
    /// Declared column type, lowercase-insensitive; empty when unknown.
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub value_description: String,
    #[serde(default)]
    pub example_values: Vec<String>,
}

impl ColumnProfile {
    /// The document text embedded into the catalog index.
    pub fn document_text(&self) -> String {
        let mut parts = vec![self.column.clone()];
        if !self.description.is_empty() {
            parts.push(self.description.clone());
        }
        if !self.value_description.is_empty() {
            parts.push(self.value_description.clone());
        }
        parts.join("\n")
    }
}

/// Last-known execution outcome of a candidate query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Not yet executed.
    Unknown,
    /// Executed without error.
    SyntacticallyCorrect,
    /// Execution returned an error (syntax, missing table/column, ...).
    Error,
    /// Execution exceeded the bounded timeout.
    Timeout,
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        ExecutionStatus::Unknown
    }
}

/// One generated SQL query plus its reasoning and execution outcome.
///
/// Created by generation, possibly replaced position-for-position by a
/// revision round, terminally consumed by the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqlCandidate {
    pub sql: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub status: ExecutionStatus,
    #[serde(default)]
    pub execution_result: Option<ExecOutcome>,
    #[serde(default)]
    pub need_fixing: bool,
}

impl SqlCandidate {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Default::default()
        }
    }
}

/// A named round of candidates. Round names are monotonic
/// (`generate`, `revise_1`, `revise_2`, ...) so any repaired candidate
/// can be traced back to its source by position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRound {
    pub name: String,
    pub candidates: Vec<SqlCandidate>,
}

/// Result of executing one SQL statement through a backend.
///
/// Backends never raise for SQL errors; every failure is captured here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub success: bool,
    /// Rows as JSON objects keyed by column name; `None` for
    /// non-fetching statements or on error.
    pub rows: Option<Vec<Value>>,
    pub rowcount: i64,
    pub error: Option<String>,
}

impl ExecOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            rows: None,
            rowcount: 0,
            error: Some(error.into()),
        }
    }
}

/// One append-only record of a completed pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tool_name: String,
    pub status: String,
    pub execution_time_secs: f64,
    pub recorded_at: DateTime<Utc>,
    /// Stage-specific fields (candidate lists, match counts, ...).
    #[serde(default)]
    pub details: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final answer returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub status: String,
    pub sql: Option<String>,
    pub rows: Option<Vec<Value>>,
    pub response: String,
    pub execution_history: Vec<HistoryEntry>,
}

/// One prior conversation turn supplied by the caller; folded into the
/// generation prompt context, never persisted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_defaults_to_unknown() {
        let c = SqlCandidate::new("SELECT 1");
        assert_eq!(c.status, ExecutionStatus::Unknown);
        assert!(!c.need_fixing);
        assert!(c.execution_result.is_none());
    }

    #[test]
    fn test_profile_document_text_skips_empty_parts() {
        let p = ColumnProfile {
            table: "employee".into(),
            column: "department".into(),
            description: "the department the employee belongs to".into(),
            ..Default::default()
        };
        let text = p.document_text();
        assert!(text.starts_with("department\n"));
        assert!(!text.ends_with('\n'));
    }
}
