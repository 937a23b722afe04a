//! Library error taxonomy.
//!
//! Stage-level failures are deliberately *not* part of this taxonomy: a
//! pipeline stage swallows its own error into the run state's per-stage
//! error slot and the run continues. `AskdbError` covers the failures
//! that are allowed to propagate: configuration problems (fatal at
//! construction), backend/connection faults, and external-call failures
//! that survived their retry budget.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AskdbError {
    /// Invalid or incomplete configuration. Never silently defaulted.
    #[error("config error: {0}")]
    Config(String),

    /// Database backend failure (connection, schema introspection,
    /// index persistence). SQL *execution* errors are captured in
    /// [`crate::models::ExecOutcome`] instead and never raised.
    #[error("backend error: {0}")]
    Backend(String),

    /// An LLM engine call failed after its retry budget was exhausted.
    #[error("engine '{engine}' failed: {message}")]
    Engine { engine: String, message: String },

    /// Embedding provider failure for one batch of documents.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Structured LLM output could not be parsed, even after repair.
    #[error("parse error: {0}")]
    Parse(String),

    /// Value or catalog index build/query failure.
    #[error("index error: {0}")]
    Index(String),
}

impl AskdbError {
    /// Short taxonomy tag for per-stage error slots and history entries.
    pub fn kind(&self) -> &'static str {
        match self {
            AskdbError::Config(_) => "config",
            AskdbError::Backend(_) => "backend",
            AskdbError::Engine { .. } => "engine",
            AskdbError::Embedding(_) => "embedding",
            AskdbError::Parse(_) => "parse",
            AskdbError::Index(_) => "index",
        }
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        AskdbError::Backend(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        AskdbError::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, AskdbError>;
