//! Append-only execution history for one pipeline run.
//!
//! Every append rewrites the run's JSON file, so a crash mid-pipeline
//! still leaves the completed-stage record on disk.

use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{AskdbError, Result};
use crate::models::HistoryEntry;

pub struct RunHistory {
    run_id: String,
    entries: Vec<HistoryEntry>,
    sink: Option<PathBuf>,
}

impl RunHistory {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            entries: Vec::new(),
            sink: None,
        }
    }

    /// Attach a file sink under `dir`; the file is named after the run.
    pub fn with_sink(run_id: impl Into<String>, dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| AskdbError::config(format!("create history dir: {e}")))?;
        let run_id = run_id.into();
        let path = dir.join(format!("{run_id}.json"));
        Ok(Self {
            run_id,
            entries: Vec::new(),
            sink: Some(path),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Append one entry and flush immediately. A failed flush is logged
    /// and does not fail the pipeline.
    pub fn append(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
        self.flush();
    }

    fn flush(&self) {
        let Some(path) = &self.sink else {
            return;
        };
        match serde_json::to_string_pretty(&self.entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!(path = %path.display(), error = %e, "history flush failed");
                }
            }
            Err(e) => warn!(error = %e, "history serialization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(name: &str) -> HistoryEntry {
        HistoryEntry {
            tool_name: name.to_string(),
            status: "ok".to_string(),
            execution_time_secs: 0.01,
            recorded_at: Utc::now(),
            details: serde_json::Value::Null,
            error: None,
        }
    }

    #[test]
    fn test_append_preserves_order() {
        let mut history = RunHistory::new("run-1");
        history.append(entry("extract_keywords"));
        history.append(entry("generate_candidates"));
        let names: Vec<&str> = history.entries().iter().map(|e| e.tool_name.as_str()).collect();
        assert_eq!(names, vec!["extract_keywords", "generate_candidates"]);
    }

    #[test]
    fn test_sink_flushes_after_every_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = RunHistory::with_sink("run-2", dir.path()).unwrap();
        history.append(entry("first"));

        let path = dir.path().join("run-2.json");
        let flushed: Vec<HistoryEntry> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(flushed.len(), 1);

        history.append(entry("second"));
        let flushed: Vec<HistoryEntry> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(flushed.len(), 2);
    }
}
