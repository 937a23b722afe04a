//! Revision loop: concurrent batch repair of failing candidates.
//!
//! Candidates are marked `need_fixing` unless their last execution was
//! clean, partitioned into fixed-size batches, and repaired under a
//! bounded pool. The output round has the same length and positional
//! order as the input; repaired SQL replaces the original only when the
//! model's answer contains a SELECT token.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::models::{CandidateRound, ExecutionStatus, SqlCandidate};
use crate::parse::parse_candidate;
use crate::prompts;
use crate::retry::RetryPolicy;
use crate::stage::{PipelineState, Stage};

pub struct ReviseStage {
    engine: Arc<dyn Engine>,
    policy: RetryPolicy,
    batch_size: usize,
    pool_cap: usize,
}

impl ReviseStage {
    pub fn new(
        engine: Arc<dyn Engine>,
        policy: RetryPolicy,
        batch_size: usize,
        pool_cap: usize,
    ) -> Self {
        Self {
            engine,
            policy,
            batch_size: batch_size.max(1),
            pool_cap: pool_cap.max(1),
        }
    }

    /// One repair request; `None` means keep the original SQL.
    async fn repair(
        &self,
        schema_text: &str,
        question: &str,
        hint: &str,
        candidate: &SqlCandidate,
    ) -> Option<SqlCandidate> {
        let result_text = candidate
            .execution_result
            .as_ref()
            .and_then(|r| serde_json::to_string(r).ok())
            .unwrap_or_else(|| "no result recorded".to_string());

        let prompt = prompts::render(
            "revise",
            &[
                ("SCHEMA", schema_text),
                ("QUESTION", question),
                ("HINT", hint),
                ("SQL", candidate.sql.as_str()),
                ("RESULT", result_text.as_str()),
            ],
        )
        .ok()?;

        debug!(prompt = %prompt, "revision prompt");
        let response = self
            .policy
            .run("revise", || self.engine.invoke(&prompt))
            .await;
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "repair call failed, keeping original SQL");
                return None;
            }
        };
        debug!(response = %response, "revision response");

        let parsed = match parse_candidate("revision", &response) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "repair output unparseable, keeping original SQL");
                return None;
            }
        };

        // Acceptance gate: a repair without a SELECT is discarded.
        if !parsed.sql.to_uppercase().contains("SELECT") {
            warn!("repair produced no SELECT, keeping original SQL");
            return None;
        }

        let mut repaired = SqlCandidate::new(parsed.sql);
        repaired.reasoning = parsed.reasoning;
        repaired.plan = candidate.plan.clone();
        Some(repaired)
    }
}

#[async_trait]
impl Stage for ReviseStage {
    fn name(&self) -> &str {
        "revise_candidates"
    }

    async fn run(&self, state: &mut PipelineState) -> Result<()> {
        let Some(round) = state.latest_round() else {
            return Ok(());
        };

        let mut next: Vec<SqlCandidate> = round
            .candidates
            .iter()
            .cloned()
            .map(|mut c| {
                c.need_fixing = c.status != ExecutionStatus::SyntacticallyCorrect;
                c
            })
            .collect();

        let to_fix: Vec<usize> = next
            .iter()
            .enumerate()
            .filter(|(_, c)| c.need_fixing)
            .map(|(i, _)| i)
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.pool_cap));
        let batches: Vec<Vec<usize>> = to_fix.chunks(self.batch_size).map(|b| b.to_vec()).collect();

        let repairs = join_all(batches.into_iter().map(|batch| {
            let semaphore = semaphore.clone();
            let schema_text = state.schema_text.clone();
            let question = state.task.question.clone();
            let hint = state.task.evidence.clone();
            let candidates: Vec<(usize, SqlCandidate)> = batch
                .iter()
                .map(|&i| (i, next[i].clone()))
                .collect();
            async move {
                let _permit = semaphore.acquire().await.unwrap();
                let mut out = Vec::with_capacity(candidates.len());
                for (i, candidate) in candidates {
                    let repaired = self
                        .repair(&schema_text, &question, &hint, &candidate)
                        .await;
                    out.push((i, repaired));
                }
                out
            }
        }))
        .await;

        for (i, repaired) in repairs.into_iter().flatten() {
            if let Some(repaired) = repaired {
                next[i] = repaired;
            }
        }

        let name = state.next_revision_name();
        state.rounds.push(CandidateRound {
            name,
            candidates: next,
        });
        Ok(())
    }

    fn summary(&self, state: &PipelineState) -> serde_json::Value {
        let round = state.latest_round();
        serde_json::json!({
            "round": round.map(|r| r.name.clone()).unwrap_or_default(),
            "candidates": round.map(|r| r.candidates.len()).unwrap_or(0),
        })
    }
}
