//! Candidate generation: bounded concurrent fan-out across generator
//! configurations.
//!
//! Configuration groups run concurrently under a semaphore (default cap
//! 4); within a group, samples rotate round-robin across the group's
//! engines. Each call retries under the shared policy; an empty
//! response triggers a one-time fallback-engine swap before the failure
//! counts. With sample counts k1..kg, exactly the sum of ki candidates
//! enters the `generate` round, failed samples included as error-status
//! placeholders so positions stay accountable.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::GeneratorConfig;
use crate::engine::{Engine, EngineRegistry};
use crate::error::{AskdbError, Result};
use crate::models::{CandidateRound, ConversationTurn, ExecOutcome, ExecutionStatus, SqlCandidate};
use crate::parse::parse_candidate;
use crate::prompts;
use crate::retry::RetryPolicy;
use crate::stage::{PipelineState, Stage};

const DEFAULT_GROUP_CAP: usize = 4;

pub struct GenerateStage {
    registry: Arc<EngineRegistry>,
    generators: Vec<GeneratorConfig>,
    policy: RetryPolicy,
    group_cap: usize,
}

impl GenerateStage {
    pub fn new(
        registry: Arc<EngineRegistry>,
        generators: Vec<GeneratorConfig>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            generators,
            policy,
            group_cap: DEFAULT_GROUP_CAP,
        }
    }

    /// One LLM call: invoke, swap to the fallback engine once on an
    /// empty response, parse.
    async fn one_sample(
        &self,
        generator: &GeneratorConfig,
        engine: Arc<dyn Engine>,
        prompt: &str,
    ) -> Result<SqlCandidate> {
        let mut engine = engine;
        let mut swapped = false;

        loop {
            debug!(generator = %generator.name, engine = %engine.name(), prompt = %prompt, "generation prompt");
            let response = engine.invoke(prompt).await?;
            debug!(generator = %generator.name, engine = %engine.name(), response = %response, "generation response");

            if response.trim().is_empty() {
                match (&generator.fallback_engine, swapped) {
                    (Some(fallback), false) => {
                        warn!(generator = %generator.name, fallback = %fallback, "empty response, swapping to fallback engine");
                        engine = self.registry.get(fallback)?;
                        swapped = true;
                        continue;
                    }
                    _ => {
                        return Err(AskdbError::Engine {
                            engine: engine.name().to_string(),
                            message: "empty response".to_string(),
                        });
                    }
                }
            }

            let parsed = parse_candidate(&generator.parser, &response)?;
            let mut candidate = SqlCandidate::new(parsed.sql);
            candidate.reasoning = parsed.reasoning;
            candidate.plan = parsed.plan;
            return Ok(candidate);
        }
    }

    /// All samples of one generator configuration, engines rotating
    /// round-robin by sample index.
    async fn run_group(&self, generator: &GeneratorConfig, prompt: String) -> Vec<SqlCandidate> {
        let samples = join_all((0..generator.samples).map(|i| {
            let engine_name = &generator.engines[i % generator.engines.len()];
            let prompt = prompt.clone();
            async move {
                let engine = self.registry.get(engine_name)?;
                self.policy
                    .run(&format!("{}#{i}", generator.name), || {
                        self.one_sample(generator, engine.clone(), &prompt)
                    })
                    .await
            }
        }))
        .await;

        samples
            .into_iter()
            .map(|result| match result {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(generator = %generator.name, error = %e, "sample failed after retries");
                    let mut candidate = SqlCandidate::new("");
                    candidate.status = ExecutionStatus::Error;
                    candidate.execution_result = Some(ExecOutcome::failure(e.to_string()));
                    candidate.need_fixing = true;
                    candidate
                }
            })
            .collect()
    }
}

#[async_trait]
impl Stage for GenerateStage {
    fn name(&self) -> &str {
        "generate_candidates"
    }

    async fn run(&self, state: &mut PipelineState) -> Result<()> {
        let context = render_conversation(&state.conversation);
        let semaphore = Arc::new(Semaphore::new(self.group_cap));

        let groups = join_all(self.generators.iter().map(|generator| {
            let semaphore = semaphore.clone();
            let prompt = prompts::render(
                &generator.template,
                &[
                    ("SCHEMA", state.schema_text.as_str()),
                    ("QUESTION", state.task.question.as_str()),
                    ("HINT", state.task.evidence.as_str()),
                    ("CONTEXT", context.as_str()),
                ],
            );
            async move {
                // Closed in run(); acquire on a live semaphore cannot fail.
                let _permit = semaphore.acquire().await.unwrap();
                match prompt {
                    Ok(prompt) => self.run_group(generator, prompt).await,
                    Err(e) => {
                        warn!(generator = %generator.name, error = %e, "prompt render failed");
                        (0..generator.samples)
                            .map(|_| {
                                let mut c = SqlCandidate::new("");
                                c.status = ExecutionStatus::Error;
                                c.execution_result = Some(ExecOutcome::failure(e.to_string()));
                                c.need_fixing = true;
                                c
                            })
                            .collect()
                    }
                }
            }
        }))
        .await;

        let candidates: Vec<SqlCandidate> = groups.into_iter().flatten().collect();
        state.rounds.push(CandidateRound {
            name: "generate".to_string(),
            candidates,
        });
        Ok(())
    }

    fn summary(&self, state: &PipelineState) -> serde_json::Value {
        let round = state.rounds.iter().find(|r| r.name == "generate");
        serde_json::json!({
            "candidates": round.map(|r| r.candidates.len()).unwrap_or(0),
            "sql": round
                .map(|r| r.candidates.iter().map(|c| c.sql.clone()).collect::<Vec<_>>())
                .unwrap_or_default(),
        })
    }
}

/// Prior conversation turns folded into the prompt context block.
fn render_conversation(turns: &[ConversationTurn]) -> String {
    if turns.is_empty() {
        return String::new();
    }
    let mut out = String::from("Previous conversation:\n");
    for turn in turns {
        out.push_str(&format!("{}: {}\n", turn.role, turn.content));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_rendering() {
        assert_eq!(render_conversation(&[]), "");
        let turns = vec![ConversationTurn {
            role: "user".into(),
            content: "earlier question".into(),
        }];
        let rendered = render_conversation(&turns);
        assert!(rendered.contains("user: earlier question"));
    }
}
