//! Keyword extraction and per-keyword index lookups.
//!
//! One LLM call extracts keywords from the question and hint, then each
//! keyword drives a fuzzy value-index lookup plus a pair of catalog
//! queries ("question + keyword" and "hint + keyword"), merged by
//! keeping the best score per (table, column).

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::catalog::{CatalogIndex, CatalogMatch};
use crate::engine::Engine;
use crate::error::Result;
use crate::parse::parse_keywords;
use crate::prompts;
use crate::stage::{PipelineState, Stage};
use crate::values::{ValueIndex, ValueMatch};

/// At most this many keywords are looked up at once; each lookup can
/// issue two embedding calls, so the embedding fan-out is bounded too.
const LOOKUP_CAP: usize = 4;

pub struct KeywordStage {
    engine: Arc<dyn Engine>,
    value_index: Arc<ValueIndex>,
    catalog: Arc<CatalogIndex>,
    catalog_top_k: usize,
}

impl KeywordStage {
    pub fn new(
        engine: Arc<dyn Engine>,
        value_index: Arc<ValueIndex>,
        catalog: Arc<CatalogIndex>,
        catalog_top_k: usize,
    ) -> Self {
        Self {
            engine,
            value_index,
            catalog,
            catalog_top_k,
        }
    }

    async fn lookup_keyword(
        &self,
        keyword: &str,
        question: &str,
        hint: &str,
    ) -> (
        Result<BTreeMap<(String, String), Vec<ValueMatch>>>,
        Vec<CatalogMatch>,
    ) {
        let values = self.value_index.query(keyword).await;

        // Dual catalog queries, merged by max score downstream.
        let mut catalog_matches = Vec::new();
        for query_text in [
            format!("{question} {keyword}"),
            format!("{hint} {keyword}"),
        ] {
            if query_text.trim() == keyword || query_text.trim().is_empty() {
                continue;
            }
            if let Ok(matches) = self
                .catalog
                .query(&query_text, &[], self.catalog_top_k)
                .await
            {
                catalog_matches.extend(matches);
            }
        }

        (values, catalog_matches)
    }
}

#[async_trait]
impl Stage for KeywordStage {
    fn name(&self) -> &str {
        "extract_keywords"
    }

    async fn run(&self, state: &mut PipelineState) -> Result<()> {
        let prompt = prompts::render(
            "extract_keywords",
            &[
                ("QUESTION", state.task.question.as_str()),
                ("HINT", state.task.evidence.as_str()),
            ],
        )?;
        debug!(prompt = %prompt, "keyword extraction prompt");
        let response = self.engine.invoke(&prompt).await?;
        debug!(response = %response, "keyword extraction response");

        let keywords = parse_keywords(&response)?;
        state.keywords = keywords.clone();

        let question = state.task.question.clone();
        let evidence = state.task.evidence.clone();
        let semaphore = Arc::new(Semaphore::new(LOOKUP_CAP));
        let lookups = join_all(keywords.iter().map(|kw| {
            let semaphore = semaphore.clone();
            let question = question.clone();
            let evidence = evidence.clone();
            async move {
                // Closed in run(); acquire on a live semaphore cannot fail.
                let _permit = semaphore.acquire().await.unwrap();
                self.lookup_keyword(kw, &question, &evidence).await
            }
        }))
        .await;

        let mut best_catalog: BTreeMap<(String, String), CatalogMatch> = BTreeMap::new();
        for (values, catalog_matches) in lookups {
            if let Ok(grouped) = values {
                for (key, matches) in grouped {
                    merge_value_matches(state.value_matches.entry(key).or_default(), matches);
                }
            }
            for m in catalog_matches {
                let key = (m.table.clone(), m.column.clone());
                match best_catalog.get(&key) {
                    Some(existing) if existing.score >= m.score => {}
                    _ => {
                        best_catalog.insert(key, m);
                    }
                }
            }
        }

        let mut catalog_matches: Vec<CatalogMatch> = best_catalog.into_values().collect();
        catalog_matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        state.catalog_matches = catalog_matches;
        Ok(())
    }

    fn summary(&self, state: &PipelineState) -> serde_json::Value {
        serde_json::json!({
            "keywords": state.keywords,
            "value_match_columns": state.value_matches.len(),
            "catalog_matches": state.catalog_matches.len(),
        })
    }
}

/// Merge new matches into an existing list, keeping the best similarity
/// per value and descending order.
fn merge_value_matches(existing: &mut Vec<ValueMatch>, incoming: Vec<ValueMatch>) {
    for m in incoming {
        match existing.iter_mut().find(|e| e.value == m.value) {
            Some(e) => {
                if m.similarity > e.similarity {
                    e.similarity = m.similarity;
                }
            }
            None => existing.push(m),
        }
    }
    existing.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matched(value: &str, similarity: f64) -> ValueMatch {
        ValueMatch {
            table: "t".into(),
            column: "c".into(),
            value: value.into(),
            similarity,
        }
    }

    #[test]
    fn test_merge_keeps_max_similarity_per_value() {
        let mut existing = vec![matched("alpha", 0.4)];
        merge_value_matches(&mut existing, vec![matched("alpha", 0.9), matched("beta", 0.5)]);
        assert_eq!(existing.len(), 2);
        assert_eq!(existing[0].value, "alpha");
        assert_eq!(existing[0].similarity, 0.9);
        assert_eq!(existing[1].value, "beta");
    }
}
