//! Catalog index: semantic matching of query text against column
//! descriptions, via stored embedding vectors.
//!
//! Build embeds descriptive documents in batches; one failed batch is
//! dropped and logged, the rest of the build continues. Query embeds
//! the text, scans the metadata-filtered vector set by cosine
//! similarity, and falls back to a full vector load if the filtered
//! access path fails.

use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::backend::{DatabaseBackend, VectorRecord};
use crate::embedding::{cosine_similarity, Embedder};
use crate::error::Result;
use crate::models::ColumnProfile;

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogMatch {
    pub source_id: String,
    pub table: String,
    pub column: String,
    pub description: String,
    /// Normalized to [0, 1].
    pub score: f64,
}

pub struct CatalogIndex {
    backend: Arc<dyn DatabaseBackend>,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl CatalogIndex {
    pub fn new(
        backend: Arc<dyn DatabaseBackend>,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
    ) -> Self {
        Self {
            backend,
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    /// Embed and store one document per column profile. Returns how many
    /// documents were stored; failed batches are dropped, not fatal.
    pub async fn build_from_catalog(&self, profiles: &[ColumnProfile]) -> Result<usize> {
        let documents: Vec<(String, String, String)> = profiles
            .iter()
            .map(|p| (p.table.clone(), p.column.clone(), p.document_text()))
            .collect();
        self.build_documents(&documents).await
    }

    /// Embed and store raw text chunks under one source label.
    pub async fn build_from_chunks(&self, source: &str, chunks: &[String]) -> Result<usize> {
        let documents: Vec<(String, String, String)> = chunks
            .iter()
            .filter(|c| !c.trim().is_empty())
            .map(|c| (source.to_string(), "chunk".to_string(), c.clone()))
            .collect();
        self.build_documents(&documents).await
    }

    async fn build_documents(&self, documents: &[(String, String, String)]) -> Result<usize> {
        let mut stored = 0;
        for batch in documents.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, _, doc)| doc.clone()).collect();
            let vectors = match self.embedder.embed(&texts).await {
                Ok(vectors) => vectors,
                Err(e) => {
                    warn!(batch_len = batch.len(), error = %e, "embedding batch failed, dropping batch");
                    continue;
                }
            };
            for ((table, column, doc), vector) in batch.iter().zip(vectors) {
                self.backend
                    .store_vector(&VectorRecord {
                        source_id: Uuid::new_v4().to_string(),
                        table: table.clone(),
                        column: column.clone(),
                        description: doc.clone(),
                        vector,
                    })
                    .await?;
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Top-k matches for the query text, restricted by AND-composed
    /// equality filters over {table, column, source_id}.
    pub async fn query(
        &self,
        text: &str,
        filter: &[(String, String)],
        top_k: usize,
    ) -> Result<Vec<CatalogMatch>> {
        let query_vec = self.embedder.embed_query(text).await?;

        let records = match self.backend.query_vectors(filter).await {
            Ok(records) => records,
            Err(e) => {
                // Fallback access path: full load, filter in memory.
                warn!(error = %e, "filtered vector query failed, falling back to full scan");
                let all = self.backend.load_vectors().await?;
                all.into_iter()
                    .filter(|r| {
                        filter.iter().all(|(field, value)| match field.as_str() {
                            "table" => &r.table == value,
                            "column" => &r.column == value,
                            "source_id" => &r.source_id == value,
                            _ => false,
                        })
                    })
                    .collect()
            }
        };

        let mut matches: Vec<CatalogMatch> = records
            .into_iter()
            .map(|r| {
                let raw = cosine_similarity(&query_vec, &r.vector) as f64;
                CatalogMatch {
                    source_id: r.source_id,
                    table: r.table,
                    column: r.column,
                    description: r.description,
                    score: normalize_score(raw),
                }
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    pub async fn clear(&self) -> Result<()> {
        self.backend.clear_catalog_index().await
    }
}

/// Squash a raw relevance score into [0, 1]: negative scores through an
/// exponential, in-range scores unchanged, scores above 1 through a
/// sigmoid centered at 5.
pub fn normalize_score(raw: f64) -> f64 {
    if raw < 0.0 {
        raw.exp()
    } else if raw <= 1.0 {
        raw
    } else {
        1.0 / (1.0 + (-(raw - 5.0)).exp())
    }
}

/// Column profiles straight from an introspected schema, with no
/// descriptions beyond the column name itself.
pub fn profiles_from_schema(schema: &crate::backend::Schema) -> Vec<ColumnProfile> {
    schema
        .iter()
        .flat_map(|(table, columns)| {
            columns.iter().map(move |column| ColumnProfile {
                table: table.clone(),
                column: column.clone(),
                ..Default::default()
            })
        })
        .collect()
}

/// Column profiles carrying the introspected type and key metadata the
/// value index filters on.
pub fn profiles_from_details(details: &[crate::backend::ColumnDetail]) -> Vec<ColumnProfile> {
    details
        .iter()
        .map(|d| ColumnProfile {
            table: d.table.clone(),
            column: d.column.clone(),
            data_type: d.data_type.clone(),
            primary_key: d.primary_key,
            ..Default::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_score_in_unit_interval() {
        for raw in [-1000.0, -3.2, -0.001, 0.0, 0.4, 1.0, 1.5, 5.0, 80.0] {
            let n = normalize_score(raw);
            assert!((0.0..=1.0).contains(&n), "raw={raw} gave {n}");
        }
    }

    #[test]
    fn test_in_range_scores_pass_through() {
        assert_eq!(normalize_score(0.37), 0.37);
        assert_eq!(normalize_score(1.0), 1.0);
    }

    #[test]
    fn test_negative_scores_squash_exponentially() {
        assert!(normalize_score(-0.5) < normalize_score(-0.1));
        assert!(normalize_score(-0.1) < 1.0);
    }

    #[test]
    fn test_sigmoid_centered_at_five() {
        let n = normalize_score(5.0);
        assert!((n - 0.5).abs() < 1e-9);
        assert!(normalize_score(9.0) > 0.9);
    }

    #[test]
    fn test_profiles_from_schema() {
        let mut schema = crate::backend::Schema::new();
        schema.insert("employee".into(), vec!["name".into(), "salary".into()]);
        let profiles = profiles_from_schema(&schema);
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].table, "employee");
    }
}
