//! Value index: fuzzy matching of free text against distinct column
//! values, via MinHash signatures bucketed with LSH.
//!
//! Build and query share one [`MinHasher`] and one band split; an index
//! queried with different parameters would be meaningless. Persistence
//! goes through the backend, so the embedded and pooled variants store
//! the same two artifacts (signature table, bucket table).

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::{DatabaseBackend, SignatureRecord};
use crate::config::IndexConfig;
use crate::error::Result;
use crate::minhash::{jaccard, optimal_band_params, MinHasher};
use crate::models::ColumnProfile;

/// Column-name fragments that mark identifier-, URL-, email-, date- and
/// phone-like columns; their values are never worth fuzzy matching.
const SKIP_FRAGMENTS: &[&str] = &[
    "_id", " id", "url", "email", "web", "time", "phone", "date", "address",
];

/// Aggregate size cap for name-suggesting columns, which stay indexed
/// well past the general cap.
const NAME_COLUMN_CAP: i64 = 5_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ValueMatch {
    pub table: String,
    pub column: String,
    pub value: String,
    pub similarity: f64,
}

#[derive(Debug, Default, Clone)]
pub struct BuildReport {
    pub columns_indexed: usize,
    pub columns_skipped: usize,
    pub values_indexed: usize,
}

pub struct ValueIndex {
    backend: Arc<dyn DatabaseBackend>,
    hasher: MinHasher,
    bands: usize,
    rows: usize,
    top_n: usize,
    value_size_cap: i64,
}

impl ValueIndex {
    pub fn new(backend: Arc<dyn DatabaseBackend>, config: &IndexConfig) -> Self {
        let (bands, rows) = optimal_band_params(config.threshold, config.signature_size);
        Self {
            backend,
            hasher: MinHasher::new(config.signature_size, config.ngram),
            bands,
            rows,
            top_n: config.top_n,
            value_size_cap: config.value_size_cap,
        }
    }

    /// Build the index from column profiles, pulling distinct values out
    /// of the backing database. Columns are filtered by name and by
    /// aggregate value size; a column that fails its sizing or fetch
    /// query is skipped, never fatal.
    pub async fn build_from_catalog(&self, profiles: &[ColumnProfile]) -> Result<BuildReport> {
        let mut report = BuildReport::default();

        for profile in profiles {
            if skip_column_name(&profile.column) || skip_column_type(profile) {
                report.columns_skipped += 1;
                continue;
            }

            match self.column_passes_sizing(&profile.table, &profile.column).await {
                Some(true) => {}
                Some(false) | None => {
                    report.columns_skipped += 1;
                    continue;
                }
            }

            let values = match self.distinct_values(&profile.table, &profile.column).await {
                Some(values) => values,
                None => {
                    report.columns_skipped += 1;
                    continue;
                }
            };
            if values.is_empty() {
                info!(table = %profile.table, column = %profile.column, "no distinct values, skipping");
                report.columns_skipped += 1;
                continue;
            }

            for value in &values {
                self.index_value(&profile.table, &profile.column, value).await?;
            }
            report.columns_indexed += 1;
            report.values_indexed += values.len();
        }

        info!(
            indexed = report.columns_indexed,
            skipped = report.columns_skipped,
            values = report.values_indexed,
            "value index build complete"
        );
        Ok(report)
    }

    /// Build the index from a flat list of text chunks under one source
    /// label, for callers that bring their own values.
    pub async fn build_from_chunks(&self, source: &str, chunks: &[String]) -> Result<BuildReport> {
        let mut report = BuildReport::default();
        for chunk in chunks {
            if chunk.trim().is_empty() {
                continue;
            }
            self.index_value(source, "chunk", chunk).await?;
            report.values_indexed += 1;
        }
        report.columns_indexed = 1;
        Ok(report)
    }

    async fn index_value(&self, table: &str, column: &str, value: &str) -> Result<()> {
        let signature = self.hasher.signature(value);
        let keys = self.hasher.band_keys(&signature, self.bands, self.rows);
        let record = SignatureRecord {
            table: table.to_string(),
            column: column.to_string(),
            value: value.to_string(),
            signature,
        };
        self.backend.store_signature(&record, &keys).await?;
        Ok(())
    }

    /// Sizing gate over the column's *distinct* values: small columns
    /// always pass, short-valued columns pass under the general cap,
    /// name-suggesting columns get the higher cap. Repetition in the
    /// table must not count against the column; only the distinct
    /// footprint matters. `None` means the sizing query itself failed.
    async fn column_passes_sizing(&self, table: &str, column: &str) -> Option<bool> {
        let sql = format!(
            "SELECT SUM(LENGTH(v)) AS total_len, COUNT(v) AS distinct_count \
             FROM (SELECT DISTINCT `{column}` AS v FROM `{table}` WHERE `{column}` IS NOT NULL) AS d"
        );
        let outcome = self.backend.execute(&sql).await;
        if !outcome.success {
            warn!(table, column, error = ?outcome.error, "sizing query failed, skipping column");
            return None;
        }

        let row = outcome.rows.as_ref()?.first()?;
        let total_len = row.get("total_len").and_then(|v| v.as_i64()).unwrap_or(0);
        let count = row.get("distinct_count").and_then(|v| v.as_i64()).unwrap_or(0);
        if count == 0 {
            return Some(false);
        }
        let avg = total_len as f64 / count as f64;

        let is_name_column = column.to_lowercase().contains("name");
        Some(
            (is_name_column && total_len < NAME_COLUMN_CAP)
                || (total_len < self.value_size_cap && avg < 25.0)
                || count < 100,
        )
    }

    async fn distinct_values(&self, table: &str, column: &str) -> Option<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT `{column}` AS v FROM `{table}` WHERE `{column}` IS NOT NULL"
        );
        let outcome = self.backend.execute(&sql).await;
        if !outcome.success {
            warn!(table, column, error = ?outcome.error, "distinct-value query failed, skipping column");
            return None;
        }
        Some(
            outcome
                .rows
                .unwrap_or_default()
                .iter()
                .filter_map(|row| row.get("v").and_then(|v| v.as_str()).map(str::to_string))
                .filter(|v| !v.trim().is_empty())
                .collect(),
        )
    }

    /// Fuzzy lookup: bucket candidates for the query signature, exact
    /// Jaccard re-ranking, top-N per (table, column).
    pub async fn query(&self, text: &str) -> Result<BTreeMap<(String, String), Vec<ValueMatch>>> {
        let signature = self.hasher.signature(text);
        let keys = self.hasher.band_keys(&signature, self.bands, self.rows);
        let candidates = self.backend.signatures_for_buckets(&keys).await?;

        let mut matches: Vec<ValueMatch> = candidates
            .into_iter()
            .map(|record| {
                let similarity = jaccard(&signature, &record.signature);
                ValueMatch {
                    table: record.table,
                    column: record.column,
                    value: record.value,
                    similarity,
                }
            })
            .collect();
        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut grouped: BTreeMap<(String, String), Vec<ValueMatch>> = BTreeMap::new();
        for m in matches {
            let entry = grouped
                .entry((m.table.clone(), m.column.clone()))
                .or_default();
            if entry.len() < self.top_n {
                entry.push(m);
            }
        }
        Ok(grouped)
    }

    pub async fn clear(&self) -> Result<()> {
        self.backend.clear_value_index().await
    }
}

/// Name-based filter: identifier/URL/email/date/phone/address columns
/// are excluded from value indexing.
pub fn skip_column_name(column: &str) -> bool {
    if column.ends_with("Id") {
        return true;
    }
    let lowered = column.to_lowercase();
    SKIP_FRAGMENTS.iter().any(|frag| lowered.contains(frag))
}

/// Type-based filter: primary keys and non-textual columns carry no
/// fuzzy-matchable values. An unknown (empty) declared type passes, so
/// profiles built without introspection still index.
pub fn skip_column_type(profile: &ColumnProfile) -> bool {
    if profile.primary_key {
        return true;
    }
    if profile.data_type.is_empty() {
        return false;
    }
    let t = profile.data_type.to_lowercase();
    !(t.contains("char") || t.contains("text") || t.contains("clob") || t.contains("enum"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_identifier_like_columns() {
        assert!(skip_column_name("user_id"));
        assert!(skip_column_name("customerId"));
        assert!(skip_column_name("homepage_url"));
        assert!(skip_column_name("Email"));
        assert!(skip_column_name("created_date"));
        assert!(skip_column_name("phone_number"));
    }

    #[test]
    fn test_keep_value_bearing_columns() {
        assert!(!skip_column_name("department"));
        assert!(!skip_column_name("first_name"));
        assert!(!skip_column_name("city"));
        assert!(!skip_column_name("status"));
    }

    #[test]
    fn test_skip_primary_keys_and_numeric_types() {
        let profile = |data_type: &str, primary_key: bool| ColumnProfile {
            table: "t".into(),
            column: "c".into(),
            data_type: data_type.into(),
            primary_key,
            ..Default::default()
        };
        assert!(skip_column_type(&profile("INTEGER", true)));
        assert!(skip_column_type(&profile("TEXT", true)));
        assert!(skip_column_type(&profile("INTEGER", false)));
        assert!(skip_column_type(&profile("double", false)));
        assert!(!skip_column_type(&profile("TEXT", false)));
        assert!(!skip_column_type(&profile("varchar(255)", false)));
        assert!(!skip_column_type(&profile("", false)));
    }
}
