//! Database backend contract and factory.
//!
//! Both variants implement [`DatabaseBackend`]: schema introspection,
//! transactional SQL execution that never raises for SQL errors, and
//! persistence for the value and catalog indices. The variant set is
//! closed — [`BackendKind`] is matched exhaustively at construction,
//! there is no runtime type inspection and no process-wide singleton.
//! Callers hold the factory-returned handle and pass it where needed.

pub mod mysql;
pub mod sqlite;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::DatabaseConfig;
use crate::error::{AskdbError, Result};
use crate::models::ExecOutcome;

/// One stored MinHash signature, owned by its (table, column, value).
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureRecord {
    pub table: String,
    pub column: String,
    pub value: String,
    pub signature: Vec<u64>,
}

/// One stored catalog embedding with the metadata that supports
/// equality-filtered retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub source_id: String,
    pub table: String,
    pub column: String,
    pub description: String,
    pub vector: Vec<f32>,
}

/// Schema as `{table: [columns]}`, ordered for stable prompt text.
pub type Schema = BTreeMap<String, Vec<String>>;

/// One introspected column with the type and key metadata the value
/// index filters on.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDetail {
    pub table: String,
    pub column: String,
    pub data_type: String,
    pub primary_key: bool,
}

#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;

    /// Execute one SQL statement. SQL errors are captured into the
    /// outcome, never returned as `Err`.
    async fn execute(&self, sql: &str) -> ExecOutcome;

    async fn schema(&self) -> Result<Schema>;

    /// Per-column type and primary-key metadata for every user table.
    async fn column_details(&self) -> Result<Vec<ColumnDetail>>;

    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    /// Persist one signature and its LSH bucket keys; returns the
    /// signature id the buckets point at.
    async fn store_signature(
        &self,
        record: &SignatureRecord,
        bucket_keys: &[String],
    ) -> Result<i64>;

    /// All signatures reachable from any of the given bucket keys,
    /// deduplicated.
    async fn signatures_for_buckets(&self, keys: &[String]) -> Result<Vec<SignatureRecord>>;

    async fn clear_value_index(&self) -> Result<()>;

    async fn store_vector(&self, record: &VectorRecord) -> Result<()>;

    /// Vectors whose metadata matches every (field, value) pair. Fields
    /// outside {table, column, source_id} are rejected.
    async fn query_vectors(&self, filter: &[(String, String)]) -> Result<Vec<VectorRecord>>;

    /// Full vector load, the fallback access path for similarity scans.
    async fn load_vectors(&self) -> Result<Vec<VectorRecord>>;

    async fn clear_catalog_index(&self) -> Result<()>;
}

/// The closed set of backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite,
    Mysql,
}

impl BackendKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "sqlite" => Ok(BackendKind::Sqlite),
            "mysql" => Ok(BackendKind::Mysql),
            other => Err(AskdbError::config(format!(
                "unknown database backend '{other}'"
            ))),
        }
    }
}

/// Construct a backend handle for one database id. Called once at
/// startup; the handle is passed by dependency injection from there on.
pub fn create_backend(config: &DatabaseConfig, db_id: &str) -> Result<Arc<dyn DatabaseBackend>> {
    match BackendKind::parse(&config.backend)? {
        BackendKind::Sqlite => Ok(Arc::new(sqlite::SqliteBackend::new(&config.root, db_id))),
        BackendKind::Mysql => {
            let url = config.url.as_deref().ok_or_else(|| {
                AskdbError::config("database.url is required for the mysql backend")
            })?;
            Ok(Arc::new(mysql::MySqlBackend::new(
                url,
                db_id,
                config.pool_min,
                config.pool_max,
            )))
        }
    }
}

/// Read-only statement prefixes: these fetch rows, everything else
/// executes for an affected-row count.
pub(crate) fn is_read_statement(sql: &str) -> bool {
    let first = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase();
    matches!(
        first.as_str(),
        "select" | "show" | "describe" | "desc" | "explain" | "with" | "pragma"
    )
}

pub(crate) fn sig_to_blob(signature: &[u64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(signature.len() * 8);
    for &v in signature {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub(crate) fn blob_to_sig(blob: &[u8]) -> Vec<u64> {
    blob.chunks_exact(8)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

/// Metadata fields the vector shadow store can filter on.
pub(crate) fn filter_column(field: &str) -> Result<&'static str> {
    match field {
        "table" => Ok("tbl"),
        "column" => Ok("col"),
        "source_id" => Ok("source_id"),
        other => Err(AskdbError::Index(format!(
            "unsupported vector filter field '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_classification() {
        assert!(is_read_statement("SELECT * FROM t"));
        assert!(is_read_statement("  with x as (select 1) select * from x"));
        assert!(is_read_statement("SHOW TABLES"));
        assert!(!is_read_statement("INSERT INTO t VALUES (1)"));
        assert!(!is_read_statement("UPDATE t SET a = 1"));
        assert!(!is_read_statement(""));
    }

    #[test]
    fn test_signature_blob_roundtrip() {
        let sig = vec![0u64, 1, u64::MAX, 42];
        assert_eq!(blob_to_sig(&sig_to_blob(&sig)), sig);
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!(BackendKind::parse("sqlite").unwrap(), BackendKind::Sqlite);
        assert_eq!(BackendKind::parse("mysql").unwrap(), BackendKind::Mysql);
        assert!(BackendKind::parse("postgres").is_err());
    }

    #[test]
    fn test_filter_field_allowlist() {
        assert!(filter_column("table").is_ok());
        assert!(filter_column("source_id").is_ok());
        assert!(filter_column("description; DROP TABLE x").is_err());
    }
}
