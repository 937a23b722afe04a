//! Embedded backend: one sqlite file per database id.
//!
//! The instance owns at most one connection, behind a `tokio` mutex, so
//! no two units of work ever share the cursor. Index artifacts live in
//! the same file as the data, in lazily created `askdb_`-prefixed
//! tables; signatures and vectors are stored as little-endian blobs.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    blob_to_sig, filter_column, is_read_statement, sig_to_blob, ColumnDetail, DatabaseBackend,
    Schema, SignatureRecord, VectorRecord,
};
use crate::error::{AskdbError, Result};
use crate::models::ExecOutcome;

pub struct SqliteBackend {
    db_id: String,
    path: PathBuf,
    conn: Mutex<Option<SqliteConnection>>,
}

impl SqliteBackend {
    pub fn new(root: &Path, db_id: &str) -> Self {
        Self {
            db_id: db_id.to_string(),
            path: root.join(format!("{db_id}.sqlite")),
            conn: Mutex::new(None),
        }
    }

    pub fn db_id(&self) -> &str {
        &self.db_id
    }

    async fn open(&self) -> Result<SqliteConnection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AskdbError::backend(format!("create db directory: {e}")))?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", self.path.display()))
            .map_err(|e| AskdbError::backend(format!("invalid sqlite path: {e}")))?
            .create_if_missing(true);
        options
            .connect()
            .await
            .map_err(|e| AskdbError::backend(format!("sqlite connect failed: {e}")))
    }

    /// Connect lazily if the instance holds no connection yet. A cached
    /// connection that fails its ping is dropped and reopened once
    /// before the error surfaces.
    async fn ensure<'a>(
        &self,
        guard: &'a mut Option<SqliteConnection>,
    ) -> Result<&'a mut SqliteConnection> {
        let alive = match guard.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        };
        if !alive {
            if let Some(dead) = guard.take() {
                debug!(db_id = %self.db_id, "sqlite connection unresponsive, reopening");
                let _ = dead.close().await;
            } else {
                debug!(db_id = %self.db_id, "opening sqlite connection");
            }
            *guard = Some(self.open().await?);
        }
        Ok(guard.as_mut().unwrap())
    }

    async fn ensure_signature_tables(conn: &mut SqliteConnection) -> Result<()> {
        for ddl in [
            "CREATE TABLE IF NOT EXISTS askdb_signatures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tbl TEXT NOT NULL,
                col TEXT NOT NULL,
                value TEXT NOT NULL,
                signature BLOB NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS askdb_buckets (
                bucket_key TEXT NOT NULL,
                signature_id INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_askdb_buckets_key ON askdb_buckets(bucket_key)",
        ] {
            sqlx::query(ddl)
                .execute(&mut *conn)
                .await
                .map_err(|e| AskdbError::backend(format!("create index tables: {e}")))?;
        }
        Ok(())
    }

    async fn ensure_vector_table(conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS askdb_vectors (
                source_id TEXT PRIMARY KEY,
                tbl TEXT NOT NULL,
                col TEXT NOT NULL,
                description TEXT NOT NULL,
                vector BLOB NOT NULL
            )",
        )
        .execute(conn)
        .await
        .map_err(|e| AskdbError::backend(format!("create vector table: {e}")))?;
        Ok(())
    }
}

fn decode_row(row: &SqliteRow) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            v.map(|b| serde_json::Value::String(format!("<blob {} bytes>", b.len())))
                .unwrap_or(serde_json::Value::Null)
        } else {
            serde_json::Value::Null
        };
        obj.insert(column.name().to_string(), value);
    }
    serde_json::Value::Object(obj)
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        self.ensure(&mut guard).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            // Close errors on teardown are not actionable.
            let _ = conn.close().await;
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> ExecOutcome {
        let mut guard = self.conn.lock().await;
        let conn = match self.ensure(&mut guard).await {
            Ok(conn) => conn,
            Err(e) => return ExecOutcome::failure(e.to_string()),
        };

        if is_read_statement(sql) {
            match sqlx::query(sql).fetch_all(&mut *conn).await {
                Ok(rows) => {
                    let decoded: Vec<serde_json::Value> = rows.iter().map(decode_row).collect();
                    ExecOutcome {
                        success: true,
                        rowcount: decoded.len() as i64,
                        rows: Some(decoded),
                        error: None,
                    }
                }
                Err(e) => ExecOutcome::failure(e.to_string()),
            }
        } else {
            match sqlx::query(sql).execute(&mut *conn).await {
                Ok(result) => ExecOutcome {
                    success: true,
                    rows: None,
                    rowcount: result.rows_affected() as i64,
                    error: None,
                },
                Err(e) => ExecOutcome::failure(e.to_string()),
            }
        }
    }

    async fn schema(&self) -> Result<Schema> {
        let mut guard = self.conn.lock().await;
        let conn = self.ensure(&mut guard).await?;

        let tables: Vec<String> = sqlx::query(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE 'askdb_%'
             ORDER BY name",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| AskdbError::backend(format!("schema introspection failed: {e}")))?
        .iter()
        .filter_map(|row| row.try_get::<String, _>(0).ok())
        .collect();

        let mut schema = Schema::new();
        for table in tables {
            let columns: Vec<String> =
                sqlx::query(&format!("PRAGMA table_info(\"{}\")", table.replace('"', "\"\"")))
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(|e| {
                        AskdbError::backend(format!("column introspection failed for {table}: {e}"))
                    })?
                    .iter()
                    .filter_map(|row| row.try_get::<String, _>("name").ok())
                    .collect();
            schema.insert(table, columns);
        }
        Ok(schema)
    }

    async fn column_details(&self) -> Result<Vec<ColumnDetail>> {
        let mut guard = self.conn.lock().await;
        let conn = self.ensure(&mut guard).await?;

        let tables: Vec<String> = sqlx::query(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE 'askdb_%'
             ORDER BY name",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| AskdbError::backend(format!("schema introspection failed: {e}")))?
        .iter()
        .filter_map(|row| row.try_get::<String, _>(0).ok())
        .collect();

        let mut details = Vec::new();
        for table in tables {
            let rows =
                sqlx::query(&format!("PRAGMA table_info(\"{}\")", table.replace('"', "\"\"")))
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(|e| {
                        AskdbError::backend(format!("column introspection failed for {table}: {e}"))
                    })?;
            for row in rows {
                details.push(ColumnDetail {
                    table: table.clone(),
                    column: row.try_get("name").unwrap_or_default(),
                    data_type: row.try_get("type").unwrap_or_default(),
                    primary_key: row.try_get::<i64, _>("pk").unwrap_or(0) > 0,
                });
            }
        }
        Ok(details)
    }

    async fn begin(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = self.ensure(&mut guard).await?;
        sqlx::query("BEGIN")
            .execute(conn)
            .await
            .map_err(|e| AskdbError::backend(format!("begin failed: {e}")))?;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = self.ensure(&mut guard).await?;
        sqlx::query("COMMIT")
            .execute(conn)
            .await
            .map_err(|e| AskdbError::backend(format!("commit failed: {e}")))?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = self.ensure(&mut guard).await?;
        sqlx::query("ROLLBACK")
            .execute(conn)
            .await
            .map_err(|e| AskdbError::backend(format!("rollback failed: {e}")))?;
        Ok(())
    }

    async fn store_signature(
        &self,
        record: &SignatureRecord,
        bucket_keys: &[String],
    ) -> Result<i64> {
        let mut guard = self.conn.lock().await;
        let conn = self.ensure(&mut guard).await?;
        Self::ensure_signature_tables(conn).await?;

        let result =
            sqlx::query("INSERT INTO askdb_signatures (tbl, col, value, signature) VALUES (?, ?, ?, ?)")
                .bind(&record.table)
                .bind(&record.column)
                .bind(&record.value)
                .bind(sig_to_blob(&record.signature))
                .execute(&mut *conn)
                .await
                .map_err(|e| AskdbError::backend(format!("store signature: {e}")))?;
        let id = result.last_insert_rowid();

        for key in bucket_keys {
            sqlx::query("INSERT INTO askdb_buckets (bucket_key, signature_id) VALUES (?, ?)")
                .bind(key)
                .bind(id)
                .execute(&mut *conn)
                .await
                .map_err(|e| AskdbError::backend(format!("store bucket: {e}")))?;
        }
        Ok(id)
    }

    async fn signatures_for_buckets(&self, keys: &[String]) -> Result<Vec<SignatureRecord>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut guard = self.conn.lock().await;
        let conn = self.ensure(&mut guard).await?;
        Self::ensure_signature_tables(conn).await?;

        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT s.tbl, s.col, s.value, s.signature
             FROM askdb_signatures s
             JOIN askdb_buckets b ON b.signature_id = s.id
             WHERE b.bucket_key IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for key in keys {
            query = query.bind(key);
        }
        let rows = query
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| AskdbError::backend(format!("bucket lookup: {e}")))?;

        Ok(rows
            .iter()
            .map(|row| SignatureRecord {
                table: row.get("tbl"),
                column: row.get("col"),
                value: row.get("value"),
                signature: blob_to_sig(&row.get::<Vec<u8>, _>("signature")),
            })
            .collect())
    }

    async fn clear_value_index(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = self.ensure(&mut guard).await?;
        for ddl in [
            "DROP TABLE IF EXISTS askdb_buckets",
            "DROP TABLE IF EXISTS askdb_signatures",
        ] {
            sqlx::query(ddl)
                .execute(&mut *conn)
                .await
                .map_err(|e| AskdbError::backend(format!("clear value index: {e}")))?;
        }
        Ok(())
    }

    async fn store_vector(&self, record: &VectorRecord) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = self.ensure(&mut guard).await?;
        Self::ensure_vector_table(conn).await?;

        sqlx::query(
            "INSERT OR REPLACE INTO askdb_vectors (source_id, tbl, col, description, vector)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.source_id)
        .bind(&record.table)
        .bind(&record.column)
        .bind(&record.description)
        .bind(crate::embedding::vec_to_blob(&record.vector))
        .execute(conn)
        .await
        .map_err(|e| AskdbError::backend(format!("store vector: {e}")))?;
        Ok(())
    }

    async fn query_vectors(&self, filter: &[(String, String)]) -> Result<Vec<VectorRecord>> {
        let mut guard = self.conn.lock().await;
        let conn = self.ensure(&mut guard).await?;
        Self::ensure_vector_table(conn).await?;

        let mut sql =
            "SELECT source_id, tbl, col, description, vector FROM askdb_vectors".to_string();
        let mut clauses = Vec::new();
        for (field, _) in filter {
            clauses.push(format!("{} = ?", filter_column(field)?));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let mut query = sqlx::query(&sql);
        for (_, value) in filter {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(conn)
            .await
            .map_err(|e| AskdbError::backend(format!("vector query: {e}")))?;

        Ok(rows.iter().map(vector_from_row).collect())
    }

    async fn load_vectors(&self) -> Result<Vec<VectorRecord>> {
        self.query_vectors(&[]).await
    }

    async fn clear_catalog_index(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = self.ensure(&mut guard).await?;
        sqlx::query("DROP TABLE IF EXISTS askdb_vectors")
            .execute(conn)
            .await
            .map_err(|e| AskdbError::backend(format!("clear catalog index: {e}")))?;
        Ok(())
    }
}

fn vector_from_row(row: &SqliteRow) -> VectorRecord {
    VectorRecord {
        source_id: row.get("source_id"),
        table: row.get("tbl"),
        column: row.get("col"),
        description: row.get("description"),
        vector: crate::embedding::blob_to_vec(&row.get::<Vec<u8>, _>("vector")),
    }
}
