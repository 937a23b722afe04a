//! Pooled backend: one bounded MySQL pool per physical database.
//!
//! Outside a transaction, statements run on pool connections with
//! autocommit semantics. `begin` pins one pooled connection to the
//! instance and routes everything through it until commit or rollback.
//! Rollback never returns its connection to the pool: a reused pooled
//! connection can retain stale transactional state, so the connection
//! is detached and closed and later work acquires a fresh one.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnection, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Column, Connection, MySql, Row};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    blob_to_sig, filter_column, is_read_statement, sig_to_blob, ColumnDetail, DatabaseBackend,
    Schema, SignatureRecord, VectorRecord,
};
use crate::error::{AskdbError, Result};
use crate::models::ExecOutcome;

/// Which mechanism started the open transaction. Anything other than an
/// explicit `START TRANSACTION` left session state behind, so the
/// connection is discarded instead of returned to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnStrategy {
    StartTransaction,
    SessionAutocommitOff,
    AutocommitOff,
}

struct MySqlState {
    pool: Option<MySqlPool>,
    txn: Option<(PoolConnection<MySql>, TxnStrategy)>,
}

pub struct MySqlBackend {
    db_id: String,
    url: String,
    pool_min: u32,
    pool_max: u32,
    state: Mutex<MySqlState>,
}

impl MySqlBackend {
    pub fn new(url: &str, db_id: &str, pool_min: u32, pool_max: u32) -> Self {
        Self {
            db_id: db_id.to_string(),
            url: format!("{}/{db_id}", url.trim_end_matches('/')),
            pool_min,
            pool_max,
            state: Mutex::new(MySqlState {
                pool: None,
                txn: None,
            }),
        }
    }

    async fn ensure_pool<'a>(&self, state: &'a mut MySqlState) -> Result<&'a MySqlPool> {
        if state.pool.is_none() {
            debug!(db_id = %self.db_id, "creating mysql pool");
            let pool = MySqlPoolOptions::new()
                .min_connections(self.pool_min.min(self.pool_max))
                .max_connections(self.pool_max)
                .connect(&self.url)
                .await
                .map_err(|e| AskdbError::backend(format!("mysql connect failed: {e}")))?;
            state.pool = Some(pool);
        }
        Ok(state.pool.as_ref().unwrap())
    }

    async fn ensure_index_tables(&self, state: &mut MySqlState) -> Result<()> {
        let pool = self.ensure_pool(state).await?.clone();
        for ddl in [
            "CREATE TABLE IF NOT EXISTS askdb_signatures (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                tbl VARCHAR(255) NOT NULL,
                col VARCHAR(255) NOT NULL,
                value TEXT NOT NULL,
                signature MEDIUMBLOB NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS askdb_buckets (
                bucket_key VARCHAR(80) NOT NULL,
                signature_id BIGINT NOT NULL,
                INDEX idx_askdb_buckets_key (bucket_key)
            )",
            "CREATE TABLE IF NOT EXISTS askdb_vectors (
                source_id VARCHAR(64) PRIMARY KEY,
                tbl VARCHAR(255) NOT NULL,
                col VARCHAR(255) NOT NULL,
                description TEXT NOT NULL,
                vector MEDIUMBLOB NOT NULL
            )",
        ] {
            sqlx::query(ddl)
                .execute(&pool)
                .await
                .map_err(|e| AskdbError::backend(format!("create index tables: {e}")))?;
        }
        Ok(())
    }

    async fn run_on_conn(&self, conn: &mut MySqlConnection, sql: &str) -> ExecOutcome {
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
}

fn decode_row(row: &MySqlRow) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            v.map(|d| serde_json::Value::String(d.to_string()))
                .unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            v.map(|d| serde_json::Value::String(d.to_string()))
                .unwrap_or(serde_json::Value::Null)
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
impl DatabaseBackend for MySqlBackend {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_pool(&mut state).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some((conn, _)) = state.txn.take() {
            let _ = conn.detach().close().await;
        }
        if let Some(pool) = state.pool.take() {
            pool.close().await;
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> ExecOutcome {
        let mut state = self.state.lock().await;

        if let Some((conn, _)) = state.txn.as_mut() {
            let conn: &mut MySqlConnection = conn;
            return self.run_on_conn(conn, sql).await;
        }

        let pool = match self.ensure_pool(&mut state).await {
            Ok(pool) => pool.clone(),
            Err(e) => return ExecOutcome::failure(e.to_string()),
        };
        drop(state);

        let mut conn = match pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => return ExecOutcome::failure(format!("pool acquire failed: {e}")),
        };
        self.run_on_conn(&mut conn, sql).await
    }

    async fn schema(&self) -> Result<Schema> {
        let mut state = self.state.lock().await;
        let pool = self.ensure_pool(&mut state).await?.clone();
        drop(state);

        let rows = sqlx::query(
            "SELECT TABLE_NAME AS t, COLUMN_NAME AS c
             FROM information_schema.columns
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME NOT LIKE 'askdb\\_%'
             ORDER BY TABLE_NAME, ORDINAL_POSITION",
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| AskdbError::backend(format!("schema introspection failed: {e}")))?;

        let mut schema = Schema::new();
        for row in rows {
            let table: String = row.get("t");
            let column: String = row.get("c");
            schema.entry(table).or_insert_with(Vec::new).push(column);
        }
        Ok(schema)
    }

    async fn column_details(&self) -> Result<Vec<ColumnDetail>> {
        let mut state = self.state.lock().await;
        let pool = self.ensure_pool(&mut state).await?.clone();
        drop(state);

        let rows = sqlx::query(
            "SELECT TABLE_NAME AS t, COLUMN_NAME AS c, DATA_TYPE AS dt, COLUMN_KEY AS ck
             FROM information_schema.columns
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME NOT LIKE 'askdb\\_%'
             ORDER BY TABLE_NAME, ORDINAL_POSITION",
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| AskdbError::backend(format!("column introspection failed: {e}")))?;

        Ok(rows
            .iter()
            .map(|row| ColumnDetail {
                table: row.get("t"),
                column: row.get("c"),
                data_type: row.try_get("dt").unwrap_or_default(),
                primary_key: row.try_get::<String, _>("ck").map(|k| k == "PRI").unwrap_or(false),
            })
            .collect())
    }

    /// Start a transaction on a pinned connection, trying three
    /// escalating mechanisms. Total failure is an error, not a silent
    /// fall-through to a non-transactional session.
    async fn begin(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.txn.is_some() {
            return Err(AskdbError::backend("transaction already open"));
        }
        let pool = self.ensure_pool(&mut state).await?.clone();
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| AskdbError::backend(format!("pool acquire failed: {e}")))?;

        let strategies = [
            ("START TRANSACTION", TxnStrategy::StartTransaction),
            ("SET SESSION autocommit = 0", TxnStrategy::SessionAutocommitOff),
            ("SET autocommit = 0", TxnStrategy::AutocommitOff),
        ];

        let mut last_err = None;
        for (sql, strategy) in strategies {
            match sqlx::query(sql).execute(&mut *conn).await {
                Ok(_) => {
                    if strategy != TxnStrategy::StartTransaction {
                        warn!(db_id = %self.db_id, %sql, "transaction started via autocommit fallback");
                    }
                    state.txn = Some((conn, strategy));
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }

        let _ = conn.detach().close().await;
        Err(AskdbError::backend(format!(
            "all transaction start strategies failed: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let (mut conn, strategy) = state
            .txn
            .take()
            .ok_or_else(|| AskdbError::backend("commit without open transaction"))?;

        let result = sqlx::query("COMMIT").execute(&mut *conn).await;

        match strategy {
            TxnStrategy::StartTransaction => {
                // Clean connection, the pool can have it back.
                drop(conn);
            }
            _ => {
                // Session autocommit was flipped; do not leak that state
                // into the pool.
                let _ = conn.detach().close().await;
            }
        }

        result.map_err(|e| AskdbError::backend(format!("commit failed: {e}")))?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let (mut conn, _) = state
            .txn
            .take()
            .ok_or_else(|| AskdbError::backend("rollback without open transaction"))?;

        let result = sqlx::query("ROLLBACK").execute(&mut *conn).await;
        // Always discard the connection after a rollback.
        let _ = conn.detach().close().await;

        result.map_err(|e| AskdbError::backend(format!("rollback failed: {e}")))?;
        Ok(())
    }

    async fn store_signature(
        &self,
        record: &SignatureRecord,
        bucket_keys: &[String],
    ) -> Result<i64> {
        let mut state = self.state.lock().await;
        self.ensure_index_tables(&mut state).await?;
        let pool = self.ensure_pool(&mut state).await?.clone();
        drop(state);

        let result =
            sqlx::query("INSERT INTO askdb_signatures (tbl, col, value, signature) VALUES (?, ?, ?, ?)")
                .bind(&record.table)
                .bind(&record.column)
                .bind(&record.value)
                .bind(sig_to_blob(&record.signature))
                .execute(&pool)
                .await
                .map_err(|e| AskdbError::backend(format!("store signature: {e}")))?;
        let id = result.last_insert_id() as i64;

        for key in bucket_keys {
            sqlx::query("INSERT INTO askdb_buckets (bucket_key, signature_id) VALUES (?, ?)")
                .bind(key)
                .bind(id)
                .execute(&pool)
                .await
                .map_err(|e| AskdbError::backend(format!("store bucket: {e}")))?;
        }
        Ok(id)
    }

    async fn signatures_for_buckets(&self, keys: &[String]) -> Result<Vec<SignatureRecord>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock().await;
        self.ensure_index_tables(&mut state).await?;
        let pool = self.ensure_pool(&mut state).await?.clone();
        drop(state);

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
            .fetch_all(&pool)
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
        let mut state = self.state.lock().await;
        let pool = self.ensure_pool(&mut state).await?.clone();
        drop(state);
        for ddl in [
            "DROP TABLE IF EXISTS askdb_buckets",
            "DROP TABLE IF EXISTS askdb_signatures",
        ] {
            sqlx::query(ddl)
                .execute(&pool)
                .await
                .map_err(|e| AskdbError::backend(format!("clear value index: {e}")))?;
        }
        Ok(())
    }

    async fn store_vector(&self, record: &VectorRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_index_tables(&mut state).await?;
        let pool = self.ensure_pool(&mut state).await?.clone();
        drop(state);

        sqlx::query(
            "INSERT INTO askdb_vectors (source_id, tbl, col, description, vector)
             VALUES (?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE tbl = VALUES(tbl), col = VALUES(col),
                 description = VALUES(description), vector = VALUES(vector)",
        )
        .bind(&record.source_id)
        .bind(&record.table)
        .bind(&record.column)
        .bind(&record.description)
        .bind(crate::embedding::vec_to_blob(&record.vector))
        .execute(&pool)
        .await
        .map_err(|e| AskdbError::backend(format!("store vector: {e}")))?;
        Ok(())
    }

    async fn query_vectors(&self, filter: &[(String, String)]) -> Result<Vec<VectorRecord>> {
        let mut state = self.state.lock().await;
        self.ensure_index_tables(&mut state).await?;
        let pool = self.ensure_pool(&mut state).await?.clone();
        drop(state);

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
            .fetch_all(&pool)
            .await
            .map_err(|e| AskdbError::backend(format!("vector query: {e}")))?;

        Ok(rows
            .iter()
            .map(|row| VectorRecord {
                source_id: row.get("source_id"),
                table: row.get("tbl"),
                column: row.get("col"),
                description: row.get("description"),
                vector: crate::embedding::blob_to_vec(&row.get::<Vec<u8>, _>("vector")),
            })
            .collect())
    }

    async fn load_vectors(&self) -> Result<Vec<VectorRecord>> {
        self.query_vectors(&[]).await
    }

    async fn clear_catalog_index(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let pool = self.ensure_pool(&mut state).await?.clone();
        drop(state);
        sqlx::query("DROP TABLE IF EXISTS askdb_vectors")
            .execute(&pool)
            .await
            .map_err(|e| AskdbError::backend(format!("clear catalog index: {e}")))?;
        Ok(())
    }
}
