//! End-to-end tests against a temp-file sqlite backend, with mock
//! engines behind the public `Engine` trait and the deterministic hash
//! embedder.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use askdb::backend::{sqlite::SqliteBackend, DatabaseBackend, VectorRecord};
use askdb::catalog::{profiles_from_details, CatalogIndex};
use askdb::config::{Config, GeneratorConfig};
use askdb::embedding::{Embedder, HashEmbedder};
use askdb::engine::{Engine, EngineRegistry};
use askdb::error::Result;
use askdb::executor::ExecuteStage;
use askdb::generate::GenerateStage;
use askdb::history::RunHistory;
use askdb::interface::Harness;
use askdb::keywords::KeywordStage;
use askdb::models::{
    CandidateRound, ColumnProfile, ConversationTurn, ExecOutcome, ExecutionStatus, SqlCandidate,
    Task,
};
use askdb::retry::RetryPolicy;
use askdb::revise::ReviseStage;
use askdb::stage::{run_stage, PipelineState};
use askdb::values::ValueIndex;

/// Mock engine that answers by prompt shape: keyword prompts get a JSON
/// list, candidate prompts get candidate JSON, revision prompts get
/// repaired JSON, everything else gets plain narration.
struct RouterEngine {
    name: String,
    sql: String,
    calls: AtomicUsize,
}

impl RouterEngine {
    fn new(name: &str, sql: &str) -> Self {
        Self {
            name: name.to_string(),
            sql: sql.to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Engine for RouterEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, messages: &[ConversationTurn]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        if prompt.contains("JSON array of strings") {
            return Ok(r#"["Marketing", "department"]"#.to_string());
        }
        if prompt.contains("chain_of_thought_reasoning") {
            return Ok(format!(
                r#"{{"chain_of_thought_reasoning": "direct lookup", "SQL": "{}"}}"#,
                self.sql
            ));
        }
        Ok("There are three departments.".to_string())
    }
}

/// Mock engine that always answers with a fixed JSON keyword list.
struct ListEngine {
    keywords: Vec<String>,
}

#[async_trait]
impl Engine for ListEngine {
    fn name(&self) -> &str {
        "list"
    }

    async fn chat(&self, _messages: &[ConversationTurn]) -> Result<String> {
        Ok(serde_json::to_string(&self.keywords).unwrap())
    }
}

/// Hash embedder wrapper that tracks how many embed calls run at once.
struct GaugedEmbedder {
    inner: HashEmbedder,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl GaugedEmbedder {
    fn new(dims: usize) -> Self {
        Self {
            inner: HashEmbedder::new(dims),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Embedder for GaugedEmbedder {
    fn model_name(&self) -> &str {
        "gauged"
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let out = self.inner.embed(texts).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

fn sqlite_backend(dir: &std::path::Path) -> Arc<dyn DatabaseBackend> {
    Arc::new(SqliteBackend::new(dir, "testdb"))
}

async fn seed_departments(backend: &Arc<dyn DatabaseBackend>) {
    let ddl = backend
        .execute("CREATE TABLE departments (name TEXT, head TEXT)")
        .await;
    assert!(ddl.success, "{:?}", ddl.error);
    for name in ["Marketing", "Engineering", "Sales", "Finance", "Support"] {
        let insert = backend
            .execute(&format!(
                "INSERT INTO departments (name, head) VALUES ('{name}', 'head of {name}')"
            ))
            .await;
        assert!(insert.success, "{:?}", insert.error);
    }
}

fn index_config() -> askdb::config::IndexConfig {
    askdb::config::IndexConfig::default()
}

fn name_profile() -> ColumnProfile {
    ColumnProfile {
        table: "departments".into(),
        column: "name".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_exact_value_query_is_top_match() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sqlite_backend(dir.path());
    seed_departments(&backend).await;

    let index = ValueIndex::new(backend.clone(), &index_config());
    let report = index.build_from_catalog(&[name_profile()]).await.unwrap();
    assert_eq!(report.columns_indexed, 1);
    assert_eq!(report.values_indexed, 5);

    let grouped = index.query("Marketing").await.unwrap();
    let matches = grouped
        .get(&("departments".to_string(), "name".to_string()))
        .expect("column should have matches");
    assert_eq!(matches[0].value, "Marketing");
    assert_eq!(matches[0].similarity, 1.0);
}

#[tokio::test]
async fn test_distinct_value_count_is_exact() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sqlite_backend(dir.path());
    backend
        .execute("CREATE TABLE status_log (status TEXT)")
        .await;
    for status in ["open", "closed", "open", "pending", "closed", "open"] {
        backend
            .execute(&format!("INSERT INTO status_log (status) VALUES ('{status}')"))
            .await;
    }

    let index = ValueIndex::new(backend.clone(), &index_config());
    let report = index
        .build_from_catalog(&[ColumnProfile {
            table: "status_log".into(),
            column: "status".into(),
            ..Default::default()
        }])
        .await
        .unwrap();
    assert_eq!(report.values_indexed, 3);
}

#[tokio::test]
async fn test_sizing_measures_distinct_footprint_not_row_count() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sqlite_backend(dir.path());
    backend.execute("CREATE TABLE metros (city TEXT)").await;

    // 120 distinct 10-char values: distinct footprint 1200 bytes.
    let values: Vec<String> = (0..120).map(|i| format!("('metro-{i:04}')")).collect();
    let insert = backend
        .execute(&format!("INSERT INTO metros (city) VALUES {}", values.join(", ")))
        .await;
    assert!(insert.success, "{:?}", insert.error);
    // Repeat every value 4x; the total footprint (4800) now exceeds the
    // cap but the distinct footprint does not.
    for _ in 0..2 {
        backend.execute("INSERT INTO metros SELECT city FROM metros").await;
    }

    let config = askdb::config::IndexConfig {
        value_size_cap: 2000,
        ..Default::default()
    };
    let index = ValueIndex::new(backend.clone(), &config);
    let report = index
        .build_from_catalog(&[ColumnProfile {
            table: "metros".into(),
            column: "city".into(),
            ..Default::default()
        }])
        .await
        .unwrap();
    assert_eq!(report.columns_indexed, 1, "skipped={}", report.columns_skipped);
    assert_eq!(report.values_indexed, 120);
}

#[tokio::test]
async fn test_index_build_skips_primary_keys_and_numeric_columns() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sqlite_backend(dir.path());
    backend
        .execute("CREATE TABLE teams (rank INTEGER PRIMARY KEY, score INTEGER, city TEXT)")
        .await;
    for (rank, score, city) in [(1, 90, "Lisbon"), (2, 85, "Porto"), (3, 80, "Braga")] {
        backend
            .execute(&format!(
                "INSERT INTO teams (rank, score, city) VALUES ({rank}, {score}, '{city}')"
            ))
            .await;
    }

    let details = backend.column_details().await.unwrap();
    let profiles = profiles_from_details(&details);
    let index = ValueIndex::new(backend.clone(), &index_config());
    let report = index.build_from_catalog(&profiles).await.unwrap();

    assert_eq!(report.columns_indexed, 1);
    assert_eq!(report.columns_skipped, 2);
    let grouped = index.query("Lisbon").await.unwrap();
    assert!(!grouped.is_empty());
    assert!(grouped.keys().all(|(_, column)| column == "city"));
}

#[tokio::test]
async fn test_execute_reconnects_after_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sqlite_backend(dir.path());
    seed_departments(&backend).await;

    backend.disconnect().await.unwrap();
    let count = backend
        .execute("SELECT COUNT(*) AS n FROM departments")
        .await;
    assert!(count.success, "{:?}", count.error);
    assert_eq!(count.rows.unwrap()[0]["n"].as_i64().unwrap(), 5);
}

#[tokio::test]
async fn test_execute_never_raises_for_malformed_sql() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sqlite_backend(dir.path());
    let outcome = backend.execute("SELEKT * FORM nothing").await;
    assert!(!outcome.success);
    assert!(outcome.error.is_some());

    let outcome = backend.execute("SELECT * FROM nosuchtable").await;
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("no such table"));
}

#[tokio::test]
async fn test_rollback_restores_row_counts() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sqlite_backend(dir.path());
    seed_departments(&backend).await;

    backend.begin().await.unwrap();
    let insert = backend
        .execute("INSERT INTO departments (name, head) VALUES ('Legal', 'nobody')")
        .await;
    assert!(insert.success);
    backend.rollback().await.unwrap();

    let count = backend
        .execute("SELECT COUNT(*) AS n FROM departments")
        .await;
    let n = count.rows.unwrap()[0]["n"].as_i64().unwrap();
    assert_eq!(n, 5);
}

#[tokio::test]
async fn test_commit_persists_rows() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sqlite_backend(dir.path());
    seed_departments(&backend).await;

    backend.begin().await.unwrap();
    backend
        .execute("INSERT INTO departments (name, head) VALUES ('Legal', 'somebody')")
        .await;
    backend.commit().await.unwrap();

    let count = backend
        .execute("SELECT COUNT(*) AS n FROM departments")
        .await;
    assert_eq!(count.rows.unwrap()[0]["n"].as_i64().unwrap(), 6);
}

#[tokio::test]
async fn test_stored_vector_found_through_filtered_query() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sqlite_backend(dir.path());
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));

    let text = "department\nthe department an employee belongs to";
    let vector = embedder.embed_query(text).await.unwrap();
    backend
        .store_vector(&VectorRecord {
            source_id: "src-42".into(),
            table: "employee".into(),
            column: "department".into(),
            description: text.into(),
            vector,
        })
        .await
        .unwrap();

    let catalog = CatalogIndex::new(backend.clone(), embedder, 16);
    let matches = catalog
        .query(text, &[("source_id".into(), "src-42".into())], 5)
        .await
        .unwrap();
    assert_eq!(matches[0].source_id, "src-42");
    assert!(matches[0].score > 0.99);
}

fn generator(name: &str, engines: Vec<&str>, samples: usize) -> GeneratorConfig {
    GeneratorConfig {
        name: name.to_string(),
        engines: engines.into_iter().map(String::from).collect(),
        parser: "candidate_json".to_string(),
        template: "generate_candidate".to_string(),
        samples,
        fallback_engine: None,
    }
}

fn fresh_state() -> PipelineState {
    PipelineState::new(
        Task::new("testdb", "How many departments are there?", ""),
        RunHistory::new("test-run"),
    )
}

#[tokio::test]
async fn test_generation_yields_sum_of_sample_counts() {
    let mut registry = EngineRegistry::empty();
    registry.insert(Arc::new(RouterEngine::new("fast", "SELECT 1")));
    registry.insert(Arc::new(RouterEngine::new("strong", "SELECT 2")));
    let registry = Arc::new(registry);

    let stage = GenerateStage::new(
        registry,
        vec![
            generator("first", vec!["fast"], 1),
            generator("second", vec!["strong"], 2),
        ],
        RetryPolicy::fail_fast(),
    );

    let mut state = fresh_state();
    run_stage(&stage, &mut state).await;

    let round = state.latest_round().unwrap();
    assert_eq!(round.name, "generate");
    assert_eq!(round.candidates.len(), 3);
    assert!(state.errors.is_empty());
}

#[tokio::test]
async fn test_generation_rotates_engines_round_robin() {
    let a = Arc::new(RouterEngine::new("a", "SELECT 1"));
    let b = Arc::new(RouterEngine::new("b", "SELECT 2"));
    let mut registry = EngineRegistry::empty();
    registry.insert(a.clone());
    registry.insert(b.clone());

    let stage = GenerateStage::new(
        Arc::new(registry),
        vec![generator("rotating", vec!["a", "b"], 4)],
        RetryPolicy::fail_fast(),
    );

    let mut state = fresh_state();
    run_stage(&stage, &mut state).await;

    assert_eq!(state.latest_round().unwrap().candidates.len(), 4);
    assert_eq!(a.calls.load(Ordering::SeqCst), 2);
    assert_eq!(b.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_revision_round_is_positionally_aligned() {
    let engine = Arc::new(RouterEngine::new("fixer", "SELECT fixed FROM departments"));

    let mut good = SqlCandidate::new("SELECT name FROM departments");
    good.status = ExecutionStatus::SyntacticallyCorrect;
    let mut bad = SqlCandidate::new("SELECT * FROM nosuchtable");
    bad.status = ExecutionStatus::Error;
    bad.execution_result = Some(ExecOutcome::failure("no such table: nosuchtable"));

    let mut state = fresh_state();
    state.rounds.push(CandidateRound {
        name: "generate".into(),
        candidates: vec![good.clone(), bad],
    });

    let stage = ReviseStage::new(engine.clone(), RetryPolicy::fail_fast(), 5, 4);
    run_stage(&stage, &mut state).await;

    let round = state.latest_round().unwrap();
    assert_eq!(round.name, "revise_1");
    assert_eq!(round.candidates.len(), 2);
    // Already-correct candidate passes through untouched.
    assert_eq!(round.candidates[0].sql, good.sql);
    // The failing one was repaired by exactly one engine call.
    assert_eq!(round.candidates[1].sql, "SELECT fixed FROM departments");
    assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_executor_captures_missing_table_without_raising() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sqlite_backend(dir.path());
    seed_departments(&backend).await;

    let mut candidate = SqlCandidate::new("SELECT * FROM nosuchtable");
    candidate.status = ExecutionStatus::Error;
    let mut state = fresh_state();
    state.rounds.push(CandidateRound {
        name: "generate".into(),
        candidates: vec![candidate],
    });

    let stage = ExecuteStage::new(backend, Duration::from_secs(60));
    run_stage(&stage, &mut state).await;

    let result = state.final_result.as_ref().unwrap();
    assert!(!result.success);
    assert!(result.error.as_ref().unwrap().contains("no such table"));
    assert!(state.errors.contains_key("execute_sql"));
    assert_eq!(state.history.entries().len(), 1);
}

fn harness_config(dir: &std::path::Path) -> Config {
    let toml_str = format!(
        r#"
[database]
backend = "sqlite"
root = "{root}"

[history]
dir = "{runs}"

[[engines]]
name = "mock"
model = "unused"

[[generators]]
name = "direct"
engines = ["mock"]
parser = "candidate_json"
samples = 2
"#,
        root = dir.display(),
        runs = dir.join("runs").display(),
    );
    toml::from_str(&toml_str).unwrap()
}

#[tokio::test]
async fn test_full_pipeline_answers_question() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sqlite_backend(dir.path());
    seed_departments(&backend).await;

    let mut registry = EngineRegistry::empty();
    registry.insert(Arc::new(RouterEngine::new(
        "mock",
        "SELECT COUNT(*) AS n FROM departments",
    )));
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));

    let harness = Harness::with_components(
        harness_config(dir.path()),
        backend,
        Arc::new(registry),
        embedder,
    );
    harness.build_indexes().await.unwrap();

    let response = harness
        .ask("How many departments are there?", "", "testdb", Vec::new())
        .await
        .unwrap();

    assert_eq!(response.status, "ok");
    assert_eq!(
        response.sql.as_deref(),
        Some("SELECT COUNT(*) AS n FROM departments")
    );
    let rows = response.rows.unwrap();
    assert_eq!(rows[0]["n"].as_i64().unwrap(), 5);
    assert_eq!(response.response, "There are three departments.");

    // One history entry per stage, flushed to the run file.
    let stage_names: Vec<&str> = response
        .execution_history
        .iter()
        .map(|e| e.tool_name.as_str())
        .collect();
    assert_eq!(
        stage_names,
        vec![
            "extract_keywords",
            "assemble_schema",
            "generate_candidates",
            "assess_candidates",
            "revise_candidates",
            "assess_candidates",
            "execute_sql",
            "narrate_response",
        ]
    );
}

#[tokio::test]
async fn test_keyword_lookups_run_under_bounded_embedding_fanout() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sqlite_backend(dir.path());
    seed_departments(&backend).await;

    let embedder = Arc::new(GaugedEmbedder::new(32));
    let engine = Arc::new(ListEngine {
        keywords: (0..12).map(|i| format!("keyword-{i}")).collect(),
    });
    let value_index = Arc::new(ValueIndex::new(backend.clone(), &index_config()));
    let catalog = Arc::new(CatalogIndex::new(
        backend.clone(),
        embedder.clone() as Arc<dyn Embedder>,
        16,
    ));

    let stage = KeywordStage::new(engine, value_index, catalog, 5);
    let mut state = fresh_state();
    state.task.evidence = "budget figures".to_string();
    run_stage(&stage, &mut state).await;

    assert_eq!(state.keywords.len(), 12);
    assert!(state.errors.is_empty());
    let peak = embedder.peak.load(Ordering::SeqCst);
    assert!(peak >= 1);
    assert!(peak <= 4, "peak concurrent embed calls was {peak}");
}

#[tokio::test]
async fn test_empty_generator_engine_list_is_error_not_panic() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sqlite_backend(dir.path());
    seed_departments(&backend).await;

    let mut config = harness_config(dir.path());
    config.generators[0].engines.clear();

    let mut registry = EngineRegistry::empty();
    registry.insert(Arc::new(RouterEngine::new("mock", "SELECT 1")));
    let harness = Harness::with_components(
        config,
        backend,
        Arc::new(registry),
        Arc::new(HashEmbedder::new(16)),
    );

    let err = harness
        .ask("anything", "", "testdb", Vec::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no engines"));
}

#[tokio::test]
async fn test_unknown_engine_fails_harness_construction() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = harness_config(dir.path());
    config.generators[0].engines = vec!["missing".to_string()];
    let err = Harness::new(config, "testdb").unwrap_err();
    assert!(err.to_string().contains("unknown engine"));
}

#[tokio::test]
async fn test_unknown_parser_fails_harness_construction() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = harness_config(dir.path());
    config.generators[0].parser = "made_up".to_string();
    let err = Harness::new(config, "testdb").unwrap_err();
    assert!(err.to_string().contains("unknown parser"));
}
