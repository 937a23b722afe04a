//! TOML configuration for the harness.
//!
//! Configuration errors are fatal at load time: an unknown backend kind,
//! an engine reference that no `[[engines]]` entry defines, or an unknown
//! parser name all fail [`load_config`] rather than being defaulted.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{AskdbError, Result};
use crate::parse::is_known_parser;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub engines: Vec<EngineConfig>,
    pub generators: Vec<GeneratorConfig>,
    #[serde(default)]
    pub revision: RevisionConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub keywords: KeywordsConfig,
}

/// Which backend variant to construct, and where its data lives.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// `"sqlite"` (embedded, one file per database id) or `"mysql"` (pooled).
    pub backend: String,
    /// Directory holding `<db_id>.sqlite` files. Embedded variant only.
    #[serde(default = "default_db_root")]
    pub root: PathBuf,
    /// Connection URL for the pooled variant, e.g. `mysql://user:pw@host/`.
    #[serde(default)]
    pub url: Option<String>,
    /// Connections the pool keeps warm even when idle.
    #[serde(default = "default_pool_min")]
    pub pool_min: u32,
    #[serde(default = "default_pool_max")]
    pub pool_max: u32,
}

fn default_db_root() -> PathBuf {
    PathBuf::from("data/databases")
}
fn default_pool_min() -> u32 {
    2
}
fn default_pool_max() -> u32 {
    10
}

/// Value-index tuning. Signature size and n-gram size are fixed at build
/// time; queries against an index built with different parameters are
/// meaningless, so these are global rather than per-call.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_signature_size")]
    pub signature_size: usize,
    #[serde(default = "default_ngram")]
    pub ngram: usize,
    /// LSH bucketing threshold. Deliberately low: bucketing favors
    /// recall, exact Jaccard re-ranking restores precision.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    /// Aggregate distinct-value size cap above which a column is skipped
    /// unless its name suggests a human name.
    #[serde(default = "default_value_size_cap")]
    pub value_size_cap: i64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            signature_size: default_signature_size(),
            ngram: default_ngram(),
            threshold: default_threshold(),
            top_n: default_top_n(),
            value_size_cap: default_value_size_cap(),
        }
    }
}

fn default_signature_size() -> usize {
    100
}
fn default_ngram() -> usize {
    3
}
fn default_threshold() -> f64 {
    0.01
}
fn default_top_n() -> usize {
    10
}
fn default_value_size_cap() -> i64 {
    2_000_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"` (any OpenAI-compatible endpoint) or `"hash"`
    /// (deterministic local vectors, for offline use and tests).
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".to_string(),
            model: None,
            dims: default_dims(),
            base_url: default_embedding_base_url(),
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    256
}
fn default_embedding_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// One named entry in the engine registry.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub name: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default = "default_engine_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_temperature() -> f64 {
    0.2
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_engine_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

/// One generator strategy: a prompt template, one or more engines to
/// rotate across, a parser, and a sample count.
#[derive(Debug, Deserialize, Clone)]
pub struct GeneratorConfig {
    pub name: String,
    /// Engine names; samples rotate round-robin across these.
    pub engines: Vec<String>,
    pub parser: String,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default = "default_samples")]
    pub samples: usize,
    /// Swapped in once if an engine returns an empty response.
    #[serde(default)]
    pub fallback_engine: Option<String>,
}

fn default_template() -> String {
    "generate_candidate".to_string()
}
fn default_samples() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct RevisionConfig {
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default = "default_revision_batch")]
    pub batch_size: usize,
    #[serde(default = "default_pool_cap")]
    pub pool_cap: usize,
}

impl Default for RevisionConfig {
    fn default() -> Self {
        Self {
            engine: None,
            batch_size: default_revision_batch(),
            pool_cap: default_pool_cap(),
        }
    }
}

fn default_revision_batch() -> usize {
    5
}
fn default_pool_cap() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutorConfig {
    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_exec_timeout(),
        }
    }
}

fn default_exec_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: u64,
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            jitter_max_ms: default_jitter_max_ms(),
            fail_fast: false,
        }
    }
}

fn default_max_attempts() -> u32 {
    12
}
fn default_backoff_base() -> u64 {
    2
}
fn default_jitter_max_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_history_dir")]
    pub dir: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            dir: default_history_dir(),
        }
    }
}

fn default_history_dir() -> PathBuf {
    PathBuf::from("runs")
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeywordsConfig {
    #[serde(default)]
    pub engine: Option<String>,
}

impl Default for KeywordsConfig {
    fn default() -> Self {
        Self { engine: None }
    }
}

impl Config {
    pub fn engine_names(&self) -> Vec<&str> {
        self.engines.iter().map(|e| e.name.as_str()).collect()
    }

    fn has_engine(&self, name: &str) -> bool {
        self.engines.iter().any(|e| e.name == name)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AskdbError::config(format!("failed to read config file {}: {e}", path.display()))
    })?;
    let config: Config = toml::from_str(&content)
        .map_err(|e| AskdbError::config(format!("failed to parse config file: {e}")))?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    match config.database.backend.as_str() {
        "sqlite" => {}
        "mysql" => {
            if config.database.url.is_none() {
                return Err(AskdbError::config(
                    "database.url is required for the mysql backend",
                ));
            }
        }
        other => {
            return Err(AskdbError::config(format!(
                "unknown database backend '{other}': must be sqlite or mysql"
            )));
        }
    }

    if config.index.signature_size == 0 {
        return Err(AskdbError::config("index.signature_size must be > 0"));
    }
    if config.index.ngram == 0 {
        return Err(AskdbError::config("index.ngram must be > 0"));
    }
    if !(0.0..=1.0).contains(&config.index.threshold) {
        return Err(AskdbError::config("index.threshold must be in [0.0, 1.0]"));
    }

    match config.embedding.provider.as_str() {
        "openai" => {
            if config.embedding.model.is_none() {
                return Err(AskdbError::config(
                    "embedding.model is required for the openai provider",
                ));
            }
        }
        "hash" => {}
        other => {
            return Err(AskdbError::config(format!(
                "unknown embedding provider '{other}': must be openai or hash"
            )));
        }
    }

    if config.engines.is_empty() {
        return Err(AskdbError::config("at least one [[engines]] entry is required"));
    }
    if config.generators.is_empty() {
        return Err(AskdbError::config(
            "at least one [[generators]] entry is required",
        ));
    }

    for gen in &config.generators {
        if gen.engines.is_empty() {
            return Err(AskdbError::config(format!(
                "generator '{}' lists no engines",
                gen.name
            )));
        }
        if gen.samples == 0 {
            return Err(AskdbError::config(format!(
                "generator '{}' has samples = 0",
                gen.name
            )));
        }
        for engine in &gen.engines {
            if !config.has_engine(engine) {
                return Err(AskdbError::config(format!(
                    "generator '{}' references unknown engine '{engine}'",
                    gen.name
                )));
            }
        }
        if let Some(fallback) = &gen.fallback_engine {
            if !config.has_engine(fallback) {
                return Err(AskdbError::config(format!(
                    "generator '{}' references unknown fallback engine '{fallback}'",
                    gen.name
                )));
            }
        }
        if !is_known_parser(&gen.parser) {
            return Err(AskdbError::config(format!(
                "generator '{}' references unknown parser '{}'",
                gen.name, gen.parser
            )));
        }
    }

    for opt in [&config.revision.engine, &config.keywords.engine] {
        if let Some(engine) = opt {
            if !config.has_engine(engine) {
                return Err(AskdbError::config(format!(
                    "unknown engine reference '{engine}'"
                )));
            }
        }
    }

    if config.retry.max_attempts == 0 {
        return Err(AskdbError::config("retry.max_attempts must be >= 1"));
    }
    if config.revision.batch_size == 0 {
        return Err(AskdbError::config("revision.batch_size must be >= 1"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> String {
        r#"
[database]
backend = "sqlite"
root = "data"

[[engines]]
name = "fast"
model = "gpt-4o-mini"

[[generators]]
name = "divide_and_conquer"
engines = ["fast"]
parser = "candidate_json"
samples = 2
"#
        .to_string()
    }

    #[test]
    fn test_minimal_config_valid_with_defaults() {
        let config: Config = toml::from_str(&minimal_toml()).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.index.signature_size, 100);
        assert_eq!(config.index.ngram, 3);
        assert!((config.index.threshold - 0.01).abs() < 1e-12);
        assert_eq!(config.retry.max_attempts, 12);
        assert_eq!(config.executor.timeout_secs, 60);
        assert_eq!(config.revision.batch_size, 5);
        assert_eq!(config.database.pool_min, 2);
        assert_eq!(config.database.pool_max, 10);
    }

    #[test]
    fn test_unknown_engine_reference_is_fatal() {
        let toml_str = minimal_toml().replace("engines = [\"fast\"]", "engines = [\"missing\"]");
        let config: Config = toml::from_str(&toml_str).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("unknown engine"));
    }

    #[test]
    fn test_unknown_parser_is_fatal() {
        let toml_str = minimal_toml().replace("candidate_json", "nonexistent_parser");
        let config: Config = toml::from_str(&toml_str).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("unknown parser"));
    }

    #[test]
    fn test_mysql_requires_url() {
        let toml_str = minimal_toml().replace("backend = \"sqlite\"", "backend = \"mysql\"");
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&config).is_err());
    }
}
