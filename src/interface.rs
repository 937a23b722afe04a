//! Caller-facing harness.
//!
//! [`Harness`] owns the factory-constructed backend handle, the engine
//! registry, and both retrieval indices, and threads them into a fresh
//! pipeline per question. Construction is where configuration errors
//! surface; nothing here is a process-wide singleton.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{create_backend, DatabaseBackend};
use crate::catalog::{profiles_from_details, CatalogIndex};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::engine::{Engine, EngineRegistry};
use crate::error::{AskdbError, Result};
use crate::executor::{AssessStage, ExecuteStage};
use crate::generate::GenerateStage;
use crate::history::RunHistory;
use crate::keywords::KeywordStage;
use crate::models::{AskResponse, ConversationTurn, Task};
use crate::pipeline::{Pipeline, RespondStage, SchemaStage};
use crate::retry::RetryPolicy;
use crate::revise::ReviseStage;
use crate::stage::{PipelineState, Stage};
use crate::values::{BuildReport, ValueIndex};

pub struct Harness {
    config: Config,
    backend: Arc<dyn DatabaseBackend>,
    registry: Arc<EngineRegistry>,
    value_index: Arc<ValueIndex>,
    catalog: Arc<CatalogIndex>,
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness").finish_non_exhaustive()
    }
}

impl Harness {
    /// Build a harness for one database id from configuration alone.
    pub fn new(config: Config, db_id: &str) -> Result<Self> {
        crate::config::validate(&config)?;
        let backend = create_backend(&config.database, db_id)?;
        let registry = Arc::new(EngineRegistry::from_config(&config.engines)?);
        let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(&config.embedding)?);
        Ok(Self::assemble(config, backend, registry, embedder))
    }

    /// Wire a harness from pre-built components. Tests inject mock
    /// engines and temp-file backends through this.
    pub fn with_components(
        config: Config,
        backend: Arc<dyn DatabaseBackend>,
        registry: Arc<EngineRegistry>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self::assemble(config, backend, registry, embedder)
    }

    fn assemble(
        config: Config,
        backend: Arc<dyn DatabaseBackend>,
        registry: Arc<EngineRegistry>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let value_index = Arc::new(ValueIndex::new(backend.clone(), &config.index));
        let catalog = Arc::new(CatalogIndex::new(
            backend.clone(),
            embedder,
            config.embedding.batch_size,
        ));
        Self {
            config,
            backend,
            registry,
            value_index,
            catalog,
        }
    }

    pub fn backend(&self) -> Arc<dyn DatabaseBackend> {
        self.backend.clone()
    }

    pub fn value_index(&self) -> Arc<ValueIndex> {
        self.value_index.clone()
    }

    pub fn catalog(&self) -> Arc<CatalogIndex> {
        self.catalog.clone()
    }

    /// Build both retrieval indices from the live schema.
    pub async fn build_indexes(&self) -> Result<(BuildReport, usize)> {
        let details = self.backend.column_details().await?;
        let profiles = profiles_from_details(&details);
        let value_report = self.value_index.build_from_catalog(&profiles).await?;
        let vectors = self.catalog.build_from_catalog(&profiles).await?;
        Ok((value_report, vectors))
    }

    pub async fn clear_indexes(&self) -> Result<()> {
        self.value_index.clear().await?;
        self.catalog.clear().await?;
        Ok(())
    }

    fn engine_or_default(&self, name: &Option<String>) -> Result<Arc<dyn Engine>> {
        match name {
            Some(name) => self.registry.get(name),
            None => {
                let generator = self
                    .config
                    .generators
                    .first()
                    .ok_or_else(|| AskdbError::config("no generators configured"))?;
                let engine = generator.engines.first().ok_or_else(|| {
                    AskdbError::config(format!("generator '{}' lists no engines", generator.name))
                })?;
                self.registry.get(engine)
            }
        }
    }

    /// Answer one question. Each call builds a fresh pipeline state and
    /// history; nothing is shared between concurrent runs except the
    /// backend handle, which serializes internally.
    pub async fn ask(
        &self,
        question: &str,
        hint: &str,
        db_id: &str,
        conversation: Vec<ConversationTurn>,
    ) -> Result<AskResponse> {
        let task = Task::new(db_id, question, hint);
        let history = RunHistory::with_sink(task.question_id.clone(), &self.config.history.dir)?;
        let mut state = PipelineState::new(task, history);
        state.conversation = conversation;

        let policy = RetryPolicy::from(&self.config.retry);
        let timeout = Duration::from_secs(self.config.executor.timeout_secs);

        let keyword_engine = self.engine_or_default(&self.config.keywords.engine)?;
        let revision_engine = self.engine_or_default(&self.config.revision.engine)?;
        let respond_engine = self.engine_or_default(&None)?;

        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(KeywordStage::new(
                keyword_engine,
                self.value_index.clone(),
                self.catalog.clone(),
                self.config.index.top_n,
            )),
            Box::new(SchemaStage::new(self.backend.clone())),
            Box::new(GenerateStage::new(
                self.registry.clone(),
                self.config.generators.clone(),
                policy.clone(),
            )),
            Box::new(AssessStage::new(self.backend.clone(), timeout)),
            Box::new(ReviseStage::new(
                revision_engine,
                policy,
                self.config.revision.batch_size,
                self.config.revision.pool_cap,
            )),
            Box::new(AssessStage::new(self.backend.clone(), timeout)),
            Box::new(ExecuteStage::new(self.backend.clone(), timeout)),
            Box::new(RespondStage::new(respond_engine)),
        ];

        Ok(Pipeline::new(stages).run(state).await)
    }
}
