//! LLM engine registry.
//!
//! Engines are named in config and resolved through [`EngineRegistry`];
//! an unknown name is a construction-time error, never a silent default.
//! Every engine supports both single-shot and chat-style invocation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::{AskdbError, Result};
use crate::models::ConversationTurn;

#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    /// Single-shot completion of one prompt.
    async fn invoke(&self, prompt: &str) -> Result<String> {
        self.chat(&[ConversationTurn {
            role: "user".to_string(),
            content: prompt.to_string(),
        }])
        .await
    }

    /// Chat-style completion over prior turns plus the final request.
    async fn chat(&self, messages: &[ConversationTurn]) -> Result<String>;
}

/// Named registry of constructed engines.
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn Engine>>,
}

impl EngineRegistry {
    pub fn from_config(configs: &[EngineConfig]) -> Result<Self> {
        let mut engines: HashMap<String, Arc<dyn Engine>> = HashMap::new();
        for cfg in configs {
            if engines.contains_key(&cfg.name) {
                return Err(AskdbError::config(format!(
                    "duplicate engine name '{}'",
                    cfg.name
                )));
            }
            engines.insert(cfg.name.clone(), Arc::new(ChatEngine::new(cfg)?));
        }
        Ok(Self { engines })
    }

    pub fn empty() -> Self {
        Self {
            engines: HashMap::new(),
        }
    }

    /// Register an engine directly. Tests use this to install mocks
    /// behind the same lookup path production code uses.
    pub fn insert(&mut self, engine: Arc<dyn Engine>) {
        self.engines.insert(engine.name().to_string(), engine);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Engine>> {
        self.engines.get(name).cloned().ok_or_else(|| {
            AskdbError::config(format!("unknown engine '{name}'"))
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.engines.keys().cloned().collect()
    }
}

/// Engine speaking the OpenAI-compatible chat-completions protocol.
pub struct ChatEngine {
    name: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    stop: Vec<String>,
    base_url: String,
    api_key_env: String,
    client: reqwest::Client,
}

impl ChatEngine {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AskdbError::Engine {
                engine: config.name.clone(),
                message: format!("http client build failed: {e}"),
            })?;
        Ok(Self {
            name: config.name.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            stop: config.stop.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key_env: config.api_key_env.clone(),
            client,
        })
    }

    fn err(&self, message: impl Into<String>) -> AskdbError {
        AskdbError::Engine {
            engine: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Engine for ChatEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, messages: &[ConversationTurn]) -> Result<String> {
        // Key is resolved per call so a registry can be built in
        // environments that never invoke this engine.
        let api_key = std::env::var(&self.api_key_env)
            .map_err(|_| self.err(format!("environment variable {} not set", self.api_key_env)))?;

        let rendered: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": rendered,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        if !self.stop.is_empty() {
            body["stop"] = serde_json::json!(self.stop);
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.err(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.err(format!("API error {status}: {text}")));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| self.err(format!("invalid response body: {e}")))?;

        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| self.err("response missing choices[0].message.content"))?;

        Ok(content.to_string())
    }
}
