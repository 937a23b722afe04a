//! Embedding providers and vector utilities.
//!
//! Two providers sit behind the [`Embedder`] trait:
//! - **openai** — any OpenAI-compatible `/embeddings` endpoint, with
//!   batching and exponential-backoff retry for 429/5xx.
//! - **hash** — deterministic local vectors from token hashing; no
//!   network, used offline and in tests.
//!
//! Vectors persist as little-endian f32 blobs; [`vec_to_blob`] /
//! [`blob_to_vec`] are the codecs and [`cosine_similarity`] the
//! comparison used by the fallback scan path.

use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::{AskdbError, Result};
use crate::minhash::fnv1a64;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;

    /// Embed a batch of documents, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query text.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        if vectors.is_empty() {
            return Err(AskdbError::Embedding("empty embedding response".into()));
        }
        Ok(vectors.remove(0))
    }
}

/// Construct the provider named by the configuration.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiEmbedder::new(config)?)),
        "hash" => Ok(Box::new(HashEmbedder::new(config.dims))),
        other => Err(AskdbError::config(format!(
            "unknown embedding provider: '{other}'"
        ))),
    }
}

// ============ OpenAI-compatible provider ============

pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    base_url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| AskdbError::config("embedding.model required for openai provider"))?;
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            AskdbError::config(format!(
                "environment variable {} not set",
                config.api_key_env
            ))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AskdbError::Embedding(format!("http client build failed: {e}")))?;
        Ok(Self {
            model,
            dims: config.dims,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }

    /// One batch against the `/embeddings` endpoint.
    ///
    /// 429 and 5xx retry with exponential backoff (1s, 2s, 4s, ...,
    /// capped at 32s); other 4xx fail immediately.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            AskdbError::Embedding(format!("invalid response body: {e}"))
                        })?;
                        return parse_embedding_response(&json);
                    }
                    let text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(%status, "embedding request failed, will retry");
                        last_err = Some(AskdbError::Embedding(format!(
                            "embedding API error {status}: {text}"
                        )));
                        continue;
                    }
                    return Err(AskdbError::Embedding(format!(
                        "embedding API error {status}: {text}"
                    )));
                }
                Err(e) => {
                    last_err = Some(AskdbError::Embedding(format!("network error: {e}")));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| AskdbError::Embedding("embedding failed after retries".into())))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_batch(texts).await
    }
}

fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| AskdbError::Embedding("response missing data array".into()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| AskdbError::Embedding("response item missing embedding".into()))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

// ============ Deterministic hash provider ============

/// Token-hashing embedder: each word and character trigram increments a
/// hashed bucket, then the vector is L2-normalized. Identical text
/// always embeds identically, and sharing tokens raises cosine
/// similarity, which is enough for offline runs and tests.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        let lowered = text.to_lowercase();

        for token in lowered.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let bucket = (fnv1a64(token.as_bytes()) % self.dims as u64) as usize;
            vec[bucket] += 1.0;

            let chars: Vec<char> = token.chars().collect();
            for w in chars.windows(3) {
                let tri: String = w.iter().collect();
                let bucket = (fnv1a64(tri.as_bytes()) % self.dims as u64) as usize;
                vec[bucket] += 0.5;
            }
        }

        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; 0.0 for empty or mismatched lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_hash_embedder_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed_query("employee department name").await.unwrap();
        let b = embedder.embed_query("employee department name").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_hash_embedder_related_text_scores_higher() {
        let embedder = HashEmbedder::new(128);
        let base = embedder.embed_query("department of the employee").await.unwrap();
        let related = embedder.embed_query("employee department").await.unwrap();
        let unrelated = embedder.embed_query("quarterly fiscal projection").await.unwrap();
        assert!(cosine_similarity(&base, &related) > cosine_similarity(&base, &unrelated));
    }
}
