use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AgentConfig;
use crate::store::ConversationStore;

/// Embedding provider seam. Maps text to a fixed-length vector or fails;
/// callers degrade to recency retrieval when it does.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn is_available(&self) -> bool;
    fn model_name(&self) -> &str;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI-compatible embeddings client.
#[derive(Clone)]
pub struct EmbeddingsClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl EmbeddingsClient {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.embedding_timeout_secs))
            .build()
            .context("Failed to build embeddings HTTP client")?;
        Ok(Self {
            api_url: config.embedding_api_url.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone().unwrap_or_default(),
            model: config.embedding_model.clone(),
            client,
        })
    }
}

#[async_trait]
impl Embedder for EmbeddingsClient {
    fn is_available(&self) -> bool {
        // A key-less local endpoint is still usable.
        !self.api_key.is_empty() || !self.api_url.contains("api.openai.com")
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            anyhow::bail!("Refusing to embed empty text");
        }

        let url = format!("{}/embeddings", self.api_url);
        let request = EmbeddingRequest {
            model: &self.model,
            input: vec![trimmed],
        };

        let mut req = self.client.post(&url).json(&request);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req
            .send()
            .await
            .context("Failed to send embeddings request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Embeddings API returned error {}: {}", status, body);
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embeddings response")?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Embeddings response contained no vector"))
    }
}

/// Write an embedding back to a stored message as a detached background
/// task. Failure is isolated here: it is logged and never reaches the
/// request/response path.
pub fn spawn_embedding_writeback(
    store: Arc<ConversationStore>,
    embedder: Arc<dyn Embedder>,
    message_id: i64,
    text: String,
    version: String,
) {
    if !embedder.is_available() || text.trim().is_empty() {
        return;
    }

    tokio::spawn(async move {
        match embedder.embed(&text).await {
            Ok(vector) => {
                if let Err(e) = store.update_message_embedding(
                    message_id,
                    &vector,
                    embedder.model_name(),
                    &version,
                ) {
                    tracing::warn!("Embedding write-back failed for message {}: {:#}", message_id, e);
                }
            }
            Err(e) => {
                tracing::warn!("Embedding generation failed for message {}: {:#}", message_id, e);
            }
        }
    });
}
