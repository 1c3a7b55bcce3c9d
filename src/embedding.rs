//! Embedding service client.
//!
//! Defines the [`Embedder`] trait and the [`AzureEmbeddingClient`] that calls
//! an Azure OpenAI deployment's embeddings endpoint:
//!
//! ```text
//! POST <EmbeddingEndpoint>
//! api-key: <AzureOpenAI.ApiKey>
//! {"input": "<text>"}
//!
//! 200 {"data": [{"embedding": [0.1, ...]}], ...}
//! ```
//!
//! One text per request. There is no retry: a failed call surfaces to the
//! caller, which decides whether the failure is fatal.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::{required, AppSettings};

/// Anything that turns a text into an embedding vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

pub struct AzureEmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl AzureEmbeddingClient {
    /// Build a client from `AzureOpenAI.ApiKey` and `AzureOpenAI.EmbeddingEndpoint`.
    pub fn from_settings(settings: &AppSettings, timeout_secs: Option<u64>) -> Result<Self> {
        let azure = &settings.azure_openai;
        let api_key = required(&azure.api_key, "AzureOpenAI.ApiKey")?.to_string();
        let endpoint =
            required(&azure.embedding_endpoint, "AzureOpenAI.EmbeddingEndpoint")?.to_string();
        Self::new(endpoint, api_key, timeout_secs)
    }

    pub fn new(endpoint: String, api_key: String, timeout_secs: Option<u64>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build().context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl Embedder for AzureEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({ "input": text });

        let response = self
            .client
            .post(&self.endpoint)
            .header("api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Embedding request to {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Embedding API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse embedding response")?;
        parse_embedding_response(&json)
    }
}

/// Extract `data[0].embedding` from an embeddings API response.
pub fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid embedding response: missing data[0].embedding"))?;

    let vec = embedding
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow!("Invalid embedding response: non-numeric value"))
        })
        .collect::<Result<Vec<f32>>>()?;

    if vec.is_empty() {
        bail!("Invalid embedding response: empty embedding");
    }
    Ok(vec)
}
