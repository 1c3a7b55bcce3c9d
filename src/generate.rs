//! Sampled text generation against an OpenAI-compatible completions server.
//!
//! The fine-tuned weights are served by an external runtime (vLLM,
//! llama.cpp `server`, text-generation-inference, ...) exposing
//! `POST /v1/completions`. Requests ask for one sampled choice with the
//! prompt echoed back, matching what a local `generate()` + `decode()`
//! would return.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::config::ResponderConfig;

/// Fixed decoding parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodingParams {
    /// Upper bound on prompt + generated tokens.
    pub max_length: usize,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
}

impl DecodingParams {
    pub fn from_config(config: &ResponderConfig) -> Self {
        Self {
            max_length: config.max_length,
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
        }
    }

    /// Tokens left for generation once the prompt is counted; never below 1.
    pub fn max_new_tokens(&self, prompt_tokens: usize) -> usize {
        self.max_length.saturating_sub(prompt_tokens).max(1)
    }
}

/// Produces the decoded output of one sampled generation, prompt included.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, max_new_tokens: usize, params: &DecodingParams)
        -> Result<String>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    prompt: &'a str,
    max_tokens: usize,
    temperature: f32,
    top_p: f32,
    top_k: usize,
    n: usize,
    echo: bool,
}

pub struct CompletionClient {
    client: reqwest::Client,
    endpoint: String,
    model: Option<String>,
}

impl CompletionClient {
    pub fn new(endpoint: String, model: Option<String>, timeout_secs: Option<u64>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build().context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            model,
        })
    }

    pub fn from_config(config: &ResponderConfig) -> Result<Self> {
        Self::new(
            config.endpoint.clone(),
            config.model.clone(),
            config.timeout_secs,
        )
    }
}

#[async_trait]
impl TextGenerator for CompletionClient {
    async fn generate(
        &self,
        prompt: &str,
        max_new_tokens: usize,
        params: &DecodingParams,
    ) -> Result<String> {
        let body = CompletionRequest {
            model: self.model.as_deref(),
            prompt,
            max_tokens: max_new_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            n: 1,
            echo: true,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Completion request to {} failed", self.endpoint))?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("Completion API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = resp.json().await?;
        json["choices"]
            .get(0)
            .and_then(|c| c["text"].as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid completion response: missing choices[0].text"))
    }
}

/// Remove the echoed prompt from a decoded generation.
///
/// The output normally starts with the prompt verbatim; when the runtime
/// re-normalizes whitespace it may not, and the first `prompt.len()` bytes
/// are dropped instead (on a char boundary).
pub fn strip_prompt(output: &str, prompt: &str) -> String {
    let rest = match output.strip_prefix(prompt) {
        Some(rest) => rest,
        None => {
            let mut cut = prompt.len().min(output.len());
            while !output.is_char_boundary(cut) {
                cut += 1;
            }
            &output[cut..]
        }
    };
    rest.trim().to_string()
}
