//! Retrieval-augmented chat over the indexed project.
//!
//! Every turn embeds the question, pulls the closest documents from the
//! index, and sends them as `Project context:` system messages together
//! with a bounded conversation history to an Azure OpenAI chat deployment.
//!
//! ```text
//! POST <CompletionEndpoint>
//! api-key: <AzureOpenAI.ApiKey>
//! {"model": "...", "messages": [...], "max_tokens": 500}
//!
//! 200 {"choices": [{"message": {"role": "assistant", "content": "..."}}]}
//! ```

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};

use crate::config::{required, AppSettings, ChatConfig};
use crate::elastic::ElasticClient;
use crate::embedding::Embedder;
use crate::responder::is_exit;
use crate::search::semantic_search;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Flatten a message body for the wire: newlines, tabs and backslashes
/// become spaces, double quotes become single quotes.
pub fn clean_content(content: &str) -> String {
    content
        .chars()
        .map(|c| match c {
            '\n' | '\r' | '\t' | '\\' => ' ',
            '"' => '\'',
            other => other,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Fetches context snippets relevant to a question.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<Vec<String>>;
}

/// Semantic search against the configured index.
pub struct IndexRetriever<'a> {
    pub client: &'a ElasticClient,
    pub embedder: &'a dyn Embedder,
    pub index: String,
    pub size: usize,
}

#[async_trait]
impl ContextRetriever for IndexRetriever<'_> {
    async fn retrieve(&self, query: &str) -> Result<Vec<String>> {
        let hits = semantic_search(self.client, self.embedder, &self.index, query, self.size).await?;
        Ok(hits.into_iter().map(|h| h.content).collect())
    }
}

/// Answers a full message list.
#[async_trait]
pub trait ChatCompleter: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: usize,
}

pub struct AzureChatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: usize,
}

impl AzureChatClient {
    /// Build a client from `AzureOpenAI.ApiKey` and `AzureOpenAI.CompletionEndpoint`.
    pub fn from_settings(settings: &AppSettings, config: &ChatConfig) -> Result<Self> {
        let azure = &settings.azure_openai;
        let api_key = required(&azure.api_key, "AzureOpenAI.ApiKey")?.to_string();
        let endpoint =
            required(&azure.completion_endpoint, "AzureOpenAI.CompletionEndpoint")?.to_string();
        Self::new(endpoint, api_key, config)
    }

    pub fn new(endpoint: String, api_key: String, config: &ChatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl ChatCompleter for AzureChatClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.clone(),
                    content: clean_content(&m.content),
                })
                .collect(),
            max_tokens: self.max_tokens,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Chat request to {} failed", self.endpoint))?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("Chat API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = resp.json().await?;
        json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid chat response: missing choices[0].message.content"))
    }
}

/// Conversation state: a pinned system prompt plus a sliding window of
/// the most recent messages.
pub struct ChatSession {
    system_prompt: ChatMessage,
    history: Vec<ChatMessage>,
    history_limit: usize,
}

impl ChatSession {
    pub fn new(config: &ChatConfig) -> Self {
        Self {
            system_prompt: ChatMessage::system(config.system_prompt.clone()),
            history: Vec::new(),
            history_limit: config.history_limit,
        }
    }

    /// Messages as sent to the model, system prompt first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        std::iter::once(self.system_prompt.clone())
            .chain(self.history.iter().cloned())
            .collect()
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Keep the newest `history_limit` messages, never fewer than `keep`.
    fn trim(&mut self, keep: usize) {
        let limit = self.history_limit.max(keep);
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }

    /// Run one turn. Retrieval failures are logged and the turn continues
    /// without context; a completion failure leaves the question in history
    /// and is returned to the caller.
    pub async fn ask(
        &mut self,
        question: &str,
        retriever: &dyn ContextRetriever,
        completer: &dyn ChatCompleter,
    ) -> Result<String> {
        self.history.push(ChatMessage::user(question));
        let mut turn = 1;

        match retriever.retrieve(question).await {
            Ok(snippets) => {
                tracing::debug!(count = snippets.len(), "retrieved context");
                for snippet in snippets {
                    self.history
                        .push(ChatMessage::system(format!("Project context: {}", snippet)));
                    turn += 1;
                }
            }
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "context search failed");
            }
        }

        self.trim(turn);
        let answer = completer.complete(&self.messages()).await?;
        self.history.push(ChatMessage::assistant(answer.clone()));
        Ok(answer)
    }
}

/// Interactive chat loop; ends on EOF or an exit keyword.
pub async fn run_chat<R: BufRead, W: Write>(
    session: &mut ChatSession,
    retriever: &dyn ContextRetriever,
    completer: &dyn ChatCompleter,
    exit_keywords: &[String],
    show_prompt: bool,
    mut input: R,
    mut output: W,
) -> Result<usize> {
    let mut turns = 0;
    let mut line = String::new();

    loop {
        if show_prompt {
            write!(output, "You: ")?;
            output.flush()?;
        }

        line.clear();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        let text = line.trim();
        if is_exit(text, exit_keywords) {
            break;
        }
        if text.is_empty() {
            continue;
        }

        match session.ask(text, retriever, completer).await {
            Ok(answer) => {
                writeln!(output, "Assistant: {}", answer)?;
                turns += 1;
            }
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "chat completion failed");
                writeln!(output, "Error: {:#}", e)?;
            }
        }
    }

    Ok(turns)
}
