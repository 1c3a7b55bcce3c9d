use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

// ============ appsettings.json ============

/// Credentials and endpoints shared by every network-calling command.
///
/// Mirrors the layout of `appsettings.json`; sections and keys the
/// pipeline does not use are ignored.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppSettings {
    #[serde(rename = "ElasticSearch", default)]
    pub elastic_search: ElasticSearchSettings,
    #[serde(rename = "AzureOpenAI", default)]
    pub azure_openai: AzureOpenAiSettings,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ElasticSearchSettings {
    pub regenerate_api_key_endpoint: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub cloud_id: Option<String>,
    pub api_key: Option<String>,
    /// Explicit cluster URL; takes precedence over `CloudId` when set.
    #[serde(rename = "CloudEndPoint")]
    pub cloud_endpoint: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "PascalCase")]
pub struct AzureOpenAiSettings {
    pub api_key: Option<String>,
    pub embedding_endpoint: Option<String>,
    pub completion_endpoint: Option<String>,
}

/// Return a required settings value or fail naming the dotted key.
pub fn required<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => bail!("missing {} in appsettings.json", key),
    }
}

pub fn load_settings(path: &Path) -> Result<AppSettings> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

    let settings: AppSettings = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;

    Ok(settings)
}

// ============ repoa.toml ============

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub keygen: KeygenConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_corpus_output")]
    pub output: PathBuf,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_explain_prompt")]
    pub explain_prompt: String,
    /// `{file}` is replaced with the file name.
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default = "default_example_prompt")]
    pub example_prompt: String,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            output: default_corpus_output(),
            extensions: default_extensions(),
            explain_prompt: default_explain_prompt(),
            description: default_description(),
            example_prompt: default_example_prompt(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_corpus_output() -> PathBuf {
    PathBuf::from("project_dataset.txt")
}
fn default_extensions() -> Vec<String> {
    vec![
        ".cs".to_string(),
        ".cshtml".to_string(),
        ".xaml".to_string(),
        ".config".to_string(),
    ]
}
fn default_explain_prompt() -> String {
    "Explain this module.".to_string()
}
fn default_description() -> String {
    "The file {file} contains code that handles part of the project.".to_string()
}
fn default_example_prompt() -> String {
    "Show me a code example.".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingsConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_embeddings_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_skip_dirs")]
    pub skip_dirs: Vec<String>,
    #[serde(default = "default_skip_files")]
    pub skip_files: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            output_dir: default_embeddings_dir(),
            skip_dirs: default_skip_dirs(),
            skip_files: default_skip_files(),
            exclude_globs: Vec::new(),
            timeout_secs: None,
        }
    }
}

fn default_embeddings_dir() -> PathBuf {
    PathBuf::from("embeddings")
}
fn default_skip_dirs() -> Vec<String> {
    ["bin", "obj", "embeddings", "wwwroot", ".git"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_skip_files() -> Vec<String> {
    vec!["appsettings.json".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_name")]
    pub name: String,
    /// When set, a newly created index maps `embedding` as a `dense_vector`.
    #[serde(default)]
    pub embedding_dims: Option<usize>,
    #[serde(default = "default_search_size")]
    pub search_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            name: default_index_name(),
            embedding_dims: None,
            search_size: default_search_size(),
        }
    }
}

fn default_index_name() -> String {
    "codebase_index_v2".to_string()
}
fn default_search_size() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeygenConfig {
    #[serde(default = "default_key_name")]
    pub name: String,
    #[serde(default = "default_key_expiration")]
    pub expiration: String,
}

impl Default for KeygenConfig {
    fn default() -> Self {
        Self {
            name: default_key_name(),
            expiration: default_key_expiration(),
        }
    }
}

fn default_key_name() -> String {
    "my_api_key".to_string()
}
fn default_key_expiration() -> String {
    "30d".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_model_repo")]
    pub repo: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default = "default_model_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_hub_url")]
    pub hub_url: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            repo: default_model_repo(),
            revision: default_revision(),
            download_dir: default_model_dir(),
            hub_url: default_hub_url(),
        }
    }
}

fn default_model_repo() -> String {
    "meta-llama/Llama-3.2-3B-Instruct".to_string()
}
fn default_revision() -> String {
    "main".to_string()
}
fn default_model_dir() -> PathBuf {
    PathBuf::from("downloaded_model")
}
fn default_hub_url() -> String {
    "https://huggingface.co".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrainingConfig {
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    #[serde(default = "default_corpus_output")]
    pub corpus: PathBuf,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_finetuned_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_train_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_save_steps")]
    pub save_steps: usize,
    #[serde(default = "default_save_total_limit")]
    pub save_total_limit: usize,
    /// External training runtime; the job manifest path is appended.
    #[serde(default = "default_training_command")]
    pub command: Vec<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            corpus: default_corpus_output(),
            checkpoint_dir: default_checkpoint_dir(),
            output_dir: default_finetuned_dir(),
            block_size: default_block_size(),
            epochs: default_epochs(),
            batch_size: default_train_batch_size(),
            save_steps: default_save_steps(),
            save_total_limit: default_save_total_limit(),
            command: default_training_command(),
        }
    }
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("results")
}
fn default_finetuned_dir() -> PathBuf {
    PathBuf::from("fine_tuned_code_model")
}
fn default_block_size() -> usize {
    1024
}
fn default_epochs() -> usize {
    3
}
fn default_train_batch_size() -> usize {
    2
}
fn default_save_steps() -> usize {
    500
}
fn default_save_total_limit() -> usize {
    2
}
fn default_training_command() -> Vec<String> {
    vec![
        "python3".to_string(),
        "scripts/train_causal_lm.py".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResponderConfig {
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    #[serde(default = "default_completions_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_exit_keywords")]
    pub exit_keywords: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            endpoint: default_completions_endpoint(),
            model: None,
            max_length: default_max_length(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            exit_keywords: default_exit_keywords(),
            timeout_secs: None,
        }
    }
}

fn default_completions_endpoint() -> String {
    "http://127.0.0.1:8000/v1/completions".to_string()
}
fn default_max_length() -> usize {
    100
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_k() -> usize {
    50
}
fn default_top_p() -> f32 {
    0.95
}
fn default_exit_keywords() -> Vec<String> {
    vec!["exit".to_string(), "quit".to_string(), "esci".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_chat_max_tokens")]
    pub max_tokens: usize,
    /// Non-system messages kept between turns.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: default_chat_model(),
            max_tokens: default_chat_max_tokens(),
            history_limit: default_history_limit(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_chat_model() -> String {
    "gpt-35-turbo".to_string()
}
fn default_chat_max_tokens() -> usize {
    500
}
fn default_history_limit() -> usize {
    7
}
fn default_system_prompt() -> String {
    "You are an assistant for a software development team. Answer technical and \
     project questions precisely and concisely, using the project excerpts supplied \
     in system messages. If a question is not covered by them, ask for details such \
     as a file or class name."
        .to_string()
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.corpus.extensions.is_empty() {
            bail!("corpus.extensions must not be empty");
        }

        let t = &self.training;
        if t.block_size == 0 {
            bail!("training.block_size must be > 0");
        }
        if t.epochs == 0 {
            bail!("training.epochs must be > 0");
        }
        if t.batch_size == 0 {
            bail!("training.batch_size must be > 0");
        }
        if t.save_steps == 0 {
            bail!("training.save_steps must be > 0");
        }
        if t.command.is_empty() {
            bail!("training.command must name a program");
        }

        let r = &self.responder;
        if r.max_length == 0 {
            bail!("responder.max_length must be > 0");
        }
        if !(r.temperature > 0.0 && r.temperature <= 2.0) {
            bail!("responder.temperature must be in (0.0, 2.0]");
        }
        if !(r.top_p > 0.0 && r.top_p <= 1.0) {
            bail!("responder.top_p must be in (0.0, 1.0]");
        }
        if r.exit_keywords.is_empty() {
            bail!("responder.exit_keywords must not be empty");
        }

        if self.chat.history_limit == 0 {
            bail!("chat.history_limit must be >= 1");
        }

        Ok(())
    }
}

pub fn load_pipeline_config(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: PipelineConfig =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.validate()?;
    Ok(config)
}

/// Resolve the pipeline config: an explicit path must exist, otherwise
/// `./repoa.toml` is used when present and built-in defaults when not.
pub fn resolve_pipeline_config(explicit: Option<&Path>) -> Result<PipelineConfig> {
    match explicit {
        Some(path) => load_pipeline_config(path),
        None => {
            let fallback = Path::new("repoa.toml");
            if fallback.exists() {
                load_pipeline_config(fallback)
            } else {
                Ok(PipelineConfig::default())
            }
        }
    }
}
