//! Pretrained model download from the Hugging Face hub.
//!
//! Files are fetched from `{hub_url}/{repo}/resolve/{revision}/{file}` and
//! streamed to disk through a `.part` file that is renamed on completion.
//! Files already present in the destination are not fetched again, so an
//! interrupted download can simply be re-run. Gated repositories need a
//! token in `HF_TOKEN`.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::config::ModelConfig;

const REQUIRED_FILES: &[&str] = &["config.json", "tokenizer.json"];
const OPTIONAL_FILES: &[&str] = &[
    "tokenizer_config.json",
    "special_tokens_map.json",
    "generation_config.json",
];
const WEIGHTS_INDEX: &str = "model.safetensors.index.json";
const SINGLE_WEIGHTS: &str = "model.safetensors";

#[derive(Debug, Default)]
pub struct DownloadReport {
    pub fetched: Vec<PathBuf>,
    pub cached: Vec<PathBuf>,
    pub missing_optional: Vec<String>,
}

enum Fetch {
    Fetched(PathBuf),
    Cached(PathBuf),
    NotFound,
}

pub struct HubClient {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl HubClient {
    pub fn new(config: &ModelConfig, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        let base = format!(
            "{}/{}/resolve/{}",
            config.hub_url.trim_end_matches('/'),
            config.repo,
            config.revision
        );
        Ok(Self {
            client,
            base,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub fn from_env(config: &ModelConfig) -> Result<Self> {
        Self::new(config, std::env::var("HF_TOKEN").ok())
    }

    fn file_url(&self, file: &str) -> String {
        format!("{}/{}", self.base, file)
    }

    async fn fetch(&self, file: &str, dest_dir: &Path) -> Result<Fetch> {
        let dest = dest_dir.join(file);
        if dest.exists() {
            return Ok(Fetch::Cached(dest));
        }

        let url = self.file_url(file);
        let mut req = self.client.get(&url);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        let mut resp = req
            .send()
            .await
            .with_context(|| format!("Download {} failed", url))?;

        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(Fetch::NotFound);
        }
        if !status.is_success() {
            bail!("Download {}: HTTP {}", url, status);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = dest.with_extension(format!(
            "{}.part",
            dest.extension().and_then(|e| e.to_str()).unwrap_or("")
        ));
        let mut out = tokio::fs::File::create(&part)
            .await
            .with_context(|| format!("Failed to create {}", part.display()))?;

        let mut bytes = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            out.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        out.flush().await?;
        drop(out);

        tokio::fs::rename(&part, &dest).await?;
        tracing::info!(file, bytes, "downloaded");
        Ok(Fetch::Fetched(dest))
    }
}

/// Download the tokenizer, config, and safetensors weights of `config.repo`.
pub async fn download_model(hub: &HubClient, dest_dir: &Path) -> Result<DownloadReport> {
    tokio::fs::create_dir_all(dest_dir)
        .await
        .with_context(|| format!("Failed to create {}", dest_dir.display()))?;

    let mut report = DownloadReport::default();

    for file in REQUIRED_FILES {
        match hub.fetch(file, dest_dir).await? {
            Fetch::NotFound => bail!("Required file '{}' not found in repository", file),
            other => record(&mut report, other),
        }
    }

    for file in OPTIONAL_FILES {
        match hub.fetch(file, dest_dir).await? {
            Fetch::NotFound => report.missing_optional.push(file.to_string()),
            other => record(&mut report, other),
        }
    }

    let index_path = match hub.fetch(WEIGHTS_INDEX, dest_dir).await? {
        Fetch::NotFound => None,
        Fetch::Fetched(p) => {
            report.fetched.push(p.clone());
            Some(p)
        }
        Fetch::Cached(p) => {
            report.cached.push(p.clone());
            Some(p)
        }
    };

    match index_path {
        Some(path) => {
            for shard in shard_files(&path)? {
                match hub.fetch(&shard, dest_dir).await? {
                    Fetch::NotFound => bail!("Weight shard '{}' listed in index but missing", shard),
                    other => record(&mut report, other),
                }
            }
        }
        None => match hub.fetch(SINGLE_WEIGHTS, dest_dir).await? {
            Fetch::NotFound => bail!("No safetensors weights found in repository"),
            other => record(&mut report, other),
        },
    }

    Ok(report)
}

fn record(report: &mut DownloadReport, fetch: Fetch) {
    match fetch {
        Fetch::Fetched(p) => report.fetched.push(p),
        Fetch::Cached(p) => report.cached.push(p),
        Fetch::NotFound => {}
    }
}

/// Unique shard file names referenced by a safetensors index's `weight_map`.
pub fn shard_files(index_path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(index_path)
        .with_context(|| format!("Failed to read {}", index_path.display()))?;
    let json: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", index_path.display()))?;
    parse_weight_map(&json)
}

fn parse_weight_map(json: &Value) -> Result<Vec<String>> {
    let map = json
        .get("weight_map")
        .and_then(|m| m.as_object())
        .ok_or_else(|| anyhow::anyhow!("Invalid weights index: missing weight_map"))?;

    let shards: BTreeSet<String> = map
        .values()
        .filter_map(|v| v.as_str())
        .map(|s| s.to_string())
        .collect();
    for shard in &shards {
        if !is_plain_relative(shard) {
            bail!("Invalid weights index: shard name '{}' escapes the model directory", shard);
        }
    }
    Ok(shards.into_iter().collect())
}

/// Only plain relative names (`a.safetensors`, `sub/a.safetensors`) may be
/// joined onto the destination directory.
fn is_plain_relative(name: &str) -> bool {
    let path = Path::new(name);
    path.components().next().is_some()
        && path.components().all(|c| matches!(c, Component::Normal(_)))
}

pub fn print_report(report: &DownloadReport, dest_dir: &Path) {
    println!("download");
    println!("  fetched: {}", report.fetched.len());
    println!("  already present: {}", report.cached.len());
    for name in &report.missing_optional {
        println!("  not in repository: {}", name);
    }
    println!("  saved to: {}", dest_dir.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn weight_map_shards_are_unique_and_sorted() {
        let index = json!({
            "metadata": {"total_size": 123},
            "weight_map": {
                "lm_head.weight": "model-00002-of-00002.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                "model.norm.weight": "model-00002-of-00002.safetensors"
            }
        });
        assert_eq!(
            parse_weight_map(&index).unwrap(),
            vec![
                "model-00001-of-00002.safetensors",
                "model-00002-of-00002.safetensors"
            ]
        );
    }

    #[test]
    fn weight_map_rejects_escaping_names() {
        for bad in ["../../x.safetensors", "/etc/x.safetensors", "a/../../b.safetensors", ""] {
            let index = json!({ "weight_map": { "w": bad } });
            assert!(parse_weight_map(&index).is_err(), "accepted {:?}", bad);
        }
        let nested = json!({ "weight_map": { "w": "shards/model-1.safetensors" } });
        assert_eq!(
            parse_weight_map(&nested).unwrap(),
            vec!["shards/model-1.safetensors"]
        );
    }

    #[test]
    fn weight_map_required() {
        assert!(parse_weight_map(&json!({"metadata": {}})).is_err());
    }

    #[test]
    fn file_url_layout() {
        let cfg = ModelConfig {
            hub_url: "https://huggingface.co/".into(),
            ..Default::default()
        };
        let hub = HubClient::new(&cfg, Some(String::new())).unwrap();
        assert_eq!(
            hub.file_url("config.json"),
            "https://huggingface.co/meta-llama/Llama-3.2-3B-Instruct/resolve/main/config.json"
        );
        assert!(hub.token.is_none());
    }
}
