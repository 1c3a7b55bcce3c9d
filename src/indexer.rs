//! Bulk upload of embedding documents into an Elasticsearch index.
//!
//! Flow: ping (reported only) → create the index if missing → load every
//! `*.json` document in the embeddings directory → one `_bulk` call.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::IndexConfig;
use crate::elastic::{BulkReport, ElasticClient};
use crate::models::{EmbeddingDocument, IndexAction, ItemOutcome, RunSummary};

#[derive(Debug)]
pub struct IndexRun {
    pub reachable: bool,
    pub index_created: bool,
    /// Per-file load results.
    pub loaded: RunSummary,
    /// `None` when there was nothing to upload.
    pub bulk: Option<BulkReport>,
}

pub async fn run_index(
    client: &ElasticClient,
    config: &IndexConfig,
    embeddings_dir: &Path,
) -> Result<IndexRun> {
    let reachable = match client.ping().await {
        Ok(ok) => ok,
        Err(e) => {
            tracing::warn!(error = %format!("{:#}", e), "connection check failed");
            false
        }
    };
    if reachable {
        tracing::info!(url = client.base_url(), "connected to Elasticsearch");
    } else {
        tracing::warn!(url = client.base_url(), "Elasticsearch did not answer the ping");
    }

    let index_created = client
        .ensure_index(&config.name, config.embedding_dims)
        .await?;
    if index_created {
        tracing::info!(index = %config.name, "index created");
    }

    let (actions, loaded) = load_actions(embeddings_dir, &config.name)?;

    if actions.is_empty() {
        return Ok(IndexRun {
            reachable,
            index_created,
            loaded,
            bulk: None,
        });
    }

    let report = client.bulk(&actions).await?;
    Ok(IndexRun {
        reachable,
        index_created,
        loaded,
        bulk: Some(report),
    })
}

/// Parse every `*.json` file in `dir` (name order) into an index action.
/// Files that fail to read or parse are recorded and skipped.
pub fn load_actions(dir: &Path, index: &str) -> Result<(Vec<IndexAction>, RunSummary)> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read embeddings directory: {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut actions = Vec::new();
    let mut summary = RunSummary::default();

    for entry in entries {
        let path = entry.path();
        let shown = path.display().to_string();
        let is_json = path.extension().map(|e| e == "json").unwrap_or(false);
        if !path.is_file() {
            tracing::debug!(path = %shown, "not a file");
            summary.push(ItemOutcome::Skipped {
                path: shown,
                reason: "not a file".to_string(),
            });
            continue;
        }
        if !is_json {
            tracing::debug!(path = %shown, "not a .json file");
            summary.push(ItemOutcome::Skipped {
                path: shown,
                reason: "not a .json file".to_string(),
            });
            continue;
        }

        match read_document(&path) {
            Ok(document) => {
                actions.push(IndexAction {
                    index: index.to_string(),
                    source: document,
                });
                summary.push(ItemOutcome::Written {
                    path: shown,
                    output: path,
                });
            }
            Err(e) => {
                tracing::warn!(path = %shown, error = %format!("{:#}", e), "skipping document");
                summary.push(ItemOutcome::Failed {
                    path: shown,
                    reason: format!("{:#}", e),
                });
            }
        }
    }

    Ok((actions, summary))
}

fn read_document(path: &Path) -> Result<EmbeddingDocument> {
    let content = std::fs::read_to_string(path)?;
    let document = serde_json::from_str(&content).context("not an embedding document")?;
    Ok(document)
}

pub fn print_run(run: &IndexRun, index: &str, embeddings_dir: &Path) {
    println!("index");
    println!(
        "  connection: {}",
        if run.reachable { "ok" } else { "failed" }
    );
    if run.index_created {
        println!("  created index: {}", index);
    }
    if run.loaded.skipped() > 0 {
        println!("  skipped entries: {}", run.loaded.skipped());
    }
    for (path, reason) in run.loaded.failures() {
        println!("  error: {}: {}", path, reason);
    }
    match &run.bulk {
        None => println!(
            "  nothing to upload in '{}'",
            embeddings_dir.display()
        ),
        Some(report) if report.failures.is_empty() => println!(
            "  uploaded {} documents from '{}' to index '{}'",
            report.succeeded,
            embeddings_dir.display(),
            index
        ),
        Some(report) => {
            println!(
                "  uploaded {} of {} documents to index '{}'",
                report.succeeded, report.submitted, index
            );
            for (pos, reason) in &report.failures {
                println!("  rejected #{}: {}", pos, reason);
            }
        }
    }
}
