use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::EmbeddingsConfig;
use crate::embedding::Embedder;
use crate::models::{EmbeddingDocument, ItemOutcome, RunSummary, SourceFile};
use crate::walk::{scan_sources, WalkFilter};

/// Embed every repository file and write one JSON document per file.
///
/// Files are processed one at a time. A read, request, or write failure
/// is recorded for that file and the run moves on to the next one.
pub async fn run_embed(config: &EmbeddingsConfig, embedder: &dyn Embedder) -> Result<RunSummary> {
    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "Failed to create output directory: {}",
            config.output_dir.display()
        )
    })?;

    let filter = WalkFilter {
        skip_dirs: config.skip_dirs.clone(),
        skip_files: config.skip_files.clone(),
        exclude_globs: config.exclude_globs.clone(),
        exclude_paths: vec![config.output_dir.clone()],
        ..Default::default()
    };
    let sources = scan_sources(&config.root, &filter)?;

    let mut summary = RunSummary::default();
    let mut used_names = HashSet::new();

    for source in &sources {
        let outcome = match embed_one(source, embedder, &config.output_dir, &mut used_names).await
        {
            Ok(output) => {
                tracing::info!(path = %source.relative_path, output = %output.display(), "embedding written");
                ItemOutcome::Written {
                    path: source.relative_path.clone(),
                    output,
                }
            }
            Err(e) => {
                tracing::warn!(path = %source.path.display(), error = %format!("{:#}", e), "embedding failed");
                ItemOutcome::Failed {
                    path: source.relative_path.clone(),
                    reason: format!("{:#}", e),
                }
            }
        };
        summary.push(outcome);
    }

    Ok(summary)
}

async fn embed_one(
    source: &SourceFile,
    embedder: &dyn Embedder,
    output_dir: &Path,
    used_names: &mut HashSet<String>,
) -> Result<PathBuf> {
    let content = std::fs::read_to_string(&source.path)
        .with_context(|| format!("Failed to read {}", source.path.display()))?;

    let embedding = embedder.embed(&content).await?;

    let document = EmbeddingDocument {
        file_name: source.file_name.clone(),
        path: source.relative_path.clone(),
        content,
        embedding,
    };

    let name = output_file_name(&source.relative_path, used_names);
    let output = output_dir.join(&name);
    let json = serde_json::to_string_pretty(&document)?;
    std::fs::write(&output, json)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    used_names.insert(name);

    Ok(output)
}

/// Output name derived from the full relative path so same-named files in
/// different directories never overwrite each other.
///
/// `src/a.cs` → `src__a.cs.json`. If the flattened name was already used in
/// this run, a short hash of the relative path is appended.
pub fn output_file_name(relative_path: &str, used: &HashSet<String>) -> String {
    let flat = relative_path.replace('/', "__");
    let candidate = format!("{}.json", flat);
    if !used.contains(&candidate) {
        return candidate;
    }

    let digest = Sha256::digest(relative_path.as_bytes());
    format!("{}.{}.json", flat, &hex::encode(digest)[..8])
}

pub fn print_summary(summary: &RunSummary, output_dir: &Path) {
    println!("embed");
    println!("  files: {}", summary.outcomes.len());
    println!("{}", summary);
    println!("  output: {}", output_dir.display());
    for (path, reason) in summary.failures() {
        println!("  error: {}: {}", path, reason);
    }
}
