//! Block-chunked causal language modelling dataset.
//!
//! The corpus is tokenized as one continuous stream (no special tokens) and
//! cut into contiguous, non-overlapping blocks of exactly `block_size` ids.
//! The trailing partial block is dropped, so every example has the same
//! length and no padding or attention mask is needed.

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use tokenizers::Tokenizer;

/// One training example.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenBlock {
    pub input_ids: Vec<u32>,
}

pub fn load_tokenizer(model_dir: &Path) -> Result<Tokenizer> {
    let path = model_dir.join("tokenizer.json");
    if !path.exists() {
        bail!("tokenizer.json not found in {}", model_dir.display());
    }
    Tokenizer::from_file(&path)
        .map_err(|e| anyhow!("Failed to load tokenizer {}: {}", path.display(), e))
}

pub fn tokenize(tokenizer: &Tokenizer, text: &str) -> Result<Vec<u32>> {
    let encoding = tokenizer
        .encode(text, false)
        .map_err(|e| anyhow!("Tokenize: {}", e))?;
    Ok(encoding.get_ids().to_vec())
}

pub fn chunk_blocks(ids: &[u32], block_size: usize) -> Vec<TokenBlock> {
    if block_size == 0 {
        return Vec::new();
    }
    ids.chunks_exact(block_size)
        .map(|chunk| TokenBlock {
            input_ids: chunk.to_vec(),
        })
        .collect()
}

/// Tokenize the corpus file and cut it into blocks.
pub fn build_dataset(
    tokenizer: &Tokenizer,
    corpus: &Path,
    block_size: usize,
) -> Result<(Vec<TokenBlock>, usize)> {
    let text = std::fs::read_to_string(corpus)
        .with_context(|| format!("Failed to read corpus: {}", corpus.display()))?;
    let ids = tokenize(tokenizer, &text)?;
    let blocks = chunk_blocks(&ids, block_size);
    if blocks.is_empty() {
        bail!(
            "Corpus {} has {} tokens, fewer than one block of {}",
            corpus.display(),
            ids.len(),
            block_size
        );
    }
    Ok((blocks, ids.len()))
}

/// Write blocks as JSON lines: `{"input_ids": [...]}`.
pub fn write_jsonl(blocks: &[TokenBlock], path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for block in blocks {
        serde_json::to_writer(&mut out, block)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}
