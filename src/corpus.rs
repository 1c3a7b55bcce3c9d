//! Fine-tuning corpus builder.
//!
//! Concatenates every source file with an allowed extension into a single
//! text file, wrapping each one in a short templated conversation:
//!
//! ```text
//! <|beginning_of_text|>
//! User: Explain this module.
//! Bot: The file a.cs contains code that handles part of the project.
//! User: Show me a code example.
//! Bot:
//! ...file content...
//! <|end_of_text|>
//! ```

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::config::CorpusConfig;
use crate::walk::{scan_sources, WalkFilter};

pub const BEGIN_MARKER: &str = "<|beginning_of_text|>";
pub const END_MARKER: &str = "<|end_of_text|>";

/// Files written into the corpus, in output order.
#[derive(Debug, Clone)]
pub struct CorpusSummary {
    pub files: Vec<PathBuf>,
    pub output: PathBuf,
}

/// Build the corpus described by `config`, truncating any previous output.
pub fn build_corpus(config: &CorpusConfig) -> Result<CorpusSummary> {
    let filter = WalkFilter {
        extensions: config.extensions.clone(),
        exclude_paths: vec![config.output.clone()],
        ..Default::default()
    };
    let sources = scan_sources(&config.root, &filter)?;

    let file = File::create(&config.output)
        .with_context(|| format!("Failed to create corpus file: {}", config.output.display()))?;
    let mut out = BufWriter::new(file);

    let mut files = Vec::with_capacity(sources.len());
    for source in &sources {
        let bytes = std::fs::read(&source.path)
            .with_context(|| format!("Failed to read {}", source.path.display()))?;
        let content = String::from_utf8_lossy(&bytes);
        write_record(&mut out, config, &source.file_name, &content)?;
        files.push(source.path.clone());
    }
    out.flush()?;

    tracing::debug!(files = files.len(), output = %config.output.display(), "corpus written");

    Ok(CorpusSummary {
        files,
        output: config.output.clone(),
    })
}

fn write_record<W: Write>(
    out: &mut W,
    config: &CorpusConfig,
    file_name: &str,
    content: &str,
) -> Result<()> {
    let description = config.description.replace("{file}", file_name);
    writeln!(out, "{}", BEGIN_MARKER)?;
    writeln!(out, "User: {}", config.explain_prompt)?;
    writeln!(out, "Bot: {}", description)?;
    writeln!(out, "User: {}", config.example_prompt)?;
    writeln!(out, "Bot:")?;
    out.write_all(content.as_bytes())?;
    write!(out, "\n{}\n\n", END_MARKER)?;
    Ok(())
}

/// Print the run report the way the other commands do.
pub fn print_summary(summary: &CorpusSummary) {
    if summary.files.is_empty() {
        println!("corpus");
        println!("  no files found with the configured extensions");
        return;
    }
    println!("corpus");
    println!("  files: {}", summary.files.len());
    println!("  saved to: {}", summary.output.display());
}
