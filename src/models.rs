//! Core data models shared across the pipeline.
//!
//! These types represent the files, documents, and per-item results that
//! flow from the repository walk through embedding and indexing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A file discovered by the repository walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Path relative to the walk root, always `/`-separated.
    pub relative_path: String,
    pub file_name: String,
    /// Lower-cased extension with its leading dot, empty when absent.
    pub extension: String,
}

/// One embedded source file, persisted as a JSON file and indexed as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingDocument {
    pub file_name: String,
    pub path: String,
    pub content: String,
    pub embedding: Vec<f32>,
}

/// A single `_bulk` index action.
#[derive(Debug, Clone, Serialize)]
pub struct IndexAction {
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_source")]
    pub source: EmbeddingDocument,
}

/// Result of processing one item in a batch command.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Written { path: String, output: PathBuf },
    Skipped { path: String, reason: String },
    Failed { path: String, reason: String },
}

impl ItemOutcome {
    pub fn path(&self) -> &str {
        match self {
            ItemOutcome::Written { path, .. }
            | ItemOutcome::Skipped { path, .. }
            | ItemOutcome::Failed { path, .. } => path,
        }
    }
}

/// Aggregated per-item outcomes of a batch command.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub outcomes: Vec<ItemOutcome>,
}

impl RunSummary {
    pub fn push(&mut self, outcome: ItemOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn written(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Written { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed { .. }))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes.iter().filter_map(|o| match o {
            ItemOutcome::Failed { path, reason } => Some((path.as_str(), reason.as_str())),
            _ => None,
        })
    }

    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  written: {}", self.written())?;
        writeln!(f, "  skipped: {}", self.skipped())?;
        write!(f, "  failed: {}", self.failed())
    }
}
