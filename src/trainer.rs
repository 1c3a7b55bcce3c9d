//! Causal-LM fine-tuning driver.
//!
//! The crate prepares everything around the training loop and hands the
//! loop itself to a [`TrainingBackend`]:
//!
//! 1. load the tokenizer from the downloaded model directory,
//! 2. tokenize the corpus into fixed-size blocks ([`crate::dataset`]),
//! 3. compute the [`TrainingPlan`] (steps, checkpoint steps),
//! 4. write `dataset.jsonl` and `training_job.json` into the checkpoint dir,
//! 5. run the backend,
//! 6. prune checkpoints beyond the retention limit, copy the tokenizer
//!    files next to the fine-tuned weights, and write `training_run.json`.
//!
//! [`ProcessBackend`] runs an external command with the job manifest path as
//! its last argument. The command reports progress as JSON lines on stdout:
//!
//! ```text
//! {"event": "step", "step": 500, "loss": 1.734}
//! ```
//!
//! Any other stdout line is forwarded to the log verbatim. The default
//! command runs `scripts/train_causal_lm.py`, a Hugging Face `Trainer` loop
//! over the job manifest, relative to the working directory.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::TrainingConfig;
use crate::dataset;

const TOKENIZER_FILES: &[&str] = &[
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
];

/// Fixed schedule derived from the dataset size and the training config.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingPlan {
    pub blocks: usize,
    pub block_size: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub steps_per_epoch: usize,
    pub total_steps: usize,
    pub save_steps: usize,
    pub save_total_limit: usize,
    pub checkpoint_steps: Vec<usize>,
}

impl TrainingPlan {
    pub fn new(blocks: usize, config: &TrainingConfig) -> Self {
        let steps_per_epoch = blocks.div_ceil(config.batch_size);
        let total_steps = steps_per_epoch * config.epochs;
        let checkpoint_steps = (1..=total_steps / config.save_steps)
            .map(|i| i * config.save_steps)
            .collect();

        Self {
            blocks,
            block_size: config.block_size,
            epochs: config.epochs,
            batch_size: config.batch_size,
            steps_per_epoch,
            total_steps,
            save_steps: config.save_steps,
            save_total_limit: config.save_total_limit,
            checkpoint_steps,
        }
    }
}

/// Everything a training runtime needs, serialized as `training_job.json`.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingJob {
    pub model_dir: PathBuf,
    pub dataset: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub output_dir: PathBuf,
    pub objective: String,
    pub mlm: bool,
    pub eval_split: Option<f32>,
    pub overwrite_output_dir: bool,
    pub plan: TrainingPlan,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingReport {
    pub steps_completed: usize,
    pub final_loss: Option<f32>,
}

#[async_trait]
pub trait TrainingBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Run the full schedule described by `job`, writing checkpoints under
    /// `job.checkpoint_dir` and the final model into `job.output_dir`.
    async fn train(&self, job: &TrainingJob, manifest: &Path) -> Result<TrainingReport>;
}

/// Runs `command... <manifest>` and follows its stdout.
pub struct ProcessBackend {
    command: Vec<String>,
}

impl ProcessBackend {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            bail!("training.command must name a program");
        }
        Ok(Self { command })
    }
}

#[derive(Deserialize)]
struct StepEvent {
    event: String,
    step: usize,
    #[serde(default)]
    loss: Option<f32>,
}

/// Parse a `{"event":"step",...}` progress line.
fn parse_step_line(line: &str) -> Option<(usize, Option<f32>)> {
    let event: StepEvent = serde_json::from_str(line.trim()).ok()?;
    (event.event == "step").then_some((event.step, event.loss))
}

#[async_trait]
impl TrainingBackend for ProcessBackend {
    fn name(&self) -> &str {
        &self.command[0]
    }

    async fn train(&self, job: &TrainingJob, manifest: &Path) -> Result<TrainingReport> {
        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .arg(manifest)
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start training command '{}'", self.command[0]))?;

        let mut report = TrainingReport::default();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                match parse_step_line(&line) {
                    Some((step, loss)) => {
                        report.steps_completed = step;
                        if loss.is_some() {
                            report.final_loss = loss;
                        }
                        tracing::info!(
                            step,
                            total = job.plan.total_steps,
                            loss = loss.unwrap_or(f32::NAN),
                            "training step"
                        );
                    }
                    None => tracing::info!(target: "repoa::trainer::runtime", "{}", line),
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            bail!("Training command exited with {}", status);
        }
        Ok(report)
    }
}

/// Summary persisted as `training_run.json` in the output directory.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingRun {
    pub backend: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tokens: usize,
    pub plan: TrainingPlan,
    pub report: TrainingReport,
    pub pruned_checkpoints: Vec<PathBuf>,
}

pub async fn run_finetune(
    config: &TrainingConfig,
    backend: &dyn TrainingBackend,
) -> Result<TrainingRun> {
    if !config.model_dir.join("config.json").exists() {
        bail!(
            "No model found in {} (missing config.json); run `repoa download` first",
            config.model_dir.display()
        );
    }

    let tokenizer = dataset::load_tokenizer(&config.model_dir)?;
    let (blocks, tokens) = dataset::build_dataset(&tokenizer, &config.corpus, config.block_size)?;
    let plan = TrainingPlan::new(blocks.len(), config);
    tracing::info!(
        blocks = plan.blocks,
        tokens,
        total_steps = plan.total_steps,
        "dataset ready"
    );

    std::fs::create_dir_all(&config.checkpoint_dir).with_context(|| {
        format!(
            "Failed to create checkpoint dir: {}",
            config.checkpoint_dir.display()
        )
    })?;
    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "Failed to create output dir: {}",
            config.output_dir.display()
        )
    })?;

    let dataset_path = config.checkpoint_dir.join("dataset.jsonl");
    dataset::write_jsonl(&blocks, &dataset_path)?;

    let job = TrainingJob {
        model_dir: config.model_dir.clone(),
        dataset: dataset_path,
        checkpoint_dir: config.checkpoint_dir.clone(),
        output_dir: config.output_dir.clone(),
        objective: "causal_lm".to_string(),
        mlm: false,
        eval_split: None,
        overwrite_output_dir: true,
        plan: plan.clone(),
    };
    let manifest = config.checkpoint_dir.join("training_job.json");
    std::fs::write(&manifest, serde_json::to_string_pretty(&job)?)
        .with_context(|| format!("Failed to write {}", manifest.display()))?;

    let started_at = Utc::now();
    tracing::info!(backend = backend.name(), "fine-tuning started");
    let report = backend.train(&job, &manifest).await?;
    let finished_at = Utc::now();

    let pruned_checkpoints = prune_checkpoints(&config.checkpoint_dir, config.save_total_limit)?;
    copy_tokenizer_files(&config.model_dir, &config.output_dir)?;

    let run = TrainingRun {
        backend: backend.name().to_string(),
        started_at,
        finished_at,
        tokens,
        plan,
        report,
        pruned_checkpoints,
    };
    let run_path = config.output_dir.join("training_run.json");
    std::fs::write(&run_path, serde_json::to_string_pretty(&run)?)
        .with_context(|| format!("Failed to write {}", run_path.display()))?;

    Ok(run)
}

/// Delete the oldest `checkpoint-<step>` directories so at most `limit`
/// remain. A limit of 0 keeps everything.
pub fn prune_checkpoints(dir: &Path, limit: usize) -> Result<Vec<PathBuf>> {
    if limit == 0 || !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut checkpoints: Vec<(usize, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            let step = name.strip_prefix("checkpoint-")?.parse::<usize>().ok()?;
            Some((step, e.path()))
        })
        .collect();
    checkpoints.sort_by_key(|(step, _)| *step);

    let excess = checkpoints.len().saturating_sub(limit);
    let mut removed = Vec::with_capacity(excess);
    for (_, path) in checkpoints.into_iter().take(excess) {
        std::fs::remove_dir_all(&path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
        tracing::debug!(path = %path.display(), "checkpoint pruned");
        removed.push(path);
    }
    Ok(removed)
}

fn copy_tokenizer_files(model_dir: &Path, output_dir: &Path) -> Result<()> {
    for name in TOKENIZER_FILES {
        let src = model_dir.join(name);
        if src.exists() {
            std::fs::copy(&src, output_dir.join(name))
                .with_context(|| format!("Failed to copy {}", src.display()))?;
        }
    }
    Ok(())
}

pub fn print_run(run: &TrainingRun, output_dir: &Path) {
    println!("train");
    println!("  blocks: {} x {} tokens", run.plan.blocks, run.plan.block_size);
    println!(
        "  steps: {} / {} ({} epochs)",
        run.report.steps_completed, run.plan.total_steps, run.plan.epochs
    );
    if let Some(loss) = run.report.final_loss {
        println!("  final loss: {:.4}", loss);
    }
    println!("  pruned checkpoints: {}", run.pruned_checkpoints.len());
    println!("  model saved to: {}", output_dir.display());
}
