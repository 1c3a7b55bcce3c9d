//! # repoa CLI
//!
//! The `repoa` binary drives the whole pipeline: turn a source tree into a
//! fine-tuning corpus, embed and index its files in Elasticsearch, fine-tune
//! a pretrained causal language model on the corpus, and talk to the result.
//!
//! ## Usage
//!
//! ```bash
//! repoa [--config repoa.toml] [--settings appsettings.json] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `repoa corpus` | Write the training corpus from matching source files |
//! | `repoa embed` | Embed every source file into one JSON document each |
//! | `repoa rotate-key` | Request a fresh Elasticsearch API key |
//! | `repoa index` | Bulk-upload the embedding documents |
//! | `repoa download` | Fetch the pretrained model from the hub |
//! | `repoa train` | Fine-tune the model on the corpus |
//! | `repoa respond` | Interactive prompt loop against the served model |
//! | `repoa search "<query>"` | Semantic search over the index |
//! | `repoa chat` | Project chat with retrieved context |
//! | `repoa completions <shell>` | Print a shell completion script |
//!
//! Logs go to stderr and honour `RUST_LOG` (default `info`).

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use repoa::{
    chat, config, corpus, dataset, download, elastic, embed_cmd, embedding, generate, indexer,
    keygen, responder, search, trainer,
};

/// Corpus, embedding, indexing and fine-tuning glue for a source repository.
#[derive(Parser)]
#[command(name = "repoa", version)]
struct Cli {
    /// Pipeline configuration (TOML).
    ///
    /// Defaults to `./repoa.toml` when present, built-in defaults otherwise.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Service credentials and endpoints (JSON).
    #[arg(long, global = true, default_value = "appsettings.json")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the fine-tuning corpus from the configured source tree.
    Corpus,

    /// Generate one embedding document per source file.
    Embed,

    /// Request a new Elasticsearch API key.
    RotateKey,

    /// Upload embedding documents to the index in one bulk request.
    Index {
        /// Directory of embedding documents. Defaults to `embeddings.output_dir`.
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Download the pretrained model.
    Download,

    /// Fine-tune the downloaded model on the corpus.
    Train,

    /// Interactive prompt loop against the fine-tuned model.
    Respond,

    /// Semantic search over the indexed documents.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results. Defaults to `index.search_size`.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Chat about the project with retrieved context.
    Chat,

    /// Print a shell completion script to stdout.
    Completions {
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "repoa", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::resolve_pipeline_config(cli.config.as_deref())?;
    let interactive = atty::is(atty::Stream::Stdin);

    match cli.command {
        Commands::Corpus => {
            let summary = corpus::build_corpus(&cfg.corpus)?;
            corpus::print_summary(&summary);
        }
        Commands::Embed => {
            let settings = config::load_settings(&cli.settings)?;
            let embedder =
                embedding::AzureEmbeddingClient::from_settings(&settings, cfg.embeddings.timeout_secs)?;
            let summary = embed_cmd::run_embed(&cfg.embeddings, &embedder).await?;
            embed_cmd::print_summary(&summary, &cfg.embeddings.output_dir);
        }
        Commands::RotateKey => {
            let settings = config::load_settings(&cli.settings)?;
            let outcome = keygen::rotate_api_key(&settings, &cfg.keygen).await?;
            keygen::print_outcome(&outcome);
        }
        Commands::Index { dir } => {
            let settings = config::load_settings(&cli.settings)?;
            let client = elastic::ElasticClient::from_settings(&settings)?;
            let dir = dir.unwrap_or_else(|| cfg.embeddings.output_dir.clone());
            let run = indexer::run_index(&client, &cfg.index, &dir).await?;
            indexer::print_run(&run, &cfg.index.name, &dir);
        }
        Commands::Download => {
            let hub = download::HubClient::from_env(&cfg.model)?;
            let report = download::download_model(&hub, &cfg.model.download_dir).await?;
            download::print_report(&report, &cfg.model.download_dir);
        }
        Commands::Train => {
            let backend = trainer::ProcessBackend::new(cfg.training.command.clone())?;
            let run = trainer::run_finetune(&cfg.training, &backend).await?;
            trainer::print_run(&run, &cfg.training.output_dir);
        }
        Commands::Respond => {
            let generator = generate::CompletionClient::from_config(&cfg.responder)?;
            let tokenizer = match dataset::load_tokenizer(&cfg.responder.model_dir) {
                Ok(t) => Some(t),
                Err(e) => {
                    tracing::warn!(error = %format!("{:#}", e), "no local tokenizer, prompt length not budgeted");
                    None
                }
            };
            let session = responder::Responder::new(
                &generator,
                tokenizer,
                generate::DecodingParams::from_config(&cfg.responder),
                cfg.responder.exit_keywords.clone(),
            )
            .with_prompt(interactive);
            let stdin = std::io::stdin();
            session.run(stdin.lock(), std::io::stdout()).await?;
        }
        Commands::Search { query, limit } => {
            let settings = config::load_settings(&cli.settings)?;
            let client = elastic::ElasticClient::from_settings(&settings)?;
            let embedder =
                embedding::AzureEmbeddingClient::from_settings(&settings, cfg.embeddings.timeout_secs)?;
            let size = limit.unwrap_or(cfg.index.search_size);
            let hits =
                search::semantic_search(&client, &embedder, &cfg.index.name, &query, size).await?;
            search::print_hits(&hits);
        }
        Commands::Chat => {
            let settings = config::load_settings(&cli.settings)?;
            let client = elastic::ElasticClient::from_settings(&settings)?;
            let embedder =
                embedding::AzureEmbeddingClient::from_settings(&settings, cfg.embeddings.timeout_secs)?;
            let completer = chat::AzureChatClient::from_settings(&settings, &cfg.chat)?;
            let retriever = chat::IndexRetriever {
                client: &client,
                embedder: &embedder,
                index: cfg.index.name.clone(),
                size: cfg.index.search_size,
            };
            let mut session = chat::ChatSession::new(&cfg.chat);
            let stdin = std::io::stdin();
            chat::run_chat(
                &mut session,
                &retriever,
                &completer,
                &cfg.responder.exit_keywords,
                interactive,
                stdin.lock(),
                std::io::stdout(),
            )
            .await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
