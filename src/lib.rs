//! # repoa
//!
//! Glue around one source repository: it becomes a fine-tuning corpus, a
//! set of embedding documents in Elasticsearch, and a fine-tuned causal
//! language model you can prompt or chat with.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌───────────────┐
//! │ Source tree │──▶│   Corpus    │──▶│   Trainer     │──▶ fine-tuned model
//! │  (walk)     │   │  (.txt)     │   │ (dataset+job) │         │
//! └──────┬──────┘   └─────────────┘   └───────────────┘         ▼
//!        │                                                 ┌──────────┐
//!        ▼                                                 │ Responder│
//! ┌─────────────┐   ┌─────────────┐   ┌───────────────┐    └──────────┘
//! │  Embedder   │──▶│  JSON docs  │──▶│ Elasticsearch │──▶ search / chat
//! └─────────────┘   └─────────────┘   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | `appsettings.json` credentials and `repoa.toml` pipeline settings |
//! | [`models`] | Shared data types and per-item run outcomes |
//! | [`walk`] | Deterministic source tree traversal with filters |
//! | [`corpus`] | Fine-tuning corpus builder |
//! | [`embedding`] | Embedding service client |
//! | [`embed_cmd`] | One embedding document per source file |
//! | [`elastic`] | Elasticsearch REST client |
//! | [`keygen`] | API key rotation |
//! | [`indexer`] | Bulk upload of embedding documents |
//! | [`search`] | Semantic search over the index |
//! | [`download`] | Pretrained model download |
//! | [`dataset`] | Tokenization into fixed-size blocks |
//! | [`trainer`] | Fine-tuning orchestration |
//! | [`generate`] | Sampled completion client |
//! | [`responder`] | Interactive prompt loop |
//! | [`chat`] | Retrieval-augmented project chat |

pub mod chat;
pub mod config;
pub mod corpus;
pub mod dataset;
pub mod download;
pub mod elastic;
pub mod embed_cmd;
pub mod embedding;
pub mod generate;
pub mod indexer;
pub mod keygen;
pub mod models;
pub mod responder;
pub mod search;
pub mod trainer;
pub mod walk;
