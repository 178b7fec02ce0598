//! # Vision Batch
//!
//! Resilient batch processing of images through vision LLM endpoints.
//!
//! Given a list of images, a prompt and an OpenAI-compatible (or Ollama)
//! endpoint, this crate preprocesses the images in parallel, dispatches them
//! with per-endpoint pacing and bounded retries, consumes the streamed
//! response, recovers JSON from whatever the model wrote, and persists one
//! record per image plus a run summary. No image is ever silently dropped:
//! every item ends as `succeeded`, `json_parse_failed` or `failed`, with a
//! record or raw-text backup on disk.
//!
//! ## Core Concepts
//!
//! - **[`BatchOrchestrator`]**: owns the shared services and runs batches.
//! - **[`BatchConfig`]**: typed configuration with documented defaults.
//! - **[`Backend`]**: object-safe trait over streaming providers
//!   ([`OpenAiBackend`], [`OllamaBackend`], [`MockBackend`] for tests).
//! - **[`ItemRunner`]**: the per-image state machine with retries.
//! - **[`extract_json`]**: tolerant JSON recovery from model text.
//! - **[`RunSummary`]**: per-image reports plus totals.
//!
//! ## Quick Start
//!
//! ```no_run
//! use vision_batch::{BatchConfig, BatchOrchestrator, DispatchMode, OllamaBackend};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = BatchOrchestrator::builder(Arc::new(OllamaBackend::new())).build();
//!
//!     let config = BatchConfig::new("qwen2.5vl:7b", "http://localhost:11434")
//!         .with_prompt("Extract the merchant, date and total as JSON.")
//!         .with_dispatch_mode(DispatchMode::Parallel)
//!         .with_max_workers(4)
//!         .with_max_retries(2);
//!
//!     let summary = orchestrator.run_directory(&config, "receipts".as_ref()).await?;
//!     for report in &summary.images {
//!         println!("{}: {}", report.image_name, report.outcome);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Models file
//!
//! With the `yaml` feature (on by default) a [`ModelCatalog`] can be loaded
//! from a YAML models file and resolved by `(provider, model)`:
//!
//! ```no_run
//! use vision_batch::{BatchConfig, ModelCatalog};
//!
//! # fn main() -> vision_batch::Result<()> {
//! let catalog = ModelCatalog::load("config/models.yaml".as_ref())?;
//! let config = BatchConfig::from_model(&catalog.resolve("openai", "gpt-4o-mini")?);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod catalog;
pub mod client_pool;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod extract;
pub mod orchestrator;
pub mod preprocess;
pub mod rate_limit;
pub mod retry;
pub mod streaming;
pub mod types;
pub mod writer;

pub use backend::{Backend, MockBackend, MockReply, OllamaBackend, OpenAiBackend, VisionRequest};
pub use cache::PreprocessCache;
pub use catalog::{ModelCatalog, ResolvedModel};
pub use client_pool::{ClientHandle, ClientPool};
pub use config::{BatchConfig, DispatchMode};
pub use controller::{ItemRunner, ItemState};
pub use error::{PipelineError, Result};
pub use events::{ChannelEventHandler, Event, EventHandler, FnEventHandler};
pub use extract::{extract_json, ExtractError};
pub use orchestrator::{BatchOrchestrator, BatchOrchestratorBuilder};
pub use rate_limit::RateLimiter;
pub use retry::{JitterStrategy, RetryPolicy};
pub use types::{ItemReport, Outcome, RunSummary, RunTotals, StageTimings, WorkItem};
pub use writer::{ImageRecord, ResultWriter};
