//! Per-image state machine with bounded transport retries.
//!
//! [`ItemRunner::run`] drives one [`WorkItem`] through
//!
//! ```text
//! Idle -> Preprocessing -> Dispatching -> Streaming -> Parsing -> Saving
//!                ^              ^              |
//!                +--------------+--- retry ----+
//!                                                 -> Succeeded | ParseFailed | Failed
//! ```
//!
//! A failed attempt sleeps and goes back to `Dispatching`, reusing the
//! encoded payload (or to `Preprocessing` if there is none yet). A stream
//! that completes without parsable JSON goes straight to `ParseFailed`; it
//! is never retried. Every path ends in `Saving`, which always leaves a
//! record on disk.

use crate::backend::{Backend, VisionRequest};
use crate::client_pool::{ClientHandle, ClientPool};
use crate::config::BatchConfig;
use crate::events::{emit, Event, EventHandler};
use crate::extract::{extract_json, ExtractError};
use crate::preprocess::Preprocessor;
use crate::rate_limit::RateLimiter;
use crate::retry::{is_retryable, RetryPolicy};
use crate::streaming::{consume, StreamOutput};
use crate::types::{ItemReport, Outcome, StageTimings, WorkItem};
use crate::writer::{ImageRecord, ResultWriter};
use crate::PipelineError;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// States of one item's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Idle,
    Preprocessing,
    Dispatching,
    Streaming,
    Parsing,
    Saving,
    Succeeded,
    ParseFailed,
    Failed,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Succeeded | ItemState::ParseFailed | ItemState::Failed)
    }
}

/// An encoded payload produced ahead of dispatch.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub payload: Arc<str>,
    pub elapsed: Duration,
}

/// Item-local state. Never shared across workers.
struct ItemRun<'a> {
    item: &'a WorkItem,
    state: ItemState,
    started: Instant,
    payload: Option<Arc<str>>,
    handle: Option<Arc<ClientHandle>>,
    retries: u32,
    timings: StageTimings,
    output: Option<StreamOutput>,
    parsed: Option<Result<Value, ExtractError>>,
    /// Error that ended the item, with the text streamed before it.
    failure: Option<(PipelineError, String)>,
}

impl<'a> ItemRun<'a> {
    fn new(item: &'a WorkItem, precomputed: Option<Preprocessed>) -> Self {
        let mut timings = StageTimings::default();
        let payload = precomputed.map(|p| {
            timings.preprocess = Some(p.elapsed);
            p.payload
        });
        Self {
            item,
            state: ItemState::Idle,
            started: Instant::now(),
            payload,
            handle: None,
            retries: 0,
            timings,
            output: None,
            parsed: None,
            failure: None,
        }
    }

    fn text(&self) -> &str {
        self.output.as_ref().map(|o| o.text.as_str()).unwrap_or("")
    }
}

/// Runs single items against shared services.
///
/// Cheap to clone: every service is behind an `Arc`.
#[derive(Clone)]
pub struct ItemRunner {
    pub(crate) config: Arc<BatchConfig>,
    pub(crate) api_key: Arc<str>,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) preprocessor: Preprocessor,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) pool: Arc<ClientPool>,
    pub(crate) writer: ResultWriter,
    pub(crate) policy: RetryPolicy,
    pub(crate) events: Option<Arc<dyn EventHandler>>,
    pub(crate) cancellation: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for ItemRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemRunner")
            .field("model", &self.config.model_name)
            .field("backend", &self.backend.name())
            .field("policy", &self.policy)
            .field("output_dir", &self.writer.dir())
            .finish()
    }
}

impl ItemRunner {
    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// Drive `item` to a terminal state and report the outcome.
    ///
    /// Never fails: transport errors, parse failures and write failures all
    /// end up in the returned report.
    pub async fn run(&self, item: &WorkItem, precomputed: Option<Preprocessed>) -> ItemReport {
        emit(
            &self.events,
            Event::ItemStart {
                index: item.index,
                total: item.total,
                image_name: item.name(),
            },
        );

        let mut run = ItemRun::new(item, precomputed);
        let mut report_paths = (None, None);
        while !run.state.is_terminal() {
            let next = match run.state {
                ItemState::Idle => ItemState::Preprocessing,
                ItemState::Preprocessing => self.preprocess(&mut run).await,
                ItemState::Dispatching => self.dispatch(&mut run).await,
                ItemState::Streaming => self.stream(&mut run).await,
                ItemState::Parsing => self.parse(&mut run),
                ItemState::Saving => {
                    let (next, paths) = self.save(&mut run);
                    report_paths = paths;
                    next
                }
                terminal => terminal,
            };
            tracing::trace!(image = %item.name(), from = ?run.state, to = ?next, "item transition");
            run.state = next;
        }

        let (output_file, backup_file) = report_paths;
        self.report(run, output_file, backup_file)
    }

    async fn preprocess(&self, run: &mut ItemRun<'_>) -> ItemState {
        if self.is_cancelled() {
            return self.attempt_failed(run, PipelineError::Cancelled, String::new()).await;
        }
        if run.payload.is_some() {
            return ItemState::Dispatching;
        }

        let t0 = Instant::now();
        let preprocessor = self.preprocessor.clone();
        let item = run.item.clone();
        let encoded = tokio::task::spawn_blocking(move || preprocessor.encode(&item))
            .await
            .map_err(|e| PipelineError::Io(std::io::Error::other(e)))
            .and_then(|r| r);
        match encoded {
            Ok(payload) => {
                run.timings.preprocess = Some(t0.elapsed());
                run.payload = Some(payload);
                ItemState::Dispatching
            }
            Err(e) => self.attempt_failed(run, e, String::new()).await,
        }
    }

    async fn dispatch(&self, run: &mut ItemRun<'_>) -> ItemState {
        if self.is_cancelled() {
            return self.attempt_failed(run, PipelineError::Cancelled, String::new()).await;
        }
        let base_url = self.config.api_base_url.trim_end_matches('/');
        self.limiter.wait(base_url, self.config.request_delay).await;

        match self.pool.get_client(&self.api_key, base_url, self.config.timeout) {
            Ok(handle) => {
                run.handle = Some(handle);
                ItemState::Streaming
            }
            Err(e) => self.attempt_failed(run, e, String::new()).await,
        }
    }

    async fn stream(&self, run: &mut ItemRun<'_>) -> ItemState {
        let (Some(handle), Some(payload)) = (run.handle.clone(), run.payload.clone()) else {
            return ItemState::Dispatching;
        };
        let request = VisionRequest {
            model: self.config.model_name.clone(),
            prompt: self.config.prompt.clone(),
            image_url: payload,
            image_name: run.item.name(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let index = run.item.index;
        let events = &self.events;
        let dispatched = Instant::now();
        let on_fragment = |chunk: &str, first: bool| {
            if first {
                emit(
                    events,
                    Event::FirstToken {
                        index,
                        ttft_seconds: dispatched.elapsed().as_secs_f64(),
                    },
                );
            }
            emit(
                events,
                Event::Token {
                    index,
                    chunk: chunk.to_string(),
                },
            );
        };

        match consume(
            self.backend.as_ref(),
            &handle,
            &request,
            self.cancellation.as_deref(),
            on_fragment,
        )
        .await
        {
            Ok(output) => {
                run.timings.ttft = Some(output.timing.ttft);
                run.timings.generation = Some(output.timing.generation);
                run.timings.stream_total = Some(output.timing.total);
                run.output = Some(output);
                ItemState::Parsing
            }
            Err(abort) => self.attempt_failed(run, abort.error, abort.partial_text).await,
        }
    }

    fn parse(&self, run: &mut ItemRun<'_>) -> ItemState {
        let t0 = Instant::now();
        run.parsed = Some(extract_json(run.text()));
        run.timings.parse = Some(t0.elapsed());
        ItemState::Saving
    }

    /// Handle a failed attempt: schedule a retry or end the item as `Failed`.
    async fn attempt_failed(
        &self,
        run: &mut ItemRun<'_>,
        error: PipelineError,
        partial: String,
    ) -> ItemState {
        let name = run.item.name();
        if !is_retryable(&error) || !self.policy.allows(run.retries + 1) {
            tracing::warn!(
                image = %name,
                retries = run.retries,
                error = %error,
                "attempt failed, giving up"
            );
            run.failure = Some((error, partial));
            return ItemState::Saving;
        }

        run.retries += 1;
        let delay = self.policy.delay_for(&error);
        tracing::warn!(
            image = %name,
            retry = run.retries,
            max_retries = self.policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "attempt failed, retrying"
        );
        emit(
            &self.events,
            Event::Retry {
                index: run.item.index,
                attempt: run.retries,
                delay_ms: delay.as_millis() as u64,
                reason: error.to_string(),
            },
        );

        tokio::time::sleep(delay).await;
        if self.is_cancelled() {
            run.failure = Some((PipelineError::Cancelled, partial));
            return ItemState::Saving;
        }

        run.output = None;
        if run.payload.is_some() {
            ItemState::Dispatching
        } else {
            ItemState::Preprocessing
        }
    }

    /// Persist the outcome. Write failures are logged, never escalated.
    fn save(&self, run: &mut ItemRun<'_>) -> (ItemState, (Option<PathBuf>, Option<PathBuf>)) {
        let t0 = Instant::now();
        let item = run.item;
        let stem = item.stem();
        let mut backup_file = None;

        let (next, record) = if let Some((error, partial)) = &run.failure {
            run.timings.elapsed_before_fail = Some(run.started.elapsed());
            if !partial.is_empty() {
                backup_file = self.backup(&stem, partial);
            }
            let record = ImageRecord::failed(
                item,
                &self.config,
                Outcome::Failed,
                run.retries,
                error.to_string(),
                partial,
            );
            (ItemState::Failed, record)
        } else {
            match &run.parsed {
                Some(Ok(value)) => {
                    let record = ImageRecord::succeeded(
                        item,
                        &self.config,
                        run.retries,
                        value.clone(),
                        run.text(),
                    );
                    (ItemState::Succeeded, record)
                }
                Some(Err(reason)) => {
                    backup_file = self.backup(&stem, run.text());
                    let record = ImageRecord::failed(
                        item,
                        &self.config,
                        Outcome::JsonParseFailed,
                        run.retries,
                        reason.to_string(),
                        run.text(),
                    );
                    (ItemState::ParseFailed, record)
                }
                None => {
                    let error = PipelineError::Transport("stream produced no output".into());
                    let record = ImageRecord::failed(
                        item,
                        &self.config,
                        Outcome::Failed,
                        run.retries,
                        error.to_string(),
                        "",
                    );
                    run.failure = Some((error, String::new()));
                    (ItemState::Failed, record)
                }
            }
        };

        let output_file = match self.writer.write_primary(&stem, &record) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(image = %item.name(), error = %e, "failed to write result record");
                None
            }
        };
        run.timings.save = Some(t0.elapsed());
        (next, (output_file, backup_file))
    }

    fn backup(&self, stem: &str, raw_text: &str) -> Option<PathBuf> {
        match self.writer.write_backup(stem, raw_text) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(stem, error = %e, "failed to write raw-text backup");
                None
            }
        }
    }

    fn report(
        &self,
        mut run: ItemRun<'_>,
        output_file: Option<PathBuf>,
        backup_file: Option<PathBuf>,
    ) -> ItemReport {
        run.timings.all = Some(run.started.elapsed());
        let item = run.item;

        let (outcome, error) = match run.state {
            ItemState::Succeeded => (Outcome::Succeeded, None),
            ItemState::ParseFailed => (
                Outcome::JsonParseFailed,
                run.parsed
                    .as_ref()
                    .and_then(|p| p.as_ref().err())
                    .map(|e| e.to_string()),
            ),
            _ => (
                Outcome::Failed,
                run.failure.as_ref().map(|(e, _)| e.to_string()),
            ),
        };

        match outcome {
            Outcome::Succeeded => {
                tracing::info!(image = %item.name(), retries = run.retries, "image succeeded")
            }
            _ => tracing::info!(
                image = %item.name(),
                status = %outcome,
                retries = run.retries,
                error = error.as_deref().unwrap_or(""),
                "image did not succeed"
            ),
        }
        tracing::debug!(image = %item.name(), timings = ?run.timings, "image timings");

        emit(
            &self.events,
            Event::ItemEnd {
                index: item.index,
                image_name: item.name(),
                status: outcome,
                output_file: output_file.clone(),
            },
        );

        ItemReport {
            index: item.index,
            image_name: item.name(),
            outcome,
            output_file,
            backup_file,
            retries: run.retries,
            json_valid: outcome.is_success(),
            error,
            char_count: run.output.as_ref().map(|o| o.char_count).unwrap_or(0),
            timings: run.timings,
        }
    }
}
