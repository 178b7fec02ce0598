//! Batch orchestration: preprocessing fan-out, dispatch, aggregation.
//!
//! [`BatchOrchestrator`] owns the shared services (preprocessing cache,
//! client pool, rate limiter) for its whole lifetime, so consecutive runs
//! reuse cached payloads and pooled connections. Build one with
//! [`BatchOrchestrator::builder`].

use crate::backend::Backend;
use crate::cache::PreprocessCache;
use crate::client_pool::ClientPool;
use crate::config::{resolve_api_key, BatchConfig, DispatchMode};
use crate::controller::{ItemRunner, Preprocessed};
use crate::error::Result;
use crate::events::{emit, Event, EventHandler};
use crate::preprocess::{list_images, Preprocessor};
use crate::rate_limit::RateLimiter;
use crate::retry::{JitterStrategy, RetryPolicy};
use crate::types::{
    local_timestamp, ConfigSnapshot, ItemReport, Outcome, RunSummary, RunTotals, StageTimings,
    WorkItem,
};
use crate::writer::ResultWriter;
use crate::PipelineError;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Runs batches of images through a vision backend.
///
/// # Example
///
/// ```no_run
/// use vision_batch::{BatchConfig, BatchOrchestrator, OpenAiBackend};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let orchestrator = BatchOrchestrator::builder(Arc::new(OpenAiBackend::new())).build();
///     let config = BatchConfig::new("gpt-4o-mini", "https://api.openai.com/v1")
///         .with_api_key_env("OPENAI_API_KEY")
///         .with_max_retries(2);
///
///     let summary = orchestrator.run_directory(&config, "data/images".as_ref()).await?;
///     println!("{} of {} succeeded", summary.totals.succeeded, summary.totals.all);
///     Ok(())
/// }
/// ```
pub struct BatchOrchestrator {
    backend: Arc<dyn Backend>,
    /// Cache supplied by the caller; used as-is whatever a run's capacity.
    shared_cache: Option<Arc<PreprocessCache>>,
    /// Cache owned by this orchestrator, sized by the latest run's config.
    owned_cache: Mutex<Option<Arc<PreprocessCache>>>,
    limiter: Arc<RateLimiter>,
    pool: Arc<ClientPool>,
    jitter: JitterStrategy,
    respect_retry_after: bool,
    cancellation: Option<Arc<AtomicBool>>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl BatchOrchestrator {
    /// Create a new builder around `backend`.
    pub fn builder(backend: Arc<dyn Backend>) -> BatchOrchestratorBuilder {
        BatchOrchestratorBuilder {
            backend,
            cache: None,
            limiter: None,
            pool: None,
            jitter: JitterStrategy::None,
            respect_retry_after: true,
            cancellation: None,
            event_handler: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// The preprocessing cache for a run with `capacity`.
    ///
    /// The owned cache is kept across runs and rebuilt (empty) when the
    /// configured capacity changes.
    fn cache(&self, capacity: usize) -> Arc<PreprocessCache> {
        if let Some(shared) = &self.shared_cache {
            return Arc::clone(shared);
        }
        let mut owned = self
            .owned_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(cache) = owned.as_ref().filter(|c| c.capacity() == capacity.max(1)) {
            return Arc::clone(cache);
        }
        if owned.is_some() {
            tracing::debug!(capacity, "cache capacity changed, rebuilding preprocess cache");
        }
        let cache = Arc::new(PreprocessCache::new(capacity));
        *owned = Some(Arc::clone(&cache));
        cache
    }

    /// Process every supported image directly inside `dir`.
    pub async fn run_directory(&self, config: &BatchConfig, dir: &Path) -> Result<RunSummary> {
        let paths = match list_images(dir) {
            Ok(paths) => paths,
            Err(e) => return Err(self.abort(e)),
        };
        self.execute(config, &paths, Some(dir.to_path_buf())).await
    }

    /// Process `paths` and return the run summary.
    ///
    /// Fails only when the batch cannot start (bad configuration, missing
    /// credential, empty input). Per-image failures are reported in the
    /// summary.
    pub async fn run(&self, config: &BatchConfig, paths: &[PathBuf]) -> Result<RunSummary> {
        self.execute(config, paths, None).await
    }

    /// Blocking form of [`run`](Self::run), driven on a private runtime.
    ///
    /// Must not be called from inside an async context.
    pub fn run_blocking(&self, config: &BatchConfig, paths: &[PathBuf]) -> Result<RunSummary> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run(config, paths))
    }

    fn abort(&self, error: PipelineError) -> PipelineError {
        tracing::error!(error = %error, "batch aborted before dispatch");
        emit(
            &self.event_handler,
            Event::Fatal {
                message: error.to_string(),
            },
        );
        error
    }

    #[tracing::instrument(
        name = "batch",
        skip_all,
        fields(model = %config.model_name, images = paths.len(), mode = ?config.dispatch_mode)
    )]
    async fn execute(
        &self,
        config: &BatchConfig,
        paths: &[PathBuf],
        input_dir: Option<PathBuf>,
    ) -> Result<RunSummary> {
        let api_key = match config
            .validate()
            .and_then(|_| resolve_api_key(&config.api_key_env))
        {
            Ok(key) => key,
            Err(e) => return Err(self.abort(e)),
        };
        if paths.is_empty() {
            return Err(self.abort(PipelineError::Input("no images to process".to_string())));
        }

        let run_started_at = local_timestamp();
        let started = Instant::now();
        let output_dir = config.output_dir();
        let writer = ResultWriter::new(&output_dir);
        if let Err(e) = writer.ensure_dir() {
            tracing::warn!(error = %e, "could not create output directory");
        }

        tracing::info!(
            output_dir = %output_dir.display(),
            workers = config.workers(),
            max_retries = config.max_retries,
            "batch started"
        );
        emit(
            &self.event_handler,
            Event::RunStart {
                total: paths.len(),
                model_name: config.model_name.clone(),
                output_dir: output_dir.clone(),
            },
        );

        let runner = ItemRunner {
            config: Arc::new(config.clone()),
            api_key: api_key.into(),
            backend: Arc::clone(&self.backend),
            preprocessor: Preprocessor::new(
                self.cache(config.cache_capacity),
                Preprocessor::params_for(config),
            ),
            limiter: Arc::clone(&self.limiter),
            pool: Arc::clone(&self.pool),
            writer: writer.clone(),
            policy: RetryPolicy::from_config(config)
                .with_jitter(self.jitter)
                .with_retry_after(self.respect_retry_after),
            events: self.event_handler.clone(),
            cancellation: self.cancellation.clone(),
        };

        let items = WorkItem::from_paths(paths);
        let precomputed = self.preprocess_all(&runner, &items, config.workers()).await;
        let reports = match config.dispatch_mode {
            DispatchMode::StreamingSerial => dispatch_serial(&runner, &items, precomputed).await,
            DispatchMode::Parallel => {
                dispatch_parallel(&runner, &items, precomputed, config.workers()).await
            }
        };

        let totals = RunTotals::from_reports(&reports);
        let elapsed = started.elapsed().as_secs_f64();
        let mut summary = RunSummary {
            model_name: config.model_name.clone(),
            model_info: config.model_info.clone(),
            prompt: config.prompt.clone(),
            run_started_at,
            run_finished_at: local_timestamp(),
            elapsed_seconds: elapsed,
            avg_seconds_per_image: elapsed / reports.len().max(1) as f64,
            config: ConfigSnapshot::from(config),
            input_dir,
            output_dir,
            totals,
            images: reports,
            summary_file: None,
        };

        match writer.write_summary(&summary) {
            Ok(path) => summary.summary_file = Some(path),
            Err(e) => tracing::warn!(error = %e, "failed to write run summary"),
        }

        tracing::info!(
            succeeded = totals.succeeded,
            json_parse_failed = totals.json_parse_failed,
            failed = totals.failed,
            elapsed_seconds = elapsed,
            "batch finished"
        );
        emit(
            &self.event_handler,
            Event::Done {
                totals,
                summary_file: summary.summary_file.clone(),
            },
        );
        Ok(summary)
    }

    /// Encode every item ahead of dispatch on at most `workers` blocking threads.
    ///
    /// Items that fail here are simply absent from the result; they are
    /// encoded again at dispatch time.
    async fn preprocess_all(
        &self,
        runner: &ItemRunner,
        items: &[WorkItem],
        workers: usize,
    ) -> HashMap<usize, Preprocessed> {
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut set = JoinSet::new();
        for item in items {
            if self.is_cancelled() {
                break;
            }
            let semaphore = Arc::clone(&semaphore);
            let preprocessor = runner.preprocessor.clone();
            let item = item.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let t0 = Instant::now();
                let index = item.index;
                let name = item.name();
                let encoded = tokio::task::spawn_blocking(move || preprocessor.encode(&item))
                    .await
                    .map_err(|e| PipelineError::Io(std::io::Error::other(e)))
                    .and_then(|r| r);
                let pre = encoded.map(|payload| Preprocessed {
                    payload,
                    elapsed: t0.elapsed(),
                });
                (index, name, pre)
            });
        }

        let mut done = HashMap::with_capacity(items.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, _, Ok(pre))) => {
                    done.insert(index, pre);
                }
                Ok((_, name, Err(e))) => {
                    tracing::warn!(
                        image = %name,
                        error = %e,
                        "preprocessing failed, will retry at dispatch"
                    );
                }
                Err(e) => tracing::warn!(error = %e, "preprocessing task failed"),
            }
        }
        tracing::debug!(encoded = done.len(), total = items.len(), "preprocessing phase finished");
        done
    }
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("backend", &self.backend.name())
            .field("has_shared_cache", &self.shared_cache.is_some())
            .field("pooled_clients", &self.pool.len())
            .field("jitter", &self.jitter)
            .field("respect_retry_after", &self.respect_retry_after)
            .field("has_cancellation", &self.cancellation.is_some())
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

/// One item's state machine completes before the next starts.
async fn dispatch_serial(
    runner: &ItemRunner,
    items: &[WorkItem],
    mut precomputed: HashMap<usize, Preprocessed>,
) -> Vec<ItemReport> {
    let mut reports = Vec::with_capacity(items.len());
    for item in items {
        let pre = precomputed.remove(&item.index);
        reports.push(runner.run(item, pre).await);
    }
    reports
}

/// Up to `workers` items in flight; reports arrive in completion order.
async fn dispatch_parallel(
    runner: &ItemRunner,
    items: &[WorkItem],
    mut precomputed: HashMap<usize, Preprocessed>,
    workers: usize,
) -> Vec<ItemReport> {
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut set = JoinSet::new();
    for item in items {
        let runner = runner.clone();
        let semaphore = Arc::clone(&semaphore);
        let pre = precomputed.remove(&item.index);
        let item = item.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            runner.run(&item, pre).await
        });
    }

    let mut reports = Vec::with_capacity(items.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => tracing::error!(error = %e, "dispatch task failed"),
        }
    }

    // A panicked task loses its report; record those items as failed.
    let reported: HashSet<usize> = reports.iter().map(|r| r.index).collect();
    for item in items.iter().filter(|i| !reported.contains(&i.index)) {
        reports.push(lost_report(item));
    }
    reports
}

fn lost_report(item: &WorkItem) -> ItemReport {
    ItemReport {
        index: item.index,
        image_name: item.name(),
        outcome: Outcome::Failed,
        output_file: None,
        backup_file: None,
        retries: 0,
        json_valid: false,
        error: Some("worker task aborted".to_string()),
        timings: StageTimings::default(),
        char_count: 0,
    }
}

/// Builder for [`BatchOrchestrator`].
pub struct BatchOrchestratorBuilder {
    backend: Arc<dyn Backend>,
    cache: Option<Arc<PreprocessCache>>,
    limiter: Option<Arc<RateLimiter>>,
    pool: Option<Arc<ClientPool>>,
    jitter: JitterStrategy,
    respect_retry_after: bool,
    cancellation: Option<Arc<AtomicBool>>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl BatchOrchestratorBuilder {
    /// Share a preprocessing cache. It is used for every run regardless of
    /// `cache_capacity`. If not set, the orchestrator owns a cache sized by
    /// each run's `cache_capacity`.
    pub fn cache(mut self, cache: Arc<PreprocessCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Share a rate limiter with other orchestrators.
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Share a client pool with other orchestrators.
    pub fn client_pool(mut self, pool: Arc<ClientPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the retry jitter strategy. Default: none.
    pub fn jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether retries honour a provider's `Retry-After`. Default: `true`.
    pub fn respect_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = respect;
        self
    }

    /// Set the cancellation flag.
    pub fn cancellation(mut self, cancel: Option<Arc<AtomicBool>>) -> Self {
        self.cancellation = cancel;
        self
    }

    /// Set the event handler.
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn build(self) -> BatchOrchestrator {
        BatchOrchestrator {
            backend: self.backend,
            shared_cache: self.cache,
            owned_cache: Mutex::new(None),
            limiter: self.limiter.unwrap_or_default(),
            pool: self.pool.unwrap_or_default(),
            jitter: self.jitter,
            respect_retry_after: self.respect_retry_after,
            cancellation: self.cancellation,
            event_handler: self.event_handler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockReply};
    use crate::events::ChannelEventHandler;
    use crate::writer::SUMMARY_FILE;
    use image::{Rgb, RgbImage};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn images(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = dir.join(name);
                RgbImage::from_pixel(4, 4, Rgb([9, 9, 9])).save(&path).unwrap();
                path
            })
            .collect()
    }

    fn config(out: &Path, key_env: &str) -> BatchConfig {
        std::env::set_var(key_env, "sk-test-key");
        BatchConfig::new("org/vision:7b", "http://localhost:9/v1")
            .with_api_key_env(key_env)
            .with_output_root(out)
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_images_one_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        let paths = images(dir.path(), &["a.png", "b.png", "c.png"]);
        let config = config(&dir.path().join("out"), "VISION_BATCH_TEST_E2E_KEY")
            .with_max_retries(1)
            .with_max_workers(2)
            .with_dispatch_mode(DispatchMode::StreamingSerial);
        let mock = Arc::new(
            MockBackend::new(vec![MockReply::chunks(["```json\n{\"items\": ", "[1, 2]}\n```"])])
                .for_image("b.png", vec![MockReply::fail("connection reset")]),
        );
        let orchestrator = BatchOrchestrator::builder(mock.clone()).build();

        let summary = assert_ok!(orchestrator.run(&config, &paths).await);

        assert_eq!(summary.totals.succeeded, 3);
        assert_eq!(summary.totals.failed, 0);
        assert_eq!(summary.totals.all, 3);
        assert_eq!(summary.report("b.png").unwrap().retries, 1);
        assert_eq!(summary.report("a.png").unwrap().retries, 0);
        assert_eq!(mock.calls(), 4);
        assert_eq!(mock.calls_for("b.png"), 2);

        let names: Vec<_> = summary.images.iter().map(|r| r.image_name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.png", "c.png"]);

        let record_path = summary.report("b.png").unwrap().output_file.clone().unwrap();
        assert!(record_path.starts_with(dir.path().join("out").join("org-vision-7b")));
        let record: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&record_path).unwrap()).unwrap();
        assert_eq!(record["retries"], 1);
        assert_eq!(record["result"]["items"][1], 2);

        let summary_file = summary.summary_file.clone().unwrap();
        assert_eq!(summary_file.file_name().unwrap(), SUMMARY_FILE);
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(summary_file).unwrap()).unwrap();
        assert_eq!(written["totals"]["succeeded"], 3);
        assert_eq!(written["dispatch_mode"], "streaming_serial");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_outcomes_totals() {
        let dir = tempfile::tempdir().unwrap();
        let paths = images(dir.path(), &["ok.png", "prose.png", "down.png"]);
        let config =
            config(&dir.path().join("out"), "VISION_BATCH_TEST_MIXED_KEY").with_max_retries(1);
        let mock = Arc::new(
            MockBackend::fixed("{\"fine\": true}")
                .for_image("prose.png", vec![MockReply::text("Nothing to extract.")])
                .for_image(
                    "down.png",
                    vec![MockReply::fail("503"), MockReply::fail("503")],
                ),
        );
        let orchestrator = BatchOrchestrator::builder(mock).build();
        let summary = assert_ok!(orchestrator.run(&config, &paths).await);

        assert_eq!(
            summary.totals,
            RunTotals {
                succeeded: 1,
                json_parse_failed: 1,
                failed: 2,
                all: 3,
            }
        );
        let prose = summary.report("prose.png").unwrap();
        assert_eq!(prose.outcome, Outcome::JsonParseFailed);
        assert!(prose.backup_file.is_some());
        let down = summary.report("down.png").unwrap();
        assert_eq!(down.outcome, Outcome::Failed);
        assert_eq!(down.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_image_fails_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = images(dir.path(), &["good1.png", "good2.png"]);
        let bad = dir.path().join("bad.png");
        std::fs::write(&bad, b"not an image").unwrap();
        paths.insert(1, bad);
        let config = config(&dir.path().join("out"), "VISION_BATCH_TEST_CORRUPT_KEY")
            .with_max_retries(1)
            .with_dispatch_mode(DispatchMode::Parallel);
        let mock = Arc::new(MockBackend::fixed("{\"ok\": 1}"));
        let orchestrator = BatchOrchestrator::builder(mock.clone()).build();

        let summary = assert_ok!(orchestrator.run(&config, &paths).await);

        assert_eq!(summary.report("good1.png").unwrap().outcome, Outcome::Succeeded);
        assert_eq!(summary.report("good2.png").unwrap().outcome, Outcome::Succeeded);
        let bad = summary.report("bad.png").unwrap();
        assert_eq!(bad.outcome, Outcome::Failed);
        assert!(bad.error.is_some());
        assert_eq!(summary.totals.succeeded, 2);
        assert_eq!(summary.totals.all, 3);
        assert_eq!(summary.images.len(), 3);
        assert_eq!(mock.calls_for("bad.png"), 0);
        assert_eq!(mock.calls(), 2);

        let record_path = bad.output_file.clone().unwrap();
        let record: serde_json::Value =
            serde_json::from_slice(&std::fs::read(record_path).unwrap()).unwrap();
        assert_eq!(record["status"], "failed");
        assert!(!record["error"]["message"].as_str().unwrap().is_empty());
        assert!(record.get("result").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_owned_cache_follows_run_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let paths = images(dir.path(), &["a.png", "b.png"]);
        let config = config(&dir.path().join("out"), "VISION_BATCH_TEST_CAPACITY_KEY");
        let orchestrator = BatchOrchestrator::builder(Arc::new(MockBackend::fixed("{}"))).build();

        assert_ok!(orchestrator.run(&config.clone().with_cache_capacity(1), &paths).await);
        assert_eq!(orchestrator.cache(1).len(), 1);

        assert_ok!(orchestrator.run(&config.with_cache_capacity(4), &paths).await);
        let cache = orchestrator.cache(4);
        assert_eq!(cache.capacity(), 4);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_dispatch_reports_every_item() {
        let dir = tempfile::tempdir().unwrap();
        let names = ["p1.png", "p2.png", "p3.png", "p4.png", "p5.png"];
        let paths = images(dir.path(), &names);
        let config = config(&dir.path().join("out"), "VISION_BATCH_TEST_PARALLEL_KEY")
            .with_dispatch_mode(DispatchMode::Parallel)
            .with_max_workers(2);
        let mock = Arc::new(
            MockBackend::new(vec![MockReply::chunks(["[", "1", "]"])])
                .with_chunk_delay(Duration::from_millis(50)),
        );
        let orchestrator = BatchOrchestrator::builder(mock.clone()).build();
        let summary = assert_ok!(orchestrator.run(&config, &paths).await);

        assert_eq!(summary.totals.succeeded, 5);
        assert_eq!(mock.calls(), 5);
        for name in names {
            assert!(summary.report(name).is_some(), "missing report for {}", name);
        }
    }

    #[tokio::test]
    async fn test_missing_credential_aborts_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let paths = images(dir.path(), &["a.png"]);
        let out = dir.path().join("out");
        let config = BatchConfig::new("m", "http://localhost:9")
            .with_api_key_env("VISION_BATCH_TEST_NEVER_SET_KEY")
            .with_output_root(&out);
        let mock = Arc::new(MockBackend::fixed("{}"));
        let (handler, mut rx) = ChannelEventHandler::new();
        let orchestrator = BatchOrchestrator::builder(mock.clone())
            .event_handler(Arc::new(handler))
            .build();

        let err = assert_err!(orchestrator.run(&config, &paths).await);
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert_eq!(mock.calls(), 0);
        assert!(!out.exists());
        assert!(matches!(rx.recv().await, Some(Event::Fatal { .. })));
    }

    #[tokio::test]
    async fn test_run_directory_lists_images() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        std::fs::create_dir_all(&input).unwrap();
        images(&input, &["b.PNG", "a.png"]);
        std::fs::write(input.join("notes.txt"), "skip me").unwrap();
        let config = config(&dir.path().join("out"), "VISION_BATCH_TEST_DIR_KEY");
        let orchestrator = BatchOrchestrator::builder(Arc::new(MockBackend::fixed("{}"))).build();

        let summary = assert_ok!(orchestrator.run_directory(&config, &input).await);
        assert_eq!(summary.input_dir.as_deref(), Some(input.as_path()));
        let names: Vec<_> = summary.images.iter().map(|r| r.image_name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.PNG"]);

        let err = assert_err!(orchestrator.run_directory(&config, &dir.path().join("nope")).await);
        assert!(matches!(err, PipelineError::Input(_)));
    }

    #[tokio::test]
    async fn test_cancelled_batch_reports_every_item() {
        let dir = tempfile::tempdir().unwrap();
        let paths = images(dir.path(), &["a.png", "b.png"]);
        let config =
            config(&dir.path().join("out"), "VISION_BATCH_TEST_CANCEL_KEY").with_max_retries(3);
        let mock = Arc::new(MockBackend::fixed("{}"));
        let orchestrator = BatchOrchestrator::builder(mock.clone())
            .cancellation(Some(Arc::new(AtomicBool::new(true))))
            .build();

        let summary = assert_ok!(orchestrator.run(&config, &paths).await);
        assert_eq!(summary.totals.failed, 2);
        assert!(summary.images.iter().all(|r| r.error.as_deref() == Some("cancelled")));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_shared_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let paths = images(dir.path(), &["a.png", "b.png"]);
        let config = config(&dir.path().join("out"), "VISION_BATCH_TEST_CACHE_KEY");
        let cache = Arc::new(PreprocessCache::new(8));
        let orchestrator = BatchOrchestrator::builder(Arc::new(MockBackend::fixed("{}")))
            .cache(Arc::clone(&cache))
            .build();

        assert_ok!(orchestrator.run(&config, &paths).await);
        assert_eq!(cache.len(), 2);
        let second = assert_ok!(orchestrator.run(&config, &paths).await);
        assert_eq!(cache.len(), 2);
        // Second run writes alongside the first without overwriting.
        let record = second.report("a.png").unwrap().output_file.clone().unwrap();
        assert_eq!(record.file_name().unwrap(), "a_result_1.json");
    }

    #[test]
    fn test_run_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let paths = images(dir.path(), &["a.png"]);
        let config = config(&dir.path().join("out"), "VISION_BATCH_TEST_BLOCKING_KEY");
        let orchestrator =
            BatchOrchestrator::builder(Arc::new(MockBackend::fixed("{\"x\": 1}"))).build();
        let summary = assert_ok!(orchestrator.run_blocking(&config, &paths));
        assert_eq!(summary.totals.succeeded, 1);
    }
}
