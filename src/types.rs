//! Core data types shared across the pipeline.

use crate::config::{BatchConfig, DispatchMode};
use serde::{Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Stable identity of an input file: path plus modification time and size.
///
/// Part of the preprocessing cache key, so an edited file never hits a stale
/// entry. When the file could not be stat'ed, `modified`/`size` are `None`
/// and the identity is not cacheable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub path: PathBuf,
    pub modified: Option<SystemTime>,
    pub size: Option<u64>,
}

impl FileIdentity {
    /// Stat `path` and capture its identity.
    pub fn probe(path: &Path) -> Self {
        let meta = std::fs::metadata(path).ok();
        Self {
            path: path.to_path_buf(),
            modified: meta.as_ref().and_then(|m| m.modified().ok()),
            size: meta.as_ref().map(|m| m.len()),
        }
    }

    /// Whether this identity is complete enough to key a cache entry.
    pub fn is_cacheable(&self) -> bool {
        self.modified.is_some() && self.size.is_some()
    }
}

/// One image to process in a batch run.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub identity: FileIdentity,
    /// 1-based position in the batch.
    pub index: usize,
    pub total: usize,
}

impl WorkItem {
    /// Build work items for `paths`, numbered from 1.
    pub fn from_paths(paths: &[PathBuf]) -> Vec<WorkItem> {
        let total = paths.len();
        paths
            .iter()
            .enumerate()
            .map(|(i, p)| WorkItem {
                identity: FileIdentity::probe(p),
                index: i + 1,
                total,
            })
            .collect()
    }

    pub fn path(&self) -> &Path {
        &self.identity.path
    }

    /// File name, e.g. `receipt.jpg`.
    pub fn name(&self) -> String {
        self.identity
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// File stem, e.g. `receipt`.
    pub fn stem(&self) -> String {
        self.identity
            .path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string())
    }
}

/// Terminal classification of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Valid JSON was extracted and persisted.
    Succeeded,
    /// The stream completed but no candidate parsed as JSON.
    JsonParseFailed,
    /// Retries were exhausted (or the batch was cancelled).
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::JsonParseFailed => "json_parse_failed",
            Outcome::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-item stage durations, all measured on the monotonic clock.
///
/// Serialized as seconds rounded to four decimals; unset stages are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageTimings {
    #[serde(
        rename = "preprocess_seconds",
        serialize_with = "opt_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub preprocess: Option<Duration>,
    #[serde(
        rename = "ttft_seconds",
        serialize_with = "opt_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub ttft: Option<Duration>,
    #[serde(
        rename = "gen_seconds",
        serialize_with = "opt_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub generation: Option<Duration>,
    #[serde(
        rename = "stream_total_seconds",
        serialize_with = "opt_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub stream_total: Option<Duration>,
    #[serde(
        rename = "parse_seconds",
        serialize_with = "opt_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub parse: Option<Duration>,
    #[serde(
        rename = "save_seconds",
        serialize_with = "opt_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub save: Option<Duration>,
    #[serde(
        rename = "all_seconds",
        serialize_with = "opt_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub all: Option<Duration>,
    #[serde(
        rename = "elapsed_before_fail",
        serialize_with = "opt_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub elapsed_before_fail: Option<Duration>,
}

/// Result of one work item, as reported in the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub index: usize,
    pub image_name: String,
    #[serde(rename = "status")]
    pub outcome: Outcome,
    /// Primary record path; `None` if the write failed.
    pub output_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_file: Option<PathBuf>,
    /// Transport retries performed (0 = first attempt finished the item).
    pub retries: u32,
    pub json_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timings: StageTimings,
    pub char_count: usize,
}

/// Success/failure counts for a run.
///
/// `failed` counts every item that did not succeed; `json_parse_failed`
/// breaks out the parse failures among them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub succeeded: usize,
    pub json_parse_failed: usize,
    pub failed: usize,
    pub all: usize,
}

impl RunTotals {
    pub fn from_reports(reports: &[ItemReport]) -> Self {
        let mut totals = RunTotals {
            all: reports.len(),
            ..Default::default()
        };
        for report in reports {
            match report.outcome {
                Outcome::Succeeded => totals.succeeded += 1,
                Outcome::JsonParseFailed => {
                    totals.json_parse_failed += 1;
                    totals.failed += 1;
                }
                Outcome::Failed => totals.failed += 1,
            }
        }
        totals
    }
}

/// Configuration values recorded with each run.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    pub max_workers: usize,
    pub dispatch_mode: DispatchMode,
    #[serde(serialize_with = "secs")]
    pub request_delay: Duration,
    pub max_retries: u32,
    #[serde(serialize_with = "secs")]
    pub retry_delay: Duration,
    pub enable_compression: bool,
    pub max_image_size: [u32; 2],
    pub max_file_size_mb: u32,
}

impl From<&BatchConfig> for ConfigSnapshot {
    fn from(config: &BatchConfig) -> Self {
        Self {
            max_workers: config.workers(),
            dispatch_mode: config.dispatch_mode,
            request_delay: config.request_delay,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            enable_compression: config.enable_compression,
            max_image_size: [config.max_image_size.0, config.max_image_size.1],
            max_file_size_mb: config.max_file_size_mb,
        }
    }
}

/// Aggregate record of one batch invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub model_name: String,
    pub model_info: Option<String>,
    pub prompt: String,
    pub run_started_at: String,
    pub run_finished_at: String,
    pub elapsed_seconds: f64,
    pub avg_seconds_per_image: f64,
    #[serde(flatten)]
    pub config: ConfigSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub totals: RunTotals,
    /// Per-item reports in completion (serial) or arrival (parallel) order.
    pub images: Vec<ItemReport>,
    /// Where the summary itself was written; `None` if that write failed.
    #[serde(skip)]
    pub summary_file: Option<PathBuf>,
}

impl RunSummary {
    /// Find the report for an image by file name.
    ///
    /// Under parallel dispatch `images` is not in input order, so look items
    /// up by name rather than position.
    pub fn report(&self, image_name: &str) -> Option<&ItemReport> {
        self.images.iter().find(|r| r.image_name == image_name)
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(round4(value.as_secs_f64()))
}

fn opt_secs<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_f64(round4(d.as_secs_f64())),
        None => serializer.serialize_none(),
    }
}

/// Local wall-clock timestamp in the record format (`%Y-%m-%d %H:%M:%S`).
pub(crate) fn local_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, outcome: Outcome) -> ItemReport {
        ItemReport {
            index: 1,
            image_name: name.to_string(),
            outcome,
            output_file: None,
            backup_file: None,
            retries: 0,
            json_valid: outcome.is_success(),
            error: None,
            timings: StageTimings::default(),
            char_count: 0,
        }
    }

    #[test]
    fn test_totals_count_parse_failures_as_failed() {
        let reports = vec![
            report("a.png", Outcome::Succeeded),
            report("b.png", Outcome::JsonParseFailed),
            report("c.png", Outcome::Failed),
        ];
        let totals = RunTotals::from_reports(&reports);
        assert_eq!(totals.succeeded, 1);
        assert_eq!(totals.json_parse_failed, 1);
        assert_eq!(totals.failed, 2);
        assert_eq!(totals.all, 3);
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        let v = serde_json::to_value(report("x.png", Outcome::JsonParseFailed)).unwrap();
        assert_eq!(v["status"], "json_parse_failed");
        assert_eq!(Outcome::Succeeded.to_string(), "succeeded");
    }

    #[test]
    fn test_timings_rounded_and_sparse() {
        let timings = StageTimings {
            ttft: Some(Duration::from_micros(123_456)),
            ..Default::default()
        };
        let v = serde_json::to_value(&timings).unwrap();
        assert_eq!(v["ttft_seconds"], 0.1235);
        assert!(v.get("save_seconds").is_none());
    }

    #[test]
    fn test_identity_of_missing_file_not_cacheable() {
        let id = FileIdentity::probe(Path::new("/no/such/image.png"));
        assert!(!id.is_cacheable());
    }

    #[test]
    fn test_work_items_numbered_from_one() {
        let items = WorkItem::from_paths(&[PathBuf::from("a/x.png"), PathBuf::from("a/y.jpg")]);
        assert_eq!(items[0].index, 1);
        assert_eq!(items[1].index, 2);
        assert_eq!(items[1].total, 2);
        assert_eq!(items[1].name(), "y.jpg");
        assert_eq!(items[1].stem(), "y");
    }
}
