//! Durable per-image records, raw-text backups and the run summary.
//!
//! Every file is written whole: contents go to a temp file in the target
//! directory, which is then renamed into place. Per-image files are never
//! overwritten; a taken name gets a numeric suffix instead.

use crate::config::BatchConfig;
use crate::error::Result;
use crate::types::{local_timestamp, Outcome, RunSummary, WorkItem};
use crate::PipelineError;
use serde::Serialize;
use serde_json::Value;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// File name of the per-run summary.
pub const SUMMARY_FILE: &str = "run_summary.json";

/// Give up looking for a free suffix after this many candidates.
const MAX_SUFFIX: u32 = 10_000;

/// Where the record came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordContext {
    pub image_path: PathBuf,
    pub model_info: Option<String>,
}

/// Error section of a non-successful record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

/// The JSON record written for each image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRecord {
    pub image_name: String,
    pub processed_at: String,
    pub model_name: String,
    pub context: RecordContext,
    pub status: Outcome,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_model_output: Option<String>,
}

impl ImageRecord {
    fn base(item: &WorkItem, config: &BatchConfig, status: Outcome, retries: u32) -> Self {
        Self {
            image_name: item.name(),
            processed_at: local_timestamp(),
            model_name: config.model_name.clone(),
            context: RecordContext {
                image_path: item.path().to_path_buf(),
                model_info: config.model_info.clone(),
            },
            status,
            retries,
            result: None,
            error: None,
            raw_model_output: None,
        }
    }

    /// Record for extracted JSON. The raw text is kept only if configured.
    pub fn succeeded(
        item: &WorkItem,
        config: &BatchConfig,
        retries: u32,
        result: Value,
        raw_text: &str,
    ) -> Self {
        let mut record = Self::base(item, config, Outcome::Succeeded, retries);
        record.result = Some(result);
        if config.keep_raw_output {
            record.raw_model_output = Some(raw_text.to_string());
        }
        record
    }

    /// Record for a parse failure or an exhausted item.
    pub fn failed(
        item: &WorkItem,
        config: &BatchConfig,
        status: Outcome,
        retries: u32,
        message: impl Into<String>,
        raw_text: &str,
    ) -> Self {
        let mut record = Self::base(item, config, status, retries);
        record.error = Some(RecordError {
            message: message.into(),
            raw_response: (!raw_text.is_empty()).then(|| raw_text.to_string()),
        });
        record
    }
}

/// Writes records into one output directory.
#[derive(Debug, Clone)]
pub struct ResultWriter {
    dir: PathBuf,
}

impl ResultWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the output directory if needed.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| PipelineError::persistence(&self.dir, e))
    }

    /// Write `record` as `<stem>_result.json`, or `<stem>_result_<n>.json`
    /// if taken. Returns the path written.
    pub fn write_primary(&self, stem: &str, record: &ImageRecord) -> Result<PathBuf> {
        let contents = serde_json::to_vec_pretty(record)?;
        self.write_unique(&contents, |n| match n {
            0 => format!("{}_result.json", stem),
            n => format!("{}_result_{}.json", stem, n),
        })
    }

    /// Write raw model text as `<stem>_backup.txt`, or `<stem>_backup_<n>.txt`.
    pub fn write_backup(&self, stem: &str, raw_text: &str) -> Result<PathBuf> {
        self.write_unique(raw_text.as_bytes(), |n| match n {
            0 => format!("{}_backup.txt", stem),
            n => format!("{}_backup_{}.txt", stem, n),
        })
    }

    /// Write the run summary, atomically replacing any previous one.
    pub fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        let path = self.dir.join(SUMMARY_FILE);
        let contents = serde_json::to_vec_pretty(summary)?;
        let tmp = self.temp_file(&contents)?;
        tmp.persist(&path)
            .map_err(|e| PipelineError::persistence(&path, e.error))?;
        Ok(path)
    }

    fn temp_file(&self, contents: &[u8]) -> Result<NamedTempFile> {
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|e| PipelineError::persistence(&self.dir, e))?;
        tmp.write_all(contents)
            .and_then(|_| tmp.flush())
            .map_err(|e| PipelineError::persistence(tmp.path(), e))?;
        Ok(tmp)
    }

    /// Persist `contents` under the first free name produced by `name_for(0, 1, ...)`.
    fn write_unique(&self, contents: &[u8], name_for: impl Fn(u32) -> String) -> Result<PathBuf> {
        let mut tmp = self.temp_file(contents)?;
        for n in 0..=MAX_SUFFIX {
            let path = self.dir.join(name_for(n));
            match tmp.persist_noclobber(&path) {
                Ok(_) => return Ok(path),
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => tmp = e.file,
                Err(e) => return Err(PipelineError::persistence(path, e.error)),
            }
        }
        Err(PipelineError::persistence(
            self.dir.join(name_for(0)),
            io::Error::new(io::ErrorKind::AlreadyExists, "no free file name"),
        ))
    }
}
