//! Typed batch configuration.
//!
//! [`BatchConfig`] replaces the loose keyword arguments a batch run used to
//! take. Every field has a documented default; [`BatchConfig::validate`] runs
//! once at batch start, before any image is dispatched.

use crate::catalog::ResolvedModel;
use crate::error::Result;
use crate::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Prompt used when the caller does not supply one.
pub const DEFAULT_PROMPT: &str = "You are a professional information extraction assistant. \
Read every legible piece of text and structure in the image and return it as a single JSON object. \
Respond with JSON only.";

/// How per-image work is dispatched to the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One image at a time, so streamed output stays readable.
    #[default]
    StreamingSerial,
    /// Up to `max_workers` images in flight at once.
    Parallel,
}

/// Configuration for one batch run.
///
/// # Example
///
/// ```
/// use vision_batch::config::{BatchConfig, DispatchMode};
/// use std::time::Duration;
///
/// let config = BatchConfig::new("qwen-vl-max", "https://example.com/v1")
///     .with_max_retries(2)
///     .with_retry_delay(Duration::from_secs(1))
///     .with_dispatch_mode(DispatchMode::Parallel)
///     .with_max_workers(4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Model identifier sent to the endpoint.
    pub model_name: String,

    /// Free-form model description copied into every record.
    pub model_info: Option<String>,

    /// Instruction sent alongside each image.
    pub prompt: String,

    /// Endpoint base URL (e.g. `https://api.openai.com/v1`).
    pub api_base_url: String,

    /// Name of the environment variable holding the credential. Default: `API_KEY`.
    pub api_key_env: String,

    /// Root for outputs; each model gets its own subdirectory. Default: `data/outputs`.
    pub output_root: PathBuf,

    /// Target bounding box `(width, height)` for re-encoded images. Default: 1024x1024.
    pub max_image_size: (u32, u32),

    /// Size budget for re-encoded images, in megabytes. Default: 1.
    pub max_file_size_mb: u32,

    /// Resize and re-encode large images before upload. Default: `true`.
    pub enable_compression: bool,

    /// Minimum spacing between dispatches to the same endpoint. Default: 0 (disabled).
    #[serde(with = "secs")]
    pub request_delay: Duration,

    /// Transport retries per image (not counting the first attempt). Default: 0.
    pub max_retries: u32,

    /// Sleep between attempts. Default: 5 seconds.
    #[serde(with = "secs")]
    pub retry_delay: Duration,

    /// Per-request timeout. Default: 60 seconds.
    #[serde(with = "secs")]
    pub timeout: Duration,

    /// Worker budget for preprocessing and parallel dispatch. Default: 1.
    pub max_workers: usize,

    /// Serial streaming or parallel dispatch. Default: serial.
    pub dispatch_mode: DispatchMode,

    /// Sampling temperature; provider default when unset.
    pub temperature: Option<f64>,

    /// Generation cap; provider default when unset.
    pub max_tokens: Option<u32>,

    /// Capacity of the preprocessing cache. Default: 100.
    pub cache_capacity: usize,

    /// Also store the raw model text in successful records. Default: `false`.
    pub keep_raw_output: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            model_name: String::new(),
            model_info: None,
            prompt: DEFAULT_PROMPT.to_string(),
            api_base_url: String::new(),
            api_key_env: "API_KEY".to_string(),
            output_root: PathBuf::from("data/outputs"),
            max_image_size: (1024, 1024),
            max_file_size_mb: 1,
            enable_compression: true,
            request_delay: Duration::ZERO,
            max_retries: 0,
            retry_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
            max_workers: 1,
            dispatch_mode: DispatchMode::StreamingSerial,
            temperature: None,
            max_tokens: None,
            cache_capacity: 100,
            keep_raw_output: false,
        }
    }
}

impl BatchConfig {
    /// Create a config for a model and endpoint with all other fields defaulted.
    pub fn new(model_name: impl Into<String>, api_base_url: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    /// Build a config from a catalog entry, applying its overrides.
    pub fn from_model(model: &ResolvedModel) -> Self {
        let mut config = Self::new(model.name.clone(), model.api_base_url.clone());
        config.model_info = model.info.clone();
        config.api_key_env = model.env_key.clone();
        model.overrides.apply(&mut config);
        config
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_model_info(mut self, info: impl Into<String>) -> Self {
        self.model_info = Some(info.into());
        self
    }

    pub fn with_api_key_env(mut self, env: impl Into<String>) -> Self {
        self.api_key_env = env.into();
        self
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    pub fn with_max_image_size(mut self, width: u32, height: u32) -> Self {
        self.max_image_size = (width, height);
        self
    }

    pub fn with_max_file_size_mb(mut self, mb: u32) -> Self {
        self.max_file_size_mb = mb;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_raw_output(mut self, keep: bool) -> Self {
        self.keep_raw_output = keep;
        self
    }

    /// Size budget in bytes.
    pub fn max_bytes(&self) -> u64 {
        u64::from(self.max_file_size_mb) * 1024 * 1024
    }

    /// Effective worker count (never zero).
    pub fn workers(&self) -> usize {
        self.max_workers.max(1)
    }

    /// Per-model output directory under `output_root`.
    pub fn output_dir(&self) -> PathBuf {
        self.output_root.join(model_folder_name(&self.model_name))
    }

    /// Check the settings that would otherwise fail mid-batch.
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "model name is missing".to_string(),
            ));
        }
        if self.api_base_url.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "API base URL is missing; configure it in the models file or pass it explicitly"
                    .to_string(),
            ));
        }
        if self.api_key_env.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "API key environment variable name is missing".to_string(),
            ));
        }
        if self.max_image_size.0 == 0 || self.max_image_size.1 == 0 {
            return Err(PipelineError::Configuration(format!(
                "max_image_size must be non-zero, got {}x{}",
                self.max_image_size.0, self.max_image_size.1
            )));
        }
        if self.cache_capacity == 0 {
            return Err(PipelineError::Configuration(
                "cache_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read the credential from the named environment variable.
///
/// Absence (or an empty value) is a configuration error.
pub fn resolve_api_key(env_name: &str) -> Result<String> {
    match std::env::var(env_name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(PipelineError::Configuration(format!(
            "environment variable {} is required for authentication",
            env_name
        ))),
    }
}

/// Folder name for a model identifier (`/` and `:` become `-`).
pub fn model_folder_name(model_name: &str) -> String {
    model_name.replace(['/', ':'], "-")
}

/// Serde adapter: `Duration` as fractional seconds.
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            // Negative delays disable pacing.
            return Ok(Duration::ZERO);
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.max_image_size, (1024, 1024));
        assert_eq!(config.max_file_size_mb, 1);
        assert!(config.enable_compression);
        assert_eq!(config.request_delay, Duration::ZERO);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.retry_delay, Duration::from_secs(5));
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.dispatch_mode, DispatchMode::StreamingSerial);
        assert_eq!(config.cache_capacity, 100);
        assert_eq!(config.api_key_env, "API_KEY");
    }

    #[test]
    fn test_builder() {
        let config = BatchConfig::new("m", "http://x")
            .with_max_retries(3)
            .with_max_workers(0)
            .with_compression(false)
            .with_temperature(0.2);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.workers(), 1);
        assert!(!config.enable_compression);
        assert_eq!(config.temperature, Some(0.2));
    }

    #[test]
    fn test_validate_missing_base_url() {
        let config = BatchConfig::new("gpt-4o", "  ");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_validate_missing_model() {
        let config = BatchConfig::new("", "http://localhost:11434");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_capacity() {
        let config = BatchConfig::new("m", "http://x").with_cache_capacity(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_api_key_missing() {
        let err = resolve_api_key("VISION_BATCH_TEST_SURELY_UNSET_KEY").unwrap_err();
        assert!(err.to_string().contains("VISION_BATCH_TEST_SURELY_UNSET_KEY"));
    }

    #[test]
    fn test_resolve_api_key_present() {
        std::env::set_var("VISION_BATCH_TEST_CONFIG_KEY", "sk-abc");
        assert_eq!(
            resolve_api_key("VISION_BATCH_TEST_CONFIG_KEY").unwrap(),
            "sk-abc"
        );
    }

    #[test]
    fn test_output_dir_sanitizes_model_name() {
        let config =
            BatchConfig::new("qwen/qwen2.5-vl:7b", "http://x").with_output_root("/tmp/out");
        assert_eq!(
            config.output_dir(),
            PathBuf::from("/tmp/out/qwen-qwen2.5-vl-7b")
        );
    }

    #[test]
    fn test_deserialize_partial_with_seconds() {
        let config: BatchConfig = serde_json::from_value(serde_json::json!({
            "model_name": "gpt-4o",
            "api_base_url": "https://api.openai.com/v1",
            "request_delay": 0.5,
            "retry_delay": 2,
            "dispatch_mode": "parallel"
        }))
        .unwrap();
        assert_eq!(config.request_delay, Duration::from_millis(500));
        assert_eq!(config.retry_delay, Duration::from_secs(2));
        assert_eq!(config.dispatch_mode, DispatchMode::Parallel);
        assert_eq!(config.max_workers, 1);
    }

    #[test]
    fn test_negative_delay_disables_pacing() {
        let config: BatchConfig =
            serde_json::from_value(serde_json::json!({"request_delay": -1.0})).unwrap();
        assert_eq!(config.request_delay, Duration::ZERO);
    }
}
