//! Provider/model catalog.
//!
//! The catalog is the read-only configuration provider the pipeline consumes:
//! given a `(provider key, model key)` pair it yields the model identifier,
//! endpoint, credential variable and any tuning overrides. Provider-level
//! `defaults` are merged under the model entry, with the model winning.
//!
//! ```yaml
//! providers:
//!   dashscope:
//!     label: Alibaba Cloud
//!     defaults:
//!       env_key: DASHSCOPE_API_KEY
//!       api_base_url: https://dashscope.aliyuncs.com/compatible-mode/v1
//!       request_delay: 0.5
//!     models:
//!       qwen_vl_max:
//!         name: qwen-vl-max
//!         info: Qwen VL Max
//! ```

use crate::config::BatchConfig;
use crate::error::Result;
use crate::PipelineError;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Parsed models file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelCatalog {
    #[serde(default)]
    providers: BTreeMap<String, ProviderEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ProviderEntry {
    #[serde(default)]
    defaults: Map<String, Value>,
    #[serde(default)]
    models: BTreeMap<String, Map<String, Value>>,
    /// Everything else on the provider (display name, docs URL, ...).
    #[serde(flatten)]
    info: Map<String, Value>,
}

/// A model entry after provider defaults have been merged in.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel {
    pub name: String,
    pub info: Option<String>,
    pub api_base_url: String,
    pub env_key: String,
    pub overrides: TuningOverrides,
}

/// Optional per-model tuning that overrides [`BatchConfig`] defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TuningOverrides {
    pub max_retries: Option<u32>,
    /// Seconds.
    pub retry_delay: Option<f64>,
    /// Seconds.
    pub request_delay: Option<f64>,
    /// Seconds.
    pub timeout: Option<f64>,
    pub max_workers: Option<usize>,
    pub enable_compression: Option<bool>,
    pub max_file_size_mb: Option<u32>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl TuningOverrides {
    /// Write every present override into `config`.
    pub fn apply(&self, config: &mut BatchConfig) {
        if let Some(v) = self.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = self.retry_delay {
            config.retry_delay = seconds(v);
        }
        if let Some(v) = self.request_delay {
            config.request_delay = seconds(v);
        }
        if let Some(v) = self.timeout {
            config.timeout = seconds(v);
        }
        if let Some(v) = self.max_workers {
            config.max_workers = v;
        }
        if let Some(v) = self.enable_compression {
            config.enable_compression = v;
        }
        if let Some(v) = self.max_file_size_mb {
            config.max_file_size_mb = v;
        }
        if self.temperature.is_some() {
            config.temperature = self.temperature;
        }
        if self.max_tokens.is_some() {
            config.max_tokens = self.max_tokens;
        }
    }
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

#[derive(Deserialize)]
struct MergedEntry {
    name: Option<String>,
    info: Option<String>,
    api_base_url: Option<String>,
    env_key: Option<String>,
    #[serde(flatten)]
    overrides: TuningOverrides,
}

impl ModelCatalog {
    /// Parse a catalog from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| PipelineError::Configuration(format!("invalid models file: {}", e)))
    }

    /// Parse a catalog from YAML text.
    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| PipelineError::Configuration(format!("invalid models file: {}", e)))
    }

    /// Load a models file, picking the format from its extension.
    ///
    /// A missing file yields an empty catalog.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            #[cfg(feature = "yaml")]
            Some("yml") | Some("yaml") => Self::from_yaml_str(&text),
            _ => Err(PipelineError::Configuration(format!(
                "unsupported models file format: {}",
                path.display()
            ))),
        }
    }

    /// Provider keys, sorted.
    pub fn provider_keys(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    /// Model keys for a provider, sorted.
    pub fn model_keys(&self, provider: &str) -> Result<Vec<&str>> {
        Ok(self
            .provider(provider)?
            .models
            .keys()
            .map(String::as_str)
            .collect())
    }

    /// Free-form provider info (everything except `defaults` and `models`).
    pub fn provider_info(&self, provider: &str) -> Result<&Map<String, Value>> {
        Ok(&self.provider(provider)?.info)
    }

    fn provider(&self, key: &str) -> Result<&ProviderEntry> {
        self.providers.get(key).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "provider '{}' not found; available: {}",
                key,
                self.provider_keys().join(", ")
            ))
        })
    }

    /// Look up a model, merging the provider's defaults under it.
    pub fn resolve(&self, provider: &str, model: &str) -> Result<ResolvedModel> {
        let entry = self.provider(provider)?;
        let model_map = entry.models.get(model).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "model '{}' not found for provider '{}'; available: {}",
                model,
                provider,
                entry
                    .models
                    .keys()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;

        let mut merged = entry.defaults.clone();
        for (k, v) in model_map {
            merged.insert(k.clone(), v.clone());
        }

        let merged: MergedEntry = serde_json::from_value(Value::Object(merged)).map_err(|e| {
            PipelineError::Configuration(format!(
                "invalid entry for {}/{}: {}",
                provider, model, e
            ))
        })?;

        Ok(ResolvedModel {
            name: merged.name.unwrap_or_else(|| model.to_string()),
            info: merged.info,
            api_base_url: merged.api_base_url.unwrap_or_default(),
            env_key: merged.env_key.unwrap_or_else(|| "API_KEY".to_string()),
            overrides: merged.overrides,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModelCatalog {
        ModelCatalog::from_json_str(
            r#"{
                "providers": {
                    "dashscope": {
                        "label": "Alibaba Cloud",
                        "defaults": {
                            "env_key": "DASHSCOPE_API_KEY",
                            "api_base_url": "https://dashscope.example/v1",
                            "request_delay": 0.5,
                            "max_retries": 2
                        },
                        "models": {
                            "qwen_vl_max": {"name": "qwen-vl-max", "info": "Qwen VL Max"},
                            "qwen_local": {
                                "name": "qwen2.5-vl:7b",
                                "api_base_url": "http://localhost:11434",
                                "max_retries": 0
                            }
                        }
                    }
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_merges_defaults() {
        let model = sample().resolve("dashscope", "qwen_vl_max").unwrap();
        assert_eq!(model.name, "qwen-vl-max");
        assert_eq!(model.info.as_deref(), Some("Qwen VL Max"));
        assert_eq!(model.api_base_url, "https://dashscope.example/v1");
        assert_eq!(model.env_key, "DASHSCOPE_API_KEY");
        assert_eq!(model.overrides.max_retries, Some(2));
    }

    #[test]
    fn test_model_overrides_provider_defaults() {
        let model = sample().resolve("dashscope", "qwen_local").unwrap();
        assert_eq!(model.api_base_url, "http://localhost:11434");
        assert_eq!(model.overrides.max_retries, Some(0));
        assert_eq!(model.overrides.request_delay, Some(0.5));
    }

    #[test]
    fn test_unknown_provider_lists_available() {
        let err = sample().resolve("openai", "gpt4o").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("openai"));
        assert!(msg.contains("dashscope"));
    }

    #[test]
    fn test_unknown_model_lists_available() {
        let err = sample().resolve("dashscope", "nope").unwrap_err();
        assert!(err.to_string().contains("qwen_vl_max"));
    }

    #[test]
    fn test_provider_info_excludes_models() {
        let catalog = sample();
        let info = catalog.provider_info("dashscope").unwrap();
        assert_eq!(info["label"], "Alibaba Cloud");
        assert!(info.get("models").is_none());
        assert_eq!(
            catalog.model_keys("dashscope").unwrap(),
            vec!["qwen_local", "qwen_vl_max"]
        );
    }

    #[test]
    fn test_batch_config_from_model() {
        let model = sample().resolve("dashscope", "qwen_vl_max").unwrap();
        let config = BatchConfig::from_model(&model);
        assert_eq!(config.model_name, "qwen-vl-max");
        assert_eq!(config.api_key_env, "DASHSCOPE_API_KEY");
        assert_eq!(config.request_delay, Duration::from_millis(500));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_file_is_empty_catalog() {
        let catalog = ModelCatalog::load(Path::new("/definitely/not/here/models.yml")).unwrap();
        assert!(catalog.provider_keys().is_empty());
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn test_from_yaml() {
        let catalog = ModelCatalog::from_yaml_str(
            concat!(
                "providers:\n",
                "  local:\n",
                "    defaults:\n",
                "      api_base_url: http://localhost:11434\n",
                "    models:\n",
                "      llava:\n",
                "        name: llava:13b\n",
            ),
        )
        .unwrap();
        let model = catalog.resolve("local", "llava").unwrap();
        assert_eq!(model.name, "llava:13b");
        assert_eq!(model.env_key, "API_KEY");
    }
}
