use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {message}")]
    Io { path: String, message: String },
    #[error("invalid config yaml: {0}")]
    Yaml(String),
    #[error("invalid value for {key}: '{value}'")]
    Env { key: String, value: String },
}

/// Service configuration.
///
/// Resolution order: built-in defaults, then the YAML file named by
/// `XCHAT_CONFIG` (if set), then individual environment variables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XchatConfig {
    pub bind: String,
    /// Maximum number of cached query results.
    pub cache_capacity: usize,
    pub job_timeout_secs: u64,
    /// Minimum time a terminal job stays readable.
    pub retention_secs: u64,
    pub purge_interval_secs: u64,
    pub max_concurrent_jobs: usize,
    pub fetch_attempts: u32,
    pub fetch_backoff_ms: u64,
    pub insight_cache_capacity: usize,
    /// Documents passed to answer synthesis per knowledge-base question.
    pub retrieval_top_k: usize,
    /// Simulated scan latency of the demo store.
    pub fetch_latency_ms: u64,
    pub ledger_file: Option<String>,
    pub llm: LlmConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL. Unset selects the keyword engine.
    pub url: Option<String>,
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: None,
            model: "mistralai/Mistral-7B-Instruct-v0.3".into(),
        }
    }
}

impl Default for XchatConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:7000".into(),
            cache_capacity: 256,
            job_timeout_secs: 60,
            retention_secs: 600,
            purge_interval_secs: 30,
            max_concurrent_jobs: 8,
            fetch_attempts: 3,
            fetch_backoff_ms: 100,
            insight_cache_capacity: 128,
            retrieval_top_k: 3,
            fetch_latency_ms: 0,
            ledger_file: None,
            llm: LlmConfig::default(),
        }
    }
}

impl XchatConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("XCHAT_CONFIG") {
            Ok(path) if !path.is_empty() => Self::from_path(path)?,
            _ => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Yaml(e.to_string()))
    }

    /// Override fields from variables resolved by `lookup`. Empty values are
    /// ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("XCHAT_BIND") {
            self.bind = v;
        }
        if let Some(v) = get("XCHAT_CACHE_CAPACITY") {
            self.cache_capacity = parse("XCHAT_CACHE_CAPACITY", &v)?;
        }
        if let Some(v) = get("XCHAT_JOB_TIMEOUT_SECS") {
            self.job_timeout_secs = parse("XCHAT_JOB_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("XCHAT_RETENTION_SECS") {
            self.retention_secs = parse("XCHAT_RETENTION_SECS", &v)?;
        }
        if let Some(v) = get("XCHAT_MAX_JOBS") {
            self.max_concurrent_jobs = parse("XCHAT_MAX_JOBS", &v)?;
        }
        if let Some(v) = get("XCHAT_RETRIEVAL_TOP_K") {
            self.retrieval_top_k = parse("XCHAT_RETRIEVAL_TOP_K", &v)?;
        }
        if let Some(v) = get("XCHAT_FETCH_LATENCY_MS") {
            self.fetch_latency_ms = parse("XCHAT_FETCH_LATENCY_MS", &v)?;
        }
        if let Some(v) = get("XCHAT_LEDGER_FILE") {
            self.ledger_file = Some(v);
        }
        if let Some(v) = get("LLM_URL") {
            self.llm.url = Some(v);
        }
        if let Some(v) = get("LLM_MODEL") {
            self.llm.model = v;
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }

    pub fn fetch_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_ms)
    }

    pub fn fetch_latency(&self) -> Duration {
        Duration::from_millis(self.fetch_latency_ms)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}
