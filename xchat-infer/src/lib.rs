use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xchat_types::{ChatMessage, Row, Source};

pub mod http;
pub mod insight;
pub mod keyword;

pub use http::HttpLlmEngine;
pub use insight::InsightCache;
pub use keyword::KeywordLlmEngine;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("llm transport error: {0}")]
    Transport(String),
    #[error("llm returned status {0}")]
    Status(u16),
    #[error("llm response could not be parsed: {0}")]
    Parse(String),
    #[error("llm engine unavailable: {0}")]
    Unavailable(String),
}

/// What the user is asking for. Selects the orchestration pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Trend,
    Geo,
    Metrics,
    /// Answered from the document knowledge base.
    Rag,
    General,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Trend => "trend",
            Intent::Geo => "geo",
            Intent::Metrics => "metrics",
            Intent::Rag => "rag",
            Intent::General => "general",
        }
    }

    /// Lenient parse of a model's one-word answer.
    pub fn parse_loose(text: &str) -> Option<Intent> {
        let t = text.trim().trim_matches(|c: char| !c.is_alphanumeric()).to_ascii_lowercase();
        match t.as_str() {
            "trend" | "chart" | "line" => Some(Intent::Trend),
            "geo" | "map" => Some(Intent::Geo),
            "metrics" | "metric" | "kpi" => Some(Intent::Metrics),
            "rag" | "document" | "documents" | "search" => Some(Intent::Rag),
            "general" => Some(Intent::General),
            _ => None,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait LlmEngine: Send + Sync {
    async fn detect_intent(&self, prompt: &str, history: &[ChatMessage]) -> Result<Intent, LlmError>;

    /// One or two sentences describing what the charted rows show.
    async fn generate_insight(&self, chart_type: &str, rows: &[Row]) -> Result<String, LlmError>;

    /// Free-form answer for prompts no data pipeline handles.
    async fn answer(&self, prompt: &str, history: &[ChatMessage]) -> Result<String, LlmError>;

    /// Answer `prompt` from the retrieved `sources` only.
    async fn synthesize(&self, prompt: &str, sources: &[Source]) -> Result<String, LlmError>;
}

/// Engine with no model behind it: every prompt is general and every
/// generation fails.
pub struct NullLlmEngine;

#[async_trait]
impl LlmEngine for NullLlmEngine {
    async fn detect_intent(&self, _prompt: &str, _history: &[ChatMessage]) -> Result<Intent, LlmError> {
        Ok(Intent::General)
    }

    async fn generate_insight(&self, _chart_type: &str, _rows: &[Row]) -> Result<String, LlmError> {
        Err(LlmError::Unavailable("no model configured".into()))
    }

    async fn answer(&self, _prompt: &str, _history: &[ChatMessage]) -> Result<String, LlmError> {
        Err(LlmError::Unavailable("no model configured".into()))
    }

    async fn synthesize(&self, _prompt: &str, _sources: &[Source]) -> Result<String, LlmError> {
        Err(LlmError::Unavailable("no model configured".into()))
    }
}
