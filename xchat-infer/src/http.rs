use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use xchat_types::{ChatMessage, Row, Source};

use crate::{Intent, LlmEngine, LlmError};

/// Rows beyond this are not sent to the model for insights.
const INSIGHT_SAMPLE_ROWS: usize = 50;

#[derive(Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    temperature: f32,
}

#[derive(Serialize, Deserialize, Clone)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: OpenAIMessage,
}

/// Engine backed by an OpenAI-compatible `/chat/completions` endpoint
/// (vLLM, llama.cpp server, hosted APIs).
pub struct HttpLlmEngine {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpLlmEngine {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    async fn complete(&self, messages: Vec<OpenAIMessage>, max_tokens: u32) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = OpenAIChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: Some(max_tokens),
            stream: false,
            temperature: 0.0,
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(LlmError::Status(resp.status().as_u16()));
        }

        let completion: ChatCompletion = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| LlmError::Parse("response had no choices".into()))
    }
}

fn msg(role: &str, content: impl Into<String>) -> OpenAIMessage {
    OpenAIMessage {
        role: role.into(),
        content: content.into(),
    }
}

fn with_history(system: &str, history: &[ChatMessage], prompt: &str) -> Vec<OpenAIMessage> {
    let mut messages = vec![msg("system", system)];
    messages.extend(history.iter().map(|m| msg(&m.role, m.content.clone())));
    messages.push(msg("user", prompt));
    messages
}

#[async_trait]
impl LlmEngine for HttpLlmEngine {
    async fn detect_intent(&self, prompt: &str, history: &[ChatMessage]) -> Result<Intent, LlmError> {
        let system = "Classify the user's request for an analytics assistant. \
                      Answer with exactly one word: trend (time series or sales charts), \
                      geo (maps or location distribution), metrics (KPIs or summaries), \
                      rag (company policies, handbooks or document search), \
                      or general (anything else).";
        let answer = self.complete(with_history(system, history, prompt), 4).await?;
        let intent = Intent::parse_loose(&answer).unwrap_or(Intent::General);
        tracing::debug!(%intent, raw = %answer, "intent detected");
        Ok(intent)
    }

    async fn generate_insight(&self, chart_type: &str, rows: &[Row]) -> Result<String, LlmError> {
        let sample = &rows[..rows.len().min(INSIGHT_SAMPLE_ROWS)];
        let data = serde_json::to_string(sample).map_err(|e| LlmError::Parse(e.to_string()))?;
        let messages = vec![
            msg(
                "system",
                "You write one or two sentence insights for business charts. Be concrete.",
            ),
            msg(
                "user",
                format!("Chart type: {chart_type}. {} rows total. Data sample: {data}", rows.len()),
            ),
        ];
        self.complete(messages, 120).await
    }

    async fn answer(&self, prompt: &str, history: &[ChatMessage]) -> Result<String, LlmError> {
        let system = "You are a concise assistant for a sales analytics product.";
        self.complete(with_history(system, history, prompt), 400).await
    }

    async fn synthesize(&self, prompt: &str, sources: &[Source]) -> Result<String, LlmError> {
        let context: Vec<String> = sources
            .iter()
            .enumerate()
            .map(|(i, s)| format!("[{}] {}: {}", i + 1, s.title, s.snippet.as_deref().unwrap_or("")))
            .collect();
        let messages = vec![
            msg(
                "system",
                "Answer using only the numbered sources. Cite them by title. \
                 If they do not cover the question, say so.",
            ),
            msg("user", format!("Sources:\n{}\n\nQuestion: {prompt}", context.join("\n"))),
        ];
        self.complete(messages, 400).await
    }
}
