//! Deterministic engine used when no model endpoint is configured.

use async_trait::async_trait;
use serde_json::Value;
use xchat_types::{ChatMessage, Row, Source};

use crate::{Intent, LlmEngine, LlmError};

const TREND_WORDS: &[&str] = &["trend", "chart", "sales", "graph", "plot", "趨勢", "圖"];
const GEO_WORDS: &[&str] = &["map", "distribution", "location", "where", "地圖", "分佈"];
const RAG_WORDS: &[&str] = &["policy", "document", "search", "handbook", "rag", "規定", "文件"];
const METRIC_WORDS: &[&str] = &["kpi", "metric", "revenue", "summary", "average", "total"];

#[derive(Clone, Debug, Default)]
pub struct KeywordLlmEngine;

impl KeywordLlmEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(prompt: &str) -> Intent {
        let p = prompt.to_lowercase();
        let any = |words: &[&str]| words.iter().any(|w| p.contains(w));
        if any(TREND_WORDS) {
            Intent::Trend
        } else if any(GEO_WORDS) {
            Intent::Geo
        } else if any(RAG_WORDS) {
            Intent::Rag
        } else if any(METRIC_WORDS) {
            Intent::Metrics
        } else {
            Intent::General
        }
    }
}

fn mean(rows: &[Row], column: &str) -> Option<f64> {
    let nums: Vec<f64> = rows
        .iter()
        .filter_map(|r| r.get(column).and_then(Value::as_f64))
        .collect();
    if nums.is_empty() {
        None
    } else {
        Some(nums.iter().sum::<f64>() / nums.len() as f64)
    }
}

fn numeric_columns(rows: &[Row]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for row in rows {
        for (k, v) in row {
            if v.is_number() && !out.contains(k) {
                out.push(k.clone());
            }
        }
    }
    out
}

#[async_trait]
impl LlmEngine for KeywordLlmEngine {
    async fn detect_intent(&self, prompt: &str, _history: &[ChatMessage]) -> Result<Intent, LlmError> {
        Ok(Self::classify(prompt))
    }

    async fn generate_insight(&self, chart_type: &str, rows: &[Row]) -> Result<String, LlmError> {
        if rows.is_empty() {
            return Ok("No data matched this query, so there is nothing to summarize.".into());
        }
        let insight = match chart_type {
            "map" => format!(
                "Based on {} locations. Dense clustering near metropolitan areas.",
                rows.len()
            ),
            _ => {
                let leader = numeric_columns(rows)
                    .into_iter()
                    .filter(|c| c != "lat" && c != "lon")
                    .filter_map(|c| mean(rows, &c).map(|m| (c, m)))
                    .max_by(|a, b| a.1.total_cmp(&b.1));
                match leader {
                    Some((col, avg)) => format!(
                        "Based on {} rows. {col} remains strongest with an average of {avg:.1}.",
                        rows.len()
                    ),
                    None => "No specific insight available for this data.".into(),
                }
            }
        };
        Ok(insight)
    }

    async fn answer(&self, prompt: &str, _history: &[ChatMessage]) -> Result<String, LlmError> {
        Ok(format!(
            "I couldn't match \"{}\" to a data question. I can chart sales trends, \
             map user distribution, or summarize product metrics.",
            prompt.trim()
        ))
    }

    async fn synthesize(&self, _prompt: &str, sources: &[Source]) -> Result<String, LlmError> {
        if sources.is_empty() {
            return Ok("I couldn't find anything in the knowledge base about that.".into());
        }
        let lines: Vec<String> = sources
            .iter()
            .take(2)
            .map(|s| match &s.snippet {
                Some(snippet) => format!("According to **{}**: {snippet}", s.title),
                None => format!("See **{}**.", s.title),
            })
            .collect();
        Ok(format!("Based on the internal knowledge base:\n\n{}", lines.join("\n\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keywords_pick_the_pipeline() {
        assert_eq!(KeywordLlmEngine::classify("Show me the sales trend for the last 30 days"), Intent::Trend);
        assert_eq!(KeywordLlmEngine::classify("user distribution on a MAP"), Intent::Geo);
        assert_eq!(KeywordLlmEngine::classify("KPI overview"), Intent::Metrics);
        assert_eq!(KeywordLlmEngine::classify("What is the remote work policy?"), Intent::Rag);
        assert_eq!(KeywordLlmEngine::classify("search the handbook"), Intent::Rag);
        assert_eq!(KeywordLlmEngine::classify("請問請假規定"), Intent::Rag);
        assert_eq!(KeywordLlmEngine::classify("hello there"), Intent::General);
        assert_eq!(KeywordLlmEngine::classify("顯示銷售趨勢"), Intent::Trend);
    }

    #[tokio::test]
    async fn insight_names_the_leading_series() {
        let rows: Vec<Row> = [
            json!({"Date": "d1", "Product A": 1.0, "Product B": 5.0}),
            json!({"Date": "d2", "Product A": 2.0, "Product B": 7.0}),
        ]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();
        let insight = KeywordLlmEngine::new().generate_insight("line", &rows).await.unwrap();
        assert!(insight.contains("Product B"), "{insight}");
        assert!(insight.contains("6.0"), "{insight}");
    }

    #[tokio::test]
    async fn synthesis_quotes_the_top_sources() {
        let sources = vec![
            Source {
                title: "Remote Work Policy".into(),
                url: None,
                snippet: Some("...up to 3 days per week...".into()),
            },
            Source {
                title: "Handbook".into(),
                url: None,
                snippet: None,
            },
            Source {
                title: "Ignored".into(),
                url: None,
                snippet: None,
            },
        ];
        let engine = KeywordLlmEngine::new();
        let text = engine.synthesize("remote work?", &sources).await.unwrap();
        assert!(text.contains("**Remote Work Policy**: ...up to 3 days per week..."), "{text}");
        assert!(text.contains("See **Handbook**."), "{text}");
        assert!(!text.contains("Ignored"));
        let none = engine.synthesize("remote work?", &[]).await.unwrap();
        assert!(none.contains("couldn't find"));
    }
}
