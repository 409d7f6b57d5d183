use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Row;

/// Render-ready unit of a chat answer.
///
/// Blocks are only produced once a job is terminal and never change after
/// that. Unknown `type` tags deserialize into [`Block::Unknown`] so older
/// consumers can skip blocks added later.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        content: String,
    },
    Plotly {
        spec: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        insight: Option<String>,
    },
    Map {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        data: Vec<Row>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        insight: Option<String>,
    },
    Metric {
        metrics: Vec<Metric>,
    },
    Reference {
        sources: Vec<Source>,
    },
    #[serde(other)]
    Unknown,
}

impl Block {
    pub fn text(content: impl Into<String>) -> Self {
        Block::Text {
            content: content.into(),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Block::Unknown)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub label: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}
