use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Block, TraceEvent};

/// Opaque, globally unique request identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Body of a chat submission.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    /// Supplied by the session layer, never by the client body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub progress_label: Option<String>,
}

/// Why a job ended in `FAILED`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum FailureCause {
    Timeout,
    SourceUnavailable { message: String },
    InvalidDescriptor { message: String },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Timeout => f.write_str("the request exceeded its execution time limit"),
            FailureCause::SourceUnavailable { message } => {
                write!(f, "the data source is unavailable: {message}")
            }
            FailureCause::InvalidDescriptor { message } => {
                write!(f, "the data query was rejected: {message}")
            }
        }
    }
}

/// Terminal payload of a job. Stored once and returned unchanged on every
/// subsequent read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub blocks: Vec<Block>,
    pub trace: Vec<TraceEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureCause>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_names_are_upper_case_on_the_wire() {
        let s = JobStatus {
            state: JobState::Running,
            progress_label: Some("Fetching data".into()),
        };
        assert_eq!(
            serde_json::to_value(&s).unwrap(),
            json!({"state": "RUNNING", "progress_label": "Fetching data"})
        );
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Pending.is_terminal());
    }

    #[test]
    fn timeout_cause_is_tagged_by_kind() {
        assert_eq!(
            serde_json::to_value(FailureCause::Timeout).unwrap(),
            json!({"kind": "Timeout"})
        );
    }

    #[test]
    fn only_the_three_failure_kinds_exist() {
        for kind in ["SourceUnavailable", "InvalidDescriptor"] {
            let cause: FailureCause = serde_json::from_value(json!({"kind": kind, "message": "m"})).unwrap();
            assert!(cause.to_string().ends_with(": m"), "{cause}");
        }
        assert!(serde_json::from_value::<FailureCause>(json!({"kind": "Pipeline", "message": "m"})).is_err());
    }

    #[test]
    fn job_id_parses_from_path_segment() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }
}
