use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use xchat_types::{
    Block, ChatRequest, FailureCause, JobId, JobResult, JobState, JobStatus, TraceEvent,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} is not ready ({state:?})")]
    NotReady { id: JobId, state: JobState },
    #[error("job {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },
}

/// Legal lifecycle edges. Terminal states have none.
pub fn can_transition(from: JobState, to: JobState) -> bool {
    matches!(
        (from, to),
        (JobState::Pending, JobState::Running)
            | (JobState::Running, JobState::Succeeded)
            | (JobState::Running, JobState::Failed)
    )
}

/// Lifecycle record of one chat request.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub request: ChatRequest,
    pub progress_label: Option<String>,
    pub trace: Vec<TraceEvent>,
    pub result: Option<Arc<JobResult>>,
    terminal_at: Option<Instant>,
}

impl Job {
    fn new(request: ChatRequest) -> Self {
        Self {
            id: JobId::new(),
            state: JobState::Pending,
            submitted_at: Utc::now(),
            request,
            progress_label: None,
            trace: Vec::new(),
            result: None,
            terminal_at: None,
        }
    }

    fn transition(&mut self, to: JobState) -> Result<(), JobError> {
        if !can_transition(self.state, to) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        if to.is_terminal() {
            self.terminal_at = Some(Instant::now());
        }
        Ok(())
    }

    fn require_running(&self, attempted: JobState) -> Result<(), JobError> {
        if self.state != JobState::Running {
            return Err(JobError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: attempted,
            });
        }
        Ok(())
    }
}

/// Single source of truth for job lifecycle state.
///
/// Clients only reach `submit`, `status` and `result`. The remaining
/// operations are the orchestrator's transitions; each one is checked against
/// [`can_transition`].
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn submit(&self, request: ChatRequest) -> JobId;
    async fn status(&self, id: JobId) -> Result<JobStatus, JobError>;
    async fn result(&self, id: JobId) -> Result<Arc<JobResult>, JobError>;

    /// PENDING → RUNNING. Returns the request payload to execute.
    async fn claim(&self, id: JobId) -> Result<ChatRequest, JobError>;
    async fn set_progress(&self, id: JobId, label: String) -> Result<(), JobError>;
    async fn append_trace(&self, id: JobId, event: TraceEvent) -> Result<(), JobError>;
    /// RUNNING → SUCCEEDED with the final blocks and the accumulated trace.
    async fn succeed(&self, id: JobId, blocks: Vec<Block>) -> Result<Arc<JobResult>, JobError>;
    /// RUNNING → FAILED. The stored result always carries a text block
    /// explaining the failure.
    async fn fail(&self, id: JobId, cause: FailureCause) -> Result<Arc<JobResult>, JobError>;

    /// Remove terminal jobs older than the retention window. Returns how
    /// many were purged.
    async fn purge_expired(&self) -> usize;
}

pub struct InMemoryJobStore {
    retention: Duration,
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Snapshot of one job (debug hook).
    pub async fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.lock().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn failure_block(cause: &FailureCause) -> Block {
    Block::text(format!(
        "Sorry, I couldn't complete this request: {cause}. Please try again."
    ))
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn submit(&self, request: ChatRequest) -> JobId {
        let job = Job::new(request);
        let id = job.id;
        self.jobs.lock().await.insert(id, job);
        tracing::debug!(request_id = %id, "job submitted");
        id
    }

    async fn status(&self, id: JobId) -> Result<JobStatus, JobError> {
        let jobs = self.jobs.lock().await;
        let job = jobs.get(&id).ok_or(JobError::NotFound(id))?;
        Ok(JobStatus {
            state: job.state,
            progress_label: job.progress_label.clone(),
        })
    }

    async fn result(&self, id: JobId) -> Result<Arc<JobResult>, JobError> {
        let jobs = self.jobs.lock().await;
        let job = jobs.get(&id).ok_or(JobError::NotFound(id))?;
        match &job.result {
            Some(result) if job.state.is_terminal() => Ok(Arc::clone(result)),
            _ => Err(JobError::NotReady {
                id,
                state: job.state,
            }),
        }
    }

    async fn claim(&self, id: JobId) -> Result<ChatRequest, JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        job.transition(JobState::Running)?;
        tracing::debug!(request_id = %id, "job claimed");
        Ok(job.request.clone())
    }

    async fn set_progress(&self, id: JobId, label: String) -> Result<(), JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        job.require_running(JobState::Running)?;
        job.progress_label = Some(label);
        Ok(())
    }

    async fn append_trace(&self, id: JobId, event: TraceEvent) -> Result<(), JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        job.require_running(JobState::Running)?;
        job.trace.push(event);
        Ok(())
    }

    async fn succeed(&self, id: JobId, blocks: Vec<Block>) -> Result<Arc<JobResult>, JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        job.transition(JobState::Succeeded)?;
        let result = Arc::new(JobResult {
            blocks,
            trace: job.trace.clone(),
            error: None,
        });
        job.result = Some(Arc::clone(&result));
        job.progress_label = Some("Done".into());
        tracing::info!(request_id = %id, steps = job.trace.len(), "job succeeded");
        Ok(result)
    }

    async fn fail(&self, id: JobId, cause: FailureCause) -> Result<Arc<JobResult>, JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        job.transition(JobState::Failed)?;
        let result = Arc::new(JobResult {
            blocks: vec![failure_block(&cause)],
            trace: job.trace.clone(),
            error: Some(cause),
        });
        job.result = Some(Arc::clone(&result));
        job.progress_label = Some("Failed".into());
        tracing::warn!(request_id = %id, cause = ?result.error, "job failed");
        Ok(result)
    }

    async fn purge_expired(&self) -> usize {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        let retention = self.retention;
        jobs.retain(|_, job| match job.terminal_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
        let purged = before - jobs.len();
        if purged > 0 {
            tracing::debug!(purged, "expired jobs purged");
        }
        purged
    }
}
