use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use xchat_cache::{CacheLookup, CacheStats, QueryCache};
use xchat_chart::{generate_chart, ChartConfig, ChartError};
use xchat_infer::{InsightCache, LlmEngine};
use xchat_jobs::{InMemoryJobStore, JobError, JobStore};
use xchat_ledger::EventSink;
use xchat_store::{DataSource, GatewayError, Retriever};
use xchat_types::{ChatRequest, JobId, JobResult, JobStatus, QueryDescriptor, Row};

use crate::config::XchatConfig;
use crate::orchestrator::{Dispatcher, Kernel, PipelineSettings};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Chart(#[from] ChartError),
    #[error("invalid feedback: {0}")]
    InvalidFeedback(String),
    #[error("worker pool is not running")]
    WorkerPoolClosed,
}

/// Collaborators the service is wired with.
pub struct Components {
    pub source: Arc<dyn DataSource>,
    pub llm: Arc<dyn LlmEngine>,
    pub retriever: Arc<dyn Retriever>,
    pub sink: Arc<dyn EventSink>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChartRequest {
    pub chart_type: String,
    #[serde(default)]
    pub data: Vec<Row>,
    #[serde(default)]
    pub config: ChartConfig,
    #[serde(default)]
    pub include_insight: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChartResponse {
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Feedback {
    pub rating: u8,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default, skip_deserializing)]
    pub user_id: Option<String>,
}

/// Client-facing facade: submission, polling, direct data and chart calls.
pub struct ChatService {
    kernel: Arc<Kernel>,
    queue: mpsc::UnboundedSender<JobId>,
}

impl ChatService {
    /// Build the service and its dispatcher. The caller decides where the
    /// dispatcher runs; until it does, submitted jobs stay `PENDING`.
    pub fn new(components: Components, config: &XchatConfig) -> (Self, Dispatcher) {
        let jobs: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new(config.retention()));
        Self::with_job_store(components, jobs, config)
    }

    pub fn with_job_store(
        components: Components,
        jobs: Arc<dyn JobStore>,
        config: &XchatConfig,
    ) -> (Self, Dispatcher) {
        let kernel = Arc::new(Kernel {
            jobs,
            cache: Arc::new(QueryCache::new(components.source, config.cache_capacity)),
            llm: components.llm,
            retriever: components.retriever,
            insights: Arc::new(InsightCache::new(config.insight_cache_capacity)),
            sink: components.sink,
            settings: PipelineSettings {
                job_timeout: config.job_timeout(),
                fetch_attempts: config.fetch_attempts,
                fetch_backoff: config.fetch_backoff(),
                retrieval_top_k: config.retrieval_top_k,
            },
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(Arc::clone(&kernel), rx, config.max_concurrent_jobs);
        (Self { kernel, queue: tx }, dispatcher)
    }

    /// Build the service and spawn its dispatcher and retention janitor on
    /// the current runtime.
    pub fn spawn(components: Components, config: &XchatConfig) -> Arc<Self> {
        let (service, dispatcher) = Self::new(components, config);
        tokio::spawn(dispatcher.run());
        tokio::spawn(crate::janitor::run_janitor(
            Arc::clone(&service.kernel.jobs),
            config.purge_interval(),
        ));
        Arc::new(service)
    }

    /// Register the job and hand it to the worker pool. Returns as soon as
    /// the job is recorded.
    pub async fn submit(&self, request: ChatRequest) -> Result<JobId, ServiceError> {
        let chat_id = request.chat_id.clone();
        let user_id = request.user_id.clone();
        let prompt_chars = request.prompt.chars().count();
        let id = self.kernel.jobs.submit(request).await;
        self.kernel.sink.record(
            "job.submitted",
            json!({
                "request_id": id.to_string(),
                "chat_id": chat_id,
                "user_id": user_id,
                "prompt_chars": prompt_chars,
            }),
        );
        self.queue.send(id).map_err(|_| ServiceError::WorkerPoolClosed)?;
        tracing::info!(request_id = %id, "chat request submitted");
        Ok(id)
    }

    pub async fn status(&self, id: JobId) -> Result<JobStatus, ServiceError> {
        Ok(self.kernel.jobs.status(id).await?)
    }

    pub async fn result(&self, id: JobId) -> Result<Arc<JobResult>, ServiceError> {
        Ok(self.kernel.jobs.result(id).await?)
    }

    pub async fn fetch_data(&self, descriptor: &QueryDescriptor) -> Result<CacheLookup, ServiceError> {
        Ok(self.kernel.cache.get_or_fetch(descriptor).await?)
    }

    /// Pure chart rendering. The insight is best-effort and served from the
    /// insight cache when the same data was seen before.
    pub async fn generate_chart(&self, request: &ChartRequest) -> Result<ChartResponse, ServiceError> {
        let spec = generate_chart(&request.chart_type, &request.data, &request.config)?;
        let insight = if request.include_insight {
            match self
                .kernel
                .insights
                .get_or_generate(self.kernel.llm.as_ref(), &request.chart_type, &request.data)
                .await
            {
                Ok(text) => Some(text),
                Err(e) => {
                    tracing::warn!(error = %e, "chart insight unavailable");
                    None
                }
            }
        } else {
            None
        };
        Ok(ChartResponse { spec, insight })
    }

    pub fn record_feedback(&self, feedback: &Feedback) -> Result<(), ServiceError> {
        if !(1..=5).contains(&feedback.rating) {
            return Err(ServiceError::InvalidFeedback(format!(
                "rating must be between 1 and 5, got {}",
                feedback.rating
            )));
        }
        let payload = serde_json::to_value(feedback).map_err(|e| ServiceError::InvalidFeedback(e.to_string()))?;
        self.kernel.sink.record("feedback", payload);
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.kernel.cache.stats()
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.kernel.cache
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.kernel.jobs
    }
}
