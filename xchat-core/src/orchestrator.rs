use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use xchat_cache::{CacheLookup, QueryCache};
use xchat_chart::generate_chart;
use xchat_infer::{InsightCache, Intent, LlmEngine};
use xchat_jobs::JobStore;
use xchat_ledger::EventSink;
use xchat_store::{GatewayError, Retriever};
use xchat_types::{
    Block, ChatRequest, FailureCause, JobId, Metric, QueryDescriptor, Row, Source, TraceEvent, TraceKind,
};

use crate::plan::{plan_for, DataPlan, Render};

/// Execution knobs of one pipeline run.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub job_timeout: Duration,
    pub fetch_attempts: u32,
    pub fetch_backoff: Duration,
    /// Documents handed to answer synthesis.
    pub retrieval_top_k: usize,
}

/// Everything a running job may touch.
pub struct Kernel {
    pub jobs: Arc<dyn JobStore>,
    pub cache: Arc<QueryCache>,
    pub llm: Arc<dyn LlmEngine>,
    pub retriever: Arc<dyn Retriever>,
    pub insights: Arc<InsightCache>,
    pub sink: Arc<dyn EventSink>,
    pub settings: PipelineSettings,
}

/// Pulls submitted job ids off the queue and runs each on its own task,
/// at most `max_concurrent_jobs` at a time. Jobs waiting for a permit stay
/// `PENDING`.
pub struct Dispatcher {
    kernel: Arc<Kernel>,
    rx: mpsc::UnboundedReceiver<JobId>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub(crate) fn new(kernel: Arc<Kernel>, rx: mpsc::UnboundedReceiver<JobId>, max_concurrent: usize) -> Self {
        Self {
            kernel,
            rx,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Runs until every `ChatService` handle is dropped.
    pub async fn run(mut self) {
        while let Some(id) = self.rx.recv().await {
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let kernel = Arc::clone(&self.kernel);
            tokio::spawn(async move {
                let _permit = permit;
                execute(&kernel, id).await;
            });
        }
        tracing::debug!("dispatcher stopped");
    }
}

/// Step currently executing, so a timeout can name it in the trace.
struct InFlight {
    kind: TraceKind,
    label: &'static str,
    started: Instant,
}

struct JobContext<'a> {
    kernel: &'a Kernel,
    id: JobId,
    current: Mutex<Option<InFlight>>,
}

impl<'a> JobContext<'a> {
    async fn progress(&self, label: &str) {
        if let Err(e) = self.kernel.jobs.set_progress(self.id, label.to_string()).await {
            tracing::warn!(request_id = %self.id, error = %e, "progress update rejected");
        }
    }

    fn begin(&self, kind: TraceKind, label: &'static str) -> Instant {
        let started = Instant::now();
        if let Ok(mut cur) = self.current.lock() {
            *cur = Some(InFlight { kind, label, started });
        }
        started
    }

    fn take_in_flight(&self) -> Option<InFlight> {
        self.current.lock().ok().and_then(|mut cur| cur.take())
    }

    async fn finish(&self, kind: TraceKind, label: &'static str, started: Instant, detail: Option<String>) {
        self.take_in_flight();
        let mut event = TraceEvent::new(kind, label).with_duration_ms(elapsed_ms(started));
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        tracing::debug!(request_id = %self.id, step = label, duration_ms = ?event.duration_ms, "step finished");
        if let Err(e) = self.kernel.jobs.append_trace(self.id, event).await {
            tracing::warn!(request_id = %self.id, error = %e, "trace append rejected");
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// Claim a job, run its pipeline under the job timeout and store the
/// terminal result.
pub(crate) async fn execute(kernel: &Kernel, id: JobId) {
    let request = match kernel.jobs.claim(id).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(request_id = %id, error = %e, "job could not be claimed");
            return;
        }
    };

    let ctx = JobContext {
        kernel,
        id,
        current: Mutex::new(None),
    };
    let started = Instant::now();
    let outcome = tokio::time::timeout(kernel.settings.job_timeout, run_pipeline(&ctx, &request)).await;

    let stored = match outcome {
        Ok(Ok(blocks)) => kernel.jobs.succeed(id, blocks).await,
        Ok(Err(cause)) => kernel.jobs.fail(id, cause).await,
        Err(_) => {
            let (kind, label, step_started) = match ctx.take_in_flight() {
                Some(f) => (f.kind, f.label, f.started),
                None => (TraceKind::SubAgent, "Orchestrator", started),
            };
            let event = TraceEvent::new(kind, label)
                .with_duration_ms(elapsed_ms(step_started))
                .with_detail(format!(
                    "timed out after {}s",
                    kernel.settings.job_timeout.as_secs_f64()
                ));
            if let Err(e) = kernel.jobs.append_trace(id, event).await {
                tracing::warn!(request_id = %id, error = %e, "trace append rejected");
            }
            kernel.jobs.fail(id, FailureCause::Timeout).await
        }
    };

    match stored {
        Ok(result) => {
            let (kind, payload) = match &result.error {
                None => (
                    "job.succeeded",
                    json!({
                        "request_id": id.to_string(),
                        "duration_ms": elapsed_ms(started),
                        "blocks": result.blocks.len(),
                    }),
                ),
                Some(cause) => (
                    "job.failed",
                    json!({
                        "request_id": id.to_string(),
                        "duration_ms": elapsed_ms(started),
                        "cause": cause,
                    }),
                ),
            };
            kernel.sink.record(kind, payload);
        }
        Err(e) => tracing::error!(request_id = %id, error = %e, "terminal transition rejected"),
    }
}

async fn run_pipeline(ctx: &JobContext<'_>, request: &ChatRequest) -> Result<Vec<Block>, FailureCause> {
    let intent = detect_intent(ctx, request).await;
    if intent == Intent::Rag {
        return run_rag(ctx, request).await;
    }
    match plan_for(intent) {
        Some(plan) => run_data_plan(ctx, &plan).await,
        None => Ok(run_general(ctx, request).await),
    }
}

fn failure_cause(e: GatewayError) -> FailureCause {
    match e {
        GatewayError::SourceUnavailable(message) => FailureCause::SourceUnavailable { message },
        GatewayError::InvalidDescriptor(message) => FailureCause::InvalidDescriptor { message },
    }
}

async fn detect_intent(ctx: &JobContext<'_>, request: &ChatRequest) -> Intent {
    ctx.progress("Understanding your question...").await;
    let t = ctx.begin(TraceKind::LlmCall, "Intent detection");
    match ctx.kernel.llm.detect_intent(&request.prompt, &request.history).await {
        Ok(intent) => {
            ctx.finish(TraceKind::LlmCall, "Intent detection", t, Some(format!("intent: {intent}")))
                .await;
            intent
        }
        Err(e) => {
            ctx.finish(
                TraceKind::LlmCall,
                "Intent detection",
                t,
                Some(format!("failed: {e}; falling back to general")),
            )
            .await;
            Intent::General
        }
    }
}

async fn run_general(ctx: &JobContext<'_>, request: &ChatRequest) -> Vec<Block> {
    ctx.progress("Routing to general-answer sub-agent").await;
    let t = ctx.begin(TraceKind::SubAgent, "General-answer sub-agent");
    let (text, detail) = match ctx.kernel.llm.answer(&request.prompt, &request.history).await {
        Ok(answer) => (answer, None),
        Err(e) => (
            "I can't answer that right now. Try asking about sales trends, user distribution or product metrics."
                .to_string(),
            Some(format!("failed: {e}")),
        ),
    };
    ctx.finish(TraceKind::SubAgent, "General-answer sub-agent", t, detail).await;
    vec![Block::text(text)]
}

/// Answer from the document index. A retrieval error fails the job, a
/// synthesis error falls back to listing the document titles.
async fn run_rag(ctx: &JobContext<'_>, request: &ChatRequest) -> Result<Vec<Block>, FailureCause> {
    ctx.progress("Embedding query and searching Vector DB...").await;
    let t = ctx.begin(TraceKind::ToolCall, "vector_search()");
    let sources = match ctx
        .kernel
        .retriever
        .search(&request.prompt, ctx.kernel.settings.retrieval_top_k)
        .await
    {
        Ok(sources) => {
            let detail = format!("Found {} relevant chunks", sources.len());
            ctx.finish(TraceKind::ToolCall, "vector_search()", t, Some(detail)).await;
            sources
        }
        Err(e) => {
            ctx.finish(TraceKind::ToolCall, "vector_search()", t, Some(format!("failed: {e}"))).await;
            return Err(failure_cause(e));
        }
    };
    if sources.is_empty() {
        return Ok(vec![Block::text(
            "I couldn't find any documents about that. Try naming the policy or handbook section.",
        )]);
    }

    ctx.progress("Synthesizing answer from sources...").await;
    let t = ctx.begin(TraceKind::LlmCall, "Answer synthesis");
    let text = match ctx.kernel.llm.synthesize(&request.prompt, &sources).await {
        Ok(text) => {
            let detail = "Generated using retrieved context".to_string();
            ctx.finish(TraceKind::LlmCall, "Answer synthesis", t, Some(detail)).await;
            text
        }
        Err(e) => {
            ctx.finish(TraceKind::LlmCall, "Answer synthesis", t, Some(format!("failed: {e}"))).await;
            unsynthesized(&sources)
        }
    };
    Ok(vec![Block::text(text), Block::Reference { sources }])
}

fn unsynthesized(sources: &[Source]) -> String {
    let titles: Vec<&str> = sources.iter().map(|s| s.title.as_str()).collect();
    format!(
        "I couldn't summarize the documents right now. The most relevant ones are: {}.",
        titles.join(", ")
    )
}

async fn run_data_plan(ctx: &JobContext<'_>, plan: &DataPlan) -> Result<Vec<Block>, FailureCause> {
    ctx.progress("Fetching data from Cache/DB [POST /v1/data/fetch]...").await;
    let t = ctx.begin(TraceKind::Query, "fetch_data()");
    let lookup = match fetch_with_retry(ctx, &plan.descriptor).await {
        Ok((lookup, attempts)) => {
            let mut detail = format!(
                "{}: {} rows ({})",
                plan.descriptor.raw_data_source,
                lookup.rows.len(),
                if lookup.from_cache { "cache hit" } else { "fetched" }
            );
            if attempts > 1 {
                detail.push_str(&format!(" after {attempts} attempts"));
            }
            if lookup.rows.is_empty() {
                detail.push_str("; query returned no rows");
            }
            ctx.finish(TraceKind::Query, "fetch_data()", t, Some(detail)).await;
            lookup
        }
        Err(e) => {
            ctx.finish(TraceKind::Query, "fetch_data()", t, Some(format!("failed: {e}"))).await;
            return Err(failure_cause(e));
        }
    };

    let rows = lookup.rows.as_slice();
    ctx.progress(plan.render_label()).await;
    let mut blocks = vec![Block::text(summary(plan, rows))];
    let mut rendered = match &plan.render {
        Render::Chart { chart_type, config } => {
            let t = ctx.begin(TraceKind::ToolCall, "generate_universal_chart()");
            match generate_chart(chart_type, rows, config) {
                Ok(spec) => {
                    ctx.finish(TraceKind::ToolCall, "generate_universal_chart()", t, None).await;
                    Block::Plotly { spec, insight: None }
                }
                Err(e) => {
                    ctx.finish(
                        TraceKind::ToolCall,
                        "generate_universal_chart()",
                        t,
                        Some(format!("failed: {e}")),
                    )
                    .await;
                    blocks.push(Block::text(format!("The chart could not be rendered: {e}.")));
                    return Ok(blocks);
                }
            }
        }
        Render::Map { title } => Block::Map {
            title: Some(title.clone()),
            data: rows.to_vec(),
            insight: None,
        },
        Render::Metrics => Block::Metric {
            metrics: metrics(rows),
        },
    };
    if let Some(kind) = plan.insight_kind() {
        let text = request_insight(ctx, kind, rows, plan.insight_label()).await;
        if let Block::Plotly { insight, .. } | Block::Map { insight, .. } = &mut rendered {
            *insight = text;
        }
    }
    blocks.push(rendered);
    Ok(blocks)
}

/// Cache lookup with bounded exponential backoff on transient failures.
async fn fetch_with_retry(
    ctx: &JobContext<'_>,
    descriptor: &QueryDescriptor,
) -> Result<(CacheLookup, u32), GatewayError> {
    let settings = &ctx.kernel.settings;
    let attempts = settings.fetch_attempts.max(1);
    let mut backoff = settings.fetch_backoff;
    let mut attempt = 1;
    loop {
        match ctx.kernel.cache.get_or_fetch(descriptor).await {
            Ok(lookup) => return Ok((lookup, attempt)),
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::warn!(request_id = %ctx.id, attempt, error = %e, "fetch failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Insight for the rendered rows. Failures are recorded in the trace and
/// leave the block without an insight.
async fn request_insight(ctx: &JobContext<'_>, kind: &str, rows: &[Row], label: &str) -> Option<String> {
    ctx.progress(label).await;
    let t = ctx.begin(TraceKind::LlmCall, "generate_chart_insight()");
    match ctx
        .kernel
        .insights
        .get_or_generate(ctx.kernel.llm.as_ref(), kind, rows)
        .await
    {
        Ok(text) => {
            ctx.finish(TraceKind::LlmCall, "generate_chart_insight()", t, None).await;
            Some(text)
        }
        Err(e) => {
            ctx.finish(
                TraceKind::LlmCall,
                "generate_chart_insight()",
                t,
                Some(format!("failed: {e}")),
            )
            .await;
            None
        }
    }
}

fn summary(plan: &DataPlan, rows: &[Row]) -> String {
    if rows.is_empty() {
        return "No data matched this query.".into();
    }
    match plan.intent {
        Intent::Trend => format!("Here is the sales trend across {} days of data.", rows.len()),
        Intent::Geo => format!("Here is where your users are, based on {} locations.", rows.len()),
        Intent::Metrics => "Here are the average daily sales per product.".into(),
        Intent::Rag | Intent::General => String::new(),
    }
}

fn metrics(rows: &[Row]) -> Vec<Metric> {
    let Some(row) = rows.first() else {
        return Vec::new();
    };
    row.iter()
        .map(|(column, value)| Metric {
            label: format!("Avg {column}"),
            value: match value {
                Value::Number(n) => n.as_f64().map(|f| format!("{f:.1}")).unwrap_or_else(|| n.to_string()),
                Value::Null => "n/a".into(),
                other => other.to_string(),
            },
            delta: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metrics_are_formatted_from_the_aggregate_row() {
        let row = json!({"Product A": 60.04, "Product B": null}).as_object().cloned().unwrap();
        let m = metrics(&[row]);
        assert_eq!(m[0].label, "Avg Product A");
        assert_eq!(m[0].value, "60.0");
        assert_eq!(m[1].value, "n/a");
        assert!(metrics(&[]).is_empty());
    }
}
