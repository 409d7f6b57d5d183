//! The X-chat kernel: wires the query cache, job store, LLM engine, document
//! retriever and telemetry sink together behind [`ChatService`].
//!
//! Submission never executes work. Jobs are queued to the [`Dispatcher`],
//! which runs each pipeline on its own task under the configured timeout.

pub mod config;
pub mod janitor;
pub mod orchestrator;
pub mod plan;
pub mod service;

pub use config::{ConfigError, LlmConfig, XchatConfig};
pub use janitor::run_janitor;
pub use orchestrator::{Dispatcher, Kernel, PipelineSettings};
pub use service::{ChartRequest, ChartResponse, ChatService, Components, Feedback, ServiceError};
