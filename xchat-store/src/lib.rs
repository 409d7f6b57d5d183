use async_trait::async_trait;
use thiserror::Error;
use xchat_types::{FreshnessToken, QueryDescriptor, Row};

pub mod docs;
pub use docs::{demo_corpus, Document, InMemoryRetriever, NullRetriever, Retriever};

pub mod eval;

pub mod memory;
pub use memory::InMemoryDataSource;

pub mod seed;
pub use seed::demo_source;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Transient; the caller may retry with backoff.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// Permanent; the descriptor must be corrected.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::SourceUnavailable(_))
    }
}

/// The data source gateway: the only path that reads the backing store.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Apply filters, group-by, aggregation and the pagination window, and
    /// return the materialized rows.
    async fn fetch(&self, descriptor: &QueryDescriptor) -> Result<Vec<Row>, GatewayError>;

    /// Current watermark of `source`. Must be far cheaper than `fetch`; it is
    /// read on every cache lookup.
    async fn freshness_token(&self, source: &str) -> Result<FreshnessToken, GatewayError>;
}

/// Stub gateway for wiring without a backing store.
pub struct NullDataSource;

#[async_trait]
impl DataSource for NullDataSource {
    async fn fetch(&self, _descriptor: &QueryDescriptor) -> Result<Vec<Row>, GatewayError> {
        Err(GatewayError::SourceUnavailable(
            "NullDataSource has no backing store".into(),
        ))
    }

    async fn freshness_token(&self, _source: &str) -> Result<FreshnessToken, GatewayError> {
        Err(GatewayError::SourceUnavailable(
            "NullDataSource has no backing store".into(),
        ))
    }
}
