//! Value types shared by every plane of the kernel.
//!
//! Nothing in here performs I/O; the types are the wire vocabulary of the
//! data plane (`QueryDescriptor`, `Row`), the job plane (`JobState`,
//! `TraceEvent`) and the render plane (`Block`).

pub mod block;
pub use block::{Block, Metric, Source};

pub mod job;
pub use job::{ChatMessage, ChatRequest, FailureCause, JobId, JobResult, JobState, JobStatus};

pub mod query;
pub use query::{
    AggOp, CacheKey, CanonicalQuery, Filter, FilterOp, FreshnessToken, QueryDescriptor, Row,
};

pub mod trace;
pub use trace::{TraceEvent, TraceKind};
