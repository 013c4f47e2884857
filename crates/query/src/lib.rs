//! Chatforge query core
//!
//! Classify, retrieve, compose, generate: the tenant-scoped RAG pipeline
//! with answer caching, bounded concurrency and query metrics.

pub mod classify;
pub mod metrics;
pub mod prompt;
pub mod service;

pub use classify::{classify, Route};
pub use metrics::{MetricsSnapshot, QueryMetrics};
pub use service::{
    HistoryMessage, QueryAnswer, QueryOptions, QueryService, ScoredDocument, SourceRef,
    StreamChunk,
};
