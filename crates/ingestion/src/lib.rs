//! Chatforge ingestion core
//!
//! Batched, deduplicated, chunked, embedded, tenant-isolated indexing into
//! the vector store, with an on-disk chunk cache and bounded concurrency.

pub mod admin;
pub mod chunk_cache;
pub mod chunker;
pub mod errors;
pub mod loader;
pub mod media;
pub mod pipeline;

pub use admin::TenantAdmin;
pub use chunker::{split_text, ChunkerConfig, TextChunk};
pub use errors::IngestionError;
pub use loader::{load_document, LoadedRecord, Modality};
pub use pipeline::{FileResult, IndexOutcome, IndexService, ProgressEvent, ProgressSink, ProgressStage};
