//! Ingestion service error types

use chatforge_common::errors::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Invalid tenant id: {0}")]
    InvalidTenant(String),

    #[error("Unsupported format: {extension}")]
    UnsupportedFormat { extension: String },

    #[error("File too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: usize, limit: usize },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Parse error for {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Media gateway error: {0}")]
    MediaError(String),

    #[error("Embedding error: {0}")]
    EmbeddingError(String),

    #[error("Vector store error: {0}")]
    StoreError(String),

    #[error("Indexing job timed out after {0} seconds")]
    JobTimeout(u64),

    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    #[error("Chunk cache error: {0}")]
    CacheError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<AppError> for IngestionError {
    fn from(e: AppError) -> Self {
        match e {
            AppError::InvalidTenant { tenant } => IngestionError::InvalidTenant(tenant),
            AppError::Embedding { message } => IngestionError::EmbeddingError(message),
            AppError::VectorStore { message } => IngestionError::StoreError(message),
            other => IngestionError::StoreError(other.to_string()),
        }
    }
}

impl From<IngestionError> for AppError {
    fn from(e: IngestionError) -> Self {
        match e {
            IngestionError::InvalidTenant(tenant) => AppError::InvalidTenant { tenant },
            IngestionError::UnsupportedFormat { extension } => {
                AppError::UnsupportedFormat { extension }
            }
            IngestionError::FileTooLarge { size, limit } => {
                AppError::PayloadTooLarge { size, limit }
            }
            IngestionError::FileNotFound(path) => AppError::DocumentNotFound { id: path },
            IngestionError::ParseError { path, message } => AppError::Validation {
                message: format!("{path}: {message}"),
                field: Some("file".to_string()),
            },
            IngestionError::EmbeddingError(message) => AppError::Embedding { message },
            IngestionError::StoreError(message) => AppError::VectorStore { message },
            IngestionError::MediaError(message) => AppError::Llm { message },
            IngestionError::JobTimeout(secs) => AppError::Timeout {
                operation: "index_document".to_string(),
                timeout_ms: secs * 1000,
            },
            IngestionError::ConfirmationRequired(message) => {
                AppError::ConfirmationRequired { message }
            }
            IngestionError::CacheError(message) => AppError::Internal { message },
            IngestionError::IoError(err) => AppError::Internal {
                message: err.to_string(),
            },
        }
    }
}
