//! Typed failures of the document pipeline and query path.
//!
//! Each variant knows whether it is worth retrying. Transient failures
//! (timeouts, unavailable services, storage hiccups) are retried by the
//! worker with backoff; structural ones fail the document immediately.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("extraction failed: {0}")]
    ExtractionFailure(String),

    #[error("extraction timed out after {0}s")]
    ExtractionTimeout(u64),

    #[error("redaction unavailable: {0}")]
    RedactionUnavailable(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailure(String),

    #[error("embeddings are disabled (embedding.provider = \"disabled\")")]
    EmbeddingsDisabled,

    #[error("index write failed: {0}")]
    IndexWriteFailure(String),

    #[error("index still holds {remaining} entries for deleted document {document_id}")]
    IndexDeleteInconsistency {
        document_id: String,
        remaining: usize,
    },

    #[error("retrieval timed out after {0}s")]
    RetrievalTimeout(u64),

    #[error("retrieval failed: {0}")]
    RetrievalFailure(String),

    #[error("generation failed: {0}")]
    GenerationFailure(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("file is {size} bytes, the limit is {limit}")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("{0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether a later attempt of the same job can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::ExtractionTimeout(_)
                | PipelineError::RedactionUnavailable(_)
                | PipelineError::EmbeddingFailure(_)
                | PipelineError::IndexWriteFailure(_)
                | PipelineError::RetrievalTimeout(_)
                | PipelineError::RetrievalFailure(_)
                | PipelineError::GenerationFailure(_)
                | PipelineError::Storage(_)
        )
    }

    /// Pipeline stage the failure belongs to, if it is stage-specific.
    /// Storage and lookup failures return `None`; callers then record the
    /// stage the document was in.
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            PipelineError::UnsupportedFormat(_)
            | PipelineError::ExtractionFailure(_)
            | PipelineError::ExtractionTimeout(_) => Some("extracting"),
            PipelineError::RedactionUnavailable(_) => Some("redacting"),
            PipelineError::EmbeddingFailure(_)
            | PipelineError::EmbeddingsDisabled
            | PipelineError::IndexWriteFailure(_) => Some("embedding"),
            PipelineError::IndexDeleteInconsistency { .. } => Some("deleting"),
            PipelineError::RetrievalTimeout(_) | PipelineError::RetrievalFailure(_) => Some("retrieval"),
            PipelineError::GenerationFailure(_) => Some("generation"),
            PipelineError::NotFound(_)
            | PipelineError::Conflict(_)
            | PipelineError::InvalidInput(_)
            | PipelineError::PayloadTooLarge { .. }
            | PipelineError::Storage(_)
            | PipelineError::Internal(_) => None,
        }
    }

    /// Machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::UnsupportedFormat(_) => "unsupported_format",
            PipelineError::ExtractionFailure(_) => "extraction_failure",
            PipelineError::ExtractionTimeout(_) => "extraction_timeout",
            PipelineError::RedactionUnavailable(_) => "redaction_unavailable",
            PipelineError::EmbeddingFailure(_) => "embedding_failure",
            PipelineError::EmbeddingsDisabled => "embeddings_disabled",
            PipelineError::IndexWriteFailure(_) => "index_write_failure",
            PipelineError::IndexDeleteInconsistency { .. } => "index_delete_inconsistency",
            PipelineError::RetrievalTimeout(_) => "retrieval_timeout",
            PipelineError::RetrievalFailure(_) => "retrieval_failure",
            PipelineError::GenerationFailure(_) => "generation_failure",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Conflict(_) => "conflict",
            PipelineError::InvalidInput(_) => "bad_request",
            PipelineError::PayloadTooLarge { .. } => "payload_too_large",
            PipelineError::Storage(_) => "storage_error",
            PipelineError::Internal(_) => "internal_error",
        }
    }
}

impl From<crate::extract::ExtractError> for PipelineError {
    fn from(e: crate::extract::ExtractError) -> Self {
        use crate::extract::ExtractError;
        match e {
            ExtractError::UnsupportedContentType(ct) => PipelineError::UnsupportedFormat(ct),
            ExtractError::Timeout(secs) => PipelineError::ExtractionTimeout(secs),
            other => PipelineError::ExtractionFailure(other.to_string()),
        }
    }
}

/// Store helpers return `anyhow`; database failures keep their type so
/// they stay retryable.
impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<sqlx::Error>() {
            Ok(db) => PipelineError::Storage(db),
            Err(other) => PipelineError::Internal(format!("{:#}", other)),
        }
    }
}

impl From<crate::redact::RedactError> for PipelineError {
    fn from(e: crate::redact::RedactError) -> Self {
        PipelineError::RedactionUnavailable(e.to_string())
    }
}
