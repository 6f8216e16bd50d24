//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait stores [`IndexEntry`]s keyed by chunk id and
//! answers nearest-neighbour queries by cosine similarity. Backends:
//!
//! | `index.provider` | Backend |
//! |------------------|---------|
//! | `sqlite` | [`SqliteIndex`]: BLOB vectors in the shared database, brute-force scan |
//! | `memory` | [`MemoryIndex`]: process-local, for tests and throwaway runs |
//! | `pinecone` | [`PineconeIndex`]: hosted index over its REST data plane |
//!
//! Every backend ranks hits by score, then by newer `indexed_at`, then by
//! chunk id, so equal scores resolve the same way everywhere.

pub mod memory;
pub mod pinecone;
pub mod sqlite;

pub use memory::MemoryIndex;
pub use pinecone::PineconeIndex;
pub use sqlite::SqliteIndex;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;

use crate::config::IndexConfig;
use crate::error::PipelineError;
use crate::models::{IndexEntry, IndexHit};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("vector has {got} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("index backend error: {0}")]
    Backend(String),
    #[error("index storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl From<IndexError> for PipelineError {
    fn from(e: IndexError) -> Self {
        PipelineError::IndexWriteFailure(e.to_string())
    }
}

/// Restricts queries and counts. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexFilter {
    pub document_ids: Option<Vec<String>>,
    pub chunk_ids: Option<Vec<String>>,
    pub owner: Option<String>,
    /// Documents to leave out, applied after the fields above.
    pub exclude_document_ids: Option<Vec<String>>,
}

impl IndexFilter {
    pub fn documents(ids: Vec<String>) -> Self {
        Self {
            document_ids: Some(ids),
            ..Self::default()
        }
    }

    pub fn chunks(ids: Vec<String>) -> Self {
        Self {
            chunk_ids: Some(ids),
            ..Self::default()
        }
    }

    pub fn matches(&self, chunk_id: &str, document_id: &str, owner: Option<&str>) -> bool {
        if let Some(ids) = &self.document_ids {
            if !ids.iter().any(|id| id == document_id) {
                return false;
            }
        }
        if let Some(ids) = &self.chunk_ids {
            if !ids.iter().any(|id| id == chunk_id) {
                return false;
            }
        }
        if let Some(wanted) = &self.owner {
            if owner != Some(wanted.as_str()) {
                return false;
            }
        }
        if let Some(ids) = &self.exclude_document_ids {
            if ids.iter().any(|id| id == document_id) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexHealth {
    pub backend: String,
    pub healthy: bool,
    pub dimension: usize,
    pub entries: Option<usize>,
    pub detail: Option<String>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &str;

    /// Dimension every stored and queried vector must have.
    fn dimension(&self) -> usize;

    /// Inserts or replaces entries by chunk id. Returns the number written.
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<usize, IndexError>;

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexHit>, IndexError>;

    async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<(), IndexError>;

    /// Removes every entry of a document. Backends that can delete by
    /// document id override this; the default deletes the known chunk ids.
    async fn delete_document(&self, _document_id: &str, chunk_ids: &[String]) -> Result<(), IndexError> {
        self.delete_chunks(chunk_ids).await
    }

    async fn count(&self, filter: &IndexFilter) -> Result<usize, IndexError>;

    /// Dimension of vectors already persisted by the backend, if it keeps
    /// any and can tell.
    async fn stored_dimension(&self) -> Result<Option<usize>, IndexError> {
        Ok(None)
    }

    async fn health(&self) -> IndexHealth;
}

pub(crate) fn check_dimension(expected: usize, vector: &[f32]) -> Result<(), IndexError> {
    if vector.len() != expected {
        return Err(IndexError::DimensionMismatch {
            expected,
            got: vector.len(),
        });
    }
    Ok(())
}

/// Score descending, newer first on ties, then chunk id.
pub(crate) fn rank_hits(hits: &mut [IndexHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.indexed_at.cmp(&a.indexed_at))
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
}

/// Deletes a document's entries and verifies nothing is left behind.
pub async fn remove_document(
    index: &dyn VectorIndex,
    document_id: &str,
    chunk_ids: &[String],
) -> Result<(), PipelineError> {
    index
        .delete_document(document_id, chunk_ids)
        .await
        .map_err(|e| PipelineError::IndexWriteFailure(e.to_string()))?;

    let remaining = index
        .count(&IndexFilter::documents(vec![document_id.to_string()]))
        .await
        .map_err(|e| PipelineError::IndexWriteFailure(e.to_string()))?;
    if remaining > 0 {
        tracing::error!(document_id, remaining, "Index entries survived document deletion");
        return Err(PipelineError::IndexDeleteInconsistency {
            document_id: document_id.to_string(),
            remaining,
        });
    }
    Ok(())
}

/// Creates the backend named by `index.provider` for vectors of `dims`.
pub fn create_index(
    config: &IndexConfig,
    pool: &SqlitePool,
    dims: usize,
) -> anyhow::Result<Arc<dyn VectorIndex>> {
    match config.provider.as_str() {
        "sqlite" => Ok(Arc::new(SqliteIndex::new(pool.clone(), dims))),
        "memory" => Ok(Arc::new(MemoryIndex::new(dims))),
        "pinecone" => Ok(Arc::new(PineconeIndex::from_config(config, dims)?)),
        other => anyhow::bail!("Unknown index provider: {}", other),
    }
}
