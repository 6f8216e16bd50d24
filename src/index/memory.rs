//! Process-local vector index.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{check_dimension, rank_hits, IndexError, IndexFilter, IndexHealth, VectorIndex};
use crate::embedding::cosine_similarity;
use crate::models::{IndexEntry, IndexHit};

/// Keeps entries in a map and answers queries by brute-force cosine
/// similarity. Cloning shares the underlying map.
#[derive(Clone)]
pub struct MemoryIndex {
    dimension: usize,
    entries: Arc<RwLock<HashMap<String, IndexEntry>>>,
}

impl MemoryIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn name(&self) -> &str {
        "memory"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> Result<usize, IndexError> {
        for entry in entries {
            check_dimension(self.dimension, &entry.vector)?;
        }
        let mut store = self.entries.write().await;
        for entry in entries {
            store.insert(entry.chunk_id.clone(), entry.clone());
        }
        debug!(count = entries.len(), "Upserted entries into memory index");
        Ok(entries.len())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexHit>, IndexError> {
        check_dimension(self.dimension, vector)?;
        let store = self.entries.read().await;
        let mut hits: Vec<IndexHit> = store
            .values()
            .filter(|e| filter.matches(&e.chunk_id, &e.document_id, e.metadata.owner.as_deref()))
            .map(|e| IndexHit {
                chunk_id: e.chunk_id.clone(),
                document_id: e.document_id.clone(),
                score: cosine_similarity(vector, &e.vector),
                metadata: e.metadata.clone(),
                indexed_at: e.indexed_at,
            })
            .collect();
        rank_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<(), IndexError> {
        let mut store = self.entries.write().await;
        for id in chunk_ids {
            store.remove(id);
        }
        Ok(())
    }

    async fn delete_document(&self, document_id: &str, _chunk_ids: &[String]) -> Result<(), IndexError> {
        let mut store = self.entries.write().await;
        store.retain(|_, e| e.document_id != document_id);
        Ok(())
    }

    async fn count(&self, filter: &IndexFilter) -> Result<usize, IndexError> {
        let store = self.entries.read().await;
        Ok(store
            .values()
            .filter(|e| filter.matches(&e.chunk_id, &e.document_id, e.metadata.owner.as_deref()))
            .count())
    }

    async fn health(&self) -> IndexHealth {
        IndexHealth {
            backend: "memory".to_string(),
            healthy: true,
            dimension: self.dimension,
            entries: Some(self.entries.read().await.len()),
            detail: None,
        }
    }
}
