//! Query-time retrieval.
//!
//! Two interchangeable strategies sit behind [`Retriever`]:
//!
//! - [`FlatRetriever`]: one nearest-neighbour query against the vector index.
//! - [`HierarchicalRetriever`]: beam search over the document trees, then a
//!   vector-index query restricted to the chunks under the chosen leaves.
//!
//! [`search`] picks the strategy per request. A hierarchical request also
//! runs the flat strategy over the in-scope documents that have no tree and
//! merges both result sets, so a missing or failed tree build never hides a
//! document. When the walk selects nothing at all the request falls back to
//! a plain flat search.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::embedding::embed_query;
use crate::engine::Engine;
use crate::error::PipelineError;
use crate::hierarchy::{beam_search, load_nodes};
use crate::index::{rank_hits, IndexError, IndexFilter, VectorIndex};
use crate::models::IndexHit;

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: usize,
    pub use_hierarchical: bool,
    pub document_ids: Option<Vec<String>>,
    pub owner: Option<String>,
}

impl SearchRequest {
    fn filter(&self) -> IndexFilter {
        IndexFilter {
            document_ids: self.document_ids.clone(),
            chunk_ids: None,
            owner: self.owner.clone(),
            exclude_document_ids: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Flat,
    Hierarchical,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Flat => "flat",
            Strategy::Hierarchical => "hierarchical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub hits: Vec<IndexHit>,
    pub strategy: Strategy,
    /// A hierarchical request was answered by the flat strategy.
    pub fell_back: bool,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    fn strategy(&self) -> Strategy;

    async fn retrieve(&self, query: &[f32], request: &SearchRequest) -> Result<Vec<IndexHit>, PipelineError>;
}

pub struct FlatRetriever {
    index: Arc<dyn VectorIndex>,
}

impl FlatRetriever {
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Retriever for FlatRetriever {
    fn strategy(&self) -> Strategy {
        Strategy::Flat
    }

    async fn retrieve(&self, query: &[f32], request: &SearchRequest) -> Result<Vec<IndexHit>, PipelineError> {
        self.retrieve_filtered(query, request.top_k, &request.filter()).await
    }
}

impl FlatRetriever {
    pub async fn retrieve_filtered(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexHit>, PipelineError> {
        self.index.query(query, top_k, filter).await.map_err(query_failure)
    }
}

fn query_failure(e: IndexError) -> PipelineError {
    match e {
        IndexError::Storage(db) => PipelineError::Storage(db),
        other => PipelineError::RetrievalFailure(other.to_string()),
    }
}

/// Result of a tree walk: hits under the selected leaves, and the documents
/// that had a tree to walk.
#[derive(Debug, Default)]
pub struct TreeWalk {
    pub hits: Vec<IndexHit>,
    pub documents: BTreeSet<String>,
}

pub struct HierarchicalRetriever {
    pool: SqlitePool,
    index: Arc<dyn VectorIndex>,
    beam_width: usize,
}

impl HierarchicalRetriever {
    pub fn new(pool: SqlitePool, index: Arc<dyn VectorIndex>, beam_width: usize) -> Self {
        Self {
            pool,
            index,
            beam_width,
        }
    }
}

#[async_trait]
impl Retriever for HierarchicalRetriever {
    fn strategy(&self) -> Strategy {
        Strategy::Hierarchical
    }

    async fn retrieve(&self, query: &[f32], request: &SearchRequest) -> Result<Vec<IndexHit>, PipelineError> {
        Ok(self.walk(query, request).await?.hits)
    }
}

impl HierarchicalRetriever {
    pub async fn walk(&self, query: &[f32], request: &SearchRequest) -> Result<TreeWalk, PipelineError> {
        let nodes = load_nodes(&self.pool, request.document_ids.as_deref()).await?;
        let documents: BTreeSet<String> = nodes.iter().map(|n| n.document_id.clone()).collect();
        if nodes.is_empty() {
            return Ok(TreeWalk::default());
        }

        let leaves = beam_search(&nodes, query, self.beam_width);
        let chunk_ids: BTreeSet<String> = leaves
            .iter()
            .flat_map(|(node, _)| node.chunk_ids.iter().cloned())
            .collect();
        tracing::debug!(leaves = leaves.len(), chunks = chunk_ids.len(), "Tree walk selected leaves");
        if chunk_ids.is_empty() {
            return Ok(TreeWalk {
                hits: Vec::new(),
                documents,
            });
        }

        let filter = IndexFilter {
            chunk_ids: Some(chunk_ids.into_iter().collect()),
            ..request.filter()
        };
        let hits = self
            .index
            .query(query, request.top_k, &filter)
            .await
            .map_err(query_failure)?;
        Ok(TreeWalk { hits, documents })
    }
}

/// Embeds the query and runs the requested strategy under
/// `retrieval.timeout_secs`.
pub async fn search(engine: &Engine, request: &SearchRequest) -> Result<SearchOutcome, PipelineError> {
    if !engine.embeddings_enabled() {
        return Err(PipelineError::EmbeddingsDisabled);
    }
    let secs = engine.config.retrieval.timeout_secs;
    tokio::time::timeout(Duration::from_secs(secs), run_search(engine, request))
        .await
        .map_err(|_| PipelineError::RetrievalTimeout(secs))?
}

async fn run_search(engine: &Engine, request: &SearchRequest) -> Result<SearchOutcome, PipelineError> {
    let vector = embed_query(engine.embedder.as_ref(), &request.query)
        .await
        .map_err(|e| PipelineError::EmbeddingFailure(e.to_string()))?;

    let flat = FlatRetriever::new(Arc::clone(&engine.index));
    if request.use_hierarchical {
        let tree = HierarchicalRetriever::new(
            engine.pool.clone(),
            Arc::clone(&engine.index),
            engine.config.hierarchy.beam_width,
        );
        let walk = tree.walk(&vector, request).await?;
        if !walk.hits.is_empty() {
            let mut hits = walk.hits;
            let treeless = IndexFilter {
                exclude_document_ids: Some(walk.documents.into_iter().collect()),
                ..request.filter()
            };
            hits.extend(flat.retrieve_filtered(&vector, request.top_k, &treeless).await?);
            rank_hits(&mut hits);
            hits.truncate(request.top_k);
            return Ok(SearchOutcome {
                hits,
                strategy: tree.strategy(),
                fell_back: false,
            });
        }
        tracing::debug!("Hierarchical retrieval found nothing; using flat index");
        let hits = flat.retrieve(&vector, request).await?;
        return Ok(SearchOutcome {
            hits,
            strategy: flat.strategy(),
            fell_back: true,
        });
    }

    let hits = flat.retrieve(&vector, request).await?;
    Ok(SearchOutcome {
        hits,
        strategy: flat.strategy(),
        fell_back: false,
    })
}

/// Keeps hits scoring at least `threshold`.
pub fn apply_threshold(hits: Vec<IndexHit>, threshold: f32) -> Vec<IndexHit> {
    hits.into_iter().filter(|h| h.score >= threshold).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::engine::Overrides;
    use crate::hierarchy::{build_tree, embed_nodes, save_tree};
    use crate::models::{EntryMetadata, ExtractedContent, Heading, IndexEntry};
    use tempfile::TempDir;

    fn hit(score: f32) -> IndexHit {
        IndexHit {
            chunk_id: format!("c{}", score),
            document_id: "d".into(),
            score,
            metadata: EntryMetadata {
                filename: "f".into(),
                chunk_index: 0,
                page_number: None,
                section_title: None,
                text: String::new(),
                owner: None,
            },
            indexed_at: 0,
        }
    }

    #[test]
    fn threshold_is_inclusive() {
        let kept = apply_threshold(vec![hit(0.9), hit(0.7), hit(0.2)], 0.7);
        assert_eq!(kept.len(), 2);
    }

    async fn engine(tmp: &TempDir) -> Arc<Engine> {
        let mut config = crate::config::Config::minimal();
        config.db.path = tmp.path().join("retrieve.sqlite");
        config.cache.enabled = false;
        let overrides = Overrides {
            embedder: Some(Arc::new(HashProvider::new(64))),
            index: Some(Arc::new(crate::index::MemoryIndex::new(64))),
            ..Overrides::default()
        };
        Engine::open_with(&config, overrides).await.unwrap()
    }

    /// Two-section document, one chunk per section, indexed and with a tree.
    async fn seed(engine: &Engine) {
        let text = "# Zebras\n\nZebras graze on savanna grass in large herds.\n\n\
                    # Glaciers\n\nGlaciers carve valleys from ancient ice.";
        let content = ExtractedContent {
            text: text.to_string(),
            headings: vec![
                Heading { level: 1, title: "Zebras".into(), offset: 0 },
                Heading { level: 1, title: "Glaciers".into(), offset: text.find("# Glaciers").unwrap() },
            ],
            ..Default::default()
        };
        let split = text.find("# Glaciers").unwrap();
        let chunks: Vec<_> = [(0, split), (split, text.len())]
            .iter()
            .enumerate()
            .map(|(i, (s, e))| {
                let mut c = crate::chunk::chunk_text("doc", &text[*s..*e], 100, 0).remove(0);
                c.id = crate::models::chunk_id("doc", i);
                c.start = *s;
                c.end = *e;
                c
            })
            .collect();

        let hash = HashProvider::new(64);
        let entries: Vec<IndexEntry> = chunks
            .iter()
            .map(|c| IndexEntry {
                chunk_id: c.id.clone(),
                document_id: "doc".into(),
                vector: hash.embed_one(&c.text),
                metadata: EntryMetadata {
                    filename: "nature.md".into(),
                    chunk_index: 0,
                    page_number: None,
                    section_title: None,
                    text: c.text.clone(),
                    owner: None,
                },
                indexed_at: 1,
            })
            .collect();
        engine.index.upsert(&entries).await.unwrap();

        let mut nodes = build_tree("doc", "nature.md", &content, &chunks, &engine.config.hierarchy);
        embed_nodes(&mut nodes, &hash, 8).await.unwrap();
        save_tree(&engine.pool, "doc", &nodes).await.unwrap();
    }

    #[tokio::test]
    async fn hierarchical_search_restricts_to_selected_leaf() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        seed(&engine).await;

        let mut request = SearchRequest {
            query: "glaciers carve valleys".into(),
            top_k: 5,
            use_hierarchical: true,
            ..SearchRequest::default()
        };
        let flat = search(&engine, &SearchRequest { use_hierarchical: false, ..request.clone() })
            .await
            .unwrap();
        assert_eq!(flat.hits.len(), 2);
        assert_eq!(flat.strategy, Strategy::Flat);

        let narrow = HierarchicalRetriever::new(engine.pool.clone(), Arc::clone(&engine.index), 1);
        let vector = HashProvider::new(64).embed_one(&request.query);
        let hits = narrow.retrieve(&vector, &request).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "doc_chunk_1");

        request.document_ids = Some(vec!["doc".into()]);
        let tree = search(&engine, &request).await.unwrap();
        assert_eq!(tree.strategy, Strategy::Hierarchical);
        assert!(!tree.fell_back);
        assert_eq!(tree.hits[0].chunk_id, "doc_chunk_1");
    }

    #[tokio::test]
    async fn hierarchical_falls_back_without_trees() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        seed(&engine).await;
        crate::hierarchy::delete_tree(&engine.pool, "doc").await.unwrap();

        let outcome = search(
            &engine,
            &SearchRequest {
                query: "zebras".into(),
                top_k: 3,
                use_hierarchical: true,
                ..SearchRequest::default()
            },
        )
        .await
        .unwrap();
        assert!(outcome.fell_back);
        assert_eq!(outcome.strategy, Strategy::Flat);
        assert_eq!(outcome.hits[0].chunk_id, "doc_chunk_0");
    }

    #[tokio::test]
    async fn hierarchical_search_keeps_documents_without_a_tree() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        seed(&engine).await;

        let text = "Volcanoes erupt basalt lava from deep magma chambers.";
        engine
            .index
            .upsert(&[IndexEntry {
                chunk_id: crate::models::chunk_id("doc2", 0),
                document_id: "doc2".into(),
                vector: HashProvider::new(64).embed_one(text),
                metadata: EntryMetadata {
                    filename: "geology.txt".into(),
                    chunk_index: 0,
                    page_number: None,
                    section_title: None,
                    text: text.into(),
                    owner: None,
                },
                indexed_at: 1,
            }])
            .await
            .unwrap();

        let request = SearchRequest {
            query: "magma basalt lava volcanoes".into(),
            top_k: 2,
            use_hierarchical: true,
            ..SearchRequest::default()
        };
        let outcome = search(&engine, &request).await.unwrap();
        assert_eq!(outcome.strategy, Strategy::Hierarchical);
        assert!(!outcome.fell_back);
        assert!(outcome.hits.len() <= 2);
        assert_eq!(outcome.hits[0].document_id, "doc2");
        assert!(outcome.hits.windows(2).all(|w| w[0].score >= w[1].score));

        // Scoped to the tree-backed document only, nothing else leaks in.
        let scoped = search(
            &engine,
            &SearchRequest {
                document_ids: Some(vec!["doc".into()]),
                ..request.clone()
            },
        )
        .await
        .unwrap();
        assert!(scoped.hits.iter().all(|h| h.document_id == "doc"));
    }

    struct UnreachableIndex;

    #[async_trait]
    impl VectorIndex for UnreachableIndex {
        fn name(&self) -> &str {
            "unreachable"
        }
        fn dimension(&self) -> usize {
            64
        }
        async fn upsert(&self, entries: &[IndexEntry]) -> Result<usize, IndexError> {
            Ok(entries.len())
        }
        async fn query(&self, _: &[f32], _: usize, _: &IndexFilter) -> Result<Vec<IndexHit>, IndexError> {
            Err(IndexError::Backend("connection refused".into()))
        }
        async fn delete_chunks(&self, _: &[String]) -> Result<(), IndexError> {
            Ok(())
        }
        async fn count(&self, _: &IndexFilter) -> Result<usize, IndexError> {
            Ok(0)
        }
        async fn health(&self) -> crate::index::IndexHealth {
            crate::index::IndexHealth {
                backend: "unreachable".into(),
                healthy: false,
                dimension: 64,
                entries: None,
                detail: None,
            }
        }
    }

    #[tokio::test]
    async fn query_failures_are_reported_as_retrieval_errors() {
        let tmp = TempDir::new().unwrap();
        let mut config = crate::config::Config::minimal();
        config.db.path = tmp.path().join("unreachable.sqlite");
        config.cache.enabled = false;
        let overrides = Overrides {
            embedder: Some(Arc::new(HashProvider::new(64))),
            index: Some(Arc::new(UnreachableIndex)),
            ..Overrides::default()
        };
        let engine = Engine::open_with(&config, overrides).await.unwrap();

        let err = search(&engine, &SearchRequest { query: "x".into(), top_k: 1, ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RetrievalFailure(_)), "{:?}", err);
        assert_eq!(err.code(), "retrieval_failure");
        assert_eq!(err.stage(), Some("retrieval"));
    }

    #[tokio::test]
    async fn disabled_embeddings_are_reported() {
        let tmp = TempDir::new().unwrap();
        let mut config = crate::config::Config::minimal();
        config.db.path = tmp.path().join("off.sqlite");
        let engine = Engine::open(&config).await.unwrap();
        let err = search(&engine, &SearchRequest { query: "x".into(), top_k: 1, ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmbeddingsDisabled));
    }
}
