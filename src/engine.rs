//! Shared services built once from the config.
//!
//! The HTTP server, the worker pool and every CLI command work against one
//! [`Engine`]: the database pool plus the embedding, index, redaction and
//! generation backends selected in the config. Tests swap individual
//! backends through [`Overrides`].

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::Config;
use crate::embedding::cache::CachedEmbedder;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::generate::{create_generator, Generator};
use crate::index::{create_index, VectorIndex};
use crate::queue::JobQueue;
use crate::redact::{create_redactor, Redactor};
use crate::{db, migrate};

/// Backends to use instead of the configured ones.
#[derive(Default)]
pub struct Overrides {
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub index: Option<Arc<dyn VectorIndex>>,
    pub redactor: Option<Arc<dyn Redactor>>,
    pub generator: Option<Arc<dyn Generator>>,
}

pub struct Engine {
    pub config: Config,
    pub pool: SqlitePool,
    /// The configured provider, behind the embedding cache when enabled.
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub index: Arc<dyn VectorIndex>,
    pub redactor: Arc<dyn Redactor>,
    pub generator: Arc<dyn Generator>,
    pub queue: JobQueue,
    embeddings_enabled: bool,
}

impl Engine {
    pub async fn open(config: &Config) -> Result<Arc<Self>> {
        Self::open_with(config, Overrides::default()).await
    }

    /// Connects, applies the schema and builds every backend.
    pub async fn open_with(config: &Config, overrides: Overrides) -> Result<Arc<Self>> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;

        let embeddings_enabled = overrides.embedder.is_some() || config.embedding.is_enabled();
        let provider = match overrides.embedder {
            Some(p) => p,
            None => create_provider(&config.embedding)?,
        };
        let embedder: Arc<dyn EmbeddingProvider> = if config.cache.enabled && embeddings_enabled {
            Arc::new(CachedEmbedder::new(provider, pool.clone(), config.cache.ttl_secs))
        } else {
            provider
        };

        let index = match overrides.index {
            Some(i) => i,
            None => create_index(&config.index, &pool, embedder.dims())?,
        };
        if embeddings_enabled {
            check_dimensions(embedder.as_ref(), index.as_ref()).await?;
        }

        let redactor = match overrides.redactor {
            Some(r) => r,
            None => create_redactor(&config.redaction).context("Failed to build redaction rules")?,
        };
        let generator = match overrides.generator {
            Some(g) => g,
            None => create_generator(&config.generation)?,
        };

        let queue = JobQueue::new(pool.clone(), &config.worker);

        Ok(Arc::new(Self {
            config: config.clone(),
            pool,
            embedder,
            index,
            redactor,
            generator,
            queue,
            embeddings_enabled,
        }))
    }

    pub fn embeddings_enabled(&self) -> bool {
        self.embeddings_enabled
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Embedding dims must equal the index dimension, including vectors the
/// index already holds from earlier runs.
async fn check_dimensions(embedder: &dyn EmbeddingProvider, index: &dyn VectorIndex) -> Result<()> {
    if embedder.dims() != index.dimension() {
        bail!(
            "Embedding model '{}' produces {} dimensions but the {} index expects {}",
            embedder.model_name(),
            embedder.dims(),
            index.name(),
            index.dimension()
        );
    }
    match index.stored_dimension().await {
        Ok(Some(stored)) if stored != embedder.dims() => bail!(
            "The {} index holds {}-dimensional vectors but embedding model '{}' produces {}; \
             delete and re-ingest documents after changing models",
            index.name(),
            stored,
            embedder.model_name(),
            embedder.dims()
        ),
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::warn!(index = index.name(), error = %e, "Could not read stored index dimension");
            Ok(())
        }
    }
}
