//! SQLite-backed embedding cache.
//!
//! Keys are `sha256(model ‖ 0x00 ‖ text)`, so switching models never serves
//! stale vectors. Entries older than the TTL are treated as misses and
//! overwritten on the next write.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use super::{blob_to_vec, vec_to_blob, EmbeddingProvider};
use crate::db::now_secs;

pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    pool: SqlitePool,
    ttl_secs: u64,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, pool: SqlitePool, ttl_secs: u64) -> Self {
        Self {
            inner,
            pool,
            ttl_secs,
        }
    }

    fn key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.inner.model_name().as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    async fn lookup(&self, key: &str) -> Result<Option<Vec<f32>>> {
        let cutoff = now_secs() - self.ttl_secs as i64;
        let row = sqlx::query("SELECT vector FROM embedding_cache WHERE key = ? AND created_at > ?")
            .bind(key)
            .bind(cutoff)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| blob_to_vec(&r.get::<Vec<u8>, _>("vector")))
            .filter(|v| v.len() == self.inner.dims()))
    }

    async fn store(&self, key: &str, vector: &[f32]) -> Result<()> {
        sqlx::query(
            "INSERT INTO embedding_cache (key, model, vector, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET vector = excluded.vector, created_at = excluded.created_at",
        )
        .bind(key)
        .bind(self.inner.model_name())
        .bind(vec_to_blob(vector))
        .bind(now_secs())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drops entries past their TTL. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let cutoff = now_secs() - self.ttl_secs as i64;
        let result = sqlx::query("DELETE FROM embedding_cache WHERE created_at <= ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let keys: Vec<String> = texts.iter().map(|t| self.key(t)).collect();
        let mut out: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut misses = Vec::new();

        for (i, key) in keys.iter().enumerate() {
            let hit = match self.lookup(key).await {
                Ok(hit) => hit,
                Err(e) => {
                    tracing::warn!(error = %e, "Embedding cache read failed");
                    None
                }
            };
            if hit.is_none() {
                misses.push(i);
            }
            out.push(hit);
        }

        if !misses.is_empty() {
            let miss_texts: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.inner.embed(&miss_texts).await?;
            if vectors.len() != miss_texts.len() {
                anyhow::bail!(
                    "Embedding response has {} vectors for {} inputs",
                    vectors.len(),
                    miss_texts.len()
                );
            }
            for (&i, vector) in misses.iter().zip(vectors) {
                if let Err(e) = self.store(&keys[i], &vector).await {
                    tracing::warn!(error = %e, "Embedding cache write failed");
                }
                out[i] = Some(vector);
            }
        }

        tracing::debug!(
            total = texts.len(),
            misses = misses.len(),
            "Embedding cache lookup"
        );

        out.into_iter()
            .map(|v| v.ok_or_else(|| anyhow::anyhow!("Embedding missing after cache fill")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Counting {
        inner: HashProvider,
        texts_seen: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for Counting {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.texts_seen.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed(texts).await
        }
    }

    async fn pool(tmp: &TempDir) -> SqlitePool {
        let mut config = crate::config::Config::minimal();
        config.db.path = tmp.path().join("cache.sqlite");
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let tmp = TempDir::new().unwrap();
        let counting = Arc::new(Counting {
            inner: HashProvider::new(16),
            texts_seen: AtomicUsize::new(0),
        });
        let cached = CachedEmbedder::new(counting.clone(), pool(&tmp).await, 3600);

        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let first = cached.embed(&texts).await.unwrap();
        let second = cached
            .embed(&["beta".to_string(), "gamma".to_string()])
            .await
            .unwrap();

        assert_eq!(first[1], second[0]);
        assert_eq!(counting.texts_seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_ttl_never_hits() {
        let tmp = TempDir::new().unwrap();
        let counting = Arc::new(Counting {
            inner: HashProvider::new(16),
            texts_seen: AtomicUsize::new(0),
        });
        let cached = CachedEmbedder::new(counting.clone(), pool(&tmp).await, 0);

        cached.embed(&["alpha".to_string()]).await.unwrap();
        cached.embed(&["alpha".to_string()]).await.unwrap();
        assert_eq!(counting.texts_seen.load(Ordering::SeqCst), 2);
        assert_eq!(cached.purge_expired().await.unwrap(), 1);
    }
}
