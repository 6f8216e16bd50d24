//! Fan-out/fan-in embedding of many chunk texts.
//!
//! Texts are split into batches of `batch_size`; up to `parallel` batches
//! are in flight at once. When a whole batch fails, each of its texts is
//! retried on its own, so one poisoned chunk cannot take its neighbours
//! down with it. Results come back in input order, one per text.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::EmbeddingProvider;

/// Per-text outcome: the vector, or the last error message.
pub type EmbedResult = Result<Vec<f32>, String>;

pub async fn embed_all(
    provider: Arc<dyn EmbeddingProvider>,
    texts: &[String],
    batch_size: usize,
    parallel: usize,
    max_retries: u32,
) -> Vec<EmbedResult> {
    let semaphore = Arc::new(Semaphore::new(parallel.max(1)));
    let mut handles = Vec::new();

    for batch in texts.chunks(batch_size.max(1)) {
        let batch = batch.to_vec();
        let provider = Arc::clone(&provider);
        let semaphore = Arc::clone(&semaphore);
        let len = batch.len();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return vec![Err("embedding pool closed".to_string()); batch.len()];
            };
            embed_batch(provider.as_ref(), &batch, max_retries).await
        });
        handles.push((len, handle));
    }

    let mut results = Vec::with_capacity(texts.len());
    for (len, handle) in handles {
        match handle.await {
            Ok(batch_results) => results.extend(batch_results),
            Err(e) => results.extend(std::iter::repeat_with(|| Err(e.to_string())).take(len)),
        }
    }
    results
}

async fn embed_batch(
    provider: &dyn EmbeddingProvider,
    batch: &[String],
    max_retries: u32,
) -> Vec<EmbedResult> {
    let dims = provider.dims();
    match provider.embed(batch).await {
        Ok(vectors) if vectors.len() == batch.len() && vectors.iter().all(|v| v.len() == dims) => {
            return vectors.into_iter().map(Ok).collect();
        }
        Ok(vectors) => {
            tracing::warn!(
                expected = batch.len(),
                got = vectors.len(),
                "Embedding batch returned a malformed response; retrying per chunk"
            );
        }
        Err(e) => {
            tracing::warn!(size = batch.len(), error = %e, "Embedding batch failed; retrying per chunk");
        }
    }

    let mut out = Vec::with_capacity(batch.len());
    for text in batch {
        out.push(embed_single(provider, text, max_retries).await);
    }
    out
}

async fn embed_single(provider: &dyn EmbeddingProvider, text: &str, max_retries: u32) -> EmbedResult {
    let input = [text.to_string()];
    let mut last_err = String::from("no attempt made");

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(50 << (attempt - 1).min(5))).await;
        }
        match provider.embed(&input).await {
            Ok(mut vectors) if vectors.len() == 1 && vectors[0].len() == provider.dims() => {
                return Ok(vectors.remove(0));
            }
            Ok(vectors) => {
                last_err = format!(
                    "malformed embedding response ({} vectors, dims {:?})",
                    vectors.len(),
                    vectors.first().map(|v| v.len())
                );
            }
            Err(e) => last_err = e.to_string(),
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails any call that contains a text with the poison marker.
    struct Poisoned {
        inner: HashProvider,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for Poisoned {
        fn model_name(&self) -> &str {
            "poisoned"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|t| t.contains("POISON")) {
                bail!("upstream rejected input");
            }
            self.inner.embed(texts).await
        }
    }

    fn texts(n: usize, poison_at: Option<usize>) -> Vec<String> {
        (0..n)
            .map(|i| {
                if Some(i) == poison_at {
                    format!("chunk {} POISON", i)
                } else {
                    format!("chunk number {}", i)
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn all_succeed_in_order() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashProvider::new(32));
        let input = texts(10, None);
        let results = embed_all(Arc::clone(&provider), &input, 3, 2, 1).await;
        assert_eq!(results.len(), 10);
        for (text, result) in input.iter().zip(&results) {
            let expected = provider.embed(&[text.clone()]).await.unwrap();
            assert_eq!(result.as_ref().unwrap(), &expected[0]);
        }
    }

    #[tokio::test]
    async fn one_bad_chunk_fails_alone() {
        let provider = Arc::new(Poisoned {
            inner: HashProvider::new(16),
            calls: AtomicUsize::new(0),
        });
        let input = texts(20, Some(7));
        let results = embed_all(provider.clone(), &input, 5, 4, 2).await;
        assert_eq!(results.len(), 20);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 19);
        assert!(results[7].as_ref().unwrap_err().contains("upstream rejected"));
        // 4 batch calls, 5 single calls for the failed batch, 2 retries of the bad chunk.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4 + 5 + 2);
    }

    #[tokio::test]
    async fn empty_input() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashProvider::new(8));
        assert!(embed_all(provider, &[], 4, 2, 1).await.is_empty());
    }
}
