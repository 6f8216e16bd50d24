//! Vector index stored in the shared SQLite database.
//!
//! Vectors are little-endian `f32` BLOBs in `index_entries`; queries load
//! the filtered candidate set and rank it in process.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::{check_dimension, rank_hits, IndexError, IndexFilter, IndexHealth, VectorIndex};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{EntryMetadata, IndexEntry, IndexHit};

pub struct SqliteIndex {
    pool: SqlitePool,
    dimension: usize,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool, dimension: usize) -> Self {
        Self { pool, dimension }
    }
}

/// Appends `WHERE ...` for the filter's populated fields.
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &IndexFilter) {
    let mut first = true;
    let mut clause = |qb: &mut QueryBuilder<'_, Sqlite>| {
        qb.push(if first { " WHERE " } else { " AND " });
        first = false;
    };

    if let Some(ids) = &filter.document_ids {
        clause(qb);
        push_in(qb, "document_id", ids);
    }
    if let Some(ids) = &filter.chunk_ids {
        clause(qb);
        push_in(qb, "chunk_id", ids);
    }
    if let Some(owner) = &filter.owner {
        clause(qb);
        qb.push("owner = ").push_bind(owner.clone());
    }
    if let Some(ids) = filter.exclude_document_ids.as_ref().filter(|ids| !ids.is_empty()) {
        clause(qb);
        qb.push("NOT ");
        push_in(qb, "document_id", ids);
    }
}

fn push_in(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, ids: &[String]) {
    if ids.is_empty() {
        qb.push("0");
        return;
    }
    qb.push(column).push(" IN (");
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(id.clone());
    }
    sep.push_unseparated(")");
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> Result<usize, IndexError> {
        for entry in entries {
            check_dimension(self.dimension, &entry.vector)?;
        }

        let mut tx = self.pool.begin().await?;
        for entry in entries {
            let metadata = serde_json::to_string(&entry.metadata)
                .map_err(|e| IndexError::Backend(e.to_string()))?;
            sqlx::query(
                "INSERT INTO index_entries (chunk_id, document_id, vector, dims, metadata_json, owner, indexed_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(chunk_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    vector = excluded.vector,
                    dims = excluded.dims,
                    metadata_json = excluded.metadata_json,
                    owner = excluded.owner,
                    indexed_at = excluded.indexed_at",
            )
            .bind(&entry.chunk_id)
            .bind(&entry.document_id)
            .bind(vec_to_blob(&entry.vector))
            .bind(entry.vector.len() as i64)
            .bind(&metadata)
            .bind(&entry.metadata.owner)
            .bind(entry.indexed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(entries.len())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexHit>, IndexError> {
        check_dimension(self.dimension, vector)?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT chunk_id, document_id, vector, metadata_json, indexed_at FROM index_entries",
        );
        push_filter(&mut qb, filter);
        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("vector");
            let stored = blob_to_vec(&blob);
            if stored.len() != self.dimension {
                continue;
            }
            let metadata_json: String = row.get("metadata_json");
            let metadata: EntryMetadata = serde_json::from_str(&metadata_json)
                .map_err(|e| IndexError::Backend(format!("corrupt entry metadata: {}", e)))?;
            hits.push(IndexHit {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                score: cosine_similarity(vector, &stored),
                metadata,
                indexed_at: row.get("indexed_at"),
            });
        }

        rank_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<(), IndexError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM index_entries WHERE ");
        push_in(&mut qb, "chunk_id", chunk_ids);
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_document(&self, document_id: &str, _chunk_ids: &[String]) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM index_entries WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count(&self, filter: &IndexFilter) -> Result<usize, IndexError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM index_entries");
        push_filter(&mut qb, filter);
        let count: i64 = qb.build().fetch_one(&self.pool).await?.get(0);
        Ok(count as usize)
    }

    async fn stored_dimension(&self) -> Result<Option<usize>, IndexError> {
        let row = sqlx::query("SELECT dims FROM index_entries LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("dims") as usize))
    }

    async fn health(&self) -> IndexHealth {
        match self.count(&IndexFilter::default()).await {
            Ok(n) => IndexHealth {
                backend: "sqlite".to_string(),
                healthy: true,
                dimension: self.dimension,
                entries: Some(n),
                detail: None,
            },
            Err(e) => IndexHealth {
                backend: "sqlite".to_string(),
                healthy: false,
                dimension: self.dimension,
                entries: None,
                detail: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    async fn index(tmp: &TempDir) -> SqliteIndex {
        let mut config = Config::minimal();
        config.db.path = tmp.path().join("index.sqlite");
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        SqliteIndex::new(pool, 3)
    }

    fn entry(chunk: &str, doc: &str, vector: Vec<f32>, owner: Option<&str>) -> IndexEntry {
        IndexEntry {
            chunk_id: chunk.into(),
            document_id: doc.into(),
            vector,
            metadata: EntryMetadata {
                filename: "report.pdf".into(),
                chunk_index: 0,
                page_number: Some(3),
                section_title: Some("Results".into()),
                text: format!("text of {}", chunk),
                owner: owner.map(String::from),
            },
            indexed_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn upsert_query_roundtrip_keeps_metadata() {
        let tmp = TempDir::new().unwrap();
        let index = index(&tmp).await;
        index
            .upsert(&[
                entry("d1_chunk_0", "d1", vec![1.0, 0.0, 0.0], None),
                entry("d1_chunk_1", "d1", vec![0.0, 1.0, 0.0], None),
            ])
            .await
            .unwrap();

        let hits = index.query(&[1.0, 0.1, 0.0], 1, &IndexFilter::default()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "d1_chunk_0");
        assert_eq!(hits[0].metadata.page_number, Some(3));
        assert_eq!(hits[0].metadata.section_title.as_deref(), Some("Results"));
    }

    #[tokio::test]
    async fn reupsert_does_not_duplicate() {
        let tmp = TempDir::new().unwrap();
        let index = index(&tmp).await;
        for _ in 0..3 {
            index
                .upsert(&[entry("d1_chunk_0", "d1", vec![1.0, 0.0, 0.0], None)])
                .await
                .unwrap();
        }
        assert_eq!(index.count(&IndexFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn filters_by_chunk_ids_and_owner() {
        let tmp = TempDir::new().unwrap();
        let index = index(&tmp).await;
        index
            .upsert(&[
                entry("a", "d1", vec![1.0, 0.0, 0.0], Some("alice")),
                entry("b", "d1", vec![1.0, 0.0, 0.0], Some("bob")),
                entry("c", "d2", vec![1.0, 0.0, 0.0], Some("alice")),
            ])
            .await
            .unwrap();

        let chunks = IndexFilter::chunks(vec!["a".into(), "c".into()]);
        assert_eq!(index.count(&chunks).await.unwrap(), 2);

        let alice_d1 = IndexFilter {
            document_ids: Some(vec!["d1".into()]),
            owner: Some("alice".into()),
            ..IndexFilter::default()
        };
        let hits = index.query(&[1.0, 0.0, 0.0], 10, &alice_d1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "a");

        assert_eq!(index.count(&IndexFilter::chunks(vec![])).await.unwrap(), 0);

        let not_d1 = IndexFilter {
            exclude_document_ids: Some(vec!["d1".into()]),
            ..IndexFilter::default()
        };
        let hits = index.query(&[1.0, 0.0, 0.0], 10, &not_d1).await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.document_id != "d1"));
    }

    #[tokio::test]
    async fn delete_document_removes_all_entries() {
        let tmp = TempDir::new().unwrap();
        let index = index(&tmp).await;
        index
            .upsert(&[
                entry("d1_chunk_0", "d1", vec![1.0, 0.0, 0.0], None),
                entry("d2_chunk_0", "d2", vec![1.0, 0.0, 0.0], None),
            ])
            .await
            .unwrap();
        crate::index::remove_document(&index, "d1", &[]).await.unwrap();
        let hits = index.query(&[1.0, 0.0, 0.0], 10, &IndexFilter::default()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "d2");
        assert!(index.health().await.healthy);
        assert_eq!(index.stored_dimension().await.unwrap(), Some(3));
    }
}
