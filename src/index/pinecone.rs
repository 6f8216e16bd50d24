//! Pinecone-hosted vector index over the REST data plane.
//!
//! Requests go to the index host (`index.host`) with the `Api-Key` header
//! read from `PINECONE_API_KEY`. Entry metadata is flattened into Pinecone
//! metadata fields; absent optional fields are omitted, since Pinecone
//! rejects nulls.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;

use super::{check_dimension, rank_hits, IndexError, IndexFilter, IndexHealth, VectorIndex};
use crate::config::IndexConfig;
use crate::models::{EntryMetadata, IndexEntry, IndexHit};

/// Pinecone's documented per-request upsert limit for dense vectors.
const UPSERT_BATCH: usize = 100;
const MAX_RETRIES: u32 = 3;

pub struct PineconeIndex {
    host: String,
    namespace: String,
    api_key: String,
    dimension: usize,
    client: reqwest::Client,
}

impl PineconeIndex {
    pub fn new(host: &str, namespace: &str, api_key: &str, dimension: usize, timeout_secs: u64) -> anyhow::Result<Self> {
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            host,
            namespace: namespace.to_string(),
            api_key: api_key.to_string(),
            dimension,
            client,
        })
    }

    pub fn from_config(config: &IndexConfig, dimension: usize) -> anyhow::Result<Self> {
        let host = config
            .host
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("index.host required for Pinecone provider"))?;
        let api_key = std::env::var("PINECONE_API_KEY")
            .map_err(|_| anyhow::anyhow!("PINECONE_API_KEY environment variable not set"))?;
        Self::new(host, &config.namespace, &api_key, dimension, config.timeout_secs)
    }

    /// POSTs to the data plane with backoff on 429/5xx and network errors.
    async fn post(&self, path: &str, body: &Value) -> Result<Value, IndexError> {
        let url = format!("{}{}", self.host, path);
        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Api-Key", &self.api_key)
                .header("X-Pinecone-API-Version", "2024-07")
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json()
                            .await
                            .map_err(|e| IndexError::Backend(e.to_string()));
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    let err = IndexError::Backend(format!("Pinecone {} {}: {}", path, status, body_text));
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(IndexError::Backend(format!("Pinecone connection error: {}", e)));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| IndexError::Backend("Pinecone request failed".into())))
    }
}

fn to_metadata(entry: &IndexEntry) -> Value {
    let m = &entry.metadata;
    let mut map = Map::new();
    map.insert("document_id".into(), json!(entry.document_id));
    map.insert("chunk_id".into(), json!(entry.chunk_id));
    map.insert("filename".into(), json!(m.filename));
    map.insert("chunk_index".into(), json!(m.chunk_index));
    map.insert("text".into(), json!(m.text));
    map.insert("indexed_at".into(), json!(entry.indexed_at));
    if let Some(page) = m.page_number {
        map.insert("page_number".into(), json!(page));
    }
    if let Some(section) = &m.section_title {
        map.insert("section_title".into(), json!(section));
    }
    if let Some(owner) = &m.owner {
        map.insert("owner".into(), json!(owner));
    }
    Value::Object(map)
}

fn from_match(m: &Value) -> Option<IndexHit> {
    let chunk_id = m.get("id")?.as_str()?.to_string();
    let score = m.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32;
    let md = m.get("metadata")?;
    let str_field = |k: &str| md.get(k).and_then(Value::as_str).map(String::from);

    Some(IndexHit {
        document_id: str_field("document_id")?,
        score,
        indexed_at: md.get("indexed_at").and_then(Value::as_f64).unwrap_or(0.0) as i64,
        metadata: EntryMetadata {
            filename: str_field("filename").unwrap_or_default(),
            chunk_index: md.get("chunk_index").and_then(Value::as_f64).unwrap_or(0.0) as i64,
            page_number: md.get("page_number").and_then(Value::as_f64).map(|p| p as u32),
            section_title: str_field("section_title"),
            text: str_field("text").unwrap_or_default(),
            owner: str_field("owner"),
        },
        chunk_id,
    })
}

/// Pinecone metadata filter, or `None` when unfiltered.
fn to_filter(filter: &IndexFilter) -> Option<Value> {
    let mut clauses = Vec::new();
    if let Some(ids) = &filter.document_ids {
        clauses.push(json!({ "document_id": { "$in": ids } }));
    }
    if let Some(ids) = &filter.chunk_ids {
        clauses.push(json!({ "chunk_id": { "$in": ids } }));
    }
    if let Some(owner) = &filter.owner {
        clauses.push(json!({ "owner": { "$eq": owner } }));
    }
    if let Some(ids) = filter.exclude_document_ids.as_ref().filter(|ids| !ids.is_empty()) {
        clauses.push(json!({ "document_id": { "$nin": ids } }));
    }
    match clauses.len() {
        0 => None,
        1 => clauses.pop(),
        _ => Some(json!({ "$and": clauses })),
    }
}

fn vector_count(stats: &Value, namespace: &str) -> usize {
    stats
        .get("namespaces")
        .and_then(|n| n.get(namespace))
        .and_then(|n| n.get("vectorCount"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    fn name(&self) -> &str {
        "pinecone"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> Result<usize, IndexError> {
        for entry in entries {
            check_dimension(self.dimension, &entry.vector)?;
        }
        for batch in entries.chunks(UPSERT_BATCH) {
            let vectors: Vec<Value> = batch
                .iter()
                .map(|e| {
                    json!({
                        "id": e.chunk_id,
                        "values": e.vector,
                        "metadata": to_metadata(e),
                    })
                })
                .collect();
            self.post(
                "/vectors/upsert",
                &json!({ "vectors": vectors, "namespace": self.namespace }),
            )
            .await?;
        }
        Ok(entries.len())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexHit>, IndexError> {
        check_dimension(self.dimension, vector)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let mut body = json!({
            "vector": vector,
            "topK": top_k,
            "namespace": self.namespace,
            "includeMetadata": true,
            "includeValues": false,
        });
        if let Some(f) = to_filter(filter) {
            body["filter"] = f;
        }
        let resp = self.post("/query", &body).await?;
        let mut hits: Vec<IndexHit> = resp
            .get("matches")
            .and_then(Value::as_array)
            .map(|ms| ms.iter().filter_map(from_match).collect())
            .unwrap_or_default();
        rank_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<(), IndexError> {
        for batch in chunk_ids.chunks(1000) {
            self.post(
                "/vectors/delete",
                &json!({ "ids": batch, "namespace": self.namespace }),
            )
            .await?;
        }
        Ok(())
    }

    async fn count(&self, filter: &IndexFilter) -> Result<usize, IndexError> {
        let mut body = json!({});
        if let Some(f) = to_filter(filter) {
            body["filter"] = f;
        }
        let stats = self.post("/describe_index_stats", &body).await?;
        Ok(vector_count(&stats, &self.namespace))
    }

    async fn stored_dimension(&self) -> Result<Option<usize>, IndexError> {
        let stats = self.post("/describe_index_stats", &json!({})).await?;
        Ok(stats.get("dimension").and_then(Value::as_u64).map(|d| d as usize))
    }

    async fn health(&self) -> IndexHealth {
        match self.post("/describe_index_stats", &json!({})).await {
            Ok(stats) => {
                let remote_dim = stats.get("dimension").and_then(Value::as_u64).map(|d| d as usize);
                let dim_ok = remote_dim.map_or(true, |d| d == self.dimension);
                IndexHealth {
                    backend: "pinecone".to_string(),
                    healthy: dim_ok,
                    dimension: self.dimension,
                    entries: Some(vector_count(&stats, &self.namespace)),
                    detail: (!dim_ok).then(|| {
                        format!(
                            "remote index dimension {:?} does not match configured {}",
                            remote_dim, self.dimension
                        )
                    }),
                }
            }
            Err(e) => IndexHealth {
                backend: "pinecone".to_string(),
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

    fn entry() -> IndexEntry {
        IndexEntry {
            chunk_id: "doc_chunk_2".into(),
            document_id: "doc".into(),
            vector: vec![0.1, 0.2],
            metadata: EntryMetadata {
                filename: "a.pdf".into(),
                chunk_index: 2,
                page_number: Some(4),
                section_title: None,
                text: "hello".into(),
                owner: None,
            },
            indexed_at: 42,
        }
    }

    #[test]
    fn metadata_omits_absent_fields_and_roundtrips() {
        let e = entry();
        let md = to_metadata(&e);
        assert!(md.get("section_title").is_none());
        assert!(md.get("owner").is_none());

        let m = json!({ "id": "doc_chunk_2", "score": 0.9, "metadata": md });
        let hit = from_match(&m).unwrap();
        assert_eq!(hit.document_id, "doc");
        assert_eq!(hit.metadata, e.metadata);
        assert_eq!(hit.indexed_at, 42);
    }

    #[test]
    fn filters_use_in_operator() {
        assert!(to_filter(&IndexFilter::default()).is_none());
        let f = to_filter(&IndexFilter::documents(vec!["a".into(), "b".into()])).unwrap();
        assert_eq!(f, json!({ "document_id": { "$in": ["a", "b"] } }));

        let both = IndexFilter {
            document_ids: Some(vec!["a".into()]),
            owner: Some("o".into()),
            ..IndexFilter::default()
        };
        let f = to_filter(&both).unwrap();
        assert_eq!(f["$and"].as_array().map(|a| a.len()), Some(2));

        let rest = IndexFilter {
            exclude_document_ids: Some(vec!["a".into()]),
            ..IndexFilter::default()
        };
        assert_eq!(to_filter(&rest).unwrap(), json!({ "document_id": { "$nin": ["a"] } }));
    }

    #[test]
    fn stats_vector_count_by_namespace() {
        let stats = json!({
            "dimension": 2,
            "namespaces": { "default": { "vectorCount": 7 } },
            "totalVectorCount": 9
        });
        assert_eq!(vector_count(&stats, "default"), 7);
        assert_eq!(vector_count(&stats, "other"), 0);
    }

    #[test]
    fn host_gets_scheme() {
        let idx = PineconeIndex::new("docs-abc.svc.pinecone.io/", "ns", "key", 2, 5).unwrap();
        assert_eq!(idx.host, "https://docs-abc.svc.pinecone.io");
    }

    /// In-process stand-in for the Pinecone data plane.
    #[derive(Default)]
    struct Stub {
        vectors: std::collections::BTreeMap<String, (Vec<f32>, Value)>,
        upsert_batches: Vec<usize>,
        filters: Vec<Value>,
        api_keys: Vec<String>,
        /// Deletes of this document's vectors are acknowledged but ignored.
        sticky_document: Option<String>,
    }

    type Shared = std::sync::Arc<std::sync::Mutex<Stub>>;

    fn field_matches(condition: &Value, value: Option<&Value>) -> bool {
        let contains = |op: &str| {
            condition
                .get(op)
                .and_then(Value::as_array)
                .map(|list| value.is_some_and(|v| list.contains(v)))
        };
        if let Some(found) = contains("$in") {
            return found;
        }
        if let Some(found) = contains("$nin") {
            return !found;
        }
        condition.get("$eq").map_or(true, |eq| value == Some(eq))
    }

    fn filter_matches(filter: Option<&Value>, metadata: &Value) -> bool {
        let Some(Value::Object(clauses)) = filter else {
            return true;
        };
        clauses.iter().all(|(key, condition)| match key.as_str() {
            "$and" => condition
                .as_array()
                .is_some_and(|all| all.iter().all(|c| filter_matches(Some(c), metadata))),
            field => field_matches(condition, metadata.get(field)),
        })
    }

    async fn serve_stub(state: Shared) -> String {
        use axum::extract::State;
        use axum::http::HeaderMap;
        use axum::{routing::post, Json, Router};

        let app = Router::new()
            .route(
                "/vectors/upsert",
                post(|State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    let mut stub = state.lock().unwrap();
                    if let Some(key) = headers.get("Api-Key").and_then(|v| v.to_str().ok()) {
                        stub.api_keys.push(key.to_string());
                    }
                    let vectors = body["vectors"].as_array().cloned().unwrap_or_default();
                    stub.upsert_batches.push(vectors.len());
                    for v in vectors {
                        let values = v["values"]
                            .as_array()
                            .map(|a| a.iter().filter_map(Value::as_f64).map(|x| x as f32).collect())
                            .unwrap_or_default();
                        let id = v["id"].as_str().unwrap_or_default().to_string();
                        stub.vectors.insert(id, (values, v["metadata"].clone()));
                    }
                    Json(json!({ "upsertedCount": stub.upsert_batches.last() }))
                }),
            )
            .route(
                "/query",
                post(|State(state): State<Shared>, Json(body): Json<Value>| async move {
                    let mut stub = state.lock().unwrap();
                    let filter = body.get("filter").cloned();
                    if let Some(f) = &filter {
                        stub.filters.push(f.clone());
                    }
                    let query: Vec<f32> = body["vector"]
                        .as_array()
                        .map(|a| a.iter().filter_map(Value::as_f64).map(|x| x as f32).collect())
                        .unwrap_or_default();
                    let top_k = body["topK"].as_u64().unwrap_or(10) as usize;
                    let mut matches: Vec<(f32, Value)> = stub
                        .vectors
                        .iter()
                        .filter(|(_, (_, md))| filter_matches(filter.as_ref(), md))
                        .map(|(id, (values, md))| {
                            let score: f32 = values.iter().zip(&query).map(|(a, b)| a * b).sum();
                            (score, json!({ "id": id, "score": score, "metadata": md }))
                        })
                        .collect();
                    matches.sort_by(|a, b| b.0.total_cmp(&a.0));
                    let matches: Vec<Value> = matches.into_iter().take(top_k).map(|(_, m)| m).collect();
                    Json(json!({ "matches": matches }))
                }),
            )
            .route(
                "/vectors/delete",
                post(|State(state): State<Shared>, Json(body): Json<Value>| async move {
                    let mut stub = state.lock().unwrap();
                    let ids = body["ids"].as_array().cloned().unwrap_or_default();
                    for id in ids.iter().filter_map(Value::as_str) {
                        let sticky = match (&stub.sticky_document, stub.vectors.get(id)) {
                            (Some(doc), Some((_, md))) => md["document_id"] == json!(doc),
                            _ => false,
                        };
                        if !sticky {
                            stub.vectors.remove(id);
                        }
                    }
                    Json(json!({}))
                }),
            )
            .route(
                "/describe_index_stats",
                post(|State(state): State<Shared>, Json(body): Json<Value>| async move {
                    let stub = state.lock().unwrap();
                    let count = stub
                        .vectors
                        .values()
                        .filter(|(_, md)| filter_matches(body.get("filter"), md))
                        .count();
                    Json(json!({
                        "dimension": 2,
                        "namespaces": { "kb": { "vectorCount": count } },
                        "totalVectorCount": stub.vectors.len()
                    }))
                }),
            )
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn doc_entries(document_id: &str, n: usize, vector: Vec<f32>) -> Vec<IndexEntry> {
        (0..n)
            .map(|i| IndexEntry {
                chunk_id: crate::models::chunk_id(document_id, i),
                document_id: document_id.into(),
                vector: vector.clone(),
                metadata: EntryMetadata {
                    chunk_index: i as i64,
                    ..entry().metadata
                },
                indexed_at: 42,
            })
            .collect()
    }

    #[tokio::test]
    async fn data_plane_round_trip_against_local_server() {
        let state = Shared::default();
        let host = serve_stub(state.clone()).await;
        let index = PineconeIndex::new(&host, "kb", "test-key", 2, 5).unwrap();

        let manual = doc_entries("manual", 250, vec![1.0, 0.0]);
        let notes = doc_entries("notes", 3, vec![0.0, 1.0]);
        assert_eq!(index.upsert(&manual).await.unwrap(), 250);
        assert_eq!(index.upsert(&notes).await.unwrap(), 3);
        {
            let stub = state.lock().unwrap();
            assert_eq!(stub.upsert_batches, vec![100, 100, 50, 3]);
            assert!(stub.api_keys.iter().all(|k| k == "test-key"));
        }
        assert_eq!(index.stored_dimension().await.unwrap(), Some(2));
        assert!(index.health().await.healthy);

        let hits = index
            .query(&[1.0, 0.0], 5, &IndexFilter::documents(vec!["notes".into()]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.document_id == "notes"));
        assert_eq!(
            state.lock().unwrap().filters.last(),
            Some(&json!({ "document_id": { "$in": ["notes"] } }))
        );

        let manual_filter = IndexFilter::documents(vec!["manual".into()]);
        assert_eq!(index.count(&manual_filter).await.unwrap(), 250);
        let gone: Vec<String> = manual.iter().take(3).map(|e| e.chunk_id.clone()).collect();
        index.delete_chunks(&gone).await.unwrap();
        assert_eq!(index.count(&manual_filter).await.unwrap(), 247);

        let note_ids: Vec<String> = notes.iter().map(|e| e.chunk_id.clone()).collect();
        crate::index::remove_document(&index, "notes", &note_ids).await.unwrap();
        assert_eq!(
            index.count(&IndexFilter::documents(vec!["notes".into()])).await.unwrap(),
            0
        );

        // A backend that acknowledges deletes without applying them is caught.
        state.lock().unwrap().sticky_document = Some("manual".into());
        let manual_ids: Vec<String> = manual.iter().skip(3).map(|e| e.chunk_id.clone()).collect();
        let err = crate::index::remove_document(&index, "manual", &manual_ids)
            .await
            .unwrap_err();
        match err {
            crate::error::PipelineError::IndexDeleteInconsistency { document_id, remaining } => {
                assert_eq!(document_id, "manual");
                assert_eq!(remaining, 247);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
