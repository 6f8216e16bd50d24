//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents/upload` | Multipart upload (`file`, optional `owner`); queues processing |
//! | `GET`  | `/documents` | Paged list (`page`, `page_size`, `status`) |
//! | `GET`  | `/documents/{id}` | Document detail |
//! | `GET`  | `/documents/{id}/status` | State, failing stage, progress, counts |
//! | `DELETE` | `/documents/{id}` | Remove document, chunks and index entries |
//! | `POST` | `/documents/{id}/reprocess` | Run the pipeline again |
//! | `POST` | `/documents/{id}/hierarchy` | Build the hierarchical index |
//! | `POST` | `/search` | Ranked chunks for a query |
//! | `POST` | `/agents/query` | Grounded answer with sources |
//! | `POST` | `/pii/detect` | Scan text for sensitive data |
//! | `GET`  | `/index/stats` | Index, document and queue counters |
//! | `GET`  | `/health` | Component health and version |
//! | `GET`  | `/` | Service name and version |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "not found: document 3f2a…" } }
//! ```
//!
//! Status codes: 400 (`bad_request`, `unsupported_format`,
//! `embeddings_disabled`), 404 `not_found`, 408 (`retrieval_timeout`,
//! `extraction_timeout`), 409 `conflict`, 413 `payload_too_large`, 500
//! (`index_delete_inconsistency`, `storage_error`, `internal_error`), 502 for
//! failing upstream services.
//!
//! Every response carries an `x-request-id` header, generated when the
//! client does not send one.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::answer::{answer, Answer, QueryRequest};
use crate::config::{Config, ServerConfig};
use crate::documents::{self, DeleteReceipt, DocumentList, StatusReport, TaskReceipt, UploadReceipt};
use crate::engine::Engine;
use crate::error::PipelineError;
use crate::models::{Document, DocumentStatus, PiiKind};
use crate::redact::{scan, PatternRedactor, PiiReport};
use crate::retrieve::{apply_threshold, search, SearchRequest, Strategy};
use crate::worker::WorkerPool;

const MAX_SEARCH_QUERY: usize = 1000;
const MAX_AGENT_QUERY: usize = 2000;
const MAX_TOP_K: usize = 50;

/// Starts the API server, plus the embedded worker pool when
/// `worker.embedded` is set. Returns after Ctrl-C once in-flight jobs end.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let engine = Engine::open(config).await?;
    let workers = config
        .worker
        .embedded
        .then(|| WorkerPool::spawn(Arc::clone(&engine)));

    let app = router(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("Knowledge base listening on http://{}", config.server.bind);
    tracing::info!(bind = %config.server.bind, embedded_workers = workers.is_some(), "Server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(workers) = workers {
        workers.shutdown().await;
    }
    engine.close().await;
    Ok(())
}

/// All routes with tracing, request ids and CORS applied.
pub fn router(engine: Arc<Engine>) -> Router {
    let body_limit = engine.config.storage.max_upload_bytes() as usize + 1024 * 1024;
    let cors = cors_layer(&engine.config.server);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/documents/upload", post(handle_upload))
        .route("/documents", get(handle_list))
        .route("/documents/{id}", get(handle_get).delete(handle_delete))
        .route("/documents/{id}/status", get(handle_status))
        .route("/documents/{id}/reprocess", post(handle_reprocess))
        .route("/documents/{id}/hierarchy", post(handle_hierarchy))
        .route("/search", post(handle_search))
        .route("/agents/query", post(handle_agent_query))
        .route("/pii/detect", post(handle_pii_detect))
        .route("/index/stats", get(handle_index_stats))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &Request<axum::body::Body>| {
                let request_id = req
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!("http", method = %req.method(), uri = %req.uri(), request_id)
            }),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(cors)
        .with_state(engine)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.cors_origins.is_empty() || config.cors_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        let status = match &e {
            PipelineError::UnsupportedFormat(_)
            | PipelineError::InvalidInput(_)
            | PipelineError::EmbeddingsDisabled => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Conflict(_) => StatusCode::CONFLICT,
            PipelineError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PipelineError::RetrievalTimeout(_) | PipelineError::ExtractionTimeout(_) => {
                StatusCode::REQUEST_TIMEOUT
            }
            PipelineError::RedactionUnavailable(_)
            | PipelineError::EmbeddingFailure(_)
            | PipelineError::IndexWriteFailure(_)
            | PipelineError::RetrievalFailure(_)
            | PipelineError::GenerationFailure(_) => StatusCode::BAD_GATEWAY,
            PipelineError::ExtractionFailure(_)
            | PipelineError::IndexDeleteInconsistency { .. }
            | PipelineError::Storage(_)
            | PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(code = e.code(), error = %e, "Request failed");
        }
        AppError {
            status,
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

fn validate_query(query: &str, max_chars: usize) -> Result<(), AppError> {
    if query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if query.chars().count() > max_chars {
        return Err(bad_request(format!("query must be at most {} characters", max_chars)));
    }
    Ok(())
}

fn validate_top_k(top_k: Option<usize>) -> Result<(), AppError> {
    match top_k {
        Some(k) if k == 0 || k > MAX_TOP_K => {
            Err(bad_request(format!("top_k must be between 1 and {}", MAX_TOP_K)))
        }
        _ => Ok(()),
    }
}

// ============ GET / and /health ============

#[derive(Serialize)]
struct RootResponse {
    name: &'static str,
    version: &'static str,
    status: &'static str,
}

async fn handle_root() -> Json<RootResponse> {
    Json(RootResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
    })
}

#[derive(Serialize)]
struct ServiceHealth {
    name: String,
    status: String,
    latency_ms: Option<f64>,
    error: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    services: Vec<ServiceHealth>,
}

async fn handle_health(State(engine): State<Arc<Engine>>) -> Json<HealthResponse> {
    let mut services = Vec::new();

    let started = Instant::now();
    let db = sqlx::query("SELECT 1").execute(&engine.pool).await;
    services.push(ServiceHealth {
        name: "database".into(),
        status: if db.is_ok() { "healthy" } else { "unhealthy" }.into(),
        latency_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
        error: db.err().map(|e| e.to_string()),
    });

    let started = Instant::now();
    let index = engine.index.health().await;
    services.push(ServiceHealth {
        name: format!("index:{}", index.backend),
        status: if index.healthy { "healthy" } else { "unhealthy" }.into(),
        latency_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
        error: index.detail.filter(|_| !index.healthy),
    });

    services.push(ServiceHealth {
        name: format!("embedding:{}", engine.embedder.model_name()),
        status: if engine.embeddings_enabled() { "healthy" } else { "disabled" }.into(),
        latency_ms: None,
        error: None,
    });

    let degraded = services.iter().any(|s| s.status == "unhealthy");
    Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" }.into(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        services,
    })
}

// ============ Documents ============

async fn handle_upload(
    State(engine): State<Arc<Engine>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadReceipt>), AppError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut owner = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                file = Some((filename, bytes.to_vec()));
            }
            Some("owner") => {
                let text = field.text().await.map_err(multipart_error)?;
                owner = Some(text).filter(|o| !o.trim().is_empty());
            }
            _ => {}
        }
    }

    let (filename, bytes) = file.ok_or_else(|| bad_request("multipart field 'file' is required"))?;
    let receipt = documents::upload(&engine, &filename, &bytes, owner).await?;
    let status = if receipt.duplicate {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(receipt)))
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> AppError {
    let status = e.status();
    AppError {
        status,
        code: if status == StatusCode::PAYLOAD_TOO_LARGE {
            "payload_too_large"
        } else {
            "bad_request"
        }
        .to_string(),
        message: e.body_text(),
    }
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
    status: Option<String>,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

async fn handle_list(
    State(engine): State<Arc<Engine>>,
    Query(params): Query<ListParams>,
) -> Result<Json<DocumentList>, AppError> {
    let status = match params.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(DocumentStatus::parse(s).ok_or_else(|| bad_request(format!("unknown status '{}'", s)))?),
    };
    if params.page_size == 0 || params.page_size > 100 {
        return Err(bad_request("page_size must be between 1 and 100"));
    }
    Ok(Json(documents::list(&engine, status, params.page, params.page_size).await?))
}

async fn handle_get(State(engine): State<Arc<Engine>>, Path(id): Path<String>) -> Result<Json<Document>, AppError> {
    Ok(Json(documents::get(&engine, &id).await?))
}

async fn handle_status(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<StatusReport>, AppError> {
    Ok(Json(documents::status(&engine, &id).await?))
}

async fn handle_delete(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteReceipt>, AppError> {
    Ok(Json(documents::delete(&engine, &id).await?))
}

async fn handle_reprocess(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<TaskReceipt>), AppError> {
    Ok((StatusCode::ACCEPTED, Json(documents::reprocess(&engine, &id).await?)))
}

async fn handle_hierarchy(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<TaskReceipt>), AppError> {
    Ok((StatusCode::ACCEPTED, Json(documents::request_hierarchy(&engine, &id).await?)))
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    top_k: Option<usize>,
    #[serde(default)]
    use_hierarchical: bool,
    similarity_threshold: Option<f32>,
    document_ids: Option<Vec<String>>,
    owner: Option<String>,
}

#[derive(Serialize)]
struct SearchResultItem {
    chunk_id: String,
    document_id: String,
    document_name: String,
    page_number: Option<u32>,
    section_title: Option<String>,
    content: String,
    score: f32,
}

#[derive(Serialize)]
struct SearchResponse {
    query: String,
    results: Vec<SearchResultItem>,
    total: usize,
    strategy: Strategy,
    fell_back: bool,
    processing_time_ms: f64,
}

async fn handle_search(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponse>, AppError> {
    validate_query(&body.query, MAX_SEARCH_QUERY)?;
    validate_top_k(body.top_k)?;
    let threshold = body
        .similarity_threshold
        .unwrap_or(engine.config.retrieval.similarity_threshold);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(bad_request("similarity_threshold must be between 0 and 1"));
    }

    let started = Instant::now();
    let outcome = search(
        &engine,
        &SearchRequest {
            query: body.query.clone(),
            top_k: body.top_k.unwrap_or(engine.config.retrieval.top_k),
            use_hierarchical: body.use_hierarchical,
            document_ids: body.document_ids,
            owner: body.owner,
        },
    )
    .await?;

    let results: Vec<SearchResultItem> = apply_threshold(outcome.hits, threshold)
        .into_iter()
        .map(|h| SearchResultItem {
            chunk_id: h.chunk_id,
            document_id: h.document_id,
            document_name: h.metadata.filename,
            page_number: h.metadata.page_number,
            section_title: h.metadata.section_title,
            content: h.metadata.text,
            score: h.score,
        })
        .collect();

    Ok(Json(SearchResponse {
        query: body.query,
        total: results.len(),
        results,
        strategy: outcome.strategy,
        fell_back: outcome.fell_back,
        processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
    }))
}

// ============ POST /agents/query ============

#[derive(Deserialize)]
struct AgentQueryBody {
    query: String,
    #[serde(default = "default_true")]
    include_sources: bool,
    top_k: Option<usize>,
    #[serde(default)]
    use_hierarchical: bool,
    conversation_id: Option<String>,
    document_ids: Option<Vec<String>>,
    owner: Option<String>,
}

fn default_true() -> bool {
    true
}

async fn handle_agent_query(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<AgentQueryBody>,
) -> Result<Json<Answer>, AppError> {
    validate_query(&body.query, MAX_AGENT_QUERY)?;
    validate_top_k(body.top_k)?;
    let out = answer(
        &engine,
        &QueryRequest {
            query: body.query,
            top_k: body.top_k,
            use_hierarchical: body.use_hierarchical,
            include_sources: body.include_sources,
            conversation_id: body.conversation_id,
            document_ids: body.document_ids,
            owner: body.owner,
        },
    )
    .await?;
    Ok(Json(out))
}

// ============ POST /pii/detect ============

#[derive(Deserialize)]
struct PiiBody {
    content: String,
    categories: Option<Vec<String>>,
    #[serde(default = "default_true")]
    redact: bool,
}

async fn handle_pii_detect(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<PiiBody>,
) -> Result<Json<PiiReport>, AppError> {
    let kinds = match &body.categories {
        None => None,
        Some(names) => Some(
            names
                .iter()
                .map(|n| PiiKind::parse(n).ok_or_else(|| bad_request(format!("unknown category '{}'", n))))
                .collect::<Result<Vec<_>, _>>()?,
        ),
    };

    // Categories outside `[redaction].categories` are checked with ad-hoc rules.
    let configured = |k: &PiiKind| engine.config.redaction.categories.iter().any(|c| c == k.as_str());
    let report = match &kinds {
        Some(kinds) if !kinds.iter().all(configured) => {
            let rules = PatternRedactor::new(kinds).map_err(PipelineError::from)?;
            scan(&rules, &body.content, Some(kinds), body.redact).await
        }
        _ => scan(engine.redactor.as_ref(), &body.content, kinds.as_deref(), body.redact).await,
    }
    .map_err(PipelineError::from)?;
    Ok(Json(report))
}

// ============ GET /index/stats ============

#[derive(Serialize)]
struct IndexStats {
    backend: String,
    dimension: usize,
    entries: usize,
    embedding_model: String,
    embeddings_enabled: bool,
    documents: std::collections::BTreeMap<String, i64>,
    queue: crate::queue::QueueStats,
}

async fn handle_index_stats(State(engine): State<Arc<Engine>>) -> Result<Json<IndexStats>, AppError> {
    let entries = engine
        .index
        .count(&crate::index::IndexFilter::default())
        .await
        .map_err(PipelineError::from)?;
    let documents = crate::store::status_counts(&engine.pool).await.map_err(PipelineError::from)?;
    let queue = engine.queue.stats().await.map_err(PipelineError::from)?;
    Ok(Json(IndexStats {
        backend: engine.index.name().to_string(),
        dimension: engine.index.dimension(),
        entries,
        embedding_model: engine.embedder.model_name().to_string(),
        embeddings_enabled: engine.embeddings_enabled(),
        documents,
        queue,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::engine::Overrides;
    use crate::index::MemoryIndex;
    use axum::body::{to_bytes, Body};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn engine(tmp: &TempDir, embeddings: bool) -> Arc<Engine> {
        let mut config = Config::minimal();
        config.db.path = tmp.path().join("server.sqlite");
        config.storage.upload_dir = tmp.path().join("uploads");
        config.retrieval.similarity_threshold = 0.1;
        let overrides = if embeddings {
            Overrides {
                embedder: Some(Arc::new(HashProvider::new(64))),
                index: Some(Arc::new(MemoryIndex::new(64))),
                ..Overrides::default()
            }
        } else {
            Overrides::default()
        };
        Engine::open_with(&config, overrides).await.unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart(filename: &str, content: &str) -> Request<Body> {
        let boundary = "kbtestboundary";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n{c}\r\n--{b}--\r\n",
            b = boundary,
            f = filename,
            c = content
        );
        Request::post("/documents/upload")
            .header("content-type", format!("multipart/form-data; boundary={}", boundary))
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_and_root() {
        let tmp = TempDir::new().unwrap();
        let app = router(engine(&tmp, true).await);

        let resp = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-request-id"));
        let body: Value = serde_json::from_slice(&to_bytes(resp.into_body(), usize::MAX).await.unwrap()).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert!(body["services"].as_array().unwrap().len() >= 3);

        let (status, body) = send(&app, Request::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
    }

    #[tokio::test]
    async fn request_id_is_propagated() {
        let tmp = TempDir::new().unwrap();
        let app = router(engine(&tmp, true).await);
        let resp = app
            .oneshot(
                Request::get("/health")
                    .header("x-request-id", "trace-me")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers()["x-request-id"], "trace-me");
    }

    #[tokio::test]
    async fn errors_use_json_envelope() {
        let tmp = TempDir::new().unwrap();
        let app = router(engine(&tmp, true).await);

        let (status, body) = send(&app, Request::get("/documents/nope").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_found");

        let (status, body) = send(&app, post_json("/search", json!({ "query": "  " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");

        let (status, _) = send(&app, post_json("/search", json!({ "query": "x", "top_k": 51 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let long = "q".repeat(2001);
        let (status, _) = send(&app, post_json("/agents/query", json!({ "query": long }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, multipart("virus.exe", "MZ")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "unsupported_format");

        let (status, _) = send(&app, Request::get("/documents?status=bogus").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn search_without_embeddings_is_reported() {
        let tmp = TempDir::new().unwrap();
        let app = router(engine(&tmp, false).await);
        let (status, body) = send(&app, post_json("/search", json!({ "query": "anything" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "embeddings_disabled");
    }

    #[tokio::test]
    async fn document_lifecycle_over_http() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp, true).await;
        let app = router(Arc::clone(&engine));

        let (status, body) = send(
            &app,
            multipart("lighthouses.md", "# Lighthouses\n\nLighthouses guide ships along rocky coasts at night."),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "received");
        let id = body["document_id"].as_str().unwrap().to_string();
        assert_eq!(id.len(), 16);

        let (status, again) = send(
            &app,
            multipart("lighthouses.md", "# Lighthouses\n\nLighthouses guide ships along rocky coasts at night."),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["duplicate"], true);

        crate::worker::run_until_idle(&engine).await.unwrap();

        let (_, status_body) = send(&app, Request::get(format!("/documents/{}/status", id)).body(Body::empty()).unwrap()).await;
        assert_eq!(status_body["status"], "indexed");
        assert_eq!(status_body["progress"], 100);

        let (status, list) = send(&app, Request::get("/documents?page=1&page_size=10").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["total"], 1);
        assert_eq!(list["has_more"], false);

        let (status, found) = send(&app, post_json("/search", json!({ "query": "lighthouses guide ships", "top_k": 3 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(found["results"][0]["document_id"], id.as_str());
        assert_eq!(found["results"][0]["document_name"], "lighthouses.md");

        let (status, answer) = send(&app, post_json("/agents/query", json!({ "query": "what do lighthouses guide" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(answer["grounded"], true);
        assert_eq!(answer["sources"][0]["document_id"], id.as_str());

        let (status, stats) = send(&app, Request::get("/index/stats").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["documents"]["indexed"], 1);

        let (status, deleted) = send(
            &app,
            Request::delete(format!("/documents/{}", id)).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted["deleted"], true);

        let (_, found) = send(&app, post_json("/search", json!({ "query": "lighthouses guide ships" }))).await;
        assert_eq!(found["total"], 0);
        let (status, _) = send(&app, Request::get(format!("/documents/{}", id)).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pii_detection_endpoint() {
        let tmp = TempDir::new().unwrap();
        let app = router(engine(&tmp, false).await);
        let (status, body) = send(
            &app,
            post_json(
                "/pii/detect",
                json!({ "content": "reach me at ana@example.com", "categories": ["email"] }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["has_pii"], true);
        assert_eq!(body["categories_found"][0], "email");
        assert_eq!(body["redacted_content"], "reach me at [REDACTED_EMAIL]");

        let (status, _) = send(&app, post_json("/pii/detect", json!({ "content": "x", "categories": ["dna"] }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
