//! Document processing: extract → redact → chunk/embed → index.
//!
//! One `process_document` job drives a document from wherever it currently
//! sits in the state machine to `indexed`. The worker holds the document
//! lock (keyed by the job's lease token) for the whole run, and every stage
//! persists its output before the status moves on:
//!
//! 1. `received → extracting`: parse the stored upload.
//! 2. `extracting → redacting`: mask sensitive spans; only the redacted
//!    content is written to `document_content`.
//! 3. `redacting → embedding`: chunk, embed with per-chunk fallback, upsert.
//! 4. `embedding → indexed`, then optionally enqueue `build_hierarchy`.
//!
//! Raw text is never persisted, so a run that resumes at `redacting`
//! extracts again. A run that resumes at `embedding` reuses the stored
//! redacted content.
//!
//! Failures are classified by [`PipelineError::is_transient`]: transient
//! ones reschedule the job with backoff, structural ones (or transient ones
//! on the last attempt) mark the document `failed` with its stage.

use std::path::Path;
use std::sync::Arc;

use crate::chunk::chunk_content;
use crate::db::now_millis;
use crate::embedding::batch::embed_all;
use crate::engine::Engine;
use crate::error::PipelineError;
use crate::extract::extract_with_timeout;
use crate::hierarchy::{build_tree, embed_nodes, save_tree};
use crate::models::{
    Document, DocumentStatus, EntryMetadata, ExtractedContent, FileType, HierarchyStatus, IndexEntry,
};
use crate::queue::{Job, JobKind, RetryOutcome};
use crate::redact::redact_content;
use crate::store;

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Another holder had the document lock; the job went back unchanged.
    Deferred,
    /// Transient failure; another attempt runs after `delay` seconds.
    Retrying { delay: u64 },
    Failed { stage: String, message: String },
    /// The document was deleted before the job ran.
    Dropped,
}

/// Counts from one indexing run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub chunks: usize,
    pub indexed: usize,
    pub failed: usize,
}

/// Runs a claimed job to an outcome and records it in the queue.
pub async fn run_job(engine: &Engine, job: &Job) -> anyhow::Result<JobOutcome> {
    match job.kind {
        JobKind::ProcessDocument => run_process_job(engine, job).await,
        JobKind::BuildHierarchy => run_hierarchy_job(engine, job).await,
    }
}

async fn run_process_job(engine: &Engine, job: &Job) -> anyhow::Result<JobOutcome> {
    let pool = &engine.pool;
    let doc_id = job.document_id.as_str();

    if store::get_document(pool, doc_id).await?.is_none() {
        engine.queue.fail(job, "document no longer exists").await?;
        return Ok(JobOutcome::Dropped);
    }

    if !store::acquire_lock(pool, doc_id, &job.lease_token, engine.config.worker.lease_secs).await? {
        tracing::debug!(document_id = doc_id, job_id = %job.id, "Document locked, deferring job");
        engine.queue.requeue(job, engine.config.worker.backoff_base_secs).await?;
        return Ok(JobOutcome::Deferred);
    }

    let outcome = match process_document(engine, doc_id, &job.lease_token).await {
        Ok(report) => {
            tracing::info!(
                document_id = doc_id,
                job_id = %job.id,
                chunks = report.chunks,
                indexed = report.indexed,
                failed = report.failed,
                "Document indexed"
            );
            engine.queue.complete(job).await.map(|_| JobOutcome::Completed)
        }
        Err(e) => handle_failure(engine, job, e).await,
    };

    let released = store::release_lock(pool, doc_id, &job.lease_token).await;
    let outcome = outcome?;
    released?;
    Ok(outcome)
}

async fn handle_failure(engine: &Engine, job: &Job, error: PipelineError) -> anyhow::Result<JobOutcome> {
    let doc_id = job.document_id.as_str();
    let message = error.to_string();

    if error.is_transient() {
        if let RetryOutcome::Scheduled(delay) = engine.queue.retry(job, &message).await? {
            tracing::warn!(
                document_id = doc_id,
                job_id = %job.id,
                attempt = job.attempts,
                delay_secs = delay,
                error = %message,
                "Transient failure, retrying"
            );
            return Ok(JobOutcome::Retrying { delay });
        }
    } else {
        engine.queue.fail(job, &message).await?;
    }

    let current = store::get_document(&engine.pool, doc_id)
        .await?
        .map(|d| d.status.as_str().to_string());
    let stage = error
        .stage()
        .map(str::to_string)
        .or(current)
        .unwrap_or_else(|| "received".to_string());

    store::mark_failed(&engine.pool, doc_id, &job.lease_token, &stage, &message).await?;
    tracing::error!(document_id = doc_id, job_id = %job.id, stage = %stage, error = %message, "Document failed");
    Ok(JobOutcome::Failed { stage, message })
}

/// Drives one document to `indexed`. The caller must hold the lock under
/// `token`.
pub async fn process_document(engine: &Engine, id: &str, token: &str) -> Result<IndexReport, PipelineError> {
    let doc = load(engine, id).await?;
    let mut status = doc.status;

    if status.is_terminal() {
        tracing::debug!(document_id = id, status = %status, "Nothing to do");
        return Ok(IndexReport {
            chunks: doc.chunk_count as usize,
            indexed: doc.indexed_count as usize,
            failed: doc.failed_chunk_count as usize,
        });
    }

    if status == DocumentStatus::Received {
        advance(engine, id, token, status, DocumentStatus::Extracting).await?;
        status = DocumentStatus::Extracting;
    }

    let content = match status {
        DocumentStatus::Extracting | DocumentStatus::Redacting => {
            let content = extract_and_redact(engine, &doc, token, status).await?;
            advance(engine, id, token, DocumentStatus::Redacting, DocumentStatus::Embedding).await?;
            content
        }
        _ => store::load_content(&engine.pool, id)
            .await?
            .ok_or_else(|| PipelineError::ExtractionFailure("redacted content missing; reprocess the document".into()))?,
    };

    let report = index_content(engine, &doc, &content).await?;
    advance(engine, id, token, DocumentStatus::Embedding, DocumentStatus::Indexed).await?;

    if engine.config.hierarchy.enabled {
        store::set_hierarchy_status(&engine.pool, id, HierarchyStatus::Pending, 0).await?;
        engine.queue.enqueue(JobKind::BuildHierarchy, id).await?;
    }
    Ok(report)
}

async fn load(engine: &Engine, id: &str) -> Result<Document, PipelineError> {
    store::get_document(&engine.pool, id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("document {}", id)))
}

async fn advance(
    engine: &Engine,
    id: &str,
    token: &str,
    from: DocumentStatus,
    to: DocumentStatus,
) -> Result<(), PipelineError> {
    if store::transition(&engine.pool, id, token, from, to).await? {
        Ok(())
    } else {
        Err(PipelineError::Conflict(format!(
            "document {} left {} before it could move to {}",
            id, from, to
        )))
    }
}

/// Extraction and redaction run back to back so raw text only ever lives
/// in memory.
async fn extract_and_redact(
    engine: &Engine,
    doc: &Document,
    token: &str,
    status: DocumentStatus,
) -> Result<ExtractedContent, PipelineError> {
    let bytes = tokio::fs::read(&doc.storage_path)
        .await
        .map_err(|e| PipelineError::ExtractionFailure(format!("reading {}: {}", doc.storage_path, e)))?;

    let mut raw = extract_with_timeout(
        bytes,
        doc.mime_type.clone(),
        engine.config.worker.extract_timeout_secs,
    )
    .await?;
    store::record_extraction(&engine.pool, &doc.id, raw.page_count(), raw.word_count()).await?;
    store_images(&mut raw, doc).await?;

    if status == DocumentStatus::Extracting {
        advance(engine, &doc.id, token, DocumentStatus::Extracting, DocumentStatus::Redacting).await?;
    }

    if !engine.config.redaction.enabled {
        tracing::warn!(document_id = %doc.id, "Redaction disabled; indexing unmasked text");
        store::record_redaction(&engine.pool, &doc.id, &[], true).await?;
        store::save_content(&engine.pool, &doc.id, &raw, &[]).await?;
        return Ok(raw);
    }

    let (content, redacted) = redact_content(engine.redactor.as_ref(), &raw).await?;
    let categories = redacted.categories();
    if !redacted.findings.is_empty() {
        tracing::info!(
            document_id = %doc.id,
            findings = redacted.findings.len(),
            categories = ?categories,
            "Masked sensitive spans"
        );
    }
    store::record_redaction(&engine.pool, &doc.id, &categories, false).await?;
    store::save_content(&engine.pool, &doc.id, &content, &redacted.findings).await?;
    Ok(content)
}

/// Writes embedded image bytes next to the upload and records their paths.
/// An image upload is its own artifact.
async fn store_images(content: &mut ExtractedContent, doc: &Document) -> Result<(), PipelineError> {
    let upload = Path::new(&doc.storage_path);
    let dir = upload.parent().unwrap_or_else(|| Path::new("."));
    for image in content.images.iter_mut().filter(|i| i.path.is_none()) {
        if doc.file_type == FileType::Image.as_str() || image.bytes.is_empty() {
            image.path = Some(doc.storage_path.clone());
            continue;
        }
        let ext = image.mime_type.rsplit('/').next().unwrap_or("bin");
        let path = dir.join(format!("{}_{}.{}", doc.id, image.id, ext));
        tokio::fs::write(&path, &image.bytes)
            .await
            .map_err(|e| PipelineError::ExtractionFailure(format!("storing image {}: {}", image.id, e)))?;
        image.path = Some(path.to_string_lossy().to_string());
    }
    Ok(())
}

/// Chunks, embeds and upserts. Chunks that exhaust their embedding retries
/// are recorded as failed without failing the document, unless every chunk
/// failed.
pub async fn index_content(
    engine: &Engine,
    doc: &Document,
    content: &ExtractedContent,
) -> Result<IndexReport, PipelineError> {
    if !engine.embeddings_enabled() {
        return Err(PipelineError::EmbeddingsDisabled);
    }

    let chunks = chunk_content(
        &doc.id,
        content,
        engine.config.chunking.max_tokens,
        engine.config.chunking.overlap_tokens,
    );
    let stale = store::replace_chunks(&engine.pool, &doc.id, &chunks).await?;
    if !stale.is_empty() {
        engine.index.delete_chunks(&stale).await?;
        tracing::debug!(document_id = %doc.id, stale = stale.len(), "Dropped stale index entries");
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let results = embed_all(
        Arc::clone(&engine.embedder),
        &texts,
        engine.config.embedding.batch_size,
        engine.config.worker.parallel_embeddings,
        engine.config.embedding.max_retries,
    )
    .await;

    let indexed_at = now_millis();
    let mut entries = Vec::with_capacity(chunks.len());
    let mut outcomes = Vec::with_capacity(chunks.len());
    let mut first_error = None;
    for (chunk, result) in chunks.iter().zip(results) {
        match result {
            Ok(vector) => {
                entries.push(IndexEntry {
                    chunk_id: chunk.id.clone(),
                    document_id: doc.id.clone(),
                    vector,
                    metadata: EntryMetadata {
                        filename: doc.filename.clone(),
                        chunk_index: chunk.chunk_index,
                        page_number: chunk.page_number,
                        section_title: chunk.section_title.clone(),
                        text: chunk.text.clone(),
                        owner: doc.owner.clone(),
                    },
                    indexed_at,
                });
                outcomes.push((chunk.id.clone(), None));
            }
            Err(e) => {
                tracing::warn!(document_id = %doc.id, chunk_id = %chunk.id, error = %e, "Chunk embedding failed");
                first_error.get_or_insert_with(|| e.clone());
                outcomes.push((chunk.id.clone(), Some(e)));
            }
        }
    }

    // Chunk ids are stable, so a failed chunk may still have an entry from
    // an earlier run built from different (possibly unmasked) text.
    let failed_ids: Vec<String> = outcomes
        .iter()
        .filter(|(_, error)| error.is_some())
        .map(|(id, _)| id.clone())
        .collect();
    if !failed_ids.is_empty() {
        engine.index.delete_chunks(&failed_ids).await?;
    }

    if !chunks.is_empty() && entries.is_empty() {
        store::mark_chunks(&engine.pool, &outcomes).await?;
        return Err(PipelineError::EmbeddingFailure(format!(
            "all {} chunks failed: {}",
            chunks.len(),
            first_error.unwrap_or_default()
        )));
    }

    if !entries.is_empty() {
        engine.index.upsert(&entries).await?;
    }
    store::mark_chunks(&engine.pool, &outcomes).await?;

    let report = IndexReport {
        chunks: chunks.len(),
        indexed: entries.len(),
        failed: chunks.len() - entries.len(),
    };
    store::record_indexing(&engine.pool, &doc.id, report.chunks, report.indexed, report.failed).await?;
    Ok(report)
}

async fn run_hierarchy_job(engine: &Engine, job: &Job) -> anyhow::Result<JobOutcome> {
    let pool = &engine.pool;
    let doc_id = job.document_id.as_str();

    if store::get_document(pool, doc_id).await?.is_none() {
        engine.queue.fail(job, "document no longer exists").await?;
        return Ok(JobOutcome::Dropped);
    }

    if !store::acquire_lock(pool, doc_id, &job.lease_token, engine.config.worker.lease_secs).await? {
        tracing::debug!(document_id = doc_id, job_id = %job.id, "Document locked, deferring hierarchy build");
        engine.queue.requeue(job, engine.config.worker.backoff_base_secs).await?;
        return Ok(JobOutcome::Deferred);
    }

    let outcome = match build_hierarchy_locked(engine, doc_id, &job.lease_token).await {
        Ok(nodes) => {
            tracing::info!(document_id = doc_id, nodes, "Hierarchy built");
            engine.queue.complete(job).await.map(|_| JobOutcome::Completed)
        }
        Err(e) => hierarchy_failure(engine, job, e).await,
    };

    let released = store::release_lock(pool, doc_id, &job.lease_token).await;
    let outcome = outcome?;
    released?;
    Ok(outcome)
}

async fn hierarchy_failure(engine: &Engine, job: &Job, error: PipelineError) -> anyhow::Result<JobOutcome> {
    let doc_id = job.document_id.as_str();
    match error {
        PipelineError::NotFound(_) => {
            engine.queue.fail(job, "document no longer exists").await?;
            Ok(JobOutcome::Dropped)
        }
        e if e.is_transient() && !job.is_last_attempt() => {
            let delay = match engine.queue.retry(job, &e.to_string()).await? {
                RetryOutcome::Scheduled(delay) => delay,
                RetryOutcome::Exhausted => 0,
            };
            Ok(JobOutcome::Retrying { delay })
        }
        e => {
            let message = e.to_string();
            tracing::error!(document_id = doc_id, error = %message, "Hierarchy build failed");
            store::set_hierarchy_status(&engine.pool, doc_id, HierarchyStatus::Failed, 0).await?;
            engine.queue.fail(job, &message).await?;
            Ok(JobOutcome::Failed {
                stage: "hierarchy".into(),
                message,
            })
        }
    }
}

/// Rebuilds the tree of an indexed document under its own lock. Returns
/// the node count, or `Conflict` while a job holds the document.
pub async fn build_hierarchy(engine: &Engine, id: &str) -> Result<usize, PipelineError> {
    load(engine, id).await?;
    let token = uuid::Uuid::new_v4().to_string();
    if !store::acquire_lock(&engine.pool, id, &token, engine.config.worker.lease_secs).await? {
        return Err(PipelineError::Conflict(format!(
            "document {} is being processed; try again later",
            id
        )));
    }
    let result = build_hierarchy_locked(engine, id, &token).await;
    let released = store::release_lock(&engine.pool, id, &token).await;
    let nodes = result?;
    released?;
    Ok(nodes)
}

/// The caller must hold the document lock under `token`.
async fn build_hierarchy_locked(engine: &Engine, id: &str, token: &str) -> Result<usize, PipelineError> {
    let doc = load(engine, id).await?;
    if doc.status != DocumentStatus::Indexed {
        return Err(PipelineError::Conflict(format!(
            "document {} is {}; only indexed documents get a hierarchy",
            id, doc.status
        )));
    }
    if !engine.embeddings_enabled() {
        return Err(PipelineError::EmbeddingsDisabled);
    }

    let content = store::load_content(&engine.pool, id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("content of document {}", id)))?;
    let chunks = store::load_chunks(&engine.pool, id).await?;

    let mut nodes = build_tree(id, &doc.filename, &content, &chunks, &engine.config.hierarchy);
    embed_nodes(&mut nodes, engine.embedder.as_ref(), engine.config.embedding.batch_size)
        .await
        .map_err(|e| PipelineError::EmbeddingFailure(e.to_string()))?;

    // A slow build may have outlived its lock.
    if !store::extend_lock(&engine.pool, id, token, engine.config.worker.lease_secs).await? {
        return Err(PipelineError::Conflict(format!(
            "lost the lock on document {} while building its hierarchy",
            id
        )));
    }
    save_tree(&engine.pool, id, &nodes).await?;
    store::set_hierarchy_status(&engine.pool, id, HierarchyStatus::Ready, nodes.len()).await?;
    Ok(nodes.len())
}
