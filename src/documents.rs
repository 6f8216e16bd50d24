//! Document lifecycle operations shared by the HTTP API and the CLI.
//!
//! Upload stores the bytes and queues processing; everything after that
//! happens in the worker. Delete and reprocess take the document lock so
//! they never race a running job.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::engine::Engine;
use crate::error::PipelineError;
use crate::index::remove_document;
use crate::models::{Document, DocumentStatus, FileType, HierarchyStatus};
use crate::queue::JobKind;
use crate::store::{self, NewDocument};

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub document_id: String,
    pub filename: String,
    pub file_type: String,
    pub file_size: u64,
    pub status: DocumentStatus,
    pub task_id: Option<String>,
    pub message: String,
    /// The same bytes under the same name were uploaded before.
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentList {
    pub documents: Vec<Document>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkFailure {
    pub chunk_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub document_id: String,
    pub filename: String,
    pub status: DocumentStatus,
    pub progress: u8,
    pub failed_stage: Option<String>,
    pub error_message: Option<String>,
    pub page_count: i64,
    pub word_count: i64,
    pub chunk_count: i64,
    pub indexed_count: i64,
    pub failed_chunk_count: i64,
    pub failed_chunks: Vec<ChunkFailure>,
    pub has_pii: bool,
    pub pii_categories: Vec<String>,
    pub redaction_findings: usize,
    pub redaction_skipped: bool,
    pub hierarchy_status: HierarchyStatus,
    pub tree_node_count: i64,
    pub active_task: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReceipt {
    pub document_id: String,
    pub deleted: bool,
    pub removed_entries: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReceipt {
    pub document_id: String,
    pub status: DocumentStatus,
    pub task_id: String,
    pub message: String,
}

/// First 16 hex chars of SHA-256(bytes ‖ filename).
pub fn document_id(bytes: &[u8], filename: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.update(filename.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Drops any directory part a client may have sent.
fn clean_filename(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).trim().to_string()
}

/// Validates, stores and queues an upload. Re-uploading identical bytes
/// under the same name returns the existing document.
pub async fn upload(
    engine: &Engine,
    filename: &str,
    bytes: &[u8],
    owner: Option<String>,
) -> Result<UploadReceipt, PipelineError> {
    let filename = clean_filename(filename);
    if filename.is_empty() {
        return Err(PipelineError::InvalidInput("filename is required".into()));
    }
    if bytes.is_empty() {
        return Err(PipelineError::InvalidInput("file is empty".into()));
    }

    let storage = &engine.config.storage;
    let limit = storage.max_upload_bytes();
    if bytes.len() as u64 > limit {
        return Err(PipelineError::PayloadTooLarge {
            size: bytes.len() as u64,
            limit,
        });
    }

    let ext = filename
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    let file_type = FileType::from_filename(&filename)
        .filter(|_| storage.allowed_types.iter().any(|t| t.eq_ignore_ascii_case(&ext)))
        .ok_or_else(|| {
            PipelineError::UnsupportedFormat(format!(
                "'{}' (allowed: {})",
                filename,
                storage.allowed_types.join(", ")
            ))
        })?;

    let id = document_id(bytes, &filename);
    if let Some(existing) = store::get_document(&engine.pool, &id).await? {
        let task_id = engine.queue.active_job(&id).await?;
        return Ok(UploadReceipt {
            document_id: id,
            filename: existing.filename,
            file_type: existing.file_type,
            file_size: existing.size_bytes as u64,
            status: existing.status,
            task_id,
            message: "Document already uploaded".into(),
            duplicate: true,
        });
    }

    tokio::fs::create_dir_all(&storage.upload_dir)
        .await
        .map_err(|e| PipelineError::Internal(format!("creating {}: {}", storage.upload_dir.display(), e)))?;
    let path: PathBuf = storage.upload_dir.join(format!("{}.{}", id, ext));
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| PipelineError::Internal(format!("writing {}: {}", path.display(), e)))?;

    store::insert_document(
        &engine.pool,
        &NewDocument {
            id: id.clone(),
            filename: filename.clone(),
            file_type: file_type.as_str().to_string(),
            mime_type: file_type.mime_type(&filename).to_string(),
            size_bytes: bytes.len() as i64,
            owner,
            storage_path: path.to_string_lossy().to_string(),
        },
    )
    .await?;
    let task_id = engine.queue.enqueue(JobKind::ProcessDocument, &id).await?;

    tracing::info!(document_id = %id, filename = %filename, size = bytes.len(), "Document received");
    Ok(UploadReceipt {
        document_id: id,
        filename,
        file_type: file_type.as_str().to_string(),
        file_size: bytes.len() as u64,
        status: DocumentStatus::Received,
        task_id: Some(task_id),
        message: "Document queued for processing".into(),
        duplicate: false,
    })
}

pub async fn list(
    engine: &Engine,
    status: Option<DocumentStatus>,
    page: u32,
    page_size: u32,
) -> Result<DocumentList, PipelineError> {
    let page = page.max(1);
    let page_size = page_size.clamp(1, 100);
    let (documents, total) = store::list_documents(&engine.pool, status, page, page_size).await?;
    let has_more = (page as i64) * (page_size as i64) < total;
    Ok(DocumentList {
        documents,
        total,
        page,
        page_size,
        has_more,
    })
}

pub async fn get(engine: &Engine, id: &str) -> Result<Document, PipelineError> {
    store::get_document(&engine.pool, id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("document {}", id)))
}

pub async fn status(engine: &Engine, id: &str) -> Result<StatusReport, PipelineError> {
    let doc = get(engine, id).await?;
    let failed_chunks = store::failed_chunks(&engine.pool, id)
        .await?
        .into_iter()
        .map(|(chunk_id, error)| ChunkFailure { chunk_id, error })
        .collect();
    let redaction_findings = store::finding_count(&engine.pool, id).await?;
    let active_task = engine.queue.active_job(id).await?;

    Ok(StatusReport {
        document_id: doc.id,
        filename: doc.filename,
        progress: doc.status.progress(),
        status: doc.status,
        failed_stage: doc.failed_stage,
        error_message: doc.error_message,
        page_count: doc.page_count,
        word_count: doc.word_count,
        chunk_count: doc.chunk_count,
        indexed_count: doc.indexed_count,
        failed_chunk_count: doc.failed_chunk_count,
        failed_chunks,
        has_pii: doc.has_pii,
        pii_categories: doc.pii_categories,
        redaction_findings,
        redaction_skipped: doc.redaction_skipped,
        hierarchy_status: doc.hierarchy_status,
        tree_node_count: doc.tree_node_count,
        active_task,
        updated_at: doc.updated_at,
    })
}

/// Removes a document's index entries, tree, rows and files.
///
/// Fails with `Conflict` while a worker holds the document lock, and with
/// `IndexDeleteInconsistency` if the index still reports entries afterwards;
/// in that case the rows are kept so the delete can be retried.
pub async fn delete(engine: &Engine, id: &str) -> Result<DeleteReceipt, PipelineError> {
    let doc = get(engine, id).await?;
    let token = uuid::Uuid::new_v4().to_string();
    if !store::acquire_lock(&engine.pool, id, &token, engine.config.worker.lease_secs).await? {
        return Err(PipelineError::Conflict(format!(
            "document {} is being processed; retry once it finishes",
            id
        )));
    }

    let result = remove_everything(engine, &doc).await;
    if result.is_err() {
        store::release_lock(&engine.pool, id, &token).await?;
    }
    let removed_entries = result?;

    tracing::info!(document_id = id, removed_entries, "Document deleted");
    Ok(DeleteReceipt {
        document_id: id.to_string(),
        deleted: true,
        removed_entries,
        message: format!("Deleted {}", doc.filename),
    })
}

async fn remove_everything(engine: &Engine, doc: &Document) -> Result<usize, PipelineError> {
    let chunk_ids = store::chunk_ids(&engine.pool, &doc.id).await?;
    let artifacts: Vec<String> = store::load_content(&engine.pool, &doc.id)
        .await?
        .map(|c| c.images.into_iter().filter_map(|i| i.path).collect())
        .unwrap_or_default();

    remove_document(engine.index.as_ref(), &doc.id, &chunk_ids).await?;
    crate::hierarchy::delete_tree(&engine.pool, &doc.id).await?;
    engine.queue.delete_for_document(&doc.id).await?;
    store::delete_document_rows(&engine.pool, &doc.id).await?;

    for path in std::iter::once(doc.storage_path.clone()).chain(artifacts) {
        remove_file(Path::new(&path)).await;
    }
    Ok(chunk_ids.len())
}

async fn remove_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Could not remove stored file"),
    }
}

/// Resets a terminal document to `received` and queues it again.
pub async fn reprocess(engine: &Engine, id: &str) -> Result<TaskReceipt, PipelineError> {
    let doc = get(engine, id).await?;
    if !doc.status.is_terminal() {
        return Err(PipelineError::Conflict(format!(
            "document {} is still {}",
            id, doc.status
        )));
    }

    let token = uuid::Uuid::new_v4().to_string();
    if !store::acquire_lock(&engine.pool, id, &token, engine.config.worker.lease_secs).await? {
        return Err(PipelineError::Conflict(format!("document {} is locked", id)));
    }
    let reset = store::reset_for_reprocess(&engine.pool, id, &token).await;
    store::release_lock(&engine.pool, id, &token).await?;
    if !reset? {
        return Err(PipelineError::Conflict(format!("document {} changed state", id)));
    }

    let task_id = engine.queue.enqueue(JobKind::ProcessDocument, id).await?;
    tracing::info!(document_id = id, task_id = %task_id, "Document queued for reprocessing");
    Ok(TaskReceipt {
        document_id: id.to_string(),
        status: DocumentStatus::Received,
        task_id,
        message: "Document queued for reprocessing".into(),
    })
}

/// Queues a hierarchy build for an indexed document.
pub async fn request_hierarchy(engine: &Engine, id: &str) -> Result<TaskReceipt, PipelineError> {
    let doc = get(engine, id).await?;
    if doc.status != DocumentStatus::Indexed {
        return Err(PipelineError::Conflict(format!(
            "document {} is {}; only indexed documents get a hierarchy",
            id, doc.status
        )));
    }
    if !engine.embeddings_enabled() {
        return Err(PipelineError::EmbeddingsDisabled);
    }

    store::set_hierarchy_status(&engine.pool, id, HierarchyStatus::Pending, doc.tree_node_count as usize).await?;
    let task_id = engine.queue.enqueue(JobKind::BuildHierarchy, id).await?;
    Ok(TaskReceipt {
        document_id: id.to_string(),
        status: doc.status,
        task_id,
        message: "Hierarchy build queued".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::engine::Overrides;
    use crate::index::{IndexFilter, MemoryIndex};
    use crate::worker::run_until_idle;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn engine(tmp: &TempDir) -> Arc<Engine> {
        let mut config = crate::config::Config::minimal();
        config.db.path = tmp.path().join("docs.sqlite");
        config.storage.upload_dir = tmp.path().join("uploads");
        config.storage.max_upload_mb = 1;
        config.worker.poll_interval_ms = 10;
        let overrides = Overrides {
            embedder: Some(Arc::new(HashProvider::new(32))),
            index: Some(Arc::new(MemoryIndex::new(32))),
            ..Overrides::default()
        };
        Engine::open_with(&config, overrides).await.unwrap()
    }

    #[test]
    fn ids_depend_on_bytes_and_name() {
        let a = document_id(b"hello", "a.txt");
        assert_eq!(a.len(), 16);
        assert_eq!(a, document_id(b"hello", "a.txt"));
        assert_ne!(a, document_id(b"hello", "b.txt"));
        assert_ne!(a, document_id(b"hello!", "a.txt"));
        assert_eq!(clean_filename("../../etc/report.pdf"), "report.pdf");
        assert_eq!(clean_filename("C:\\docs\\memo.txt"), "memo.txt");
    }

    #[tokio::test]
    async fn upload_validates_and_dedupes() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;

        let err = upload(&engine, "tool.exe", b"MZ", None).await.unwrap_err();
        assert_eq!(err.code(), "unsupported_format");
        let err = upload(&engine, "empty.txt", b"", None).await.unwrap_err();
        assert_eq!(err.code(), "bad_request");
        let big = vec![b'a'; 2 * 1024 * 1024];
        let err = upload(&engine, "big.txt", &big, None).await.unwrap_err();
        assert_eq!(err.code(), "payload_too_large");

        let first = upload(&engine, "notes.txt", b"Tides follow the moon.", None).await.unwrap();
        assert!(!first.duplicate);
        assert_eq!(first.status, DocumentStatus::Received);
        assert!(first.task_id.is_some());
        let doc = get(&engine, &first.document_id).await.unwrap();
        assert!(Path::new(&doc.storage_path).exists());

        let again = upload(&engine, "notes.txt", b"Tides follow the moon.", None).await.unwrap();
        assert!(again.duplicate);
        assert_eq!(again.document_id, first.document_id);
        assert_eq!(again.task_id, first.task_id);
        assert_eq!(list(&engine, None, 1, 10).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn list_pages_report_has_more() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        for n in 0..3 {
            upload(&engine, &format!("f{}.txt", n), format!("body {}", n).as_bytes(), None)
                .await
                .unwrap();
        }
        let page = list(&engine, None, 1, 2).await.unwrap();
        assert_eq!(page.documents.len(), 2);
        assert!(page.has_more);
        let page = list(&engine, None, 2, 2).await.unwrap();
        assert_eq!(page.documents.len(), 1);
        assert!(!page.has_more);
        let indexed = list(&engine, Some(DocumentStatus::Indexed), 1, 10).await.unwrap();
        assert_eq!(indexed.total, 0);
    }

    #[tokio::test]
    async fn delete_removes_everything_and_respects_lock() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        let receipt = upload(&engine, "ships.md", b"# Ships\n\nShips sail the sea.", None).await.unwrap();
        let id = receipt.document_id;
        run_until_idle(&engine).await.unwrap();

        let report = status(&engine, &id).await.unwrap();
        assert_eq!(report.status, DocumentStatus::Indexed);
        assert_eq!(report.progress, 100);
        assert!(report.active_task.is_none());

        assert!(store::acquire_lock(&engine.pool, &id, "worker", 60).await.unwrap());
        let err = delete(&engine, &id).await.unwrap_err();
        assert_eq!(err.code(), "conflict");
        store::release_lock(&engine.pool, &id, "worker").await.unwrap();

        let doc = get(&engine, &id).await.unwrap();
        let out = delete(&engine, &id).await.unwrap();
        assert!(out.deleted);
        assert!(out.removed_entries >= 1);
        assert!(!Path::new(&doc.storage_path).exists());
        assert_eq!(engine.index.count(&IndexFilter::documents(vec![id.clone()])).await.unwrap(), 0);
        assert_eq!(get(&engine, &id).await.unwrap_err().code(), "not_found");
        assert_eq!(delete(&engine, &id).await.unwrap_err().code(), "not_found");
    }

    #[tokio::test]
    async fn reprocess_requires_terminal_state() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        let id = upload(&engine, "a.txt", b"Salt marshes flood twice daily.", None)
            .await
            .unwrap()
            .document_id;
        assert_eq!(reprocess(&engine, &id).await.unwrap_err().code(), "conflict");
        assert_eq!(request_hierarchy(&engine, &id).await.unwrap_err().code(), "conflict");

        run_until_idle(&engine).await.unwrap();
        let receipt = reprocess(&engine, &id).await.unwrap();
        assert_eq!(receipt.status, DocumentStatus::Received);
        run_until_idle(&engine).await.unwrap();

        let doc = get(&engine, &id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);
        assert_eq!(
            engine.index.count(&IndexFilter::documents(vec![id.clone()])).await.unwrap() as i64,
            doc.chunk_count
        );

        let tree = request_hierarchy(&engine, &id).await.unwrap();
        assert!(!tree.task_id.is_empty());
        run_until_idle(&engine).await.unwrap();
        assert_eq!(get(&engine, &id).await.unwrap().hierarchy_status, HierarchyStatus::Ready);
    }
}
