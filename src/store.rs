//! Row-level access to documents, their redacted content and chunks.
//!
//! Status changes go through [`transition`], a compare-and-set on
//! `(id, status, lock_token)`: only the holder of the document lock can
//! move a document, and only along an edge of the state machine.

use anyhow::{bail, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::db::now_secs;
use crate::models::{Chunk, Document, DocumentStatus, ExtractedContent, HierarchyStatus, RedactionFinding};

/// Fields known at upload time.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: String,
    pub filename: String,
    pub file_type: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub owner: Option<String>,
    pub storage_path: String,
}

pub async fn insert_document(pool: &SqlitePool, doc: &NewDocument) -> Result<()> {
    let now = now_secs();
    sqlx::query(
        "INSERT INTO documents (id, filename, file_type, mime_type, size_bytes, owner, status,
            created_at, updated_at, storage_path)
         VALUES (?, ?, ?, ?, ?, ?, 'received', ?, ?, ?)",
    )
    .bind(&doc.id)
    .bind(&doc.filename)
    .bind(&doc.file_type)
    .bind(&doc.mime_type)
    .bind(doc.size_bytes)
    .bind(&doc.owner)
    .bind(now)
    .bind(now)
    .bind(&doc.storage_path)
    .execute(pool)
    .await?;
    Ok(())
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    let status = DocumentStatus::parse(&status)
        .ok_or_else(|| anyhow::anyhow!("unknown document status in database: {}", status))?;
    let categories: String = row.get("pii_categories");
    let hierarchy: String = row.get("hierarchy_status");

    Ok(Document {
        id: row.get("id"),
        filename: row.get("filename"),
        file_type: row.get("file_type"),
        mime_type: row.get("mime_type"),
        size_bytes: row.get("size_bytes"),
        owner: row.get("owner"),
        status,
        failed_stage: row.get("failed_stage"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        processed_at: row.get("processed_at"),
        page_count: row.get("page_count"),
        word_count: row.get("word_count"),
        chunk_count: row.get("chunk_count"),
        indexed_count: row.get("indexed_count"),
        failed_chunk_count: row.get("failed_chunk_count"),
        has_pii: row.get::<i64, _>("has_pii") != 0,
        pii_categories: serde_json::from_str(&categories).unwrap_or_default(),
        redaction_skipped: row.get::<i64, _>("redaction_skipped") != 0,
        hierarchy_status: HierarchyStatus::parse(&hierarchy),
        tree_node_count: row.get("tree_node_count"),
        storage_path: row.get("storage_path"),
    })
}

pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_document).transpose()
}

/// One page of documents, newest first, plus the total matching count.
pub async fn list_documents(
    pool: &SqlitePool,
    status: Option<DocumentStatus>,
    page: u32,
    page_size: u32,
) -> Result<(Vec<Document>, i64)> {
    let status_str = status.map(|s| s.as_str());
    let offset = (page.max(1) as i64 - 1) * page_size as i64;

    let total: i64 = sqlx::query("SELECT COUNT(*) FROM documents WHERE (? IS NULL OR status = ?)")
        .bind(status_str)
        .bind(status_str)
        .fetch_one(pool)
        .await?
        .get(0);

    let rows = sqlx::query(
        "SELECT * FROM documents WHERE (? IS NULL OR status = ?)
         ORDER BY created_at DESC, id ASC LIMIT ? OFFSET ?",
    )
    .bind(status_str)
    .bind(status_str)
    .bind(page_size as i64)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let docs = rows.iter().map(row_to_document).collect::<Result<Vec<_>>>()?;
    Ok((docs, total))
}

/// Number of documents per status.
pub async fn status_counts(pool: &SqlitePool) -> Result<std::collections::BTreeMap<String, i64>> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM documents GROUP BY status")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get::<String, _>("status"), r.get::<i64, _>("n")))
        .collect())
}

// ============ Lock ============

/// Takes the document lock if it is free or expired.
pub async fn acquire_lock(pool: &SqlitePool, id: &str, token: &str, lease_secs: u64) -> Result<bool> {
    let now = now_secs();
    let result = sqlx::query(
        "UPDATE documents SET lock_token = ?, lock_expires_at = ?
         WHERE id = ? AND (lock_token IS NULL OR lock_token = ? OR lock_expires_at < ?)",
    )
    .bind(token)
    .bind(now + lease_secs as i64)
    .bind(id)
    .bind(token)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Pushes the expiry of a lock the caller still holds.
pub async fn extend_lock(pool: &SqlitePool, id: &str, token: &str, lease_secs: u64) -> Result<bool> {
    let result = sqlx::query("UPDATE documents SET lock_expires_at = ? WHERE id = ? AND lock_token = ?")
        .bind(now_secs() + lease_secs as i64)
        .bind(id)
        .bind(token)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn release_lock(pool: &SqlitePool, id: &str, token: &str) -> Result<()> {
    sqlx::query("UPDATE documents SET lock_token = NULL, lock_expires_at = NULL WHERE id = ? AND lock_token = ?")
        .bind(id)
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

/// Whether some holder has an unexpired lock on the document.
pub async fn is_locked(pool: &SqlitePool, id: &str) -> Result<bool> {
    let row = sqlx::query(
        "SELECT 1 FROM documents WHERE id = ? AND lock_token IS NOT NULL AND lock_expires_at >= ?",
    )
    .bind(id)
    .bind(now_secs())
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

// ============ State machine ============

/// Moves `id` from `from` to `to` if the caller holds the lock and the
/// document is still in `from`. Returns whether the row changed.
pub async fn transition(
    pool: &SqlitePool,
    id: &str,
    token: &str,
    from: DocumentStatus,
    to: DocumentStatus,
) -> Result<bool> {
    if !from.can_transition_to(to) {
        bail!("illegal document transition {} -> {}", from, to);
    }
    let now = now_secs();
    let result = sqlx::query(
        "UPDATE documents
         SET status = ?, updated_at = ?,
             processed_at = CASE WHEN ? = 'indexed' THEN ? ELSE processed_at END
         WHERE id = ? AND status = ? AND lock_token = ?",
    )
    .bind(to.as_str())
    .bind(now)
    .bind(to.as_str())
    .bind(now)
    .bind(id)
    .bind(from.as_str())
    .bind(token)
    .execute(pool)
    .await?;

    let changed = result.rows_affected() == 1;
    if changed {
        tracing::info!(document_id = id, from = from.as_str(), to = to.as_str(), "Document transition");
    }
    Ok(changed)
}

/// Fails a non-terminal document, recording the stage and cause.
pub async fn mark_failed(pool: &SqlitePool, id: &str, token: &str, stage: &str, message: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE documents
         SET status = 'failed', failed_stage = ?, error_message = ?, updated_at = ?
         WHERE id = ? AND lock_token = ? AND status NOT IN ('indexed', 'failed')",
    )
    .bind(stage)
    .bind(message)
    .bind(now_secs())
    .bind(id)
    .bind(token)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Resets a terminal document to `received` for reprocessing.
pub async fn reset_for_reprocess(pool: &SqlitePool, id: &str, token: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE documents
         SET status = 'received', failed_stage = NULL, error_message = NULL, updated_at = ?
         WHERE id = ? AND lock_token = ? AND status IN ('indexed', 'failed')",
    )
    .bind(now_secs())
    .bind(id)
    .bind(token)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn record_extraction(pool: &SqlitePool, id: &str, page_count: usize, word_count: usize) -> Result<()> {
    sqlx::query("UPDATE documents SET page_count = ?, word_count = ?, updated_at = ? WHERE id = ?")
        .bind(page_count as i64)
        .bind(word_count as i64)
        .bind(now_secs())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn record_redaction(
    pool: &SqlitePool,
    id: &str,
    categories: &[String],
    skipped: bool,
) -> Result<()> {
    sqlx::query(
        "UPDATE documents SET has_pii = ?, pii_categories = ?, redaction_skipped = ?, updated_at = ? WHERE id = ?",
    )
    .bind(!categories.is_empty() as i64)
    .bind(serde_json::to_string(categories)?)
    .bind(skipped as i64)
    .bind(now_secs())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_indexing(
    pool: &SqlitePool,
    id: &str,
    chunk_count: usize,
    indexed_count: usize,
    failed_count: usize,
) -> Result<()> {
    sqlx::query(
        "UPDATE documents SET chunk_count = ?, indexed_count = ?, failed_chunk_count = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(chunk_count as i64)
    .bind(indexed_count as i64)
    .bind(failed_count as i64)
    .bind(now_secs())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_hierarchy_status(
    pool: &SqlitePool,
    id: &str,
    status: HierarchyStatus,
    node_count: usize,
) -> Result<()> {
    sqlx::query("UPDATE documents SET hierarchy_status = ?, tree_node_count = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(node_count as i64)
        .bind(now_secs())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============ Content ============

/// Stores redacted content and its findings. Never called with raw text.
pub async fn save_content(
    pool: &SqlitePool,
    id: &str,
    content: &ExtractedContent,
    findings: &[RedactionFinding],
) -> Result<()> {
    sqlx::query(
        "INSERT INTO document_content (document_id, content_json, findings_json, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(document_id) DO UPDATE SET
            content_json = excluded.content_json,
            findings_json = excluded.findings_json,
            updated_at = excluded.updated_at",
    )
    .bind(id)
    .bind(serde_json::to_string(content)?)
    .bind(serde_json::to_string(findings)?)
    .bind(now_secs())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_content(pool: &SqlitePool, id: &str) -> Result<Option<ExtractedContent>> {
    let row = sqlx::query("SELECT content_json FROM document_content WHERE document_id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => {
            let json: String = row.get("content_json");
            Ok(Some(serde_json::from_str(&json)?))
        }
        None => Ok(None),
    }
}

/// Number of findings recorded for the document's content.
pub async fn finding_count(pool: &SqlitePool, id: &str) -> Result<usize> {
    let row = sqlx::query("SELECT findings_json FROM document_content WHERE document_id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(0);
    };
    let json: String = row.get("findings_json");
    let findings: Vec<serde_json::Value> = serde_json::from_str(&json)?;
    Ok(findings.len())
}

// ============ Chunks ============

/// Replaces the document's chunks. Returns the ids that existed before but
/// are gone now, so stale index entries can be removed.
pub async fn replace_chunks(pool: &SqlitePool, document_id: &str, chunks: &[Chunk]) -> Result<Vec<String>> {
    let old = chunk_ids(pool, document_id).await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, text, hash, start_offset, end_offset,
                page_number, section_title, redaction_count, embed_status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending')",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .bind(chunk.start as i64)
        .bind(chunk.end as i64)
        .bind(chunk.page_number.map(|p| p as i64))
        .bind(&chunk.section_title)
        .bind(chunk.redaction_count as i64)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    Ok(old
        .into_iter()
        .filter(|id| !chunks.iter().any(|c| &c.id == id))
        .collect())
}

pub async fn load_chunks(pool: &SqlitePool, document_id: &str) -> Result<Vec<Chunk>> {
    let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC")
        .bind(document_id)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| Chunk {
            id: row.get("id"),
            document_id: row.get("document_id"),
            chunk_index: row.get("chunk_index"),
            text: row.get("text"),
            hash: row.get("hash"),
            start: row.get::<i64, _>("start_offset") as usize,
            end: row.get::<i64, _>("end_offset") as usize,
            page_number: row.get::<Option<i64>, _>("page_number").map(|p| p as u32),
            section_title: row.get("section_title"),
            redaction_count: row.get::<i64, _>("redaction_count") as u32,
        })
        .collect())
}

pub async fn chunk_ids(pool: &SqlitePool, document_id: &str) -> Result<Vec<String>> {
    let rows = sqlx::query("SELECT id FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC")
        .bind(document_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get("id")).collect())
}

/// Records each chunk's embedding outcome: `None` for indexed, the error
/// message for failed.
pub async fn mark_chunks(pool: &SqlitePool, outcomes: &[(String, Option<String>)]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for (id, error) in outcomes {
        sqlx::query("UPDATE chunks SET embed_status = ?, embed_error = ? WHERE id = ?")
            .bind(if error.is_some() { "failed" } else { "indexed" })
            .bind(error)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// `(chunk_id, error)` for every chunk that failed to embed.
pub async fn failed_chunks(pool: &SqlitePool, document_id: &str) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query(
        "SELECT id, embed_error FROM chunks WHERE document_id = ? AND embed_status = 'failed' ORDER BY chunk_index",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| {
            (
                r.get("id"),
                r.get::<Option<String>, _>("embed_error").unwrap_or_default(),
            )
        })
        .collect())
}

/// Removes every row belonging to a document in one transaction.
pub async fn delete_document_rows(pool: &SqlitePool, id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    for table in [
        "DELETE FROM chunks WHERE document_id = ?",
        "DELETE FROM document_content WHERE document_id = ?",
        "DELETE FROM tree_nodes WHERE document_id = ?",
        "DELETE FROM jobs WHERE document_id = ?",
        "DELETE FROM documents WHERE id = ?",
    ] {
        sqlx::query(table).bind(id).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}
