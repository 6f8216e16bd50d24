//! Idempotent schema setup. Every statement is safe to re-run.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        filename TEXT NOT NULL,
        file_type TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        owner TEXT,
        status TEXT NOT NULL,
        failed_stage TEXT,
        error_message TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        processed_at INTEGER,
        page_count INTEGER NOT NULL DEFAULT 0,
        word_count INTEGER NOT NULL DEFAULT 0,
        chunk_count INTEGER NOT NULL DEFAULT 0,
        indexed_count INTEGER NOT NULL DEFAULT 0,
        failed_chunk_count INTEGER NOT NULL DEFAULT 0,
        has_pii INTEGER NOT NULL DEFAULT 0,
        pii_categories TEXT NOT NULL DEFAULT '[]',
        redaction_skipped INTEGER NOT NULL DEFAULT 0,
        hierarchy_status TEXT NOT NULL DEFAULT 'none',
        tree_node_count INTEGER NOT NULL DEFAULT 0,
        storage_path TEXT NOT NULL,
        lock_token TEXT,
        lock_expires_at INTEGER
    )
    "#,
    // Redacted text plus layout; raw extracted text is never written.
    r#"
    CREATE TABLE IF NOT EXISTS document_content (
        document_id TEXT PRIMARY KEY,
        content_json TEXT NOT NULL,
        findings_json TEXT NOT NULL DEFAULT '[]',
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        text TEXT NOT NULL,
        hash TEXT NOT NULL,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        page_number INTEGER,
        section_title TEXT,
        redaction_count INTEGER NOT NULL DEFAULT 0,
        embed_status TEXT NOT NULL DEFAULT 'pending',
        embed_error TEXT,
        UNIQUE(document_id, chunk_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS index_entries (
        chunk_id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        vector BLOB NOT NULL,
        dims INTEGER NOT NULL,
        metadata_json TEXT NOT NULL,
        owner TEXT,
        indexed_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tree_nodes (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        parent_id TEXT,
        level INTEGER NOT NULL,
        ordinal INTEGER NOT NULL,
        title TEXT NOT NULL,
        summary TEXT NOT NULL,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        page_start INTEGER,
        page_end INTEGER,
        chunk_ids_json TEXT NOT NULL,
        embedding BLOB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        document_id TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        run_after INTEGER NOT NULL,
        lease_token TEXT,
        lease_expires_at INTEGER,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embedding_cache (
        key TEXT PRIMARY KEY,
        model TEXT NOT NULL,
        vector BLOB NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_created_at ON documents(created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_index_entries_document_id ON index_entries(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_tree_nodes_document_id ON tree_nodes(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, run_after)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_document_id ON jobs(document_id)",
];

/// Applies the schema to an open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Opens the configured database, applies the schema and closes it again.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}
