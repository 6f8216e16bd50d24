//! # Knowledge base CLI (`kb`)
//!
//! The `kb` binary drives the document pipeline from a terminal: database
//! setup, the HTTP API, background workers, bulk ingestion, inspection and
//! ad-hoc queries.
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the SQLite database and run schema migrations |
//! | `kb serve` | Start the HTTP API (with embedded workers by default) |
//! | `kb worker` | Run a standalone worker pool until Ctrl-C |
//! | `kb ingest <path>` | Upload a file or directory tree |
//! | `kb list` | List documents, optionally by status |
//! | `kb status <id>` | Show pipeline progress for a document |
//! | `kb get <id>` | Show document metadata |
//! | `kb delete <id>` | Remove a document, its chunks and index entries |
//! | `kb reprocess <id>` | Run a finished document through the pipeline again |
//! | `kb search "<query>"` | Similarity search over indexed chunks |
//! | `kb ask "<question>"` | Answer a question from indexed documents |
//! | `kb hierarchy <id>` | Build the summary tree for an indexed document |
//! | `kb redact <file>` | Extract a file and print what redaction would mask |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! kb init --config ./config/kb.toml
//!
//! # Upload a folder of manuals and process it before returning
//! kb ingest ./manuals --wait
//!
//! # Ask a question
//! kb ask "How long is the warranty?"
//!
//! # Serve the API
//! kb serve
//! ```

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use knowledge_base::answer::{answer, QueryRequest};
use knowledge_base::config::{self, Config};
use knowledge_base::documents;
use knowledge_base::engine::Engine;
use knowledge_base::extract::extract_with_timeout;
use knowledge_base::ingest::{ingest_path, IngestOptions};
use knowledge_base::logging;
use knowledge_base::migrate;
use knowledge_base::models::{DocumentStatus, FileType};
use knowledge_base::pipeline;
use knowledge_base::redact::{create_redactor, scan};
use knowledge_base::retrieve::{search, SearchRequest};
use knowledge_base::server;
use knowledge_base::worker::{self, WorkerPool};

/// Knowledge base: upload documents, redact them, index them and ask
/// grounded questions about them.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "Document ingestion, redaction and retrieval-augmented answering",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/kb.toml`.
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP API server.
    ///
    /// Unless `worker.embedded = false`, the same process also runs the
    /// background workers that move uploads through the pipeline.
    Serve,

    /// Run background workers without the HTTP API.
    Worker,

    /// Upload a file, or every supported file under a directory.
    Ingest {
        path: PathBuf,

        /// Process the queued documents before returning.
        #[arg(long)]
        wait: bool,

        /// Glob of files to include (repeatable). Defaults to everything.
        #[arg(long)]
        include: Vec<String>,

        /// Glob of files to skip (repeatable).
        #[arg(long)]
        exclude: Vec<String>,

        /// Owner recorded on every uploaded document.
        #[arg(long)]
        owner: Option<String>,
    },

    /// List documents.
    List {
        /// Only documents in this status (e.g. `indexed`, `failed`).
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 20)]
        page_size: u32,
    },

    /// Show processing status, counts and failures for a document.
    Status { id: String },

    /// Show a document's metadata.
    Get { id: String },

    /// Delete a document with its chunks, index entries and stored files.
    Delete { id: String },

    /// Queue a finished document for processing again.
    Reprocess { id: String },

    /// Similarity search over indexed chunks.
    Search {
        query: String,

        /// Descend the summary tree instead of scanning all chunks.
        #[arg(long)]
        hierarchical: bool,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Answer a question using the indexed documents.
    Ask {
        question: String,

        #[arg(long)]
        hierarchical: bool,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Build (or rebuild) the summary tree for an indexed document.
    Hierarchy { id: String },

    /// Extract a local file and report the sensitive data it contains.
    ///
    /// Nothing is stored. The masked text is printed after the findings.
    Redact { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_with_config(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Worker => run_worker(&cfg).await?,
        Commands::Ingest {
            path,
            wait,
            include,
            exclude,
            owner,
        } => {
            let options = IngestOptions {
                include,
                exclude,
                owner,
                follow_symlinks: false,
            };
            run_ingest(&cfg, &path, &options, wait).await?;
        }
        Commands::List {
            status,
            page,
            page_size,
        } => run_list(&cfg, status.as_deref(), page, page_size).await?,
        Commands::Status { id } => run_status(&cfg, &id).await?,
        Commands::Get { id } => run_get(&cfg, &id).await?,
        Commands::Delete { id } => {
            let engine = Engine::open(&cfg).await?;
            let receipt = documents::delete(&engine, &id).await?;
            println!(
                "Deleted {} ({} index entries removed)",
                receipt.document_id, receipt.removed_entries
            );
            engine.close().await;
        }
        Commands::Reprocess { id } => {
            let engine = Engine::open(&cfg).await?;
            let receipt = documents::reprocess(&engine, &id).await?;
            println!("{}: {} (task {})", receipt.document_id, receipt.message, receipt.task_id);
            engine.close().await;
        }
        Commands::Search {
            query,
            hierarchical,
            top_k,
        } => run_search(&cfg, &query, hierarchical, top_k).await?,
        Commands::Ask {
            question,
            hierarchical,
            top_k,
        } => run_ask(&cfg, &question, hierarchical, top_k).await?,
        Commands::Hierarchy { id } => {
            let engine = Engine::open(&cfg).await?;
            let nodes = pipeline::build_hierarchy(&engine, &id).await?;
            println!("Built summary tree for {} with {} nodes", id, nodes);
            engine.close().await;
        }
        Commands::Redact { file } => run_redact(&cfg, &file).await?,
    }

    Ok(())
}

async fn run_worker(cfg: &Config) -> anyhow::Result<()> {
    let engine = Engine::open(cfg).await?;
    let pool = WorkerPool::spawn(Arc::clone(&engine));
    println!(
        "Worker running with {} slots. Press Ctrl-C to stop.",
        cfg.worker.concurrency.max(1)
    );
    tokio::signal::ctrl_c().await?;
    pool.shutdown().await;
    engine.close().await;
    Ok(())
}

async fn run_ingest(cfg: &Config, path: &Path, options: &IngestOptions, wait: bool) -> anyhow::Result<()> {
    let engine = Engine::open(cfg).await?;
    let report = ingest_path(&engine, path, options).await?;

    for receipt in &report.uploaded {
        println!("queued     {}  {}", receipt.document_id, receipt.filename);
    }
    for (path, error) in &report.failed {
        println!("rejected   {}  {}", path.display(), error);
    }
    println!(
        "{} queued, {} duplicates, {} skipped, {} rejected",
        report.uploaded.len(),
        report.duplicates,
        report.skipped,
        report.failed.len()
    );

    if wait {
        let jobs = worker::run_until_idle(&engine).await?;
        println!("Processed {} jobs", jobs);
        for receipt in &report.uploaded {
            let doc = documents::get(&engine, &receipt.document_id).await?;
            match doc.status {
                DocumentStatus::Failed => println!(
                    "failed     {}  {} at {}: {}",
                    doc.id,
                    doc.filename,
                    doc.failed_stage.as_deref().unwrap_or("unknown"),
                    doc.error_message.as_deref().unwrap_or("")
                ),
                status => println!("{:<10} {}  {} chunks", status.as_str(), doc.id, doc.chunk_count),
            }
        }
    }

    engine.close().await;
    Ok(())
}

async fn run_list(cfg: &Config, status: Option<&str>, page: u32, page_size: u32) -> anyhow::Result<()> {
    let status = match status {
        Some(s) => match DocumentStatus::parse(s) {
            Some(status) => Some(status),
            None => bail!("unknown status '{}'", s),
        },
        None => None,
    };

    let engine = Engine::open(cfg).await?;
    let listing = documents::list(&engine, status, page, page_size).await?;
    if listing.documents.is_empty() {
        println!("No documents.");
    }
    for doc in &listing.documents {
        println!(
            "{}  {:<10} {:>5} chunks  {}",
            doc.id,
            doc.status.as_str(),
            doc.chunk_count,
            doc.filename
        );
    }
    println!(
        "page {} of {} documents{}",
        listing.page,
        listing.total,
        if listing.has_more { " (more available)" } else { "" }
    );
    engine.close().await;
    Ok(())
}

async fn run_status(cfg: &Config, id: &str) -> anyhow::Result<()> {
    let engine = Engine::open(cfg).await?;
    let report = documents::status(&engine, id).await?;

    println!("id:           {}", report.document_id);
    println!("filename:     {}", report.filename);
    println!("status:       {} ({}%)", report.status, report.progress);
    if let Some(stage) = &report.failed_stage {
        println!("failed at:    {}", stage);
    }
    if let Some(error) = &report.error_message {
        println!("error:        {}", error);
    }
    println!("pages:        {}", report.page_count);
    println!("words:        {}", report.word_count);
    println!(
        "chunks:       {} ({} indexed, {} failed)",
        report.chunk_count, report.indexed_count, report.failed_chunk_count
    );
    if report.redaction_skipped {
        println!("redaction:    skipped");
    } else {
        println!(
            "redaction:    {} findings [{}]",
            report.redaction_findings,
            report.pii_categories.join(", ")
        );
    }
    println!(
        "hierarchy:    {} ({} nodes)",
        report.hierarchy_status.as_str(),
        report.tree_node_count
    );
    if let Some(task) = &report.active_task {
        println!("active task:  {}", task);
    }
    for failure in &report.failed_chunks {
        println!("  {}: {}", failure.chunk_id, failure.error);
    }

    engine.close().await;
    Ok(())
}

async fn run_get(cfg: &Config, id: &str) -> anyhow::Result<()> {
    let engine = Engine::open(cfg).await?;
    let doc = documents::get(&engine, id).await?;

    println!("id:           {}", doc.id);
    println!("filename:     {}", doc.filename);
    println!("type:         {} ({})", doc.file_type, doc.mime_type);
    println!("size:         {} bytes", doc.size_bytes);
    if let Some(owner) = &doc.owner {
        println!("owner:        {}", owner);
    }
    println!("status:       {}", doc.status);
    println!("created:      {}", knowledge_base::db::format_ts_iso(doc.created_at));
    println!("updated:      {}", knowledge_base::db::format_ts_iso(doc.updated_at));
    if let Some(processed) = doc.processed_at {
        println!("processed:    {}", knowledge_base::db::format_ts_iso(processed));
    }
    println!("pii:          {}", if doc.has_pii { doc.pii_categories.join(", ") } else { "none".into() });

    engine.close().await;
    Ok(())
}

async fn run_search(cfg: &Config, query: &str, hierarchical: bool, top_k: Option<usize>) -> anyhow::Result<()> {
    let engine = Engine::open(cfg).await?;
    let outcome = search(
        &engine,
        &SearchRequest {
            query: query.to_string(),
            top_k: top_k.unwrap_or(cfg.retrieval.top_k),
            use_hierarchical: hierarchical,
            document_ids: None,
            owner: None,
        },
    )
    .await?;

    if outcome.hits.is_empty() {
        println!("No results.");
    }
    for (i, hit) in outcome.hits.iter().enumerate() {
        let location = match (hit.metadata.page_number, &hit.metadata.section_title) {
            (Some(page), _) => format!("page {}", page),
            (None, Some(section)) => section.clone(),
            (None, None) => format!("chunk {}", hit.metadata.chunk_index),
        };
        println!(
            "{}. [{:.3}] {} ({})",
            i + 1,
            hit.score,
            hit.metadata.filename,
            location
        );
        println!("    {}", snippet(&hit.metadata.text, 160));
    }
    if outcome.fell_back {
        println!("(no summary tree available, used flat search)");
    }

    engine.close().await;
    Ok(())
}

async fn run_ask(cfg: &Config, question: &str, hierarchical: bool, top_k: Option<usize>) -> anyhow::Result<()> {
    let engine = Engine::open(cfg).await?;
    let response = answer(
        &engine,
        &QueryRequest {
            query: question.to_string(),
            top_k,
            use_hierarchical: hierarchical,
            include_sources: true,
            ..QueryRequest::default()
        },
    )
    .await?;

    println!("{}", response.answer);
    if !response.sources.is_empty() {
        println!();
        println!("Sources:");
        for source in &response.sources {
            let page = source
                .page_number
                .map(|p| format!(", page {}", p))
                .unwrap_or_default();
            println!(
                "  [{}] {}{} (score {:.3})",
                source.number, source.document_name, page, source.relevance_score
            );
        }
    }
    tracing::debug!(
        grounded = response.grounded,
        strategy = response.retrieval.as_str(),
        elapsed_ms = response.processing_time_ms,
        "Answered question"
    );

    engine.close().await;
    Ok(())
}

async fn run_redact(cfg: &Config, file: &Path) -> anyhow::Result<()> {
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let Some(file_type) = FileType::from_filename(&filename) else {
        bail!("unsupported file type: {}", file.display());
    };
    let bytes = tokio::fs::read(file).await?;
    let content = extract_with_timeout(
        bytes,
        file_type.mime_type(&filename).to_string(),
        cfg.worker.extract_timeout_secs,
    )
    .await?;

    let redactor = create_redactor(&cfg.redaction)?;
    let report = scan(redactor.as_ref(), &content.text, None, true).await?;

    if report.has_pii {
        println!("Found {} items: {}", report.detections.len(), report.categories_found.join(", "));
        for finding in &report.detections {
            println!(
                "  {:<14} bytes {}..{}  -> {}",
                finding.kind.as_str(),
                finding.start,
                finding.end,
                finding.replacement
            );
        }
    } else {
        println!("No sensitive data found.");
    }
    if let Some(redacted) = report.redacted_content {
        println!();
        println!("{}", redacted);
    }
    Ok(())
}

fn snippet(text: &str, max: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let cut: String = flat.chars().take(max).collect();
    format!("{}...", cut)
}
