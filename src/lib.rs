//! # Knowledge base
//!
//! A document backend for retrieval-augmented answering. Uploaded files are
//! extracted, scrubbed of sensitive data, chunked, embedded and written to a
//! vector index; questions are answered from the retrieved chunks with
//! numbered citations, or declined when nothing relevant is indexed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────────────────────────────┐
//! │ HTTP/CLI │──▶│ documents │──▶│ queue ─▶ worker ─▶ pipeline       │
//! └────┬─────┘   └───────────┘   │  extract ▸ redact ▸ chunk ▸ embed │
//!      │                         └───────────────┬──────────────────┘
//!      │                                         ▼
//!      │         ┌───────────┐   ┌─────────────────────────┐
//!      └────────▶│ retrieve  │──▶│ index (sqlite/memory/…) │
//!                │  answer   │   │ hierarchy (summary tree)│
//!                └───────────┘   └─────────────────────────┘
//! ```
//!
//! Every document moves `received → extracting → redacting → embedding →
//! indexed`, or to `failed` with the stage that failed. Only one worker may
//! act on a document at a time; the lock lives on the document row.
//!
//! ## Quick start
//!
//! ```bash
//! kb init
//! kb ingest ./docs --wait
//! kb ask "What is the refund window?"
//! kb serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Documents, chunks, index entries, findings |
//! | [`extract`] | Text and structure from PDF, OOXML, HTML and text |
//! | [`redact`] | Pattern and classifier based masking |
//! | [`chunk`] | Token-bounded chunking with page/section metadata |
//! | [`embedding`] | Embedding providers, batching and caching |
//! | [`index`] | Vector index backends |
//! | [`hierarchy`] | Summary trees and beam search |
//! | [`queue`] | Durable job queue with leases and backoff |
//! | [`pipeline`] | The per-document processing state machine |
//! | [`worker`] | Worker pool and lease heartbeats |
//! | [`retrieve`] | Flat and hierarchical retrieval |
//! | [`generate`] | Answer generators |
//! | [`answer`] | Grounded question answering |
//! | [`documents`] | Upload, list, status, delete, reprocess |
//! | [`ingest`] | Bulk upload from the filesystem |
//! | [`server`] | HTTP API |

pub mod answer;
pub mod chunk;
pub mod config;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod generate;
pub mod hierarchy;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod redact;
pub mod retrieve;
pub mod server;
pub mod store;
pub mod worker;
