//! Core data types that flow through ingestion and retrieval.
//!
//! A [`Document`] moves through the [`DocumentStatus`] state machine while
//! its bytes are turned into [`ExtractedContent`], masked into redacted
//! content, cut into [`Chunk`]s and materialized as [`IndexEntry`]s.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Processing state of a document.
///
/// ```text
/// received → extracting → redacting → embedding → indexed
///     └──────────┴────────────┴───────────┴──────→ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Received,
    Extracting,
    Redacting,
    Embedding,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Received => "received",
            DocumentStatus::Extracting => "extracting",
            DocumentStatus::Redacting => "redacting",
            DocumentStatus::Embedding => "embedding",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(DocumentStatus::Received),
            "extracting" => Some(DocumentStatus::Extracting),
            "redacting" => Some(DocumentStatus::Redacting),
            "embedding" => Some(DocumentStatus::Embedding),
            "indexed" => Some(DocumentStatus::Indexed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Indexed | DocumentStatus::Failed)
    }

    /// The next state on success, if any.
    pub fn next(&self) -> Option<Self> {
        match self {
            DocumentStatus::Received => Some(DocumentStatus::Extracting),
            DocumentStatus::Extracting => Some(DocumentStatus::Redacting),
            DocumentStatus::Redacting => Some(DocumentStatus::Embedding),
            DocumentStatus::Embedding => Some(DocumentStatus::Indexed),
            DocumentStatus::Indexed | DocumentStatus::Failed => None,
        }
    }

    /// Forward transitions follow the pipeline order; `failed` is reachable
    /// from every non-terminal state. Terminal states only leave through an
    /// explicit reprocess, which resets to `received`.
    pub fn can_transition_to(&self, to: DocumentStatus) -> bool {
        if to == DocumentStatus::Failed {
            return !self.is_terminal();
        }
        if to == DocumentStatus::Received {
            return self.is_terminal();
        }
        self.next() == Some(to)
    }

    /// Rough completion percentage for status displays.
    pub fn progress(&self) -> u8 {
        match self {
            DocumentStatus::Received => 0,
            DocumentStatus::Extracting => 20,
            DocumentStatus::Redacting => 40,
            DocumentStatus::Embedding => 60,
            DocumentStatus::Indexed => 100,
            DocumentStatus::Failed => 0,
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the optional tree index for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HierarchyStatus {
    None,
    Pending,
    Ready,
    Failed,
}

impl HierarchyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HierarchyStatus::None => "none",
            HierarchyStatus::Pending => "pending",
            HierarchyStatus::Ready => "ready",
            HierarchyStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => HierarchyStatus::Pending,
            "ready" => HierarchyStatus::Ready,
            "failed" => HierarchyStatus::Failed,
            _ => HierarchyStatus::None,
        }
    }
}

/// Upload formats understood by the extraction layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    Txt,
    Md,
    Html,
    Image,
}

impl FileType {
    /// Detects the type from a filename extension (case-insensitive).
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = filename.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(FileType::Pdf),
            "docx" => Some(FileType::Docx),
            "pptx" => Some(FileType::Pptx),
            "xlsx" => Some(FileType::Xlsx),
            "txt" => Some(FileType::Txt),
            "md" | "markdown" => Some(FileType::Md),
            "html" | "htm" => Some(FileType::Html),
            "png" | "jpg" | "jpeg" | "gif" | "webp" => Some(FileType::Image),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Pptx => "pptx",
            FileType::Xlsx => "xlsx",
            FileType::Txt => "txt",
            FileType::Md => "md",
            FileType::Html => "html",
            FileType::Image => "image",
        }
    }

    /// Canonical MIME type; images are resolved from the extension.
    pub fn mime_type(&self, filename: &str) -> &'static str {
        use crate::extract::*;
        match self {
            FileType::Pdf => MIME_PDF,
            FileType::Docx => MIME_DOCX,
            FileType::Pptx => MIME_PPTX,
            FileType::Xlsx => MIME_XLSX,
            FileType::Txt => MIME_TEXT,
            FileType::Md => MIME_MARKDOWN,
            FileType::Html => MIME_HTML,
            FileType::Image => {
                let lower = filename.to_ascii_lowercase();
                if lower.ends_with(".png") {
                    "image/png"
                } else if lower.ends_with(".gif") {
                    "image/gif"
                } else if lower.ends_with(".webp") {
                    "image/webp"
                } else {
                    "image/jpeg"
                }
            }
        }
    }
}

/// A document row as stored in SQLite. Timestamps are unix seconds.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub file_type: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub owner: Option<String>,
    pub status: DocumentStatus,
    pub failed_stage: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub processed_at: Option<i64>,
    pub page_count: i64,
    pub word_count: i64,
    pub chunk_count: i64,
    pub indexed_count: i64,
    pub failed_chunk_count: i64,
    pub has_pii: bool,
    pub pii_categories: Vec<String>,
    pub redaction_skipped: bool,
    pub hierarchy_status: HierarchyStatus,
    pub tree_node_count: i64,
    #[serde(skip)]
    pub storage_path: String,
}

/// Byte span of one page within the extracted text. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSpan {
    pub number: u32,
    pub start: usize,
    pub end: usize,
}

/// A heading detected in the source, positioned at `offset` in the text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heading {
    pub level: u32,
    pub title: String,
    pub offset: usize,
}

/// Structured grid data from a table, sheet or slide table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub page: Option<u32>,
    pub rows: Vec<Vec<String>>,
}

/// An image found in (or uploaded as) a document. Stored, never indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: String,
    pub mime_type: String,
    pub page: Option<u32>,
    pub path: Option<String>,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

/// Text and layout produced by the extraction layer.
///
/// `text` is markdown-flavoured: headings are `#` lines and tables are
/// rendered as pipe rows so chunk boundaries can respect them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub text: String,
    pub pages: Vec<PageSpan>,
    pub headings: Vec<Heading>,
    pub tables: Vec<Table>,
    pub images: Vec<ImageRef>,
}

impl ExtractedContent {
    /// Page containing the byte `offset`, if the format has pages.
    pub fn page_at(&self, offset: usize) -> Option<u32> {
        self.pages
            .iter()
            .find(|p| offset >= p.start && offset < p.end)
            .or_else(|| self.pages.iter().rev().find(|p| offset >= p.start))
            .map(|p| p.number)
    }

    /// Title of the closest heading at or before `offset`.
    pub fn section_at(&self, offset: usize) -> Option<String> {
        self.headings
            .iter()
            .take_while(|h| h.offset <= offset)
            .last()
            .map(|h| h.title.clone())
    }

    pub fn page_count(&self) -> usize {
        self.pages.len().max(if self.text.is_empty() { 0 } else { 1 })
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// A bounded, overlapping span of a document's redacted text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    /// `"{document_id}_chunk_{index}"`, stable across reprocessing.
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
    /// Byte offsets into the redacted text.
    pub start: usize,
    pub end: usize,
    pub page_number: Option<u32>,
    pub section_title: Option<String>,
    /// Mask tokens inside this chunk.
    pub redaction_count: u32,
}

pub fn chunk_id(document_id: &str, index: usize) -> String {
    format!("{}_chunk_{}", document_id, index)
}

/// Attribution carried by every index entry, so search results never need
/// to re-read the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub filename: String,
    pub chunk_index: i64,
    pub page_number: Option<u32>,
    pub section_title: Option<String>,
    pub text: String,
    #[serde(default)]
    pub owner: Option<String>,
}

/// A chunk plus its embedding as materialized in the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub vector: Vec<f32>,
    pub metadata: EntryMetadata,
    /// Unix milliseconds; later entries win similarity ties.
    pub indexed_at: i64,
}

/// One ranked result from a vector index query.
#[derive(Debug, Clone, Serialize)]
pub struct IndexHit {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f32,
    pub metadata: EntryMetadata,
    pub indexed_at: i64,
}

/// A node of the per-document tree index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HierarchicalNode {
    pub id: String,
    pub document_id: String,
    pub parent_id: Option<String>,
    pub level: u32,
    pub ordinal: u32,
    pub title: String,
    pub summary: String,
    pub start: usize,
    pub end: usize,
    pub page_start: Option<u32>,
    pub page_end: Option<u32>,
    /// Chunks overlapping this node's span (leaves and inner nodes alike).
    pub chunk_ids: Vec<String>,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

/// Categories of sensitive data the redaction layer looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Password,
    ApiKey,
    CreditCard,
    Ssn,
    Email,
    Phone,
    Address,
}

impl PiiKind {
    pub const ALL: [PiiKind; 7] = [
        PiiKind::Password,
        PiiKind::ApiKey,
        PiiKind::CreditCard,
        PiiKind::Ssn,
        PiiKind::Email,
        PiiKind::Phone,
        PiiKind::Address,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PiiKind::Password => "password",
            PiiKind::ApiKey => "api_key",
            PiiKind::CreditCard => "credit_card",
            PiiKind::Ssn => "ssn",
            PiiKind::Email => "email",
            PiiKind::Phone => "phone",
            PiiKind::Address => "address",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        PiiKind::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// Mask inserted in place of a detected value.
    pub fn mask_token(&self) -> String {
        format!("[REDACTED_{}]", self.as_str().to_ascii_uppercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSource {
    Regex,
    Classifier,
}

/// A detected sensitive span. Offsets refer to the unredacted text.
///
/// `original` exists only in memory while masking; it is never serialized
/// or written to storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedactionFinding {
    pub kind: PiiKind,
    pub start: usize,
    pub end: usize,
    pub replacement: String,
    pub source: FindingSource,
    pub confidence: f32,
    #[serde(skip)]
    pub original: String,
}
