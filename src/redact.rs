//! Sensitive-data detection and masking.
//!
//! Detected spans are replaced in place by typed mask tokens such as
//! `[REDACTED_EMAIL]`. Masking runs on extracted text before chunking, so
//! nothing downstream (chunks, embeddings, index entries, tree summaries)
//! ever sees the original value.
//!
//! Two detector layers exist behind the [`Redactor`] trait:
//!
//! - [`PatternRedactor`]: regular-expression rules per [`PiiKind`].
//! - [`ClassifierRedactor`]: an optional remote classification service.
//!
//! [`create_redactor`] stacks them. A classifier error is an error for the
//! whole pass: callers must fail the document instead of indexing text that
//! was only partially checked.
//!
//! Masking is idempotent: values that are already mask tokens are never
//! re-detected, so `detect(redact(x))` is always empty.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::RedactionConfig;
use crate::models::{ExtractedContent, FindingSource, Heading, PageSpan, RedactionFinding};

pub use crate::models::PiiKind;

/// Whether `value` is exactly a mask written by an earlier pass. Text that
/// merely starts with a mask is still scanned.
fn is_mask_token(value: &str) -> bool {
    PiiKind::ALL.iter().any(|kind| kind.mask_token() == value)
}

#[derive(Error, Debug)]
pub enum RedactError {
    #[error("classifier request failed: {0}")]
    Classifier(String),
    #[error("classifier timed out after {0}s")]
    Timeout(u64),
    #[error("classifier returned unusable finding: {0}")]
    InvalidFinding(String),
    #[error("invalid redaction rule: {0}")]
    Rule(#[from] regex::Error),
}

/// A detector of sensitive spans.
#[async_trait]
pub trait Redactor: Send + Sync {
    fn name(&self) -> &str;

    /// Finds sensitive spans in `text`. Offsets are UTF-8 byte offsets.
    async fn detect(&self, text: &str) -> Result<Vec<RedactionFinding>, RedactError>;
}

/// Masked text plus the merged, ordered findings that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Redacted {
    pub text: String,
    pub findings: Vec<RedactionFinding>,
}

impl Redacted {
    /// Maps a byte offset of the original text onto the masked text.
    /// Offsets inside a masked span land on the start of its token.
    pub fn map_offset(&self, offset: usize) -> usize {
        let mut delta: isize = 0;
        for f in &self.findings {
            if offset >= f.end {
                delta += f.replacement.len() as isize - (f.end - f.start) as isize;
            } else if offset > f.start {
                return (f.start as isize + delta) as usize;
            } else {
                break;
            }
        }
        (offset as isize + delta) as usize
    }

    /// Distinct categories found, sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut kinds: Vec<PiiKind> = self.findings.iter().map(|f| f.kind).collect();
        kinds.sort();
        kinds.dedup();
        kinds.iter().map(|k| k.as_str().to_string()).collect()
    }
}

/// Merges overlapping findings (earliest start wins the kind, the span
/// grows to cover both) and returns them sorted by start.
fn merge_findings(text: &str, mut findings: Vec<RedactionFinding>) -> Vec<RedactionFinding> {
    findings.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
    let mut merged: Vec<RedactionFinding> = Vec::with_capacity(findings.len());
    for f in findings {
        match merged.last_mut() {
            Some(last) if f.start < last.end => {
                if f.end > last.end {
                    last.end = f.end;
                    last.original = text[last.start..last.end].to_string();
                }
                last.confidence = last.confidence.max(f.confidence);
            }
            _ => merged.push(f),
        }
    }
    merged
}

/// Replaces every finding in `text` with its mask token.
pub fn apply_findings(text: &str, findings: Vec<RedactionFinding>) -> Redacted {
    let findings = merge_findings(text, findings);
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for f in &findings {
        out.push_str(&text[cursor..f.start]);
        out.push_str(&f.replacement);
        cursor = f.end;
    }
    out.push_str(&text[cursor..]);
    Redacted {
        text: out,
        findings,
    }
}

/// Detects and masks `text` in one step.
pub async fn redact_text(redactor: &dyn Redactor, text: &str) -> Result<Redacted, RedactError> {
    let findings = redactor.detect(text).await?;
    Ok(apply_findings(text, findings))
}

/// Masks extracted content: body text, layout offsets, heading titles and
/// table cells. Image artifacts carry no text and pass through.
pub async fn redact_content(
    redactor: &dyn Redactor,
    content: &ExtractedContent,
) -> Result<(ExtractedContent, Redacted), RedactError> {
    let redacted = redact_text(redactor, &content.text).await?;

    let pages = content
        .pages
        .iter()
        .map(|p| PageSpan {
            number: p.number,
            start: redacted.map_offset(p.start),
            end: redacted.map_offset(p.end),
        })
        .collect();

    let headings = content
        .headings
        .iter()
        .map(|h| {
            let offset = redacted.map_offset(h.offset);
            let line = redacted.text[offset..].lines().next().unwrap_or("");
            let title = line.trim_start_matches('#').trim();
            Heading {
                level: h.level,
                title: if title.is_empty() {
                    h.title.clone()
                } else {
                    title.to_string()
                },
                offset,
            }
        })
        .collect();

    let mut tables = content.tables.clone();
    for table in &mut tables {
        for row in &mut table.rows {
            *row = redact_cells(redactor, row).await?;
        }
    }

    let out = ExtractedContent {
        text: redacted.text.clone(),
        pages,
        headings,
        tables,
        images: content.images.clone(),
    };
    Ok((out, redacted))
}

/// Redacts a row in one detector call; cells are newline-joined and split
/// back, falling back to per-cell calls if a finding spans two cells.
async fn redact_cells(redactor: &dyn Redactor, row: &[String]) -> Result<Vec<String>, RedactError> {
    let cells: Vec<String> = row
        .iter()
        .map(|c| c.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect();
    let joined = cells.join("\n");
    let redacted = redact_text(redactor, &joined).await?;
    let split: Vec<String> = redacted.text.split('\n').map(|s| s.to_string()).collect();
    if split.len() == cells.len() {
        return Ok(split);
    }
    let mut out = Vec::with_capacity(cells.len());
    for cell in &cells {
        out.push(redact_text(redactor, cell).await?.text);
    }
    Ok(out)
}

// ============ Pattern rules ============

fn patterns(kind: PiiKind) -> &'static [&'static str] {
    match kind {
        PiiKind::Password => &[
            r#"password\s*[:=]\s*['"]?([^\s'"]+)['"]?"#,
            r#"pwd\s*[:=]\s*['"]?([^\s'"]+)['"]?"#,
            r#"pass\s*[:=]\s*['"]?([^\s'"]+)['"]?"#,
        ],
        PiiKind::ApiKey => &[
            r#"api[_-]?key\s*[:=]\s*['"]?([a-zA-Z0-9_-]{20,})['"]?"#,
            r#"secret[_-]?key\s*[:=]\s*['"]?([a-zA-Z0-9_-]{20,})['"]?"#,
            r#"access[_-]?token\s*[:=]\s*['"]?([a-zA-Z0-9_-]{20,})['"]?"#,
            r"sk-[a-zA-Z0-9]{32,}",
            r"pk-[a-zA-Z0-9]{32,}",
            r"AIza[a-zA-Z0-9_-]{35}",
        ],
        PiiKind::CreditCard => &[
            r"\b(?:4[0-9]{12}(?:[0-9]{3})?|5[1-5][0-9]{14}|3[47][0-9]{13}|6(?:011|5[0-9]{2})[0-9]{12})\b",
        ],
        PiiKind::Ssn => &[r"\b\d{3}[-\s]?\d{2}[-\s]?\d{4}\b"],
        PiiKind::Email => &[r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Z|a-z]{2,}\b"],
        PiiKind::Phone => &[
            r"\b(?:\+?1[-.\s]?)?\(?[2-9]\d{2}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b",
            r"\b\d{3}[-.\s]\d{3}[-.\s]\d{4}\b",
        ],
        // Street addresses stay on one line and span at most six words.
        PiiKind::Address => &[
            r"\b\d{1,5}[ \t]+\w+(?:[ \t]+\w+){0,4}[ \t]+(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Drive|Dr|Lane|Ln|Court|Ct)\b",
        ],
    }
}

struct Rule {
    kind: PiiKind,
    regex: Regex,
}

/// Case-insensitive regular-expression rules for the configured categories.
pub struct PatternRedactor {
    rules: Vec<Rule>,
}

impl PatternRedactor {
    pub fn new(kinds: &[PiiKind]) -> Result<Self, RedactError> {
        let mut rules = Vec::new();
        for &kind in kinds {
            for pattern in patterns(kind) {
                rules.push(Rule {
                    kind,
                    regex: Regex::new(&format!("(?i){}", pattern))?,
                });
            }
        }
        Ok(Self { rules })
    }

    /// All seven categories.
    pub fn all() -> Result<Self, RedactError> {
        Self::new(&PiiKind::ALL)
    }

    pub fn detect_sync(&self, text: &str) -> Vec<RedactionFinding> {
        let mut findings = Vec::new();
        for rule in &self.rules {
            for caps in rule.regex.captures_iter(text) {
                let Some(m) = caps.get(1).or_else(|| caps.get(0)) else {
                    continue;
                };
                if is_mask_token(m.as_str()) {
                    continue;
                }
                findings.push(RedactionFinding {
                    kind: rule.kind,
                    start: m.start(),
                    end: m.end(),
                    replacement: rule.kind.mask_token(),
                    source: FindingSource::Regex,
                    confidence: 1.0,
                    original: m.as_str().to_string(),
                });
            }
        }
        findings
    }
}

#[async_trait]
impl Redactor for PatternRedactor {
    fn name(&self) -> &str {
        "regex"
    }

    async fn detect(&self, text: &str) -> Result<Vec<RedactionFinding>, RedactError> {
        Ok(self.detect_sync(text))
    }
}

// ============ Remote classifier ============

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    text: &'a str,
    categories: &'a [String],
}

#[derive(Deserialize)]
struct ClassifyResponse {
    findings: Vec<ClassifiedSpan>,
}

#[derive(Deserialize)]
struct ClassifiedSpan {
    kind: String,
    start: usize,
    end: usize,
    #[serde(default = "default_confidence")]
    confidence: f32,
}

fn default_confidence() -> f32 {
    1.0
}

/// Client for a remote classifier.
///
/// Contract: `POST {url}` with `{"text", "categories"}` returns
/// `{"findings": [{"kind", "start", "end", "confidence"}]}` where offsets
/// are UTF-8 byte offsets into `text` and `kind` is a category name.
pub struct ClassifierRedactor {
    url: String,
    categories: Vec<String>,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl ClassifierRedactor {
    pub fn new(url: &str, categories: Vec<String>, timeout_secs: u64) -> Result<Self, RedactError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| RedactError::Classifier(e.to_string()))?;
        Ok(Self {
            url: url.to_string(),
            categories,
            timeout_secs,
            client,
        })
    }
}

#[async_trait]
impl Redactor for ClassifierRedactor {
    fn name(&self) -> &str {
        "classifier"
    }

    async fn detect(&self, text: &str) -> Result<Vec<RedactionFinding>, RedactError> {
        let body = ClassifyRequest {
            text,
            categories: &self.categories,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RedactError::Timeout(self.timeout_secs)
                } else {
                    RedactError::Classifier(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(RedactError::Classifier(format!("{}: {}", status, body_text)));
        }
        let parsed: ClassifyResponse = resp
            .json()
            .await
            .map_err(|e| RedactError::Classifier(e.to_string()))?;

        let mut findings = Vec::with_capacity(parsed.findings.len());
        for span in parsed.findings {
            let kind = PiiKind::parse(&span.kind)
                .ok_or_else(|| RedactError::InvalidFinding(format!("unknown kind '{}'", span.kind)))?;
            let valid = span.start < span.end
                && span.end <= text.len()
                && text.is_char_boundary(span.start)
                && text.is_char_boundary(span.end);
            if !valid {
                return Err(RedactError::InvalidFinding(format!(
                    "span {}..{} outside text of {} bytes",
                    span.start,
                    span.end,
                    text.len()
                )));
            }
            let original = &text[span.start..span.end];
            if is_mask_token(original) {
                continue;
            }
            findings.push(RedactionFinding {
                kind,
                start: span.start,
                end: span.end,
                replacement: kind.mask_token(),
                source: FindingSource::Classifier,
                confidence: span.confidence,
                original: original.to_string(),
            });
        }
        Ok(findings)
    }
}

/// Runs several detectors and unions their findings. Any failing layer
/// fails the pass.
pub struct LayeredRedactor {
    layers: Vec<Arc<dyn Redactor>>,
}

impl LayeredRedactor {
    pub fn new(layers: Vec<Arc<dyn Redactor>>) -> Self {
        Self { layers }
    }
}

#[async_trait]
impl Redactor for LayeredRedactor {
    fn name(&self) -> &str {
        "layered"
    }

    async fn detect(&self, text: &str) -> Result<Vec<RedactionFinding>, RedactError> {
        let mut all = Vec::new();
        for layer in &self.layers {
            all.extend(layer.detect(text).await?);
        }
        Ok(all)
    }
}

/// Result of an ad-hoc scan, as returned by `POST /pii/detect` and
/// `kb redact`.
#[derive(Debug, Clone, Serialize)]
pub struct PiiReport {
    pub has_pii: bool,
    pub categories_found: Vec<String>,
    pub detections: Vec<RedactionFinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacted_content: Option<String>,
}

/// Scans `text`, optionally keeping only findings of `kinds`.
pub async fn scan(
    redactor: &dyn Redactor,
    text: &str,
    kinds: Option<&[PiiKind]>,
    with_redacted: bool,
) -> Result<PiiReport, RedactError> {
    let mut findings = redactor.detect(text).await?;
    if let Some(kinds) = kinds {
        findings.retain(|f| kinds.contains(&f.kind));
    }
    let redacted = apply_findings(text, findings);
    Ok(PiiReport {
        has_pii: !redacted.findings.is_empty(),
        categories_found: redacted.categories(),
        redacted_content: with_redacted.then(|| redacted.text.clone()),
        detections: redacted.findings,
    })
}

/// Builds the detector stack from `[redaction]`.
pub fn create_redactor(config: &RedactionConfig) -> Result<Arc<dyn Redactor>, RedactError> {
    let kinds: Vec<PiiKind> = config
        .categories
        .iter()
        .filter_map(|c| PiiKind::parse(c))
        .collect();
    let patterns: Arc<dyn Redactor> = Arc::new(PatternRedactor::new(&kinds)?);
    match &config.classifier_url {
        Some(url) => {
            let classifier = ClassifierRedactor::new(
                url,
                config.categories.clone(),
                config.classifier_timeout_secs,
            )?;
            Ok(Arc::new(LayeredRedactor::new(vec![
                patterns,
                Arc::new(classifier),
            ])))
        }
        None => Ok(patterns),
    }
}
