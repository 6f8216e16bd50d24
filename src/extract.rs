//! Multi-format extraction into structured, markdown-flavoured text.
//!
//! Input is raw bytes plus a MIME type; output is [`ExtractedContent`] with
//! reading-order text, page spans, headings, tables and image artifacts.
//! Headings become `#` lines and tables become pipe rows, which lets the
//! chunker break on structural boundaries instead of mid-table.
//!
//! | Format | Structure kept |
//! |--------|----------------|
//! | PDF | pages, paragraphs |
//! | DOCX | headings (paragraph styles), tables, embedded media |
//! | PPTX | one page per slide, tables, embedded media |
//! | XLSX | one page and one table per sheet |
//! | Markdown / text | headings, paragraphs |
//! | HTML | headings, paragraphs, tables; scripts and styles dropped |
//! | Images | stored as artifacts, no text |
//!
//! Extraction never panics on bad input; malformed files produce an
//! [`ExtractError`]. [`extract_with_timeout`] additionally runs the work on
//! a blocking thread so a pathological PDF cannot stall a worker forever.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;

use crate::models::{ExtractedContent, Heading, ImageRef, PageSpan, Table};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_HTML: &str = "text/html";

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const MAX_EMBEDDED_IMAGES: usize = 64;
const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("extraction timed out after {0}s")]
    Timeout(u64),
    #[error("extractor crashed: {0}")]
    Crashed(String),
}

/// Extracts structured text from `bytes` of the given MIME type.
pub fn extract(bytes: &[u8], content_type: &str) -> Result<ExtractedContent, ExtractError> {
    match content_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_PPTX => extract_pptx(bytes),
        MIME_XLSX => extract_xlsx(bytes),
        MIME_TEXT => Ok(extract_plain(bytes)),
        MIME_MARKDOWN => Ok(extract_markdown(bytes)),
        MIME_HTML => Ok(extract_html(bytes)),
        ct if ct.starts_with("image/") => Ok(extract_image(bytes, ct)),
        _ => Err(ExtractError::UnsupportedContentType(
            content_type.to_string(),
        )),
    }
}

/// Runs [`extract`] on the blocking pool, bounded by `timeout_secs`.
///
/// A panic inside a parser surfaces as [`ExtractError::Crashed`].
pub async fn extract_with_timeout(
    bytes: Vec<u8>,
    content_type: String,
    timeout_secs: u64,
) -> Result<ExtractedContent, ExtractError> {
    let task = tokio::task::spawn_blocking(move || extract(&bytes, &content_type));
    match tokio::time::timeout(Duration::from_secs(timeout_secs), task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(ExtractError::Crashed(join_err.to_string())),
        Err(_) => Err(ExtractError::Timeout(timeout_secs)),
    }
}

// ============ Content builder ============

/// Accumulates blocks separated by blank lines while tracking layout.
#[derive(Default)]
struct ContentBuilder {
    out: ExtractedContent,
    page: Option<(u32, usize)>,
}

impl ContentBuilder {
    fn break_block(&mut self) {
        let text = &mut self.out.text;
        if text.is_empty() {
            return;
        }
        while !text.ends_with("\n\n") {
            text.push('\n');
        }
    }

    fn paragraph(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.break_block();
        self.out.text.push_str(text);
    }

    fn heading(&mut self, level: u32, title: &str) {
        let title = collapse_ws(title);
        if title.is_empty() {
            return;
        }
        let level = level.clamp(1, 6);
        self.break_block();
        self.out.headings.push(Heading {
            level,
            title: title.clone(),
            offset: self.out.text.len(),
        });
        self.out.text.push_str(&"#".repeat(level as usize));
        self.out.text.push(' ');
        self.out.text.push_str(&title);
    }

    fn table(&mut self, rows: Vec<Vec<String>>) {
        let rows: Vec<Vec<String>> = rows
            .into_iter()
            .filter(|r| r.iter().any(|c| !c.trim().is_empty()))
            .collect();
        if rows.is_empty() {
            return;
        }
        self.break_block();
        let rendered: Vec<String> = rows
            .iter()
            .map(|r| {
                let cells: Vec<String> = r.iter().map(|c| collapse_ws(c)).collect();
                format!("| {} |", cells.join(" | "))
            })
            .collect();
        self.out.text.push_str(&rendered.join("\n"));
        let page = self.page.map(|(n, _)| n);
        self.out.tables.push(Table { page, rows });
    }

    fn begin_page(&mut self, number: u32) {
        self.end_page();
        self.break_block();
        self.page = Some((number, self.out.text.len()));
    }

    fn end_page(&mut self) {
        if let Some((number, start)) = self.page.take() {
            self.out.pages.push(PageSpan {
                number,
                start,
                end: self.out.text.len(),
            });
        }
    }

    fn image(&mut self, mime_type: &str, bytes: Vec<u8>) {
        let id = format!("image_{}", self.out.images.len());
        let page = self.page.map(|(n, _)| n);
        self.out.images.push(ImageRef {
            id,
            mime_type: mime_type.to_string(),
            page,
            path: None,
            bytes,
        });
    }

    fn finish(mut self) -> ExtractedContent {
        self.end_page();
        let len = self.out.text.trim_end().len();
        self.out.text.truncate(len);
        for page in &mut self.out.pages {
            page.start = page.start.min(len);
            page.end = page.end.min(len);
        }
        self.out
    }
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_newlines(s: &str) -> String {
    s.trim_start_matches('\u{feff}')
        .replace("\r\n", "\n")
        .replace('\r', "\n")
}

/// Splits on blank lines, trimming trailing whitespace of each line.
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }
    paragraphs
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8]) -> Result<ExtractedContent, ExtractError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let mut b = ContentBuilder::default();
    for (i, page) in pages.iter().enumerate() {
        b.begin_page(i as u32 + 1);
        let page = normalize_newlines(&page.replace('\u{c}', "\n"));
        for para in split_paragraphs(&page) {
            b.paragraph(&para);
        }
    }
    Ok(b.finish())
}

// ============ OOXML ============

type ZipReader<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_zip(bytes: &[u8]) -> Result<ZipReader<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut ZipReader<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn has_entry(archive: &ZipReader<'_>, name: &str) -> bool {
    archive.file_names().any(|n| n == name)
}

/// Entries named `{prefix}{N}.xml`, sorted by N.
fn numbered_entries(archive: &ZipReader<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn attr_value(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

/// `Heading1`..`Heading9` and `Title` paragraph styles.
fn heading_level(e: &BytesStart) -> Option<u32> {
    let style = attr_value(e, b"val")?.to_ascii_lowercase().replace(' ', "");
    if style == "title" {
        return Some(1);
    }
    style
        .strip_prefix("heading")?
        .parse::<u32>()
        .ok()
        .filter(|l| (1..=9).contains(l))
}

fn image_mime(name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".png") {
        Some("image/png")
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        Some("image/jpeg")
    } else if lower.ends_with(".gif") {
        Some("image/gif")
    } else {
        None
    }
}

fn collect_media(
    archive: &mut ZipReader<'_>,
    prefix: &str,
    b: &mut ContentBuilder,
) -> Result<(), ExtractError> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix))
        .map(|s| s.to_string())
        .collect();
    names.sort();
    for name in names.into_iter().take(MAX_EMBEDDED_IMAGES) {
        let Some(mime) = image_mime(&name) else {
            continue;
        };
        let bytes = read_zip_entry_bounded(archive, &name, MAX_IMAGE_BYTES)?;
        b.image(mime, bytes);
    }
    Ok(())
}

/// Walks WordprocessingML and DrawingML bodies. Both use the local names
/// `p` (paragraph), `t` (text run), `tbl`/`tr`/`tc` (tables); docx heading
/// styles arrive via `pStyle`.
fn walk_ooxml(xml: &[u8], b: &mut ContentBuilder) -> Result<(), ExtractError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();

    let mut para = String::new();
    let mut heading: Option<u32> = None;
    let mut in_t = false;
    let mut table_depth = 0usize;
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_t = true,
                b"br" => para.push('\n'),
                b"p" => {
                    para.clear();
                    heading = None;
                }
                b"pStyle" => heading = heading_level(&e).or(heading),
                b"tbl" => {
                    table_depth += 1;
                    if table_depth == 1 {
                        rows.clear();
                    }
                }
                b"tr" if table_depth == 1 => row.clear(),
                b"tc" if table_depth == 1 => cell.clear(),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => para.push('\t'),
                b"br" | b"cr" => para.push('\n'),
                b"pStyle" => heading = heading_level(&e).or(heading),
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                para.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => {
                    if table_depth > 0 {
                        let text = collapse_ws(&para);
                        if !text.is_empty() {
                            if !cell.is_empty() {
                                cell.push(' ');
                            }
                            cell.push_str(&text);
                        }
                    } else if let Some(level) = heading {
                        b.heading(level, &para);
                    } else {
                        b.paragraph(&para);
                    }
                    para.clear();
                    heading = None;
                }
                b"tc" if table_depth == 1 => row.push(std::mem::take(&mut cell)),
                b"tr" if table_depth == 1 => rows.push(std::mem::take(&mut row)),
                b"tbl" => {
                    table_depth = table_depth.saturating_sub(1);
                    if table_depth == 0 {
                        b.table(std::mem::take(&mut rows));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn extract_docx(bytes: &[u8]) -> Result<ExtractedContent, ExtractError> {
    let mut archive = open_zip(bytes)?;
    if !has_entry(&archive, "word/document.xml") {
        return Err(ExtractError::Ooxml(
            "word/document.xml not found".to_string(),
        ));
    }
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    let mut b = ContentBuilder::default();
    walk_ooxml(&doc_xml, &mut b)?;
    collect_media(&mut archive, "word/media/", &mut b)?;
    Ok(b.finish())
}

fn extract_pptx(bytes: &[u8]) -> Result<ExtractedContent, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let slides = numbered_entries(&archive, "ppt/slides/slide");
    if slides.is_empty() {
        return Err(ExtractError::Ooxml("no slides found".to_string()));
    }
    let mut b = ContentBuilder::default();
    for (idx, name) in slides.iter().enumerate() {
        let number = idx as u32 + 1;
        let xml = read_zip_entry_bounded(&mut archive, name, MAX_XML_ENTRY_BYTES)?;
        b.begin_page(number);
        b.heading(2, &format!("Slide {}", number));
        walk_ooxml(&xml, &mut b)?;
    }
    b.end_page();
    collect_media(&mut archive, "ppt/media/", &mut b)?;
    Ok(b.finish())
}

fn extract_xlsx(bytes: &[u8]) -> Result<ExtractedContent, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let shared_strings = if has_entry(&archive, "xl/sharedStrings.xml") {
        read_shared_strings(&mut archive)?
    } else {
        Vec::new()
    };
    let titles = if has_entry(&archive, "xl/workbook.xml") {
        read_sheet_titles(&mut archive)?
    } else {
        Vec::new()
    };
    let sheets = numbered_entries(&archive, "xl/worksheets/sheet");
    if sheets.is_empty() {
        return Err(ExtractError::Ooxml("no worksheets found".to_string()));
    }

    let mut b = ContentBuilder::default();
    for (idx, name) in sheets.iter().take(XLSX_MAX_SHEETS).enumerate() {
        let number = idx as u32 + 1;
        let xml = read_zip_entry_bounded(&mut archive, name, MAX_XML_ENTRY_BYTES)?;
        let rows = read_sheet_rows(&xml, &shared_strings)?;
        b.begin_page(number);
        let title = titles
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("Sheet {}", number));
        b.heading(2, &title);
        b.table(rows);
    }
    Ok(b.finish())
}

fn read_shared_strings(archive: &mut ZipReader<'_>) -> Result<Vec<String>, ExtractError> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn read_sheet_titles(archive: &mut ZipReader<'_>) -> Result<Vec<String>, ExtractError> {
    let xml = read_zip_entry_bounded(archive, "xl/workbook.xml", MAX_XML_ENTRY_BYTES)?;
    let mut titles = Vec::new();
    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                if let Some(name) = attr_value(&e, b"name") {
                    titles.push(name);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(titles)
}

/// `"C7"` → 2.
fn column_index(cell_ref: &str) -> Option<usize> {
    let letters: Vec<char> = cell_ref
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() {
        return None;
    }
    let n = letters.iter().fold(0usize, |acc, c| {
        acc * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1)
    });
    Some(n - 1)
}

fn read_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<Vec<String>>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell_type = String::new();
    let mut cell_col: Option<usize> = None;
    let mut value = String::new();
    let mut in_value = false;
    let mut cell_count = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell_type = attr_value(&e, b"t").unwrap_or_default();
                    cell_col = attr_value(&e, b"r").and_then(|r| column_index(&r));
                    value.clear();
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                value.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let text = match cell_type.as_str() {
                        "s" => value
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i))
                            .cloned()
                            .unwrap_or_default(),
                        "b" => {
                            if value.trim() == "1" {
                                "TRUE".to_string()
                            } else {
                                "FALSE".to_string()
                            }
                        }
                        _ => value.trim().to_string(),
                    };
                    if let Some(col) = cell_col {
                        while row.len() < col {
                            row.push(String::new());
                        }
                    }
                    row.push(text);
                    cell_count += 1;
                    if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
                        rows.push(std::mem::take(&mut row));
                        break;
                    }
                }
                b"row" => rows.push(std::mem::take(&mut row)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

// ============ Text formats ============

fn extract_plain(bytes: &[u8]) -> ExtractedContent {
    let text = normalize_newlines(&String::from_utf8_lossy(bytes));
    ExtractedContent {
        text: text.trim_end().to_string(),
        ..Default::default()
    }
}

fn markdown_heading(line: &str) -> Option<(u32, String)> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    if title.is_empty() {
        None
    } else {
        Some((hashes as u32, title.to_string()))
    }
}

fn extract_markdown(bytes: &[u8]) -> ExtractedContent {
    let text = normalize_newlines(&String::from_utf8_lossy(bytes));
    let mut headings = Vec::new();
    let mut offset = 0;
    let mut in_fence = false;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed.trim_start().starts_with("```") {
            in_fence = !in_fence;
        } else if !in_fence {
            if let Some((level, title)) = markdown_heading(trimmed) {
                headings.push(Heading {
                    level,
                    title,
                    offset,
                });
            }
        }
        offset += line.len();
    }
    ExtractedContent {
        text: text.trim_end().to_string(),
        headings,
        ..Default::default()
    }
}

fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &tail[1..end];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some(' '),
                _ => entity.strip_prefix('#').and_then(|num| {
                    let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => num.parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                }),
            };
            c.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Tolerant tag scanner; real-world HTML is rarely well-formed XML.
#[derive(Default)]
struct HtmlState {
    b: ContentBuilder,
    text: String,
    heading: Option<u32>,
    table: Option<Vec<Vec<String>>>,
    row: Vec<String>,
    cell: Option<String>,
}

impl HtmlState {
    fn push_text(&mut self, raw: &str) {
        let decoded = decode_entities(raw);
        match self.cell.as_mut() {
            Some(cell) => cell.push_str(&decoded),
            None => self.text.push_str(&decoded),
        }
    }

    fn flush(&mut self) {
        let text = collapse_ws(&std::mem::take(&mut self.text));
        match self.heading {
            Some(level) => self.b.heading(level, &text),
            None => self.b.paragraph(&text),
        }
    }

    fn tag(&mut self, name: &str, closing: bool) {
        match name {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                self.flush();
                self.heading = if closing {
                    None
                } else {
                    name[1..].parse::<u32>().ok()
                };
            }
            "table" => {
                self.flush();
                if closing {
                    if let Some(rows) = self.table.take() {
                        self.b.table(rows);
                    }
                } else {
                    self.table = Some(Vec::new());
                }
            }
            "tr" => {
                if closing {
                    let row = std::mem::take(&mut self.row);
                    if let Some(rows) = self.table.as_mut() {
                        rows.push(row);
                    }
                } else {
                    self.row.clear();
                }
            }
            "td" | "th" => {
                if closing {
                    if let Some(cell) = self.cell.take() {
                        self.row.push(collapse_ws(&cell));
                    }
                } else if self.table.is_some() {
                    self.cell = Some(String::new());
                }
            }
            "p" | "div" | "br" | "li" | "ul" | "ol" | "section" | "article" | "header"
            | "footer" | "blockquote" | "pre" | "hr" | "main" | "nav" => self.flush(),
            _ => {}
        }
    }
}

fn extract_html(bytes: &[u8]) -> ExtractedContent {
    let html = normalize_newlines(&String::from_utf8_lossy(bytes));
    let mut state = HtmlState::default();
    let mut skip_until: Option<String> = None;
    let mut rest: &str = &html;

    while let Some(lt) = rest.find('<') {
        if skip_until.is_none() {
            state.push_text(&rest[..lt]);
        }
        let after = &rest[lt..];
        if after.starts_with("<!--") {
            rest = match after.find("-->") {
                Some(end) => &after[end + 3..],
                None => "",
            };
            continue;
        }
        let Some(gt) = after.find('>') else {
            rest = "";
            break;
        };
        let tag = &after[1..gt];
        rest = &after[gt + 1..];

        let closing = tag.starts_with('/');
        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();

        if let Some(skip) = &skip_until {
            if closing && name == *skip {
                skip_until = None;
            }
            continue;
        }
        match name.as_str() {
            "script" | "style" | "noscript" | "template" | "head" if !closing => {
                skip_until = Some(name);
            }
            _ => state.tag(&name, closing),
        }
    }
    if skip_until.is_none() {
        state.push_text(rest);
    }
    state.flush();
    if let Some(rows) = state.table.take() {
        state.b.table(rows);
    }
    state.b.finish()
}

fn extract_image(bytes: &[u8], content_type: &str) -> ExtractedContent {
    let mut b = ContentBuilder::default();
    b.image(content_type, bytes.to_vec());
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            for (name, body) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    const W_NS: &str = "xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"";

    #[test]
    fn unsupported_content_type_returns_error() {
        let err = extract(b"foo", "application/octet-stream").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract(b"not a zip", MIME_DOCX).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn docx_keeps_headings_paragraphs_and_tables() {
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document {W_NS}><w:body>\
             <w:p><w:pPr><w:pStyle w:val=\"Heading1\"/></w:pPr><w:r><w:t>Overview</w:t></w:r></w:p>\
             <w:p><w:r><w:t xml:space=\"preserve\">Hello </w:t></w:r><w:r><w:t>world &amp; more</w:t></w:r></w:p>\
             <w:tbl><w:tr><w:tc><w:p><w:r><w:t>Name</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>Qty</w:t></w:r></w:p></w:tc></w:tr>\
             <w:tr><w:tc><w:p><w:r><w:t>Bolts</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>12</w:t></w:r></w:p></w:tc></w:tr></w:tbl>\
             </w:body></w:document>"
        );
        let bytes = zip_with(&[("word/document.xml", &xml)]);
        let content = extract(&bytes, MIME_DOCX).unwrap();
        assert_eq!(
            content.text,
            "# Overview\n\nHello world & more\n\n| Name | Qty |\n| Bolts | 12 |"
        );
        assert_eq!(content.headings.len(), 1);
        assert_eq!(content.headings[0].title, "Overview");
        assert_eq!(content.headings[0].offset, 0);
        assert_eq!(content.tables.len(), 1);
        assert_eq!(content.tables[0].rows[1], vec!["Bolts", "12"]);
    }

    #[test]
    fn docx_without_body_is_corrupt() {
        let bytes = zip_with(&[("other.xml", "<x/>")]);
        let err = extract(&bytes, MIME_DOCX).unwrap_err();
        assert!(err.to_string().contains("word/document.xml"));
    }

    #[test]
    fn pptx_slides_in_numeric_order_with_pages() {
        let slide = |text: &str| {
            format!(
                "<p:sld xmlns:p=\"p\" xmlns:a=\"a\"><p:cSld><p:spTree><p:sp><p:txBody>\
                 <a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>",
                text
            )
        };
        let bytes = zip_with(&[
            ("ppt/slides/slide10.xml", &slide("tenth")),
            ("ppt/slides/slide2.xml", &slide("second")),
            ("ppt/slides/slide1.xml", &slide("first")),
        ]);
        let content = extract(&bytes, MIME_PPTX).unwrap();
        let first = content.text.find("first").unwrap();
        let second = content.text.find("second").unwrap();
        let tenth = content.text.find("tenth").unwrap();
        assert!(first < second && second < tenth);
        assert_eq!(content.pages.len(), 3);
        assert_eq!(content.page_at(tenth), Some(3));
        assert!(content.text.starts_with("## Slide 1"));
    }

    #[test]
    fn xlsx_sheet_becomes_table() {
        let shared = "<sst><si><t>Region</t></si><si><r><t>No</t></r><r><t>rth</t></r></si></sst>";
        let workbook = "<workbook><sheets><sheet name=\"Sales\" sheetId=\"1\"/></sheets></workbook>";
        let sheet = "<worksheet><sheetData>\
                     <row r=\"1\"><c r=\"A1\" t=\"s\"><v>0</v></c><c r=\"B1\" t=\"inlineStr\"><is><t>Total</t></is></c></row>\
                     <row r=\"2\"><c r=\"A2\" t=\"s\"><v>1</v></c><c r=\"C2\"><v>42.5</v></c></row>\
                     </sheetData></worksheet>";
        let bytes = zip_with(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/workbook.xml", workbook),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        let content = extract(&bytes, MIME_XLSX).unwrap();
        assert_eq!(content.headings[0].title, "Sales");
        assert_eq!(content.tables.len(), 1);
        assert_eq!(content.tables[0].rows[0], vec!["Region", "Total"]);
        assert_eq!(content.tables[0].rows[1], vec!["North", "", "42.5"]);
        assert_eq!(content.tables[0].page, Some(1));
    }

    #[test]
    fn markdown_headings_outside_fences() {
        let md = "# Title\n\nIntro\n\n```\n# not a heading\n```\n\n## Details ##\nBody\n";
        let content = extract(md.as_bytes(), MIME_MARKDOWN).unwrap();
        let titles: Vec<_> = content.headings.iter().map(|h| h.title.as_str()).collect();
        assert_eq!(titles, vec!["Title", "Details"]);
        assert_eq!(content.headings[1].level, 2);
        assert!(content.text[content.headings[1].offset..].starts_with("## Details"));
    }

    #[test]
    fn html_drops_scripts_and_keeps_structure() {
        let html = "<html><head><title>x</title><script>var a = 1;</script></head><body>\
                    <h1>Guide</h1><p>Fish &amp; chips&nbsp;today</p>\
                    <table><tr><th>k</th><th>v</th></tr><tr><td>a</td><td>1</td></tr></table>\
                    <!-- hidden --><p>End</p></body></html>";
        let content = extract(html.as_bytes(), MIME_HTML).unwrap();
        assert_eq!(
            content.text,
            "# Guide\n\nFish & chips today\n\n| k | v |\n| a | 1 |\n\nEnd"
        );
        assert!(!content.text.contains("var a"));
        assert_eq!(content.headings[0].title, "Guide");
    }

    #[test]
    fn plain_text_normalizes_newlines() {
        let content = extract(b"\xEF\xBB\xBFline one\r\nline two\r\n\r\n", MIME_TEXT).unwrap();
        assert_eq!(content.text, "line one\nline two");
        assert!(content.pages.is_empty());
    }

    #[test]
    fn image_yields_artifact_without_text() {
        let content = extract(&[0x89, b'P', b'N', b'G'], "image/png").unwrap();
        assert!(content.text.is_empty());
        assert_eq!(content.images.len(), 1);
        assert_eq!(content.images[0].mime_type, "image/png");
    }

    #[test]
    fn extraction_is_deterministic() {
        let md = "# A\n\nalpha\n\n# B\n\nbeta";
        let a = extract(md.as_bytes(), MIME_MARKDOWN).unwrap();
        let b = extract(md.as_bytes(), MIME_MARKDOWN).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn timeout_wrapper_passes_results_through() {
        let content = extract_with_timeout(b"hello".to_vec(), MIME_TEXT.to_string(), 5)
            .await
            .unwrap();
        assert_eq!(content.text, "hello");
        let err = extract_with_timeout(b"x".to_vec(), "application/zip".to_string(), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }
}
