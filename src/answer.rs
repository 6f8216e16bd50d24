//! Question answering over retrieved chunks.
//!
//! Retrieve, drop weak candidates, pack a numbered context window, ask the
//! generator. When nothing clears `retrieval.similarity_threshold`, or the
//! generator replies `NO_ANSWER`, the response is the fixed
//! [`NO_GROUNDED_ANSWER`] text with `grounded = false`; the generator is not
//! consulted at all in the first case.

use serde::Serialize;
use std::time::Instant;

use crate::engine::Engine;
use crate::error::PipelineError;
use crate::generate::{Passage, TokenUsage};
use crate::models::IndexHit;
use crate::retrieve::{apply_threshold, search, SearchRequest, Strategy};

pub const NO_GROUNDED_ANSWER: &str =
    "I could not find information in the indexed documents that answers this question.";

const SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub query: String,
    pub top_k: Option<usize>,
    pub use_hierarchical: bool,
    pub include_sources: bool,
    pub conversation_id: Option<String>,
    pub document_ids: Option<Vec<String>>,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReference {
    pub number: usize,
    pub document_id: String,
    pub document_name: String,
    pub chunk_id: String,
    pub page_number: Option<u32>,
    pub section_title: Option<String>,
    pub snippet: String,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub grounded: bool,
    pub sources: Vec<SourceReference>,
    pub conversation_id: String,
    pub processing_time_ms: f64,
    pub token_usage: Option<TokenUsage>,
    pub retrieval: Strategy,
}

/// Renders hits as `[n] filename, page p` blocks until `max_chars` is
/// reached. The first passage is truncated rather than dropped.
pub fn build_context(hits: &[IndexHit], max_chars: usize) -> (String, Vec<Passage>) {
    let mut context = String::new();
    let mut passages = Vec::new();

    for (i, hit) in hits.iter().enumerate() {
        let mut passage = Passage {
            number: i + 1,
            document_id: hit.document_id.clone(),
            chunk_id: hit.chunk_id.clone(),
            filename: hit.metadata.filename.clone(),
            page_number: hit.metadata.page_number,
            section_title: hit.metadata.section_title.clone(),
            text: hit.metadata.text.clone(),
            score: hit.score,
        };
        let header = passage.label();
        let needed = header.len() + passage.text.len() + 3;
        let remaining = max_chars.saturating_sub(context.len());

        if needed > remaining {
            if !passages.is_empty() {
                break;
            }
            let room = remaining.saturating_sub(header.len() + 3);
            if room == 0 {
                break;
            }
            passage.text = truncate(&passage.text, room).to_string();
        }

        if !context.is_empty() {
            context.push('\n');
        }
        context.push_str(&header);
        context.push('\n');
        context.push_str(&passage.text);
        context.push('\n');
        passages.push(passage);
    }

    (context, passages)
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}

fn source_of(p: &Passage) -> SourceReference {
    SourceReference {
        number: p.number,
        document_id: p.document_id.clone(),
        document_name: p.filename.clone(),
        chunk_id: p.chunk_id.clone(),
        page_number: p.page_number,
        section_title: p.section_title.clone(),
        snippet: truncate(&p.text, SNIPPET_CHARS).to_string(),
        relevance_score: p.score,
    }
}

pub async fn answer(engine: &Engine, request: &QueryRequest) -> Result<Answer, PipelineError> {
    let started = Instant::now();
    let conversation_id = request
        .conversation_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let outcome = search(
        engine,
        &SearchRequest {
            query: request.query.clone(),
            top_k: request.top_k.unwrap_or(engine.config.retrieval.top_k),
            use_hierarchical: request.use_hierarchical,
            document_ids: request.document_ids.clone(),
            owner: request.owner.clone(),
        },
    )
    .await?;

    let hits = apply_threshold(outcome.hits, engine.config.retrieval.similarity_threshold);
    let ungrounded = |usage: Option<TokenUsage>| Answer {
        answer: NO_GROUNDED_ANSWER.to_string(),
        grounded: false,
        sources: Vec::new(),
        conversation_id: conversation_id.clone(),
        processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        token_usage: usage,
        retrieval: outcome.strategy,
    };

    if hits.is_empty() {
        tracing::info!(query_len = request.query.len(), "No chunk cleared the similarity threshold");
        return Ok(ungrounded(None));
    }

    let (context, passages) = build_context(&hits, engine.config.generation.max_context_chars);
    let generation = engine
        .generator
        .generate(&request.query, &context, &passages)
        .await?;

    if generation.is_no_answer() {
        tracing::info!(generator = engine.generator.name(), "Generator found no answer in context");
        return Ok(ungrounded(generation.usage));
    }

    Ok(Answer {
        answer: generation.text,
        grounded: true,
        sources: if request.include_sources {
            passages.iter().map(source_of).collect()
        } else {
            Vec::new()
        },
        conversation_id: conversation_id.clone(),
        processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        token_usage: generation.usage,
        retrieval: outcome.strategy,
    })
}
