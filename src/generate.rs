//! Answer generation backends.
//!
//! | `generation.provider` | Backend |
//! |-----------------------|---------|
//! | `openai` | [`OpenAIGenerator`]: chat completions, any OpenAI-compatible `base_url` |
//! | `extractive` | [`ExtractiveGenerator`]: offline, quotes the best-matching source sentences |
//! | `disabled` | [`DisabledGenerator`]: lists the sources without composing an answer |
//!
//! A backend that cannot answer from the given context replies with
//! [`NO_ANSWER`]; the orchestrator turns that into an ungrounded response.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::embedding::post_with_retry;
use crate::error::PipelineError;

/// Sentinel reply meaning "the context does not answer the question".
pub const NO_ANSWER: &str = "NO_ANSWER";

const SYSTEM_PROMPT: &str = "You answer questions using only the numbered context passages. \
Cite the passages you use as [n]. If the passages do not contain the answer, reply with exactly NO_ANSWER.";

/// One numbered piece of retrieved context.
#[derive(Debug, Clone, Serialize)]
pub struct Passage {
    pub number: usize,
    pub document_id: String,
    pub chunk_id: String,
    pub filename: String,
    pub page_number: Option<u32>,
    pub section_title: Option<String>,
    pub text: String,
    pub score: f32,
}

impl Passage {
    /// `[n] filename, page p` header used in context blocks.
    pub fn label(&self) -> String {
        match self.page_number {
            Some(p) => format!("[{}] {}, page {}", self.number, self.filename, p),
            None => format!("[{}] {}", self.number, self.filename),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

impl Generation {
    pub fn is_no_answer(&self) -> bool {
        self.text
            .trim()
            .trim_end_matches('.')
            .eq_ignore_ascii_case(NO_ANSWER)
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    /// Answers `query` from `context`, the rendered form of `passages`.
    async fn generate(&self, query: &str, context: &str, passages: &[Passage]) -> Result<Generation, PipelineError>;
}

// ============ OpenAI ============

pub struct OpenAIGenerator {
    model: String,
    base_url: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    /// Reads the key from `OPENAI_API_KEY`.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Self::with_key(config, &api_key)
    }

    pub fn with_key(config: &GenerationConfig, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.to_string(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, query: &str, context: &str, _passages: &[Passage]) -> Result<Generation, PipelineError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": format!("Context:\n{}\n\nQuestion: {}", context, query) },
            ],
        });
        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);

        let json = post_with_retry(request, self.max_retries, "OpenAI")
            .await
            .map_err(|e| PipelineError::GenerationFailure(e.to_string()))?;
        parse_chat_response(&json).map_err(|e| PipelineError::GenerationFailure(e.to_string()))
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<Generation> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing choices[0].message.content"))?
        .trim()
        .to_string();

    let usage = json.get("usage").map(|u| {
        let field = |k: &str| u.get(k).and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        TokenUsage {
            prompt_tokens: field("prompt_tokens"),
            completion_tokens: field("completion_tokens"),
            total_tokens: field("total_tokens"),
        }
    });

    Ok(Generation { text, usage })
}

// ============ Extractive ============

/// Picks the source sentences sharing the most terms with the query and
/// quotes them with their citation numbers.
pub struct ExtractiveGenerator {
    max_sentences: usize,
}

impl ExtractiveGenerator {
    pub fn new() -> Self {
        Self { max_sentences: 3 }
    }
}

impl Default for ExtractiveGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_lowercase())
        .collect()
}

#[async_trait]
impl Generator for ExtractiveGenerator {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn generate(&self, query: &str, _context: &str, passages: &[Passage]) -> Result<Generation, PipelineError> {
        let query_terms = terms(query);

        // (overlap, passage order, sentence order) keeps ties deterministic.
        let mut scored: Vec<(usize, usize, usize, String, usize)> = Vec::new();
        for (pi, passage) in passages.iter().enumerate() {
            let flat = passage.text.split_whitespace().collect::<Vec<_>>().join(" ");
            for (si, sentence) in flat.split_inclusive(['.', '!', '?']).enumerate() {
                let sentence = sentence.trim();
                if sentence.is_empty() || sentence.starts_with('|') {
                    continue;
                }
                let overlap = terms(sentence).intersection(&query_terms).count();
                if overlap > 0 {
                    scored.push((overlap, pi, si, sentence.to_string(), passage.number));
                }
            }
        }

        if scored.is_empty() {
            return Ok(Generation {
                text: NO_ANSWER.to_string(),
                usage: None,
            });
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        scored.truncate(self.max_sentences);
        scored.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        let quoted: Vec<String> = scored
            .into_iter()
            .map(|(_, _, _, sentence, number)| format!("{} [{}]", sentence, number))
            .collect();
        Ok(Generation {
            text: quoted.join(" "),
            usage: None,
        })
    }
}

// ============ Disabled ============

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _query: &str, _context: &str, passages: &[Passage]) -> Result<Generation, PipelineError> {
        let labels: Vec<String> = passages.iter().map(Passage::label).collect();
        Ok(Generation {
            text: format!("Answer generation is disabled. Relevant sources: {}", labels.join("; ")),
            usage: None,
        })
    }
}

pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "extractive" => Ok(Arc::new(ExtractiveGenerator::new())),
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        other => anyhow::bail!("Unknown generation provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(number: usize, text: &str, page: Option<u32>) -> Passage {
        Passage {
            number,
            document_id: "d".into(),
            chunk_id: format!("d_chunk_{}", number),
            filename: "handbook.pdf".into(),
            page_number: page,
            section_title: None,
            text: text.into(),
            score: 0.9,
        }
    }

    #[tokio::test]
    async fn extractive_quotes_matching_sentences_with_citations() {
        let passages = vec![
            passage(1, "The office opens at nine. Parking is free on weekends.", Some(2)),
            passage(2, "Vacation requests need two weeks notice. Managers approve vacation.", Some(5)),
        ];
        let gen = ExtractiveGenerator::new()
            .generate("How much notice for vacation requests?", "", &passages)
            .await
            .unwrap();
        assert!(gen.text.starts_with("Vacation requests need two weeks notice. [2]"));
        assert!(!gen.text.contains("Parking"));
        assert!(!gen.is_no_answer());
    }

    #[tokio::test]
    async fn extractive_without_overlap_is_no_answer() {
        let passages = vec![passage(1, "Completely unrelated prose.", None)];
        let gen = ExtractiveGenerator::new()
            .generate("quantum chromodynamics", "", &passages)
            .await
            .unwrap();
        assert!(gen.is_no_answer());
    }

    #[test]
    fn no_answer_detection_tolerates_punctuation() {
        let g = |t: &str| Generation { text: t.into(), usage: None };
        assert!(g("NO_ANSWER").is_no_answer());
        assert!(g(" no_answer. ").is_no_answer());
        assert!(!g("The answer is NO_ANSWER-free").is_no_answer());
    }

    #[test]
    fn chat_response_parsing() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": " It is blue [1]. " } }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
        });
        let gen = parse_chat_response(&json).unwrap();
        assert_eq!(gen.text, "It is blue [1].");
        assert_eq!(gen.usage.unwrap().total_tokens, 15);
        assert!(parse_chat_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn passage_labels() {
        assert_eq!(passage(3, "x", Some(7)).label(), "[3] handbook.pdf, page 7");
        assert_eq!(passage(1, "x", None).label(), "[1] handbook.pdf");
    }

    #[tokio::test]
    async fn openai_generator_against_local_server() {
        use axum::{routing::post, Json, Router};

        let app = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                let user = body["messages"][1]["content"].as_str().unwrap_or_default().to_string();
                let content = if user.contains("Question: colour?") { "Blue [1]." } else { "NO_ANSWER" };
                Json(serde_json::json!({
                    "choices": [{ "message": { "content": content } }],
                    "usage": { "prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5 }
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = GenerationConfig {
            provider: "openai".into(),
            base_url: Some(format!("http://{}/v1", addr)),
            max_retries: 0,
            ..GenerationConfig::default()
        };
        let gen = OpenAIGenerator::with_key(&config, "test-key").unwrap();
        let out = gen.generate("colour?", "[1] sky.txt\nThe sky is blue.", &[]).await.unwrap();
        assert_eq!(out.text, "Blue [1].");
        assert_eq!(out.usage.map(|u| u.total_tokens), Some(5));

        let out = gen.generate("weight?", "[1] sky.txt\nThe sky is blue.", &[]).await.unwrap();
        assert!(out.is_no_answer());
    }
}
