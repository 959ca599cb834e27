//! Model Gateway abstraction
//!
//! The agent only needs two capabilities from a language model backend:
//! a single-turn `chat(system, user) -> text` used for planning and content
//! generation, and `embedding(text) -> vector` used by knowledge retrieval.
//! The `ModelGateway` trait is that boundary; `openai` provides an
//! OpenAI-compatible HTTP implementation.

use async_trait::async_trait;
use sdk::errors::EngineError;

pub mod openai;

pub use openai::OpenAIGateway;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur during gateway calls
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl From<LLMError> for EngineError {
    fn from(err: LLMError) -> Self {
        match err {
            LLMError::Timeout => EngineError::LLMTimeout,
            other => EngineError::Gateway(other.to_string()),
        }
    }
}

/// Reasoning and embedding backend consumed by the planner and the tools
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Single-turn completion
    async fn chat(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;

    /// Embed a text into a dense vector
    async fn embedding(&self, text: &str) -> Result<Vec<f64>>;
}

/// Locate the JSON object inside a model reply.
///
/// Handles:
/// 1. Raw JSON (the whole reply is the object)
/// 2. Fenced JSON, with or without trailing prose
/// 3. An object embedded in prose, found by brace matching
pub fn extract_json_object(content: &str) -> Option<&str> {
    let trimmed = content.trim();

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }

    if let Some(inner) = extract_fenced_json(trimmed) {
        let inner = inner.trim();
        if inner.starts_with('{') {
            return extract_balanced_json(inner).or(Some(inner));
        }
    }

    let pos = trimmed.find('{')?;
    extract_balanced_json(&trimmed[pos..])
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
/// Returns `None` if no fenced block is found.
fn extract_fenced_json(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "json\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Extract a balanced JSON object starting at position 0 of `s`.
///
/// Counts `{` / `}` depth, respecting string literals, to find the
/// matching close brace.
fn extract_balanced_json(s: &str) -> Option<&str> {
    if !s.starts_with('{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
