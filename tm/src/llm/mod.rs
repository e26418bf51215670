//! LLM capability interface
//!
//! Every LLM use in the engine (operation classification, planning,
//! semantic matching, dimension discovery, output scoring) goes through one
//! stateless interface: a request in, a string or parsed JSON out. Call
//! sites own their schemas; no conversation state is kept between calls.

mod client;
mod openai;

pub use client::LlmClient;
pub use openai::OpenAiClient;

#[cfg(test)]
pub use client::mock::MockLlm;

use thiserror::Error;

/// Errors from the LLM capability
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Response is not valid JSON: {0}")]
    Json(String),
}

/// A single stateless completion request
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    /// System framing for this call site
    pub system: String,
    /// The rendered prompt
    pub prompt: String,
    /// Hard cap on generated tokens (0 = provider default)
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
}

impl LlmRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            max_tokens: 1024,
            temperature: 0.2,
        }
    }
}

/// Extract a JSON value from raw model output
///
/// Accepts strict JSON, or output with surrounding prose / code fences, by
/// scanning for the outermost `{...}` or `[...]` block.
pub fn extract_json(text: &str) -> Result<serde_json::Value, LlmError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(start) = trimmed.find(open) {
            let mut depth = 0usize;
            for (offset, ch) in trimmed[start..].char_indices() {
                if ch == open {
                    depth += 1;
                } else if ch == close {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &trimmed[start..start + offset + ch.len_utf8()];
                        if let Ok(value) = serde_json::from_str(candidate) {
                            return Ok(value);
                        }
                        break;
                    }
                }
            }
        }
    }

    let preview: String = trimmed.chars().take(120).collect();
    Err(LlmError::Json(format!("no JSON object found in: {preview}")))
}
