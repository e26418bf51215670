//! Prompt templates
//!
//! Every LLM call site renders its prompt from an embedded `.pmt` template
//! (Handlebars syntax). Keeping the prompts out of the call sites makes
//! them reviewable in one place and keeps the Rust code free of prose.

mod embedded;

pub use embedded::get_embedded;

use handlebars::Handlebars;
use serde_json::Value;
use thiserror::Error;

/// Errors from prompt rendering
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Unknown prompt template: {0}")]
    Unknown(String),

    #[error("Template render failed: {0}")]
    Render(#[from] handlebars::RenderError),
}

/// Render a named embedded template with the given context
pub fn render(name: &str, context: &Value) -> Result<String, PromptError> {
    let template = get_embedded(name).ok_or_else(|| PromptError::Unknown(name.to_string()))?;
    let mut registry = Handlebars::new();
    registry.set_strict_mode(false);
    Ok(registry.render_template(template, context)?)
}
