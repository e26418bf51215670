//! Dimension discovery and output scoring
//!
//! The optimization loop needs two judgments the engine cannot make
//! structurally: which knobs are worth tuning for a goal, and how good one
//! output is. Both are delegated to the LLM with deterministic fallbacks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::domain::ParamMap;
use crate::llm::{LlmClient, LlmError, LlmRequest};
use crate::prompts;

/// One tunable dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Dimension {
    Float { name: String, min: f64, max: f64 },
    Int { name: String, min: i64, max: i64 },
    Categorical { name: String, choices: Vec<String> },
}

impl Dimension {
    pub fn name(&self) -> &str {
        match self {
            Self::Float { name, .. } | Self::Int { name, .. } | Self::Categorical { name, .. } => name,
        }
    }
}

/// The tunable schema for one optimization goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DimensionSchema {
    pub dimensions: Vec<Dimension>,
}

impl DimensionSchema {
    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }
}

/// LLM-backed dimension parser and output judge
pub struct DimensionParser {
    llm: Arc<dyn LlmClient>,
}

impl DimensionParser {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Propose a tunable schema for a goal
    ///
    /// Falls back to a schema derived from the numeric parameters already
    /// present (or a single generic dial) when the LLM output is unusable.
    pub async fn discover(&self, user_goal: &str, parameters: &ParamMap) -> DimensionSchema {
        let context = json!({
            "user_goal": user_goal,
            "parameters": Value::Object(parameters.clone()).to_string(),
        });

        let attempt = async {
            let prompt = prompts::render("dimensions", &context)
                .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
            let value = self
                .llm
                .complete_json(LlmRequest::new("You analyze optimization problems.", prompt))
                .await?;
            parse_schema(&value).ok_or_else(|| LlmError::InvalidResponse("no usable dimensions".to_string()))
        };

        match attempt.await {
            Ok(schema) => {
                debug!(count = schema.dimensions.len(), "DimensionParser: discovered schema");
                schema
            }
            Err(e) => {
                warn!(error = %e, "DimensionParser: discovery failed, deriving fallback schema");
                fallback_schema(parameters)
            }
        }
    }

    /// Score one output against the goal, in [0, 1]
    pub async fn score(&self, user_goal: &str, output: &Value) -> Result<f64, LlmError> {
        let context = json!({
            "user_goal": user_goal,
            "output": output.to_string(),
        });
        let prompt =
            prompts::render("score", &context).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let value = self
            .llm
            .complete_json(LlmRequest::new("You judge task outputs.", prompt))
            .await?;
        let score = value
            .get("score")
            .and_then(Value::as_f64)
            .ok_or_else(|| LlmError::InvalidResponse("missing score".to_string()))?;
        Ok(score.clamp(0.0, 1.0))
    }
}

fn parse_schema(value: &Value) -> Option<DimensionSchema> {
    let schema: DimensionSchema = serde_json::from_value(value.clone()).ok()?;
    if schema.is_empty() { None } else { Some(schema) }
}

/// Deterministic fallback: one float dimension per numeric parameter,
/// spanning zero to double the current value; a single generic dial when
/// nothing numeric exists.
pub fn fallback_schema(parameters: &ParamMap) -> DimensionSchema {
    let mut dimensions = Vec::new();
    for (name, value) in parameters {
        if let Some(n) = value.as_f64() {
            let max = if n > 0.0 { n * 2.0 } else { 1.0 };
            dimensions.push(Dimension::Float {
                name: name.clone(),
                min: 0.0,
                max,
            });
        }
    }
    if dimensions.is_empty() {
        dimensions.push(Dimension::Float {
            name: "intensity".to_string(),
            min: 0.0,
            max: 1.0,
        });
    }
    DimensionSchema { dimensions }
}
