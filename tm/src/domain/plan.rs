//! Execution plan types
//!
//! The planner turns a user utterance into an ordered list of typed steps.
//! Steps execute strictly in sequence-number order and may reference only
//! strictly earlier steps' outputs, by symbolic name (`$step_2_output`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::ParamMap;

/// Errors in plan construction or validation
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Plan has no steps")]
    Empty,

    #[error("Step {step} is out of order (previous was {previous})")]
    OutOfOrder { step: u32, previous: u32 },

    #[error("Step {step} references unknown output '{reference}'")]
    UnknownReference { step: u32, reference: String },

    #[error("Dependency cycle involving '{0}'")]
    Cycle(String),

    #[error("Planner output malformed: {0}")]
    Malformed(String),
}

/// Which executor runs a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutorClass {
    /// Recurse into an Agent tree node
    Agent,
    /// Invoke an external tool / connector directly
    Tool,
}

/// Reduction applied over parallel replica results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    #[default]
    List,
    Last,
    Mean,
    Majority,
    Sum,
    Min,
    Max,
}

impl AggregationStrategy {
    /// Parse a strategy name; unknown names fall back to `List`
    /// (the caller is expected to warn).
    pub fn parse_or_list(name: &str) -> (Self, bool) {
        match name {
            "list" => (Self::List, true),
            "last" => (Self::Last, true),
            "mean" => (Self::Mean, true),
            "majority" => (Self::Majority, true),
            "sum" => (Self::Sum, true),
            "min" => (Self::Min, true),
            "max" => (Self::Max, true),
            _ => (Self::List, false),
        }
    }
}

/// Declared parameters of a step
///
/// Three shapes, matching how the planner (and users) express them:
/// a free-text instruction, a structured map that may carry `$name`
/// references to earlier step outputs, or nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepParams {
    Instruction(String),
    Map(ParamMap),
    Empty,
}

impl Default for StepParams {
    fn default() -> Self {
        Self::Empty
    }
}

impl StepParams {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Instruction(s) => s.is_empty(),
            Self::Map(m) => m.is_empty(),
            Self::Empty => true,
        }
    }
}

/// One step of an execution plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Sequence number, monotonic within the plan
    pub step: u32,

    /// AGENT (tree node) or TOOL (external connector)
    #[serde(rename = "type")]
    pub executor_class: ExecutorClass,

    /// Node id or tool name
    pub executor: String,

    /// What this step is meant to accomplish
    pub description: String,

    /// Declared parameters
    #[serde(default)]
    pub params: StepParams,

    /// Run `repeat_count` replicas through the parallel aggregator
    #[serde(default)]
    pub is_parallel: bool,

    /// Replica count for parallel steps
    #[serde(default = "default_repeat")]
    pub repeat_count: u32,

    /// Reduction over replica results
    #[serde(default)]
    pub aggregation: Option<AggregationStrategy>,
}

fn default_repeat() -> u32 {
    1
}

impl PlanStep {
    /// The symbolic name under which this step's output is stored
    pub fn output_key(&self) -> String {
        format!("step_{}_output", self.step)
    }
}

/// An ordered sequence of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Validate the plan invariants: non-empty, monotonic sequence numbers,
    /// and `$name` references only to strictly earlier steps' outputs.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut previous: Option<u32> = None;
        let mut known_outputs: Vec<String> = Vec::new();

        for step in &self.steps {
            if let Some(prev) = previous
                && step.step <= prev
            {
                return Err(PlanError::OutOfOrder {
                    step: step.step,
                    previous: prev,
                });
            }

            if let StepParams::Map(map) = &step.params {
                for value in map.values() {
                    if let Value::String(s) = value
                        && let Some(reference) = s.strip_prefix('$')
                        && !known_outputs.iter().any(|k| k == reference)
                    {
                        return Err(PlanError::UnknownReference {
                            step: step.step,
                            reference: reference.to_string(),
                        });
                    }
                }
            }

            known_outputs.push(step.output_key());
            previous = Some(step.step);
        }

        Ok(())
    }

    /// Renumber steps 1..n preserving order
    pub fn renumber(&mut self) {
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.step = (i + 1) as u32;
        }
    }
}
