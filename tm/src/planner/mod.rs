//! Task planner
//!
//! Two phases:
//!
//! 1. **Semantic decomposition** - ask the LLM for an ordered step list,
//!    with the target agent's direct children as the AGENT-class candidate
//!    set; anything else must be classed TOOL.
//! 2. **Structural expansion** - an AGENT step whose target belongs to a
//!    non-trivial strongly-connected dependency cluster is replaced by the
//!    whole cluster, planned together under shared constraints and
//!    linearized by condensation topological sort.

mod scc;

pub use scc::{condensation_topo_sort, strongly_connected_components};

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::domain::{
    AggregationStrategy, ExecutionPlan, ExecutorClass, ParamMap, PlanError, PlanStep, StepParams,
};
use crate::llm::{LlmClient, LlmRequest};
use crate::prompts;
use crate::tree::AgentTree;

/// Influence threshold for fetching the dependency subgraph
const SCC_THRESHOLD: f64 = 0.3;

/// Hop bound for the dependency subgraph
const SCC_MAX_HOPS: u32 = 5;

/// LLM-shaped step, tolerant of partial fields
#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    step: u32,
    #[serde(rename = "type", default)]
    class: Option<String>,
    #[serde(default)]
    executor: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    is_parallel: bool,
    #[serde(default)]
    repeat_count: Option<u32>,
    #[serde(default)]
    aggregation: Option<String>,
}

/// The task planner
pub struct Planner {
    tree: Arc<dyn AgentTree>,
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(tree: Arc<dyn AgentTree>, llm: Arc<dyn LlmClient>) -> Self {
        Self { tree, llm }
    }

    /// Produce an execution plan for a user goal against a target agent
    ///
    /// Guaranteed non-empty for any non-empty utterance: when decomposition
    /// fails the degenerate fallback is one step targeting the agent itself.
    pub async fn plan(
        &self,
        target_agent_id: &str,
        utterance: &str,
        memory_context: Option<&str>,
    ) -> Result<ExecutionPlan, PlanError> {
        if utterance.trim().is_empty() {
            return Err(PlanError::Empty);
        }
        debug!(%target_agent_id, "Planner::plan");

        let candidates = self.candidate_children(target_agent_id).await;
        let candidate_ids: Vec<String> = candidates
            .iter()
            .filter_map(|c| c["id"].as_str().map(str::to_string))
            .collect();

        let mut plan = match self
            .decompose(target_agent_id, utterance, memory_context, &candidates, &candidate_ids)
            .await
        {
            Ok(plan) if !plan.is_empty() => plan,
            Ok(_) => {
                info!(%target_agent_id, "Planner: empty decomposition, using degenerate fallback");
                fallback_plan(target_agent_id, utterance)
            }
            Err(e) => {
                warn!(%target_agent_id, error = %e, "Planner: decomposition failed, using degenerate fallback");
                fallback_plan(target_agent_id, utterance)
            }
        };

        plan = self.expand_clusters(plan, utterance).await?;
        plan.renumber();
        plan.validate()?;
        Ok(plan)
    }

    async fn candidate_children(&self, target_agent_id: &str) -> Vec<Value> {
        let mut candidates = Vec::new();
        if let Ok(children) = self.tree.get_children(target_agent_id).await {
            for child in children {
                if let Ok(Some(meta)) = self.tree.get_agent_meta(&child).await {
                    candidates.push(json!({
                        "id": meta.id,
                        "name": meta.name,
                        "capability": meta.capability,
                        "description": meta.description,
                    }));
                }
            }
        }
        candidates
    }

    async fn decompose(
        &self,
        target_agent_id: &str,
        utterance: &str,
        memory_context: Option<&str>,
        candidates: &[Value],
        candidate_ids: &[String],
    ) -> Result<ExecutionPlan, PlanError> {
        let context = json!({
            "goal": utterance,
            "memory_context": memory_context,
            "candidates": candidates,
        });
        let prompt = prompts::render("plan", &context).map_err(|e| PlanError::Malformed(e.to_string()))?;

        let value = self
            .llm
            .complete_json(LlmRequest::new("You plan multi-agent task execution.", prompt))
            .await
            .map_err(|e| PlanError::Malformed(e.to_string()))?;

        let raw_steps: Vec<RawStep> = serde_json::from_value(value.get("steps").cloned().unwrap_or(Value::Null))
            .map_err(|e| PlanError::Malformed(format!("steps array: {e}")))?;

        let mut steps = Vec::new();
        for (index, raw) in raw_steps.into_iter().enumerate() {
            if raw.executor.is_empty() {
                warn!(%target_agent_id, index, "Planner: dropping step without executor");
                continue;
            }

            // AGENT class is only valid for the declared candidate set
            let declared_agent = raw
                .class
                .as_deref()
                .map(|c| c.eq_ignore_ascii_case("agent"))
                .unwrap_or(false);
            let executor_class = if declared_agent && candidate_ids.contains(&raw.executor) {
                ExecutorClass::Agent
            } else {
                if declared_agent {
                    warn!(executor = %raw.executor, "Planner: AGENT executor outside candidate set, reclassifying as TOOL");
                }
                ExecutorClass::Tool
            };

            let aggregation = raw.aggregation.as_deref().map(|name| {
                let (strategy, known) = AggregationStrategy::parse_or_list(name);
                if !known {
                    warn!(%name, "Planner: unknown aggregation strategy, defaulting to list");
                }
                strategy
            });

            steps.push(PlanStep {
                step: if raw.step > 0 { raw.step } else { (index + 1) as u32 },
                executor_class,
                executor: raw.executor,
                description: raw.description,
                params: value_to_params(raw.params),
                is_parallel: raw.is_parallel,
                repeat_count: raw.repeat_count.unwrap_or(1).max(1),
                aggregation,
            });
        }

        let mut plan = ExecutionPlan::new(steps);
        plan.renumber();
        Ok(plan)
    }

    /// Replace AGENT steps whose target sits in a non-trivial SCC with the
    /// coordinated, topologically ordered cluster steps.
    async fn expand_clusters(&self, plan: ExecutionPlan, utterance: &str) -> Result<ExecutionPlan, PlanError> {
        let mut expanded = Vec::new();

        for step in plan.steps {
            if step.executor_class != ExecutorClass::Agent {
                expanded.push(step);
                continue;
            }

            let scc_id = match self.tree.get_agent_meta(&step.executor).await {
                Ok(Some(meta)) => meta.scc_id,
                _ => None,
            };
            let Some(scc_id) = scc_id else {
                expanded.push(step);
                continue;
            };

            match self.plan_cluster(&step, &scc_id, utterance).await {
                Ok(mut cluster_steps) if !cluster_steps.is_empty() => {
                    info!(executor = %step.executor, %scc_id, count = cluster_steps.len(), "Planner: expanded SCC cluster");
                    expanded.append(&mut cluster_steps);
                }
                Ok(_) => expanded.push(step),
                Err(PlanError::Cycle(node)) => return Err(PlanError::Cycle(node)),
                Err(e) => {
                    warn!(executor = %step.executor, error = %e, "Planner: cluster planning failed, keeping original step");
                    expanded.push(step);
                }
            }
        }

        Ok(ExecutionPlan::new(expanded))
    }

    async fn plan_cluster(
        &self,
        step: &PlanStep,
        scc_id: &str,
        utterance: &str,
    ) -> Result<Vec<PlanStep>, PlanError> {
        let subgraph = self
            .tree
            .get_influenced_subgraph_with_scc(&step.executor, SCC_THRESHOLD, SCC_MAX_HOPS)
            .await
            .map_err(|e| PlanError::Malformed(e.to_string()))?;

        // Members of the target's cluster
        let members: Vec<String> = subgraph
            .nodes
            .iter()
            .filter(|n| n.properties.get("scc_id").and_then(Value::as_str) == Some(scc_id))
            .map(|n| n.id.clone())
            .collect();
        if members.len() <= 1 {
            return Ok(Vec::new());
        }

        let intra_edges: Vec<(String, String)> = subgraph
            .edges
            .iter()
            .filter(|e| members.contains(&e.from) && members.contains(&e.to))
            .map(|e| (e.from.clone(), e.to.clone()))
            .collect();

        let influences: Vec<Value> = subgraph
            .edges
            .iter()
            .filter(|e| members.contains(&e.from) || members.contains(&e.to))
            .map(|e| json!({"from": e.from, "to": e.to, "strength": e.weight}))
            .collect();

        let node_values: Vec<Value> = subgraph
            .nodes
            .iter()
            .filter(|n| members.contains(&n.id))
            .map(|n| json!({"id": n.id, "properties": n.properties.to_string()}))
            .collect();

        let context = json!({
            "main_intent": utterance,
            "scc_id": scc_id,
            "nodes": node_values,
            "influences": Value::Array(influences).to_string(),
        });
        let prompt = prompts::render("scc_plan", &context).map_err(|e| PlanError::Malformed(e.to_string()))?;

        let value = self
            .llm
            .complete_json(LlmRequest::new("You coordinate strongly coupled task groups.", prompt))
            .await
            .map_err(|e| PlanError::Malformed(e.to_string()))?;

        let shared = value.get("shared_constraints").cloned().unwrap_or(json!({}));
        let details: HashMap<String, Value> =
            serde_json::from_value(value.get("task_details").cloned().unwrap_or(json!({})))
                .map_err(|e| PlanError::Malformed(format!("task_details: {e}")))?;

        let order = condensation_topo_sort(&members, &intra_edges)?;

        let mut steps = Vec::new();
        for member in order {
            let detail = details.get(&member).cloned().unwrap_or(json!({}));
            let mut params = match detail.get("parameters") {
                Some(Value::Object(map)) => map.clone(),
                _ => ParamMap::new(),
            };
            params.insert("shared_constraints".to_string(), shared.clone());

            let description = detail
                .get("intent")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} ({})", step.description, member));

            steps.push(PlanStep {
                step: 0, // renumbered by the caller
                executor_class: ExecutorClass::Agent,
                executor: member,
                description,
                params: StepParams::Map(params),
                is_parallel: false,
                repeat_count: 1,
                aggregation: None,
            });
        }
        Ok(steps)
    }
}

fn value_to_params(value: Value) -> StepParams {
    match value {
        Value::Null => StepParams::Empty,
        Value::String(s) if s.is_empty() => StepParams::Empty,
        Value::String(s) => StepParams::Instruction(s),
        Value::Object(map) => StepParams::Map(map),
        other => StepParams::Instruction(other.to_string()),
    }
}

/// Degenerate fallback: one step targeting the agent itself
fn fallback_plan(target_agent_id: &str, utterance: &str) -> ExecutionPlan {
    ExecutionPlan::new(vec![PlanStep {
        step: 1,
        executor_class: ExecutorClass::Agent,
        executor: target_agent_id.to_string(),
        description: utterance.to_string(),
        params: StepParams::Instruction(utterance.to_string()),
        is_parallel: false,
        repeat_count: 1,
        aggregation: None,
    }])
}
