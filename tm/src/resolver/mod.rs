//! Context resolver - semantic pointer dereferencing
//!
//! Given `{param_name -> free-text description}` and the originating agent
//! node, resolves each description to a concrete tree node by hierarchical
//! layered search: semantic-match the current sibling layer, drill into an
//! internal match, bubble up a level on a miss, and stop at the root.
//! Visited-layer signatures guard against cycles.
//!
//! The semantic match asks the LLM to pick exactly one id from the
//! candidate set (or `none`); when the LLM is unavailable or fails, a
//! keyword-count match over the same concatenated node text takes over.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;
use serde_json::json;
use tracing::{debug, warn};

use crate::domain::SemanticPointer;
use crate::llm::{LlmClient, LlmRequest};
use crate::prompts;
use crate::tree::{AgentMeta, AgentTree, TreeError};

/// Integer keyword scores this close together flag ambiguity
const AMBIGUITY_EPSILON: usize = 0;

/// Confidence decay per extra hop in the resolution chain
const CONFIDENCE_DECAY: f64 = 0.15;

/// Result of resolving one parameter
#[derive(Debug, Clone)]
pub struct Resolution {
    pub pointer: SemanticPointer,
    /// Metadata of the resolved node, when resolution succeeded
    pub node: Option<AgentMeta>,
}

/// Tree-walking semantic resolver
pub struct ContextResolver {
    tree: Arc<dyn AgentTree>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl ContextResolver {
    pub fn new(tree: Arc<dyn AgentTree>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { tree, llm }
    }

    /// Resolve every requirement; unresolved entries come back as
    /// marker-prefixed pointers, never as errors.
    pub async fn resolve_context(
        &self,
        requirements: &BTreeMap<String, String>,
        agent_id: &str,
    ) -> Result<HashMap<String, Resolution>, TreeError> {
        debug!(%agent_id, count = requirements.len(), "ContextResolver::resolve_context");
        let mut result = HashMap::new();

        for (param_name, description) in requirements {
            let query = format!("parameter '{param_name}': {description}");
            let resolution = self.resolve_one(agent_id, &query, param_name, description).await?;
            result.insert(param_name.clone(), resolution);
        }
        Ok(result)
    }

    async fn resolve_one(
        &self,
        start_agent_id: &str,
        query: &str,
        param_name: &str,
        description: &str,
    ) -> Result<Resolution, TreeError> {
        let mut parent_id = self.tree.get_parent(start_agent_id).await?;
        let mut visited_layers: HashSet<Vec<String>> = HashSet::new();
        let mut chain: Vec<String> = Vec::new();

        loop {
            // 1. The current search layer: siblings of the focus node,
            //    or the root layer once we bubble past the top.
            let current_layer = match &parent_id {
                Some(parent) => self.tree.get_children(parent).await?,
                None => self.tree.get_root_agents().await?,
            };

            let mut signature = current_layer.clone();
            signature.sort();
            if !visited_layers.insert(signature) {
                warn!(%param_name, "ContextResolver: cycle detected in search layers, stopping");
                break;
            }

            // 2. Semantic match over the layer
            let matched = self.semantic_match(query, &current_layer).await;

            match matched {
                Some((node_id, ambiguous)) => {
                    chain.push(node_id.clone());
                    let meta = match self.tree.get_agent_meta(&node_id).await? {
                        Some(meta) => meta,
                        None => break,
                    };

                    if self.tree.is_leaf_agent(&node_id).await? {
                        // Hit: a leaf is the resolution
                        let resolved = if meta.description.is_empty() {
                            meta.id.clone()
                        } else {
                            format!("{}: {}", meta.id, meta.description)
                        };
                        let confidence =
                            (1.0 - CONFIDENCE_DECAY * (chain.len().saturating_sub(1)) as f64).max(0.1);
                        debug!(%param_name, node = %node_id, confidence, "ContextResolver: resolved");
                        return Ok(Resolution {
                            pointer: SemanticPointer {
                                param_name: param_name.to_string(),
                                original_description: description.to_string(),
                                resolved_description: resolved,
                                confidence,
                                resolution_chain: chain,
                                ambiguous,
                            },
                            node: Some(meta),
                        });
                    }

                    // Internal node: drill down
                    let children = self.tree.get_children(&node_id).await?;
                    if children.is_empty() {
                        break;
                    }
                    parent_id = Some(node_id);
                }
                None => {
                    // Miss: bubble up one level, or give up at the root layer
                    match parent_id {
                        None => break,
                        Some(parent) => {
                            parent_id = self.tree.get_parent(&parent).await?;
                        }
                    }
                }
            }
        }

        debug!(%param_name, "ContextResolver: unresolved");
        Ok(Resolution {
            pointer: SemanticPointer::unresolved(param_name, description),
            node: None,
        })
    }

    /// Pick the best-matching node id in a layer, plus an ambiguity flag
    async fn semantic_match(&self, query: &str, node_ids: &[String]) -> Option<(String, bool)> {
        if node_ids.is_empty() {
            return None;
        }

        let mut candidates = Vec::new();
        for node_id in node_ids {
            if let Ok(Some(meta)) = self.tree.get_agent_meta(node_id).await {
                candidates.push(meta);
            }
        }
        if candidates.is_empty() {
            return None;
        }

        if let Some(llm) = &self.llm {
            match self.llm_match(llm.as_ref(), query, &candidates).await {
                Ok(answer) => return answer.map(|id| (id, false)),
                Err(e) => {
                    warn!(error = %e, "ContextResolver: LLM match failed, falling back to keywords");
                }
            }
        }

        keyword_match(query, &candidates)
    }

    async fn llm_match(
        &self,
        llm: &dyn LlmClient,
        query: &str,
        candidates: &[AgentMeta],
    ) -> Result<Option<String>, crate::llm::LlmError> {
        let context = json!({
            "query": query,
            "candidates": candidates.iter().map(|m| json!({
                "id": m.id,
                "datascope": m.datascope,
                "capability": m.capability,
                "description": m.description,
            })).collect::<Vec<_>>(),
        });
        let prompt = prompts::render("layer_match", &context)
            .map_err(|e| crate::llm::LlmError::InvalidResponse(e.to_string()))?;

        let answer = llm
            .complete(LlmRequest::new("You route data requirements to tree nodes.", prompt))
            .await?;
        let answer = answer.trim().trim_matches(['\'', '"', '`']).to_string();

        if answer.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        if candidates.iter().any(|c| c.id == answer) {
            Ok(Some(answer))
        } else {
            warn!(%answer, "ContextResolver: LLM returned an id outside the candidate set");
            Ok(None)
        }
    }
}

/// Keyword-count fallback over concatenated node text
fn keyword_match(query: &str, candidates: &[AgentMeta]) -> Option<(String, bool)> {
    let word = Regex::new(r"[\w]+").expect("static regex");
    let keywords: HashSet<String> = word
        .find_iter(&query.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect();
    if keywords.is_empty() {
        return None;
    }

    let mut scored: Vec<(usize, &AgentMeta)> = candidates
        .iter()
        .map(|meta| {
            let content = format!("{} {} {}", meta.datascope, meta.description, meta.capability).to_lowercase();
            let score = keywords.iter().filter(|k| content.contains(k.as_str())).count();
            (score, meta)
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    let (best_score, best) = scored.first()?;
    if *best_score == 0 {
        return None;
    }
    let ambiguous = scored
        .get(1)
        .map(|(second, _)| best_score.saturating_sub(*second) <= AMBIGUITY_EPSILON)
        .unwrap_or(false);
    Some((best.id.clone(), ambiguous))
}
