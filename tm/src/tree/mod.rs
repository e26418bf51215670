//! Agent tree repository contract
//!
//! The agent tree is the naming and authority space of the engine: a
//! directed tree of nodes, each with a capability description, a data
//! scope, and (for leaves) a backend binding. The tree is read-only to the
//! core; this module defines the repository contract plus an in-memory
//! implementation loadable from YAML, used by the daemon bootstrap and the
//! tests.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Errors from tree access
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Tree definition invalid: {0}")]
    Invalid(String),

    #[error("Repository error: {0}")]
    Repository(String),
}

/// Workflow platform binding of a leaf node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkflowBinding {
    pub workflow_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Fetch the workflow's declared input schema before running
    #[serde(default)]
    pub needs_schema: bool,
}

/// HTTP binding of a leaf node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HttpBinding {
    /// GET / POST / PUT / DELETE
    pub method: String,
    /// Path template, joined onto the base url
    pub path: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// One declared argument of a node's backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    /// Optional human-facing prompt used when the argument is missing
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Metadata of one tree node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMeta {
    pub id: String,
    pub name: String,
    /// Free-text capability description
    #[serde(default)]
    pub capability: String,
    #[serde(default)]
    pub description: String,
    /// What data this node owns or can reach
    #[serde(default)]
    pub datascope: String,
    #[serde(default)]
    pub workflow: Option<WorkflowBinding>,
    #[serde(default)]
    pub http: Option<HttpBinding>,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    /// Strongly-connected dependency cluster, assigned by the repository
    #[serde(default)]
    pub scc_id: Option<String>,
}

/// A node of an influence subgraph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphNode {
    pub id: String,
    pub properties: Value,
}

/// A weighted influence edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgraphEdge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub weight: f64,
}

/// Influence subgraph with SCC annotations in node properties
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SccSubgraph {
    pub nodes: Vec<SubgraphNode>,
    pub edges: Vec<SubgraphEdge>,
}

/// Read-only agent tree repository
#[async_trait]
pub trait AgentTree: Send + Sync {
    async fn get_children(&self, node_id: &str) -> Result<Vec<String>, TreeError>;

    async fn get_parent(&self, node_id: &str) -> Result<Option<String>, TreeError>;

    async fn get_agent_meta(&self, node_id: &str) -> Result<Option<AgentMeta>, TreeError>;

    async fn is_leaf_agent(&self, node_id: &str) -> Result<bool, TreeError>;

    async fn get_root_agents(&self) -> Result<Vec<String>, TreeError>;

    /// The influence subgraph reachable from `root` over edges with
    /// weight >= `threshold`, up to `max_hops`, with `scc_id` injected
    /// into each node's properties.
    async fn get_influenced_subgraph_with_scc(
        &self,
        root: &str,
        threshold: f64,
        max_hops: u32,
    ) -> Result<SccSubgraph, TreeError>;
}

/// YAML file shape for the in-memory tree
#[derive(Debug, Deserialize)]
struct TreeFile {
    agents: Vec<TreeFileAgent>,
    #[serde(default)]
    edges: Vec<SubgraphEdge>,
}

#[derive(Debug, Deserialize)]
struct TreeFileAgent {
    #[serde(default)]
    parent: Option<String>,
    #[serde(flatten)]
    meta: AgentMeta,
}

/// In-memory agent tree
///
/// SCC ids are assigned at construction over the declared influence edges;
/// only clusters of size > 1 receive one.
pub struct InMemoryAgentTree {
    nodes: HashMap<String, AgentMeta>,
    parents: HashMap<String, Option<String>>,
    children: HashMap<String, Vec<String>>,
    edges: Vec<SubgraphEdge>,
}

impl InMemoryAgentTree {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            parents: HashMap::new(),
            children: HashMap::new(),
            edges: Vec::new(),
        }
    }

    /// Add a node under an optional parent
    pub fn add_node(&mut self, meta: AgentMeta, parent: Option<&str>) -> &mut Self {
        let id = meta.id.clone();
        self.nodes.insert(id.clone(), meta);
        self.parents.insert(id.clone(), parent.map(str::to_string));
        if let Some(parent) = parent {
            self.children.entry(parent.to_string()).or_default().push(id);
        }
        self
    }

    /// Add a weighted influence edge between two nodes
    pub fn add_edge(&mut self, from: &str, to: &str, weight: f64) -> &mut Self {
        self.edges.push(SubgraphEdge {
            from: from.to_string(),
            to: to.to_string(),
            weight,
        });
        self
    }

    /// Assign `scc_id`s from the declared influence edges
    pub fn assign_sccs(&mut self) {
        let node_ids: Vec<String> = self.nodes.keys().cloned().collect();
        let edge_pairs: Vec<(String, String)> = self
            .edges
            .iter()
            .map(|e| (e.from.clone(), e.to.clone()))
            .collect();

        let components = crate::planner::strongly_connected_components(&node_ids, &edge_pairs);
        for (index, component) in components.iter().enumerate() {
            if component.len() > 1 {
                let scc_id = format!("scc_{index}");
                for id in component {
                    if let Some(meta) = self.nodes.get_mut(id) {
                        meta.scc_id = Some(scc_id.clone());
                    }
                }
            }
        }
        debug!(components = components.len(), "InMemoryAgentTree::assign_sccs");
    }

    /// Load a tree from its YAML definition
    pub fn from_yaml(text: &str) -> Result<Self, TreeError> {
        let file: TreeFile =
            serde_yaml::from_str(text).map_err(|e| TreeError::Invalid(e.to_string()))?;

        let mut tree = Self::new();
        for agent in file.agents {
            if agent.meta.id.is_empty() {
                return Err(TreeError::Invalid("agent with empty id".to_string()));
            }
            tree.add_node(agent.meta, agent.parent.as_deref());
        }
        for agent_id in tree.parents.keys() {
            if let Some(Some(parent)) = tree.parents.get(agent_id)
                && !tree.nodes.contains_key(parent)
            {
                return Err(TreeError::Invalid(format!(
                    "agent '{agent_id}' references unknown parent '{parent}'"
                )));
            }
        }
        tree.edges = file.edges;
        tree.assign_sccs();
        Ok(tree)
    }
}

impl Default for InMemoryAgentTree {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentTree for InMemoryAgentTree {
    async fn get_children(&self, node_id: &str) -> Result<Vec<String>, TreeError> {
        if !self.nodes.contains_key(node_id) {
            return Err(TreeError::NotFound(node_id.to_string()));
        }
        Ok(self.children.get(node_id).cloned().unwrap_or_default())
    }

    async fn get_parent(&self, node_id: &str) -> Result<Option<String>, TreeError> {
        self.parents
            .get(node_id)
            .cloned()
            .ok_or_else(|| TreeError::NotFound(node_id.to_string()))
    }

    async fn get_agent_meta(&self, node_id: &str) -> Result<Option<AgentMeta>, TreeError> {
        Ok(self.nodes.get(node_id).cloned())
    }

    async fn is_leaf_agent(&self, node_id: &str) -> Result<bool, TreeError> {
        if !self.nodes.contains_key(node_id) {
            return Err(TreeError::NotFound(node_id.to_string()));
        }
        Ok(self.children.get(node_id).map(|c| c.is_empty()).unwrap_or(true))
    }

    async fn get_root_agents(&self) -> Result<Vec<String>, TreeError> {
        let mut roots: Vec<String> = self
            .parents
            .iter()
            .filter(|(_, parent)| parent.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        roots.sort();
        Ok(roots)
    }

    async fn get_influenced_subgraph_with_scc(
        &self,
        root: &str,
        threshold: f64,
        max_hops: u32,
    ) -> Result<SccSubgraph, TreeError> {
        if !self.nodes.contains_key(root) {
            return Err(TreeError::NotFound(root.to_string()));
        }

        // BFS over influence edges above the threshold
        let mut frontier = vec![root.to_string()];
        let mut reached: Vec<String> = vec![root.to_string()];
        for _ in 0..max_hops {
            let mut next = Vec::new();
            for node in &frontier {
                for edge in &self.edges {
                    if edge.weight >= threshold && &edge.from == node && !reached.contains(&edge.to) {
                        reached.push(edge.to.clone());
                        next.push(edge.to.clone());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        let edges: Vec<SubgraphEdge> = self
            .edges
            .iter()
            .filter(|e| e.weight >= threshold && reached.contains(&e.from) && reached.contains(&e.to))
            .cloned()
            .collect();

        let nodes = reached
            .into_iter()
            .filter_map(|id| {
                self.nodes.get(&id).map(|meta| SubgraphNode {
                    id: id.clone(),
                    properties: serde_json::to_value(meta).unwrap_or(Value::Null),
                })
            })
            .collect();

        Ok(SccSubgraph { nodes, edges })
    }
}

#[cfg(test)]
pub fn test_meta(id: &str, description: &str) -> AgentMeta {
    AgentMeta {
        id: id.to_string(),
        name: id.to_string(),
        capability: String::new(),
        description: description.to_string(),
        datascope: String::new(),
        workflow: None,
        http: None,
        args: Vec::new(),
        scc_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> InMemoryAgentTree {
        let mut tree = InMemoryAgentTree::new();
        tree.add_node(test_meta("root", "company root"), None);
        tree.add_node(test_meta("sales", "sales department"), Some("root"));
        tree.add_node(test_meta("marketing", "marketing department"), Some("root"));
        tree.add_node(test_meta("reports", "sales reporting"), Some("sales"));
        tree
    }

    #[tokio::test]
    async fn test_children_and_parent() {
        let tree = sample_tree();
        let mut children = tree.get_children("root").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["marketing", "sales"]);
        assert_eq!(tree.get_parent("reports").await.unwrap(), Some("sales".to_string()));
        assert_eq!(tree.get_parent("root").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_leaf_detection() {
        let tree = sample_tree();
        assert!(tree.is_leaf_agent("reports").await.unwrap());
        assert!(!tree.is_leaf_agent("root").await.unwrap());
    }

    #[tokio::test]
    async fn test_roots() {
        let tree = sample_tree();
        assert_eq!(tree.get_root_agents().await.unwrap(), vec!["root"]);
    }

    #[tokio::test]
    async fn test_missing_node() {
        let tree = sample_tree();
        assert!(matches!(tree.get_children("nope").await, Err(TreeError::NotFound(_))));
        assert!(tree.get_agent_meta("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scc_assignment() {
        let mut tree = sample_tree();
        tree.add_edge("sales", "marketing", 0.8);
        tree.add_edge("marketing", "sales", 0.8);
        tree.assign_sccs();

        let sales = tree.get_agent_meta("sales").await.unwrap().unwrap();
        let marketing = tree.get_agent_meta("marketing").await.unwrap().unwrap();
        assert!(sales.scc_id.is_some());
        assert_eq!(sales.scc_id, marketing.scc_id);

        let reports = tree.get_agent_meta("reports").await.unwrap().unwrap();
        assert!(reports.scc_id.is_none());
    }

    #[tokio::test]
    async fn test_influence_subgraph() {
        let mut tree = sample_tree();
        tree.add_edge("sales", "marketing", 0.8);
        tree.add_edge("marketing", "reports", 0.2);

        let subgraph = tree
            .get_influenced_subgraph_with_scc("sales", 0.3, 5)
            .await
            .unwrap();
        let ids: Vec<&str> = subgraph.nodes.iter().map(|n| n.id.as_str()).collect();
        assert!(ids.contains(&"sales"));
        assert!(ids.contains(&"marketing"));
        assert!(!ids.contains(&"reports"), "low-weight edge must be excluded");
        assert_eq!(subgraph.edges.len(), 1);
    }

    #[tokio::test]
    async fn test_from_yaml() {
        let yaml = r#"
agents:
  - id: root
    name: Root
    description: entry point
  - id: erp
    parent: root
    name: ERP
    description: erp connector
    http:
      method: POST
      path: /api/products
    args:
      - name: name
        required: true
      - name: sku
        required: true
edges: []
"#;
        let tree = InMemoryAgentTree::from_yaml(yaml).unwrap();
        let erp = tree.get_agent_meta("erp").await.unwrap().unwrap();
        assert_eq!(erp.http.as_ref().unwrap().method, "POST");
        assert_eq!(erp.args.len(), 2);
        assert_eq!(tree.get_parent("erp").await.unwrap(), Some("root".to_string()));
    }

    #[tokio::test]
    async fn test_from_yaml_unknown_parent() {
        let yaml = r#"
agents:
  - id: child
    parent: ghost
    name: Child
"#;
        assert!(matches!(InMemoryAgentTree::from_yaml(yaml), Err(TreeError::Invalid(_))));
    }
}
