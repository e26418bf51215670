//! Leaf agent - binds a terminal tree node to a concrete backend
//!
//! Reads the node's binding (HTTP wins over workflow; neither is a
//! terminal ERROR), resolves semantic pointers over the schema-declared
//! parameters, and hands the materialized request to an execution worker.
//! A NEED_INPUT from the worker is forwarded upward while the leaf keeps
//! waiting for the post-resume completion, so the reply chain survives the
//! suspension untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::ParamMap;
use crate::events::EventType;
use crate::resolver::ContextResolver;
use crate::tree::{AgentMeta, ArgSpec};

use super::messages::{Completion, CompletionSender};
use super::worker::spawn_worker;
use super::EngineContext;

/// Lifecycle of one leaf execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeafState {
    Idle,
    AwaitingExecution,
    AwaitingResume,
    Done,
}

/// A unit of work bound for a leaf node
#[derive(Debug, Clone)]
pub struct LeafRequest {
    pub task_id: String,
    pub trace_id: String,
    pub agent_id: String,
    pub user_id: String,
    /// What this execution is meant to accomplish
    pub description: String,
    pub parameters: ParamMap,
}

/// Execute one leaf request; the final completion goes to `reply_to`
pub async fn run_leaf(ctx: Arc<EngineContext>, request: LeafRequest, reply_to: CompletionSender) {
    let mut state = LeafState::Idle;
    debug!(task_id = %request.task_id, agent_id = %request.agent_id, ?state, "LeafAgent: start");

    let meta = match ctx.tree.get_agent_meta(&request.agent_id).await {
        Ok(Some(meta)) => meta,
        Ok(None) => {
            let _ = reply_to
                .send(Completion::error(
                    request.task_id.clone(),
                    format!("agent meta not found: {}", request.agent_id),
                ))
                .await;
            return;
        }
        Err(e) => {
            let _ = reply_to
                .send(Completion::error(request.task_id.clone(), e.to_string()))
                .await;
            return;
        }
    };

    // Backend selection: a non-empty HTTP binding wins, workflow second
    let (capability, mut parameters) = if let Some(http) = &meta.http {
        ("http", http_parameters(&ctx, http, &request))
    } else if let Some(workflow) = &meta.workflow {
        ("workflow", workflow_parameters(&ctx, workflow, &request))
    } else {
        let _ = reply_to
            .send(Completion::error(
                request.task_id.clone(),
                format!("agent {} has no backend binding", request.agent_id),
            ))
            .await;
        return;
    };

    // Semantic pointer resolution over schema-declared parameters
    resolve_pointers(&ctx, &meta, &request, &mut parameters).await;

    let emitter = ctx.emitter(&request.trace_id, "LeafAgent");
    emitter.emit(
        EventType::SubtaskSpawned,
        json!({"task_id": request.task_id, "agent_id": request.agent_id, "capability": capability}),
    );

    let worker = spawn_worker(
        ctx.registry.clone(),
        ctx.resume_store.clone(),
        ctx.state.clone(),
        ctx.emitter(&request.trace_id, "ExecutionWorker"),
    );

    let (completion_tx, mut completion_rx) = mpsc::channel(4);
    if let Err(e) = worker
        .execute(
            request.task_id.clone(),
            capability,
            parameters,
            meta.args.clone(),
            completion_tx,
        )
        .await
    {
        let _ = reply_to.send(Completion::error(request.task_id.clone(), e)).await;
        return;
    }
    state = LeafState::AwaitingExecution;

    while let Some(completion) = completion_rx.recv().await {
        let terminal = completion.is_terminal();
        if terminal {
            state = LeafState::Done;
            debug!(task_id = %request.task_id, status = %completion.status, "LeafAgent: terminal completion");
            let _ = reply_to.send(completion).await;
            break;
        }

        // NEED_INPUT: forward upward, keep awaiting the same worker
        state = LeafState::AwaitingResume;
        debug!(task_id = %request.task_id, "LeafAgent: suspended on missing parameters");
        let _ = reply_to.send(completion).await;
    }

    if state != LeafState::Done {
        // Worker vanished without a terminal completion
        warn!(task_id = %request.task_id, ?state, "LeafAgent: worker channel closed unexpectedly");
        let _ = reply_to
            .send(Completion::failed(request.task_id.clone(), "execution worker terminated"))
            .await;
    }
}

/// Build worker parameters for an HTTP binding, honoring env fallbacks
fn http_parameters(ctx: &EngineContext, http: &crate::tree::HttpBinding, request: &LeafRequest) -> ParamMap {
    let base = http
        .base_url
        .clone()
        .or_else(|| ctx.config.erp_api_base_url())
        .unwrap_or_default();
    let url = format!("{}{}", base.trim_end_matches('/'), http.path);

    let mut headers = http.headers.clone();
    if !headers.contains_key("Authorization")
        && let Some(token) = ctx.config.erp_api_token()
    {
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
    }

    let mut parameters = request.parameters.clone();
    parameters.insert("url".to_string(), Value::String(url));
    parameters.insert("method".to_string(), Value::String(http.method.clone()));
    parameters.insert(
        "headers".to_string(),
        serde_json::to_value(headers).unwrap_or(Value::Null),
    );
    parameters
}

/// Build worker parameters for a workflow binding, honoring env fallbacks
fn workflow_parameters(
    ctx: &EngineContext,
    workflow: &crate::tree::WorkflowBinding,
    request: &LeafRequest,
) -> ParamMap {
    let mut parameters = request.parameters.clone();
    parameters.insert(
        "workflow_id".to_string(),
        Value::String(workflow.workflow_id.clone()),
    );
    if let Some(api_key) = workflow.api_key.clone().or_else(|| ctx.config.workflow_api_key()) {
        parameters.insert("api_key".to_string(), Value::String(api_key));
    }
    if let Some(base_url) = workflow.base_url.clone().or_else(|| ctx.config.workflow_base_url()) {
        parameters.insert("base_url".to_string(), Value::String(base_url));
    }
    if workflow.needs_schema {
        parameters.insert("needs_schema".to_string(), Value::Bool(true));
    }
    parameters.insert("user".to_string(), Value::String(request.user_id.clone()));
    parameters
}

/// Fill schema-declared parameters whose values are still missing by
/// dereferencing their descriptions against the agent tree. Every attempt
/// is annotated under `_semantic_pointers`; unresolved descriptions stay
/// absent so the worker preflight can ask the user.
async fn resolve_pointers(ctx: &EngineContext, meta: &AgentMeta, request: &LeafRequest, parameters: &mut ParamMap) {
    let requirements: BTreeMap<String, String> = meta
        .args
        .iter()
        .filter(|spec| needs_resolution(spec, parameters))
        .map(|spec| (spec.name.clone(), spec.description.clone()))
        .collect();
    if requirements.is_empty() {
        return;
    }

    let resolver = ContextResolver::new(ctx.tree.clone(), Some(ctx.llm.clone()));
    let resolutions = match resolver.resolve_context(&requirements, &request.agent_id).await {
        Ok(resolutions) => resolutions,
        Err(e) => {
            warn!(task_id = %request.task_id, error = %e, "LeafAgent: pointer resolution failed");
            return;
        }
    };

    let mut pointers = Vec::new();
    for (name, resolution) in resolutions {
        if resolution.pointer.is_resolved() {
            parameters.insert(
                name.clone(),
                Value::String(resolution.pointer.resolved_description.clone()),
            );
        } else {
            // An unresolved pointer is not fatal unless the argument is
            // strictly required: pass the marked description through so a
            // downstream consumer can still reason about it, and leave
            // required arguments absent for the worker preflight to ask.
            let required = meta.args.iter().any(|spec| spec.name == name && spec.required);
            if !required {
                parameters.insert(
                    name.clone(),
                    Value::String(resolution.pointer.resolved_description.clone()),
                );
            }
        }
        pointers.push(resolution.pointer);
    }
    parameters.insert(
        "_semantic_pointers".to_string(),
        serde_json::to_value(pointers).unwrap_or(Value::Null),
    );
}

fn needs_resolution(spec: &ArgSpec, parameters: &ParamMap) -> bool {
    !spec.description.is_empty() && !crate::capability::param_present(parameters, &spec.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityRegistry, FnCapability};
    use crate::config::Config;
    use crate::events::EventBus;
    use crate::llm::MockLlm;
    use crate::state::StateManager;
    use crate::tree::{HttpBinding, InMemoryAgentTree, WorkflowBinding, test_meta};
    use meshstore::Store;

    fn context(tree: InMemoryAgentTree, registry: CapabilityRegistry) -> Arc<EngineContext> {
        Arc::new(EngineContext {
            config: Arc::new(Config::load(None).unwrap()),
            tree: Arc::new(tree),
            llm: Arc::new(MockLlm::new().default_response("none")),
            registry: Arc::new(registry),
            state: StateManager::spawn(Store::open_in_memory().unwrap()),
            resume_store: crate::actors::ResumeStore::new(),
            bus: Arc::new(EventBus::new(100)),
        })
    }

    fn leaf_request(task_id: &str, agent_id: &str) -> LeafRequest {
        LeafRequest {
            task_id: task_id.to_string(),
            trace_id: "trace-leaf".to_string(),
            agent_id: agent_id.to_string(),
            user_id: "u1".to_string(),
            description: "do the thing".to_string(),
            parameters: ParamMap::new(),
        }
    }

    fn capture_registry(name: &'static str) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(FnCapability::new(name, |params| {
            Ok(Value::Object(params.clone()))
        })));
        registry
    }

    #[tokio::test]
    async fn test_http_binding_wins_over_workflow() {
        let mut tree = InMemoryAgentTree::new();
        let mut meta = test_meta("erp", "erp connector");
        meta.http = Some(HttpBinding {
            method: "POST".into(),
            path: "/api/products".into(),
            base_url: Some("http://erp.local".into()),
            headers: Default::default(),
        });
        meta.workflow = Some(WorkflowBinding {
            workflow_id: "wf_ignored".into(),
            ..Default::default()
        });
        tree.add_node(meta, None);

        let ctx = context(tree, capture_registry("http"));
        let (reply, mut rx) = mpsc::channel(2);
        run_leaf(ctx, leaf_request("T1", "erp"), reply).await;

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.status, super::super::CompletionStatus::Success);
        let echoed = completion.result.unwrap();
        assert_eq!(echoed["url"], "http://erp.local/api/products");
        assert_eq!(echoed["method"], "POST");
        assert!(echoed.get("workflow_id").is_none());
    }

    #[tokio::test]
    async fn test_workflow_binding_used_when_no_http() {
        let mut tree = InMemoryAgentTree::new();
        let mut meta = test_meta("report", "weekly report");
        meta.workflow = Some(WorkflowBinding {
            workflow_id: "wf_42".into(),
            api_key: Some("K".into()),
            base_url: Some("http://dify.local".into()),
            needs_schema: false,
        });
        tree.add_node(meta, None);

        let ctx = context(tree, capture_registry("workflow"));
        let (reply, mut rx) = mpsc::channel(2);
        run_leaf(ctx, leaf_request("T1", "report"), reply).await;

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.status, super::super::CompletionStatus::Success);
        let echoed = completion.result.unwrap();
        assert_eq!(echoed["workflow_id"], "wf_42");
        assert_eq!(echoed["api_key"], "K");
        assert_eq!(echoed["user"], "u1");
    }

    #[tokio::test]
    async fn test_no_binding_is_terminal_error() {
        let mut tree = InMemoryAgentTree::new();
        tree.add_node(test_meta("bare", "nothing bound"), None);

        let ctx = context(tree, CapabilityRegistry::new());
        let (reply, mut rx) = mpsc::channel(2);
        run_leaf(ctx, leaf_request("T1", "bare"), reply).await;

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.status, super::super::CompletionStatus::Error);
        assert!(completion.error.unwrap().contains("no backend binding"));
    }

    #[tokio::test]
    async fn test_unknown_agent_is_terminal_error() {
        let ctx = context(InMemoryAgentTree::new(), CapabilityRegistry::new());
        let (reply, mut rx) = mpsc::channel(2);
        run_leaf(ctx, leaf_request("T1", "ghost"), reply).await;

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.status, super::super::CompletionStatus::Error);
    }

    #[tokio::test]
    async fn test_need_input_forwarded_and_resumable() {
        let mut tree = InMemoryAgentTree::new();
        let mut meta = test_meta("erp", "erp connector");
        meta.http = Some(HttpBinding {
            method: "POST".into(),
            path: "/api/products".into(),
            base_url: Some("http://erp.local".into()),
            headers: Default::default(),
        });
        meta.args = vec![ArgSpec {
            name: "sku".into(),
            description: String::new(),
            required: true,
            prompt: None,
        }];
        tree.add_node(meta, None);

        let ctx = context(tree, capture_registry("http"));
        let (reply, mut rx) = mpsc::channel(4);
        let handle = tokio::spawn(run_leaf(ctx.clone(), leaf_request("T2", "erp"), reply));

        let paused = rx.recv().await.unwrap();
        assert_eq!(paused.status, super::super::CompletionStatus::NeedInput);
        assert_eq!(paused.missing_params, vec!["sku".to_string()]);

        // Resume directly at the worker, as the root agent would
        let mut supplied = ParamMap::new();
        supplied.insert("sku".into(), Value::String("S1".into()));
        paused.worker.unwrap().resume(supplied).await.unwrap();

        let done = rx.recv().await.unwrap();
        assert_eq!(done.status, super::super::CompletionStatus::Success);
        assert_eq!(done.result.unwrap()["sku"], "S1");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_pointer_resolution_fills_missing_args() {
        // A sibling leaf holds user data; the declared arg description
        // should resolve to it and annotate the parameters.
        let mut tree = InMemoryAgentTree::new();
        tree.add_node(test_meta("root", "root"), None);

        let mut users = test_meta("users", "user master data");
        users.datascope = "user accounts".into();
        tree.add_node(users, Some("root"));

        let mut erp = test_meta("erp", "erp connector");
        erp.http = Some(HttpBinding {
            method: "POST".into(),
            path: "/api/orders".into(),
            base_url: Some("http://erp.local".into()),
            headers: Default::default(),
        });
        erp.args = vec![ArgSpec {
            name: "user_ref".into(),
            description: "the current user account".into(),
            required: false,
            prompt: None,
        }];
        tree.add_node(erp, Some("root"));

        let ctx = Arc::new(EngineContext {
            config: Arc::new(Config::load(None).unwrap()),
            tree: Arc::new(tree),
            llm: Arc::new(MockLlm::new().on("current user account", "users").default_response("none")),
            registry: Arc::new(capture_registry("http")),
            state: StateManager::spawn(Store::open_in_memory().unwrap()),
            resume_store: crate::actors::ResumeStore::new(),
            bus: Arc::new(EventBus::new(100)),
        });
        let (reply, mut rx) = mpsc::channel(2);
        run_leaf(ctx, leaf_request("T3", "erp"), reply).await;

        let completion = rx.recv().await.unwrap();
        let echoed = completion.result.unwrap();
        assert!(echoed["user_ref"].as_str().unwrap().contains("users"));
        let pointers = echoed["_semantic_pointers"].as_array().unwrap();
        assert_eq!(pointers[0]["param_name"], "user_ref");
        assert_eq!(pointers[0]["resolution_chain"][0], "users");
    }
}
