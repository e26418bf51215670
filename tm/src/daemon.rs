//! Engine assembly and daemon lifecycle
//!
//! Builds the full actor wiring (store, state manager, event bus, LLM,
//! capabilities, optimizer, scheduler, root agents, queue listener) from a
//! configuration record, validates the capability registry up front, and
//! runs until shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::actors::{
    Completion, EngineContext, ResumeStore, RootHandle, run_root_agent,
};
use crate::capability::{
    BUILTIN_CAPABILITIES, CapabilityRegistry, DataQueryCapability, HttpCapability, UnconfiguredDataAccess,
    WorkflowCapability,
};
use crate::config::Config;
use crate::events::create_event_bus;
use crate::llm::{LlmClient, LlmError, LlmRequest, OpenAiClient};
use crate::optimizer::{OptimizerHandle, run_optimizer};
use crate::queue::{InboundDelivery, run_listener};
use crate::scheduler::{SchedulerHandle, run_scheduler, spawn_ticker};
use crate::state::StateManager;
use crate::tree::{AgentTree, InMemoryAgentTree};

/// Period of the scheduler's due-check ticker
const TICK_PERIOD: Duration = Duration::from_secs(1);

/// LLM stand-in when no endpoint is configured
///
/// Every call errors, which routes classification, planning, resolution,
/// and dimension discovery through their deterministic fallbacks.
struct UnavailableLlm;

#[async_trait]
impl LlmClient for UnavailableLlm {
    async fn complete(&self, _request: LlmRequest) -> Result<String, LlmError> {
        Err(LlmError::InvalidResponse("no llm endpoint configured".to_string()))
    }
}

/// A fully wired engine
pub struct Engine {
    pub ctx: Arc<EngineContext>,
    pub roots: HashMap<String, RootHandle>,
    pub scheduler: SchedulerHandle,
    pub optimizer: OptimizerHandle,
    /// Feed transport deliveries here
    pub deliveries: mpsc::Sender<InboundDelivery>,
    ticker: JoinHandle<()>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Assemble an engine from explicit collaborators
    pub async fn start(
        config: Config,
        tree: Arc<dyn AgentTree>,
        llm: Arc<dyn LlmClient>,
        registry: CapabilityRegistry,
    ) -> Result<Self> {
        // Fail loudly on an incomplete registry before any task arrives
        registry
            .validate(&BUILTIN_CAPABILITIES)
            .map_err(|e| eyre!("capability registry incomplete: {e}"))?;

        let store = open_store(&config)?;
        let state = StateManager::spawn(store);
        let bus = create_event_bus();
        let resume_store = ResumeStore::new();
        let config = Arc::new(config);

        let ctx = Arc::new(EngineContext {
            config: config.clone(),
            tree: tree.clone(),
            llm,
            registry: Arc::new(registry),
            state: state.clone(),
            resume_store,
            bus: bus.clone(),
        });

        // Optimizer and scheduler reference each other through handles,
        // so both channels exist before either actor runs.
        let (optimizer, optimizer_rx) = OptimizerHandle::channel();
        let (scheduler, scheduler_rx) = SchedulerHandle::channel();
        tokio::spawn(run_optimizer(
            optimizer_rx,
            scheduler.clone(),
            state.clone(),
            bus.clone(),
            config.optimization_feedback_window,
        ));
        tokio::spawn(run_scheduler(
            scheduler_rx,
            state.clone(),
            optimizer.clone(),
            bus.clone(),
        ));
        let ticker = spawn_ticker(scheduler.clone(), TICK_PERIOD);

        // One root agent per tree root
        let root_ids = tree.get_root_agents().await.map_err(|e| eyre!(e.to_string()))?;
        if root_ids.is_empty() {
            return Err(eyre!("agent tree has no root nodes"));
        }
        let mut roots = HashMap::new();
        for root_id in &root_ids {
            let (handle, rx) = RootHandle::channel();
            tokio::spawn(run_root_agent(
                ctx.clone(),
                root_id.clone(),
                handle.clone(),
                scheduler.clone(),
                optimizer.clone(),
                rx,
            ));
            roots.insert(root_id.clone(), handle);
        }

        // Queue listener feeding the first root; results are logged
        let default_root = roots[&root_ids[0]].clone();
        let (deliveries, delivery_rx) = mpsc::channel(64);
        let (results_tx, results_rx) = mpsc::channel(64);
        tokio::spawn(run_listener(
            delivery_rx,
            default_root,
            root_ids[0].clone(),
            results_tx,
        ));
        tokio::spawn(drain_results(results_rx));

        info!(roots = root_ids.len(), "Engine: started");
        Ok(Self {
            ctx,
            roots,
            scheduler,
            optimizer,
            deliveries,
            ticker,
        })
    }

    /// Assemble from configuration alone, with default collaborators
    pub async fn start_from_config(config: Config) -> Result<Self> {
        let tree: Arc<dyn AgentTree> = match &config.tree_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .wrap_err_with(|| format!("failed to read tree file {path}"))?;
                Arc::new(InMemoryAgentTree::from_yaml(&text).map_err(|e| eyre!(e.to_string()))?)
            }
            None => {
                warn!("Engine: no tree_file configured, starting with a single bare root");
                let mut tree = InMemoryAgentTree::new();
                tree.add_node(
                    crate::tree::AgentMeta {
                        id: "root".to_string(),
                        name: "Root".to_string(),
                        capability: String::new(),
                        description: "default entry node".to_string(),
                        datascope: String::new(),
                        workflow: None,
                        http: None,
                        args: Vec::new(),
                        scc_id: None,
                    },
                    None,
                );
                Arc::new(tree)
            }
        };

        let llm: Arc<dyn LlmClient> = match &config.llm_endpoint {
            Some(endpoint) => Arc::new(OpenAiClient::new(
                endpoint.clone(),
                config.llm_api_key.clone().unwrap_or_default(),
                config.llm_model.clone(),
            )?),
            None => {
                warn!("Engine: no llm_endpoint configured, degraded fallbacks in effect");
                Arc::new(UnavailableLlm)
            }
        };

        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(WorkflowCapability::new().map_err(|e| eyre!(e.to_string()))?));
        registry.register(Arc::new(
            HttpCapability::new(Duration::from_secs(config.http_default_timeout_s)).map_err(|e| eyre!(e.to_string()))?,
        ));
        registry.register(Arc::new(DataQueryCapability::new(Arc::new(UnconfiguredDataAccess))));

        Self::start(config, tree, llm, registry).await
    }

    /// Stop timers and actors (best effort)
    pub async fn shutdown(&self) {
        info!("Engine: shutting down");
        self.ticker.abort();
        for root in self.roots.values() {
            root.shutdown().await;
        }
        self.scheduler.shutdown().await;
        self.optimizer.shutdown().await;
        self.ctx.state.shutdown().await;
    }
}

fn open_store(config: &Config) -> Result<meshstore::Store> {
    let dir = match &config.data_dir {
        Some(dir) => PathBuf::from(dir),
        None => dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("taskmesh"),
    };
    meshstore::Store::open(&dir).wrap_err_with(|| format!("failed to open store at {}", dir.display()))
}

/// Log terminal results arriving from queue-initiated tasks
async fn drain_results(mut rx: mpsc::Receiver<Completion>) {
    while let Some(completion) = rx.recv().await {
        info!(
            task_id = %completion.task_id,
            status = %completion.status,
            "TASK_RESULT"
        );
    }
}

/// Run the daemon in the foreground until interrupted
pub async fn run_daemon(config: Config) -> Result<()> {
    let engine = Engine::start_from_config(config).await?;
    info!("taskmesh daemon running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.wrap_err("signal handler failed")?;
    engine.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::FnCapability;
    use crate::llm::MockLlm;
    use crate::tree::test_meta;
    use serde_json::Value;

    fn full_registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        for name in BUILTIN_CAPABILITIES {
            registry.register(Arc::new(FnCapability::new(name, |_| Ok(Value::Null))));
        }
        registry
    }

    fn test_config() -> Config {
        Config {
            data_dir: Some(
                tempfile::tempdir()
                    .unwrap()
                    .keep()
                    .to_string_lossy()
                    .to_string(),
            ),
            ..Config::load(None).unwrap()
        }
    }

    #[tokio::test]
    async fn test_engine_start_requires_builtins() {
        let mut tree = InMemoryAgentTree::new();
        tree.add_node(test_meta("root", "entry"), None);

        let result = Engine::start(
            test_config(),
            Arc::new(tree),
            Arc::new(MockLlm::new().default_response("none")),
            CapabilityRegistry::new(),
        )
        .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("capability registry"));
    }

    #[tokio::test]
    async fn test_engine_start_requires_roots() {
        let result = Engine::start(
            test_config(),
            Arc::new(InMemoryAgentTree::new()),
            Arc::new(MockLlm::new().default_response("none")),
            full_registry(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_engine_starts_and_shuts_down() {
        let mut tree = InMemoryAgentTree::new();
        tree.add_node(test_meta("root", "entry"), None);

        let engine = Engine::start(
            test_config(),
            Arc::new(tree),
            Arc::new(MockLlm::new().default_response("none")),
            full_registry(),
        )
        .await
        .unwrap();

        assert_eq!(engine.roots.len(), 1);
        assert!(engine.roots.contains_key("root"));
        engine.shutdown().await;
    }
}
