//! The agent actor hierarchy
//!
//! - [`root`] - entry point: classifies operations and drives task lifecycles
//! - [`group`] - executes one plan, step by step
//! - [`parallel`] - runs replicas and reduces, or drives the optimization loop
//! - [`leaf`] - binds a terminal tree node to a concrete backend
//! - [`worker`] - performs one external call, with NEED_INPUT suspension
//!
//! Each actor is a spawned tokio task owning its state; addresses are
//! channel senders, and state is never shared between actors.

mod group;
mod leaf;
mod messages;
mod operation;
mod parallel;
mod root;
mod worker;

pub use group::{TaskGroupRequest, run_group};
pub use leaf::{LeafRequest, run_leaf};
pub use messages::{
    Completion, CompletionSender, CompletionStatus, LiveResumption, ResumeStore, RootHandle, RootMsg, TaskEnvelope,
    WorkerHandle, WorkerMsg,
};
pub use operation::{
    ClassifiedOperation, FALLBACK_CONFIDENCE, OperationCategory, OperationClassifier, TaskOperation, keyword_classify,
};
pub use parallel::{ParallelRequest, run_parallel};
pub use root::run_root_agent;
pub use worker::spawn_worker;

use std::sync::Arc;

use crate::capability::CapabilityRegistry;
use crate::config::Config;
use crate::events::{EventBus, EventEmitter};
use crate::llm::LlmClient;
use crate::state::StateManager;
use crate::tree::AgentTree;

/// Shared handles passed explicitly to every actor
///
/// There is no process-global state in the engine; whatever an actor needs
/// arrives through this context.
pub struct EngineContext {
    pub config: Arc<Config>,
    pub tree: Arc<dyn AgentTree>,
    pub llm: Arc<dyn LlmClient>,
    pub registry: Arc<CapabilityRegistry>,
    pub state: StateManager,
    pub resume_store: ResumeStore,
    pub bus: Arc<EventBus>,
}

impl EngineContext {
    /// Emitter bound to a trace and source component
    pub fn emitter(&self, trace_id: &str, source: &str) -> EventEmitter {
        self.bus.emitter_for(trace_id, source)
    }
}
