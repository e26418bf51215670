//! taskmesh - hierarchical multi-agent task orchestration engine
//!
//! taskmesh turns a user utterance into a planned, routed, optionally
//! recurring workflow of subtasks, executes those subtasks against
//! heterogeneous backends (workflow platform, HTTP endpoints, registered
//! internal capabilities), aggregates results sequentially, in parallel,
//! or through an optimization loop, and supports pause/resume when
//! required inputs are missing.
//!
//! # Core Concepts
//!
//! - **Actor per concern**: root agents, group and parallel aggregators,
//!   leaf agents, and execution workers are tokio tasks owning their state
//!   and addressed by channel senders. No state is shared between actors.
//! - **NEED_INPUT is not an error**: missing parameters suspend the
//!   executing worker and leave a resumption record; a later resume message
//!   re-enters the exact worker while every aggregator above it keeps its
//!   place in the chain.
//! - **Loops learn**: recurring tasks feed execution records to a per-task
//!   optimizer whose parameter overlays apply to subsequent fires.
//!
//! # Modules
//!
//! - [`actors`] - the agent hierarchy and its message protocol
//! - [`planner`] - semantic decomposition and SCC cluster expansion
//! - [`resolver`] - semantic pointer resolution over the agent tree
//! - [`scheduler`] - the recurring-task scheduler
//! - [`optimizer`] - per-loop-task feedback learning
//! - [`capability`] - external execution connectors
//! - [`queue`] - inbound queue adaptation
//! - [`events`] - fire-and-forget lifecycle events

pub mod actors;
pub mod capability;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod events;
pub mod llm;
pub mod optimizer;
pub mod planner;
pub mod prompts;
pub mod queue;
pub mod resolver;
pub mod scheduler;
pub mod state;
pub mod tree;

// Re-export commonly used types
pub use actors::{
    Completion, CompletionSender, CompletionStatus, EngineContext, OperationClassifier, ResumeStore, RootHandle,
    RootMsg, TaskEnvelope, TaskOperation, WorkerHandle, run_root_agent,
};
pub use capability::{Capability, CapabilityError, CapabilityRegistry, FnCapability};
pub use config::Config;
pub use daemon::{Engine, run_daemon};
pub use domain::{
    AggregationStrategy, ExecutionPlan, ExecutorClass, ParamMap, PlanStep, SemanticPointer, Task, TaskStatus, TaskType,
};
pub use events::{Event, EventBus, EventEmitter, EventType, create_event_bus};
pub use llm::{LlmClient, LlmError, LlmRequest, OpenAiClient};
pub use optimizer::{DimensionParser, ExecutionRecord, OptimizerHandle, OptimizerState};
pub use planner::Planner;
pub use queue::{DeliveryAck, InboundDelivery, WireMessage};
pub use resolver::ContextResolver;
pub use scheduler::{LoopRegistration, SchedulerHandle};
pub use state::{StateError, StateManager};
pub use tree::{AgentMeta, AgentTree, InMemoryAgentTree};
