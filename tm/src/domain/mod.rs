//! Domain types for the taskmesh engine
//!
//! - [`Task`] - the lifecycle entity created by a user request
//! - [`ExecutionPlan`] / [`PlanStep`] - the planner's output
//! - [`SemanticPointer`] - provenance for resolved parameter references
//! - [`ResumptionSnapshot`] - the persistable part of a paused execution

mod id;
mod plan;
mod pointer;
mod resume;
mod task;

pub use id::{new_task_id, new_trace_id};
pub use plan::{AggregationStrategy, ExecutionPlan, ExecutorClass, PlanError, PlanStep, StepParams};
pub use pointer::SemanticPointer;
pub use resume::ResumptionSnapshot;
pub use task::{Comment, ScheduleConfig, Task, TaskStatus, TaskType};

/// Parameter maps passed between steps, workers, and capabilities
pub type ParamMap = serde_json::Map<String, serde_json::Value>;
