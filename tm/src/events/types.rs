//! Event types for engine activity streaming

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed vocabulary of engine events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Task lifecycle
    TaskCreated,
    TaskRunning,
    TaskCompleted,
    TaskFailed,
    TaskPaused,
    TaskResumed,
    TaskCancelled,
    TaskTriggered,
    TaskRetried,
    SubtaskSpawned,
    CommentAdded,

    // Loop scheduling
    LoopTaskRegistered,
    LoopTaskCancelled,

    // Capability execution
    CapabilityExecuted,
    CapabilityFailed,

    // Parallel execution
    ParallelExecutionStarted,
    ParallelExecutionCompleted,

    // Optimization lifecycle
    OptimizationRegistered,
    OptimizationLearned,
    OptimizationTriggered,
    OptimizationApplied,
    OptimizationCompleted,
    OptimizationReset,
    OptimizationUnregistered,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::TaskRunning => "task_running",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskPaused => "task_paused",
            Self::TaskResumed => "task_resumed",
            Self::TaskCancelled => "task_cancelled",
            Self::TaskTriggered => "task_triggered",
            Self::TaskRetried => "task_retried",
            Self::SubtaskSpawned => "subtask_spawned",
            Self::CommentAdded => "comment_added",
            Self::LoopTaskRegistered => "loop_task_registered",
            Self::LoopTaskCancelled => "loop_task_cancelled",
            Self::CapabilityExecuted => "capability_executed",
            Self::CapabilityFailed => "capability_failed",
            Self::ParallelExecutionStarted => "parallel_execution_started",
            Self::ParallelExecutionCompleted => "parallel_execution_completed",
            Self::OptimizationRegistered => "optimization_registered",
            Self::OptimizationLearned => "optimization_learned",
            Self::OptimizationTriggered => "optimization_triggered",
            Self::OptimizationApplied => "optimization_applied",
            Self::OptimizationCompleted => "optimization_completed",
            Self::OptimizationReset => "optimization_reset",
            Self::OptimizationUnregistered => "optimization_unregistered",
        }
    }
}

/// Severity attached to an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    #[default]
    Info,
    Warning,
    Error,
}

/// One emitted event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Correlation id of the task family this event belongs to
    pub trace_id: String,

    pub event_type: EventType,

    /// Component that emitted the event, e.g. "ExecutionWorker"
    pub source: String,

    #[serde(default)]
    pub level: EventLevel,

    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// Structured payload
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(trace_id: impl Into<String>, event_type: EventType, source: impl Into<String>, data: Value) -> Self {
        Self {
            trace_id: trace_id.into(),
            event_type,
            source: source.into(),
            level: EventLevel::Info,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn with_level(mut self, level: EventLevel) -> Self {
        self.level = level;
        self
    }
}
