//! Task domain type
//!
//! Tracks the lifecycle of a user request, from creation through execution
//! to a terminal state. Loop tasks additionally carry a schedule and the
//! optimizer's current parameter overlay.

use meshstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ExecutionPlan, ParamMap, new_task_id};

/// Task type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Execute once, immediately
    #[default]
    OneTime,
    /// Recurring on an interval or cron expression
    Loop,
    /// Execute once after a delay
    Delayed,
    /// Execute once at a fixed time
    Scheduled,
}

/// Task status
///
/// Transitions form a DAG; [`TaskStatus::can_transition_to`] is the single
/// source of truth and is enforced by the state manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Created,
    /// Registered with the loop scheduler, waiting for a fire
    Scheduled,
    Running,
    /// User paused
    Paused,
    /// Waiting for the user to supply missing parameters
    NeedInput,
    Completed,
    Failed,
    Cancelled,
    Archived,
}

impl TaskStatus {
    /// Terminal states admit no transition except archiving
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition to `next` is legal
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Created => matches!(next, Scheduled | Running | Cancelled),
            Scheduled => matches!(next, Running | Paused | Cancelled),
            Running => matches!(next, Paused | NeedInput | Completed | Failed | Cancelled),
            Paused => matches!(next, Running | Scheduled | Cancelled),
            NeedInput => matches!(next, Running | Cancelled),
            Completed | Failed | Cancelled => matches!(next, Archived),
            Archived => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::NeedInput => "need_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Archived => "archived",
        };
        write!(f, "{}", s)
    }
}

/// Schedule configuration for recurring tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScheduleConfig {
    /// Interval between fires, in seconds
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    /// Cron-style expression, e.g. "0 9 * * 1"
    #[serde(default)]
    pub cron: Option<String>,
    /// Next scheduled fire (Unix ms)
    #[serde(default)]
    pub next_run_at: Option<i64>,
    /// Last completed fire (Unix ms)
    #[serde(default)]
    pub last_run_at: Option<i64>,
    /// Schedule is registered but not firing
    #[serde(default)]
    pub paused: bool,
}

/// Append-only task comment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub text: String,
    pub created_at: i64,
}

/// The task lifecycle entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub task_id: String,

    /// Correlation id for the whole task family (root + subtasks + retries)
    pub trace_id: String,

    /// Hierarchical position within the trace, e.g. "/0/2/1"
    pub task_path: String,

    #[serde(rename = "type")]
    pub task_type: TaskType,

    pub status: TaskStatus,

    pub user_id: String,

    /// The originating user utterance
    pub description: String,

    /// Planned step list (set after planning)
    #[serde(default)]
    pub plan: Option<ExecutionPlan>,

    /// Execution result
    #[serde(default)]
    pub result: Option<Value>,

    /// User-revised result, kept separate from the original
    #[serde(default)]
    pub corrected_result: Option<Value>,

    /// Last error message (if any)
    #[serde(default)]
    pub error: Option<String>,

    /// Append-only comments
    #[serde(default)]
    pub comments: Vec<Comment>,

    /// Source task for retries
    #[serde(default)]
    pub original_task_id: Option<String>,

    /// Schedule, for loop/delayed/scheduled tasks
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,

    /// Current optimizer-produced parameter overlay (loop tasks)
    #[serde(default)]
    pub optimized_parameters: Option<ParamMap>,

    /// Structured input parameters supplied at creation
    #[serde(default)]
    pub input_params: ParamMap,

    /// Creation timestamp (Unix ms)
    pub created_at: i64,

    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
}

impl Task {
    /// Create a new one-time task from a user utterance
    pub fn new(trace_id: impl Into<String>, user_id: impl Into<String>, description: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            task_id: new_task_id(),
            trace_id: trace_id.into(),
            task_path: "/0".to_string(),
            task_type: TaskType::OneTime,
            status: TaskStatus::Created,
            user_id: user_id.into(),
            description: description.into(),
            plan: None,
            result: None,
            corrected_result: None,
            error: None,
            comments: Vec::new(),
            original_task_id: None,
            schedule: None,
            optimized_parameters: None,
            input_params: ParamMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create with a specific id (wire messages carry their own ids)
    pub fn with_id(id: impl Into<String>, trace_id: impl Into<String>, user_id: impl Into<String>, description: impl Into<String>) -> Self {
        let mut task = Self::new(trace_id, user_id, description);
        task.task_id = id.into();
        task
    }

    /// Builder: mark as a loop task with an interval schedule
    pub fn with_interval(mut self, interval_seconds: u64) -> Self {
        self.task_type = TaskType::Loop;
        self.schedule = Some(ScheduleConfig {
            interval_seconds: Some(interval_seconds),
            ..ScheduleConfig::default()
        });
        self
    }

    /// Append a comment
    pub fn add_comment(&mut self, text: impl Into<String>) {
        self.comments.push(Comment {
            text: text.into(),
            created_at: now_ms(),
        });
        self.updated_at = now_ms();
    }

    /// Derive a retry of this task: a fresh id, the stored utterance,
    /// and a back-reference to the original. The original is untouched.
    pub fn retry(&self) -> Self {
        let now = now_ms();
        Self {
            task_id: new_task_id(),
            trace_id: self.trace_id.clone(),
            task_path: self.task_path.clone(),
            task_type: self.task_type,
            status: TaskStatus::Created,
            user_id: self.user_id.clone(),
            description: self.description.clone(),
            plan: None,
            result: None,
            corrected_result: None,
            error: None,
            comments: Vec::new(),
            original_task_id: Some(self.task_id.clone()),
            schedule: self.schedule.clone(),
            optimized_parameters: None,
            input_params: self.input_params.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for Task {
    fn collection() -> &'static str {
        "tasks"
    }

    fn id(&self) -> &str {
        &self.task_id
    }

    fn indexes(&self) -> Vec<(&'static str, IndexValue)> {
        vec![
            ("user_id", IndexValue::Text(self.user_id.clone())),
            ("status", IndexValue::Text(self.status.to_string())),
            ("trace_id", IndexValue::Text(self.trace_id.clone())),
        ]
    }
}
