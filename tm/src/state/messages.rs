//! State manager messages
//!
//! Commands and responses for the actor pattern.

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{ResumptionSnapshot, Task, TaskStatus};

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Illegal status transition {from} -> {to} for task {task_id}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task already exists: {0}")]
    Duplicate(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Channel error")]
    Channel,
}

impl From<meshstore::StoreError> for StateError {
    fn from(e: meshstore::StoreError) -> Self {
        StateError::Store(e.to_string())
    }
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Task lifecycle
    CreateTask {
        task: Task,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetTask {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Task>>>,
    },
    UpdateTask {
        task: Task,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    /// Validated status transition; returns the updated task
    TransitionTask {
        id: String,
        to: TaskStatus,
        reply: oneshot::Sender<StateResponse<Task>>,
    },
    /// Transition to COMPLETED and store the result
    CompleteTask {
        id: String,
        result: Option<Value>,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    /// Transition to FAILED and store the error
    FailTask {
        id: String,
        error: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListTasks {
        user_filter: Option<String>,
        status_filter: Option<TaskStatus>,
        reply: oneshot::Sender<StateResponse<Vec<Task>>>,
    },
    AddComment {
        id: String,
        text: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    /// Best keyword match over a user's task descriptions
    FindTaskByReference {
        user_id: String,
        reference: String,
        reply: oneshot::Sender<StateResponse<Option<Task>>>,
    },

    // Resumption snapshots
    SaveResumption {
        snapshot: ResumptionSnapshot,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    GetResumption {
        task_id: String,
        reply: oneshot::Sender<StateResponse<Option<ResumptionSnapshot>>>,
    },
    DeleteResumption {
        task_id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },

    // Optimizer state blobs
    SaveOptimizerState {
        task_id: String,
        state: Value,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    LoadOptimizerState {
        task_id: String,
        reply: oneshot::Sender<StateResponse<Option<Value>>>,
    },

    // Shutdown
    Shutdown,
}
