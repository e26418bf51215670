//! Actor messages, addresses, and the resume store
//!
//! All completions travel as [`Completion`] values over plain mpsc senders;
//! the sender *is* the reply-to address. No errors cross actor boundaries:
//! failures arrive as terminal completions with a status and a string.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::ParamMap;
use crate::tree::ArgSpec;

use super::operation::TaskOperation;

/// Terminal (or suspending) outcome of a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Failed,
    /// Configuration or routing error, as opposed to a remote failure
    Error,
    Cancelled,
    /// Not an error: the user must supply more parameters
    NeedInput,
}

impl std::fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
            Self::NeedInput => "NEED_INPUT",
        };
        write!(f, "{}", s)
    }
}

/// Reply-to address for completions
pub type CompletionSender = mpsc::Sender<Completion>;

/// Completion message sent to a reply-to address
#[derive(Debug, Clone)]
pub struct Completion {
    pub task_id: String,
    pub status: CompletionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Missing parameter names (NEED_INPUT only)
    pub missing_params: Vec<String>,
    /// Prompt for the missing parameters (NEED_INPUT only)
    pub question: Option<String>,
    /// Address of the worker that can accept a resume (NEED_INPUT only)
    pub worker: Option<WorkerHandle>,
}

impl Completion {
    pub fn success(task_id: impl Into<String>, result: Value) -> Self {
        Self {
            task_id: task_id.into(),
            status: CompletionStatus::Success,
            result: Some(result),
            error: None,
            missing_params: Vec::new(),
            question: None,
            worker: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: CompletionStatus::Failed,
            result: None,
            error: Some(error.into()),
            missing_params: Vec::new(),
            question: None,
            worker: None,
        }
    }

    pub fn error(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: CompletionStatus::Error,
            ..Self::failed(task_id, error)
        }
    }

    pub fn cancelled(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: CompletionStatus::Cancelled,
            result: None,
            error: None,
            missing_params: Vec::new(),
            question: None,
            worker: None,
        }
    }

    pub fn need_input(
        task_id: impl Into<String>,
        missing_params: Vec<String>,
        question: impl Into<String>,
        worker: WorkerHandle,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: CompletionStatus::NeedInput,
            result: None,
            error: None,
            missing_params,
            question: Some(question.into()),
            worker: Some(worker),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, CompletionStatus::NeedInput)
    }
}

/// Messages accepted by an execution worker
#[derive(Debug)]
pub enum WorkerMsg {
    Execute {
        task_id: String,
        capability: String,
        parameters: ParamMap,
        /// Extra required arguments declared by the node binding
        required: Vec<ArgSpec>,
        reply_to: CompletionSender,
    },
    /// Merge new parameters over the originals and retry
    Resume { parameters: ParamMap },
}

/// Address of a (possibly suspended) execution worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerMsg>,
}

impl WorkerHandle {
    pub fn new(tx: mpsc::Sender<WorkerMsg>) -> Self {
        Self { tx }
    }

    /// Whether the worker task is still alive
    pub fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }

    pub async fn execute(
        &self,
        task_id: impl Into<String>,
        capability: impl Into<String>,
        parameters: ParamMap,
        required: Vec<ArgSpec>,
        reply_to: CompletionSender,
    ) -> Result<(), String> {
        self.tx
            .send(WorkerMsg::Execute {
                task_id: task_id.into(),
                capability: capability.into(),
                parameters,
                required,
                reply_to,
            })
            .await
            .map_err(|_| "worker is gone".to_string())
    }

    pub async fn resume(&self, parameters: ParamMap) -> Result<(), String> {
        self.tx
            .send(WorkerMsg::Resume { parameters })
            .await
            .map_err(|_| "worker is gone".to_string())
    }
}

/// A task delivered to a root agent
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub trace_id: String,
    pub task_path: String,
    /// Target agent tree node
    pub agent_id: String,
    pub user_id: String,
    /// The user utterance
    pub content: String,
    /// Structured input parameters
    pub parameters: ParamMap,
    /// Skip classification and dispatch this operation directly
    pub operation_hint: Option<TaskOperation>,
}

/// Messages accepted by a root agent
#[derive(Debug)]
pub enum RootMsg {
    Task {
        envelope: TaskEnvelope,
        reply_to: CompletionSender,
    },
    /// Resume envelope: parameter completion for a NEED_INPUT task
    Resume {
        task_id: String,
        parameters: ParamMap,
        reply_to: CompletionSender,
    },
    /// A loop-scheduler fire for a registered loop task
    LoopFire {
        task_id: String,
        /// Optimizer-produced parameter overlay
        overlay: ParamMap,
    },
    Shutdown,
}

/// Address of a root agent
#[derive(Debug, Clone)]
pub struct RootHandle {
    tx: mpsc::Sender<RootMsg>,
}

impl RootHandle {
    /// Create the handle and its receiving end without spawning
    pub fn channel() -> (Self, mpsc::Receiver<RootMsg>) {
        let (tx, rx) = mpsc::channel(128);
        (Self { tx }, rx)
    }

    pub async fn task(&self, envelope: TaskEnvelope, reply_to: CompletionSender) -> Result<(), String> {
        self.tx
            .send(RootMsg::Task { envelope, reply_to })
            .await
            .map_err(|_| "root agent is gone".to_string())
    }

    pub async fn resume(
        &self,
        task_id: impl Into<String>,
        parameters: ParamMap,
        reply_to: CompletionSender,
    ) -> Result<(), String> {
        self.tx
            .send(RootMsg::Resume {
                task_id: task_id.into(),
                parameters,
                reply_to,
            })
            .await
            .map_err(|_| "root agent is gone".to_string())
    }

    pub async fn loop_fire(&self, task_id: impl Into<String>, overlay: ParamMap) -> Result<(), String> {
        self.tx
            .send(RootMsg::LoopFire {
                task_id: task_id.into(),
                overlay,
            })
            .await
            .map_err(|_| "root agent is gone".to_string())
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(RootMsg::Shutdown).await;
    }
}

/// Live half of a resumption record: the executing worker's address
///
/// The persistable half (parameters, missing names, question) is stored as
/// a [`crate::domain::ResumptionSnapshot`] by the state manager. This map
/// cannot survive a restart; resume paths check [`WorkerHandle::is_live`]
/// and fail gracefully on a stale entry.
#[derive(Debug, Clone)]
pub struct LiveResumption {
    pub worker: WorkerHandle,
    pub missing_params: Vec<String>,
    pub question: String,
}

/// In-process registry of suspended workers, keyed by task id
#[derive(Clone, Default)]
pub struct ResumeStore {
    inner: Arc<Mutex<HashMap<String, LiveResumption>>>,
}

impl ResumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task_id: impl Into<String>, resumption: LiveResumption) {
        let task_id = task_id.into();
        debug!(%task_id, "ResumeStore::insert");
        self.inner.lock().expect("resume store poisoned").insert(task_id, resumption);
    }

    pub fn get(&self, task_id: &str) -> Option<LiveResumption> {
        self.inner.lock().expect("resume store poisoned").get(task_id).cloned()
    }

    pub fn remove(&self, task_id: &str) -> Option<LiveResumption> {
        debug!(%task_id, "ResumeStore::remove");
        self.inner.lock().expect("resume store poisoned").remove(task_id)
    }

    /// Find the suspended worker of a task or of one of its steps
    ///
    /// Workers register under the step-level id (`<task>_step_<n>`); resume
    /// envelopes usually carry the parent task id.
    pub fn find_for_task(&self, task_id: &str) -> Option<(String, LiveResumption)> {
        let inner = self.inner.lock().expect("resume store poisoned");
        if let Some(live) = inner.get(task_id) {
            return Some((task_id.to_string(), live.clone()));
        }
        let prefix = format!("{task_id}_step_");
        inner
            .iter()
            .find(|(key, _)| key.starts_with(&prefix))
            .map(|(key, live)| (key.clone(), live.clone()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("resume store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
