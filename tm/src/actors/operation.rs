//! Task operation taxonomy and classification
//!
//! The root agent classifies every inbound utterance into a closed
//! operation set, dispatching by category. Classification is delegated to
//! the LLM with a strict JSON contract; a keyword classifier is the
//! fallback, and anything unclassifiable defaults to `new_task` with low
//! confidence.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::domain::ParamMap;
use crate::llm::{LlmClient, LlmRequest};
use crate::prompts;

/// Confidence reported when classification fell back to the default
pub const FALLBACK_CONFIDENCE: f64 = 0.2;

/// The closed operation set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOperation {
    // Creation
    NewTask,
    NewLoopTask,
    NewDelayedTask,
    NewScheduledTask,
    // Execution control
    ExecuteTask,
    TriggerLoopTask,
    PauseTask,
    ResumeTask,
    CancelTask,
    RetryTask,
    // Loop management
    ModifyLoopInterval,
    PauseLoop,
    ResumeLoop,
    CancelLoop,
    // Modification
    ModifyTaskParams,
    ReviseResult,
    ReviseProcess,
    RollbackResult,
    CommentOnTask,
    UpdateTaskDescription,
    // Query
    QueryTaskStatus,
    QueryTaskResult,
    QueryTaskHistory,
    ListTasks,
}

/// Dispatch category of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationCategory {
    Creation,
    Execution,
    LoopManagement,
    Modification,
    Query,
}

impl TaskOperation {
    pub const ALL: [TaskOperation; 24] = [
        Self::NewTask,
        Self::NewLoopTask,
        Self::NewDelayedTask,
        Self::NewScheduledTask,
        Self::ExecuteTask,
        Self::TriggerLoopTask,
        Self::PauseTask,
        Self::ResumeTask,
        Self::CancelTask,
        Self::RetryTask,
        Self::ModifyLoopInterval,
        Self::PauseLoop,
        Self::ResumeLoop,
        Self::CancelLoop,
        Self::ModifyTaskParams,
        Self::ReviseResult,
        Self::ReviseProcess,
        Self::RollbackResult,
        Self::CommentOnTask,
        Self::UpdateTaskDescription,
        Self::QueryTaskStatus,
        Self::QueryTaskResult,
        Self::QueryTaskHistory,
        Self::ListTasks,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::NewTask => "new_task",
            Self::NewLoopTask => "new_loop_task",
            Self::NewDelayedTask => "new_delayed_task",
            Self::NewScheduledTask => "new_scheduled_task",
            Self::ExecuteTask => "execute_task",
            Self::TriggerLoopTask => "trigger_loop_task",
            Self::PauseTask => "pause_task",
            Self::ResumeTask => "resume_task",
            Self::CancelTask => "cancel_task",
            Self::RetryTask => "retry_task",
            Self::ModifyLoopInterval => "modify_loop_interval",
            Self::PauseLoop => "pause_loop",
            Self::ResumeLoop => "resume_loop",
            Self::CancelLoop => "cancel_loop",
            Self::ModifyTaskParams => "modify_task_params",
            Self::ReviseResult => "revise_result",
            Self::ReviseProcess => "revise_process",
            Self::RollbackResult => "rollback_result",
            Self::CommentOnTask => "comment_on_task",
            Self::UpdateTaskDescription => "update_task_description",
            Self::QueryTaskStatus => "query_task_status",
            Self::QueryTaskResult => "query_task_result",
            Self::QueryTaskHistory => "query_task_history",
            Self::ListTasks => "list_tasks",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.name() == name)
    }

    pub fn category(&self) -> OperationCategory {
        match self {
            Self::NewTask | Self::NewLoopTask | Self::NewDelayedTask | Self::NewScheduledTask => {
                OperationCategory::Creation
            }
            Self::ExecuteTask
            | Self::TriggerLoopTask
            | Self::PauseTask
            | Self::ResumeTask
            | Self::CancelTask
            | Self::RetryTask => OperationCategory::Execution,
            Self::ModifyLoopInterval | Self::PauseLoop | Self::ResumeLoop | Self::CancelLoop => {
                OperationCategory::LoopManagement
            }
            Self::ModifyTaskParams
            | Self::ReviseResult
            | Self::ReviseProcess
            | Self::RollbackResult
            | Self::CommentOnTask
            | Self::UpdateTaskDescription => OperationCategory::Modification,
            Self::QueryTaskStatus | Self::QueryTaskResult | Self::QueryTaskHistory | Self::ListTasks => {
                OperationCategory::Query
            }
        }
    }
}

/// Result of classifying an utterance
#[derive(Debug, Clone)]
pub struct ClassifiedOperation {
    pub operation: TaskOperation,
    pub confidence: f64,
    pub parameters: ParamMap,
}

impl ClassifiedOperation {
    fn fallback() -> Self {
        Self {
            operation: TaskOperation::NewTask,
            confidence: FALLBACK_CONFIDENCE,
            parameters: ParamMap::new(),
        }
    }
}

/// LLM-first operation classifier with a keyword fallback
pub struct OperationClassifier {
    llm: Arc<dyn LlmClient>,
}

impl OperationClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Classify an utterance; never fails
    pub async fn classify(&self, user_input: &str) -> ClassifiedOperation {
        match self.llm_classify(user_input).await {
            Ok(classified) => classified,
            Err(e) => {
                warn!(error = %e, "OperationClassifier: LLM classification failed, trying keywords");
                keyword_classify(user_input).unwrap_or_else(|| {
                    debug!("OperationClassifier: keyword fallback missed, defaulting to new_task");
                    ClassifiedOperation::fallback()
                })
            }
        }
    }

    async fn llm_classify(&self, user_input: &str) -> Result<ClassifiedOperation, String> {
        let context = json!({
            "operations": TaskOperation::ALL.iter().map(|op| op.name()).collect::<Vec<_>>(),
            "user_input": user_input,
        });
        let prompt = prompts::render("classify", &context).map_err(|e| e.to_string())?;

        let value = self
            .llm
            .complete_json(LlmRequest::new("You route task operations.", prompt))
            .await
            .map_err(|e| e.to_string())?;

        let name = value
            .get("operation_type")
            .and_then(Value::as_str)
            .ok_or("missing operation_type")?;
        let operation = TaskOperation::from_name(name).ok_or_else(|| format!("unknown operation '{name}'"))?;
        let confidence = value.get("confidence").and_then(Value::as_f64).unwrap_or(0.5);
        let parameters = match value.get("parameters") {
            Some(Value::Object(map)) => map.clone(),
            _ => ParamMap::new(),
        };

        Ok(ClassifiedOperation {
            operation,
            confidence: confidence.clamp(0.0, 1.0),
            parameters,
        })
    }
}

/// Keyword classifier used when the LLM is unavailable or incoherent
pub fn keyword_classify(user_input: &str) -> Option<ClassifiedOperation> {
    let text = user_input.to_lowercase();
    let has = |needle: &str| text.contains(needle);

    let operation = if has("loop") && (has("cancel") || has("stop")) {
        TaskOperation::CancelLoop
    } else if has("loop") && has("pause") {
        TaskOperation::PauseLoop
    } else if has("loop") && has("resume") {
        TaskOperation::ResumeLoop
    } else if has("interval") {
        TaskOperation::ModifyLoopInterval
    } else if has("cancel") {
        TaskOperation::CancelTask
    } else if has("pause") {
        TaskOperation::PauseTask
    } else if has("resume") || has("continue") {
        TaskOperation::ResumeTask
    } else if has("retry") || has("try again") {
        TaskOperation::RetryTask
    } else if has("comment") {
        TaskOperation::CommentOnTask
    } else if has("rollback") || has("roll back") {
        TaskOperation::RollbackResult
    } else if has("revise") || has("correct the result") {
        TaskOperation::ReviseResult
    } else if has("status") {
        TaskOperation::QueryTaskStatus
    } else if has("history") {
        TaskOperation::QueryTaskHistory
    } else if has("list") && has("task") {
        TaskOperation::ListTasks
    } else if has("result") {
        TaskOperation::QueryTaskResult
    } else if has("every ") || has("hourly") || has("daily") || has("weekly") {
        TaskOperation::NewLoopTask
    } else if has("in an hour") || has("later") || has("delay") {
        TaskOperation::NewDelayedTask
    } else {
        return None;
    };

    Some(ClassifiedOperation {
        operation,
        confidence: 0.4,
        parameters: ParamMap::new(),
    })
}
