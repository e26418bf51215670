//! Root agent - single entry point for tasks against a tree node
//!
//! On receipt of a task message the root agent classifies the utterance
//! against the operation taxonomy, dispatches by category, and for
//! creation-class work builds a plan and drives a task-group aggregator.
//! Loop-class creations are forwarded to the loop scheduler with a
//! registration envelope and never allocate an aggregator directly.
//!
//! Each message is handled in its own spawned driver so the actor loop is
//! never blocked by LLM calls or executions; per-task shared state
//! (cancellation signals) lives behind a mutex keyed by task id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use meshstore::now_ms;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::domain::{ParamMap, Task, TaskStatus, TaskType, new_task_id};
use crate::events::EventType;
use crate::optimizer::{ExecutionRecord, OptimizationConfig, OptimizerHandle};
use crate::planner::Planner;
use crate::scheduler::{LoopRegistration, SchedulerHandle};

use super::group::{TaskGroupRequest, run_group};
use super::messages::{Completion, CompletionSender, CompletionStatus, RootHandle, RootMsg, TaskEnvelope};
use super::operation::{ClassifiedOperation, OperationCategory, OperationClassifier, TaskOperation};
use super::EngineContext;

struct RootShared {
    ctx: Arc<EngineContext>,
    agent_id: String,
    self_handle: RootHandle,
    scheduler: SchedulerHandle,
    optimizer: OptimizerHandle,
    classifier: OperationClassifier,
    /// Cancellation signals of in-flight executions, by task id
    cancels: Mutex<HashMap<String, watch::Sender<bool>>>,
    /// Sequence for loop-fire task paths within this root
    fire_seq: AtomicU64,
}

/// Run a root agent bound to one tree node
pub async fn run_root_agent(
    ctx: Arc<EngineContext>,
    agent_id: String,
    self_handle: RootHandle,
    scheduler: SchedulerHandle,
    optimizer: OptimizerHandle,
    mut rx: mpsc::Receiver<RootMsg>,
) {
    info!(%agent_id, "RootAgent: started");
    let shared = Arc::new(RootShared {
        classifier: OperationClassifier::new(ctx.llm.clone()),
        ctx,
        agent_id,
        self_handle,
        scheduler,
        optimizer,
        cancels: Mutex::new(HashMap::new()),
        fire_seq: AtomicU64::new(0),
    });

    while let Some(msg) = rx.recv().await {
        match msg {
            RootMsg::Task { envelope, reply_to } => {
                tokio::spawn(handle_task(shared.clone(), envelope, reply_to));
            }
            RootMsg::Resume {
                task_id,
                parameters,
                reply_to,
            } => {
                tokio::spawn(handle_resume(shared.clone(), task_id, parameters, reply_to));
            }
            RootMsg::LoopFire { task_id, overlay } => {
                tokio::spawn(handle_loop_fire(shared.clone(), task_id, overlay));
            }
            RootMsg::Shutdown => break,
        }
    }
    info!("RootAgent: stopped");
}

async fn handle_task(shared: Arc<RootShared>, envelope: TaskEnvelope, reply_to: CompletionSender) {
    let classified = match envelope.operation_hint {
        Some(operation) => ClassifiedOperation {
            operation,
            confidence: 1.0,
            parameters: envelope.parameters.clone(),
        },
        None => shared.classifier.classify(&envelope.content).await,
    };
    debug!(
        task_id = %envelope.task_id,
        operation = classified.operation.name(),
        confidence = classified.confidence,
        "RootAgent: dispatching operation"
    );

    match classified.operation.category() {
        OperationCategory::Creation => handle_creation(shared, envelope, classified, reply_to).await,
        OperationCategory::Execution => handle_execution_control(shared, envelope, classified, reply_to).await,
        OperationCategory::LoopManagement => handle_loop_management(shared, envelope, classified, reply_to).await,
        OperationCategory::Modification => handle_modification(shared, envelope, classified, reply_to).await,
        OperationCategory::Query => handle_query(shared, envelope, classified, reply_to).await,
    }
}

// === Creation ===

async fn handle_creation(
    shared: Arc<RootShared>,
    envelope: TaskEnvelope,
    classified: ClassifiedOperation,
    reply_to: CompletionSender,
) {
    let mut task = Task::with_id(
        envelope.task_id.clone(),
        envelope.trace_id.clone(),
        envelope.user_id.clone(),
        envelope.content.clone(),
    );
    task.task_path = envelope.task_path.clone();
    task.input_params = envelope.parameters.clone();

    match classified.operation {
        TaskOperation::NewLoopTask => {
            task.task_type = TaskType::Loop;
            let interval = classified
                .parameters
                .get("interval_sec")
                .and_then(Value::as_u64)
                .unwrap_or(shared.ctx.config.loop_default_interval_s);
            task.schedule = Some(crate::domain::ScheduleConfig {
                interval_seconds: Some(interval),
                ..Default::default()
            });

            if let Err(e) = shared.ctx.state.create_task(task.clone()).await {
                let _ = reply_to.send(Completion::error(envelope.task_id, e.to_string())).await;
                return;
            }
            emit_created(&shared, &envelope);
            if let Err(e) = shared.ctx.state.transition_task(&task.task_id, TaskStatus::Scheduled).await {
                warn!(task_id = %task.task_id, error = %e, "RootAgent: schedule transition failed");
            }

            let optimization_enabled = truthy(&envelope.parameters, "optimization_enabled")
                || truthy(&classified.parameters, "optimization_enabled");
            let feedback_window = classified
                .parameters
                .get("feedback_window")
                .or_else(|| envelope.parameters.get("feedback_window"))
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(0);

            let registration = LoopRegistration {
                task_id: task.task_id.clone(),
                trace_id: envelope.trace_id.clone(),
                interval_seconds: interval,
                target: shared.self_handle.clone(),
                payload: envelope.parameters.clone(),
                optimization_enabled,
                optimization_config: OptimizationConfig {
                    trace_id: envelope.trace_id.clone(),
                    feedback_window,
                    schema: Default::default(),
                },
            };
            let completion = match shared.scheduler.register_loop_task(registration).await {
                Ok(()) => Completion::success(
                    task.task_id.clone(),
                    json!({"status": "registered", "interval_sec": interval}),
                ),
                Err(e) => Completion::error(task.task_id.clone(), e),
            };
            let _ = reply_to.send(completion).await;
        }
        TaskOperation::NewDelayedTask | TaskOperation::NewScheduledTask => {
            task.task_type = if classified.operation == TaskOperation::NewDelayedTask {
                TaskType::Delayed
            } else {
                TaskType::Scheduled
            };
            let delay_s = delay_seconds(&classified.parameters);
            task.schedule = Some(crate::domain::ScheduleConfig {
                next_run_at: Some(now_ms() + delay_s as i64 * 1000),
                ..Default::default()
            });

            if let Err(e) = shared.ctx.state.create_task(task.clone()).await {
                let _ = reply_to.send(Completion::error(envelope.task_id, e.to_string())).await;
                return;
            }
            emit_created(&shared, &envelope);
            if let Err(e) = shared.ctx.state.transition_task(&task.task_id, TaskStatus::Scheduled).await {
                warn!(task_id = %task.task_id, error = %e, "RootAgent: schedule transition failed");
            }

            // Hold until due, honoring cancellation while waiting
            let (cancel_tx, mut cancel_rx) = watch::channel(false);
            shared
                .cancels
                .lock()
                .expect("cancel map poisoned")
                .insert(task.task_id.clone(), cancel_tx);

            let wait = tokio::time::sleep(Duration::from_secs(delay_s));
            tokio::pin!(wait);
            let mut aborted = false;
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            aborted = true;
                            break;
                        }
                    }
                }
            }
            if aborted {
                remove_cancel(&shared, &task.task_id);
                let _ = reply_to.send(Completion::cancelled(task.task_id.clone())).await;
                return;
            }
            remove_cancel(&shared, &task.task_id);

            execute_task(shared, task, ParamMap::new(), reply_to).await;
        }
        // NewTask and anything classification could not pin down
        _ => {
            if let Err(e) = shared.ctx.state.create_task(task.clone()).await {
                let _ = reply_to.send(Completion::error(envelope.task_id, e.to_string())).await;
                return;
            }
            emit_created(&shared, &envelope);
            execute_task(shared, task, ParamMap::new(), reply_to).await;
        }
    }
}

/// Plan and drive one execution of a task, reporting terminal state
///
/// Returns (success, duration, result) for callers that feed the optimizer.
async fn execute_task(
    shared: Arc<RootShared>,
    task: Task,
    overlay: ParamMap,
    reply_to: CompletionSender,
) -> (bool, u64, Option<Value>) {
    let task_id = task.task_id.clone();
    let emitter = shared.ctx.emitter(&task.trace_id, "RootAgent");
    let started = Instant::now();

    let mut task = match shared.ctx.state.transition_task(&task_id, TaskStatus::Running).await {
        Ok(task) => task,
        Err(e) => {
            let _ = reply_to.send(Completion::error(task_id, e.to_string())).await;
            return (false, 0, None);
        }
    };
    emitter.emit(EventType::TaskRunning, json!({"task_id": task_id}));

    // Plan via the task planner
    let planner = Planner::new(shared.ctx.tree.clone(), shared.ctx.llm.clone());
    let plan = match planner.plan(&shared.agent_id, &task.description, None).await {
        Ok(plan) => plan,
        Err(e) => {
            let error = format!("planning failed: {e}");
            let _ = shared.ctx.state.fail_task(&task_id, error.clone()).await;
            emitter.error(EventType::TaskFailed, json!({"task_id": task_id, "error": error}));
            let _ = reply_to.send(Completion::failed(task_id, error)).await;
            return (false, 0, None);
        }
    };
    task.plan = Some(plan.clone());
    if let Err(e) = shared.ctx.state.update_task(task.clone()).await {
        warn!(%task_id, error = %e, "RootAgent: plan not persisted");
    }

    // Spawn the task-group aggregator
    let (cancel_tx, cancel_rx) = watch::channel(false);
    shared
        .cancels
        .lock()
        .expect("cancel map poisoned")
        .insert(task_id.clone(), cancel_tx);

    let mut context = task.input_params.clone();
    for (key, value) in &overlay {
        context.insert(key.clone(), value.clone());
    }

    let request = TaskGroupRequest {
        parent_task_id: task_id.clone(),
        trace_id: task.trace_id.clone(),
        task_path: task.task_path.clone(),
        user_id: task.user_id.clone(),
        goal: task.description.clone(),
        plan,
        context,
    };
    let (group_tx, mut group_rx) = mpsc::channel(8);
    tokio::spawn(run_group(shared.ctx.clone(), request, cancel_rx, group_tx));

    // Drive completions: NEED_INPUT suspends the task, terminal settles it
    let mut outcome = (false, 0u64, None);
    while let Some(completion) = group_rx.recv().await {
        match completion.status {
            CompletionStatus::NeedInput => {
                if let Err(e) = shared.ctx.state.transition_task(&task_id, TaskStatus::NeedInput).await {
                    warn!(%task_id, error = %e, "RootAgent: NEED_INPUT transition failed");
                }
                emitter.emit(
                    EventType::TaskPaused,
                    json!({
                        "task_id": task_id,
                        "missing_params": completion.missing_params,
                        "question": completion.question,
                    }),
                );
                // Forward the pause notification under the task's own id;
                // the worker address stays reachable through the resume store
                let mut notification = completion;
                notification.task_id = task_id.clone();
                let _ = reply_to.send(notification).await;
            }
            CompletionStatus::Success => {
                let result = completion.result.clone().unwrap_or(Value::Null);
                if let Err(e) = shared.ctx.state.complete_task(&task_id, Some(result.clone())).await {
                    warn!(%task_id, error = %e, "RootAgent: completion transition failed");
                }
                emitter.emit(EventType::TaskCompleted, json!({"task_id": task_id}));
                let duration = started.elapsed().as_millis() as u64;
                outcome = (true, duration, Some(result));
                let _ = reply_to.send(completion).await;
                break;
            }
            CompletionStatus::Cancelled => {
                emitter.emit(EventType::TaskCancelled, json!({"task_id": task_id}));
                outcome = (false, started.elapsed().as_millis() as u64, None);
                let _ = reply_to.send(completion).await;
                break;
            }
            CompletionStatus::Failed | CompletionStatus::Error => {
                let error = completion.error.clone().unwrap_or_else(|| "execution failed".to_string());
                if let Err(e) = shared.ctx.state.fail_task(&task_id, error.clone()).await {
                    warn!(%task_id, error = %e, "RootAgent: failure transition failed");
                }
                emitter.error(EventType::TaskFailed, json!({"task_id": task_id, "error": error}));
                outcome = (false, started.elapsed().as_millis() as u64, None);
                let _ = reply_to.send(completion).await;
                break;
            }
        }
    }

    remove_cancel(&shared, &task_id);
    outcome
}

// === Execution control ===

async fn handle_execution_control(
    shared: Arc<RootShared>,
    envelope: TaskEnvelope,
    classified: ClassifiedOperation,
    reply_to: CompletionSender,
) {
    match classified.operation {
        TaskOperation::ExecuteTask => {
            let task = match find_target_task(&shared, &envelope, &classified).await {
                Ok(task) => task,
                Err(e) => {
                    let _ = reply_to.send(Completion::error(envelope.task_id, e)).await;
                    return;
                }
            };
            execute_task(shared, task, ParamMap::new(), reply_to).await;
        }
        TaskOperation::TriggerLoopTask => {
            let outcome = match find_target_task(&shared, &envelope, &classified).await {
                Ok(task) => shared.scheduler.trigger_task_now(&task.task_id).await,
                Err(e) => Err(e),
            };
            let completion = match outcome {
                Ok(()) => Completion::success(envelope.task_id, json!({"status": "triggered"})),
                Err(e) => Completion::error(envelope.task_id, e),
            };
            let _ = reply_to.send(completion).await;
        }
        TaskOperation::PauseTask => {
            let completion = match find_target_task(&shared, &envelope, &classified).await {
                Ok(task) => match shared.ctx.state.transition_task(&task.task_id, TaskStatus::Paused).await {
                    Ok(_) => {
                        shared
                            .ctx
                            .emitter(&task.trace_id, "RootAgent")
                            .emit(EventType::TaskPaused, json!({"task_id": task.task_id}));
                        Completion::success(task.task_id, json!({"status": "paused"}))
                    }
                    Err(e) => Completion::error(task.task_id, e.to_string()),
                },
                Err(e) => Completion::error(envelope.task_id, e),
            };
            let _ = reply_to.send(completion).await;
        }
        TaskOperation::ResumeTask => {
            let task_id = classified
                .parameters
                .get("task_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| envelope.task_id.clone());
            let parameters = match classified.parameters.get("parameters") {
                Some(Value::Object(map)) => map.clone(),
                _ => envelope.parameters.clone(),
            };
            handle_resume(shared, task_id, parameters, reply_to).await;
        }
        TaskOperation::CancelTask => {
            let completion = match find_target_task(&shared, &envelope, &classified).await {
                Ok(task) => cancel_task(&shared, &task).await,
                Err(e) => Completion::error(envelope.task_id, e),
            };
            let _ = reply_to.send(completion).await;
        }
        TaskOperation::RetryTask => {
            let source = match find_target_task(&shared, &envelope, &classified).await {
                Ok(task) => task,
                Err(e) => {
                    let _ = reply_to.send(Completion::error(envelope.task_id, e)).await;
                    return;
                }
            };
            if !source.status.is_terminal() {
                let _ = reply_to
                    .send(Completion::error(
                        source.task_id.clone(),
                        format!("retry requires a terminal task, found {}", source.status),
                    ))
                    .await;
                return;
            }

            // A retry is a new task; the original remains untouched
            let retried = source.retry();
            if let Err(e) = shared.ctx.state.create_task(retried.clone()).await {
                let _ = reply_to.send(Completion::error(source.task_id, e.to_string())).await;
                return;
            }
            shared.ctx.emitter(&retried.trace_id, "RootAgent").emit(
                EventType::TaskRetried,
                json!({"task_id": retried.task_id, "original_task_id": source.task_id}),
            );
            execute_task(shared, retried, ParamMap::new(), reply_to).await;
        }
        _ => {
            let _ = reply_to
                .send(Completion::error(
                    envelope.task_id,
                    format!("unsupported execution control operation: {}", classified.operation.name()),
                ))
                .await;
        }
    }
}

/// Mark a task cancelled and signal its aggregator (best effort)
async fn cancel_task(shared: &Arc<RootShared>, task: &Task) -> Completion {
    if let Err(e) = shared.ctx.state.transition_task(&task.task_id, TaskStatus::Cancelled).await {
        return Completion::error(task.task_id.clone(), e.to_string());
    }

    if let Some(cancel) = shared
        .cancels
        .lock()
        .expect("cancel map poisoned")
        .get(&task.task_id)
    {
        let _ = cancel.send(true);
    }
    shared.ctx.resume_store.remove(&task.task_id);
    let _ = shared.ctx.state.delete_resumption(&task.task_id).await;

    shared
        .ctx
        .emitter(&task.trace_id, "RootAgent")
        .emit(EventType::TaskCancelled, json!({"task_id": task.task_id}));
    Completion::cancelled(task.task_id.clone())
}

// === Loop management ===

async fn handle_loop_management(
    shared: Arc<RootShared>,
    envelope: TaskEnvelope,
    classified: ClassifiedOperation,
    reply_to: CompletionSender,
) {
    let task = match find_target_task(&shared, &envelope, &classified).await {
        Ok(task) => task,
        Err(e) => {
            let _ = reply_to.send(Completion::error(envelope.task_id, e)).await;
            return;
        }
    };

    let outcome = match classified.operation {
        TaskOperation::ModifyLoopInterval => {
            let interval = classified.parameters.get("interval_sec").and_then(Value::as_u64);
            match interval {
                Some(interval) => shared.scheduler.update_loop_interval(&task.task_id, interval).await,
                None => Err("modify_loop_interval requires interval_sec".to_string()),
            }
        }
        TaskOperation::PauseLoop => shared.scheduler.pause_loop_task(&task.task_id).await,
        TaskOperation::ResumeLoop => shared.scheduler.resume_loop_task(&task.task_id).await,
        TaskOperation::CancelLoop => shared.scheduler.cancel_loop_task(&task.task_id).await,
        _ => Err(format!("unsupported loop operation: {}", classified.operation.name())),
    };

    let completion = match outcome {
        Ok(()) => Completion::success(
            task.task_id,
            json!({"status": classified.operation.name()}),
        ),
        Err(e) => Completion::error(task.task_id, e),
    };
    let _ = reply_to.send(completion).await;
}

// === Modification ===

async fn handle_modification(
    shared: Arc<RootShared>,
    envelope: TaskEnvelope,
    classified: ClassifiedOperation,
    reply_to: CompletionSender,
) {
    let mut task = match find_target_task(&shared, &envelope, &classified).await {
        Ok(task) => task,
        Err(e) => {
            let _ = reply_to.send(Completion::error(envelope.task_id, e)).await;
            return;
        }
    };
    let emitter = shared.ctx.emitter(&task.trace_id, "RootAgent");

    let outcome: Result<Value, String> = match classified.operation {
        TaskOperation::CommentOnTask => {
            let text = string_param(&classified.parameters, "comment").unwrap_or_else(|| envelope.content.clone());
            match shared.ctx.state.add_comment(&task.task_id, text).await {
                Ok(()) => {
                    emitter.emit(EventType::CommentAdded, json!({"task_id": task.task_id}));
                    Ok(json!({"status": "comment_added"}))
                }
                Err(e) => Err(e.to_string()),
            }
        }
        TaskOperation::ReviseResult => {
            let revision = classified
                .parameters
                .get("revision")
                .cloned()
                .unwrap_or_else(|| Value::String(envelope.content.clone()));
            task.corrected_result = Some(revision);
            update(&shared, task.clone()).await.map(|_| json!({"status": "result_revised"}))
        }
        TaskOperation::ReviseProcess => {
            let note = string_param(&classified.parameters, "revision").unwrap_or_else(|| envelope.content.clone());
            match shared
                .ctx
                .state
                .add_comment(&task.task_id, format!("process revision: {note}"))
                .await
            {
                Ok(()) => Ok(json!({"status": "process_revision_recorded"})),
                Err(e) => Err(e.to_string()),
            }
        }
        TaskOperation::RollbackResult => {
            task.corrected_result = None;
            update(&shared, task.clone()).await.map(|_| json!({"status": "result_rolled_back"}))
        }
        TaskOperation::ModifyTaskParams => {
            if let Some(Value::Object(map)) = classified.parameters.get("parameters") {
                for (key, value) in map {
                    task.input_params.insert(key.clone(), value.clone());
                }
            }
            update(&shared, task.clone()).await.map(|_| json!({"status": "params_updated"}))
        }
        TaskOperation::UpdateTaskDescription => {
            let description =
                string_param(&classified.parameters, "description").unwrap_or_else(|| envelope.content.clone());
            task.description = description;
            update(&shared, task.clone()).await.map(|_| json!({"status": "description_updated"}))
        }
        _ => Err(format!("unsupported modification: {}", classified.operation.name())),
    };

    let completion = match outcome {
        Ok(payload) => Completion::success(task.task_id, payload),
        Err(e) => Completion::error(task.task_id, e),
    };
    let _ = reply_to.send(completion).await;
}

async fn update(shared: &Arc<RootShared>, task: Task) -> Result<(), String> {
    shared.ctx.state.update_task(task).await.map_err(|e| e.to_string())
}

// === Query ===

async fn handle_query(
    shared: Arc<RootShared>,
    envelope: TaskEnvelope,
    classified: ClassifiedOperation,
    reply_to: CompletionSender,
) {
    let completion = match classified.operation {
        TaskOperation::ListTasks => match shared.ctx.state.list_tasks(Some(envelope.user_id.clone()), None).await {
            Ok(tasks) => {
                let listed: Vec<Value> = tasks
                    .iter()
                    .map(|t| {
                        json!({
                            "task_id": t.task_id,
                            "status": t.status.to_string(),
                            "type": t.task_type,
                            "description": t.description,
                        })
                    })
                    .collect();
                Completion::success(envelope.task_id, Value::Array(listed))
            }
            Err(e) => Completion::error(envelope.task_id, e.to_string()),
        },
        _ => match find_target_task(&shared, &envelope, &classified).await {
            Ok(task) => {
                let payload = match classified.operation {
                    TaskOperation::QueryTaskStatus => json!({
                        "task_id": task.task_id,
                        "status": task.status.to_string(),
                        "error": task.error,
                    }),
                    TaskOperation::QueryTaskResult => json!({
                        "task_id": task.task_id,
                        // A user revision supersedes the original result
                        "result": task.corrected_result.clone().or(task.result.clone()),
                        "revised": task.corrected_result.is_some(),
                    }),
                    _ => json!({
                        "task_id": task.task_id,
                        "created_at": task.created_at,
                        "updated_at": task.updated_at,
                        "original_task_id": task.original_task_id,
                        "comments": task.comments,
                    }),
                };
                Completion::success(task.task_id, payload)
            }
            Err(e) => Completion::error(envelope.task_id, e),
        },
    };
    let _ = reply_to.send(completion).await;
}

// === Resume ===

/// Parameter-completion resumption: route supplied parameters straight to
/// the worker that raised NEED_INPUT. All intermediate aggregator state is
/// preserved because each aggregator keeps awaiting its own step channel.
async fn handle_resume(shared: Arc<RootShared>, task_id: String, parameters: ParamMap, reply_to: CompletionSender) {
    debug!(%task_id, "RootAgent: resume");

    match shared.ctx.resume_store.find_for_task(&task_id) {
        Some((_, live)) if live.worker.is_live() => {
            if let Err(e) = shared.ctx.state.transition_task(&task_id, TaskStatus::Running).await {
                warn!(%task_id, error = %e, "RootAgent: resume transition failed");
            }
            shared
                .ctx
                .bus
                .emitter_for(task_id.clone(), "RootAgent")
                .emit(EventType::TaskResumed, json!({"task_id": task_id}));

            match live.worker.resume(parameters).await {
                Ok(()) => {
                    let _ = reply_to
                        .send(Completion::success(task_id, json!({"status": "resuming"})))
                        .await;
                }
                Err(e) => {
                    let _ = reply_to.send(Completion::error(task_id, e)).await;
                }
            }
        }
        Some((record_key, _)) => {
            // Address in the record points at a dead worker
            shared.ctx.resume_store.remove(&record_key);
            let _ = reply_to
                .send(Completion::error(
                    task_id,
                    "resumption record is stale: executing worker is no longer alive",
                ))
                .await;
        }
        None => {
            // A restart may have kept the snapshot without the live worker
            let detail = match shared.ctx.state.get_resumption(&task_id).await {
                Ok(Some(_)) => "resumption record found but its worker did not survive; retry the task",
                _ => "no resumption record for task",
            };
            let _ = reply_to.send(Completion::error(task_id, detail)).await;
        }
    }
}

// === Loop fires ===

/// One fire of a registered loop task: run a child execution and feed the
/// optimizer with the outcome.
async fn handle_loop_fire(shared: Arc<RootShared>, loop_task_id: String, overlay: ParamMap) {
    let loop_task = match shared.ctx.state.get_task(&loop_task_id).await {
        Ok(Some(task)) => task,
        other => {
            warn!(%loop_task_id, ?other, "RootAgent: loop fire for unknown task");
            return;
        }
    };

    let seq = shared.fire_seq.fetch_add(1, Ordering::SeqCst);
    let mut child = Task::with_id(
        new_task_id(),
        loop_task.trace_id.clone(),
        loop_task.user_id.clone(),
        loop_task.description.clone(),
    );
    child.task_path = format!("{}/{}", loop_task.task_path.trim_end_matches('/'), seq);
    child.original_task_id = Some(loop_task.task_id.clone());
    child.input_params = loop_task.input_params.clone();

    if let Err(e) = shared.ctx.state.create_task(child.clone()).await {
        warn!(%loop_task_id, error = %e, "RootAgent: loop fire child not created");
        return;
    }

    // Results of fires are observable via the loop task's record
    let (sink_tx, mut sink_rx) = mpsc::channel(8);
    let drain = tokio::spawn(async move { while sink_rx.recv().await.is_some() {} });

    let (success, duration_ms, result) = execute_task(shared.clone(), child, overlay.clone(), sink_tx).await;
    drain.abort();

    if let Ok(Some(mut loop_task)) = shared.ctx.state.get_task(&loop_task_id).await {
        if let Some(result) = &result {
            loop_task.result = Some(result.clone());
        }
        loop_task.optimized_parameters = if overlay.is_empty() { None } else { Some(overlay.clone()) };
        if let Err(e) = shared.ctx.state.update_task(loop_task).await {
            warn!(%loop_task_id, error = %e, "RootAgent: loop result not persisted");
        }
    }

    // Execution feedback closes the optimization loop
    let record = ExecutionRecord::new(overlay, success, duration_ms, None);
    shared.optimizer.feedback(&loop_task_id, record).await;
}

// === Helpers ===

fn emit_created(shared: &Arc<RootShared>, envelope: &TaskEnvelope) {
    shared.ctx.emitter(&envelope.trace_id, "RootAgent").emit(
        EventType::TaskCreated,
        json!({"task_id": envelope.task_id, "agent_id": shared.agent_id, "user_id": envelope.user_id}),
    );
}

fn remove_cancel(shared: &Arc<RootShared>, task_id: &str) {
    shared.cancels.lock().expect("cancel map poisoned").remove(task_id);
}

fn truthy(params: &ParamMap, key: &str) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn string_param(params: &ParamMap, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

fn delay_seconds(params: &ParamMap) -> u64 {
    params
        .get("delay_sec")
        .and_then(Value::as_u64)
        .or_else(|| {
            params
                .get("run_at_ms")
                .and_then(Value::as_i64)
                .map(|at| ((at - now_ms()).max(0) / 1000) as u64)
        })
        .unwrap_or(60)
}

/// Resolve the task an operation refers to: explicit id first, then a
/// natural-language reference against the user's tasks.
async fn find_target_task(
    shared: &Arc<RootShared>,
    envelope: &TaskEnvelope,
    classified: &ClassifiedOperation,
) -> Result<Task, String> {
    if let Some(task_id) = string_param(&classified.parameters, "task_id") {
        return match shared.ctx.state.get_task(&task_id).await {
            Ok(Some(task)) => Ok(task),
            Ok(None) => Err(format!("task not found: {task_id}")),
            Err(e) => Err(e.to_string()),
        };
    }

    let reference =
        string_param(&classified.parameters, "task_reference").unwrap_or_else(|| envelope.content.clone());
    match shared
        .ctx
        .state
        .find_task_by_reference(&envelope.user_id, &reference)
        .await
    {
        Ok(Some(task)) => Ok(task),
        Ok(None) => Err(format!("no task matching reference '{reference}'")),
        Err(e) => Err(e.to_string()),
    }
}
