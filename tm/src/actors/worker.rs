//! Execution worker - performs exactly one external call
//!
//! The worker preflights required parameters before touching the network:
//! missing or empty-stringed parameters produce a NEED_INPUT completion
//! (with the worker's own address and a prompt built from the argument
//! schema) instead of an execution attempt. The worker then stays alive,
//! suspended, until a resume message merges new parameters over the
//! originals and the preflight runs again - a worker may legitimately
//! pause more than once.
//!
//! Remote failures and timeouts become terminal FAILED completions; no
//! retries happen at this layer.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::capability::{CapabilityRegistry, param_present};
use crate::domain::{ParamMap, ResumptionSnapshot};
use crate::events::{EventEmitter, EventType};
use crate::state::StateManager;
use crate::tree::ArgSpec;

use super::messages::{Completion, CompletionSender, LiveResumption, ResumeStore, WorkerHandle, WorkerMsg};

struct PendingRequest {
    task_id: String,
    capability: String,
    parameters: ParamMap,
    required: Vec<ArgSpec>,
    reply_to: CompletionSender,
}

enum Attempt {
    /// Suspend: missing parameter names + user-facing prompt
    NeedInput(Vec<String>, String),
    /// Terminal completion, worker exits
    Done(Completion),
}

/// Spawn an execution worker and return its address
pub fn spawn_worker(
    registry: Arc<CapabilityRegistry>,
    resume_store: ResumeStore,
    state: StateManager,
    emitter: EventEmitter,
) -> WorkerHandle {
    let (tx, mut rx) = mpsc::channel::<WorkerMsg>(8);
    let handle = WorkerHandle::new(tx);
    let self_handle = handle.clone();

    tokio::spawn(async move {
        let mut pending: Option<PendingRequest> = None;

        while let Some(msg) = rx.recv().await {
            match msg {
                WorkerMsg::Execute {
                    task_id,
                    capability,
                    parameters,
                    required,
                    reply_to,
                } => {
                    if pending.is_some() {
                        warn!(%task_id, "ExecutionWorker: duplicate execute ignored");
                        continue;
                    }
                    debug!(%task_id, %capability, "ExecutionWorker: execute");
                    pending = Some(PendingRequest {
                        task_id,
                        capability,
                        parameters,
                        required,
                        reply_to,
                    });
                }
                WorkerMsg::Resume { parameters } => match pending.as_mut() {
                    Some(request) => {
                        debug!(task_id = %request.task_id, new_params = parameters.len(), "ExecutionWorker: resume");
                        for (key, value) in parameters {
                            request.parameters.insert(key, value);
                        }
                    }
                    None => {
                        warn!("ExecutionWorker: resume with no pending request");
                        continue;
                    }
                },
            }

            let Some(request) = pending.as_ref() else { continue };

            match attempt(&registry, request, &emitter).await {
                Attempt::NeedInput(missing, question) => {
                    resume_store.insert(
                        request.task_id.clone(),
                        LiveResumption {
                            worker: self_handle.clone(),
                            missing_params: missing.clone(),
                            question: question.clone(),
                        },
                    );
                    let snapshot = ResumptionSnapshot::new(
                        request.task_id.clone(),
                        request.capability.clone(),
                        request.parameters.clone(),
                        missing.clone(),
                        question.clone(),
                    );
                    if let Err(e) = state.save_resumption(snapshot).await {
                        warn!(task_id = %request.task_id, error = %e, "ExecutionWorker: resumption snapshot not saved");
                    }

                    emitter.emit(
                        EventType::TaskPaused,
                        json!({"task_id": request.task_id, "missing_params": missing, "question": question}),
                    );
                    let completion = Completion::need_input(
                        request.task_id.clone(),
                        missing,
                        question,
                        self_handle.clone(),
                    );
                    let _ = request.reply_to.send(completion).await;
                    // stay alive for the resume
                }
                Attempt::Done(completion) => {
                    resume_store.remove(&request.task_id);
                    if let Err(e) = state.delete_resumption(&request.task_id).await {
                        debug!(task_id = %request.task_id, error = %e, "ExecutionWorker: no resumption snapshot to delete");
                    }
                    let _ = request.reply_to.send(completion).await;
                    break;
                }
            }
        }
        debug!("ExecutionWorker: done");
    });

    handle
}

async fn attempt(registry: &CapabilityRegistry, request: &PendingRequest, emitter: &EventEmitter) -> Attempt {
    let capability = match registry.get(&request.capability) {
        Ok(capability) => capability,
        Err(e) => {
            return Attempt::Done(Completion::error(request.task_id.clone(), e.to_string()));
        }
    };

    // Preflight: nothing leaves the process while parameters are missing
    let missing = missing_parameters(capability.required_params(), &request.required, &request.parameters);
    if !missing.is_empty() {
        let question = build_question(&request.required, &missing);
        debug!(task_id = %request.task_id, ?missing, "ExecutionWorker: preflight found missing parameters");
        return Attempt::NeedInput(missing, question);
    }

    emitter.emit(
        EventType::CapabilityExecuted,
        json!({"task_id": request.task_id, "capability": request.capability, "status": "started"}),
    );

    let outcome = tokio::time::timeout(capability.timeout(), capability.execute(&request.parameters)).await;
    match outcome {
        Ok(Ok(result)) => {
            emitter.emit(
                EventType::CapabilityExecuted,
                json!({"task_id": request.task_id, "capability": request.capability, "status": "success"}),
            );
            Attempt::Done(Completion::success(request.task_id.clone(), result))
        }
        Ok(Err(e)) => {
            emitter.error(
                EventType::CapabilityFailed,
                json!({"task_id": request.task_id, "capability": request.capability, "error": e.to_string()}),
            );
            Attempt::Done(Completion::failed(request.task_id.clone(), e.to_string()))
        }
        Err(_) => {
            let message = format!(
                "{} call timed out after {:?}",
                request.capability,
                capability.timeout()
            );
            emitter.error(
                EventType::CapabilityFailed,
                json!({"task_id": request.task_id, "capability": request.capability, "error": message}),
            );
            Attempt::Done(Completion::failed(request.task_id.clone(), message))
        }
    }
}

/// Missing/empty required parameters, capability requirements first
fn missing_parameters(capability_required: &[&str], declared: &[ArgSpec], parameters: &ParamMap) -> Vec<String> {
    let mut missing = Vec::new();
    for name in capability_required {
        if !param_present(parameters, name) {
            missing.push((*name).to_string());
        }
    }
    for spec in declared {
        if spec.required && !param_present(parameters, &spec.name) && !missing.contains(&spec.name) {
            missing.push(spec.name.clone());
        }
    }
    missing
}

/// Human-readable prompt for the missing parameters
///
/// Per-argument prompts from the schema win; the rest get a generated line.
fn build_question(declared: &[ArgSpec], missing: &[String]) -> String {
    let mut lines = Vec::new();
    let mut unprompted = Vec::new();

    for name in missing {
        match declared.iter().find(|spec| &spec.name == name).and_then(|s| s.prompt.clone()) {
            Some(prompt) => lines.push(prompt),
            None => unprompted.push(name.clone()),
        }
    }
    if !unprompted.is_empty() {
        lines.push(format!("Please provide: {}", unprompted.join(", ")));
    }
    lines.join(" ")
}
