//! Task-group aggregator - executes one plan, step by step
//!
//! Strict serial orchestration: at most one step in flight, results thread
//! into the next step's context, and routing picks the executor per step:
//!
//! - `is_parallel` -> the parallel aggregator
//! - AGENT -> the leaf agent, through a retrying dispatch that owns the
//!   retry policy for remote failures
//! - TOOL -> an execution worker on the named capability
//!
//! A NEED_INPUT from the in-flight step is forwarded upward while the
//! aggregator keeps awaiting that same step, so resumption re-enters the
//! chain exactly where it paused. A cancel lets the in-flight call finish,
//! discards its result, and terminates with CANCELLED.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::domain::{ExecutionPlan, ExecutorClass, ParamMap, PlanStep, StepParams};

use super::leaf::{LeafRequest, run_leaf};
use super::messages::{Completion, CompletionSender, CompletionStatus};
use super::parallel::{ParallelRequest, run_parallel};
use super::worker::spawn_worker;
use super::EngineContext;

/// Aggregator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Idle,
    RunningStep,
    AwaitingStepResult,
    Failed,
    Completed,
}

/// One plan plus the context it starts from
#[derive(Debug, Clone)]
pub struct TaskGroupRequest {
    pub parent_task_id: String,
    pub trace_id: String,
    pub task_path: String,
    pub user_id: String,
    /// The overall task goal (used when composing step prompts)
    pub goal: String,
    pub plan: ExecutionPlan,
    /// Initial global variable pool
    pub context: ParamMap,
}

/// Execute a plan; the final completion goes to `reply_to`
pub async fn run_group(
    ctx: Arc<EngineContext>,
    request: TaskGroupRequest,
    mut cancel: watch::Receiver<bool>,
    reply_to: CompletionSender,
) {
    let mut state = GroupState::Idle;
    debug!(task_id = %request.parent_task_id, steps = request.plan.len(), ?state, "TaskGroupAggregator: start");

    let mut steps = request.plan.steps.clone();
    steps.sort_by_key(|s| s.step);

    let mut step_results = ParamMap::new();
    let mut context = request.context.clone();
    let mut cancelled = *cancel.borrow();

    for (index, step) in steps.iter().enumerate() {
        if cancelled {
            break;
        }
        state = GroupState::RunningStep;
        info!(task_id = %request.parent_task_id, step = step.step, executor = %step.executor, ?state, "TaskGroupAggregator: step");

        // Thread earlier results into this step's parameters
        let parameters = match resolve_dependencies(step, &request.goal, &context) {
            Ok(parameters) => parameters,
            Err(error) => {
                state = GroupState::Failed;
                debug!(task_id = %request.parent_task_id, ?state, "TaskGroupAggregator: dependency resolution failed");
                let _ = reply_to
                    .send(fail_completion(&request.parent_task_id, &step_results, index, error))
                    .await;
                return;
            }
        };

        state = GroupState::AwaitingStepResult;
        debug!(task_id = %request.parent_task_id, step = step.step, ?state, "TaskGroupAggregator: awaiting step result");
        let completion = execute_step(&ctx, &request, step, parameters, &reply_to, &mut cancel, &mut cancelled).await;

        if cancelled {
            break;
        }

        match completion.status {
            CompletionStatus::Success => {
                let result = completion.result.unwrap_or(Value::Null);
                let key = step.output_key();
                step_results.insert(key.clone(), result.clone());
                context.insert(key, result.clone());
                context.insert("prev_step_output".to_string(), result);
            }
            _ => {
                state = GroupState::Failed;
                let error = completion
                    .error
                    .unwrap_or_else(|| format!("step {} failed", step.step));
                warn!(task_id = %request.parent_task_id, step = step.step, %error, ?state, "TaskGroupAggregator: step failed");
                let _ = reply_to
                    .send(fail_completion(&request.parent_task_id, &step_results, index, error))
                    .await;
                return;
            }
        }
    }

    if cancelled {
        debug!(task_id = %request.parent_task_id, "TaskGroupAggregator: cancelled, discarding in-flight results");
        let _ = reply_to.send(Completion::cancelled(request.parent_task_id.clone())).await;
        return;
    }

    state = GroupState::Completed;
    debug!(task_id = %request.parent_task_id, ?state, "TaskGroupAggregator: completed");
    let _ = reply_to
        .send(Completion::success(
            request.parent_task_id.clone(),
            Value::Object(step_results),
        ))
        .await;
}

fn fail_completion(task_id: &str, step_results: &ParamMap, step_index: usize, error: String) -> Completion {
    let mut completion = Completion::failed(task_id, error.clone());
    completion.result = Some(json!({
        "results": step_results,
        "failed_step_index": step_index,
        "error": error,
    }));
    completion
}

/// Route one step to its executor and await the terminal completion,
/// forwarding NEED_INPUT upward and honoring cancellation.
async fn execute_step(
    ctx: &Arc<EngineContext>,
    request: &TaskGroupRequest,
    step: &PlanStep,
    parameters: ParamMap,
    reply_to: &CompletionSender,
    cancel: &mut watch::Receiver<bool>,
    cancelled: &mut bool,
) -> Completion {
    let step_task_id = format!("{}_step_{}", request.parent_task_id, step.step);

    if step.is_parallel {
        let (tx, rx) = mpsc::channel(4);
        let parallel_request = ParallelRequest {
            task_id: step_task_id.clone(),
            trace_id: request.trace_id.clone(),
            user_id: request.user_id.clone(),
            executor_class: step.executor_class,
            executor: step.executor.clone(),
            description: step.description.clone(),
            parameters,
            repeat_count: step.repeat_count,
            aggregation: step.aggregation.unwrap_or_default(),
        };
        tokio::spawn(run_parallel(ctx.clone(), parallel_request, tx));
        return await_terminal(rx, reply_to, cancel, cancelled).await;
    }

    match step.executor_class {
        ExecutorClass::Agent => {
            // The retrying dispatch: remote failures retry up to the
            // configured bound, configuration errors do not.
            let max_attempts = ctx.config.max_agent_step_retries.max(1);
            let mut attempt = 0;
            loop {
                attempt += 1;
                let (tx, rx) = mpsc::channel(4);
                let leaf_request = LeafRequest {
                    task_id: step_task_id.clone(),
                    trace_id: request.trace_id.clone(),
                    agent_id: step.executor.clone(),
                    user_id: request.user_id.clone(),
                    description: step.description.clone(),
                    parameters: parameters.clone(),
                };
                tokio::spawn(run_leaf(ctx.clone(), leaf_request, tx));

                let completion = await_terminal(rx, reply_to, cancel, cancelled).await;
                if *cancelled {
                    return completion;
                }
                match completion.status {
                    CompletionStatus::Failed if attempt < max_attempts => {
                        warn!(
                            task_id = %step_task_id,
                            attempt,
                            max_attempts,
                            "TaskGroupAggregator: retrying AGENT step after remote failure"
                        );
                    }
                    _ => return completion,
                }
            }
        }
        ExecutorClass::Tool => {
            let (tx, rx) = mpsc::channel(4);
            let worker = spawn_worker(
                ctx.registry.clone(),
                ctx.resume_store.clone(),
                ctx.state.clone(),
                ctx.emitter(&request.trace_id, "ExecutionWorker"),
            );
            if let Err(e) = worker
                .execute(step_task_id.clone(), step.executor.clone(), parameters, vec![], tx)
                .await
            {
                return Completion::failed(step_task_id, e);
            }
            await_terminal(rx, reply_to, cancel, cancelled).await
        }
    }
}

/// Await a step's terminal completion
///
/// NEED_INPUT completions are forwarded to the group's own reply-to and
/// the wait continues. A cancel signal does not abort the in-flight call;
/// it marks the run cancelled so the eventual result is discarded.
async fn await_terminal(
    mut rx: mpsc::Receiver<Completion>,
    reply_to: &CompletionSender,
    cancel: &mut watch::Receiver<bool>,
    cancelled: &mut bool,
) -> Completion {
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(completion) if completion.is_terminal() => return completion,
                Some(completion) => {
                    debug!(task_id = %completion.task_id, "TaskGroupAggregator: forwarding NEED_INPUT upward");
                    let _ = reply_to.send(completion).await;
                }
                None => return Completion::failed("unknown", "step executor terminated without completion"),
            },
            changed = cancel.changed() => match changed {
                Ok(()) => {
                    if *cancel.borrow() {
                        debug!("TaskGroupAggregator: cancel observed while awaiting step");
                        *cancelled = true;
                        // keep draining until the in-flight call completes
                    }
                }
                Err(_) => {
                    // Cancel source gone; finish by draining the step channel
                    while let Some(completion) = rx.recv().await {
                        if completion.is_terminal() {
                            return completion;
                        }
                        let _ = reply_to.send(completion).await;
                    }
                    return Completion::failed("unknown", "step executor terminated without completion");
                }
            }
        }
    }
}

/// Dependency resolution and context threading
///
/// Free-text parameters become a composite prompt (previous result +
/// current goal + instruction) under generic keys; structured maps get
/// `$name` substitution plus implicit context injection; empty parameters
/// inherit the previous result when one exists.
fn resolve_dependencies(step: &PlanStep, goal: &str, context: &ParamMap) -> Result<ParamMap, String> {
    let prev_output = context.get("prev_step_output");

    match &step.params {
        StepParams::Instruction(instruction) => {
            let combined = build_comprehensive_prompt(prev_output, &step.description, instruction);
            let mut parameters = ParamMap::new();
            parameters.insert("input".to_string(), Value::String(combined.clone()));
            parameters.insert("query".to_string(), Value::String(combined));
            parameters.insert("instruction".to_string(), Value::String(instruction.clone()));
            parameters.insert("_is_context_expanded".to_string(), Value::Bool(true));
            Ok(parameters)
        }
        StepParams::Map(map) => {
            let mut resolved = map.clone();

            // Explicit $name substitution against accumulated results
            for (key, value) in resolved.iter_mut() {
                if let Value::String(s) = value
                    && let Some(reference) = s.strip_prefix('$')
                {
                    match context.get(reference) {
                        Some(referenced) => {
                            debug!(%key, %reference, "TaskGroupAggregator: injecting dependency");
                            *value = referenced.clone();
                        }
                        None => {
                            return Err(format!("step {} references unknown output '{reference}'", step.step));
                        }
                    }
                }
            }

            // Implicit context injection for downstream consumers
            if let Some(prev) = prev_output {
                resolved.insert("prev_step_output".to_string(), prev.clone());
                if step.executor_class == ExecutorClass::Agent {
                    let combined =
                        build_comprehensive_prompt(Some(prev), &step.description, &Value::Object(map.clone()).to_string());
                    resolved.insert("_full_context".to_string(), Value::String(combined.clone()));
                    if !resolved.contains_key("input") && !resolved.contains_key("query") {
                        resolved.insert("input".to_string(), Value::String(combined));
                    }
                }
            }
            Ok(resolved)
        }
        StepParams::Empty => {
            let mut parameters = ParamMap::new();
            if let Some(prev) = prev_output {
                let combined =
                    build_comprehensive_prompt(Some(prev), &step.description, "Analyze the context provided.");
                parameters.insert("input".to_string(), Value::String(combined));
            }
            Ok(parameters)
        }
    }
}

/// Compose the "previous result / current goal / instruction" prompt
fn build_comprehensive_prompt(prev_output: Option<&Value>, description: &str, instruction: &str) -> String {
    let mut parts = Vec::new();
    if let Some(prev) = prev_output {
        let prev_str = match prev {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        parts.push(format!("### Previous Step Result / Context ###\n{prev_str}\n"));
    }
    if !description.is_empty() {
        parts.push(format!("### Current Task Goal ###\n{description}\n"));
    }
    if !instruction.is_empty() {
        parts.push(format!("### Instruction / Parameters ###\n{instruction}"));
    }
    parts.join("\n")
}
