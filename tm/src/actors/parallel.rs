//! Parallel aggregator - run N copies of one subtask and reduce
//!
//! Two modes:
//!
//! - **Simple repetition**: N independent executions of the same spec,
//!   reduced by a closed-set strategy. Numeric reducers skip non-numeric
//!   replica results with a warning and fall back to `list` when nothing
//!   numeric remains.
//! - **Optimization**: when the spec carries `optimization_enabled` and a
//!   `user_goal`, the aggregator discovers tunable dimensions, then runs up
//!   to five propose/execute/score/feed-back rounds, stopping early on
//!   convergence, and returns the best parameter vector with its output
//!   and history.
//!
//! Per-replica failures are recorded, never retried here; a failed replica
//! still leaves the partial successes in the result payload.

use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{AggregationStrategy, ExecutorClass, ParamMap};
use crate::events::EventType;
use crate::optimizer::{DimensionParser, ExecutionRecord, OptimizerState};

use super::leaf::{LeafRequest, run_leaf};
use super::messages::{Completion, CompletionSender, CompletionStatus};
use super::worker::spawn_worker;
use super::EngineContext;

/// Optimization rounds before giving the best-so-far back
const MAX_OPTIMIZATION_ROUNDS: u32 = 5;

/// Default trials per optimization round
const DEFAULT_BATCH_SIZE: usize = 3;

/// A replicated subtask spec
#[derive(Debug, Clone)]
pub struct ParallelRequest {
    pub task_id: String,
    pub trace_id: String,
    pub user_id: String,
    pub executor_class: ExecutorClass,
    pub executor: String,
    pub description: String,
    pub parameters: ParamMap,
    pub repeat_count: u32,
    pub aggregation: AggregationStrategy,
}

/// Run the parallel aggregator; the final completion goes to `reply_to`
pub async fn run_parallel(ctx: Arc<EngineContext>, request: ParallelRequest, reply_to: CompletionSender) {
    let emitter = ctx.emitter(&request.trace_id, "ParallelAggregator");
    emitter.emit(
        EventType::ParallelExecutionStarted,
        json!({
            "task_id": request.task_id,
            "repeat_count": request.repeat_count,
            "aggregation": request.aggregation,
        }),
    );

    let optimization_enabled = request
        .parameters
        .get("optimization_enabled")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let user_goal = request
        .parameters
        .get("user_goal")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let completion = if optimization_enabled && !user_goal.is_empty() {
        info!(task_id = %request.task_id, "ParallelAggregator: optimization mode");
        run_optimization(&ctx, &request, &user_goal).await
    } else {
        debug!(task_id = %request.task_id, "ParallelAggregator: simple repeat mode");
        run_simple_repeat(&ctx, &request).await
    };

    emitter.emit(
        EventType::ParallelExecutionCompleted,
        json!({"task_id": request.task_id, "status": completion.status.to_string()}),
    );
    let _ = reply_to.send(completion).await;
}

/// Simple repetition: N independent runs, then reduce
async fn run_simple_repeat(ctx: &Arc<EngineContext>, request: &ParallelRequest) -> Completion {
    let total = request.repeat_count.max(1) as usize;
    let (tx, mut rx) = mpsc::channel::<(usize, Completion)>(total);

    for run in 0..total {
        let run_id = format!("{}_run_{}", request.task_id, run + 1);
        let tx = tx.clone();
        let ctx = ctx.clone();
        let request = request.clone();
        tokio::spawn(async move {
            let completion = execute_replica(&ctx, &request, &run_id, request.parameters.clone()).await;
            let _ = tx.send((run, completion)).await;
        });
    }
    drop(tx);

    let mut results: Vec<Option<Value>> = vec![None; total];
    let mut failures = Vec::new();
    while let Some((run, completion)) = rx.recv().await {
        match completion.status {
            CompletionStatus::Success => {
                results[run] = Some(completion.result.unwrap_or(Value::Null));
            }
            _ => failures.push(
                completion
                    .error
                    .unwrap_or_else(|| format!("replica {} failed without detail", run + 1)),
            ),
        }
    }

    let successes: Vec<Value> = results.into_iter().flatten().collect();
    let aggregated = aggregate(&successes, request.aggregation);

    if failures.is_empty() {
        Completion::success(request.task_id.clone(), aggregated)
    } else {
        warn!(task_id = %request.task_id, failed = failures.len(), total, "ParallelAggregator: replicas failed");
        let mut completion = Completion::failed(
            request.task_id.clone(),
            format!("{} out of {} runs failed", failures.len(), total),
        );
        completion.result = Some(json!({
            "aggregated_result": aggregated,
            "successful_runs": successes.len(),
            "failures": failures,
        }));
        completion
    }
}

/// The optimization loop: discover dimensions, then propose / execute /
/// score / feed back, up to [`MAX_OPTIMIZATION_ROUNDS`] rounds.
async fn run_optimization(ctx: &Arc<EngineContext>, request: &ParallelRequest, user_goal: &str) -> Completion {
    let parser = DimensionParser::new(ctx.llm.clone());
    let schema = parser.discover(user_goal, &request.parameters).await;
    info!(task_id = %request.task_id, dimensions = schema.dimensions.len(), "ParallelAggregator: dimensions discovered");

    let batch_size = request
        .parameters
        .get("batch_size")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_BATCH_SIZE)
        .min(request.repeat_count.max(1) as usize)
        .max(1);

    let mut learner = OptimizerState::new(schema);
    let mut rng = StdRng::from_os_rng();
    let mut best_output: Option<Value> = None;
    let mut history = Vec::new();
    let mut any_success = false;

    for round in 1..=MAX_OPTIMIZATION_ROUNDS {
        let batch = learner.propose_batch(batch_size, &mut rng);
        debug!(task_id = %request.task_id, round, trials = batch.len(), "ParallelAggregator: optimization round");

        let mut round_entries = Vec::new();
        for (trial, candidate) in batch.into_iter().enumerate() {
            let run_id = format!("{}_round_{}_trial_{}", request.task_id, round, trial + 1);

            let mut trial_params = request.parameters.clone();
            for (key, value) in &candidate {
                trial_params.insert(key.clone(), value.clone());
            }

            let started = Instant::now();
            let completion = execute_replica(ctx, request, &run_id, trial_params).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            let success = completion.status == CompletionStatus::Success;
            let output = completion.result.clone().unwrap_or(Value::Null);

            // Scoring is delegated to the dimension parser; a judge failure
            // falls back to the success/duration derivation.
            let score = if success {
                parser.score(user_goal, &output).await.ok()
            } else {
                Some(0.0)
            };

            let record = ExecutionRecord::new(candidate.clone(), success, duration_ms, score);
            let effective = learner.learn(record);
            if success {
                any_success = true;
                if effective >= learner.best_score {
                    best_output = Some(output.clone());
                }
            }

            round_entries.push(json!({
                "trial": trial + 1,
                "parameters": candidate,
                "score": effective,
                "success": success,
            }));
        }

        history.push(json!({"round": round, "trials": round_entries}));

        if learner.converged() {
            info!(task_id = %request.task_id, round, "ParallelAggregator: optimizer converged early");
            break;
        }
    }

    let payload = json!({
        "best_parameters": learner.best_parameters,
        "best_score": learner.best_score,
        "best_output": best_output,
        "total_trials": learner.trials,
        "history": history,
    });

    if any_success {
        Completion::success(request.task_id.clone(), payload)
    } else {
        let mut completion = Completion::failed(request.task_id.clone(), "all optimization trials failed");
        completion.result = Some(payload);
        completion
    }
}

/// Execute one replica: AGENT specs recurse into the leaf agent, TOOL
/// specs go straight to the named capability.
async fn execute_replica(
    ctx: &Arc<EngineContext>,
    request: &ParallelRequest,
    run_id: &str,
    parameters: ParamMap,
) -> Completion {
    let (tx, mut rx) = mpsc::channel(4);

    match request.executor_class {
        ExecutorClass::Agent => {
            let leaf_request = LeafRequest {
                task_id: run_id.to_string(),
                trace_id: request.trace_id.clone(),
                agent_id: request.executor.clone(),
                user_id: request.user_id.clone(),
                description: request.description.clone(),
                parameters,
            };
            tokio::spawn(run_leaf(ctx.clone(), leaf_request, tx));
        }
        ExecutorClass::Tool => {
            let worker = spawn_worker(
                ctx.registry.clone(),
                ctx.resume_store.clone(),
                ctx.state.clone(),
                ctx.emitter(&request.trace_id, "ExecutionWorker"),
            );
            if let Err(e) = worker
                .execute(run_id.to_string(), request.executor.clone(), parameters, vec![], tx)
                .await
            {
                return Completion::failed(run_id.to_string(), e);
            }
        }
    }

    while let Some(completion) = rx.recv().await {
        if completion.is_terminal() {
            return completion;
        }
        // A replica cannot wait for user input; treat suspension as failure
        // and drop its resumption record right away
        warn!(%run_id, "ParallelAggregator: replica suspended on missing parameters, counting as failure");
        ctx.resume_store.remove(run_id);
        return Completion::failed(
            run_id.to_string(),
            format!("replica needs input: {}", completion.missing_params.join(", ")),
        );
    }
    Completion::failed(run_id.to_string(), "replica terminated without completion")
}

/// Reduce replica results with the declared strategy
fn aggregate(results: &[Value], strategy: AggregationStrategy) -> Value {
    if results.is_empty() {
        return Value::Null;
    }

    let numeric = |values: &[Value]| -> Vec<f64> {
        let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
        if numbers.len() < values.len() {
            warn!(
                skipped = values.len() - numbers.len(),
                ?strategy,
                "ParallelAggregator: ignoring non-numeric results under numeric reducer"
            );
        }
        numbers
    };

    match strategy {
        AggregationStrategy::List => Value::Array(results.to_vec()),
        AggregationStrategy::Last => results.last().cloned().unwrap_or(Value::Null),
        AggregationStrategy::Majority => {
            let mut counts: Vec<(String, &Value, usize)> = Vec::new();
            for value in results {
                let key = value.to_string();
                match counts.iter_mut().find(|(k, _, _)| *k == key) {
                    Some((_, _, count)) => *count += 1,
                    None => counts.push((key, value, 1)),
                }
            }
            counts
                .into_iter()
                .max_by_key(|(_, _, count)| *count)
                .map(|(_, value, _)| value.clone())
                .unwrap_or(Value::Null)
        }
        AggregationStrategy::Mean => {
            let numbers = numeric(results);
            if numbers.is_empty() {
                return Value::Array(results.to_vec());
            }
            json!(numbers.iter().sum::<f64>() / numbers.len() as f64)
        }
        AggregationStrategy::Sum => {
            let numbers = numeric(results);
            if numbers.is_empty() {
                return Value::Array(results.to_vec());
            }
            json!(numbers.iter().sum::<f64>())
        }
        AggregationStrategy::Min => {
            let numbers = numeric(results);
            if numbers.is_empty() {
                return Value::Array(results.to_vec());
            }
            json!(numbers.iter().copied().fold(f64::INFINITY, f64::min))
        }
        AggregationStrategy::Max => {
            let numbers = numeric(results);
            if numbers.is_empty() {
                return Value::Array(results.to_vec());
            }
            json!(numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max))
        }
    }
}
