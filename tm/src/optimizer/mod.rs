//! Optimizer - per-loop-task feedback learner
//!
//! Execution and optimization are separate lifecycles: the loop scheduler
//! decides *when* to run and stores the parameter overlay, the agents
//! decide *what* to run, and the optimizer learns *how to run it better*.
//! Each registered loop task gets an independent [`OptimizerState`]; after
//! every feedback window the best known parameter vector is pushed to the
//! scheduler as an `apply_optimization` message.
//!
//! The same learner state also powers the parallel aggregator's inline
//! optimization loop (propose a batch, execute, score, feed back), without
//! going through the actor.

mod dimensions;

pub use dimensions::{Dimension, DimensionParser, DimensionSchema, fallback_schema};

use std::collections::HashMap;
use std::sync::Arc;

use meshstore::now_ms;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::ParamMap;
use crate::events::{EventBus, EventType};
use crate::scheduler::SchedulerHandle;
use crate::state::StateManager;

/// Trials without improvement after which the learner reports convergence
const STALL_TRIALS: u32 = 5;

/// One observed execution of a loop task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub parameters: ParamMap,
    /// Caller-supplied score in [0, 1]; derived from success and duration
    /// when absent
    #[serde(default)]
    pub score: Option<f64>,
    pub duration_ms: u64,
    pub success: bool,
    pub executed_at: i64,
}

impl ExecutionRecord {
    pub fn new(parameters: ParamMap, success: bool, duration_ms: u64, score: Option<f64>) -> Self {
        Self {
            parameters,
            score,
            duration_ms,
            success,
            executed_at: now_ms(),
        }
    }
}

/// Derive the effective score of a record
///
/// Explicit scores win. Otherwise failure is 0.0 and success starts at 0.7,
/// adjusted by duration (<1s: +0.2, >10s: -0.2), clamped to [0, 1].
pub fn derive_score(record: &ExecutionRecord) -> f64 {
    if let Some(score) = record.score {
        return score.clamp(0.0, 1.0);
    }
    if !record.success {
        return 0.0;
    }
    let mut score: f64 = 0.7;
    if record.duration_ms < 1_000 {
        score += 0.2;
    } else if record.duration_ms > 10_000 {
        score -= 0.2;
    }
    score.clamp(0.0, 1.0)
}

/// Per-task learner state
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OptimizerState {
    pub schema: DimensionSchema,
    pub history: Vec<ExecutionRecord>,
    pub best_parameters: Option<ParamMap>,
    pub best_score: f64,
    pub trials: u32,
    pub last_improvement_trial: u32,
}

impl OptimizerState {
    pub fn new(schema: DimensionSchema) -> Self {
        Self {
            schema,
            ..Self::default()
        }
    }

    /// Ingest one execution record; returns the effective score
    pub fn learn(&mut self, record: ExecutionRecord) -> f64 {
        let score = derive_score(&record);
        self.trials += 1;
        if self.best_parameters.is_none() || score > self.best_score {
            self.best_score = score;
            self.best_parameters = Some(record.parameters.clone());
            self.last_improvement_trial = self.trials;
        }
        self.history.push(record);
        score
    }

    /// Whether learning has stalled
    pub fn converged(&self) -> bool {
        self.trials >= STALL_TRIALS && self.trials - self.last_improvement_trial >= STALL_TRIALS
    }

    /// Propose `k` candidate parameter vectors
    ///
    /// The first candidate exploits the best known vector unchanged; the
    /// rest perturb it (or sample uniformly before anything is known).
    pub fn propose_batch(&self, k: usize, rng: &mut impl Rng) -> Vec<ParamMap> {
        let mut batch = Vec::with_capacity(k);
        for index in 0..k {
            match &self.best_parameters {
                Some(best) if index == 0 => batch.push(best.clone()),
                Some(best) => batch.push(self.perturb(best, rng)),
                None => batch.push(self.sample_uniform(rng)),
            }
        }
        batch
    }

    fn sample_uniform(&self, rng: &mut impl Rng) -> ParamMap {
        let mut params = ParamMap::new();
        for dimension in &self.schema.dimensions {
            let value = match dimension {
                Dimension::Float { min, max, .. } => json!(rng.random_range(*min..=*max)),
                Dimension::Int { min, max, .. } => json!(rng.random_range(*min..=*max)),
                Dimension::Categorical { choices, .. } => match choices.is_empty() {
                    true => Value::Null,
                    false => json!(choices[rng.random_range(0..choices.len())]),
                },
            };
            params.insert(dimension.name().to_string(), value);
        }
        params
    }

    fn perturb(&self, base: &ParamMap, rng: &mut impl Rng) -> ParamMap {
        let mut params = base.clone();
        for dimension in &self.schema.dimensions {
            let name = dimension.name();
            let value = match dimension {
                Dimension::Float { min, max, .. } => {
                    let current = base.get(name).and_then(Value::as_f64).unwrap_or((min + max) / 2.0);
                    let spread = (max - min) * 0.2;
                    json!((current + rng.random_range(-spread..=spread)).clamp(*min, *max))
                }
                Dimension::Int { min, max, .. } => {
                    let current = base.get(name).and_then(Value::as_i64).unwrap_or((min + max) / 2);
                    let spread = ((max - min) / 5).max(1);
                    json!((current + rng.random_range(-spread..=spread)).clamp(*min, *max))
                }
                Dimension::Categorical { choices, .. } => {
                    if choices.is_empty() {
                        continue;
                    }
                    if rng.random_bool(0.5) {
                        continue; // keep the current choice
                    }
                    json!(choices[rng.random_range(0..choices.len())])
                }
            };
            params.insert(name.to_string(), value);
        }
        params
    }

    /// Summary statistics for reporting
    pub fn stats(&self) -> Value {
        json!({
            "trials": self.trials,
            "best_score": self.best_score,
            "best_parameters": self.best_parameters,
            "history_len": self.history.len(),
            "converged": self.converged(),
        })
    }
}

/// Registration configuration for a loop task's optimization
#[derive(Debug, Clone, Default)]
pub struct OptimizationConfig {
    /// Trace id of the owning loop task, for event correlation
    pub trace_id: String,
    /// Feedbacks between `apply_optimization` pushes (0 = engine default)
    pub feedback_window: usize,
    /// Pre-declared schema; discovered lazily when empty
    pub schema: DimensionSchema,
}

/// Commands for the optimizer actor
#[derive(Debug)]
pub enum OptimizerMsg {
    Register {
        task_id: String,
        config: OptimizationConfig,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Fire-and-forget execution feedback
    Feedback {
        task_id: String,
        record: ExecutionRecord,
    },
    GetStats {
        task_id: String,
        reply: oneshot::Sender<Option<Value>>,
    },
    /// Clear history, keep registration
    Reset {
        task_id: String,
        reply: oneshot::Sender<bool>,
    },
    /// Serialize state to the store and drop the in-memory instance
    Unregister {
        task_id: String,
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Cloneable handle to the optimizer actor
#[derive(Clone)]
pub struct OptimizerHandle {
    tx: mpsc::Sender<OptimizerMsg>,
}

impl OptimizerHandle {
    /// Create the handle and its receiving end without spawning
    pub fn channel() -> (Self, mpsc::Receiver<OptimizerMsg>) {
        let (tx, rx) = mpsc::channel(128);
        (Self { tx }, rx)
    }

    pub async fn register(&self, task_id: &str, config: OptimizationConfig) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(OptimizerMsg::Register {
                task_id: task_id.to_string(),
                config,
                reply,
            })
            .await
            .map_err(|_| "optimizer actor gone".to_string())?;
        rx.await.map_err(|_| "optimizer actor gone".to_string())?
    }

    pub async fn feedback(&self, task_id: &str, record: ExecutionRecord) {
        let _ = self
            .tx
            .send(OptimizerMsg::Feedback {
                task_id: task_id.to_string(),
                record,
            })
            .await;
    }

    pub async fn get_stats(&self, task_id: &str) -> Option<Value> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(OptimizerMsg::GetStats {
                task_id: task_id.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn reset(&self, task_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(OptimizerMsg::Reset {
                task_id: task_id.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn unregister(&self, task_id: &str) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(OptimizerMsg::Unregister {
                task_id: task_id.to_string(),
                reply,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(OptimizerMsg::Shutdown).await;
    }
}

struct Registration {
    config: OptimizationConfig,
    state: OptimizerState,
}

/// Run the optimizer actor
pub async fn run_optimizer(
    mut rx: mpsc::Receiver<OptimizerMsg>,
    scheduler: SchedulerHandle,
    state_manager: StateManager,
    bus: Arc<EventBus>,
    default_window: usize,
) {
    info!("Optimizer: actor started");
    let mut registrations: HashMap<String, Registration> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            OptimizerMsg::Register { task_id, config, reply } => {
                // Restore persisted learner state when available
                let state = match state_manager.load_optimizer_state(&task_id).await {
                    Ok(Some(blob)) => serde_json::from_value(blob).unwrap_or_else(|_| {
                        warn!(%task_id, "Optimizer: persisted state unreadable, starting fresh");
                        OptimizerState::new(config.schema.clone())
                    }),
                    _ => OptimizerState::new(config.schema.clone()),
                };

                bus.emitter_for(config.trace_id.clone(), "Optimizer")
                    .emit(EventType::OptimizationRegistered, json!({"task_id": task_id}));
                registrations.insert(task_id, Registration { config, state });
                let _ = reply.send(Ok(()));
            }
            OptimizerMsg::Feedback { task_id, record } => {
                let Some(registration) = registrations.get_mut(&task_id) else {
                    warn!(%task_id, "Optimizer: feedback for unregistered task");
                    continue;
                };

                let score = registration.state.learn(record);
                let emitter = bus.emitter_for(registration.config.trace_id.clone(), "Optimizer");
                emitter.emit(
                    EventType::OptimizationLearned,
                    json!({"task_id": task_id, "score": score, "trials": registration.state.trials}),
                );
                debug!(%task_id, score, trials = registration.state.trials, "Optimizer: learned from execution");

                let window = match registration.config.feedback_window {
                    0 => default_window.max(1),
                    w => w,
                };
                if registration.state.trials as usize % window == 0 {
                    if let Some(best) = registration.state.best_parameters.clone() {
                        let stats = registration.state.stats();
                        emitter.emit(
                            EventType::OptimizationTriggered,
                            json!({"task_id": task_id, "stats": stats}),
                        );
                        scheduler.apply_optimization(&task_id, best, stats).await;
                    }
                }
            }
            OptimizerMsg::GetStats { task_id, reply } => {
                let _ = reply.send(registrations.get(&task_id).map(|r| r.state.stats()));
            }
            OptimizerMsg::Reset { task_id, reply } => {
                let found = match registrations.get_mut(&task_id) {
                    Some(registration) => {
                        let schema = registration.state.schema.clone();
                        registration.state = OptimizerState::new(schema);
                        bus.emitter_for(registration.config.trace_id.clone(), "Optimizer")
                            .emit(EventType::OptimizationReset, json!({"task_id": task_id}));
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }
            OptimizerMsg::Unregister { task_id, reply } => {
                if let Some(registration) = registrations.remove(&task_id) {
                    match serde_json::to_value(&registration.state) {
                        Ok(blob) => {
                            if let Err(e) = state_manager.save_optimizer_state(&task_id, blob).await {
                                warn!(%task_id, error = %e, "Optimizer: failed to persist state on unregister");
                            }
                        }
                        Err(e) => warn!(%task_id, error = %e, "Optimizer: state not serializable"),
                    }
                    bus.emitter_for(registration.config.trace_id, "Optimizer")
                        .emit(EventType::OptimizationUnregistered, json!({"task_id": task_id}));
                }
                let _ = reply.send(());
            }
            OptimizerMsg::Shutdown => break,
        }
    }
    info!("Optimizer: actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn record(score: Option<f64>, success: bool, duration_ms: u64) -> ExecutionRecord {
        ExecutionRecord::new(ParamMap::new(), success, duration_ms, score)
    }

    #[test]
    fn test_derive_score_defaults() {
        assert_eq!(derive_score(&record(None, false, 500)), 0.0);
        assert!((derive_score(&record(None, true, 500)) - 0.9).abs() < 1e-9);
        assert!((derive_score(&record(None, true, 5_000)) - 0.7).abs() < 1e-9);
        assert!((derive_score(&record(None, true, 20_000)) - 0.5).abs() < 1e-9);
        assert_eq!(derive_score(&record(Some(1.4), true, 1)), 1.0);
    }

    #[test]
    fn test_learn_tracks_best() {
        let mut state = OptimizerState::new(DimensionSchema::default());

        let mut p1 = ParamMap::new();
        p1.insert("x".into(), json!(1));
        let mut p2 = ParamMap::new();
        p2.insert("x".into(), json!(2));

        state.learn(ExecutionRecord::new(p1.clone(), true, 100, Some(0.6)));
        state.learn(ExecutionRecord::new(p2.clone(), true, 100, Some(0.9)));
        state.learn(ExecutionRecord::new(p1, true, 100, Some(0.3)));

        assert_eq!(state.trials, 3);
        assert_eq!(state.best_score, 0.9);
        assert_eq!(state.best_parameters.as_ref().unwrap()["x"], 2);
    }

    #[test]
    fn test_convergence_after_stall() {
        let mut state = OptimizerState::new(DimensionSchema::default());
        state.learn(record(Some(0.9), true, 1));
        assert!(!state.converged());
        for _ in 0..STALL_TRIALS {
            state.learn(record(Some(0.1), true, 1));
        }
        assert!(state.converged());
    }

    #[test]
    fn test_propose_batch_respects_bounds() {
        let schema = DimensionSchema {
            dimensions: vec![
                Dimension::Float {
                    name: "temp".into(),
                    min: 0.0,
                    max: 1.0,
                },
                Dimension::Int {
                    name: "count".into(),
                    min: 1,
                    max: 10,
                },
                Dimension::Categorical {
                    name: "tone".into(),
                    choices: vec!["formal".into(), "casual".into()],
                },
            ],
        };
        let mut state = OptimizerState::new(schema);
        let mut rng = StdRng::seed_from_u64(7);

        // Before learning: uniform samples
        for params in state.propose_batch(4, &mut rng) {
            let temp = params["temp"].as_f64().unwrap();
            assert!((0.0..=1.0).contains(&temp));
            let count = params["count"].as_i64().unwrap();
            assert!((1..=10).contains(&count));
        }

        let mut best = ParamMap::new();
        best.insert("temp".into(), json!(0.5));
        best.insert("count".into(), json!(5));
        best.insert("tone".into(), json!("formal"));
        state.learn(ExecutionRecord::new(best.clone(), true, 1, Some(0.9)));

        // After learning: first candidate exploits the best vector
        let batch = state.propose_batch(3, &mut rng);
        assert_eq!(batch[0], best);
        for params in &batch[1..] {
            let temp = params["temp"].as_f64().unwrap();
            assert!((0.0..=1.0).contains(&temp));
        }
    }

    #[test]
    fn test_state_roundtrip() {
        let mut state = OptimizerState::new(fallback_schema(&ParamMap::new()));
        state.learn(record(Some(0.8), true, 100));

        let blob = serde_json::to_value(&state).unwrap();
        let restored: OptimizerState = serde_json::from_value(blob).unwrap();
        assert_eq!(restored.trials, 1);
        assert_eq!(restored.best_score, 0.8);
        assert_eq!(restored.history.len(), 1);
    }
}
