//! Loop scheduler - owner of all recurring tasks
//!
//! The scheduler actor stores one record per registered loop (interval,
//! next fire time, pause flag, payload, optimizer overlay) and never
//! blocks on timers itself: an out-of-band ticker task (or an external
//! queue bridge) injects trigger messages, which keeps the actor
//! single-threaded and message-driven.
//!
//! On every fire the execution payload is composed, the current
//! `optimized_parameters` overlay is applied, and the fire is delivered to
//! the registered root agent. `apply_optimization` messages from the
//! optimizer replace the overlay used by subsequent fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meshstore::now_ms;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::actors::RootHandle;
use crate::domain::{ParamMap, TaskStatus};
use crate::events::{EventBus, EventType};
use crate::optimizer::{OptimizationConfig, OptimizerHandle};
use crate::state::StateManager;

/// A loop registration delivered by the root agent
#[derive(Debug, Clone)]
pub struct LoopRegistration {
    pub task_id: String,
    pub trace_id: String,
    pub interval_seconds: u64,
    /// Where fires are delivered
    pub target: RootHandle,
    /// Base execution parameters composed into every fire
    pub payload: ParamMap,
    pub optimization_enabled: bool,
    pub optimization_config: OptimizationConfig,
}

/// Commands accepted by the scheduler actor
#[derive(Debug)]
pub enum SchedulerMsg {
    Register {
        registration: LoopRegistration,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Fire a loop immediately; does not advance the schedule
    TriggerNow {
        task_id: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    UpdateInterval {
        task_id: String,
        interval_seconds: u64,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Pause {
        task_id: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Resume {
        task_id: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Cancel {
        task_id: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Store a new parameter overlay for subsequent fires
    ApplyOptimization {
        task_id: String,
        parameters: ParamMap,
        stats: Value,
    },
    /// Fire event injected by an external bridge for one loop task
    QueueTrigger { task_id: String },
    /// Periodic due-check injected by the ticker task
    Tick,
    Shutdown,
}

/// Cloneable handle to the scheduler actor
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerMsg>,
}

impl SchedulerHandle {
    /// Create the handle and its receiving end without spawning
    pub fn channel() -> (Self, mpsc::Receiver<SchedulerMsg>) {
        let (tx, rx) = mpsc::channel(128);
        (Self { tx }, rx)
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), String>>) -> SchedulerMsg,
    ) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| "scheduler is gone".to_string())?;
        rx.await.map_err(|_| "scheduler is gone".to_string())?
    }

    pub async fn register_loop_task(&self, registration: LoopRegistration) -> Result<(), String> {
        self.request(|reply| SchedulerMsg::Register { registration, reply }).await
    }

    pub async fn trigger_task_now(&self, task_id: &str) -> Result<(), String> {
        let task_id = task_id.to_string();
        self.request(|reply| SchedulerMsg::TriggerNow { task_id, reply }).await
    }

    pub async fn update_loop_interval(&self, task_id: &str, interval_seconds: u64) -> Result<(), String> {
        let task_id = task_id.to_string();
        self.request(|reply| SchedulerMsg::UpdateInterval {
            task_id,
            interval_seconds,
            reply,
        })
        .await
    }

    pub async fn pause_loop_task(&self, task_id: &str) -> Result<(), String> {
        let task_id = task_id.to_string();
        self.request(|reply| SchedulerMsg::Pause { task_id, reply }).await
    }

    pub async fn resume_loop_task(&self, task_id: &str) -> Result<(), String> {
        let task_id = task_id.to_string();
        self.request(|reply| SchedulerMsg::Resume { task_id, reply }).await
    }

    pub async fn cancel_loop_task(&self, task_id: &str) -> Result<(), String> {
        let task_id = task_id.to_string();
        self.request(|reply| SchedulerMsg::Cancel { task_id, reply }).await
    }

    pub async fn apply_optimization(&self, task_id: &str, parameters: ParamMap, stats: Value) {
        let _ = self
            .tx
            .send(SchedulerMsg::ApplyOptimization {
                task_id: task_id.to_string(),
                parameters,
                stats,
            })
            .await;
    }

    pub async fn queue_trigger(&self, task_id: &str) {
        let _ = self
            .tx
            .send(SchedulerMsg::QueueTrigger {
                task_id: task_id.to_string(),
            })
            .await;
    }

    pub async fn tick(&self) {
        let _ = self.tx.send(SchedulerMsg::Tick).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(SchedulerMsg::Shutdown).await;
    }
}

struct LoopRecord {
    registration: LoopRegistration,
    next_run_at: i64,
    last_run_at: Option<i64>,
    paused: bool,
    optimized: Option<ParamMap>,
}

/// Run the scheduler actor
pub async fn run_scheduler(
    mut rx: mpsc::Receiver<SchedulerMsg>,
    state: StateManager,
    optimizer: OptimizerHandle,
    bus: Arc<EventBus>,
) {
    info!("LoopScheduler: actor started");
    let mut records: HashMap<String, LoopRecord> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            SchedulerMsg::Register { registration, reply } => {
                let task_id = registration.task_id.clone();
                if records.contains_key(&task_id) {
                    let _ = reply.send(Err(format!("loop task {task_id} already registered")));
                    continue;
                }

                if registration.optimization_enabled {
                    if let Err(e) = optimizer.register(&task_id, registration.optimization_config.clone()).await {
                        warn!(%task_id, error = %e, "LoopScheduler: optimizer registration failed");
                    }
                }

                bus.emitter_for(registration.trace_id.clone(), "LoopScheduler").emit(
                    EventType::LoopTaskRegistered,
                    json!({
                        "task_id": task_id,
                        "interval_sec": registration.interval_seconds,
                        "optimization_enabled": registration.optimization_enabled,
                    }),
                );

                let next_run_at = now_ms() + registration.interval_seconds as i64 * 1000;
                records.insert(
                    task_id.clone(),
                    LoopRecord {
                        registration,
                        next_run_at,
                        last_run_at: None,
                        paused: false,
                        optimized: None,
                    },
                );
                sync_schedule(&state, &task_id, Some(next_run_at), None).await;
                debug!(%task_id, "LoopScheduler: registered");
                let _ = reply.send(Ok(()));
            }
            SchedulerMsg::TriggerNow { task_id, reply } => {
                let outcome = match records.get_mut(&task_id) {
                    Some(record) => {
                        fire(record, &bus, "manual").await;
                        sync_schedule(&state, &task_id, None, record.last_run_at).await;
                        Ok(())
                    }
                    None => Err(format!("loop task {task_id} not registered")),
                };
                let _ = reply.send(outcome);
            }
            SchedulerMsg::UpdateInterval {
                task_id,
                interval_seconds,
                reply,
            } => {
                let outcome = match records.get_mut(&task_id) {
                    Some(record) => {
                        record.registration.interval_seconds = interval_seconds;
                        record.next_run_at = now_ms() + interval_seconds as i64 * 1000;
                        sync_schedule(&state, &task_id, Some(record.next_run_at), record.last_run_at).await;
                        debug!(%task_id, interval_seconds, "LoopScheduler: interval updated");
                        Ok(())
                    }
                    None => Err(format!("loop task {task_id} not registered")),
                };
                let _ = reply.send(outcome);
            }
            SchedulerMsg::Pause { task_id, reply } => {
                let outcome = match records.get_mut(&task_id) {
                    Some(record) => {
                        record.paused = true;
                        if let Err(e) = state.transition_task(&task_id, TaskStatus::Paused).await {
                            warn!(%task_id, error = %e, "LoopScheduler: pause transition rejected");
                        }
                        bus.emitter_for(record.registration.trace_id.clone(), "LoopScheduler")
                            .emit(EventType::TaskPaused, json!({"task_id": task_id}));
                        Ok(())
                    }
                    None => Err(format!("loop task {task_id} not registered")),
                };
                let _ = reply.send(outcome);
            }
            SchedulerMsg::Resume { task_id, reply } => {
                let outcome = match records.get_mut(&task_id) {
                    Some(record) => {
                        record.paused = false;
                        record.next_run_at = now_ms() + record.registration.interval_seconds as i64 * 1000;
                        if let Err(e) = state.transition_task(&task_id, TaskStatus::Scheduled).await {
                            warn!(%task_id, error = %e, "LoopScheduler: resume transition rejected");
                        }
                        sync_schedule(&state, &task_id, Some(record.next_run_at), record.last_run_at).await;
                        bus.emitter_for(record.registration.trace_id.clone(), "LoopScheduler")
                            .emit(EventType::TaskResumed, json!({"task_id": task_id}));
                        Ok(())
                    }
                    None => Err(format!("loop task {task_id} not registered")),
                };
                let _ = reply.send(outcome);
            }
            SchedulerMsg::Cancel { task_id, reply } => {
                let outcome = match records.remove(&task_id) {
                    Some(record) => {
                        if let Err(e) = state.transition_task(&task_id, TaskStatus::Cancelled).await {
                            warn!(%task_id, error = %e, "LoopScheduler: cancel transition rejected");
                        }
                        if record.registration.optimization_enabled {
                            optimizer.unregister(&task_id).await;
                        }
                        let emitter = bus.emitter_for(record.registration.trace_id, "LoopScheduler");
                        emitter.emit(EventType::LoopTaskCancelled, json!({"task_id": task_id}));
                        emitter.emit(EventType::TaskCancelled, json!({"task_id": task_id}));
                        Ok(())
                    }
                    None => Err(format!("loop task {task_id} not registered")),
                };
                let _ = reply.send(outcome);
            }
            SchedulerMsg::ApplyOptimization {
                task_id,
                parameters,
                stats,
            } => {
                match records.get_mut(&task_id) {
                    Some(record) => {
                        info!(%task_id, "LoopScheduler: optimization overlay applied");
                        bus.emitter_for(record.registration.trace_id.clone(), "LoopScheduler").emit(
                            EventType::OptimizationApplied,
                            json!({"task_id": task_id, "optimized_parameters": parameters, "stats": stats}),
                        );
                        record.optimized = Some(parameters);
                    }
                    None => warn!(%task_id, "LoopScheduler: apply_optimization for unknown loop"),
                }
            }
            SchedulerMsg::QueueTrigger { task_id } => {
                if let Some(record) = records.get_mut(&task_id) {
                    if record.paused {
                        debug!(%task_id, "LoopScheduler: queue trigger ignored, loop paused");
                        continue;
                    }
                    fire(record, &bus, "queue").await;
                    advance(record);
                    sync_schedule(&state, &task_id, Some(record.next_run_at), record.last_run_at).await;
                } else {
                    warn!(%task_id, "LoopScheduler: queue trigger for unknown loop");
                }
            }
            SchedulerMsg::Tick => {
                let now = now_ms();
                let due: Vec<String> = records
                    .iter()
                    .filter(|(_, r)| !r.paused && r.next_run_at <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for task_id in due {
                    if let Some(record) = records.get_mut(&task_id) {
                        fire(record, &bus, "timer").await;
                        advance(record);
                        sync_schedule(&state, &task_id, Some(record.next_run_at), record.last_run_at).await;
                    }
                }
            }
            SchedulerMsg::Shutdown => break,
        }
    }
    info!("LoopScheduler: actor stopped");
}

/// Deliver one fire to the registered target, overlaying optimized
/// parameters over the base payload.
async fn fire(record: &mut LoopRecord, bus: &EventBus, trigger_type: &str) {
    let registration = &record.registration;
    let mut overlay = registration.payload.clone();
    if let Some(optimized) = &record.optimized {
        for (key, value) in optimized {
            overlay.insert(key.clone(), value.clone());
        }
    }

    debug!(task_id = %registration.task_id, trigger_type, "LoopScheduler: firing");
    if let Err(e) = registration.target.loop_fire(&registration.task_id, overlay).await {
        warn!(task_id = %registration.task_id, error = %e, "LoopScheduler: fire delivery failed");
        return;
    }

    record.last_run_at = Some(now_ms());
    bus.emitter_for(registration.trace_id.clone(), "LoopScheduler").emit(
        EventType::TaskTriggered,
        json!({"task_id": registration.task_id, "trigger_type": trigger_type}),
    );
}

fn advance(record: &mut LoopRecord) {
    record.next_run_at = now_ms() + record.registration.interval_seconds as i64 * 1000;
}

/// Mirror the live schedule into the persisted task record
async fn sync_schedule(state: &StateManager, task_id: &str, next_run_at: Option<i64>, last_run_at: Option<i64>) {
    match state.get_task(task_id).await {
        Ok(Some(mut task)) => {
            let schedule = task.schedule.get_or_insert_with(Default::default);
            if next_run_at.is_some() {
                schedule.next_run_at = next_run_at;
            }
            if last_run_at.is_some() {
                schedule.last_run_at = last_run_at;
            }
            if let Err(e) = state.update_task(task).await {
                warn!(%task_id, error = %e, "LoopScheduler: schedule sync failed");
            }
        }
        Ok(None) => debug!(%task_id, "LoopScheduler: no persisted task to sync"),
        Err(e) => warn!(%task_id, error = %e, "LoopScheduler: schedule sync read failed"),
    }
}

/// Ticker task feeding periodic due-checks to the scheduler
///
/// This is the out-of-band timer source; the scheduler actor itself never
/// sleeps.
pub fn spawn_ticker(handle: SchedulerHandle, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            handle.tick().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::RootMsg;
    use meshstore::Store;

    fn registration(task_id: &str, target: RootHandle, interval: u64) -> LoopRegistration {
        LoopRegistration {
            task_id: task_id.to_string(),
            trace_id: format!("trace-{task_id}"),
            interval_seconds: interval,
            target,
            payload: ParamMap::new(),
            optimization_enabled: false,
            optimization_config: OptimizationConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_register_and_manual_trigger() {
        let state = StateManager::spawn(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(100));
        let (optimizer, _orx) = OptimizerHandle::channel();
        let (scheduler, srx) = SchedulerHandle::channel();
        tokio::spawn(run_scheduler(srx, state, optimizer, bus));
        let (root, mut root_rx) = RootHandle::channel();

        scheduler
            .register_loop_task(registration("L1", root.clone(), 3600))
            .await
            .unwrap();
        scheduler.trigger_task_now("L1").await.unwrap();

        match root_rx.recv().await.unwrap() {
            RootMsg::LoopFire { task_id, .. } => assert_eq!(task_id, "L1"),
            other => panic!("expected LoopFire, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let state = StateManager::spawn(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(100));
        let (optimizer, _orx) = OptimizerHandle::channel();
        let (scheduler, srx) = SchedulerHandle::channel();
        tokio::spawn(run_scheduler(srx, state, optimizer, bus));
        let (root, _root_rx) = RootHandle::channel();

        scheduler
            .register_loop_task(registration("L1", root.clone(), 60))
            .await
            .unwrap();
        assert!(scheduler.register_loop_task(registration("L1", root, 60)).await.is_err());
    }

    #[tokio::test]
    async fn test_overlay_visible_to_next_fire() {
        let state = StateManager::spawn(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(100));
        let (optimizer, _orx) = OptimizerHandle::channel();
        let (scheduler, srx) = SchedulerHandle::channel();
        tokio::spawn(run_scheduler(srx, state, optimizer, bus));
        let (root, mut root_rx) = RootHandle::channel();

        scheduler
            .register_loop_task(registration("L1", root, 3600))
            .await
            .unwrap();

        let mut optimized = ParamMap::new();
        optimized.insert("temperature".into(), json!(0.4));
        scheduler
            .apply_optimization("L1", optimized, json!({"trials": 3}))
            .await;

        // ApplyOptimization is fire-and-forget; the next request on the same
        // channel is processed strictly after it.
        scheduler.trigger_task_now("L1").await.unwrap();

        match root_rx.recv().await.unwrap() {
            RootMsg::LoopFire { overlay, .. } => assert_eq!(overlay["temperature"], 0.4),
            other => panic!("expected LoopFire, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_paused_loop_skips_queue_trigger() {
        let state = StateManager::spawn(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(100));
        let (optimizer, _orx) = OptimizerHandle::channel();
        let (scheduler, srx) = SchedulerHandle::channel();
        tokio::spawn(run_scheduler(srx, state, optimizer, bus));
        let (root, mut root_rx) = RootHandle::channel();

        scheduler
            .register_loop_task(registration("L1", root, 3600))
            .await
            .unwrap();
        scheduler.pause_loop_task("L1").await.unwrap();
        scheduler.queue_trigger("L1").await;

        // Resume and fire to prove the queue trigger above was dropped
        scheduler.resume_loop_task("L1").await.unwrap();
        scheduler.trigger_task_now("L1").await.unwrap();

        let first = root_rx.recv().await.unwrap();
        assert!(matches!(first, RootMsg::LoopFire { .. }));
        assert!(root_rx.try_recv().is_err(), "paused fire must have been skipped");
    }

    #[tokio::test]
    async fn test_cancel_unregisters() {
        let state = StateManager::spawn(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(100));
        let (optimizer, _orx) = OptimizerHandle::channel();
        let (scheduler, srx) = SchedulerHandle::channel();
        tokio::spawn(run_scheduler(srx, state, optimizer, bus));
        let (root, _root_rx) = RootHandle::channel();

        scheduler
            .register_loop_task(registration("L1", root, 60))
            .await
            .unwrap();
        scheduler.cancel_loop_task("L1").await.unwrap();
        assert!(scheduler.trigger_task_now("L1").await.is_err());
    }

    #[tokio::test]
    async fn test_tick_fires_due_loops() {
        let state = StateManager::spawn(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(100));
        let (optimizer, _orx) = OptimizerHandle::channel();
        let (scheduler, srx) = SchedulerHandle::channel();
        tokio::spawn(run_scheduler(srx, state, optimizer, bus));
        let (root, mut root_rx) = RootHandle::channel();

        // Zero interval: due immediately
        scheduler
            .register_loop_task(registration("L1", root, 0))
            .await
            .unwrap();
        scheduler.tick().await;

        match tokio::time::timeout(Duration::from_secs(1), root_rx.recv()).await {
            Ok(Some(RootMsg::LoopFire { task_id, .. })) => assert_eq!(task_id, "L1"),
            other => panic!("expected LoopFire, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_schedule_synced_to_task_record() {
        let state = StateManager::spawn(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(100));
        let (optimizer, _orx) = OptimizerHandle::channel();
        let (scheduler, srx) = SchedulerHandle::channel();
        tokio::spawn(run_scheduler(srx, state.clone(), optimizer, bus));
        let (root, _root_rx) = RootHandle::channel();

        let task = crate::domain::Task::with_id("L1", "trace-L1", "u1", "hourly sync").with_interval(3600);
        state.create_task(task).await.unwrap();

        scheduler
            .register_loop_task(registration("L1", root, 3600))
            .await
            .unwrap();
        // register replies only after its own processing, but sync_schedule
        // runs inside the same message handling; read back the task
        let loaded = state.get_task("L1").await.unwrap().unwrap();
        assert!(loaded.schedule.unwrap().next_run_at.is_some());
    }
}
