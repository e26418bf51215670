//! StateManager actor
//!
//! Owns the store; processes one command at a time, so compound operations
//! (read-modify-write transitions) are race-free without locks.

use meshstore::{IndexValue, Store, now_ms};
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::{ResumptionSnapshot, Task, TaskStatus};

use super::messages::{StateCommand, StateError, StateResponse};

const OPTIMIZER_STATE_COLLECTION: &str = "optimizer_state";

/// Cloneable handle to the state actor
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Spawn the actor over an opened store
    pub fn spawn(store: Store) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run_actor(store, rx));
        Self { tx }
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand,
    ) -> StateResponse<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| StateError::Channel)?;
        rx.await.map_err(|_| StateError::Channel)?
    }

    pub async fn create_task(&self, task: Task) -> StateResponse<String> {
        self.send(|reply| StateCommand::CreateTask { task, reply }).await
    }

    pub async fn get_task(&self, id: &str) -> StateResponse<Option<Task>> {
        let id = id.to_string();
        self.send(|reply| StateCommand::GetTask { id, reply }).await
    }

    pub async fn update_task(&self, task: Task) -> StateResponse<()> {
        self.send(|reply| StateCommand::UpdateTask { task, reply }).await
    }

    pub async fn transition_task(&self, id: &str, to: TaskStatus) -> StateResponse<Task> {
        let id = id.to_string();
        self.send(|reply| StateCommand::TransitionTask { id, to, reply }).await
    }

    pub async fn complete_task(&self, id: &str, result: Option<serde_json::Value>) -> StateResponse<()> {
        let id = id.to_string();
        self.send(|reply| StateCommand::CompleteTask { id, result, reply }).await
    }

    pub async fn fail_task(&self, id: &str, error: impl Into<String>) -> StateResponse<()> {
        let id = id.to_string();
        let error = error.into();
        self.send(|reply| StateCommand::FailTask { id, error, reply }).await
    }

    pub async fn list_tasks(
        &self,
        user_filter: Option<String>,
        status_filter: Option<TaskStatus>,
    ) -> StateResponse<Vec<Task>> {
        self.send(|reply| StateCommand::ListTasks {
            user_filter,
            status_filter,
            reply,
        })
        .await
    }

    pub async fn add_comment(&self, id: &str, text: impl Into<String>) -> StateResponse<()> {
        let id = id.to_string();
        let text = text.into();
        self.send(|reply| StateCommand::AddComment { id, text, reply }).await
    }

    pub async fn find_task_by_reference(&self, user_id: &str, reference: &str) -> StateResponse<Option<Task>> {
        let user_id = user_id.to_string();
        let reference = reference.to_string();
        self.send(|reply| StateCommand::FindTaskByReference {
            user_id,
            reference,
            reply,
        })
        .await
    }

    pub async fn save_resumption(&self, snapshot: ResumptionSnapshot) -> StateResponse<()> {
        self.send(|reply| StateCommand::SaveResumption { snapshot, reply }).await
    }

    pub async fn get_resumption(&self, task_id: &str) -> StateResponse<Option<ResumptionSnapshot>> {
        let task_id = task_id.to_string();
        self.send(|reply| StateCommand::GetResumption { task_id, reply }).await
    }

    pub async fn delete_resumption(&self, task_id: &str) -> StateResponse<()> {
        let task_id = task_id.to_string();
        self.send(|reply| StateCommand::DeleteResumption { task_id, reply }).await
    }

    pub async fn save_optimizer_state(&self, task_id: &str, state: serde_json::Value) -> StateResponse<()> {
        let task_id = task_id.to_string();
        self.send(|reply| StateCommand::SaveOptimizerState { task_id, state, reply })
            .await
    }

    pub async fn load_optimizer_state(&self, task_id: &str) -> StateResponse<Option<serde_json::Value>> {
        let task_id = task_id.to_string();
        self.send(|reply| StateCommand::LoadOptimizerState { task_id, reply }).await
    }

    /// Request the actor to stop after draining queued commands
    pub async fn shutdown(&self) {
        let _ = self.tx.send(StateCommand::Shutdown).await;
    }
}

async fn run_actor(store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    info!("StateManager: actor started");
    while let Some(command) = rx.recv().await {
        match command {
            StateCommand::CreateTask { task, reply } => {
                let _ = reply.send(create_task(&store, task));
            }
            StateCommand::GetTask { id, reply } => {
                let _ = reply.send(store.get::<Task>(&id).map_err(Into::into));
            }
            StateCommand::UpdateTask { mut task, reply } => {
                task.updated_at = now_ms();
                let _ = reply.send(store.put(&task).map_err(Into::into));
            }
            StateCommand::TransitionTask { id, to, reply } => {
                let _ = reply.send(transition(&store, &id, to));
            }
            StateCommand::CompleteTask { id, result, reply } => {
                let outcome = transition(&store, &id, TaskStatus::Completed).and_then(|mut task| {
                    task.result = result;
                    task.updated_at = now_ms();
                    store.put(&task).map_err(Into::into)
                });
                let _ = reply.send(outcome);
            }
            StateCommand::FailTask { id, error, reply } => {
                let outcome = transition(&store, &id, TaskStatus::Failed).and_then(|mut task| {
                    task.error = Some(error);
                    task.updated_at = now_ms();
                    store.put(&task).map_err(Into::into)
                });
                let _ = reply.send(outcome);
            }
            StateCommand::ListTasks {
                user_filter,
                status_filter,
                reply,
            } => {
                let mut filters: Vec<(&str, IndexValue)> = Vec::new();
                if let Some(user) = &user_filter {
                    filters.push(("user_id", IndexValue::Text(user.clone())));
                }
                if let Some(status) = status_filter {
                    filters.push(("status", IndexValue::Text(status.to_string())));
                }
                let _ = reply.send(store.list::<Task>(&filters).map_err(Into::into));
            }
            StateCommand::AddComment { id, text, reply } => {
                let outcome = match store.get::<Task>(&id) {
                    Ok(Some(mut task)) => {
                        task.add_comment(text);
                        store.put(&task).map_err(Into::into)
                    }
                    Ok(None) => Err(StateError::NotFound(id)),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(outcome);
            }
            StateCommand::FindTaskByReference {
                user_id,
                reference,
                reply,
            } => {
                let outcome = store
                    .list::<Task>(&[("user_id", IndexValue::Text(user_id))])
                    .map(|tasks| best_reference_match(tasks, &reference))
                    .map_err(Into::into);
                let _ = reply.send(outcome);
            }
            StateCommand::SaveResumption { snapshot, reply } => {
                let _ = reply.send(store.put(&snapshot).map_err(Into::into));
            }
            StateCommand::GetResumption { task_id, reply } => {
                let _ = reply.send(store.get::<ResumptionSnapshot>(&task_id).map_err(Into::into));
            }
            StateCommand::DeleteResumption { task_id, reply } => {
                let _ = reply.send(
                    store
                        .delete::<ResumptionSnapshot>(&task_id)
                        .map(|_| ())
                        .map_err(Into::into),
                );
            }
            StateCommand::SaveOptimizerState { task_id, state, reply } => {
                let _ = reply.send(
                    store
                        .put_value(OPTIMIZER_STATE_COLLECTION, &task_id, &state)
                        .map_err(Into::into),
                );
            }
            StateCommand::LoadOptimizerState { task_id, reply } => {
                let _ = reply.send(
                    store
                        .get_value(OPTIMIZER_STATE_COLLECTION, &task_id)
                        .map_err(Into::into),
                );
            }
            StateCommand::Shutdown => {
                debug!("StateManager: shutdown requested");
                break;
            }
        }
    }
    info!("StateManager: actor stopped");
}

fn create_task(store: &Store, task: Task) -> StateResponse<String> {
    if store.get::<Task>(&task.task_id)?.is_some() {
        return Err(StateError::Duplicate(task.task_id));
    }
    let id = task.task_id.clone();
    store.put(&task)?;
    debug!(task_id = %id, "StateManager: task created");
    Ok(id)
}

fn transition(store: &Store, id: &str, to: TaskStatus) -> StateResponse<Task> {
    let mut task = store
        .get::<Task>(id)?
        .ok_or_else(|| StateError::NotFound(id.to_string()))?;

    if !task.status.can_transition_to(to) {
        warn!(task_id = %id, from = %task.status, to = %to, "StateManager: illegal transition rejected");
        return Err(StateError::InvalidTransition {
            task_id: id.to_string(),
            from: task.status,
            to,
        });
    }

    task.status = to;
    task.updated_at = now_ms();
    store.put(&task)?;
    debug!(task_id = %id, to = %to, "StateManager: transitioned");
    Ok(task)
}

/// Keyword-overlap scoring between a reference phrase and task descriptions
fn best_reference_match(tasks: Vec<Task>, reference: &str) -> Option<Task> {
    let word = Regex::new(r"[\w]+").expect("static regex");
    let needles: Vec<String> = word
        .find_iter(&reference.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect();
    if needles.is_empty() {
        return None;
    }

    let mut best: Option<(usize, Task)> = None;
    for task in tasks {
        let haystack = task.description.to_lowercase();
        let score = needles.iter().filter(|n| haystack.contains(n.as_str())).count();
        if score > 0 && best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
            best = Some((score, task));
        }
    }
    best.map(|(_, task)| task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ParamMap;

    fn manager() -> StateManager {
        StateManager::spawn(Store::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let state = manager();
        let task = Task::new("trace-1", "u1", "run weekly report");
        let id = state.create_task(task.clone()).await.unwrap();
        assert_eq!(id, task.task_id);

        let loaded = state.get_task(&id).await.unwrap().unwrap();
        assert_eq!(loaded.description, "run weekly report");
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let state = manager();
        let task = Task::new("trace-1", "u1", "once");
        state.create_task(task.clone()).await.unwrap();
        assert!(matches!(
            state.create_task(task).await,
            Err(StateError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_transition_enforced() {
        let state = manager();
        let task = Task::new("trace-1", "u1", "x");
        let id = state.create_task(task).await.unwrap();

        state.transition_task(&id, TaskStatus::Running).await.unwrap();
        state.complete_task(&id, Some(serde_json::json!("done"))).await.unwrap();

        // Terminal: further execution transitions are StateErrors
        let err = state.transition_task(&id, TaskStatus::Running).await.unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));

        let loaded = state.get_task(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.result, Some(serde_json::json!("done")));
    }

    #[tokio::test]
    async fn test_status_read_after_commit() {
        let state = manager();
        let id = state.create_task(Task::new("t", "u1", "x")).await.unwrap();
        state.transition_task(&id, TaskStatus::Running).await.unwrap();
        state.fail_task(&id, "remote exploded").await.unwrap();

        let loaded = state.get_task(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("remote exploded"));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let state = manager();
        state.create_task(Task::new("t", "alice", "a")).await.unwrap();
        state.create_task(Task::new("t", "alice", "b")).await.unwrap();
        state.create_task(Task::new("t", "bob", "c")).await.unwrap();

        let alices = state.list_tasks(Some("alice".into()), None).await.unwrap();
        assert_eq!(alices.len(), 2);

        let created = state
            .list_tasks(Some("alice".into()), Some(TaskStatus::Created))
            .await
            .unwrap();
        assert_eq!(created.len(), 2);

        let running = state
            .list_tasks(Some("alice".into()), Some(TaskStatus::Running))
            .await
            .unwrap();
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn test_comments_append() {
        let state = manager();
        let id = state.create_task(Task::new("t", "u1", "x")).await.unwrap();
        state.add_comment(&id, "first").await.unwrap();
        state.add_comment(&id, "second").await.unwrap();

        let loaded = state.get_task(&id).await.unwrap().unwrap();
        let texts: Vec<&str> = loaded.comments.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_find_by_reference() {
        let state = manager();
        state
            .create_task(Task::new("t", "u1", "generate the weekly sales report"))
            .await
            .unwrap();
        state
            .create_task(Task::new("t", "u1", "clean up stale product images"))
            .await
            .unwrap();

        let found = state
            .find_task_by_reference("u1", "the weekly report one")
            .await
            .unwrap()
            .unwrap();
        assert!(found.description.contains("weekly sales report"));

        let none = state.find_task_by_reference("u1", "quarterly forecast").await.unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_resumption_lifecycle() {
        let state = manager();
        let snapshot = ResumptionSnapshot::new("T2", "http", ParamMap::new(), vec!["sku".into()], "Please provide: sku");
        state.save_resumption(snapshot.clone()).await.unwrap();

        let loaded = state.get_resumption("T2").await.unwrap().unwrap();
        assert_eq!(loaded.missing_params, vec!["sku".to_string()]);

        state.delete_resumption("T2").await.unwrap();
        assert!(state.get_resumption("T2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_optimizer_state_blob() {
        let state = manager();
        let blob = serde_json::json!({"best_score": 0.9});
        state.save_optimizer_state("L1", blob.clone()).await.unwrap();
        assert_eq!(state.load_optimizer_state("L1").await.unwrap(), Some(blob));
        assert!(state.load_optimizer_state("L2").await.unwrap().is_none());
    }
}
