//! Identifier generation

/// Allocate a new task id
pub fn new_task_id() -> String {
    meshstore::generate_id("task")
}

/// Allocate a new trace id (correlates a root task with its subtasks and retries)
pub fn new_trace_id() -> String {
    meshstore::generate_id("trace")
}
