//! Persistent state management
//!
//! A [`StateManager`] actor owns the meshstore store; every other component
//! talks to it through a cloned handle. Status transitions are validated
//! here, making the state manager the single gate for the task lifecycle
//! DAG.

mod manager;
mod messages;

pub use manager::StateManager;
pub use messages::{StateCommand, StateError, StateResponse};
