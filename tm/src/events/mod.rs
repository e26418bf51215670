//! Lifecycle event streaming
//!
//! Fire-and-forget observability channel. Publishers never wait and never
//! surface errors; the bus is not on the critical path of any task.

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, create_event_bus};
pub use types::{Event, EventLevel, EventType};
