//! Event Bus - pub/sub channel for engine lifecycle events
//!
//! Built on a tokio broadcast channel. Components emit events through an
//! [`EventEmitter`] bound to their trace id; consumers (log sinks, external
//! observability bridges) subscribe. Emission never blocks and never fails:
//! with no subscribers the event is dropped, and a full channel drops the
//! oldest events first.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{Event, EventLevel, EventType};

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Central event bus
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers (fire-and-forget)
    pub fn emit(&self, event: Event) {
        debug!(event_type = event.event_type.as_str(), trace_id = %event.trace_id, "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Create an emitter bound to a trace id and source component
    pub fn emitter_for(&self, trace_id: impl Into<String>, source: impl Into<String>) -> EventEmitter {
        EventEmitter {
            tx: self.tx.clone(),
            trace_id: trace_id.into(),
            source: source.into(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Handle for components to emit events without owning the bus
///
/// Cheap to clone; carries the trace id and source so call sites only
/// supply the event type and payload.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<Event>,
    trace_id: String,
    source: String,
}

impl EventEmitter {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Re-bind the emitter to a different source component
    pub fn for_source(&self, source: impl Into<String>) -> EventEmitter {
        EventEmitter {
            tx: self.tx.clone(),
            trace_id: self.trace_id.clone(),
            source: source.into(),
        }
    }

    /// Emit an event with an info level
    pub fn emit(&self, event_type: EventType, data: Value) {
        let _ = self
            .tx
            .send(Event::new(self.trace_id.clone(), event_type, self.source.clone(), data));
    }

    /// Emit an event with an explicit level
    pub fn emit_level(&self, event_type: EventType, level: EventLevel, data: Value) {
        let event = Event::new(self.trace_id.clone(), event_type, self.source.clone(), data).with_level(level);
        let _ = self.tx.send(event);
    }

    /// Emit a warning-level event
    pub fn warn(&self, event_type: EventType, data: Value) {
        self.emit_level(event_type, EventLevel::Warning, data);
    }

    /// Emit an error-level event
    pub fn error(&self, event_type: EventType, data: Value) {
        self.emit_level(event_type, EventLevel::Error, data);
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}
