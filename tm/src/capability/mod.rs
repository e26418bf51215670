//! Execution capabilities
//!
//! One interface per way of touching the outside world (workflow platform,
//! HTTP endpoint, data query, embedder-registered functions), resolved
//! through a small registry keyed by name. Acquiring a missing capability
//! fails loudly at startup, not mid-flight.

mod data;
mod http;
mod registry;
mod workflow;

pub use data::{DataAccess, DataQueryCapability, UnconfiguredDataAccess};
pub use http::HttpCapability;
pub use registry::{BUILTIN_CAPABILITIES, CapabilityRegistry};
pub use workflow::WorkflowCapability;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::ParamMap;

/// Errors from capability execution
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("Capability not registered: {0}")]
    NotRegistered(String),

    #[error("Remote call failed: {0}")]
    Remote(String),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid remote response: {0}")]
    InvalidResponse(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// A single way of performing an external call
#[async_trait]
pub trait Capability: Send + Sync {
    /// Registry key, e.g. "workflow", "http", "data_query"
    fn name(&self) -> &str;

    /// Parameters that must be present and non-empty before execution
    fn required_params(&self) -> &[&str] {
        &[]
    }

    /// Wall-clock budget for one call
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Perform the call
    async fn execute(&self, params: &ParamMap) -> Result<Value, CapabilityError>;
}

/// Closure-backed capability
///
/// The extension point for embedder-registered ("named") capabilities, and
/// handy as a test double.
pub struct FnCapability {
    name: String,
    required: Vec<&'static str>,
    timeout: Duration,
    #[allow(clippy::type_complexity)]
    handler: Box<dyn Fn(&ParamMap) -> Result<Value, CapabilityError> + Send + Sync>,
}

impl FnCapability {
    pub fn new(
        name: impl Into<String>,
        handler: impl Fn(&ParamMap) -> Result<Value, CapabilityError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            required: Vec::new(),
            timeout: Duration::from_secs(30),
            handler: Box::new(handler),
        }
    }

    pub fn with_required(mut self, required: Vec<&'static str>) -> Self {
        self.required = required;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Capability for FnCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_params(&self) -> &[&str] {
        &self.required
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self, params: &ParamMap) -> Result<Value, CapabilityError> {
        (self.handler)(params)
    }
}

/// Whether a parameter value counts as supplied
///
/// Missing keys, nulls, and empty strings all count as absent.
pub fn param_present(params: &ParamMap, name: &str) -> bool {
    match params.get(name) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}
