//! Capability registry
//!
//! Name-keyed lookup for capabilities. The daemon validates at startup
//! that every capability the engine routes to is actually registered;
//! a miss there is a configuration error, not a runtime surprise.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{Capability, CapabilityError};

/// Capabilities the engine itself routes to and therefore requires
pub const BUILTIN_CAPABILITIES: [&str; 3] = ["workflow", "http", "data_query"];

/// Name-keyed capability registry
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its own name
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        debug!(name = capability.name(), "CapabilityRegistry::register");
        self.capabilities.insert(capability.name().to_string(), capability);
    }

    /// Look up a capability
    pub fn get(&self, name: &str) -> Result<Arc<dyn Capability>, CapabilityError> {
        self.capabilities
            .get(name)
            .cloned()
            .ok_or_else(|| CapabilityError::NotRegistered(name.to_string()))
    }

    pub fn has(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    /// Startup check: every required capability must be present
    pub fn validate(&self, required: &[&str]) -> Result<(), CapabilityError> {
        for name in required {
            if !self.has(name) {
                return Err(CapabilityError::NotRegistered((*name).to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::FnCapability;
    use serde_json::Value;

    fn noop(name: &str) -> Arc<dyn Capability> {
        Arc::new(FnCapability::new(name, |_| Ok(Value::Null)))
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = CapabilityRegistry::new();
        registry.register(noop("http"));

        assert!(registry.has("http"));
        assert!(registry.get("http").is_ok());
        assert!(matches!(
            registry.get("workflow"),
            Err(CapabilityError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_validate_fails_loudly() {
        let mut registry = CapabilityRegistry::new();
        registry.register(noop("http"));

        assert!(registry.validate(&["http"]).is_ok());
        let err = registry.validate(&BUILTIN_CAPABILITIES).unwrap_err();
        assert!(matches!(err, CapabilityError::NotRegistered(_)));
    }

    #[test]
    fn test_names_sorted() {
        let mut registry = CapabilityRegistry::new();
        registry.register(noop("workflow"));
        registry.register(noop("http"));
        assert_eq!(registry.names(), vec!["http", "workflow"]);
    }
}
