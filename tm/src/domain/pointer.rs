//! Semantic pointer annotations
//!
//! When a parameter arrives as a human description ("current user", "that
//! activity's template"), the context resolver dereferences it against the
//! agent tree. The pointer records how: the chain of nodes visited, the
//! resolved descriptor, and how confident the match was.

use serde::{Deserialize, Serialize};

/// Provenance of one resolved parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticPointer {
    /// Parameter this annotation belongs to
    pub param_name: String,

    /// The description as the user/planner wrote it
    pub original_description: String,

    /// Concrete value, or a more specific description
    pub resolved_description: String,

    /// Match confidence in [0, 1]
    pub confidence: f64,

    /// Node ids visited during resolution, in order
    pub resolution_chain: Vec<String>,

    /// Set when several candidates scored within epsilon of each other
    pub ambiguous: bool,
}

impl SemanticPointer {
    /// An unresolved pointer: the description is passed through with a
    /// marker prefix so downstream consumers can still reason about it.
    pub fn unresolved(param_name: impl Into<String>, description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            param_name: param_name.into(),
            resolved_description: format!("[unresolved] {description}"),
            original_description: description,
            confidence: 0.0,
            resolution_chain: Vec::new(),
            ambiguous: false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.confidence > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_marker() {
        let p = SemanticPointer::unresolved("user_id", "the currently signed-in user");
        assert!(!p.is_resolved());
        assert!(p.resolved_description.starts_with("[unresolved] "));
        assert_eq!(p.original_description, "the currently signed-in user");
    }

    #[test]
    fn test_serde_roundtrip() {
        let p = SemanticPointer {
            param_name: "template_id".into(),
            original_description: "that activity's poster template".into(),
            resolved_description: "tpl_881".into(),
            confidence: 0.8,
            resolution_chain: vec!["marketing".into(), "campaigns".into(), "templates".into()],
            ambiguous: false,
        };
        let json = serde_json::to_string(&p).unwrap();
        let parsed: SemanticPointer = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, p);
    }
}
