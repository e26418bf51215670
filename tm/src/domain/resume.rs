//! Resumption snapshot
//!
//! The persistable half of a paused execution: the materialized parameters
//! and what is still missing. The live half (the executing worker's
//! address) cannot survive a restart and lives in the in-process
//! ResumeStore; after a restart the resume path finds this snapshot, fails
//! the address check, and reports the task as unresumable instead of
//! hanging.

use meshstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::ParamMap;

/// Persisted state of a PAUSED / NEED_INPUT task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumptionSnapshot {
    pub task_id: String,

    /// Capability the worker was executing
    pub capability: String,

    /// Fully materialized parameters at pause time
    pub parameters: ParamMap,

    /// Names of the parameters still required
    pub missing_params: Vec<String>,

    /// Human-readable prompt for the missing parameters
    pub question: String,

    pub saved_at: i64,
}

impl ResumptionSnapshot {
    pub fn new(
        task_id: impl Into<String>,
        capability: impl Into<String>,
        parameters: ParamMap,
        missing_params: Vec<String>,
        question: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            capability: capability.into(),
            parameters,
            missing_params,
            question: question.into(),
            saved_at: now_ms(),
        }
    }
}

impl Record for ResumptionSnapshot {
    fn collection() -> &'static str {
        "resumptions"
    }

    fn id(&self) -> &str {
        &self.task_id
    }

    fn indexes(&self) -> Vec<(&'static str, IndexValue)> {
        vec![("capability", IndexValue::Text(self.capability.clone()))]
    }
}
