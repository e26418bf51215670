//! Wire message types
//!
//! JSON with a `msg_type` discriminator. Unknown variants fail to parse
//! and are rejected at the boundary.

use serde::{Deserialize, Serialize};

use crate::domain::ParamMap;

/// Schedule metadata attached to a START_TASK
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScheduleMeta {
    #[serde(default)]
    pub definition_id: Option<String>,
    #[serde(default)]
    pub input_params: ParamMap,
    /// Target agent node; the listener's default applies when absent
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// Inbound queue messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type")]
pub enum WireMessage {
    #[serde(rename = "START_TASK")]
    StartTask {
        task_id: String,
        #[serde(default)]
        trace_id: Option<String>,
        user_input: String,
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        schedule_meta: ScheduleMeta,
    },
    #[serde(rename = "RESUME_TASK")]
    ResumeTask {
        task_id: String,
        #[serde(default)]
        trace_id: Option<String>,
        #[serde(default)]
        task_path: Option<String>,
        #[serde(default)]
        parameters: ParamMap,
        #[serde(default)]
        user_id: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_task_parse() {
        let json = r#"{"msg_type": "START_TASK", "task_id": "T1", "user_input": "run weekly report",
                       "user_id": "u1", "schedule_meta": {"input_params": {"week": "31"}}}"#;
        let msg: WireMessage = serde_json::from_str(json).unwrap();
        match msg {
            WireMessage::StartTask {
                task_id,
                trace_id,
                user_input,
                schedule_meta,
                ..
            } => {
                assert_eq!(task_id, "T1");
                assert!(trace_id.is_none());
                assert_eq!(user_input, "run weekly report");
                assert_eq!(schedule_meta.input_params["week"], "31");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_resume_task_parse() {
        let json = r#"{"msg_type": "RESUME_TASK", "task_id": "T2", "parameters": {"sku": "S1"}}"#;
        let msg: WireMessage = serde_json::from_str(json).unwrap();
        match msg {
            WireMessage::ResumeTask { task_id, parameters, .. } => {
                assert_eq!(task_id, "T2");
                assert_eq!(parameters["sku"], "S1");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_unknown_msg_type_rejected() {
        let json = r#"{"msg_type": "DROP_TABLES", "task_id": "T3"}"#;
        assert!(serde_json::from_str::<WireMessage>(json).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let msg = WireMessage::StartTask {
            task_id: "T1".into(),
            trace_id: Some("trace-1".into()),
            user_input: "hi".into(),
            user_id: Some("u1".into()),
            schedule_meta: ScheduleMeta::default(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""msg_type":"START_TASK""#));
        let parsed: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }
}
