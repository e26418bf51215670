//! Workflow platform capability
//!
//! Two-phase invocation against a Dify-style workflow platform: optionally
//! fetch the workflow's declared input schema, then POST the run endpoint
//! with the collected inputs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::domain::ParamMap;

use super::{Capability, CapabilityError, param_present};

const WORKFLOW_TIMEOUT: Duration = Duration::from_secs(120);

/// Workflow platform connector
pub struct WorkflowCapability {
    http: Client,
}

impl WorkflowCapability {
    pub fn new() -> Result<Self, CapabilityError> {
        let http = Client::builder()
            .timeout(WORKFLOW_TIMEOUT)
            .build()
            .map_err(|e| CapabilityError::Remote(e.to_string()))?;
        Ok(Self { http })
    }

    /// Fetch the workflow's declared input schema
    async fn fetch_schema(&self, base_url: &str, workflow_id: &str, api_key: &str) -> Result<Value, CapabilityError> {
        let url = format!("{base_url}/v1/workflows/{workflow_id}/parameters");
        debug!(%url, "WorkflowCapability::fetch_schema");

        let response = self
            .http
            .get(&url)
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|e| CapabilityError::Remote(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CapabilityError::Remote(format!(
                "schema fetch returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| CapabilityError::InvalidResponse(e.to_string()))
    }

    async fn run_workflow(
        &self,
        base_url: &str,
        api_key: &str,
        inputs: &Value,
        user: &str,
    ) -> Result<Value, CapabilityError> {
        let url = format!("{base_url}/v1/workflows/run");
        debug!(%url, "WorkflowCapability::run_workflow");

        let payload = json!({
            "inputs": inputs,
            "response_mode": "blocking",
            "user": user,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| CapabilityError::Remote(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Remote(format!("workflow run returned {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| CapabilityError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl Capability for WorkflowCapability {
    fn name(&self) -> &str {
        "workflow"
    }

    fn required_params(&self) -> &[&str] {
        &["api_key", "base_url", "workflow_id"]
    }

    fn timeout(&self) -> Duration {
        WORKFLOW_TIMEOUT
    }

    async fn execute(&self, params: &ParamMap) -> Result<Value, CapabilityError> {
        let api_key = str_param(params, "api_key");
        let base_url = str_param(params, "base_url").trim_end_matches('/').to_string();
        let workflow_id = str_param(params, "workflow_id");
        let user = params
            .get("user")
            .and_then(Value::as_str)
            .unwrap_or("default_user")
            .to_string();
        let mut inputs = workflow_inputs(params);

        // Phase 1: schema discovery, when the binding requests it
        if params.get("needs_schema").and_then(Value::as_bool).unwrap_or(false) {
            match self.fetch_schema(&base_url, &workflow_id, &api_key).await {
                Ok(schema) => {
                    if let Value::Object(ref mut map) = inputs {
                        map.entry("_schema".to_string()).or_insert(schema);
                    }
                }
                Err(e) => warn!(%workflow_id, error = %e, "WorkflowCapability: schema discovery failed, running without it"),
            }
        }

        // Phase 2: run
        let mut result = self.run_workflow(&base_url, &api_key, &inputs, &user).await?;
        if let Value::Object(ref mut map) = result {
            map.entry("workflow_id".to_string())
                .or_insert(Value::String(workflow_id));
        }
        Ok(result)
    }
}

/// Workflow inputs: an explicit `inputs` object wins; otherwise every
/// non-reserved, non-internal parameter becomes a workflow input.
fn workflow_inputs(params: &ParamMap) -> Value {
    if let Some(inputs) = params.get("inputs") {
        return inputs.clone();
    }
    let filtered: ParamMap = params
        .iter()
        .filter(|(key, _)| {
            !matches!(key.as_str(), "api_key" | "base_url" | "workflow_id" | "user" | "needs_schema")
                && !key.starts_with('_')
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Value::Object(filtered)
}

fn str_param(params: &ParamMap, name: &str) -> String {
    params
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[allow(dead_code)]
fn preflight_ok(params: &ParamMap) -> bool {
    ["api_key", "base_url", "workflow_id"]
        .iter()
        .all(|p| param_present(params, p))
}
