//! HTTP connector capability

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use crate::domain::ParamMap;

use super::{Capability, CapabilityError};

/// Generic HTTP connector
///
/// Parameters: `url` (required), `method` (GET/POST/PUT/DELETE, default
/// GET), `headers` (object), `data` (body for POST/PUT, query for GET).
/// JSON responses are parsed; anything else comes back as
/// `{"text": ..., "status_code": ...}`.
pub struct HttpCapability {
    http: Client,
    timeout: Duration,
}

impl HttpCapability {
    pub fn new(timeout: Duration) -> Result<Self, CapabilityError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CapabilityError::Remote(e.to_string()))?;
        Ok(Self { http, timeout })
    }
}

#[async_trait]
impl Capability for HttpCapability {
    fn name(&self) -> &str {
        "http"
    }

    fn required_params(&self) -> &[&str] {
        &["url"]
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self, params: &ParamMap) -> Result<Value, CapabilityError> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let method = params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let data = body_params(params);

        debug!(%method, %url, "HttpCapability::execute");

        let mut request = match method.as_str() {
            "GET" => {
                let mut req = self.http.get(&url);
                if let Some(Value::Object(query)) = &data {
                    let pairs: Vec<(String, String)> = query
                        .iter()
                        .map(|(k, v)| (k.clone(), value_to_query(v)))
                        .collect();
                    req = req.query(&pairs);
                }
                req
            }
            "POST" => {
                let mut req = self.http.post(&url);
                if let Some(body) = &data {
                    req = req.json(body);
                }
                req
            }
            "PUT" => {
                let mut req = self.http.put(&url);
                if let Some(body) = &data {
                    req = req.json(body);
                }
                req
            }
            "DELETE" => self.http.delete(&url),
            other => {
                return Err(CapabilityError::Unsupported(format!("HTTP method {other}")));
            }
        };

        if let Some(Value::Object(headers)) = params.get("headers") {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key, value);
                }
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| CapabilityError::Remote(e.to_string()))?;

        let status = response.status();
        let status_code = status.as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| CapabilityError::Remote(e.to_string()))?;

        if !status.is_success() {
            return Err(CapabilityError::Remote(format!("HTTP {status_code}: {text}")));
        }

        // Parsed JSON if possible, otherwise text + status
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => Ok(value),
            Err(_) => Ok(json!({"text": text, "status_code": status_code})),
        }
    }
}

/// Body/query payload: an explicit `data` object wins; otherwise every
/// non-reserved, non-internal parameter is the payload.
fn body_params(params: &ParamMap) -> Option<Value> {
    if let Some(data) = params.get("data") {
        return Some(data.clone());
    }
    let filtered: ParamMap = params
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "url" | "method" | "headers") && !key.starts_with('_'))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if filtered.is_empty() {
        None
    } else {
        Some(Value::Object(filtered))
    }
}

fn value_to_query(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
