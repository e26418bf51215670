//! Data query capability
//!
//! Delegates to a [`DataAccess`] implementation supplied by the embedder;
//! the engine only defines the contract (query string + bind parameters in,
//! row list out).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::domain::ParamMap;

use super::{Capability, CapabilityError};

/// Data-access backend contract
#[async_trait]
pub trait DataAccess: Send + Sync {
    async fn query(&self, query: &str, params: &ParamMap) -> Result<Vec<Value>, CapabilityError>;
}

/// Capability wrapper over a [`DataAccess`] backend
pub struct DataQueryCapability {
    backend: Arc<dyn DataAccess>,
}

impl DataQueryCapability {
    pub fn new(backend: Arc<dyn DataAccess>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Capability for DataQueryCapability {
    fn name(&self) -> &str {
        "data_query"
    }

    fn required_params(&self) -> &[&str] {
        &["query"]
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn execute(&self, params: &ParamMap) -> Result<Value, CapabilityError> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let bind = match params.get("params") {
            Some(Value::Object(map)) => map.clone(),
            _ => ParamMap::new(),
        };

        debug!(%query, "DataQueryCapability::execute");
        let rows = self.backend.query(&query, &bind).await?;
        let row_count = rows.len();
        Ok(json!({"rows": rows, "row_count": row_count}))
    }
}

/// Backend used when no data source is configured; every query fails
/// with a clear message instead of hanging.
pub struct UnconfiguredDataAccess;

#[async_trait]
impl DataAccess for UnconfiguredDataAccess {
    async fn query(&self, query: &str, _params: &ParamMap) -> Result<Vec<Value>, CapabilityError> {
        Err(CapabilityError::Remote(format!(
            "no data access backend configured (query: {query})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticRows(Vec<Value>);

    #[async_trait]
    impl DataAccess for StaticRows {
        async fn query(&self, _query: &str, _params: &ParamMap) -> Result<Vec<Value>, CapabilityError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_query_returns_rows() {
        let cap = DataQueryCapability::new(Arc::new(StaticRows(vec![json!({"id": 1}), json!({"id": 2})])));
        let mut params = ParamMap::new();
        params.insert("query".into(), "select * from t".into());

        let out = cap.execute(&params).await.unwrap();
        assert_eq!(out["row_count"], 2);
        assert_eq!(out["rows"][1]["id"], 2);
    }

    #[tokio::test]
    async fn test_unconfigured_backend_errors() {
        let cap = DataQueryCapability::new(Arc::new(UnconfiguredDataAccess));
        let mut params = ParamMap::new();
        params.insert("query".into(), "select 1".into());
        assert!(matches!(cap.execute(&params).await, Err(CapabilityError::Remote(_))));
    }
}
