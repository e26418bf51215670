//! LlmClient trait definition

use async_trait::async_trait;

use super::{LlmError, LlmRequest, extract_json};

/// Stateless LLM client - each call is independent
///
/// The engine never threads conversation history through this interface;
/// every call site renders a complete prompt and declares its own output
/// contract (free text or strict JSON).
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one completion request and return the raw text
    async fn complete(&self, request: LlmRequest) -> Result<String, LlmError>;

    /// Complete and parse the output as JSON
    ///
    /// Tolerates prose or code fences around the JSON payload.
    async fn complete_json(&self, request: LlmRequest) -> Result<serde_json::Value, LlmError> {
        let text = self.complete(request).await?;
        extract_json(&text)
    }
}

#[cfg(test)]
pub mod mock {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Scripted LLM client for unit tests
    ///
    /// Responses are matched by prompt substring first, then consumed from
    /// a sequential queue; when both are exhausted the default response is
    /// returned (or an error if none is set).
    pub struct MockLlm {
        keyed: Mutex<Vec<(String, String)>>,
        queue: Mutex<Vec<String>>,
        default: Option<String>,
        call_count: AtomicUsize,
    }

    impl MockLlm {
        pub fn new() -> Self {
            Self {
                keyed: Mutex::new(Vec::new()),
                queue: Mutex::new(Vec::new()),
                default: None,
                call_count: AtomicUsize::new(0),
            }
        }

        /// Respond with `response` whenever the prompt contains `needle`
        pub fn on(self, needle: impl Into<String>, response: impl Into<String>) -> Self {
            self.keyed.lock().unwrap().push((needle.into(), response.into()));
            self
        }

        /// Queue a response for the next otherwise-unmatched call
        pub fn then(self, response: impl Into<String>) -> Self {
            self.queue.lock().unwrap().push(response.into());
            self
        }

        /// Fallback response for unmatched calls
        pub fn default_response(mut self, response: impl Into<String>) -> Self {
            self.default = Some(response.into());
            self
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    impl Default for MockLlm {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        async fn complete(&self, request: LlmRequest) -> Result<String, LlmError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);

            let haystack = format!("{}\n{}", request.system, request.prompt);
            for (needle, response) in self.keyed.lock().unwrap().iter() {
                if haystack.contains(needle.as_str()) {
                    return Ok(response.clone());
                }
            }

            let mut queue = self.queue.lock().unwrap();
            if !queue.is_empty() {
                return Ok(queue.remove(0));
            }

            self.default
                .clone()
                .ok_or_else(|| LlmError::InvalidResponse("MockLlm: no scripted response".to_string()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_keyed_responses() {
            let llm = MockLlm::new()
                .on("classify", r#"{"operation_type": "new_task"}"#)
                .default_response("fallback");

            let out = llm
                .complete(LlmRequest::new("", "please classify this"))
                .await
                .unwrap();
            assert!(out.contains("new_task"));

            let out = llm.complete(LlmRequest::new("", "something else")).await.unwrap();
            assert_eq!(out, "fallback");
            assert_eq!(llm.call_count(), 2);
        }

        #[tokio::test]
        async fn test_sequential_queue() {
            let llm = MockLlm::new().then("first").then("second");
            assert_eq!(llm.complete(LlmRequest::default()).await.unwrap(), "first");
            assert_eq!(llm.complete(LlmRequest::default()).await.unwrap(), "second");
            assert!(llm.complete(LlmRequest::default()).await.is_err());
        }

        #[tokio::test]
        async fn test_complete_json() {
            let llm = MockLlm::new().default_response("```json\n{\"ok\": true}\n```");
            let value = llm.complete_json(LlmRequest::default()).await.unwrap();
            assert_eq!(value["ok"], true);
        }
    }
}
