//! LLM provider boundary.
//!
//! The control plane never speaks to a model API directly; role nodes go
//! through [`CompletionClient`]. Concrete providers live outside this crate.
//! [`ScriptedClient`] serves tests and smoke runs with canned, per-node
//! response queues.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use sy_core::{CoreError, Result};

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Graph node issuing the call; used for tracing and scripting.
    pub node: String,
    pub system: String,
    pub user: String,
}

impl CompletionRequest {
    pub fn new(
        node: impl Into<String>,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            system: system.into(),
            user: user.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub tokens_used: u64,
}

// ---------------------------------------------------------------------------
// CompletionClient
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion>;
}

// ---------------------------------------------------------------------------
// ScriptedClient
// ---------------------------------------------------------------------------

/// Deterministic client for tests: responses are queued per node name and
/// popped in order. An exhausted queue falls back to the default response,
/// or errors when none is configured.
pub struct ScriptedClient {
    model: String,
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    default_response: Option<String>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            queues: Mutex::new(HashMap::new()),
            default_response: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default(mut self, response: impl Into<String>) -> Self {
        self.default_response = Some(response.into());
        self
    }

    /// Queue responses for a node, consumed in order.
    pub fn script<I, S>(self, node: &str, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut queues = self.queues.lock().unwrap();
            let queue = queues.entry(node.to_string()).or_default();
            for response in responses {
                queue.push_back(response.into());
            }
        }
        self
    }

    /// Requests observed so far, in call order.
    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, node: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.node == node)
            .count()
    }
}

#[async_trait::async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        self.calls.lock().unwrap().push(request.clone());

        let scripted = self
            .queues
            .lock()
            .unwrap()
            .get_mut(&request.node)
            .and_then(|q| q.pop_front());

        let text = match scripted.or_else(|| self.default_response.clone()) {
            Some(text) => text,
            None => {
                return Err(CoreError::Internal(format!(
                    "scripted client: no response queued for node {}",
                    request.node
                )))
            }
        };

        Ok(Completion {
            tokens_used: (text.len() / 4).max(1) as u64,
            text,
            model: self.model.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Response parsing helpers
// ---------------------------------------------------------------------------

/// Extract the value of a `KEY: value` line from a model response.
pub fn field(response: &str, key: &str) -> Option<String> {
    let needle = format!("{key}:");
    for line in response.lines() {
        let line = line.trim().trim_start_matches("##").trim();
        if let Some(rest) = line.strip_prefix(&needle) {
            let value = rest.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Extract the text following a `KEY:` marker up to the next `KEY:`-style
/// section or end of input. Used for multi-line sections like FEEDBACK.
pub fn section(response: &str, key: &str) -> Option<String> {
    let needle = format!("{key}:");
    let start = response.find(&needle)? + needle.len();
    let rest = &response[start..];
    let end = rest
        .lines()
        .scan(0usize, |offset, line| {
            let line_start = *offset;
            *offset += line.len() + 1;
            Some((line_start, line))
        })
        .skip(1)
        .find(|(_, line)| {
            let trimmed = line.trim().trim_start_matches("##").trim();
            trimmed
                .split(':')
                .next()
                .map(|head| {
                    !head.is_empty()
                        && head.len() <= 24
                        && head.chars().all(|c| c.is_ascii_uppercase() || c == '_')
                        && line.contains(':')
                })
                .unwrap_or(false)
        })
        .map(|(offset, _)| offset);

    let body = match end {
        Some(end) => &rest[..end],
        None => rest,
    };
    let body = body.trim();
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

/// Extract the first JSON array embedded in a response.
pub fn json_array(response: &str) -> Option<Vec<serde_json::Value>> {
    let start = response.find('[')?;
    let end = response.rfind(']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Vec<serde_json::Value>>(&response[start..=end]).ok()
}

/// Extract the first JSON object embedded in a response.
pub fn json_object(response: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&response[start..=end]).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_pops_in_order_then_falls_back() {
        let client = ScriptedClient::new("test-model")
            .script("classify", ["first", "second"])
            .with_default("fallback");

        let one = client
            .complete(CompletionRequest::new("classify", "", ""))
            .await
            .unwrap();
        let two = client
            .complete(CompletionRequest::new("classify", "", ""))
            .await
            .unwrap();
        let three = client
            .complete(CompletionRequest::new("classify", "", ""))
            .await
            .unwrap();

        assert_eq!(one.text, "first");
        assert_eq!(two.text, "second");
        assert_eq!(three.text, "fallback");
        assert_eq!(client.calls_for("classify"), 3);
    }

    #[tokio::test]
    async fn scripted_without_default_errors_when_exhausted() {
        let client = ScriptedClient::new("m");
        let err = client
            .complete(CompletionRequest::new("review", "", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Internal(_)));
    }

    #[test]
    fn field_extraction() {
        let response = "ACTION: DELEGATE\nTARGET_ROLE: developer\nREASON: code work";
        assert_eq!(field(response, "ACTION").as_deref(), Some("DELEGATE"));
        assert_eq!(field(response, "TARGET_ROLE").as_deref(), Some("developer"));
        assert_eq!(field(response, "MISSING"), None);
    }

    #[test]
    fn section_spans_lines_until_next_marker() {
        let response = "DECISION: LBTM\nFEEDBACK:\nfix the null check\nhandle empty input\nNEXT: x";
        let feedback = section(response, "FEEDBACK").unwrap();
        assert!(feedback.contains("null check"));
        assert!(feedback.contains("empty input"));
        assert!(!feedback.contains("NEXT"));
    }

    #[test]
    fn json_array_extraction_ignores_prose() {
        let response = "Here is the plan:\n[{\"order\":1,\"task\":\"a\"}]\nDone.";
        let array = json_array(response).unwrap();
        assert_eq!(array.len(), 1);
        assert_eq!(array[0]["order"], 1);
    }

    #[test]
    fn json_object_extraction() {
        let response = "TODOs:\n{\"src/a.ts\": \"unfinished handler\"}";
        let object = json_object(response).unwrap();
        assert_eq!(object["src/a.ts"], "unfinished handler");
    }
}
