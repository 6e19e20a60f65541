//! Shared run state for graph executions.
//!
//! A [`GraphState`] is a JSON object keyed by well-known names. It is the
//! only thing nodes read and write, and it is what the checkpointer persists
//! at every node boundary, so node-local retry counters live here too —
//! they survive a suspend/resume cycle.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known state keys shared across role graphs.
pub mod keys {
    pub const USER_MESSAGE: &str = "user_message";
    pub const USER_ID: &str = "user_id";
    pub const PROJECT_ID: &str = "project_id";
    pub const TASK_ID: &str = "task_id";
    pub const CONVERSATION_HISTORY: &str = "conversation_history";
    pub const USER_PREFERENCES: &str = "user_preferences";

    pub const ACTION: &str = "action";
    pub const TARGET_ROLE: &str = "target_role";
    pub const REASON: &str = "reason";
    pub const CONFIDENCE: &str = "confidence";
    pub const MESSAGE: &str = "message";
    pub const WIP_BLOCKED: &str = "wip_blocked";

    pub const IMPLEMENTATION_PLAN: &str = "implementation_plan";
    pub const TOTAL_STEPS: &str = "total_steps";
    pub const CURRENT_STEP: &str = "current_step";
    pub const FILES_MODIFIED: &str = "files_modified";
    pub const REVIEW_RESULT: &str = "review_result";
    pub const REVIEW_FEEDBACK: &str = "review_feedback";
    pub const REVIEW_COUNT: &str = "review_count";
    pub const TOTAL_LBTM_COUNT: &str = "total_lbtm_count";
    pub const IS_PASS: &str = "is_pass";
    pub const SUMMARIZE_COUNT: &str = "summarize_count";
    pub const RUN_STATUS: &str = "run_status";
    pub const RUN_STDOUT: &str = "run_stdout";
    pub const RUN_STDERR: &str = "run_stderr";
    pub const DEBUG_COUNT: &str = "debug_count";
    pub const ERROR_ANALYSIS: &str = "error_analysis";

    pub const ERROR: &str = "error";
    pub const RESUME_ANSWER: &str = "resume_answer";
}

// ---------------------------------------------------------------------------
// GraphState
// ---------------------------------------------------------------------------

/// The complete state of one graph run: a typed map keyed by well-known
/// names, checkpointed at each node boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphState(serde_json::Map<String, Value>);

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_u32(&self, key: &str) -> u32 {
        self.0.get(key).and_then(Value::as_u64).unwrap_or(0) as u32
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_array(&self, key: &str) -> Vec<Value> {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Increment a numeric counter key, returning the new value.
    pub fn incr(&mut self, key: &str) -> u32 {
        let next = self.get_u32(key) + 1;
        self.set(key, next);
        next
    }

    /// Append to an array key, creating it when absent.
    pub fn push(&mut self, key: &str, value: impl Into<Value>) {
        let mut items = self.get_array(key);
        items.push(value.into());
        self.set(key, Value::Array(items));
    }

    /// Merge `other`'s entries over this state (other wins on conflicts).
    pub fn merge(&mut self, other: GraphState) {
        for (key, value) in other.0 {
            self.0.insert(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<serde_json::Map<String, Value>> for GraphState {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors() {
        let mut state = GraphState::new();
        state.set(keys::CURRENT_STEP, 3u32);
        state.set(keys::IS_PASS, "YES");
        state.set(keys::WIP_BLOCKED, true);

        assert_eq!(state.get_u32(keys::CURRENT_STEP), 3);
        assert_eq!(state.get_str(keys::IS_PASS), Some("YES"));
        assert!(state.get_bool(keys::WIP_BLOCKED));
        assert_eq!(state.get_u32("missing"), 0);
    }

    #[test]
    fn counters_and_arrays() {
        let mut state = GraphState::new();
        assert_eq!(state.incr(keys::REVIEW_COUNT), 1);
        assert_eq!(state.incr(keys::REVIEW_COUNT), 2);

        state.push(keys::FILES_MODIFIED, "src/login.ts");
        state.push(keys::FILES_MODIFIED, "src/form.tsx");
        assert_eq!(state.get_array(keys::FILES_MODIFIED).len(), 2);
    }

    #[test]
    fn merge_overwrites() {
        let mut base = GraphState::new().with("a", 1).with("b", 1);
        base.merge(GraphState::new().with("b", 2).with("c", 3));
        assert_eq!(base.get_u32("a"), 1);
        assert_eq!(base.get_u32("b"), 2);
        assert_eq!(base.get_u32("c"), 3);
    }

    #[test]
    fn serde_is_transparent() {
        let state = GraphState::new().with(keys::ACTION, "RESPOND");
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"action":"RESPOND"}"#);
        let back: GraphState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
