//! Small helpers shared by role graph nodes.

use uuid::Uuid;

use sy_graph::{keys, GraphState};

/// Read the project id a run belongs to out of state.
pub(crate) fn project_id_of(state: &GraphState) -> sy_core::Result<Uuid> {
    state
        .get_str(keys::PROJECT_ID)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| sy_core::CoreError::Internal("state missing project_id".into()))
}

/// Accumulate LLM token usage in run state so it survives checkpoints and
/// lands in the task result for credit accounting.
pub(crate) fn record_tokens(state: &mut GraphState, tokens: u64) {
    let total = state.get_u32("tokens_used") as u64 + tokens;
    state.set("tokens_used", total as u32);
}

/// Strip a fenced code block from a model response, returning the body; a
/// response without fences is returned as-is.
pub(crate) fn extract_code(response: &str) -> String {
    let Some(open) = response.find("```") else {
        return response.trim().to_string();
    };
    let after_fence = &response[open + 3..];
    // Skip the language tag on the fence line.
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim_end().to_string(),
        None => body.trim_end().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_code_strips_fences() {
        let response = "Here you go:\n```typescript\nexport const x = 1;\n```\nDone.";
        assert_eq!(extract_code(response), "export const x = 1;");
    }

    #[test]
    fn extract_code_passes_plain_text() {
        assert_eq!(extract_code("const y = 2;"), "const y = 2;");
    }
}
