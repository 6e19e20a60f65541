//! Response and log parsing for the developer graph.
//!
//! Model responses follow line-oriented formats (DECISION:, IS_PASS:, plan
//! JSON); test logs are classified with plain string heuristics. Parsers
//! default to the permissive outcome so a malformed response degrades the
//! run instead of aborting it.

use serde::{Deserialize, Serialize};

use crate::provider::{field, json_array, json_object, section};

// ---------------------------------------------------------------------------
// Plan steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub order: u32,
    pub task: String,
    #[serde(default)]
    pub description: String,
    pub file_path: String,
    /// "create" or "modify".
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_action() -> String {
    "create".into()
}

/// Parse an implementation plan from a model response containing a JSON
/// array of steps. Steps missing a file path are dropped.
pub fn parse_plan(response: &str) -> Vec<PlanStep> {
    let Some(values) = json_array(response) else {
        return Vec::new();
    };
    let mut steps = Vec::new();
    for value in values {
        if let Ok(step) = serde_json::from_value::<PlanStep>(value) {
            if !step.file_path.is_empty() {
                steps.push(step);
            }
        }
    }
    steps.sort_by_key(|s| s.order);
    steps
}

// ---------------------------------------------------------------------------
// Review
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewDecision {
    Lgtm,
    Lbtm,
}

#[derive(Debug, Clone)]
pub struct ReviewVerdict {
    pub decision: ReviewDecision,
    pub feedback: String,
    pub details: String,
}

/// Parse an LGTM/LBTM review response. Defaults to LGTM so a garbled review
/// never wedges the step loop.
pub fn parse_review(response: &str) -> ReviewVerdict {
    let decision = match field(response, "DECISION").as_deref().map(str::to_uppercase) {
        Some(ref d) if d.contains("LBTM") => ReviewDecision::Lbtm,
        _ => ReviewDecision::Lgtm,
    };
    ReviewVerdict {
        decision,
        feedback: section(response, "FEEDBACK").unwrap_or_default(),
        details: section(response, "REVIEW").unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Summarize
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SummarizeVerdict {
    pub summary: String,
    pub is_pass: bool,
    /// file path -> issue description.
    pub todos: serde_json::Map<String, serde_json::Value>,
    pub feedback: String,
}

/// Parse the whole-implementation review. Defaults to pass.
pub fn parse_summarize(response: &str) -> SummarizeVerdict {
    let is_pass = !matches!(
        field(response, "IS_PASS").as_deref().map(str::to_uppercase),
        Some(ref v) if v.contains("NO")
    );
    SummarizeVerdict {
        summary: section(response, "SUMMARY").unwrap_or_default(),
        is_pass,
        todos: if is_pass {
            serde_json::Map::new()
        } else {
            json_object(response).unwrap_or_default()
        },
        feedback: section(response, "FEEDBACK").unwrap_or_default(),
    }
}

/// Turn summarize TODOs into targeted fix steps re-entering the implement
/// loop.
pub fn fix_steps_from_todos(todos: &serde_json::Map<String, serde_json::Value>) -> Vec<PlanStep> {
    let mut steps = Vec::new();
    for (file_path, issue) in todos {
        let issue = issue.as_str().unwrap_or("unspecified issue");
        steps.push(PlanStep {
            order: steps.len() as u32 + 1,
            task: format!("Fix issue in {file_path}: {issue}"),
            description: format!("Fix: {issue}"),
            file_path: file_path.clone(),
            action: "modify".into(),
            dependencies: Vec::new(),
        });
    }
    steps
}

// ---------------------------------------------------------------------------
// Run failure classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    TestError,
    SourceError,
    ImportError,
    ConfigError,
    Unfixable,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TestError => "TEST_ERROR",
            ErrorClass::SourceError => "SOURCE_ERROR",
            ErrorClass::ImportError => "IMPORT_ERROR",
            ErrorClass::ConfigError => "CONFIG_ERROR",
            ErrorClass::Unfixable => "UNFIXABLE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "TEST_ERROR" => Some(ErrorClass::TestError),
            "SOURCE_ERROR" => Some(ErrorClass::SourceError),
            "IMPORT_ERROR" => Some(ErrorClass::ImportError),
            "CONFIG_ERROR" => Some(ErrorClass::ConfigError),
            "UNFIXABLE" => Some(ErrorClass::Unfixable),
            _ => None,
        }
    }
}

/// Structural triage of a failed run log, ahead of any model call. Returns
/// the class and, for import errors, the missing module name.
pub fn classify_run_failure(logs: &str) -> (ErrorClass, Option<String>) {
    for line in logs.lines() {
        for marker in ["Cannot find module", "Module not found", "Can't resolve"] {
            if let Some(rest) = line.split(marker).nth(1) {
                let module = rest
                    .chars()
                    .skip_while(|c| *c == ' ' || *c == ':' || *c == '\'' || *c == '"')
                    .take_while(|c| *c != '\'' && *c != '"' && !c.is_whitespace())
                    .collect::<String>();
                if !module.is_empty() {
                    return (ErrorClass::ImportError, Some(module));
                }
                return (ErrorClass::ImportError, None);
            }
        }
    }

    let lowered = logs.to_lowercase();
    if lowered.contains("expected") && (lowered.contains("received") || lowered.contains("assert"))
    {
        return (ErrorClass::TestError, None);
    }
    if lowered.contains("tsconfig") || lowered.contains("configuration") || lowered.contains(".env")
    {
        return (ErrorClass::ConfigError, None);
    }
    if lowered.contains("error") {
        return (ErrorClass::SourceError, None);
    }
    (ErrorClass::Unfixable, None)
}

/// Keep only the signal lines of a noisy run log, bounded.
pub fn clean_logs(logs: &str, max_lines: usize) -> String {
    const NOISE: [&str; 4] = ["npm WARN", "Compiling", "Compiled", "webpack"];
    const IMPORTANT: [&str; 7] = ["Error", "error", "FAIL", "TypeError", "Cannot", "Expected", "assert"];

    let filtered: Vec<&str> = logs
        .lines()
        .filter(|line| {
            !NOISE.iter().any(|n| line.contains(n))
                && IMPORTANT.iter().any(|i| line.contains(i))
        })
        .take(max_lines)
        .collect();

    if filtered.is_empty() {
        logs.chars().take(2000).collect()
    } else {
        filtered.join("\n")
    }
}

// ---------------------------------------------------------------------------
// Error analysis response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ErrorAnalysis {
    pub error_type: ErrorClass,
    pub file_to_fix: String,
    pub root_cause: String,
    pub should_continue: bool,
    pub fix_steps: Vec<PlanStep>,
}

/// Parse the model's triage of a run failure.
pub fn parse_error_analysis(response: &str) -> ErrorAnalysis {
    let error_type = field(response, "ERROR_TYPE")
        .and_then(|s| ErrorClass::parse(&s))
        .unwrap_or(ErrorClass::SourceError);
    let should_continue = field(response, "SHOULD_CONTINUE")
        .map(|s| s.to_uppercase().contains("TRUE") || s.to_uppercase().contains("YES"))
        .unwrap_or(error_type != ErrorClass::Unfixable);

    ErrorAnalysis {
        error_type,
        file_to_fix: field(response, "FILE_TO_FIX").unwrap_or_default(),
        root_cause: field(response, "ROOT_CAUSE").unwrap_or_default(),
        should_continue,
        fix_steps: parse_plan(response),
    }
}

// ---------------------------------------------------------------------------
// Story content
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct StoryContent {
    pub story_id: String,
    pub title: String,
    pub content: String,
    pub acceptance_criteria: Vec<String>,
}

/// Parse a story payload: structured JSON first, falling back to plain text
/// with an "acceptance criteria" section of bulleted lines.
pub fn parse_story_content(raw: &str, fallback_id: &str) -> StoryContent {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
        if let Some(map) = value.as_object() {
            let criteria = map
                .get("acceptance_criteria")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|i| i.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            return StoryContent {
                story_id: map
                    .get("story_id")
                    .or_else(|| map.get("id"))
                    .and_then(|v| v.as_str())
                    .unwrap_or(fallback_id)
                    .to_string(),
                title: map
                    .get("title")
                    .or_else(|| map.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("Untitled Story")
                    .to_string(),
                content: map
                    .get("content")
                    .or_else(|| map.get("description"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                acceptance_criteria: criteria,
            };
        }
    }

    let lines: Vec<&str> = raw.lines().collect();
    let title = lines.first().map(|l| l.trim()).unwrap_or("Untitled Story");

    let mut criteria = Vec::new();
    let mut in_criteria = false;
    for line in &lines {
        let lowered = line.to_lowercase();
        if lowered.contains("acceptance criteria") || lowered.starts_with("ac:") {
            in_criteria = true;
            continue;
        }
        if in_criteria {
            let trimmed = line.trim();
            if let Some(item) = trimmed
                .strip_prefix('-')
                .or_else(|| trimmed.strip_prefix('*'))
            {
                criteria.push(item.trim().to_string());
            } else if !trimmed.is_empty() {
                criteria.push(trimmed.to_string());
            }
        }
    }

    StoryContent {
        story_id: fallback_id.to_string(),
        title: title.to_string(),
        content: raw.to_string(),
        acceptance_criteria: criteria,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
