//! Developer agent: story-driven code authoring.
//!
//! The graph plans, implements one step per pass, gates each step behind an
//! LGTM/LBTM review, sweeps the whole change set for leftovers, runs the
//! project tests, and triages failures with a bounded debug loop:
//!
//! `analyze_and_plan -> implement -> review -> (implement | summarize)
//!  -> (implement | validate | respond) -> (respond | analyze_error)`

pub mod parsers;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sy_core::store::ProjectStore;
use sy_core::types::{AgentRole, TaskContext, TaskResult, TaskType};
use sy_graph::{
    keys, node, router, Graph, GraphExecutor, GraphState, InMemoryCheckpointer, NodeCtx,
    NodeOutcome, RunOutcome, END, START,
};

use crate::handler::{AgentHandler, ProgressSink};
use crate::provider::{CompletionClient, CompletionRequest};
use crate::util::{extract_code, record_tokens};
use parsers::{
    classify_run_failure, clean_logs, fix_steps_from_todos, parse_error_analysis, parse_plan,
    parse_review, parse_story_content, parse_summarize, ErrorClass, PlanStep, ReviewDecision,
};

// ---------------------------------------------------------------------------
// Config & dependencies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DeveloperConfig {
    /// LBTM retries per step before the step is force-accepted.
    pub max_reviews: u32,
    /// Whole-change-set sweep retries.
    pub max_summarize: u32,
    /// Debug loop budget; exceeding it is terminal.
    pub max_debug_attempts: u32,
}

impl Default for DeveloperConfig {
    fn default() -> Self {
        Self {
            max_reviews: 2,
            max_summarize: 2,
            max_debug_attempts: 3,
        }
    }
}

/// Report from a project test run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub passed: bool,
    pub stdout: String,
    pub stderr: String,
}

impl RunReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            stdout: "all tests passed".into(),
            stderr: String::new(),
        }
    }

    pub fn fail(stderr: impl Into<String>) -> Self {
        Self {
            passed: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Boundary to the project's test command. Production runs the real suite in
/// the workspace; tests script outcomes.
#[async_trait::async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, workspace: &Path) -> sy_core::Result<RunReport>;
}

/// Scripted runner popping pre-seeded reports; an empty queue passes.
#[derive(Default)]
pub struct ScriptedRunner {
    reports: Mutex<VecDeque<RunReport>>,
}

impl ScriptedRunner {
    pub fn new<I: IntoIterator<Item = RunReport>>(reports: I) -> Self {
        Self {
            reports: Mutex::new(reports.into_iter().collect()),
        }
    }
}

#[async_trait::async_trait]
impl TestRunner for ScriptedRunner {
    async fn run(&self, _workspace: &Path) -> sy_core::Result<RunReport> {
        Ok(self
            .reports
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(RunReport::pass))
    }
}

struct DevInner {
    client: Arc<dyn CompletionClient>,
    runner: Arc<dyn TestRunner>,
    progress: Arc<dyn ProgressSink>,
    config: DeveloperConfig,
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

const PLAN_SYSTEM_PROMPT: &str = "\
You are a Senior Developer planning the implementation of a user story.
Explore the listed workspace files and produce a step-by-step plan.

Output a JSON array of steps, each:
{\"order\": n, \"task\": \"...\", \"description\": \"...\", \"file_path\": \"relative/path\", \"action\": \"create|modify\", \"dependencies\": []}";

const IMPLEMENT_SYSTEM_PROMPT: &str = "\
You are a Senior Developer implementing exactly one plan step.
Write the COMPLETE content of the target file. No TODOs, no placeholders,
no \"rest of the code\" elisions. Output a single fenced code block.";

const REVIEW_SYSTEM_PROMPT: &str = "\
You are a Senior Code Reviewer. Review the implemented file and decide:
LGTM (approve) or LBTM (request changes).

Criteria: completeness (no TODOs or placeholders), correctness, typing,
imports, framework conventions.

Output format:
DECISION: LGTM|LBTM
REVIEW:
- <points>
FEEDBACK: (only if LBTM)
<specific fixes>";

const SUMMARIZE_SYSTEM_PROMPT: &str = "\
You are a Senior Engineer doing the final sweep over ALL implemented files.
Detect TODOs, incomplete functions, and missing error handling.

Output format:
SUMMARY:
<what was implemented>
IS_PASS: YES|NO
If NO, also output a JSON object mapping file paths to issue descriptions.";

const ANALYZE_ERROR_SYSTEM_PROMPT: &str = "\
You are a Senior Developer triaging a failed test run.

Output format:
ERROR_TYPE: TEST_ERROR|SOURCE_ERROR|IMPORT_ERROR|CONFIG_ERROR|UNFIXABLE
FILE_TO_FIX: <path>
ROOT_CAUSE: <one line>
SHOULD_CONTINUE: true|false
Then a JSON array of fix steps in the plan-step format.";

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

pub fn build_developer_graph(
    client: Arc<dyn CompletionClient>,
    runner: Arc<dyn TestRunner>,
    progress: Arc<dyn ProgressSink>,
    config: DeveloperConfig,
) -> sy_core::Result<Graph> {
    let inner = Arc::new(DevInner {
        client,
        runner,
        progress,
        config,
    });

    let deps = inner.clone();
    let analyze_and_plan = node(move |ctx, state| {
        let deps = deps.clone();
        async move { analyze_and_plan_node(deps, ctx, state).await }
    });

    let deps = inner.clone();
    let implement = node(move |ctx, state| {
        let deps = deps.clone();
        async move { implement_node(deps, ctx, state).await }
    });

    let deps = inner.clone();
    let review = node(move |ctx, state| {
        let deps = deps.clone();
        async move { review_node(deps, ctx, state).await }
    });

    let deps = inner.clone();
    let summarize = node(move |ctx, state| {
        let deps = deps.clone();
        async move { summarize_node(deps, ctx, state).await }
    });

    let deps = inner.clone();
    let validate = node(move |ctx, state| {
        let deps = deps.clone();
        async move { validate_node(deps, ctx, state).await }
    });

    let deps = inner.clone();
    let analyze_error = node(move |ctx, state| {
        let deps = deps.clone();
        async move { analyze_error_node(deps, ctx, state).await }
    });

    let respond = node(|_ctx, mut state: GraphState| async move {
        let message = match state.get_str(keys::ERROR) {
            Some(error) => format!("Implementation stopped: {error}"),
            None => {
                let files = state.get_array(keys::FILES_MODIFIED).len();
                let status = state.get_str(keys::RUN_STATUS).unwrap_or("not run");
                format!(
                    "Implemented \"{}\": {files} file(s) modified, tests {status}.",
                    state.get_str("story_title").unwrap_or("story")
                )
            }
        };
        state.set(keys::MESSAGE, message);
        Ok(NodeOutcome::Next(state))
    });

    let max_reviews = inner.config.max_reviews;
    let max_summarize = inner.config.max_summarize;

    Graph::builder("developer")
        .add_node("analyze_and_plan", analyze_and_plan)
        .add_node("implement", implement)
        .add_node("review", review)
        .add_node("summarize", summarize)
        .add_node("validate", validate)
        .add_node("analyze_error", analyze_error)
        .add_node("respond", respond)
        .add_edge(START, "analyze_and_plan")
        .add_edge("analyze_and_plan", "implement")
        .add_edge("implement", "review")
        .add_router(
            "review",
            router(move |state| {
                // LBTM with retries remaining reworks the same step; review
                // advanced current_step already on acceptance.
                if state.get_str(keys::REVIEW_RESULT) == Some("LBTM")
                    && state.get_u32(keys::REVIEW_COUNT) < max_reviews
                {
                    return "implement".into();
                }
                if state.get_u32(keys::CURRENT_STEP) >= state.get_u32(keys::TOTAL_STEPS) {
                    "summarize".into()
                } else {
                    "implement".into()
                }
            }),
        )
        .add_router(
            "summarize",
            router(move |state| {
                if state.get_str(keys::IS_PASS) == Some("NO") {
                    if state.get_u32(keys::SUMMARIZE_COUNT) < max_summarize {
                        "implement".into()
                    } else {
                        "respond".into()
                    }
                } else {
                    "validate".into()
                }
            }),
        )
        .add_router(
            "validate",
            router(|state| {
                if state.get_str(keys::RUN_STATUS) == Some("PASS") {
                    "respond".into()
                } else {
                    "analyze_error".into()
                }
            }),
        )
        .add_router(
            "analyze_error",
            router(|state| match state.get_str("error_resolution") {
                Some("validate") => "validate".into(),
                Some("implement") => "implement".into(),
                _ => "respond".into(),
            }),
        )
        .add_edge("respond", END)
        .on_error("respond")
        .build()
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

fn plan_of(state: &GraphState) -> Vec<PlanStep> {
    state
        .get_array(keys::IMPLEMENTATION_PLAN)
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect()
}

fn set_plan(state: &mut GraphState, steps: &[PlanStep]) {
    let values: Vec<serde_json::Value> = steps
        .iter()
        .map(|s| serde_json::to_value(s).unwrap_or_default())
        .collect();
    state.set(keys::IMPLEMENTATION_PLAN, serde_json::Value::Array(values));
    state.set(keys::TOTAL_STEPS, steps.len() as u32);
    state.set(keys::CURRENT_STEP, 0u32);
    state.set(keys::REVIEW_COUNT, 0u32);
}

fn workspace_of(state: &GraphState) -> sy_core::Result<PathBuf> {
    state
        .get_str("workspace_path")
        .map(PathBuf::from)
        .ok_or_else(|| sy_core::CoreError::Internal("state missing workspace_path".into()))
}

/// Relative paths of up to `cap` workspace files, skipping vendored trees.
fn list_workspace_files(root: &Path, cap: usize) -> Vec<String> {
    const SKIP: [&str; 4] = ["node_modules", ".git", "target", "dist"];
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            if out.len() >= cap {
                return out;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                if !SKIP.contains(&name.as_str()) {
                    stack.push(path);
                }
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().to_string());
            }
        }
    }
    out.sort();
    out
}

async fn analyze_and_plan_node(
    deps: Arc<DevInner>,
    ctx: NodeCtx,
    mut state: GraphState,
) -> sy_graph::NodeResult {
    ctx.check_cancelled()?;
    let workspace = workspace_of(&state)?;
    let files = list_workspace_files(&workspace, 40);

    let criteria = state
        .get_array("acceptance_criteria")
        .into_iter()
        .filter_map(|v| v.as_str().map(|s| format!("- {s}")))
        .collect::<Vec<_>>()
        .join("\n");
    let user = format!(
        "## Story\n{}\n\n{}\n\n## Acceptance criteria\n{}\n\n## Workspace files\n{}",
        state.get_str("story_title").unwrap_or("Untitled"),
        state.get_str("story_content").unwrap_or(""),
        criteria,
        files.join("\n"),
    );

    let completion = deps
        .client
        .complete(CompletionRequest::new(&ctx.node, PLAN_SYSTEM_PROMPT, user))
        .await?;
    record_tokens(&mut state, completion.tokens_used);

    let steps = parse_plan(&completion.text);
    if steps.is_empty() {
        return Err(sy_core::CoreError::Validation(
            "planner produced no usable steps".into(),
        ));
    }
    tracing::info!(thread = %ctx.thread_id, steps = steps.len(), "implementation plan ready");

    set_plan(&mut state, &steps);
    state.set(keys::FILES_MODIFIED, serde_json::Value::Array(Vec::new()));
    Ok(NodeOutcome::Next(state))
}

async fn implement_node(
    deps: Arc<DevInner>,
    ctx: NodeCtx,
    mut state: GraphState,
) -> sy_graph::NodeResult {
    ctx.check_cancelled()?;
    let plan = plan_of(&state);
    let idx = state.get_u32(keys::CURRENT_STEP) as usize;
    let Some(step) = plan.get(idx) else {
        return Ok(NodeOutcome::Next(state));
    };
    if step.file_path.contains("..") {
        return Err(sy_core::CoreError::Validation(format!(
            "plan step escapes workspace: {}",
            step.file_path
        )));
    }

    let workspace = workspace_of(&state)?;
    let target = workspace.join(&step.file_path);

    // Rework feedback from an LBTM review applies to this same step.
    let feedback = if state.get_str(keys::REVIEW_RESULT) == Some("LBTM") {
        state
            .remove(keys::REVIEW_FEEDBACK)
            .and_then(|v| v.as_str().map(str::to_string))
    } else {
        None
    };

    let existing = if step.action == "modify" && target.exists() {
        tokio::fs::read_to_string(&target).await.unwrap_or_default()
    } else {
        String::new()
    };

    let mut user = format!(
        "## Step {} of {}\n{}\n\n## Target file\n{}",
        idx + 1,
        plan.len(),
        step.task,
        step.file_path,
    );
    if !existing.is_empty() {
        user.push_str(&format!("\n\n## Current content\n```\n{existing}\n```"));
    }
    if let Some(feedback) = feedback {
        user.push_str(&format!("\n\n## Reviewer feedback to address\n{feedback}"));
    }

    let completion = deps
        .client
        .complete(CompletionRequest::new(&ctx.node, IMPLEMENT_SYSTEM_PROMPT, user))
        .await?;
    record_tokens(&mut state, completion.tokens_used);

    ctx.check_cancelled()?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| sy_core::CoreError::Internal(format!("create {parent:?}: {e}")))?;
    }
    tokio::fs::write(&target, extract_code(&completion.text))
        .await
        .map_err(|e| sy_core::CoreError::Internal(format!("write {target:?}: {e}")))?;

    let already_listed = state
        .get_array(keys::FILES_MODIFIED)
        .iter()
        .any(|v| v.as_str() == Some(step.file_path.as_str()));
    if !already_listed {
        state.push(keys::FILES_MODIFIED, step.file_path.clone());
    }

    tracing::info!(thread = %ctx.thread_id, file = %step.file_path, step = idx + 1, "step implemented");
    Ok(NodeOutcome::Next(state))
}

async fn review_node(
    deps: Arc<DevInner>,
    ctx: NodeCtx,
    mut state: GraphState,
) -> sy_graph::NodeResult {
    ctx.check_cancelled()?;
    let plan = plan_of(&state);
    let idx = state.get_u32(keys::CURRENT_STEP) as usize;
    let total = plan.len() as u32;
    let Some(step) = plan.get(idx) else {
        state.set(keys::REVIEW_RESULT, "LGTM");
        return Ok(NodeOutcome::Next(state));
    };

    let workspace = workspace_of(&state)?;
    let target = workspace.join(&step.file_path);

    let verdict = if target.exists() {
        let content = tokio::fs::read_to_string(&target).await.unwrap_or_default();
        let user = format!(
            "## Task completed\n{}\n\n## File: {}\n```\n{}\n```",
            step.task,
            step.file_path,
            content.chars().take(4000).collect::<String>(),
        );
        let completion = deps
            .client
            .complete(CompletionRequest::new(&ctx.node, REVIEW_SYSTEM_PROMPT, user))
            .await?;
        record_tokens(&mut state, completion.tokens_used);
        parse_review(&completion.text)
    } else {
        parsers::ReviewVerdict {
            decision: ReviewDecision::Lbtm,
            feedback: format!("File {} was not created", step.file_path),
            details: String::new(),
        }
    };

    let mut review_count = state.get_u32(keys::REVIEW_COUNT);
    if verdict.decision == ReviewDecision::Lbtm {
        review_count += 1;
        state.incr(keys::TOTAL_LBTM_COUNT);
    }

    // A step is accepted on LGTM, or force-accepted once its retry budget is
    // spent so one stubborn step cannot stall the story.
    let accepted =
        verdict.decision == ReviewDecision::Lgtm || review_count >= deps.config.max_reviews;
    if accepted {
        let current = state.get_u32(keys::CURRENT_STEP) + 1;
        state.set(keys::CURRENT_STEP, current);
        state.set(keys::REVIEW_COUNT, 0u32);
        state.set(keys::REVIEW_RESULT, "LGTM");
        if verdict.decision == ReviewDecision::Lbtm {
            tracing::warn!(thread = %ctx.thread_id, file = %step.file_path, "review budget spent; step force-accepted");
        }

        if total > 0 {
            let pct = ((current as f64 / total as f64) * 100.0).round() as u8;
            if let Some(task_id) = state
                .get_str(keys::TASK_ID)
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                deps.progress
                    .on_progress(task_id, pct, &step.task, current, total);
            }
        }
    } else {
        state.set(keys::REVIEW_COUNT, review_count);
        state.set(keys::REVIEW_RESULT, "LBTM");
        state.set(keys::REVIEW_FEEDBACK, verdict.feedback.clone());
        tracing::info!(thread = %ctx.thread_id, file = %step.file_path, attempt = review_count, "LBTM; reworking step");
    }

    Ok(NodeOutcome::Next(state))
}

async fn summarize_node(
    deps: Arc<DevInner>,
    ctx: NodeCtx,
    mut state: GraphState,
) -> sy_graph::NodeResult {
    ctx.check_cancelled()?;
    let files: Vec<String> = state
        .get_array(keys::FILES_MODIFIED)
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();

    if files.is_empty() {
        state.set(keys::IS_PASS, "YES");
        state.set(keys::SUMMARIZE_COUNT, 0u32);
        return Ok(NodeOutcome::Next(state));
    }

    let workspace = workspace_of(&state)?;
    let mut rendered = Vec::new();
    for file in &files {
        let content = tokio::fs::read_to_string(workspace.join(file))
            .await
            .unwrap_or_else(|_| "[file not found]".into());
        rendered.push(format!(
            "### {file}\n```\n{}\n```",
            content.chars().take(3000).collect::<String>()
        ));
    }

    let user = format!(
        "## Story\n{}\n\n## Files implemented\n{}",
        state.get_str("story_title").unwrap_or(""),
        rendered.join("\n\n"),
    );
    let completion = deps
        .client
        .complete(CompletionRequest::new(&ctx.node, SUMMARIZE_SYSTEM_PROMPT, user))
        .await?;
    record_tokens(&mut state, completion.tokens_used);

    let verdict = parse_summarize(&completion.text);
    if verdict.is_pass {
        state.set(keys::IS_PASS, "YES");
        state.set(keys::SUMMARIZE_COUNT, 0u32);
    } else {
        state.set(keys::IS_PASS, "NO");
        state.incr(keys::SUMMARIZE_COUNT);
        let fix_steps = fix_steps_from_todos(&verdict.todos);
        if !fix_steps.is_empty() {
            tracing::info!(thread = %ctx.thread_id, fixes = fix_steps.len(), "summarize found leftovers; replanning");
            set_plan(&mut state, &fix_steps);
        }
    }
    state.set("summary", verdict.summary);
    Ok(NodeOutcome::Next(state))
}

async fn validate_node(
    deps: Arc<DevInner>,
    ctx: NodeCtx,
    mut state: GraphState,
) -> sy_graph::NodeResult {
    ctx.check_cancelled()?;
    let workspace = workspace_of(&state)?;
    let report = deps.runner.run(&workspace).await?;

    state.set(keys::RUN_STATUS, if report.passed { "PASS" } else { "FAIL" });
    state.set(keys::RUN_STDOUT, report.stdout);
    state.set(keys::RUN_STDERR, report.stderr);
    tracing::info!(thread = %ctx.thread_id, passed = report.passed, "validation run finished");
    Ok(NodeOutcome::Next(state))
}

async fn analyze_error_node(
    deps: Arc<DevInner>,
    ctx: NodeCtx,
    mut state: GraphState,
) -> sy_graph::NodeResult {
    ctx.check_cancelled()?;
    let debug_count = state.incr(keys::DEBUG_COUNT);
    if debug_count > deps.config.max_debug_attempts {
        state.set(
            keys::ERROR,
            format!(
                "debug budget exhausted after {} attempts",
                deps.config.max_debug_attempts
            ),
        );
        state.set("error_resolution", "respond");
        return Ok(NodeOutcome::Next(state));
    }

    let logs = format!(
        "{}\n{}",
        state.get_str(keys::RUN_STDERR).unwrap_or(""),
        state.get_str(keys::RUN_STDOUT).unwrap_or(""),
    );
    let cleaned = clean_logs(&logs, 50);
    let (class, missing_module) = classify_run_failure(&cleaned);

    // Import failures have a mechanical fix: declare the dependency and
    // rerun the suite.
    if class == ErrorClass::ImportError {
        if let Some(module) = &missing_module {
            let workspace = workspace_of(&state)?;
            if auto_fix_import(&workspace, module).await {
                tracing::info!(thread = %ctx.thread_id, module = %module, "missing dependency declared; revalidating");
                state.set(
                    keys::ERROR_ANALYSIS,
                    serde_json::json!({
                        "error_type": class.as_str(),
                        "module": module,
                        "auto_fixed": true,
                    }),
                );
                state.set("error_resolution", "validate");
                return Ok(NodeOutcome::Next(state));
            }
        }
    }

    let files: Vec<String> = state
        .get_array(keys::FILES_MODIFIED)
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    let user = format!(
        "## Structural triage\n{}\n\n## Run log\n{}\n\n## Files modified\n{}",
        class.as_str(),
        cleaned,
        files.join("\n"),
    );
    let completion = deps
        .client
        .complete(CompletionRequest::new(&ctx.node, ANALYZE_ERROR_SYSTEM_PROMPT, user))
        .await?;
    record_tokens(&mut state, completion.tokens_used);

    let analysis = parse_error_analysis(&completion.text);
    state.set(
        keys::ERROR_ANALYSIS,
        serde_json::json!({
            "error_type": analysis.error_type.as_str(),
            "file_to_fix": analysis.file_to_fix,
            "root_cause": analysis.root_cause,
        }),
    );

    if analysis.should_continue && !analysis.fix_steps.is_empty() {
        set_plan(&mut state, &analysis.fix_steps);
        state.set("error_resolution", "implement");
    } else {
        state.set(
            keys::ERROR,
            format!(
                "tests failing ({}): {}",
                analysis.error_type.as_str(),
                if analysis.root_cause.is_empty() {
                    "unrecoverable"
                } else {
                    &analysis.root_cause
                }
            ),
        );
        state.set("error_resolution", "respond");
    }
    Ok(NodeOutcome::Next(state))
}

/// Declare a missing module in the workspace package manifest. Returns true
/// when the manifest was updated.
async fn auto_fix_import(workspace: &Path, module: &str) -> bool {
    let manifest = workspace.join("package.json");
    let Ok(raw) = tokio::fs::read_to_string(&manifest).await else {
        return false;
    };
    let Ok(mut doc) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return false;
    };
    let Some(obj) = doc.as_object_mut() else {
        return false;
    };
    let deps = obj
        .entry("dependencies")
        .or_insert_with(|| serde_json::json!({}));
    let Some(deps) = deps.as_object_mut() else {
        return false;
    };
    deps.insert(module.to_string(), serde_json::json!("latest"));

    match serde_json::to_string_pretty(&doc) {
        Ok(rendered) => tokio::fs::write(&manifest, rendered).await.is_ok(),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// DeveloperAgent
// ---------------------------------------------------------------------------

pub struct DeveloperAgent {
    executor: GraphExecutor,
    projects: ProjectStore,
}

impl DeveloperAgent {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        runner: Arc<dyn TestRunner>,
        progress: Arc<dyn ProgressSink>,
        projects: ProjectStore,
        config: DeveloperConfig,
    ) -> sy_core::Result<Self> {
        let graph = build_developer_graph(client, runner, progress, config)?;
        Ok(Self {
            executor: GraphExecutor::new(Arc::new(graph), Arc::new(InMemoryCheckpointer::new())),
            projects,
        })
    }

    fn result_from(final_state: GraphState) -> TaskResult {
        let message = final_state.get_str(keys::MESSAGE).unwrap_or("").to_string();
        let failed = final_state.contains(keys::ERROR);
        let mut result = if failed {
            TaskResult::failed(final_state.get_str(keys::ERROR).unwrap_or("").to_string())
        } else {
            TaskResult::ok(message.clone())
        };
        result.output = message;
        result = result
            .with_field(
                "files_modified",
                serde_json::Value::Array(final_state.get_array(keys::FILES_MODIFIED)),
            )
            .with_field(
                "plan_steps",
                final_state.get_u32(keys::TOTAL_STEPS).into(),
            )
            .with_field(
                "run_status",
                final_state.get_str(keys::RUN_STATUS).unwrap_or("").into(),
            )
            .with_field("debug_count", final_state.get_u32(keys::DEBUG_COUNT).into())
            .with_field(
                "total_lbtm_count",
                final_state.get_u32(keys::TOTAL_LBTM_COUNT).into(),
            )
            .with_field("tokens_used", final_state.get_u32("tokens_used").into());
        if let Some(analysis) = final_state.get(keys::ERROR_ANALYSIS) {
            result = result.with_field("error_analysis", analysis.clone());
        }
        result
    }
}

#[async_trait::async_trait]
impl AgentHandler for DeveloperAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Developer
    }

    async fn handle_task(&self, task: TaskContext, cancel: CancellationToken) -> TaskResult {
        if task.task_type == TaskType::ResumeWithAnswer {
            let answer = task.effective_answer().unwrap_or("").to_string();
            return match self
                .executor
                .resume(task.task_id, serde_json::json!(answer), cancel)
                .await
            {
                Ok(RunOutcome::Completed(state)) => Self::result_from(state),
                Ok(RunOutcome::Interrupted { reason, .. }) => {
                    TaskResult::ok("").with_field("interrupt", reason.into())
                }
                Ok(RunOutcome::Cancelled(_)) => TaskResult::failed("task cancelled"),
                Err(err) => TaskResult::failed(format!("resume failed: {err}")),
            };
        }

        let story = parse_story_content(&task.content, &task.task_id.to_string());
        let workspace = match self.projects.get(task.project_id) {
            Ok(project) => match project.workspace_path {
                Some(path) => path,
                None => return TaskResult::failed("project has no workspace path"),
            },
            Err(err) => return TaskResult::failed(err.to_string()),
        };

        let state = GraphState::new()
            .with(keys::PROJECT_ID, task.project_id.to_string())
            .with(keys::TASK_ID, task.task_id.to_string())
            .with("story_id", story.story_id.clone())
            .with("story_title", story.title.clone())
            .with("story_content", story.content.clone())
            .with(
                "acceptance_criteria",
                serde_json::Value::Array(
                    story
                        .acceptance_criteria
                        .iter()
                        .map(|c| serde_json::Value::String(c.clone()))
                        .collect(),
                ),
            )
            .with("workspace_path", workspace.to_string_lossy().to_string());

        match self.executor.run(task.task_id, state, cancel).await {
            Ok(RunOutcome::Completed(final_state)) => Self::result_from(final_state),
            Ok(RunOutcome::Interrupted { reason, .. }) => {
                TaskResult::ok("").with_field("interrupt", reason.into())
            }
            Ok(RunOutcome::Cancelled(_)) => TaskResult::failed("task cancelled"),
            Err(err) => {
                tracing::error!(task = %task.task_id, error = %err, "developer graph failed");
                TaskResult::failed(format!("graph execution error: {err}"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RecordingProgress;
    use crate::provider::ScriptedClient;
    use sy_core::types::Project;

    const PLAN_TWO_STEPS: &str = r#"[
      {"order":1,"task":"add login api","file_path":"src/api/login.ts","action":"create"},
      {"order":2,"task":"add login form","file_path":"src/form.tsx","action":"create"}
    ]"#;

    struct Fixture {
        projects: ProjectStore,
        project_id: Uuid,
        _workspace: tempfile::TempDir,
        workspace_path: PathBuf,
        progress: Arc<RecordingProgress>,
    }

    fn fixture() -> Fixture {
        let workspace = tempfile::tempdir().unwrap();
        let projects = ProjectStore::new();
        let mut project = Project::new("demo");
        project.workspace_path = Some(workspace.path().to_path_buf());
        let project_id = projects.insert(project);
        Fixture {
            projects,
            project_id,
            workspace_path: workspace.path().to_path_buf(),
            _workspace: workspace,
            progress: Arc::new(RecordingProgress::default()),
        }
    }

    fn agent(f: &Fixture, client: ScriptedClient, runner: ScriptedRunner) -> DeveloperAgent {
        DeveloperAgent::new(
            Arc::new(client),
            Arc::new(runner),
            f.progress.clone(),
            f.projects.clone(),
            DeveloperConfig::default(),
        )
        .unwrap()
    }

    fn story_task(f: &Fixture) -> TaskContext {
        TaskContext::story_process(
            f.project_id,
            r#"{"story_id":"s1","title":"Login","content":"login form","acceptance_criteria":["user can log in"]}"#,
        )
    }

    #[tokio::test]
    async fn happy_path_two_steps() {
        let f = fixture();
        let client = ScriptedClient::new("m")
            .script("analyze_and_plan", [PLAN_TWO_STEPS])
            .script(
                "implement",
                ["```ts\nexport const api = 1;\n```", "```tsx\nexport const form = 2;\n```"],
            )
            .script("review", ["DECISION: LGTM", "DECISION: LGTM"])
            .script("summarize", ["SUMMARY:\nall done\nIS_PASS: YES"]);
        let agent = agent(&f, client, ScriptedRunner::new([RunReport::pass()]));

        let result = agent.handle_task(story_task(&f), CancellationToken::new()).await;
        assert!(result.success, "failed: {:?}", result.error_message);
        assert_eq!(result.structured["files_modified"].as_array().unwrap().len(), 2);
        assert_eq!(result.structured["run_status"], "PASS");
        assert_eq!(result.structured["debug_count"], 0);

        // Files actually landed in the workspace.
        assert!(f.workspace_path.join("src/api/login.ts").exists());
        assert!(f.workspace_path.join("src/form.tsx").exists());

        // Progress reported at 50% and 100%.
        let reports = f.progress.reports.lock().unwrap();
        let pcts: Vec<u8> = reports.iter().map(|r| r.0).collect();
        assert_eq!(pcts, vec![50, 100]);
    }

    #[tokio::test]
    async fn lbtm_reworks_same_step_then_advances() {
        let f = fixture();
        let client = ScriptedClient::new("m")
            .script("analyze_and_plan", [PLAN_TWO_STEPS])
            .script(
                "implement",
                [
                    "```ts\nfirst attempt\n```",
                    "```ts\nsecond attempt\n```",
                    "```tsx\nform\n```",
                ],
            )
            .script(
                "review",
                [
                    "DECISION: LBTM\nFEEDBACK:\nhandle empty email",
                    "DECISION: LGTM",
                    "DECISION: LGTM",
                ],
            )
            .script("summarize", ["IS_PASS: YES"]);
        let client_calls = Arc::new(client);
        let agent = DeveloperAgent::new(
            client_calls.clone(),
            Arc::new(ScriptedRunner::new([RunReport::pass()])),
            f.progress.clone(),
            f.projects.clone(),
            DeveloperConfig::default(),
        )
        .unwrap();

        let result = agent.handle_task(story_task(&f), CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(result.structured["total_lbtm_count"], 1);
        assert_eq!(result.structured["debug_count"], 0);
        // Step 1 was implemented twice, step 2 once.
        assert_eq!(client_calls.calls_for("implement"), 3);
        // The rework prompt carried the reviewer feedback.
        let calls = client_calls.calls();
        let rework = calls.iter().filter(|c| c.node == "implement").nth(1).unwrap();
        assert!(rework.user.contains("handle empty email"));
    }

    #[tokio::test]
    async fn validate_failure_with_import_auto_fix() {
        let f = fixture();
        std::fs::write(
            f.workspace_path.join("package.json"),
            r#"{"name":"demo","dependencies":{}}"#,
        )
        .unwrap();

        let client = ScriptedClient::new("m")
            .script(
                "analyze_and_plan",
                [r#"[{"order":1,"task":"auth","file_path":"src/auth.ts","action":"create"}]"#],
            )
            .script("implement", ["```ts\nimport bcrypt from 'bcrypt';\n```"])
            .script("review", ["DECISION: LGTM"])
            .script("summarize", ["IS_PASS: YES"]);
        let runner = ScriptedRunner::new([
            RunReport::fail("Error: Cannot find module 'bcrypt'"),
            RunReport::pass(),
        ]);
        let agent = agent(&f, client, runner);

        let result = agent.handle_task(story_task(&f), CancellationToken::new()).await;
        assert!(result.success, "failed: {:?}", result.error_message);
        assert_eq!(result.structured["debug_count"], 1);
        assert_eq!(result.structured["run_status"], "PASS");
        assert_eq!(result.structured["error_analysis"]["error_type"], "IMPORT_ERROR");

        // The dependency was declared.
        let manifest = std::fs::read_to_string(f.workspace_path.join("package.json")).unwrap();
        assert!(manifest.contains("bcrypt"));
    }

    #[tokio::test]
    async fn summarize_no_replans_and_fixes() {
        let f = fixture();
        let client = ScriptedClient::new("m")
            .script(
                "analyze_and_plan",
                [r#"[{"order":1,"task":"handler","file_path":"src/h.ts","action":"create"}]"#],
            )
            .script(
                "implement",
                ["```ts\n// TODO finish\n```", "```ts\ncomplete handler\n```"],
            )
            .script("review", ["DECISION: LGTM", "DECISION: LGTM"])
            .script(
                "summarize",
                [
                    "IS_PASS: NO\n{\"src/h.ts\": \"TODO left in handler\"}",
                    "IS_PASS: YES",
                ],
            );
        let agent = agent(&f, client, ScriptedRunner::new([RunReport::pass()]));

        let result = agent.handle_task(story_task(&f), CancellationToken::new()).await;
        assert!(result.success, "failed: {:?}", result.error_message);
        let content = std::fs::read_to_string(f.workspace_path.join("src/h.ts")).unwrap();
        assert!(content.contains("complete handler"));
    }

    #[tokio::test]
    async fn debug_budget_exhaustion_is_terminal() {
        let f = fixture();
        let client = ScriptedClient::new("m")
            .script(
                "analyze_and_plan",
                [r#"[{"order":1,"task":"x","file_path":"src/x.ts","action":"create"}]"#],
            )
            .with_default(
                "DECISION: LGTM\nIS_PASS: YES\nERROR_TYPE: SOURCE_ERROR\nSHOULD_CONTINUE: false\nROOT_CAUSE: beyond repair",
            );
        // Tests never pass.
        let runner = ScriptedRunner::new([
            RunReport::fail("Error: assertion failed"),
            RunReport::fail("Error: assertion failed"),
            RunReport::fail("Error: assertion failed"),
            RunReport::fail("Error: assertion failed"),
        ]);
        let agent = agent(&f, client, runner);

        let result = agent.handle_task(story_task(&f), CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result
            .error_message
            .as_deref()
            .unwrap_or("")
            .contains("tests failing"));
        // debug_count never exceeds its bound plus the terminal attempt.
        let debug_count = result.structured["debug_count"].as_u64().unwrap();
        assert!(debug_count <= 4);
    }

    #[tokio::test]
    async fn planner_garbage_surfaces_via_respond() {
        let f = fixture();
        let client = ScriptedClient::new("m").script("analyze_and_plan", ["no plan here"]);
        let agent = agent(&f, client, ScriptedRunner::default());

        let result = agent.handle_task(story_task(&f), CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.output.contains("Implementation stopped"));
    }

    #[tokio::test]
    async fn missing_workspace_fails_cleanly() {
        let f = fixture();
        let bare_project = f.projects.insert(Project::new("no-workspace"));
        let client = ScriptedClient::new("m");
        let agent = agent(&f, client, ScriptedRunner::default());

        let task = TaskContext::story_process(bare_project, "{}");
        let result = agent.handle_task(task, CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("workspace"));
    }
}
