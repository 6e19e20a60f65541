//! Tester agent: verification of delivered stories.
//!
//! `plan_tests -> run_tests -> report`. The report lands as a TestReport
//! artifact and the run outcome drives the reply.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sy_artifacts::{ArtifactStore, ArtifactType, NewArtifact};
use sy_core::store::ProjectStore;
use sy_core::types::{AgentRole, TaskContext, TaskResult, TaskType};
use sy_graph::{
    keys, node, Graph, GraphExecutor, GraphState, InMemoryCheckpointer, NodeOutcome, RunOutcome,
    END, START,
};

use crate::developer::TestRunner;
use crate::handler::AgentHandler;
use crate::provider::{CompletionClient, CompletionRequest};
use crate::util::{project_id_of, record_tokens};

const PLAN_TESTS_SYSTEM_PROMPT: &str = "\
You are a Tester planning verification for a delivered story. List the
checks to run against the acceptance criteria, one per line.";

pub fn build_tester_graph(
    client: Arc<dyn CompletionClient>,
    runner: Arc<dyn TestRunner>,
    artifacts: ArtifactStore,
) -> sy_core::Result<Graph> {
    let plan_client = client;
    let plan_tests = node(move |ctx, mut state: GraphState| {
        let client = plan_client.clone();
        async move {
            ctx.check_cancelled()?;
            let user = format!(
                "## Story\n{}\n\n{}",
                state.get_str("story_title").unwrap_or(""),
                state.get_str("story_content").unwrap_or(""),
            );
            let completion = client
                .complete(CompletionRequest::new(&ctx.node, PLAN_TESTS_SYSTEM_PROMPT, user))
                .await?;
            record_tokens(&mut state, completion.tokens_used);
            state.set("test_plan", completion.text);
            Ok(NodeOutcome::Next(state))
        }
    });

    let run_tests = node(move |ctx, mut state: GraphState| {
        let runner = runner.clone();
        async move {
            ctx.check_cancelled()?;
            let workspace = state
                .get_str("workspace_path")
                .map(std::path::PathBuf::from)
                .ok_or_else(|| {
                    sy_core::CoreError::Internal("state missing workspace_path".into())
                })?;
            let report = runner.run(&workspace).await?;
            state.set(keys::RUN_STATUS, if report.passed { "PASS" } else { "FAIL" });
            state.set(keys::RUN_STDOUT, report.stdout);
            state.set(keys::RUN_STDERR, report.stderr);
            Ok(NodeOutcome::Next(state))
        }
    });

    let report = node(move |ctx, mut state: GraphState| {
        let artifacts = artifacts.clone();
        async move {
            let project_id = project_id_of(&state)?;
            let passed = state.get_str(keys::RUN_STATUS) == Some("PASS");

            let mut content = serde_json::Map::new();
            content.insert("plan".into(), serde_json::json!(state.get_str("test_plan").unwrap_or("")));
            content.insert("status".into(), serde_json::json!(state.get_str(keys::RUN_STATUS)));
            content.insert("stdout".into(), serde_json::json!(state.get_str(keys::RUN_STDOUT)));
            content.insert("stderr".into(), serde_json::json!(state.get_str(keys::RUN_STDERR)));

            artifacts.create(NewArtifact {
                project_id,
                agent_id: state
                    .get_str("agent_id")
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .unwrap_or_else(Uuid::new_v4),
                agent_name: "tester".into(),
                artifact_type: ArtifactType::TestReport,
                title: format!(
                    "Test Report: {}",
                    state.get_str("story_title").unwrap_or("story")
                ),
                description: None,
                content,
                tags: vec!["verification".into()],
            })?;

            state.set(
                keys::MESSAGE,
                if passed {
                    format!(
                        "Verification passed for \"{}\".",
                        state.get_str("story_title").unwrap_or("story")
                    )
                } else {
                    format!(
                        "Verification FAILED for \"{}\"; sending back to the developer.",
                        state.get_str("story_title").unwrap_or("story")
                    )
                },
            );
            tracing::info!(thread = %ctx.thread_id, passed, "test report stored");
            Ok(NodeOutcome::Next(state))
        }
    });

    Graph::builder("tester")
        .add_node("plan_tests", plan_tests)
        .add_node("run_tests", run_tests)
        .add_node("report", report)
        .add_edge(START, "plan_tests")
        .add_edge("plan_tests", "run_tests")
        .add_edge("run_tests", "report")
        .add_edge("report", END)
        .on_error("report")
        .build()
}

// ---------------------------------------------------------------------------
// TesterAgent
// ---------------------------------------------------------------------------

pub struct TesterAgent {
    executor: GraphExecutor,
    projects: ProjectStore,
}

impl TesterAgent {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        runner: Arc<dyn TestRunner>,
        artifacts: ArtifactStore,
        projects: ProjectStore,
    ) -> sy_core::Result<Self> {
        let graph = build_tester_graph(client, runner, artifacts)?;
        Ok(Self {
            executor: GraphExecutor::new(Arc::new(graph), Arc::new(InMemoryCheckpointer::new())),
            projects,
        })
    }
}

#[async_trait::async_trait]
impl AgentHandler for TesterAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Tester
    }

    async fn handle_task(&self, task: TaskContext, cancel: CancellationToken) -> TaskResult {
        if task.task_type == TaskType::ResumeWithAnswer {
            return TaskResult::failed("tester tasks are not resumable");
        }

        let story = crate::developer::parsers::parse_story_content(
            &task.content,
            &task.task_id.to_string(),
        );
        let workspace = match self.projects.get(task.project_id) {
            Ok(project) => project.workspace_path.unwrap_or_default(),
            Err(err) => return TaskResult::failed(err.to_string()),
        };

        let state = GraphState::new()
            .with(keys::PROJECT_ID, task.project_id.to_string())
            .with(keys::TASK_ID, task.task_id.to_string())
            .with("story_title", story.title)
            .with("story_content", story.content)
            .with("workspace_path", workspace.to_string_lossy().to_string());

        match self.executor.run(task.task_id, state, cancel).await {
            Ok(RunOutcome::Completed(final_state)) => {
                let passed = final_state.get_str(keys::RUN_STATUS) == Some("PASS");
                TaskResult::ok(final_state.get_str(keys::MESSAGE).unwrap_or("").to_string())
                    .with_field("run_status", final_state.get_str(keys::RUN_STATUS).unwrap_or("").into())
                    .with_field("passed", passed.into())
                    .with_field("tokens_used", final_state.get_u32("tokens_used").into())
            }
            Ok(RunOutcome::Interrupted { reason, .. }) => {
                TaskResult::ok("").with_field("interrupt", reason.into())
            }
            Ok(RunOutcome::Cancelled(_)) => TaskResult::failed("task cancelled"),
            Err(err) => TaskResult::failed(format!("graph execution error: {err}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::developer::{RunReport, ScriptedRunner};
    use crate::provider::ScriptedClient;
    use sy_core::types::Project;

    fn fixture(runner: ScriptedRunner) -> (TesterAgent, ArtifactStore, Uuid) {
        let projects = ProjectStore::new();
        let mut project = Project::new("demo");
        project.workspace_path = Some(std::env::temp_dir());
        let project_id = projects.insert(project);

        let artifacts = ArtifactStore::in_memory();
        let client = ScriptedClient::new("m").script("plan_tests", ["- check login happy path"]);
        let agent = TesterAgent::new(
            Arc::new(client),
            Arc::new(runner),
            artifacts.clone(),
            projects,
        )
        .unwrap();
        (agent, artifacts, project_id)
    }

    #[tokio::test]
    async fn passing_run_stores_report() {
        let (agent, artifacts, project) = fixture(ScriptedRunner::new([RunReport::pass()]));
        let result = agent
            .handle_task(
                TaskContext::story_process(project, r#"{"title":"Login","content":"login"}"#),
                CancellationToken::new(),
            )
            .await;

        assert!(result.success);
        assert_eq!(result.structured["passed"], true);
        assert!(result.output.contains("passed"));

        let report = artifacts.latest(project, ArtifactType::TestReport, None).unwrap();
        assert_eq!(report.content["status"], "PASS");
    }

    #[tokio::test]
    async fn failing_run_reports_back() {
        let (agent, artifacts, project) =
            fixture(ScriptedRunner::new([RunReport::fail("Expected 200, Received 500")]));
        let result = agent
            .handle_task(
                TaskContext::story_process(project, r#"{"title":"Login","content":"login"}"#),
                CancellationToken::new(),
            )
            .await;

        assert!(result.success);
        assert_eq!(result.structured["passed"], false);
        assert!(result.output.contains("FAILED"));
        let report = artifacts.latest(project, ArtifactType::TestReport, None).unwrap();
        assert_eq!(report.content["status"], "FAIL");
    }
}
