//! Business Analyst agent: phased requirements sessions.
//!
//! A project moves through `analysis -> brief -> solution`; the user advances
//! phases by approving ("next", "approve"). Each phase produces a versioned
//! artifact. When the analysis needs information only the user has, the node
//! raises an interrupt and the session resumes with the answer.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sy_artifacts::{ArtifactStore, ArtifactType, NewArtifact};
use sy_core::context::ProjectContextCache;
use sy_core::types::{AgentRole, TaskContext, TaskResult, TaskType};
use sy_graph::{
    keys, node, router, Graph, GraphExecutor, GraphState, InMemoryCheckpointer, NodeCtx,
    NodeOutcome, RunOutcome, END, START,
};

use crate::handler::AgentHandler;
use crate::provider::{CompletionClient, CompletionRequest};
use crate::util::{project_id_of, record_tokens};

pub const PHASE_FACT_KEY: &str = "ba_phase";

const APPROVALS: [&str; 5] = ["next", "ok", "approve", "approved", "looks good"];

const ANALYSIS_SYSTEM_PROMPT: &str = "\
You are a Business Analyst gathering requirements. Work from the user's
message and the conversation so far. If you are missing information only the
user can provide, output a single line starting with QUESTION: and nothing
else. Otherwise summarize the requirements gathered so far.";

const BRIEF_SYSTEM_PROMPT: &str = "\
You are a Business Analyst writing a product brief from the gathered
requirements. Be concrete: goals, scope, constraints, success criteria.";

const SOLUTION_SYSTEM_PROMPT: &str = "\
You are a Business Analyst proposing a solution design for the approved
brief: major components, user flows, and a delivery cut.";

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaPhase {
    Analysis,
    Brief,
    Solution,
}

impl BaPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaPhase::Analysis => "analysis",
            BaPhase::Brief => "brief",
            BaPhase::Solution => "solution",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "brief" => BaPhase::Brief,
            "solution" => BaPhase::Solution,
            _ => BaPhase::Analysis,
        }
    }

    pub fn next(&self) -> Self {
        match self {
            BaPhase::Analysis => BaPhase::Brief,
            BaPhase::Brief => BaPhase::Solution,
            BaPhase::Solution => BaPhase::Solution,
        }
    }

    fn artifact_type(&self) -> ArtifactType {
        match self {
            BaPhase::Analysis => ArtifactType::RequirementsDoc,
            BaPhase::Brief => ArtifactType::ProductBrief,
            BaPhase::Solution => ArtifactType::SolutionDesign,
        }
    }

    fn artifact_title(&self) -> &'static str {
        match self {
            BaPhase::Analysis => "Requirements Analysis",
            BaPhase::Brief => "Product Brief",
            BaPhase::Solution => "Solution Design",
        }
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

fn store_phase_artifact(
    artifacts: &ArtifactStore,
    project_id: Uuid,
    agent_id: Uuid,
    phase: BaPhase,
    body: &str,
) -> sy_core::Result<u32> {
    let mut content = serde_json::Map::new();
    content.insert("body".into(), serde_json::json!(body));
    content.insert("phase".into(), serde_json::json!(phase.as_str()));

    let artifact = match artifacts.latest(project_id, phase.artifact_type(), Some(phase.artifact_title())) {
        Some(head) => artifacts.create_version(head.id, content, None)?,
        None => artifacts.create(NewArtifact {
            project_id,
            agent_id,
            agent_name: "business-analyst".into(),
            artifact_type: phase.artifact_type(),
            title: phase.artifact_title().into(),
            description: None,
            content,
            tags: vec![phase.as_str().into()],
        })?,
    };
    Ok(artifact.version)
}

fn phase_node(
    client: Arc<dyn CompletionClient>,
    artifacts: ArtifactStore,
    phase: BaPhase,
    system_prompt: &'static str,
) -> sy_graph::NodeFn {
    node(move |ctx: NodeCtx, mut state: GraphState| {
        let client = client.clone();
        let artifacts = artifacts.clone();
        async move {
            ctx.check_cancelled()?;
            let project_id = project_id_of(&state)?;

            let mut user = format!(
                "## Conversation\n{}\n\n## Message\n{}",
                state.get_str(keys::CONVERSATION_HISTORY).unwrap_or(""),
                state.get_str(keys::USER_MESSAGE).unwrap_or(""),
            );
            if let Some(answer) = state.remove(keys::RESUME_ANSWER) {
                user.push_str(&format!(
                    "\n\n## User's answer to your question\n{}",
                    answer.as_str().unwrap_or("")
                ));
            }

            let completion = client
                .complete(CompletionRequest::new(&ctx.node, system_prompt, user))
                .await?;
            record_tokens(&mut state, completion.tokens_used);

            // Analysis may need the user before it can produce anything.
            if phase == BaPhase::Analysis {
                if let Some(question) = completion.text.trim().strip_prefix("QUESTION:") {
                    let question = question.trim().to_string();
                    state.set(keys::MESSAGE, question);
                    return Ok(NodeOutcome::Interrupt {
                        reason: "needs_answer".into(),
                        state,
                    });
                }
            }

            let agent_id = state
                .get_str("agent_id")
                .and_then(|s| Uuid::parse_str(s).ok())
                .unwrap_or_else(Uuid::new_v4);
            let version =
                store_phase_artifact(&artifacts, project_id, agent_id, phase, &completion.text)?;

            state.set("artifact_version", version);
            state.set(keys::MESSAGE, completion.text);
            Ok(NodeOutcome::Next(state))
        }
    })
}

pub fn build_business_analyst_graph(
    client: Arc<dyn CompletionClient>,
    artifacts: ArtifactStore,
) -> sy_core::Result<Graph> {
    let respond = node(|_ctx, mut state: GraphState| async move {
        if state.get_str(keys::MESSAGE).map_or(true, str::is_empty) {
            let fallback = match state.get_str(keys::ERROR) {
                Some(_) => "The analysis hit a problem; please try again.",
                None => "Tell me more about what you want to build.",
            };
            state.set(keys::MESSAGE, fallback);
        }
        Ok(NodeOutcome::Next(state))
    });

    Graph::builder("business_analyst")
        .add_node(
            "analyze",
            phase_node(client.clone(), artifacts.clone(), BaPhase::Analysis, ANALYSIS_SYSTEM_PROMPT),
        )
        .add_node(
            "brief",
            phase_node(client.clone(), artifacts.clone(), BaPhase::Brief, BRIEF_SYSTEM_PROMPT),
        )
        .add_node(
            "solution",
            phase_node(client, artifacts, BaPhase::Solution, SOLUTION_SYSTEM_PROMPT),
        )
        .add_node("route_phase", node(|_ctx, state: GraphState| async move {
            Ok(NodeOutcome::Next(state))
        }))
        .add_node("respond", respond)
        .add_edge(START, "route_phase")
        .add_router(
            "route_phase",
            router(|state| match state.get_str("phase") {
                Some("brief") => "brief".into(),
                Some("solution") => "solution".into(),
                _ => "analyze".into(),
            }),
        )
        .add_edge("analyze", "respond")
        .add_edge("brief", "respond")
        .add_edge("solution", "respond")
        .add_edge("respond", END)
        .on_error("respond")
        .build()
}

// ---------------------------------------------------------------------------
// BusinessAnalystAgent
// ---------------------------------------------------------------------------

pub struct BusinessAnalystAgent {
    executor: GraphExecutor,
    context_cache: Arc<ProjectContextCache>,
}

impl BusinessAnalystAgent {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        artifacts: ArtifactStore,
        context_cache: Arc<ProjectContextCache>,
    ) -> sy_core::Result<Self> {
        let graph = build_business_analyst_graph(client, artifacts)?;
        Ok(Self {
            executor: GraphExecutor::new(Arc::new(graph), Arc::new(InMemoryCheckpointer::new())),
            context_cache,
        })
    }

    async fn current_phase(&self, project_id: Uuid) -> BaPhase {
        let context = self.context_cache.ensure_loaded(project_id).await;
        let phase = context
            .lock()
            .await
            .preference(PHASE_FACT_KEY)
            .map(str::to_string);
        phase.as_deref().map(BaPhase::parse).unwrap_or(BaPhase::Analysis)
    }

    fn result_from(final_state: GraphState, phase: BaPhase) -> TaskResult {
        TaskResult::ok(final_state.get_str(keys::MESSAGE).unwrap_or("").to_string())
            .with_field("phase", phase.as_str().into())
            .with_field(
                "artifact_version",
                final_state.get_u32("artifact_version").into(),
            )
            .with_field("tokens_used", final_state.get_u32("tokens_used").into())
    }
}

#[async_trait::async_trait]
impl AgentHandler for BusinessAnalystAgent {
    fn role(&self) -> AgentRole {
        AgentRole::BusinessAnalyst
    }

    async fn handle_task(&self, task: TaskContext, cancel: CancellationToken) -> TaskResult {
        let project_id = task.project_id;

        if task.task_type == TaskType::ResumeWithAnswer {
            let Some(answer) = task.effective_answer().map(str::to_string) else {
                return TaskResult::failed("resume task carried no answer");
            };
            return match self
                .executor
                .resume(task.task_id, serde_json::json!(answer), cancel)
                .await
            {
                Ok(RunOutcome::Completed(state)) => {
                    let phase = self.current_phase(project_id).await;
                    Self::result_from(state, phase)
                }
                Ok(RunOutcome::Interrupted { reason, .. }) => {
                    TaskResult::ok("").with_field("interrupt", reason.into())
                }
                Ok(RunOutcome::Cancelled(_)) => TaskResult::failed("task cancelled"),
                Err(err) => TaskResult::failed(format!("resume failed: {err}")),
            };
        }

        let mut phase = self.current_phase(project_id).await;
        let trimmed = task.content.trim().to_lowercase();
        if APPROVALS.contains(&trimmed.as_str()) {
            phase = phase.next();
            self.context_cache
                .update_preference(project_id, PHASE_FACT_KEY, phase.as_str())
                .await;
            tracing::info!(project = %project_id, phase = phase.as_str(), "BA session advanced");
        }

        self.context_cache
            .add_message(project_id, "user", &task.content)
            .await;
        let context = self.context_cache.ensure_loaded(project_id).await;
        let history = context.lock().await.format_memory();

        let state = GraphState::new()
            .with(keys::PROJECT_ID, project_id.to_string())
            .with(keys::TASK_ID, task.task_id.to_string())
            .with(keys::USER_MESSAGE, task.content.clone())
            .with(keys::CONVERSATION_HISTORY, history)
            .with("phase", phase.as_str());

        match self.executor.run(task.task_id, state, cancel).await {
            Ok(RunOutcome::Completed(final_state)) => {
                if let Some(message) = final_state.get_str(keys::MESSAGE) {
                    if !message.is_empty() {
                        self.context_cache
                            .add_message(project_id, "assistant", message)
                            .await;
                    }
                }
                Self::result_from(final_state, phase)
            }
            Ok(RunOutcome::Interrupted { reason, state, .. }) => {
                // Surface the clarification question to the user while the
                // thread stays suspended.
                let question = state.get_str(keys::MESSAGE).unwrap_or("").to_string();
                if !question.is_empty() {
                    self.context_cache
                        .add_message(project_id, "assistant", &question)
                        .await;
                }
                TaskResult::ok(question)
                    .with_field("interrupt", reason.into())
                    .with_field("phase", phase.as_str().into())
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
    use crate::provider::ScriptedClient;

    fn agent(client: ScriptedClient) -> (BusinessAnalystAgent, ArtifactStore, Arc<ProjectContextCache>) {
        let artifacts = ArtifactStore::in_memory();
        let cache = Arc::new(ProjectContextCache::in_memory());
        let agent =
            BusinessAnalystAgent::new(Arc::new(client), artifacts.clone(), cache.clone()).unwrap();
        (agent, artifacts, cache)
    }

    #[tokio::test]
    async fn analysis_produces_requirements_artifact() {
        let client = ScriptedClient::new("m")
            .script("analyze", ["Requirements so far: a login page with SSO."]);
        let (agent, artifacts, _) = agent(client);
        let project = Uuid::new_v4();

        let result = agent
            .handle_task(
                TaskContext::message(project, "we need login"),
                CancellationToken::new(),
            )
            .await;

        assert!(result.success);
        assert_eq!(result.structured["phase"], "analysis");
        let artifact = artifacts
            .latest(project, ArtifactType::RequirementsDoc, None)
            .unwrap();
        assert_eq!(artifact.version, 1);
        assert!(artifact.content["body"].as_str().unwrap().contains("SSO"));
    }

    #[tokio::test]
    async fn repeated_analysis_versions_the_artifact() {
        let client = ScriptedClient::new("m")
            .script("analyze", ["v1 requirements", "v2 requirements"]);
        let (agent, artifacts, _) = agent(client);
        let project = Uuid::new_v4();

        agent
            .handle_task(TaskContext::message(project, "first"), CancellationToken::new())
            .await;
        agent
            .handle_task(TaskContext::message(project, "second"), CancellationToken::new())
            .await;

        let head = artifacts
            .latest(project, ArtifactType::RequirementsDoc, None)
            .unwrap();
        assert_eq!(head.version, 2);
    }

    #[tokio::test]
    async fn approval_advances_to_brief() {
        let client = ScriptedClient::new("m")
            .script("analyze", ["requirements gathered"])
            .script("brief", ["## Product Brief\nbuild the login"]);
        let (agent, artifacts, _) = agent(client);
        let project = Uuid::new_v4();

        agent
            .handle_task(TaskContext::message(project, "we need login"), CancellationToken::new())
            .await;
        let result = agent
            .handle_task(TaskContext::message(project, "next"), CancellationToken::new())
            .await;

        assert_eq!(result.structured["phase"], "brief");
        assert!(artifacts
            .latest(project, ArtifactType::ProductBrief, None)
            .is_some());
    }

    #[tokio::test]
    async fn clarification_interrupt_then_resume() {
        let client = ScriptedClient::new("m").script(
            "analyze",
            [
                "QUESTION: Should login support social providers?",
                "Requirements: login with Google SSO.",
            ],
        );
        let (agent, artifacts, _) = agent(client);
        let project = Uuid::new_v4();

        let task = TaskContext::message(project, "we need login");
        let thread = task.task_id;
        let result = agent.handle_task(task, CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(result.structured["interrupt"], "needs_answer");
        // No artifact yet while suspended.
        assert!(artifacts.latest(project, ArtifactType::RequirementsDoc, None).is_none());

        let resume = TaskContext::resume(project, thread, "yes, Google");
        let result = agent.handle_task(resume, CancellationToken::new()).await;
        assert!(result.success);
        assert!(result.output.contains("Google SSO"));
        assert!(artifacts.latest(project, ArtifactType::RequirementsDoc, None).is_some());
    }
}
