//! Team Leader agent: classification and delegation.
//!
//! The graph classifies an inbound user message into RESPOND, TOOL_CALL, or
//! DELEGATE. Delegations pass through a WIP gate that consults the Kanban
//! controller; a hard-blocked column turns the delegation into a
//! user-visible explanation instead of a routing event.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use sy_core::context::ProjectContextCache;
use sy_core::types::{AgentRole, TaskContext, TaskResult, TaskType};
use sy_graph::{
    keys, node, router, Graph, GraphExecutor, GraphState, InMemoryCheckpointer, NodeOutcome,
    RunOutcome, END, START,
};
use sy_kanban::KanbanController;

use crate::handler::AgentHandler;
use crate::provider::{field, CompletionClient, CompletionRequest};
use crate::util::{project_id_of, record_tokens};

const CLASSIFY_SYSTEM_PROMPT: &str = "\
You are the Team Leader of a software delivery team. Classify the user's \
message and decide how to route it.

Roles you can delegate to: business_analyst (requirements, scoping), \
developer (implementation), tester (verification).

Respond in exactly this format:
ACTION: RESPOND|TOOL_CALL|DELEGATE
TARGET_ROLE: <role, only when delegating>
TOOL: <wip_status|board|bottlenecks|suggest_pull, only for tool calls>
REASON: <one line>
CONFIDENCE: <0.0-1.0>
MESSAGE: <reply text for the user>";

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

pub fn build_team_leader_graph(
    client: Arc<dyn CompletionClient>,
    kanban: KanbanController,
) -> sy_core::Result<Graph> {
    let classify_client = client.clone();
    let classify_kanban = kanban.clone();
    let classify = node(move |ctx, mut state: GraphState| {
        let client = classify_client.clone();
        let kanban = classify_kanban.clone();
        async move {
            ctx.check_cancelled()?;
            let project_id = project_id_of(&state)?;

            let mut wip_lines = Vec::new();
            if let Ok(wip) = kanban.wip_status(project_id) {
                for (column, status) in &wip {
                    wip_lines.push(format!(
                        "- {column}: {}/{} ({:?})",
                        status.current, status.limit, status.kind
                    ));
                }
            }

            let user = format!(
                "## Board WIP\n{}\n\n## Preferences\n{}\n\n## Conversation\n{}\n\n## Message\n{}",
                if wip_lines.is_empty() {
                    "No WIP limits configured".to_string()
                } else {
                    wip_lines.join("\n")
                },
                state.get_str(keys::USER_PREFERENCES).unwrap_or(""),
                state.get_str(keys::CONVERSATION_HISTORY).unwrap_or(""),
                state.get_str(keys::USER_MESSAGE).unwrap_or(""),
            );

            let completion = client
                .complete(CompletionRequest::new(&ctx.node, CLASSIFY_SYSTEM_PROMPT, user))
                .await?;
            record_tokens(&mut state, completion.tokens_used);

            let text = completion.text;
            let action = field(&text, "ACTION").unwrap_or_else(|| "RESPOND".into());
            state.set(keys::ACTION, action.to_uppercase());
            if let Some(role) = field(&text, "TARGET_ROLE") {
                state.set(keys::TARGET_ROLE, role);
            }
            if let Some(tool) = field(&text, "TOOL") {
                state.set("tool", tool);
            }
            if let Some(reason) = field(&text, "REASON") {
                state.set(keys::REASON, reason);
            }
            if let Some(confidence) = field(&text, "CONFIDENCE") {
                if let Ok(value) = confidence.parse::<f64>() {
                    state.set(keys::CONFIDENCE, value);
                }
            }
            let message = field(&text, "MESSAGE").unwrap_or(text);
            state.set(keys::MESSAGE, message);

            Ok(NodeOutcome::Next(state))
        }
    });

    let tools_kanban = kanban.clone();
    let tools = node(move |ctx, mut state: GraphState| {
        let kanban = tools_kanban.clone();
        async move {
            ctx.check_cancelled()?;
            let project_id = project_id_of(&state)?;
            let tool = state.get_str("tool").unwrap_or("wip_status").to_string();

            let output = match tool.as_str() {
                "board" => {
                    let board = kanban.snapshot(project_id);
                    board
                        .columns
                        .iter()
                        .map(|(name, cards)| format!("{name}: {} stories", cards.len()))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
                "bottlenecks" => {
                    let found =
                        kanban.detect_bottlenecks(project_id, sy_kanban::DEFAULT_AGING_THRESHOLD_HOURS);
                    if found.is_empty() {
                        "No bottlenecks detected.".to_string()
                    } else {
                        found
                            .iter()
                            .map(|b| {
                                format!(
                                    "{}: {} aging items, oldest {:.0}h",
                                    b.column, b.aging_count, b.oldest_age_hours
                                )
                            })
                            .collect::<Vec<_>>()
                            .join("\n")
                    }
                }
                "suggest_pull" => match kanban.suggest_next_pull(project_id, "Todo") {
                    Some(card) => format!("Next pull: {} ({:?})", card.title, card.priority),
                    None => "Nothing to pull from Todo.".to_string(),
                },
                _ => {
                    let wip = kanban.wip_status(project_id)?;
                    if wip.is_empty() {
                        "No WIP limits configured.".to_string()
                    } else {
                        let mut lines: Vec<String> = wip
                            .iter()
                            .map(|(column, s)| {
                                format!("{column}: {}/{} in use, {} free", s.current, s.limit, s.available)
                            })
                            .collect();
                        lines.sort();
                        lines.join("\n")
                    }
                }
            };

            state.set(keys::MESSAGE, output);
            Ok(NodeOutcome::Next(state))
        }
    });

    let gate_kanban = kanban.clone();
    let wip_gate = node(move |ctx, mut state: GraphState| {
        let kanban = gate_kanban.clone();
        async move {
            ctx.check_cancelled()?;
            let project_id = project_id_of(&state)?;
            let role = state
                .get_str(keys::TARGET_ROLE)
                .and_then(AgentRole::parse)
                .unwrap_or(AgentRole::Developer);

            let Some(column) = role.wip_column() else {
                return Ok(NodeOutcome::Next(state));
            };

            let (can_pull, reason) = kanban.can_pull(project_id, column)?;
            if !can_pull {
                // Hard limit: surface to the user instead of delegating.
                state.set(keys::ACTION, "RESPOND");
                state.set(keys::WIP_BLOCKED, true);
                state.set(
                    keys::MESSAGE,
                    format!(
                        "The {column} column is at its WIP limit ({reason}). \
                         Your request is noted and will be picked up as soon as a slot frees."
                    ),
                );
                tracing::info!(project = %project_id, column, "delegation blocked by hard WIP limit");
            } else if reason.contains("Soft WIP") {
                state.set("wip_warning", reason);
            }
            Ok(NodeOutcome::Next(state))
        }
    });

    let delegate = node(move |ctx, mut state: GraphState| async move {
        ctx.check_cancelled()?;
        let role = state.get_str(keys::TARGET_ROLE).unwrap_or("developer").to_string();
        let reason = state.get_str(keys::REASON).unwrap_or("").to_string();
        state.set(
            keys::MESSAGE,
            format!("I'm handing this to the {role}: {reason}"),
        );
        Ok(NodeOutcome::Next(state))
    });

    let respond = node(move |_ctx, mut state: GraphState| async move {
        if state.get_str(keys::MESSAGE).map_or(true, str::is_empty) {
            let fallback = match state.get_str(keys::ERROR) {
                Some(_) => "Something went wrong while handling your request. Please try again.",
                None => "I'm not sure how to help with that yet.",
            };
            state.set(keys::MESSAGE, fallback);
        }
        Ok(NodeOutcome::Next(state))
    });

    Graph::builder("team_leader")
        .add_node("classify", classify)
        .add_node("tools", tools)
        .add_node("wip_gate", wip_gate)
        .add_node("delegate", delegate)
        .add_node("respond", respond)
        .add_edge(START, "classify")
        .add_router(
            "classify",
            router(|state| match state.get_str(keys::ACTION) {
                Some("DELEGATE") => "wip_gate".into(),
                Some("TOOL_CALL") => "tools".into(),
                _ => "respond".into(),
            }),
        )
        .add_router(
            "wip_gate",
            router(|state| match state.get_str(keys::ACTION) {
                Some("DELEGATE") => "delegate".into(),
                _ => "respond".into(),
            }),
        )
        .add_edge("tools", "respond")
        .add_edge("delegate", "respond")
        .add_edge("respond", END)
        .on_error("respond")
        .build()
}

// ---------------------------------------------------------------------------
// TeamLeaderAgent
// ---------------------------------------------------------------------------

pub struct TeamLeaderAgent {
    executor: GraphExecutor,
    context_cache: Arc<ProjectContextCache>,
}

impl TeamLeaderAgent {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        kanban: KanbanController,
        context_cache: Arc<ProjectContextCache>,
    ) -> sy_core::Result<Self> {
        let graph = build_team_leader_graph(client, kanban)?;
        Ok(Self {
            executor: GraphExecutor::new(Arc::new(graph), Arc::new(InMemoryCheckpointer::new())),
            context_cache,
        })
    }

    fn result_from(final_state: GraphState) -> TaskResult {
        let message = final_state.get_str(keys::MESSAGE).unwrap_or("").to_string();
        let mut result = TaskResult::ok(message)
            .with_field(
                "action",
                final_state
                    .get_str(keys::ACTION)
                    .unwrap_or("RESPOND")
                    .into(),
            )
            .with_field(
                "wip_blocked",
                final_state.get_bool(keys::WIP_BLOCKED).into(),
            )
            .with_field(
                "tokens_used",
                final_state.get_u32("tokens_used").into(),
            );
        if let Some(role) = final_state.get_str(keys::TARGET_ROLE) {
            result = result.with_field("target_role", role.into());
        }
        if let Some(reason) = final_state.get_str(keys::REASON) {
            result = result.with_field("reason", reason.into());
        }
        if let Some(confidence) = final_state.get_f64(keys::CONFIDENCE) {
            result = result.with_field("confidence", confidence.into());
        }
        result
    }
}

#[async_trait::async_trait]
impl AgentHandler for TeamLeaderAgent {
    fn role(&self) -> AgentRole {
        AgentRole::TeamLeader
    }

    async fn handle_task(&self, task: TaskContext, cancel: CancellationToken) -> TaskResult {
        if task.task_type == TaskType::ResumeWithAnswer {
            let Some(answer) = task.effective_answer().map(str::to_string) else {
                return TaskResult::failed("resume task carried no answer");
            };
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

        self.context_cache
            .add_message(task.project_id, "user", &task.content)
            .await;

        let context = self.context_cache.ensure_loaded(task.project_id).await;
        let (history, preferences) = {
            let ctx = context.lock().await;
            (ctx.format_memory(), ctx.format_preferences())
        };

        let state = GraphState::new()
            .with(keys::USER_MESSAGE, task.content.clone())
            .with(
                keys::USER_ID,
                task.user_id.map(|u| u.to_string()).unwrap_or_default(),
            )
            .with(keys::PROJECT_ID, task.project_id.to_string())
            .with(keys::TASK_ID, task.task_id.to_string())
            .with(keys::CONVERSATION_HISTORY, history)
            .with(keys::USER_PREFERENCES, preferences);

        match self.executor.run(task.task_id, state, cancel).await {
            Ok(RunOutcome::Completed(final_state)) => {
                if let Some(message) = final_state.get_str(keys::MESSAGE) {
                    if !message.is_empty() {
                        self.context_cache
                            .add_message(task.project_id, "assistant", message)
                            .await;
                    }
                }
                Self::result_from(final_state)
            }
            Ok(RunOutcome::Interrupted { reason, .. }) => {
                TaskResult::ok("").with_field("interrupt", reason.into())
            }
            Ok(RunOutcome::Cancelled(_)) => TaskResult::failed("task cancelled"),
            Err(err) => {
                tracing::error!(task = %task.task_id, error = %err, "team leader graph failed");
                TaskResult::failed(format!("graph execution error: {err}"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
