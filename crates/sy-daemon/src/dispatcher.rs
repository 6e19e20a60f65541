//! Event router: user messages and story events.
//!
//! Inbound user messages run the Team Leader graph against the cached
//! project context; DELEGATE outcomes become routing events on
//! `agent.routing`, RESPOND outcomes go straight to the project's websocket
//! room. Story transitions feed flow accounting, and a story entering
//! InProgress is routed to the developer pool.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sy_agents::handler::AgentHandler;
use sy_agents::{CompletionClient, TeamLeaderAgent};
use sy_core::context::ProjectContextCache;
use sy_core::store::{CreditLedger, StoryStore};
use sy_core::types::{AgentRole, CreditActivity, StoryStatus, TaskContext};
use sy_core::Result;
use sy_events::schemas::{AgentRoutingEvent, RoutingContext, StoryStatusEvent, UserMessageEvent};
use sy_events::{topics, Broker, EventEnvelope, EventHandler, TaskLifecycleQueue};
use sy_kanban::KanbanController;
use sy_bridge::ProjectRooms;

pub const TASK_DEADLINE: Duration = Duration::from_secs(600);

/// Reason string on routing events produced by story transitions; role
/// consumers use it to pick the story-processing task type.
pub const STORY_PROCESS_REASON: &str = "story_process";

/// Reason string on routing events that resume an interrupted graph run.
/// The routing context's message id is the suspended thread id.
pub const RESUME_REASON: &str = "resume_with_answer";

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    client: Arc<dyn CompletionClient>,
    context_cache: Arc<ProjectContextCache>,
    kanban: KanbanController,
    stories: StoryStore,
    rooms: Arc<ProjectRooms>,
    credits: CreditLedger,
    /// One Team Leader executor per project, built lazily.
    team_leaders: DashMap<Uuid, Arc<TeamLeaderAgent>>,
    /// Identity the dispatcher publishes lifecycle events under.
    agent_id: Uuid,
    shutdown: CancellationToken,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn Broker>,
        client: Arc<dyn CompletionClient>,
        context_cache: Arc<ProjectContextCache>,
        kanban: KanbanController,
        stories: StoryStore,
        rooms: Arc<ProjectRooms>,
        credits: CreditLedger,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            client,
            context_cache,
            kanban,
            stories,
            rooms,
            credits,
            team_leaders: DashMap::new(),
            agent_id: Uuid::new_v4(),
            shutdown,
        })
    }

    fn team_leader_for(&self, project_id: Uuid) -> Result<Arc<TeamLeaderAgent>> {
        if let Some(agent) = self.team_leaders.get(&project_id) {
            return Ok(agent.clone());
        }
        let agent = Arc::new(TeamLeaderAgent::new(
            self.client.clone(),
            self.kanban.clone(),
            self.context_cache.clone(),
        )?);
        self.team_leaders.insert(project_id, agent.clone());
        Ok(agent)
    }

    fn lifecycle_queue(&self, project_id: Uuid) -> TaskLifecycleQueue {
        TaskLifecycleQueue::new(
            self.broker.clone(),
            self.agent_id,
            "team-leader",
            Some(project_id),
        )
    }

    // === user.messages ===

    pub async fn handle_user_message(&self, envelope: &EventEnvelope) -> Result<()> {
        let event: UserMessageEvent = envelope.decode()?;
        let team_leader = self.team_leader_for(event.project_id)?;

        let mut task = TaskContext::message(event.project_id, event.content.clone())
            .with_user(event.user_id)
            .with_deadline(chrono::Utc::now() + chrono::Duration::seconds(TASK_DEADLINE.as_secs() as i64));
        task.attachments = event.attachments.clone();

        let queue = self.lifecycle_queue(event.project_id);
        let execution_id = Uuid::new_v4();
        queue.start_task(task.task_id, execution_id)?;
        let started = std::time::Instant::now();

        let result = team_leader
            .handle_task(task.clone(), self.shutdown.child_token())
            .await;

        self.record_credits(&event, &task, &result.structured);

        if result.success {
            match result.structured.get("action").and_then(|v| v.as_str()) {
                Some("DELEGATE") => {
                    let role = result
                        .structured
                        .get("target_role")
                        .and_then(|v| v.as_str())
                        .and_then(AgentRole::parse)
                        .unwrap_or(AgentRole::Developer);
                    let routing = AgentRoutingEvent {
                        from_agent: "team_leader".into(),
                        to_agent: role,
                        project_id: event.project_id,
                        user_id: Some(event.user_id),
                        reason: result
                            .structured
                            .get("reason")
                            .and_then(|v| v.as_str())
                            .unwrap_or("delegation")
                            .to_string(),
                        context: RoutingContext {
                            message_id: Some(envelope.event_id),
                            user_message: event.content.clone(),
                            selected_options: Vec::new(),
                        },
                    };
                    self.broker.publish(
                        topics::AGENT_ROUTING,
                        &event.project_id.to_string(),
                        routing.envelope()?,
                    )?;
                    tracing::info!(project = %event.project_id, role = %role, "delegated");
                }
                _ => {
                    self.rooms.broadcast(
                        event.project_id,
                        &serde_json::json!({
                            "type": "agent_message",
                            "agent": "team_leader",
                            "message": result.output,
                        }),
                    );
                }
            }
            queue.complete_task(
                task.task_id,
                execution_id,
                Some(serde_json::Value::Object(result.structured.clone())),
                started.elapsed().as_secs(),
            )?;
        } else {
            queue.fail_task(
                task.task_id,
                Some(execution_id),
                result.error_message.as_deref().unwrap_or("unknown error"),
                None,
                0,
                false,
            )?;
        }
        Ok(())
    }

    fn record_credits(
        &self,
        event: &UserMessageEvent,
        task: &TaskContext,
        structured: &serde_json::Map<String, serde_json::Value>,
    ) {
        let tokens = structured
            .get("tokens_used")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if tokens == 0 {
            return;
        }
        self.credits.record(CreditActivity {
            id: Uuid::new_v4(),
            user_id: event.user_id,
            project_id: event.project_id,
            tokens_used: tokens,
            model_used: "team_leader".into(),
            llm_calls: 1,
            credits_delta: -(tokens as i64),
            reason: format!("team leader task {}", task.task_id),
            story_id: None,
            agent_id: Some(self.agent_id),
            created_at: chrono::Utc::now(),
        });
    }

    // === story.events ===

    pub async fn handle_story_event(&self, envelope: &EventEnvelope) -> Result<()> {
        let event: StoryStatusEvent = envelope.decode()?;
        self.kanban.record_transition(
            event.story_id,
            event.project_id,
            event.to_status,
            envelope.timestamp,
        );

        // A story entering InProgress triggers the developer workflow.
        if event.to_status != StoryStatus::InProgress {
            return Ok(());
        }
        let story = self.stories.get(event.story_id)?;
        let payload = serde_json::json!({
            "story_id": story.id,
            "title": story.title,
            "content": story.description,
            "acceptance_criteria": story.acceptance_criteria,
        });

        let routing = AgentRoutingEvent {
            from_agent: "team_leader".into(),
            to_agent: AgentRole::Developer,
            project_id: event.project_id,
            user_id: None,
            reason: STORY_PROCESS_REASON.into(),
            context: RoutingContext {
                message_id: Some(envelope.event_id),
                user_message: payload.to_string(),
                selected_options: Vec::new(),
            },
        };
        self.broker.publish(
            topics::AGENT_ROUTING,
            &event.project_id.to_string(),
            routing.envelope()?,
        )?;
        tracing::info!(story = %event.story_id, "story routed to developer");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EventHandler adapters
// ---------------------------------------------------------------------------

pub struct UserMessageHandler(pub Arc<Dispatcher>);

#[async_trait::async_trait]
impl EventHandler for UserMessageHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<()> {
        self.0.handle_user_message(envelope).await
    }
}

pub struct StoryEventHandler(pub Arc<Dispatcher>);

#[async_trait::async_trait]
impl EventHandler for StoryEventHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<()> {
        self.0.handle_story_event(envelope).await
    }
}
