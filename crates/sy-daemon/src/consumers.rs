//! Per-role routing consumers.
//!
//! One consumer per role listens on `agent.routing` under its own consumer
//! group and filters by `to_agent`, so roles scale horizontally and
//! independently. Each delegation acquires a worker from the role's pool,
//! runs the role graph, publishes lifecycle events, and releases the worker
//! with the execution outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sy_agents::handler::AgentHandler;
use sy_core::store::CreditLedger;
use sy_core::types::{AgentRole, CreditActivity, TaskContext};
use sy_core::{CoreError, Result};
use sy_events::schemas::AgentRoutingEvent;
use sy_events::{topics, Broker, EventBusClient, EventEnvelope, EventHandler, TaskLifecycleQueue};
use sy_pools::AgentPool;
use sy_bridge::ProjectRooms;

use crate::dispatcher::{RESUME_REASON, STORY_PROCESS_REASON};

pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Progress sink that publishes task progress onto `agent.tasks`.
pub struct BrokerProgress {
    broker: Arc<dyn Broker>,
    agent_name: String,
}

impl BrokerProgress {
    pub fn new(broker: Arc<dyn Broker>, agent_name: impl Into<String>) -> Self {
        Self {
            broker,
            agent_name: agent_name.into(),
        }
    }
}

impl sy_agents::ProgressSink for BrokerProgress {
    fn on_progress(&self, task_id: Uuid, percentage: u8, step: &str, completed: u32, total: u32) {
        let queue = TaskLifecycleQueue::new(
            self.broker.clone(),
            Uuid::nil(),
            self.agent_name.clone(),
            None,
        );
        if let Err(err) = queue.report_progress(task_id, None, percentage, step, completed, total) {
            tracing::warn!(task = %task_id, error = %err, "progress publish failed");
        }
    }
}

// ---------------------------------------------------------------------------
// RoleConsumer
// ---------------------------------------------------------------------------

pub struct RoleConsumer {
    role: AgentRole,
    pool: Arc<AgentPool>,
    handler: Arc<dyn AgentHandler>,
    broker: Arc<dyn Broker>,
    rooms: Arc<ProjectRooms>,
    credits: CreditLedger,
    acquire_timeout: Duration,
    shutdown: CancellationToken,
}

impl RoleConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: AgentRole,
        pool: Arc<AgentPool>,
        handler: Arc<dyn AgentHandler>,
        broker: Arc<dyn Broker>,
        rooms: Arc<ProjectRooms>,
        credits: CreditLedger,
        acquire_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            role,
            pool,
            handler,
            broker,
            rooms,
            credits,
            acquire_timeout,
            shutdown,
        })
    }

    /// Build the consumer-group client for this role, not yet started. Each
    /// role owns its own group id so roles scale independently.
    pub fn bus(self: &Arc<Self>) -> EventBusClient {
        let group = format!("role-{}-consumer", self.role);
        EventBusClient::new(self.broker.clone(), group).on(
            AgentRoutingEvent::EVENT_TYPE,
            Arc::new(RoutingHandler(self.clone())),
        )
    }

    /// Build and start; convenience for standalone consumers.
    pub fn start(self: &Arc<Self>) -> Result<EventBusClient> {
        let client = self.bus();
        client.start(&[topics::AGENT_ROUTING])?;
        Ok(client)
    }

    async fn handle_routing(&self, envelope: &EventEnvelope) -> Result<()> {
        let event: AgentRoutingEvent = envelope.decode()?;
        if event.to_agent != self.role {
            return Ok(());
        }
        tracing::info!(
            role = %self.role, from = %event.from_agent, project = %event.project_id,
            "delegation received"
        );

        let task_id = event.context.message_id.unwrap_or_else(Uuid::new_v4);
        let mut task = if event.reason == STORY_PROCESS_REASON {
            TaskContext::story_process(event.project_id, event.context.user_message.clone())
        } else if event.reason == RESUME_REASON {
            TaskContext::resume(event.project_id, task_id, event.context.user_message.clone())
        } else {
            TaskContext::message(event.project_id, event.context.user_message.clone())
        };
        task.task_id = task_id;
        task.user_id = event.user_id;
        task.routing_reason = Some(event.reason.clone());
        task.selected_options = event.context.selected_options.clone();

        // Admission: a full pool is surfaced as a failed task, not an
        // endless redelivery loop.
        let lease = match self.pool.acquire(Some(event.project_id), self.acquire_timeout).await {
            Ok(lease) => lease,
            Err(err @ CoreError::Transient(_)) => {
                tracing::warn!(role = %self.role, error = %err, "no agent available");
                let queue = TaskLifecycleQueue::new(
                    self.broker.clone(),
                    Uuid::nil(),
                    format!("{}-pool", self.role),
                    Some(event.project_id),
                );
                let execution_id = Uuid::new_v4();
                queue.start_task(task_id, execution_id)?;
                queue.fail_task(
                    task_id,
                    Some(execution_id),
                    err.to_string(),
                    Some("Transient".into()),
                    0,
                    true,
                )?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let agent = lease.agent().clone();
        let queue = TaskLifecycleQueue::new(
            self.broker.clone(),
            agent.id,
            agent.name.clone(),
            Some(event.project_id),
        );
        let execution_id = Uuid::new_v4();
        let resuming = event.reason == RESUME_REASON;
        if resuming {
            // The task already emitted `started` before it was suspended;
            // keep its lifecycle a single started..terminal sequence.
            queue.report_progress(task_id, Some(execution_id), 75, "resuming with user answer", 0, 0)?;
        } else {
            queue.start_task(task_id, execution_id)?;
        }
        let started = std::time::Instant::now();

        let result = self
            .handler
            .handle_task(task, self.shutdown.child_token())
            .await;
        let duration = started.elapsed();

        let tokens = result
            .structured
            .get("tokens_used")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if tokens > 0 {
            self.pool.record_usage(self.pool.model(), tokens, 1);
            if let Some(user_id) = event.user_id {
                self.credits.record(CreditActivity {
                    id: Uuid::new_v4(),
                    user_id,
                    project_id: event.project_id,
                    tokens_used: tokens,
                    model_used: self.pool.model().to_string(),
                    llm_calls: 1,
                    credits_delta: -(tokens as i64),
                    reason: format!("{} task {task_id}", self.role),
                    story_id: None,
                    agent_id: Some(agent.id),
                    created_at: chrono::Utc::now(),
                });
            }
        }

        let interrupted = result.success && result.structured.contains_key("interrupt");
        if interrupted {
            // Suspended, not finished: no terminal event until the resume.
            queue.report_progress(
                task_id,
                Some(execution_id),
                50,
                "waiting for user answer",
                0,
                0,
            )?;
        } else if result.success {
            queue.complete_task(
                task_id,
                execution_id,
                Some(serde_json::Value::Object(result.structured.clone())),
                duration.as_secs(),
            )?;
        } else {
            queue.fail_task(
                task_id,
                Some(execution_id),
                result.error_message.as_deref().unwrap_or("unknown error"),
                None,
                0,
                false,
            )?;
        }

        if !result.output.is_empty() {
            self.rooms.broadcast(
                event.project_id,
                &serde_json::json!({
                    "type": "agent_message",
                    "agent": agent.name,
                    "role": self.role.as_str(),
                    "message": result.output,
                }),
            );
        }

        lease.complete(result.success, duration.as_millis() as u64);
        Ok(())
    }
}

struct RoutingHandler(Arc<RoleConsumer>);

#[async_trait::async_trait]
impl EventHandler for RoutingHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<()> {
        self.0.handle_routing(envelope).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sy_agents::ScriptedClient;
    use sy_agents::handler::NoopProgress;
    use sy_agents::{DeveloperAgent, DeveloperConfig, ScriptedRunner};
    use sy_core::store::{PersonaStore, ProjectStore};
    use sy_core::types::{Project, TaskResult};
    use sy_events::schemas::{LifecycleKind, RoutingContext};
    use sy_events::InProcessBroker;
    use sy_pools::{AlwaysHealthy, PoolConfig};

    struct EchoAgent;

    #[async_trait::async_trait]
    impl AgentHandler for EchoAgent {
        fn role(&self) -> AgentRole {
            AgentRole::Tester
        }

        async fn handle_task(&self, task: TaskContext, _: CancellationToken) -> TaskResult {
            TaskResult::ok(format!("echo: {}", task.content))
        }
    }

    fn routing(project: Uuid, to: AgentRole, message: &str) -> AgentRoutingEvent {
        AgentRoutingEvent {
            from_agent: "team_leader".into(),
            to_agent: to,
            project_id: project,
            user_id: Some(Uuid::new_v4()),
            reason: "delegation".into(),
            context: RoutingContext {
                message_id: Some(Uuid::new_v4()),
                user_message: message.into(),
                selected_options: Vec::new(),
            },
        }
    }

    fn lifecycle_kinds(sub: &sy_events::Subscription) -> Vec<LifecycleKind> {
        let mut kinds = Vec::new();
        for (_, _, rx) in &sub.partitions {
            while let Ok(env) = rx.try_recv() {
                if let Some(kind) = LifecycleKind::from_event_type(&env.event_type) {
                    kinds.push(kind);
                }
            }
        }
        kinds
    }

    #[tokio::test]
    async fn consumer_filters_and_runs_delegations() {
        let broker = InProcessBroker::shared(2);
        let watcher = broker.subscribe(&[topics::AGENT_TASKS], "watcher");
        let projects = ProjectStore::new();
        let project = projects.insert(Project::new("demo"));
        let rooms = ProjectRooms::new(projects.clone());
        let pool = AgentPool::new(
            PoolConfig::new("tester-pool", AgentRole::Tester)
                .with_health_interval(Duration::from_secs(3600)),
            PersonaStore::new(),
            Arc::new(AlwaysHealthy),
        );
        pool.start();

        let consumer = RoleConsumer::new(
            AgentRole::Tester,
            pool.clone(),
            Arc::new(EchoAgent),
            broker.clone(),
            rooms.clone(),
            CreditLedger::new(),
            ACQUIRE_TIMEOUT,
            CancellationToken::new(),
        );
        let bus = consumer.start().unwrap();

        // Event for another role: ignored.
        broker
            .publish(
                topics::AGENT_ROUTING,
                &project.to_string(),
                routing(project, AgentRole::Developer, "not for us").envelope().unwrap(),
            )
            .unwrap();
        // Event for us: handled.
        let (_sock, rx) = rooms.connect(project);
        broker
            .publish(
                topics::AGENT_ROUTING,
                &project.to_string(),
                routing(project, AgentRole::Tester, "verify login").envelope().unwrap(),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let kinds = lifecycle_kinds(&watcher);
        assert_eq!(kinds, vec![LifecycleKind::Started, LifecycleKind::Completed]);
        assert_eq!(pool.stats().total_executions, 1);
        assert_eq!(pool.stats().successful_executions, 1);

        // The reply reached the project room.
        let message = rx.try_recv().unwrap();
        assert!(message.contains("echo: verify login"));

        bus.stop().await.unwrap();
        pool.stop();
    }

    #[tokio::test]
    async fn full_pool_records_failed_task() {
        let broker = InProcessBroker::shared(1);
        let watcher = broker.subscribe(&[topics::AGENT_TASKS], "watcher");
        let projects = ProjectStore::new();
        let project = projects.insert(Project::new("demo"));
        let rooms = ProjectRooms::new(projects.clone());
        let pool = AgentPool::new(
            PoolConfig::new("tester-pool", AgentRole::Tester)
                .with_max_agents(1)
                .with_health_interval(Duration::from_secs(3600)),
            PersonaStore::new(),
            Arc::new(AlwaysHealthy),
        );
        pool.start();
        // Hold the only agent so acquisition must time out.
        let _held = pool.acquire(None, Duration::from_millis(50)).await.unwrap();

        let consumer = RoleConsumer::new(
            AgentRole::Tester,
            pool.clone(),
            Arc::new(EchoAgent),
            broker.clone(),
            rooms,
            CreditLedger::new(),
            // Short acquire deadline so the full pool surfaces quickly.
            Duration::from_millis(50),
            CancellationToken::new(),
        );
        let bus = consumer.start().unwrap();

        broker
            .publish(
                topics::AGENT_ROUTING,
                &project.to_string(),
                routing(project, AgentRole::Tester, "verify").envelope().unwrap(),
            )
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let kinds = lifecycle_kinds(&watcher);
                if kinds.contains(&LifecycleKind::Failed) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("full pool should surface a failed task event");

        // The held agent never executed anything.
        assert_eq!(pool.stats().total_executions, 0);
        bus.stop().await.unwrap();
        pool.stop();
    }

    #[tokio::test]
    async fn story_process_reason_builds_story_task() {
        let broker = InProcessBroker::shared(1);
        let projects = ProjectStore::new();
        let workspace = tempfile::tempdir().unwrap();
        let mut project = Project::new("demo");
        project.workspace_path = Some(workspace.path().to_path_buf());
        let project_id = projects.insert(project);
        let rooms = ProjectRooms::new(projects.clone());

        let client = ScriptedClient::new("m")
            .script(
                "analyze_and_plan",
                [r#"[{"order":1,"task":"do it","file_path":"src/x.ts","action":"create"}]"#],
            )
            .script("implement", ["```ts\ndone\n```"])
            .script("review", ["DECISION: LGTM"])
            .script("summarize", ["IS_PASS: YES"]);
        let developer = DeveloperAgent::new(
            Arc::new(client),
            Arc::new(ScriptedRunner::default()),
            Arc::new(NoopProgress),
            projects.clone(),
            DeveloperConfig::default(),
        )
        .unwrap();

        let pool = AgentPool::new(
            PoolConfig::new("dev-pool", AgentRole::Developer)
                .with_health_interval(Duration::from_secs(3600)),
            PersonaStore::new(),
            Arc::new(AlwaysHealthy),
        );
        pool.start();

        let consumer = RoleConsumer::new(
            AgentRole::Developer,
            pool.clone(),
            Arc::new(developer),
            broker.clone(),
            rooms,
            CreditLedger::new(),
            ACQUIRE_TIMEOUT,
            CancellationToken::new(),
        );
        let bus = consumer.start().unwrap();

        let mut event = routing(
            project_id,
            AgentRole::Developer,
            r#"{"story_id":"s1","title":"Login","content":"login","acceptance_criteria":[]}"#,
        );
        event.reason = STORY_PROCESS_REASON.into();
        broker
            .publish(topics::AGENT_ROUTING, &project_id.to_string(), event.envelope().unwrap())
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !workspace.path().join("src/x.ts").exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("developer should write the planned file");
        // Let the consumer finish publishing and release the lease.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(pool.stats().successful_executions, 1);
        bus.stop().await.unwrap();
        pool.stop();
    }
}
