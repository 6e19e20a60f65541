//! Explicit application container.
//!
//! Everything with process lifetime is constructed here and passed down;
//! nothing is initialised through module side effects. `start` wires the
//! consumer groups and background loops, `shutdown` drains them.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use sy_agents::{
    BusinessAnalystAgent, CompletionClient, DeveloperAgent, DeveloperConfig, TesterAgent,
    TestRunner,
};
use sy_artifacts::ArtifactStore;
use sy_bridge::{ApiState, ProjectRooms};
use sy_core::context::ProjectContextCache;
use sy_core::store::{
    BacklogStore, CreditLedger, EpicStore, PersonaStore, ProjectStore, StoryStore,
};
use sy_core::types::AgentRole;
use sy_core::Result;
use sy_events::schemas::{StoryStatusEvent, UserMessageEvent};
use sy_events::{topics, EventBusClient, InProcessBroker};
use sy_kanban::KanbanController;
use sy_pools::{AgentMonitor, AgentPool, AlwaysHealthy, MetricsStore, PoolConfig};

use crate::consumers::{BrokerProgress, RoleConsumer, ACQUIRE_TIMEOUT};
use crate::dispatcher::{Dispatcher, StoryEventHandler, UserMessageHandler};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: std::net::SocketAddr,
    pub artifact_workspace_root: Option<std::path::PathBuf>,
    pub pool_max_agents: usize,
    pub health_check_interval: Duration,
    pub monitor_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([127, 0, 0, 1], 8400).into(),
            artifact_workspace_root: None,
            pool_max_agents: 4,
            health_check_interval: Duration::from_secs(60),
            monitor_interval: sy_pools::DEFAULT_MONITOR_INTERVAL,
        }
    }
}

// ---------------------------------------------------------------------------
// AppContainer
// ---------------------------------------------------------------------------

pub struct AppContainer {
    pub config: AppConfig,
    pub broker: Arc<InProcessBroker>,
    pub projects: ProjectStore,
    pub stories: StoryStore,
    pub epics: EpicStore,
    pub personas: PersonaStore,
    pub backlog: BacklogStore,
    pub credits: CreditLedger,
    pub artifacts: ArtifactStore,
    pub kanban: KanbanController,
    pub context_cache: Arc<ProjectContextCache>,
    pub rooms: Arc<ProjectRooms>,
    pub metrics: MetricsStore,
    pub monitor: Arc<AgentMonitor>,
    pub pools: Vec<Arc<AgentPool>>,
    pub shutdown: CancellationToken,
    buses: Vec<EventBusClient>,
}

impl AppContainer {
    /// Build the full container and wire the event pipeline.
    pub fn build(
        config: AppConfig,
        client: Arc<dyn CompletionClient>,
        runner: Arc<dyn TestRunner>,
    ) -> Result<Self> {
        let broker = InProcessBroker::shared(sy_events::broker::DEFAULT_PARTITIONS);
        let projects = ProjectStore::new();
        let stories = StoryStore::new();
        let epics = EpicStore::new();
        let personas = PersonaStore::new();
        let backlog = BacklogStore::new();
        let credits = CreditLedger::new();
        let artifacts = ArtifactStore::new(config.artifact_workspace_root.clone());
        let kanban = KanbanController::new(projects.clone(), stories.clone(), epics.clone());
        let context_cache = Arc::new(ProjectContextCache::in_memory());
        let rooms = ProjectRooms::new(projects.clone());
        let metrics = MetricsStore::new();
        let monitor = AgentMonitor::new(Some(metrics.clone()), config.monitor_interval);
        let shutdown = CancellationToken::new();

        let _ = sy_agents::personas::seed_default_personas(&personas);

        // Role pools.
        let mut pools = Vec::new();
        for role in AgentRole::DELEGATABLE {
            let pool = AgentPool::new(
                PoolConfig::new(format!("{role}-pool"), role)
                    .with_max_agents(config.pool_max_agents)
                    .with_health_interval(config.health_check_interval),
                personas.clone(),
                Arc::new(AlwaysHealthy),
            );
            monitor.register_pool(pool.clone());
            pools.push(pool);
        }

        let dispatcher = Dispatcher::new(
            broker.clone(),
            client.clone(),
            context_cache.clone(),
            kanban.clone(),
            stories.clone(),
            rooms.clone(),
            credits.clone(),
            shutdown.clone(),
        );

        // Dispatcher consumer group: user messages + story events.
        let dispatcher_bus = EventBusClient::new(broker.clone(), "dispatcher")
            .on(
                UserMessageEvent::EVENT_TYPE,
                Arc::new(UserMessageHandler(dispatcher.clone())),
            )
            .on(
                StoryStatusEvent::EVENT_TYPE,
                Arc::new(StoryEventHandler(dispatcher.clone())),
            );

        // Role consumers with their graph handlers.
        let mut buses = vec![dispatcher_bus];
        for pool in &pools {
            let handler: Arc<dyn sy_agents::AgentHandler> = match pool.role() {
                AgentRole::BusinessAnalyst => Arc::new(BusinessAnalystAgent::new(
                    client.clone(),
                    artifacts.clone(),
                    context_cache.clone(),
                )?),
                AgentRole::Developer => Arc::new(DeveloperAgent::new(
                    client.clone(),
                    runner.clone(),
                    Arc::new(BrokerProgress::new(broker.clone(), "developer")),
                    projects.clone(),
                    DeveloperConfig::default(),
                )?),
                AgentRole::Tester | AgentRole::TeamLeader => Arc::new(TesterAgent::new(
                    client.clone(),
                    runner.clone(),
                    artifacts.clone(),
                    projects.clone(),
                )?),
            };
            let consumer = RoleConsumer::new(
                pool.role(),
                pool.clone(),
                handler,
                broker.clone(),
                rooms.clone(),
                credits.clone(),
                ACQUIRE_TIMEOUT,
                shutdown.clone(),
            );
            buses.push(consumer.bus());
        }

        Ok(Self {
            config,
            broker,
            projects,
            stories,
            epics,
            personas,
            backlog,
            credits,
            artifacts,
            kanban,
            context_cache,
            rooms,
            metrics,
            monitor,
            pools,
            shutdown,
            buses,
        })
    }

    /// Start pools, consumers, and the monitor loop.
    pub fn start(&self) -> Result<()> {
        for pool in &self.pools {
            pool.start();
        }
        for (idx, bus) in self.buses.iter().enumerate() {
            // The dispatcher bus (index 0) also consumes story events.
            let topic_set: &[sy_events::Topic] = if idx == 0 {
                &[topics::USER_MESSAGES, topics::STORY_EVENTS]
            } else {
                &[topics::AGENT_ROUTING]
            };
            bus.start(topic_set)?;
        }
        self.monitor.start();
        tracing::info!(pools = self.pools.len(), buses = self.buses.len(), "control plane started");
        Ok(())
    }

    /// REST state for the bridge.
    pub fn api_state(&self) -> ApiState {
        ApiState {
            projects: self.projects.clone(),
            backlog: self.backlog.clone(),
            personas: self.personas.clone(),
            credits: self.credits.clone(),
            kanban: self.kanban.clone(),
        }
    }

    /// Drain consumers, stop pools and the monitor.
    pub async fn stop(&self) {
        tracing::info!("control plane shutting down");
        self.shutdown.cancel();
        for bus in &self.buses {
            if let Err(err) = bus.stop().await {
                tracing::warn!(error = %err, "bus stop failed");
            }
        }
        self.monitor.stop();
        for pool in &self.pools {
            pool.stop();
        }
    }
}
