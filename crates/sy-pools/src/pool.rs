//! Per-role agent pools.
//!
//! A pool owns a set of interchangeable worker agents sharing one role and
//! LLM configuration. `acquire` hands out an idle agent (spawning lazily up
//! to `max_agents`, otherwise blocking until release or deadline), health
//! checks run on a timer, and pool counters stay consistent with the agent
//! map under a single pool-scoped lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sy_core::store::PersonaStore;
use sy_core::types::{Agent, AgentRole, AgentStatus};
use sy_core::{CoreError, Result};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Unique pool name, e.g. "developer-pool".
    pub name: String,
    pub role: AgentRole,
    pub max_agents: usize,
    pub health_check_interval: Duration,
    /// Model identifier every agent in this pool talks to.
    pub llm_model: String,
    /// Persona whitelist for spawns; empty means any persona (or none).
    pub allowed_persona_ids: Vec<Uuid>,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, role: AgentRole) -> Self {
        Self {
            name: name.into(),
            role,
            max_agents: 4,
            health_check_interval: Duration::from_secs(60),
            llm_model: "default".into(),
            allowed_persona_ids: Vec::new(),
        }
    }

    pub fn with_max_agents(mut self, max: usize) -> Self {
        self.max_agents = max.max(1);
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.llm_model = model.into();
        self
    }

    pub fn with_allowed_personas(mut self, ids: Vec<Uuid>) -> Self {
        self.allowed_persona_ids = ids;
        self
    }
}

// ---------------------------------------------------------------------------
// Health probing
// ---------------------------------------------------------------------------

/// Liveness probe for pool workers. Production wires this to the agent's
/// session transport; tests script it.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn ping(&self, agent: &Agent) -> bool;
}

pub struct AlwaysHealthy;

#[async_trait::async_trait]
impl HealthProbe for AlwaysHealthy {
    async fn ping(&self, _agent: &Agent) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct PoolStats {
    pub total_agents: usize,
    pub busy_agents: usize,
    pub idle_agents: usize,
    pub unhealthy_agents: usize,
    pub total_spawned: u64,
    pub total_terminated: u64,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub is_active: bool,
}

/// Counters accumulated since the last metrics snapshot.
#[derive(Debug, Clone)]
pub struct WindowCounters {
    pub tokens_per_model: HashMap<String, u64>,
    pub requests_per_model: HashMap<String, u64>,
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub duration_ms_total: u64,
    pub peak_agent_count: usize,
    pub agent_count_sum: u64,
    pub agent_count_samples: u64,
    pub window_started: chrono::DateTime<Utc>,
}

impl Default for WindowCounters {
    fn default() -> Self {
        Self {
            tokens_per_model: HashMap::new(),
            requests_per_model: HashMap::new(),
            executions: 0,
            successes: 0,
            failures: 0,
            duration_ms_total: 0,
            peak_agent_count: 0,
            agent_count_sum: 0,
            agent_count_samples: 0,
            window_started: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Worker {
    agent: Agent,
    consecutive_health_failures: u32,
    failed_last_health_check: bool,
}

struct PoolState {
    workers: HashMap<Uuid, Worker>,
    is_active: bool,
    total_spawned: u64,
    total_terminated: u64,
    total_executions: u64,
    successful_executions: u64,
    failed_executions: u64,
    window: WindowCounters,
}

impl PoolState {
    fn new() -> Self {
        Self {
            workers: HashMap::new(),
            is_active: false,
            total_spawned: 0,
            total_terminated: 0,
            total_executions: 0,
            successful_executions: 0,
            failed_executions: 0,
            window: WindowCounters {
                window_started: Utc::now(),
                ..Default::default()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// AgentPool
// ---------------------------------------------------------------------------

pub struct AgentPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Wakes acquirers blocked on a full pool.
    released: tokio::sync::Notify,
    personas: PersonaStore,
    probe: Arc<dyn HealthProbe>,
    /// Regenerated on every start so a stopped pool can come back with a
    /// live health loop.
    shutdown: Mutex<CancellationToken>,
    health_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AgentPool {
    pub fn new(config: PoolConfig, personas: PersonaStore, probe: Arc<dyn HealthProbe>) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(PoolState::new()),
            released: tokio::sync::Notify::new(),
            personas,
            probe,
            shutdown: Mutex::new(CancellationToken::new()),
            health_task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn role(&self) -> AgentRole {
        self.config.role
    }

    pub fn model(&self) -> &str {
        &self.config.llm_model
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    // === Lifecycle ===

    /// Activate the pool and start the health loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_active {
                return;
            }
            state.is_active = true;
        }

        let pool = Arc::clone(self);
        let interval = self.config.health_check_interval;
        let shutdown = {
            let mut guard = self.shutdown.lock().unwrap();
            *guard = CancellationToken::new();
            guard.clone()
        };
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => pool.run_health_check().await,
                }
            }
        });
        *self.health_task.lock().unwrap() = Some(handle);
        tracing::info!(pool = %self.config.name, role = %self.config.role, "pool started");
    }

    /// Deactivate the pool: terminate every owned agent, stop the health
    /// loop, and fail blocked acquirers.
    pub fn stop(&self) {
        let terminated: Vec<Uuid> = {
            let mut state = self.state.lock().unwrap();
            if !state.is_active {
                return;
            }
            state.is_active = false;
            let ids: Vec<Uuid> = state.workers.keys().copied().collect();
            for id in &ids {
                Self::terminate_locked(&mut state, &self.personas, *id);
            }
            ids
        };
        self.shutdown.lock().unwrap().cancel();
        if let Some(handle) = self.health_task.lock().unwrap().take() {
            handle.abort();
        }
        self.released.notify_waiters();
        tracing::info!(pool = %self.config.name, terminated = terminated.len(), "pool stopped");
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().is_active
    }

    // === Spawn / terminate ===

    /// Spawn a worker outside the acquire path (admin surface).
    pub fn spawn(&self, project_id: Option<Uuid>, persona_id: Option<Uuid>) -> Result<Agent> {
        let mut state = self.state.lock().unwrap();
        if !state.is_active {
            return Err(CoreError::Conflict(format!(
                "pool {} is not active",
                self.config.name
            )));
        }
        self.spawn_locked(&mut state, project_id, persona_id)
    }

    fn spawn_locked(
        &self,
        state: &mut PoolState,
        project_id: Option<Uuid>,
        persona_id: Option<Uuid>,
    ) -> Result<Agent> {
        if state.workers.len() >= self.config.max_agents {
            return Err(CoreError::Conflict(format!(
                "pool {} is at max_agents ({})",
                self.config.name, self.config.max_agents
            )));
        }

        let persona = match persona_id {
            Some(id) => {
                if !self.config.allowed_persona_ids.is_empty()
                    && !self.config.allowed_persona_ids.contains(&id)
                {
                    return Err(CoreError::Validation(format!(
                        "persona {id} is not allowed in pool {}",
                        self.config.name
                    )));
                }
                Some(self.personas.get(id)?)
            }
            None => None,
        };

        let name = persona
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| format!("{}-{}", self.config.role, state.total_spawned + 1));

        let mut agent = Agent::new(self.config.role, name, self.config.name.clone());
        agent.project_id = project_id;
        agent.persona_id = persona.as_ref().map(|p| p.id);

        if let Some(p) = &persona {
            self.personas.retain(p.id);
        }

        state.total_spawned += 1;
        state
            .workers
            .insert(agent.id, Worker {
                agent: agent.clone(),
                consecutive_health_failures: 0,
                failed_last_health_check: false,
            });
        state.window.peak_agent_count = state.window.peak_agent_count.max(state.workers.len());

        tracing::info!(pool = %self.config.name, agent = %agent.id, name = %agent.name, "agent spawned");
        Ok(agent)
    }

    /// Terminate a worker by id.
    pub fn terminate(&self, agent_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.workers.contains_key(&agent_id) {
            return Err(CoreError::NotFound(format!("agent {agent_id}")));
        }
        Self::terminate_locked(&mut state, &self.personas, agent_id);
        drop(state);
        self.released.notify_one();
        Ok(())
    }

    fn terminate_locked(state: &mut PoolState, personas: &PersonaStore, agent_id: Uuid) {
        if let Some(mut worker) = state.workers.remove(&agent_id) {
            worker.agent.status = AgentStatus::Terminated;
            if let Some(persona_id) = worker.agent.persona_id {
                personas.release(persona_id);
            }
            state.total_terminated += 1;
            tracing::info!(agent = %agent_id, "agent terminated");
        }
    }

    // === Acquire / release ===

    /// Acquire an idle agent, spawning lazily below `max_agents`, otherwise
    /// blocking until a release or the timeout.
    pub async fn acquire(
        self: &Arc<Self>,
        project_id: Option<Uuid>,
        timeout: Duration,
    ) -> Result<AgentLease> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if !state.is_active {
                    return Err(CoreError::Conflict(format!(
                        "pool {} is not active",
                        self.config.name
                    )));
                }

                let idle = state
                    .workers
                    .values()
                    .find(|w| w.agent.status == AgentStatus::Idle)
                    .map(|w| w.agent.id);
                if let Some(id) = idle {
                    let worker = state.workers.get_mut(&id).expect("just found");
                    worker.agent.status = AgentStatus::Busy;
                    worker.agent.project_id = project_id.or(worker.agent.project_id);
                    worker.agent.last_seen = Utc::now();
                    let agent = worker.agent.clone();
                    return Ok(AgentLease::new(Arc::clone(self), agent));
                }

                if state.workers.len() < self.config.max_agents {
                    let agent = self.spawn_locked(&mut state, project_id, None)?;
                    let worker = state.workers.get_mut(&agent.id).expect("just spawned");
                    worker.agent.status = AgentStatus::Busy;
                    let agent = worker.agent.clone();
                    return Ok(AgentLease::new(Arc::clone(self), agent));
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(CoreError::Transient(format!(
                    "pool {}: no agent available within deadline",
                    self.config.name
                )));
            }
            tokio::select! {
                _ = self.released.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(CoreError::Transient(format!(
                        "pool {}: no agent available within deadline",
                        self.config.name
                    )));
                }
            }
        }
    }

    fn release(&self, agent_id: Uuid, execution: Option<ExecutionRecord>) {
        {
            let mut state = self.state.lock().unwrap();

            if let Some(record) = execution {
                state.total_executions += 1;
                state.window.executions += 1;
                state.window.duration_ms_total += record.duration_ms;
                if record.success {
                    state.successful_executions += 1;
                    state.window.successes += 1;
                } else {
                    state.failed_executions += 1;
                    state.window.failures += 1;
                }
            }

            let terminate = match state.workers.get_mut(&agent_id) {
                Some(worker) => {
                    if worker.failed_last_health_check {
                        true
                    } else {
                        worker.agent.status = AgentStatus::Idle;
                        worker.agent.last_seen = Utc::now();
                        false
                    }
                }
                None => false,
            };
            if terminate {
                // Failed its last health check while busy: terminate instead
                // of returning to idle; replacement is lazy.
                Self::terminate_locked(&mut state, &self.personas, agent_id);
            }
        }
        self.released.notify_one();
    }

    /// Record LLM usage attributed to this pool's window.
    pub fn record_usage(&self, model: &str, tokens: u64, requests: u64) {
        let mut state = self.state.lock().unwrap();
        *state
            .window
            .tokens_per_model
            .entry(model.to_string())
            .or_insert(0) += tokens;
        *state
            .window
            .requests_per_model
            .entry(model.to_string())
            .or_insert(0) += requests;
    }

    // === Health ===

    pub async fn run_health_check(&self) {
        let workers: Vec<Agent> = {
            let state = self.state.lock().unwrap();
            state.workers.values().map(|w| w.agent.clone()).collect()
        };

        for agent in workers {
            let healthy = self.probe.ping(&agent).await;
            let mut state = self.state.lock().unwrap();
            let Some(worker) = state.workers.get_mut(&agent.id) else {
                continue;
            };

            if healthy {
                worker.consecutive_health_failures = 0;
                worker.failed_last_health_check = false;
                if worker.agent.status == AgentStatus::Unhealthy {
                    worker.agent.status = AgentStatus::Idle;
                }
                worker.agent.last_seen = Utc::now();
                continue;
            }

            worker.consecutive_health_failures += 1;
            worker.failed_last_health_check = true;
            let busy = worker.agent.status == AgentStatus::Busy;
            if !busy {
                // Drain the agent of new work.
                worker.agent.status = AgentStatus::Unhealthy;
            }
            tracing::warn!(
                pool = %self.config.name, agent = %agent.id,
                failures = worker.consecutive_health_failures, "health check failed"
            );

            if worker.consecutive_health_failures >= 2 && !busy {
                Self::terminate_locked(&mut state, &self.personas, agent.id);
            }
        }

        // Sample counts for the avg/peak window metrics.
        let mut state = self.state.lock().unwrap();
        let count = state.workers.len();
        state.window.peak_agent_count = state.window.peak_agent_count.max(count);
        state.window.agent_count_sum += count as u64;
        state.window.agent_count_samples += 1;
    }

    // === Stats & metrics ===

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        let mut stats = PoolStats {
            total_agents: state.workers.len(),
            total_spawned: state.total_spawned,
            total_terminated: state.total_terminated,
            total_executions: state.total_executions,
            successful_executions: state.successful_executions,
            failed_executions: state.failed_executions,
            is_active: state.is_active,
            ..Default::default()
        };
        for worker in state.workers.values() {
            match worker.agent.status {
                AgentStatus::Busy => stats.busy_agents += 1,
                AgentStatus::Idle => stats.idle_agents += 1,
                AgentStatus::Unhealthy => stats.unhealthy_agents += 1,
                AgentStatus::Terminated => {}
            }
        }
        stats
    }

    pub fn list_agents(&self) -> Vec<Agent> {
        self.state
            .lock()
            .unwrap()
            .workers
            .values()
            .map(|w| w.agent.clone())
            .collect()
    }

    /// Drain the window counters for a metrics snapshot, resetting the
    /// window.
    pub fn drain_window(&self) -> WindowCounters {
        let mut state = self.state.lock().unwrap();
        let drained = std::mem::take(&mut state.window);
        state.window.window_started = Utc::now();
        state.window.peak_agent_count = state.workers.len();
        drained
    }
}

struct ExecutionRecord {
    success: bool,
    duration_ms: u64,
}

// ---------------------------------------------------------------------------
// AgentLease
// ---------------------------------------------------------------------------

/// RAII lease on a pool worker. Call [`complete`](Self::complete) to record
/// the execution outcome; a lease dropped without completing returns the
/// agent to idle without touching execution counters.
pub struct AgentLease {
    pool: Arc<AgentPool>,
    agent: Agent,
    done: bool,
}

impl std::fmt::Debug for AgentLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLease")
            .field("agent", &self.agent)
            .field("done", &self.done)
            .finish()
    }
}

impl AgentLease {
    fn new(pool: Arc<AgentPool>, agent: Agent) -> Self {
        Self {
            pool,
            agent,
            done: false,
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Release the agent, recording the execution outcome.
    pub fn complete(mut self, success: bool, duration_ms: u64) {
        self.done = true;
        self.pool.release(
            self.agent.id,
            Some(ExecutionRecord {
                success,
                duration_ms,
            }),
        );
    }
}

impl Drop for AgentLease {
    fn drop(&mut self) {
        if !self.done {
            self.pool.release(self.agent.id, None);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
