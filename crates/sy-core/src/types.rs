use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StoryStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Backlog,
    Todo,
    InProgress,
    Review,
    Done,
}

impl StoryStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Transitions are linear forward, except `Review -> InProgress`
    /// (a rejected review sends the story back to the developer).
    pub fn can_transition_to(&self, target: &StoryStatus) -> bool {
        matches!(
            (self, target),
            (StoryStatus::Backlog, StoryStatus::Todo)
                | (StoryStatus::Todo, StoryStatus::InProgress)
                | (StoryStatus::InProgress, StoryStatus::Review)
                | (StoryStatus::Review, StoryStatus::Done)
                | (StoryStatus::Review, StoryStatus::InProgress)
        )
    }

    /// Kanban column this status maps to.
    pub fn column(&self) -> &'static str {
        match self {
            StoryStatus::Backlog => "Backlog",
            StoryStatus::Todo => "Todo",
            StoryStatus::InProgress => "InProgress",
            StoryStatus::Review => "Review",
            StoryStatus::Done => "Done",
        }
    }

    pub const COLUMN_ORDER: [&'static str; 5] =
        ["Backlog", "Todo", "InProgress", "Review", "Done"];
}

impl std::fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.column())
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Sort rank, lower pulls first (High before Medium before Low).
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

// ---------------------------------------------------------------------------
// Story
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: Uuid,
    pub project_id: Uuid,
    pub epic_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub status: StoryStatus,
    pub priority: Priority,
    pub story_points: Option<u32>,
    pub blocked: bool,
    pub blocked_reason: Option<String>,
    pub assignee_id: Option<Uuid>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Timestamp of the most recent status change; the age of a story in its
    /// current column is measured from here.
    pub status_changed_at: DateTime<Utc>,
}

impl Story {
    pub fn new(project_id: Uuid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            epic_id: None,
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            status: StoryStatus::Backlog,
            priority: Priority::Medium,
            story_points: None,
            blocked: false,
            blocked_reason: None,
            assignee_id: None,
            archived: false,
            created_at: now,
            updated_at: now,
            status_changed_at: now,
        }
    }

    /// Hours spent in the current status as of `now`.
    pub fn age_in_status_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.status_changed_at).num_seconds().max(0) as f64 / 3600.0
    }
}

// ---------------------------------------------------------------------------
// Epic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub domain: String,
    pub created_at: DateTime<Utc>,
}

impl Epic {
    pub fn new(project_id: Uuid, title: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            title: title.into(),
            domain: domain.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// WIP configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WipLimitKind {
    /// Blocks admission when the column is at its limit.
    Hard,
    /// Admits with a warning when the column is at its limit.
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipLimit {
    pub limit: u32,
    pub kind: WipLimitKind,
}

impl WipLimit {
    pub fn hard(limit: u32) -> Self {
        Self {
            limit,
            kind: WipLimitKind::Hard,
        }
    }

    pub fn soft(limit: u32) -> Self {
        Self {
            limit,
            kind: WipLimitKind::Soft,
        }
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub tech_stack: Vec<String>,
    /// Per-column WIP configuration, keyed by column name.
    pub wip_limits: HashMap<String, WipLimit>,
    /// Agent currently fronting the project in the UI, if any.
    pub active_agent_id: Option<Uuid>,
    /// Whether any websocket is currently attached to this project's room.
    pub has_live_sockets: bool,
    pub workspace_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            tech_stack: Vec::new(),
            wip_limits: HashMap::new(),
            active_agent_id: None,
            has_live_sockets: false,
            workspace_path: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentRole / AgentStatus / Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    TeamLeader,
    BusinessAnalyst,
    Developer,
    Tester,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::TeamLeader => "team_leader",
            AgentRole::BusinessAnalyst => "business_analyst",
            AgentRole::Developer => "developer",
            AgentRole::Tester => "tester",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "team_leader" => Some(AgentRole::TeamLeader),
            "business_analyst" => Some(AgentRole::BusinessAnalyst),
            "developer" => Some(AgentRole::Developer),
            "tester" => Some(AgentRole::Tester),
            _ => None,
        }
    }

    /// Kanban column whose WIP limit gates delegation to this role.
    /// The team leader itself is never gated.
    pub fn wip_column(&self) -> Option<&'static str> {
        match self {
            AgentRole::TeamLeader => None,
            AgentRole::BusinessAnalyst => Some("Todo"),
            AgentRole::Developer => Some("InProgress"),
            AgentRole::Tester => Some("Review"),
        }
    }

    pub const DELEGATABLE: [AgentRole; 3] = [
        AgentRole::BusinessAnalyst,
        AgentRole::Developer,
        AgentRole::Tester,
    ];
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Unhealthy,
    Terminated,
}

/// A live worker owned by a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    pub role: AgentRole,
    pub name: String,
    pub status: AgentStatus,
    pub persona_id: Option<Uuid>,
    pub pool_name: String,
    pub spawned_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Agent {
    pub fn new(role: AgentRole, name: impl Into<String>, pool_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id: None,
            role,
            name: name.into(),
            status: AgentStatus::Idle,
            persona_id: None,
            pool_name: pool_name.into(),
            spawned_at: now,
            last_seen: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Persona
// ---------------------------------------------------------------------------

/// A template of traits and style applied to a role-specialized agent.
/// Uniqueness is enforced on `(name, role)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: Uuid,
    pub name: String,
    pub role: AgentRole,
    pub summary: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Persona {
    pub fn new(name: impl Into<String>, role: AgentRole, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            role,
            summary: summary.into(),
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskContext / TaskResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Message,
    StoryProcess,
    ResumeWithAnswer,
    Review,
    HealthPing,
}

/// A single unit of work handed to an agent. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub priority: Priority,
    pub project_id: Uuid,
    pub user_id: Option<Uuid>,
    pub routing_reason: Option<String>,
    pub content: String,
    pub attachments: Vec<String>,
    /// Answer supplied on a `ResumeWithAnswer` task.
    pub answer: Option<String>,
    /// Options the user selected on a multi-choice question. The first entry
    /// substitutes for an empty `answer`.
    pub selected_options: Vec<String>,
    /// Deadline inherited from the source event; nodes propagate it to
    /// downstream calls.
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskContext {
    pub fn message(project_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            task_type: TaskType::Message,
            priority: Priority::Medium,
            project_id,
            user_id: None,
            routing_reason: None,
            content: content.into(),
            attachments: Vec::new(),
            answer: None,
            selected_options: Vec::new(),
            deadline: None,
        }
    }

    pub fn story_process(project_id: Uuid, story_payload: impl Into<String>) -> Self {
        Self {
            priority: Priority::High,
            task_type: TaskType::StoryProcess,
            ..Self::message(project_id, story_payload)
        }
    }

    pub fn resume(project_id: Uuid, thread_id: Uuid, answer: impl Into<String>) -> Self {
        Self {
            task_id: thread_id,
            task_type: TaskType::ResumeWithAnswer,
            answer: Some(answer.into()),
            ..Self::message(project_id, "")
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Effective answer for resume tasks: explicit answer, or the first
    /// selected option when the answer is empty.
    pub fn effective_answer(&self) -> Option<&str> {
        match self.answer.as_deref() {
            Some(a) if !a.is_empty() => Some(a),
            _ => self.selected_options.first().map(|s| s.as_str()),
        }
    }
}

/// Outcome of a single task invocation. Produced exactly once per invocation;
/// may reflect a cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: String,
    pub structured: serde_json::Map<String, serde_json::Value>,
    pub error_message: Option<String>,
}

impl TaskResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            structured: serde_json::Map::new(),
            error_message: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            structured: serde_json::Map::new(),
            error_message: Some(error.into()),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.structured.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Backlog items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogItem {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub item_type: String,
    pub status: String,
    pub sprint_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    /// Dense rank within the `(status, sprint)` column.
    pub rank: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of a backlog item move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemActivity {
    pub id: Uuid,
    pub item_id: Uuid,
    pub status_from: String,
    pub status_to: String,
    pub rank_from: u32,
    pub rank_to: u32,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Credit accounting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditActivity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub tokens_used: u64,
    pub model_used: String,
    pub llm_calls: u32,
    /// Negative values are spend.
    pub credits_delta: i64,
    pub reason: String,
    pub story_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreditSummary {
    pub total_tokens: u64,
    pub total_llm_calls: u64,
    pub credits_spent: i64,
    pub top_model: Option<String>,
    pub top_agent: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn story_status_linear_forward() {
        assert!(StoryStatus::Backlog.can_transition_to(&StoryStatus::Todo));
        assert!(StoryStatus::Todo.can_transition_to(&StoryStatus::InProgress));
        assert!(StoryStatus::InProgress.can_transition_to(&StoryStatus::Review));
        assert!(StoryStatus::Review.can_transition_to(&StoryStatus::Done));
    }

    #[test]
    fn story_status_review_rejection() {
        assert!(StoryStatus::Review.can_transition_to(&StoryStatus::InProgress));
    }

    #[test]
    fn story_status_no_skipping_or_backwards() {
        assert!(!StoryStatus::Backlog.can_transition_to(&StoryStatus::InProgress));
        assert!(!StoryStatus::Todo.can_transition_to(&StoryStatus::Done));
        assert!(!StoryStatus::Done.can_transition_to(&StoryStatus::Review));
        assert!(!StoryStatus::InProgress.can_transition_to(&StoryStatus::Todo));
    }

    #[test]
    fn priority_rank_orders_high_first() {
        assert!(Priority::High.rank() < Priority::Medium.rank());
        assert!(Priority::Medium.rank() < Priority::Low.rank());
    }

    #[test]
    fn story_age_measured_from_status_change() {
        let mut story = Story::new(Uuid::new_v4(), "login form");
        story.status_changed_at = Utc::now() - chrono::Duration::hours(6);
        let age = story.age_in_status_hours(Utc::now());
        assert!((5.9..6.1).contains(&age), "age was {age}");
    }

    #[test]
    fn role_wip_columns() {
        assert_eq!(AgentRole::Developer.wip_column(), Some("InProgress"));
        assert_eq!(AgentRole::Tester.wip_column(), Some("Review"));
        assert_eq!(AgentRole::TeamLeader.wip_column(), None);
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in [
            AgentRole::TeamLeader,
            AgentRole::BusinessAnalyst,
            AgentRole::Developer,
            AgentRole::Tester,
        ] {
            assert_eq!(AgentRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(AgentRole::parse("scrum_master"), None);
    }

    #[test]
    fn resume_answer_falls_back_to_selected_option() {
        let mut task = TaskContext::resume(Uuid::new_v4(), Uuid::new_v4(), "");
        task.selected_options = vec!["Option B".into()];
        assert_eq!(task.effective_answer(), Some("Option B"));

        let task = TaskContext::resume(Uuid::new_v4(), Uuid::new_v4(), "typed answer");
        assert_eq!(task.effective_answer(), Some("typed answer"));
    }

    #[test]
    fn task_context_serde_round_trip() {
        let task = TaskContext::story_process(Uuid::new_v4(), "{\"title\":\"s\"}");
        let json = serde_json::to_string(&task).unwrap();
        let back: TaskContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_type, TaskType::StoryProcess);
        assert_eq!(back.priority, Priority::High);
    }
}
