//! Kanban board state and WIP flow control.
//!
//! Provides the board snapshot agents reason over, enforces per-column WIP
//! limits (hard limits block admission, soft limits admit with a warning),
//! detects aging bottlenecks, suggests the next pull, and accounts for flow
//! metrics over a story transition log.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sy_core::store::{EpicStore, ProjectStore, StoryStore};
use sy_core::types::{Priority, StoryStatus, WipLimitKind};
use sy_core::Result;

pub const DEFAULT_AGING_THRESHOLD_HOURS: f64 = 48.0;

// ---------------------------------------------------------------------------
// Board types
// ---------------------------------------------------------------------------

/// One story as it appears on the board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardCard {
    pub id: Uuid,
    pub title: String,
    pub status: StoryStatus,
    pub priority: Priority,
    pub story_points: Option<u32>,
    pub age_hours: f64,
    pub epic_id: Option<Uuid>,
    pub blocked: bool,
}

/// Column name -> cards, in the canonical column order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub columns: Vec<(String, Vec<BoardCard>)>,
}

impl BoardSnapshot {
    pub fn column(&self, name: &str) -> &[BoardCard] {
        self.columns
            .iter()
            .find(|(col, _)| col == name)
            .map(|(_, cards)| cards.as_slice())
            .unwrap_or(&[])
    }

    pub fn total_cards(&self) -> usize {
        self.columns.iter().map(|(_, cards)| cards.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnWip {
    pub current: usize,
    pub limit: u32,
    pub utilization: f64,
    pub available: u32,
    pub kind: WipLimitKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bottleneck {
    pub column: String,
    pub aging_count: usize,
    pub oldest_age_hours: f64,
    /// Top 3 oldest offenders.
    pub stories: Vec<BoardCard>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpicProgress {
    pub total: usize,
    pub done: usize,
    pub percentage: f64,
    pub in_progress: usize,
    pub in_review: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicProgressEntry {
    pub epic_id: Uuid,
    pub title: String,
    pub domain: String,
    pub progress: EpicProgress,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowMetrics {
    pub avg_cycle_time_hours: f64,
    pub avg_lead_time_hours: f64,
    pub throughput_per_week: f64,
    pub total_completed: usize,
    pub work_in_progress: usize,
}

#[derive(Debug, Clone)]
struct TransitionRecord {
    story_id: Uuid,
    project_id: Uuid,
    to: StoryStatus,
    at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// KanbanController
// ---------------------------------------------------------------------------

/// Board state manager consulted by the router before any delegation.
#[derive(Clone)]
pub struct KanbanController {
    projects: ProjectStore,
    stories: StoryStore,
    epics: EpicStore,
    transitions: Arc<RwLock<Vec<TransitionRecord>>>,
}

impl KanbanController {
    pub fn new(projects: ProjectStore, stories: StoryStore, epics: EpicStore) -> Self {
        Self {
            projects,
            stories,
            epics,
            transitions: Arc::new(RwLock::new(Vec::new())),
        }
    }

    // === Board state ===

    /// Current board snapshot. Every non-archived story appears in exactly
    /// one column, derived from its status.
    pub fn snapshot(&self, project_id: Uuid) -> BoardSnapshot {
        let now = Utc::now();
        let mut columns: Vec<(String, Vec<BoardCard>)> = StoryStatus::COLUMN_ORDER
            .iter()
            .map(|name| (name.to_string(), Vec::new()))
            .collect();

        for story in self.stories.list_by_project(project_id) {
            let card = BoardCard {
                id: story.id,
                title: story.title.clone(),
                status: story.status,
                priority: story.priority,
                story_points: story.story_points,
                age_hours: story.age_in_status_hours(now),
                epic_id: story.epic_id,
                blocked: story.blocked,
            };
            let column = story.status.column();
            if let Some((_, cards)) = columns.iter_mut().find(|(name, _)| name == column) {
                cards.push(card);
            }
        }

        BoardSnapshot { columns }
    }

    // === WIP limits ===

    /// WIP status for every column the project configures a limit on.
    pub fn wip_status(&self, project_id: Uuid) -> Result<HashMap<String, ColumnWip>> {
        let project = self.projects.get(project_id)?;
        let board = self.snapshot(project_id);

        let mut out = HashMap::new();
        for (column, config) in &project.wip_limits {
            let current = board.column(column).len();
            out.insert(
                column.clone(),
                ColumnWip {
                    current,
                    limit: config.limit,
                    utilization: if config.limit > 0 {
                        current as f64 / config.limit as f64
                    } else {
                        0.0
                    },
                    available: (config.limit as i64 - current as i64).max(0) as u32,
                    kind: config.kind,
                },
            );
        }
        Ok(out)
    }

    /// Whether work can be pulled into `column`, and why.
    pub fn can_pull(&self, project_id: Uuid, column: &str) -> Result<(bool, String)> {
        let wip = self.wip_status(project_id)?;
        let Some(status) = wip.get(column) else {
            return Ok((true, "No WIP limit configured".to_string()));
        };

        if status.available > 0 {
            return Ok((
                true,
                format!("Capacity available: {} slots", status.available),
            ));
        }

        match status.kind {
            WipLimitKind::Hard => Ok((false, format!("WIP limit reached ({})", status.limit))),
            WipLimitKind::Soft => Ok((
                true,
                format!(
                    "Soft WIP limit ({}) - can proceed with caution",
                    status.limit
                ),
            )),
        }
    }

    // === Bottlenecks & pull suggestion ===

    /// Columns of Todo/InProgress/Review holding items older than the
    /// threshold, with the top 3 oldest offenders each.
    pub fn detect_bottlenecks(&self, project_id: Uuid, threshold_hours: f64) -> Vec<Bottleneck> {
        let board = self.snapshot(project_id);
        let mut bottlenecks = Vec::new();

        for column in ["Todo", "InProgress", "Review"] {
            let mut aging: Vec<BoardCard> = board
                .column(column)
                .iter()
                .filter(|card| card.age_hours > threshold_hours)
                .cloned()
                .collect();
            if aging.is_empty() {
                continue;
            }
            aging.sort_by(|a, b| b.age_hours.total_cmp(&a.age_hours));
            let oldest = aging[0].age_hours;
            bottlenecks.push(Bottleneck {
                column: column.to_string(),
                aging_count: aging.len(),
                oldest_age_hours: oldest,
                stories: aging.into_iter().take(3).collect(),
            });
        }

        bottlenecks
    }

    /// Suggest which story to pull next from `from_column`: highest priority
    /// first, oldest first within a priority. Blocked stories sort last so
    /// they are only suggested when nothing unblocked remains.
    pub fn suggest_next_pull(&self, project_id: Uuid, from_column: &str) -> Option<BoardCard> {
        let board = self.snapshot(project_id);
        let mut candidates: Vec<BoardCard> = board.column(from_column).to_vec();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| {
            a.blocked
                .cmp(&b.blocked)
                .then(a.priority.rank().cmp(&b.priority.rank()))
                .then(b.age_hours.total_cmp(&a.age_hours))
        });
        candidates.into_iter().next()
    }

    // === Epic progress ===

    pub fn epic_progress(&self, project_id: Uuid, epic_id: Uuid) -> EpicProgress {
        let stories = self.stories.list_by_epic(project_id, epic_id);
        if stories.is_empty() {
            return EpicProgress::default();
        }

        let total = stories.len();
        let done = stories
            .iter()
            .filter(|s| s.status == StoryStatus::Done)
            .count();
        EpicProgress {
            total,
            done,
            percentage: done as f64 / total as f64 * 100.0,
            in_progress: stories
                .iter()
                .filter(|s| s.status == StoryStatus::InProgress)
                .count(),
            in_review: stories
                .iter()
                .filter(|s| s.status == StoryStatus::Review)
                .count(),
        }
    }

    pub fn all_epics_progress(&self, project_id: Uuid) -> Vec<EpicProgressEntry> {
        self.epics
            .list_by_project(project_id)
            .into_iter()
            .map(|epic| EpicProgressEntry {
                epic_id: epic.id,
                title: epic.title,
                domain: epic.domain,
                progress: self.epic_progress(project_id, epic.id),
            })
            .collect()
    }

    // === Flow metrics ===

    /// Record a story status transition for flow accounting. The daemon
    /// feeds this from the story events topic.
    pub fn record_transition(
        &self,
        story_id: Uuid,
        project_id: Uuid,
        to: StoryStatus,
        at: DateTime<Utc>,
    ) {
        self.transitions.write().unwrap().push(TransitionRecord {
            story_id,
            project_id,
            to,
            at,
        });
    }

    /// Lean flow metrics over completions inside the trailing window.
    ///
    /// Cycle time runs from the first InProgress entry to Done; lead time
    /// from story creation to Done.
    pub fn flow_metrics(&self, project_id: Uuid, days: i64) -> FlowMetrics {
        let now = Utc::now();
        let window_start = now - chrono::Duration::days(days.max(1));
        let transitions = self.transitions.read().unwrap();

        let mut first_in_progress: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
        let mut done_at: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
        for record in transitions.iter().filter(|t| t.project_id == project_id) {
            match record.to {
                StoryStatus::InProgress => {
                    first_in_progress.entry(record.story_id).or_insert(record.at);
                }
                StoryStatus::Done => {
                    done_at.insert(record.story_id, record.at);
                }
                _ => {}
            }
        }

        let mut cycle_hours = Vec::new();
        let mut lead_hours = Vec::new();
        for (story_id, done) in done_at.iter().filter(|(_, at)| **at >= window_start) {
            if let Some(started) = first_in_progress.get(story_id) {
                cycle_hours.push((*done - *started).num_seconds().max(0) as f64 / 3600.0);
            }
            if let Ok(story) = self.stories.get(*story_id) {
                lead_hours.push((*done - story.created_at).num_seconds().max(0) as f64 / 3600.0);
            }
        }

        let total_completed = done_at.values().filter(|at| **at >= window_start).count();
        let weeks = days.max(1) as f64 / 7.0;
        let board = self.snapshot(project_id);
        let wip = ["Todo", "InProgress", "Review"]
            .iter()
            .map(|c| board.column(c).len())
            .sum();

        let avg = |v: &[f64]| {
            if v.is_empty() {
                0.0
            } else {
                v.iter().sum::<f64>() / v.len() as f64
            }
        };

        FlowMetrics {
            avg_cycle_time_hours: avg(&cycle_hours),
            avg_lead_time_hours: avg(&lead_hours),
            throughput_per_week: total_completed as f64 / weeks,
            total_completed,
            work_in_progress: wip,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sy_core::types::{Epic, Project, Story, WipLimit};

    struct Fixture {
        projects: ProjectStore,
        stories: StoryStore,
        epics: EpicStore,
        controller: KanbanController,
        project_id: Uuid,
    }

    fn fixture() -> Fixture {
        let projects = ProjectStore::new();
        let stories = StoryStore::new();
        let epics = EpicStore::new();
        let project_id = projects.insert(Project::new("demo"));
        let controller = KanbanController::new(projects.clone(), stories.clone(), epics.clone());
        Fixture {
            projects,
            stories,
            epics,
            controller,
            project_id,
        }
    }

    fn story_in(f: &Fixture, status: StoryStatus, title: &str) -> Uuid {
        let mut story = Story::new(f.project_id, title);
        story.status = status;
        f.stories.insert(story)
    }

    #[test]
    fn every_story_in_exactly_one_column() {
        let f = fixture();
        story_in(&f, StoryStatus::Backlog, "a");
        story_in(&f, StoryStatus::Todo, "b");
        story_in(&f, StoryStatus::InProgress, "c");
        story_in(&f, StoryStatus::Review, "d");
        story_in(&f, StoryStatus::Done, "e");

        let board = f.controller.snapshot(f.project_id);
        assert_eq!(board.total_cards(), f.stories.list_by_project(f.project_id).len());
        for column in StoryStatus::COLUMN_ORDER {
            assert_eq!(board.column(column).len(), 1, "column {column}");
        }
    }

    #[test]
    fn hard_limit_blocks_at_capacity() {
        let f = fixture();
        f.projects
            .set_wip_limit(f.project_id, "InProgress", WipLimit::hard(2))
            .unwrap();
        story_in(&f, StoryStatus::InProgress, "a");
        story_in(&f, StoryStatus::InProgress, "b");

        let (can, reason) = f.controller.can_pull(f.project_id, "InProgress").unwrap();
        assert!(!can);
        assert!(reason.contains("WIP limit reached"));
    }

    #[test]
    fn soft_limit_admits_with_caution() {
        let f = fixture();
        f.projects
            .set_wip_limit(f.project_id, "Review", WipLimit::soft(1))
            .unwrap();
        story_in(&f, StoryStatus::Review, "a");

        let (can, reason) = f.controller.can_pull(f.project_id, "Review").unwrap();
        assert!(can);
        assert!(reason.contains("caution"));
    }

    #[test]
    fn unconfigured_column_always_pulls() {
        let f = fixture();
        let (can, reason) = f.controller.can_pull(f.project_id, "Todo").unwrap();
        assert!(can);
        assert!(reason.contains("No WIP limit"));
    }

    #[test]
    fn wip_status_reports_availability() {
        let f = fixture();
        f.projects
            .set_wip_limit(f.project_id, "InProgress", WipLimit::hard(3))
            .unwrap();
        story_in(&f, StoryStatus::InProgress, "a");

        let wip = f.controller.wip_status(f.project_id).unwrap();
        let col = &wip["InProgress"];
        assert_eq!(col.current, 1);
        assert_eq!(col.available, 2);
        assert!((col.utilization - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn bottleneck_reports_top_three_oldest() {
        let f = fixture();
        for i in 0..5 {
            let mut story = Story::new(f.project_id, format!("aged-{i}"));
            story.status = StoryStatus::Review;
            story.status_changed_at = Utc::now() - chrono::Duration::hours(50 + i);
            f.stories.insert(story);
        }
        // One fresh story, not aging.
        story_in(&f, StoryStatus::Review, "fresh");

        let bottlenecks = f
            .controller
            .detect_bottlenecks(f.project_id, DEFAULT_AGING_THRESHOLD_HOURS);
        assert_eq!(bottlenecks.len(), 1);
        let b = &bottlenecks[0];
        assert_eq!(b.column, "Review");
        assert_eq!(b.aging_count, 5);
        assert_eq!(b.stories.len(), 3);
        assert!(b.oldest_age_hours > 53.0);
        assert_eq!(b.stories[0].title, "aged-4");
    }

    #[test]
    fn suggest_next_pull_priority_then_age() {
        let f = fixture();
        let mut old_low = Story::new(f.project_id, "old low");
        old_low.status = StoryStatus::Todo;
        old_low.priority = Priority::Low;
        old_low.status_changed_at = Utc::now() - chrono::Duration::hours(100);
        f.stories.insert(old_low);

        let mut young_high = Story::new(f.project_id, "young high");
        young_high.status = StoryStatus::Todo;
        young_high.priority = Priority::High;
        f.stories.insert(young_high);

        let pick = f.controller.suggest_next_pull(f.project_id, "Todo").unwrap();
        assert_eq!(pick.title, "young high");
    }

    #[test]
    fn suggest_next_pull_deprioritizes_blocked() {
        let f = fixture();
        let mut blocked = Story::new(f.project_id, "blocked high");
        blocked.status = StoryStatus::Todo;
        blocked.priority = Priority::High;
        blocked.blocked = true;
        f.stories.insert(blocked);

        let mut free = Story::new(f.project_id, "free medium");
        free.status = StoryStatus::Todo;
        free.priority = Priority::Medium;
        f.stories.insert(free);

        let pick = f.controller.suggest_next_pull(f.project_id, "Todo").unwrap();
        assert_eq!(pick.title, "free medium");

        // With only blocked candidates, the blocked one is still suggested.
        f.stories
            .transition(
                f.controller.suggest_next_pull(f.project_id, "Todo").unwrap().id,
                StoryStatus::InProgress,
            )
            .unwrap();
        let pick = f.controller.suggest_next_pull(f.project_id, "Todo").unwrap();
        assert_eq!(pick.title, "blocked high");
    }

    #[test]
    fn empty_column_suggests_nothing() {
        let f = fixture();
        assert!(f.controller.suggest_next_pull(f.project_id, "Todo").is_none());
    }

    #[test]
    fn epic_progress_counts() {
        let f = fixture();
        let epic = f.epics.insert(Epic::new(f.project_id, "auth", "identity"));
        for status in [StoryStatus::Done, StoryStatus::Done, StoryStatus::InProgress, StoryStatus::Todo] {
            let mut story = Story::new(f.project_id, "s");
            story.status = status;
            story.epic_id = Some(epic);
            f.stories.insert(story);
        }

        let progress = f.controller.epic_progress(f.project_id, epic);
        assert_eq!(progress.total, 4);
        assert_eq!(progress.done, 2);
        assert!((progress.percentage - 50.0).abs() < 1e-9);
        assert_eq!(progress.in_progress, 1);
    }

    #[test]
    fn flow_metrics_from_transition_log() {
        let f = fixture();
        let story = Story::new(f.project_id, "s");
        let story_id = story.id;
        f.stories.insert(story);

        let started = Utc::now() - chrono::Duration::hours(30);
        let done = Utc::now() - chrono::Duration::hours(6);
        f.controller
            .record_transition(story_id, f.project_id, StoryStatus::InProgress, started);
        f.controller
            .record_transition(story_id, f.project_id, StoryStatus::Done, done);

        let metrics = f.controller.flow_metrics(f.project_id, 30);
        assert_eq!(metrics.total_completed, 1);
        assert!((metrics.avg_cycle_time_hours - 24.0).abs() < 0.1);
        assert!(metrics.avg_lead_time_hours > 0.0);
        assert!(metrics.throughput_per_week > 0.0);
    }

    #[test]
    fn flow_metrics_empty_project() {
        let f = fixture();
        let metrics = f.controller.flow_metrics(f.project_id, 30);
        assert_eq!(metrics.total_completed, 0);
        assert_eq!(metrics.avg_cycle_time_hours, 0.0);
        assert_eq!(metrics.work_in_progress, 0);
    }
}
