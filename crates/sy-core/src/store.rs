//! In-memory source-of-truth registries.
//!
//! A single control-plane process per deployment owns this state; the stores
//! here are the process-local mirror of the relational tables named in the
//! data model. Every store is cheaply cloneable and safe to share across
//! tasks. Locks are never held across await points.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::types::{
    AgentRole, BacklogItem, CreditActivity, CreditSummary, Epic, ItemActivity, Persona, Project,
    Story, StoryStatus, WipLimit,
};

// ---------------------------------------------------------------------------
// ProjectStore
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct ProjectStore {
    inner: Arc<RwLock<HashMap<Uuid, Project>>>,
}

impl ProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project: Project) -> Uuid {
        let id = project.id;
        self.inner.write().unwrap().insert(id, project);
        id
    }

    pub fn get(&self, id: Uuid) -> Result<Project> {
        self.inner
            .read()
            .unwrap()
            .get(&id)
            .filter(|p| p.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("project {id}")))
    }

    pub fn list(&self) -> Vec<Project> {
        let mut out: Vec<Project> = self
            .inner
            .read()
            .unwrap()
            .values()
            .filter(|p| p.deleted_at.is_none())
            .cloned()
            .collect();
        out.sort_by_key(|p| p.created_at);
        out
    }

    pub fn set_wip_limit(&self, id: Uuid, column: &str, limit: WipLimit) -> Result<()> {
        let mut map = self.inner.write().unwrap();
        let project = map
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("project {id}")))?;
        project.wip_limits.insert(column.to_string(), limit);
        Ok(())
    }

    pub fn set_active_agent(&self, id: Uuid, agent_id: Option<Uuid>) -> Result<()> {
        let mut map = self.inner.write().unwrap();
        let project = map
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("project {id}")))?;
        project.active_agent_id = agent_id;
        Ok(())
    }

    pub fn set_socket_presence(&self, id: Uuid, present: bool) -> Result<()> {
        let mut map = self.inner.write().unwrap();
        let project = map
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("project {id}")))?;
        project.has_live_sockets = present;
        Ok(())
    }

    pub fn soft_delete(&self, id: Uuid) -> Result<()> {
        let mut map = self.inner.write().unwrap();
        let project = map
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("project {id}")))?;
        project.deleted_at = Some(Utc::now());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StoryStore
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct StoryStore {
    inner: Arc<RwLock<HashMap<Uuid, Story>>>,
}

impl StoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, story: Story) -> Uuid {
        let id = story.id;
        self.inner.write().unwrap().insert(id, story);
        id
    }

    pub fn get(&self, id: Uuid) -> Result<Story> {
        self.inner
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("story {id}")))
    }

    /// Non-archived stories of a project.
    pub fn list_by_project(&self, project_id: Uuid) -> Vec<Story> {
        let mut out: Vec<Story> = self
            .inner
            .read()
            .unwrap()
            .values()
            .filter(|s| s.project_id == project_id && !s.archived)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    pub fn list_by_epic(&self, project_id: Uuid, epic_id: Uuid) -> Vec<Story> {
        self.list_by_project(project_id)
            .into_iter()
            .filter(|s| s.epic_id == Some(epic_id))
            .collect()
    }

    /// Apply a status transition, enforcing the story state machine.
    pub fn transition(&self, id: Uuid, to: StoryStatus) -> Result<Story> {
        let mut map = self.inner.write().unwrap();
        let story = map
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("story {id}")))?;
        if !story.status.can_transition_to(&to) {
            return Err(CoreError::Conflict(format!(
                "story {id}: invalid transition {} -> {}",
                story.status, to
            )));
        }
        let now = Utc::now();
        story.status = to;
        story.status_changed_at = now;
        story.updated_at = now;
        tracing::debug!(story = %id, to = %to, "story transitioned");
        Ok(story.clone())
    }

    pub fn set_blocked(&self, id: Uuid, blocked: bool, reason: Option<String>) -> Result<()> {
        let mut map = self.inner.write().unwrap();
        let story = map
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("story {id}")))?;
        story.blocked = blocked;
        story.blocked_reason = if blocked { reason } else { None };
        story.updated_at = Utc::now();
        Ok(())
    }

    pub fn assign(&self, id: Uuid, assignee: Option<Uuid>) -> Result<()> {
        let mut map = self.inner.write().unwrap();
        let story = map
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("story {id}")))?;
        story.assignee_id = assignee;
        story.updated_at = Utc::now();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EpicStore
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct EpicStore {
    inner: Arc<RwLock<HashMap<Uuid, Epic>>>,
}

impl EpicStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, epic: Epic) -> Uuid {
        let id = epic.id;
        self.inner.write().unwrap().insert(id, epic);
        id
    }

    pub fn get(&self, id: Uuid) -> Result<Epic> {
        self.inner
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("epic {id}")))
    }

    pub fn list_by_project(&self, project_id: Uuid) -> Vec<Epic> {
        let mut out: Vec<Epic> = self
            .inner
            .read()
            .unwrap()
            .values()
            .filter(|e| e.project_id == project_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.created_at);
        out
    }
}

// ---------------------------------------------------------------------------
// PersonaStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PersonaState {
    personas: HashMap<Uuid, Persona>,
    /// Live agents currently referencing each persona. Pools retain on spawn
    /// and release on terminate; hard-delete is blocked while non-zero.
    references: HashMap<Uuid, usize>,
}

#[derive(Clone, Default)]
pub struct PersonaStore {
    inner: Arc<RwLock<PersonaState>>,
}

impl PersonaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a persona. `(name, role)` must be unique.
    pub fn insert(&self, persona: Persona) -> Result<Uuid> {
        let mut state = self.inner.write().unwrap();
        let duplicate = state
            .personas
            .values()
            .any(|p| p.name == persona.name && p.role == persona.role);
        if duplicate {
            return Err(CoreError::Conflict(format!(
                "persona ({}, {}) already exists",
                persona.name, persona.role
            )));
        }
        let id = persona.id;
        state.personas.insert(id, persona);
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Result<Persona> {
        self.inner
            .read()
            .unwrap()
            .personas
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("persona {id}")))
    }

    pub fn list(&self, role: Option<AgentRole>) -> Vec<Persona> {
        let state = self.inner.read().unwrap();
        let mut out: Vec<Persona> = state
            .personas
            .values()
            .filter(|p| role.map_or(true, |r| p.role == r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn update(&self, id: Uuid, summary: Option<String>, is_active: Option<bool>) -> Result<Persona> {
        let mut state = self.inner.write().unwrap();
        let persona = state
            .personas
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("persona {id}")))?;
        if let Some(summary) = summary {
            persona.summary = summary;
        }
        if let Some(active) = is_active {
            persona.is_active = active;
        }
        Ok(persona.clone())
    }

    /// Hard delete. Blocked while any active agent references the persona.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let mut state = self.inner.write().unwrap();
        if state.references.get(&id).copied().unwrap_or(0) > 0 {
            return Err(CoreError::Conflict(format!(
                "persona {id} is referenced by active agents"
            )));
        }
        state
            .personas
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("persona {id}")))
    }

    pub fn retain(&self, id: Uuid) {
        *self
            .inner
            .write()
            .unwrap()
            .references
            .entry(id)
            .or_insert(0) += 1;
    }

    pub fn release(&self, id: Uuid) {
        let mut state = self.inner.write().unwrap();
        if let Some(count) = state.references.get_mut(&id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.references.remove(&id);
            }
        }
    }

    pub fn reference_count(&self, id: Uuid) -> usize {
        self.inner
            .read()
            .unwrap()
            .references
            .get(&id)
            .copied()
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// BacklogStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct BacklogFilter {
    pub sprint_id: Option<Uuid>,
    pub status: Option<String>,
    pub assignee_id: Option<Uuid>,
    pub item_type: Option<String>,
}

#[derive(Default)]
struct BacklogState {
    items: HashMap<Uuid, BacklogItem>,
    activities: Vec<ItemActivity>,
}

#[derive(Clone, Default)]
pub struct BacklogStore {
    inner: Arc<RwLock<BacklogState>>,
}

impl BacklogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an item, assigning the next rank in its column when rank is 0.
    pub fn insert(&self, mut item: BacklogItem) -> Uuid {
        let mut state = self.inner.write().unwrap();
        if item.rank == 0 {
            let max_rank = state
                .items
                .values()
                .filter(|i| i.status == item.status && i.sprint_id == item.sprint_id)
                .map(|i| i.rank)
                .max()
                .unwrap_or(0);
            item.rank = max_rank + 1;
        }
        let id = item.id;
        state.items.insert(id, item);
        id
    }

    pub fn get(&self, id: Uuid) -> Result<BacklogItem> {
        self.inner
            .read()
            .unwrap()
            .items
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("backlog item {id}")))
    }

    /// Filtered listing ordered by rank.
    pub fn list(&self, filter: &BacklogFilter, limit: usize, offset: usize) -> Vec<BacklogItem> {
        let state = self.inner.read().unwrap();
        let mut out: Vec<BacklogItem> = state
            .items
            .values()
            .filter(|i| {
                filter.sprint_id.map_or(true, |s| i.sprint_id == Some(s))
                    && filter.status.as_deref().map_or(true, |s| i.status == s)
                    && filter
                        .assignee_id
                        .map_or(true, |a| i.assignee_id == Some(a))
                    && filter
                        .item_type
                        .as_deref()
                        .map_or(true, |t| i.item_type == t)
            })
            .cloned()
            .collect();
        out.sort_by_key(|i| i.rank);
        out.into_iter().skip(offset).take(limit).collect()
    }

    /// Move an item to `(new_status, new_rank, new_sprint)`, reordering ranks
    /// in the source and destination columns atomically and appending an
    /// activity row.
    pub fn move_item(
        &self,
        id: Uuid,
        new_status: &str,
        new_rank: u32,
        new_sprint_id: Option<Uuid>,
    ) -> Result<BacklogItem> {
        let mut state = self.inner.write().unwrap();
        let (old_status, old_rank, old_sprint) = {
            let item = state
                .items
                .get(&id)
                .ok_or_else(|| CoreError::NotFound(format!("backlog item {id}")))?;
            (item.status.clone(), item.rank, item.sprint_id)
        };

        let column_changed = old_status != new_status || old_sprint != new_sprint_id;

        // Close the gap left in the source column.
        if column_changed {
            for other in state.items.values_mut() {
                if other.id != id
                    && other.status == old_status
                    && other.sprint_id == old_sprint
                    && other.rank > old_rank
                {
                    other.rank -= 1;
                }
            }
        }

        // Open a slot in the destination column.
        for other in state.items.values_mut() {
            if other.id != id
                && other.status == new_status
                && other.sprint_id == new_sprint_id
                && other.rank >= new_rank
            {
                other.rank += 1;
            }
        }

        let item = state.items.get_mut(&id).expect("checked above");
        item.status = new_status.to_string();
        item.sprint_id = new_sprint_id;
        item.rank = new_rank;
        item.updated_at = Utc::now();
        let moved = item.clone();

        state.activities.push(ItemActivity {
            id: Uuid::new_v4(),
            item_id: id,
            status_from: old_status.clone(),
            status_to: new_status.to_string(),
            rank_from: old_rank,
            rank_to: new_rank,
            note: format!("Moved from {old_status} to {new_status}"),
            created_at: Utc::now(),
        });

        Ok(moved)
    }

    pub fn activities_for(&self, item_id: Uuid) -> Vec<ItemActivity> {
        self.inner
            .read()
            .unwrap()
            .activities
            .iter()
            .filter(|a| a.item_id == item_id)
            .cloned()
            .collect()
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .items
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("backlog item {id}")))
    }
}

// ---------------------------------------------------------------------------
// CreditLedger
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct CreditLedger {
    inner: Arc<RwLock<Vec<CreditActivity>>>,
}

impl CreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, activity: CreditActivity) {
        self.inner.write().unwrap().push(activity);
    }

    /// User-scoped activities, newest first.
    pub fn list_for_user(&self, user_id: Uuid, limit: usize, offset: usize) -> Vec<CreditActivity> {
        let ledger = self.inner.read().unwrap();
        let mut out: Vec<CreditActivity> = ledger
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.into_iter().skip(offset).take(limit).collect()
    }

    pub fn summary_for_user(&self, user_id: Uuid) -> CreditSummary {
        let ledger = self.inner.read().unwrap();
        let mut summary = CreditSummary::default();
        let mut per_model: HashMap<String, u64> = HashMap::new();
        let mut per_agent: HashMap<Uuid, u64> = HashMap::new();

        for activity in ledger.iter().filter(|a| a.user_id == user_id) {
            summary.total_tokens += activity.tokens_used;
            summary.total_llm_calls += u64::from(activity.llm_calls);
            if activity.credits_delta < 0 {
                summary.credits_spent += -activity.credits_delta;
            }
            *per_model.entry(activity.model_used.clone()).or_insert(0) += activity.tokens_used;
            if let Some(agent) = activity.agent_id {
                *per_agent.entry(agent).or_insert(0) += activity.tokens_used;
            }
        }

        summary.top_model = per_model
            .into_iter()
            .max_by_key(|(_, tokens)| *tokens)
            .map(|(model, _)| model);
        summary.top_agent = per_agent
            .into_iter()
            .max_by_key(|(_, tokens)| *tokens)
            .map(|(agent, _)| agent);
        summary
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    fn item(project: Uuid, status: &str, rank: u32) -> BacklogItem {
        let now = Utc::now();
        BacklogItem {
            id: Uuid::new_v4(),
            project_id: project,
            title: format!("{status}-{rank}"),
            item_type: "story".into(),
            status: status.into(),
            sprint_id: None,
            assignee_id: None,
            rank,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn story_transition_enforced() {
        let store = StoryStore::new();
        let story = Story::new(Uuid::new_v4(), "s");
        let id = store.insert(story);

        store.transition(id, StoryStatus::Todo).unwrap();
        let err = store.transition(id, StoryStatus::Done).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[test]
    fn story_transition_updates_age_anchor() {
        let store = StoryStore::new();
        let mut story = Story::new(Uuid::new_v4(), "s");
        story.status_changed_at = Utc::now() - chrono::Duration::hours(10);
        let id = store.insert(story);

        let moved = store.transition(id, StoryStatus::Todo).unwrap();
        assert!(moved.age_in_status_hours(Utc::now()) < 0.1);
    }

    #[test]
    fn persona_uniqueness_on_name_and_role() {
        let store = PersonaStore::new();
        store
            .insert(Persona::new("Ada", AgentRole::Developer, "pragmatic"))
            .unwrap();
        // Same name, different role is fine.
        store
            .insert(Persona::new("Ada", AgentRole::Tester, "thorough"))
            .unwrap();
        let err = store
            .insert(Persona::new("Ada", AgentRole::Developer, "dup"))
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[test]
    fn persona_delete_blocked_while_referenced() {
        let store = PersonaStore::new();
        let id = store
            .insert(Persona::new("Ada", AgentRole::Developer, "pragmatic"))
            .unwrap();

        store.retain(id);
        assert!(matches!(
            store.delete(id).unwrap_err(),
            CoreError::Conflict(_)
        ));

        store.release(id);
        store.delete(id).unwrap();
    }

    #[test]
    fn backlog_insert_assigns_next_rank() {
        let store = BacklogStore::new();
        let project = Uuid::new_v4();
        store.insert(item(project, "Todo", 1));
        let mut unranked = item(project, "Todo", 0);
        unranked.rank = 0;
        let id = store.insert(unranked);
        assert_eq!(store.get(id).unwrap().rank, 2);
    }

    #[test]
    fn backlog_move_reranks_both_columns() {
        let store = BacklogStore::new();
        let project = Uuid::new_v4();
        let a = store.insert(item(project, "Todo", 1));
        let b = store.insert(item(project, "Todo", 2));
        let c = store.insert(item(project, "Doing", 1));

        // Move `a` to the top of Doing.
        store.move_item(a, "Doing", 1, None).unwrap();

        // Source column closed its gap.
        assert_eq!(store.get(b).unwrap().rank, 1);
        // Destination shifted down.
        assert_eq!(store.get(a).unwrap().rank, 1);
        assert_eq!(store.get(c).unwrap().rank, 2);

        // Activity logged.
        let activities = store.activities_for(a);
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].status_from, "Todo");
        assert_eq!(activities[0].status_to, "Doing");
    }

    #[test]
    fn backlog_list_orders_by_rank() {
        let store = BacklogStore::new();
        let project = Uuid::new_v4();
        store.insert(item(project, "Todo", 3));
        store.insert(item(project, "Todo", 1));
        store.insert(item(project, "Todo", 2));

        let filter = BacklogFilter {
            status: Some("Todo".into()),
            ..Default::default()
        };
        let ranks: Vec<u32> = store
            .list(&filter, 100, 0)
            .into_iter()
            .map(|i| i.rank)
            .collect();
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[test]
    fn credit_summary_aggregates() {
        let ledger = CreditLedger::new();
        let user = Uuid::new_v4();
        let project = Uuid::new_v4();
        let agent = Uuid::new_v4();
        for (tokens, model) in [(100u64, "sonnet"), (300, "opus"), (50, "sonnet")] {
            ledger.record(CreditActivity {
                id: Uuid::new_v4(),
                user_id: user,
                project_id: project,
                tokens_used: tokens,
                model_used: model.into(),
                llm_calls: 1,
                credits_delta: -(tokens as i64),
                reason: "graph run".into(),
                story_id: None,
                agent_id: Some(agent),
                created_at: Utc::now(),
            });
        }

        let summary = ledger.summary_for_user(user);
        assert_eq!(summary.total_tokens, 450);
        assert_eq!(summary.total_llm_calls, 3);
        assert_eq!(summary.credits_spent, 450);
        assert_eq!(summary.top_model.as_deref(), Some("opus"));
        assert_eq!(summary.top_agent, Some(agent));
    }

    #[test]
    fn project_soft_delete_hides_from_get() {
        let store = ProjectStore::new();
        let id = store.insert(Project::new("demo"));
        store.soft_delete(id).unwrap();
        assert!(store.get(id).is_err());
        assert!(store.list().is_empty());
    }

    #[test]
    fn story_store_lists_exclude_archived() {
        let store = StoryStore::new();
        let project = Uuid::new_v4();
        let mut archived = Story::new(project, "old");
        archived.archived = true;
        store.insert(archived);
        let mut live = Story::new(project, "new");
        live.priority = Priority::High;
        store.insert(live);

        let listed = store.list_by_project(project);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "new");
    }
}
