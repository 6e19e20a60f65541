//! Process-wide project context cache.
//!
//! Every agent working on a project shares one cached bundle of recent
//! conversation, user preferences, and derived facts. Entries are loaded once
//! per project behind a per-key lock and evicted LRU when the cache exceeds
//! its ceiling.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

const DEFAULT_MAX_PROJECTS: usize = 64;
const MAX_MEMORY_MESSAGES: usize = 50;

// ---------------------------------------------------------------------------
// ProjectContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// Per-project bundle of conversation memory, preferences, and facts.
#[derive(Debug, Default)]
pub struct ProjectContext {
    pub project_id: Uuid,
    messages: VecDeque<ContextMessage>,
    preferences: HashMap<String, String>,
    facts: HashMap<String, String>,
    loaded: bool,
}

impl ProjectContext {
    fn new(project_id: Uuid) -> Self {
        Self {
            project_id,
            ..Default::default()
        }
    }

    pub fn add_message(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.messages.push_back(ContextMessage {
            role: role.into(),
            content: content.into(),
            at: Utc::now(),
        });
        while self.messages.len() > MAX_MEMORY_MESSAGES {
            self.messages.pop_front();
        }
    }

    pub fn update_preference(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.preferences.insert(key.into(), value.into());
    }

    pub fn set_fact(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.facts.insert(key.into(), value.into());
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Conversation memory rendered for a prompt, oldest first.
    pub fn format_memory(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn format_preferences(&self) -> String {
        if self.preferences.is_empty() {
            return String::new();
        }
        let mut pairs: Vec<_> = self.preferences.iter().collect();
        pairs.sort_by_key(|(k, _)| k.clone());
        pairs
            .into_iter()
            .map(|(k, v)| format!("- {k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn preference(&self, key: &str) -> Option<&str> {
        self.preferences.get(key).map(|s| s.as_str())
    }
}

// ---------------------------------------------------------------------------
// ContextLoader — write-through boundary to durable storage
// ---------------------------------------------------------------------------

/// Loads a project's persisted context on first access and receives
/// write-through updates. The default loader is a no-op; the daemon installs
/// one backed by the stores.
pub trait ContextLoader: Send + Sync {
    fn load(&self, project_id: Uuid) -> (Vec<ContextMessage>, HashMap<String, String>) {
        let _ = project_id;
        (Vec::new(), HashMap::new())
    }

    fn persist_message(&self, project_id: Uuid, message: &ContextMessage) {
        let _ = (project_id, message);
    }

    fn persist_preference(&self, project_id: Uuid, key: &str, value: &str) {
        let _ = (project_id, key, value);
    }
}

struct NoopLoader;

impl ContextLoader for NoopLoader {}

// ---------------------------------------------------------------------------
// ProjectContextCache
// ---------------------------------------------------------------------------

struct Entry {
    context: Arc<Mutex<ProjectContext>>,
    last_access: std::sync::atomic::AtomicU64,
}

/// LRU-bounded cache of [`ProjectContext`] keyed by project id.
///
/// Loads go through a per-key `Mutex` so concurrent first-accesses of the
/// same project do not stampede the loader.
pub struct ProjectContextCache {
    entries: DashMap<Uuid, Arc<Entry>>,
    loader: Arc<dyn ContextLoader>,
    max_projects: usize,
    clock: std::sync::atomic::AtomicU64,
}

impl ProjectContextCache {
    pub fn new(loader: Arc<dyn ContextLoader>, max_projects: usize) -> Self {
        Self {
            entries: DashMap::new(),
            loader,
            max_projects: max_projects.max(1),
            clock: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(NoopLoader), DEFAULT_MAX_PROJECTS)
    }

    fn touch(&self, entry: &Entry) {
        use std::sync::atomic::Ordering;
        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        entry.last_access.store(tick, Ordering::Relaxed);
    }

    /// Get the context handle for a project, creating it if absent.
    pub fn get(&self, project_id: Uuid) -> Arc<Mutex<ProjectContext>> {
        let entry = self
            .entries
            .entry(project_id)
            .or_insert_with(|| {
                Arc::new(Entry {
                    context: Arc::new(Mutex::new(ProjectContext::new(project_id))),
                    last_access: std::sync::atomic::AtomicU64::new(0),
                })
            })
            .clone();
        self.touch(&entry);
        self.evict_over_ceiling();
        entry.context.clone()
    }

    /// Ensure the context has been populated from durable storage.
    pub async fn ensure_loaded(&self, project_id: Uuid) -> Arc<Mutex<ProjectContext>> {
        let handle = self.get(project_id);
        {
            let mut ctx = handle.lock().await;
            if !ctx.loaded {
                let (messages, preferences) = self.loader.load(project_id);
                for m in messages {
                    ctx.messages.push_back(m);
                }
                ctx.preferences = preferences;
                ctx.loaded = true;
                tracing::debug!(project = %project_id, "project context loaded");
            }
        }
        handle
    }

    /// Append a conversation message, write-through.
    pub async fn add_message(
        &self,
        project_id: Uuid,
        role: impl Into<String>,
        content: impl Into<String>,
    ) {
        let handle = self.ensure_loaded(project_id).await;
        let mut ctx = handle.lock().await;
        ctx.add_message(role, content);
        if let Some(last) = ctx.messages.back().cloned() {
            self.loader.persist_message(project_id, &last);
        }
    }

    /// Update a preference, write-through.
    pub async fn update_preference(&self, project_id: Uuid, key: &str, value: &str) {
        let handle = self.ensure_loaded(project_id).await;
        handle.lock().await.update_preference(key, value);
        self.loader.persist_preference(project_id, key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_over_ceiling(&self) {
        use std::sync::atomic::Ordering;
        while self.entries.len() > self.max_projects {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().last_access.load(Ordering::Relaxed))
                .map(|e| *e.key());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                    tracing::debug!(project = %key, "project context evicted (LRU)");
                }
                None => break,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_is_bounded() {
        let cache = ProjectContextCache::in_memory();
        let project = Uuid::new_v4();
        for i in 0..(MAX_MEMORY_MESSAGES + 10) {
            cache.add_message(project, "user", format!("m{i}")).await;
        }
        let handle = cache.get(project);
        let ctx = handle.lock().await;
        assert_eq!(ctx.message_count(), MAX_MEMORY_MESSAGES);
        // Oldest messages were dropped.
        assert!(!ctx.format_memory().contains("m0\n"));
    }

    #[tokio::test]
    async fn preferences_render_sorted() {
        let cache = ProjectContextCache::in_memory();
        let project = Uuid::new_v4();
        cache.update_preference(project, "language", "vi").await;
        cache.update_preference(project, "framework", "nextjs").await;

        let handle = cache.get(project);
        let ctx = handle.lock().await;
        let rendered = ctx.format_preferences();
        let framework_pos = rendered.find("framework").unwrap();
        let language_pos = rendered.find("language").unwrap();
        assert!(framework_pos < language_pos);
    }

    #[tokio::test]
    async fn lru_eviction_respects_ceiling() {
        let cache = ProjectContextCache::new(Arc::new(NoopLoader), 2);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let third = Uuid::new_v4();

        cache.get(first);
        cache.get(second);
        // Touch `first` so `second` is the LRU victim.
        cache.get(first);
        cache.get(third);

        assert_eq!(cache.len(), 2);
        assert!(cache.entries.contains_key(&first));
        assert!(cache.entries.contains_key(&third));
        assert!(!cache.entries.contains_key(&second));
    }

    #[tokio::test]
    async fn ensure_loaded_runs_loader_once() {
        struct CountingLoader(std::sync::atomic::AtomicUsize);
        impl ContextLoader for CountingLoader {
            fn load(&self, _: Uuid) -> (Vec<ContextMessage>, HashMap<String, String>) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                (Vec::new(), HashMap::new())
            }
        }

        let loader = Arc::new(CountingLoader(std::sync::atomic::AtomicUsize::new(0)));
        let cache = ProjectContextCache::new(loader.clone(), 8);
        let project = Uuid::new_v4();

        cache.ensure_loaded(project).await;
        cache.ensure_loaded(project).await;
        assert_eq!(loader.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
