//! Versioned, status-gated storage of agent-produced documents.
//!
//! Creating a new version archives its parent and bumps the version by one;
//! history is immutable and exactly one non-archived head exists per chain.
//! Content is additionally mirrored to the project workspace as pretty JSON
//! for human inspection; a mirror failure is logged and never aborts the
//! store write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sy_core::{CoreError, Result};

// ---------------------------------------------------------------------------
// Artifact model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    RequirementsDoc,
    ProductBrief,
    SolutionDesign,
    ImplementationPlan,
    TestReport,
    MeetingNotes,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::RequirementsDoc => "requirements_doc",
            ArtifactType::ProductBrief => "product_brief",
            ArtifactType::SolutionDesign => "solution_design",
            ArtifactType::ImplementationPlan => "implementation_plan",
            ArtifactType::TestReport => "test_report",
            ArtifactType::MeetingNotes => "meeting_notes",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Draft,
    Approved,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub project_id: Uuid,
    pub agent_id: Uuid,
    pub agent_name: String,
    pub artifact_type: ArtifactType,
    pub title: String,
    pub description: Option<String>,
    pub content: serde_json::Map<String, serde_json::Value>,
    /// Monotonic per `(project, type, title)`.
    pub version: u32,
    pub parent_artifact_id: Option<Uuid>,
    pub status: ArtifactStatus,
    pub tags: Vec<String>,
    pub file_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<Uuid>,
    pub review_feedback: Option<String>,
}

/// Inputs for [`ArtifactStore::create`].
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub project_id: Uuid,
    pub agent_id: Uuid,
    pub agent_name: String,
    pub artifact_type: ArtifactType,
    pub title: String,
    pub description: Option<String>,
    pub content: serde_json::Map<String, serde_json::Value>,
    pub tags: Vec<String>,
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ArtifactStore {
    inner: Arc<RwLock<HashMap<Uuid, Artifact>>>,
    /// Root under which `projects/{id}/artifacts/` mirrors are written.
    /// `None` disables mirroring.
    workspace_root: Option<PathBuf>,
}

impl ArtifactStore {
    pub fn new(workspace_root: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            workspace_root,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Create a new artifact chain. The first version is 1.
    pub fn create(&self, new: NewArtifact) -> Result<Artifact> {
        let now = Utc::now();
        let mut artifact = Artifact {
            id: Uuid::new_v4(),
            project_id: new.project_id,
            agent_id: new.agent_id,
            agent_name: new.agent_name,
            artifact_type: new.artifact_type,
            title: new.title,
            description: new.description,
            content: new.content,
            version: 1,
            parent_artifact_id: None,
            status: ArtifactStatus::Draft,
            tags: new.tags,
            file_path: None,
            created_at: now,
            updated_at: now,
            reviewed_at: None,
            reviewed_by: None,
            review_feedback: None,
        };

        artifact.file_path = self.mirror_to_workspace(&artifact);
        self.inner.write().unwrap().insert(artifact.id, artifact.clone());

        tracing::info!(
            artifact = %artifact.id, kind = artifact.artifact_type.as_str(),
            title = %artifact.title, agent = %artifact.agent_name,
            "artifact created"
        );
        Ok(artifact)
    }

    /// Create a new version of `parent_id`: the parent is archived and the
    /// child inserted with `version + 1` in the same write.
    pub fn create_version(
        &self,
        parent_id: Uuid,
        new_content: serde_json::Map<String, serde_json::Value>,
        description: Option<String>,
    ) -> Result<Artifact> {
        let mut map = self.inner.write().unwrap();
        let parent = map
            .get_mut(&parent_id)
            .ok_or_else(|| CoreError::NotFound(format!("artifact {parent_id}")))?;

        parent.status = ArtifactStatus::Archived;
        parent.updated_at = Utc::now();
        let parent_snapshot = parent.clone();

        let now = Utc::now();
        let mut child = Artifact {
            id: Uuid::new_v4(),
            project_id: parent_snapshot.project_id,
            agent_id: parent_snapshot.agent_id,
            agent_name: parent_snapshot.agent_name.clone(),
            artifact_type: parent_snapshot.artifact_type,
            title: parent_snapshot.title.clone(),
            description: description.or(parent_snapshot.description.clone()),
            content: new_content,
            version: parent_snapshot.version + 1,
            parent_artifact_id: Some(parent_id),
            status: ArtifactStatus::Draft,
            tags: parent_snapshot.tags.clone(),
            file_path: None,
            created_at: now,
            updated_at: now,
            reviewed_at: None,
            reviewed_by: None,
            review_feedback: None,
        };

        child.file_path = self.mirror_to_workspace(&child);
        map.insert(child.id, child.clone());

        tracing::info!(parent = %parent_id, child = %child.id, version = child.version, "artifact version created");
        Ok(child)
    }

    /// Approve/reject an artifact with optional reviewer and feedback.
    pub fn update_status(
        &self,
        id: Uuid,
        status: ArtifactStatus,
        reviewed_by: Option<Uuid>,
        review_feedback: Option<String>,
    ) -> Result<Artifact> {
        let mut map = self.inner.write().unwrap();
        let artifact = map
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("artifact {id}")))?;
        artifact.status = status;
        artifact.reviewed_at = Some(Utc::now());
        artifact.updated_at = Utc::now();
        if reviewed_by.is_some() {
            artifact.reviewed_by = reviewed_by;
        }
        if review_feedback.is_some() {
            artifact.review_feedback = review_feedback;
        }
        tracing::info!(artifact = %id, status = ?status, "artifact status updated");
        Ok(artifact.clone())
    }

    pub fn get(&self, id: Uuid) -> Result<Artifact> {
        self.inner
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("artifact {id}")))
    }

    /// Latest non-archived artifact of a type (highest `created_at`),
    /// optionally narrowed by title.
    pub fn latest(
        &self,
        project_id: Uuid,
        artifact_type: ArtifactType,
        title: Option<&str>,
    ) -> Option<Artifact> {
        self.inner
            .read()
            .unwrap()
            .values()
            .filter(|a| {
                a.project_id == project_id
                    && a.artifact_type == artifact_type
                    && a.status != ArtifactStatus::Archived
                    && title.map_or(true, |t| a.title == t)
            })
            .max_by_key(|a| a.created_at)
            .cloned()
    }

    pub fn list_for_project(
        &self,
        project_id: Uuid,
        artifact_type: Option<ArtifactType>,
        status: Option<ArtifactStatus>,
        limit: usize,
    ) -> Vec<Artifact> {
        let map = self.inner.read().unwrap();
        let mut out: Vec<Artifact> = map
            .values()
            .filter(|a| {
                a.project_id == project_id
                    && artifact_type.map_or(true, |t| a.artifact_type == t)
                    && status.map_or(true, |s| a.status == s)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        out
    }

    /// Delete every artifact of a type within a project. Returns the count.
    pub fn delete_by_type(&self, project_id: Uuid, artifact_type: ArtifactType) -> usize {
        let mut map = self.inner.write().unwrap();
        let doomed: Vec<Uuid> = map
            .values()
            .filter(|a| a.project_id == project_id && a.artifact_type == artifact_type)
            .map(|a| a.id)
            .collect();
        for id in &doomed {
            map.remove(id);
        }
        tracing::info!(
            project = %project_id, kind = artifact_type.as_str(), count = doomed.len(),
            "artifacts deleted by type"
        );
        doomed.len()
    }

    /// Full version chain for the head artifact's `(project, type, title)`,
    /// oldest first.
    pub fn version_chain(&self, head_id: Uuid) -> Result<Vec<Artifact>> {
        let head = self.get(head_id)?;
        let map = self.inner.read().unwrap();
        let mut chain: Vec<Artifact> = map
            .values()
            .filter(|a| {
                a.project_id == head.project_id
                    && a.artifact_type == head.artifact_type
                    && a.title == head.title
            })
            .cloned()
            .collect();
        chain.sort_by_key(|a| a.version);
        Ok(chain)
    }

    // === Workspace mirror ===

    fn mirror_to_workspace(&self, artifact: &Artifact) -> Option<PathBuf> {
        let root = self.workspace_root.as_deref()?;
        match self.write_mirror(root, artifact) {
            Ok(path) => {
                tracing::debug!(path = %path.display(), "artifact mirrored to workspace");
                Some(path)
            }
            Err(err) => {
                // The DB write is what matters; mirroring is best-effort.
                tracing::warn!(artifact = %artifact.id, error = %err, "artifact mirror failed");
                None
            }
        }
    }

    fn write_mirror(&self, root: &Path, artifact: &Artifact) -> std::io::Result<PathBuf> {
        let dir = root
            .join("projects")
            .join(artifact.project_id.to_string())
            .join("artifacts");
        std::fs::create_dir_all(&dir)?;

        let timestamp = artifact.created_at.format("%Y%m%d_%H%M%S");
        let filename = format!(
            "{}_{timestamp}_v{}.json",
            artifact.artifact_type.as_str(),
            artifact.version
        );
        let path = dir.join(filename);

        let document = serde_json::json!({
            "artifact_id": artifact.id,
            "title": artifact.title,
            "artifact_type": artifact.artifact_type.as_str(),
            "agent_name": artifact.agent_name,
            "version": artifact.version,
            "created_at": artifact.created_at.to_rfc3339(),
            "content": artifact.content,
        });
        std::fs::write(&path, serde_json::to_string_pretty(&document)?)?;
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn content(key: &str) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert(key.into(), serde_json::json!(true));
        map
    }

    fn new_artifact(project: Uuid, title: &str) -> NewArtifact {
        NewArtifact {
            project_id: project,
            agent_id: Uuid::new_v4(),
            agent_name: "ba-1".into(),
            artifact_type: ArtifactType::RequirementsDoc,
            title: title.into(),
            description: None,
            content: content("initial"),
            tags: vec!["auth".into()],
        }
    }

    #[test]
    fn first_version_is_one() {
        let store = ArtifactStore::in_memory();
        let artifact = store.create(new_artifact(Uuid::new_v4(), "PRD")).unwrap();
        assert_eq!(artifact.version, 1);
        assert_eq!(artifact.status, ArtifactStatus::Draft);
        assert!(artifact.parent_artifact_id.is_none());
    }

    #[test]
    fn create_version_archives_parent_and_bumps() {
        let store = ArtifactStore::in_memory();
        let project = Uuid::new_v4();
        let v1 = store.create(new_artifact(project, "PRD")).unwrap();
        let v2 = store
            .create_version(v1.id, content("revised"), None)
            .unwrap();

        assert_eq!(v2.version, 2);
        assert_eq!(v2.parent_artifact_id, Some(v1.id));
        assert_eq!(store.get(v1.id).unwrap().status, ArtifactStatus::Archived);

        // Latest resolves to the new head.
        let latest = store
            .latest(project, ArtifactType::RequirementsDoc, Some("PRD"))
            .unwrap();
        assert_eq!(latest.id, v2.id);
    }

    #[test]
    fn chain_is_linear_with_single_head() {
        let store = ArtifactStore::in_memory();
        let project = Uuid::new_v4();
        let v1 = store.create(new_artifact(project, "PRD")).unwrap();
        let v2 = store.create_version(v1.id, content("b"), None).unwrap();
        let v3 = store.create_version(v2.id, content("c"), None).unwrap();

        let chain = store.version_chain(v3.id).unwrap();
        let versions: Vec<u32> = chain.iter().map(|a| a.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);

        let heads = chain
            .iter()
            .filter(|a| a.status != ArtifactStatus::Archived)
            .count();
        assert_eq!(heads, 1);
    }

    #[test]
    fn latest_ignores_other_titles() {
        let store = ArtifactStore::in_memory();
        let project = Uuid::new_v4();
        store.create(new_artifact(project, "PRD")).unwrap();
        let other = store.create(new_artifact(project, "Glossary")).unwrap();

        let latest = store
            .latest(project, ArtifactType::RequirementsDoc, Some("Glossary"))
            .unwrap();
        assert_eq!(latest.id, other.id);
    }

    #[test]
    fn update_status_records_review() {
        let store = ArtifactStore::in_memory();
        let artifact = store.create(new_artifact(Uuid::new_v4(), "PRD")).unwrap();
        let reviewer = Uuid::new_v4();

        let approved = store
            .update_status(
                artifact.id,
                ArtifactStatus::Approved,
                Some(reviewer),
                Some("ship it".into()),
            )
            .unwrap();
        assert_eq!(approved.status, ArtifactStatus::Approved);
        assert_eq!(approved.reviewed_by, Some(reviewer));
        assert!(approved.reviewed_at.is_some());
    }

    #[test]
    fn delete_by_type_counts() {
        let store = ArtifactStore::in_memory();
        let project = Uuid::new_v4();
        store.create(new_artifact(project, "a")).unwrap();
        store.create(new_artifact(project, "b")).unwrap();
        assert_eq!(store.delete_by_type(project, ArtifactType::RequirementsDoc), 2);
        assert_eq!(store.delete_by_type(project, ArtifactType::RequirementsDoc), 0);
    }

    #[test]
    fn mirror_writes_versioned_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(Some(dir.path().to_path_buf()));
        let project = Uuid::new_v4();
        let artifact = store.create(new_artifact(project, "PRD")).unwrap();

        let path = artifact.file_path.expect("mirror path set");
        assert!(path.exists());
        let raw = std::fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["version"], 1);
        assert_eq!(doc["artifact_type"], "requirements_doc");
        assert!(path
            .to_string_lossy()
            .contains(&format!("projects/{project}/artifacts")));
    }

    #[test]
    fn mirror_failure_does_not_abort_store_write() {
        // Point the mirror at a path that cannot be a directory.
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let store = ArtifactStore::new(Some(blocker));
        let artifact = store.create(new_artifact(Uuid::new_v4(), "PRD")).unwrap();
        assert!(artifact.file_path.is_none());
        assert!(store.get(artifact.id).is_ok());
    }
}
