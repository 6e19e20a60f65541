//! REST surface for the control plane.
//!
//! JSON errors are mapped from the platform error taxonomy; 5xx bodies carry
//! sanitized messages only, the detail stays in logs.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sy_core::store::{BacklogFilter, BacklogStore, CreditLedger, PersonaStore, ProjectStore};
use sy_core::types::{AgentRole, BacklogItem, CreditActivity, CreditSummary, Persona};
use sy_core::CoreError;
use sy_kanban::{FlowMetrics, KanbanController};

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = if status.is_server_error() {
            tracing::error!(error = %err, "internal error surfaced to API");
            err.sanitized()
        } else {
            err.to_string()
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "status": self.status.as_u16(),
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// State & router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ApiState {
    pub projects: ProjectStore,
    pub backlog: BacklogStore,
    pub personas: PersonaStore,
    pub credits: CreditLedger,
    pub kanban: KanbanController,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/projects/{id}/flow-metrics", get(flow_metrics))
        .route("/backlog-items", get(list_backlog_items).post(create_backlog_item))
        .route("/backlog-items/{id}/move", put(move_backlog_item))
        .route("/personas", get(list_personas).post(create_persona))
        .route(
            "/personas/{id}",
            put(update_persona).delete(delete_persona),
        )
        .route("/credits/activities", get(credit_activities))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Router variant used when something else already owns the route prefix.
pub fn nested_router(state: ApiState, prefix: &str) -> Router {
    Router::new().nest(prefix, router(state))
}

// ---------------------------------------------------------------------------
// Flow metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FlowQuery {
    #[serde(default = "default_days")]
    days: i64,
}

fn default_days() -> i64 {
    30
}

async fn flow_metrics(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(query): Query<FlowQuery>,
) -> ApiResult<Json<FlowMetrics>> {
    state.projects.get(id)?;
    Ok(Json(state.kanban.flow_metrics(id, query.days)))
}

// ---------------------------------------------------------------------------
// Backlog items
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BacklogQuery {
    sprint_id: Option<Uuid>,
    status: Option<String>,
    assignee_id: Option<Uuid>,
    item_type: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    50
}

async fn list_backlog_items(
    State(state): State<ApiState>,
    Query(query): Query<BacklogQuery>,
) -> Json<Vec<BacklogItem>> {
    let filter = BacklogFilter {
        sprint_id: query.sprint_id,
        status: query.status,
        assignee_id: query.assignee_id,
        item_type: query.item_type,
    };
    Json(state.backlog.list(&filter, query.limit, query.offset))
}

#[derive(Debug, Deserialize)]
struct CreateBacklogItem {
    project_id: Uuid,
    title: String,
    #[serde(default = "default_item_type")]
    item_type: String,
    #[serde(default = "default_status")]
    status: String,
    sprint_id: Option<Uuid>,
    assignee_id: Option<Uuid>,
}

fn default_item_type() -> String {
    "story".into()
}

fn default_status() -> String {
    "Backlog".into()
}

async fn create_backlog_item(
    State(state): State<ApiState>,
    Json(body): Json<CreateBacklogItem>,
) -> ApiResult<(StatusCode, Json<BacklogItem>)> {
    if body.title.trim().is_empty() {
        return Err(CoreError::Validation("title must not be empty".into()).into());
    }
    let now = Utc::now();
    let item = BacklogItem {
        id: Uuid::new_v4(),
        project_id: body.project_id,
        title: body.title,
        item_type: body.item_type,
        status: body.status,
        sprint_id: body.sprint_id,
        assignee_id: body.assignee_id,
        rank: 0, // store assigns the next rank in the column
        created_at: now,
        updated_at: now,
    };
    let id = state.backlog.insert(item);
    Ok((StatusCode::CREATED, Json(state.backlog.get(id)?)))
}

#[derive(Debug, Deserialize)]
struct MoveQuery {
    new_status: String,
    new_rank: u32,
    new_sprint_id: Option<Uuid>,
}

async fn move_backlog_item(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(query): Query<MoveQuery>,
) -> ApiResult<Json<BacklogItem>> {
    let moved =
        state
            .backlog
            .move_item(id, &query.new_status, query.new_rank, query.new_sprint_id)?;
    Ok(Json(moved))
}

// ---------------------------------------------------------------------------
// Personas
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PersonaQuery {
    role: Option<AgentRole>,
}

async fn list_personas(
    State(state): State<ApiState>,
    Query(query): Query<PersonaQuery>,
) -> Json<Vec<Persona>> {
    Json(state.personas.list(query.role))
}

#[derive(Debug, Deserialize)]
struct CreatePersona {
    name: String,
    role: AgentRole,
    #[serde(default)]
    summary: String,
}

async fn create_persona(
    State(state): State<ApiState>,
    Json(body): Json<CreatePersona>,
) -> ApiResult<(StatusCode, Json<Persona>)> {
    if body.name.trim().is_empty() {
        return Err(CoreError::Validation("name must not be empty".into()).into());
    }
    let persona = Persona::new(body.name, body.role, body.summary);
    let id = state.personas.insert(persona)?;
    Ok((StatusCode::CREATED, Json(state.personas.get(id)?)))
}

#[derive(Debug, Deserialize)]
struct UpdatePersona {
    summary: Option<String>,
    is_active: Option<bool>,
}

async fn update_persona(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdatePersona>,
) -> ApiResult<Json<Persona>> {
    Ok(Json(state.personas.update(id, body.summary, body.is_active)?))
}

async fn delete_persona(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.personas.delete(id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Credits
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreditQuery {
    user_id: Uuid,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

#[derive(Debug, Serialize)]
struct CreditActivitiesResponse {
    activities: Vec<CreditActivity>,
    summary: CreditSummary,
}

async fn credit_activities(
    State(state): State<ApiState>,
    Query(query): Query<CreditQuery>,
) -> Json<CreditActivitiesResponse> {
    Json(CreditActivitiesResponse {
        activities: state
            .credits
            .list_for_user(query.user_id, query.limit, query.offset),
        summary: state.credits.summary_for_user(query.user_id),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use sy_core::store::{EpicStore, StoryStore};
    use sy_core::types::Project;
    use tower::ServiceExt;

    fn test_state() -> (ApiState, Uuid) {
        let projects = ProjectStore::new();
        let stories = StoryStore::new();
        let epics = EpicStore::new();
        let project_id = projects.insert(Project::new("demo"));
        let kanban = KanbanController::new(projects.clone(), stories, epics);
        (
            ApiState {
                projects,
                backlog: BacklogStore::new(),
                personas: PersonaStore::new(),
                credits: CreditLedger::new(),
                kanban,
            },
            project_id,
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn flow_metrics_for_known_project() {
        let (state, project_id) = test_state();
        let app = router(state);

        let response = app
            .oneshot(
                Request::get(format!("/projects/{project_id}/flow-metrics?days=7"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json.get("throughput_per_week").is_some());
    }

    #[tokio::test]
    async fn flow_metrics_unknown_project_is_404() {
        let (state, _) = test_state();
        let app = router(state);

        let response = app
            .oneshot(
                Request::get(format!("/projects/{}/flow-metrics", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn backlog_create_move_and_list() {
        let (state, project_id) = test_state();
        let app = router(state);

        // Create two items in Todo.
        for title in ["first", "second"] {
            let response = app
                .clone()
                .oneshot(
                    Request::post("/backlog-items")
                        .header("content-type", "application/json")
                        .body(Body::from(
                            serde_json::json!({
                                "project_id": project_id,
                                "title": title,
                                "status": "Todo",
                            })
                            .to_string(),
                        ))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = app
            .clone()
            .oneshot(
                Request::get("/backlog-items?status=Todo")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let items = body_json(response).await;
        let items = items.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["rank"], 1);

        // Move the second item to the top of Doing.
        let id = items[1]["id"].as_str().unwrap();
        let response = app
            .clone()
            .oneshot(
                Request::put(format!(
                    "/backlog-items/{id}/move?new_status=Doing&new_rank=1"
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let moved = body_json(response).await;
        assert_eq!(moved["status"], "Doing");
        assert_eq!(moved["rank"], 1);
    }

    #[tokio::test]
    async fn persona_crud_and_conflict() {
        let (state, _) = test_state();
        let app = router(state.clone());

        let create = |name: &str| {
            Request::post("/personas")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"name": name, "role": "developer", "summary": "s"})
                        .to_string(),
                ))
                .unwrap()
        };

        let response = app.clone().oneshot(create("Ada")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let persona = body_json(response).await;
        let id = persona["id"].as_str().unwrap().to_string();

        // Duplicate (name, role) conflicts.
        let response = app.clone().oneshot(create("Ada")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // Delete blocked while referenced by a live agent.
        let uuid = Uuid::parse_str(&id).unwrap();
        state.personas.retain(uuid);
        let response = app
            .clone()
            .oneshot(
                Request::delete(format!("/personas/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        state.personas.release(uuid);
        let response = app
            .oneshot(
                Request::delete(format!("/personas/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn credit_activities_include_summary() {
        let (state, project_id) = test_state();
        let user = Uuid::new_v4();
        state.credits.record(CreditActivity {
            id: Uuid::new_v4(),
            user_id: user,
            project_id,
            tokens_used: 420,
            model_used: "sonnet".into(),
            llm_calls: 2,
            credits_delta: -420,
            reason: "developer graph".into(),
            story_id: None,
            agent_id: None,
            created_at: Utc::now(),
        });
        let app = router(state);

        let response = app
            .oneshot(
                Request::get(format!("/credits/activities?user_id={user}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["activities"].as_array().unwrap().len(), 1);
        assert_eq!(json["summary"]["total_tokens"], 420);
        assert_eq!(json["summary"]["top_model"], "sonnet");
    }
}
