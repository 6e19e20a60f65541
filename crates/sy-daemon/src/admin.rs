//! Admin routes served next to the bridge: pool control, persona seeding,
//! and smoke-test event publishing for operators.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use sy_events::schemas::{StoryStatusEvent, UserMessageEvent};
use sy_events::topics;

use crate::app::AppContainer;

pub fn admin_router(container: Arc<AppContainer>) -> Router {
    Router::new()
        .route("/admin/pools", get(list_pools))
        .route("/admin/pools/{name}/start", post(start_pool))
        .route("/admin/pools/{name}/stop", post(stop_pool))
        .route("/admin/seed-personas", post(seed_personas))
        .route("/admin/publish-test", post(publish_test))
        .with_state(container)
}

async fn list_pools(State(app): State<Arc<AppContainer>>) -> Json<serde_json::Value> {
    let stats: serde_json::Map<String, serde_json::Value> = app
        .pools
        .iter()
        .map(|pool| {
            (
                pool.name().to_string(),
                serde_json::to_value(pool.stats()).unwrap_or_default(),
            )
        })
        .collect();
    Json(serde_json::Value::Object(stats))
}

async fn start_pool(
    State(app): State<Arc<AppContainer>>,
    Path(name): Path<String>,
) -> Result<StatusCode, StatusCode> {
    let pool = app
        .pools
        .iter()
        .find(|p| p.name() == name)
        .ok_or(StatusCode::NOT_FOUND)?;
    pool.start();
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_pool(
    State(app): State<Arc<AppContainer>>,
    Path(name): Path<String>,
) -> Result<StatusCode, StatusCode> {
    let pool = app
        .pools
        .iter()
        .find(|p| p.name() == name)
        .ok_or(StatusCode::NOT_FOUND)?;
    pool.stop();
    Ok(StatusCode::NO_CONTENT)
}

async fn seed_personas(State(app): State<Arc<AppContainer>>) -> Json<serde_json::Value> {
    let inserted = sy_agents::personas::seed_default_personas(&app.personas);
    Json(serde_json::json!({ "inserted": inserted }))
}

#[derive(Debug, Deserialize)]
struct PublishTest {
    topic: String,
    project_id: Uuid,
    #[serde(default)]
    content: Option<String>,
}

async fn publish_test(
    State(app): State<Arc<AppContainer>>,
    Json(body): Json<PublishTest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let envelope = match body.topic.as_str() {
        "user.messages" => UserMessageEvent {
            project_id: body.project_id,
            user_id: Uuid::new_v4(),
            content: body
                .content
                .unwrap_or_else(|| "smoke test message".into()),
            attachments: Vec::new(),
        }
        .envelope()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
        "story.events" => StoryStatusEvent {
            story_id: Uuid::new_v4(),
            project_id: body.project_id,
            from_status: sy_core::types::StoryStatus::Todo,
            to_status: sy_core::types::StoryStatus::InProgress,
        }
        .envelope()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
        _ => return Err(StatusCode::BAD_REQUEST),
    };

    let topic = topics::ALL
        .into_iter()
        .find(|t| t.as_str() == body.topic)
        .ok_or(StatusCode::BAD_REQUEST)?;
    let event_id = envelope.event_id;
    sy_events::Broker::publish(
        app.broker.as_ref(),
        topic,
        &body.project_id.to_string(),
        envelope,
    )
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(serde_json::json!({ "published": event_id })))
}
