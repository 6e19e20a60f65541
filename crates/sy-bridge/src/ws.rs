//! Websocket transport for project rooms.
//!
//! Clients attach to `/ws/projects/{id}`; everything broadcast into the
//! project's room is forwarded down the socket. The fan-out is one-way; a
//! failed send detaches the socket from its room.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use uuid::Uuid;

use crate::rooms::ProjectRooms;

pub fn ws_router(rooms: Arc<ProjectRooms>) -> Router {
    Router::new()
        .route("/ws/projects/{id}", get(ws_handler))
        .with_state(rooms)
}

async fn ws_handler(
    State(rooms): State<Arc<ProjectRooms>>,
    Path(project_id): Path<Uuid>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| pump(rooms, project_id, socket))
}

async fn pump(rooms: Arc<ProjectRooms>, project_id: Uuid, mut socket: WebSocket) {
    let (socket_id, rx) = rooms.connect(project_id);
    while let Ok(message) = rx.recv_async().await {
        if socket.send(Message::Text(message.into())).await.is_err() {
            break;
        }
    }
    rooms.disconnect(socket_id);
    tracing::debug!(project = %project_id, socket = %socket_id, "websocket pump ended");
}
