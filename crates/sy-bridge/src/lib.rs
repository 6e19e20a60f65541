//! HTTP/WS edge of the control plane: per-project websocket rooms and the
//! REST routes for flow metrics, backlog, personas, and credits.

pub mod api;
pub mod rooms;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use api::{ApiState, router};
pub use rooms::{ProjectRooms, SocketId};

/// Full bridge router: REST + websocket, with CORS and request tracing.
pub fn bridge_router(state: ApiState, rooms: Arc<ProjectRooms>) -> Router {
    api::router(state)
        .merge(ws::ws_router(rooms))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve the bridge until the provided shutdown future resolves.
pub async fn serve(
    addr: std::net::SocketAddr,
    app: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "bridge listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
