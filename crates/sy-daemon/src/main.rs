use std::sync::Arc;

use sy_agents::ScriptedClient;
use sy_daemon::{AppConfig, AppContainer, CommandRunner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sy_telemetry::init_logging("sy-daemon", "info");

    // The LLM provider is an external collaborator; without one configured
    // the daemon still runs the full pipeline and answers honestly.
    let client = Arc::new(ScriptedClient::new("unconfigured").with_default(
        "ACTION: RESPOND\nMESSAGE: No completion provider is configured for this deployment.",
    ));

    let config = AppConfig::default();
    let bind_addr = config.bind_addr;
    let container = Arc::new(AppContainer::build(config, client, Arc::new(CommandRunner))?);
    container.start()?;

    let app = sy_bridge::bridge_router(container.api_state(), container.rooms.clone())
        .merge(sy_daemon::admin::admin_router(container.clone()));
    let shutdown = container.shutdown.clone();
    let serve = tokio::spawn(sy_bridge::serve(bind_addr, app, async move {
        shutdown.cancelled().await;
    }));

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received");
    container.stop().await;
    serve.await??;
    Ok(())
}
