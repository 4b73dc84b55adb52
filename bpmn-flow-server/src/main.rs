use std::sync::Arc;

use bpmn_flow_core::collaborators::Collaborators;
use bpmn_flow_core::{Engine, EngineConfig};
use bpmn_flow_server::http;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = EngineConfig::from_env();
    let addr = parse_bind_addr();

    let engine: Arc<Engine> = Engine::new(config, Collaborators::default());
    let app = http::router(engine);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("BPMN-Flow server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Parse the bind address from `--bind <addr>` CLI arg or `BIND_ADDR` env
/// var; CLI arg takes precedence.
fn parse_bind_addr() -> String {
    let args: Vec<String> = std::env::args().collect();
    if let Some(addr) = args
        .windows(2)
        .find(|w| w[0] == "--bind")
        .map(|w| w[1].clone())
    {
        return addr;
    }
    std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(%err, "failed to install ctrl-c handler");
    }
    tracing::info!("shutdown requested");
}
