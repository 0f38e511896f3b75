/// Main application entry point
/// Proper dependency injection and graceful shutdown
use duplex_api_server::{
    services::{EchoService, SystemService},
    Config, HandlerRegistry, RestDispatcher, RpcDispatcher, SessionStore,
};
use std::sync::Arc;
use tracing::{error, info};

/// Initialize logging subsystem
pub fn initialize_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}

/// Load and validate configuration
pub fn load_config() -> anyhow::Result<Config> {
    let config = Config::from_env()?;
    config.validate()?;

    info!(
        host = %config.server_host,
        rest_port = %config.rest_port,
        ws_port = %config.ws_port,
        timeout_ms = %config.request_timeout_ms,
        "Configuration loaded"
    );

    Ok(config)
}

/// Register the built-in service objects
pub fn build_registry(sessions: Arc<SessionStore>) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register_api("system", Arc::new(SystemService::new()));
    registry.register_api("echo", Arc::new(EchoService::new(sessions)));

    info!(
        namespaces = ?registry.namespaces(),
        handlers = registry.routable().len(),
        "Handler registry built"
    );

    Arc::new(registry)
}

/// Start both transports and run until shutdown
pub async fn start_servers(
    config: &Config,
    registry: Arc<HandlerRegistry>,
    sessions: Arc<SessionStore>,
) -> anyhow::Result<()> {
    let rest = RestDispatcher::new(&registry, sessions.clone(), config.rest_config());
    let rpc = RpcDispatcher::new(registry, sessions, config.ws_config());

    info!("Starting REST and WebSocket servers...");
    tokio::try_join!(rest.serve(), rpc.serve())?;

    Ok(())
}

/// Main application logic (extracted for testing)
pub async fn run_application() -> anyhow::Result<()> {
    initialize_logging();
    info!("Starting dual-transport API server");

    let config = load_config()?;
    let sessions = Arc::new(SessionStore::new());
    let registry = build_registry(sessions.clone());

    match start_servers(&config, registry, sessions).await {
        Ok(()) => {
            info!("Server shutdown completed");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run_application().await
}
