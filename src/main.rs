//! Crash Wager Server
//!
//! Runs the round engine, the WebSocket game server and the HTTP balance API.
//! All settings come from the environment.

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crash_wager::{
    core::amount::multiplier_to_float,
    fair::CrashConfig,
    network::{AuthConfig, Authenticator, GameServer, PublisherConfig, ServerConfig},
    round::EngineConfig,
    VERSION,
};

#[cfg(feature = "debug-tracing")]
const DEFAULT_FILTER: &str = "crash_wager=debug,info";
#[cfg(not(feature = "debug-tracing"))]
const DEFAULT_FILTER: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let server_config = ServerConfig::from_env();
    let engine_config = EngineConfig::from_env();
    let publisher_config = PublisherConfig::from_env();
    let auth = Authenticator::new(&AuthConfig::from_env()).context("invalid auth configuration")?;

    info!("Crash Wager Server v{}", VERSION);
    log_settings(&server_config, &engine_config.crash, &engine_config);

    let server = std::sync::Arc::new(GameServer::new(server_config, engine_config, publisher_config, auth));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, finishing the current round");
            signal_server.shutdown();
        }
    });

    if let Err(e) = server.run().await {
        error!("Server stopped: {}", e);
        return Err(e.into());
    }

    info!("Server stopped cleanly");
    Ok(())
}

fn log_settings(server: &ServerConfig, crash: &CrashConfig, engine: &EngineConfig) {
    info!("WebSocket: {}  HTTP: {}", server.ws_bind_addr, server.http_bind_addr);
    info!(
        "Betting window: {}ms  Intermission: {}ms",
        engine.betting_window.as_millis(),
        engine.intermission.as_millis()
    );
    info!(
        "House edge: {} bps  Max multiplier: {:.2}x",
        crash.house_edge_bps,
        multiplier_to_float(crash.max_multiplier)
    );
    info!("Client seed: {}", server.client_seed);
}
