use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use vibe_coach_rs::config::RelayConfig;
use vibe_coach_rs::relay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RelayConfig::from_env()?;
    log::info!("Relay config: {:?}", config);

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    relay::serve(listener, config, async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
        }
        log::info!("Received Ctrl+C, shutting down...");
    })
    .await
}
