use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use vibe_coach_rs::audio::AlsaIo;
use vibe_coach_rs::config::Config;
use vibe_coach_rs::controller::{ControlCommand, CoreController, SessionUpdate};
use vibe_coach_rs::gui_bridge::GuiBridge;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志，默认 info 级别
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 加载配置
    let config = Config::new()
        .map_err(|e| anyhow::anyhow!(e))?
        .with_env_overrides();
    log::info!(
        "{} {} - relay {}, model {}",
        env!("APP_NAME"),
        env!("APP_VERSION"),
        config.proxy_url,
        config.model
    );

    // 创建通道，用于组件间通信
    let (tx_command, rx_command) = mpsc::channel::<ControlCommand>(16);
    let (tx_update, mut rx_update) = mpsc::unbounded_channel::<SessionUpdate>();

    // 启动GUI桥，与GUI进程通信
    let gui_bridge = Arc::new(
        GuiBridge::new(&config, tx_command.clone())
            .await
            .context("failed to start GUI bridge")?,
    );
    let gui_bridge_clone = gui_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = gui_bridge_clone.run().await {
            log::error!("GuiBridge error: {}", e);
        }
    });
    tokio::spawn(async move {
        while let Some(update) = rx_update.recv().await {
            if let Err(e) = gui_bridge.send_update(&update).await {
                log::warn!("Failed to send to GUI: {}", e);
            }
        }
    });

    let io = AlsaIo::new(
        &config.capture_device,
        &config.playback_device,
        config.playback_period_size,
    );
    let controller = CoreController::new(&config, Box::new(io), tx_update);

    // 启动即开始会话，之后由GUI切换
    tx_command.send(ControlCommand::Connect).await?;

    let controller = controller
        .run(rx_command, async {
            if let Err(e) = signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await;

    if let Some(score) = controller.score() {
        log::info!("Final score: {:?}", score);
    }
    Ok(())
}
