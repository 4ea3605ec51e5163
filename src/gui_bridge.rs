use crate::config::Config;
use crate::controller::{ControlCommand, SessionUpdate};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

#[derive(Deserialize)]
struct GuiMessage {
    #[serde(rename = "type")]
    msg_type: String,
}

/// Map one GUI datagram to a control command.
pub fn parse_command(msg: &str) -> Option<ControlCommand> {
    let message: GuiMessage = serde_json::from_str(msg).ok()?;
    match message.msg_type.as_str() {
        "toggle" => Some(ControlCommand::Toggle),
        "connect" => Some(ControlCommand::Connect),
        "disconnect" => Some(ControlCommand::Disconnect),
        _ => None,
    }
}

pub struct GuiBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    buffer_size: usize,
    tx: mpsc::Sender<ControlCommand>,
}

// GUI进程和Core进程通过本地UDP通信，端口在配置中指定
impl GuiBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<ControlCommand>) -> anyhow::Result<Self> {
        // 绑定本地UDP端口
        let socket =
            UdpSocket::bind(format!("{}:{}", config.gui_local_ip, config.gui_local_port)).await?;
        let target_addr = format!("{}:{}", config.gui_remote_ip, config.gui_remote_port);
        log::info!(
            "GUI bridge on {}, sending to {}",
            socket.local_addr()?,
            target_addr
        );

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            buffer_size: config.gui_buffer_size.max(64),
            tx,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            // 通过UDP socket接收消息
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            let Ok(msg) = std::str::from_utf8(&buf[..len]) else {
                log::warn!("Non UTF-8 datagram from GUI ({} bytes)", len);
                continue;
            };
            match parse_command(msg) {
                Some(command) => {
                    if let Err(e) = self.tx.send(command).await {
                        log::error!("Failed to send GUI command: {}", e);
                        break;
                    }
                }
                None => log::debug!("Unhandled GUI message: {}", msg),
            }
        }
        Ok(())
    }

    pub async fn send_update(&self, update: &SessionUpdate) -> anyhow::Result<()> {
        let msg = serde_json::to_string(update)?;
        self.send_message(&msg).await
    }

    pub async fn send_message(&self, msg: &str) -> anyhow::Result<()> {
        self.socket
            .send_to(msg.as_bytes(), &self.target_addr)
            .await?;
        Ok(())
    }
}
