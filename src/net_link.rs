//! Duplex session link to the voice agent (through the local relay).
//!
//! Every `connect` starts a fresh link with its own id. A link walks
//! `Connecting → Connected → Disconnected | Error` once and never leaves a terminal
//! state, so late transport events of a finished link cannot resurrect it. Events are
//! tagged with the link id; consumers drop events of links that are no longer current.
//! A new link dials only after the previous link's task has finished, so a client
//! holds at most one transport.

use crate::config::Config;
use crate::error::Result;
use crate::protocol::{parse_server_message, InboundPart, RealtimeInputMessage, SetupMessage};
use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Minimum spacing of the outbound audio heartbeat log.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Received text is logged up to this many characters.
const LOG_TEXT_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    State { link: u64, state: ConnectionState },
    /// Decoded 16-bit LE PCM of one audio part.
    Audio { link: u64, pcm: Vec<u8> },
    /// Consecutive text parts of one server message, joined.
    Text { link: u64, text: String },
}

#[derive(Debug)]
enum NetCommand {
    SendAudio(String),
    Disconnect,
}

/// State shared between the client and the task driving one link.
#[derive(Clone)]
struct LinkShared {
    id: u64,
    state: std::sync::Arc<watch::Sender<ConnectionState>>,
    events: mpsc::UnboundedSender<NetEvent>,
}

impl LinkShared {
    /// Move to `next` and notify. Terminal states are final.
    fn transition(&self, next: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            log::info!("Link {} state: {:?}", self.id, next);
            let _ = self.events.send(NetEvent::State {
                link: self.id,
                state: next,
            });
        }
        changed
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn emit(&self, event: NetEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Event receiver dropped, link {}", self.id);
        }
    }
}

struct LinkHandle {
    shared: LinkShared,
    cmd_tx: mpsc::UnboundedSender<NetCommand>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Heartbeat {
    last: Option<Instant>,
    frames: u64,
    bytes: usize,
}

pub struct LiveClient {
    url: String,
    model: String,
    system_instruction: String,
    events: mpsc::UnboundedSender<NetEvent>,
    link: Option<LinkHandle>,
    next_link: u64,
    heartbeat: Heartbeat,
}

impl LiveClient {
    pub fn new(config: &Config, events: mpsc::UnboundedSender<NetEvent>) -> Self {
        Self {
            url: config.proxy_url.clone(),
            model: config.model.clone(),
            system_instruction: config.system_instruction.clone(),
            events,
            link: None,
            next_link: 1,
            heartbeat: Heartbeat::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.link
            .as_ref()
            .map(|link| link.shared.current())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Id of the most recent link, if any.
    pub fn current_link(&self) -> Option<u64> {
        self.link.as_ref().map(|link| link.shared.id)
    }

    pub fn is_current(&self, link: u64) -> bool {
        self.current_link() == Some(link)
    }

    /// Open a new session. Returns false, doing nothing, while a link is
    /// connecting or connected. Must be called inside a tokio runtime.
    pub fn connect(&mut self) -> bool {
        if matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            log::warn!("Connect ignored, link {:?} still active", self.current_link());
            return false;
        }

        let setup = match serde_json::to_string(&SetupMessage::new(
            &self.model,
            &self.system_instruction,
        )) {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to encode setup message: {}", e);
                return false;
            }
        };

        let id = self.next_link;
        self.next_link += 1;
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let shared = LinkShared {
            id,
            state: std::sync::Arc::new(state_tx),
            events: self.events.clone(),
        };
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        log::info!("Link {} state: {:?}", id, ConnectionState::Connecting);
        shared.emit(NetEvent::State {
            link: id,
            state: ConnectionState::Connecting,
        });

        // 旧链路可能还在发送关闭帧，新链路等它结束后再拨号
        let previous = self.link.take().map(|link| link.task);
        let task = tokio::spawn(run_link(
            shared.clone(),
            self.url.clone(),
            setup,
            cmd_rx,
            previous,
        ));
        self.link = Some(LinkHandle {
            shared,
            cmd_tx,
            task,
        });
        self.heartbeat = Heartbeat::default();
        true
    }

    /// Queue one base64 microphone frame. Dropped unless connected.
    pub fn send_audio(&mut self, data: String) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        if link.shared.current() != ConnectionState::Connected {
            return;
        }

        let bytes = data.len();
        let json = match serde_json::to_string(&RealtimeInputMessage::audio(data)) {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to encode audio frame: {}", e);
                return;
            }
        };
        if link.cmd_tx.send(NetCommand::SendAudio(json)).is_err() {
            log::warn!("Link {} writer gone, audio frame dropped", link.shared.id);
            return;
        }

        // 心跳日志，最多每2秒一次
        let beat = &mut self.heartbeat;
        beat.frames += 1;
        beat.bytes += bytes;
        let due = beat
            .last
            .map(|last| last.elapsed() >= HEARTBEAT_INTERVAL)
            .unwrap_or(true);
        if due {
            log::debug!("Streaming audio: {} frames, {} bytes base64", beat.frames, beat.bytes);
            beat.last = Some(Instant::now());
        }
    }

    /// Close the current link. Its state becomes Disconnected immediately.
    pub fn disconnect(&mut self) {
        self.close_link(ConnectionState::Disconnected);
    }

    /// Close the current link because of a local failure; its state becomes Error.
    pub fn abort(&mut self) {
        self.close_link(ConnectionState::Error);
    }

    fn close_link(&mut self, state: ConnectionState) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        link.shared.transition(state);
        let _ = link.cmd_tx.send(NetCommand::Disconnect);
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ======================== Link task ========================

async fn run_link(
    shared: LinkShared,
    url: String,
    setup: String,
    mut commands: mpsc::UnboundedReceiver<NetCommand>,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        tokio::select! {
            _ = previous => {}
            _ = disconnect_requested(&mut commands) => {
                shared.transition(ConnectionState::Disconnected);
                return;
            }
        }
    }

    log::info!("Connecting to {}...", url);
    let connected = tokio::select! {
        result = connect_async(url.as_str()) => result,
        _ = disconnect_requested(&mut commands) => {
            shared.transition(ConnectionState::Disconnected);
            return;
        }
    };

    let ws = match connected {
        Ok((ws, _)) => ws,
        Err(e) => {
            log::error!("Failed to connect to {}: {}", url, e);
            shared.transition(ConnectionState::Error);
            return;
        }
    };

    if !shared.transition(ConnectionState::Connected) {
        // 连接建立前已被用户断开
        return;
    }

    match pump(&shared, ws, setup, &mut commands).await {
        Ok(()) => {
            shared.transition(ConnectionState::Disconnected);
        }
        Err(e) => {
            log::error!("Link {} transport error: {}", shared.id, e);
            shared.transition(ConnectionState::Error);
        }
    }
}

async fn disconnect_requested(commands: &mut mpsc::UnboundedReceiver<NetCommand>) {
    loop {
        match commands.recv().await {
            Some(NetCommand::SendAudio(_)) => continue,
            Some(NetCommand::Disconnect) | None => return,
        }
    }
}

async fn pump(
    shared: &LinkShared,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    setup: String,
    commands: &mut mpsc::UnboundedReceiver<NetCommand>,
) -> Result<()> {
    let (mut write, mut read) = ws.split();

    // Setup 必须是连接上的第一条消息
    write.send(Message::Text(setup.into())).await?;
    log::info!("Setup sent on link {}", shared.id);

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch(shared, text.as_str().as_bytes()),
                    Some(Ok(Message::Binary(data))) => dispatch(shared, &data),
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed connection: {:?}", frame);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(NetCommand::SendAudio(json)) => {
                        write.send(Message::Text(json.into())).await?;
                    }
                    Some(NetCommand::Disconnect) | None => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            log::debug!("Close frame not delivered: {}", e);
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Decode one inbound frame and emit its parts in arrival order.
fn dispatch(shared: &LinkShared, payload: &[u8]) {
    let message = match parse_server_message(payload) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Dropping inbound frame: {}", e);
            return;
        }
    };

    if message.setup_complete.is_some() {
        log::info!("Setup complete");
    }
    if message.tool_call.is_some() || message.tool_use.is_some() {
        log::info!("Tool call received, not handled");
    }
    if let Some(content) = &message.server_content {
        if content.interrupted {
            log::info!("Model turn interrupted");
        }
        if content.turn_complete {
            log::debug!("Turn complete");
        }
    }

    let parts = match message.into_parts() {
        Ok(parts) => parts,
        Err(e) => {
            log::warn!("Dropping inbound frame: {}", e);
            return;
        }
    };

    let mut text = String::new();
    for part in parts {
        match part {
            InboundPart::Audio { pcm, .. } => {
                flush_text(shared, &mut text);
                shared.emit(NetEvent::Audio {
                    link: shared.id,
                    pcm,
                });
            }
            InboundPart::Text(fragment) => text.push_str(&fragment),
        }
    }
    flush_text(shared, &mut text);
}

fn flush_text(shared: &LinkShared, text: &mut String) {
    if text.is_empty() {
        return;
    }
    let preview: String = text.chars().take(LOG_TEXT_LIMIT).collect();
    log::info!("Agent text: {}", preview);
    shared.emit(NetEvent::Text {
        link: shared.id,
        text: std::mem::take(text),
    });
}
