//! Session event loop: ties the live link, the audio devices and the score extractor
//! together and reports to the UI.

use crate::audio::{AudioConfig, AudioIo, AudioSystem, EncodedFrame};
use crate::config::Config;
use crate::net_link::{ConnectionState, LiveClient, NetEvent};
use crate::score::{ScoreExtractor, SessionScore};
use serde::Serialize;
use std::future::Future;
use tokio::sync::mpsc;

/// User-facing session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
    /// A microphone frame was just sent
    Listening,
    /// Agent audio was just scheduled
    Speaking,
}

impl From<ConnectionState> for SessionStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Disconnected => SessionStatus::Disconnected,
            ConnectionState::Connecting => SessionStatus::Connecting,
            ConnectionState::Connected => SessionStatus::Connected,
            ConnectionState::Error => SessionStatus::Error,
        }
    }
}

/// Everything the UI collaborator gets to see.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    Status { status: SessionStatus },
    InputLevel { level: f32 },
    OutputLevel { level: f32 },
    /// Newly received agent text
    Transcript { text: String },
    Score { score: SessionScore },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Connect,
    Disconnect,
    /// Connect when idle or failed, disconnect otherwise
    Toggle,
}

pub struct CoreController {
    client: LiveClient,
    net_rx: mpsc::UnboundedReceiver<NetEvent>,
    audio: AudioSystem,
    scores: ScoreExtractor,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    status: SessionStatus,
}

impl CoreController {
    pub fn new(
        config: &Config,
        io: Box<dyn AudioIo>,
        updates: mpsc::UnboundedSender<SessionUpdate>,
    ) -> Self {
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let audio_config = AudioConfig {
            capture_sample_rate: config.capture_sample_rate,
            input_sample_rate: config.input_sample_rate,
            output_sample_rate: config.output_sample_rate,
            meter_input: true,
        };
        Self {
            client: LiveClient::new(config, net_tx),
            net_rx,
            audio: AudioSystem::new(audio_config, io),
            scores: ScoreExtractor::new(),
            updates,
            status: SessionStatus::Disconnected,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.client.state()
    }

    /// Agent text received in the current (or last) session.
    pub fn transcript(&self) -> &str {
        self.scores.text()
    }

    pub fn score(&self) -> Option<&SessionScore> {
        self.scores.score()
    }

    pub fn handle_command(&mut self, command: ControlCommand) {
        log::info!("Control command: {:?}", command);
        match command {
            ControlCommand::Connect => self.connect(),
            ControlCommand::Disconnect => self.client.disconnect(),
            ControlCommand::Toggle => match self.client.state() {
                ConnectionState::Disconnected | ConnectionState::Error => self.connect(),
                ConnectionState::Connecting | ConnectionState::Connected => {
                    self.client.disconnect()
                }
            },
        }
    }

    fn connect(&mut self) {
        if matches!(
            self.client.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            log::warn!("Session already active");
            return;
        }

        self.scores.reset();
        // 先打开扬声器，第一段回复到达时渲染时钟已经在走
        if let Err(e) = self.audio.start_playback() {
            log::error!("Cannot start session: {}", e);
            self.set_status(SessionStatus::Error);
            return;
        }
        self.client.connect();
    }

    pub fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::State { link, state } => {
                if !self.client.is_current(link) {
                    log::debug!("Ignoring {:?} of stale link {}", state, link);
                    return;
                }
                match state {
                    ConnectionState::Connecting => {}
                    ConnectionState::Connected => {
                        if let Err(e) = self.audio.start_capture() {
                            log::error!("{}", e);
                            self.client.abort();
                            return;
                        }
                    }
                    ConnectionState::Disconnected | ConnectionState::Error => {
                        self.audio.stop();
                    }
                }
                self.set_status(state.into());
            }
            NetEvent::Audio { link, pcm } => {
                if !self.client.is_current(link) {
                    return;
                }
                if let Some(chunk) = self.audio.enqueue_playback(&pcm) {
                    self.publish(SessionUpdate::OutputLevel { level: chunk.level });
                    self.set_status(SessionStatus::Speaking);
                }
            }
            NetEvent::Text { link, text } => {
                if !self.client.is_current(link) {
                    return;
                }
                let score = self.scores.push(&text);
                self.publish(SessionUpdate::Transcript { text });
                if let Some(score) = score {
                    self.publish(SessionUpdate::Score { score });
                }
            }
        }
    }

    pub fn handle_frame(&mut self, frame: EncodedFrame) {
        if let Some(level) = frame.level {
            self.publish(SessionUpdate::InputLevel { level });
        }
        if self.client.state() != ConnectionState::Connected {
            return;
        }
        self.client.send_audio(frame.data);
        self.set_status(SessionStatus::Listening);
    }

    fn capture_lost(&mut self) {
        log::error!("Microphone stream ended unexpectedly");
        self.audio.stop();
        self.client.abort();
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status == status {
            return;
        }
        log::info!("Status: {:?} -> {:?}", self.status, status);
        self.status = status;
        self.publish(SessionUpdate::Status { status });
    }

    fn publish(&self, update: SessionUpdate) {
        if self.updates.send(update).is_err() {
            log::debug!("UI receiver dropped");
        }
    }

    /// Drive the session until `shutdown` resolves, then release everything.
    pub async fn run<F>(mut self, mut commands: mpsc::Receiver<ControlCommand>, shutdown: F) -> Self
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        log::info!("Controller started. Status: {:?}", self.status);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutting down session controller");
                    break;
                }
                Some(event) = self.net_rx.recv() => self.handle_net_event(event),
                Some(command) = commands.recv() => self.handle_command(command),
                frame = self.audio.next_frame() => match frame {
                    Some(frame) => self.handle_frame(frame),
                    None => self.capture_lost(),
                },
            }
        }

        self.client.disconnect();
        self.audio.stop();
        // 处理关闭前已排队的事件
        while let Ok(event) = self.net_rx.try_recv() {
            self.handle_net_event(event);
        }
        self
    }
}
