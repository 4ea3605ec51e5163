//! Session protocol messages exchanged with the remote voice agent.
//!
//! Client→server messages use snake_case keys, server→client messages camelCase.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SessionError};

/// MIME type of outbound microphone chunks.
pub const PCM_MIME_TYPE: &str = "audio/pcm";

// ======================== Client → Server ========================

/// Setup handshake, the first and only-once message of every connection.
#[derive(Serialize, Debug)]
pub struct SetupMessage {
    setup: Setup,
}

#[derive(Serialize, Debug)]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
    tools: Vec<Tool>,
}

#[derive(Serialize, Debug)]
struct GenerationConfig {
    response_modalities: Vec<String>,
}

#[derive(Serialize, Debug)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Serialize, Debug)]
struct TextPart {
    text: String,
}

#[derive(Serialize, Debug)]
struct Tool {
    google_search_retrieval: EmptyObject,
}

#[derive(Serialize, Debug)]
struct EmptyObject {}

impl SetupMessage {
    /// `model` is the bare identifier; the `models/` prefix is added here.
    pub fn new(model: &str, system_instruction: &str) -> Self {
        Self {
            setup: Setup {
                model: format!("models/{}", model),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                },
                system_instruction: Content {
                    parts: vec![TextPart {
                        text: system_instruction.to_string(),
                    }],
                },
                tools: vec![Tool {
                    google_search_retrieval: EmptyObject {},
                }],
            },
        }
    }
}

/// One streamed microphone frame.
#[derive(Serialize, Debug)]
pub struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

#[derive(Serialize, Debug)]
struct RealtimeInput {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Serialize, Debug)]
struct MediaChunk {
    mime_type: String,
    data: String,
}

impl RealtimeInputMessage {
    /// `data` is base64 of 16-bit little-endian mono PCM.
    pub fn audio(data: String) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaChunk {
                    mime_type: PCM_MIME_TYPE.to_string(),
                    data,
                }],
            },
        }
    }
}

// ======================== Server → Client ========================

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub server_content: Option<ServerContent>,
    pub setup_complete: Option<Value>,
    pub tool_call: Option<Value>,
    pub tool_use: Option<Value>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Deserialize, Debug, Default)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<RawPart>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RawPart {
    pub inline_data: Option<InlineData>,
    pub text: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

/// A decoded model-turn part, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPart {
    /// Raw 16-bit LE PCM bytes at the agent's output rate.
    Audio { mime_type: String, pcm: Vec<u8> },
    Text(String),
}

/// Parse one inbound frame. Binary frames carry the same JSON as text frames.
pub fn parse_server_message(payload: &[u8]) -> Result<ServerMessage> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| SessionError::MalformedServerMessage(format!("not utf-8: {}", e)))?;
    serde_json::from_str(text).map_err(|e| SessionError::MalformedServerMessage(e.to_string()))
}

impl ServerMessage {
    /// Decode the model-turn parts in arrival order. Non-audio inline data is skipped.
    pub fn into_parts(self) -> Result<Vec<InboundPart>> {
        let Some(raw_parts) = self
            .server_content
            .and_then(|content| content.model_turn)
            .map(|turn| turn.parts)
        else {
            return Ok(Vec::new());
        };

        let mut parts = Vec::with_capacity(raw_parts.len());
        for raw in raw_parts {
            if let Some(inline) = raw.inline_data {
                if inline.mime_type.starts_with("audio") {
                    let pcm = BASE64.decode(inline.data.as_bytes()).map_err(|e| {
                        SessionError::MalformedServerMessage(format!("bad audio payload: {}", e))
                    })?;
                    parts.push(InboundPart::Audio {
                        mime_type: inline.mime_type,
                        pcm,
                    });
                } else {
                    log::debug!("Skipping inline data of type {}", inline.mime_type);
                }
            }
            if let Some(text) = raw.text {
                if !text.is_empty() {
                    parts.push(InboundPart::Text(text));
                }
            }
        }
        Ok(parts)
    }
}
