use crate::error::SessionError;

/// Runtime override for the client's remote endpoint.
pub const PROXY_URL_ENV: &str = "VIBE_PROXY_URL";
/// Credential for the remote service. Only the relay process reads it.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const RELAY_BIND_ENV: &str = "VIBE_RELAY_BIND";
pub const UPSTREAM_URL_ENV: &str = "VIBE_UPSTREAM_URL";

#[derive(Debug, Clone)]
pub struct Config {
    // 会话配置
    pub proxy_url: String,
    pub model: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,

    // 音频设备配置
    pub capture_device: String,
    pub playback_device: String,
    pub capture_sample_rate: u32,
    pub playback_period_size: usize,

    // GUI进程配置
    pub gui_local_port: u16,
    pub gui_remote_port: u16,
    pub gui_local_ip: String,
    pub gui_remote_ip: String,
    pub gui_buffer_size: usize,

    /// Persona, rules and the evaluation protocol, sent once in the Setup message.
    pub system_instruction: String,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            proxy_url: env!("SESSION_PROXY_URL").to_string(),
            model: env!("SESSION_MODEL").to_string(),
            input_sample_rate: env!("SESSION_INPUT_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse SESSION_INPUT_SAMPLE_RATE")?,
            output_sample_rate: env!("SESSION_OUTPUT_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse SESSION_OUTPUT_SAMPLE_RATE")?,

            capture_device: env!("AUDIO_CAPTURE_DEVICE").to_string(),
            playback_device: env!("AUDIO_PLAYBACK_DEVICE").to_string(),
            capture_sample_rate: env!("AUDIO_CAPTURE_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse AUDIO_CAPTURE_SAMPLE_RATE")?,
            playback_period_size: env!("AUDIO_PLAYBACK_PERIOD_SIZE").parse()
                .map_err(|_| "Failed to parse AUDIO_PLAYBACK_PERIOD_SIZE")?,

            gui_local_port: env!("GUI_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse GUI_LOCAL_PORT")?,
            gui_remote_port: env!("GUI_REMOTE_PORT").parse()
                .map_err(|_| "Failed to parse GUI_REMOTE_PORT")?,
            gui_local_ip: env!("GUI_LOCAL_IP").to_string(),
            gui_remote_ip: env!("GUI_REMOTE_IP").to_string(),
            gui_buffer_size: env!("GUI_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse GUI_BUFFER_SIZE")?,

            system_instruction: system_instruction(),
        })
    }

    /// Apply process-environment overrides on top of the compiled-in defaults.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(PROXY_URL_ENV) {
            if !url.trim().is_empty() {
                self.proxy_url = url.trim().to_string();
            }
        }
        self
    }
}

/// Relay process configuration. The credential lives here and nowhere else.
#[derive(Clone)]
pub struct RelayConfig {
    pub bind: String,
    pub upstream_url: String,
    pub api_key: Option<String>,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, SessionError> {
        let bind = std::env::var(RELAY_BIND_ENV).unwrap_or_else(|_| env!("RELAY_BIND").to_string());
        let upstream_url = std::env::var(UPSTREAM_URL_ENV)
            .unwrap_or_else(|_| env!("RELAY_UPSTREAM_URL").to_string());
        url::Url::parse(&upstream_url)
            .map_err(|e| SessionError::Config(format!("invalid upstream url {}: {}", upstream_url, e)))?;

        let api_key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty());

        Ok(Self { bind, upstream_url, api_key })
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

// Keep the credential out of Debug output.
impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("bind", &self.bind)
            .field("upstream_url", &self.upstream_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ======================== Coaching persona ========================

const ROLE: &str = "Lead English Coach";

const PERSONA: &str = "You are a charismatic, high-energy, and directive English speaking coach. \
Your mission is to LEAD the user through a high-intensity speaking workout. \
You do NOT wait for the user to start. YOU drive the session. \
Prioritize FLUENCY and CONFIDENCE over perfect grammar.";

const RULES: &[&str] = &[
    "ALWAYS take the lead. Do not ask open-ended 'what do you want to do?' questions unless setting the initial topic.",
    "Keep your output short (1-2 sentences max) so the user speaks more.",
    "If the user pauses or hesitates, jump in with a helpful prompt or a new question.",
    "Use a 'Sandwich Feedback' method: Praise -> Correction/Tip -> Next Question.",
    "Maintain a 10-20 minute session arc: Warmup -> Shadowing -> Roleplay/Free Talk -> Cool down.",
];

const EVALUATION_PROTOCOL: &str = "When the session ends, output exactly one JSON object and no other braces, \
with this shape: {\"fluency_score\": <0-100>, \"vocabulary_score\": <0-100>, \
\"confidence_score\": <0-100>, \"key_phrases\": [<string>, ...], \"feedback\": <string>}";

/// Assemble the system instruction text: role, persona, rules, then the evaluation protocol.
pub fn system_instruction() -> String {
    let mut text = String::new();
    text.push_str(ROLE);
    text.push('\n');
    text.push_str(PERSONA);
    for rule in RULES {
        text.push('\n');
        text.push_str(rule);
    }
    text.push('\n');
    text.push_str(EVALUATION_PROTOCOL);
    text
}
