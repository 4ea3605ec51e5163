use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    session: Session,
    audio: Audio,
    gui: Gui,
    relay: Relay,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Session {
    proxy_url: String,
    model: String,
    input_sample_rate: u32,
    output_sample_rate: u32,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    capture_sample_rate: u32,
    playback_period_size: usize,
}

#[derive(Deserialize)]
struct Gui {
    local_port: u16,
    remote_port: u16,
    local_ip: String,
    remote_ip: String,
    buffer_size: usize,
}

#[derive(Deserialize)]
struct Relay {
    bind: String,
    upstream_url: String,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 会话配置
    println!("cargo:rustc-env=SESSION_PROXY_URL={}", config.session.proxy_url);
    println!("cargo:rustc-env=SESSION_MODEL={}", config.session.model);
    println!("cargo:rustc-env=SESSION_INPUT_SAMPLE_RATE={}", config.session.input_sample_rate);
    println!("cargo:rustc-env=SESSION_OUTPUT_SAMPLE_RATE={}", config.session.output_sample_rate);

    // 音频配置
    println!("cargo:rustc-env=AUDIO_CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_CAPTURE_SAMPLE_RATE={}", config.audio.capture_sample_rate);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_PERIOD_SIZE={}", config.audio.playback_period_size);

    // GUI 配置
    println!("cargo:rustc-env=GUI_LOCAL_PORT={}", config.gui.local_port);
    println!("cargo:rustc-env=GUI_REMOTE_PORT={}", config.gui.remote_port);
    println!("cargo:rustc-env=GUI_LOCAL_IP={}", config.gui.local_ip);
    println!("cargo:rustc-env=GUI_REMOTE_IP={}", config.gui.remote_ip);
    println!("cargo:rustc-env=GUI_BUFFER_SIZE={}", config.gui.buffer_size);

    // 中继配置
    println!("cargo:rustc-env=RELAY_BIND={}", config.relay.bind);
    println!("cargo:rustc-env=RELAY_UPSTREAM_URL={}", config.relay.upstream_url);
}
