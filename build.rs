use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    agent: Agent,
    backend: Backend,
    audio: Audio,
    gui: Gui,
    storage: Storage,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Agent {
    ws_url: String,
    agent_id: String,
    keep_alive_secs: u64,
    session_limit_secs: u64,
    settle_delay_ms: u64,
}

#[derive(Deserialize)]
struct Backend {
    url: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    capture_sample_rate: u32,
    input_sample_rate: u32,
    output_sample_rate: u32,
    processor_frames: usize,
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
struct Storage {
    path: String,
}

// Read config.toml at compile time and expose it through rustc-env.
fn main() {
    println!("cargo:rerun-if-changed=config.toml");
    println!("cargo:rerun-if-changed=agent_settings.json");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // Agent session
    println!("cargo:rustc-env=AGENT_WS_URL={}", config.agent.ws_url);
    println!("cargo:rustc-env=AGENT_ID={}", config.agent.agent_id);
    println!("cargo:rustc-env=KEEP_ALIVE_SECS={}", config.agent.keep_alive_secs);
    println!("cargo:rustc-env=SESSION_LIMIT_SECS={}", config.agent.session_limit_secs);
    println!("cargo:rustc-env=SETTLE_DELAY_MS={}", config.agent.settle_delay_ms);

    println!("cargo:rustc-env=BACKEND_URL={}", config.backend.url);

    // Audio
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=CAPTURE_SAMPLE_RATE={}", config.audio.capture_sample_rate);
    println!("cargo:rustc-env=INPUT_SAMPLE_RATE={}", config.audio.input_sample_rate);
    println!("cargo:rustc-env=OUTPUT_SAMPLE_RATE={}", config.audio.output_sample_rate);
    println!("cargo:rustc-env=PROCESSOR_FRAMES={}", config.audio.processor_frames);
    println!("cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}", config.audio.playback_period_size);

    // GUI
    println!("cargo:rustc-env=GUI_LOCAL_PORT={}", config.gui.local_port);
    println!("cargo:rustc-env=GUI_REMOTE_PORT={}", config.gui.remote_port);
    println!("cargo:rustc-env=GUI_LOCAL_IP={}", config.gui.local_ip);
    println!("cargo:rustc-env=GUI_REMOTE_IP={}", config.gui.remote_ip);
    println!("cargo:rustc-env=GUI_BUFFER_SIZE={}", config.gui.buffer_size);

    println!("cargo:rustc-env=STORAGE_PATH={}", config.storage.path);
}
