use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::AgentConfig;

const FALLBACK_SETTINGS: &str = include_str!("../agent_settings.json");

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    // Agent session
    pub ws_url: &'static str,
    pub agent_id: &'static str,
    pub keep_alive_secs: u64,
    pub session_limit_secs: u64,
    pub settle_delay_ms: u64,

    // Backend that issues credentials and resolves function calls
    pub backend_url: &'static str,

    // Audio devices and formats
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub capture_sample_rate: u32,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub processor_frames: usize,
    pub playback_period_size: usize,

    // GUI process
    pub gui_local_port: u16,
    pub gui_remote_port: u16,
    pub gui_local_ip: &'static str,
    pub gui_remote_ip: &'static str,
    pub gui_buffer_size: usize,

    pub storage_path: &'static str,
}

impl Config {
    /// Build the configuration from the environment variables set by build.rs.
    /// Every value comes from config.toml at compile time.
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            ws_url: env!("AGENT_WS_URL"),
            agent_id: env!("AGENT_ID"),
            keep_alive_secs: env!("KEEP_ALIVE_SECS").parse()
                .map_err(|_| "Failed to parse KEEP_ALIVE_SECS")?,
            session_limit_secs: env!("SESSION_LIMIT_SECS").parse()
                .map_err(|_| "Failed to parse SESSION_LIMIT_SECS")?,
            settle_delay_ms: env!("SETTLE_DELAY_MS").parse()
                .map_err(|_| "Failed to parse SETTLE_DELAY_MS")?,

            backend_url: env!("BACKEND_URL"),

            capture_device: env!("CAPTURE_DEVICE"),
            playback_device: env!("PLAYBACK_DEVICE"),
            capture_sample_rate: env!("CAPTURE_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse CAPTURE_SAMPLE_RATE")?,
            input_sample_rate: env!("INPUT_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse INPUT_SAMPLE_RATE")?,
            output_sample_rate: env!("OUTPUT_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse OUTPUT_SAMPLE_RATE")?,
            processor_frames: env!("PROCESSOR_FRAMES").parse()
                .map_err(|_| "Failed to parse PROCESSOR_FRAMES")?,
            playback_period_size: env!("PLAYBACK_PERIOD_SIZE").parse()
                .map_err(|_| "Failed to parse PLAYBACK_PERIOD_SIZE")?,

            gui_local_port: env!("GUI_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse GUI_LOCAL_PORT")?,
            gui_remote_port: env!("GUI_REMOTE_PORT").parse()
                .map_err(|_| "Failed to parse GUI_REMOTE_PORT")?,
            gui_local_ip: env!("GUI_LOCAL_IP"),
            gui_remote_ip: env!("GUI_REMOTE_IP"),
            gui_buffer_size: env!("GUI_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse GUI_BUFFER_SIZE")?,

            storage_path: env!("STORAGE_PATH"),
        })
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn session_limit(&self) -> Duration {
        Duration::from_secs(self.session_limit_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Agent settings shipped with the binary, used when the backend cannot
/// provide a configuration.
pub fn fallback_agent_config() -> anyhow::Result<AgentConfig> {
    Ok(serde_json::from_str(FALLBACK_SETTINGS)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_time_config_parses() {
        let config = Config::new().unwrap();
        assert_eq!(config.input_sample_rate, 16000);
        assert_eq!(config.output_sample_rate, 24000);
        assert_eq!(config.keep_alive(), Duration::from_secs(60));
        assert_eq!(config.session_limit(), Duration::from_secs(120));
    }

    #[test]
    fn fallback_settings_describe_linear16_audio() {
        let settings = fallback_agent_config().unwrap();
        assert_eq!(settings.audio.input.encoding, "linear16");
        assert_eq!(settings.audio.input.sample_rate, 16000);
        assert_eq!(settings.audio.output.sample_rate, 24000);
        assert!(settings.agent.greeting.is_some());
    }
}
