mod audio;
mod backend;
mod config;
mod controller;
mod conversation;
mod error;
mod gui_bridge;
mod net_link;
mod panels;
mod protocol;
mod storage;

use audio::{AlsaCaptureBackend, Linear16Decoder, MicrophoneManager, PlaybackEngine};
use backend::BackendClient;
use config::Config;
use controller::{Components, ControlEvent, Orchestrator};
use gui_bridge::{GuiBridge, UiCommand, UiUpdate};
use net_link::{ConnectionManager, LinkEvent, LinkOptions};
use panels::Panels;
use std::sync::Arc;
use std::time::Duration;
use storage::RecordStore;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const INSTRUCTIONS_REFRESH: Duration = Duration::from_secs(60);
const LEVELS_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::new().map_err(anyhow::Error::msg)?;
    log::info!("{} {} starting", env!("APP_NAME"), env!("APP_VERSION"));

    // Channels between components
    let (tx_link_event, mut rx_link_event) = mpsc::channel::<LinkEvent>(100);
    let (tx_mic_frame, mut rx_mic_frame) = mpsc::channel::<Vec<u8>>(32);
    let (tx_ui_command, mut rx_ui_command) = mpsc::channel::<UiCommand>(100);
    let (tx_ui_update, mut rx_ui_update) = mpsc::channel::<UiUpdate>(256);
    let (tx_control, mut rx_control) = mpsc::channel::<ControlEvent>(32);

    // UI bridge first so notices reach the UI process during startup.
    let gui_bridge = Arc::new(GuiBridge::new(&config, tx_ui_command).await?);
    let gui_bridge_clone = gui_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = gui_bridge_clone.run().await {
            log::error!("GuiBridge error: {}", e);
        }
    });

    let backend = Arc::new(BackendClient::new(config.backend_url));
    let agent_config = match backend.fetch_agent_config(config.agent_id).await {
        Ok(agent_config) => agent_config,
        Err(e) => {
            log::warn!("Using built-in agent settings: {}", e);
            config::fallback_agent_config()?
        }
    };

    let store = RecordStore::open(config.storage_path);
    let panels = Panels::new(store);

    let connection = ConnectionManager::new(
        LinkOptions {
            ws_url: config.ws_url.to_string(),
            keep_alive: config.keep_alive(),
            session_limit: config.session_limit(),
        },
        backend.clone(),
        tx_link_event,
    );
    let microphone = MicrophoneManager::new(
        Box::new(AlsaCaptureBackend::new(
            config.capture_device,
            config.capture_sample_rate,
        )),
        tx_mic_frame,
        config.processor_frames,
        config.input_sample_rate,
    );
    let playback = PlaybackEngine::new(Box::new(Linear16Decoder));

    // Without an output device the session still runs, just silently.
    let _playback_output = match audio::spawn_alsa_output(
        playback.renderer(),
        config.playback_device,
        config.output_sample_rate,
        config.playback_period_size,
    ) {
        Ok(output) => Some(output),
        Err(e) => {
            log::error!("Failed to start audio output: {:#}", e);
            None
        }
    };

    let mut orchestrator = Orchestrator::new(
        Components {
            connection: Box::new(connection),
            microphone,
            playback,
            panels,
            resolver: backend,
        },
        agent_config,
        config.settle_delay(),
        tx_control,
        tx_ui_update,
    );

    let mut instructions_tick = interval_at(Instant::now() + INSTRUCTIONS_REFRESH, INSTRUCTIONS_REFRESH);
    let mut levels_tick = interval_at(Instant::now() + LEVELS_INTERVAL, LEVELS_INTERVAL);
    levels_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    log::info!("Core started, waiting for the UI");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            Some(event) = rx_link_event.recv() => orchestrator.handle_link_event(event),

            Some(frame) = rx_mic_frame.recv() => orchestrator.handle_mic_frame(frame),

            Some(command) = rx_ui_command.recv() => orchestrator.handle_ui_command(command),

            Some(event) = rx_control.recv() => orchestrator.handle_control(event),

            Some(update) = rx_ui_update.recv() => {
                if let Err(e) = gui_bridge.send_update(&update).await {
                    log::warn!("Failed to send to GUI: {}", e);
                }
            }

            _ = instructions_tick.tick() => orchestrator.refresh_instructions(),

            _ = levels_tick.tick() => {
                if orchestrator.settings_sent() {
                    let (user, agent) = orchestrator.levels();
                    if let Err(e) = gui_bridge.send_update(&UiUpdate::Levels { user, agent }).await {
                        log::debug!("Failed to send levels to GUI: {}", e);
                    }
                }
            }
        }
    }

    orchestrator.shutdown();
    Ok(())
}
