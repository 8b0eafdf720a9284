//! Session orchestrator.
//!
//! Owns every component and reacts to four inputs: link events, microphone
//! frames, UI commands and its own deferred [`ControlEvent`]s. Handlers are
//! synchronous; slow work (settle fallback, backend function resolution) is
//! spawned and reports back through the control channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::audio::{MicState, MicrophoneManager, PlaybackEngine};
use crate::backend::FunctionResolver;
use crate::conversation::{
    BehindTheScenesEvent, BotStatus, ConversationMessage, ConversationStore, EventKind,
    LiveTranscript,
};
use crate::gui_bridge::{UiCommand, UiUpdate};
use crate::net_link::{AgentConnection, ConnectionState, LinkEvent, NetCommand, NetEvent};
use crate::panels::{PanelHandle, PanelOutcome, Panels, VerticalKind};
use crate::protocol::{
    parse_server_message, prompt_with_instructions, AgentConfig, ClientMessage, FunctionCall,
    FunctionCallResponse, Role, ServerEvent,
};

#[derive(Debug)]
pub enum ControlEvent {
    /// The settle fallback of the given generation fired.
    SettleElapsed(u64),
    /// Backend answers for calls no panel handled, tagged with the session
    /// generation they were requested in.
    FunctionResponses(u64, Vec<FunctionCallResponse>),
}

pub struct Components {
    pub connection: Box<dyn AgentConnection>,
    pub microphone: MicrophoneManager,
    pub playback: PlaybackEngine,
    pub panels: Panels,
    pub resolver: Arc<dyn FunctionResolver>,
}

pub struct Orchestrator {
    connection: Box<dyn AgentConnection>,
    microphone: MicrophoneManager,
    playback: PlaybackEngine,
    conversation: ConversationStore,
    live: LiveTranscript,
    panels: Panels,
    resolver: Arc<dyn FunctionResolver>,
    agent_config: AgentConfig,
    instructions: String,
    settle_delay: Duration,
    control_tx: mpsc::Sender<ControlEvent>,
    ui_tx: mpsc::Sender<UiUpdate>,

    settings_sent: bool,
    user_connected: bool,
    settle_generation: u64,
    settling: bool,
    waiting_for_voice_after_sleep: bool,
    user_speaking: bool,
}

impl Orchestrator {
    pub fn new(
        components: Components,
        agent_config: AgentConfig,
        settle_delay: Duration,
        control_tx: mpsc::Sender<ControlEvent>,
        ui_tx: mpsc::Sender<UiUpdate>,
    ) -> Self {
        let Components {
            connection,
            microphone,
            playback,
            panels,
            resolver,
        } = components;
        let agent_config = agent_config.with_default_functions(panels.function_definitions());
        Self {
            connection,
            microphone,
            playback,
            conversation: ConversationStore::new(),
            live: LiveTranscript::default(),
            panels,
            resolver,
            agent_config,
            instructions: String::new(),
            settle_delay,
            control_tx,
            ui_tx,
            settings_sent: false,
            user_connected: false,
            settle_generation: 0,
            settling: false,
            waiting_for_voice_after_sleep: false,
            user_speaking: false,
        }
    }

    pub fn conversation(&self) -> &ConversationStore {
        &self.conversation
    }

    pub fn live_transcript(&self) -> &LiveTranscript {
        &self.live
    }

    pub fn playback(&self) -> &PlaybackEngine {
        &self.playback
    }

    pub fn microphone(&self) -> &MicrophoneManager {
        &self.microphone
    }

    pub fn panels(&self) -> &Panels {
        &self.panels
    }

    pub fn settings_sent(&self) -> bool {
        self.settings_sent
    }

    pub fn user_speaking(&self) -> bool {
        self.user_speaking
    }

    fn is_open(&self) -> bool {
        self.connection.state() == ConnectionState::Connected
    }

    fn notify(&self, update: UiUpdate) {
        match self.ui_tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                log::debug!("UI update queue full, dropping {:?}", update)
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn notice(&self, text: impl Into<String>) {
        self.notify(UiUpdate::Notice { text: text.into() });
    }

    fn notify_status(&self) {
        self.notify(UiUpdate::Status {
            status: self.conversation.status(),
        });
    }

    fn notify_connection(&self) {
        self.notify(UiUpdate::Connection {
            state: self.connection.state(),
            rate_limited: self.connection.rate_limited(),
        });
    }

    fn notify_panel(&self, kind: Option<VerticalKind>) {
        let kind = kind.or(self.panels.active());
        self.notify(UiUpdate::Panel {
            active: self.panels.active(),
            snapshot: kind.and_then(|k| self.panels.snapshot(k)),
        });
    }

    fn record_event(&mut self, event: BehindTheScenesEvent) {
        self.conversation.add_event(event.clone());
        self.notify(UiUpdate::Event { event });
    }

    fn record_message(&mut self, message: ConversationMessage) {
        self.conversation.add_message(message.clone());
        self.notify(UiUpdate::Message { message });
    }

    fn set_status(&mut self, status: BotStatus) {
        match status {
            BotStatus::Idle => return,
            BotStatus::Listening => self.conversation.start_listening(),
            BotStatus::Thinking => self.conversation.start_thinking(),
            BotStatus::Speaking => self.conversation.start_speaking(),
            BotStatus::Sleeping => self.conversation.start_sleeping(),
        }
        self.notify_status();
    }

    fn send_message(&mut self, message: &ClientMessage) -> bool {
        match message.to_json() {
            Ok(text) => self.connection.send(NetCommand::SendText(text)),
            Err(e) => {
                log::error!("Failed to encode outbound message: {}", e);
                false
            }
        }
    }

    /// Instructions appended to the base prompt: the UI's own text followed
    /// by the selected panel's prompt.
    fn current_instructions(&self) -> String {
        let mut parts = Vec::new();
        if !self.instructions.trim().is_empty() {
            parts.push(self.instructions.clone());
        }
        if let Some(panel) = self.panels.instructions() {
            parts.push(panel);
        }
        parts.join("\n")
    }

    fn send_instructions(&mut self) {
        if !self.is_open() || !self.settings_sent {
            return;
        }
        let prompt =
            prompt_with_instructions(self.agent_config.base_prompt(), &self.current_instructions());
        self.send_message(&ClientMessage::UpdateInstructions { prompt });
    }

    /// Resend the selected panel's prompt so its date header stays current.
    pub fn refresh_instructions(&mut self) {
        if self.panels.active().is_some() {
            self.send_instructions();
        }
    }

    // UI commands

    pub fn handle_ui_command(&mut self, command: UiCommand) {
        match command {
            UiCommand::SetupMicrophone => self.setup_microphone(),
            UiCommand::Connect => self.connect(),
            UiCommand::Disconnect => self.disconnect(),
            UiCommand::ToggleSleep => self.toggle_sleep(),
            UiCommand::SelectPanel { panel } => self.select_panel(panel),
            UiCommand::UpdateInstructions { instructions } => {
                self.instructions = instructions;
                self.send_instructions();
            }
            UiCommand::UpdateVoice { voice } => {
                if self.is_open() {
                    self.send_message(&ClientMessage::update_speak(&voice));
                }
            }
            UiCommand::EditField {
                panel,
                field,
                value,
            } => self.with_panel(panel, |p| p.edit_field(&field, &value)),
            UiCommand::Save { panel } => self.with_panel(panel, |p| p.save().map(|_| ())),
            UiCommand::Clear { panel } => self.with_panel(panel, |p| {
                p.clear();
                Ok(())
            }),
            UiCommand::Delete { panel, id } => self.with_panel(panel, |p| {
                if !p.delete(&id)? {
                    log::warn!("No record {} to delete", id);
                }
                Ok(())
            }),
            UiCommand::SetStatus { panel, id, status } => {
                self.with_panel(panel, |p| p.set_status(&id, status.as_deref()))
            }
        }
    }

    fn with_panel(
        &mut self,
        kind: Option<VerticalKind>,
        action: impl FnOnce(&mut dyn PanelHandle) -> Result<(), crate::error::PanelError>,
    ) {
        let Some(kind) = kind.or(self.panels.active()) else {
            self.notice("Select a panel first");
            return;
        };
        let Some(panel) = self.panels.panel_mut(kind) else {
            return;
        };
        if let Err(e) = action(panel) {
            log::warn!("{:?} panel action failed: {}", kind, e);
            self.notice(e.to_string());
        }
        self.notify_panel(Some(kind));
    }

    pub fn setup_microphone(&mut self) {
        if let Err(e) = self.microphone.setup() {
            match e.user_notice() {
                Some(text) => self.notice(text),
                None => log::error!("Microphone setup failed: {}", e),
            }
        }
    }

    pub fn connect(&mut self) {
        self.user_connected = true;
        // A new link replaces any live one and needs its own handshake.
        self.reset_link();
        self.connection.connect();
        self.notify_connection();
    }

    pub fn disconnect(&mut self) {
        log::info!("Disconnecting agent session");
        self.settings_sent = false;
        self.user_connected = false;
        self.settle_generation += 1;
        self.settling = false;
        self.user_speaking = false;

        self.conversation.clear();
        self.live.clear_all();
        self.microphone.stop();
        self.playback.clear();
        self.connection.disconnect();
        if !self.conversation.is_sleeping() {
            self.set_status(BotStatus::Sleeping);
        }
        self.notify_connection();
    }

    pub fn toggle_sleep(&mut self) {
        match self.conversation.status() {
            BotStatus::Idle => {}
            BotStatus::Sleeping => self.set_status(BotStatus::Listening),
            _ => {
                self.waiting_for_voice_after_sleep = true;
                self.playback.clear();
                self.set_status(BotStatus::Sleeping);
            }
        }
    }

    fn select_panel(&mut self, kind: Option<VerticalKind>) {
        if self.panels.select(kind) {
            self.send_instructions();
        }
        self.notify_panel(kind);
    }

    // Link events

    pub fn handle_link_event(&mut self, event: LinkEvent) {
        if !self.connection.observe(&event) {
            return;
        }
        match event.event {
            NetEvent::Connected => {
                self.notify_connection();
                self.maybe_send_settings();
            }
            NetEvent::Text(text) => self.handle_text(&text),
            NetEvent::Binary(frame) => self.handle_agent_audio(&frame),
            NetEvent::Closed { code, reason } => {
                log::info!("Agent socket closed (code {:?}): {}", code, reason);
                self.link_down();
            }
            NetEvent::Failed {
                reason,
                rate_limited,
            } => {
                log::error!("Agent connection failed: {}", reason);
                self.link_down();
                if rate_limited {
                    self.notice("The agent is busy right now. Please try again shortly.");
                }
            }
            NetEvent::SessionExpired => {
                log::info!("Agent session limit reached");
                self.disconnect();
            }
        }
    }

    fn reset_link(&mut self) {
        self.settings_sent = false;
        self.settle_generation += 1;
        self.settling = false;
        self.microphone.stop();
        self.playback.clear();
        self.live.clear_all();
    }

    fn link_down(&mut self) {
        self.reset_link();
        if !self.conversation.is_sleeping() && self.conversation.status() != BotStatus::Idle {
            self.set_status(BotStatus::Sleeping);
        }
        self.notify_connection();
    }

    fn maybe_send_settings(&mut self) {
        if !self.user_connected || !self.is_open() || self.settings_sent {
            return;
        }
        let settings = self.agent_config.to_settings(&self.current_instructions());
        if !self.send_message(&settings) {
            return;
        }
        log::info!("Settings sent, waiting for the agent to settle");
        self.settings_sent = true;
        self.settle_generation += 1;
        self.settling = true;

        let tx = self.control_tx.clone();
        let generation = self.settle_generation;
        let delay = self.settle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ControlEvent::SettleElapsed(generation)).await;
        });
    }

    fn finish_settle(&mut self, generation: u64) {
        if !self.settling || generation != self.settle_generation {
            return;
        }
        self.settling = false;
        self.start_streaming();
    }

    fn start_streaming(&mut self) {
        if self.microphone.state() == MicState::Uninitialized {
            self.setup_microphone();
        }
        if !self.microphone.start() && self.microphone.state() != MicState::Streaming {
            log::warn!("Microphone not ready, streaming without capture");
        }
        if self.panels.active().is_none() {
            self.waiting_for_voice_after_sleep = false;
            self.set_status(BotStatus::Speaking);
        } else {
            self.set_status(BotStatus::Listening);
        }
    }

    pub fn handle_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::SettleElapsed(generation) => self.finish_settle(generation),
            ControlEvent::FunctionResponses(generation, responses) => {
                if generation != self.settle_generation {
                    log::warn!(
                        "Dropping {} function responses from a previous session",
                        responses.len()
                    );
                    return;
                }
                self.send_responses(responses);
            }
        }
    }

    fn send_responses(&mut self, responses: Vec<FunctionCallResponse>) {
        for response in responses {
            self.send_message(&ClientMessage::FunctionCallResponse(response));
        }
    }

    /// Forward one captured frame to the agent.
    pub fn handle_mic_frame(&mut self, frame: Vec<u8>) {
        if !self.settings_sent || !self.is_open() {
            return;
        }
        self.connection.send(NetCommand::SendBinary(frame));
    }

    fn handle_agent_audio(&mut self, frame: &[u8]) {
        if !self.is_open()
            || self.conversation.is_sleeping()
            || self.waiting_for_voice_after_sleep
        {
            return;
        }
        self.playback.enqueue(frame);
    }

    fn handle_text(&mut self, text: &str) {
        let event = match parse_server_message(text) {
            Ok(event) => event,
            Err(e) => {
                log::error!("Ignoring malformed agent message: {}", e);
                return;
            }
        };

        match event {
            ServerEvent::Welcome => log::info!("Agent welcome received"),
            ServerEvent::SettingsApplied => {
                self.record_event(BehindTheScenesEvent::new(EventKind::SettingsApplied));
                let generation = self.settle_generation;
                self.finish_settle(generation);
            }
            ServerEvent::ConversationText { role, content } => {
                self.live.set(role, content.clone());
                self.notify(UiUpdate::Transcript {
                    role,
                    text: Some(content.clone()),
                });
                self.record_event(BehindTheScenesEvent::text(role, content));
            }
            ServerEvent::Utterance { role, content } => self.commit_utterance(role, content),
            ServerEvent::UserStartedSpeaking => {
                self.record_event(BehindTheScenesEvent::new(EventKind::UserStartedSpeaking));
                if self.conversation.status() == BotStatus::Speaking {
                    self.record_event(BehindTheScenesEvent::new(EventKind::Interruption));
                }
                self.user_speaking = true;
                self.live.clear_all();
                self.playback.clear();
                self.waiting_for_voice_after_sleep = false;
                self.set_status(BotStatus::Listening);
            }
            ServerEvent::AgentThinking => self.set_status(BotStatus::Thinking),
            ServerEvent::AgentStartedSpeaking { latency } => {
                self.user_speaking = false;
                self.record_event(BehindTheScenesEvent::new(EventKind::AgentStartedSpeaking));
                if let Some(latency) = latency {
                    self.record_message(ConversationMessage::latency(&latency));
                }
            }
            ServerEvent::AgentAudioDone => self.set_status(BotStatus::Listening),
            ServerEvent::EndOfThought => {
                self.record_event(BehindTheScenesEvent::new(EventKind::EndOfThought))
            }
            ServerEvent::FunctionCallRequest {
                functions,
                rejected,
            } => self.handle_function_calls(functions, rejected),
            ServerEvent::Error { description } => {
                log::error!("Agent error: {}", description);
                self.notice(description);
            }
            ServerEvent::Warning { description } => log::warn!("Agent warning: {}", description),
            ServerEvent::Other(kind) => log::debug!("Unhandled agent message: {}", kind),
        }
    }

    fn commit_utterance(&mut self, role: Role, content: String) {
        self.live.clear(role);
        self.notify(UiUpdate::Transcript { role, text: None });
        self.record_message(ConversationMessage::utterance(role, content.clone()));

        match role {
            Role::Assistant => self.set_status(BotStatus::Speaking),
            Role::User => match self.panels.on_user_utterance(&content) {
                Some(PanelOutcome::Switched(kind)) => {
                    log::info!("Voice switched panel to {:?}", kind);
                    self.send_instructions();
                    self.notify_panel(Some(kind));
                }
                Some(PanelOutcome::Command(_)) => self.notify_panel(None),
                None => {}
            },
        }
    }

    fn handle_function_calls(&mut self, functions: Vec<FunctionCall>, rejected: usize) {
        if functions.is_empty() {
            log::error!(
                "Function call request without usable functions ({} rejected)",
                rejected
            );
            return;
        }
        if let Some(responses) = self.panels.handle_calls(&functions) {
            self.send_responses(responses);
            self.notify_panel(None);
            return;
        }

        let resolver = self.resolver.clone();
        let tx = self.control_tx.clone();
        let generation = self.settle_generation;
        tokio::spawn(async move {
            let responses = match resolver.resolve(&functions).await {
                Ok(responses) => responses,
                Err(e) => {
                    log::error!("Backend function resolution failed: {}", e);
                    functions
                        .iter()
                        .map(|call| FunctionCallResponse::error(call, e.to_string()))
                        .collect()
                }
            };
            let _ = tx.send(ControlEvent::FunctionResponses(generation, responses)).await;
        });
    }

    /// Levels of the user's and the agent's voice for the UI meters.
    pub fn levels(&self) -> (f32, f32) {
        (self.microphone.tap().rms(), self.playback.tap().rms())
    }

    pub fn shutdown(&mut self) {
        if self.user_connected || self.connection.state() != ConnectionState::Unstarted {
            self.disconnect();
        }
        if let Err(e) = self.panels.store().close() {
            log::error!("Failed to close record store: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::microphone::{CaptureBackend, CaptureDevice};
    use crate::audio::Linear16Decoder;
    use crate::error::{BackendError, MicError};
    use crate::net_link::SessionState;
    use crate::panels::Phase;
    use crate::storage::RecordStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    struct SilentDevice;

    impl CaptureDevice for SilentDevice {
        fn sample_rate(&self) -> u32 {
            48000
        }

        fn read(&mut self, buf: &mut [f32]) -> Result<usize, MicError> {
            std::thread::sleep(Duration::from_millis(2));
            buf.fill(0.0);
            Ok(buf.len())
        }

        fn recover(&mut self) -> Result<(), MicError> {
            Ok(())
        }
    }

    struct SilentBackend;

    impl CaptureBackend for SilentBackend {
        fn acquire(&self) -> Result<Box<dyn CaptureDevice>, MicError> {
            Ok(Box::new(SilentDevice))
        }
    }

    /// Records outbound commands; link events are applied as they arrive.
    struct FakeConnection {
        session: SessionState,
        sent: Arc<Mutex<Vec<NetCommand>>>,
    }

    impl AgentConnection for FakeConnection {
        fn connect(&mut self) {
            self.session.state = ConnectionState::Connecting;
        }

        fn disconnect(&mut self) {
            self.session = SessionState::default();
        }

        fn observe(&mut self, event: &LinkEvent) -> bool {
            match &event.event {
                NetEvent::Connected => self.session.state = ConnectionState::Connected,
                NetEvent::Closed { .. } => self.session.state = ConnectionState::Closed,
                NetEvent::Failed { rate_limited, .. } => {
                    self.session.state = ConnectionState::Failed;
                    self.session.rate_limited = *rate_limited;
                }
                NetEvent::SessionExpired => self.session.session_expired = true,
                NetEvent::Text(_) | NetEvent::Binary(_) => {}
            }
            true
        }

        fn state(&self) -> ConnectionState {
            self.session.state
        }

        fn rate_limited(&self) -> bool {
            self.session.rate_limited
        }

        fn session_expired(&self) -> bool {
            self.session.session_expired
        }

        fn send(&mut self, command: NetCommand) -> bool {
            if self.session.state != ConnectionState::Connected {
                return false;
            }
            self.sent.lock().push(command);
            true
        }
    }

    struct EchoResolver;

    #[async_trait]
    impl FunctionResolver for EchoResolver {
        async fn resolve(
            &self,
            calls: &[FunctionCall],
        ) -> Result<Vec<FunctionCallResponse>, BackendError> {
            Ok(calls
                .iter()
                .map(|c| FunctionCallResponse::error(c, format!("resolved {}", c.name)))
                .collect())
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        sent: Arc<Mutex<Vec<NetCommand>>>,
        control_rx: mpsc::Receiver<ControlEvent>,
        _ui_rx: mpsc::Receiver<UiUpdate>,
        _frames_rx: mpsc::Receiver<Vec<u8>>,
    }

    impl Harness {
        fn new(settle_delay: Duration) -> Self {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let (frames_tx, frames_rx) = mpsc::channel(8);
            let (control_tx, control_rx) = mpsc::channel(8);
            let (ui_tx, ui_rx) = mpsc::channel(256);
            let components = Components {
                connection: Box::new(FakeConnection {
                    session: SessionState::default(),
                    sent: sent.clone(),
                }),
                microphone: MicrophoneManager::new(Box::new(SilentBackend), frames_tx, 4096, 16000),
                playback: PlaybackEngine::new(Box::new(Linear16Decoder)),
                panels: Panels::new(RecordStore::temporary()),
                resolver: Arc::new(EchoResolver),
            };
            let config = crate::config::fallback_agent_config().unwrap();
            Self {
                orchestrator: Orchestrator::new(components, config, settle_delay, control_tx, ui_tx),
                sent,
                control_rx,
                _ui_rx: ui_rx,
                _frames_rx: frames_rx,
            }
        }

        fn link(&mut self, event: NetEvent) {
            self.orchestrator.handle_link_event(LinkEvent {
                generation: 1,
                event,
            });
        }

        fn agent(&mut self, message: Value) {
            self.link(NetEvent::Text(message.to_string()));
        }

        fn texts(&self) -> Vec<Value> {
            self.sent
                .lock()
                .iter()
                .filter_map(|c| match c {
                    NetCommand::SendText(t) => serde_json::from_str(t).ok(),
                    _ => None,
                })
                .collect()
        }

        fn sent_of_type(&self, kind: &str) -> Vec<Value> {
            self.texts().into_iter().filter(|v| v["type"] == kind).collect()
        }

        /// Connect, open the socket and acknowledge the settings.
        fn open_session(&mut self) {
            self.orchestrator.handle_ui_command(UiCommand::Connect);
            self.link(NetEvent::Connected);
            self.agent(json!({ "type": "SettingsApplied" }));
        }
    }

    fn frame() -> NetEvent {
        NetEvent::Binary(vec![0x10, 0x00].repeat(480))
    }

    #[tokio::test]
    async fn one_settings_message_per_connection() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.orchestrator.handle_ui_command(UiCommand::Connect);
        h.link(NetEvent::Connected);
        h.link(NetEvent::Connected);
        assert_eq!(h.sent_of_type("Settings").len(), 1);
        assert!(h.orchestrator.settings_sent());

        h.orchestrator.disconnect();
        assert!(!h.orchestrator.settings_sent());
        h.orchestrator.handle_ui_command(UiCommand::Connect);
        h.link(NetEvent::Connected);
        assert_eq!(h.sent_of_type("Settings").len(), 2);
        h.orchestrator.disconnect();
    }

    #[tokio::test]
    async fn reconnecting_a_live_session_sends_settings_again() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.open_session();
        assert_eq!(h.orchestrator.microphone().state(), MicState::Streaming);

        h.orchestrator.handle_ui_command(UiCommand::Connect);
        assert!(!h.orchestrator.settings_sent());
        assert_ne!(h.orchestrator.microphone().state(), MicState::Streaming);
        let before = h.sent.lock().len();
        h.orchestrator.handle_mic_frame(vec![0; 64]);
        assert_eq!(h.sent.lock().len(), before);

        h.link(NetEvent::Connected);
        assert_eq!(h.sent_of_type("Settings").len(), 2);
        assert!(h.orchestrator.settings_sent());
        h.orchestrator.disconnect();
    }

    #[tokio::test]
    async fn socket_open_without_user_connect_sends_nothing() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.link(NetEvent::Connected);
        assert!(h.sent_of_type("Settings").is_empty());
    }

    #[tokio::test]
    async fn acknowledgment_starts_streaming_with_greeting() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.open_session();
        assert_eq!(h.orchestrator.microphone().state(), MicState::Streaming);
        assert_eq!(h.orchestrator.conversation().status(), BotStatus::Speaking);
        assert_eq!(
            h.orchestrator.conversation().events()[0].kind,
            EventKind::SettingsApplied
        );

        let settings = &h.sent_of_type("Settings")[0];
        assert!(settings["agent"]["think"]["functions"]
            .as_array()
            .is_some_and(|f| f.iter().any(|d| d["name"] == "save_note")));
        h.orchestrator.disconnect();
    }

    #[tokio::test]
    async fn fallback_delay_starts_streaming_once() {
        let mut h = Harness::new(Duration::from_millis(10));
        h.orchestrator.select_panel(Some(VerticalKind::Scheduling));
        h.orchestrator.handle_ui_command(UiCommand::Connect);
        h.link(NetEvent::Connected);

        let event = h.control_rx.recv().await.unwrap();
        h.orchestrator.handle_control(event);
        assert_eq!(h.orchestrator.microphone().state(), MicState::Streaming);
        assert_eq!(h.orchestrator.conversation().status(), BotStatus::Listening);

        // A late acknowledgment does not restart anything.
        h.agent(json!({ "type": "SettingsApplied" }));
        assert_eq!(h.orchestrator.conversation().status(), BotStatus::Listening);
        h.orchestrator.disconnect();
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_settle() {
        let mut h = Harness::new(Duration::from_millis(10));
        h.orchestrator.handle_ui_command(UiCommand::Connect);
        h.link(NetEvent::Connected);
        h.orchestrator.disconnect();

        let event = h.control_rx.recv().await.unwrap();
        h.orchestrator.handle_control(event);
        assert_ne!(h.orchestrator.microphone().state(), MicState::Streaming);
        assert_eq!(h.orchestrator.conversation().status(), BotStatus::Sleeping);
    }

    #[tokio::test]
    async fn barge_in_clears_playback() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.open_session();
        h.link(frame());
        h.link(frame());
        assert_eq!(h.orchestrator.playback().active_sources(), 2);

        h.agent(json!({ "type": "UserStartedSpeaking" }));
        assert_eq!(h.orchestrator.playback().active_sources(), 0);
        assert!(h.orchestrator.user_speaking());
        assert_eq!(h.orchestrator.conversation().status(), BotStatus::Listening);
        let kinds: Vec<EventKind> =
            h.orchestrator.conversation().events().iter().map(|e| e.kind).collect();
        assert!(kinds.ends_with(&[EventKind::UserStartedSpeaking, EventKind::Interruption]));
        h.orchestrator.disconnect();
    }

    #[tokio::test]
    async fn audio_is_dropped_while_sleeping_until_user_speaks() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.open_session();
        h.orchestrator.toggle_sleep();
        assert_eq!(h.orchestrator.conversation().status(), BotStatus::Sleeping);
        h.link(frame());
        assert_eq!(h.orchestrator.playback().active_sources(), 0);

        h.orchestrator.toggle_sleep();
        assert_eq!(h.orchestrator.conversation().status(), BotStatus::Listening);
        h.link(frame());
        assert_eq!(h.orchestrator.playback().active_sources(), 0);

        h.agent(json!({ "type": "UserStartedSpeaking" }));
        h.link(frame());
        assert_eq!(h.orchestrator.playback().active_sources(), 1);
        h.orchestrator.disconnect();
    }

    #[tokio::test]
    async fn toggle_is_ignored_while_idle() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.orchestrator.toggle_sleep();
        assert_eq!(h.orchestrator.conversation().status(), BotStatus::Idle);
    }

    #[tokio::test]
    async fn committed_utterance_clears_live_transcript() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.open_session();
        h.agent(json!({ "type": "ConversationText", "role": "user", "content": "book an" }));
        h.agent(json!({ "type": "ConversationText", "role": "assistant", "content": "Sure" }));
        assert_eq!(h.orchestrator.live_transcript().get(Role::User), Some("book an"));

        h.agent(json!({ "role": "user", "content": "book an appointment" }));
        assert_eq!(h.orchestrator.live_transcript().get(Role::User), None);
        assert_eq!(h.orchestrator.live_transcript().get(Role::Assistant), Some("Sure"));
        assert_eq!(
            h.orchestrator.conversation().messages().last(),
            Some(&ConversationMessage::User {
                text: "book an appointment".into()
            })
        );

        h.agent(json!({ "role": "assistant", "content": "Sure, for whom?" }));
        assert!(h.orchestrator.live_transcript().is_empty());
        assert_eq!(h.orchestrator.conversation().status(), BotStatus::Speaking);
        h.orchestrator.disconnect();
    }

    #[tokio::test]
    async fn latency_is_recorded_as_a_message() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.open_session();
        h.agent(json!({ "type": "AgentStartedSpeaking", "total_latency": 1.5 }));
        assert!(matches!(
            h.orchestrator.conversation().messages().last(),
            Some(ConversationMessage::Latency { total: Some(_), .. })
        ));
        h.orchestrator.disconnect();
    }

    #[tokio::test]
    async fn panel_handles_function_calls_when_selected() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.orchestrator.select_panel(Some(VerticalKind::DrugDispatch));
        h.open_session();
        h.agent(json!({
            "type": "FunctionCallRequest",
            "functions": [
                { "id": "fc_1", "name": "set_medication", "arguments": "{\"medication\":\"Ibuprofen\"}", "client_side": true },
                { "id": "fc_2", "name": "launch_rocket", "arguments": "{}", "client_side": true }
            ]
        }));

        let responses = h.sent_of_type("FunctionCallResponse");
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], "fc_1");
        assert_eq!(responses[0]["content"], "Success");
        assert_eq!(responses[1]["id"], "fc_2");
        assert_ne!(responses[1]["content"], "Success");
        let panel = h.orchestrator.panels().panel(VerticalKind::DrugDispatch).unwrap();
        assert_eq!(panel.phase(), Phase::Active);
        h.orchestrator.disconnect();
    }

    #[tokio::test]
    async fn backend_resolves_calls_without_a_panel() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.open_session();
        h.agent(json!({
            "type": "FunctionCallRequest",
            "functions": [{ "id": "fc_9", "name": "check_order", "arguments": "{}", "client_side": true }]
        }));
        assert!(h.sent_of_type("FunctionCallResponse").is_empty());

        let event = loop {
            match h.control_rx.recv().await.unwrap() {
                event @ ControlEvent::FunctionResponses(..) => break event,
                ControlEvent::SettleElapsed(_) => continue,
            }
        };
        h.orchestrator.handle_control(event);
        let responses = h.sent_of_type("FunctionCallResponse");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["content"], "resolved check_order");
        h.orchestrator.disconnect();
    }

    #[tokio::test]
    async fn late_backend_responses_from_an_old_session_are_dropped() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.open_session();
        h.agent(json!({
            "type": "FunctionCallRequest",
            "functions": [{ "id": "fc_old", "name": "check_order", "arguments": "{}", "client_side": true }]
        }));
        let event = loop {
            match h.control_rx.recv().await.unwrap() {
                event @ ControlEvent::FunctionResponses(..) => break event,
                ControlEvent::SettleElapsed(_) => continue,
            }
        };

        h.orchestrator.disconnect();
        h.open_session();
        h.orchestrator.handle_control(event);
        assert!(h.sent_of_type("FunctionCallResponse").is_empty());
        h.orchestrator.disconnect();
    }

    #[tokio::test]
    async fn malformed_messages_are_skipped() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.open_session();
        let before = h.orchestrator.conversation().messages().len();
        h.link(NetEvent::Text("{not json".into()));
        h.agent(json!({ "type": "FunctionCallRequest" }));
        assert_eq!(h.orchestrator.conversation().messages().len(), before);
        assert!(h.sent_of_type("FunctionCallResponse").is_empty());
        h.orchestrator.disconnect();
    }

    #[tokio::test]
    async fn session_expiry_disconnects() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.open_session();
        h.agent(json!({ "role": "user", "content": "hello" }));
        h.link(NetEvent::SessionExpired);

        assert!(!h.orchestrator.settings_sent());
        assert!(h.orchestrator.conversation().messages().is_empty());
        assert_eq!(h.orchestrator.conversation().status(), BotStatus::Sleeping);
        assert_eq!(h.orchestrator.microphone().state(), MicState::Ready);
    }

    #[tokio::test]
    async fn voice_switch_updates_instructions() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.orchestrator.select_panel(Some(VerticalKind::ClinicalNotes));
        h.open_session();
        h.agent(json!({ "role": "user", "content": "start drug dispatch" }));

        assert_eq!(h.orchestrator.panels().active(), Some(VerticalKind::DrugDispatch));
        let updates = h.sent_of_type("UpdateInstructions");
        assert_eq!(updates.len(), 1);
        let prompt = updates[0]["prompt"].as_str().unwrap();
        assert!(prompt.contains("Today's Date is: "));
        assert!(prompt.contains("dispatch_prescription"));
        h.orchestrator.disconnect();
    }

    #[tokio::test]
    async fn ui_panel_commands_need_a_panel() {
        let mut h = Harness::new(Duration::from_secs(60));
        h.orchestrator.handle_ui_command(UiCommand::Save { panel: None });
        h.orchestrator.handle_ui_command(UiCommand::SetStatus {
            panel: Some(VerticalKind::Scheduling),
            id: "default-appointment".into(),
            status: None,
        });
        let panel = h.orchestrator.panels().snapshot(VerticalKind::Scheduling).unwrap();
        assert_eq!(panel["records"][0]["status"], "cancelled");
    }
}
