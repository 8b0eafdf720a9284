//! Conversation state: bot status, message log and behind-the-scenes events.
//!
//! All changes go through [`reduce`], a pure function over an explicit
//! [`Action`]. [`ConversationStore`] holds the current state and offers the
//! shorthand the orchestrator uses.

use serde::Serialize;

use crate::protocol::{Latency, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
    Sleeping,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationMessage {
    User { text: String },
    Assistant { text: String },
    Latency {
        total: Option<f64>,
        tts: Option<f64>,
        ttt: Option<f64>,
    },
}

impl ConversationMessage {
    pub fn utterance(role: Role, text: impl Into<String>) -> Self {
        match role {
            Role::User => ConversationMessage::User { text: text.into() },
            Role::Assistant => ConversationMessage::Assistant { text: text.into() },
        }
    }

    pub fn latency(latency: &Latency) -> Self {
        ConversationMessage::Latency {
            total: latency.total,
            tts: latency.tts,
            ttt: latency.ttt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    SettingsApplied,
    UserStartedSpeaking,
    Interruption,
    AgentStartedSpeaking,
    ConversationText,
    EndOfThought,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BehindTheScenesEvent {
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl BehindTheScenesEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            role: None,
            content: None,
        }
    }

    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            kind: EventKind::ConversationText,
            role: Some(role),
            content: Some(content.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    StartListening,
    StartThinking,
    StartSpeaking,
    StartSleeping,
    AddMessage(ConversationMessage),
    ClearMessages,
    AddBehindTheScenesEvent(BehindTheScenesEvent),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    pub status: BotStatus,
    pub messages: Vec<ConversationMessage>,
    pub events: Vec<BehindTheScenesEvent>,
}

pub fn reduce(mut state: ConversationState, action: Action) -> ConversationState {
    match action {
        Action::StartListening => state.status = BotStatus::Listening,
        Action::StartThinking => state.status = BotStatus::Thinking,
        Action::StartSpeaking => state.status = BotStatus::Speaking,
        Action::StartSleeping => state.status = BotStatus::Sleeping,
        Action::AddMessage(message) => state.messages.push(message),
        Action::ClearMessages => {
            state.messages.clear();
            state.events.clear();
        }
        Action::AddBehindTheScenesEvent(event) => state.events.push(event),
    }
    state
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    state: ConversationState,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch(&mut self, action: Action) {
        let state = std::mem::take(&mut self.state);
        self.state = reduce(state, action);
    }

    pub fn status(&self) -> BotStatus {
        self.state.status
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.state.messages
    }

    pub fn events(&self) -> &[BehindTheScenesEvent] {
        &self.state.events
    }

    pub fn is_sleeping(&self) -> bool {
        self.state.status == BotStatus::Sleeping
    }

    pub fn start_listening(&mut self) {
        self.dispatch(Action::StartListening);
    }

    pub fn start_thinking(&mut self) {
        self.dispatch(Action::StartThinking);
    }

    pub fn start_speaking(&mut self) {
        self.dispatch(Action::StartSpeaking);
    }

    pub fn start_sleeping(&mut self) {
        self.dispatch(Action::StartSleeping);
    }

    pub fn add_message(&mut self, message: ConversationMessage) {
        self.dispatch(Action::AddMessage(message));
    }

    pub fn add_event(&mut self, event: BehindTheScenesEvent) {
        self.dispatch(Action::AddBehindTheScenesEvent(event));
    }

    pub fn clear(&mut self) {
        self.dispatch(Action::ClearMessages);
    }
}

/// Interim transcript text, one slot per role.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveTranscript {
    user: Option<String>,
    assistant: Option<String>,
}

impl LiveTranscript {
    fn slot(&mut self, role: Role) -> &mut Option<String> {
        match role {
            Role::User => &mut self.user,
            Role::Assistant => &mut self.assistant,
        }
    }

    pub fn set(&mut self, role: Role, text: impl Into<String>) {
        *self.slot(role) = Some(text.into());
    }

    pub fn clear(&mut self, role: Role) {
        *self.slot(role) = None;
    }

    pub fn clear_all(&mut self) {
        self.user = None;
        self.assistant = None;
    }

    pub fn get(&self, role: Role) -> Option<&str> {
        match role {
            Role::User => self.user.as_deref(),
            Role::Assistant => self.assistant.as_deref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.assistant.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_actions_replace_status() {
        let state = reduce(ConversationState::default(), Action::StartThinking);
        assert_eq!(state.status, BotStatus::Thinking);
        let state = reduce(state, Action::StartSleeping);
        assert_eq!(state.status, BotStatus::Sleeping);
    }

    #[test]
    fn clear_messages_drops_messages_and_events() {
        let mut store = ConversationStore::new();
        store.start_speaking();
        store.add_message(ConversationMessage::utterance(Role::User, "hello"));
        store.add_event(BehindTheScenesEvent::new(EventKind::SettingsApplied));
        assert_eq!(store.messages().len(), 1);
        assert_eq!(store.events().len(), 1);

        store.clear();
        assert!(store.messages().is_empty());
        assert!(store.events().is_empty());
        assert_eq!(store.status(), BotStatus::Speaking);
    }

    #[test]
    fn messages_keep_arrival_order() {
        let mut store = ConversationStore::new();
        store.add_message(ConversationMessage::utterance(Role::User, "one"));
        store.add_message(ConversationMessage::latency(&Latency {
            total: Some(1.0),
            tts: None,
            ttt: Some(0.5),
        }));
        store.add_message(ConversationMessage::utterance(Role::Assistant, "two"));
        assert_eq!(
            store.messages()[2],
            ConversationMessage::Assistant { text: "two".into() }
        );
        assert!(matches!(store.messages()[1], ConversationMessage::Latency { total: Some(_), .. }));
    }

    #[test]
    fn live_transcript_is_per_role() {
        let mut live = LiveTranscript::default();
        live.set(Role::User, "hel");
        live.set(Role::Assistant, "Hi");
        live.clear(Role::User);
        assert_eq!(live.get(Role::User), None);
        assert_eq!(live.get(Role::Assistant), Some("Hi"));
        live.clear_all();
        assert!(live.is_empty());
    }

    #[test]
    fn messages_serialize_with_kind_tag() {
        let value = serde_json::to_value(ConversationMessage::utterance(Role::User, "hi")).unwrap();
        assert_eq!(value, serde_json::json!({ "kind": "user", "text": "hi" }));
    }
}
