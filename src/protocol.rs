//! Agent wire protocol: the JSON messages exchanged over the WebSocket.
//!
//! Outbound messages are a tagged enum serialized with `type` as the tag.
//! Inbound messages are parsed loosely first (every field optional) and then
//! classified into a [`ServerEvent`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioInput {
    pub encoding: String,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioOutput {
    pub encoding: String,
    pub sample_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    pub input: AudioInput,
    pub output: AudioOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkSettings {
    pub provider: Value,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub listen: Value,
    pub think: ThinkSettings,
    pub speak: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
}

/// Handshake description as delivered by the backend configuration endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub experimental: bool,
    #[serde(default)]
    pub mip_opt_out: bool,
    pub audio: AudioSettings,
    pub agent: AgentSettings,
}

impl AgentConfig {
    pub fn base_prompt(&self) -> &str {
        &self.agent.think.prompt
    }

    /// Advertise `functions` unless the configuration already lists some.
    pub fn with_default_functions(mut self, functions: Vec<Value>) -> Self {
        if self.agent.think.functions.is_empty() {
            self.agent.think.functions = functions;
        }
        self
    }

    /// Build the `Settings` handshake.
    ///
    /// `agent.speak` is reduced to its `provider` object, a greeting nested
    /// under `speak` moves to `agent.greeting`, and the UI instructions are
    /// appended to the prompt.
    pub fn to_settings(&self, instructions: &str) -> ClientMessage {
        let mut agent = self.agent.clone();

        let speak_greeting = self
            .agent
            .speak
            .get("greeting")
            .and_then(Value::as_str)
            .map(str::to_string);
        let provider = match self.agent.speak.get("provider") {
            Some(provider) => provider.clone(),
            None => {
                let mut bare = self.agent.speak.as_object().cloned().unwrap_or_default();
                bare.remove("greeting");
                Value::Object(bare)
            }
        };
        let mut speak = Map::new();
        speak.insert("provider".to_string(), provider);
        agent.speak = Value::Object(speak);
        agent.greeting = self.agent.greeting.clone().or(speak_greeting);
        agent.think.prompt = prompt_with_instructions(&self.agent.think.prompt, instructions);

        ClientMessage::Settings {
            experimental: self.experimental,
            mip_opt_out: self.mip_opt_out,
            audio: self.audio.clone(),
            agent,
        }
    }
}

/// The base prompt and the instructions, always newline separated.
pub fn prompt_with_instructions(prompt: &str, instructions: &str) -> String {
    format!("{}\n{}", prompt, instructions)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub id: String,
    pub name: String,
    pub content: String,
}

impl FunctionCallResponse {
    pub fn success(call: &FunctionCall) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            content: "Success".to_string(),
        }
    }

    pub fn error(call: &FunctionCall, message: impl Into<String>) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            content: message.into(),
        }
    }
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    Settings {
        experimental: bool,
        mip_opt_out: bool,
        audio: AudioSettings,
        agent: AgentSettings,
    },
    UpdateInstructions {
        prompt: String,
    },
    UpdateSpeak {
        provider: Value,
    },
    KeepAlive,
    FunctionCallResponse(FunctionCallResponse),
}

impl ClientMessage {
    pub fn update_speak(voice: &str) -> Self {
        ClientMessage::UpdateSpeak {
            provider: json!({ "type": "deepgram", "model": voice }),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn parse(role: &str) -> Option<Self> {
        match role {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// A function the agent asks the client to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    /// A JSON-encoded string on the wire; some agents send an object.
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_side: Option<bool>,
}

impl FunctionCall {
    pub fn parsed_arguments(&self) -> serde_json::Result<Value> {
        match &self.arguments {
            Value::Null => Ok(json!({})),
            Value::String(s) if s.trim().is_empty() => Ok(json!({})),
            Value::String(s) => serde_json::from_str(s),
            other => Ok(other.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Latency {
    pub total: Option<f64>,
    pub tts: Option<f64>,
    pub ttt: Option<f64>,
}

/// Classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Welcome,
    SettingsApplied,
    /// Interim text for the live transcript.
    ConversationText { role: Role, content: String },
    /// Turn-final utterance (role present, no recognised type).
    Utterance { role: Role, content: String },
    UserStartedSpeaking,
    AgentThinking,
    AgentStartedSpeaking { latency: Option<Latency> },
    AgentAudioDone,
    EndOfThought,
    FunctionCallRequest { functions: Vec<FunctionCall>, rejected: usize },
    Error { description: String },
    Warning { description: String },
    Other(String),
}

// Every field optional, like the agent's own loose envelope.
#[derive(Deserialize, Debug, Default)]
struct RawServerMessage {
    #[serde(rename = "type")]
    msg_type: Option<String>,
    role: Option<String>,
    content: Option<String>,
    functions: Option<Value>,
    total_latency: Option<f64>,
    tts_latency: Option<f64>,
    ttt_latency: Option<f64>,
    description: Option<String>,
    message: Option<String>,
}

pub fn parse_server_message(text: &str) -> serde_json::Result<ServerEvent> {
    let raw: RawServerMessage = serde_json::from_str(text)?;
    let role = raw.role.as_deref().and_then(Role::parse);
    let msg_type = raw.msg_type.clone().unwrap_or_default();

    let event = match msg_type.as_str() {
        "ConversationText" => match role {
            Some(role) => ServerEvent::ConversationText {
                role,
                content: raw.content.unwrap_or_default(),
            },
            None => ServerEvent::Other(msg_type),
        },
        "Welcome" => ServerEvent::Welcome,
        "SettingsApplied" => ServerEvent::SettingsApplied,
        "UserStartedSpeaking" => ServerEvent::UserStartedSpeaking,
        "AgentThinking" => ServerEvent::AgentThinking,
        "AgentStartedSpeaking" => {
            let latency = if raw.total_latency.is_some()
                || raw.tts_latency.is_some()
                || raw.ttt_latency.is_some()
            {
                Some(Latency {
                    total: raw.total_latency,
                    tts: raw.tts_latency,
                    ttt: raw.ttt_latency,
                })
            } else {
                None
            };
            ServerEvent::AgentStartedSpeaking { latency }
        }
        "AgentAudioDone" => ServerEvent::AgentAudioDone,
        "EndOfThought" => ServerEvent::EndOfThought,
        "FunctionCallRequest" => {
            let (functions, rejected) = parse_functions(raw.functions);
            ServerEvent::FunctionCallRequest { functions, rejected }
        }
        "Error" => ServerEvent::Error {
            description: raw.description.or(raw.message).unwrap_or_default(),
        },
        "Warning" => ServerEvent::Warning {
            description: raw.description.or(raw.message).unwrap_or_default(),
        },
        _ => match role {
            Some(role) => ServerEvent::Utterance {
                role,
                content: raw.content.unwrap_or_default(),
            },
            None => ServerEvent::Other(msg_type),
        },
    };
    Ok(event)
}

fn parse_functions(functions: Option<Value>) -> (Vec<FunctionCall>, usize) {
    let Some(Value::Array(items)) = functions else {
        return (Vec::new(), 0);
    };
    let mut parsed = Vec::with_capacity(items.len());
    let mut rejected = 0;
    for item in items {
        match serde_json::from_value::<FunctionCall>(item) {
            Ok(call) => parsed.push(call),
            Err(e) => {
                log::error!("Skipping malformed function call entry: {}", e);
                rejected += 1;
            }
        }
    }
    (parsed, rejected)
}
