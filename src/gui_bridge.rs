use crate::config::Config;
use crate::conversation::{BehindTheScenesEvent, BotStatus, ConversationMessage};
use crate::net_link::ConnectionState;
use crate::panels::VerticalKind;
use crate::protocol::Role;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Commands sent by the UI process.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum UiCommand {
    SetupMicrophone,
    Connect,
    Disconnect,
    ToggleSleep,
    SelectPanel {
        #[serde(default)]
        panel: Option<VerticalKind>,
    },
    UpdateInstructions {
        instructions: String,
    },
    UpdateVoice {
        voice: String,
    },
    EditField {
        #[serde(default)]
        panel: Option<VerticalKind>,
        field: String,
        value: String,
    },
    Save {
        #[serde(default)]
        panel: Option<VerticalKind>,
    },
    Clear {
        #[serde(default)]
        panel: Option<VerticalKind>,
    },
    Delete {
        #[serde(default)]
        panel: Option<VerticalKind>,
        id: String,
    },
    /// Without `status` the record's status is toggled.
    SetStatus {
        #[serde(default)]
        panel: Option<VerticalKind>,
        id: String,
        #[serde(default)]
        status: Option<String>,
    },
}

/// State pushed to the UI process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiUpdate {
    Status {
        status: BotStatus,
    },
    Connection {
        state: ConnectionState,
        rate_limited: bool,
    },
    Transcript {
        role: Role,
        text: Option<String>,
    },
    Message {
        message: ConversationMessage,
    },
    Event {
        event: BehindTheScenesEvent,
    },
    Panel {
        active: Option<VerticalKind>,
        snapshot: Option<Value>,
    },
    Levels {
        user: f32,
        agent: f32,
    },
    Notice {
        text: String,
    },
}

pub struct GuiBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    buffer_size: usize,
    tx: mpsc::Sender<UiCommand>,
}

// The UI process and the core talk over local UDP, ports from config.toml.
impl GuiBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<UiCommand>) -> anyhow::Result<Self> {
        let socket =
            UdpSocket::bind(format!("{}:{}", config.gui_local_ip, config.gui_local_port)).await?;
        let target_addr = format!("{}:{}", config.gui_remote_ip, config.gui_remote_port);

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            buffer_size: config.gui_buffer_size,
            tx,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            let command = match parse_command(&buf[..len]) {
                Ok(command) => command,
                Err(e) => {
                    log::warn!("Ignoring malformed UI command: {}", e);
                    continue;
                }
            };
            log::debug!("UI command: {:?}", command);
            if let Err(e) = self.tx.send(command).await {
                log::error!("Failed to forward UI command: {}", e);
                break;
            }
        }
        Ok(())
    }

    pub async fn send_update(&self, update: &UiUpdate) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(update)?;
        self.socket.send_to(&payload, &self.target_addr).await?;
        Ok(())
    }
}

pub fn parse_command(datagram: &[u8]) -> serde_json::Result<UiCommand> {
    serde_json::from_slice(datagram)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_tagged_commands() {
        assert_eq!(parse_command(br#"{"cmd":"connect"}"#).unwrap(), UiCommand::Connect);
        assert_eq!(
            parse_command(br#"{"cmd":"select_panel","panel":"drug_dispatch"}"#).unwrap(),
            UiCommand::SelectPanel {
                panel: Some(VerticalKind::DrugDispatch)
            }
        );
        assert_eq!(
            parse_command(br#"{"cmd":"select_panel"}"#).unwrap(),
            UiCommand::SelectPanel { panel: None }
        );
        assert_eq!(
            parse_command(br#"{"cmd":"set_status","id":"default-dispatch"}"#).unwrap(),
            UiCommand::SetStatus {
                panel: None,
                id: "default-dispatch".into(),
                status: None
            }
        );
    }

    #[test]
    fn rejects_unknown_commands() {
        assert!(parse_command(br#"{"cmd":"self_destruct"}"#).is_err());
        assert!(parse_command(b"not json").is_err());
    }

    #[test]
    fn updates_are_tagged_by_type() {
        let value = serde_json::to_value(UiUpdate::Connection {
            state: ConnectionState::Connected,
            rate_limited: false,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({ "type": "connection", "state": "connected", "rate_limited": false })
        );

        let value = serde_json::to_value(UiUpdate::Transcript {
            role: Role::User,
            text: None,
        })
        .unwrap();
        assert_eq!(value, json!({ "type": "transcript", "role": "user", "text": null }));
    }

    #[tokio::test]
    async fn forwards_datagrams_and_sends_updates() {
        let ui = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::new().unwrap();
        config.gui_local_ip = "127.0.0.1";
        config.gui_local_port = 0;
        config.gui_remote_ip = "127.0.0.1";
        config.gui_remote_port = ui.local_addr().unwrap().port();

        let (tx, mut rx) = mpsc::channel(4);
        let bridge = Arc::new(GuiBridge::new(&config, tx).await.unwrap());
        let core_addr = bridge.socket.local_addr().unwrap();
        let runner = bridge.clone();
        tokio::spawn(async move { runner.run().await });

        ui.send_to(br#"{"cmd":"toggle_sleep"}"#, core_addr).await.unwrap();
        assert_eq!(rx.recv().await, Some(UiCommand::ToggleSleep));

        bridge
            .send_update(&UiUpdate::Notice { text: "hi".into() })
            .await
            .unwrap();
        let mut buf = [0u8; 256];
        let (len, _) = ui.recv_from(&mut buf).await.unwrap();
        let value: Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(value, json!({ "type": "notice", "text": "hi" }));
    }
}
