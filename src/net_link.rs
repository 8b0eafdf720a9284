//! Agent WebSocket connection.
//!
//! [`ConnectionManager`] owns the connection state machine
//! (`Unstarted → Connecting → Connected → Closed | Failed`). Each `connect()`
//! spawns a link task for a new generation; the task fetches a credential,
//! opens the socket, runs the keep-alive interval and the session limit
//! timer, and reports back through [`LinkEvent`]s tagged with its
//! generation. Events from an older generation are ignored.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::connect_async;
use url::Url;

use crate::backend::CredentialSource;
use crate::error::BackendError;
use crate::protocol::ClientMessage;

const COMMAND_QUEUE: usize = 256;

#[derive(Debug)]
pub enum NetEvent {
    Connected,
    Text(String),
    Binary(Vec<u8>),
    Closed { code: Option<u16>, reason: String },
    Failed { reason: String, rate_limited: bool },
    SessionExpired,
}

#[derive(Debug)]
pub enum NetCommand {
    SendText(String),
    SendBinary(Vec<u8>),
    Close,
}

#[derive(Debug)]
pub struct LinkEvent {
    pub generation: u64,
    pub event: NetEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Unstarted,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub state: ConnectionState,
    pub rate_limited: bool,
    pub session_expired: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            state: ConnectionState::Unstarted,
            rate_limited: false,
            session_expired: false,
        }
    }
}

impl SessionState {
    fn observe(&mut self, event: &NetEvent) {
        match event {
            NetEvent::Connected => {
                self.state = ConnectionState::Connected;
                self.rate_limited = false;
            }
            NetEvent::Closed { .. } => self.state = ConnectionState::Closed,
            NetEvent::Failed { rate_limited, .. } => {
                self.state = ConnectionState::Failed;
                self.rate_limited |= *rate_limited;
            }
            NetEvent::SessionExpired => self.session_expired = true,
            NetEvent::Text(_) | NetEvent::Binary(_) => {}
        }
    }
}

/// The orchestrator's view of the agent connection.
pub trait AgentConnection: Send {
    fn connect(&mut self);
    fn disconnect(&mut self);
    /// Apply a link event. Returns false when the event is stale.
    fn observe(&mut self, event: &LinkEvent) -> bool;
    fn state(&self) -> ConnectionState;
    fn rate_limited(&self) -> bool;
    fn session_expired(&self) -> bool;
    /// Queue a message for the socket. Dropped when the socket is not open.
    fn send(&mut self, command: NetCommand) -> bool;
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub ws_url: String,
    pub keep_alive: Duration,
    pub session_limit: Duration,
}

struct Link {
    task: JoinHandle<()>,
    cmd_tx: mpsc::Sender<NetCommand>,
}

pub struct ConnectionManager {
    options: LinkOptions,
    credentials: Arc<dyn CredentialSource>,
    events_tx: mpsc::Sender<LinkEvent>,
    generation: u64,
    session: SessionState,
    link: Option<Link>,
}

impl ConnectionManager {
    pub fn new(
        options: LinkOptions,
        credentials: Arc<dyn CredentialSource>,
        events_tx: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self {
            options,
            credentials,
            events_tx,
            generation: 0,
            session: SessionState::default(),
            link: None,
        }
    }

    #[cfg(test)]
    fn generation(&self) -> u64 {
        self.generation
    }

    fn abort_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.task.abort();
        }
    }
}

impl AgentConnection for ConnectionManager {
    fn connect(&mut self) {
        self.abort_link();
        self.generation += 1;
        self.session.session_expired = false;
        self.session.state = ConnectionState::Connecting;
        log::info!("Connecting to agent (generation {})", self.generation);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let task = LinkTask {
            generation: self.generation,
            options: self.options.clone(),
            credentials: self.credentials.clone(),
            events_tx: self.events_tx.clone(),
        };
        self.link = Some(Link {
            task: tokio::spawn(task.run(cmd_rx)),
            cmd_tx,
        });
    }

    fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            // An open link sends the close frame and exits on its own.
            let open = self.session.state == ConnectionState::Connected;
            if !open || link.cmd_tx.try_send(NetCommand::Close).is_err() {
                link.task.abort();
            }
        }
        // Anything the old task still reports is stale from here on.
        self.generation += 1;
        self.session = SessionState::default();
    }

    fn observe(&mut self, event: &LinkEvent) -> bool {
        if event.generation != self.generation {
            log::debug!(
                "Ignoring stale link event from generation {} (current {})",
                event.generation,
                self.generation
            );
            return false;
        }
        self.session.observe(&event.event);
        if matches!(event.event, NetEvent::Closed { .. } | NetEvent::Failed { .. }) {
            self.link = None;
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
        let Some(link) = &self.link else {
            log::warn!("Socket not open, dropping {:?}", Brief(&command));
            return false;
        };
        if self.session.state != ConnectionState::Connected {
            log::warn!("Socket not open, dropping {:?}", Brief(&command));
            return false;
        }
        match link.cmd_tx.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(command)) => {
                log::warn!("Socket send queue full, dropping {:?}", Brief(&command));
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.abort_link();
    }
}

// Keeps audio payloads out of the log.
struct Brief<'a>(&'a NetCommand);

impl std::fmt::Debug for Brief<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            NetCommand::SendText(text) => write!(f, "text({} bytes)", text.len()),
            NetCommand::SendBinary(data) => write!(f, "binary({} bytes)", data.len()),
            NetCommand::Close => write!(f, "close"),
        }
    }
}

struct LinkTask {
    generation: u64,
    options: LinkOptions,
    credentials: Arc<dyn CredentialSource>,
    events_tx: mpsc::Sender<LinkEvent>,
}

impl LinkTask {
    async fn emit(&self, event: NetEvent) {
        let event = LinkEvent {
            generation: self.generation,
            event,
        };
        if self.events_tx.send(event).await.is_err() {
            log::debug!("Link event receiver dropped");
        }
    }

    async fn fail(&self, reason: String, rate_limited: bool) {
        log::error!("Agent connection failed: {}", reason);
        self.emit(NetEvent::Failed { reason, rate_limited }).await;
    }

    async fn run(self, mut cmd_rx: mpsc::Receiver<NetCommand>) {
        let token = match self.credentials.access_token().await {
            Ok(token) => token,
            Err(e) => {
                let rate_limited = matches!(e, BackendError::RateLimited);
                self.fail(e.to_string(), rate_limited).await;
                return;
            }
        };

        let request = match build_request(&self.options.ws_url, &token) {
            Ok(request) => request,
            Err(e) => {
                self.fail(format!("{:#}", e), false).await;
                return;
            }
        };

        let ws_stream = match connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                let rate_limited = matches!(
                    &e,
                    tungstenite::Error::Http(resp) if resp.status().as_u16() == 429
                );
                self.fail(e.to_string(), rate_limited).await;
                return;
            }
        };
        log::info!("Agent socket open");
        self.emit(NetEvent::Connected).await;

        let (mut write, mut read) = ws_stream.split();
        let period = self.options.keep_alive;
        let mut keep_alive = tokio::time::interval_at(Instant::now() + period, period);
        let expiry = tokio::time::sleep(self.options.session_limit);
        tokio::pin!(expiry);
        let mut expired = false;

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.emit(NetEvent::Text(text.to_string())).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.emit(NetEvent::Binary(data.to_vec())).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                            None => (None, String::new()),
                        };
                        log::info!("Agent closed the socket: code={:?} reason={}", code, reason);
                        self.emit(NetEvent::Closed { code, reason }).await;
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.fail(e.to_string(), false).await;
                        return;
                    }
                    None => {
                        self.emit(NetEvent::Closed { code: None, reason: String::new() }).await;
                        return;
                    }
                },
                cmd = cmd_rx.recv() => {
                    let message = match cmd {
                        Some(NetCommand::SendText(text)) => Message::Text(text.into()),
                        Some(NetCommand::SendBinary(data)) => Message::Binary(data.into()),
                        Some(NetCommand::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            log::info!("Agent socket closed by client");
                            return;
                        }
                    };
                    if let Err(e) = write.send(message).await {
                        self.fail(e.to_string(), false).await;
                        return;
                    }
                }
                _ = keep_alive.tick() => {
                    match ClientMessage::KeepAlive.to_json() {
                        Ok(json) => {
                            log::debug!("Sending KeepAlive");
                            if let Err(e) = write.send(Message::Text(json.into())).await {
                                self.fail(e.to_string(), false).await;
                                return;
                            }
                        }
                        Err(e) => log::error!("Failed to encode KeepAlive: {}", e),
                    }
                }
                _ = &mut expiry, if !expired => {
                    expired = true;
                    log::info!("Session limit reached");
                    self.emit(NetEvent::SessionExpired).await;
                }
            }
        }
    }
}

fn build_request(
    ws_url: &str,
    token: &str,
) -> anyhow::Result<tungstenite::http::Request<()>> {
    let url = Url::parse(ws_url)?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("No host in {}", ws_url))?;
    let host = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let request = tungstenite::http::Request::builder()
        .method("GET")
        .uri(ws_url)
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .header("Authorization", format!("Bearer {}", token))
        .body(())?;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    struct StaticToken(&'static str);

    #[async_trait]
    impl CredentialSource for StaticToken {
        async fn access_token(&self) -> Result<String, BackendError> {
            Ok(self.0.to_string())
        }
    }

    struct RateLimitedBackend;

    #[async_trait]
    impl CredentialSource for RateLimitedBackend {
        async fn access_token(&self) -> Result<String, BackendError> {
            Err(BackendError::RateLimited)
        }
    }

    fn options(addr: std::net::SocketAddr) -> LinkOptions {
        LinkOptions {
            ws_url: format!("ws://{}", addr),
            keep_alive: Duration::from_secs(60),
            session_limit: Duration::from_secs(120),
        }
    }

    async fn next_event(
        manager: &mut ConnectionManager,
        rx: &mut mpsc::Receiver<LinkEvent>,
    ) -> NetEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for link event")
                .expect("link event channel closed");
            if manager.observe(&event) {
                return event.event;
            }
        }
    }

    #[tokio::test]
    async fn exchanges_messages_with_bearer_token() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let auth = Arc::new(Mutex::new(None));

        let server_auth = auth.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                *server_auth.lock() = req
                    .headers()
                    .get("Authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
            let received = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text(r#"{"type":"Welcome"}"#.into())).await.unwrap();
            ws.send(Message::Binary(vec![1u8, 0, 2, 0].into())).await.unwrap();
            ws.close(None).await.unwrap();
            received
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut manager =
            ConnectionManager::new(options(addr), Arc::new(StaticToken("tok-1")), events_tx);
        manager.connect();
        assert_eq!(manager.state(), ConnectionState::Connecting);

        assert!(matches!(next_event(&mut manager, &mut events_rx).await, NetEvent::Connected));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.send(NetCommand::SendText("hello".into())));

        assert!(matches!(next_event(&mut manager, &mut events_rx).await, NetEvent::Text(t) if t.contains("Welcome")));
        assert!(matches!(next_event(&mut manager, &mut events_rx).await, NetEvent::Binary(b) if b.len() == 4));
        assert!(matches!(next_event(&mut manager, &mut events_rx).await, NetEvent::Closed { .. }));
        assert_eq!(manager.state(), ConnectionState::Closed);

        assert_eq!(server.await.unwrap(), Message::Text("hello".into()));
        assert_eq!(auth.lock().as_deref(), Some("Bearer tok-1"));
        assert!(!manager.send(NetCommand::SendText("late".into())));
    }

    #[tokio::test]
    async fn sends_keep_alive_and_flags_expiry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            // Hold the socket open until the client goes away.
            while let Some(Ok(_)) = ws.next().await {}
            first
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut opts = options(addr);
        opts.keep_alive = Duration::from_millis(50);
        opts.session_limit = Duration::from_millis(200);
        let mut manager = ConnectionManager::new(opts, Arc::new(StaticToken("tok")), events_tx);
        manager.connect();

        assert!(matches!(next_event(&mut manager, &mut events_rx).await, NetEvent::Connected));
        assert!(matches!(next_event(&mut manager, &mut events_rx).await, NetEvent::SessionExpired));
        assert!(manager.session_expired());
        assert_eq!(manager.state(), ConnectionState::Connected);

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Unstarted);
        assert!(!manager.session_expired());

        let first = server.await.unwrap();
        assert_eq!(first, Message::Text(r#"{"type":"KeepAlive"}"#.into()));
    }

    #[tokio::test]
    async fn rate_limited_credentials_fail_the_session() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let addr = "127.0.0.1:9".parse().unwrap();
        let mut manager = ConnectionManager::new(options(addr), Arc::new(RateLimitedBackend), events_tx);
        manager.connect();

        let event = next_event(&mut manager, &mut events_rx).await;
        assert!(matches!(event, NetEvent::Failed { rate_limited: true, .. }));
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(manager.rate_limited());

        manager.disconnect();
        assert!(!manager.rate_limited());
    }

    #[tokio::test]
    async fn events_from_replaced_links_are_stale() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let addr = "127.0.0.1:9".parse().unwrap();
        let mut manager = ConnectionManager::new(options(addr), Arc::new(RateLimitedBackend), events_tx);
        manager.connect();
        let first = manager.generation();
        manager.connect();

        let stale = LinkEvent { generation: first, event: NetEvent::Connected };
        assert!(!manager.observe(&stale));
        assert_eq!(manager.state(), ConnectionState::Connecting);

        let current = LinkEvent { generation: manager.generation(), event: NetEvent::Connected };
        assert!(manager.observe(&current));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn send_without_link_is_dropped() {
        let (events_tx, _rx) = mpsc::channel(1);
        let addr = "127.0.0.1:9".parse().unwrap();
        let mut manager = ConnectionManager::new(options(addr), Arc::new(StaticToken("t")), events_tx);
        assert!(!manager.send(NetCommand::SendBinary(vec![0, 0])));
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Unstarted);
    }
}
