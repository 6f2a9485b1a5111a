//! Common test utilities for ddp integration tests
//!
//! Two fake servers:
//! - [`MockConnector`] hands every opened transport to the test as a
//!   [`ServerSide`], so the test scripts the server frame by frame;
//! - [`MockDdpServer`] is a real WebSocket server speaking just enough
//!   of the protocol for end-to-end tests.

#![allow(dead_code)]

use async_trait::async_trait;
use ddp::builder::states::HasUrl;
use ddp::{
    ClientBuilder, ClientEvent, Connector, DdpClient, DdpError, TransportCommand, TransportEvent,
    TransportLink,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};

/// Macro for verbose test output (controlled by TEST_VERBOSE env var)
#[macro_export]
macro_rules! verbose_println {
    ($($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            println!($($arg)*);
        }
    };
}

/// How long a test waits for any single expected frame or event
pub const STEP_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// In-memory transport
// =============================================================================

/// Connector whose transports are driven by the test
pub struct MockConnector {
    opened: mpsc::UnboundedSender<ServerSide>,
    refuse: AtomicBool,
    open_delay: Mutex<Option<Duration>>,
    opens: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (opened, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            opened,
            refuse: AtomicBool::new(false),
            open_delay: Mutex::new(None),
            opens: AtomicUsize::new(0),
        });
        (connector, accepted)
    }

    /// Make every following open fail at the transport level
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Delay every following open, simulating an unreachable host
    pub fn delay_opens(&self, delay: Option<Duration>) {
        *self.open_delay.lock() = delay;
    }

    /// Number of open attempts so far
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, url: &str) -> ddp::Result<TransportLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DdpError::Transport(format!("connection refused: {}", url)));
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = self.opened.send(ServerSide {
            frames: command_rx,
            events: event_tx,
        });

        Ok(TransportLink {
            commands: command_tx,
            events: event_rx,
        })
    }
}

/// Server end of one in-memory transport
pub struct ServerSide {
    frames: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl ServerSide {
    /// Next command the client put on this transport
    pub async fn next_command(&mut self) -> Option<TransportCommand> {
        tokio::time::timeout(STEP_TIMEOUT, self.frames.recv())
            .await
            .expect("timed out waiting for the client")
    }

    /// Next frame sent by the client, skipping heartbeat pings
    pub async fn next_frame(&mut self) -> Value {
        loop {
            match self.next_command().await {
                Some(TransportCommand::Send(text)) => {
                    verbose_println!("  client -> {}", text);
                    let frame: Value = serde_json::from_str(&text).expect("client sent invalid JSON");
                    if frame["msg"] == "ping" {
                        continue;
                    }
                    return frame;
                }
                Some(TransportCommand::Close { code, reason }) => {
                    panic!("expected a frame, client closed ({} {})", code, reason)
                }
                None => panic!("expected a frame, transport dropped"),
            }
        }
    }

    /// Next frame, which must be of the given kind
    pub async fn expect(&mut self, msg: &str) -> Value {
        let frame = self.next_frame().await;
        assert_eq!(frame["msg"], msg, "unexpected frame: {}", frame);
        frame
    }

    /// Assert the client sends nothing but pings for `window`
    pub async fn expect_silence(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.frames.recv()).await {
                Err(_) => return,
                Ok(Some(TransportCommand::Send(text))) if text.contains("\"ping\"") => continue,
                Ok(other) => panic!("expected silence, got {:?}", other),
            }
        }
    }

    /// The client closes (or drops) this transport
    pub async fn expect_closed(&mut self) -> Option<(u16, String)> {
        loop {
            match self.next_command().await {
                Some(TransportCommand::Send(_)) => continue,
                Some(TransportCommand::Close { code, reason }) => return Some((code, reason)),
                None => return None,
            }
        }
    }

    pub fn send(&self, frame: Value) {
        verbose_println!("  server -> {}", frame);
        let _ = self.events.send(TransportEvent::Message(frame.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.events.send(TransportEvent::Message(text.to_string()));
    }

    /// Abrupt transport loss as seen by the client
    pub fn drop_connection(&self) {
        let _ = self.events.send(TransportEvent::Closed {
            code: Some(1006),
            reason: "abnormal closure".into(),
        });
    }

    /// Read the handshake and accept it
    pub async fn accept_handshake(&mut self, session: &str) -> Value {
        let connect = self.expect("connect").await;
        self.send(json!({"msg": "connected", "session": session}));
        connect
    }

    /// Read a subscribe frame and acknowledge it; returns the frame
    pub async fn ack_subscribe(&mut self) -> Value {
        let sub = self.expect("sub").await;
        self.send(json!({"msg": "ready", "subs": [sub["id"].clone()]}));
        sub
    }

    /// Push a streamer event for `collection`, scoped by `event_name`
    pub fn push(&self, collection: &str, event_name: &str, args: Value) {
        self.send(json!({
            "msg": "changed",
            "collection": collection,
            "id": "id",
            "fields": {"eventName": event_name, "args": args},
        }));
    }
}

// =============================================================================
// Client helpers
// =============================================================================

/// Builder wired to a mock connector with short timings and no heartbeat
pub fn test_builder(connector: &Arc<MockConnector>) -> ClientBuilder<HasUrl> {
    DdpClient::builder()
        .url("ws://mock.invalid/websocket")
        .connector(connector.clone())
        .connect_timeout(Duration::from_millis(500))
        .reopen_delay(Duration::from_millis(20))
        .no_heartbeat()
}

/// Connect a client, accepting the handshake on the server side
pub async fn connect(
    client: &DdpClient,
    accepted: &mut mpsc::UnboundedReceiver<ServerSide>,
) -> ServerSide {
    let (result, server) = tokio::join!(client.connect(), async {
        let mut server = next_transport(accepted).await;
        server.accept_handshake("session-1").await;
        server
    });
    result.expect("connect failed");
    server
}

pub async fn next_transport(accepted: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
    tokio::time::timeout(STEP_TIMEOUT, accepted.recv())
        .await
        .expect("timed out waiting for a transport open")
        .expect("connector dropped")
}

/// Poll the client's event queue until `matches` accepts an event
pub async fn wait_for_event(
    client: &DdpClient,
    matches: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    loop {
        while let Some(event) = client.try_recv_event() {
            verbose_println!("  event: {:?}", event);
            if matches(&event) {
                return event;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for client event"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll `condition` until it holds or the step timeout elapses
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

// =============================================================================
// WebSocket server
// =============================================================================

/// Minimal DDP server over a real WebSocket
///
/// Accepts any handshake, echoes `echo` method params back as the result,
/// acknowledges every `sub` and pushes one `changed` event for it, and
/// answers `unsub` with `nosub`.
pub struct MockDdpServer {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
}

impl MockDdpServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let shutdown = shutdown_clone.clone();
                                tokio::spawn(async move {
                                    Self::handle_connection(stream, shutdown).await;
                                });
                            }
                            Err(e) => {
                                eprintln!("Accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_clone.notified() => {
                        break;
                    }
                }
            }
        });

        Self { addr, shutdown }
    }

    async fn handle_connection(stream: tokio::net::TcpStream, shutdown: Arc<Notify>) {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::accept_async;
        use tokio_tungstenite::tungstenite::Message;

        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                eprintln!("WebSocket handshake failed: {}", e);
                return;
            }
        };

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => continue,
                    };
                    let frame: Value = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(_) => continue,
                    };
                    for reply in Self::respond(&frame) {
                        if write.send(Message::Text(reply.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
                _ = shutdown.notified() => {
                    break;
                }
            }
        }
    }

    fn respond(frame: &Value) -> Vec<Value> {
        match frame["msg"].as_str() {
            Some("connect") => vec![json!({"msg": "connected", "session": "ws-session"})],
            Some("ping") => vec![json!({"msg": "pong"})],
            Some("method") => {
                let result = match frame["method"].as_str() {
                    Some("echo") => frame["params"].get(0).cloned().unwrap_or(Value::Null),
                    _ => Value::Null,
                };
                vec![json!({"msg": "result", "id": frame["id"], "result": result})]
            }
            Some("sub") => {
                let scope = frame["params"].get(0).cloned().unwrap_or(Value::Null);
                vec![
                    json!({"msg": "ready", "subs": [frame["id"]]}),
                    json!({
                        "msg": "changed",
                        "collection": frame["name"],
                        "id": "id",
                        "fields": {"eventName": scope, "args": [{"msg": "hello"}]},
                    }),
                ]
            }
            Some("unsub") => vec![json!({"msg": "nosub", "id": frame["id"]})],
            _ => Vec::new(),
        }
    }

    /// Get the WebSocket URL for this server
    pub fn ws_url(&self) -> String {
        format!("ws://{}/websocket", self.addr)
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for MockDdpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
