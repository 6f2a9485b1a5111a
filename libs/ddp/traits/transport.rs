//! Transport contract
//!
//! The connection driver never touches a socket directly. It asks a
//! [`Connector`] to open a duplex text transport and then talks to it
//! through a pair of channels:
//!
//! ```text
//! Driver ──TransportCommand──> transport task ──> wire
//! Driver <──TransportEvent──── transport task <── wire
//! ```
//!
//! The WebSocket implementation lives in `core::websocket`; tests plug in
//! an in-memory connector.

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Close code used for caller-initiated shutdowns
pub const CLOSE_NORMAL: u16 = 1000;

/// Commands the driver issues to an open transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Send one text frame
    Send(String),
    /// Close the transport with a code and reason
    Close { code: u16, reason: String },
}

/// Callbacks from an open transport, delivered in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound text frame
    Message(String),
    /// The transport closed; no further events follow
    Closed { code: Option<u16>, reason: String },
    /// The transport reported an error; a `Closed` event usually follows
    Error(String),
}

/// Both halves of an open transport
#[derive(Debug)]
pub struct TransportLink {
    pub commands: mpsc::UnboundedSender<TransportCommand>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportLink {
    /// Queue a text frame. Returns false if the transport task is gone.
    pub fn send(&self, text: String) -> bool {
        self.commands.send(TransportCommand::Send(text)).is_ok()
    }

    /// Ask the transport to close. The link should be dropped afterwards.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.commands.send(TransportCommand::Close {
            code,
            reason: reason.into(),
        });
    }
}

/// Opens transports on demand
///
/// `open` is called once per connect or reopen attempt. Failing to
/// establish the transport must surface as `Err(DdpError::Transport)`.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<TransportLink>;
}
