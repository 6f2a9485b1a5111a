//! WebSocket transport on top of tokio-tungstenite
//!
//! Each open transport runs two tasks: a writer draining
//! [`TransportCommand`]s into the socket and a reader forwarding text
//! frames as [`TransportEvent`]s. Dropping the [`TransportLink`] stops
//! both and closes the socket.

use crate::traits::*;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Default [`Connector`] opening `ws://` / `wss://` connections
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| DdpError::Transport(format!("failed to open {}: {}", url, e)))?;
        debug!("WebSocket open: {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<TransportCommand>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    TransportCommand::Send(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!("WebSocket send failed: {}", e);
                            break;
                        }
                    }
                    TransportCommand::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = write.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
            let _ = write.close().await;
            debug!("WebSocket writer exiting");
        });

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => TransportEvent::Message(text),
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => TransportEvent::Message(text),
                        Err(_) => {
                            debug!("Dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                            None => (None, String::new()),
                        };
                        let _ = event_tx.send(TransportEvent::Closed { code, reason });
                        return;
                    }
                    // Control frames are answered by tungstenite itself
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                };
                if event_tx.send(event).is_err() {
                    // Link dropped by the driver
                    return;
                }
            }
            let _ = event_tx.send(TransportEvent::Closed {
                code: None,
                reason: "stream ended".into(),
            });
        });

        Ok(TransportLink {
            commands: command_tx,
            events: event_rx,
        })
    }
}
