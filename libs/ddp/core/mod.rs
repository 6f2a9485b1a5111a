//! Connection core
//!
//! The [`DdpClient`] facade sends commands to a single connection driver
//! task, which owns the transport, the pending-operation and subscription
//! registries, the heartbeat and the reopen timers.
//!
//! ## Example
//!
//! ```rust,ignore
//! use ddp::{Credentials, DdpClient, ExponentialBackoff};
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ddp::Result<()> {
//!     let client = DdpClient::builder()
//!         .host("localhost:3000", false)
//!         .heartbeat(Duration::from_secs(30))
//!         .reconnect_strategy(ExponentialBackoff::new(
//!             Duration::from_secs(1),
//!             Duration::from_secs(60),
//!             None, // unlimited retries
//!         ))
//!         .build()?;
//!
//!     client.connect().await?;
//!     client.login(Credentials::password("bot", "secret")).await?;
//!
//!     let (tx, rx) = crossbeam_channel::unbounded();
//!     client
//!         .subscribe("stream-room-messages", vec![json!("GENERAL"), json!(false)], Some(Arc::new(tx)))
//!         .await?;
//!
//!     while let Ok(event) = rx.recv() {
//!         println!("{:?}", event.args);
//!     }
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod client;
pub mod config;
pub mod connection_state;
pub(crate) mod driver;
pub mod heartbeat;
pub mod pending;
pub mod subscriptions;
pub mod websocket;

pub use builder::{states, ClientBuilder};
pub use client::{ClientEvent, DdpClient, Metrics, SubscriptionHandle};
pub use config::ClientConfig;
pub use connection_state::{AtomicConnectionState, AtomicMetrics, ConnectionState};
pub use websocket::WsConnector;
