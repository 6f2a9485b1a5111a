//! # ddp
//!
//! Client for DDP-style chat servers: one persistent WebSocket carrying
//! remote method calls and server-push subscriptions.
//!
//! ## Features
//!
//! - **Actor core**: a single driver task owns the transport and every registry
//! - **Type-state builder**: the endpoint must be set before `build()` compiles
//! - **Transparent recovery**: reopen with backoff, session resume, subscription replay
//! - **Heartbeat**: ping probes with a two-interval liveness window
//! - **Pluggable**: connectors, reconnection strategies and event sinks are traits

pub mod core;
pub mod protocol;
pub mod traits;

// Re-export all traits
pub use traits::*;

pub use self::core::{
    builder, client, config, connection_state, heartbeat, pending, subscriptions, websocket,
    builder::{states, ClientBuilder},
    client::{ClientEvent, DdpClient, Metrics, SubscriptionHandle},
    config::ClientConfig,
    connection_state::{AtomicConnectionState, AtomicMetrics, ConnectionState},
    websocket::WsConnector,
};
pub(crate) use self::core::driver;

pub use protocol::{Credentials, LoginResult, PushEvent};
