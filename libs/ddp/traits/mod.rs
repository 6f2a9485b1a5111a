//! # DDP client traits
//!
//! Seams of the client that callers can plug into:
//!
//! - **Connector**: opens the duplex text transport
//! - **ReconnectionStrategy**: controls reopen backoff
//! - **EventHandler**: receives server-push events for a subscription

pub mod error;
pub mod reconnect;
pub mod sink;
pub mod transport;

pub use error::{DdpError, Result};
pub use reconnect::{ExponentialBackoff, FixedDelay, NeverReconnect, ReconnectionStrategy};
pub use sink::EventHandler;
pub use transport::{Connector, TransportCommand, TransportEvent, TransportLink, CLOSE_NORMAL};
