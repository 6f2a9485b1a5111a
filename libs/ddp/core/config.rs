use crate::protocol::DDP_VERSIONS;
use crate::traits::*;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default handshake window for `connect()`
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default delay between reopen attempts
pub const DEFAULT_REOPEN_DELAY: Duration = Duration::from_secs(10);

/// Default heartbeat interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for a [`DdpClient`](crate::DdpClient)
///
/// Built through the type-state builder; the url is the only required
/// field.
pub struct ClientConfig {
    /// WebSocket URL (wss:// or ws://)
    pub(crate) url: String,

    /// Window for transport open plus handshake acknowledgment
    pub(crate) connect_timeout: Duration,

    /// Backoff policy for background reopens
    pub(crate) reconnect_strategy: Arc<dyn ReconnectionStrategy>,

    /// Heartbeat interval; `None` disables liveness probing
    pub(crate) heartbeat_interval: Option<Duration>,

    /// Protocol versions offered in the handshake, preferred first
    pub(crate) versions: Vec<String>,

    /// Integration tag of the application using this client. Tagged on
    /// connection logs; higher layers read it back through
    /// [`ClientConfig::integration_id`] for message metadata.
    pub(crate) integration_id: Option<String>,

    /// Resume token to log in with as soon as the handshake completes
    pub(crate) resume_token: Option<String>,

    /// Opens the transport for every connect and reopen attempt
    pub(crate) connector: Arc<dyn Connector>,
}

impl ClientConfig {
    /// Normalize a host into a DDP WebSocket endpoint
    ///
    /// ```
    /// use ddp::ClientConfig;
    ///
    /// assert_eq!(ClientConfig::websocket_url("localhost:3000", false), "ws://localhost:3000/websocket");
    /// assert_eq!(ClientConfig::websocket_url("https://chat.example.com/", true), "wss://chat.example.com/websocket");
    /// ```
    pub fn websocket_url(host: &str, use_tls: bool) -> String {
        let bare = host
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_start_matches("wss://")
            .trim_start_matches("ws://")
            .trim_end_matches('/');
        let bare = bare.strip_suffix("/websocket").unwrap_or(bare);
        let scheme = if use_tls { "wss" } else { "ws" };
        format!("{}://{}/websocket", scheme, bare)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn has_heartbeat(&self) -> bool {
        self.heartbeat_interval.is_some()
    }

    pub fn versions(&self) -> &[String] {
        &self.versions
    }

    pub fn integration_id(&self) -> Option<&str> {
        self.integration_id.as_deref()
    }

    pub fn has_resume_token(&self) -> bool {
        self.resume_token.is_some()
    }

    pub(crate) fn default_versions() -> Vec<String> {
        DDP_VERSIONS.iter().map(|v| v.to_string()).collect()
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("versions", &self.versions)
            .field("integration_id", &self.integration_id)
            .field("resume_token", &self.resume_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
