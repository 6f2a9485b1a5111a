pub mod states;

use crate::client::DdpClient;
use crate::config::{
    ClientConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_REOPEN_DELAY,
};
use crate::traits::*;
use crate::websocket::WsConnector;
use states::*;
use std::sync::Arc;
use std::time::Duration;

/// Type-state builder for [`DdpClient`]
///
/// The endpoint must be given (`url` or `host`) before `build()` becomes
/// available. Everything else has a default:
///
/// | setting | default |
/// |---|---|
/// | connect timeout | 20 s |
/// | reconnect strategy | fixed 10 s, unlimited |
/// | heartbeat | 30 s |
/// | versions | `1`, `pre2`, `pre1` |
/// | connector | WebSocket |
pub struct ClientBuilder<U>
where
    U: UrlState,
{
    _state: TypeState<U>,
    url: Option<String>,
    connect_timeout: Duration,
    reconnect_strategy: Option<Arc<dyn ReconnectionStrategy>>,
    heartbeat_interval: Option<Duration>,
    versions: Vec<String>,
    integration_id: Option<String>,
    resume_token: Option<String>,
    connector: Option<Arc<dyn Connector>>,
}

impl ClientBuilder<NoUrl> {
    /// Create a new builder instance
    pub fn new() -> Self {
        Self {
            _state: TypeState::new(),
            url: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_strategy: None,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            versions: ClientConfig::default_versions(),
            integration_id: None,
            resume_token: None,
            connector: None,
        }
    }

    /// Full WebSocket endpoint, e.g. `wss://chat.example.com/websocket`
    pub fn url(self, url: impl Into<String>) -> ClientBuilder<HasUrl> {
        ClientBuilder {
            _state: TypeState::new(),
            url: Some(url.into()),
            connect_timeout: self.connect_timeout,
            reconnect_strategy: self.reconnect_strategy,
            heartbeat_interval: self.heartbeat_interval,
            versions: self.versions,
            integration_id: self.integration_id,
            resume_token: self.resume_token,
            connector: self.connector,
        }
    }

    /// Server host plus TLS flag, normalized with
    /// [`ClientConfig::websocket_url`]
    pub fn host(self, host: &str, use_tls: bool) -> ClientBuilder<HasUrl> {
        self.url(ClientConfig::websocket_url(host, use_tls))
    }
}

impl Default for ClientBuilder<NoUrl> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U> ClientBuilder<U>
where
    U: UrlState,
{
    /// Handshake window used by `connect()` and by background reopens
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn reconnect_strategy<S>(mut self, strategy: S) -> Self
    where
        S: ReconnectionStrategy + 'static,
    {
        self.reconnect_strategy = Some(Arc::new(strategy));
        self
    }

    /// Fixed reopen delay, the common case
    pub fn reopen_delay(self, delay: Duration) -> Self {
        self.reconnect_strategy(FixedDelay::new(delay, None))
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn no_heartbeat(mut self) -> Self {
        self.heartbeat_interval = None;
        self
    }

    pub fn versions<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.versions = versions.into_iter().map(Into::into).collect();
        self
    }

    pub fn integration_id(mut self, id: impl Into<String>) -> Self {
        self.integration_id = Some(id.into());
        self
    }

    /// Resume an earlier session as soon as the first handshake completes
    pub fn resume_token(mut self, token: impl Into<String>) -> Self {
        self.resume_token = Some(token.into());
        self
    }

    /// Replace the WebSocket connector, e.g. with an in-memory transport
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }
}

impl ClientBuilder<HasUrl> {
    /// Validate the configuration and spawn the connection driver
    ///
    /// Must be called from within a Tokio runtime. The client starts
    /// disconnected; call [`DdpClient::connect`] to open the connection.
    pub fn build(self) -> Result<DdpClient> {
        let url = self
            .url
            .filter(|url| !url.is_empty())
            .ok_or_else(|| DdpError::Configuration("url must not be empty".into()))?;

        if self.versions.is_empty() {
            return Err(DdpError::Configuration(
                "at least one protocol version is required".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(DdpError::Configuration("connect timeout must be positive".into()));
        }
        if matches!(self.heartbeat_interval, Some(interval) if interval.is_zero()) {
            return Err(DdpError::Configuration(
                "heartbeat interval must be positive".into(),
            ));
        }

        let config = ClientConfig {
            url,
            connect_timeout: self.connect_timeout,
            reconnect_strategy: self
                .reconnect_strategy
                .unwrap_or_else(|| Arc::new(FixedDelay::new(DEFAULT_REOPEN_DELAY, None))),
            heartbeat_interval: self.heartbeat_interval,
            versions: self.versions,
            integration_id: self.integration_id,
            resume_token: self.resume_token,
            connector: self.connector.unwrap_or_else(|| Arc::new(WsConnector::new())),
        };

        DdpClient::new(config)
    }
}
