use crate::builder::{states::NoUrl, ClientBuilder};
use crate::config::ClientConfig;
use crate::connection_state::ConnectionState;
use crate::driver::{Command, ConnectionDriver, SharedState};
use crate::protocol::{Credentials, LoginResult};
use crate::traits::*;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Lifecycle notifications published by the connection driver
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Handshake accepted
    Connected { session: String },
    /// Login or session resume succeeded
    Authenticated { user_id: String },
    /// Transport lost or closed
    Disconnected { reason: String },
    /// Background reopen scheduled
    Reopening { attempt: usize, delay: Duration },
    /// Stored resume token was refused after a reopen
    ResumeFailed(String),
    /// Connect attempt failed
    Error(String),
}

/// Client metrics snapshot
#[derive(Debug, Clone)]
pub struct Metrics {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub reopen_count: u64,
    pub connection_state: ConnectionState,
}

/// Persistent-connection protocol client
///
/// Cheap facade over a connection driver task that owns the transport and
/// every registry. All operations are async and settle exactly once:
/// with the server's answer, or with [`DdpError::ConnectionLost`] when the
/// transport goes away first.
///
/// Lifecycle [`ClientEvent`]s queue on an unbounded channel. Callers that
/// never drain it with [`try_recv_event`](Self::try_recv_event) or
/// [`recv_event_timeout`](Self::recv_event_timeout) keep every event, a
/// few per reopen, for the life of the client.
///
/// Dropping the client stops the driver and closes the transport.
pub struct DdpClient {
    config: Arc<ClientConfig>,
    shared: Arc<SharedState>,
    commands: mpsc::UnboundedSender<Command>,
    event_rx: Receiver<ClientEvent>,
    task_handle: tokio::task::JoinHandle<()>,
}

impl DdpClient {
    pub fn builder() -> ClientBuilder<NoUrl> {
        ClientBuilder::new()
    }

    /// Spawn the connection driver. Called by the builder's `build()`.
    pub(crate) fn new(config: ClientConfig) -> Result<Self> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(DdpError::Configuration(
                "DdpClient must be built inside a Tokio runtime".into(),
            ));
        }

        let config = Arc::new(config);
        let shared = Arc::new(SharedState::new());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = unbounded();

        let driver = ConnectionDriver::new(
            Arc::clone(&config),
            Arc::clone(&shared),
            event_tx,
            command_rx,
        );
        let task_handle = tokio::spawn(driver.run());

        Ok(Self {
            config,
            shared,
            commands: command_tx,
            event_rx,
            task_handle,
        })
    }

    /// Open the connection using the configured handshake window.
    ///
    /// No-op when already open. Concurrent callers share one attempt.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with_timeout(self.config.connect_timeout).await
    }

    /// Open the connection, failing with [`DdpError::Timeout`] if the
    /// handshake is not acknowledged within `timeout`.
    ///
    /// A timed-out connect does not enter the automatic reopen loop.
    pub async fn connect_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.request(|reply| Command::Connect { timeout, reply }).await?
    }

    /// Invoke a remote method and wait for its result
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.call_tracked(None, method, params).await.map(|(value, _)| value)
    }

    /// Invoke a remote method under a caller-chosen correlation id.
    ///
    /// Fails with [`DdpError::DuplicateId`] while `id` is still pending.
    pub async fn call_with_id(&self, id: &str, method: &str, params: Vec<Value>) -> Result<Value> {
        self.call_tracked(Some(id.to_string()), method, params)
            .await
            .map(|(value, _)| value)
    }

    async fn call_tracked(
        &self,
        id: Option<String>,
        method: &str,
        params: Vec<Value>,
    ) -> Result<(Value, u64)> {
        let method = method.to_string();
        let (receiver, generation) = self
            .request(|reply| Command::Call {
                id,
                method,
                params,
                reply,
            })
            .await??;
        let value = receiver.await.map_err(|_| DdpError::ChannelClosed)??;
        Ok((value, generation))
    }

    /// Authenticate the session.
    ///
    /// Plain passwords are digested before they leave the process. On
    /// success the resume token is kept for transparent reconnects and
    /// every tracked subscription is replayed under the new identity.
    pub async fn login(&self, credentials: Credentials) -> Result<LoginResult> {
        let params = credentials.to_login_params()?;
        let (value, generation) = self.call_tracked(None, "login", vec![params]).await?;
        let login = LoginResult::from_value(&value)?;

        if login.is_expired(chrono::Utc::now()) {
            warn!(user_id = %login.user_id, "Server issued an already expired token");
        }

        self.commands
            .send(Command::LoginSucceeded {
                generation,
                login: login.clone(),
            })
            .map_err(|_| DdpError::ChannelClosed)?;
        Ok(login)
    }

    /// Forget the resume token, drop every subscription and end the
    /// server-side session
    pub async fn logout(&self) -> Result<()> {
        self.request(|reply| Command::ClearLogin { reply }).await?;
        self.unsubscribe_all_bounded().await;

        if self.is_connected() {
            self.call("logout", Vec::new()).await?;
        }
        info!("Logged out");
        Ok(())
    }

    /// Subscribe to a server-push feed and wait for the server's `ready`.
    ///
    /// `sink` is attached before the subscribe frame is sent, so no event
    /// can slip in between acknowledgment and attachment. It stays
    /// attached across reconnects.
    pub async fn subscribe(
        &self,
        name: &str,
        params: Vec<Value>,
        sink: Option<Arc<dyn EventHandler>>,
    ) -> Result<SubscriptionHandle> {
        let name = name.to_string();
        let (id, receiver) = self
            .request(|reply| Command::Subscribe {
                name: name.clone(),
                params,
                sink,
                reply,
            })
            .await??;

        receiver.await.map_err(|_| DdpError::ChannelClosed)??;
        debug!(id = %id, name = %name, "Subscription ready");

        Ok(SubscriptionHandle {
            id,
            name,
            commands: self.commands.clone(),
        })
    }

    /// Attach another sink to a tracked subscription.
    ///
    /// Returns false if `id` is not tracked.
    pub async fn on_event(&self, id: &str, sink: Arc<dyn EventHandler>) -> Result<bool> {
        let id = id.to_string();
        self.request(|reply| Command::Attach { id, sink, reply }).await
    }

    /// Stop a subscription.
    ///
    /// Succeeds when the server acknowledges, when it reports the
    /// subscription already gone, and when the connection drops first.
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        unsubscribe_via(&self.commands, id).await
    }

    /// Stop every tracked subscription in parallel. Never fails.
    pub async fn unsubscribe_all(&self) {
        let ids = match self.request(|reply| Command::SubscriptionIds { reply }).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Cannot list subscriptions: {}", e);
                return;
            }
        };
        if ids.is_empty() {
            return;
        }

        let outcomes = join_all(ids.iter().map(|id| self.unsubscribe(id))).await;
        for (id, outcome) in ids.iter().zip(outcomes) {
            if let Err(e) = outcome {
                warn!(id = %id, "Unsubscribe failed: {}", e);
            }
        }
    }

    /// Clean shutdown: unsubscribe everything, cancel any pending reopen
    /// and close the transport. Does not trigger an automatic reopen.
    ///
    /// Unsubscribe acks are awaited for at most the connect timeout; a
    /// server that never answers does not keep the transport open.
    pub async fn disconnect(&self) -> Result<()> {
        self.unsubscribe_all_bounded().await;
        self.request(|reply| Command::Disconnect { reply }).await
    }

    async fn unsubscribe_all_bounded(&self) {
        let window = self.config.connect_timeout;
        if tokio::time::timeout(window, self.unsubscribe_all()).await.is_err() {
            warn!("Unsubscribe acks not received within {:?}, continuing", window);
        }
    }

    /// Get current connection state
    #[inline]
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Check if the handshake has completed on a live transport
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.shared.state.is_open()
    }

    /// Server session id, while open
    pub fn session_id(&self) -> Option<String> {
        self.shared.session.read().clone()
    }

    /// Identity from the last successful login or resume
    pub fn login_result(&self) -> Option<LoginResult> {
        self.shared.login.read().clone()
    }

    pub fn metrics(&self) -> Metrics {
        let metrics = &self.shared.metrics;
        Metrics {
            frames_sent: metrics.frames_sent(),
            frames_received: metrics.frames_received(),
            reopen_count: metrics.reopen_count(),
            connection_state: self.shared.state.get(),
        }
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv_event(&self) -> Option<ClientEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Receive an event, blocking the current thread for at most `timeout`
    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<ClientEvent> {
        match self.event_rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        request_via(&self.commands, make).await
    }
}

impl Drop for DdpClient {
    fn drop(&mut self) {
        self.task_handle.abort();
    }
}

impl std::fmt::Debug for DdpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DdpClient")
            .field("url", &self.config.url)
            .field("state", &self.shared.state.get())
            .finish()
    }
}

/// Caller's handle on one subscription
///
/// The id is stable for the subscription's whole lifetime, including
/// replays after reconnect.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: String,
    name: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn unsubscribe(self) -> Result<()> {
        unsubscribe_via(&self.commands, &self.id).await
    }
}

async fn request_via<T>(
    commands: &mpsc::UnboundedSender<Command>,
    make: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T> {
    let (reply, response) = oneshot::channel();
    commands.send(make(reply)).map_err(|_| DdpError::ChannelClosed)?;
    response.await.map_err(|_| DdpError::ChannelClosed)
}

async fn unsubscribe_via(commands: &mpsc::UnboundedSender<Command>, id: &str) -> Result<()> {
    let id = id.to_string();
    let receiver = request_via(commands, |reply| Command::Unsubscribe {
        id: id.clone(),
        reply,
    })
    .await?;

    if let Some(receiver) = receiver {
        match receiver.await {
            Ok(Ok(_)) => debug!(id = %id, "Unsubscribed"),
            // Torn down along with the connection
            Ok(Err(e)) => debug!(id = %id, "Unsubscribe settled by {}", e),
            Err(_) => debug!(id = %id, "Driver stopped before unsubscribe ack"),
        }
    }
    Ok(())
}
