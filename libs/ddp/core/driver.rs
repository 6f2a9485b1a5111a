//! Connection driver
//!
//! One Tokio task per client owns everything with mutable state: the
//! transport link, the pending-operation registry, the subscription
//! registry, the heartbeat and the handshake/reopen timers. The facade
//! talks to it only through [`Command`]s, so registry mutation is
//! serialized by construction.
//!
//! ```text
//!  DdpClient ──Command──┐
//!                       v
//!  spawned helpers ──Internal──> ConnectionDriver ──TransportCommand──> transport
//!                       ^                         <──TransportEvent────
//!  heartbeat task ──────┘
//! ```
//!
//! Internal completions carry the transport generation they belong to.
//! Every connect or reopen attempt bumps the generation, so results that
//! arrive for an abandoned transport are ignored.

use crate::client::ClientEvent;
use crate::config::ClientConfig;
use crate::connection_state::{AtomicConnectionState, AtomicMetrics, ConnectionState};
use crate::heartbeat::{spawn_heartbeat, HeartbeatHandle, HeartbeatMonitor};
use crate::pending::{Expect, PendingReceiver, PendingRegistry};
use crate::protocol::*;
use crate::subscriptions::{SubscriptionRegistry, SubscriptionStatus};
use crate::traits::*;
use crossbeam_channel::Sender;
use parking_lot::RwLock;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

/// Observations published by the driver for the facade
#[derive(Debug)]
pub(crate) struct SharedState {
    pub(crate) state: AtomicConnectionState,
    pub(crate) metrics: AtomicMetrics,
    pub(crate) session: RwLock<Option<String>>,
    pub(crate) login: RwLock<Option<LoginResult>>,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicConnectionState::new(ConnectionState::Disconnected),
            metrics: AtomicMetrics::new(),
            session: RwLock::new(None),
            login: RwLock::new(None),
        }
    }
}

/// Requests from the facade
pub(crate) enum Command {
    Connect {
        timeout: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    Call {
        id: Option<String>,
        method: String,
        params: Vec<Value>,
        reply: oneshot::Sender<Result<(PendingReceiver, u64)>>,
    },
    LoginSucceeded {
        generation: u64,
        login: LoginResult,
    },
    ClearLogin {
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        name: String,
        params: Vec<Value>,
        sink: Option<Arc<dyn EventHandler>>,
        reply: oneshot::Sender<Result<(String, PendingReceiver)>>,
    },
    Unsubscribe {
        id: String,
        reply: oneshot::Sender<Option<PendingReceiver>>,
    },
    Attach {
        id: String,
        sink: Arc<dyn EventHandler>,
        reply: oneshot::Sender<bool>,
    },
    SubscriptionIds {
        reply: oneshot::Sender<Vec<String>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Completions from helper tasks, tagged with their transport generation
enum Internal {
    TransportOpened {
        generation: u64,
        result: Result<TransportLink>,
    },
    HeartbeatTick {
        generation: u64,
    },
    ResumeFinished {
        generation: u64,
        outcome: Result<Value>,
    },
}

pub(crate) struct ConnectionDriver {
    config: Arc<ClientConfig>,
    shared: Arc<SharedState>,
    events: Sender<ClientEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,

    /// Exclusively owned while open
    transport: Option<TransportLink>,
    generation: u64,
    pending: PendingRegistry,
    subscriptions: SubscriptionRegistry,
    heartbeat: Option<(HeartbeatMonitor, HeartbeatHandle)>,

    handshake_deadline: Option<Pin<Box<Sleep>>>,
    reopen_timer: Option<Pin<Box<Sleep>>>,
    /// Consecutive failed reopen attempts
    reopen_attempt: usize,
    /// The attempt in flight is a background reopen rather than a caller's connect
    reopening: bool,
    /// Set by an explicit disconnect; blocks the automatic reopen path
    shutdown: bool,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,

    login: Option<LoginResult>,
    seed_token: Option<String>,
}

impl ConnectionDriver {
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        shared: Arc<SharedState>,
        events: Sender<ClientEvent>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let seed_token = config.resume_token.clone();
        Self {
            config,
            shared,
            events,
            commands,
            internal_tx,
            internal_rx,
            transport: None,
            generation: 0,
            pending: PendingRegistry::new(),
            subscriptions: SubscriptionRegistry::new(),
            heartbeat: None,
            handshake_deadline: None,
            reopen_timer: None,
            reopen_attempt: 0,
            reopening: false,
            shutdown: false,
            connect_waiters: Vec::new(),
            login: None,
            seed_token,
        }
    }

    /// Main loop; exits once every command sender is gone
    pub(crate) async fn run(mut self) {
        debug!("Connection driver started for {}", self.config.url);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                event = next_transport_event(&mut self.transport) => self.handle_transport_event(event),
                _ = wait_for(&mut self.handshake_deadline) => self.on_handshake_timeout(),
                _ = wait_for(&mut self.reopen_timer) => self.on_reopen_timer(),
            }
        }

        self.shutdown = true;
        self.teardown_transport("client dropped");
        self.pending.reject_all("client dropped");
        self.set_state(ConnectionState::Disconnected);
        debug!("Connection driver exiting");
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { timeout, reply } => self.on_connect(timeout, reply),
            Command::Call {
                id,
                method,
                params,
                reply,
            } => {
                let outcome = self.start_call(id, &method, &params);
                let _ = reply.send(outcome.map(|rx| (rx, self.generation)));
            }
            Command::LoginSucceeded { generation, login } => self.on_login(generation, login),
            Command::ClearLogin { reply } => {
                self.clear_login();
                if self.state() == ConnectionState::Authenticated {
                    self.set_state(ConnectionState::Open);
                }
                let _ = reply.send(());
            }
            Command::Subscribe {
                name,
                params,
                sink,
                reply,
            } => {
                let _ = reply.send(self.start_subscribe(&name, params, sink));
            }
            Command::Unsubscribe { id, reply } => {
                let _ = reply.send(self.start_unsubscribe(&id));
            }
            Command::Attach { id, sink, reply } => {
                let _ = reply.send(self.subscriptions.attach(&id, sink));
            }
            Command::SubscriptionIds { reply } => {
                let _ = reply.send(self.subscriptions.handle_ids());
            }
            Command::Disconnect { reply } => {
                self.on_disconnect();
                let _ = reply.send(());
            }
        }
    }

    fn on_connect(&mut self, timeout: Duration, reply: oneshot::Sender<Result<()>>) {
        match self.state() {
            ConnectionState::Open | ConnectionState::Authenticated => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting => {
                self.connect_waiters.push(reply);
            }
            ConnectionState::Reopening => {
                // Caller does not want to wait for the backoff timer
                self.reopen_timer = None;
                self.connect_waiters.push(reply);
                self.begin_attempt(timeout);
            }
            ConnectionState::Disconnected => {
                self.shutdown = false;
                self.reopening = false;
                self.connect_waiters.push(reply);
                self.begin_attempt(timeout);
            }
        }
    }

    fn start_call(&mut self, id: Option<String>, method: &str, params: &[Value]) -> Result<PendingReceiver> {
        if !self.state().is_open() {
            return Err(DdpError::NotConnected);
        }
        let id = match id {
            Some(id) => id,
            None => self.pending.allocate_id(),
        };
        let frame = encode_method_call(&id, method, params)?;
        let rx = self.pending.register(&id, Expect::Result)?;
        debug!(id = %id, method, "Calling method");
        self.send_frame(frame);
        Ok(rx)
    }

    fn start_subscribe(
        &mut self,
        name: &str,
        params: Vec<Value>,
        sink: Option<Arc<dyn EventHandler>>,
    ) -> Result<(String, PendingReceiver)> {
        if !self.state().is_open() {
            return Err(DdpError::NotConnected);
        }
        let id = self.pending.allocate_id();
        let frame = encode_subscribe(&id, name, &params)?;
        let rx = self.pending.register(&id, Expect::Ready)?;
        self.subscriptions.insert(&id, name, params, sink);
        debug!(id = %id, name, "Subscribing");
        self.send_frame(frame);
        Ok((id, rx))
    }

    /// Remove a subscription and, if the server knows it, send `unsub`.
    /// Returns the receiver for the `nosub` acknowledgment when one is
    /// expected.
    fn start_unsubscribe(&mut self, handle_id: &str) -> Option<PendingReceiver> {
        let sub = match self.subscriptions.remove(handle_id) {
            Some(sub) => sub,
            None => {
                debug!(id = handle_id, "Unsubscribe of unknown subscription");
                return None;
            }
        };

        if !self.state().is_open() || sub.status() == SubscriptionStatus::Stale {
            return None;
        }

        let wire_id = sub.wire_id().to_string();
        if matches!(
            sub.status(),
            SubscriptionStatus::Pending | SubscriptionStatus::Replaying
        ) && self.pending.contains(&wire_id)
        {
            self.pending.reject(
                &wire_id,
                DdpError::Protocol {
                    code: "unsubscribed".into(),
                    reason: "unsubscribed before ready".into(),
                },
            );
        }

        let frame = match encode_unsubscribe(&wire_id) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode unsub frame: {}", e);
                return None;
            }
        };
        let rx = match self.pending.register(&wire_id, Expect::Nosub) {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Cannot track unsubscribe of {}: {}", wire_id, e);
                return None;
            }
        };
        debug!(id = handle_id, wire_id = %wire_id, "Unsubscribing");
        self.send_frame(frame);
        Some(rx)
    }

    fn on_login(&mut self, generation: u64, login: LoginResult) {
        info!(user_id = %login.user_id, "Logged in");
        self.store_login(login);

        if generation != self.generation || !self.state().is_open() {
            // Connection changed under the login; the stored token resumes on the next open
            return;
        }
        self.become_authenticated();
        self.replay_subscriptions();
    }

    fn on_disconnect(&mut self) {
        info!("Disconnect requested");
        self.shutdown = true;
        self.reopening = false;
        self.reopen_timer = None;
        self.reopen_attempt = 0;

        let was_open = self.state().is_open();
        self.teardown_transport("client disconnect");
        self.pending.reject_all("client disconnect");
        self.subscriptions.clear();
        self.settle_connect_waiters(|| Err(DdpError::ConnectionLost("disconnect requested".into())));
        self.set_state(ConnectionState::Disconnected);

        if was_open {
            self.emit(ClientEvent::Disconnected {
                reason: "client disconnect".into(),
            });
        }
    }

    // ---------------------------------------------------------------------
    // Connect / reopen lifecycle
    // ---------------------------------------------------------------------

    fn begin_attempt(&mut self, timeout: Duration) {
        self.generation += 1;
        let generation = self.generation;
        self.set_state(ConnectionState::Connecting);
        self.handshake_deadline = Some(Box::pin(tokio::time::sleep(timeout)));

        info!(
            generation,
            reopen = self.reopening,
            integration = self.config.integration_id.as_deref().unwrap_or("-"),
            "Connecting to {}",
            self.config.url
        );

        let connector = Arc::clone(&self.config.connector);
        let url = self.config.url.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = connector.open(&url).await;
            let _ = internal.send(Internal::TransportOpened { generation, result });
        });
    }

    fn on_transport_opened(&mut self, generation: u64, result: Result<TransportLink>) {
        if generation != self.generation || self.state() != ConnectionState::Connecting {
            if let Ok(link) = result {
                debug!(generation, "Discarding transport opened for an abandoned attempt");
                link.close(CLOSE_NORMAL, "abandoned");
            }
            return;
        }

        match result {
            Ok(link) => {
                self.transport = Some(link);
                match encode_handshake(&self.config.versions) {
                    Ok(frame) => {
                        debug!("Transport open, sending handshake");
                        self.send_frame(frame);
                    }
                    Err(e) => self.fail_attempt(e),
                }
            }
            Err(e) => {
                warn!("Failed to open transport: {}", e);
                self.fail_attempt(e);
            }
        }
    }

    fn on_handshake_accepted(&mut self, session: String) {
        self.handshake_deadline = None;
        self.reopen_attempt = 0;
        let was_reopen = self.reopening;
        self.reopening = false;

        info!(
            session = %session,
            reopen = was_reopen,
            integration = self.config.integration_id.as_deref().unwrap_or("-"),
            "Connected"
        );
        *self.shared.session.write() = Some(session.clone());
        self.set_state(ConnectionState::Open);
        self.start_heartbeat();
        self.settle_connect_waiters(|| Ok(()));
        self.emit(ClientEvent::Connected { session });

        match self.resume_token() {
            Some(token) => self.start_resume(token),
            None => self.replay_subscriptions(),
        }
    }

    fn on_handshake_rejected(&mut self, version: Option<String>) {
        warn!("Server rejected handshake, suggested version {:?}", version);
        self.fail_attempt(DdpError::ConnectionRejected { version });
    }

    fn on_handshake_timeout(&mut self) {
        self.handshake_deadline = None;
        if self.state() != ConnectionState::Connecting {
            return;
        }
        warn!("Handshake not acknowledged in time");
        // Late open or connected frames for this attempt must be ignored
        self.generation += 1;
        let window = self.config.connect_timeout;
        self.fail_attempt(DdpError::Timeout(format!(
            "no handshake acknowledgment from {} (window {:?})",
            self.config.url, window
        )));
    }

    /// A connect or reopen attempt failed before the handshake completed
    fn fail_attempt(&mut self, error: DdpError) {
        self.teardown_transport("connect attempt failed");
        let message = error.to_string();
        let mut first = Some(error);
        self.settle_connect_waiters(|| {
            Err(first
                .take()
                .unwrap_or_else(|| DdpError::Transport(message.clone())))
        });
        self.emit(ClientEvent::Error(message));

        if self.reopening && !self.shutdown {
            self.schedule_reopen();
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn on_transport_lost(&mut self, reason: String) {
        match self.state() {
            ConnectionState::Connecting => {
                self.fail_attempt(DdpError::Transport(reason));
            }
            ConnectionState::Open | ConnectionState::Authenticated => {
                warn!("Connection lost: {}", reason);
                self.teardown_transport(&reason);
                self.pending.reject_all(&reason);
                let dropped = self.subscriptions.on_connection_lost();
                if !dropped.is_empty() {
                    debug!(count = dropped.len(), "Dropped unacknowledged subscriptions");
                }
                self.emit(ClientEvent::Disconnected { reason });

                if self.shutdown {
                    self.set_state(ConnectionState::Disconnected);
                } else {
                    self.schedule_reopen();
                }
            }
            ConnectionState::Disconnected | ConnectionState::Reopening => {
                debug!("Ignoring transport loss in state {}: {}", self.state(), reason);
            }
        }
    }

    fn on_heartbeat_missed(&mut self) {
        let silence = self
            .heartbeat
            .as_ref()
            .map(|(monitor, _)| monitor.time_since_last_seen(Instant::now()))
            .unwrap_or_default();
        warn!("No traffic for {:?}, reopening connection", silence);
        self.on_transport_lost(format!("heartbeat missed after {:?} of silence", silence));
    }

    fn schedule_reopen(&mut self) {
        if self.reopen_timer.is_some() {
            debug!("Reopen already scheduled");
            return;
        }

        match self.config.reconnect_strategy.next_delay(self.reopen_attempt) {
            Some(delay) => {
                let attempt = self.reopen_attempt + 1;
                info!("Reopening in {:?} (attempt {})", delay, attempt);
                self.reopening = true;
                self.reopen_timer = Some(Box::pin(tokio::time::sleep(delay)));
                self.shared.metrics.increment_reopens();
                self.set_state(ConnectionState::Reopening);
                self.emit(ClientEvent::Reopening { attempt, delay });
            }
            None => {
                warn!("Reconnection strategy exhausted, staying disconnected");
                self.reopening = false;
                self.reopen_attempt = 0;
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn on_reopen_timer(&mut self) {
        self.reopen_timer = None;
        if self.shutdown || self.state() != ConnectionState::Reopening {
            return;
        }
        self.reopen_attempt += 1;
        self.reopening = true;
        self.begin_attempt(self.config.connect_timeout);
    }

    fn teardown_transport(&mut self, reason: &str) {
        if let Some(link) = self.transport.take() {
            link.close(CLOSE_NORMAL, reason);
        }
        self.heartbeat = None;
        self.handshake_deadline = None;
        *self.shared.session.write() = None;
    }

    // ---------------------------------------------------------------------
    // Authentication and replay
    // ---------------------------------------------------------------------

    fn resume_token(&self) -> Option<String> {
        self.login
            .as_ref()
            .map(|login| login.token.clone())
            .or_else(|| self.seed_token.clone())
    }

    fn start_resume(&mut self, token: String) {
        let generation = self.generation;
        let rx = Credentials::resume(token)
            .to_login_params()
            .and_then(|params| self.start_call(None, "login", &[params]));

        match rx {
            Ok(rx) => {
                debug!("Resuming session with stored token");
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let outcome = rx.await.unwrap_or(Err(DdpError::ChannelClosed));
                    let _ = internal.send(Internal::ResumeFinished { generation, outcome });
                });
            }
            Err(e) => {
                warn!("Cannot resume session: {}", e);
                self.clear_login();
                self.replay_subscriptions();
            }
        }
    }

    fn on_resume_finished(&mut self, generation: u64, outcome: Result<Value>) {
        if generation != self.generation || !self.state().is_open() {
            debug!(generation, "Ignoring resume result for a closed connection");
            return;
        }

        match outcome.and_then(|value| LoginResult::from_value(&value)) {
            Ok(login) => {
                info!(user_id = %login.user_id, "Session resumed");
                self.store_login(login);
                self.become_authenticated();
            }
            Err(e) => {
                warn!("Resume login failed: {}", e);
                self.clear_login();
                self.emit(ClientEvent::ResumeFailed(e.to_string()));
            }
        }
        self.replay_subscriptions();
    }

    fn become_authenticated(&mut self) {
        self.set_state(ConnectionState::Authenticated);
        if let Some(login) = &self.login {
            self.emit(ClientEvent::Authenticated {
                user_id: login.user_id.clone(),
            });
        }
    }

    fn store_login(&mut self, login: LoginResult) {
        *self.shared.login.write() = Some(login.clone());
        self.login = Some(login);
    }

    fn clear_login(&mut self) {
        self.login = None;
        self.seed_token = None;
        *self.shared.login.write() = None;
    }

    /// Re-issue every acknowledged subscription, in registration order,
    /// with its original name and params. Sinks stay attached.
    fn replay_subscriptions(&mut self) {
        let pending = &mut self.pending;
        let steps = self.subscriptions.plan_replay(|| pending.allocate_id());
        if steps.is_empty() {
            return;
        }

        for step in &steps {
            if let Some(stale) = &step.stale_wire_id {
                if self.pending.contains(stale) {
                    self.pending.reject(
                        stale,
                        DdpError::ConnectionLost("superseded by replay".into()),
                    );
                }
                match encode_unsubscribe(stale) {
                    Ok(frame) => {
                        self.send_frame(frame);
                    }
                    Err(e) => error!("Failed to encode unsub frame: {}", e),
                }
            }

            let frame = match encode_subscribe(&step.wire_id, &step.name, &step.params) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to encode replayed sub frame: {}", e);
                    continue;
                }
            };
            // Nobody awaits a replay; the ready frame promotes the subscription itself
            if let Err(e) = self.pending.register(&step.wire_id, Expect::Ready) {
                warn!("Cannot track replay of {}: {}", step.handle_id, e);
            }
            debug!(
                id = %step.handle_id,
                wire_id = %step.wire_id,
                name = %step.name,
                "Replaying subscription"
            );
            self.send_frame(frame);
        }
        info!("Replayed {} subscription(s)", steps.len());
    }

    // ---------------------------------------------------------------------
    // Heartbeat
    // ---------------------------------------------------------------------

    fn start_heartbeat(&mut self) {
        let Some(interval) = self.config.heartbeat_interval else {
            self.heartbeat = None;
            return;
        };
        let generation = self.generation;
        let internal = self.internal_tx.clone();
        let handle = spawn_heartbeat(interval, move || {
            internal.send(Internal::HeartbeatTick { generation }).is_ok()
        });
        // Replacing the tuple drops and aborts any previous heartbeat task
        self.heartbeat = Some((HeartbeatMonitor::new(interval), handle));
    }

    fn on_heartbeat_tick(&mut self, generation: u64) {
        if generation != self.generation || !self.state().is_open() {
            return;
        }
        let now = Instant::now();
        let alive = match &self.heartbeat {
            Some((monitor, _)) => monitor.is_alive_at(now),
            None => return,
        };
        if !alive {
            self.on_heartbeat_missed();
            return;
        }

        match encode_ping(None) {
            Ok(frame) => {
                debug!("Heartbeat tick, sending ping");
                self.send_frame(frame);
                if let Some((monitor, _)) = &mut self.heartbeat {
                    monitor.record_ping_at(now);
                }
            }
            Err(e) => error!("Failed to encode ping: {}", e),
        }
    }

    // ---------------------------------------------------------------------
    // Inbound traffic
    // ---------------------------------------------------------------------

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::TransportOpened { generation, result } => {
                self.on_transport_opened(generation, result)
            }
            Internal::HeartbeatTick { generation } => self.on_heartbeat_tick(generation),
            Internal::ResumeFinished { generation, outcome } => {
                self.on_resume_finished(generation, outcome)
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(text) => {
                self.shared.metrics.increment_received();
                if let Some((monitor, _)) = &mut self.heartbeat {
                    monitor.mark_alive();
                }
                self.dispatch(decode(&text));
            }
            TransportEvent::Error(e) => {
                self.on_transport_lost(format!("transport error: {}", e));
            }
            TransportEvent::Closed { code, reason } => {
                self.on_transport_lost(format!("transport closed (code {:?}): {}", code, reason));
            }
        }
    }

    fn dispatch(&mut self, envelope: Envelope) {
        debug!(kind = envelope.kind(), "Inbound frame");
        match envelope {
            Envelope::Connected { session } => {
                if self.state() == ConnectionState::Connecting && self.transport.is_some() {
                    self.on_handshake_accepted(session);
                } else {
                    warn!("Unexpected connected frame in state {}", self.state());
                }
            }
            Envelope::Failed { version } => {
                if self.state() == ConnectionState::Connecting {
                    self.on_handshake_rejected(version);
                }
            }
            Envelope::Result { id, result, error } => match self.pending.expectation(&id) {
                Some(Expect::Result) => {
                    self.pending.answer(&id, result, error);
                }
                Some(other) => warn!(id = %id, expected = ?other, "Result frame for a non-call id"),
                None => warn!(id = %id, "Result for unknown or already settled id, dropping"),
            },
            Envelope::Ready { subs } => {
                for wire_id in subs {
                    let handle_id = self.subscriptions.mark_ready(&wire_id);
                    if self.pending.expectation(&wire_id) == Some(Expect::Ready) {
                        let payload = handle_id.map(Value::String).unwrap_or(Value::Null);
                        self.pending.resolve(&wire_id, payload);
                    } else if handle_id.is_none() {
                        debug!(id = %wire_id, "Ready for unknown subscription");
                    }
                }
            }
            Envelope::Nosub { id, error } => self.on_nosub(id, error),
            Envelope::Data(frame) => {
                self.subscriptions.dispatch(&frame);
            }
            Envelope::Ping { id } => match encode_pong(id.as_deref()) {
                Ok(frame) => {
                    self.send_frame(frame);
                }
                Err(e) => error!("Failed to encode pong: {}", e),
            },
            Envelope::Pong { .. } => {
                if let Some((monitor, _)) = &self.heartbeat {
                    if let Some(latency) = monitor.time_since_last_ping(Instant::now()) {
                        debug!(latency_ms = latency.as_millis() as u64, "Pong received");
                    }
                }
            }
            Envelope::Error { reason, offending } => self.on_server_error(reason, offending),
            Envelope::Updated { .. } | Envelope::ServerId => {}
            Envelope::Unparseable { raw, reason } => {
                warn!("Dropping unparseable frame ({}): {}", reason, raw);
            }
        }
    }

    /// An `error` frame echoes the request it refuses; settle that request
    fn on_server_error(&mut self, reason: String, offending: Option<Value>) {
        let id = offending
            .as_ref()
            .and_then(|frame| frame.get("id"))
            .and_then(Value::as_str)
            .filter(|id| self.pending.contains(id))
            .map(str::to_string);

        let Some(id) = id else {
            warn!("Server reported protocol error: {} (offending: {:?})", reason, offending);
            return;
        };

        warn!(id = %id, "Server refused request: {}", reason);
        if self.pending.expectation(&id) == Some(Expect::Ready) {
            let status = self.subscriptions.get_by_wire(&id).map(|s| s.status());
            if status == Some(SubscriptionStatus::Replaying) {
                self.subscriptions.mark_stale(&id);
            } else {
                self.subscriptions.remove_by_wire(&id);
            }
        }
        self.pending.reject(
            &id,
            DdpError::Protocol {
                code: "error".into(),
                reason,
            },
        );
    }

    fn on_nosub(&mut self, id: String, error: Option<ErrorBody>) {
        match self.pending.expectation(&id) {
            // Unsubscribing something already gone is still a success
            Some(Expect::Nosub) => {
                self.pending.resolve(&id, Value::Null);
            }
            Some(Expect::Ready) => {
                let status = self.subscriptions.get_by_wire(&id).map(|s| s.status());
                match status {
                    Some(SubscriptionStatus::Replaying) => {
                        warn!(id = %id, "Replayed subscription refused: {:?}", error);
                        self.subscriptions.mark_stale(&id);
                    }
                    _ => {
                        self.subscriptions.remove_by_wire(&id);
                    }
                }
                let failure = error.map(ErrorBody::into_error).unwrap_or_else(|| DdpError::Protocol {
                    code: "nosub".into(),
                    reason: "subscription stopped before ready".into(),
                });
                self.pending.reject(&id, failure);
            }
            Some(Expect::Result) => warn!(id = %id, "Nosub frame for a method call id"),
            None => {
                if let Some(sub) = self.subscriptions.remove_by_wire(&id) {
                    warn!(
                        id = %sub.handle_id(),
                        name = %sub.name(),
                        "Server stopped subscription: {:?}",
                        error
                    );
                } else {
                    debug!(id = %id, "Nosub for unknown subscription");
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn send_frame(&mut self, frame: String) -> bool {
        match &self.transport {
            Some(link) if link.send(frame) => {
                self.shared.metrics.increment_sent();
                true
            }
            Some(_) => {
                // The transport task is gone; its Closed event is on the way
                debug!("Transport task gone, frame dropped");
                false
            }
            None => {
                debug!("No transport, frame dropped");
                false
            }
        }
    }

    fn settle_connect_waiters(&mut self, mut outcome: impl FnMut() -> Result<()>) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(outcome());
        }
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.shared.state.get();
        if previous != state {
            debug!("Connection state {} -> {}", previous, state);
            self.shared.state.set(state);
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_transport_event(transport: &mut Option<TransportLink>) -> TransportEvent {
    match transport {
        Some(link) => link.events.recv().await.unwrap_or_else(|| TransportEvent::Closed {
            code: None,
            reason: "transport task ended".into(),
        }),
        None => std::future::pending().await,
    }
}

async fn wait_for(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
