//! Subscription registry
//!
//! Tracks every server-push feed the caller asked for, in registration
//! order, so that feeds can be torn down one by one or replayed en masse
//! after a reconnect.
//!
//! Each subscription has two ids:
//! - the **handle id**, the id of its first `sub` frame, which the caller
//!   keeps for its whole lifetime;
//! - the **wire id**, the id of the most recent `sub` frame. Replays
//!   allocate fresh wire ids so a late `nosub`/`ready` for an old frame can
//!   never be confused with the current one.

use crate::protocol::{DataFrame, PushEvent};
use crate::sink::{EventHandler, SinkDebug};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// First subscribe sent, caller still waiting for `ready`
    Pending,
    /// Acknowledged on the current session
    Ready,
    /// Re-subscribe sent after reconnect or login, waiting for `ready`
    Replaying,
    /// Acknowledged on an earlier session, waiting for replay
    Stale,
}

pub struct Subscription {
    handle_id: String,
    wire_id: String,
    name: String,
    params: Vec<Value>,
    sinks: Vec<Arc<dyn EventHandler>>,
    status: SubscriptionStatus,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handle_id", &self.handle_id)
            .field("wire_id", &self.wire_id)
            .field("name", &self.name)
            .field("params", &self.params)
            .field("sinks", &SinkDebug(&self.sinks))
            .field("status", &self.status)
            .finish()
    }
}

impl Subscription {
    pub fn handle_id(&self) -> &str {
        &self.handle_id
    }

    pub fn wire_id(&self) -> &str {
        &self.wire_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }

    /// Streamer feeds scope events by their first string parameter
    fn event_scope(&self) -> Option<&str> {
        self.params.first().and_then(Value::as_str)
    }

    fn matches(&self, frame: &DataFrame) -> bool {
        match frame.collection.as_deref() {
            Some(collection) => {
                if collection != self.name {
                    return false;
                }
                match (frame.event_name(), self.event_scope()) {
                    (Some(event), Some(scope)) => event == scope,
                    _ => true,
                }
            }
            None => match frame.id.as_deref() {
                Some(id) => id == self.wire_id || id == self.handle_id,
                None => false,
            },
        }
    }
}

/// One re-subscribe the driver must put on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayStep {
    pub handle_id: String,
    /// Wire id still live on this session, to be unsubscribed first
    pub stale_wire_id: Option<String>,
    pub wire_id: String,
    pub name: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Track a new subscription whose first `sub` frame uses `id`
    pub fn insert(
        &mut self,
        id: &str,
        name: &str,
        params: Vec<Value>,
        sink: Option<Arc<dyn EventHandler>>,
    ) {
        self.entries.push(Subscription {
            handle_id: id.to_string(),
            wire_id: id.to_string(),
            name: name.to_string(),
            params,
            sinks: sink.into_iter().collect(),
            status: SubscriptionStatus::Pending,
        });
    }

    pub fn get(&self, handle_id: &str) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.handle_id == handle_id)
    }

    pub fn get_by_wire(&self, wire_id: &str) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.wire_id == wire_id)
    }

    /// Handle ids in registration order
    pub fn handle_ids(&self) -> Vec<String> {
        self.entries.iter().map(|s| s.handle_id.clone()).collect()
    }

    pub fn attach(&mut self, handle_id: &str, sink: Arc<dyn EventHandler>) -> bool {
        match self.entries.iter_mut().find(|s| s.handle_id == handle_id) {
            Some(sub) => {
                sub.sinks.push(sink);
                true
            }
            None => false,
        }
    }

    /// Promote the subscription acknowledged by a `ready` for `wire_id`.
    /// Returns its handle id.
    pub fn mark_ready(&mut self, wire_id: &str) -> Option<String> {
        let sub = self.entries.iter_mut().find(|s| s.wire_id == wire_id)?;
        sub.status = SubscriptionStatus::Ready;
        Some(sub.handle_id.clone())
    }

    /// Server refused a replayed subscribe. Keep the subscription, sinks
    /// included, so the next replay retries it.
    pub fn mark_stale(&mut self, wire_id: &str) -> bool {
        match self.entries.iter_mut().find(|s| s.wire_id == wire_id) {
            Some(sub) => {
                sub.status = SubscriptionStatus::Stale;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, handle_id: &str) -> Option<Subscription> {
        let index = self.entries.iter().position(|s| s.handle_id == handle_id)?;
        Some(self.entries.remove(index))
    }

    pub fn remove_by_wire(&mut self, wire_id: &str) -> Option<Subscription> {
        let index = self.entries.iter().position(|s| s.wire_id == wire_id)?;
        Some(self.entries.remove(index))
    }

    /// Drop everything, e.g. on explicit disconnect
    pub fn clear(&mut self) -> Vec<Subscription> {
        std::mem::take(&mut self.entries)
    }

    /// Transport is gone. Subscriptions that were never acknowledged are
    /// dropped (their callers receive the connection-lost error); every
    /// other one is kept, name and params intact, for replay.
    pub fn on_connection_lost(&mut self) -> Vec<Subscription> {
        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|s| s.status == SubscriptionStatus::Pending);
        self.entries = kept;
        for sub in &mut self.entries {
            sub.status = SubscriptionStatus::Stale;
        }
        dropped
    }

    /// Plan a re-subscribe of every acknowledged subscription, in
    /// registration order, assigning fresh wire ids from `allocate`.
    /// Subscriptions still waiting for their first `ready` are skipped.
    pub fn plan_replay(&mut self, mut allocate: impl FnMut() -> String) -> Vec<ReplayStep> {
        let mut steps = Vec::new();
        for sub in &mut self.entries {
            if sub.status == SubscriptionStatus::Pending {
                continue;
            }
            let stale_wire_id = match sub.status {
                SubscriptionStatus::Ready | SubscriptionStatus::Replaying => Some(sub.wire_id.clone()),
                _ => None,
            };
            sub.wire_id = allocate();
            sub.status = SubscriptionStatus::Replaying;
            steps.push(ReplayStep {
                handle_id: sub.handle_id.clone(),
                stale_wire_id,
                wire_id: sub.wire_id.clone(),
                name: sub.name.clone(),
                params: sub.params.clone(),
            });
        }
        steps
    }

    /// Invoke the sinks of every subscription matching a data push.
    /// Returns the number of subscriptions matched.
    pub fn dispatch(&self, frame: &DataFrame) -> usize {
        let mut matched = 0;
        for sub in self.entries.iter().filter(|s| s.matches(frame)) {
            matched += 1;
            let event = PushEvent::from_frame(&sub.handle_id, frame);
            for sink in &sub.sinks {
                sink.handle(&event);
            }
        }
        if matched == 0 {
            debug!(
                collection = ?frame.collection,
                id = ?frame.id,
                "Push event matched no subscription"
            );
        }
        matched
    }
}
