//! Pending-operation registry
//!
//! Correlates response frames with the requests that produced them. Every
//! entry owns a oneshot sender, so each operation settles at most once:
//! by a matching frame, or by `reject_all` when the transport goes away.

use crate::error::{DdpError, Result};
use crate::protocol::ErrorBody;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Receiving half handed back to whoever awaits the response
pub type PendingReceiver = oneshot::Receiver<Result<Value>>;

/// Which frame kind settles an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// `result` answering a method call
    Result,
    /// `ready` acknowledging a subscribe
    Ready,
    /// `nosub` acknowledging an unsubscribe
    Nosub,
}

#[derive(Debug)]
struct PendingOperation {
    expect: Expect,
    waiter: oneshot::Sender<Result<Value>>,
    registered_at: Instant,
}

impl PendingOperation {
    fn settle(self, id: &str, outcome: Result<Value>) {
        debug!(
            id,
            expect = ?self.expect,
            elapsed_ms = self.registered_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Settling pending operation"
        );
        // The awaiting side may have been dropped; that is not an error here
        let _ = self.waiter.send(outcome);
    }
}

/// Outstanding requests keyed by correlation id
#[derive(Debug, Default)]
pub struct PendingRegistry {
    entries: HashMap<String, PendingOperation>,
    last_id: u64,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next auto-generated correlation id. Monotonic; skips ids a caller
    /// registered by hand that are still pending.
    pub fn allocate_id(&mut self) -> String {
        loop {
            self.last_id += 1;
            let id = self.last_id.to_string();
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register an entry. Fails if the id is still pending.
    pub fn register(&mut self, id: &str, expect: Expect) -> Result<PendingReceiver> {
        if self.entries.contains_key(id) {
            return Err(DdpError::DuplicateId(id.to_string()));
        }
        let (waiter, receiver) = oneshot::channel();
        self.entries.insert(
            id.to_string(),
            PendingOperation {
                expect,
                waiter,
                registered_at: Instant::now(),
            },
        );
        Ok(receiver)
    }

    pub fn expectation(&self, id: &str) -> Option<Expect> {
        self.entries.get(id).map(|op| op.expect)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and fulfil an entry. Unknown ids are logged and ignored.
    pub fn resolve(&mut self, id: &str, payload: Value) -> bool {
        self.settle(id, Ok(payload))
    }

    /// Remove and reject an entry. Unknown ids are logged and ignored.
    pub fn reject(&mut self, id: &str, error: DdpError) -> bool {
        self.settle(id, Err(error))
    }

    /// Settle from a response frame carrying an optional result and an
    /// optional error body. The error wins when both are present.
    pub fn answer(&mut self, id: &str, result: Option<Value>, error: Option<ErrorBody>) -> bool {
        match error {
            Some(body) => self.reject(id, body.into_error()),
            None => self.resolve(id, result.unwrap_or(Value::Null)),
        }
    }

    fn settle(&mut self, id: &str, outcome: Result<Value>) -> bool {
        match self.entries.remove(id) {
            Some(op) => {
                op.settle(id, outcome);
                true
            }
            None => {
                warn!(id, "Response for unknown or already settled id, dropping");
                false
            }
        }
    }

    /// Flush every entry after a transport loss.
    ///
    /// Calls and subscribes are rejected with `ConnectionLost`. Pending
    /// unsubscribes resolve successfully: the server drops the session's
    /// subscriptions along with the connection.
    pub fn reject_all(&mut self, reason: &str) -> usize {
        let count = self.entries.len();
        for (id, op) in self.entries.drain() {
            let outcome = match op.expect {
                Expect::Nosub => Ok(Value::Null),
                Expect::Result | Expect::Ready => Err(DdpError::ConnectionLost(reason.to_string())),
            };
            op.settle(&id, outcome);
        }
        if count > 0 {
            debug!(count, reason, "Flushed pending operations");
        }
        count
    }
}
