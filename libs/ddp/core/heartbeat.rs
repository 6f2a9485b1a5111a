//! Heartbeat and liveness tracking
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │  Heartbeat Task     │
//! │  (Tokio spawn)      │
//! │                     │
//! │  Every interval:    │
//! │  1. Wait for tick   │
//! │  2. on_tick() ──────┼──> Driver checks liveness, sends ping or reopens
//! │  3. Repeat          │
//! └─────────────────────┘
//! ```
//!
//! Any inbound frame counts as proof of life, not only `pong`. The
//! connection is alive while `now - last_seen <= 2 * interval`, so exactly
//! one missed beat is tolerated.
//!
//! The task is owned through [`HeartbeatHandle`]; dropping the handle
//! aborts it. The driver replaces the handle on every open and drops it on
//! every close, so ticks never stack up across reconnects.

use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// Staleness tracker for one open connection
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    last_seen: Instant,
    last_ping: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        Self::started_at(interval, Instant::now())
    }

    pub fn started_at(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_seen: now,
            last_ping: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record inbound traffic of any kind
    pub fn mark_alive(&mut self) {
        self.mark_alive_at(Instant::now());
    }

    pub fn mark_alive_at(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub fn record_ping_at(&mut self, now: Instant) {
        self.last_ping = Some(now);
    }

    /// Liveness tolerance: two heartbeat intervals
    pub fn tolerance(&self) -> Duration {
        self.interval.saturating_mul(2)
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive_at(Instant::now())
    }

    pub fn is_alive_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) <= self.tolerance()
    }

    pub fn time_since_last_seen(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    pub fn time_since_last_ping(&self, now: Instant) -> Option<Duration> {
        self.last_ping.map(|ping| now.saturating_duration_since(ping))
    }
}

/// Owner of a running heartbeat task; aborts the task on drop
#[derive(Debug)]
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn a heartbeat task calling `on_tick` once per interval
///
/// The first tick fires one full interval after spawning. The task exits
/// when `on_tick` returns false (the receiving side is gone) or when the
/// handle is dropped.
pub fn spawn_heartbeat<F>(interval: Duration, on_tick: F) -> HeartbeatHandle
where
    F: Fn() -> bool + Send + 'static,
{
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick
        ticker.tick().await;
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        debug!("Heartbeat task started with interval: {:?}", interval);

        loop {
            ticker.tick().await;
            if !on_tick() {
                debug!("Heartbeat receiver gone, shutting down heartbeat task");
                break;
            }
        }
    });

    HeartbeatHandle { task }
}
