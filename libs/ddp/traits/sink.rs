//! Event sinks for server-push subscriptions
//!
//! Sinks are invoked on the connection driver task for every push event
//! matched to their subscription. They must not block: hand heavy work
//! to another thread, for example through the crossbeam `Sender` impl.

use crate::protocol::PushEvent;
use std::fmt::Debug;

/// Receives push events for one subscription
///
/// # Example
///
/// ```ignore
/// let (tx, rx) = crossbeam_channel::unbounded();
/// client.subscribe("stream-room-messages", vec![json!("GENERAL")], Some(Arc::new(tx))).await?;
///
/// std::thread::spawn(move || {
///     while let Ok(event) = rx.recv() {
///         println!("{:?}", event.args);
///     }
/// });
/// ```
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: &PushEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&PushEvent) + Send + Sync + 'static,
{
    fn handle(&self, event: &PushEvent) {
        self(event)
    }
}

impl EventHandler for crossbeam_channel::Sender<PushEvent> {
    fn handle(&self, event: &PushEvent) {
        // Receiver dropped means the consumer is gone; nothing to do
        let _ = self.send(event.clone());
    }
}

/// Wrapper so sink lists can be debug-printed
pub(crate) struct SinkDebug<'a>(pub &'a [std::sync::Arc<dyn EventHandler>]);

impl Debug for SinkDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} sink(s)", self.0.len())
    }
}
