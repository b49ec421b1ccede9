//! Transport event fan-out to external listeners

use audional_core::TransportEvent;
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

/// Publish/subscribe channel for transport start and stop
#[derive(Debug, Default)]
pub struct TransportBus {
    subscribers: Vec<Sender<TransportEvent>>,
}

impl TransportBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<TransportEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, dropping the ones whose
    /// receiver is gone. Returns how many received it.
    pub fn broadcast(&mut self, event: TransportEvent) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|tx| tx.send(event).is_ok());
        let pruned = before - self.subscribers.len();
        if pruned > 0 {
            debug!(pruned, event = event.name(), "Pruned closed transport subscribers");
        }
        self.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
