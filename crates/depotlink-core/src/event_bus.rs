//! Event Bus - fan-out of session events
//!
//! ```text
//!  ConnectionSlot ──┐                      ┌── host status bar
//!  ConnectionGate ──┼──► broadcast ───────►├── notification panel
//!  CriticalErrorQueue┘                      └── tests
//! ```
//!
//! Emitting never blocks and never fails: with nobody subscribed the event
//! is simply dropped.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::SessionEvent;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Cloneable handle for components that emit events
    pub fn sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
        }
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct EventSender {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventSender {
    /// Emit an event, returning how many receivers got it
    pub fn emit(&self, event: SessionEvent) -> usize {
        let type_name = event.type_name();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(
                    event_type = type_name,
                    receivers = count,
                    "[EventBus] Emitted event"
                );
                count
            }
            Err(_) => {
                debug!(event_type = type_name, "[EventBus] No receivers for event");
                0
            }
        }
    }

    /// A sender wired to nothing, for components built outside a manager
    pub fn detached() -> Self {
        EventBus::new().sender()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<SessionEvent>,
}

impl EventReceiver {
    /// Next event, or `None` once every sender is gone.
    ///
    /// A lagging receiver skips what it missed and keeps going.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        skipped_events = skipped,
                        "[EventBus] Receiver lagged, skipped {} events", skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("[EventBus] Channel closed");
                    return None;
                }
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped_events = skipped, "[EventBus] Receiver lagged on try_recv");
                }
                Err(_) => return None,
            }
        }
    }
}
