//! Connection status state machine.
//!
//! ```text
//! disconnected ──► connecting ──► connected ◄──► syncing
//!                      │              │  ▲          │
//!                      ▼              ▼  │          ▼
//!                   error / offline ◄────┴──────────┘
//! ```
//! Any state may return to `disconnected` (teardown).

use slalom_core::ConnectionStatus;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::signal::{SubscriberRegistry, Subscription};

#[derive(Default)]
pub struct StatusTracker {
    status: Mutex<ConnectionStatus>,
    subscribers: SubscriberRegistry<ConnectionStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> ConnectionStatus {
        self.status.lock().map(|s| *s).unwrap_or_default()
    }

    /// Moves to `next` if the transition is legal. Subscribers are notified
    /// only on an actual change.
    pub fn transition(&self, next: ConnectionStatus) -> bool {
        let previous = {
            let Ok(mut status) = self.status.lock() else {
                return false;
            };
            let previous = *status;
            if previous == next {
                return false;
            }
            if !previous.can_transition_to(next) {
                debug!(from = %previous, to = %next, "Ignoring illegal status transition");
                return false;
            }
            *status = next;
            previous
        };

        if next == ConnectionStatus::Error || next == ConnectionStatus::Offline {
            info!(from = %previous, to = %next, "Sync status changed");
        } else {
            debug!(from = %previous, to = %next, "Sync status changed");
        }
        self.subscribers.emit(&next);
        true
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(move |status| handler(*status))
    }
}
