//! # Cross-Tab Broadcast
//!
//! Sibling sessions of the same installation share new entries and faults
//! without waiting for the next cloud poll. Best effort: nothing here is a
//! durability guarantee, the cloud sync is.
//!
//! ## Channel Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           BroadcastHub                                  │
//! │                                                                         │
//! │   "slalom-race-r1" ──► tokio::broadcast<String> ──┬──► tab A listener   │
//! │                                                   ├──► tab B listener   │
//! │                                                   └──► tab C listener   │
//! │   "slalom-race-r2" ──► tokio::broadcast<String> ──► ...                 │
//! │                                                                         │
//! │   Wire format: {type, data, deviceId?} as JSON text                     │
//! │   Listener drops messages whose deviceId is the local device            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use futures_util::future::BoxFuture;
use slalom_core::{
    channel_name, BroadcastMessage, BroadcastPayload, Entry, FaultEntry, PresenceInfo,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::signal::{SubscriberRegistry, Subscription};

const CHANNEL_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Named channels shared by every session in the process.
#[derive(Default)]
pub struct BroadcastHub {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the sender of the named channel, creating it on first use.
    pub fn channel(&self, name: &str) -> broadcast::Sender<String> {
        let mut channels = lock(&self.channels);
        prune(&mut channels);
        channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Drops the named channel once nobody listens on it.
    pub fn release(&self, name: &str) {
        let mut channels = lock(&self.channels);
        if channels.get(name).is_some_and(|tx| tx.receiver_count() == 0) {
            channels.remove(name);
        }
    }

    /// Channels that still have a listener.
    pub fn channel_count(&self) -> usize {
        let mut channels = lock(&self.channels);
        prune(&mut channels);
        channels.len()
    }
}

// Listeners are aborted asynchronously, so a released channel can still
// count a receiver; those are collected on the next lookup.
fn prune(channels: &mut HashMap<String, broadcast::Sender<String>>) {
    channels.retain(|_, tx| tx.receiver_count() > 0);
}

/// Async handler for messages from other devices.
pub type InboundHandler = Arc<dyn Fn(BroadcastMessage) -> BoxFuture<'static, ()> + Send + Sync>;

struct OpenChannel {
    name: String,
    tx: broadcast::Sender<String>,
    listener: JoinHandle<()>,
}

pub struct BroadcastManager {
    hub: Arc<BroadcastHub>,
    device_id: String,
    device_name: String,
    channel: Mutex<Option<OpenChannel>>,
    inbound: Arc<Mutex<Option<InboundHandler>>>,
    subscribers: SubscriberRegistry<BroadcastMessage>,
}

impl BroadcastManager {
    pub fn new(
        hub: Arc<BroadcastHub>,
        device_id: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        BroadcastManager {
            hub,
            device_id: device_id.into(),
            device_name: device_name.into(),
            channel: Mutex::new(None),
            inbound: Arc::new(Mutex::new(None)),
            subscribers: SubscriberRegistry::new(),
        }
    }

    /// Installs the handler awaited for each foreign message, in order.
    pub fn set_inbound(&self, handler: InboundHandler) {
        *lock(&self.inbound) = Some(handler);
    }

    /// Observers notified after the inbound handler ran.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&BroadcastMessage) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(handler)
    }

    /// Opens the channel of `race_id`, closing any previous one first.
    pub fn initialize(&self, race_id: &str) {
        self.cleanup();

        let name = channel_name(race_id);
        let tx = self.hub.channel(&name);
        let rx = tx.subscribe();
        let listener = tokio::spawn(listen(
            rx,
            name.clone(),
            self.device_id.clone(),
            Arc::clone(&self.inbound),
            self.subscribers.clone(),
        ));

        debug!(channel = %name, "Broadcast channel opened");
        *lock(&self.channel) = Some(OpenChannel { name, tx, listener });
    }

    pub fn broadcast_entry(&self, entry: &Entry) {
        self.post(BroadcastPayload::Entry(entry.clone()));
    }

    pub fn broadcast_fault(&self, fault: &FaultEntry) {
        self.post(BroadcastPayload::Fault(fault.clone()));
    }

    pub fn broadcast_fault_deletion(&self, fault_id: &str) {
        self.post(BroadcastPayload::FaultDeleted {
            fault_id: fault_id.to_string(),
        });
    }

    pub fn broadcast_presence(&self) {
        self.post(BroadcastPayload::Presence(PresenceInfo {
            device_name: self.device_name.clone(),
            last_seen: chrono::Utc::now(),
        }));
    }

    /// Closes the channel. Harmless when none is open.
    pub fn cleanup(&self) {
        if let Some(open) = lock(&self.channel).take() {
            open.listener.abort();
            self.hub.release(&open.name);
            debug!(channel = %open.name, "Broadcast channel closed");
        }
    }

    pub fn channel_name(&self) -> Option<String> {
        lock(&self.channel).as_ref().map(|open| open.name.clone())
    }

    fn post(&self, payload: BroadcastPayload) {
        let kind = payload.kind();
        let message = BroadcastMessage::new(payload, self.device_id.clone());
        let raw = match message.to_json() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(kind, error = %e, "Failed to encode broadcast message");
                return;
            }
        };

        let channel = lock(&self.channel);
        let Some(open) = channel.as_ref() else {
            debug!(kind, "No broadcast channel open, dropping message");
            return;
        };
        // No live receivers is not an error for a best-effort channel.
        if open.tx.send(raw).is_err() {
            debug!(kind, channel = %open.name, "Broadcast had no receivers");
        }
    }
}

impl Drop for BroadcastManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

async fn listen(
    mut rx: broadcast::Receiver<String>,
    channel: String,
    device_id: String,
    inbound: Arc<Mutex<Option<InboundHandler>>>,
    subscribers: SubscriberRegistry<BroadcastMessage>,
) {
    loop {
        let raw = match rx.recv().await {
            Ok(raw) => raw,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(channel = %channel, skipped, "Broadcast listener lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let message = match BroadcastMessage::from_json(&raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(channel = %channel, error = %e, "Ignoring malformed broadcast");
                continue;
            }
        };
        if message.is_from(&device_id) {
            continue;
        }

        let handler = lock(&inbound).clone();
        if let Some(handler) = handler {
            handler(message.clone()).await;
        }
        subscribers.emit(&message);
    }
}
