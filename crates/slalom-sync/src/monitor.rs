//! # Environment Monitors
//!
//! Collaborator interfaces for raw signals the engine does not acquire
//! itself: connection quality, battery and tab visibility.
//!
//! The `Manual*` implementations hold their state in memory and notify
//! subscribers when it is set. Embedders bridge platform signals into them;
//! tests drive them directly.

use slalom_core::polling::PollingEnvironment;
use slalom_core::{BatteryStatus, ConnectionQuality};
use std::sync::Mutex;
use tracing::debug;

use crate::signal::{SubscriberRegistry, Subscription};

pub type QualityHandler = Box<dyn Fn(ConnectionQuality) + Send + Sync>;
pub type BatteryHandler = Box<dyn Fn(BatteryStatus) + Send + Sync>;
pub type VisibilityHandler = Box<dyn Fn(bool) + Send + Sync>;

/// Network quality and metering.
pub trait NetworkMonitor: Send + Sync {
    fn connection_quality(&self) -> ConnectionQuality;

    fn is_metered(&self) -> bool;

    /// Notified with the current quality whenever quality or metering
    /// changes.
    fn on_quality_change(&self, handler: QualityHandler) -> Subscription;
}

/// Battery level and charging state.
pub trait BatteryMonitor: Send + Sync {
    fn status(&self) -> BatteryStatus;

    fn subscribe(&self, handler: BatteryHandler) -> Subscription;
}

/// Whether the page/window is hidden.
pub trait VisibilityMonitor: Send + Sync {
    fn is_hidden(&self) -> bool;

    /// Notified with the new `hidden` flag.
    fn subscribe(&self, handler: VisibilityHandler) -> Subscription;
}

/// Reads every monitor once.
pub fn environment_snapshot(
    network: &dyn NetworkMonitor,
    battery: &dyn BatteryMonitor,
    visibility: &dyn VisibilityMonitor,
) -> PollingEnvironment {
    PollingEnvironment {
        quality: network.connection_quality(),
        metered: network.is_metered(),
        hidden: visibility.is_hidden(),
        battery: battery.status(),
    }
}

// =============================================================================
// Manual Network Monitor
// =============================================================================

#[derive(Default)]
pub struct ManualNetworkMonitor {
    state: Mutex<(ConnectionQuality, bool)>,
    subscribers: SubscriberRegistry<ConnectionQuality>,
}

impl ManualNetworkMonitor {
    pub fn new(quality: ConnectionQuality, metered: bool) -> Self {
        ManualNetworkMonitor {
            state: Mutex::new((quality, metered)),
            subscribers: SubscriberRegistry::new(),
        }
    }

    pub fn set_quality(&self, quality: ConnectionQuality) {
        let changed = match self.state.lock() {
            Ok(mut state) if state.0 != quality => {
                state.0 = quality;
                true
            }
            _ => false,
        };
        if changed {
            debug!(quality = %quality, "Connection quality changed");
            self.subscribers.emit(&quality);
        }
    }

    pub fn set_metered(&self, metered: bool) {
        let changed = match self.state.lock() {
            Ok(mut state) if state.1 != metered => {
                state.1 = metered;
                Some(state.0)
            }
            _ => None,
        };
        if let Some(quality) = changed {
            debug!(metered, "Metered state changed");
            self.subscribers.emit(&quality);
        }
    }
}

impl NetworkMonitor for ManualNetworkMonitor {
    fn connection_quality(&self) -> ConnectionQuality {
        self.state.lock().map(|s| s.0).unwrap_or(ConnectionQuality::Offline)
    }

    fn is_metered(&self) -> bool {
        self.state.lock().map(|s| s.1).unwrap_or(false)
    }

    fn on_quality_change(&self, handler: QualityHandler) -> Subscription {
        self.subscribers.subscribe(move |q| handler(*q))
    }
}

// =============================================================================
// Manual Battery Monitor
// =============================================================================

#[derive(Default)]
pub struct ManualBatteryMonitor {
    status: Mutex<BatteryStatus>,
    subscribers: SubscriberRegistry<BatteryStatus>,
}

impl ManualBatteryMonitor {
    pub fn new(status: BatteryStatus) -> Self {
        ManualBatteryMonitor {
            status: Mutex::new(status),
            subscribers: SubscriberRegistry::new(),
        }
    }

    pub fn set_status(&self, status: BatteryStatus) {
        let changed = match self.status.lock() {
            Ok(mut current) if *current != status => {
                *current = status;
                true
            }
            _ => false,
        };
        if changed {
            debug!(level = status.level, charging = status.charging, "Battery status changed");
            self.subscribers.emit(&status);
        }
    }
}

impl BatteryMonitor for ManualBatteryMonitor {
    fn status(&self) -> BatteryStatus {
        self.status.lock().map(|s| *s).unwrap_or_default()
    }

    fn subscribe(&self, handler: BatteryHandler) -> Subscription {
        self.subscribers.subscribe(move |s| handler(*s))
    }
}

// =============================================================================
// Manual Visibility Monitor
// =============================================================================

#[derive(Default)]
pub struct ManualVisibilityMonitor {
    hidden: Mutex<bool>,
    subscribers: SubscriberRegistry<bool>,
}

impl ManualVisibilityMonitor {
    pub fn new(hidden: bool) -> Self {
        ManualVisibilityMonitor {
            hidden: Mutex::new(hidden),
            subscribers: SubscriberRegistry::new(),
        }
    }

    pub fn set_hidden(&self, hidden: bool) {
        let changed = match self.hidden.lock() {
            Ok(mut current) if *current != hidden => {
                *current = hidden;
                true
            }
            _ => false,
        };
        if changed {
            debug!(hidden, "Visibility changed");
            self.subscribers.emit(&hidden);
        }
    }
}

impl VisibilityMonitor for ManualVisibilityMonitor {
    fn is_hidden(&self) -> bool {
        self.hidden.lock().map(|h| *h).unwrap_or(false)
    }

    fn subscribe(&self, handler: VisibilityHandler) -> Subscription {
        self.subscribers.subscribe(move |h| handler(*h))
    }
}
