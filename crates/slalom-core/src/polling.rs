//! # Polling Tiers
//!
//! Pure resolution of the polling schedule from the device environment.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Tier Precedence (first match wins)                  │
//! │                                                                         │
//! │  1. connection offline            → Offline         60s                 │
//! │  2. tab / window hidden           → Hidden          60s                 │
//! │  3. battery < 5% and discharging  → UltraLowBattery 120s                │
//! │  4. slow or metered link          → Metered         30s → 60s → 120s    │
//! │  5. battery category              → Normal          15s → 30s → 60s     │
//! │                                     Medium          20s → 45s → 90s     │
//! │                                     Low             30s → 60s → 120s    │
//! │                                     Critical        60s → 120s          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The ladder only advances after `threshold` consecutive ticks that saw no
//! remote changes. Any change resets it to `base_interval`.

use std::time::Duration;

use crate::types::{BatteryLevel, BatteryStatus, ConnectionQuality};

/// Raw battery fraction below which polling drops to the ultra-low tier.
pub const ULTRA_LOW_BATTERY_LEVEL: f64 = 0.05;

/// Consecutive fetch errors before the error interval is forced.
pub const ERROR_THRESHOLD: u32 = 3;

/// Minimum interval while the error threshold is exceeded.
pub const ERROR_POLL_INTERVAL: Duration = Duration::from_millis(30_000);

const fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

const OFFLINE_LADDER: &[Duration] = &[ms(60_000)];
const HIDDEN_LADDER: &[Duration] = &[ms(60_000)];
const ULTRA_LOW_LADDER: &[Duration] = &[ms(120_000)];
const METERED_LADDER: &[Duration] = &[ms(30_000), ms(60_000), ms(120_000)];
const NORMAL_LADDER: &[Duration] = &[ms(15_000), ms(30_000), ms(60_000)];
const MEDIUM_LADDER: &[Duration] = &[ms(20_000), ms(45_000), ms(90_000)];
const LOW_LADDER: &[Duration] = &[ms(30_000), ms(60_000), ms(120_000)];
const CRITICAL_LADDER: &[Duration] = &[ms(60_000), ms(120_000)];

/// Active-vs-idle interval ladder for one environment tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    /// Monotonically increasing intervals, index 0 is the fastest.
    pub intervals: &'static [Duration],
    /// Consecutive no-change ticks before the ladder advances one step.
    pub threshold: u32,
    /// Interval used whenever changes were just observed.
    pub base_interval: Duration,
}

impl PollingConfig {
    /// Interval at a ladder position, clamped to the last step.
    pub fn interval_at(&self, index: usize) -> Duration {
        match self.intervals.len() {
            0 => self.base_interval,
            len => self.intervals[index.min(len - 1)],
        }
    }

    /// Highest valid ladder index.
    pub fn max_index(&self) -> usize {
        self.intervals.len().saturating_sub(1)
    }
}

/// Snapshot of every signal that influences polling.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PollingEnvironment {
    pub quality: ConnectionQuality,
    pub metered: bool,
    pub hidden: bool,
    pub battery: BatteryStatus,
}

/// Environment tier selected by [`resolve_polling_tier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollingTier {
    Offline,
    Hidden,
    UltraLowBattery,
    Metered,
    Battery(BatteryLevel),
}

impl PollingTier {
    pub fn config(&self) -> PollingConfig {
        let (intervals, threshold) = match self {
            PollingTier::Offline => (OFFLINE_LADDER, 1),
            PollingTier::Hidden => (HIDDEN_LADDER, 1),
            PollingTier::UltraLowBattery => (ULTRA_LOW_LADDER, 1),
            PollingTier::Metered => (METERED_LADDER, 3),
            PollingTier::Battery(BatteryLevel::Normal) => (NORMAL_LADDER, 4),
            PollingTier::Battery(BatteryLevel::Medium) => (MEDIUM_LADDER, 3),
            PollingTier::Battery(BatteryLevel::Low) => (LOW_LADDER, 2),
            PollingTier::Battery(BatteryLevel::Critical) => (CRITICAL_LADDER, 1),
        };
        PollingConfig {
            intervals,
            threshold,
            base_interval: intervals[0],
        }
    }
}

/// Resolves the tier for an environment in strict precedence order.
pub fn resolve_polling_tier(env: &PollingEnvironment) -> PollingTier {
    if env.quality == ConnectionQuality::Offline {
        return PollingTier::Offline;
    }
    if env.hidden {
        return PollingTier::Hidden;
    }
    if !env.battery.charging && env.battery.level < ULTRA_LOW_BATTERY_LEVEL {
        return PollingTier::UltraLowBattery;
    }
    if env.quality == ConnectionQuality::Slow || env.metered {
        return PollingTier::Metered;
    }
    PollingTier::Battery(env.battery.category())
}

/// Shorthand for `resolve_polling_tier(env).config()`.
pub fn polling_config(env: &PollingEnvironment) -> PollingConfig {
    resolve_polling_tier(env).config()
}
