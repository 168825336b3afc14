//! Scheduler configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-provider lane overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Concurrent executor calls allowed toward this provider.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Minimum spacing between two dispatches to this provider (milliseconds).
    #[serde(default)]
    pub stagger_ms: Option<u64>,
}

/// Lane settings after applying defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneSettings {
    pub max_concurrent: usize,
    pub stagger: Duration,
}

/// Configuration for the dispatch scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Enable/disable the background dispatch loop.
    /// When disabled, nothing is dispatched unless `tick` is driven manually.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// How often the dispatch loop wakes up without being signalled (milliseconds).
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Lane capacity for providers without an override.
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: usize,

    /// Dispatch spacing for providers without an override (milliseconds).
    #[serde(default)]
    pub default_stagger_ms: u64,

    /// Waiting this long raises an entry's effective priority by one (seconds).
    #[serde(default = "default_aging_interval")]
    pub aging_interval_secs: u64,

    /// Per-provider overrides, keyed by provider name.
    #[serde(default)]
    pub providers: BTreeMap<String, LaneConfig>,
}

fn default_enabled() -> bool {
    true
}

fn default_tick_interval() -> u64 {
    250
}

fn default_max_concurrent() -> usize {
    3
}

fn default_aging_interval() -> u64 {
    60 // 1 minute
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tick_interval_ms: default_tick_interval(),
            default_max_concurrent: default_max_concurrent(),
            default_stagger_ms: 0,
            aging_interval_secs: default_aging_interval(),
            providers: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Settings for `provider`, falling back to the defaults.
    pub fn lane(&self, provider: &str) -> LaneSettings {
        let lane = self.providers.get(provider);
        LaneSettings {
            max_concurrent: lane
                .and_then(|l| l.max_concurrent)
                .unwrap_or(self.default_max_concurrent),
            stagger: Duration::from_millis(
                lane.and_then(|l| l.stagger_ms)
                    .unwrap_or(self.default_stagger_ms),
            ),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn aging_interval(&self) -> Duration {
        Duration::from_secs(self.aging_interval_secs)
    }
}
