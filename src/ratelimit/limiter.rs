//! Fixed-window request counters, one keyed map per preset.

use super::config::{Preset, PresetLimit, RateLimitConfig};
use crate::error::{Result, TollgateError};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Evict keys whose window has ended every N checks.
const SHRINK_INTERVAL: u64 = 1000;

#[derive(Debug, Clone, Copy)]
struct Window {
    start: Instant,
    count: u32,
}

/// Counters for a single preset.
struct PresetWindows {
    max_requests: u32,
    window: Duration,
    counters: DashMap<String, Window>,
}

impl PresetWindows {
    fn new(preset: Preset, limit: PresetLimit) -> Result<Self> {
        if limit.max_requests == 0 {
            return Err(TollgateError::internal(format!(
                "Rate limit preset {} has max_requests = 0",
                preset
            )));
        }
        if limit.window_seconds == 0 {
            return Err(TollgateError::internal(format!(
                "Rate limit preset {} has an empty window",
                preset
            )));
        }

        Ok(Self {
            max_requests: limit.max_requests,
            window: Duration::from_secs(limit.window_seconds),
            counters: DashMap::new(),
        })
    }

    /// Check and count one request. The entry guard holds the shard lock, so
    /// the check and the increment are a single step.
    fn admit(&self, key: &str, now: Instant) -> std::result::Result<(), u64> {
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert(Window { start: now, count: 0 });

        if now.saturating_duration_since(entry.start) >= self.window {
            *entry = Window { start: now, count: 0 };
        }

        if entry.count < self.max_requests {
            entry.count += 1;
            Ok(())
        } else {
            let resets_at = entry.start + self.window;
            Err(round_up_secs(resets_at.saturating_duration_since(now)))
        }
    }

    fn evict_ended(&self, now: Instant) {
        let window = self.window;
        self.counters
            .retain(|_, w| now.saturating_duration_since(w.start) < window);
        self.counters.shrink_to_fit();
    }
}

/// Rate limiter holding one fixed-window counter map per preset.
///
/// A preset of `max` requests per `window` admits at most `max` requests per key
/// in each window. The window opens with the key's first request, and the next
/// request after it has elapsed starts a fresh one.
pub struct PresetRateLimiter {
    enabled: bool,
    presets: HashMap<Preset, PresetWindows>,
    checks: AtomicU64,
}

impl PresetRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        let mut presets = HashMap::new();
        for preset in Preset::ALL {
            presets.insert(preset, PresetWindows::new(preset, config.limit_for(preset))?);
        }

        Ok(Self {
            enabled: config.enabled,
            presets,
            checks: AtomicU64::new(0),
        })
    }

    /// Whether one more request for `key` fits the preset's window.
    pub fn within_limit(&self, key: &str, preset: Preset) -> bool {
        self.check_key(key, preset).is_ok()
    }

    /// Check a (client, route) pair. `Err` carries the retry-after hint in seconds.
    pub fn check(&self, client: &str, route: &str, preset: Preset) -> std::result::Result<(), u64> {
        self.check_key(&format!("{}|{}", client, route), preset)
    }

    fn check_key(&self, key: &str, preset: Preset) -> std::result::Result<(), u64> {
        if !self.enabled {
            return Ok(());
        }

        let count = self.checks.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % SHRINK_INTERVAL == 0 {
            self.evict_stale();
        }

        let Some(windows) = self.presets.get(&preset) else {
            return Ok(());
        };
        windows.admit(key, Instant::now())
    }

    /// Drop keys whose window has ended.
    pub fn evict_stale(&self) {
        let now = Instant::now();
        for windows in self.presets.values() {
            windows.evict_ended(now);
        }
    }

    /// Number of (client, route) keys currently tracked across all presets.
    pub fn tracked_keys(&self) -> usize {
        self.presets.values().map(|w| w.counters.len()).sum()
    }
}

fn round_up_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}
