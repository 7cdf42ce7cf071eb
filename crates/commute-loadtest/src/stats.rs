//! Live fleet statistics.

use crate::device::Device;
use crate::events::{Event, EventKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Fixed-size ring of per-tick message deltas.
#[derive(Debug, Clone)]
pub struct RateWindow {
    slots: Vec<u64>,
    cursor: usize,
}

impl RateWindow {
    /// Creates a window of `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![0; capacity.max(1)],
            cursor: 0,
        }
    }

    /// Stores `delta` in the next slot, overwriting the oldest.
    pub fn record(&mut self, delta: u64) {
        self.slots[self.cursor] = delta;
        self.cursor = (self.cursor + 1) % self.slots.len();
    }

    /// Rolling rate per tick interval: sum of all slots over the capacity.
    pub fn rate(&self) -> f64 {
        self.slots.iter().sum::<u64>() as f64 / self.slots.len() as f64
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Process-wide counters. Written by the aggregator, readable from anywhere.
#[derive(Debug)]
pub struct Stats {
    total_devices: u64,
    active: AtomicU64,
    errors: AtomicU64,
    messages_total: AtomicU64,
    window: Mutex<RateWindow>,
    started_at: DateTime<Utc>,
}

impl Stats {
    pub fn new(total_devices: usize, window: usize) -> Self {
        Self {
            total_devices: total_devices as u64,
            active: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            messages_total: AtomicU64::new(0),
            window: Mutex::new(RateWindow::new(window)),
            started_at: Utc::now(),
        }
    }

    pub fn total_devices(&self) -> u64 {
        self.total_devices
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Messages received across the fleet as of the last tick.
    pub fn messages_total(&self) -> u64 {
        self.messages_total.load(Ordering::Relaxed)
    }

    /// Rolling message rate, per tick interval.
    pub fn messages_per_sec(&self) -> f64 {
        self.window.lock().rate()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_devices: self.total_devices,
            active: self.active(),
            errors: self.errors(),
            messages_total: self.messages_total(),
            messages_per_sec: self.messages_per_sec(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    fn record_active(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    fn record_done(&self) {
        // Saturate at zero: a device cancelled before activating still reports done
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_devices: u64,
    pub active: u64,
    pub errors: u64,
    pub messages_total: u64,
    pub messages_per_sec: f64,
    pub uptime_secs: u64,
}

/// Folds device events and ticks into [`Stats`].
///
/// Owned by the single event-consuming task.
pub struct StatsAggregator {
    stats: Arc<Stats>,
    devices: Arc<[Arc<Device>]>,
    last_total: u64,
}

impl StatsAggregator {
    pub fn new(stats: Arc<Stats>, devices: Arc<[Arc<Device>]>) -> Self {
        Self {
            stats,
            devices,
            last_total: 0,
        }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn apply(&self, event: &Event) {
        match event.kind {
            EventKind::Active => self.stats.record_active(),
            EventKind::Error => self.stats.record_error(),
            EventKind::Done => self.stats.record_done(),
            // Counted from the devices on each tick
            EventKind::MessageReceived => {}
        }
    }

    /// Resamples every device's message counter and advances the window.
    pub fn tick(&mut self) {
        let total: u64 = self.devices.iter().map(|d| d.message_count()).sum();
        let delta = total.saturating_sub(self.last_total);
        self.last_total = total;

        self.stats.messages_total.store(total, Ordering::Relaxed);
        self.stats.window.lock().record(delta);
    }
}
