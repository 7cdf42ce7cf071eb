//! Lifecycle events emitted by devices and updates published to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-device capacity of the fan-in event channel.
pub const EVENTS_PER_DEVICE: usize = 4;

/// Lower bound on the fan-in channel capacity.
pub const MIN_EVENT_CAPACITY: usize = 16;

/// Capacity of the subscriber broadcast channel.
pub const UPDATE_CAPACITY: usize = 1024;

/// Kind of lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Onboarding finished and the device is connected
    Active,
    /// A step failed; the device has stopped
    Error,
    /// Cleanup after shutdown finished
    Done,
    /// A message arrived on the command topic
    MessageReceived,
}

/// A lifecycle notification from one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub device_id: Arc<str>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(device_id: Arc<str>, kind: EventKind) -> Self {
        Self { device_id, kind }
    }
}

/// What subscribers (e.g. a live display) receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// A device event, forwarded after the stats were updated
    Device(Event),
    /// The stats were resampled
    Tick(DateTime<Utc>),
    /// Shutdown was requested; subscribers should stop
    ShutdownRequested,
    /// Every device has finished and the event stream is closed
    Drained,
}

/// Fan-in channel capacity for a fleet of `devices`.
pub fn event_capacity(devices: usize) -> usize {
    devices
        .saturating_mul(EVENTS_PER_DEVICE)
        .max(MIN_EVENT_CAPACITY)
}
