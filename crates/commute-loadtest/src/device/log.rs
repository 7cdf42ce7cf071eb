//! Per-device request and message records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Outcome of one network-bound operation issued by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,

    /// HTTP method, or the broker operation (`CONNECT`, `SUBSCRIBE`, `DISCONNECT`)
    pub method: String,

    /// Request path, or broker topic / client id
    pub target: String,

    /// HTTP status; `None` when no response arrived or for broker operations
    pub status: Option<u16>,

    /// Whether the operation accepted the status
    pub ok: bool,
    pub latency: Duration,
}

impl fmt::Display for RequestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.ok { "ok" } else { "FAILED" };
        let status = self.status.map_or_else(|| "-".to_string(), |s| s.to_string());
        write!(
            f,
            "{}  {:<10} {:<40}  {} {}",
            self.timestamp.format("%H:%M:%S"),
            self.method,
            self.target,
            status,
            mark
        )
    }
}

/// A message delivered to the device's command topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub payload: String,
}

impl fmt::Display for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}  {}", self.timestamp.format("%H:%M:%S"), self.payload)
    }
}
