//! Final fleet report.

use crate::catalog::Target;
use crate::device::{Device, DeviceState};
use crate::stats::{Stats, StatsSnapshot};
use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Highest latency tracked by the histogram, in microseconds.
const MAX_LATENCY_US: u64 = 600_000_000;

/// Latency statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

impl LatencyStats {
    /// Computes statistics over the given latencies.
    pub fn from_micros(samples: impl IntoIterator<Item = u64>) -> Self {
        let mut histogram = match Histogram::<u64>::new_with_bounds(1, MAX_LATENCY_US, 3) {
            Ok(histogram) => histogram,
            Err(e) => {
                warn!("Failed to create latency histogram: {}", e);
                return Self::default();
            }
        };
        for micros in samples {
            let _ = histogram.record(micros.clamp(1, MAX_LATENCY_US));
        }

        if histogram.is_empty() {
            return Self::default();
        }

        Self {
            count: histogram.len(),
            min_us: histogram.min(),
            max_us: histogram.max(),
            mean_us: histogram.mean() as u64,
            p50_us: histogram.value_at_quantile(0.50),
            p95_us: histogram.value_at_quantile(0.95),
            p99_us: histogram.value_at_quantile(0.99),
        }
    }

    /// Formats latency as a human-readable string.
    pub fn format_ms(&self) -> String {
        if self.count == 0 {
            "N/A".to_string()
        } else {
            format!(
                "p50={:.1}ms p95={:.1}ms p99={:.1}ms",
                self.p50_us as f64 / 1000.0,
                self.p95_us as f64 / 1000.0,
                self.p99_us as f64 / 1000.0
            )
        }
    }
}

/// Final state of one device, with the credentials needed for cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReport {
    pub device_id: String,
    pub short_id: String,
    pub email: String,
    pub password: String,
    pub category: String,
    pub target: Target,
    pub state: DeviceState,
    pub error: Option<String>,
    pub requests: usize,
    pub failed_requests: usize,
    pub messages: u64,
}

impl DeviceReport {
    fn from_device(device: &Device) -> Self {
        let identity = device.identity();
        let log = device.request_log();
        Self {
            device_id: identity.device_id.to_string(),
            short_id: identity.short_id.clone(),
            email: identity.email.clone(),
            password: identity.password.clone(),
            category: device.assignment().category.clone(),
            target: device.assignment().target.clone(),
            state: device.state(),
            error: device.error_message(),
            requests: log.len(),
            failed_requests: log.iter().filter(|r| !r.ok).count(),
            messages: device.message_count(),
        }
    }
}

/// Complete run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetReport {
    pub generated_at: DateTime<Utc>,
    pub stats: StatsSnapshot,
    pub request_latency: LatencyStats,
    pub devices: Vec<DeviceReport>,
}

impl FleetReport {
    pub fn collect(devices: &[Arc<Device>], stats: &Stats) -> Self {
        let latencies = devices
            .iter()
            .flat_map(|d| d.request_log())
            .map(|r| r.latency.as_micros() as u64);

        Self {
            generated_at: Utc::now(),
            stats: stats.snapshot(),
            request_latency: LatencyStats::from_micros(latencies),
            devices: devices.iter().map(|d| DeviceReport::from_device(d)).collect(),
        }
    }

    pub fn count_in(&self, state: DeviceState) -> usize {
        self.devices.iter().filter(|d| d.state == state).count()
    }

    /// Generates a JSON report.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Prints a summary to stdout.
    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(60));
        println!("LOAD TEST RESULTS");
        println!("{}", "=".repeat(60));

        println!(
            "\nDevices: {} | Done: {} | Errors: {} | Uptime: {}s",
            self.stats.total_devices,
            self.count_in(DeviceState::Done),
            self.count_in(DeviceState::Error),
            self.stats.uptime_secs
        );
        println!(
            "Messages: {} ({:.1}/s at shutdown)",
            self.stats.messages_total, self.stats.messages_per_sec
        );
        println!("Request latency: {}", self.request_latency.format_ms());

        let failed: Vec<_> = self.devices.iter().filter(|d| d.error.is_some()).collect();
        if !failed.is_empty() {
            println!("\nFAILED DEVICES:");
            for device in failed {
                println!(
                    "   {} [{}] {}",
                    device.short_id,
                    device.category,
                    device.error.as_deref().unwrap_or_default()
                );
            }
        }

        println!("\n{}", "=".repeat(60));
    }
}
