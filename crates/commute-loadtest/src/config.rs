//! Configuration structs for the load test.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Category key to target percentage. Ordered so remainder filling is stable.
pub type Distribution = BTreeMap<String, u32>;

/// Main configuration for a load test run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend HTTP API settings
    pub backend: BackendSettings,

    /// MQTT broker settings
    pub broker: BrokerSettings,

    /// Fleet size and workload mix
    pub fleet: FleetSettings,

    /// Live statistics sampling
    pub stats: StatsSettings,
}

/// Backend HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Server URL (e.g., "https://staging.example.com")
    pub server_url: String,

    /// Shared secret sent as `X-Loadtest-Key`
    pub secret_key: Option<String>,

    /// Timeout for ordinary requests
    pub request_timeout_ms: u64,

    /// Timeout for the config push, which triggers a live upstream fetch
    pub config_push_timeout_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            secret_key: None,
            request_timeout_ms: 15_000,
            config_push_timeout_ms: 90_000,
        }
    }
}

/// MQTT broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    pub subscribe_timeout_ms: u64,

    /// Upper bound for the offline publish plus disconnect during cleanup
    pub disconnect_timeout_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: "commutelive".to_string(),
            password: "commutelive".to_string(),
            keep_alive_secs: 30,
            connect_timeout_ms: 10_000,
            subscribe_timeout_ms: 5_000,
            disconnect_timeout_ms: 2_000,
        }
    }
}

/// Fleet size and workload mix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    /// Number of simulated devices
    pub devices: usize,

    /// Category distribution (must sum to 100)
    pub distribution: Distribution,

    /// Stop automatically after this many seconds (unlimited when unset)
    pub duration_secs: Option<u64>,
}

impl Default for FleetSettings {
    fn default() -> Self {
        let distribution = ["cta", "mta", "mbta", "septa"]
            .into_iter()
            .map(|key| (key.to_string(), 25))
            .collect();
        Self {
            devices: 5,
            distribution,
            duration_secs: None,
        }
    }
}

impl FleetSettings {
    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }
}

/// Live statistics sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    /// Interval between throughput samples
    pub tick_interval_ms: u64,

    /// Number of samples in the rolling message-rate window
    pub window: usize,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            window: 5,
        }
    }
}

impl StatsSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Per-operation timeouts handed to every device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub request: Duration,
    pub config_push: Duration,
    pub broker_connect: Duration,
    pub broker_subscribe: Duration,
    pub broker_disconnect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Config::default().timeouts()
    }
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Checks the invariants the orchestrator relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fleet.devices == 0 {
            return Err(ConfigError::NoDevices);
        }
        check_distribution(&self.fleet.distribution)?;
        if self.stats.tick_interval_ms == 0 {
            return Err(ConfigError::ZeroTickInterval);
        }
        if self.stats.window == 0 {
            return Err(ConfigError::EmptyWindow);
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            request: Duration::from_millis(self.backend.request_timeout_ms),
            config_push: Duration::from_millis(self.backend.config_push_timeout_ms),
            broker_connect: Duration::from_millis(self.broker.connect_timeout_ms),
            broker_subscribe: Duration::from_millis(self.broker.subscribe_timeout_ms),
            broker_disconnect: Duration::from_millis(self.broker.disconnect_timeout_ms),
        }
    }
}

/// Fails unless the percentages add up to exactly 100.
pub fn check_distribution(distribution: &Distribution) -> Result<(), ConfigError> {
    let total = distribution
        .values()
        .try_fold(0u32, |sum, pct| sum.checked_add(*pct))
        .ok_or(ConfigError::DistributionSum(u32::MAX))?;
    if total != 100 {
        return Err(ConfigError::DistributionSum(total));
    }
    Ok(())
}

/// Parses a distribution such as `"cta=30,mta=40,mbta=20,septa=10"`.
pub fn parse_distribution(input: &str) -> Result<Distribution, ConfigError> {
    let mut distribution = Distribution::new();
    for part in input.split(',') {
        let (key, value) = part
            .trim()
            .split_once('=')
            .ok_or_else(|| ConfigError::DistributionEntry(part.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::DistributionEntry(part.to_string()));
        }
        let pct = value
            .trim()
            .parse::<u32>()
            .map_err(|_| ConfigError::Percentage {
                category: key.to_string(),
                value: value.trim().to_string(),
            })?;
        distribution.insert(key.to_string(), pct);
    }
    check_distribution(&distribution)?;
    Ok(distribution)
}

/// Refuses to run against anything that does not look like a staging server.
pub fn ensure_staging(server_url: &str, force: bool) -> Result<(), ConfigError> {
    if force || server_url.contains("staging") {
        Ok(())
    } else {
        Err(ConfigError::NotStaging(server_url.to_string()))
    }
}
