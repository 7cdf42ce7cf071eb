//! Error types for the load test engine.

use crate::device::DeviceState;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. Fatal at construction, before any device starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("distribution percentages must sum to 100, got {0}")]
    DistributionSum(u32),

    #[error("invalid distribution entry {0:?} (expected key=value)")]
    DistributionEntry(String),

    #[error("invalid percentage for category {category:?}: {value:?}")]
    Percentage { category: String, value: String },

    #[error("unknown workload category {0:?}")]
    UnknownCategory(String),

    #[error("no targets configured for category {0:?}")]
    EmptyCategory(String),

    #[error("device count must be at least 1")]
    NoDevices,

    #[error("stats window must hold at least one sample")]
    EmptyWindow,

    #[error("stats tick interval must be non-zero")]
    ZeroTickInterval,

    #[error("server URL {0:?} does not contain \"staging\"; use --force to proceed anyway")]
    NotStaging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Failures of a single backend or broker operation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("returned status {0}")]
    Status(u16),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("not connected to broker")]
    NotConnected,
}

impl From<rumqttc::ClientError> for TransportError {
    fn from(e: rumqttc::ClientError) -> Self {
        TransportError::Broker(e.to_string())
    }
}

impl From<rumqttc::ConnectionError> for TransportError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        TransportError::Broker(e.to_string())
    }
}

/// Failures of operations issued against a device after onboarding.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {device_id} is {state}, not ACTIVE")]
    NotActive {
        device_id: String,
        state: DeviceState,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Top-level error for orchestrator operations.
#[derive(Debug, Error)]
pub enum LoadtestError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("fleet already started")]
    AlreadyStarted,
}

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, LoadtestError>;
