//! Network collaborators used by the device lifecycle.
//!
//! Devices never talk to the network directly. Every backend call goes
//! through a [`BackendTransport`] and every broker interaction through a
//! [`BrokerTransport`]; a [`TransportFactory`] builds one of each per device.
//! Timeouts and request logging are applied by the device, so implementations
//! only perform the I/O.

pub mod http;
pub mod mqtt;

pub use http::HttpBackend;
pub use mqtt::MqttBroker;

use crate::config::{Config, Timeouts};
use crate::device::{Device, DeviceIdentity};
use crate::distribution::WorkloadAssignment;
use crate::error::TransportError;
use crate::events::{Event, EventKind};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Payload published on the presence topic while connected.
pub const PRESENCE_ONLINE: &str = "online";

/// Payload published (and registered as last will) when going away.
pub const PRESENCE_OFFLINE: &str = "offline";

/// Timezone reported when registering a device.
pub const DEVICE_TIMEZONE: &str = "America/New_York";

/// Named backend operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOp {
    RegisterDevice,
    RegisterAccount,
    Authenticate,
    LinkDevice,
    PushConfiguration,
    FetchConfiguration,
    ForceRefresh,
    Logout,
}

impl BackendOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendOp::RegisterDevice => "register-device",
            BackendOp::RegisterAccount => "register-account",
            BackendOp::Authenticate => "authenticate",
            BackendOp::LinkDevice => "link",
            BackendOp::PushConfiguration => "push-configuration",
            BackendOp::FetchConfiguration => "fetch-configuration",
            BackendOp::ForceRefresh => "force-refresh",
            BackendOp::Logout => "logout",
        }
    }

    /// Returns whether `status` counts as success for this operation.
    pub fn accepts(&self, status: u16) -> bool {
        match self {
            BackendOp::FetchConfiguration => status == 200,
            BackendOp::Logout => matches!(status, 200 | 204),
            _ => matches!(status, 200 | 201),
        }
    }

    /// Builds the wire request for a device.
    pub fn request(
        &self,
        identity: &DeviceIdentity,
        assignment: &WorkloadAssignment,
        timeouts: &Timeouts,
    ) -> BackendRequest {
        let device_id = identity.device_id.as_ref();
        let credentials = || json!({ "email": identity.email, "password": identity.password });

        let (method, path, body) = match self {
            BackendOp::RegisterDevice => (
                Method::POST,
                "/device/register".to_string(),
                Some(json!({ "id": device_id, "timezone": DEVICE_TIMEZONE })),
            ),
            BackendOp::RegisterAccount => {
                (Method::POST, "/user/register".to_string(), Some(credentials()))
            }
            BackendOp::Authenticate => (Method::POST, "/auth/login".to_string(), Some(credentials())),
            BackendOp::LinkDevice => (
                Method::POST,
                "/user/device/link".to_string(),
                Some(json!({ "deviceId": device_id })),
            ),
            BackendOp::PushConfiguration => {
                let target = &assignment.target;
                (
                    Method::POST,
                    format!("/device/{device_id}/config"),
                    Some(json!({
                        "lines": [{
                            "provider": target.provider_id,
                            "line": target.line,
                            "stop": target.stop_id,
                            "direction": target.direction,
                        }]
                    })),
                )
            }
            BackendOp::FetchConfiguration => {
                (Method::GET, format!("/device/{device_id}/config"), None)
            }
            BackendOp::ForceRefresh => (Method::POST, format!("/refresh/{device_id}"), None),
            BackendOp::Logout => (Method::POST, "/auth/logout".to_string(), None),
        };

        // The config push makes the server fetch live data upstream
        let timeout = match self {
            BackendOp::PushConfiguration => timeouts.config_push,
            _ => timeouts.request,
        };

        BackendRequest {
            op: *self,
            method,
            path,
            body,
            timeout,
        }
    }
}

impl fmt::Display for BackendOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single request against the backend.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub op: BackendOp,
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub timeout: Duration,
}

/// Performs backend requests on behalf of one device.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// Sends the request and returns the response status code.
    async fn send(&self, request: &BackendRequest) -> Result<u16, TransportError>;
}

/// Broker topics and client id of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSession {
    pub client_id: String,
    pub presence_topic: String,
    pub command_topic: String,
}

impl BrokerSession {
    pub fn for_device(identity: &DeviceIdentity) -> Self {
        Self {
            client_id: identity.device_id.to_string(),
            presence_topic: format!("device/{}/presence", identity.device_id),
            command_topic: format!("/device/{}/commands", identity.device_id),
        }
    }
}

/// Maintains one device's broker connection.
#[async_trait]
pub trait BrokerTransport: Send {
    /// Connects, announcing [`PRESENCE_ONLINE`] and registering
    /// [`PRESENCE_OFFLINE`] as last will.
    async fn connect(&mut self, session: &BrokerSession) -> Result<(), TransportError>;

    /// Subscribes to `topic`, delivering every payload to `sink`.
    async fn subscribe(&mut self, topic: &str, sink: MessageSink) -> Result<(), TransportError>;

    /// Publishes [`PRESENCE_OFFLINE`] and closes the connection.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Where a broker transport delivers inbound messages for a device.
///
/// Holds only a weak handle on the event channel, so a broker connection
/// that outlives its device never keeps the fan-in channel open.
#[derive(Clone)]
pub struct MessageSink {
    device: Arc<Device>,
    events: mpsc::WeakSender<Event>,
}

impl MessageSink {
    pub(crate) fn new(device: Arc<Device>, events: &mpsc::Sender<Event>) -> Self {
        Self {
            device,
            events: events.downgrade(),
        }
    }

    /// Records the message on the device and notifies the aggregator.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.device
            .record_message(topic, String::from_utf8_lossy(payload).into_owned());

        if let Some(events) = self.events.upgrade() {
            let event = Event::new(self.device.id_arc(), EventKind::MessageReceived);
            if events.try_send(event).is_err() {
                debug!(
                    "Event channel full, message event for {} not forwarded",
                    self.device.short_id()
                );
            }
        }
    }
}

impl fmt::Debug for MessageSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSink")
            .field("device", &self.device.id())
            .finish()
    }
}

/// Builds the transports for each device.
pub trait TransportFactory: Send + Sync {
    fn backend(&self, identity: &DeviceIdentity) -> Result<Arc<dyn BackendTransport>, TransportError>;

    fn broker(&self, identity: &DeviceIdentity) -> Box<dyn BrokerTransport>;
}

/// Production transports: reqwest against the backend, rumqttc against the broker.
#[derive(Debug, Clone)]
pub struct NetworkTransports {
    config: Arc<Config>,
}

impl NetworkTransports {
    pub fn new(config: &Config) -> Self {
        Self {
            config: Arc::new(config.clone()),
        }
    }
}

impl TransportFactory for NetworkTransports {
    fn backend(&self, _identity: &DeviceIdentity) -> Result<Arc<dyn BackendTransport>, TransportError> {
        // One client per device so each keeps its own session cookie
        Ok(Arc::new(HttpBackend::new(&self.config.backend)?))
    }

    fn broker(&self, _identity: &DeviceIdentity) -> Box<dyn BrokerTransport> {
        Box::new(MqttBroker::new(self.config.broker.clone()))
    }
}
