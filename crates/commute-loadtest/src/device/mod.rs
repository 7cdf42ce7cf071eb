//! Simulated devices.
//!
//! A [`Device`] is the shared, read-mostly view of one simulated client: its
//! identity, its workload and its lifecycle state. Only the device's own
//! [`DeviceActor`] writes the state; everyone else reads through accessors
//! that hand out copies.

mod lifecycle;
mod log;

pub use lifecycle::{DeviceActor, Step, StepAction, LIFECYCLE};
pub use log::{ReceivedMessage, RequestRecord};

use crate::config::Timeouts;
use crate::distribution::WorkloadAssignment;
use crate::error::{DeviceError, TransportError};
use crate::transport::{BackendOp, BackendTransport};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle stage of a device, in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    Init,
    Registering,
    Authenticating,
    Linking,
    Configuring,
    Active,
    Done,
    Error,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Init => "INIT",
            DeviceState::Registering => "REGISTERING",
            DeviceState::Authenticating => "AUTHENTICATING",
            DeviceState::Linking => "LINKING",
            DeviceState::Configuring => "CONFIGURING",
            DeviceState::Active => "ACTIVE",
            DeviceState::Done => "DONE",
            DeviceState::Error => "ERROR",
        }
    }

    /// Returns whether no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceState::Done | DeviceState::Error)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generated identity and credentials, fixed for the device's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// "loadtest-{uuid}"
    pub device_id: Arc<str>,

    /// First 8 characters of the uuid, for display
    pub short_id: String,

    /// "loadtest-{uuid}@test.invalid"
    pub email: String,
    pub password: String,
}

impl DeviceIdentity {
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4().to_string();
        Self {
            device_id: Arc::from(format!("loadtest-{uuid}")),
            short_id: uuid[..8].to_string(),
            email: format!("loadtest-{uuid}@test.invalid"),
            password: Uuid::new_v4().to_string(),
        }
    }
}

/// Mutable part of a device, guarded by a single lock.
#[derive(Debug)]
struct DeviceInner {
    state: DeviceState,
    error: Option<String>,
    requests: Vec<RequestRecord>,
    messages: Vec<ReceivedMessage>,
    message_count: u64,
    active_at: Option<DateTime<Utc>>,
}

/// One simulated client.
pub struct Device {
    identity: DeviceIdentity,
    assignment: WorkloadAssignment,
    started_at: DateTime<Utc>,
    timeouts: Timeouts,
    backend: Arc<dyn BackendTransport>,
    inner: RwLock<DeviceInner>,

    /// Fires when the device should shut down
    cancel: CancellationToken,

    /// Fires once the actor has returned
    finished: CancellationToken,
}

impl Device {
    pub(crate) fn new(
        identity: DeviceIdentity,
        assignment: WorkloadAssignment,
        backend: Arc<dyn BackendTransport>,
        timeouts: Timeouts,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            assignment,
            started_at: Utc::now(),
            timeouts,
            backend,
            inner: RwLock::new(DeviceInner {
                state: DeviceState::Init,
                error: None,
                requests: Vec::new(),
                messages: Vec::new(),
                message_count: 0,
                active_at: None,
            }),
            cancel,
            finished: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.identity.device_id
    }

    pub(crate) fn id_arc(&self) -> Arc<str> {
        Arc::clone(&self.identity.device_id)
    }

    pub fn short_id(&self) -> &str {
        &self.identity.short_id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn assignment(&self) -> &WorkloadAssignment {
        &self.assignment
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn active_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().active_at
    }

    pub fn state(&self) -> DeviceState {
        self.inner.read().state
    }

    /// Last failure description, if the device failed.
    pub fn error_message(&self) -> Option<String> {
        self.inner.read().error.clone()
    }

    /// Copy of the request log.
    pub fn request_log(&self) -> Vec<RequestRecord> {
        self.inner.read().requests.clone()
    }

    /// Copy of the received messages.
    pub fn messages(&self) -> Vec<ReceivedMessage> {
        self.inner.read().messages.clone()
    }

    pub fn message_count(&self) -> u64 {
        self.inner.read().message_count
    }

    /// Asks the device to shut down. Safe to call any number of times.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits until the actor has finished.
    pub async fn wait(&self) {
        self.finished.cancelled().await;
    }

    /// Returns whether the actor has finished.
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Asks the backend to refresh this device's data.
    ///
    /// Only valid while `ACTIVE`. Failures are returned to the caller and
    /// never change the lifecycle state.
    pub async fn force_refresh(&self) -> Result<(), DeviceError> {
        let state = self.state();
        if state != DeviceState::Active {
            return Err(DeviceError::NotActive {
                device_id: self.id().to_string(),
                state,
            });
        }
        self.call_backend(BackendOp::ForceRefresh).await?;
        Ok(())
    }

    /// Issues one backend operation, logging exactly one request record.
    pub(crate) async fn call_backend(&self, op: BackendOp) -> Result<u16, TransportError> {
        let request = op.request(&self.identity, &self.assignment, &self.timeouts);
        let start = Instant::now();
        let result = match tokio::time::timeout(request.timeout, self.backend.send(&request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(request.timeout)),
        };
        let latency = start.elapsed();

        let status = result.as_ref().ok().copied();
        self.record_request(RequestRecord {
            timestamp: Utc::now(),
            method: request.method.to_string(),
            target: request.path,
            status,
            ok: status.is_some_and(|s| op.accepts(s)),
            latency,
        });

        let status = result?;
        if !op.accepts(status) {
            return Err(TransportError::Status(status));
        }
        Ok(status)
    }

    pub(crate) fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn finished_token(&self) -> &CancellationToken {
        &self.finished
    }

    pub(crate) fn record_request(&self, record: RequestRecord) {
        self.inner.write().requests.push(record);
    }

    pub(crate) fn record_message(&self, topic: &str, payload: String) {
        let mut inner = self.inner.write();
        inner.messages.push(ReceivedMessage {
            timestamp: Utc::now(),
            topic: topic.to_string(),
            payload,
        });
        inner.message_count += 1;
    }

    pub(crate) fn set_state(&self, state: DeviceState) {
        self.inner.write().state = state;
    }

    pub(crate) fn activate(&self) {
        let mut inner = self.inner.write();
        inner.state = DeviceState::Active;
        inner.active_at = Some(Utc::now());
    }

    pub(crate) fn fail(&self, message: String) {
        let mut inner = self.inner.write();
        inner.state = DeviceState::Error;
        inner.error = Some(message);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("identity", &self.identity)
            .field("assignment", &self.assignment)
            .field("state", &self.state())
            .finish()
    }
}
