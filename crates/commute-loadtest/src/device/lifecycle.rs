//! The onboarding state machine each device runs.

use super::{Device, DeviceState, RequestRecord};
use crate::error::TransportError;
use crate::events::{Event, EventKind};
use crate::transport::{BackendOp, BrokerSession, BrokerTransport, MessageSink};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What a lifecycle step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Backend(BackendOp),
    ConnectBroker,
    SubscribeBroker,
}

/// One named onboarding step.
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub name: &'static str,

    /// State the device enters when the step starts, if it changes
    pub enters: Option<DeviceState>,
    pub action: StepAction,
}

/// Onboarding steps, in execution order.
pub const LIFECYCLE: &[Step] = &[
    Step {
        name: "register-device",
        enters: Some(DeviceState::Registering),
        action: StepAction::Backend(BackendOp::RegisterDevice),
    },
    Step {
        name: "register-account",
        enters: None,
        action: StepAction::Backend(BackendOp::RegisterAccount),
    },
    Step {
        name: "authenticate",
        enters: Some(DeviceState::Authenticating),
        action: StepAction::Backend(BackendOp::Authenticate),
    },
    Step {
        name: "link",
        enters: Some(DeviceState::Linking),
        action: StepAction::Backend(BackendOp::LinkDevice),
    },
    Step {
        name: "push-configuration",
        enters: Some(DeviceState::Configuring),
        action: StepAction::Backend(BackendOp::PushConfiguration),
    },
    Step {
        name: "fetch-configuration",
        enters: None,
        action: StepAction::Backend(BackendOp::FetchConfiguration),
    },
    Step {
        name: "connect-transport",
        enters: None,
        action: StepAction::ConnectBroker,
    },
    Step {
        name: "subscribe-transport",
        enters: None,
        action: StepAction::SubscribeBroker,
    },
];

/// Drives one device through its lifecycle.
pub struct DeviceActor {
    device: Arc<Device>,
    broker: Box<dyn BrokerTransport>,
    session: BrokerSession,
}

impl DeviceActor {
    pub fn new(device: Arc<Device>, broker: Box<dyn BrokerTransport>) -> Self {
        let session = BrokerSession::for_device(device.identity());
        Self {
            device,
            broker,
            session,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Runs onboarding, stays active until shutdown, then cleans up.
    ///
    /// Ends in exactly one of `DONE` or `ERROR`.
    pub async fn run(mut self, events: mpsc::Sender<Event>) {
        let _finished = self.device.finished_token().clone().drop_guard();
        let device = Arc::clone(&self.device);

        for step in LIFECYCLE {
            // Nothing external exists yet, so stopping here needs no cleanup
            if device.cancel_token().is_cancelled() {
                debug!("Device {} stopped before {}", device.short_id(), step.name);
                device.set_state(DeviceState::Done);
                return;
            }

            if let Some(state) = step.enters {
                device.set_state(state);
            }

            if let Err(e) = self.execute(step, &events).await {
                let message = format!("{}: {}", step.name, e);
                warn!("Device {} failed: {}", device.short_id(), message);
                device.fail(message);
                let _ = events.send(Event::new(device.id_arc(), EventKind::Error)).await;
                return;
            }
        }

        device.activate();
        info!("Device {} active", device.short_id());
        let _ = events.send(Event::new(device.id_arc(), EventKind::Active)).await;

        device.cancel_token().cancelled().await;
        self.cleanup(&events).await;
    }

    async fn execute(&mut self, step: &Step, events: &mpsc::Sender<Event>) -> Result<(), TransportError> {
        match step.action {
            StepAction::Backend(op) => self.device.call_backend(op).await.map(|_| ()),
            StepAction::ConnectBroker => {
                let timeout = self.device.timeouts().broker_connect;
                let target = self.session.client_id.clone();
                let session = self.session.clone();
                let connect = self.broker.connect(&session);
                broker_call(&self.device, "CONNECT", target, timeout, connect).await
            }
            StepAction::SubscribeBroker => {
                let timeout = self.device.timeouts().broker_subscribe;
                let topic = self.session.command_topic.clone();
                let sink = MessageSink::new(Arc::clone(&self.device), events);
                let subscribe = self.broker.subscribe(&topic, sink);
                broker_call(&self.device, "SUBSCRIBE", topic.clone(), timeout, subscribe).await
            }
        }
    }

    /// Best-effort teardown after shutdown. Failures are logged and ignored.
    async fn cleanup(&mut self, events: &mpsc::Sender<Event>) {
        let device = Arc::clone(&self.device);

        if let Err(e) = device.call_backend(BackendOp::Logout).await {
            debug!("Device {} logout failed: {}", device.short_id(), e);
        }

        let timeout = device.timeouts().broker_disconnect;
        let target = self.session.presence_topic.clone();
        let disconnect = self.broker.disconnect();
        if let Err(e) = broker_call(&device, "DISCONNECT", target, timeout, disconnect).await {
            debug!("Device {} disconnect failed: {}", device.short_id(), e);
        }

        device.set_state(DeviceState::Done);
        debug!("Device {} done", device.short_id());
        let _ = events.send(Event::new(device.id_arc(), EventKind::Done)).await;
    }
}

/// Runs a broker operation under a timeout, logging one request record.
async fn broker_call<F>(
    device: &Device,
    method: &str,
    target: String,
    timeout: Duration,
    operation: F,
) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    let start = Instant::now();
    let result = match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout)),
    };

    device.record_request(RequestRecord {
        timestamp: Utc::now(),
        method: method.to_string(),
        target,
        status: None,
        ok: result.is_ok(),
        latency: start.elapsed(),
    });

    result
}
