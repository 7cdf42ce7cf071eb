//! Scripted transports shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use commute_loadtest::catalog::{StaticCatalog, Target};
use commute_loadtest::config::Config;
use commute_loadtest::device::DeviceIdentity;
use commute_loadtest::error::TransportError;
use commute_loadtest::transport::{
    BackendOp, BackendRequest, BackendTransport, BrokerSession, BrokerTransport, MessageSink,
    TransportFactory,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Backend that answers 200 unless a failure was scripted for its device.
pub struct FakeBackend {
    device_id: String,
    failure: Option<(BackendOp, u16)>,
    calls: Arc<Mutex<Vec<(String, BackendOp)>>>,
}

#[async_trait]
impl BackendTransport for FakeBackend {
    async fn send(&self, request: &BackendRequest) -> Result<u16, TransportError> {
        self.calls.lock().push((self.device_id.clone(), request.op));
        match self.failure {
            Some((op, status)) if op == request.op => Ok(status),
            _ => Ok(200),
        }
    }
}

/// Broker that registers each device's sink so tests can push messages.
pub struct FakeBroker {
    device_id: String,
    sinks: Arc<Mutex<HashMap<String, MessageSink>>>,
    connected: bool,
}

#[async_trait]
impl BrokerTransport for FakeBroker {
    async fn connect(&mut self, _session: &BrokerSession) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, _topic: &str, sink: MessageSink) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.sinks.lock().insert(self.device_id.clone(), sink);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.sinks.lock().remove(&self.device_id);
        Ok(())
    }
}

/// Builds fake transports, optionally failing the first `failing` devices.
#[derive(Default)]
pub struct FakeTransports {
    failure: Option<(BackendOp, u16)>,
    failing: Mutex<usize>,
    pub calls: Arc<Mutex<Vec<(String, BackendOp)>>>,
    pub sinks: Arc<Mutex<HashMap<String, MessageSink>>>,
}

impl FakeTransports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the first `devices` devices built answer `status` to `op`.
    pub fn failing(devices: usize, op: BackendOp, status: u16) -> Self {
        Self {
            failure: Some((op, status)),
            failing: Mutex::new(devices),
            ..Self::default()
        }
    }

    pub fn calls_for(&self, device_id: &str) -> Vec<BackendOp> {
        self.calls
            .lock()
            .iter()
            .filter(|(id, _)| id == device_id)
            .map(|(_, op)| *op)
            .collect()
    }

    /// Delivers a command message to a subscribed device.
    pub fn deliver(&self, device_id: &str, payload: &str) -> bool {
        let sink = self.sinks.lock().get(device_id).cloned();
        match sink {
            Some(sink) => {
                sink.deliver(&format!("/device/{device_id}/commands"), payload.as_bytes());
                true
            }
            None => false,
        }
    }
}

impl TransportFactory for FakeTransports {
    fn backend(&self, identity: &DeviceIdentity) -> Result<Arc<dyn BackendTransport>, TransportError> {
        let mut failing = self.failing.lock();
        let failure = if *failing > 0 {
            *failing -= 1;
            self.failure
        } else {
            None
        };

        Ok(Arc::new(FakeBackend {
            device_id: identity.device_id.to_string(),
            failure,
            calls: Arc::clone(&self.calls),
        }))
    }

    fn broker(&self, identity: &DeviceIdentity) -> Box<dyn BrokerTransport> {
        Box::new(FakeBroker {
            device_id: identity.device_id.to_string(),
            sinks: Arc::clone(&self.sinks),
            connected: false,
        })
    }
}

/// Two categories, "a" and "b", with two targets each.
pub fn two_category_catalog() -> StaticCatalog {
    let mut entries = BTreeMap::new();
    entries.insert(
        "a".to_string(),
        vec![
            Target::new("a", "a-rail", "1", "A1", "N"),
            Target::new("a", "a-rail", "2", "A2", "S"),
        ],
    );
    entries.insert(
        "b".to_string(),
        vec![
            Target::new("b", "b-bus", "10", "B10", ""),
            Target::new("b", "b-bus", "20", "B20", ""),
        ],
    );
    StaticCatalog::new(entries)
}

/// Config for `devices` devices split evenly over the test catalog.
pub fn test_config(devices: usize) -> Config {
    let mut config = Config::default();
    config.fleet.devices = devices;
    config.fleet.distribution = [("a".to_string(), 50), ("b".to_string(), 50)]
        .into_iter()
        .collect();
    config.stats.tick_interval_ms = 10;
    config
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
