//! Broker transport over MQTT.

use super::{BrokerSession, BrokerTransport, MessageSink, PRESENCE_OFFLINE, PRESENCE_ONLINE};
use crate::config::BrokerSettings;
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event as MqttEvent, EventLoop, LastWill, MqttOptions, Outgoing,
    Packet, QoS, SubAck, SubscribeReasonCode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Capacity of the client request channel.
const REQUEST_CAPACITY: usize = 16;

/// Pause before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Active subscription: the topic and where its messages go.
type Subscription = Arc<Mutex<Option<(String, MessageSink)>>>;

/// Caller waiting for the acknowledgement of its SUBSCRIBE.
type SubAckWaiter = Arc<Mutex<Option<oneshot::Sender<SubAck>>>>;

/// rumqttc connection for one device.
///
/// After the initial handshake a background task polls the event loop,
/// routing publishes to the subscribed sink. It exits when the client sends
/// DISCONNECT, and is aborted if the broker is dropped first.
pub struct MqttBroker {
    settings: BrokerSettings,
    client: Option<AsyncClient>,
    presence_topic: String,
    subscription: Subscription,
    suback: SubAckWaiter,
    pump: Option<JoinHandle<()>>,
}

impl MqttBroker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            client: None,
            presence_topic: String::new(),
            subscription: Arc::new(Mutex::new(None)),
            suback: Arc::new(Mutex::new(None)),
            pump: None,
        }
    }

    fn options(&self, session: &BrokerSession) -> MqttOptions {
        let mut options = MqttOptions::new(
            session.client_id.clone(),
            self.settings.host.clone(),
            self.settings.port,
        );
        options
            .set_credentials(self.settings.username.clone(), self.settings.password.clone())
            .set_keep_alive(Duration::from_secs(self.settings.keep_alive_secs))
            .set_clean_session(true)
            .set_last_will(LastWill::new(
                session.presence_topic.clone(),
                PRESENCE_OFFLINE,
                QoS::AtLeastOnce,
                true,
            ));
        options
    }
}

#[async_trait]
impl BrokerTransport for MqttBroker {
    async fn connect(&mut self, session: &BrokerSession) -> Result<(), TransportError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(session), REQUEST_CAPACITY);

        loop {
            if let MqttEvent::Incoming(Packet::ConnAck(ack)) = eventloop.poll().await? {
                if ack.code != ConnectReturnCode::Success {
                    return Err(TransportError::Broker(format!(
                        "connection refused: {:?}",
                        ack.code
                    )));
                }
                break;
            }
        }

        self.presence_topic = session.presence_topic.clone();
        self.pump = Some(tokio::spawn(pump(
            eventloop,
            client.clone(),
            self.presence_topic.clone(),
            Arc::clone(&self.subscription),
            Arc::clone(&self.suback),
        )));

        client
            .publish(&self.presence_topic, QoS::AtLeastOnce, true, PRESENCE_ONLINE)
            .await?;
        self.client = Some(client);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, sink: MessageSink) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        *self.suback.lock() = Some(tx);
        *self.subscription.lock() = Some((topic.to_string(), sink));
        client.subscribe(topic, QoS::AtLeastOnce).await?;

        let ack = rx
            .await
            .map_err(|_| TransportError::Broker("connection closed before SUBACK".to_string()))?;
        if let Err(e) = check_suback(&ack) {
            *self.subscription.lock() = None;
            return Err(e);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };

        client
            .publish(&self.presence_topic, QoS::AtLeastOnce, true, PRESENCE_OFFLINE)
            .await?;
        client.disconnect().await?;

        if let Some(pump) = self.pump.as_mut() {
            let _ = pump.await;
        }
        self.pump = None;
        *self.subscription.lock() = None;
        Ok(())
    }
}

/// Fails if the broker refused any of the requested filters.
fn check_suback(ack: &SubAck) -> Result<(), TransportError> {
    if ack
        .return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
    {
        return Err(TransportError::Broker(format!(
            "subscription rejected (packet {})",
            ack.pkid
        )));
    }
    Ok(())
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Drives the event loop after the initial handshake.
async fn pump(
    mut eventloop: EventLoop,
    client: AsyncClient,
    presence_topic: String,
    subscription: Subscription,
    suback: SubAckWaiter,
) {
    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                let sink = subscription.lock().as_ref().map(|(_, sink)| sink.clone());
                if let Some(sink) = sink {
                    sink.deliver(&publish.topic, &publish.payload);
                }
            }
            Ok(MqttEvent::Incoming(Packet::SubAck(ack))) => {
                let waiter = suback.lock().take();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(ack);
                    }
                    // Resubscribe after a reconnect
                    None => {
                        if let Err(e) = check_suback(&ack) {
                            warn!("Resubscribe on {} failed: {}", presence_topic, e);
                        }
                    }
                }
            }
            Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                // Reconnected with a clean session: announce and resubscribe
                debug!("Reconnected to broker as {}", presence_topic);
                if let Err(e) = client.try_publish(&presence_topic, QoS::AtLeastOnce, true, PRESENCE_ONLINE) {
                    warn!("Failed to republish presence: {}", e);
                }
                let topic = subscription.lock().as_ref().map(|(topic, _)| topic.clone());
                if let Some(topic) = topic {
                    if let Err(e) = client.try_subscribe(&topic, QoS::AtLeastOnce) {
                        warn!("Failed to resubscribe to {}: {}", topic, e);
                    }
                }
            }
            Ok(MqttEvent::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Broker connection error on {}: {}", presence_topic, e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
