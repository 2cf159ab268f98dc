//! MQTT Link
//!
//! [`BrokerLink`] over `rumqttc`. Each link owns one event loop task; when
//! the event loop reports an error the link is down for good. Reconnecting
//! is the session's job, not the client library's.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode,
};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::link::{
    BrokerConnector, BrokerError, BrokerLink, BrokerMessage, Credentials, InboundSender, Payload,
    SessionHandle,
};
use crate::config::BrokerConfig;

/// Capacity of the request channel between client and event loop
const REQUEST_CAPACITY: usize = 64;

/// Grace period for DISCONNECT to be flushed before the event loop is stopped
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

type AckSender = oneshot::Sender<Result<(), BrokerError>>;

/// Connects to an MQTT broker
#[derive(Debug, Clone)]
pub struct MqttConnector {
    host: String,
    port: u16,
    client_id: String,
    keepalive: Duration,
    connect_timeout: Duration,
    credentials: Option<Credentials>,
    qos: QoS,
}

impl MqttConnector {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let (host, port) = config
            .parse_url()
            .map_err(|e| BrokerError::InvalidConfig(e.to_string()))?;
        let qos = match config.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            other => {
                return Err(BrokerError::InvalidConfig(format!(
                    "unsupported qos {}",
                    other
                )))
            }
        };

        Ok(Self {
            host,
            port,
            client_id: config.client_id.clone(),
            keepalive: config.keepalive_duration(),
            connect_timeout: config.connect_timeout,
            credentials: config.credentials(),
            qos,
        })
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options
            .set_keep_alive(self.keepalive)
            .set_clean_session(true);
        if let Some(credentials) = &self.credentials {
            options.set_credentials(
                credentials.user.clone(),
                credentials.pass.clone().unwrap_or_default(),
            );
        }
        options
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self, inbound: InboundSender) -> Result<SessionHandle, BrokerError> {
        debug!("Broker: connecting to {}:{}", self.host, self.port);
        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);

        timeout(self.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| BrokerError::Timeout)??;

        let state = Arc::new(LinkState::default());
        let (closed_tx, closed_rx) = watch::channel(false);
        let task = tokio::spawn(drive(eventloop, state.clone(), inbound, closed_tx));

        Ok(Arc::new(MqttLink {
            client,
            qos: self.qos,
            credentials: self.credentials.clone(),
            state,
            requests: tokio::sync::Mutex::new(()),
            closed: closed_rx,
            task: Mutex::new(Some(task)),
        }))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(BrokerError::Rejected(format!("CONNACK {:?}", ack.code)))
                };
            }
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(BrokerError::Rejected(format!("CONNACK {:?}", code)));
            }
            Err(e) => return Err(BrokerError::ConnectionLost(e.to_string())),
        }
    }
}

/// Acknowledgement bookkeeping.
///
/// Waiters are queued in request order and bound to a packet id when the
/// event loop reports the matching outgoing packet.
#[derive(Default)]
struct PendingAcks {
    queued_subscribes: VecDeque<AckSender>,
    queued_unsubscribes: VecDeque<AckSender>,
    subscribes: HashMap<u16, AckSender>,
    unsubscribes: HashMap<u16, AckSender>,
}

impl PendingAcks {
    fn subscribe_sent(&mut self, pkid: u16) {
        if let Some(waiter) = self.queued_subscribes.pop_front() {
            self.subscribes.insert(pkid, waiter);
        }
    }

    fn unsubscribe_sent(&mut self, pkid: u16) {
        if let Some(waiter) = self.queued_unsubscribes.pop_front() {
            self.unsubscribes.insert(pkid, waiter);
        }
    }

    fn subscribe_acked(&mut self, pkid: u16, result: Result<(), BrokerError>) {
        if let Some(waiter) = self.subscribes.remove(&pkid) {
            let _ = waiter.send(result);
        }
    }

    fn unsubscribe_acked(&mut self, pkid: u16) {
        if let Some(waiter) = self.unsubscribes.remove(&pkid) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Drop every waiter; they observe the link going down
    fn clear(&mut self) {
        self.queued_subscribes.clear();
        self.queued_unsubscribes.clear();
        self.subscribes.clear();
        self.unsubscribes.clear();
    }
}

#[derive(Default)]
struct LinkState {
    pending: Mutex<PendingAcks>,
    /// topic -> subscription id
    routes: RwLock<HashMap<String, String>>,
}

impl LinkState {
    fn route(&self, topic: &str) -> Option<String> {
        self.routes.read().get(topic).cloned()
    }

    fn topic_for(&self, subscription_id: &str) -> Option<String> {
        self.routes
            .read()
            .iter()
            .find(|(_, id)| id.as_str() == subscription_id)
            .map(|(topic, _)| topic.clone())
    }
}

async fn drive(
    mut eventloop: EventLoop,
    state: Arc<LinkState>,
    inbound: InboundSender,
    closed: watch::Sender<bool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                state.pending.lock().subscribe_sent(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                state.pending.lock().unsubscribe_sent(pkid);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let result = if ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
                {
                    Ok(())
                } else {
                    Err(BrokerError::Rejected(format!(
                        "SUBACK {:?}",
                        ack.return_codes
                    )))
                };
                state.pending.lock().subscribe_acked(ack.pkid, result);
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                state.pending.lock().unsubscribe_acked(ack.pkid);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => match state.route(&publish.topic) {
                Some(subscription_id) => {
                    let message = BrokerMessage {
                        subscription_id,
                        topic: publish.topic,
                        payload: Payload::decode(publish.payload),
                    };
                    if inbound.send(message).is_err() {
                        trace!("Broker: inbound receiver gone, dropping message");
                    }
                }
                None => trace!("Broker: no route for {}, dropping", publish.topic),
            },
            Ok(event) => trace!("Broker: {:?}", event),
            Err(e) => {
                warn!("Broker: link down: {}", e);
                break;
            }
        }
    }

    state.pending.lock().clear();
    closed.send_replace(true);
}

/// Live MQTT connection
pub struct MqttLink {
    client: AsyncClient,
    qos: QoS,
    credentials: Option<Credentials>,
    state: Arc<LinkState>,
    /// Serializes subscribe/unsubscribe so waiter order matches packet order
    requests: tokio::sync::Mutex<()>,
    closed: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttLink {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), BrokerError> {
        // MQTT presents credentials in CONNECT; an accepted CONNACK already
        // authenticated exactly those.
        match &self.credentials {
            Some(presented) if presented == credentials => Ok(()),
            _ => Err(BrokerError::Rejected(
                "credentials differ from those presented at connect".to_string(),
            )),
        }
    }

    async fn subscribe(&self, topic: &str, subscription_id: &str) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::ConnectionLost("link is down".to_string()));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let _order = self.requests.lock().await;
            self.state
                .routes
                .write()
                .insert(topic.to_string(), subscription_id.to_string());
            self.state.pending.lock().queued_subscribes.push_back(ack_tx);

            if let Err(e) = self.client.subscribe(topic, self.qos).await {
                self.state.pending.lock().queued_subscribes.pop_back();
                self.state.routes.write().remove(topic);
                return Err(BrokerError::ConnectionLost(e.to_string()));
            }
        }

        let result = match ack_rx.await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::ConnectionLost(
                "link closed before SUBACK".to_string(),
            )),
        };
        if result.is_err() {
            self.state.routes.write().remove(topic);
        }
        result
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), BrokerError> {
        let topic = self.state.topic_for(subscription_id).ok_or_else(|| {
            BrokerError::Other(format!("no subscription '{}'", subscription_id))
        })?;
        // Stop routing right away; late messages are dropped.
        self.state.routes.write().remove(&topic);

        if self.is_closed() {
            return Err(BrokerError::ConnectionLost("link is down".to_string()));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let _order = self.requests.lock().await;
            self.state
                .pending
                .lock()
                .queued_unsubscribes
                .push_back(ack_tx);

            if let Err(e) = self.client.unsubscribe(topic).await {
                self.state.pending.lock().queued_unsubscribes.pop_back();
                return Err(BrokerError::ConnectionLost(e.to_string()));
            }
        }

        match ack_rx.await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::ConnectionLost(
                "link closed before UNSUBACK".to_string(),
            )),
        }
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::ConnectionLost("link is down".to_string()));
        }
        self.client
            .publish(topic, self.qos, false, payload.to_vec())
            .await
            .map_err(|e| BrokerError::ConnectionLost(e.to_string()))
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        if !self.is_closed() {
            if let Err(e) = self.client.try_disconnect() {
                debug!("Broker: disconnect not sent: {}", e);
            }
            let _ = timeout(DISCONNECT_GRACE, self.closed()).await;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::BrokerConfig;

    #[test]
    fn test_connector_from_config() {
        let config = BrokerConfig {
            url: "mqtt://broker.local:1884".to_string(),
            user: Some("bridge".to_string()),
            pass: Some("secret".to_string()),
            qos: 1,
            ..Default::default()
        };
        let connector = MqttConnector::new(&config).unwrap();
        assert_eq!(connector.host, "broker.local");
        assert_eq!(connector.port, 1884);
        assert_eq!(connector.qos, QoS::AtLeastOnce);
        assert_eq!(
            connector.credentials,
            Some(Credentials {
                user: "bridge".to_string(),
                pass: Some("secret".to_string()),
            })
        );
    }

    #[test]
    fn test_connector_rejects_bad_qos() {
        let config = BrokerConfig {
            qos: 2,
            ..Default::default()
        };
        assert!(matches!(
            MqttConnector::new(&config),
            Err(BrokerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_pending_acks_bind_in_request_order() {
        let mut pending = PendingAcks::default();
        let (first_tx, mut first_rx) = oneshot::channel();
        let (second_tx, mut second_rx) = oneshot::channel();
        pending.queued_subscribes.push_back(first_tx);
        pending.queued_subscribes.push_back(second_tx);

        pending.subscribe_sent(7);
        pending.subscribe_sent(8);

        pending.subscribe_acked(8, Err(BrokerError::Rejected("nope".into())));
        assert!(matches!(second_rx.try_recv(), Ok(Err(BrokerError::Rejected(_)))));
        assert!(first_rx.try_recv().is_err());

        pending.subscribe_acked(7, Ok(()));
        assert!(matches!(first_rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn test_pending_acks_clear_fails_waiters() {
        let mut pending = PendingAcks::default();
        let (tx, mut rx) = oneshot::channel();
        pending.queued_unsubscribes.push_back(tx);
        pending.clear();
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn test_routes_lookup_both_ways() {
        let state = LinkState::default();
        state
            .routes
            .write()
            .insert("lab/bench/tx".to_string(), "bench".to_string());
        assert_eq!(state.route("lab/bench/tx").as_deref(), Some("bench"));
        assert_eq!(state.topic_for("bench").as_deref(), Some("lab/bench/tx"));
        assert!(state.route("lab/other/tx").is_none());
    }
}
