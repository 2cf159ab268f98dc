//! Gateway
//!
//! Wires the broker session, the device scanner and the connection bridge
//! together and runs them until shutdown. Discovery only runs while a broker
//! session is up: the scanner is resumed on `Connected` and paused on
//! `Disconnected`, right before the bridge drops every connection.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bridge::ConnectionBridge;
use crate::broker::{BrokerConnector, BrokerError, BrokerSession, MqttConnector, SessionEvent};
use crate::config::Config;
use crate::scanner::DeviceScanner;
use crate::serial::{DeviceOpener, TokioSerialOpener};

pub struct Gateway {
    session: Arc<BrokerSession>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    scanner: Arc<DeviceScanner>,
    bridge: Arc<ConnectionBridge>,
}

impl Gateway {
    /// Gateway talking MQTT to the configured broker and opening real serial ports
    pub fn new(config: &Config) -> Result<Self, BrokerError> {
        let connector = Arc::new(MqttConnector::new(&config.broker)?);
        Ok(Self::with_parts(config, connector, Arc::new(TokioSerialOpener)))
    }

    /// Gateway over the given broker connector and device opener
    pub fn with_parts(
        config: &Config,
        connector: Arc<dyn BrokerConnector>,
        opener: Arc<dyn DeviceOpener>,
    ) -> Self {
        let (session, events) = BrokerSession::new(
            connector,
            config.broker.credentials(),
            config.broker.retry_delay,
        );
        let bridge = Arc::new(ConnectionBridge::new());
        let scanner = Arc::new(DeviceScanner::new(
            config.ports.clone(),
            config.scanner.clone(),
            opener,
            bridge.clone(),
        ));
        // Nothing to publish to until the first session is up.
        scanner.pause();

        Self {
            session: Arc::new(session),
            events,
            scanner,
            bridge,
        }
    }

    pub fn session(&self) -> &Arc<BrokerSession> {
        &self.session
    }

    pub fn scanner(&self) -> &Arc<DeviceScanner> {
        &self.scanner
    }

    pub fn bridge(&self) -> &Arc<ConnectionBridge> {
        &self.bridge
    }

    /// Run until `shutdown` resolves, then tear down gracefully
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let Gateway {
            session,
            mut events,
            scanner,
            bridge,
        } = self;

        let session_task = tokio::spawn({
            let session = session.clone();
            async move { session.run().await }
        });
        let scanner_task = tokio::spawn({
            let scanner = scanner.clone();
            async move { scanner.run().await }
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(event) => handle(&scanner, &bridge, event),
                    None => break,
                },
            }
        }

        info!("Gateway: shutting down");
        scanner.pause();
        scanner_task.abort();
        session_task.abort();

        if let Some(link) = bridge.shutdown().await {
            link.close().await;
        }
        info!("Gateway: stopped");
    }
}

fn handle(scanner: &DeviceScanner, bridge: &ConnectionBridge, event: SessionEvent) {
    match event {
        SessionEvent::Connected(link) => {
            bridge.session_established(link);
            scanner.resume();
        }
        SessionEvent::Disconnected => {
            scanner.pause();
            bridge.session_lost();
        }
        SessionEvent::Message(message) => {
            debug!(
                "Gateway: {} bytes on {}",
                message.payload.as_bytes().len(),
                message.topic
            );
            bridge.dispatch(message);
        }
    }
}
