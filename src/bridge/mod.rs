//! Connection Bridge
//!
//! Binds each open device to exactly one broker subscription and keeps the
//! two lifetimes coupled:
//!
//! - `attach` subscribes `<prefix>/tx`, then announces `open` on
//!   `<prefix>/state`; only after that does device data flow.
//! - Device data goes to `<prefix>/rx`, device errors to `<prefix>/state`.
//! - When the device closes the bridge publishes `close`, unsubscribes and
//!   forgets the connection.
//! - When the session goes away every device is force-closed; a new session
//!   starts from nothing.
//!
//! The topic prefix doubles as the subscription identity, so at most one
//! connection per prefix may exist at a time.

mod topics;


pub use topics::{error_state, topic, RX, STATE, STATE_CLOSE, STATE_OPEN, TX};

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::broker::{BrokerError, BrokerMessage, Payload, SessionHandle};
use crate::config::PortConfig;
use crate::scanner::OpenHandler;
use crate::serial::{Device, DeviceError, DeviceEvent, Framing};

/// Error type for bridge operations
#[derive(Debug)]
pub enum BridgeError {
    /// A connection already holds this topic prefix
    DuplicatePrefix(String),
    /// There is no broker session to attach to
    NotConnected,
    /// The device is closed or already bridged elsewhere
    DeviceUnavailable,
    /// Broker operation failed during attach
    Broker(BrokerError),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::DuplicatePrefix(prefix) => {
                write!(f, "Topic prefix '{}' is already bridged", prefix)
            }
            BridgeError::NotConnected => write!(f, "No broker session"),
            BridgeError::DeviceUnavailable => write!(f, "Device unavailable"),
            BridgeError::Broker(e) => write!(f, "Broker error: {}", e),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<BrokerError> for BridgeError {
    fn from(e: BrokerError) -> Self {
        BridgeError::Broker(e)
    }
}

/// One bridged device
pub struct Connection {
    node: String,
    prefix: String,
    framing: Framing,
    device: Device,
    link: SessionHandle,
    /// Set once `open` has been announced
    ready: AtomicBool,
    /// Set when the session went away underneath the connection
    swept: AtomicBool,
}

impl Connection {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn topic(&self, leaf: &str) -> String {
        topic(&self.node, &self.prefix, leaf)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn is_swept(&self) -> bool {
        self.swept.load(Ordering::SeqCst)
    }
}

type Connections = Arc<DashMap<String, Arc<Connection>>>;

/// Keeps device connections and the broker session coupled
#[derive(Default)]
pub struct ConnectionBridge {
    session: RwLock<Option<SessionHandle>>,
    /// topic prefix -> connection
    connections: Connections,
}

impl ConnectionBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether a connection currently holds `prefix`
    pub fn is_attached(&self, prefix: &str) -> bool {
        self.connections.contains_key(prefix)
    }

    pub fn has_session(&self) -> bool {
        self.session.read().is_some()
    }

    /// Adopt a freshly established session
    pub fn session_established(&self, link: SessionHandle) {
        let stale = self.sweep();
        if !stale.is_empty() {
            warn!("Bridge: dropped {} connection(s) of a previous session", stale.len());
        }
        *self.session.write() = Some(link);
    }

    /// The session is gone: force-close every bridged device
    pub fn session_lost(&self) {
        self.session.write().take();
        let swept = self.sweep();
        if !swept.is_empty() {
            info!("Bridge: session lost, closed {} device(s)", swept.len());
        }
    }

    /// Tear everything down, announcing `close` for every connection on the
    /// session that is going away. Returns that session for the caller to close.
    pub async fn shutdown(&self) -> Option<SessionHandle> {
        let link = self.session.write().take();
        let swept = self.sweep();

        if let Some(link) = &link {
            for connection in swept.iter().filter(|c| c.is_ready()) {
                let state = connection.topic(STATE);
                if let Err(e) = link.publish(&state, Bytes::from_static(STATE_CLOSE)).await {
                    debug!("Bridge '{}': close not published: {}", connection.prefix, e);
                }
            }
        }

        info!("Bridge: shut down {} connection(s)", swept.len());
        link
    }

    /// Bridge `device` under the port's topic prefix.
    ///
    /// Resolves once the `tx` subscription is confirmed and `open` has been
    /// published.
    pub async fn attach(&self, device: &Device, port: &PortConfig) -> Result<(), BridgeError> {
        let link = self.session.read().clone().ok_or(BridgeError::NotConnected)?;
        if !device.is_open() {
            return Err(BridgeError::DeviceUnavailable);
        }

        let prefix = port.topic_prefix.clone();
        let connection = Arc::new(Connection {
            node: port.node.clone(),
            prefix: prefix.clone(),
            framing: device.framing().clone(),
            device: device.clone(),
            link: link.clone(),
            ready: AtomicBool::new(false),
            swept: AtomicBool::new(false),
        });

        match self.connections.entry(prefix.clone()) {
            Entry::Occupied(_) => return Err(BridgeError::DuplicatePrefix(prefix)),
            Entry::Vacant(slot) => {
                slot.insert(connection.clone());
            }
        }

        let Some(events) = device.take_events() else {
            self.forget(&connection);
            return Err(BridgeError::DeviceUnavailable);
        };

        if let Err(e) = link.subscribe(&connection.topic(TX), &prefix).await {
            self.forget(&connection);
            return Err(e.into());
        }

        let state = connection.topic(STATE);
        if let Err(e) = link.publish(&state, Bytes::from_static(STATE_OPEN)).await {
            if let Err(e) = link.unsubscribe(&prefix).await {
                debug!("Bridge '{}': unsubscribe failed: {}", prefix, e);
            }
            self.forget(&connection);
            return Err(e.into());
        }

        if connection.is_swept() {
            return Err(BridgeError::NotConnected);
        }

        connection.ready.store(true, Ordering::SeqCst);
        info!(
            "Bridge '{}': attached {} ({})",
            prefix,
            device.identity(),
            if connection.framing.is_line_based() {
                "lines"
            } else {
                "raw"
            }
        );

        tokio::spawn(pump(connection, events, self.connections.clone()));
        Ok(())
    }

    /// Route an inbound broker message to the device that subscribed for it.
    ///
    /// Only queues the write: a device that is not draining its queue loses
    /// the message rather than holding up the caller.
    pub fn dispatch(&self, message: BrokerMessage) {
        let Some(connection) = self
            .connections
            .get(&message.subscription_id)
            .map(|entry| entry.value().clone())
        else {
            trace!(
                "Bridge: no connection for '{}', dropping message",
                message.subscription_id
            );
            return;
        };

        if !connection.is_ready() {
            debug!(
                "Bridge '{}': not announced yet, dropping message",
                connection.prefix
            );
            return;
        }

        let frame = match (&message.payload, connection.framing.is_line_based()) {
            (Payload::Binary(bytes), true) => {
                warn!(
                    "Bridge '{}': dropping {}-byte binary payload on a line-framed port",
                    connection.prefix,
                    bytes.len()
                );
                return;
            }
            (payload, _) => payload.as_bytes(),
        };

        match connection.device.try_write(frame) {
            Ok(()) => trace!("Bridge '{}': queued {} bytes", connection.prefix, frame.len()),
            Err(DeviceError::Busy) => warn!(
                "Bridge '{}': device is not keeping up, dropping {} bytes",
                connection.prefix,
                frame.len()
            ),
            Err(e) => warn!("Bridge '{}': write to device failed: {}", connection.prefix, e),
        }
    }

    /// Remove every connection, marking it swept and closing its device
    fn sweep(&self) -> Vec<Arc<Connection>> {
        let prefixes: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = Vec::with_capacity(prefixes.len());
        for prefix in prefixes {
            if let Some((_, connection)) = self.connections.remove(&prefix) {
                connection.swept.store(true, Ordering::SeqCst);
                connection.device.close();
                swept.push(connection);
            }
        }
        swept
    }

    fn forget(&self, connection: &Arc<Connection>) {
        forget(&self.connections, connection);
    }
}

fn forget(connections: &DashMap<String, Arc<Connection>>, connection: &Arc<Connection>) {
    connections.remove_if(&connection.prefix, |_, current| {
        Arc::ptr_eq(current, connection)
    });
}

/// Forward device events until the device closes, then detach
async fn pump(
    connection: Arc<Connection>,
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
    connections: Connections,
) {
    while let Some(event) = events.recv().await {
        if connection.is_swept() {
            break;
        }

        let (topic, payload) = match event {
            DeviceEvent::Data(frame) => (connection.topic(RX), frame),
            DeviceEvent::Error(e) => {
                warn!("Bridge '{}': device error: {}", connection.prefix, e);
                (connection.topic(STATE), error_state(&e))
            }
        };

        if let Err(e) = connection.link.publish(&topic, payload).await {
            warn!(
                "Bridge '{}': publish to {} failed, closing device: {}",
                connection.prefix, topic, e
            );
            break;
        }
    }

    connection.device.close();

    if !connection.is_swept() {
        let link = &connection.link;
        if let Err(e) = link
            .publish(&connection.topic(STATE), Bytes::from_static(STATE_CLOSE))
            .await
        {
            debug!("Bridge '{}': close not published: {}", connection.prefix, e);
        }
        if let Err(e) = link.unsubscribe(&connection.prefix).await {
            debug!("Bridge '{}': unsubscribe failed: {}", connection.prefix, e);
        }
    }

    forget(&connections, &connection);
    info!("Bridge '{}': detached", connection.prefix);
}

#[async_trait]
impl OpenHandler for ConnectionBridge {
    async fn device_opened(
        &self,
        device: &Device,
        port: &PortConfig,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.attach(device, port).await.map_err(Into::into)
    }
}
