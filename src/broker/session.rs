//! Broker Session
//!
//! Keeps exactly one live session to the broker, reconnecting forever.
//! Consumers learn about the session through [`SessionEvent`]s:
//!
//! ```text
//! disconnected ──connect──► connecting ──ok──► connected ──link drops──► disconnected ─► ...
//!                               │
//!                               └──fail──► (retry delay) ─► connecting
//! ```
//!
//! # Backoff
//!
//! A single "last attempt succeeded" flag decides whether to wait before the
//! next attempt: after a session that was up and then dropped, the first
//! reconnect is immediate; every failed attempt is followed by the same
//! fixed delay.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::link::{BrokerConnector, BrokerMessage, Credentials, SessionHandle};

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the session
pub enum SessionEvent {
    /// A session is up; the handle stays valid until `Disconnected`
    Connected(SessionHandle),
    /// The session went away
    Disconnected,
    /// A message arrived on one of the session's subscriptions
    Message(BrokerMessage),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Connected(_) => write!(f, "Connected"),
            SessionEvent::Disconnected => write!(f, "Disconnected"),
            SessionEvent::Message(message) => f.debug_tuple("Message").field(message).finish(),
        }
    }
}

/// The process-wide broker session
pub struct BrokerSession {
    connector: Arc<dyn BrokerConnector>,
    credentials: Option<Credentials>,
    retry_delay: Duration,
    state: Arc<RwLock<SessionState>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl BrokerSession {
    /// Create the session and the receiver for its events
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        credentials: Option<Credentials>,
        retry_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            connector,
            credentials,
            retry_delay,
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
            events,
        };
        (session, events_rx)
    }

    /// Current connection state
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Run the connect / wait / reconnect loop. Never returns.
    pub async fn run(&self) {
        let mut last_attempt_succeeded = false;

        loop {
            *self.state.write() = SessionState::Connecting;
            let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();

            if let Some(link) = self.attempt(inbound_tx).await {
                last_attempt_succeeded = true;
                *self.state.write() = SessionState::Connected;
                info!("Broker: session established");
                self.emit(SessionEvent::Connected(link.clone()));

                loop {
                    tokio::select! {
                        biased;
                        Some(message) = inbound_rx.recv() => {
                            self.emit(SessionEvent::Message(message));
                        }
                        _ = link.closed() => break,
                    }
                }

                *self.state.write() = SessionState::Disconnected;
                warn!("Broker: session lost");
                self.emit(SessionEvent::Disconnected);
                link.close().await;
            } else {
                *self.state.write() = SessionState::Disconnected;
            }

            if !last_attempt_succeeded {
                debug!("Broker: retrying in {:?}", self.retry_delay);
                tokio::time::sleep(self.retry_delay).await;
            }
            last_attempt_succeeded = false;
        }
    }

    /// Connect and, when configured, authenticate. Failures are logged and
    /// any half-open link is closed.
    async fn attempt(&self, inbound: mpsc::UnboundedSender<BrokerMessage>) -> Option<SessionHandle> {
        let link = match self.connector.connect(inbound).await {
            Ok(link) => link,
            Err(e) => {
                error!("Broker: connect failed: {}", e);
                return None;
            }
        };

        if let Some(credentials) = &self.credentials {
            if let Err(e) = link.authenticate(credentials).await {
                error!("Broker: authentication as '{}' failed: {}", credentials.user, e);
                link.close().await;
                return None;
            }
            debug!("Broker: authenticated as '{}'", credentials.user);
        }

        Some(link)
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Broker: no session event consumer");
        }
    }
}
