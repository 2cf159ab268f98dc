//! Broker Link Abstraction
//!
//! The session and the bridge talk to the broker only through these traits,
//! so the reconnect and lifecycle logic stay independent of the client
//! library underneath.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Error type for broker operations
#[derive(Debug)]
pub enum BrokerError {
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Broker refused the connection, credentials, or a subscription
    Rejected(String),
    /// Operation timed out
    Timeout,
    /// Invalid configuration
    InvalidConfig(String),
    /// Other error
    Other(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            BrokerError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            BrokerError::Timeout => write!(f, "Operation timed out"),
            BrokerError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            BrokerError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Username/password presented to the broker
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Inbound message payload, decoded once at the broker boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Valid UTF-8
    Text(String),
    /// Anything else
    Binary(Bytes),
}

impl Payload {
    pub fn decode(bytes: Bytes) -> Self {
        match std::str::from_utf8(&bytes) {
            Ok(text) => Payload::Text(text.to_string()),
            Err(_) => Payload::Binary(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }
}

/// A message received on a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Identity the subscription was registered under
    pub subscription_id: String,
    pub topic: String,
    pub payload: Payload,
}

/// Channel on which a link delivers inbound messages
pub type InboundSender = mpsc::UnboundedSender<BrokerMessage>;

/// Live session handle shared by everything that talks to the broker
pub type SessionHandle = Arc<dyn BrokerLink>;

/// Establishes links to the broker
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect, delivering inbound messages on `inbound` for the link's lifetime
    async fn connect(&self, inbound: InboundSender) -> Result<SessionHandle, BrokerError>;
}

/// One established broker connection
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Authenticate the session
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), BrokerError>;

    /// Subscribe to `topic`, tagging its messages with `subscription_id`.
    ///
    /// Resolves once the broker has confirmed the subscription.
    async fn subscribe(&self, topic: &str, subscription_id: &str) -> Result<(), BrokerError>;

    /// Drop the subscription registered under `subscription_id`
    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), BrokerError>;

    /// Publish a message
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Resolves once the link is down
    async fn closed(&self);

    /// Close the link. Safe on a link that is already down.
    async fn close(&self);
}
