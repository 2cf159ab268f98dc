//! Broker Connectivity
//!
//! The link abstraction the rest of the crate talks to, its MQTT
//! implementation, and the session that keeps one link alive at a time.

mod link;
mod mqtt;
mod session;


pub use link::{
    BrokerConnector, BrokerError, BrokerLink, BrokerMessage, Credentials, InboundSender, Payload,
    SessionHandle,
};
pub use mqtt::{MqttConnector, MqttLink};
pub use session::{BrokerSession, SessionEvent, SessionState};
