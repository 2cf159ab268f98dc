//! SerialMQ - serial device to MQTT gateway
//!
//! Bridges line-oriented serial devices to broker topics: data read from a
//! device is published on `<prefix>/rx`, messages on `<prefix>/tx` are written
//! to the device, and the device lifecycle is reported on `<prefix>/state`.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod gateway;
pub mod scanner;
pub mod serial;
pub mod sleep;

#[cfg(test)]
mod testing;

pub use bridge::{BridgeError, ConnectionBridge};
pub use broker::{BrokerSession, MqttConnector, SessionEvent, SessionState};
pub use config::Config;
pub use gateway::Gateway;
pub use scanner::{DeviceScanner, OpenHandler};
pub use serial::{Device, DeviceIdentity, TokioSerialOpener};
pub use sleep::{InterruptibleSleep, SleepOutcome};
