//! Topic Layout
//!
//! Every bridged port owns three topics under `<node>/<prefix>`:
//!
//! | Topic    | Direction       | Payload                                   |
//! |----------|-----------------|-------------------------------------------|
//! | `rx`     | published       | data received from the device             |
//! | `tx`     | subscribed      | data to write to the device               |
//! | `state`  | published       | `open`, `close` or `error <kind> <msg>`   |

use bytes::Bytes;

use crate::serial::DeviceError;

pub const RX: &str = "rx";
pub const TX: &str = "tx";
pub const STATE: &str = "state";

pub const STATE_OPEN: &[u8] = b"open";
pub const STATE_CLOSE: &[u8] = b"close";

/// Build `<node>/<prefix>/<leaf>`; an empty node starts the topic at the prefix
pub fn topic(node: &str, prefix: &str, leaf: &str) -> String {
    if node.is_empty() {
        format!("{}/{}", prefix, leaf)
    } else {
        format!("{}/{}/{}", node, prefix, leaf)
    }
}

/// `state` payload describing a device failure
pub fn error_state(error: &DeviceError) -> Bytes {
    Bytes::from(format!("error {} {}", error.kind(), error.message()))
}
