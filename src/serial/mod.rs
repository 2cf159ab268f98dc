//! Serial Device Layer
//!
//! Everything the rest of the crate needs to know about serial lines:
//! canonical device identities, line settings, framing, the open-device
//! handle and the opener that produces it.

mod device;
mod framing;
mod opener;
mod settings;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

pub use device::{Device, DeviceError, DeviceEvent};
pub use framing::{FrameDecoder, Framing, LineDecoder};
pub use opener::{DeviceOpener, TokioSerialOpener};
pub use settings::{Parity, SerialSettings, DEFAULT_BAUD_RATE, DEFAULT_DATA_BITS, DEFAULT_STOP_BITS};

/// Canonical identity of a device: its real path with every symlink resolved.
///
/// Aliases such as `/dev/serial/by-id/...` resolve to the same identity as
/// the node they point at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity(PathBuf);

impl DeviceIdentity {
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Resolve a configured location to its canonical identity.
///
/// Fails when the location (or the node it points at) does not exist.
pub async fn resolve(location: &Path) -> io::Result<DeviceIdentity> {
    tokio::fs::canonicalize(location).await.map(DeviceIdentity)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_follows_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("ttyUSB0");
        std::fs::write(&node, b"").unwrap();
        let alias = dir.path().join("by-id-ftdi");
        std::os::unix::fs::symlink(&node, &alias).unwrap();

        let direct = resolve(&node).await.unwrap();
        let via_alias = resolve(&alias).await.unwrap();
        assert_eq!(direct, via_alias);
        assert_eq!(direct.path(), std::fs::canonicalize(&node).unwrap());
    }

    #[tokio::test]
    async fn test_resolve_missing_device_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve(&dir.path().join("ttyACM9")).await.is_err());

        // A dangling alias is just as absent.
        let alias = dir.path().join("dangling");
        std::os::unix::fs::symlink(dir.path().join("gone"), &alias).unwrap();
        assert!(resolve(&alias).await.is_err());
    }
}
