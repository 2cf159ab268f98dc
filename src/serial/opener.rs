//! Device Opener
//!
//! The seam between the scanner and real hardware. [`TokioSerialOpener`]
//! opens tty nodes through `tokio-serial`; tests substitute in-memory lines.

use async_trait::async_trait;
use tokio_serial::SerialPortBuilderExt;
use tracing::debug;

use super::device::{Device, DeviceError};
use super::framing::Framing;
use super::settings::{Parity, SerialSettings};
use super::DeviceIdentity;

/// Opens devices by canonical identity
#[async_trait]
pub trait DeviceOpener: Send + Sync {
    /// Open the device and start its I/O task
    async fn open(
        &self,
        identity: &DeviceIdentity,
        settings: &SerialSettings,
        framing: Framing,
    ) -> Result<Device, DeviceError>;
}

/// Opens real serial ports
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSerialOpener;

#[async_trait]
impl DeviceOpener for TokioSerialOpener {
    async fn open(
        &self,
        identity: &DeviceIdentity,
        settings: &SerialSettings,
        framing: Framing,
    ) -> Result<Device, DeviceError> {
        let path = identity.path().to_string_lossy().into_owned();

        let builder = tokio_serial::new(path, settings.baud_rate)
            .parity(parity(settings.parity))
            .data_bits(data_bits(settings.data_bits)?)
            .stop_bits(stop_bits(settings.stop_bits)?);

        // Opening a tty can block in the driver; keep it off the runtime threads.
        let stream = tokio::task::spawn_blocking(move || builder.open_native_async())
            .await
            .map_err(|e| DeviceError::Open(e.to_string()))?
            .map_err(|e| DeviceError::Open(e.to_string()))?;

        debug!("Opened {} at {}", identity, settings);
        Ok(Device::spawn(identity.clone(), stream, framing))
    }
}

fn parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

fn data_bits(bits: u8) -> Result<tokio_serial::DataBits, DeviceError> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(DeviceError::Open(format!("unsupported data bits: {}", other))),
    }
}

fn stop_bits(bits: u8) -> Result<tokio_serial::StopBits, DeviceError> {
    match bits {
        1 => Ok(tokio_serial::StopBits::One),
        2 => Ok(tokio_serial::StopBits::Two),
        other => Err(DeviceError::Open(format!("unsupported stop bits: {}", other))),
    }
}
