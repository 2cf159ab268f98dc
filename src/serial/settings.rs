//! Serial line settings
//!
//! Per-port overrides from configuration are merged over fixed defaults
//! (9600 baud, no parity, 8 data bits, 1 stop bit).

use serde::Deserialize;

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_DATA_BITS: u8 = 8;
pub const DEFAULT_STOP_BITS: u8 = 1;

/// Parity checking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl std::fmt::Display for Parity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Parity::None => write!(f, "none"),
            Parity::Even => write!(f, "even"),
            Parity::Odd => write!(f, "odd"),
        }
    }
}

/// Effective line settings used to open a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            parity: Parity::None,
            data_bits: DEFAULT_DATA_BITS,
            stop_bits: DEFAULT_STOP_BITS,
        }
    }
}

impl SerialSettings {
    /// Apply optional overrides on top of the defaults
    pub fn with_overrides(
        baud_rate: Option<u32>,
        parity: Option<Parity>,
        data_bits: Option<u8>,
        stop_bits: Option<u8>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            baud_rate: baud_rate.unwrap_or(defaults.baud_rate),
            parity: parity.unwrap_or(defaults.parity),
            data_bits: data_bits.unwrap_or(defaults.data_bits),
            stop_bits: stop_bits.unwrap_or(defaults.stop_bits),
        }
    }
}

impl std::fmt::Display for SerialSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate, self.data_bits, parity, self.stop_bits
        )
    }
}
