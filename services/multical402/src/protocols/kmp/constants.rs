//! KMP protocol constants
//!
//! Values observed on Multical 402 meters read through the optical head.

use serde::{Deserialize, Serialize};

// ============================================================================
// Frame Delimiters
// ============================================================================

/// First byte of every request frame (master to meter)
pub const REQUEST_START: u8 = 0x80;

/// First byte of every response frame (meter to master)
pub const RESPONSE_START: u8 = 0x40;

/// Frame terminator
pub const FRAME_END: u8 = 0x0D;

/// Acknowledge byte, reserved on the wire
pub const ACK: u8 = 0x06;

/// Escape prefix for reserved bytes inside a frame
pub const ESCAPE: u8 = 0x1B;

/// Reserved bytes are sent as `ESCAPE, byte ^ ESCAPE_XOR`
pub const ESCAPE_XOR: u8 = 0xFF;

/// Bytes that can never appear unescaped between start and end markers
pub const RESERVED_BYTES: [u8; 5] = [ACK, FRAME_END, ESCAPE, RESPONSE_START, REQUEST_START];

// ============================================================================
// Commands
// ============================================================================

/// Read one or more registers
pub const CMD_GET_REGISTER: u8 = 0x10;

/// Number of registers requested per frame
pub const REGISTERS_PER_REQUEST: u8 = 0x01;

// ============================================================================
// Frame Size Limits
// ============================================================================

/// Maximum wire bytes collected for one frame, start and end markers included
///
/// A fully escaped single-register response is 2 + 2 * 15 = 32 bytes, this
/// leaves room for longer mantissas without letting a noisy line grow the
/// buffer without bound.
pub const MAX_FRAME_LEN: usize = 64;

/// Destuffed response header: destination, command, register (2), unit,
/// width, sign/exponent
pub const RESPONSE_HEADER_LEN: usize = 7;

/// Trailing CRC bytes on every frame
pub const CRC_LEN: usize = 2;

/// Mantissa width the Multical 402 sends for every polled register
pub const EXPECTED_MANTISSA_WIDTH: usize = 4;

// ============================================================================
// Sign/Exponent Byte
// ============================================================================

/// Mantissa is negative
pub const SIEX_MANTISSA_SIGN: u8 = 0x80;

/// Exponent is negative
pub const SIEX_EXPONENT_SIGN: u8 = 0x40;

/// Exponent magnitude
pub const SIEX_EXPONENT_MASK: u8 = 0x3F;

/// Addressable endpoint in the meter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    /// Calculator itself, holds every register this service reads
    #[default]
    HeatMeter,
    /// Top logger module
    LoggerTop,
    /// Base logger module
    LoggerBase,
}

impl Destination {
    pub const fn address(self) -> u8 {
        match self {
            Destination::HeatMeter => 0x3F,
            Destination::LoggerTop => 0x7F,
            Destination::LoggerBase => 0xBF,
        }
    }

    pub fn from_address(address: u8) -> Option<Self> {
        match address {
            0x3F => Some(Destination::HeatMeter),
            0x7F => Some(Destination::LoggerTop),
            0xBF => Some(Destination::LoggerBase),
            _ => None,
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Destination::HeatMeter => "heat_meter",
            Destination::LoggerTop => "logger_top",
            Destination::LoggerBase => "logger_base",
        };
        write!(f, "{} (0x{:02X})", name, self.address())
    }
}

#[inline]
pub fn is_reserved(byte: u8) -> bool {
    RESERVED_BYTES.contains(&byte)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_addresses() {
        assert_eq!(Destination::default().address(), 0x3F);
        assert_eq!(Destination::LoggerTop.address(), 0x7F);
        assert_eq!(Destination::LoggerBase.address(), 0xBF);
        assert_eq!(Destination::from_address(0x7F), Some(Destination::LoggerTop));
        assert_eq!(Destination::from_address(0x00), None);
    }

    #[test]
    fn test_destination_display() {
        assert_eq!(Destination::HeatMeter.to_string(), "heat_meter (0x3F)");
        assert_eq!(Destination::LoggerBase.to_string(), "logger_base (0xBF)");
    }

    #[test]
    fn test_reserved_bytes() {
        for b in [0x06, 0x0D, 0x1B, 0x40, 0x80] {
            assert!(is_reserved(b));
        }
        assert!(!is_reserved(0x3F));
        assert!(!is_reserved(0x10));
        // Escaped form of a reserved byte is never itself reserved
        for b in RESERVED_BYTES {
            assert!(!is_reserved(b ^ ESCAPE_XOR));
        }
    }
}
