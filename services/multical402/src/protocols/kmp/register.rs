//! Register table and response decoding
//!
//! Every polled quantity is a single KMP register. A verified response
//! payload carries the register id, a unit code, the mantissa width, the
//! sign/exponent byte and a big-endian mantissa.

use std::fmt;

use tracing::{debug, warn};

use super::constants::{
    Destination, CMD_GET_REGISTER, EXPECTED_MANTISSA_WIDTH, RESPONSE_HEADER_LEN,
    SIEX_EXPONENT_MASK, SIEX_EXPONENT_SIGN, SIEX_MANTISSA_SIGN,
};
use crate::error::{KmpError, Result};

/// Registers read from the heat meter, declared in polling order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterId {
    Energy,
    Power,
    TempIn,
    TempOut,
    TempDiff,
    Flow,
    Volume,
}

impl RegisterId {
    /// All registers in polling order
    pub const ALL: [RegisterId; 7] = [
        RegisterId::Energy,
        RegisterId::Power,
        RegisterId::TempIn,
        RegisterId::TempOut,
        RegisterId::TempDiff,
        RegisterId::Flow,
        RegisterId::Volume,
    ];

    /// Static description of this register
    pub fn request(self) -> &'static RegisterRequest {
        &REGISTERS[self as usize]
    }

    /// KMP register code sent on the wire
    pub fn code(self) -> u16 {
        self.request().command_code
    }

    pub fn from_code(code: u16) -> Option<Self> {
        REGISTERS
            .iter()
            .find(|r| r.command_code == code)
            .map(|r| r.id)
    }

    /// Configuration key (`sensors.<key>`)
    pub fn key(self) -> &'static str {
        self.request().key
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// KMP unit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Wh,
    KWh,
    MWh,
    GWh,
    GJ,
    Gcal,
    KW,
    MW,
    Celsius,
    Kelvin,
    Litre,
    CubicMetre,
    LitrePerHour,
    CubicMetrePerHour,
    /// Any code this service does not map
    Other(u8),
}

impl Unit {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Unit::Wh,
            2 => Unit::KWh,
            3 => Unit::MWh,
            4 => Unit::GWh,
            8 => Unit::GJ,
            12 => Unit::Gcal,
            21 => Unit::KW,
            23 => Unit::MW,
            37 => Unit::Celsius,
            38 => Unit::Kelvin,
            39 => Unit::Litre,
            40 => Unit::CubicMetre,
            41 => Unit::LitrePerHour,
            42 => Unit::CubicMetrePerHour,
            other => Unit::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Unit::Wh => 1,
            Unit::KWh => 2,
            Unit::MWh => 3,
            Unit::GWh => 4,
            Unit::GJ => 8,
            Unit::Gcal => 12,
            Unit::KW => 21,
            Unit::MW => 23,
            Unit::Celsius => 37,
            Unit::Kelvin => 38,
            Unit::Litre => 39,
            Unit::CubicMetre => 40,
            Unit::LitrePerHour => 41,
            Unit::CubicMetrePerHour => 42,
            Unit::Other(code) => code,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Wh => "Wh",
            Unit::KWh => "kWh",
            Unit::MWh => "MWh",
            Unit::GWh => "GWh",
            Unit::GJ => "GJ",
            Unit::Gcal => "Gcal",
            Unit::KW => "kW",
            Unit::MW => "MW",
            Unit::Celsius => "°C",
            Unit::Kelvin => "K",
            Unit::Litre => "l",
            Unit::CubicMetre => "m³",
            Unit::LitrePerHour => "l/h",
            Unit::CubicMetrePerHour => "m³/h",
            Unit::Other(_) => "?",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Other(code) => write!(f, "unit#{}", code),
            unit => f.write_str(unit.symbol()),
        }
    }
}

/// Static description of one polled register
#[derive(Debug, Clone, Copy)]
pub struct RegisterRequest {
    pub id: RegisterId,
    /// KMP register id
    pub command_code: u16,
    /// Configuration key
    pub key: &'static str,
    /// Human readable default sensor name
    pub label: &'static str,
    /// Units the meter is known to report this register in
    pub allowed_units: &'static [Unit],
    /// Expected mantissa width in bytes
    pub width: usize,
    /// Unit of the published sensor. Values are passed through in the
    /// meter's own unit, a meter set to GJ still publishes under "MWh".
    pub sensor_unit: &'static str,
    /// Decimals shown when publishing
    pub accuracy_decimals: u8,
}

/// Register table, indexed by `RegisterId as usize`
pub const REGISTERS: [RegisterRequest; 7] = [
    RegisterRequest {
        id: RegisterId::Energy,
        command_code: 0x003C,
        key: "energy",
        label: "Energy",
        allowed_units: &[Unit::KWh, Unit::MWh, Unit::GWh, Unit::GJ, Unit::Gcal],
        width: EXPECTED_MANTISSA_WIDTH,
        sensor_unit: "MWh",
        accuracy_decimals: 3,
    },
    RegisterRequest {
        id: RegisterId::Power,
        command_code: 0x0050,
        key: "power",
        label: "Power",
        allowed_units: &[Unit::KW, Unit::MW],
        width: EXPECTED_MANTISSA_WIDTH,
        sensor_unit: "kW",
        accuracy_decimals: 1,
    },
    RegisterRequest {
        id: RegisterId::TempIn,
        command_code: 0x0056,
        key: "temperature_in",
        label: "Temperature In",
        allowed_units: &[Unit::Celsius],
        width: EXPECTED_MANTISSA_WIDTH,
        sensor_unit: "°C",
        accuracy_decimals: 2,
    },
    RegisterRequest {
        id: RegisterId::TempOut,
        command_code: 0x0057,
        key: "temperature_out",
        label: "Temperature Out",
        allowed_units: &[Unit::Celsius],
        width: EXPECTED_MANTISSA_WIDTH,
        sensor_unit: "°C",
        accuracy_decimals: 2,
    },
    RegisterRequest {
        id: RegisterId::TempDiff,
        command_code: 0x0059,
        key: "temperature_diff",
        label: "Temperature Difference",
        allowed_units: &[Unit::Kelvin, Unit::Celsius],
        width: EXPECTED_MANTISSA_WIDTH,
        sensor_unit: "°C",
        accuracy_decimals: 2,
    },
    RegisterRequest {
        id: RegisterId::Flow,
        command_code: 0x004A,
        key: "flow",
        label: "Flow",
        allowed_units: &[Unit::LitrePerHour, Unit::CubicMetrePerHour],
        width: EXPECTED_MANTISSA_WIDTH,
        sensor_unit: "L/h",
        accuracy_decimals: 0,
    },
    RegisterRequest {
        id: RegisterId::Volume,
        command_code: 0x0044,
        key: "volume",
        label: "Volume",
        allowed_units: &[Unit::CubicMetre, Unit::Litre],
        width: EXPECTED_MANTISSA_WIDTH,
        sensor_unit: "m³",
        accuracy_decimals: 2,
    },
];

/// One successfully decoded register reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedValue {
    pub register: RegisterId,
    pub raw: i64,
    pub exponent: i8,
    pub unit: Unit,
    /// `raw × 10^exponent`
    pub value: f64,
}

impl DecodedValue {
    pub fn new(register: RegisterId, raw: i64, exponent: i8, unit: Unit) -> Self {
        Self {
            register,
            raw,
            exponent,
            unit,
            value: scale(raw, exponent),
        }
    }

    /// Build a reading from an engineering value with `decimals` fractional digits
    pub fn from_scaled(register: RegisterId, value: f64, decimals: u8, unit: Unit) -> Self {
        let raw = (value * 10f64.powi(i32::from(decimals))).round() as i64;
        Self::new(register, raw, -(decimals as i8), unit)
    }

    pub fn has_expected_unit(&self) -> bool {
        self.register.request().allowed_units.contains(&self.unit)
    }
}

/// Divide for negative exponents so decimal fractions round once
fn scale(raw: i64, exponent: i8) -> f64 {
    let magnitude = 10f64.powi(i32::from(exponent.unsigned_abs()));
    if exponent < 0 {
        raw as f64 / magnitude
    } else {
        raw as f64 * magnitude
    }
}

/// Decodes verified response payloads addressed from one destination
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterDecoder {
    destination: Destination,
}

impl RegisterDecoder {
    pub fn new(destination: Destination) -> Self {
        Self { destination }
    }

    /// Decode `dest 0x10 reg_hi reg_lo unit width siex mantissa[width]`
    pub fn decode(&self, register: RegisterId, payload: &[u8]) -> Result<DecodedValue> {
        if payload.len() < RESPONSE_HEADER_LEN {
            return Err(KmpError::malformed(
                register,
                format!(
                    "payload too short: {} bytes, header needs {}",
                    payload.len(),
                    RESPONSE_HEADER_LEN
                ),
            ));
        }

        if payload[0] != self.destination.address() {
            let sender = match Destination::from_address(payload[0]) {
                Some(other) => other.to_string(),
                None => format!("unknown address 0x{:02X}", payload[0]),
            };
            return Err(KmpError::malformed(
                register,
                format!("reply from {}, expected {}", sender, self.destination),
            ));
        }

        if payload[1] != CMD_GET_REGISTER {
            return Err(KmpError::malformed(
                register,
                format!(
                    "command 0x{:02X}, expected 0x{:02X}",
                    payload[1], CMD_GET_REGISTER
                ),
            ));
        }

        let echoed = u16::from_be_bytes([payload[2], payload[3]]);
        if echoed != register.code() {
            return Err(KmpError::malformed(
                register,
                format!(
                    "register id mismatch: got 0x{:04X}, expected 0x{:04X}",
                    echoed,
                    register.code()
                ),
            ));
        }

        let unit = Unit::from_code(payload[4]);
        let width = payload[5] as usize;
        let expected_width = register.request().width;
        if width != expected_width {
            return Err(KmpError::malformed(
                register,
                format!("mantissa width {}, expected {}", width, expected_width),
            ));
        }
        if payload.len() != RESPONSE_HEADER_LEN + width {
            return Err(KmpError::malformed(
                register,
                format!(
                    "payload length {} does not match width {}",
                    payload.len(),
                    width
                ),
            ));
        }

        let siex = payload[6];
        let magnitude = (siex & SIEX_EXPONENT_MASK) as i8;
        let exponent = if siex & SIEX_EXPONENT_SIGN != 0 {
            -magnitude
        } else {
            magnitude
        };

        let mantissa = payload[RESPONSE_HEADER_LEN..]
            .iter()
            .fold(0i64, |acc, &b| (acc << 8) | i64::from(b));
        let raw = if siex & SIEX_MANTISSA_SIGN != 0 {
            -mantissa
        } else {
            mantissa
        };

        let decoded = DecodedValue::new(register, raw, exponent, unit);
        if !decoded.has_expected_unit() {
            warn!(
                "[KMP] {} reported unexpected unit {} (code {})",
                register,
                unit,
                unit.code()
            );
        }
        debug!(
            "[KMP] Decoded {}: raw={} exp={} unit={} value={}",
            register, raw, exponent, unit, decoded.value
        );

        Ok(decoded)
    }

    /// Inverse of [`decode`](Self::decode): the unstuffed payload without CRC
    pub fn encode(&self, value: &DecodedValue) -> Result<Vec<u8>> {
        let register = value.register;
        let width = register.request().width;
        let magnitude = value.raw.unsigned_abs();
        let max = if width >= 8 {
            u64::MAX
        } else {
            (1u64 << (width * 8)) - 1
        };
        if magnitude > max {
            return Err(KmpError::malformed(
                register,
                format!("mantissa {} does not fit in {} bytes", value.raw, width),
            ));
        }
        let exponent = value.exponent.unsigned_abs();
        if exponent > SIEX_EXPONENT_MASK {
            return Err(KmpError::malformed(
                register,
                format!("exponent {} out of range", value.exponent),
            ));
        }

        let mut siex = exponent;
        if value.exponent < 0 {
            siex |= SIEX_EXPONENT_SIGN;
        }
        if value.raw < 0 {
            siex |= SIEX_MANTISSA_SIGN;
        }

        let code = register.code().to_be_bytes();
        let mut payload = Vec::with_capacity(RESPONSE_HEADER_LEN + width);
        payload.extend_from_slice(&[
            self.destination.address(),
            CMD_GET_REGISTER,
            code[0],
            code[1],
            value.unit.code(),
            width as u8,
            siex,
        ]);
        payload.extend_from_slice(&magnitude.to_be_bytes()[8 - width..]);
        Ok(payload)
    }
}
