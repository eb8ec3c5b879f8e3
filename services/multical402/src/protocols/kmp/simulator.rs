//! Simulated Multical 402 on the far side of a [`Uart`]
//!
//! Parses requests with the request-side codec and answers them from a
//! table of readings. Faults can be scripted per register to exercise the
//! retry and stale paths without hardware.

use std::collections::{HashMap, VecDeque};

use common::hex::format_spaced;
use tracing::{debug, warn};

use super::codec::{encode_register_response, FrameCodec, FrameResult};
use super::constants::{Destination, CMD_GET_REGISTER, REGISTERS_PER_REQUEST};
use super::register::{DecodedValue, RegisterId, Unit};
use crate::core::transport::Uart;
use crate::error::Result;

/// Misbehaviour applied to one response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatorFault {
    /// Flip a payload bit so the CRC no longer verifies
    CorruptChecksum,
    /// Do not answer at all
    Silent,
    /// Send the frame without its terminator
    Truncated,
    /// Prefix the response with line noise
    Noise,
    /// Answer with a unit code the register never uses
    ForeignUnit,
}

/// Scriptable meter
#[derive(Debug)]
pub struct MeterSimulator {
    destination: Destination,
    requests_codec: FrameCodec,
    readings: HashMap<RegisterId, DecodedValue>,
    scripted: HashMap<RegisterId, VecDeque<SimulatorFault>>,
    persistent: HashMap<RegisterId, SimulatorFault>,
    /// Bytes on their way to the master
    tx: VecDeque<u8>,
    echo: bool,
    served: Vec<RegisterId>,
}

impl Default for MeterSimulator {
    fn default() -> Self {
        Self::new(Destination::HeatMeter)
    }
}

impl MeterSimulator {
    /// Meter without readings, every request goes unanswered
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            requests_codec: FrameCodec::for_requests(),
            readings: HashMap::new(),
            scripted: HashMap::new(),
            persistent: HashMap::new(),
            tx: VecDeque::new(),
            echo: false,
            served: Vec::new(),
        }
    }

    /// Meter loaded with plausible district heating readings
    pub fn with_default_readings(destination: Destination) -> Self {
        let mut sim = Self::new(destination);
        for reading in [
            DecodedValue::new(RegisterId::Energy, 123_456, -3, Unit::MWh),
            DecodedValue::new(RegisterId::Power, 123, -1, Unit::KW),
            DecodedValue::new(RegisterId::TempIn, 7235, -2, Unit::Celsius),
            DecodedValue::new(RegisterId::TempOut, 4120, -2, Unit::Celsius),
            DecodedValue::new(RegisterId::TempDiff, 3115, -2, Unit::Kelvin),
            DecodedValue::new(RegisterId::Flow, 245, 0, Unit::LitrePerHour),
            DecodedValue::new(RegisterId::Volume, 452_107, -2, Unit::CubicMetre),
        ] {
            sim.set_reading(reading);
        }
        sim
    }

    pub fn set_reading(&mut self, reading: DecodedValue) {
        self.readings.insert(reading.register, reading);
    }

    /// Echo every request back, as optical heads on a shared line do
    pub fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    /// Apply `faults` to the next responses for `register`, one per request
    pub fn script(
        &mut self,
        register: RegisterId,
        faults: impl IntoIterator<Item = SimulatorFault>,
    ) {
        self.scripted.entry(register).or_default().extend(faults);
    }

    /// Apply `fault` to every response for `register`
    pub fn fail_always(&mut self, register: RegisterId, fault: SimulatorFault) {
        self.persistent.insert(register, fault);
    }

    pub fn clear_faults(&mut self) {
        self.scripted.clear();
        self.persistent.clear();
    }

    /// Registers requested so far, in order
    pub fn served(&self) -> &[RegisterId] {
        &self.served
    }

    fn next_fault(&mut self, register: RegisterId) -> Option<SimulatorFault> {
        self.scripted
            .get_mut(&register)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.persistent.get(&register).copied())
    }

    fn handle_request(&mut self, payload: &[u8]) -> Result<()> {
        let [dest, cmd, count, hi, lo] = payload else {
            warn!("[Simulator] Ignoring request of {} bytes", payload.len());
            return Ok(());
        };
        if *dest != self.destination.address()
            || *cmd != CMD_GET_REGISTER
            || *count != REGISTERS_PER_REQUEST
        {
            warn!("[Simulator] Ignoring request {}", format_spaced(payload));
            return Ok(());
        }

        let code = u16::from_be_bytes([*hi, *lo]);
        let Some(register) = RegisterId::from_code(code) else {
            warn!("[Simulator] Unknown register 0x{:04X}", code);
            return Ok(());
        };
        self.served.push(register);

        let Some(reading) = self.readings.get(&register).copied() else {
            debug!("[Simulator] No reading for {}, staying silent", register);
            return Ok(());
        };

        let fault = self.next_fault(register);
        let reading = if fault == Some(SimulatorFault::ForeignUnit) {
            DecodedValue {
                unit: Unit::Other(0x63),
                ..reading
            }
        } else {
            reading
        };

        let mut frame = encode_register_response(self.destination, &reading)?;
        match fault {
            Some(SimulatorFault::Silent) => {
                debug!("[Simulator] {} fault: silent", register);
                return Ok(());
            },
            Some(SimulatorFault::CorruptChecksum) => {
                // command byte sits right after the start marker and destination
                frame[2] ^= 0x01;
            },
            Some(SimulatorFault::Truncated) => {
                frame.pop();
            },
            Some(SimulatorFault::Noise) => {
                self.tx.extend([0x00, 0xFF, 0x0D, 0x13]);
            },
            Some(SimulatorFault::ForeignUnit) | None => {},
        }
        if let Some(fault) = fault {
            debug!("[Simulator] {} fault: {:?}", register, fault);
        }

        debug!("[Simulator] Reply {}: {}", register, format_spaced(&frame));
        self.tx.extend(frame);
        Ok(())
    }
}

impl Uart for MeterSimulator {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        if self.echo {
            self.tx.extend(bytes);
        }
        for &byte in bytes {
            match self.requests_codec.feed(byte) {
                FrameResult::Complete(frame) => self.handle_request(&frame.payload)?,
                FrameResult::Incomplete => {},
                other => {
                    if let Some(err) = other.into_error() {
                        warn!("[Simulator] Bad request frame: {}", err);
                    }
                },
            }
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        Ok(self.tx.pop_front())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.tx.clear();
        Ok(())
    }
}
