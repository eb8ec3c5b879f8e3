//! UART boundary
//!
//! The poll sequencer talks to the meter through [`Uart`]: a non-blocking
//! byte interface that the host drives from its main loop. [`SerialUart`]
//! backs it with a real serial port, the meter simulator implements it for
//! tests and `--simulate`.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Duration;

use common::hex::format_spaced;
use tokio_serial::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use tracing::{debug, info, trace};

use super::config::UartConfig;
use crate::error::{KmpError, Result};

/// Byte level access to the meter's serial line
pub trait Uart {
    /// Transmit all of `bytes`
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Next received byte, `Ok(None)` when nothing is waiting
    fn read_byte(&mut self) -> Result<Option<u8>>;

    /// Drop anything received so far
    fn clear_input(&mut self) -> Result<()>;
}

impl<U: Uart + ?Sized> Uart for Box<U> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write_all(bytes)
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        (**self).read_byte()
    }

    fn clear_input(&mut self) -> Result<()> {
        (**self).clear_input()
    }
}

/// Read timeout on the underlying port, reads only happen when bytes are waiting
const PORT_TIMEOUT: Duration = Duration::from_millis(10);

/// Largest chunk pulled from the port per read
const READ_CHUNK: usize = 64;

/// [`Uart`] over a local serial port
pub struct SerialUart {
    port: Box<dyn SerialPort>,
    name: String,
    rx: VecDeque<u8>,
}

impl std::fmt::Debug for SerialUart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialUart")
            .field("port", &self.name)
            .field("buffered", &self.rx.len())
            .finish()
    }
}

impl SerialUart {
    /// Open the port described by `config`
    pub fn open(config: &UartConfig) -> Result<Self> {
        config.validate(false)?;

        let port = tokio_serial::new(config.port.as_str(), config.baud_rate)
            .data_bits(parse_data_bits(config.data_bits))
            .parity(parse_parity(&config.parity))
            .stop_bits(parse_stop_bits(config.stop_bits))
            .timeout(PORT_TIMEOUT)
            .open()
            .map_err(|e| KmpError::io(format!("Failed to open {}: {}", config.port, e)))?;

        info!(
            "Opened serial port {} ({} baud, {}{}{})",
            config.port,
            config.baud_rate,
            config.data_bits,
            config.parity.chars().next().unwrap_or('N').to_ascii_uppercase(),
            config.stop_bits
        );

        Ok(Self::from_port(port, config.port.as_str()))
    }

    /// Wrap an already opened port
    pub fn from_port(port: Box<dyn SerialPort>, name: impl Into<String>) -> Self {
        Self {
            port,
            name: name.into(),
            rx: VecDeque::with_capacity(READ_CHUNK),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn fill(&mut self) -> Result<()> {
        let waiting = self.port.bytes_to_read()? as usize;
        if waiting == 0 {
            return Ok(());
        }

        let mut chunk = [0u8; READ_CHUNK];
        let want = waiting.min(READ_CHUNK);
        match self.port.read(&mut chunk[..want]) {
            Ok(n) => {
                trace!("[Serial] RX {}: {}", self.name, format_spaced(&chunk[..n]));
                self.rx.extend(&chunk[..n]);
                Ok(())
            },
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Uart for SerialUart {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        debug!("[Serial] TX {}: {}", self.name, format_spaced(bytes));
        // no flush: draining the line at 1200 baud would stall the host loop
        Write::write_all(&mut self.port, bytes)?;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        if self.rx.is_empty() {
            self.fill()?;
        }
        Ok(self.rx.pop_front())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.rx.clear();
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

fn parse_parity(parity: &str) -> Parity {
    match parity.to_lowercase().as_str() {
        "even" => Parity::Even,
        "odd" => Parity::Odd,
        _ => Parity::None,
    }
}

fn parse_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn parse_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}
