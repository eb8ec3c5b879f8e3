//! Kamstrup Multical 402 heat meter reader
//!
//! Polls energy, power, temperatures, flow and volume from a Multical 402
//! over its optical eye using the Kamstrup Meter Protocol (KMP), and hands
//! each value to a host sensor once per poll cycle.

pub mod core;
pub mod error;
pub mod protocols;
pub mod runtime;

pub use crate::core::{Multical402Component, Sensor, Uart};
pub use error::{KmpError, Result};
