//! Meter polling core
//!
//! - **`transport`** - the UART boundary and its serial port implementation
//! - **`sequencer`** - request/retry/timeout state machine for one poll cycle
//! - **`component`** - value cache and sensor publishing for the host
//! - **`config`** - figment-backed service configuration
//!
//! Everything here is synchronous. The host supplies the current time on
//! every call, which keeps the core testable without a runtime.

pub mod component;
pub mod config;
pub mod sequencer;
pub mod transport;

pub use component::{Multical402Component, Sensor};
pub use config::AppConfig;
pub use sequencer::{CycleReport, PollConfig, PollSequencer, PollStats, StepOutcome};
pub use transport::{SerialUart, Uart};
