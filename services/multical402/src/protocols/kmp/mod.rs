//! Kamstrup Meter Protocol (KMP)
//!
//! Byte-stuffed, CRC-16 protected request/response frames. One register is
//! read per request: `GetRegister` (command 0x10) with a single big-endian
//! register id.

pub mod codec;
pub mod constants;
pub mod crc;
pub mod register;
pub mod simulator;

// Re-export commonly used types
pub use codec::{build_request, encode_register_response, Frame, FrameCodec, FrameResult};
pub use constants::Destination;
pub use register::{DecodedValue, RegisterDecoder, RegisterId, RegisterRequest, Unit, REGISTERS};
pub use simulator::{MeterSimulator, SimulatorFault};
