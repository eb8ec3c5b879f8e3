//! KMP frame building and incremental frame decoding
//!
//! ```text
//! request : 0x80 | stuff(dest 0x10 0x01 reg_hi reg_lo crc_hi crc_lo) | 0x0D
//! response: 0x40 | stuff(dest 0x10 reg_hi reg_lo unit width siex mantissa.. crc_hi crc_lo) | 0x0D
//! ```

use tracing::{debug, trace, warn};

use super::constants::{
    is_reserved, Destination, ACK, CMD_GET_REGISTER, CRC_LEN, ESCAPE, ESCAPE_XOR, FRAME_END,
    MAX_FRAME_LEN, REGISTERS_PER_REQUEST, REQUEST_START, RESPONSE_START,
};
use super::crc::crc16;
use super::register::{DecodedValue, RegisterDecoder, RegisterId};
use crate::error::{KmpError, Result};

/// A destuffed, checksum-verified frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame body without start/end markers and CRC
    pub payload: Vec<u8>,
    pub checksum: u16,
}

/// Result of feeding one received byte into [`FrameCodec`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameResult {
    /// More bytes needed
    Incomplete,
    /// Frame terminated and verified
    Complete(Frame),
    /// Byte stream violated the framing rules, partial frame discarded
    FramingError(String),
    /// Frame terminated but its CRC did not verify
    ChecksumError { expected: u16, actual: u16 },
}

impl FrameResult {
    /// Map the error outcomes onto [`KmpError`]
    pub fn into_error(self) -> Option<KmpError> {
        match self {
            FrameResult::FramingError(reason) => Some(KmpError::Framing(reason)),
            FrameResult::ChecksumError { expected, actual } => {
                Some(KmpError::Checksum { expected, actual })
            },
            FrameResult::Incomplete | FrameResult::Complete(_) => None,
        }
    }
}

/// Escape reserved bytes of `body` into `out`
pub fn stuff(body: &[u8], out: &mut Vec<u8>) {
    for &byte in body {
        if is_reserved(byte) {
            out.push(ESCAPE);
            out.push(byte ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
}

/// Reverse [`stuff`]
///
/// Fails on a trailing escape byte. An escape followed by a value that does
/// not restore a reserved byte is accepted, some firmware does that.
pub fn unstuff(wire: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(wire.len());
    let mut bytes = wire.iter();
    while let Some(&byte) = bytes.next() {
        if byte != ESCAPE {
            out.push(byte);
            continue;
        }
        let Some(&escaped) = bytes.next() else {
            return Err(KmpError::framing("dangling escape before frame end"));
        };
        let restored = escaped ^ ESCAPE_XOR;
        if !is_reserved(restored) {
            warn!(
                "[KMP Codec] Escape followed by 0x{:02X} restores non-reserved 0x{:02X}",
                escaped, restored
            );
        }
        out.push(restored);
    }
    Ok(out)
}

/// Wrap `payload` with CRC, stuffing and the start/end markers
pub fn build_frame(start: u8, payload: &[u8]) -> Vec<u8> {
    let crc = crc16(payload);
    let mut body = Vec::with_capacity(payload.len() + CRC_LEN);
    body.extend_from_slice(payload);
    body.extend_from_slice(&crc.to_be_bytes());

    let mut frame = Vec::with_capacity(body.len() * 2 + 2);
    frame.push(start);
    stuff(&body, &mut frame);
    frame.push(FRAME_END);
    frame
}

/// Build the GetRegister request for one register
pub fn build_request(destination: Destination, register: RegisterId) -> Vec<u8> {
    let code = register.code().to_be_bytes();
    build_frame(
        REQUEST_START,
        &[
            destination.address(),
            CMD_GET_REGISTER,
            REGISTERS_PER_REQUEST,
            code[0],
            code[1],
        ],
    )
}

/// Build the meter's response frame for `value`
pub fn encode_register_response(destination: Destination, value: &DecodedValue) -> Result<Vec<u8>> {
    let payload = RegisterDecoder::new(destination).encode(value)?;
    Ok(build_frame(RESPONSE_START, &payload))
}

/// Incremental decoder for one direction of KMP traffic
#[derive(Debug)]
pub struct FrameCodec {
    destination: Destination,
    start: u8,
    /// Stuffed bytes after the start marker
    buffer: Vec<u8>,
    in_frame: bool,
}

impl FrameCodec {
    /// Codec for meter responses
    pub fn new(destination: Destination) -> Self {
        Self::with_start(destination, RESPONSE_START)
    }

    /// Codec for master requests, used on the meter side
    pub fn for_requests() -> Self {
        Self::with_start(Destination::default(), REQUEST_START)
    }

    fn with_start(destination: Destination, start: u8) -> Self {
        Self {
            destination,
            start,
            buffer: Vec::with_capacity(MAX_FRAME_LEN),
            in_frame: false,
        }
    }

    /// Request bytes for `register` addressed to this codec's destination
    pub fn build_request(&self, register: RegisterId) -> Vec<u8> {
        build_request(self.destination, register)
    }

    /// Discard any partial frame
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_frame = false;
    }

    pub fn is_collecting(&self) -> bool {
        self.in_frame
    }

    /// Feed one received byte
    pub fn feed(&mut self, byte: u8) -> FrameResult {
        if !self.in_frame {
            if byte == self.start {
                self.in_frame = true;
                self.buffer.clear();
            } else {
                trace!("[KMP Codec] Dropping 0x{:02X} outside frame", byte);
            }
            return FrameResult::Incomplete;
        }

        if byte == self.start {
            let discarded = self.buffer.len();
            self.buffer.clear();
            return FrameResult::FramingError(format!(
                "start marker inside frame after {} bytes",
                discarded
            ));
        }

        if byte == FRAME_END {
            return self.finish();
        }

        if byte == ACK || byte == self.opposite_start() {
            self.reset();
            return FrameResult::FramingError(format!("unescaped reserved byte 0x{:02X}", byte));
        }

        // start marker + collected bytes + this byte + terminator
        if self.buffer.len() + 3 > MAX_FRAME_LEN {
            self.reset();
            return FrameResult::FramingError(format!(
                "frame exceeds {} bytes without terminator",
                MAX_FRAME_LEN
            ));
        }

        self.buffer.push(byte);
        FrameResult::Incomplete
    }

    fn opposite_start(&self) -> u8 {
        if self.start == RESPONSE_START {
            REQUEST_START
        } else {
            RESPONSE_START
        }
    }

    fn finish(&mut self) -> FrameResult {
        let wire = std::mem::take(&mut self.buffer);
        self.reset();

        let body = match unstuff(&wire) {
            Ok(body) => body,
            Err(e) => return FrameResult::FramingError(e.to_string()),
        };

        if body.len() < CRC_LEN + 1 {
            return FrameResult::FramingError(format!(
                "frame too short: {} bytes after destuffing",
                body.len()
            ));
        }

        let (payload, crc_bytes) = body.split_at(body.len() - CRC_LEN);
        let actual = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);
        let expected = crc16(payload);
        if expected != actual {
            debug!(
                "[KMP Codec] CRC mismatch - Expected: 0x{:04X}, Got: 0x{:04X}",
                expected, actual
            );
            return FrameResult::ChecksumError { expected, actual };
        }

        debug!(
            "[KMP Codec] Frame complete - {} wire bytes, payload {} bytes, CRC 0x{:04X}",
            wire.len() + 2,
            payload.len(),
            actual
        );
        FrameResult::Complete(Frame {
            payload: payload.to_vec(),
            checksum: actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocols::kmp::register::Unit;
    use tracing_test::traced_test;

    fn feed_all(codec: &mut FrameCodec, bytes: &[u8]) -> Vec<FrameResult> {
        bytes
            .iter()
            .map(|&b| codec.feed(b))
            .filter(|r| *r != FrameResult::Incomplete)
            .collect()
    }

    fn energy_response() -> Vec<u8> {
        let value = DecodedValue::new(RegisterId::Energy, 123456, -3, Unit::MWh);
        encode_register_response(Destination::HeatMeter, &value).unwrap()
    }

    #[test]
    fn test_stuffing_roundtrip() {
        let body = [0x00, 0x06, 0x0D, 0x1B, 0x40, 0x80, 0xFF, 0x3F];
        let mut wire = Vec::new();
        stuff(&body, &mut wire);
        assert_eq!(
            wire,
            vec![0x00, 0x1B, 0xF9, 0x1B, 0xF2, 0x1B, 0xE4, 0x1B, 0xBF, 0x1B, 0x7F, 0xFF, 0x3F]
        );
        assert!(wire[..].iter().skip(1).all(|&b| b != 0x0D && b != 0x40 && b != 0x80));
        assert_eq!(unstuff(&wire).unwrap(), body);
    }

    #[test]
    fn test_unstuff_dangling_escape() {
        assert!(matches!(unstuff(&[0x3F, 0x1B]), Err(KmpError::Framing(_))));
    }

    #[test]
    fn test_energy_request_bytes() {
        let request = build_request(Destination::HeatMeter, RegisterId::Energy);
        let payload = [0x3F, 0x10, 0x01, 0x00, 0x3C];
        let crc = crc16(&payload).to_be_bytes();

        assert_eq!(request[0], 0x80);
        assert_eq!(*request.last().unwrap(), 0x0D);

        let mut expected = vec![0x80];
        stuff(&[&payload[..], &crc[..]].concat(), &mut expected);
        expected.push(0x0D);
        assert_eq!(request, expected);

        // deterministic
        assert_eq!(request, build_request(Destination::HeatMeter, RegisterId::Energy));
    }

    #[test]
    fn test_request_codec_parses_request() {
        let mut codec = FrameCodec::for_requests();
        let request = build_request(Destination::LoggerTop, RegisterId::Flow);
        let results = feed_all(&mut codec, &request);
        assert_eq!(results.len(), 1);
        match &results[0] {
            FrameResult::Complete(frame) => {
                assert_eq!(frame.payload, vec![0x7F, 0x10, 0x01, 0x00, 0x4A]);
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_response_complete() {
        let mut codec = FrameCodec::new(Destination::HeatMeter);
        let results = feed_all(&mut codec, &energy_response());
        assert_eq!(results.len(), 1);
        let FrameResult::Complete(frame) = &results[0] else {
            panic!("expected complete frame, got {:?}", results[0]);
        };
        let value = RegisterDecoder::default()
            .decode(RegisterId::Energy, &frame.payload)
            .unwrap();
        assert_eq!(value.value, 123.456);
        assert!(!codec.is_collecting());
    }

    #[test]
    fn test_noise_and_echo_are_dropped() {
        let mut codec = FrameCodec::new(Destination::HeatMeter);
        let mut stream = vec![0x00, 0xFF, 0x0D];
        stream.extend(build_request(Destination::HeatMeter, RegisterId::Energy));
        stream.extend(energy_response());

        let results = feed_all(&mut codec, &stream);
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], FrameResult::Complete(_)));
    }

    #[test]
    fn test_checksum_error() {
        let mut response = energy_response();
        // command byte 0x10 -> 0x11
        response[2] ^= 0x01;

        let mut codec = FrameCodec::new(Destination::HeatMeter);
        let results = feed_all(&mut codec, &response);
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], FrameResult::ChecksumError { .. }));
        assert!(results[0].clone().into_error().is_some());

        // codec recovers for the next frame
        let results = feed_all(&mut codec, &energy_response());
        assert!(matches!(results[0], FrameResult::Complete(_)));
    }

    #[test]
    fn test_flipped_crc_bit_is_checksum_error() {
        let readings = [
            (RegisterId::Energy, 123456, -3, Unit::MWh),
            (RegisterId::Energy, 0, 0, Unit::KWh),
            (RegisterId::Power, 123, -1, Unit::KW),
            (RegisterId::TempIn, 7235, -2, Unit::Celsius),
            (RegisterId::Flow, 0x0D40_801B, 0, Unit::LitrePerHour),
            (RegisterId::Volume, 452107, -2, Unit::CubicMetre),
        ];
        let decoder = RegisterDecoder::default();
        let mut codec = FrameCodec::new(Destination::HeatMeter);

        for (register, raw, exponent, unit) in readings {
            let payload = decoder
                .encode(&DecodedValue::new(register, raw, exponent, unit))
                .unwrap();
            let crc = crc16(&payload);

            for bit in 0..16 {
                let bad = (crc ^ (1 << bit)).to_be_bytes();
                let mut wire = vec![RESPONSE_START];
                stuff(&[&payload[..], &bad[..]].concat(), &mut wire);
                wire.push(FRAME_END);

                let results = feed_all(&mut codec, &wire);
                assert_eq!(
                    results,
                    vec![FrameResult::ChecksumError {
                        expected: crc,
                        actual: crc ^ (1 << bit),
                    }],
                    "{} raw {} bit {}",
                    register,
                    raw,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_start_marker_inside_frame_restarts() {
        let mut codec = FrameCodec::new(Destination::HeatMeter);
        let mut stream = vec![0x40, 0x3F, 0x10];
        stream.extend(energy_response());

        let results = feed_all(&mut codec, &stream);
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], FrameResult::FramingError(_)));
        assert!(matches!(results[1], FrameResult::Complete(_)));
    }

    #[test]
    fn test_short_and_dangling_frames() {
        let mut codec = FrameCodec::new(Destination::HeatMeter);
        assert_eq!(
            feed_all(&mut codec, &[0x40, 0x01, 0x02, 0x0D]),
            vec![FrameResult::FramingError(
                "frame too short: 2 bytes after destuffing".to_string()
            )]
        );

        let results = feed_all(&mut codec, &[0x40, 0x3F, 0x10, 0x00, 0x1B, 0x0D]);
        assert!(matches!(&results[0], FrameResult::FramingError(r) if r.contains("dangling")));
    }

    #[test]
    fn test_unescaped_reserved_byte() {
        let mut codec = FrameCodec::new(Destination::HeatMeter);
        let results = feed_all(&mut codec, &[0x40, 0x3F, 0x06]);
        assert!(matches!(results[0], FrameResult::FramingError(_)));
        assert!(!codec.is_collecting());
    }

    #[test]
    fn test_overflow() {
        let mut codec = FrameCodec::new(Destination::HeatMeter);
        assert_eq!(codec.feed(0x40), FrameResult::Incomplete);
        for _ in 0..MAX_FRAME_LEN - 2 {
            assert_eq!(codec.feed(0x11), FrameResult::Incomplete);
        }
        assert!(matches!(codec.feed(0x11), FrameResult::FramingError(_)));
        assert!(!codec.is_collecting());
    }

    #[test]
    fn test_reset_discards_partial() {
        let mut codec = FrameCodec::new(Destination::HeatMeter);
        let response = energy_response();
        for &b in &response[..5] {
            codec.feed(b);
        }
        codec.reset();
        // the tail alone is noise
        assert!(feed_all(&mut codec, &response[5..]).is_empty());
    }

    #[test]
    #[traced_test]
    fn test_non_reserved_escape_accepted() {
        // 0x1B 0xC0 restores 0x3F which never needed escaping
        let payload = [0x3F, 0x10];
        let crc = crc16(&payload).to_be_bytes();
        let mut wire = vec![0x40, 0x1B, 0xC0, 0x10];
        stuff(&crc, &mut wire);
        wire.push(0x0D);

        let mut codec = FrameCodec::new(Destination::HeatMeter);
        let results = feed_all(&mut codec, &wire);
        assert!(matches!(&results[0], FrameResult::Complete(f) if f.payload == payload));
        assert!(logs_contain("restores non-reserved 0x3F"));
    }
}
