//! Hex formatting for wire traces

use std::fmt::Write;

/// Format bytes as space separated uppercase hex
/// Example: [0x80, 0x3F, 0x0D] -> "80 3F 0D"
pub fn format_spaced(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        // Writing to String buffer is infallible
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}
