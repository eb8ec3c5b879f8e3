//! CRC-16/CCITT as used by KMP
//!
//! Polynomial 0x1021, initial value 0, no reflection, no final XOR. The CRC
//! is transmitted big-endian after the payload, so running the CRC over
//! `payload || crc` yields zero for an intact frame.

const POLY: u16 = 0x1021;

const CRC_TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Calculate the KMP checksum over `data`
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        let table_index = ((crc >> 8) ^ byte as u16) as usize;
        crc = (crc << 8) ^ CRC_TABLE[table_index];
    }
    crc
}

/// True when `frame` ends with a CRC that covers everything before it
pub fn verify(frame: &[u8]) -> bool {
    frame.len() >= 2 && crc16(frame) == 0
}
