// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Nibble-wise table-driven CRC-16 (reflected polynomial 0xA001).
//!
//! The running value is carried in its reflected register form, so the
//! result of one call is a valid seed for the next: checksumming a buffer in
//! contiguous chunks gives the same value as checksumming it at once. With
//! seed `0xFFFF` this is CRC-16/MODBUS, with seed `0` CRC-16/ARC.
//!
//! Because the algorithm applies no final XOR, appending the checksum as a
//! little-endian trailer (see [`crc16_trailer`]) folds the running value of
//! `data ‖ trailer` to zero. Image validation relies on that property.

/// Remainders for the sixteen possible low nibbles of the register.
const NIBBLE_TABLE: [u16; 16] = [
    0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
    0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
];

/// Compute the CRC-16 of `data` starting from `seed`.
pub fn crc16(seed: u16, data: &[u8]) -> u16 {
    data.iter().fold(seed, |crc, &byte| {
        let crc = NIBBLE_TABLE[usize::from((crc ^ u16::from(byte)) & 0x0F)] ^ (crc >> 4);
        NIBBLE_TABLE[usize::from((crc ^ u16::from(byte >> 4)) & 0x0F)] ^ (crc >> 4)
    })
}

/// Bytes to append to a payload whose checksum is `crc` so that the checksum
/// of payload plus trailer is zero.
pub fn crc16_trailer(crc: u16) -> [u8; 2] {
    crc.to_le_bytes()
}
