// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Raw asynchronous flash driver seam.
//!
//! A driver starts one hardware operation per `begin_*` call and reports the
//! outcome later by having the platform call
//! [`Serializer::on_flash_event`](crate::Serializer::on_flash_event) on the
//! same execution context as the rest of the engine. Reads are synchronous
//! (memory-mapped flash).

use crate::layout::WORD_SIZE;

pub trait FlashDriver {
    /// Start programming `words` at the word-aligned `address`.
    ///
    /// The driver must not retain `words` after returning. Failures, including
    /// out-of-range addresses, are reported through the completion event.
    fn begin_write(&mut self, address: u32, words: &[u32]);

    /// Start erasing the page starting at `page_address`.
    fn begin_erase(&mut self, page_address: u32);

    /// Read bytes starting at `address`.
    fn read(&self, address: u32, buf: &mut [u8]);

    /// Read one little-endian word.
    fn read_word(&self, address: u32) -> u32 {
        let mut bytes = [0u8; WORD_SIZE as usize];
        self.read(address, &mut bytes);
        u32::from_le_bytes(bytes)
    }
}

/// Fill `out` with consecutive words starting at `address`.
pub(crate) fn read_words<D: FlashDriver + ?Sized>(driver: &D, address: u32, out: &mut [u32]) {
    for (i, word) in out.iter_mut().enumerate() {
        *word = driver.read_word(address + i as u32 * WORD_SIZE);
    }
}

/// Whether every byte of `[address, address + size)` reads as erased.
pub(crate) fn is_erased<D: FlashDriver + ?Sized>(driver: &D, address: u32, size: u32) -> bool {
    let mut chunk = [0u8; 64];
    let mut offset = 0;
    while offset < size {
        let n = (size - offset).min(chunk.len() as u32) as usize;
        driver.read(address + offset, &mut chunk[..n]);
        if chunk[..n].iter().any(|&b| b != 0xFF) {
            return false;
        }
        offset += n as u32;
    }
    true
}

/// Whether two flash ranges of `size` bytes hold the same content.
pub(crate) fn ranges_equal<D: FlashDriver + ?Sized>(driver: &D, a: u32, b: u32, size: u32) -> bool {
    let mut left = [0u8; 64];
    let mut right = [0u8; 64];
    let mut offset = 0;
    while offset < size {
        let n = (size - offset).min(left.len() as u32) as usize;
        driver.read(a + offset, &mut left[..n]);
        driver.read(b + offset, &mut right[..n]);
        if left[..n] != right[..n] {
            return false;
        }
        offset += n as u32;
    }
    true
}
