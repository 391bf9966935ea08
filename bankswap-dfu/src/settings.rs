// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Persisted bootloader settings and the crash marker.
//!
//! On-flash record, eight little-endian words:
//!
//! | word | field             |
//! |------|-------------------|
//! | 0    | valid slot marker |
//! | 1    | valid app         |
//! | 2    | SoftDevice image  |
//! | 3    | bootloader image  |
//! | 4    | application image |
//! | 5    | source address    |
//! | 6-7  | reserved          |
//!
//! Image words carry the size in bits 0..30 and the bank in bits 30..32.

use crate::layout::{Bank, FlashLayout, ERASED_WORD, WORD_SIZE};
use crate::packet::ImageSizes;
use serde::{Deserialize, Serialize};

pub const SETTINGS_MAGIC: u32 = 0xB007_5E77;
pub const SETTINGS_WORDS: usize = 8;
pub const SETTINGS_SIZE: u32 = SETTINGS_WORDS as u32 * WORD_SIZE;

/// Marker word written before a settings write begins.
pub const MARKER_PENDING: u32 = 0xC0DE_5AFE;
/// Marker word written once the settings write is confirmed.
pub const MARKER_CLEAR: u32 = 0x0000_0000;

/// Explicit "application invalid" pattern. `0` and erased both mean valid.
pub const APP_INVALID: u32 = 0x0BAD_0BAD;
pub const APP_VALID: u32 = 0x0000_0000;

const SLOT_SIZE_MASK: u32 = 0x3FFF_FFFF;
const SLOT_BANK_SHIFT: u32 = 30;
const SLOT_BANK0: u32 = 0b00;
const SLOT_BANK1: u32 = 0b01;

/// Size and bank of one image type, packed into a single word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageSlot(u32);

impl ImageSlot {
    pub const EMPTY: Self = Self(ERASED_WORD);

    pub fn new(size: u32, bank: Bank) -> Self {
        let code = match bank {
            Bank::Bank0 => SLOT_BANK0,
            Bank::Bank1 => SLOT_BANK1,
        };
        Self((size & SLOT_SIZE_MASK) | (code << SLOT_BANK_SHIFT))
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn size(self) -> u32 {
        self.0 & SLOT_SIZE_MASK
    }

    pub fn bank(self) -> Option<Bank> {
        match self.0 >> SLOT_BANK_SHIFT {
            SLOT_BANK0 => Some(Bank::Bank0),
            SLOT_BANK1 => Some(Bank::Bank1),
            _ => None,
        }
    }

    /// A slot describes an image when it has a bank and a non-empty,
    /// word-aligned size no larger than `max`.
    pub fn image(self, max: u32) -> Option<(u32, Bank)> {
        let size = self.size();
        let bank = self.bank()?;
        (size != 0 && size != SLOT_SIZE_MASK && size % WORD_SIZE == 0 && size <= max)
            .then_some((size, bank))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootloaderSettings {
    pub valid_app: u32,
    pub softdevice: ImageSlot,
    pub bootloader: ImageSlot,
    pub application: ImageSlot,
    pub src_image_address: u32,
}

impl Default for BootloaderSettings {
    fn default() -> Self {
        Self {
            valid_app: ERASED_WORD,
            softdevice: ImageSlot::EMPTY,
            bootloader: ImageSlot::EMPTY,
            application: ImageSlot::EMPTY,
            src_image_address: ERASED_WORD,
        }
    }
}

impl BootloaderSettings {
    /// Decode a record. A record without the valid slot marker (for example an
    /// erased page) yields the defaults.
    pub fn from_words(words: &[u32; SETTINGS_WORDS]) -> Self {
        if words[0] != SETTINGS_MAGIC {
            return Self::default();
        }
        Self {
            valid_app: words[1],
            softdevice: ImageSlot::from_raw(words[2]),
            bootloader: ImageSlot::from_raw(words[3]),
            application: ImageSlot::from_raw(words[4]),
            src_image_address: words[5],
        }
    }

    pub fn to_words(&self) -> [u32; SETTINGS_WORDS] {
        [
            SETTINGS_MAGIC,
            self.valid_app,
            self.softdevice.raw(),
            self.bootloader.raw(),
            self.application.raw(),
            self.src_image_address,
            ERASED_WORD,
            ERASED_WORD,
        ]
    }

    pub fn from_bytes(bytes: &[u8; SETTINGS_SIZE as usize]) -> Self {
        let mut words = [0u32; SETTINGS_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self::from_words(&words)
    }

    pub fn to_bytes(&self) -> [u8; SETTINGS_SIZE as usize] {
        let mut bytes = [0u8; SETTINGS_SIZE as usize];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(self.to_words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub fn app_marked_valid(&self) -> bool {
        self.valid_app == APP_VALID || self.valid_app == ERASED_WORD
    }

    pub fn with_app_validity(mut self, valid: bool) -> Self {
        self.valid_app = if valid { APP_VALID } else { APP_INVALID };
        self
    }

    /// Record freshly received images living in `bank`.
    ///
    /// The application is marked invalid whenever the update includes an
    /// application (it still has to be moved into bank 0) or a SoftDevice
    /// (the application's base may change).
    pub fn with_new_images(mut self, sizes: ImageSizes, bank: Bank, layout: &FlashLayout) -> Self {
        if sizes.softdevice > 0 {
            self.softdevice = ImageSlot::new(sizes.softdevice, bank);
        }
        if sizes.bootloader > 0 {
            self.bootloader = ImageSlot::new(sizes.bootloader, bank);
        }
        if sizes.application > 0 {
            self.application = ImageSlot::new(sizes.application, bank);
        }
        self.src_image_address = layout.bank_address(bank);
        if sizes.application > 0 || sizes.softdevice > 0 {
            self.valid_app = APP_INVALID;
        }
        self
    }

    /// Record an application living in bank 0 and mark it valid.
    pub fn with_application_installed(mut self, size: u32) -> Self {
        self.application = ImageSlot::new(size, Bank::Bank0);
        self.valid_app = APP_VALID;
        self
    }

    /// Forget the application and mark it invalid.
    pub fn with_application_removed(mut self) -> Self {
        self.application = ImageSlot::EMPTY;
        self.valid_app = APP_INVALID;
        self
    }

    /// Clear SoftDevice/bootloader bookkeeping once their copies are done.
    pub fn with_relocation_done(mut self) -> Self {
        self.softdevice = ImageSlot::EMPTY;
        self.bootloader = ImageSlot::EMPTY;
        self.src_image_address = ERASED_WORD;
        self
    }
}
