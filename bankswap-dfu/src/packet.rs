// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Transport-agnostic packet formats.
//!
//! - Start packet: three little-endian `u32` words
//!   (SoftDevice size, bootloader size, application size).
//! - Init packet: opaque metadata, at most [`INIT_PACKET_MAX`] bytes in total.
//! - Data packet: raw image bytes in word-aligned chunks of at most
//!   [`MAX_DATA_PACKET`] bytes.

use crate::error::DfuError;
use crate::layout::{FlashLayout, WORD_SIZE};
use crate::serializer::MAX_PAYLOAD_BYTES;
use serde::{Deserialize, Serialize};

pub const START_PACKET_SIZE: usize = 12;
pub const INIT_PACKET_MAX: usize = 64;
pub const MAX_DATA_PACKET: usize = MAX_PAYLOAD_BYTES;

/// The image combinations a session may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageKind {
    Application,
    SoftDevice,
    Bootloader,
    SoftDeviceAndBootloader,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageSizes {
    pub softdevice: u32,
    pub bootloader: u32,
    pub application: u32,
}

impl ImageSizes {
    pub const fn new(softdevice: u32, bootloader: u32, application: u32) -> Self {
        Self {
            softdevice,
            bootloader,
            application,
        }
    }

    pub fn application(size: u32) -> Self {
        Self::new(0, 0, size)
    }

    pub fn from_start_packet(bytes: &[u8]) -> Result<Self, DfuError> {
        if bytes.len() != START_PACKET_SIZE {
            return Err(DfuError::Parameter);
        }
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Ok(Self::new(word(0), word(4), word(8)))
    }

    pub fn to_start_packet(&self) -> [u8; START_PACKET_SIZE] {
        let mut packet = [0u8; START_PACKET_SIZE];
        packet[0..4].copy_from_slice(&self.softdevice.to_le_bytes());
        packet[4..8].copy_from_slice(&self.bootloader.to_le_bytes());
        packet[8..12].copy_from_slice(&self.application.to_le_bytes());
        packet
    }

    /// Total image size, or `None` on overflow.
    pub fn total(&self) -> Option<u32> {
        self.softdevice
            .checked_add(self.bootloader)?
            .checked_add(self.application)
    }

    pub fn kind(&self) -> Result<ImageKind, DfuError> {
        match (self.softdevice > 0, self.bootloader > 0, self.application > 0) {
            (false, false, true) => Ok(ImageKind::Application),
            (true, false, false) => Ok(ImageKind::SoftDevice),
            (false, true, false) => Ok(ImageKind::Bootloader),
            (true, true, false) => Ok(ImageKind::SoftDeviceAndBootloader),
            _ => Err(DfuError::Parameter),
        }
    }

    /// Check combination, alignment and size limits for `layout`.
    pub fn validate(&self, layout: &FlashLayout) -> Result<ImageKind, DfuError> {
        let kind = self.kind()?;

        if [self.softdevice, self.bootloader, self.application]
            .iter()
            .any(|size| size % WORD_SIZE != 0)
        {
            return Err(DfuError::Alignment);
        }

        if self.bootloader > layout.bootloader_size || self.softdevice > layout.softdevice_size {
            return Err(DfuError::ImageTooLarge);
        }

        match self.total() {
            Some(total) if total <= layout.bank_size => Ok(kind),
            _ => Err(DfuError::ImageTooLarge),
        }
    }
}
