// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Flash layout: code regions, the two image banks and the reserved pages.
//!
//! Bank 1 starts directly after bank 0. The settings, crash-marker, swap and
//! journal pages each occupy one page of their own.

use serde::{Deserialize, Serialize};

/// Size of a flash word in bytes. All addresses and sizes handed to flash are
/// multiples of this.
pub const WORD_SIZE: u32 = 4;

/// Largest page size the serializer can back up into its scratch buffer.
pub const MAX_PAGE_SIZE: u32 = 4096;

/// Value of an erased flash word.
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

/// One of the two image banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bank {
    /// The executable bank: applications run from here.
    Bank0,
    /// The receive bank directly following bank 0.
    Bank1,
}

impl Bank {
    pub fn index(self) -> u32 {
        match self {
            Self::Bank0 => 0,
            Self::Bank1 => 1,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::Bank0 => Self::Bank1,
            Self::Bank1 => Self::Bank0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashLayout {
    pub flash_size: u32,
    pub page_size: u32,
    pub softdevice_start: u32,
    pub softdevice_size: u32,
    pub bank0_start: u32,
    pub bank_size: u32,
    pub bootloader_start: u32,
    pub bootloader_size: u32,
    /// Pages handed out by `RegisterParams::Blocks` registrations.
    pub storage_start: u32,
    pub storage_size: u32,
    pub settings_page: u32,
    pub marker_page: u32,
    pub swap_page: u32,
    pub journal_page: u32,
}

/// Reason a [`FlashLayout`] was rejected by [`FlashLayout::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LayoutError {
    PageSize,
    Misaligned,
    OutOfFlash,
    Overlap,
}

impl FlashLayout {
    /// 256 KiB device with 1 KiB pages and a 96 KiB SoftDevice.
    pub const NRF51_DUAL_BANK: Self = Self {
        flash_size: 0x0004_0000,
        page_size: 0x400,
        softdevice_start: 0x0000_0000,
        softdevice_size: 0x0001_8000,
        bank0_start: 0x0001_8000,
        bank_size: 0x0001_0000,
        bootloader_start: 0x0003_8000,
        bootloader_size: 0x0000_6000,
        storage_start: 0x0003_E000,
        storage_size: 0x0000_1000,
        settings_page: 0x0003_F000,
        marker_page: 0x0003_F400,
        swap_page: 0x0003_F800,
        journal_page: 0x0003_FC00,
    };

    pub fn bank_address(&self, bank: Bank) -> u32 {
        self.bank0_start + bank.index() * self.bank_size
    }

    pub fn bank1_start(&self) -> u32 {
        self.bank_address(Bank::Bank1)
    }

    pub fn bootloader_end(&self) -> u32 {
        self.bootloader_start + self.bootloader_size
    }

    pub fn page_words(&self) -> usize {
        (self.page_size / WORD_SIZE) as usize
    }

    pub fn page_of(&self, address: u32) -> u32 {
        address - address % self.page_size
    }

    pub fn is_page_aligned(&self, address: u32) -> bool {
        address % self.page_size == 0
    }

    /// `size` rounded up to whole pages. `None` on overflow.
    pub fn page_span(&self, size: u32) -> Option<u32> {
        size.div_ceil(self.page_size).checked_mul(self.page_size)
    }

    /// Whether `[start, start + size)` touches the swap or journal page.
    pub fn overlaps_reserved(&self, start: u32, size: u32) -> bool {
        [self.swap_page, self.journal_page]
            .iter()
            .any(|&page| ranges_overlap(start, size, page, self.page_size))
    }

    /// Whether `page` may be the subject of a swap sequence.
    pub fn is_data_page(&self, page: u32) -> bool {
        self.is_page_aligned(page)
            && page < self.flash_size
            && page != self.swap_page
            && page != self.journal_page
    }

    /// Check that every region is page aligned, inside flash and disjoint.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if !self.page_size.is_power_of_two()
            || self.page_size < 8 * WORD_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(LayoutError::PageSize);
        }

        let regions = [
            (self.softdevice_start, self.softdevice_size),
            (self.bank0_start, self.bank_size * 2),
            (self.bootloader_start, self.bootloader_size),
            (self.storage_start, self.storage_size),
            (self.settings_page, self.page_size),
            (self.marker_page, self.page_size),
            (self.swap_page, self.page_size),
            (self.journal_page, self.page_size),
        ];

        for &(start, size) in &regions {
            if !self.is_page_aligned(start) || !self.is_page_aligned(size) {
                return Err(LayoutError::Misaligned);
            }
            if start.checked_add(size).map_or(true, |end| end > self.flash_size) {
                return Err(LayoutError::OutOfFlash);
            }
        }

        for (i, &(a, a_size)) in regions.iter().enumerate() {
            for &(b, b_size) in &regions[i + 1..] {
                if ranges_overlap(a, a_size, b, b_size) {
                    return Err(LayoutError::Overlap);
                }
            }
        }

        Ok(())
    }
}

pub(crate) fn ranges_overlap(a: u32, a_size: u32, b: u32, b_size: u32) -> bool {
    a_size != 0 && b_size != 0 && a < b.saturating_add(b_size) && b < a.saturating_add(a_size)
}
