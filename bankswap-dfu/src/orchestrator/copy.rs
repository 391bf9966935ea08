// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Whole-image block copy planning.
//!
//! A copy is split into units. Each unit is compared before it is copied, so
//! restarting a copy skips the units that already match. When source and
//! destination overlap, units are half the gap between them (page aligned,
//! at least one page) and the sweep runs away from the side being
//! overwritten: backward when the destination lies above the source,
//! forward otherwise. The destination must be page aligned; the source only
//! word aligned.

use serde::{Deserialize, Serialize};

use crate::error::DfuError;
use crate::layout::{ranges_overlap, WORD_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockCopy {
    pub src: u32,
    pub dst: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CopyUnit {
    pub src: u32,
    pub dst: u32,
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CopyPlan {
    copy: BlockCopy,
    unit: u32,
    count: u32,
    backward: bool,
}

impl BlockCopy {
    pub const fn new(src: u32, dst: u32, size: u32) -> Self {
        Self { src, dst, size }
    }

    /// Split the copy into units for a device with `page_size` pages.
    pub fn plan(&self, page_size: u32) -> Result<CopyPlan, DfuError> {
        if self.size == 0 || self.src == self.dst {
            return Err(DfuError::Parameter);
        }
        if self.size % WORD_SIZE != 0 {
            return Err(DfuError::Alignment);
        }
        if self.src % WORD_SIZE != 0 || self.dst % page_size != 0 {
            return Err(DfuError::Alignment);
        }
        if self.src.checked_add(self.size).is_none() || self.dst.checked_add(self.size).is_none() {
            return Err(DfuError::Parameter);
        }

        let unit = if ranges_overlap(self.src, self.size, self.dst, self.size) {
            let gap = self.src.abs_diff(self.dst);
            if gap < page_size {
                return Err(DfuError::Parameter);
            }
            let half = gap / 2;
            (half - half % page_size).max(page_size)
        } else {
            page_size
        };

        Ok(CopyPlan {
            copy: *self,
            unit,
            count: self.size.div_ceil(unit),
            backward: self.dst > self.src,
        })
    }
}

impl CopyPlan {
    pub fn copy(&self) -> BlockCopy {
        self.copy
    }

    pub fn unit_size(&self) -> u32 {
        self.unit
    }

    pub fn unit_count(&self) -> u32 {
        self.count
    }

    pub fn is_backward(&self) -> bool {
        self.backward
    }

    /// Unit visited at `position` of the sweep.
    pub fn unit_at(&self, position: u32) -> Option<CopyUnit> {
        if position >= self.count {
            return None;
        }
        let index = if self.backward {
            self.count - 1 - position
        } else {
            position
        };
        let offset = index * self.unit;
        Some(CopyUnit {
            src: self.copy.src + offset,
            dst: self.copy.dst + offset,
            len: self.unit.min(self.copy.size - offset),
        })
    }
}
