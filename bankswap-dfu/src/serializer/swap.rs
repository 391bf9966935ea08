// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Power-loss-safe partial page rewrite.
//!
//! A write that leaves some words of its page untouched goes through the swap
//! page: the old page is backed up, the journal tag marks the backup as
//! complete, the page is erased, the untouched head and tail words are
//! restored from the backup, the new body is written, the journal is erased
//! (commit point) and finally the swap page is erased. A write covering a
//! whole page only erases and writes.

use crate::layout::{FlashLayout, WORD_SIZE};

/// Step of one page rewrite. Advances only on the completion of the flash
/// operation issued for the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SwapState {
    Init,
    BackupToSwap,
    MarkDirty,
    EraseTarget,
    RestoreHead,
    RestoreTail,
    WriteBody,
    ClearDirty,
    EraseSwap,
    Complete,
}

/// Word split of one page touched by a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SwapPlan {
    pub page: u32,
    /// Unaffected words before the written range.
    pub head_words: u32,
    pub body_words: u32,
    /// Unaffected words after the written range.
    pub tail_words: u32,
}

impl SwapPlan {
    /// Plan the part of a `len`-byte write at `address` that falls into the
    /// page containing `address`.
    pub fn for_range(layout: &FlashLayout, address: u32, len: u32) -> Self {
        let page = layout.page_of(address);
        let page_words = layout.page_size / WORD_SIZE;
        let head_words = (address - page) / WORD_SIZE;
        let body_words = (len / WORD_SIZE).min(page_words - head_words);
        Self {
            page,
            head_words,
            body_words,
            tail_words: page_words - head_words - body_words,
        }
    }

    pub fn is_whole_page(&self) -> bool {
        self.head_words == 0 && self.tail_words == 0
    }

    pub fn body_bytes(&self) -> u32 {
        self.body_words * WORD_SIZE
    }
}

impl SwapState {
    pub fn next(self, plan: &SwapPlan) -> SwapState {
        use SwapState::*;
        match self {
            Init if plan.is_whole_page() => EraseTarget,
            Init => BackupToSwap,
            BackupToSwap => MarkDirty,
            MarkDirty => EraseTarget,
            EraseTarget if plan.head_words > 0 => RestoreHead,
            EraseTarget | RestoreHead if plan.tail_words > 0 => RestoreTail,
            EraseTarget | RestoreHead | RestoreTail => WriteBody,
            WriteBody if plan.is_whole_page() => Complete,
            WriteBody => ClearDirty,
            ClearDirty => EraseSwap,
            EraseSwap | Complete => Complete,
        }
    }
}
