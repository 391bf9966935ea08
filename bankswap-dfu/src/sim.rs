// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! RAM-backed flash and platform doubles.
//!
//! [`RamFlash`] behaves like NOR flash: programming can only clear bits and
//! erasing sets a whole page to `0xFF`. Each `begin_*` call parks one pending
//! operation that is applied when [`RamFlash::finish`] is called, which lets
//! tests and the host tool decide when completions are delivered, inject
//! faults and cut power between operations.

use core::cell::Cell;

use heapless::Vec;

use crate::error::FlashFault;
use crate::flash::FlashDriver;
use crate::layout::{FlashLayout, MAX_PAGE_SIZE, WORD_SIZE};
use crate::platform::{ResetControl, SessionTimer};
use crate::serializer::Serializer;

pub const SIM_FLASH_SIZE: usize = 0x1_0000;

/// 64 KiB device with 1 KiB pages.
pub const SIM_LAYOUT: FlashLayout = FlashLayout {
    flash_size: SIM_FLASH_SIZE as u32,
    page_size: 0x400,
    softdevice_start: 0x0000,
    softdevice_size: 0x2000,
    bank0_start: 0x2000,
    bank_size: 0x5000,
    bootloader_start: 0xC000,
    bootloader_size: 0x2000,
    storage_start: 0xE000,
    storage_size: 0x1000,
    settings_page: 0xF000,
    marker_page: 0xF400,
    swap_page: 0xF800,
    journal_page: 0xFC00,
};

pub type SimFlash = RamFlash<SIM_FLASH_SIZE>;

const MAX_PENDING_WORDS: usize = (MAX_PAGE_SIZE / WORD_SIZE) as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Write { address: u32 },
    Erase { page: u32 },
    /// Rejected at issue time, fails on completion.
    Invalid,
}

pub struct RamFlash<const N: usize> {
    memory: [u8; N],
    page_size: u32,
    pending: Option<PendingOp>,
    pending_words: Vec<u32, MAX_PENDING_WORDS>,
    fail_next: Option<FlashFault>,
    /// Operations that may still complete before power is lost.
    power_budget: Option<u32>,
    powered: bool,
    completed: u32,
    overlaps: u32,
}

impl<const N: usize> RamFlash<N> {
    /// Fully erased device.
    pub fn new(page_size: u32) -> Self {
        Self::from_memory([0xFF; N], page_size)
    }

    /// Device holding `memory`, for example a snapshot taken before a
    /// simulated power cut.
    pub fn from_memory(memory: [u8; N], page_size: u32) -> Self {
        Self {
            memory,
            page_size,
            pending: None,
            pending_words: Vec::new(),
            fail_next: None,
            power_budget: None,
            powered: true,
            completed: 0,
            overlaps: 0,
        }
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn snapshot(&self) -> [u8; N] {
        self.memory
    }

    /// Overwrite memory directly, bypassing NOR semantics. Setup helper.
    pub fn write_bytes(&mut self, address: u32, bytes: &[u8]) {
        let start = address as usize;
        if let Some(dest) = self.memory.get_mut(start..start + bytes.len()) {
            dest.copy_from_slice(bytes);
        }
    }

    /// Fail the next operation with `fault` without applying it.
    pub fn fail_next(&mut self, fault: FlashFault) {
        self.fail_next = Some(fault);
    }

    /// Let `ops` more operations complete, then lose power: later operations
    /// are never applied and never complete.
    pub fn cut_power_after(&mut self, ops: u32) {
        self.power_budget = Some(ops);
        if ops == 0 {
            self.powered = false;
        }
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Operations completed so far, successful or not.
    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// Number of operations started while another was still pending.
    pub fn overlap_violations(&self) -> u32 {
        self.overlaps
    }

    /// Complete the pending operation. `None` when nothing is pending or
    /// power has been cut.
    pub fn finish(&mut self) -> Option<Result<(), FlashFault>> {
        let op = self.pending.take()?;
        if !self.powered {
            return None;
        }

        let result = match self.fail_next.take() {
            Some(fault) => Err(fault),
            None => self.apply(op),
        };
        self.completed += 1;

        if let Some(budget) = self.power_budget.as_mut() {
            *budget = budget.saturating_sub(1);
            if *budget == 0 {
                self.powered = false;
            }
        }
        Some(result)
    }

    fn apply(&mut self, op: PendingOp) -> Result<(), FlashFault> {
        match op {
            PendingOp::Write { address } => {
                let start = address as usize;
                let len = self.pending_words.len() * WORD_SIZE as usize;
                let dest = self
                    .memory
                    .get_mut(start..start + len)
                    .ok_or(FlashFault::OutOfRange)?;
                for (chunk, word) in dest.chunks_exact_mut(4).zip(self.pending_words.iter()) {
                    for (byte, new) in chunk.iter_mut().zip(word.to_le_bytes()) {
                        *byte &= new;
                    }
                }
                Ok(())
            }
            PendingOp::Erase { page } => {
                let start = page as usize;
                let dest = self
                    .memory
                    .get_mut(start..start + self.page_size as usize)
                    .ok_or(FlashFault::OutOfRange)?;
                dest.fill(0xFF);
                Ok(())
            }
            PendingOp::Invalid => Err(FlashFault::OutOfRange),
        }
    }

    fn park(&mut self, op: PendingOp) -> bool {
        if self.pending.is_some() {
            self.overlaps += 1;
            return false;
        }
        self.pending = Some(op);
        true
    }
}

impl<const N: usize> FlashDriver for RamFlash<N> {
    fn begin_write(&mut self, address: u32, words: &[u32]) {
        let op = if address % WORD_SIZE == 0 {
            PendingOp::Write { address }
        } else {
            PendingOp::Invalid
        };
        if !self.park(op) {
            return;
        }
        self.pending_words.clear();
        if self.pending_words.extend_from_slice(words).is_err() {
            self.pending = Some(PendingOp::Invalid);
        }
    }

    fn begin_erase(&mut self, page_address: u32) {
        let op = if page_address % self.page_size == 0 {
            PendingOp::Erase { page: page_address }
        } else {
            PendingOp::Invalid
        };
        self.park(op);
    }

    fn read(&self, address: u32, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self
                .memory
                .get(address as usize + i)
                .copied()
                .unwrap_or(0xFF);
        }
    }
}

/// Deliver every pending completion until the flash goes quiet.
pub fn pump<const N: usize>(serializer: &Serializer<'_, RamFlash<N>>) -> usize {
    pump_events(serializer, usize::MAX)
}

/// Deliver at most `max` completions. Returns how many were delivered.
pub fn pump_events<const N: usize>(serializer: &Serializer<'_, RamFlash<N>>, max: usize) -> usize {
    let mut delivered = 0;
    while delivered < max {
        let Some(result) = serializer.with_driver(RamFlash::finish) else {
            break;
        };
        serializer.on_flash_event(result);
        delivered += 1;
    }
    delivered
}

/// Session timer that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct ManualTimer {
    armed: Cell<Option<u32>>,
    arms: Cell<u32>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timeout of the running timer, if armed.
    pub fn armed(&self) -> Option<u32> {
        self.armed.get()
    }

    pub fn arm_count(&self) -> u32 {
        self.arms.get()
    }
}

impl SessionTimer for ManualTimer {
    fn arm(&self, timeout_ms: u32) {
        self.armed.set(Some(timeout_ms));
        self.arms.set(self.arms.get() + 1);
    }

    fn disarm(&self) {
        self.armed.set(None);
    }
}

/// Reset line that counts requests.
#[derive(Debug, Default)]
pub struct ResetLatch {
    count: Cell<u32>,
}

impl ResetLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> bool {
        self.count.get() > 0
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }
}

impl ResetControl for ResetLatch {
    fn request_reset(&self) {
        self.count.set(self.count.get() + 1);
    }
}
