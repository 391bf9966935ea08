// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Shared wiring for integration tests: one simulated device, booted the
//! same way the firmware boots it.

#![allow(dead_code)]

use bankswap_dfu::crc16::{crc16, crc16_trailer};
use bankswap_dfu::sim::{pump, ManualTimer, ResetLatch, SimFlash, SIM_LAYOUT};
use bankswap_dfu::{DfuConfig, DfuController, Orchestrator, Serializer};

pub const PAGE: u32 = SIM_LAYOUT.page_size;

pub struct Device<'a> {
    pub serializer: &'a Serializer<'a, SimFlash>,
    pub orchestrator: &'a Orchestrator<'a, SimFlash>,
    pub controller: &'a DfuController<'a, SimFlash>,
    pub timer: &'a ManualTimer,
    pub reset: &'a ResetLatch,
}

impl Device<'_> {
    /// Deliver every pending flash completion.
    pub fn settle(&self) -> usize {
        pump(self.serializer)
    }

    pub fn snapshot(&self) -> [u8; bankswap_dfu::sim::SIM_FLASH_SIZE] {
        self.serializer.with_driver(|flash| flash.snapshot())
    }
}

/// Boot a device on `flash`: serializer recovery, orchestrator boot plan and
/// controller registration, each run to completion.
pub fn boot<R>(flash: SimFlash, f: impl FnOnce(Device<'_>) -> R) -> R {
    let serializer = Serializer::new(flash, SIM_LAYOUT);
    let timer = ManualTimer::new();
    let reset = ResetLatch::new();

    serializer.init().expect("serializer init");
    pump(&serializer);

    let orchestrator = Orchestrator::new(&serializer, &reset);
    orchestrator.start().expect("orchestrator start");
    pump(&serializer);

    let controller = DfuController::new(&serializer, &orchestrator, &timer, DfuConfig::default());
    controller.start().expect("controller start");

    f(Device {
        serializer: &serializer,
        orchestrator: &orchestrator,
        controller: &controller,
        timer: &timer,
        reset: &reset,
    })
}

pub fn blank_flash() -> SimFlash {
    SimFlash::new(PAGE)
}

/// `len` bytes whose last two are a CRC16 trailer, so the whole image folds
/// to zero with `seed`.
pub fn image_with_trailer(len: usize, seed: u16, fill: u8) -> Vec<u8> {
    let mut image: Vec<u8> = (0..len - 2)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(fill))
        .collect();
    let crc = crc16(seed, &image);
    image.extend_from_slice(&crc16_trailer(crc));
    image
}
