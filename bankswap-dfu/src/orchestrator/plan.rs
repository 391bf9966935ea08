// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Pure planning of orchestrator work.
//!
//! Every plan is a short list of [`Action`]s. Commits leave the on-flash
//! record in a state from which [`boot_plan`] can finish the rest after an
//! unplanned reset.

use heapless::Vec;

use super::copy::BlockCopy;
use crate::layout::{Bank, FlashLayout};
use crate::packet::ImageSizes;
use crate::settings::BootloaderSettings;

pub const PLAN_DEPTH: usize = 8;

pub type Plan = Vec<Action, PLAN_DEPTH>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    /// Write the settings record under the crash marker.
    Commit(BootloaderSettings),
    Copy(BlockCopy),
    Reset,
}

fn plan(actions: &[Action]) -> Plan {
    Plan::from_slice(actions).unwrap_or_default()
}

/// SoftDevice/bootloader images waiting to be moved out of a bank:
/// `(source, softdevice size, bootloader size)`.
fn pending_relocation(record: &BootloaderSettings, layout: &FlashLayout) -> Option<(u32, u32, u32)> {
    let softdevice = record
        .softdevice
        .image(layout.softdevice_size)
        .map_or(0, |(size, _)| size);
    let bootloader = record
        .bootloader
        .image(layout.bootloader_size)
        .map_or(0, |(size, _)| size);
    let src = record.src_image_address;
    let from_bank = src == layout.bank0_start || src == layout.bank1_start();
    let total = softdevice + bootloader;
    (total > 0 && from_bank && total <= layout.bank_size).then_some((src, softdevice, bootloader))
}

/// Work left over from before the last reset.
pub fn boot_plan(record: &BootloaderSettings, marker_pending: bool, layout: &FlashLayout) -> Plan {
    if let Some((size, Bank::Bank1)) = record.application.image(layout.bank_size) {
        return plan(&[
            Action::Copy(BlockCopy::new(layout.bank1_start(), layout.bank0_start, size)),
            Action::Commit(record.with_application_installed(size)),
        ]);
    }

    if let Some((src, softdevice, bootloader)) = pending_relocation(record, layout) {
        let mut actions = Plan::new();
        if softdevice > 0 {
            let copy = BlockCopy::new(src, layout.softdevice_start, softdevice);
            let _ = actions.push(Action::Copy(copy));
        }
        if bootloader > 0 {
            let copy = BlockCopy::new(src + softdevice, layout.bootloader_start, bootloader);
            let _ = actions.push(Action::Copy(copy));
        }
        let _ = actions.push(Action::Commit(record.with_relocation_done()));
        let _ = actions.push(Action::Reset);
        return actions;
    }

    if marker_pending {
        // The record itself is atomically old or new. Writing it again clears
        // the marker.
        return plan(&[Action::Commit(*record)]);
    }

    Plan::new()
}

/// Activate an application of `size` bytes received into `bank`.
pub fn application_plan(
    settings: &BootloaderSettings,
    size: u32,
    bank: Bank,
    layout: &FlashLayout,
) -> Plan {
    let received = settings.with_new_images(ImageSizes::application(size), bank, layout);
    match bank {
        Bank::Bank1 => plan(&[
            Action::Commit(received),
            Action::Copy(BlockCopy::new(layout.bank1_start(), layout.bank0_start, size)),
            Action::Commit(received.with_application_installed(size)),
            Action::Reset,
        ]),
        Bank::Bank0 => plan(&[
            Action::Commit(received.with_application_installed(size)),
            Action::Reset,
        ]),
    }
}

/// Record SoftDevice and/or bootloader images received into `bank`. They are
/// moved into place by the next boot.
pub fn system_plan(
    settings: &BootloaderSettings,
    sizes: ImageSizes,
    bank: Bank,
    layout: &FlashLayout,
) -> Plan {
    plan(&[
        Action::Commit(settings.with_new_images(sizes, bank, layout)),
        Action::Reset,
    ])
}

/// Bookkeeping after a session died. A session that wrote into bank 0 has
/// damaged the application living there.
pub fn abort_plan(settings: &BootloaderSettings, touched: Option<Bank>) -> Plan {
    if touched == Some(Bank::Bank0) && settings.app_marked_valid() {
        plan(&[
            Action::Commit(settings.with_application_removed()),
            Action::Reset,
        ])
    } else {
        plan(&[Action::Reset])
    }
}
