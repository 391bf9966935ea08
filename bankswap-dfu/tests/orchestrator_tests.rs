// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Tests for the update orchestrator: settings commits, activation plans,
//! boot-time continuation and the application validity decision.

mod common;

use bankswap_dfu::settings::{MARKER_CLEAR, MARKER_PENDING, SETTINGS_SIZE};
use bankswap_dfu::sim::{pump_events, SimFlash, SIM_LAYOUT};
use bankswap_dfu::{
    AbortReason, Bank, BootTarget, BootloaderSettings, DfuError, FlashFault, ImageKind,
    ImageSizes, ImageSlot, UpdatePhase,
};
use common::{blank_flash, boot, Device, PAGE};

fn pattern(len: u32, salt: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_add(salt).rotate_left(3)).collect()
}

fn write_record(flash: &mut SimFlash, record: &BootloaderSettings) {
    flash.write_bytes(SIM_LAYOUT.settings_page, &record.to_bytes());
}

fn read_record(device: &Device<'_>) -> BootloaderSettings {
    let mut bytes = [0u8; SETTINGS_SIZE as usize];
    device.serializer.read(SIM_LAYOUT.settings_page, &mut bytes);
    BootloaderSettings::from_bytes(&bytes)
}

fn read_region(device: &Device<'_>, address: u32, len: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; len as usize];
    device.serializer.read(address, &mut bytes);
    bytes
}

/// Device with an application of `app` installed in bank 0.
fn installed(app: &[u8]) -> SimFlash {
    let mut flash = blank_flash();
    flash.write_bytes(SIM_LAYOUT.bank0_start, app);
    write_record(
        &mut flash,
        &BootloaderSettings::default().with_application_installed(app.len() as u32),
    );
    flash
}

#[test]
fn test_blank_device_stays_in_bootloader() {
    boot(blank_flash(), |device| {
        assert_eq!(device.orchestrator.phase(), UpdatePhase::NoUpdate);
        assert!(!device.orchestrator.is_busy());
        assert_eq!(device.orchestrator.boot_target(), BootTarget::StayInBootloader);
        assert!(!device.reset.requested());
    });
}

#[test]
fn test_installed_application_is_started() {
    boot(installed(&pattern(2048, 1)), |device| {
        assert_eq!(
            device.orchestrator.boot_target(),
            BootTarget::Application(SIM_LAYOUT.bank0_start)
        );
    });
}

#[test]
fn test_application_validity_reads_flash() {
    boot(installed(&pattern(1024, 2)), |device| {
        let orchestrator = device.orchestrator;
        let app = SIM_LAYOUT.bank0_start;
        assert!(orchestrator.is_application_valid(app));

        // Erased first word.
        assert!(!orchestrator.is_application_valid(SIM_LAYOUT.bank1_start()));

        device
            .serializer
            .with_driver(|flash| flash.write_bytes(SIM_LAYOUT.marker_page, &MARKER_PENDING.to_le_bytes()));
        assert!(!orchestrator.is_application_valid(app));

        device
            .serializer
            .with_driver(|flash| flash.write_bytes(SIM_LAYOUT.marker_page, &MARKER_CLEAR.to_le_bytes()));
        assert!(orchestrator.is_application_valid(app));

        let invalid = BootloaderSettings::default().with_application_removed();
        device.serializer.with_driver(|flash| write_record(flash, &invalid));
        assert!(!orchestrator.is_application_valid(app));
    });
}

#[test]
fn test_target_bank_is_opposite_of_recorded_bank() {
    boot(installed(&pattern(1024, 3)), |device| {
        let orchestrator = device.orchestrator;
        assert_eq!(orchestrator.target_bank(ImageKind::Application), Bank::Bank1);
        assert_eq!(orchestrator.target_bank(ImageKind::SoftDevice), Bank::Bank1);
        assert_eq!(orchestrator.target_bank(ImageKind::Bootloader), Bank::Bank1);
    });
}

#[test]
fn test_record_new_images_commits_under_marker() {
    boot(blank_flash(), |device| {
        let sizes = ImageSizes::new(0x800, 0x400, 0);
        device.orchestrator.record_new_images(sizes, Bank::Bank1).unwrap();
        assert!(device.orchestrator.is_busy());

        // The marker is set before the record is touched.
        while device.serializer.read_word(SIM_LAYOUT.marker_page) != MARKER_PENDING {
            assert_eq!(pump_events(device.serializer, 1), 1);
        }
        assert_eq!(read_record(&device), BootloaderSettings::default());
        assert_eq!(device.orchestrator.phase(), UpdatePhase::SettingsPending);

        device.settle();

        let expected = BootloaderSettings::default().with_new_images(sizes, Bank::Bank1, &SIM_LAYOUT);
        assert_eq!(read_record(&device), expected);
        assert_eq!(device.orchestrator.settings(), expected);
        assert_eq!(device.serializer.read_word(SIM_LAYOUT.marker_page), MARKER_CLEAR);
        assert_eq!(device.orchestrator.phase(), UpdatePhase::Done);
        assert!(!device.reset.requested());
    });
}

#[test]
fn test_activate_application_from_bank1_copies_and_resets() {
    let image = pattern(3 * PAGE + 8, 4);
    let mut flash = blank_flash();
    flash.write_bytes(SIM_LAYOUT.bank1_start(), &image);

    boot(flash, |device| {
        device
            .orchestrator
            .activate_application(image.len() as u32, Bank::Bank1)
            .unwrap();
        device.settle();

        assert_eq!(read_region(&device, SIM_LAYOUT.bank0_start, image.len() as u32), image);
        let record = read_record(&device);
        assert!(record.app_marked_valid());
        assert_eq!(
            record.application.image(SIM_LAYOUT.bank_size),
            Some((image.len() as u32, Bank::Bank0))
        );
        assert_eq!(device.reset.count(), 1);
        assert!(device.orchestrator.is_application_valid(SIM_LAYOUT.bank0_start));
    });
}

#[test]
fn test_activate_application_in_bank0_only_marks_valid() {
    let image = pattern(PAGE, 5);
    let mut flash = blank_flash();
    flash.write_bytes(SIM_LAYOUT.bank0_start, &image);
    write_record(&mut flash, &BootloaderSettings::default().with_application_removed());

    boot(flash, |device| {
        let before = device.serializer.with_driver(|flash| flash.completed());
        device.orchestrator.activate_application(PAGE, Bank::Bank0).unwrap();
        device.settle();
        let ops = device.serializer.with_driver(|flash| flash.completed()) - before;

        assert!(read_record(&device).app_marked_valid());
        assert_eq!(device.reset.count(), 1);
        // One commit: marker pending, record, marker clear, seven flash
        // operations each.
        assert_eq!(ops, 21);
    });
}

#[test]
fn test_copy_skips_units_that_already_match() {
    let image = pattern(4 * PAGE, 6);
    let count_ops = |bank0: &[u8]| {
        let mut flash = blank_flash();
        flash.write_bytes(SIM_LAYOUT.bank1_start(), &image);
        flash.write_bytes(SIM_LAYOUT.bank0_start, bank0);
        boot(flash, |device| {
            device
                .orchestrator
                .activate_application(image.len() as u32, Bank::Bank1)
                .unwrap();
            device.settle()
        })
    };

    let mut one_page_off = image.clone();
    one_page_off[(2 * PAGE) as usize] ^= 0xFF;

    // One unit differs: one erase and one program.
    assert_eq!(count_ops(&one_page_off) - count_ops(&image), 2);
}

#[test]
fn test_activation_rejected_while_busy() {
    boot(blank_flash(), |device| {
        device
            .orchestrator
            .record_new_images(ImageSizes::application(1024), Bank::Bank1)
            .unwrap();

        assert_eq!(
            device.orchestrator.activate_application(1024, Bank::Bank1),
            Err(DfuError::Busy)
        );
    });
}

#[test]
fn test_boot_resumes_interrupted_application_copy() {
    let image = pattern(2 * PAGE + 4, 7);
    let mut flash = blank_flash();
    flash.write_bytes(SIM_LAYOUT.bank1_start(), &image);
    flash.write_bytes(SIM_LAYOUT.bank0_start, &image[..PAGE as usize]);
    flash.write_bytes(SIM_LAYOUT.bank0_start + PAGE, &[0u8; 16]);
    write_record(
        &mut flash,
        &BootloaderSettings::default().with_new_images(
            ImageSizes::application(image.len() as u32),
            Bank::Bank1,
            &SIM_LAYOUT,
        ),
    );

    boot(flash, |device| {
        assert_eq!(read_region(&device, SIM_LAYOUT.bank0_start, image.len() as u32), image);
        assert!(device.orchestrator.is_application_valid(SIM_LAYOUT.bank0_start));
        assert_eq!(device.orchestrator.phase(), UpdatePhase::Done);
        assert!(!device.reset.requested());
    });
}

#[test]
fn test_boot_relocates_softdevice_then_bootloader() {
    let softdevice = pattern(0x800, 8);
    let bootloader = pattern(0x400, 9);
    let bank1 = SIM_LAYOUT.bank1_start();
    let mut flash = blank_flash();
    flash.write_bytes(bank1, &softdevice);
    flash.write_bytes(bank1 + 0x800, &bootloader);
    write_record(
        &mut flash,
        &BootloaderSettings::default().with_new_images(
            ImageSizes::new(0x800, 0x400, 0),
            Bank::Bank1,
            &SIM_LAYOUT,
        ),
    );

    boot(flash, |device| {
        assert_eq!(read_region(&device, SIM_LAYOUT.softdevice_start, 0x800), softdevice);
        assert_eq!(read_region(&device, SIM_LAYOUT.bootloader_start, 0x400), bootloader);
        let record = read_record(&device);
        assert_eq!(record.softdevice, ImageSlot::EMPTY);
        assert_eq!(record.bootloader, ImageSlot::EMPTY);
        assert_eq!(device.reset.count(), 1);
    });
}

#[test]
fn test_softdevice_activation_defers_relocation() {
    let softdevice = pattern(0x800, 10);
    let mut flash = installed(&pattern(1024, 11));
    flash.write_bytes(SIM_LAYOUT.bank1_start(), &softdevice);

    let memory = boot(flash, |device| {
        device
            .orchestrator
            .activate_softdevice_and_or_bootloader(ImageSizes::new(0x800, 0, 0), Bank::Bank1)
            .unwrap();
        device.settle();

        assert_eq!(device.reset.count(), 1);
        assert!(read_region(&device, SIM_LAYOUT.softdevice_start, 0x800)
            .iter()
            .all(|&b| b == 0xFF));
        // A new SoftDevice may move the application base.
        assert!(!device.orchestrator.is_application_valid(SIM_LAYOUT.bank0_start));
        device.snapshot()
    });

    boot(SimFlash::from_memory(memory, PAGE), |device| {
        assert_eq!(read_region(&device, SIM_LAYOUT.softdevice_start, 0x800), softdevice);
        assert_eq!(device.reset.count(), 1);
    });
}

#[test]
fn test_pending_marker_is_resolved_at_boot() {
    let mut flash = installed(&pattern(1024, 12));
    flash.write_bytes(SIM_LAYOUT.marker_page, &MARKER_PENDING.to_le_bytes());

    boot(flash, |device| {
        assert_eq!(device.serializer.read_word(SIM_LAYOUT.marker_page), MARKER_CLEAR);
        assert!(device.orchestrator.is_application_valid(SIM_LAYOUT.bank0_start));
        assert_eq!(device.orchestrator.phase(), UpdatePhase::Done);
    });
}

#[test]
fn test_abort_after_writing_bank0_invalidates_application() {
    boot(installed(&pattern(1024, 13)), |device| {
        device
            .orchestrator
            .on_session_aborted(AbortReason::Timeout, Some(Bank::Bank0));
        device.settle();

        let record = read_record(&device);
        assert!(!record.app_marked_valid());
        assert_eq!(record.application, ImageSlot::EMPTY);
        assert_eq!(device.reset.count(), 1);
    });
}

#[test]
fn test_abort_after_writing_bank1_only_resets() {
    boot(installed(&pattern(1024, 14)), |device| {
        device
            .orchestrator
            .on_session_aborted(AbortReason::Hardware, Some(Bank::Bank1));

        assert_eq!(device.reset.count(), 1);
        assert!(device.serializer.is_idle());
        assert!(device.orchestrator.is_application_valid(SIM_LAYOUT.bank0_start));
    });
}

#[test]
fn test_copy_failure_resets_and_boot_resumes() {
    let image = pattern(2 * PAGE, 15);
    let mut flash = installed(&pattern(2 * PAGE, 16));
    flash.write_bytes(SIM_LAYOUT.bank1_start(), &image);

    let memory = boot(flash, |device| {
        device
            .orchestrator
            .activate_application(image.len() as u32, Bank::Bank1)
            .unwrap();
        while device.orchestrator.phase() != UpdatePhase::PendingBlockCopy {
            assert_eq!(pump_events(device.serializer, 1), 1);
        }
        device.serializer.with_driver(|flash| flash.fail_next(FlashFault::Erase));
        device.settle();

        assert_eq!(device.reset.count(), 1);
        assert!(!device.orchestrator.is_busy());
        assert!(!device.orchestrator.is_application_valid(SIM_LAYOUT.bank0_start));
        device.snapshot()
    });

    boot(SimFlash::from_memory(memory, PAGE), |device| {
        assert_eq!(read_region(&device, SIM_LAYOUT.bank0_start, image.len() as u32), image);
        assert!(device.orchestrator.is_application_valid(SIM_LAYOUT.bank0_start));
    });
}
