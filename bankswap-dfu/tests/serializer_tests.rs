// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Tests for the flash access serializer: registration, argument checks,
//! queueing and completion delivery.

use std::cell::{Cell, RefCell};

use bankswap_dfu::serializer::{MAX_PAYLOAD_BYTES, QUEUE_DEPTH};
use bankswap_dfu::sim::{pump, pump_events, SimFlash, SIM_LAYOUT};
use bankswap_dfu::{
    Completion, FlashError, FlashFault, FlashListener, Opcode, RegisterParams, Serializer,
};

const PAGE: u32 = SIM_LAYOUT.page_size;

#[derive(Default)]
struct Recorder {
    completions: RefCell<Vec<Completion>>,
    ready: Cell<u32>,
}

impl FlashListener for Recorder {
    fn on_flash_complete(&self, completion: &Completion) {
        self.completions.borrow_mut().push(*completion);
    }

    fn on_flash_ready(&self) {
        self.ready.set(self.ready.get() + 1);
    }
}

impl Recorder {
    fn results(&self) -> Vec<Result<(), FlashError>> {
        self.completions.borrow().iter().map(|c| c.result).collect()
    }
}

fn ready<'a>(flash: SimFlash) -> Serializer<'a, SimFlash> {
    let serializer = Serializer::new(flash, SIM_LAYOUT);
    serializer.init().unwrap();
    pump(&serializer);
    serializer
}

fn data_page() -> RegisterParams {
    RegisterParams::Raw {
        start: SIM_LAYOUT.bank0_start,
        size: PAGE * 4,
        block_size: PAGE,
    }
}

fn read_words(serializer: &Serializer<'_, SimFlash>, address: u32, count: u32) -> Vec<u32> {
    (0..count).map(|i| serializer.read_word(address + i * 4)).collect()
}

#[test]
fn test_register_before_init_is_invalid_state() {
    let recorder = Recorder::default();
    let serializer = Serializer::new(SimFlash::new(PAGE), SIM_LAYOUT);

    assert_eq!(
        serializer.register(data_page(), &recorder),
        Err(FlashError::InvalidState)
    );
}

#[test]
fn test_blocks_are_allocated_page_aligned_from_storage() {
    let recorder = Recorder::default();
    let serializer = ready(SimFlash::new(PAGE));

    let first = serializer
        .register(RegisterParams::Blocks { block_size: 64, block_count: 4 }, &recorder)
        .unwrap();
    let second = serializer
        .register(RegisterParams::Blocks { block_size: 32, block_count: 1 }, &recorder)
        .unwrap();

    assert_eq!(first.address(), SIM_LAYOUT.storage_start);
    assert_eq!(second.address(), SIM_LAYOUT.storage_start + PAGE);
    assert_eq!(serializer.block(first, 2).unwrap().address(), SIM_LAYOUT.storage_start + 128);
    assert_eq!(serializer.block(first, 4), Err(FlashError::InvalidParam));
}

#[test]
fn test_storage_region_exhaustion() {
    let recorder = Recorder::default();
    let serializer = ready(SimFlash::new(PAGE));
    let pages = SIM_LAYOUT.storage_size / PAGE;

    serializer
        .register(RegisterParams::Blocks { block_size: PAGE, block_count: pages }, &recorder)
        .unwrap();

    assert_eq!(
        serializer.register(RegisterParams::Blocks { block_size: 4, block_count: 1 }, &recorder),
        Err(FlashError::NoSpace)
    );
    assert_eq!(
        serializer.register(
            RegisterParams::Blocks { block_size: 0xFFFF_FFFC, block_count: 1 },
            &recorder
        ),
        Err(FlashError::NoSpace)
    );
}

#[test]
fn test_raw_region_over_reserved_pages_is_rejected() {
    let recorder = Recorder::default();
    let serializer = ready(SimFlash::new(PAGE));

    for start in [SIM_LAYOUT.swap_page, SIM_LAYOUT.journal_page] {
        let params = RegisterParams::Raw { start, size: PAGE, block_size: PAGE };
        assert_eq!(serializer.register(params, &recorder), Err(FlashError::InvalidParam));
    }
}

#[test]
fn test_store_argument_checks() {
    let recorder = Recorder::default();
    let serializer = ready(SimFlash::new(PAGE));
    let handle = serializer.register(data_page(), &recorder).unwrap();

    assert_eq!(serializer.store(handle, &[], 0), Err(FlashError::NullArgument));
    assert_eq!(serializer.store(handle, &[1, 2, 3], 0), Err(FlashError::InvalidParam));
    assert_eq!(serializer.store(handle, &[0; 4], 2), Err(FlashError::InvalidParam));
    assert_eq!(serializer.store(handle, &[0; 8], PAGE * 4 - 4), Err(FlashError::InvalidParam));
    assert_eq!(
        serializer.store(handle, &[0; MAX_PAYLOAD_BYTES + 4], 0),
        Err(FlashError::InvalidParam)
    );
    assert_eq!(serializer.clear(handle, 0), Err(FlashError::InvalidParam));
    assert!(serializer.is_idle());
}

#[test]
fn test_store_writes_and_notifies_owner() {
    let recorder = Recorder::default();
    let serializer = ready(SimFlash::new(PAGE));
    let handle = serializer.register(data_page(), &recorder).unwrap();

    serializer.store(handle, &0xCAFE_F00Du32.to_le_bytes(), 8).unwrap();
    pump(&serializer);

    assert_eq!(serializer.read_word(handle.address() + 8), 0xCAFE_F00D);
    let completions = recorder.completions.borrow();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].opcode, Opcode::Store);
    assert_eq!(completions[0].offset, 8);
    assert_eq!(completions[0].size, 4);
    assert_eq!(completions[0].result, Ok(()));
}

#[test]
fn test_one_operation_in_flight_and_fifo_completion() {
    let recorder = Recorder::default();
    let serializer = ready(SimFlash::new(PAGE));
    let handle = serializer.register(data_page(), &recorder).unwrap();

    for i in 0..4u32 {
        serializer.store(handle, &i.to_le_bytes(), i * 4).unwrap();
    }
    assert_eq!(serializer.pending(), 4);

    let mut remaining = 4;
    while pump_events(&serializer, 1) == 1 {
        remaining -= 1;
        assert_eq!(serializer.pending(), remaining);
    }

    assert_eq!(serializer.with_driver(|flash| flash.overlap_violations()), 0);
    let offsets: Vec<u32> = recorder.completions.borrow().iter().map(|c| c.offset).collect();
    assert_eq!(offsets, [0, 4, 8, 12]);
}

#[test]
fn test_queue_full_rejects_without_mutation() {
    let recorder = Recorder::default();
    let serializer = ready(SimFlash::new(PAGE));
    let handle = serializer.register(data_page(), &recorder).unwrap();

    for i in 0..QUEUE_DEPTH as u32 {
        serializer.store(handle, &[0x11; 4], i * 4).unwrap();
    }

    assert_eq!(
        serializer.store(handle, &[0x22; 4], 0x100),
        Err(FlashError::QueueFull)
    );
    assert_eq!(serializer.clear(handle, PAGE), Err(FlashError::QueueFull));
    assert_eq!(serializer.pending(), QUEUE_DEPTH);

    pump(&serializer);

    assert_eq!(recorder.completions.borrow().len(), QUEUE_DEPTH);
    assert_eq!(serializer.read_word(handle.address() + 0x100), 0xFFFF_FFFF);

    // Room again: the rejected request can be retried.
    serializer.store(handle, &[0x22; 4], 0x100).unwrap();
    pump(&serializer);
    assert_eq!(serializer.read_word(handle.address() + 0x100), 0x2222_2222);
}

#[test]
fn test_update_preserves_words_outside_range() {
    let recorder = Recorder::default();
    let serializer = ready(SimFlash::new(PAGE));
    let handle = serializer.register(data_page(), &recorder).unwrap();

    let page: Vec<u8> = (0..PAGE).map(|i| i as u8).collect();
    serializer.store(handle, &page, 0).unwrap();
    pump(&serializer);

    serializer.update(handle, &[0xAB; 8], 0x40).unwrap();
    pump(&serializer);

    let mut after = vec![0u8; PAGE as usize];
    serializer.read(handle.address(), &mut after);
    let mut expected = page.clone();
    expected[0x40..0x48].fill(0xAB);
    assert_eq!(after, expected);
    assert_eq!(recorder.results(), [Ok(()), Ok(())]);
}

#[test]
fn test_update_across_pages() {
    let recorder = Recorder::default();
    let serializer = ready(SimFlash::new(PAGE));
    let handle = serializer.register(data_page(), &recorder).unwrap();

    serializer.store(handle, &[0x55; 1024], 0).unwrap();
    serializer.store(handle, &[0x66; 1024], PAGE).unwrap();
    pump(&serializer);

    serializer.update(handle, &[0x00; 16], PAGE - 8).unwrap();
    pump(&serializer);

    assert_eq!(
        read_words(&serializer, handle.address() + PAGE - 12, 6),
        [0x5555_5555, 0, 0, 0, 0, 0x6666_6666]
    );
    assert_eq!(recorder.completions.borrow().len(), 3);
}

#[test]
fn test_clear_erases_every_touched_page() {
    let recorder = Recorder::default();
    let serializer = ready(SimFlash::new(PAGE));
    let handle = serializer.register(data_page(), &recorder).unwrap();

    for page in 0..3 {
        serializer.store(handle, &[0; 4], page * PAGE).unwrap();
    }
    serializer.clear(handle, PAGE + 4).unwrap();
    pump(&serializer);

    assert_eq!(serializer.read_word(handle.address()), 0xFFFF_FFFF);
    assert_eq!(serializer.read_word(handle.address() + PAGE), 0xFFFF_FFFF);
    assert_eq!(serializer.read_word(handle.address() + 2 * PAGE), 0);
    assert_eq!(recorder.completions.borrow()[3].opcode, Opcode::Clear);
}

#[test]
fn test_clear_requires_page_aligned_handle() {
    let recorder = Recorder::default();
    let serializer = ready(SimFlash::new(PAGE));
    let handle = serializer
        .register(
            RegisterParams::Raw {
                start: SIM_LAYOUT.bank0_start,
                size: PAGE,
                block_size: 64,
            },
            &recorder,
        )
        .unwrap();
    let block = serializer.block(handle, 1).unwrap();

    assert_eq!(serializer.clear(block, 64), Err(FlashError::InvalidParam));
}

#[test]
fn test_clear_of_huge_size_is_rejected() {
    let recorder = Recorder::default();
    let serializer = ready(SimFlash::new(PAGE));
    let handle = serializer.register(data_page(), &recorder).unwrap();

    assert_eq!(serializer.clear(handle, 0xFFFF_FFFC), Err(FlashError::InvalidParam));
    assert_eq!(serializer.clear(handle, 5 * PAGE), Err(FlashError::InvalidParam));
    assert!(serializer.is_idle());
    assert!(recorder.completions.borrow().is_empty());
}

#[test]
fn test_hardware_error_is_reported_and_queue_advances() {
    let recorder = Recorder::default();
    let serializer = ready(SimFlash::new(PAGE));
    let handle = serializer.register(data_page(), &recorder).unwrap();

    serializer.with_driver(|flash| flash.fail_next(FlashFault::Program));
    serializer.store(handle, &[0; 4], 0).unwrap();
    serializer.store(handle, &[0; 4], 4).unwrap();
    pump(&serializer);

    assert_eq!(
        recorder.results(),
        [Err(FlashError::Hardware(FlashFault::Program)), Ok(())]
    );
    assert_eq!(serializer.read_word(handle.address()), 0xFFFF_FFFF);
    assert_eq!(serializer.read_word(handle.address() + 4), 0);
    assert!(serializer.is_idle());
}

#[test]
fn test_hardware_error_mid_swap_rolls_page_back() {
    let recorder = Recorder::default();
    let serializer = ready(SimFlash::new(PAGE));
    let handle = serializer.register(data_page(), &recorder).unwrap();

    let page: Vec<u8> = (0..PAGE).map(|i| (i * 7) as u8).collect();
    serializer.store(handle, &page, 0).unwrap();
    pump(&serializer);

    serializer.update(handle, &[0xEE; 16], 0x20).unwrap();
    // Backup, journal tag and target erase succeed; the head restore fails.
    assert_eq!(pump_events(&serializer, 3), 3);
    serializer.with_driver(|flash| flash.fail_next(FlashFault::Program));
    pump(&serializer);

    assert_eq!(
        recorder.results(),
        [Ok(()), Err(FlashError::Hardware(FlashFault::Program))]
    );
    let mut after = vec![0u8; PAGE as usize];
    serializer.read(handle.address(), &mut after);
    assert_eq!(after, page);
    assert_eq!(serializer.read_word(SIM_LAYOUT.swap_page), 0xFFFF_FFFF);
    assert_eq!(serializer.read_word(SIM_LAYOUT.journal_page), 0xFFFF_FFFF);
}

#[test]
fn test_init_rolls_back_journaled_page() {
    let target = SIM_LAYOUT.bank0_start;
    let mut flash = SimFlash::new(PAGE);
    // Power was lost after the target page was erased and partly rewritten.
    flash.write_bytes(SIM_LAYOUT.swap_page, &[0x3C; PAGE as usize]);
    flash.write_bytes(SIM_LAYOUT.journal_page, &target.to_le_bytes());
    flash.write_bytes(SIM_LAYOUT.journal_page + 4, &(!target).to_le_bytes());
    flash.write_bytes(target, &[0x3C; 16]);

    let recorder = Recorder::default();
    let serializer = Serializer::new(flash, SIM_LAYOUT);
    serializer.init().unwrap();
    let handle = serializer.register(data_page(), &recorder).unwrap();
    serializer.store(handle, &[0; 4], PAGE).unwrap();
    assert!(serializer.is_recovering());
    pump(&serializer);

    assert!(!serializer.is_recovering());
    assert_eq!(recorder.ready.get(), 1);

    let mut restored = vec![0u8; PAGE as usize];
    serializer.read(target, &mut restored);
    assert!(restored.iter().all(|&b| b == 0x3C));
    assert_eq!(serializer.read_word(SIM_LAYOUT.swap_page), 0xFFFF_FFFF);
    assert_eq!(serializer.read_word(SIM_LAYOUT.journal_page), 0xFFFF_FFFF);
    // The module request ran after the recovery.
    assert_eq!(recorder.results(), [Ok(())]);
    assert_eq!(serializer.read_word(target + PAGE), 0);
}

#[test]
fn test_init_discards_untagged_backup() {
    let target = SIM_LAYOUT.bank0_start;
    let mut flash = SimFlash::new(PAGE);
    flash.write_bytes(target, &[0x42; PAGE as usize]);
    flash.write_bytes(SIM_LAYOUT.swap_page, &[0x42; 64]);

    let serializer = ready(flash);

    assert_eq!(serializer.read_word(SIM_LAYOUT.swap_page), 0xFFFF_FFFF);
    assert_eq!(serializer.read_word(target), 0x4242_4242);
}
