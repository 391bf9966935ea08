// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command implementations.

use std::fs;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use crc::{Crc, CRC_32_ISO_HDLC};
use indicatif::{ProgressBar, ProgressStyle};

use bankswap_dfu::packet::MAX_DATA_PACKET;
use bankswap_dfu::settings::SETTINGS_SIZE;
use bankswap_dfu::sim::{pump, ManualTimer, RamFlash, ResetLatch};
use bankswap_dfu::{
    crc16, crc16_trailer, BootTarget, BootloaderSettings, DfuConfig, DfuController, FlashLayout,
    ImageSizes, Orchestrator, Serializer,
};

use crate::cli::ImageArgs;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const LAYOUT: FlashLayout = FlashLayout::NRF51_DUAL_BANK;
const FLASH_SIZE: usize = LAYOUT.flash_size as usize;
/// The simulated device keeps its whole flash array inline.
const SIMULATOR_STACK: usize = 16 * 1024 * 1024;

type HostFlash = RamFlash<FLASH_SIZE>;

/// Session payload ready to be streamed as data packets.
#[derive(Debug)]
pub struct Packed {
    pub image: Vec<u8>,
    pub sizes: ImageSizes,
    pub crc32: u32,
}

/// Concatenate SoftDevice, bootloader and application (whichever are given),
/// pad each to a word boundary with erased bytes and end the payload with a
/// CRC16 trailer so that the device-side check folds to zero with `seed`.
pub fn pack_images(
    softdevice: Option<&[u8]>,
    bootloader: Option<&[u8]>,
    application: Option<&[u8]>,
    seed: u16,
) -> Result<Packed> {
    if application.is_some() && (softdevice.is_some() || bootloader.is_some()) {
        bail!("an application cannot share a session with a SoftDevice or bootloader");
    }
    let parts = [softdevice, bootloader, application];
    let last = parts
        .iter()
        .rposition(Option::is_some)
        .context("no image given")?;

    let mut image = Vec::new();
    let mut lengths = [0u32; 3];
    for (i, part) in parts.iter().enumerate() {
        let Some(bytes) = part else { continue };
        ensure!(!bytes.is_empty(), "empty image");
        let start = image.len();
        image.extend_from_slice(bytes);
        // The last part carries the two trailer bytes.
        let reserve = if i == last { 2 } else { 0 };
        while (image.len() + reserve) % 4 != 0 {
            image.push(0xFF);
        }
        if i == last {
            let crc = crc16(seed, &image);
            image.extend_from_slice(&crc16_trailer(crc));
        }
        lengths[i] = (image.len() - start) as u32;
    }

    let sizes = ImageSizes::new(lengths[0], lengths[1], lengths[2]);
    sizes
        .validate(&LAYOUT)
        .map_err(|err| anyhow::anyhow!("images do not fit the device: {err}"))?;
    let crc32 = CRC32.checksum(&image);
    Ok(Packed { image, sizes, crc32 })
}

fn read_optional(path: Option<&Path>) -> Result<Option<Vec<u8>>> {
    path.map(|path| fs::read(path).with_context(|| format!("Failed to read {}", path.display())))
        .transpose()
}

fn load(images: &ImageArgs) -> Result<Packed> {
    let softdevice = read_optional(images.softdevice.as_deref())?;
    let bootloader = read_optional(images.bootloader.as_deref())?;
    let application = read_optional(images.application.as_deref())?;
    pack_images(
        softdevice.as_deref(),
        bootloader.as_deref(),
        application.as_deref(),
        images.seed,
    )
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Pack images into a session payload file.
pub fn pack(images: &ImageArgs, output: &Path) -> Result<()> {
    let packed = load(images)?;
    fs::write(output, &packed.image)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let sizes = packed.sizes;
    println!("Payload:      {} ({} bytes)", output.display(), packed.image.len());
    println!("SoftDevice:   {} bytes", sizes.softdevice);
    println!("Bootloader:   {} bytes", sizes.bootloader);
    println!("Application:  {} bytes", sizes.application);
    println!("CRC16 seed:   0x{:04x}", images.seed);
    println!("CRC32:        0x{:08x}", packed.crc32);
    println!("Start packet: {}", hex(&sizes.to_start_packet()));
    Ok(())
}

/// Decode the settings record found at `offset` in a flash dump.
pub fn settings(dump: &Path, offset: u32) -> Result<()> {
    let data = fs::read(dump).with_context(|| format!("Failed to read {}", dump.display()))?;
    let record = decode_record(&data, offset)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    println!("Application marked valid: {}", record.app_marked_valid());
    Ok(())
}

fn decode_record(data: &[u8], offset: u32) -> Result<BootloaderSettings> {
    let start = offset as usize;
    let bytes = data
        .get(start..start + SETTINGS_SIZE as usize)
        .with_context(|| format!("dump too short for a record at 0x{offset:x}"))?;
    let mut record = [0u8; SETTINGS_SIZE as usize];
    record.copy_from_slice(bytes);
    Ok(BootloaderSettings::from_bytes(&record))
}

/// What the device looks like after the post-update reboot.
#[derive(Debug)]
pub struct BootReport {
    pub settings: BootloaderSettings,
    pub target: BootTarget,
    pub resets_requested: u32,
}

/// Stream `packed` into a freshly erased device, validate and activate it.
/// Returns the flash contents when the activation stopped and whether power
/// was still on.
pub fn update(
    packed: &Packed,
    seed: u16,
    chunk: usize,
    cut_after: Option<u32>,
) -> Result<(Box<[u8; FLASH_SIZE]>, bool)> {
    ensure!(
        chunk > 0 && chunk <= MAX_DATA_PACKET && chunk % 4 == 0,
        "chunk size must be a multiple of 4 between 4 and {MAX_DATA_PACKET}"
    );

    let serializer = Serializer::new(HostFlash::new(LAYOUT.page_size), LAYOUT);
    let timer = ManualTimer::new();
    let reset = ResetLatch::new();
    serializer.init().context("storage init")?;
    pump(&serializer);
    let orchestrator = Orchestrator::new(&serializer, &reset);
    orchestrator.start().context("boot sequence")?;
    pump(&serializer);
    let controller = DfuController::new(&serializer, &orchestrator, &timer, DfuConfig::default());
    controller.start().context("session setup")?;

    controller.handle_start(packed.sizes).context("start request")?;
    pump(&serializer);

    let pb = ProgressBar::new(packed.image.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )?
            .progress_chars("#>-"),
    );

    for (i, data) in packed.image.chunks(chunk).enumerate() {
        if let Err(err) = controller.handle_data(data) {
            pb.abandon();
            bail!("data packet at offset {} rejected: {}", i * chunk, err);
        }
        pump(&serializer);
        pb.inc(data.len() as u64);
    }
    pb.finish_with_message("Transfer complete");

    controller.validate(seed).context("image validation")?;
    println!("Image verified.");

    if let Some(ops) = cut_after {
        serializer.with_driver(|flash| flash.cut_power_after(ops));
    }
    controller.activate().context("activation")?;
    pump(&serializer);

    let powered = serializer.with_driver(|flash| flash.is_powered());
    let memory = serializer.with_driver(|flash| Box::new(flash.snapshot()));
    Ok((memory, powered))
}

/// Boot a device holding `memory` and let it finish any interrupted work.
pub fn reboot(memory: Box<[u8; FLASH_SIZE]>) -> Result<BootReport> {
    let serializer = Serializer::new(HostFlash::from_memory(*memory, LAYOUT.page_size), LAYOUT);
    let reset = ResetLatch::new();
    serializer.init().context("storage recovery")?;
    pump(&serializer);
    let orchestrator = Orchestrator::new(&serializer, &reset);
    orchestrator.start().context("boot sequence")?;
    pump(&serializer);

    Ok(BootReport {
        settings: orchestrator.settings(),
        target: orchestrator.boot_target(),
        resets_requested: reset.count(),
    })
}

/// Run `f` on a thread with room for the simulated flash.
fn on_simulator_stack<T: Send>(f: impl FnOnce() -> Result<T> + Send) -> Result<T> {
    std::thread::scope(|scope| {
        let handle = std::thread::Builder::new()
            .name("simulator".into())
            .stack_size(SIMULATOR_STACK)
            .spawn_scoped(scope, f)?;
        match handle.join() {
            Ok(result) => result,
            Err(_) => bail!("simulator thread panicked"),
        }
    })
}

/// Run a whole update session followed by a reboot on simulated flash.
pub fn simulate(images: &ImageArgs, chunk: usize, cut_after: Option<u32>) -> Result<()> {
    let packed = load(images)?;
    println!(
        "Session: {} bytes (SoftDevice {}, bootloader {}, application {}), CRC32: 0x{:08x}",
        packed.image.len(),
        packed.sizes.softdevice,
        packed.sizes.bootloader,
        packed.sizes.application,
        packed.crc32
    );

    let report = on_simulator_stack(|| {
        let (memory, powered) = update(&packed, images.seed, chunk, cut_after)?;
        if powered {
            println!("Activation complete.");
        } else {
            println!("Power lost during activation.");
        }
        reboot(memory)
    })?;

    println!();
    println!("After reboot:");
    println!("{}", serde_json::to_string_pretty(&report.settings)?);
    match report.target {
        BootTarget::Application(address) => println!("Boot target: application at 0x{address:08x}"),
        BootTarget::StayInBootloader => println!("Boot target: bootloader"),
    }
    if report.resets_requested > 0 {
        println!("Boot sequence requested another reset.");
    }
    Ok(())
}
