// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Firmware update session controller.
//!
//! Receives Start, Init and Data packets from any transport, stores the image
//! into the inactive bank through the [`Serializer`], checks it with CRC16 and
//! hands activation over to the [`Orchestrator`].

mod state;

pub use state::{DataStatus, DfuConfig, DfuState, SessionEvent, SessionSnapshot};

use core::cell::{Cell, RefCell};

use heapless::Vec;

use crate::crc16::crc16;
use crate::error::DfuError;
use crate::flash::FlashDriver;
use crate::layout::Bank;
use crate::orchestrator::{AbortReason, Orchestrator};
use crate::packet::{ImageKind, ImageSizes, INIT_PACKET_MAX, MAX_DATA_PACKET};
use crate::platform::SessionTimer;
use crate::serializer::{BlockHandle, Completion, FlashListener, RegisterParams, Serializer};

/// `bytes_received` of a session that overran its announced size.
const POISONED: u32 = u32::MAX;

struct UpdateSession {
    state: DfuState,
    kind: Option<ImageKind>,
    sizes: ImageSizes,
    bank: Option<Bank>,
    bytes_received: u32,
    total_size: u32,
    init: Vec<u8, INIT_PACKET_MAX>,
    /// Clears and stores issued for this controller and not yet completed.
    writes_in_flight: u32,
}

impl UpdateSession {
    fn new() -> Self {
        Self {
            state: DfuState::Idle,
            kind: None,
            sizes: ImageSizes::default(),
            bank: None,
            bytes_received: 0,
            total_size: 0,
            init: Vec::new(),
            writes_in_flight: 0,
        }
    }

    fn is_poisoned(&self) -> bool {
        self.bytes_received == POISONED
    }
}

pub struct DfuController<'a, D: FlashDriver> {
    serializer: &'a Serializer<'a, D>,
    orchestrator: &'a Orchestrator<'a, D>,
    timer: &'a dyn SessionTimer,
    config: DfuConfig,
    /// Both banks, one block each.
    banks: Cell<Option<BlockHandle>>,
    session: RefCell<UpdateSession>,
}

impl<'a, D: FlashDriver> DfuController<'a, D> {
    pub fn new(
        serializer: &'a Serializer<'a, D>,
        orchestrator: &'a Orchestrator<'a, D>,
        timer: &'a dyn SessionTimer,
        config: DfuConfig,
    ) -> Self {
        Self {
            serializer,
            orchestrator,
            timer,
            config,
            banks: Cell::new(None),
            session: RefCell::new(UpdateSession::new()),
        }
    }

    /// Register the bank area with the serializer.
    pub fn start(&'a self) -> Result<(), DfuError> {
        if self.banks.get().is_some() {
            return Ok(());
        }
        let layout = self.serializer.layout();
        let banks = self.serializer.register(
            RegisterParams::Raw {
                start: layout.bank0_start,
                size: layout.bank_size * 2,
                block_size: layout.bank_size,
            },
            self,
        )?;
        self.banks.set(Some(banks));
        Ok(())
    }

    fn bank_handle(&self, bank: Bank) -> Result<BlockHandle, DfuError> {
        let banks = self.banks.get().ok_or(DfuError::State)?;
        Ok(self.serializer.block(banks, bank.index())?)
    }

    fn rearm(&self) {
        self.timer.arm(self.config.inactivity_timeout_ms);
    }

    /// Accept a Start request and clear the target bank.
    ///
    /// Re-entrant while `Ready`: the new sizes replace the old ones.
    pub fn handle_start(&self, sizes: ImageSizes) -> Result<(), DfuError> {
        if self.orchestrator.is_booting() {
            return Err(DfuError::Busy);
        }
        let mut session = self.session.borrow_mut();
        let next = session.state.on(SessionEvent::Start)?;
        let kind = sizes.validate(self.serializer.layout()).inspect_err(|err| {
            warn!("start rejected: {}", err);
        })?;
        let total = sizes.total().ok_or(DfuError::ImageTooLarge)?;

        let bank = self.orchestrator.target_bank(kind);
        let handle = self.bank_handle(bank)?;
        self.serializer.clear(handle, total)?;

        let writes_in_flight = session.writes_in_flight + 1;
        *session = UpdateSession {
            state: next,
            kind: Some(kind),
            sizes,
            bank: Some(bank),
            bytes_received: 0,
            total_size: total,
            init: Vec::new(),
            writes_in_flight,
        };
        info!(
            "session started: {} of {=u32} bytes into {}",
            kind, total, bank
        );
        self.rearm();
        Ok(())
    }

    /// Decode a 12-byte Start packet and accept it.
    pub fn handle_start_packet(&self, packet: &[u8]) -> Result<(), DfuError> {
        self.handle_start(ImageSizes::from_start_packet(packet)?)
    }

    /// Append init metadata. Nothing is written to flash.
    pub fn handle_init(&self, bytes: &[u8]) -> Result<(), DfuError> {
        let mut session = self.session.borrow_mut();
        let next = session.state.on(SessionEvent::Init)?;
        session
            .init
            .extend_from_slice(bytes)
            .map_err(|_| DfuError::Parameter)?;
        session.state = next;
        self.rearm();
        Ok(())
    }

    /// Store one data packet at the next offset of the target bank.
    ///
    /// `QueueFull` leaves the session untouched; the same packet may be sent
    /// again.
    pub fn handle_data(&self, bytes: &[u8]) -> Result<DataStatus, DfuError> {
        let mut session = self.session.borrow_mut();
        let next = session.state.on(SessionEvent::Data)?;
        if session.is_poisoned() {
            return Err(DfuError::DataSizeExceeded);
        }
        if bytes.is_empty() || bytes.len() > MAX_DATA_PACKET {
            return Err(DfuError::Parameter);
        }
        if bytes.len() % 4 != 0 {
            return Err(DfuError::Alignment);
        }

        let offset = session.bytes_received;
        let end = offset
            .checked_add(bytes.len() as u32)
            .filter(|&end| end <= session.total_size);
        let Some(end) = end else {
            warn!(
                "data overruns image: {=u32} + {=usize} > {=u32}",
                offset,
                bytes.len(),
                session.total_size
            );
            session.bytes_received = POISONED;
            session.state = next;
            return Err(DfuError::DataSizeExceeded);
        };

        let bank = session.bank.ok_or(DfuError::State)?;
        let handle = self.bank_handle(bank)?;
        self.serializer.store(handle, bytes, offset)?;

        session.writes_in_flight += 1;
        session.bytes_received = end;
        session.state = next;
        self.rearm();

        if end == session.total_size {
            debug!("image complete ({=u32} bytes)", end);
            Ok(DataStatus::Complete)
        } else {
            Ok(DataStatus::MoreExpected)
        }
    }

    /// Run CRC16 with `seed` over the stored image. The image is accepted
    /// when the running CRC folds to zero.
    pub fn validate(&self, seed: u16) -> Result<(), DfuError> {
        let mut session = self.session.borrow_mut();
        if session.state != DfuState::ReceivingData || session.bytes_received != session.total_size {
            return Err(DfuError::State);
        }
        if session.writes_in_flight > 0 {
            return Err(DfuError::Busy);
        }
        session.state = session.state.on(SessionEvent::Validate)?;

        let bank = session.bank.ok_or(DfuError::State)?;
        let base = self.serializer.layout().bank_address(bank);
        let mut crc = seed;
        let mut chunk = [0u8; 64];
        let mut offset = 0;
        while offset < session.total_size {
            let n = (session.total_size - offset).min(chunk.len() as u32) as usize;
            self.serializer.read(base + offset, &mut chunk[..n]);
            crc = crc16(crc, &chunk[..n]);
            offset += n as u32;
        }

        if crc == 0 {
            session.state = session.state.on(SessionEvent::ValidationPassed)?;
            info!("image verified");
            Ok(())
        } else {
            session.state = session.state.on(SessionEvent::ValidationFailed)?;
            warn!("image checksum mismatch: residue {=u16:#x}", crc);
            self.rearm();
            Err(DfuError::Integrity)
        }
    }

    /// Hand the verified image over to the orchestrator.
    pub fn activate(&self) -> Result<(), DfuError> {
        let mut session = self.session.borrow_mut();
        let next = session.state.on(SessionEvent::Activate)?;
        let (Some(kind), Some(bank)) = (session.kind, session.bank) else {
            return Err(DfuError::State);
        };

        self.orchestrator.activate(kind, session.sizes, bank)?;
        self.timer.disarm();

        let writes_in_flight = session.writes_in_flight;
        *session = UpdateSession::new();
        session.writes_in_flight = writes_in_flight;
        session.state = next;
        info!("session activated");
        Ok(())
    }

    /// Tear the session down from any state.
    pub fn reset(&self) {
        self.abort(SessionEvent::Reset, AbortReason::Reset);
    }

    /// The inactivity timer fired.
    pub fn on_timeout(&self) {
        self.abort(SessionEvent::Timeout, AbortReason::Timeout);
    }

    fn abort(&self, event: SessionEvent, reason: AbortReason) {
        let touched = {
            let mut session = self.session.borrow_mut();
            match session.state.on(event) {
                Ok(next) => session.state = next,
                Err(_) => {
                    debug!("{} ignored in {}", event, session.state);
                    return;
                }
            }
            session.bank
        };
        warn!("session aborted: {}", reason);
        self.timer.disarm();
        self.orchestrator.on_session_aborted(reason, touched);
    }

    pub fn state(&self) -> DfuState {
        self.session.borrow().state
    }

    pub fn session(&self) -> SessionSnapshot {
        let session = self.session.borrow();
        SessionSnapshot {
            state: session.state,
            kind: session.kind,
            sizes: session.sizes,
            bank: session.bank,
            bytes_received: session.bytes_received,
            total_size: session.total_size,
            init_len: session.init.len(),
            writes_in_flight: session.writes_in_flight,
        }
    }

    /// Init metadata accumulated so far.
    pub fn init_packet(&self) -> Vec<u8, INIT_PACKET_MAX> {
        self.session.borrow().init.clone()
    }
}

impl<D: FlashDriver> FlashListener for DfuController<'_, D> {
    fn on_flash_complete(&self, completion: &Completion) {
        let touched = {
            let mut session = self.session.borrow_mut();
            session.writes_in_flight = session.writes_in_flight.saturating_sub(1);
            let Err(err) = completion.result else {
                return;
            };
            error!(
                "bank write failed at {=u32:#x}+{=u32}: {}",
                completion.handle.address(),
                completion.offset,
                err
            );
            if session.state.is_terminal() {
                return;
            }
            session.state = DfuState::Reset;
            session.bank
        };
        self.timer.disarm();
        self.orchestrator.on_session_aborted(AbortReason::Hardware, touched);
    }
}
