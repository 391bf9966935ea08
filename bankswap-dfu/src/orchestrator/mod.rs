// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Update orchestrator.
//!
//! Owns the persisted [`BootloaderSettings`] and the crash marker, finishes
//! interrupted work at boot, activates verified images and decides whether
//! the application may be started.
//!
//! Work is planned as a list of [`Action`]s and executed one serializer
//! request at a time from completion callbacks. A settings commit is three
//! requests: marker pending, record, marker clear.

pub mod copy;
pub mod plan;

pub use copy::{BlockCopy, CopyPlan, CopyUnit};
pub use plan::{Action, Plan, PLAN_DEPTH};

use core::cell::{Cell, RefCell};

use heapless::Deque;
use serde::{Deserialize, Serialize};

use crate::error::{DfuError, FlashError};
use crate::flash::{ranges_equal, FlashDriver};
use crate::layout::{Bank, FlashLayout, ERASED_WORD};
use crate::packet::{ImageKind, ImageSizes};
use crate::platform::ResetControl;
use crate::serializer::{
    BlockHandle, Completion, FlashListener, RegisterParams, Serializer, MAX_PAYLOAD_BYTES,
};
use crate::settings::{BootloaderSettings, MARKER_CLEAR, MARKER_PENDING, SETTINGS_SIZE};

/// Cross-reset progress of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpdatePhase {
    NoUpdate,
    /// Crash marker set, record not yet confirmed.
    SettingsPending,
    SettingsCommitted,
    /// Moving an image between regions.
    PendingBlockCopy,
    Done,
}

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AbortReason {
    Reset,
    Timeout,
    Hardware,
}

/// Boot decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootTarget {
    /// Jump to the application at this address.
    Application(u32),
    StayInBootloader,
}

#[derive(Debug, Clone, Copy)]
struct Handles {
    settings: BlockHandle,
    marker: BlockHandle,
    /// SoftDevice start to bootloader end, one block per page.
    code: BlockHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitStep {
    MarkPending,
    WriteRecord,
    ClearMarker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyStep {
    Erase,
    Program { offset: u32 },
}

/// The action whose request is in flight.
#[derive(Debug, Clone, Copy)]
enum Running {
    Commit {
        settings: BootloaderSettings,
        step: CommitStep,
    },
    Copy {
        plan: CopyPlan,
        position: u32,
        step: CopyStep,
    },
}

pub struct Orchestrator<'a, D: FlashDriver> {
    serializer: &'a Serializer<'a, D>,
    reset: &'a dyn ResetControl,
    layout: FlashLayout,
    handles: Cell<Option<Handles>>,
    settings: Cell<BootloaderSettings>,
    phase: Cell<UpdatePhase>,
    plan: RefCell<Deque<Action, PLAN_DEPTH>>,
    running: Cell<Option<Running>>,
    /// Boot planning waits for the serializer's swap area recovery.
    boot_deferred: Cell<bool>,
}

impl<'a, D: FlashDriver> Orchestrator<'a, D> {
    pub fn new(serializer: &'a Serializer<'a, D>, reset: &'a dyn ResetControl) -> Self {
        Self {
            serializer,
            reset,
            layout: *serializer.layout(),
            handles: Cell::new(None),
            settings: Cell::new(BootloaderSettings::default()),
            phase: Cell::new(UpdatePhase::NoUpdate),
            plan: RefCell::new(Deque::new()),
            running: Cell::new(None),
            boot_deferred: Cell::new(false),
        }
    }

    /// Register the settings, marker and code regions, then plan and start
    /// whatever the last reset interrupted.
    ///
    /// When the serializer is still rolling back an interrupted rewrite, the
    /// settings page may be half written. Planning then waits for
    /// [`FlashListener::on_flash_ready`].
    pub fn start(&'a self) -> Result<(), DfuError> {
        if self.handles.get().is_none() {
            self.handles.set(Some(self.register()?));
        }

        if self.serializer.is_recovering() {
            info!("boot deferred until swap area recovery completes");
            self.boot_deferred.set(true);
            return Ok(());
        }
        self.boot()
    }

    fn boot(&self) -> Result<(), DfuError> {
        let record = self.read_record();
        let marker_pending = self.marker_pending();
        self.settings.set(record);

        let plan = plan::boot_plan(&record, marker_pending, &self.layout);
        if marker_pending {
            self.phase.set(UpdatePhase::SettingsPending);
        }
        info!(
            "boot: marker pending {}, {=usize} actions planned",
            marker_pending,
            plan.len()
        );
        self.schedule(&plan)
    }

    fn register(&'a self) -> Result<Handles, DfuError> {
        let page = self.layout.page_size;
        let raw_page = |start| RegisterParams::Raw {
            start,
            size: page,
            block_size: page,
        };
        let settings = self.serializer.register(raw_page(self.layout.settings_page), self)?;
        let marker = self.serializer.register(raw_page(self.layout.marker_page), self)?;
        let code_size = self
            .layout
            .bootloader_end()
            .checked_sub(self.layout.softdevice_start)
            .ok_or(DfuError::Parameter)?;
        let code = self.serializer.register(
            RegisterParams::Raw {
                start: self.layout.softdevice_start,
                size: code_size,
                block_size: page,
            },
            self,
        )?;
        Ok(Handles {
            settings,
            marker,
            code,
        })
    }

    fn read_record(&self) -> BootloaderSettings {
        let mut bytes = [0u8; SETTINGS_SIZE as usize];
        self.serializer.read(self.layout.settings_page, &mut bytes);
        BootloaderSettings::from_bytes(&bytes)
    }

    fn marker_pending(&self) -> bool {
        self.serializer.read_word(self.layout.marker_page) == MARKER_PENDING
    }

    /// Settings as last committed by this orchestrator.
    pub fn settings(&self) -> BootloaderSettings {
        self.settings.get()
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase.get()
    }

    /// Boot planning is waiting on swap area recovery. The committed
    /// settings are not known yet.
    pub fn is_booting(&self) -> bool {
        self.boot_deferred.get()
    }

    pub fn is_busy(&self) -> bool {
        self.boot_deferred.get() || self.running.get().is_some() || !self.plan.borrow().is_empty()
    }

    /// Bank a new image of `kind` is received into: the one not holding the
    /// current image of that type.
    pub fn target_bank(&self, kind: ImageKind) -> Bank {
        let settings = self.settings.get();
        let slot = match kind {
            ImageKind::Application => settings.application,
            ImageKind::SoftDevice | ImageKind::SoftDeviceAndBootloader => settings.softdevice,
            ImageKind::Bootloader => settings.bootloader,
        };
        slot.bank().map_or(Bank::Bank1, Bank::other)
    }

    /// Persist the location of freshly received images.
    pub fn record_new_images(&self, sizes: ImageSizes, bank: Bank) -> Result<(), DfuError> {
        let record = self.settings.get().with_new_images(sizes, bank, &self.layout);
        self.schedule_exclusive(&[Action::Commit(record)])
    }

    /// Activate a verified session.
    pub fn activate(&self, kind: ImageKind, sizes: ImageSizes, bank: Bank) -> Result<(), DfuError> {
        match kind {
            ImageKind::Application => self.activate_application(sizes.application, bank),
            _ => self.activate_softdevice_and_or_bootloader(sizes, bank),
        }
    }

    /// Move the application into bank 0 if needed, mark it valid and reset.
    pub fn activate_application(&self, size: u32, bank: Bank) -> Result<(), DfuError> {
        info!("activating application of {=u32} bytes from {}", size, bank);
        let plan = plan::application_plan(&self.settings.get(), size, bank, &self.layout);
        self.schedule_exclusive(&plan)
    }

    /// Record SoftDevice/bootloader images for relocation at the next boot
    /// and reset.
    pub fn activate_softdevice_and_or_bootloader(
        &self,
        sizes: ImageSizes,
        bank: Bank,
    ) -> Result<(), DfuError> {
        info!(
            "deferring relocation of softdevice {=u32} / bootloader {=u32} bytes",
            sizes.softdevice, sizes.bootloader
        );
        let plan = plan::system_plan(&self.settings.get(), sizes, bank, &self.layout);
        self.schedule_exclusive(&plan)
    }

    /// Session teardown bookkeeping, followed by a reset.
    pub fn on_session_aborted(&self, reason: AbortReason, touched: Option<Bank>) {
        warn!("session aborted ({}), bank touched: {}", reason, touched);
        if self.is_busy() {
            // Let the running plan finish before resetting.
            if self.plan.borrow_mut().push_back(Action::Reset).is_err() {
                error!("plan full, resetting now");
                self.fail();
            }
            return;
        }
        let plan = plan::abort_plan(&self.settings.get(), touched);
        if self.schedule(&plan).is_err() {
            self.fail();
        }
    }

    /// Whether the application at `address` may be started. Reads flash.
    pub fn is_application_valid(&self, address: u32) -> bool {
        if self.serializer.is_recovering() || self.marker_pending() {
            return false;
        }
        if self.serializer.read_word(address) == ERASED_WORD {
            return false;
        }
        self.read_record().app_marked_valid()
    }

    pub fn boot_target(&self) -> BootTarget {
        let address = self.layout.bank0_start;
        if !self.is_busy() && self.is_application_valid(address) {
            BootTarget::Application(address)
        } else {
            BootTarget::StayInBootloader
        }
    }

    fn schedule_exclusive(&self, actions: &[Action]) -> Result<(), DfuError> {
        if self.is_busy() {
            return Err(DfuError::Busy);
        }
        self.schedule(actions)
    }

    fn schedule(&self, actions: &[Action]) -> Result<(), DfuError> {
        {
            let mut plan = self.plan.borrow_mut();
            if plan.capacity() - plan.len() < actions.len() {
                return Err(DfuError::Busy);
            }
            for &action in actions {
                plan.push_back(action).map_err(|_| DfuError::Busy)?;
            }
        }
        if self.running.get().is_none() {
            self.run();
        }
        Ok(())
    }

    /// Start actions from the plan until one has a request in flight.
    fn run(&self) {
        loop {
            let Some(action) = self.plan.borrow_mut().pop_front() else {
                if self.phase.get() != UpdatePhase::NoUpdate {
                    self.phase.set(UpdatePhase::Done);
                }
                return;
            };

            let first = match action {
                Action::Reset => {
                    info!("requesting reset");
                    self.plan.borrow_mut().clear();
                    if self.phase.get() != UpdatePhase::NoUpdate {
                        self.phase.set(UpdatePhase::Done);
                    }
                    self.reset.request_reset();
                    return;
                }
                Action::Commit(settings) => {
                    self.phase.set(UpdatePhase::SettingsPending);
                    Some(Running::Commit {
                        settings,
                        step: CommitStep::MarkPending,
                    })
                }
                Action::Copy(copy) => match copy.plan(self.layout.page_size) {
                    Ok(plan) => {
                        self.phase.set(UpdatePhase::PendingBlockCopy);
                        self.next_unit(plan, 0)
                    }
                    Err(err) => {
                        error!("cannot plan copy {}: {}", copy, err);
                        self.fail();
                        return;
                    }
                },
            };

            if let Some(running) = first {
                if let Err(err) = self.issue(running) {
                    error!("cannot issue flash request: {}", err);
                    self.fail();
                }
                return;
            }
        }
    }

    /// First unit at or after `position` whose destination differs from its
    /// source.
    fn next_unit(&self, plan: CopyPlan, mut position: u32) -> Option<Running> {
        while let Some(unit) = plan.unit_at(position) {
            let equal = self
                .serializer
                .with_driver(|driver| ranges_equal(&*driver, unit.src, unit.dst, unit.len));
            if !equal {
                debug!("copying unit {=u32:#x} -> {=u32:#x}", unit.src, unit.dst);
                return Some(Running::Copy {
                    plan,
                    position,
                    step: CopyStep::Erase,
                });
            }
            position += 1;
        }
        None
    }

    fn issue(&self, running: Running) -> Result<(), FlashError> {
        let handles = self.handles.get().ok_or(FlashError::InvalidState)?;
        match running {
            Running::Commit { settings, step } => match step {
                CommitStep::MarkPending => {
                    self.serializer
                        .update(handles.marker, &MARKER_PENDING.to_le_bytes(), 0)?
                }
                CommitStep::WriteRecord => {
                    self.serializer
                        .update(handles.settings, &settings.to_bytes(), 0)?
                }
                CommitStep::ClearMarker => {
                    self.serializer
                        .update(handles.marker, &MARKER_CLEAR.to_le_bytes(), 0)?
                }
            },
            Running::Copy {
                plan,
                position,
                step,
            } => {
                let unit = plan.unit_at(position).ok_or(FlashError::InvalidParam)?;
                let page = self.layout.page_size;
                let index = unit
                    .dst
                    .checked_sub(self.layout.softdevice_start)
                    .ok_or(FlashError::InvalidParam)?
                    / page;
                let dst = self.serializer.block(handles.code, index)?;
                match step {
                    CopyStep::Erase => self.serializer.clear(dst, unit.len)?,
                    CopyStep::Program { offset } => {
                        let mut chunk = [0u8; MAX_PAYLOAD_BYTES];
                        let n = (unit.len - offset).min(MAX_PAYLOAD_BYTES as u32) as usize;
                        self.serializer.read(unit.src + offset, &mut chunk[..n]);
                        self.serializer.store(dst, &chunk[..n], offset)?;
                    }
                }
            }
        }
        self.running.set(Some(running));
        Ok(())
    }

    /// Step following a successful `running` request, or `None` when its
    /// action is finished.
    fn advance(&self, running: Running) -> Option<Running> {
        match running {
            Running::Commit { settings, step } => match step {
                CommitStep::MarkPending => Some(Running::Commit {
                    settings,
                    step: CommitStep::WriteRecord,
                }),
                CommitStep::WriteRecord => Some(Running::Commit {
                    settings,
                    step: CommitStep::ClearMarker,
                }),
                CommitStep::ClearMarker => {
                    self.settings.set(settings);
                    self.phase.set(UpdatePhase::SettingsCommitted);
                    debug!("settings committed");
                    None
                }
            },
            Running::Copy {
                plan,
                position,
                step,
            } => {
                let unit = plan.unit_at(position)?;
                let offset = match step {
                    CopyStep::Erase => 0,
                    CopyStep::Program { offset } => offset + MAX_PAYLOAD_BYTES as u32,
                };
                if offset < unit.len {
                    return Some(Running::Copy {
                        plan,
                        position,
                        step: CopyStep::Program { offset },
                    });
                }
                self.next_unit(plan, position + 1)
            }
        }
    }

    /// Abandon the plan and reset. Flash state is re-examined at boot.
    fn fail(&self) {
        self.plan.borrow_mut().clear();
        self.running.set(None);
        self.reset.request_reset();
    }
}

impl<D: FlashDriver> FlashListener for Orchestrator<'_, D> {
    fn on_flash_ready(&self) {
        if !self.boot_deferred.replace(false) {
            return;
        }
        if let Err(err) = self.boot() {
            error!("deferred boot failed: {}", err);
            self.fail();
        }
    }

    fn on_flash_complete(&self, completion: &Completion) {
        let Some(running) = self.running.take() else {
            warn!(
                "unexpected completion for {=u32:#x}",
                completion.handle.address()
            );
            return;
        };
        if let Err(err) = completion.result {
            error!("orchestrator request failed: {}", err);
            self.fail();
            return;
        }
        match self.advance(running) {
            Some(next) => {
                if let Err(err) = self.issue(next) {
                    error!("cannot issue flash request: {}", err);
                    self.fail();
                }
            }
            None => self.run(),
        }
    }
}
