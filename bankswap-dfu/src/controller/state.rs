// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

use serde::{Deserialize, Serialize};

use crate::error::DfuError;
use crate::layout::Bank;
use crate::packet::{ImageKind, ImageSizes};

/// Session state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DfuState {
    /// No session.
    Idle,
    /// Start packet accepted, bank cleared.
    Ready,
    /// Accumulating init metadata.
    ReceivingInit,
    /// Storing image data into the target bank.
    ReceivingData,
    /// Checksum running over the stored image.
    Validating,
    /// Image verified, waiting for the activate request.
    WaitingActivate,
    /// Inactivity watchdog fired. Terminal.
    Timeout,
    /// Session torn down by request or hardware failure. Terminal.
    Reset,
}

/// Input observed by the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionEvent {
    Start,
    Init,
    Data,
    Validate,
    ValidationPassed,
    ValidationFailed,
    Activate,
    Timeout,
    Reset,
}

impl DfuState {
    /// Pure transition. `Err(DfuError::State)` when `event` is not accepted
    /// in this state.
    pub fn on(self, event: SessionEvent) -> Result<DfuState, DfuError> {
        use DfuState::*;
        match (self, event) {
            (_, SessionEvent::Reset) => Ok(Reset),
            (Idle | Ready, SessionEvent::Start) => Ok(Ready),
            (Ready | ReceivingInit, SessionEvent::Init) => Ok(ReceivingInit),
            (Ready | ReceivingInit | ReceivingData, SessionEvent::Data) => Ok(ReceivingData),
            (ReceivingData, SessionEvent::Validate) => Ok(Validating),
            (Validating, SessionEvent::ValidationPassed) => Ok(WaitingActivate),
            (Validating, SessionEvent::ValidationFailed) => Ok(ReceivingData),
            (WaitingActivate, SessionEvent::Activate) => Ok(Idle),
            (state, SessionEvent::Timeout) if state.in_session() => Ok(Timeout),
            _ => Err(DfuError::State),
        }
    }

    /// Whether a session is open and the inactivity timer applies.
    pub fn in_session(self) -> bool {
        !matches!(self, Self::Idle | Self::Timeout | Self::Reset)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Timeout | Self::Reset)
    }
}

/// Outcome of an accepted data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataStatus {
    MoreExpected,
    /// The announced image size has been received.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DfuConfig {
    pub inactivity_timeout_ms: u32,
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: 120_000,
        }
    }
}

/// Read-only view of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionSnapshot {
    pub state: DfuState,
    pub kind: Option<ImageKind>,
    pub sizes: ImageSizes,
    pub bank: Option<Bank>,
    pub bytes_received: u32,
    pub total_size: u32,
    pub init_len: usize,
    pub writes_in_flight: u32,
}
