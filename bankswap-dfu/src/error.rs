// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Error types shared by the serializer, controller and orchestrator.

use thiserror::Error;

/// Failure reported by the raw flash driver for one hardware operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashFault {
    #[error("flash program operation failed")]
    Program,
    #[error("flash erase operation failed")]
    Erase,
    #[error("flash address out of range or misaligned")]
    OutOfRange,
}

/// Errors returned by the [`Serializer`](crate::Serializer), either
/// synchronously on enqueue or through a completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    #[error("empty source buffer")]
    NullArgument,
    #[error("invalid handle, size or alignment")]
    InvalidParam,
    #[error("request queue is full")]
    QueueFull,
    #[error("no space left in the storage region or module table")]
    NoSpace,
    #[error("serializer used before initialization")]
    InvalidState,
    #[error("hardware fault: {0}")]
    Hardware(FlashFault),
}

/// Errors returned synchronously by the update controller and orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DfuError {
    /// Bad argument or unsupported image combination. Caller bug.
    #[error("invalid parameter")]
    Parameter,
    /// The flash queue is full. Retry the same packet later.
    #[error("flash queue full, retry")]
    QueueFull,
    /// The requested image does not fit its destination.
    #[error("image too large")]
    ImageTooLarge,
    /// A size or packet length is not a multiple of the flash word.
    #[error("size not word aligned")]
    Alignment,
    /// Operation is not valid in the current session state.
    #[error("operation invalid in current state")]
    State,
    /// A data packet would run past the announced image size.
    #[error("data exceeds announced image size")]
    DataSizeExceeded,
    /// Flash writes for this session are still in flight. Retry later.
    #[error("flash writes still pending")]
    Busy,
    /// Checksum mismatch over the received image.
    #[error("image checksum mismatch")]
    Integrity,
    /// Flash hardware failure. Fatal for the session.
    #[error("flash hardware failure")]
    Hardware,
    /// Inactivity watchdog fired. Fatal for the session.
    #[error("session timed out")]
    Timeout,
}

impl DfuError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::QueueFull | Self::Busy)
    }
}

impl From<FlashError> for DfuError {
    fn from(err: FlashError) -> Self {
        match err {
            FlashError::NullArgument | FlashError::InvalidParam => Self::Parameter,
            FlashError::QueueFull => Self::QueueFull,
            FlashError::NoSpace => Self::ImageTooLarge,
            FlashError::InvalidState => Self::State,
            FlashError::Hardware(_) => Self::Hardware,
        }
    }
}
