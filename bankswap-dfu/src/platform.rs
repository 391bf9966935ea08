// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Platform collaborators the engine drives but does not implement.

/// One-shot inactivity timer.
///
/// When it fires the platform calls
/// [`DfuController::on_timeout`](crate::DfuController::on_timeout).
pub trait SessionTimer {
    /// Start or restart the timer.
    fn arm(&self, timeout_ms: u32);
    fn disarm(&self);
}

/// Full device reset.
pub trait ResetControl {
    /// Reset once the current event handler returns. In-memory state is not
    /// trusted across the reset.
    fn request_reset(&self);
}
