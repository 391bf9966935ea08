// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Dual-bank firmware update engine.
//!
//! This crate supports both `no_std` (embedded) and `std` (host) environments:
//! - Default: `no_std` mode for embedded targets
//! - `std` feature: Enables `std` support for host tools
//! - `defmt` feature: Enables structured logging through `defmt`
//!
//! Layering, leaves first: [`crc16`] → [`serializer`] → [`controller`] →
//! [`orchestrator`]. All non-volatile writes go through one [`Serializer`],
//! which keeps at most one hardware flash operation in flight.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
mod fmt;

pub mod controller;
pub mod crc16;
pub mod error;
pub mod flash;
pub mod layout;
pub mod orchestrator;
pub mod packet;
pub mod platform;
pub mod serializer;
pub mod settings;
pub mod sim;

// Re-export commonly used types
pub use controller::{DataStatus, DfuConfig, DfuController, DfuState, SessionSnapshot};
pub use crc16::{crc16, crc16_trailer};
pub use error::{DfuError, FlashError, FlashFault};
pub use flash::FlashDriver;
pub use layout::{Bank, FlashLayout};
pub use orchestrator::{AbortReason, BootTarget, Orchestrator, UpdatePhase};
pub use packet::{ImageKind, ImageSizes};
pub use platform::{ResetControl, SessionTimer};
pub use serializer::{BlockHandle, Completion, FlashListener, Opcode, RegisterParams, Serializer};
pub use settings::{BootloaderSettings, ImageSlot};
