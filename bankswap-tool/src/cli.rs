// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command-line interface definitions.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::commands;

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "bankswap")]
#[command(about = "Image preparation and session simulator for the bankswap DFU engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Raw images making up one update session.
#[derive(Args, Debug)]
pub struct ImageArgs {
    /// Application binary
    #[arg(short, long, value_name = "FILE", conflicts_with_all = ["softdevice", "bootloader"])]
    pub application: Option<PathBuf>,

    /// SoftDevice binary
    #[arg(short, long, value_name = "FILE")]
    pub softdevice: Option<PathBuf>,

    /// Bootloader binary
    #[arg(short, long, value_name = "FILE")]
    pub bootloader: Option<PathBuf>,

    /// CRC16 seed the device validates with, in hex
    #[arg(long, default_value = "0xFFFF", value_parser = parse_hex_u16)]
    pub seed: u16,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Pad the images, append the CRC16 trailer and print the start packet
    Pack {
        #[command(flatten)]
        images: ImageArgs,

        /// Output file for the session payload
        #[arg(short, long, value_name = "OUTPUT")]
        output: PathBuf,
    },

    /// Decode a bootloader settings record from a flash dump
    Settings {
        /// Flash dump file
        #[arg(value_name = "DUMP")]
        dump: PathBuf,

        /// Offset of the settings record within the dump, in hex
        #[arg(long, default_value = "0", value_parser = parse_hex_u32)]
        offset: u32,
    },

    /// Run a complete update session against simulated flash
    Simulate {
        #[command(flatten)]
        images: ImageArgs,

        /// Data packet size in bytes
        #[arg(long, default_value = "1024")]
        chunk: usize,

        /// Lose power after this many flash operations of the activation
        #[arg(long, value_name = "OPS")]
        cut_after: Option<u32>,
    },
}

/// Parse a hex string (with or without 0x prefix) into a u32.
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(s, 16).map_err(|e| format!("invalid hex value: {e}"))
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let value = parse_hex_u32(s)?;
    u16::try_from(value).map_err(|_| format!("{value:#x} does not fit in 16 bits"))
}

/// Execute the parsed CLI command.
pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Pack { images, output } => commands::pack(&images, &output),
        Commands::Settings { dump, offset } => commands::settings(&dump, offset),
        Commands::Simulate {
            images,
            chunk,
            cut_after,
        } => commands::simulate(&images, chunk, cut_after),
    }
}
