// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command line arguments.

use std::path::PathBuf;

#[derive(clap::Parser)]
pub struct Args {
    /// Path to config file.
    #[clap(long, short, global = true)]
    pub config: Option<PathBuf>,
    /// Chip id of the image, 0x20 (AP20) or 0x30 (T30). Defaults to 0x30.
    #[clap(long, global = true, value_parser = super::parse_u32)]
    pub chip: Option<u32>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand)]
pub enum Command {
    /// Dump the BCT contents to stdout.
    Dump {
        /// The BCT image.
        #[clap(short, long)]
        input: PathBuf,
        /// Secure boot key in hex, used to check the signature.
        #[clap(long)]
        sbk: Option<String>,
    },
    /// Print one field in hex.
    Get {
        /// The BCT image.
        #[clap(short, long)]
        input: PathBuf,
        /// Field name, e.g. "OdmOption" or "BootLoaderLoadAddress".
        #[clap(long)]
        field: String,
        /// Instance of an array field.
        #[clap(long, default_value_t = 0)]
        instance: usize,
    },
    /// Change one field.
    Set {
        /// The BCT image.
        #[clap(short, long)]
        input: PathBuf,
        /// Field name, e.g. "OdmOption" or "BootLoaderLoadAddress".
        #[clap(long)]
        field: String,
        /// Instance of an array field.
        #[clap(long, default_value_t = 0)]
        instance: usize,
        /// A number (decimal or 0x hex) for fields of up to 4 bytes, hex
        /// bytes for anything else.
        #[clap(long)]
        value: String,
        /// Update the BCT image in place.
        #[clap(long)]
        in_place: bool,
        /// Path to write the changed BCT image.
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Sign a BCT image, optionally encrypting it.
    Sign {
        /// The BCT image.
        #[clap(short, long)]
        input: PathBuf,
        /// Secure boot key in hex. Signing without encryption defaults to
        /// the zero key.
        #[clap(long)]
        sbk: Option<String>,
        /// Encrypt the signed region, as secure parts expect.
        #[clap(long)]
        encrypt: bool,
        /// Update the BCT image in place.
        #[clap(long)]
        in_place: bool,
        /// Path to write the signed BCT image.
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
}
