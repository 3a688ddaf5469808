// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device side of the nv3p flashing protocol.
//!
//! [`Server`] runs one flashing session over a [`transport::Transport`],
//! partitioning and writing a [`storage::Storage`] and maintaining the
//! device BCT. Chip services (fuses, RTC, diagnostics) come from a
//! [`platform::Platform`].

mod bct;
mod bootloader;
pub mod config;
pub mod crypto;
mod download;
pub mod mem;
mod odm;
mod partition;
pub mod platform;
mod server;
pub mod sparse;
pub mod storage;
pub mod transport;
mod verify;

#[cfg(test)]
mod tests;

pub use server::{Phase, Server, ServerState, TableState};
pub use verify::{PartitionToVerify, Verification};

use transport::TransportError;

/// Errors ending a session.
#[derive(Debug)]
pub enum Error {
    /// The link to the host failed
    Transport(TransportError),
    /// The device BCT could not be opened
    Bct(nvbct::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Bct(e) => write!(f, "BCT: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<nvbct::Error> for Error {
    fn from(e: nvbct::Error) -> Self {
        Self::Bct(e)
    }
}
