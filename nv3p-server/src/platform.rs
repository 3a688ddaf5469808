// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chip services used by the server.

use crate::storage::Device;
use nv3p_protocol::{ChipId, DkStatus, OperatingMode};

/// Fuse values reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fuses {
    pub sku: u32,
    pub unique_id: u64,
    pub sbk_burned: bool,
    pub dk: DkStatus,
}

/// Load address, entry point and version found in a bootloader image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub load_address: u32,
    pub entry_point: u32,
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    Sd { test_type: u32, value: u32 },
    Se { value: u32 },
    Pwm,
    Dsi,
}

pub trait Platform {
    fn chip_id(&self) -> ChipId;

    fn fuses(&self) -> Fuses;

    fn operating_mode(&self) -> OperatingMode;

    /// Secure boot key, all zeros when not burned.
    fn secure_boot_key(&self) -> [u8; 16];

    /// Device the boot ROM reads the BCT and bootloaders from.
    fn secondary_boot_device(&self) -> Option<Device>;

    /// BCT the boot ROM booted with, if any.
    fn live_bct(&self) -> Option<Vec<u8>>;

    /// Set the RTC, in seconds since 2009-01-01.
    fn write_rtc(&mut self, seconds: u32) -> Result<(), PlatformError>;

    /// Parse the header at the start of a bootloader image.
    fn image_info(&self, image_start: &[u8]) -> Option<ImageInfo>;

    fn run_diagnostic(&mut self, diagnostic: Diagnostic) -> Result<(), PlatformError>;

    fn fuel_gauge_upgrade(
        &mut self,
        first: &[u8],
        second: Option<&[u8]>,
    ) -> Result<(), PlatformError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    Rtc,
    Diagnostic(Diagnostic),
    FuelGauge(&'static str),
}

impl std::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rtc => write!(f, "RTC write failed"),
            Self::Diagnostic(diagnostic) => write!(f, "{diagnostic:?} diagnostic failed"),
            Self::FuelGauge(reason) => write!(f, "fuel gauge upgrade failed: {reason}"),
        }
    }
}

impl std::error::Error for PlatformError {}
