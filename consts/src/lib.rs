// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]

/// Size of the scratch buffer used for every streamed transfer.
/// Partition images, BCT blobs and raw sector data all move through it
/// in chunks of at most this many bytes.
pub const STAGING_SIZE: usize = 64 * 1024;

/// AES block length, which is also the length of a CMAC hash.
/// Bootloader images must be a multiple of this length.
pub const AES_BLOCK_LEN: usize = 16;

/// Maximum length of the human-readable message carried by a status report.
pub const STATUS_MESSAGE_MAX: usize = 256;

/// Maximum length of a partition name, including room for a terminator
/// on the device side.
pub const PARTITION_NAME_MAX: usize = 4;

/// Capacity of name fields on the wire. Names are validated against
/// [`PARTITION_NAME_MAX`] by the server, not by the encoding.
pub const NAME_FIELD_MAX: usize = 32;

/// Chip id reported by Tegra 2 (AP20) parts.
pub const CHIP_ID_AP20: u32 = 0x20;

/// Chip id reported by Tegra 3 (T30) parts.
pub const CHIP_ID_T30: u32 = 0x30;

/// Seconds between 1970-01-01 and 2009-01-01.
/// The RTC counts from 2009 to extend its useful life, so host timestamps
/// are rebased by this amount before they are written.
pub const SECONDS_1970_TO_2009: u64 = 1_230_768_000;

/// Number of bootloader records held by a BCT.
pub const MAX_BOOTLOADERS: usize = 4;

/// Number of hashed partition records held by a T30 BCT.
pub const MAX_HASHED_PARTITIONS: usize = 4;

/// Load address and entry point used for images without a readable header
/// that are too large for IRAM (AOS/quickboot images).
pub const AOS_ENTRY_POINT: u32 = 0x0010_8000;

/// Load address and entry point used for small images without a readable
/// header (charger images executed from IRAM).
pub const CHARGE_ENTRY_POINT: u32 = 0x4000_8000;

/// Largest image that still fits in IRAM.
pub const CHARGE_SIZE_MAX: u64 = 256 * 1024;

/// Boot ROM version reported by the platform information command.
pub const BOOT_ROM_VERSION: u32 = 1;
