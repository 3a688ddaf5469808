// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-chip BCT layouts.

use crate::DataType;
use consts::{AES_BLOCK_LEN, CHIP_ID_AP20, CHIP_ID_T30, MAX_BOOTLOADERS, MAX_HASHED_PARTITIONS};
use core::ops::Range;

/// Byte layout of one chip generation's BCT.
///
/// Computed fields ([`DataType::BctSize`], [`DataType::HashDataOffset`],
/// [`DataType::HashDataLength`]) and [`DataType::FullContents`] are handled
/// by [`crate::Bct`] and are not part of a layout.
pub trait ChipLayout: Sync {
    fn chip_id(&self) -> u32;

    /// Total image size in bytes.
    fn bct_size(&self) -> usize;

    /// Value of [`DataType::Version`] in a blank BCT.
    fn version(&self) -> u32;

    /// Location of a stored field, `None` if this generation has no such
    /// field.
    fn field(&self, ty: DataType) -> Option<Field>;
}

/// Location of a stored field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub offset: usize,
    pub size: usize,
    pub instances: usize,
    /// Distance between two instances
    pub stride: usize,
}

impl Field {
    const fn one(offset: usize, size: usize) -> Self {
        Self::array(offset, size, 1)
    }

    const fn array(offset: usize, size: usize, instances: usize) -> Self {
        Self {
            offset,
            size,
            instances,
            stride: size,
        }
    }

    /// Member of an array of records.
    const fn member(base: usize, member: usize, size: usize, instances: usize, stride: usize) -> Self {
        Self {
            offset: base + member,
            size,
            instances,
            stride,
        }
    }

    pub fn range(&self, instance: usize) -> Range<usize> {
        let start = self.offset + instance * self.stride;
        start..start + self.size
    }
}

// Bootloader record: version, start block, start page, length, load
// address, entry point, attribute, hash.
const BL_RECORD: usize = 28 + AES_BLOCK_LEN;

const fn bootloader(base: usize, member: usize, size: usize) -> Field {
    Field::member(base, member, size, MAX_BOOTLOADERS, BL_RECORD)
}

fn bootloader_field(base: usize, ty: DataType) -> Option<Field> {
    Some(match ty {
        DataType::BootLoaderVersion => bootloader(base, 0, 4),
        DataType::BootLoaderStartBlock => bootloader(base, 4, 4),
        DataType::BootLoaderStartSector => bootloader(base, 8, 4),
        DataType::BootLoaderLength => bootloader(base, 12, 4),
        DataType::BootLoaderLoadAddress => bootloader(base, 16, 4),
        DataType::BootLoaderEntryPoint => bootloader(base, 20, 4),
        DataType::BootLoaderAttribute => bootloader(base, 24, 4),
        DataType::BootLoaderCryptoHash => bootloader(base, 28, AES_BLOCK_LEN),
        _ => return None,
    })
}

/// Tegra 2.
pub struct Ap20;

impl Ap20 {
    const SIZE: usize = 4080;
    const BOOTLOADERS: usize = 0xa54;
}

impl ChipLayout for Ap20 {
    fn chip_id(&self) -> u32 {
        CHIP_ID_AP20
    }

    fn bct_size(&self) -> usize {
        Self::SIZE
    }

    fn version(&self) -> u32 {
        0x0002_0001
    }

    fn field(&self, ty: DataType) -> Option<Field> {
        if let Some(field) = bootloader_field(Self::BOOTLOADERS, ty) {
            return Some(field);
        }
        Some(match ty {
            DataType::CryptoHash => Field::one(0x000, AES_BLOCK_LEN),
            DataType::CryptoSalt => Field::one(0x010, AES_BLOCK_LEN),
            DataType::Version => Field::one(0x020, 4),
            DataType::BootDeviceBlockSizeLog2 => Field::one(0x024, 4),
            DataType::BootDevicePageSizeLog2 => Field::one(0x028, 4),
            DataType::PartitionSize => Field::one(0x02c, 4),
            DataType::NumValidBootDeviceConfigs => Field::one(0x030, 4),
            DataType::DevType => Field::array(0x034, 4, 4),
            DataType::BootDeviceConfigInfo => Field::array(0x044, 64, 4),
            DataType::NumValidSdramConfigs => Field::one(0x144, 4),
            DataType::SdramConfigInfo => Field::array(0x148, 448, 4),
            DataType::BadBlockTable => Field::one(0x848, 520),
            DataType::NumEnabledBootLoaders => Field::one(0xa50, 4),
            DataType::EnableFailback => Field::one(0xb04, 1),
            DataType::AuxDataAligned => Field::one(0xb08, 16),
            DataType::CustomerDataVersion => Field::one(0xb18, 4),
            DataType::DevParamsType => Field::one(0xb1c, 4),
            DataType::NumValidDevType => Field::one(0xb20, 4),
            DataType::AuxData => Field::one(0xb24, 0xfe8 - 0xb24),
            DataType::OdmOption => Field::one(0xfe8, 4),
            DataType::BctPartitionId => Field::one(0xfec, 1),
            DataType::Reserved => Field::one(0xfed, 3),
            // No hashed partition records on this generation.
            DataType::HashedPartitionPartId => Field::array(0, 4, 0),
            DataType::HashedPartitionCryptoHash => Field::array(0, AES_BLOCK_LEN, 0),
            _ => return None,
        })
    }
}

/// Tegra 3.
pub struct T30;

impl T30 {
    const SIZE: usize = 6128;
    const BOOTLOADERS: usize = 0x1104;
    const HASHED_PARTITIONS: usize = 0x11b8;
    const HASHED_PARTITION_RECORD: usize = 4 + AES_BLOCK_LEN;
}

impl ChipLayout for T30 {
    fn chip_id(&self) -> u32 {
        CHIP_ID_T30
    }

    fn bct_size(&self) -> usize {
        Self::SIZE
    }

    fn version(&self) -> u32 {
        0x0003_0001
    }

    fn field(&self, ty: DataType) -> Option<Field> {
        if let Some(field) = bootloader_field(Self::BOOTLOADERS, ty) {
            return Some(field);
        }
        Some(match ty {
            DataType::CryptoHash => Field::one(0x000, AES_BLOCK_LEN),
            DataType::CryptoSalt => Field::one(0x010, AES_BLOCK_LEN),
            DataType::Version => Field::one(0x020, 4),
            DataType::BootDeviceBlockSizeLog2 => Field::one(0x024, 4),
            DataType::BootDevicePageSizeLog2 => Field::one(0x028, 4),
            DataType::PartitionSize => Field::one(0x02c, 4),
            DataType::NumValidBootDeviceConfigs => Field::one(0x030, 4),
            DataType::DevType => Field::array(0x034, 4, 4),
            DataType::BootDeviceConfigInfo => Field::array(0x044, 64, 4),
            DataType::NumValidSdramConfigs => Field::one(0x144, 4),
            DataType::SdramConfigInfo => Field::array(0x148, 876, 4),
            DataType::BadBlockTable => Field::one(0xef8, 520),
            DataType::NumEnabledBootLoaders => Field::one(0x1100, 4),
            DataType::EnableFailback => Field::one(0x11b4, 1),
            DataType::HashedPartitionPartId => Field::member(
                Self::HASHED_PARTITIONS,
                0,
                4,
                MAX_HASHED_PARTITIONS,
                Self::HASHED_PARTITION_RECORD,
            ),
            DataType::HashedPartitionCryptoHash => Field::member(
                Self::HASHED_PARTITIONS,
                4,
                AES_BLOCK_LEN,
                MAX_HASHED_PARTITIONS,
                Self::HASHED_PARTITION_RECORD,
            ),
            DataType::InternalInfoVersion => Field::one(0x1208, 4),
            DataType::InternalInfoOneTimeRaw => Field::one(0x120c, 16),
            DataType::AuxDataAligned => Field::one(0x1220, 16),
            DataType::CustomerDataVersion => Field::one(0x1230, 4),
            DataType::DevParamsType => Field::one(0x1234, 4),
            DataType::NumValidDevType => Field::one(0x1238, 4),
            DataType::AuxData => Field::one(0x123c, 0x17e8 - 0x123c),
            DataType::OdmOption => Field::one(0x17e8, 4),
            DataType::BctPartitionId => Field::one(0x17ec, 1),
            DataType::Reserved => Field::one(0x17ed, 3),
            _ => return None,
        })
    }
}
