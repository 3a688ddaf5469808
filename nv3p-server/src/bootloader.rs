// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bootloader and hashed partition records of the BCT.
//!
//! A bootloader slot belongs to the partition whose id is stored in its
//! attribute, a zero attribute marks a free slot. Bootable slots are kept at
//! the front, `NumEnabledBootLoaders` counts them.

use crate::crypto::Hash;
use nvbct::{Bct, DataType};

const RECORD_FIELDS: [DataType; 8] = [
    DataType::BootLoaderVersion,
    DataType::BootLoaderStartBlock,
    DataType::BootLoaderStartSector,
    DataType::BootLoaderLength,
    DataType::BootLoaderLoadAddress,
    DataType::BootLoaderEntryPoint,
    DataType::BootLoaderAttribute,
    DataType::BootLoaderCryptoHash,
];

/// Bad block bitmap covers this many blocks.
const BBT_MAX_BLOCKS: u32 = 4096;
const BBT_HEADER_LEN: usize = 8;

/// Where and how the boot ROM loads one bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderRecord {
    pub version: u32,
    pub start_block: u32,
    pub start_page: u32,
    pub length: u32,
    pub load_address: u32,
    pub entry_point: u32,
    /// Left untouched when `None`
    pub hash: Option<Hash>,
}

fn slots(bct: &Bct) -> Result<usize, BootloaderError> {
    Ok(bct.data_size(DataType::BootLoaderAttribute)?.instances)
}

fn slot_of(bct: &Bct, partition_id: u32) -> Result<Option<usize>, BootloaderError> {
    for slot in 0..slots(bct)? {
        if bct.get_u32(DataType::BootLoaderAttribute, slot)? == partition_id {
            return Ok(Some(slot));
        }
    }
    Ok(None)
}

/// Reserve a bootloader slot for a partition. Adding twice is harmless.
pub fn add_bootloader(bct: &mut Bct, partition_id: u32) -> Result<(), BootloaderError> {
    if slot_of(bct, partition_id)?.is_some() {
        return Ok(());
    }
    let free = slot_of(bct, 0)?.ok_or(BootloaderError::NoFreeSlot)?;
    bct.set_u32(DataType::BootLoaderAttribute, free, partition_id)?;
    Ok(())
}

pub fn update_bootloader(
    bct: &mut Bct,
    partition_id: u32,
    record: &BootloaderRecord,
) -> Result<(), BootloaderError> {
    let slot = slot_of(bct, partition_id)?.ok_or(BootloaderError::NotFound(partition_id))?;
    bct.set_u32(DataType::BootLoaderVersion, slot, record.version)?;
    bct.set_u32(DataType::BootLoaderStartBlock, slot, record.start_block)?;
    bct.set_u32(DataType::BootLoaderStartSector, slot, record.start_page)?;
    bct.set_u32(DataType::BootLoaderLength, slot, record.length)?;
    bct.set_u32(DataType::BootLoaderLoadAddress, slot, record.load_address)?;
    bct.set_u32(DataType::BootLoaderEntryPoint, slot, record.entry_point)?;
    if let Some(hash) = record.hash {
        bct.set_bytes(DataType::BootLoaderCryptoHash, slot, &hash)?;
    }
    Ok(())
}

/// Make a bootloader bootable by moving its record behind the last bootable
/// one.
pub fn set_bootable(bct: &mut Bct, partition_id: u32) -> Result<(), BootloaderError> {
    let slot = slot_of(bct, partition_id)?.ok_or(BootloaderError::NotFound(partition_id))?;
    let enabled = bct.get_u32(DataType::NumEnabledBootLoaders, 0)? as usize;
    if slot < enabled {
        return Ok(());
    }
    if slot != enabled {
        for ty in RECORD_FIELDS {
            let a = bct.get_bytes(ty, slot)?;
            let b = bct.get_bytes(ty, enabled)?;
            bct.set_bytes(ty, slot, &b)?;
            bct.set_bytes(ty, enabled, &a)?;
        }
    }
    bct.set_u32(DataType::NumEnabledBootLoaders, 0, enabled as u32 + 1)?;
    Ok(())
}

/// Copy the hash of the bootloader in slot `bl_index` of the live BCT out of
/// a separately signed BCT, matching slots by load address.
pub fn transplant_hash(live: &mut Bct, signed: &Bct, bl_index: u32) -> Result<(), BootloaderError> {
    let slot = slot_of(live, bl_index)?.ok_or(BootloaderError::NotFound(bl_index))?;
    let load_address = live.get_u32(DataType::BootLoaderLoadAddress, slot)?;
    for source in 0..slots(signed)? {
        if signed.get_u32(DataType::BootLoaderLoadAddress, source)? == load_address {
            let hash = signed.get_bytes(DataType::BootLoaderCryptoHash, source)?;
            live.set_bytes(DataType::BootLoaderCryptoHash, slot, &hash)?;
            return Ok(());
        }
    }
    Err(BootloaderError::NoMatchingLoadAddress(load_address))
}

fn hash_slots(bct: &Bct) -> Result<usize, BootloaderError> {
    Ok(bct.data_size(DataType::HashedPartitionPartId)?.instances)
}

fn hash_slot_of(bct: &Bct, partition_id: u32) -> Result<Option<usize>, BootloaderError> {
    for slot in 0..hash_slots(bct)? {
        if bct.get_u32(DataType::HashedPartitionPartId, slot)? == partition_id {
            return Ok(Some(slot));
        }
    }
    Ok(None)
}

/// Reserve a hashed partition record for a stage 2 bootloader.
pub fn add_hashed_partition(bct: &mut Bct, partition_id: u32) -> Result<(), BootloaderError> {
    if hash_slot_of(bct, partition_id)?.is_some() {
        return Ok(());
    }
    let free = hash_slot_of(bct, 0)?.ok_or(BootloaderError::NoFreeHashSlot)?;
    bct.set_u32(DataType::HashedPartitionPartId, free, partition_id)?;
    Ok(())
}

pub fn update_hashed_partition(
    bct: &mut Bct,
    partition_id: u32,
    hash: &Hash,
) -> Result<(), BootloaderError> {
    let slot = hash_slot_of(bct, partition_id)?.ok_or(BootloaderError::NotFound(partition_id))?;
    bct.set_bytes(DataType::HashedPartitionCryptoHash, slot, hash)?;
    Ok(())
}

/// Fill the bad block table from a device's bad block list.
pub fn build_bad_block_table(
    bct: &mut Bct,
    total_blocks: u32,
    bad_blocks: &[u32],
) -> Result<(), BootloaderError> {
    let mut table = vec![0; bct.data_size(DataType::BadBlockTable)?.size];
    if table.len() < BBT_HEADER_LEN {
        return Err(BootloaderError::BadBlockTableTooSmall(table.len()));
    }
    let capacity = ((table.len() - BBT_HEADER_LEN) * 8) as u32;
    let entries = total_blocks.min(BBT_MAX_BLOCKS).min(capacity);
    let block_size_log2 = bct.get_u32(DataType::BootDeviceBlockSizeLog2, 0)? as u8;

    table[0..4].copy_from_slice(&entries.to_le_bytes());
    table[4] = block_size_log2;
    table[5] = block_size_log2;
    let bitmap = &mut table[BBT_HEADER_LEN..];
    for &block in bad_blocks.iter().filter(|&&b| b < entries) {
        bitmap[(block / 8) as usize] |= 1 << (block % 8);
    }
    bct.set_bytes(DataType::BadBlockTable, 0, &table)?;
    Ok(())
}

/// Store private data in the one-time internal info field.
pub fn apply_private_data(bct: &mut Bct, data: &[u8]) -> Result<(), BootloaderError> {
    let size = bct.data_size(DataType::InternalInfoOneTimeRaw)?.size;
    if data.len() > size {
        return Err(BootloaderError::PrivateDataTooLarge {
            len: data.len(),
            max: size,
        });
    }
    let mut field = vec![0; size];
    field[..data.len()].copy_from_slice(data);
    bct.set_bytes(DataType::InternalInfoOneTimeRaw, 0, &field)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderError {
    Bct(nvbct::Error),
    NoFreeSlot,
    NoFreeHashSlot,
    NotFound(u32),
    NoMatchingLoadAddress(u32),
    BadBlockTableTooSmall(usize),
    PrivateDataTooLarge { len: usize, max: usize },
}

impl std::fmt::Display for BootloaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bct(e) => write!(f, "{e}"),
            Self::NoFreeSlot => write!(f, "all bootloader slots in use"),
            Self::NoFreeHashSlot => write!(f, "all hashed partition slots in use"),
            Self::NotFound(id) => write!(f, "no record for partition {id}"),
            Self::NoMatchingLoadAddress(addr) => {
                write!(f, "no signed bootloader loads at {addr:#010x}")
            }
            Self::BadBlockTableTooSmall(len) => write!(f, "bad block table of {len} bytes"),
            Self::PrivateDataTooLarge { len, max } => {
                write!(f, "{len} bytes of private data, at most {max} fit")
            }
        }
    }
}

impl std::error::Error for BootloaderError {}

impl From<nvbct::Error> for BootloaderError {
    fn from(e: nvbct::Error) -> Self {
        Self::Bct(e)
    }
}
