// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Mass storage as seen by the server: a partition table, files stored in
//! partitions, and raw sector access to the devices holding them.

use nv3p_protocol::{AllocationAttribute, CreatePartition, DeviceType, PartitionName, PartitionType};
use serde::{Deserialize, Serialize};

/// A storage device instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceType,
    pub instance: u32,
}

/// Geometry of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub bytes_per_sector: u32,
    pub sectors_per_block: u32,
    pub total_blocks: u32,
}

impl DeviceInfo {
    pub fn total_sectors(&self) -> u64 {
        u64::from(self.sectors_per_block) * u64::from(self.total_blocks)
    }
}

/// One entry of the partition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub id: u32,
    pub name: PartitionName,
    pub partition_type: PartitionType,
    pub device: Device,
    pub start_logical_sector: u32,
    pub num_logical_sectors: u32,
    pub start_physical_sector: u32,
    pub end_physical_sector: u32,
    pub bytes_per_sector: u32,
    pub allocation_attribute: AllocationAttribute,
}

impl PartitionInfo {
    /// Size of the partition in bytes.
    pub fn capacity(&self) -> u64 {
        u64::from(self.num_logical_sectors) * u64::from(self.bytes_per_sector)
    }

    /// Byte address of the partition on its device.
    pub fn address(&self) -> u64 {
        u64::from(self.start_logical_sector) * u64::from(self.bytes_per_sector)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Truncates the file
    Write,
}

/// An open file in a partition.
pub trait PartitionFile {
    fn write(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Read up to `buf.len()` bytes, returning how many were read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Current offset in the file.
    fn position(&self) -> u64;

    /// Fill `buf` completely, failing at end of file.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StorageError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => return Err(StorageError::EndOfFile),
                n => filled += n,
            }
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), StorageError>;
}

/// Partition manager, file system and block device services.
pub trait Storage {
    /// Begin building a new table of `partitions` entries.
    fn create_table_start(&mut self, partitions: u32) -> Result<(), StorageError>;

    /// Allocate one partition of the table under construction.
    fn add_table_entry(
        &mut self,
        device: Device,
        request: &CreatePartition,
    ) -> Result<PartitionInfo, StorageError>;

    /// Seal the table under construction.
    fn create_table_finish(&mut self) -> Result<(), StorageError>;

    /// Sign the current table and write it to the given partition.
    fn save_table(&mut self, pt_partition_id: u32) -> Result<(), StorageError>;

    /// Read and authenticate a table stored at the given logical sectors.
    fn load_table(
        &mut self,
        device: Device,
        start_logical_sector: u32,
        num_logical_sectors: u32,
    ) -> Result<(), StorageError>;

    fn unload_table(&mut self);

    /// Ids of the current table, in table order.
    fn partition_ids(&self) -> Vec<u32>;

    fn partition(&self, id: u32) -> Result<PartitionInfo, StorageError>;

    /// Number of bytes stored in a partition's file.
    fn file_size(&self, id: u32) -> Result<u64, StorageError>;

    /// Erase a partition's contents.
    fn format_partition(&mut self, id: u32) -> Result<(), StorageError>;

    fn open(&mut self, id: u32, mode: OpenMode)
        -> Result<Box<dyn PartitionFile + '_>, StorageError>;

    fn device_info(&self, device: Device) -> Result<DeviceInfo, StorageError>;

    fn logical_to_physical(&self, device: Device, logical_sector: u32)
        -> Result<u32, StorageError>;

    fn read_sectors(
        &mut self,
        device: Device,
        start_sector: u32,
        buf: &mut [u8],
    ) -> Result<(), StorageError>;

    fn write_sectors(
        &mut self,
        device: Device,
        start_sector: u32,
        data: &[u8],
    ) -> Result<(), StorageError>;

    /// Erase a whole device.
    fn format_device(&mut self, device: Device) -> Result<(), StorageError>;

    /// Check the region table and the partitions the boot ROM depends on.
    fn verify_critical_partitions(&mut self, device: Device) -> Result<(), StorageError>;

    /// Factory-marked bad blocks of a device.
    fn bad_blocks(&self, device: Device) -> Result<Vec<u32>, StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    NoDevice(DeviceType),
    NoTable,
    TableFull,
    TableIncomplete { remaining: u32 },
    DuplicatePartition(u32),
    PartitionNotFound(u32),
    NoSpace { requested: u64, available: u64 },
    OutOfRange { sector: u64 },
    Unaligned { len: usize, sector_size: u32 },
    BadTable(&'static str),
    EndOfFile,
    WriteProtected(u32),
    Device(&'static str),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoDevice(kind) => write!(f, "no {kind:?} device"),
            Self::NoTable => write!(f, "no partition table"),
            Self::TableFull => write!(f, "partition table full"),
            Self::TableIncomplete { remaining } => {
                write!(f, "partition table incomplete, {remaining} entries missing")
            }
            Self::DuplicatePartition(id) => write!(f, "partition {id} already exists"),
            Self::PartitionNotFound(id) => write!(f, "partition {id} not found"),
            Self::NoSpace {
                requested,
                available,
            } => write!(f, "{requested} bytes requested, {available} available"),
            Self::OutOfRange { sector } => write!(f, "sector {sector} out of range"),
            Self::Unaligned { len, sector_size } => {
                write!(f, "{len} bytes is not a multiple of the {sector_size} byte sector")
            }
            Self::BadTable(reason) => write!(f, "bad partition table: {reason}"),
            Self::EndOfFile => write!(f, "unexpected end of file"),
            Self::WriteProtected(id) => write!(f, "partition {id} is write protected"),
            Self::Device(reason) => write!(f, "device error: {reason}"),
        }
    }
}

impl std::error::Error for StorageError {}
