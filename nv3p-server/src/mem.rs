// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! RAM-backed storage and a simulated chip, used by the server binary and
//! the tests.
//!
//! Partitions map one to one onto device sectors, so logical and physical
//! sector numbers are the same. A stored partition table is
//! `[len: u32 LE][postcard entries][CMAC]`.

use crate::crypto::{sign, Key, Signer, ZERO_KEY};
use crate::platform::{Diagnostic, Fuses, ImageInfo, Platform, PlatformError};
use crate::storage::{Device, DeviceInfo, OpenMode, PartitionFile, PartitionInfo, Storage, StorageError};
use consts::AES_BLOCK_LEN;
use log::debug;
use nv3p_protocol::{
    AllocationAttribute, AllocationPolicy, ChipId, CreatePartition, DkStatus, OperatingMode,
    PartitionType,
};
use std::collections::BTreeMap;

const TABLE_KEY: Key = *b"nv3p-part-table!";
const TABLE_LEN_BYTES: usize = 4;

struct MemDevice {
    device: Device,
    info: DeviceInfo,
    data: Vec<u8>,
    bad_blocks: Vec<u32>,
}

impl MemDevice {
    fn byte_range(&self, start_sector: u64, len: u64) -> Result<std::ops::Range<usize>, StorageError> {
        let sector_size = u64::from(self.info.bytes_per_sector);
        let start = start_sector * sector_size;
        let end = start + len;
        if end > self.data.len() as u64 {
            return Err(StorageError::OutOfRange {
                sector: end.div_ceil(sector_size),
            });
        }
        Ok(start as usize..end as usize)
    }

    fn check_aligned(&self, len: usize) -> Result<(), StorageError> {
        let sector_size = self.info.bytes_per_sector;
        if len % sector_size as usize != 0 {
            return Err(StorageError::Unaligned { len, sector_size });
        }
        Ok(())
    }
}

/// Storage kept in memory.
#[derive(Default)]
pub struct MemStorage {
    devices: Vec<MemDevice>,
    table: Vec<PartitionInfo>,
    /// Entries still to be created, while a table is being built
    remaining: Option<u32>,
    file_sizes: BTreeMap<u32, u64>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a blank device.
    pub fn add_device(&mut self, device: Device, info: DeviceInfo, bad_blocks: Vec<u32>) {
        let len = info.total_sectors() * u64::from(info.bytes_per_sector);
        self.devices.push(MemDevice {
            device,
            info,
            data: vec![0; len as usize],
            bad_blocks,
        });
    }

    pub fn with_device(mut self, device: Device, info: DeviceInfo) -> Self {
        self.add_device(device, info, Vec::new());
        self
    }

    /// Raw contents of a device.
    pub fn device_data(&self, device: Device) -> Option<&[u8]> {
        self.find_device(device).ok().map(|d| d.data.as_slice())
    }

    /// Contents of a partition's file.
    pub fn file_contents(&self, id: u32) -> Result<Vec<u8>, StorageError> {
        let partition = self.partition(id)?;
        let size = self.file_size(id)?;
        let device = self.find_device(partition.device)?;
        let range = device.byte_range(u64::from(partition.start_logical_sector), size)?;
        Ok(device.data[range].to_vec())
    }

    fn find_device(&self, device: Device) -> Result<&MemDevice, StorageError> {
        self.devices
            .iter()
            .find(|d| d.device == device)
            .ok_or(StorageError::NoDevice(device.kind))
    }

    fn find_device_mut(&mut self, device: Device) -> Result<&mut MemDevice, StorageError> {
        self.devices
            .iter_mut()
            .find(|d| d.device == device)
            .ok_or(StorageError::NoDevice(device.kind))
    }

    fn region(&self, partition: &PartitionInfo) -> Result<std::ops::Range<usize>, StorageError> {
        self.find_device(partition.device)?
            .byte_range(u64::from(partition.start_logical_sector), partition.capacity())
    }

    /// First free sector after the partitions already on `device`.
    fn next_free_sector(&self, device: Device) -> u64 {
        self.table
            .iter()
            .filter(|p| p.device == device)
            .map(|p| u64::from(p.start_logical_sector) + u64::from(p.num_logical_sectors))
            .max()
            .unwrap_or(0)
    }
}

fn encode_table(table: &[PartitionInfo]) -> Result<Vec<u8>, StorageError> {
    let body = postcard::to_allocvec(table).map_err(|_| StorageError::BadTable("encoding failed"))?;
    let len = u32::try_from(body.len()).map_err(|_| StorageError::BadTable("table too large"))?;
    let mut image = Vec::with_capacity(TABLE_LEN_BYTES + body.len() + AES_BLOCK_LEN);
    image.extend_from_slice(&len.to_le_bytes());
    image.extend_from_slice(&body);
    let signature = sign(&TABLE_KEY, &image);
    image.extend_from_slice(&signature);
    Ok(image)
}

fn decode_table(region: &[u8]) -> Result<Vec<PartitionInfo>, StorageError> {
    let Some(len) = region.get(..TABLE_LEN_BYTES) else {
        return Err(StorageError::BadTable("truncated"));
    };
    let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
    let signed_len = TABLE_LEN_BYTES + len;
    let Some(signature) = region.get(signed_len..signed_len + AES_BLOCK_LEN) else {
        return Err(StorageError::BadTable("truncated"));
    };
    let mut expected = [0; AES_BLOCK_LEN];
    expected.copy_from_slice(signature);
    let mut signer = Signer::new(&TABLE_KEY);
    signer.update(&region[..signed_len]);
    if !signer.verify(&expected) {
        return Err(StorageError::BadTable("signature mismatch"));
    }
    postcard::from_bytes(&region[TABLE_LEN_BYTES..signed_len])
        .map_err(|_| StorageError::BadTable("malformed entries"))
}

struct MemFile<'a> {
    region: &'a mut [u8],
    size: &'a mut u64,
    position: u64,
    mode: OpenMode,
}

impl PartitionFile for MemFile<'_> {
    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        if self.mode == OpenMode::Read {
            return Err(StorageError::Device("file opened for reading"));
        }
        let start = self.position as usize;
        let end = start + data.len();
        if end > self.region.len() {
            return Err(StorageError::NoSpace {
                requested: end as u64,
                available: self.region.len() as u64,
            });
        }
        self.region[start..end].copy_from_slice(data);
        self.position = end as u64;
        *self.size = (*self.size).max(self.position);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let available = (*self.size - self.position) as usize;
        let n = buf.len().min(available);
        let start = self.position as usize;
        buf[..n].copy_from_slice(&self.region[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn close(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

impl Storage for MemStorage {
    fn create_table_start(&mut self, partitions: u32) -> Result<(), StorageError> {
        self.table.clear();
        self.remaining = Some(partitions);
        Ok(())
    }

    fn add_table_entry(
        &mut self,
        device: Device,
        request: &CreatePartition,
    ) -> Result<PartitionInfo, StorageError> {
        let remaining = match self.remaining {
            None => return Err(StorageError::NoTable),
            Some(0) => return Err(StorageError::TableFull),
            Some(remaining) => remaining,
        };
        if self.table.iter().any(|p| p.id == request.id) {
            return Err(StorageError::DuplicatePartition(request.id));
        }
        let info = self.find_device(device)?.info;
        let sector_size = u64::from(info.bytes_per_sector);
        let total = info.total_sectors();

        let start = match request.allocation_policy {
            AllocationPolicy::Absolute => request.address.div_ceil(sector_size),
            _ => self.next_free_sector(device),
        };
        let sectors = if request
            .allocation_attribute
            .contains(AllocationAttribute::ALLOCATE_REMAINING)
        {
            total.saturating_sub(start)
        } else {
            request.size.div_ceil(sector_size)
        };
        let end = start + sectors;
        let overlaps = self.table.iter().any(|p| {
            p.device == device
                && start < u64::from(p.start_logical_sector) + u64::from(p.num_logical_sectors)
                && u64::from(p.start_logical_sector) < end
        });
        if sectors == 0 || end > total || overlaps {
            return Err(StorageError::NoSpace {
                requested: sectors * sector_size,
                available: total.saturating_sub(start) * sector_size,
            });
        }

        let to_sector = |sector: u64| {
            u32::try_from(sector).map_err(|_| StorageError::OutOfRange { sector })
        };
        let start_sector = to_sector(start)?;
        let partition = PartitionInfo {
            id: request.id,
            name: request.name.clone(),
            partition_type: request.partition_type,
            device,
            start_logical_sector: start_sector,
            num_logical_sectors: to_sector(sectors)?,
            start_physical_sector: start_sector,
            end_physical_sector: to_sector(end - 1)?,
            bytes_per_sector: info.bytes_per_sector,
            allocation_attribute: request.allocation_attribute,
        };
        debug!(
            "partition {} at sectors {}..{}",
            partition.id, start, end
        );
        self.table.push(partition.clone());
        self.remaining = Some(remaining - 1);
        Ok(partition)
    }

    fn create_table_finish(&mut self) -> Result<(), StorageError> {
        match self.remaining {
            None => Err(StorageError::NoTable),
            Some(0) => {
                self.remaining = None;
                Ok(())
            }
            Some(remaining) => Err(StorageError::TableIncomplete { remaining }),
        }
    }

    fn save_table(&mut self, pt_partition_id: u32) -> Result<(), StorageError> {
        let partition = self.partition(pt_partition_id)?;
        let image = encode_table(&self.table)?;
        let range = self.region(&partition)?;
        if image.len() > range.len() {
            return Err(StorageError::NoSpace {
                requested: image.len() as u64,
                available: range.len() as u64,
            });
        }
        let data = &mut self.find_device_mut(partition.device)?.data[range];
        data[..image.len()].copy_from_slice(&image);
        self.file_sizes.insert(pt_partition_id, image.len() as u64);
        Ok(())
    }

    fn load_table(
        &mut self,
        device: Device,
        start_logical_sector: u32,
        num_logical_sectors: u32,
    ) -> Result<(), StorageError> {
        let dev = self.find_device(device)?;
        let len = u64::from(num_logical_sectors) * u64::from(dev.info.bytes_per_sector);
        let range = dev.byte_range(u64::from(start_logical_sector), len)?;
        self.table = decode_table(&dev.data[range])?;
        self.remaining = None;
        Ok(())
    }

    fn unload_table(&mut self) {
        self.table.clear();
        self.remaining = None;
    }

    fn partition_ids(&self) -> Vec<u32> {
        self.table.iter().map(|p| p.id).collect()
    }

    fn partition(&self, id: u32) -> Result<PartitionInfo, StorageError> {
        self.table
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or(StorageError::PartitionNotFound(id))
    }

    fn file_size(&self, id: u32) -> Result<u64, StorageError> {
        self.partition(id)?;
        Ok(self.file_sizes.get(&id).copied().unwrap_or(0))
    }

    fn format_partition(&mut self, id: u32) -> Result<(), StorageError> {
        let partition = self.partition(id)?;
        let range = self.region(&partition)?;
        self.find_device_mut(partition.device)?.data[range].fill(0);
        self.file_sizes.remove(&id);
        Ok(())
    }

    fn open(
        &mut self,
        id: u32,
        mode: OpenMode,
    ) -> Result<Box<dyn PartitionFile + '_>, StorageError> {
        let partition = self.partition(id)?;
        let range = self.region(&partition)?;
        let Self {
            devices,
            file_sizes,
            ..
        } = self;
        let device = devices
            .iter_mut()
            .find(|d| d.device == partition.device)
            .ok_or(StorageError::NoDevice(partition.device.kind))?;
        let size = file_sizes.entry(id).or_insert(0);
        if mode == OpenMode::Write {
            if partition
                .allocation_attribute
                .contains(AllocationAttribute::WRITE_PROTECTED)
                && *size > 0
            {
                return Err(StorageError::WriteProtected(id));
            }
            *size = 0;
        }
        Ok(Box::new(MemFile {
            region: &mut device.data[range],
            size,
            position: 0,
            mode,
        }))
    }

    fn device_info(&self, device: Device) -> Result<DeviceInfo, StorageError> {
        Ok(self.find_device(device)?.info)
    }

    fn logical_to_physical(&self, device: Device, logical_sector: u32) -> Result<u32, StorageError> {
        let info = self.find_device(device)?.info;
        if u64::from(logical_sector) >= info.total_sectors() {
            return Err(StorageError::OutOfRange {
                sector: u64::from(logical_sector),
            });
        }
        Ok(logical_sector)
    }

    fn read_sectors(
        &mut self,
        device: Device,
        start_sector: u32,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        let dev = self.find_device(device)?;
        dev.check_aligned(buf.len())?;
        let range = dev.byte_range(u64::from(start_sector), buf.len() as u64)?;
        buf.copy_from_slice(&dev.data[range]);
        Ok(())
    }

    fn write_sectors(
        &mut self,
        device: Device,
        start_sector: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let dev = self.find_device_mut(device)?;
        dev.check_aligned(data.len())?;
        let range = dev.byte_range(u64::from(start_sector), data.len() as u64)?;
        dev.data[range].copy_from_slice(data);
        Ok(())
    }

    fn format_device(&mut self, device: Device) -> Result<(), StorageError> {
        self.find_device_mut(device)?.data.fill(0);
        let on_device: Vec<u32> = self
            .table
            .iter()
            .filter(|p| p.device == device)
            .map(|p| p.id)
            .collect();
        self.file_sizes.retain(|id, _| !on_device.contains(id));
        Ok(())
    }

    /// The stored partition table must authenticate and match the loaded
    /// one.
    fn verify_critical_partitions(&mut self, device: Device) -> Result<(), StorageError> {
        let dev = self.find_device(device)?;
        for partition in self.table.iter().filter(|p| {
            p.device == device && p.partition_type == PartitionType::PartitionTable
        }) {
            let range = dev.byte_range(u64::from(partition.start_logical_sector), partition.capacity())?;
            if decode_table(&dev.data[range])? != self.table {
                return Err(StorageError::BadTable("stored table differs from loaded table"));
            }
        }
        Ok(())
    }

    fn bad_blocks(&self, device: Device) -> Result<Vec<u32>, StorageError> {
        Ok(self.find_device(device)?.bad_blocks.clone())
    }
}

/// A chip with settable fuses and recorded side effects.
#[derive(Debug, Clone)]
pub struct SimPlatform {
    pub chip_id: ChipId,
    pub sku: u32,
    pub unique_id: u64,
    pub operating_mode: OperatingMode,
    pub sbk: Key,
    pub boot_device: Option<Device>,
    pub live_bct: Option<Vec<u8>>,
    /// Reported for every bootloader image, `None` makes images headerless
    pub image_info: Option<ImageInfo>,
    pub rtc: Option<u32>,
    pub fail_diagnostics: bool,
    /// Fuel gauge firmware handed over by the last upgrade
    pub fuel_gauge: Vec<Vec<u8>>,
}

impl SimPlatform {
    pub fn new(chip_id: u32) -> Self {
        Self {
            chip_id: ChipId {
                id: chip_id,
                major: 1,
                minor: 0,
            },
            sku: 0,
            unique_id: 0,
            operating_mode: OperatingMode::NvProduction,
            sbk: ZERO_KEY,
            boot_device: None,
            live_bct: None,
            image_info: None,
            rtc: None,
            fail_diagnostics: false,
            fuel_gauge: Vec::new(),
        }
    }

    pub fn with_boot_device(mut self, device: Device) -> Self {
        self.boot_device = Some(device);
        self
    }

    pub fn with_secure_boot_key(mut self, sbk: Key) -> Self {
        self.operating_mode = OperatingMode::OdmProductionSecure;
        self.sbk = sbk;
        self
    }
}

impl Platform for SimPlatform {
    fn chip_id(&self) -> ChipId {
        self.chip_id
    }

    fn fuses(&self) -> Fuses {
        Fuses {
            sku: self.sku,
            unique_id: self.unique_id,
            sbk_burned: self.sbk != ZERO_KEY,
            dk: DkStatus::NotBurned,
        }
    }

    fn operating_mode(&self) -> OperatingMode {
        self.operating_mode
    }

    fn secure_boot_key(&self) -> [u8; 16] {
        self.sbk
    }

    fn secondary_boot_device(&self) -> Option<Device> {
        self.boot_device
    }

    fn live_bct(&self) -> Option<Vec<u8>> {
        self.live_bct.clone()
    }

    fn write_rtc(&mut self, seconds: u32) -> Result<(), PlatformError> {
        self.rtc = Some(seconds);
        Ok(())
    }

    fn image_info(&self, _image_start: &[u8]) -> Option<ImageInfo> {
        self.image_info
    }

    fn run_diagnostic(&mut self, diagnostic: Diagnostic) -> Result<(), PlatformError> {
        if self.fail_diagnostics {
            return Err(PlatformError::Diagnostic(diagnostic));
        }
        Ok(())
    }

    fn fuel_gauge_upgrade(
        &mut self,
        first: &[u8],
        second: Option<&[u8]>,
    ) -> Result<(), PlatformError> {
        self.fuel_gauge = std::iter::once(first)
            .chain(second)
            .map(<[u8]>::to_vec)
            .collect();
        Ok(())
    }
}
