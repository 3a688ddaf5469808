// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Partition table and raw device commands.

use crate::bootloader::{add_bootloader, add_hashed_partition};
use crate::platform::Platform;
use crate::server::{chunk_len, receive_stream, Abort, Failure, OrStatus, Server, TableState};
use crate::storage::{Device, DeviceInfo, OpenMode, Storage};
use crate::transport::{Transport, TransportError};
use consts::PARTITION_NAME_MAX;
use log::info;
use nv3p_protocol::{
    CreatePartition, DevInfo, DeviceType, FileSystemType, PartitionEntryInfo, PartitionType,
    Response, Status, StatusCode,
};
use nvbct::{AuxInfo, DataType};

fn is_known_file_system(fs: FileSystemType) -> bool {
    fs.is_external() || (FileSystemType::BASIC.0..=FileSystemType::QNX.0).contains(&fs.0)
}

/// Types the boot ROM must find on the secondary boot device.
fn is_boot_critical(ty: PartitionType) -> bool {
    matches!(
        ty,
        PartitionType::PartitionTable | PartitionType::Bct | PartitionType::Bootloader
    )
}

impl<T: Transport, S: Storage, P: Platform> Server<T, S, P> {
    pub(crate) fn set_device(
        &mut self,
        kind: DeviceType,
        instance: u32,
    ) -> Result<(), TransportError> {
        let device = Device { kind, instance };
        let result = self
            .storage
            .device_info(device)
            .or_status(StatusCode::InvalidDevice)
            .map(|_| {
                self.state.device = Some(device);
                Response::None
            });
        self.complete("SetDevice", result)
    }

    pub(crate) fn delete_all(&mut self) -> Result<(), TransportError> {
        self.transport.command_complete(Response::None)?;
        self.transport
            .status(Status::new(StatusCode::NotSupported, "DeleteAll is not supported"))
    }

    /// Always acknowledged, the outcome is in the status.
    pub(crate) fn format_all(&mut self) -> Result<(), TransportError> {
        let result = self.format_all_partitions();
        self.transport.command_complete(Response::None)?;
        self.finish("FormatAll", result.map_err(Abort::from))
    }

    fn format_all_partitions(&mut self) -> Result<(), Failure> {
        if matches!(self.state.table, TableState::Building { .. }) {
            return Err(Failure::new(StatusCode::InvalidState, "partition table incomplete"));
        }
        self.ensure_table(0, 0)?;
        for id in self.storage.partition_ids() {
            let partition = self.storage.partition(id).or_status(StatusCode::InvalidPartition)?;
            if partition.partition_type == PartitionType::Bct {
                continue;
            }
            self.storage
                .format_partition(id)
                .or_status(StatusCode::InvalidPartition)?;
        }
        Ok(())
    }

    pub(crate) fn obliterate(&mut self) -> Result<(), TransportError> {
        let result = self.obliterate_device();
        self.complete("Obliterate", result)
    }

    fn obliterate_device(&mut self) -> Result<Response, Failure> {
        let device = self
            .state
            .device
            .ok_or_else(|| Failure::new(StatusCode::InvalidDevice, "no device selected"))?;
        self.storage
            .format_device(device)
            .or_status(StatusCode::MassStorageFailure)?;
        Ok(Response::None)
    }

    pub(crate) fn read_partition_table(
        &mut self,
        start_logical_sector: u32,
        num_logical_sectors: u32,
    ) -> Result<(), TransportError> {
        let table = match self.encode_partition_table(start_logical_sector, num_logical_sectors) {
            Ok(table) => table,
            Err(failure) => return self.reject("ReadPartitionTable", failure),
        };
        self.transport.command_complete(Response::PartitionTable {
            length: table.len() as u64,
        })?;
        for chunk in table.chunks(self.staging.len()) {
            self.transport.data_send(chunk)?;
        }
        self.transport.status(Status::ok())
    }

    fn encode_partition_table(
        &mut self,
        start_logical_sector: u32,
        num_logical_sectors: u32,
    ) -> Result<Vec<u8>, Failure> {
        self.ensure_table(start_logical_sector, num_logical_sectors)?;
        let mut entries = Vec::new();
        for id in self.storage.partition_ids() {
            let p = self.storage.partition(id).or_status(StatusCode::InvalidPartition)?;
            entries.push(PartitionEntryInfo {
                name: p.name,
                id: p.id,
                device: p.device.kind,
                start_logical_sector: p.start_logical_sector,
                num_logical_sectors: p.num_logical_sectors,
                bytes_per_sector: p.bytes_per_sector,
                start_physical_sector: p.start_physical_sector,
                end_physical_sector: p.end_physical_sector,
            });
        }
        postcard::to_allocvec(&entries).or_status(StatusCode::BadParameter)
    }

    pub(crate) fn start_partition_configuration(
        &mut self,
        partitions: u32,
    ) -> Result<(), TransportError> {
        let result = self.start_table(partitions);
        self.complete("StartPartitionConfiguration", result)
    }

    fn start_table(&mut self, partitions: u32) -> Result<Response, Failure> {
        self.unload_table();
        if matches!(self.state.table, TableState::Building { .. }) {
            return Err(Failure::new(
                StatusCode::InvalidState,
                "partition table already being created",
            ));
        }
        if partitions == 0 {
            return Err(Failure::new(StatusCode::BadParameter, "no partitions"));
        }
        self.storage
            .create_table_start(partitions)
            .or_status(StatusCode::PartitionCreation)?;
        self.state.table = TableState::Building {
            remaining: partitions,
        };
        self.state.pt_partition_id = None;
        info!("Creating partition table of {partitions} partitions");
        Ok(Response::None)
    }

    pub(crate) fn create_partition(
        &mut self,
        request: &CreatePartition,
    ) -> Result<(), TransportError> {
        let result = self.add_partition(request);
        self.complete("CreatePartition", result)
    }

    fn add_partition(&mut self, request: &CreatePartition) -> Result<Response, Failure> {
        let device = self
            .state
            .device
            .ok_or_else(|| Failure::new(StatusCode::InvalidDevice, "no device selected"))?;
        let remaining = match self.state.table {
            TableState::Building { remaining } if remaining > 0 => remaining,
            _ => {
                return Err(Failure::new(
                    StatusCode::InvalidState,
                    "no partition table being created",
                ))
            }
        };
        if is_boot_critical(request.partition_type) && device != self.boot_device()? {
            return Err(Failure::new(
                StatusCode::NotBootDevice,
                format!("{:?} partition must be on the boot device", request.partition_type),
            ));
        }
        if request.name.len() >= PARTITION_NAME_MAX {
            return Err(Failure::new(
                StatusCode::InvalidPartitionName,
                format!("name {} too long", request.name),
            ));
        }
        if !is_known_file_system(request.file_system) {
            return Err(Failure::new(
                StatusCode::BadParameter,
                format!("unknown file system {}", request.file_system.0),
            ));
        }
        if request.allocation_policy == nv3p_protocol::AllocationPolicy::None {
            return Err(Failure::new(StatusCode::BadParameter, "no allocation policy"));
        }

        let info = self
            .storage
            .add_table_entry(device, request)
            .or_status(StatusCode::PartitionCreation)?;

        match request.partition_type {
            PartitionType::PartitionTable => {
                let aux = AuxInfo {
                    start_logical_sector: u16::try_from(info.start_logical_sector)
                        .or_status(StatusCode::InvalidBct)?,
                    num_logical_sectors: u16::try_from(info.num_logical_sectors)
                        .or_status(StatusCode::InvalidBct)?,
                };
                self.bct.set_aux_info(aux).or_status(StatusCode::InvalidBct)?;
                self.state.pt_partition_id = Some(request.id);
            }
            PartitionType::Bct => {
                let id = u8::try_from(request.id).or_status(StatusCode::InvalidBct)?;
                self.bct
                    .set_u8(DataType::BctPartitionId, 0, id)
                    .or_status(StatusCode::InvalidBct)?;
            }
            PartitionType::Bootloader => add_bootloader(&mut self.bct, request.id)?,
            PartitionType::BootloaderStage2 => add_hashed_partition(&mut self.bct, request.id)?,
            _ => {}
        }

        self.state.table = TableState::Building {
            remaining: remaining - 1,
        };
        info!(
            "Created partition {} {} at sector {}",
            request.id, request.name, info.start_logical_sector
        );
        Ok(Response::None)
    }

    pub(crate) fn end_partition_configuration(&mut self) -> Result<(), TransportError> {
        let result = self.seal_table();
        self.complete("EndPartitionConfiguration", result)
    }

    fn seal_table(&mut self) -> Result<Response, Failure> {
        match self.state.table {
            TableState::Valid => {
                return Err(Failure::new(
                    StatusCode::PartitionTableRequired,
                    "partition table already complete",
                ))
            }
            TableState::Unloaded => {
                return Err(Failure::new(
                    StatusCode::InvalidState,
                    "no partition table being created",
                ))
            }
            TableState::Building { remaining } if remaining != 0 => {
                return Err(Failure::new(
                    StatusCode::InvalidState,
                    format!("{remaining} partitions still to be created"),
                ))
            }
            TableState::Building { .. } => {}
        }
        let pt_id = self
            .state
            .pt_partition_id
            .ok_or_else(|| Failure::new(StatusCode::InvalidPartition, "no partition table partition"))?;
        self.storage
            .create_table_finish()
            .or_status(StatusCode::PartitionCreation)?;
        self.storage
            .save_table(pt_id)
            .or_status(StatusCode::MassStorageFailure)?;
        self.state.table = TableState::Valid;
        info!("Partition table saved to partition {pt_id}");
        Ok(Response::None)
    }

    pub(crate) fn query_partition(&mut self, id: u32) -> Result<(), TransportError> {
        let result = self.partition_location(id);
        self.complete("QueryPartition", result)
    }

    fn partition_location(&mut self, id: u32) -> Result<Response, Failure> {
        self.ensure_table(0, 0)?;
        let partition = self.storage.partition(id).or_status(StatusCode::InvalidPartition)?;
        let size = self.storage.file_size(id).or_status(StatusCode::InvalidPartition)?;
        Ok(Response::Partition {
            address: partition.address(),
            size,
            partition_type: partition.partition_type,
        })
    }

    pub(crate) fn format_partition(&mut self, id: u32) -> Result<(), TransportError> {
        let result = self.format_one(id).map(|_| Response::None);
        self.complete("FormatPartition", result)
    }

    fn format_one(&mut self, id: u32) -> Result<(), Failure> {
        if matches!(self.state.table, TableState::Building { .. }) {
            return Err(Failure::new(StatusCode::InvalidState, "partition table incomplete"));
        }
        // Always start from the table on the device.
        self.unload_table();
        self.ensure_table(0, 0)?;

        if id == 0 {
            return Err(Failure::new(StatusCode::InvalidPartition, "partition id 0"));
        }
        let partition = self.storage.partition(id).or_status(StatusCode::InvalidPartition)?;
        if partition.partition_type == PartitionType::Bct {
            info!("Not formatting BCT partition {id}");
            return Ok(());
        }
        // The table partition already holds the table.
        if self.state.pt_partition_id == Some(id) {
            return Ok(());
        }
        self.storage
            .format_partition(id)
            .or_status(StatusCode::InvalidPartition)
    }

    pub(crate) fn read_partition(&mut self, id: u32, offset: u64) -> Result<(), TransportError> {
        let length = match self.readable_length(id, offset) {
            Ok(length) => length,
            Err(failure) => return self.reject("ReadPartition", failure),
        };
        self.transport
            .command_complete(Response::ReadPartition { length })?;
        let result = self.send_partition(id, length);
        self.finish("ReadPartition", result)
    }

    fn readable_length(&mut self, id: u32, offset: u64) -> Result<u64, Failure> {
        if offset != 0 {
            return Err(Failure::new(StatusCode::BadParameter, "offset not supported"));
        }
        self.ensure_table(0, 0)?;
        let partition = self.storage.partition(id).or_status(StatusCode::InvalidPartition)?;
        let size = self.storage.file_size(id).or_status(StatusCode::InvalidPartition)?;
        Ok(match partition.partition_type {
            // Stage 1 bootloaders are stored with an AES block of padding.
            PartitionType::Bootloader => size.saturating_sub(consts::AES_BLOCK_LEN as u64),
            _ => size,
        })
    }

    fn send_partition(&mut self, id: u32, length: u64) -> Result<(), Abort> {
        let mut file = self
            .storage
            .open(id, OpenMode::Read)
            .or_status(StatusCode::MassStorageFailure)?;
        let mut result = Ok(());
        let mut remaining = length;
        while remaining > 0 {
            let n = chunk_len(remaining, self.staging.len());
            let chunk = &mut self.staging[..n];
            if let Err(e) = file.read_exact(chunk) {
                result = Err(Failure::new(StatusCode::MassStorageFailure, e.to_string()).into());
                break;
            }
            if let Err(e) = self.transport.data_send(chunk) {
                result = Err(e.into());
                break;
            }
            remaining -= chunk.len() as u64;
        }
        let closed = file.close();
        if result.is_ok() {
            closed.or_status(StatusCode::MassStorageFailure)?;
        }
        result
    }

    pub(crate) fn raw_write_partition(
        &mut self,
        start_sector: u32,
        sectors: u32,
    ) -> Result<(), TransportError> {
        let (device, info) = match self.raw_access(sectors) {
            Ok(access) => access,
            Err(failure) => return self.reject("RawWritePartition", failure),
        };
        let bytes = u64::from(sectors) * u64::from(info.bytes_per_sector);
        self.transport
            .command_complete(Response::RawDevice { bytes })?;

        let sector_size = u64::from(info.bytes_per_sector);
        let storage = &mut self.storage;
        let mut sector = start_sector;
        let result = receive_stream(&mut self.transport, &mut self.staging, bytes, |chunk, _| {
            storage
                .write_sectors(device, sector, chunk)
                .or_status(StatusCode::MassStorageFailure)?;
            sector += (chunk.len() as u64 / sector_size) as u32;
            Ok(())
        });
        self.finish("RawWritePartition", result)
    }

    pub(crate) fn raw_read_partition(
        &mut self,
        start_sector: u32,
        sectors: u32,
    ) -> Result<(), TransportError> {
        let (device, info) = match self.raw_access(sectors) {
            Ok(access) => access,
            Err(failure) => return self.reject("RawReadPartition", failure),
        };
        let bytes = u64::from(sectors) * u64::from(info.bytes_per_sector);
        self.transport
            .command_complete(Response::RawDevice { bytes })?;

        let sector_size = u64::from(info.bytes_per_sector);
        let mut sector = start_sector;
        let mut remaining = bytes;
        let mut result = Ok(());
        while remaining > 0 {
            let n = chunk_len(remaining, self.staging.len());
            let chunk = &mut self.staging[..n];
            if let Err(e) = self.storage.read_sectors(device, sector, chunk) {
                result = Err(Failure::new(StatusCode::MassStorageFailure, e.to_string()).into());
                break;
            }
            self.transport.data_send(chunk)?;
            remaining -= chunk.len() as u64;
            sector += (chunk.len() as u64 / sector_size) as u32;
        }
        self.finish("RawReadPartition", result)
    }

    /// Boot device and geometry for raw sector access.
    fn raw_access(&self, sectors: u32) -> Result<(Device, DeviceInfo), Failure> {
        if sectors == 0 {
            return Err(Failure::new(StatusCode::BadParameter, "no sectors"));
        }
        let device = self.boot_device()?;
        let info = self
            .storage
            .device_info(device)
            .or_status(StatusCode::InvalidDevice)?;
        let sector_size = info.bytes_per_sector as usize;
        if sector_size == 0 || self.staging.len() % sector_size != 0 {
            return Err(Failure::new(
                StatusCode::BadParameter,
                format!("unsupported sector size {sector_size}"),
            ));
        }
        Ok((device, info))
    }

    pub(crate) fn get_dev_info(&mut self) -> Result<(), TransportError> {
        let result = self.boot_device().and_then(|device| {
            let info = self
                .storage
                .device_info(device)
                .or_status(StatusCode::InvalidDevice)?;
            Ok(Response::DevInfo(DevInfo {
                bytes_per_sector: info.bytes_per_sector,
                sectors_per_block: info.sectors_per_block,
                total_blocks: info.total_blocks,
            }))
        });
        self.complete("GetDevInfo", result)
    }
}
