// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Commands reading, replacing and persisting the live BCT.

use crate::bootloader::{apply_private_data, build_bad_block_table, transplant_hash};
use crate::crypto::{seal_bct, BctPolicy, BctReceiver, VerifiedBct};
use crate::platform::Platform;
use crate::server::{receive_stream, Abort, Failure, OrStatus, Server, TableState};
use crate::storage::{OpenMode, Storage};
use crate::transport::{Transport, TransportError};
use log::{debug, info};
use nv3p_protocol::{BctSection, OperatingMode, Response, Status, StatusCode};
use nvbct::{Bct, DataType};

/// Fields copied out of an uploaded image by `UpdateBct`.
fn section_fields(section: BctSection) -> &'static [DataType] {
    match section {
        BctSection::Sdram => &[DataType::NumValidSdramConfigs, DataType::SdramConfigInfo],
        BctSection::DevParam => &[
            DataType::NumValidBootDeviceConfigs,
            DataType::DevType,
            DataType::BootDeviceConfigInfo,
        ],
        BctSection::BootDevInfo => &[
            DataType::BootDeviceBlockSizeLog2,
            DataType::BootDevicePageSizeLog2,
            DataType::PartitionSize,
        ],
    }
}

fn copy_fields(live: &mut Bct, source: &Bct, fields: &[DataType]) -> Result<(), nvbct::Error> {
    for &ty in fields {
        for instance in 0..source.data_size(ty)?.instances {
            live.set_bytes(ty, instance, &source.get_bytes(ty, instance)?)?;
        }
    }
    Ok(())
}

impl<T: Transport, S: Storage, P: Platform> Server<T, S, P> {
    fn is_secure(&self) -> bool {
        self.platform.operating_mode() == OperatingMode::OdmProductionSecure
    }

    /// Length check shared by every command uploading a whole BCT image.
    fn check_bct_length(&self, length: u32) -> Result<(), Failure> {
        let size = self.bct.size();
        if length == 0 || length as usize != size {
            return Err(Failure::new(
                StatusCode::InvalidState,
                format!("BCT of {length} bytes, expected {size}"),
            ));
        }
        Ok(())
    }

    /// Receive a whole BCT image and check it against `policy`.
    fn receive_bct(&mut self, length: u32, policy: BctPolicy) -> Result<VerifiedBct, Abort> {
        let key = self.platform.secure_boot_key();
        let mut receiver = BctReceiver::new(length as usize, &key, policy);
        receive_stream(&mut self.transport, &mut self.staging, u64::from(length), |chunk, _| {
            receiver
                .feed(chunk)
                .or_status(StatusCode::BlValidationFailure)
        })?;
        Ok(receiver
            .finish()
            .or_status(StatusCode::BlValidationFailure)?)
    }

    pub(crate) fn get_bct(&mut self) -> Result<(), TransportError> {
        let length = self.bct.size() as u32;
        self.transport.command_complete(Response::Bct { length })?;
        for chunk in self.bct.as_bytes().chunks(self.staging.len()) {
            self.transport.data_send(chunk)?;
        }
        self.transport.status(Status::ok())
    }

    pub(crate) fn download_bct(&mut self, length: u32) -> Result<(), TransportError> {
        if let Err(failure) = self.check_bct_length(length) {
            return self.reject("DownloadBct", failure);
        }
        self.transport.command_complete(Response::None)?;

        let policy = if self.is_secure() {
            BctPolicy::Authenticate { decrypt: true }
        } else {
            BctPolicy::Trust
        };
        let result = self.receive_bct(length, policy).and_then(|bct| {
            self.bct
                .set_data(DataType::FullContents, 0, bct.as_bytes())
                .or_status(StatusCode::InvalidBct)?;
            info!("Installed downloaded BCT");
            Ok(())
        });
        self.finish("DownloadBct", result)
    }

    pub(crate) fn set_bl_hash(&mut self, length: u32, bl_index: u32) -> Result<(), TransportError> {
        if let Err(failure) = self.check_bct_length(length) {
            return self.reject("SetBlHash", failure);
        }
        self.transport.command_complete(Response::None)?;

        let policy = BctPolicy::Authenticate {
            decrypt: self.is_secure(),
        };
        let result = self.receive_bct(length, policy).and_then(|signed| {
            let signed = Bct::init(self.bct.chip_id(), Some(signed.as_bytes().to_vec()))
                .or_status(StatusCode::InvalidBct)?;
            transplant_hash(&mut self.bct, &signed, bl_index).map_err(Failure::from)?;
            info!("Took hash of bootloader {bl_index} from signed BCT");
            Ok(())
        });
        self.finish("SetBlHash", result)
    }

    pub(crate) fn update_bct(&mut self, length: u32, section: BctSection) -> Result<(), TransportError> {
        if let Err(failure) = self.check_bct_length(length) {
            return self.reject("UpdateBct", failure);
        }
        self.transport.command_complete(Response::None)?;

        let mut image = self.update_bct.take().unwrap_or_default();
        image.clear();
        let result = receive_stream(&mut self.transport, &mut self.staging, u64::from(length), |chunk, _| {
            image.extend_from_slice(chunk);
            Ok(())
        })
        .and_then(|()| {
            let source = Bct::init(self.bct.chip_id(), Some(image.clone()))
                .or_status(StatusCode::InvalidBct)?;
            copy_fields(&mut self.bct, &source, section_fields(section))
                .or_status(StatusCode::InvalidBct)?;
            debug!("Updated {section:?} section of the BCT");
            Ok(())
        });
        self.update_bct = Some(image);
        self.finish("UpdateBct", result)
    }

    pub(crate) fn odm_options(&mut self, options: u32) -> Result<(), TransportError> {
        let result = self
            .bct
            .set_u32(DataType::OdmOption, 0, options)
            .or_status(StatusCode::InvalidBct)
            .map(|_| Response::None);
        self.complete("OdmOptions", result)
    }

    pub(crate) fn nv_priv_data(&mut self, length: u32) -> Result<(), TransportError> {
        if length == 0 {
            return self.reject(
                "NvPrivData",
                Failure::new(StatusCode::BadParameter, "no private data"),
            );
        }
        self.transport.command_complete(Response::None)?;
        let mut data = Vec::with_capacity(length as usize);
        receive_stream(&mut self.transport, &mut self.staging, u64::from(length), |chunk, _| {
            data.extend_from_slice(chunk);
            Ok(())
        })
        .or_else(|abort| match abort {
            Abort::Transport(e) => Err(e),
            Abort::Failed(_) => Ok(()),
        })?;
        self.priv_data = Some(data);
        self.transport.status(Status::ok())
    }

    pub(crate) fn sync(&mut self) -> Result<(), TransportError> {
        let result = self.sync_bct().map(|_| Response::None);
        self.complete("Sync", result)
    }

    fn sync_bct(&mut self) -> Result<(), Failure> {
        let size = self
            .bct
            .get_u32(DataType::BctSize, 0)
            .or_status(StatusCode::InvalidBctSize)? as usize;
        let bct_partition_id = self
            .bct
            .get_u8(DataType::BctPartitionId, 0)
            .or_status(StatusCode::InvalidBctPartitionId)?;

        if matches!(self.state.table, TableState::Building { .. }) {
            return Err(Failure::new(
                StatusCode::InvalidPartitionTable,
                "partition table incomplete",
            ));
        }
        self.unload_table();
        self.load_table(0, 0)
            .map_err(|f| Failure::new(StatusCode::InvalidPartitionTable, f.reason))?;

        if bct_partition_id != 0 {
            self.write_bct(u32::from(bct_partition_id), size)?;
        }

        if self.state.device.is_some() {
            let device = match self.state.pt_partition_id {
                Some(id) => self.storage.partition(id).map(|p| p.device).ok(),
                None => None,
            };
            if let Some(device) = device.or(self.state.device) {
                self.storage
                    .verify_critical_partitions(device)
                    .or_status(StatusCode::MassStorageFailure)?;
            }
        }
        info!("Sync complete");
        Ok(())
    }

    /// Finish the BCT, then seal it and write it to its partition.
    fn write_bct(&mut self, partition_id: u32, size: usize) -> Result<(), Failure> {
        let enabled = self
            .bct
            .get_u32(DataType::NumEnabledBootLoaders, 0)
            .or_status(StatusCode::InvalidBct)?;
        if enabled == 0 {
            return Err(Failure::new(StatusCode::NoBootloader, "no bootable bootloader"));
        }

        let device = self.boot_device()?;
        let bad_blocks = self.storage.bad_blocks(device).or_status(StatusCode::ErrorBbt)?;
        let geometry = self.storage.device_info(device).or_status(StatusCode::ErrorBbt)?;
        build_bad_block_table(&mut self.bct, geometry.total_blocks, &bad_blocks)
            .or_status(StatusCode::ErrorBbt)?;

        self.bct
            .set_u8(DataType::EnableFailback, 0, 1)
            .or_status(StatusCode::InvalidBct)?;
        if let Some(data) = self.priv_data.as_deref() {
            apply_private_data(&mut self.bct, data).or_status(StatusCode::BctInvariant)?;
        }
        self.priv_data = None;

        let mode = self.platform.operating_mode();
        if mode == OperatingMode::Undefined {
            return Err(Failure::new(StatusCode::InvalidState, "operating mode undefined"));
        }
        let mut image = self.bct.as_bytes().to_vec();
        if image.len() != size {
            return Err(Failure::new(
                StatusCode::InvalidBctSize,
                format!("BCT of {} bytes, expected {size}", image.len()),
            ));
        }
        let key = self.platform.secure_boot_key();
        seal_bct(&mut image, &key, mode == OperatingMode::OdmProductionSecure)
            .or_status(StatusCode::CryptoFailure)?;

        let mut file = self
            .storage
            .open(partition_id, OpenMode::Write)
            .or_status(StatusCode::BctWriteFailure)?;
        let written = file.write(&image);
        let closed = file.close();
        written.or_status(StatusCode::BctWriteFailure)?;
        closed.or_status(StatusCode::BctWriteFailure)?;

        let mut readback = vec![0; image.len()];
        let mut file = self
            .storage
            .open(partition_id, OpenMode::Read)
            .or_status(StatusCode::BctReadVerifyFailure)?;
        let read = file.read_exact(&mut readback);
        let closed = file.close();
        read.or_status(StatusCode::BctReadVerifyFailure)?;
        closed.or_status(StatusCode::BctReadVerifyFailure)?;
        if readback != image {
            return Err(Failure::new(
                StatusCode::BctReadVerifyFailure,
                "BCT read back differs from what was written",
            ));
        }
        info!("BCT written to partition {partition_id}");
        Ok(())
    }
}
