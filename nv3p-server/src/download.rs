// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Partition downloads and bootloader activation.

use crate::bootloader::{set_bootable, update_bootloader, update_hashed_partition, BootloaderRecord};
use crate::crypto::{Hash, Key, Signer, ZERO_KEY};
use crate::platform::{ImageInfo, Platform};
use crate::server::{receive_stream, Abort, Failure, OrStatus, Server};
use crate::sparse::{detect_sparse_header, SparseDecoder};
use crate::storage::{OpenMode, PartitionInfo, Storage};
use crate::transport::{Transport, TransportError};
use consts::{AES_BLOCK_LEN, AOS_ENTRY_POINT, CHARGE_ENTRY_POINT, CHARGE_SIZE_MAX};
use log::{error, info};
use nv3p_protocol::{NackCode, OperatingMode, PartitionType, Response, Status, StatusCode};
use nvbct::DataType;

/// Bytes of the first chunk kept for the platform's image header parser.
const IMAGE_HEAD_LEN: usize = 1024;

/// Partitions hashed with the operating mode key.
pub(crate) fn is_bootloader(ty: PartitionType) -> bool {
    matches!(ty, PartitionType::Bootloader | PartitionType::BootloaderStage2)
}

impl<T: Transport, S: Storage, P: Platform> Server<T, S, P> {
    /// Key bootloaders are signed with: the SBK on secure parts, zeros
    /// otherwise.
    pub(crate) fn bootloader_key(&self) -> Key {
        match self.platform.operating_mode() {
            OperatingMode::OdmProductionSecure => self.platform.secure_boot_key(),
            _ => ZERO_KEY,
        }
    }

    pub(crate) fn download_partition(&mut self, id: u32, length: u64) -> Result<(), TransportError> {
        let partition = match self.download_target(id, length) {
            Ok(partition) => partition,
            Err(failure) => return self.reject("DownloadPartition", failure),
        };
        if matches!(
            partition.partition_type,
            PartitionType::Bct | PartitionType::PartitionTable
        ) {
            error!("DownloadPartition refused for {:?} partition {id}", partition.partition_type);
            self.transport.nack(NackCode::BadCommand)?;
            return self.transport.status(Status::new(
                StatusCode::InvalidPartition,
                "partition is written by its own command",
            ));
        }
        if self.platform.operating_mode() == OperatingMode::Undefined {
            return self.reject(
                "DownloadPartition",
                Failure::new(StatusCode::InvalidState, "operating mode undefined"),
            );
        }

        let bootloader = is_bootloader(partition.partition_type);
        let key = if bootloader { self.bootloader_key() } else { ZERO_KEY };
        // Bootloaders are always hashed for their BCT record.
        let armed = self.verify.is_armed();
        let mut signer = (bootloader || armed).then(|| Signer::new(&key));

        let mut open_failure = String::new();
        let opened = match self.storage.open(id, OpenMode::Write) {
            Ok(file) => Some(file),
            Err(e) => {
                open_failure = e.to_string();
                None
            }
        };
        // Move into a temporary so the storage borrow ends before reporting.
        let Some(mut file) = ({ opened }) else {
            let failure = Failure::new(StatusCode::MassStorageFailure, open_failure);
            return self.reject("DownloadPartition", failure);
        };
        self.transport.command_complete(Response::None)?;
        // Verification stays armed until a download is acknowledged.
        self.verify.take_armed();
        info!("Start Downloading {}", partition.name);

        let mut decoder: Option<SparseDecoder> = None;
        let mut head = Vec::new();
        let result = receive_stream(&mut self.transport, &mut self.staging, length, |chunk, last| {
            if head.is_empty() {
                head.extend_from_slice(&chunk[..chunk.len().min(IMAGE_HEAD_LEN)]);
                if detect_sparse_header(chunk) {
                    info!("Sparse image for partition {id}");
                    decoder = Some(SparseDecoder::new());
                }
            }
            if bootloader && last && length % AES_BLOCK_LEN as u64 != 0 {
                return Err(Failure::new(
                    StatusCode::InvalidBctSize,
                    format!("bootloader length {length} is not a multiple of {AES_BLOCK_LEN}"),
                ));
            }
            match decoder.as_mut() {
                Some(decoder) => {
                    decoder.feed(chunk, |bytes| {
                        if let Some(signer) = signer.as_mut() {
                            signer.update(bytes);
                        }
                        file.write(bytes).or_status(StatusCode::MassStorageFailure)
                    })?;
                    if last {
                        decoder.finish()?;
                    }
                }
                None => {
                    if let Some(signer) = signer.as_mut() {
                        signer.update(chunk);
                    }
                    file.write(chunk).or_status(StatusCode::MassStorageFailure)?;
                }
            }
            Ok(())
        });

        let mut result = match result {
            Err(Abort::Transport(e)) => {
                let _ = file.close();
                return Err(e);
            }
            other => other,
        };
        if result.is_ok() && partition.partition_type == PartitionType::Bootloader {
            // Stage 1 images are stored with one AES block of padding.
            result = file
                .write(&[0; AES_BLOCK_LEN])
                .or_status(StatusCode::MassStorageFailure)
                .map_err(Abort::from);
        }
        let closed = file.close();
        if result.is_ok() {
            result = closed.or_status(StatusCode::MassStorageFailure).map_err(Abort::from);
        }

        let data_size = decoder.as_ref().map_or(length, SparseDecoder::written);
        let hash = signer.map(Signer::finalize);
        if result.is_ok() {
            result = self
                .record_bootloader(&partition, hash, length, &head)
                .map_err(Abort::from);
        }
        if armed {
            let entry = self.verify.set(id);
            if result.is_ok() {
                entry.hash = hash.unwrap_or_default();
                entry.data_size = data_size;
            }
        }
        info!("End Downloading {}", partition.name);
        self.finish("DownloadPartition", result)
    }

    /// Checks done before the command is acknowledged.
    fn download_target(&mut self, id: u32, length: u64) -> Result<PartitionInfo, Failure> {
        if length == 0 {
            return Err(Failure::new(StatusCode::BadParameter, "empty download"));
        }
        self.ensure_table(0, 0)?;
        let partition = self.storage.partition(id).or_status(StatusCode::InvalidPartition)?;
        if length > partition.capacity() {
            return Err(Failure::new(
                StatusCode::BadParameter,
                format!(
                    "{length} bytes do not fit partition {id} of {} bytes",
                    partition.capacity()
                ),
            ));
        }
        Ok(partition)
    }

    /// Update the BCT records of a downloaded bootloader.
    fn record_bootloader(
        &mut self,
        partition: &PartitionInfo,
        hash: Option<Hash>,
        length: u64,
        head: &[u8],
    ) -> Result<(), Failure> {
        match partition.partition_type {
            PartitionType::Bootloader => self.update_bl_info(partition, hash, length, head),
            PartitionType::BootloaderStage2 => {
                let hash = hash.unwrap_or_default();
                update_hashed_partition(&mut self.bct, partition.id, &hash)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Point the bootloader record at the freshly written image and make it
    /// bootable.
    fn update_bl_info(
        &mut self,
        partition: &PartitionInfo,
        hash: Option<Hash>,
        length: u64,
        head: &[u8],
    ) -> Result<(), Failure> {
        let image = match self.platform.image_info(head) {
            Some(image) => image,
            None if length > CHARGE_SIZE_MAX => ImageInfo {
                load_address: AOS_ENTRY_POINT,
                entry_point: AOS_ENTRY_POINT,
                version: 1,
            },
            None => {
                // Runs from IRAM, the boot ROM must not bring up SDRAM.
                self.bct
                    .set_u32(DataType::NumValidSdramConfigs, 0, 0)
                    .or_status(StatusCode::InvalidBct)?;
                ImageInfo {
                    load_address: CHARGE_ENTRY_POINT,
                    entry_point: CHARGE_ENTRY_POINT,
                    version: 1,
                }
            }
        };
        let hash = match self.platform.operating_mode() {
            OperatingMode::OdmProductionSecure => None,
            _ => hash,
        };

        let device = partition.device;
        let physical = self
            .storage
            .logical_to_physical(device, partition.start_logical_sector)
            .or_status(StatusCode::InvalidPartitionTable)?;
        let geometry = self
            .storage
            .device_info(device)
            .or_status(StatusCode::InvalidPartitionTable)?;
        let block_log2 = self
            .bct
            .get_u32(DataType::BootDeviceBlockSizeLog2, 0)
            .or_status(StatusCode::InvalidBct)?;
        let page_log2 = self
            .bct
            .get_u32(DataType::BootDevicePageSizeLog2, 0)
            .or_status(StatusCode::InvalidBct)?;
        if block_log2 >= 32 || page_log2 > block_log2 {
            return Err(Failure::new(
                StatusCode::InvalidBct,
                format!("block size 2^{block_log2}, page size 2^{page_log2}"),
            ));
        }

        let offset = u64::from(physical) * u64::from(geometry.bytes_per_sector);
        let start_block = offset >> block_log2;
        let start_page = (offset % (1 << block_log2)) >> page_log2;
        let record = BootloaderRecord {
            version: image.version,
            start_block: u32::try_from(start_block).or_status(StatusCode::InvalidBct)?,
            start_page: u32::try_from(start_page).or_status(StatusCode::InvalidBct)?,
            length: u32::try_from(length).or_status(StatusCode::BadParameter)?,
            load_address: image.load_address,
            entry_point: image.entry_point,
            hash,
        };
        update_bootloader(&mut self.bct, partition.id, &record)?;
        set_bootable(&mut self.bct, partition.id)?;
        info!(
            "Bootloader {} at block {start_block} page {start_page}, entry {:#010x}",
            partition.id, image.entry_point
        );
        Ok(())
    }

    pub(crate) fn set_boot_partition(&mut self, id: u32) -> Result<(), TransportError> {
        let result = self.make_bootable(id).map(|_| Response::None);
        self.complete("SetBootPartition", result)
    }

    fn make_bootable(&mut self, id: u32) -> Result<(), Failure> {
        self.ensure_table(0, 0)?;
        let partition = self.storage.partition(id).or_status(StatusCode::InvalidPartition)?;
        if partition.partition_type != PartitionType::Bootloader {
            return Err(Failure::new(
                StatusCode::InvalidPartition,
                format!("partition {id} is not a bootloader"),
            ));
        }
        set_bootable(&mut self.bct, id)?;
        Ok(())
    }
}
