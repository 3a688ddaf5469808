// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Boot Configuration Table accessor.
//!
//! A BCT is a fixed-layout binary blob read by the boot ROM. Its layout
//! depends on the chip generation, so fields are addressed by [`DataType`]
//! and instance number instead of byte offsets. The layout is picked once,
//! when the handle is created, from the chip id.

#![no_std]

extern crate alloc;

mod layout;
#[cfg(test)]
mod tests;

use alloc::{vec, vec::Vec};
use core::ops::Range;

pub use layout::{Ap20, ChipLayout, Field, T30};

/// Offset of the region covered by the BCT signature. Everything before it
/// is the signature itself.
pub const HASH_DATA_OFFSET: usize = 0x10;

/// Fields of a BCT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Version,
    BootDeviceConfigInfo,
    NumValidBootDeviceConfigs,
    SdramConfigInfo,
    NumValidSdramConfigs,
    BootLoaderAttribute,
    BootLoaderVersion,
    BctPartitionId,
    BootLoaderStartBlock,
    BootLoaderStartSector,
    BootLoaderLength,
    BootLoaderLoadAddress,
    BootLoaderEntryPoint,
    BootLoaderCryptoHash,
    NumEnabledBootLoaders,
    BadBlockTable,
    PartitionSize,
    BootDeviceBlockSizeLog2,
    BootDevicePageSizeLog2,
    /// Customer data following the fixed customer fields
    AuxData,
    /// First 16 bytes of the customer data, holding [`AuxInfo`]
    AuxDataAligned,
    CustomerDataVersion,
    DevParamsType,
    /// Signature over the hashed region
    CryptoHash,
    CryptoSalt,
    HashDataOffset,
    HashDataLength,
    OdmOption,
    /// The whole image
    FullContents,
    BctSize,
    Reserved,
    DevType,
    HashedPartitionPartId,
    HashedPartitionCryptoHash,
    EnableFailback,
    InternalInfoOneTimeRaw,
    InternalInfoVersion,
    NumValidDevType,
}

impl DataType {
    pub const ALL: [DataType; 38] = [
        DataType::Version,
        DataType::BootDeviceConfigInfo,
        DataType::NumValidBootDeviceConfigs,
        DataType::SdramConfigInfo,
        DataType::NumValidSdramConfigs,
        DataType::BootLoaderAttribute,
        DataType::BootLoaderVersion,
        DataType::BctPartitionId,
        DataType::BootLoaderStartBlock,
        DataType::BootLoaderStartSector,
        DataType::BootLoaderLength,
        DataType::BootLoaderLoadAddress,
        DataType::BootLoaderEntryPoint,
        DataType::BootLoaderCryptoHash,
        DataType::NumEnabledBootLoaders,
        DataType::BadBlockTable,
        DataType::PartitionSize,
        DataType::BootDeviceBlockSizeLog2,
        DataType::BootDevicePageSizeLog2,
        DataType::AuxData,
        DataType::AuxDataAligned,
        DataType::CustomerDataVersion,
        DataType::DevParamsType,
        DataType::CryptoHash,
        DataType::CryptoSalt,
        DataType::HashDataOffset,
        DataType::HashDataLength,
        DataType::OdmOption,
        DataType::FullContents,
        DataType::BctSize,
        DataType::Reserved,
        DataType::DevType,
        DataType::HashedPartitionPartId,
        DataType::HashedPartitionCryptoHash,
        DataType::EnableFailback,
        DataType::InternalInfoOneTimeRaw,
        DataType::InternalInfoVersion,
        DataType::NumValidDevType,
    ];

    /// Fields that are either computed or owned by the boot ROM.
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            DataType::Version
                | DataType::BctSize
                | DataType::HashDataOffset
                | DataType::HashDataLength
                | DataType::Reserved
                | DataType::InternalInfoVersion
        )
    }
}

/// Canonical element size and instance count of a [`DataType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSize {
    pub size: usize,
    pub instances: usize,
}

/// Location of the partition table, stored at the start of
/// [`DataType::AuxDataAligned`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuxInfo {
    pub start_logical_sector: u16,
    pub num_logical_sectors: u16,
}

/// Where the bytes of one field instance come from.
enum Slot {
    Stored(Range<usize>),
    Computed(u32),
}

/// Handle to a BCT image.
#[derive(Clone)]
pub struct Bct {
    layout: &'static dyn ChipLayout,
    data: Vec<u8>,
}

impl core::fmt::Debug for Bct {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bct")
            .field("chip_id", &self.layout.chip_id())
            .field("size", &self.data.len())
            .finish()
    }
}

impl Bct {
    /// Size of a BCT image for the given chip.
    pub fn size_for(chip_id: u32) -> Result<usize, Error> {
        Ok(layout_for(chip_id)?.bct_size())
    }

    /// Create a handle for the given chip.
    ///
    /// Without an image a blank BCT is created with only its version set.
    /// An image larger than the chip's BCT is cut to size.
    pub fn init(chip_id: u32, image: Option<Vec<u8>>) -> Result<Self, Error> {
        let layout = layout_for(chip_id)?;
        let size = layout.bct_size();
        let data = match image {
            Some(mut data) => {
                if data.len() < size {
                    return Err(Error::InsufficientMemory {
                        needed: size,
                        provided: data.len(),
                    });
                }
                data.truncate(size);
                data
            }
            None => {
                let mut data = vec![0; size];
                let version = layout
                    .field(DataType::Version)
                    .ok_or(Error::UnknownDataType(DataType::Version))?;
                data[version.range(0)].copy_from_slice(&layout.version().to_le_bytes());
                data
            }
        };
        Ok(Self { layout, data })
    }

    pub fn chip_id(&self) -> u32 {
        self.layout.chip_id()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Byte range covered by the BCT signature.
    pub fn hashed_range(&self) -> Range<usize> {
        HASH_DATA_OFFSET..self.data.len()
    }

    /// Canonical size and instance count of a field.
    pub fn data_size(&self, ty: DataType) -> Result<DataSize, Error> {
        match ty {
            DataType::BctSize | DataType::HashDataOffset | DataType::HashDataLength => {
                Ok(DataSize {
                    size: 4,
                    instances: 1,
                })
            }
            DataType::FullContents => Ok(DataSize {
                size: self.data.len(),
                instances: 1,
            }),
            _ => self
                .layout
                .field(ty)
                .map(|field| DataSize {
                    size: field.size,
                    instances: field.instances,
                })
                .ok_or(Error::UnknownDataType(ty)),
        }
    }

    /// Read one instance of a field into `buf`.
    ///
    /// An empty `buf` only queries the field's size and instance count. A
    /// larger buffer than needed is accepted, only the first
    /// [`DataSize::size`] bytes are written.
    pub fn get_data(
        &self,
        ty: DataType,
        instance: usize,
        buf: &mut [u8],
    ) -> Result<DataSize, Error> {
        let size = self.data_size(ty)?;
        if buf.is_empty() {
            return Ok(size);
        }
        check_instance(size, instance)?;
        if buf.len() < size.size {
            return Err(Error::InsufficientMemory {
                needed: size.size,
                provided: buf.len(),
            });
        }

        match self.slot(ty, instance)? {
            Slot::Stored(range) => buf[..size.size].copy_from_slice(&self.data[range]),
            Slot::Computed(value) => buf[..4].copy_from_slice(&value.to_le_bytes()),
        }
        Ok(size)
    }

    /// Write one instance of a field.
    ///
    /// Empty `data` only queries the field's size and instance count.
    /// Otherwise `data` must be exactly [`DataSize::size`] bytes long.
    pub fn set_data(
        &mut self,
        ty: DataType,
        instance: usize,
        data: &[u8],
    ) -> Result<DataSize, Error> {
        let size = self.data_size(ty)?;
        if data.is_empty() {
            return Ok(size);
        }
        check_instance(size, instance)?;
        if ty.is_read_only() {
            return Err(Error::ReadOnly(ty));
        }
        if data.len() != size.size {
            return Err(Error::InvalidSize {
                expected: size.size,
                actual: data.len(),
            });
        }

        match self.slot(ty, instance)? {
            Slot::Stored(range) => self.data[range].copy_from_slice(data),
            Slot::Computed(_) => return Err(Error::ReadOnly(ty)),
        }
        Ok(size)
    }

    pub fn get_u32(&self, ty: DataType, instance: usize) -> Result<u32, Error> {
        let mut buf = [0; 4];
        self.expect_size(ty, buf.len())?;
        self.get_data(ty, instance, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn set_u32(&mut self, ty: DataType, instance: usize, value: u32) -> Result<(), Error> {
        self.set_data(ty, instance, &value.to_le_bytes())?;
        Ok(())
    }

    pub fn get_u8(&self, ty: DataType, instance: usize) -> Result<u8, Error> {
        let mut buf = [0; 1];
        self.expect_size(ty, buf.len())?;
        self.get_data(ty, instance, &mut buf)?;
        Ok(buf[0])
    }

    pub fn set_u8(&mut self, ty: DataType, instance: usize, value: u8) -> Result<(), Error> {
        self.set_data(ty, instance, &[value])?;
        Ok(())
    }

    /// Copy of one instance of a field.
    pub fn get_bytes(&self, ty: DataType, instance: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0; self.data_size(ty)?.size];
        self.get_data(ty, instance, &mut buf)?;
        Ok(buf)
    }

    pub fn set_bytes(&mut self, ty: DataType, instance: usize, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::InvalidSize {
                expected: self.data_size(ty)?.size,
                actual: 0,
            });
        }
        self.set_data(ty, instance, data)?;
        Ok(())
    }

    /// Partition table location kept in the customer data.
    pub fn aux_info(&self) -> Result<AuxInfo, Error> {
        let aligned = self.get_bytes(DataType::AuxDataAligned, 0)?;
        Ok(AuxInfo {
            start_logical_sector: u16::from_le_bytes([aligned[0], aligned[1]]),
            num_logical_sectors: u16::from_le_bytes([aligned[2], aligned[3]]),
        })
    }

    pub fn set_aux_info(&mut self, info: AuxInfo) -> Result<(), Error> {
        let mut aligned = self.get_bytes(DataType::AuxDataAligned, 0)?;
        aligned[0..2].copy_from_slice(&info.start_logical_sector.to_le_bytes());
        aligned[2..4].copy_from_slice(&info.num_logical_sectors.to_le_bytes());
        self.set_bytes(DataType::AuxDataAligned, 0, &aligned)
    }

    fn expect_size(&self, ty: DataType, size: usize) -> Result<(), Error> {
        let canonical = self.data_size(ty)?.size;
        if canonical != size {
            return Err(Error::InvalidSize {
                expected: canonical,
                actual: size,
            });
        }
        Ok(())
    }

    fn slot(&self, ty: DataType, instance: usize) -> Result<Slot, Error> {
        let len = self.data.len();
        // The hashed length always fits, BCTs are a few KiB.
        let computed = |value: usize| Slot::Computed(value as u32);
        Ok(match ty {
            DataType::BctSize => computed(len),
            DataType::HashDataOffset => computed(HASH_DATA_OFFSET),
            DataType::HashDataLength => computed(len - HASH_DATA_OFFSET),
            DataType::FullContents => Slot::Stored(0..len),
            _ => Slot::Stored(
                self.layout
                    .field(ty)
                    .ok_or(Error::UnknownDataType(ty))?
                    .range(instance),
            ),
        })
    }
}

fn check_instance(size: DataSize, instance: usize) -> Result<(), Error> {
    if instance >= size.instances {
        return Err(Error::BadParameter {
            instance,
            instances: size.instances,
        });
    }
    Ok(())
}

fn layout_for(chip_id: u32) -> Result<&'static dyn ChipLayout, Error> {
    match chip_id {
        consts::CHIP_ID_AP20 => Ok(&Ap20),
        consts::CHIP_ID_T30 => Ok(&T30),
        _ => Err(Error::NotSupported { chip_id }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    BadParameter { instance: usize, instances: usize },
    InsufficientMemory { needed: usize, provided: usize },
    InvalidSize { expected: usize, actual: usize },
    NotSupported { chip_id: u32 },
    ReadOnly(DataType),
    UnknownDataType(DataType),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BadParameter {
                instance,
                instances,
            } => write!(f, "instance {instance} out of range ({instances} instances)"),
            Self::InsufficientMemory { needed, provided } => {
                write!(f, "buffer too small: need {needed} bytes, got {provided}")
            }
            Self::InvalidSize { expected, actual } => {
                write!(f, "invalid data size: expected {expected} bytes, got {actual}")
            }
            Self::NotSupported { chip_id } => write!(f, "chip id {chip_id:#x} not supported"),
            Self::ReadOnly(ty) => write!(f, "{ty:?} is read only"),
            Self::UnknownDataType(ty) => write!(f, "{ty:?} not present in this BCT"),
        }
    }
}

impl core::error::Error for Error {}
