// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! nv3p flashing protocol.
//! The host flashing tool sends commands; the device-side server answers every
//! command with an acknowledgement (or a nack), optional data packets and a
//! final status report.
//! Packets are serialized with `postcard` and framed with COBS.

#![no_std]


use bitflags::bitflags;
use consts::{NAME_FIELD_MAX, STAGING_SIZE, STATUS_MESSAGE_MAX};
use serde::{Deserialize, Serialize};

/// Largest COBS frame a peer may send: one full staging buffer of data plus
/// packet overhead, plus the COBS overhead byte for every 254 bytes.
pub const MAX_FRAME_SIZE: usize = FRAME_PAYLOAD_MAX + FRAME_PAYLOAD_MAX / 254 + 2;

const FRAME_PAYLOAD_MAX: usize = STAGING_SIZE + 512;

/// Name of a partition as carried on the wire.
pub type PartitionName = heapless::String<NAME_FIELD_MAX>;

/// Human-readable part of a status report.
pub type StatusMessage = heapless::String<STATUS_MESSAGE_MAX>;

/// Commands sent by the host.
/// The variant order is the wire tag and must not change.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Read back the live BCT
    GetBct,
    /// Replace the live BCT with a (possibly signed) image of `length` bytes
    DownloadBct { length: u32 },
    /// Transplant a bootloader hash out of a separately signed BCT
    SetBlHash { length: u32, bl_index: u32 },
    /// Copy one section of a full BCT image into the live BCT
    UpdateBct { length: u32, section: BctSection },
    /// Select the storage device later partition commands apply to
    SetDevice { device: DeviceType, instance: u32 },
    /// Erase every block of the selected device
    DeleteAll,
    /// Format every partition of the loaded partition table
    FormatAll,
    /// Read the partition table. Non-zero arguments locate the table
    /// directly instead of through the BCT.
    ReadPartitionTable { start_logical_sector: u32, num_logical_sectors: u32 },
    /// Begin a new partition table of `partitions` entries
    StartPartitionConfiguration { partitions: u32 },
    /// Add one entry to the partition table under construction
    CreatePartition(CreatePartition),
    /// Seal, sign and persist the partition table under construction
    EndPartitionConfiguration,
    /// Look up location, size and type of a partition
    QueryPartition { id: u32 },
    /// Stream the contents of a partition back to the host
    ReadPartition { id: u32, offset: u64 },
    /// Write physical sectors of the secondary boot device
    RawWritePartition { start_sector: u32, sectors: u32 },
    /// Read physical sectors of the secondary boot device
    RawReadPartition { start_sector: u32, sectors: u32 },
    /// Stream an image of `length` bytes into a partition
    DownloadPartition { id: u32, length: u64 },
    /// Mark a bootloader partition bootable
    SetBootPartition { id: u32 },
    /// Set the customer option word of the BCT
    OdmOptions { options: u32 },
    /// Run an ODM extension command
    OdmCommand(OdmExtCommand),
    /// Write the BCT and verify the flashed layout
    Sync,
    /// Format the whole selected device
    Obliterate,
    /// Record a hash of the next downloaded partition
    VerifyPartitionEnable,
    /// Read a partition back and check it against its recorded hash
    VerifyPartition { id: u32 },
    /// No more partitions will be verified in this session
    EndVerifyPartition,
    /// Format a single partition
    FormatPartition { id: u32 },
    /// Set the device clock, in seconds since 1970
    SetTime { seconds: u64 },
    /// Query the geometry of the secondary boot device
    GetDevInfo,
    /// Stage private data applied to the BCT on the next sync
    NvPrivData { length: u32 },
    /// Leave the server once the session is complete
    Go,
    /// Query chip, fuse and boot device information
    GetPlatformInfo,
}

impl Command {
    /// Number of command tags known to this protocol version.
    pub const COUNT: u32 = 30;

    /// Command name used in logs and status messages.
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetBct => "GetBct",
            Command::DownloadBct { .. } => "DownloadBct",
            Command::SetBlHash { .. } => "SetBlHash",
            Command::UpdateBct { .. } => "UpdateBct",
            Command::SetDevice { .. } => "SetDevice",
            Command::DeleteAll => "DeleteAll",
            Command::FormatAll => "FormatAll",
            Command::ReadPartitionTable { .. } => "ReadPartitionTable",
            Command::StartPartitionConfiguration { .. } => "StartPartitionConfiguration",
            Command::CreatePartition(_) => "CreatePartition",
            Command::EndPartitionConfiguration => "EndPartitionConfiguration",
            Command::QueryPartition { .. } => "QueryPartition",
            Command::ReadPartition { .. } => "ReadPartition",
            Command::RawWritePartition { .. } => "RawWritePartition",
            Command::RawReadPartition { .. } => "RawReadPartition",
            Command::DownloadPartition { .. } => "DownloadPartition",
            Command::SetBootPartition { .. } => "SetBootPartition",
            Command::OdmOptions { .. } => "OdmOptions",
            Command::OdmCommand(_) => "OdmCommand",
            Command::Sync => "Sync",
            Command::Obliterate => "Obliterate",
            Command::VerifyPartitionEnable => "VerifyPartitionEnable",
            Command::VerifyPartition { .. } => "VerifyPartition",
            Command::EndVerifyPartition => "EndVerifyPartition",
            Command::FormatPartition { .. } => "FormatPartition",
            Command::SetTime { .. } => "SetTime",
            Command::GetDevInfo => "GetDevInfo",
            Command::NvPrivData { .. } => "NvPrivData",
            Command::Go => "Go",
            Command::GetPlatformInfo => "GetPlatformInfo",
        }
    }
}

/// Arguments of [`Command::CreatePartition`].
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct CreatePartition {
    pub name: PartitionName,
    pub id: u32,
    pub partition_type: PartitionType,
    pub allocation_policy: AllocationPolicy,
    pub file_system: FileSystemType,
    pub file_system_attribute: u32,
    /// Start address in bytes, used by [`AllocationPolicy::Absolute`]
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    pub percent_reserved: u32,
    pub allocation_attribute: AllocationAttribute,
    pub partition_attribute: u32,
}

/// Partition types understood by the partition manager.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartitionType {
    Bct,
    Bootloader,
    BootloaderStage2,
    PartitionTable,
    NvData,
    Data,
    Mbr,
    Ebr,
    GuidPartitionTable,
}

/// How the partition manager places a new partition.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocationPolicy {
    /// No policy given by the host; rejected
    None,
    /// Place at the address given in the request
    Absolute,
    /// Place right after the previous partition
    Sequential,
}

bitflags! {
    /// Allocation modifiers of a partition.
    #[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
    #[serde(transparent)]
    pub struct AllocationAttribute: u32 {
        /// Size the partition to all space left on the device
        const ALLOCATE_REMAINING = 1 << 0;
        /// Refuse writes once the partition has been flashed
        const WRITE_PROTECTED = 1 << 1;
    }
}

/// File system type of a partition.
/// Values at or above [`FileSystemType::EXTERNAL`] are passed through
/// untouched to customer file system drivers.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileSystemType(pub u32);

impl FileSystemType {
    pub const BASIC: Self = Self(1);
    pub const ENHANCED: Self = Self(2);
    pub const EXT2: Self = Self(3);
    pub const YAFFS2: Self = Self(4);
    pub const EXT3: Self = Self(5);
    pub const EXT4: Self = Self(6);
    pub const QNX: Self = Self(7);
    pub const EXTERNAL: Self = Self(0x100);

    pub fn is_external(self) -> bool {
        self.0 >= Self::EXTERNAL.0
    }
}

/// Storage devices the host can select.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceType {
    Nand,
    Emmc,
    Spi,
    Ide,
    Snor,
    Sata,
    Usb3,
}

/// Sections of a BCT image applied by [`Command::UpdateBct`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum BctSection {
    /// SDRAM parameter sets
    Sdram,
    /// Boot device parameter sets and their device types
    DevParam,
    /// Boot device block size, page size and partition size
    BootDevInfo,
}

/// ODM extension commands.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub enum OdmExtCommand {
    /// Upgrade the fuel gauge firmware; one or two files follow as data
    FuelGaugeFwUpgrade { file_length1: u64, file_length2: u64 },
    /// SDRAM verification, only possible from the miniloader
    VerifySdram { value: u32 },
    RunSdDiag { test_type: u32, value: u32 },
    RunSeDiag { value: u32 },
    RunPwmDiag,
    RunDsiDiag,
    /// Vendor command this protocol version has no definition for
    Vendor { code: u32 },
}

/// Device operating mode derived from the fuses.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperatingMode {
    Undefined,
    Preproduction,
    NvProduction,
    OdmProductionOpen,
    OdmProductionSecure,
}

/// State of the device key fuses.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum DkStatus {
    NotBurned,
    Burned,
    Unknown,
}

/// Chip identification register contents.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChipId {
    pub id: u32,
    pub major: u8,
    pub minor: u8,
}

/// Answer to [`Command::GetPlatformInfo`].
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct PlatformInfo {
    pub chip_id: ChipId,
    pub chip_sku: u32,
    pub chip_uid: u64,
    pub boot_rom_version: u32,
    pub secondary_boot_device: Option<DeviceType>,
    pub operating_mode: OperatingMode,
    pub sbk_burned: bool,
    pub dk_burned: DkStatus,
}

/// Answer to [`Command::GetDevInfo`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub struct DevInfo {
    pub bytes_per_sector: u32,
    pub sectors_per_block: u32,
    pub total_blocks: u32,
}

/// One record of the data sent in answer to [`Command::ReadPartitionTable`].
/// The data is a postcard-encoded sequence of these records.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct PartitionEntryInfo {
    pub name: PartitionName,
    pub id: u32,
    pub device: DeviceType,
    pub start_logical_sector: u32,
    pub num_logical_sectors: u32,
    pub bytes_per_sector: u32,
    pub start_physical_sector: u32,
    pub end_physical_sector: u32,
}

/// Payload of a command acknowledgement.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub enum Response {
    /// Plain acknowledgement
    None,
    /// Size of the BCT that follows
    Bct { length: u32 },
    /// Size of the partition table data that follows
    PartitionTable { length: u64 },
    /// Partition location and size
    Partition {
        address: u64,
        size: u64,
        partition_type: PartitionType,
    },
    /// Number of partition bytes that follow
    ReadPartition { length: u64 },
    /// Number of bytes moved by a raw sector transfer
    RawDevice { bytes: u64 },
    DevInfo(DevInfo),
    PlatformInfo(PlatformInfo),
}

/// Reasons for refusing a command outright.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum NackCode {
    /// Command unknown or not allowed
    BadCommand,
    /// Command arguments or state did not allow completion
    BadData,
}

/// Outcome of a command.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusCode {
    Ok,
    Unknown,
    NotImplemented,
    NotSupported,
    InvalidState,
    InvalidCmdAfterVerify,
    BadParameter,
    InvalidDevice,
    InvalidPartition,
    InvalidPartitionName,
    InvalidPartitionTable,
    PartitionTableRequired,
    PartitionCreation,
    MassStorageFailure,
    CryptoFailure,
    UnsparseFailure,
    BlValidationFailure,
    TooManyBootloaders,
    TooManyHashPartition,
    NotBootDevice,
    NoBootloader,
    InvalidBct,
    InvalidBctSize,
    InvalidBctPartitionId,
    BctNotFound,
    BctWriteFailure,
    BctReadVerifyFailure,
    BctInvariant,
    ErrorBbt,
    FuelGaugeFwUpgradeFailure,
}

impl core::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let text = match self {
            StatusCode::Ok => "ok",
            StatusCode::Unknown => "unknown error",
            StatusCode::NotImplemented => "not implemented",
            StatusCode::NotSupported => "not supported",
            StatusCode::InvalidState => "invalid state",
            StatusCode::InvalidCmdAfterVerify => "command not allowed while verification is enabled",
            StatusCode::BadParameter => "bad parameter",
            StatusCode::InvalidDevice => "invalid device",
            StatusCode::InvalidPartition => "invalid partition",
            StatusCode::InvalidPartitionName => "invalid partition name",
            StatusCode::InvalidPartitionTable => "invalid partition table",
            StatusCode::PartitionTableRequired => "partition table required",
            StatusCode::PartitionCreation => "partition creation failed",
            StatusCode::MassStorageFailure => "mass storage failure",
            StatusCode::CryptoFailure => "crypto failure",
            StatusCode::UnsparseFailure => "unsparse failure",
            StatusCode::BlValidationFailure => "bootloader validation failure",
            StatusCode::TooManyBootloaders => "too many bootloaders",
            StatusCode::TooManyHashPartition => "too many hashed partitions",
            StatusCode::NotBootDevice => "not the boot device",
            StatusCode::NoBootloader => "no bootloader",
            StatusCode::InvalidBct => "invalid BCT",
            StatusCode::InvalidBctSize => "invalid BCT size",
            StatusCode::InvalidBctPartitionId => "invalid BCT partition id",
            StatusCode::BctNotFound => "BCT not found",
            StatusCode::BctWriteFailure => "BCT write failure",
            StatusCode::BctReadVerifyFailure => "BCT read verify failure",
            StatusCode::BctInvariant => "BCT invariant violated",
            StatusCode::ErrorBbt => "bad block table error",
            StatusCode::FuelGaugeFwUpgradeFailure => "fuel gauge firmware upgrade failure",
        };
        f.write_str(text)
    }
}

/// Status report closing every command.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct Status {
    pub code: StatusCode,
    /// Reserved, always zero
    pub flags: u32,
    pub message: StatusMessage,
}

impl Status {
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    /// Builds a status report, cutting `message` on a char boundary so it
    /// fits the wire field.
    pub fn new(code: StatusCode, message: &str) -> Self {
        let mut end = message.len().min(STATUS_MESSAGE_MAX);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        let mut text = StatusMessage::new();
        // Cannot fail, `end` is within capacity.
        let _ = text.push_str(&message[..end]);
        Self {
            code,
            flags: 0,
            message: text,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

/// Top-level message exchanged in either direction.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub enum Packet<'a> {
    /// Host to device command
    Command(Command),
    /// Command accepted, with its response payload
    Complete(Response),
    /// Command refused
    Nack(NackCode),
    /// Final outcome of a command
    Status(Status),
    /// One chunk of a bulk transfer
    Data(&'a [u8]),
}

const PACKET_COMMAND_TAG: u32 = 0;

/// Result of decoding one frame.
#[derive(Debug, Eq, PartialEq)]
pub enum Decoded<'a> {
    Packet(Packet<'a>),
    /// A well-formed command packet carrying a tag this version does not know
    UnknownCommand(u32),
}

/// Framing failures.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FrameError {
    /// Frame is not valid COBS
    Cobs,
    /// Frame payload is not a valid packet
    Postcard(postcard::Error),
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            FrameError::Cobs => write!(f, "invalid COBS frame"),
            FrameError::Postcard(e) => write!(f, "invalid packet: {e}"),
        }
    }
}

impl core::error::Error for FrameError {}

impl From<postcard::Error> for FrameError {
    fn from(e: postcard::Error) -> Self {
        FrameError::Postcard(e)
    }
}

/// Serializes and COBS-encodes `packet` into `buf`, returning the frame
/// including its terminating zero.
pub fn encode<'b>(packet: &Packet, buf: &'b mut [u8]) -> Result<&'b mut [u8], FrameError> {
    Ok(postcard::to_slice_cobs(packet, buf)?)
}

/// Decodes a COBS frame in place. The frame may or may not include the
/// terminating zero.
pub fn decode(frame: &mut [u8]) -> Result<Decoded<'_>, FrameError> {
    let len = cobs::decode_in_place(frame).map_err(|_| FrameError::Cobs)?;
    let payload = &frame[..len];
    match postcard::from_bytes::<Packet>(payload) {
        Ok(packet) => Ok(Decoded::Packet(packet)),
        Err(e) => match command_tag(payload) {
            Some(tag) if tag >= Command::COUNT => Ok(Decoded::UnknownCommand(tag)),
            _ => Err(e.into()),
        },
    }
}

/// Command tag of a decoded command packet payload.
fn command_tag(payload: &[u8]) -> Option<u32> {
    let (packet_tag, rest) = postcard::take_from_bytes::<u32>(payload).ok()?;
    if packet_tag != PACKET_COMMAND_TAG {
        return None;
    }
    let (tag, _) = postcard::take_from_bytes::<u32>(rest).ok()?;
    Some(tag)
}
