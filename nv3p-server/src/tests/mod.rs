// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use super::*;
use crate::mem::{MemStorage, SimPlatform};
use crate::platform::ImageInfo;
use crate::storage::{Device, DeviceInfo};
use crate::transport::{Received, Transport};
use consts::{AOS_ENTRY_POINT, CHIP_ID_T30, STAGING_SIZE};
use nv3p_protocol::{
    AllocationAttribute, AllocationPolicy, Command, CreatePartition, DeviceType, FileSystemType,
    NackCode, PartitionName, PartitionType, Response, Status, StatusCode,
};
use nvbct::{Bct, DataType};
use std::collections::VecDeque;

mod bct_commands;
mod mem_storage;

/// Everything the server sent, plus every data packet it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Complete(Response),
    Nack(NackCode),
    Status(StatusCode),
    Sent(Vec<u8>),
    /// A data packet of this many bytes was received
    Data(usize),
}

enum Incoming {
    Command(Received),
    Data(Vec<u8>),
}

/// Plays a host script and records the replies. The link closes when the
/// script runs out.
#[derive(Default)]
pub struct ScriptTransport {
    script: VecDeque<Incoming>,
    pub events: Vec<Event>,
    /// Status messages, in order
    pub messages: Vec<String>,
}

impl ScriptTransport {
    pub fn command(mut self, command: Command) -> Self {
        self.script
            .push_back(Incoming::Command(Received::Command(command)));
        self
    }

    pub fn unknown(mut self, tag: u32) -> Self {
        self.script.push_back(Incoming::Command(Received::Unknown(tag)));
        self
    }

    /// Queue data in staging-sized packets, the way the host sends it.
    pub fn data(mut self, data: &[u8]) -> Self {
        for chunk in data.chunks(STAGING_SIZE) {
            self.script.push_back(Incoming::Data(chunk.to_vec()));
        }
        self
    }
}

impl Transport for ScriptTransport {
    fn command_receive(&mut self) -> Result<Received, transport::TransportError> {
        match self.script.pop_front() {
            Some(Incoming::Command(command)) => Ok(command),
            Some(Incoming::Data(_)) => Err(transport::TransportError::Unexpected("data")),
            None => Err(transport::TransportError::Closed),
        }
    }

    fn command_complete(&mut self, response: Response) -> Result<(), transport::TransportError> {
        self.events.push(Event::Complete(response));
        Ok(())
    }

    fn nack(&mut self, code: NackCode) -> Result<(), transport::TransportError> {
        self.events.push(Event::Nack(code));
        Ok(())
    }

    fn status(&mut self, status: Status) -> Result<(), transport::TransportError> {
        self.events.push(Event::Status(status.code));
        self.messages.push(status.message.to_string());
        Ok(())
    }

    fn data_receive(&mut self, buf: &mut [u8]) -> Result<usize, transport::TransportError> {
        match self.script.pop_front() {
            Some(Incoming::Data(data)) => {
                if data.len() > buf.len() {
                    return Err(transport::TransportError::Oversize {
                        requested: buf.len(),
                        received: data.len(),
                    });
                }
                buf[..data.len()].copy_from_slice(&data);
                self.events.push(Event::Data(data.len()));
                Ok(data.len())
            }
            Some(Incoming::Command(_)) => Err(transport::TransportError::Unexpected("command")),
            None => Err(transport::TransportError::Closed),
        }
    }

    fn data_send(&mut self, data: &[u8]) -> Result<(), transport::TransportError> {
        self.events.push(Event::Sent(data.to_vec()));
        Ok(())
    }
}

pub const BCT_ID: u32 = 2;
pub const PT_ID: u32 = 3;
pub const EBT_ID: u32 = 4;
pub const APP_ID: u32 = 5;

/// Sector 640 with 16 KiB blocks.
pub const EBT_START_BLOCK: u32 = 20;
pub const EBT_START_SECTOR: u32 = 640;
pub const APP_START_SECTOR: u32 = 2688;

pub fn boot_device() -> Device {
    Device {
        kind: DeviceType::Emmc,
        instance: 0,
    }
}

/// 16 MiB of 512 byte sectors in 16 KiB blocks.
pub fn geometry() -> DeviceInfo {
    DeviceInfo {
        bytes_per_sector: 512,
        sectors_per_block: 32,
        total_blocks: 1024,
    }
}

pub fn storage() -> MemStorage {
    MemStorage::new().with_device(boot_device(), geometry())
}

/// A blank BCT describing the boot device geometry.
pub fn blank_bct() -> Bct {
    let mut bct = Bct::init(CHIP_ID_T30, None).unwrap();
    bct.set_u32(DataType::BootDeviceBlockSizeLog2, 0, 14).unwrap();
    bct.set_u32(DataType::BootDevicePageSizeLog2, 0, 9).unwrap();
    bct
}

pub fn platform() -> SimPlatform {
    let mut platform = SimPlatform::new(CHIP_ID_T30).with_boot_device(boot_device());
    platform.live_bct = Some(blank_bct().into_bytes());
    platform.image_info = Some(ImageInfo {
        load_address: AOS_ENTRY_POINT,
        entry_point: AOS_ENTRY_POINT,
        version: 1,
    });
    platform
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

pub fn create_request(id: u32, name: &str, ty: PartitionType, size: u64) -> CreatePartition {
    CreatePartition {
        name: PartitionName::try_from(name).unwrap(),
        id,
        partition_type: ty,
        allocation_policy: AllocationPolicy::Sequential,
        file_system: FileSystemType::BASIC,
        file_system_attribute: 0,
        address: 0,
        size,
        percent_reserved: 0,
        allocation_attribute: AllocationAttribute::empty(),
        partition_attribute: 0,
    }
}

pub fn create(id: u32, name: &str, ty: PartitionType, size: u64) -> Command {
    Command::CreatePartition(create_request(id, name, ty, size))
}

/// The usual layout: BCT, partition table, bootloader, then data filling
/// the rest of the device.
pub fn flash_table(script: ScriptTransport) -> ScriptTransport {
    let mut app = create_request(APP_ID, "APP", PartitionType::Data, 0);
    app.allocation_attribute = AllocationAttribute::ALLOCATE_REMAINING;
    script
        .command(Command::SetDevice {
            device: DeviceType::Emmc,
            instance: 0,
        })
        .command(Command::StartPartitionConfiguration { partitions: 4 })
        .command(create(BCT_ID, "BCT", PartitionType::Bct, 256 * 1024))
        .command(create(PT_ID, "PT", PartitionType::PartitionTable, 64 * 1024))
        .command(create(EBT_ID, "EBT", PartitionType::Bootloader, 1024 * 1024))
        .command(Command::CreatePartition(app))
        .command(Command::EndPartitionConfiguration)
}

/// Number of commands in [`flash_table`].
pub const TABLE_COMMANDS: usize = 7;

pub struct Session {
    pub server: Server<ScriptTransport, MemStorage, SimPlatform>,
    pub result: Result<(), Error>,
}

impl Session {
    /// Replies after the ready status.
    pub fn events(&self) -> &[Event] {
        &self.server.transport().events[1..]
    }

    /// The last `n` events.
    pub fn tail(&self, n: usize) -> &[Event] {
        let events = self.events();
        &events[events.len() - n..]
    }

    /// One status per command, in order.
    pub fn statuses(&self) -> Vec<StatusCode> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                Event::Status(code) => Some(*code),
                _ => None,
            })
            .collect()
    }

    /// Status of the last command.
    pub fn last_status(&self) -> StatusCode {
        *self.statuses().last().unwrap()
    }

    pub fn received(&self) -> usize {
        self.events()
            .iter()
            .map(|event| match event {
                Event::Data(n) => *n,
                _ => 0,
            })
            .sum()
    }

    pub fn last_message(&self) -> &str {
        self.server.transport().messages.last().unwrap()
    }
}

pub fn run(script: ScriptTransport) -> Session {
    run_with(script, storage(), platform())
}

pub fn run_with(script: ScriptTransport, storage: MemStorage, platform: SimPlatform) -> Session {
    let mut server = Server::new(script, storage, platform).unwrap();
    let result = server.run();
    Session { server, result }
}

/// Pieces of a sparse image.
pub enum Chunk<'a> {
    Raw(&'a [u8]),
    Fill { blocks: u32, pattern: [u8; 4] },
    DontCare { blocks: u32 },
    Crc(u32),
}

pub const SPARSE_BLOCK: u32 = 4096;

pub fn sparse_image(chunks: &[Chunk]) -> Vec<u8> {
    let blocks = |chunk: &Chunk| match chunk {
        Chunk::Raw(data) => data.len() as u32 / SPARSE_BLOCK,
        Chunk::Fill { blocks, .. } | Chunk::DontCare { blocks } => *blocks,
        Chunk::Crc(_) => 0,
    };
    let total_blocks: u32 = chunks.iter().map(blocks).sum();

    let mut image = Vec::new();
    image.extend_from_slice(&crate::sparse::SPARSE_MAGIC.to_le_bytes());
    image.extend_from_slice(&1u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&28u16.to_le_bytes());
    image.extend_from_slice(&12u16.to_le_bytes());
    image.extend_from_slice(&SPARSE_BLOCK.to_le_bytes());
    image.extend_from_slice(&total_blocks.to_le_bytes());
    image.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());

    for chunk in chunks {
        let (chunk_type, payload): (u16, Vec<u8>) = match chunk {
            Chunk::Raw(data) => (0xcac1, data.to_vec()),
            Chunk::Fill { pattern, .. } => (0xcac2, pattern.to_vec()),
            Chunk::DontCare { .. } => (0xcac3, Vec::new()),
            Chunk::Crc(crc) => (0xcac4, crc.to_le_bytes().to_vec()),
        };
        image.extend_from_slice(&chunk_type.to_le_bytes());
        image.extend_from_slice(&0u16.to_le_bytes());
        image.extend_from_slice(&blocks(chunk).to_le_bytes());
        image.extend_from_slice(&(12 + payload.len() as u32).to_le_bytes());
        image.extend_from_slice(&payload);
    }
    image
}

pub fn crc32(data: &[u8]) -> u32 {
    crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(data)
}
