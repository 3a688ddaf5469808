// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session state and the command loop.
//!
//! Every handler returns `Err` only when the link to the host failed. Logical
//! failures are reported to the host with a status and the session goes on.

use crate::bootloader::BootloaderError;
use crate::platform::Platform;
use crate::sparse::SparseError;
use crate::storage::{Device, Storage};
use crate::transport::{receive_exact, Received, Transport, TransportError};
use crate::verify::Verification;
use crate::Error;
use consts::STAGING_SIZE;
use log::{error, info, warn};
use nv3p_protocol::{Command, NackCode, Response, Status, StatusCode};
use nvbct::Bct;
use std::fmt::Display;

/// Life cycle of the partition table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TableState {
    #[default]
    Unloaded,
    /// `remaining` more entries must be created before the table is sealed
    Building { remaining: u32 },
    /// A table was created or loaded and may be used
    Valid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerState {
    /// Device selected with `SetDevice`
    pub device: Option<Device>,
    pub table: TableState,
    /// Partition holding the partition table itself
    pub pt_partition_id: Option<u32>,
}

/// Coarse view of where a session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    DeviceSet,
    PartitionTableBuilding,
    PartitionTableValid,
    Verifying,
    Done,
}

/// A logical failure, reported to the host as a status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Failure {
    pub status: StatusCode,
    pub reason: String,
}

impl Failure {
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    fn to_status(&self) -> Status {
        Status::new(self.status, &self.reason)
    }
}

impl From<SparseError> for Failure {
    fn from(e: SparseError) -> Self {
        Failure::new(StatusCode::UnsparseFailure, e.to_string())
    }
}

impl From<BootloaderError> for Failure {
    fn from(e: BootloaderError) -> Self {
        let status = match e {
            BootloaderError::NoFreeSlot => StatusCode::TooManyBootloaders,
            BootloaderError::NoFreeHashSlot => StatusCode::TooManyHashPartition,
            _ => StatusCode::InvalidBct,
        };
        Failure::new(status, e.to_string())
    }
}

/// Map any error to the status code reported for it.
pub(crate) trait OrStatus<T> {
    fn or_status(self, status: StatusCode) -> Result<T, Failure>;
}

impl<T, E: Display> OrStatus<T> for Result<T, E> {
    fn or_status(self, status: StatusCode) -> Result<T, Failure> {
        self.map_err(|e| Failure::new(status, e.to_string()))
    }
}

/// Why a streaming handler stopped early.
#[derive(Debug)]
pub(crate) enum Abort {
    Failed(Failure),
    Transport(TransportError),
}

impl From<Failure> for Abort {
    fn from(f: Failure) -> Self {
        Abort::Failed(f)
    }
}

impl From<TransportError> for Abort {
    fn from(e: TransportError) -> Self {
        Abort::Transport(e)
    }
}

/// Commands refused while a verification is armed.
fn is_verify_locked(command: &Command) -> bool {
    matches!(
        command,
        Command::GetBct
            | Command::SetDevice { .. }
            | Command::Obliterate
            | Command::ReadPartitionTable { .. }
            | Command::StartPartitionConfiguration { .. }
            | Command::CreatePartition(_)
            | Command::EndPartitionConfiguration
            | Command::QueryPartition { .. }
            | Command::ReadPartition { .. }
            | Command::SetBootPartition { .. }
            | Command::OdmOptions { .. }
            | Command::OdmCommand(_)
            | Command::Sync
            | Command::VerifyPartition { .. }
            | Command::GetDevInfo
    )
}

/// Commands after which the BCT must be synced again.
fn invalidates_sync(command: &Command) -> bool {
    matches!(
        command,
        Command::UpdateBct { .. }
            | Command::FormatPartition { .. }
            | Command::DownloadPartition { .. }
            | Command::CreatePartition(_)
            | Command::SetBootPartition { .. }
            | Command::Obliterate
            | Command::OdmCommand(_)
            | Command::NvPrivData { .. }
    )
}

/// Number of bytes of the next chunk of a transfer.
pub(crate) fn chunk_len(remaining: u64, staging: usize) -> usize {
    usize::try_from(remaining).map_or(staging, |r| r.min(staging))
}

/// Receive `length` bytes through `staging`, handing every chunk and whether
/// it is the last one to `sink`.
///
/// After `sink` fails the rest of the transfer is still received and
/// dropped, so the host can read the status that follows.
pub(crate) fn receive_stream<T: Transport + ?Sized>(
    transport: &mut T,
    staging: &mut [u8],
    length: u64,
    mut sink: impl FnMut(&[u8], bool) -> Result<(), Failure>,
) -> Result<(), Abort> {
    let mut remaining = length;
    let mut failure = None;
    while remaining > 0 {
        let n = chunk_len(remaining, staging.len());
        let chunk = &mut staging[..n];
        receive_exact(transport, chunk)?;
        remaining -= chunk.len() as u64;
        if failure.is_none() {
            failure = sink(chunk, remaining == 0).err();
        }
    }
    match failure {
        Some(failure) => Err(failure.into()),
        None => Ok(()),
    }
}

/// One flashing session.
pub struct Server<T, S, P> {
    pub(crate) transport: T,
    pub(crate) storage: S,
    pub(crate) platform: P,
    pub(crate) state: ServerState,
    pub(crate) bct: Bct,
    pub(crate) staging: Box<[u8]>,
    pub(crate) verify: Verification,
    /// Full BCT image received by the last `UpdateBct`
    pub(crate) update_bct: Option<Vec<u8>>,
    /// Private data applied to the BCT by the next `Sync`
    pub(crate) priv_data: Option<Vec<u8>>,
    pub(crate) go: bool,
    pub(crate) sync_done: bool,
}

impl<T: Transport, S: Storage, P: Platform> Server<T, S, P> {
    /// Open the live BCT and prepare a session.
    pub fn new(transport: T, storage: S, platform: P) -> Result<Self, Error> {
        let bct = Bct::init(platform.chip_id().id, platform.live_bct())?;
        Ok(Self {
            transport,
            storage,
            platform,
            state: ServerState::default(),
            bct,
            staging: vec![0; STAGING_SIZE].into_boxed_slice(),
            verify: Verification::default(),
            update_bct: None,
            priv_data: None,
            go: false,
            sync_done: false,
        })
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn bct(&self) -> &Bct {
        &self.bct
    }

    pub fn verification(&self) -> &Verification {
        &self.verify
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// End the session, handing back the storage and platform.
    pub fn into_parts(self) -> (S, P) {
        (self.storage, self.platform)
    }

    pub fn phase(&self) -> Phase {
        if self.is_done() {
            return Phase::Done;
        }
        if self.verify.is_pending() {
            return Phase::Verifying;
        }
        match self.state.table {
            TableState::Building { .. } => Phase::PartitionTableBuilding,
            TableState::Valid => Phase::PartitionTableValid,
            TableState::Unloaded if self.state.device.is_some() => Phase::DeviceSet,
            TableState::Unloaded => Phase::Idle,
        }
    }

    fn is_done(&self) -> bool {
        self.go && self.sync_done && !self.verify.is_pending()
    }

    /// Serve commands until the host sent `Go`, the BCT is synced and no
    /// verification is pending.
    pub fn run(&mut self) -> Result<(), Error> {
        let result = self.serve();
        self.teardown();
        result
    }

    fn serve(&mut self) -> Result<(), Error> {
        info!("nv3p server ready, chip {:#x}", self.bct.chip_id());
        // The host waits for this before sending the first command.
        self.transport.status(Status::ok())?;

        while !self.is_done() {
            let command = match self.transport.command_receive()? {
                Received::Command(command) => command,
                Received::Unknown(tag) => {
                    warn!("Request for an unknown command {tag:#x}");
                    self.transport.nack(NackCode::BadCommand)?;
                    continue;
                }
            };
            let name = command.name();
            if let Err(e) = self.dispatch(command) {
                error!("{name} aborted: {e}");
                // Best effort, the link is most likely gone.
                let _ = self.transport.nack(NackCode::BadCommand);
                let _ = self.transport.status(Status::new(StatusCode::Unknown, ""));
                return Err(e.into());
            }
        }
        info!("Session complete");
        Ok(())
    }

    fn teardown(&mut self) {
        self.verify.clear();
        self.update_bct = None;
        self.priv_data = None;
    }

    fn dispatch(&mut self, command: Command) -> Result<(), TransportError> {
        let name = command.name();
        info!("{name}");
        let invalidates_sync = invalidates_sync(&command);

        if self.verify.is_armed() && is_verify_locked(&command) {
            self.reject(
                name,
                Failure::new(
                    StatusCode::InvalidCmdAfterVerify,
                    "partition verification enabled",
                ),
            )?;
        } else {
            match command {
                Command::GetBct => self.get_bct()?,
                Command::DownloadBct { length } => self.download_bct(length)?,
                Command::SetBlHash { length, bl_index } => self.set_bl_hash(length, bl_index)?,
                Command::UpdateBct { length, section } => self.update_bct(length, section)?,
                Command::SetDevice { device, instance } => self.set_device(device, instance)?,
                Command::DeleteAll => self.delete_all()?,
                Command::FormatAll => self.format_all()?,
                Command::ReadPartitionTable {
                    start_logical_sector,
                    num_logical_sectors,
                } => self.read_partition_table(start_logical_sector, num_logical_sectors)?,
                Command::StartPartitionConfiguration { partitions } => {
                    self.start_partition_configuration(partitions)?
                }
                Command::CreatePartition(request) => self.create_partition(&request)?,
                Command::EndPartitionConfiguration => self.end_partition_configuration()?,
                Command::QueryPartition { id } => self.query_partition(id)?,
                Command::ReadPartition { id, offset } => self.read_partition(id, offset)?,
                Command::RawWritePartition {
                    start_sector,
                    sectors,
                } => self.raw_write_partition(start_sector, sectors)?,
                Command::RawReadPartition {
                    start_sector,
                    sectors,
                } => self.raw_read_partition(start_sector, sectors)?,
                Command::DownloadPartition { id, length } => self.download_partition(id, length)?,
                Command::SetBootPartition { id } => self.set_boot_partition(id)?,
                Command::OdmOptions { options } => self.odm_options(options)?,
                Command::OdmCommand(ext) => self.odm_command(ext)?,
                Command::Sync => {
                    self.sync()?;
                    self.sync_done = true;
                }
                Command::Obliterate => self.obliterate()?,
                Command::VerifyPartitionEnable => self.verify_partition_enable()?,
                Command::VerifyPartition { id } => self.verify_partition(id)?,
                Command::EndVerifyPartition => self.end_verify_partition()?,
                Command::FormatPartition { id } => self.format_partition(id)?,
                Command::SetTime { seconds } => self.set_time(seconds)?,
                Command::GetDevInfo => self.get_dev_info()?,
                Command::NvPrivData { length } => self.nv_priv_data(length)?,
                Command::Go => self.go()?,
                Command::GetPlatformInfo => self.get_platform_info()?,
            }
        }

        if invalidates_sync {
            self.sync_done = false;
        }
        Ok(())
    }

    fn go(&mut self) -> Result<(), TransportError> {
        self.transport.command_complete(Response::None)?;
        self.transport.status(Status::ok())?;
        self.go = true;
        Ok(())
    }

    /// Acknowledge and report a handler that moves no data.
    pub(crate) fn complete(
        &mut self,
        name: &str,
        result: Result<Response, Failure>,
    ) -> Result<(), TransportError> {
        match result {
            Ok(response) => {
                self.transport.command_complete(response)?;
                self.transport.status(Status::ok())
            }
            Err(failure) => self.reject(name, failure),
        }
    }

    /// Refuse a command.
    pub(crate) fn reject(&mut self, name: &str, failure: Failure) -> Result<(), TransportError> {
        error!("{name} failed: {} {}", failure.status, failure.reason);
        self.transport.nack(NackCode::BadData)?;
        self.transport.status(failure.to_status())
    }

    /// Report the outcome of a command that was already acknowledged.
    pub(crate) fn finish(&mut self, name: &str, result: Result<(), Abort>) -> Result<(), TransportError> {
        match result {
            Ok(()) => self.transport.status(Status::ok()),
            Err(Abort::Failed(failure)) => {
                error!("{name} failed: {} {}", failure.status, failure.reason);
                self.transport.status(failure.to_status())
            }
            Err(Abort::Transport(e)) => Err(e),
        }
    }

    /// Receive `length` bytes into a new buffer.
    pub(crate) fn receive_vec(&mut self, length: usize) -> Result<Vec<u8>, TransportError> {
        let mut data = vec![0; length];
        receive_exact(&mut self.transport, &mut data)?;
        Ok(data)
    }

    /// Device the boot ROM boots from.
    pub(crate) fn boot_device(&self) -> Result<Device, Failure> {
        self.platform
            .secondary_boot_device()
            .ok_or_else(|| Failure::new(StatusCode::InvalidDevice, "no secondary boot device"))
    }

    /// Make sure a partition table is loaded, reading it from the boot device
    /// if needed. Non-zero arguments give the table location, otherwise it is
    /// taken from the BCT.
    pub(crate) fn ensure_table(
        &mut self,
        start_logical_sector: u32,
        num_logical_sectors: u32,
    ) -> Result<(), Failure> {
        match self.state.table {
            TableState::Valid => Ok(()),
            TableState::Building { .. } => Err(Failure::new(
                StatusCode::PartitionTableRequired,
                "partition table is being created",
            )),
            TableState::Unloaded => self
                .load_table(start_logical_sector, num_logical_sectors)
                .map_err(|f| Failure::new(StatusCode::PartitionTableRequired, f.reason)),
        }
    }

    /// Read the partition table from the boot device.
    pub(crate) fn load_table(
        &mut self,
        start_logical_sector: u32,
        num_logical_sectors: u32,
    ) -> Result<(), Failure> {
        let (start, num) = if start_logical_sector != 0 || num_logical_sectors != 0 {
            (start_logical_sector, num_logical_sectors)
        } else {
            let aux = self.bct.aux_info().or_status(StatusCode::InvalidBct)?;
            (
                u32::from(aux.start_logical_sector),
                u32::from(aux.num_logical_sectors),
            )
        };
        let device = self.boot_device()?;
        self.storage
            .load_table(device, start, num)
            .or_status(StatusCode::PartitionTableRequired)?;

        self.state.pt_partition_id = self.storage.partition_ids().into_iter().find(|&id| {
            self.storage
                .partition(id)
                .is_ok_and(|p| p.partition_type == nv3p_protocol::PartitionType::PartitionTable)
        });
        self.state.table = TableState::Valid;
        info!("Loaded partition table at sectors {start}+{num}");
        Ok(())
    }

    /// Forget the loaded table, if any.
    pub(crate) fn unload_table(&mut self) {
        if self.state.table == TableState::Valid {
            self.storage.unload_table();
            self.state.table = TableState::Unloaded;
        }
    }
}
