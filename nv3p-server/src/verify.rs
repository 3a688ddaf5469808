// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Partitions whose contents are hashed while downloading and checked again
//! on request.

use crate::crypto::{Hash, Signer, ZERO_KEY};
use crate::download::is_bootloader;
use crate::platform::Platform;
use crate::server::{chunk_len, Failure, OrStatus, Server};
use crate::storage::{OpenMode, Storage};
use crate::transport::{Transport, TransportError};
use log::info;
use nv3p_protocol::{NackCode, Response, Status, StatusCode};

/// Hash and size captured while a partition was downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionToVerify {
    pub partition_id: u32,
    pub hash: Hash,
    /// Number of bytes stored, after sparse expansion
    pub data_size: u64,
}

impl PartitionToVerify {
    fn new(partition_id: u32) -> Self {
        Self {
            partition_id,
            hash: [0; 16],
            data_size: 0,
        }
    }
}

/// Session registry of partitions to verify.
#[derive(Debug, Default)]
pub struct Verification {
    entries: Vec<PartitionToVerify>,
    /// The next download records a hash
    armed: bool,
    /// A verification was enabled and `EndVerifyPartition` has not been seen
    pending: bool,
}

impl Verification {
    /// Arm hashing of the next download. Returns false when already armed.
    pub fn arm(&mut self) -> bool {
        if self.armed {
            return false;
        }
        self.armed = true;
        self.pending = true;
        true
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Consume the armed flag, returning whether it was set.
    pub fn take_armed(&mut self) -> bool {
        core::mem::take(&mut self.armed)
    }

    pub fn end(&mut self) {
        self.pending = false;
    }

    /// Register `partition_id`, replacing an earlier registration, and
    /// return its zeroed entry.
    pub fn set(&mut self, partition_id: u32) -> &mut PartitionToVerify {
        let index = match self.position(partition_id) {
            Some(index) => {
                self.entries[index] = PartitionToVerify::new(partition_id);
                index
            }
            None => {
                self.entries.push(PartitionToVerify::new(partition_id));
                self.entries.len() - 1
            }
        };
        &mut self.entries[index]
    }

    pub fn locate(&self, partition_id: u32) -> Option<&PartitionToVerify> {
        self.entries.iter().find(|e| e.partition_id == partition_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry and both flags.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.armed = false;
        self.pending = false;
    }

    fn position(&self, partition_id: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.partition_id == partition_id)
    }
}

impl<T: Transport, S: Storage, P: Platform> Server<T, S, P> {
    pub(crate) fn verify_partition_enable(&mut self) -> Result<(), TransportError> {
        if !self.verify.arm() {
            // The host only looks at the nack.
            self.transport.nack(NackCode::BadData)?;
            return self.transport.status(Status::ok());
        }
        self.transport.command_complete(Response::None)?;
        self.transport.status(Status::ok())
    }

    pub(crate) fn verify_partition(&mut self, id: u32) -> Result<(), TransportError> {
        let result = match self.verify.locate(id).cloned() {
            Some(entry) => self.read_verify_data(&entry).map(|_| {
                info!("Partition {id} verified");
                Response::None
            }),
            None => Err(Failure::new(
                StatusCode::InvalidPartition,
                format!("partition {id} was not marked for verification"),
            )),
        };
        self.complete("VerifyPartition", result)
    }

    pub(crate) fn end_verify_partition(&mut self) -> Result<(), TransportError> {
        self.verify.end();
        self.transport.command_complete(Response::None)?;
        self.transport.status(Status::ok())
    }

    /// Read a partition back and check it against the hash taken while it
    /// was downloaded.
    fn read_verify_data(&mut self, entry: &PartitionToVerify) -> Result<(), Failure> {
        let partition = self
            .storage
            .partition(entry.partition_id)
            .or_status(StatusCode::InvalidPartition)?;
        let key = if is_bootloader(partition.partition_type) {
            self.bootloader_key()
        } else {
            ZERO_KEY
        };

        let mut signer = Signer::new(&key);
        let mut file = self
            .storage
            .open(entry.partition_id, OpenMode::Read)
            .or_status(StatusCode::MassStorageFailure)?;
        let mut remaining = entry.data_size;
        let mut result = Ok(());
        while remaining > 0 {
            let n = chunk_len(remaining, self.staging.len());
            let chunk = &mut self.staging[..n];
            if let Err(e) = file.read_exact(chunk) {
                result = Err(Failure::new(StatusCode::MassStorageFailure, e.to_string()));
                break;
            }
            signer.update(chunk);
            remaining -= n as u64;
        }
        let closed = file.close();
        result?;
        closed.or_status(StatusCode::MassStorageFailure)?;

        if !signer.verify(&entry.hash) {
            return Err(Failure::new(
                StatusCode::CryptoFailure,
                format!("bad return data from partition {}", entry.partition_id),
            ));
        }
        Ok(())
    }
}
