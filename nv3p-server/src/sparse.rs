// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Streaming decoder for Android sparse images.
//!
//! Images arrive in arbitrary chunks; headers and payloads may straddle chunk
//! boundaries. Every expanded byte is handed to a sink, in order.

use crc::{Crc, Digest, CRC_32_ISO_HDLC};

pub const SPARSE_MAGIC: u32 = 0xed26_ff3a;

const MAJOR_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 28;
const CHUNK_HEADER_LEN: usize = 12;

const CHUNK_RAW: u16 = 0xcac1;
const CHUNK_FILL: u16 = 0xcac2;
const CHUNK_DONT_CARE: u16 = 0xcac3;
const CHUNK_CRC32: u16 = 0xcac4;

const FILL_BUF_LEN: usize = 4096;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Whether `bytes` start with a sparse image file header.
pub fn detect_sparse_header(bytes: &[u8]) -> bool {
    bytes.len() >= FILE_HEADER_LEN
        && le_u32(bytes, 0) == SPARSE_MAGIC
        && le_u16(bytes, 4) == MAJOR_VERSION
        && usize::from(le_u16(bytes, 8)) == FILE_HEADER_LEN
        && usize::from(le_u16(bytes, 10)) == CHUNK_HEADER_LEN
}

#[derive(Debug, Clone, Copy)]
struct FileHeader {
    block_size: u32,
    total_blocks: u32,
    total_chunks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FileHeader,
    ChunkHeader,
    Raw { remaining: u64 },
    FillPattern { len: u64 },
    Crc,
    Done,
}

impl State {
    /// Length of the fixed-size piece the state waits for.
    fn piece_len(self) -> usize {
        match self {
            State::FileHeader => FILE_HEADER_LEN,
            State::ChunkHeader => CHUNK_HEADER_LEN,
            State::FillPattern { .. } | State::Crc => 4,
            State::Raw { .. } | State::Done => 0,
        }
    }
}

pub struct SparseDecoder {
    state: State,
    pending: Vec<u8>,
    header: Option<FileHeader>,
    chunks_seen: u32,
    blocks_seen: u64,
    crc: Digest<'static, u32>,
    written: u64,
}

impl Default for SparseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseDecoder {
    pub fn new() -> Self {
        Self {
            state: State::FileHeader,
            pending: Vec::with_capacity(FILE_HEADER_LEN),
            header: None,
            chunks_seen: 0,
            blocks_seen: 0,
            crc: CRC32.digest(),
            written: 0,
        }
    }

    /// Number of expanded bytes handed to the sink so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Decode the next part of the image.
    pub fn feed<E: From<SparseError>>(
        &mut self,
        mut data: &[u8],
        mut sink: impl FnMut(&[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        while !data.is_empty() {
            match self.state {
                State::Done => return Err(SparseError::TrailingData.into()),
                State::Raw { remaining } => {
                    let n = usize::try_from(remaining).map_or(data.len(), |r| r.min(data.len()));
                    self.emit(&data[..n], &mut sink)?;
                    data = &data[n..];
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        self.next_chunk()
                    } else {
                        State::Raw { remaining }
                    };
                }
                state => {
                    let want = state.piece_len() - self.pending.len();
                    let take = want.min(data.len());
                    self.pending.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if take == want {
                        let piece = core::mem::take(&mut self.pending);
                        self.parse(&piece, &mut sink)?;
                        self.pending = piece;
                        self.pending.clear();
                    }
                }
            }
        }
        Ok(())
    }

    /// Check that the whole image was consumed.
    pub fn finish(&self) -> Result<u64, SparseError> {
        let Some(header) = self.header else {
            return Err(SparseError::BadHeader);
        };
        if self.state != State::Done {
            return Err(SparseError::Incomplete {
                chunks_seen: self.chunks_seen,
                total_chunks: header.total_chunks,
            });
        }
        if self.blocks_seen != u64::from(header.total_blocks) {
            return Err(SparseError::BlockCount {
                expected: header.total_blocks,
                actual: self.blocks_seen,
            });
        }
        Ok(self.written)
    }

    fn next_chunk(&self) -> State {
        match self.header {
            Some(header) if self.chunks_seen < header.total_chunks => State::ChunkHeader,
            _ => State::Done,
        }
    }

    fn parse<E: From<SparseError>>(
        &mut self,
        piece: &[u8],
        sink: &mut impl FnMut(&[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        self.state = match self.state {
            State::FileHeader => {
                if !detect_sparse_header(piece) {
                    return Err(SparseError::BadHeader.into());
                }
                let block_size = le_u32(piece, 12);
                if block_size == 0 || block_size % 4 != 0 {
                    return Err(SparseError::BadHeader.into());
                }
                self.header = Some(FileHeader {
                    block_size,
                    total_blocks: le_u32(piece, 16),
                    total_chunks: le_u32(piece, 20),
                });
                self.next_chunk()
            }
            State::ChunkHeader => self.chunk_header(piece, sink)?,
            State::FillPattern { len } => {
                let pattern = [piece[0], piece[1], piece[2], piece[3]];
                self.emit_repeated(pattern, len, sink)?;
                self.next_chunk()
            }
            State::Crc => {
                let expected = le_u32(piece, 0);
                let actual = self.crc.clone().finalize();
                if expected != actual {
                    return Err(SparseError::Crc { expected, actual }.into());
                }
                self.next_chunk()
            }
            State::Raw { .. } | State::Done => self.state,
        };
        Ok(())
    }

    fn chunk_header<E: From<SparseError>>(
        &mut self,
        piece: &[u8],
        sink: &mut impl FnMut(&[u8]) -> Result<(), E>,
    ) -> Result<State, E> {
        let block_size = self.header.map_or(0, |h| h.block_size);
        let chunk_type = le_u16(piece, 0);
        let blocks = le_u32(piece, 4);
        let total_size = le_u32(piece, 8);
        let len = u64::from(blocks) * u64::from(block_size);
        self.chunks_seen += 1;
        self.blocks_seen += u64::from(blocks);

        let bad_chunk = || SparseError::BadChunk {
            chunk_type,
            total_size,
        };
        let header_len = CHUNK_HEADER_LEN as u64;
        match chunk_type {
            CHUNK_RAW => {
                if u64::from(total_size) != header_len + len {
                    return Err(bad_chunk().into());
                }
                Ok(if len == 0 {
                    self.next_chunk()
                } else {
                    State::Raw { remaining: len }
                })
            }
            CHUNK_FILL => {
                if u64::from(total_size) != header_len + 4 {
                    return Err(bad_chunk().into());
                }
                Ok(State::FillPattern { len })
            }
            CHUNK_DONT_CARE => {
                if u64::from(total_size) != header_len {
                    return Err(bad_chunk().into());
                }
                // Written out so a read back hashes the same as the download.
                self.emit_repeated([0; 4], len, sink)?;
                Ok(self.next_chunk())
            }
            CHUNK_CRC32 => {
                if u64::from(total_size) != header_len + 4 {
                    return Err(bad_chunk().into());
                }
                Ok(State::Crc)
            }
            other => Err(SparseError::UnknownChunk(other).into()),
        }
    }

    fn emit_repeated<E: From<SparseError>>(
        &mut self,
        pattern: [u8; 4],
        mut len: u64,
        sink: &mut impl FnMut(&[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        let mut buf = [0; FILL_BUF_LEN];
        for word in buf.chunks_exact_mut(4) {
            word.copy_from_slice(&pattern);
        }
        while len > 0 {
            let n = usize::try_from(len).map_or(FILL_BUF_LEN, |l| l.min(FILL_BUF_LEN));
            self.emit(&buf[..n], sink)?;
            len -= n as u64;
        }
        Ok(())
    }

    fn emit<E>(
        &mut self,
        data: &[u8],
        sink: &mut impl FnMut(&[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        self.crc.update(data);
        self.written += data.len() as u64;
        sink(data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseError {
    BadHeader,
    UnknownChunk(u16),
    BadChunk { chunk_type: u16, total_size: u32 },
    Crc { expected: u32, actual: u32 },
    /// Data after the last declared chunk
    TrailingData,
    Incomplete { chunks_seen: u32, total_chunks: u32 },
    BlockCount { expected: u32, actual: u64 },
}

impl std::fmt::Display for SparseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadHeader => write!(f, "bad sparse file header"),
            Self::UnknownChunk(ty) => write!(f, "unknown sparse chunk type {ty:#06x}"),
            Self::BadChunk {
                chunk_type,
                total_size,
            } => write!(f, "sparse chunk {chunk_type:#06x} has bad size {total_size}"),
            Self::Crc { expected, actual } => {
                write!(f, "sparse CRC mismatch: expected {expected:#010x}, got {actual:#010x}")
            }
            Self::TrailingData => write!(f, "data after the last sparse chunk"),
            Self::Incomplete {
                chunks_seen,
                total_chunks,
            } => write!(f, "sparse image ended after {chunks_seen} of {total_chunks} chunks"),
            Self::BlockCount { expected, actual } => {
                write!(f, "sparse image expands to {actual} blocks, header says {expected}")
            }
        }
    }
}

impl std::error::Error for SparseError {}
