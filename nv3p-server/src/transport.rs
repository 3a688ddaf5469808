// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Link to the host flashing tool.

use log::{debug, trace};
use nv3p_protocol::{
    decode, encode, Command, Decoded, FrameError, NackCode, Packet, Response, Status,
    MAX_FRAME_SIZE,
};
use std::io::{BufRead, Read, Write};

/// A command read from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Command(Command),
    /// Well-formed command with a tag this server does not know
    Unknown(u32),
}

/// Blocking, ordered request/response channel to the host.
///
/// Any error is fatal to the session.
pub trait Transport {
    /// Wait for the next command.
    fn command_receive(&mut self) -> Result<Received, TransportError>;

    /// Acknowledge the current command.
    fn command_complete(&mut self, response: Response) -> Result<(), TransportError>;

    /// Refuse the current command.
    fn nack(&mut self, code: NackCode) -> Result<(), TransportError>;

    /// Report the outcome of the current command.
    fn status(&mut self, status: Status) -> Result<(), TransportError>;

    /// Receive the next data packet into `buf`, returning its length.
    /// A packet larger than `buf` is an error.
    fn data_receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Send one data packet.
    fn data_send(&mut self, data: &[u8]) -> Result<(), TransportError>;
}

/// Fill `buf` from as many data packets as needed.
pub fn receive_exact<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = transport.data_receive(&mut buf[filled..])?;
        if n == 0 {
            return Err(TransportError::EmptyData);
        }
        filled += n;
    }
    Ok(())
}

#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    Frame(FrameError),
    /// The host closed the link
    Closed,
    /// Frame exceeds [`MAX_FRAME_SIZE`]
    FrameTooLong,
    /// A packet of the wrong kind arrived
    Unexpected(&'static str),
    /// Data packet larger than what was asked for
    Oversize { requested: usize, received: usize },
    /// Data packet carrying no bytes
    EmptyData,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Frame(e) => write!(f, "{e}"),
            Self::Closed => write!(f, "link closed by host"),
            Self::FrameTooLong => write!(f, "frame too long"),
            Self::Unexpected(kind) => write!(f, "unexpected {kind} packet"),
            Self::Oversize {
                requested,
                received,
            } => write!(f, "data packet of {received} bytes, expected at most {requested}"),
            Self::EmptyData => write!(f, "empty data packet"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<FrameError> for TransportError {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

fn packet_kind(packet: &Packet) -> &'static str {
    match packet {
        Packet::Command(_) => "command",
        Packet::Complete(_) => "complete",
        Packet::Nack(_) => "nack",
        Packet::Status(_) => "status",
        Packet::Data(_) => "data",
    }
}

/// COBS-framed packets over a byte stream such as a TCP socket or a UART.
pub struct StreamTransport<R, W> {
    reader: R,
    writer: W,
    rx: Vec<u8>,
    tx: Vec<u8>,
}

impl<R: BufRead, W: Write> StreamTransport<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            rx: Vec::with_capacity(MAX_FRAME_SIZE),
            tx: vec![0; MAX_FRAME_SIZE],
        }
    }

    /// Read one zero-terminated frame into `self.rx`.
    fn read_frame(&mut self) -> Result<(), TransportError> {
        self.rx.clear();
        let n = (&mut self.reader)
            .take(MAX_FRAME_SIZE as u64)
            .read_until(0, &mut self.rx)?;
        match self.rx.last() {
            _ if n == 0 => Err(TransportError::Closed),
            Some(0) => Ok(()),
            _ if n >= MAX_FRAME_SIZE => Err(TransportError::FrameTooLong),
            _ => Err(TransportError::Closed),
        }
    }

    fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        let frame = encode(packet, &mut self.tx)?;
        trace!("tx {} bytes", frame.len());
        self.writer.write_all(frame)?;
        self.writer.flush()?;
        Ok(())
    }
}

impl<R: BufRead, W: Write> Transport for StreamTransport<R, W> {
    fn command_receive(&mut self) -> Result<Received, TransportError> {
        self.read_frame()?;
        match decode(&mut self.rx)? {
            Decoded::Packet(Packet::Command(command)) => {
                debug!("rx command {}", command.name());
                Ok(Received::Command(command))
            }
            Decoded::UnknownCommand(tag) => Ok(Received::Unknown(tag)),
            Decoded::Packet(other) => Err(TransportError::Unexpected(packet_kind(&other))),
        }
    }

    fn command_complete(&mut self, response: Response) -> Result<(), TransportError> {
        self.send(&Packet::Complete(response))
    }

    fn nack(&mut self, code: NackCode) -> Result<(), TransportError> {
        self.send(&Packet::Nack(code))
    }

    fn status(&mut self, status: Status) -> Result<(), TransportError> {
        self.send(&Packet::Status(status))
    }

    fn data_receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.read_frame()?;
        match decode(&mut self.rx)? {
            Decoded::Packet(Packet::Data(data)) => {
                if data.len() > buf.len() {
                    return Err(TransportError::Oversize {
                        requested: buf.len(),
                        received: data.len(),
                    });
                }
                buf[..data.len()].copy_from_slice(data);
                Ok(data.len())
            }
            Decoded::Packet(other) => Err(TransportError::Unexpected(packet_kind(&other))),
            Decoded::UnknownCommand(_) => Err(TransportError::Unexpected("command")),
        }
    }

    fn data_send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.send(&Packet::Data(data))
    }
}
