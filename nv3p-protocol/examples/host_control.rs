// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use clap::{Parser, ValueEnum};
use nv3p_protocol::{decode, encode, Command, Decoded, Packet, MAX_FRAME_SIZE};
use std::error::Error;
use std::io::{Read, Write};
use std::net::TcpStream;

#[derive(Clone, Debug, PartialEq, ValueEnum)]
enum Cmd {
    PlatformInfo,
    DevInfo,
    GetBct,
    ReadPartitionTable,
    Sync,
    Go,
}

impl From<Cmd> for Command {
    fn from(cmd: Cmd) -> Self {
        match cmd {
            Cmd::PlatformInfo => Command::GetPlatformInfo,
            Cmd::DevInfo => Command::GetDevInfo,
            Cmd::GetBct => Command::GetBct,
            Cmd::ReadPartitionTable => Command::ReadPartitionTable {
                start_logical_sector: 0,
                num_logical_sectors: 0,
            },
            Cmd::Sync => Command::Sync,
            Cmd::Go => Command::Go,
        }
    }
}

#[derive(Debug, Parser)]
struct Args {
    #[arg(short, long, default_value_t = String::from("127.0.0.1:3333"))]
    address: String,
    #[arg(short, long, value_enum)]
    cmd: Cmd,
}

/// Reads one zero-terminated frame into `buf`.
fn read_frame(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<(), Box<dyn Error>> {
    buf.clear();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if byte[0] == 0 {
            return Ok(());
        }
        if buf.len() > MAX_FRAME_SIZE {
            return Err("frame too long".into());
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();

    let args = Args::parse();
    let mut stream = TcpStream::connect(&args.address)?;
    let mut frame = Vec::with_capacity(MAX_FRAME_SIZE);

    // The server greets with a status report once it is ready.
    read_frame(&mut stream, &mut frame)?;
    log::debug!("greeting {:02x?}", frame);

    let mut buf = [0u8; 512];
    let msg = encode(&Packet::Command(args.cmd.into()), &mut buf)?;
    println!(">>{:02x?}", msg);
    stream.write_all(msg)?;
    stream.flush()?;

    loop {
        read_frame(&mut stream, &mut frame)?;
        match decode(&mut frame)? {
            Decoded::Packet(Packet::Data(data)) => println!("<< data {} bytes", data.len()),
            Decoded::Packet(Packet::Status(status)) => {
                println!("<< status {} {}", status.code, status.message);
                break;
            }
            Decoded::Packet(Packet::Nack(code)) => println!("<< nack {code:?}"),
            Decoded::Packet(packet) => println!("<< {packet:?}"),
            Decoded::UnknownCommand(tag) => println!("<< unexpected command {tag}"),
        }
    }

    Ok(())
}
