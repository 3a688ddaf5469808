// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Serves nv3p sessions over TCP against simulated storage.

use colored::Colorize;
use log::{error, info};
use nv3p_server::config::{self, Settings};
use nv3p_server::transport::StreamTransport;
use nv3p_server::{Phase, Server};
use std::io::BufReader;
use std::net::TcpListener;
use std::process::ExitCode;

fn main() -> ExitCode {
    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Config(e @ config::Error::Cli(_))) => {
            // Clap already does the "error: {}" formatting.
            eprintln!("{e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{} {e}", "error:".bold().red());
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Error> {
    let settings = Settings::from_args(std::env::args_os())?;
    let listener = TcpListener::bind(settings.listen).map_err(Error::Bind)?;
    info!(
        "Listening on {} as chip {:#x}, {:?}",
        settings.listen, settings.chip_id, settings.operating_mode
    );

    // Storage outlives sessions so a host can reconnect and read back.
    let mut storage = settings.storage();
    let mut platform = settings.platform();
    loop {
        let (stream, peer) = listener.accept().map_err(Error::Accept)?;
        info!("Host connected from {peer}");
        let reader = BufReader::new(stream.try_clone().map_err(Error::Accept)?);
        let transport = StreamTransport::new(reader, stream);

        let mut server = Server::new(transport, storage, platform).map_err(Error::Session)?;
        match server.run() {
            Ok(()) => info!("Host {peer} done"),
            Err(e) => error!("Session with {peer} ended: {e}"),
        }
        if server.phase() == Phase::Done {
            info!("Device would now boot");
        }
        // The next session starts from the BCT this one left behind.
        let bct = server.bct().as_bytes().to_vec();
        (storage, platform) = server.into_parts();
        platform.live_bct = Some(bct);
    }
}

#[derive(Debug)]
enum Error {
    Config(config::Error),
    Bind(std::io::Error),
    Accept(std::io::Error),
    Session(nv3p_server::Error),
}

impl From<config::Error> for Error {
    fn from(e: config::Error) -> Self {
        Error::Config(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config(e) => write!(f, "{e}"),
            Error::Bind(e) => write!(f, "failed to listen: {e}"),
            Error::Accept(e) => write!(f, "failed to accept connection: {e}"),
            Error::Session(e) => write!(f, "failed to start session: {e}"),
        }
    }
}
