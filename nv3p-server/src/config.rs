// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Settings of the server binary, from the command line and an optional
//! TOML file.

use crate::crypto::{Key, ZERO_KEY};
use crate::mem::{MemStorage, SimPlatform};
use crate::storage::{Device, DeviceInfo};
use clap::Parser;
use nv3p_protocol::{DeviceType, OperatingMode};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const DEFAULT_LISTEN: &str = "127.0.0.1:3333";
const DEFAULT_CHIP_ID: u32 = consts::CHIP_ID_T30;

/// Command line arguments.
#[derive(Debug, clap::Parser)]
pub struct Cli {
    /// Path to config file.
    #[clap(long, short)]
    pub config: Option<PathBuf>,
    /// Address to accept host connections on.
    #[clap(long, short)]
    pub listen: Option<SocketAddr>,
    /// Chip id to simulate, 0x20 or 0x30.
    #[clap(long, value_parser = parse_u32)]
    pub chip: Option<u32>,
    /// Simulate an ODM secure part.
    #[clap(long)]
    pub secure: bool,
    /// Secure boot key in hex.
    #[clap(long)]
    pub sbk: Option<String>,
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Config {
    pub listen: Option<SocketAddr>,
    pub chip_id: Option<u32>,
    /// One of "preproduction", "nv-production", "odm-open", "odm-secure"
    pub operating_mode: Option<String>,
    pub sbk: Option<String>,
    pub device: Option<DeviceConfig>,
    pub bad_blocks: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DeviceConfig {
    pub bytes_per_sector: Option<u32>,
    pub sectors_per_block: Option<u32>,
    pub total_blocks: Option<u32>,
    /// One of "nand", "emmc", "spi"
    pub boot_device: Option<String>,
    pub instance: Option<u32>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = std::fs::read_to_string(path)?;
        toml::from_str(&config).map_err(Into::into)
    }
}

/// Validated settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub listen: SocketAddr,
    pub chip_id: u32,
    pub operating_mode: OperatingMode,
    pub sbk: Key,
    pub boot_device: Device,
    pub geometry: DeviceInfo,
    pub bad_blocks: Vec<u32>,
}

impl Settings {
    pub fn from_args<I, T>(args: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args).map_err(Error::Cli)?;
        let config = cli.config.as_deref().map(Config::load).transpose()?.unwrap_or_default();
        Self::reconcile(cli, config)
    }

    /// Merge the command line and config file. Anything given in both is an
    /// error.
    pub fn reconcile(cli: Cli, config: Config) -> Result<Self, Error> {
        let listen = match (cli.listen, config.listen) {
            (Some(_), Some(_)) => return Err(Error::InConfigAndCli("listen address")),
            (listen, config) => listen.or(config),
        };
        let listen = match listen {
            Some(listen) => listen,
            None => DEFAULT_LISTEN.parse().map_err(|_| Error::InvalidListen)?,
        };
        let chip_id = match (cli.chip, config.chip_id) {
            (Some(_), Some(_)) => return Err(Error::InConfigAndCli("chip id")),
            (chip, config) => chip.or(config).unwrap_or(DEFAULT_CHIP_ID),
        };
        if chip_id != consts::CHIP_ID_AP20 && chip_id != consts::CHIP_ID_T30 {
            return Err(Error::UnsupportedChip(chip_id));
        }
        let operating_mode = match (cli.secure, config.operating_mode) {
            (true, Some(_)) => return Err(Error::InConfigAndCli("operating mode")),
            (true, None) => OperatingMode::OdmProductionSecure,
            (false, Some(mode)) => parse_operating_mode(&mode)?,
            (false, None) => OperatingMode::NvProduction,
        };
        let sbk = match (cli.sbk, config.sbk) {
            (Some(_), Some(_)) => return Err(Error::InConfigAndCli("secure boot key")),
            (sbk, config) => sbk.or(config).map(|s| parse_key(&s)).transpose()?,
        };
        let sbk = match (operating_mode, sbk) {
            (OperatingMode::OdmProductionSecure, None) => return Err(Error::SbkMissing),
            (_, sbk) => sbk.unwrap_or(ZERO_KEY),
        };

        let device = config.device.unwrap_or_default();
        let geometry = DeviceInfo {
            bytes_per_sector: device.bytes_per_sector.unwrap_or(512),
            sectors_per_block: device.sectors_per_block.unwrap_or(32),
            total_blocks: device.total_blocks.unwrap_or(1024),
        };
        if geometry.bytes_per_sector == 0
            || !geometry.bytes_per_sector.is_power_of_two()
            || geometry.sectors_per_block == 0
            || geometry.total_blocks == 0
        {
            return Err(Error::InvalidGeometry);
        }
        let kind = device
            .boot_device
            .as_deref()
            .map(parse_device_type)
            .transpose()?
            .unwrap_or(DeviceType::Emmc);

        Ok(Self {
            listen,
            chip_id,
            operating_mode,
            sbk,
            boot_device: Device {
                kind,
                instance: device.instance.unwrap_or(0),
            },
            geometry,
            bad_blocks: config.bad_blocks.unwrap_or_default(),
        })
    }

    /// Blank storage holding the boot device.
    pub fn storage(&self) -> MemStorage {
        let mut storage = MemStorage::new();
        storage.add_device(self.boot_device, self.geometry, self.bad_blocks.clone());
        storage
    }

    pub fn platform(&self) -> SimPlatform {
        let mut platform = SimPlatform::new(self.chip_id).with_boot_device(self.boot_device);
        platform.operating_mode = self.operating_mode;
        platform.sbk = self.sbk;
        platform
    }
}

fn parse_operating_mode(mode: &str) -> Result<OperatingMode, Error> {
    match mode {
        "preproduction" => Ok(OperatingMode::Preproduction),
        "nv-production" => Ok(OperatingMode::NvProduction),
        "odm-open" => Ok(OperatingMode::OdmProductionOpen),
        "odm-secure" => Ok(OperatingMode::OdmProductionSecure),
        _ => Err(Error::InvalidOperatingMode(mode.to_owned())),
    }
}

fn parse_device_type(kind: &str) -> Result<DeviceType, Error> {
    match kind {
        "nand" => Ok(DeviceType::Nand),
        "emmc" => Ok(DeviceType::Emmc),
        "spi" => Ok(DeviceType::Spi),
        _ => Err(Error::InvalidDevice(kind.to_owned())),
    }
}

fn parse_key(key: &str) -> Result<Key, Error> {
    let bytes = hex::decode(key).map_err(|_| Error::InvalidSbkHex)?;
    Key::try_from(bytes.as_slice()).map_err(|_| Error::InvalidSbkLength(bytes.len()))
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(toml::de::Error),
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Toml(e)
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config file: {e}"),
            ConfigError::Toml(e) => write!(f, "config file format error in TOML: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug)]
pub enum Error {
    Cli(clap::Error),
    Config(ConfigError),
    InConfigAndCli(&'static str),
    InvalidDevice(String),
    InvalidGeometry,
    InvalidListen,
    InvalidOperatingMode(String),
    InvalidSbkHex,
    InvalidSbkLength(usize),
    SbkMissing,
    UnsupportedChip(u32),
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Cli(e) => write!(f, "{}", e.render().ansi()),
            Error::Config(e) => write!(f, "config error: {e}"),
            Error::InConfigAndCli(what) => write!(f, "{what} specified in both config and cli"),
            Error::InvalidDevice(kind) => write!(f, r#"invalid boot device: "{kind}""#),
            Error::InvalidGeometry => write!(f, "invalid device geometry"),
            Error::InvalidListen => write!(f, "invalid listen address"),
            Error::InvalidOperatingMode(mode) => {
                write!(f, r#"invalid operating mode: "{mode}""#)
            }
            Error::InvalidSbkHex => write!(f, "invalid secure boot key hex"),
            Error::InvalidSbkLength(len) => {
                write!(f, "secure boot key of {len} bytes, expected 16")
            }
            Error::SbkMissing => write!(f, "secure mode requires a secure boot key"),
            Error::UnsupportedChip(id) => write!(f, "unsupported chip id {id:#x}"),
        }
    }
}

impl std::error::Error for Error {}
