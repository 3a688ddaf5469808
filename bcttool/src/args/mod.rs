// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use {
    clap::Parser,
    nv3p_server::crypto::{Key, ZERO_KEY},
    nvbct::DataType,
    std::path::PathBuf,
};

mod cli;
mod config;

pub use config::Error as ConfigError;

const DEFAULT_CHIP_ID: u32 = consts::CHIP_ID_T30;

/// Program arguments loaded from the CLI and config file.
#[derive(Debug, Clone)]
pub struct Args {
    pub chip_id: u32,
    pub command: Command,
}

#[derive(Debug, Clone)]
pub enum Command {
    /// Dump the BCT contents to stdout.
    Dump { input: PathBuf, sbk: Key },
    /// Print one field.
    Get {
        input: PathBuf,
        field: DataType,
        instance: usize,
    },
    /// Change one field.
    Set {
        input: PathBuf,
        field: DataType,
        instance: usize,
        value: Value,
        output: Output,
    },
    /// Sign a BCT image.
    Sign {
        input: PathBuf,
        sbk: Key,
        encrypt: bool,
        output: Output,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Number(u32),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub enum Output {
    InPlace,
    File(PathBuf),
}

pub fn args<I, T>(args: I) -> Result<Args, Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = cli::Args::try_parse_from(args).map_err(Error::Cli)?;

    // Load the config.
    let config = cli.config.map(|c| config::Config::load(&c)).transpose()?;
    let config_chip_id = config.as_ref().and_then(|config| config.chip_id);
    let config_sbk = config.as_ref().and_then(|config| config.sbk.clone());

    // Reconcile the CLI and config arguments. Error if anything is specified both
    // on the CLI and in the config file.
    let chip_id = match (cli.chip, config_chip_id) {
        (None, None) => DEFAULT_CHIP_ID,
        (None, Some(chip_id)) => chip_id,
        (Some(chip_id), None) => chip_id,
        (Some(_), Some(_)) => return Err(Error::ChipInConfigAndCli),
    };
    if chip_id != consts::CHIP_ID_AP20 && chip_id != consts::CHIP_ID_T30 {
        return Err(Error::UnsupportedChip(chip_id));
    }
    let sbk = |cli_sbk: Option<String>| match (cli_sbk, config_sbk.clone()) {
        (None, None) => Ok(None),
        (None, Some(sbk)) => parse_key(&sbk).map(Some),
        (Some(sbk), None) => parse_key(&sbk).map(Some),
        (Some(_), Some(_)) => Err(Error::SbkInConfigAndCli),
    };

    let command = match cli.command {
        cli::Command::Dump { input, sbk: cli_sbk } => Command::Dump {
            input,
            sbk: sbk(cli_sbk)?.unwrap_or(ZERO_KEY),
        },
        cli::Command::Get {
            input,
            field,
            instance,
        } => Command::Get {
            input,
            field: parse_field(&field)?,
            instance,
        },
        cli::Command::Set {
            input,
            field,
            instance,
            value,
            in_place,
            output,
        } => Command::Set {
            input,
            field: parse_field(&field)?,
            instance,
            value: parse_value(&value)?,
            output: output_of(in_place, output)?,
        },
        cli::Command::Sign {
            input,
            sbk: cli_sbk,
            encrypt,
            in_place,
            output,
        } => {
            let sbk = match sbk(cli_sbk)? {
                Some(sbk) => sbk,
                None if encrypt => return Err(Error::SbkMissing),
                None => ZERO_KEY,
            };
            Command::Sign {
                input,
                sbk,
                encrypt,
                output: output_of(in_place, output)?,
            }
        }
    };
    Ok(Args { chip_id, command })
}

fn output_of(in_place: bool, output: Option<PathBuf>) -> Result<Output, Error> {
    match (in_place, output) {
        (true, Some(_)) => Err(Error::InPlaceAndOutputSpecified),
        (true, None) => Ok(Output::InPlace),
        (false, Some(output)) => Ok(Output::File(output)),
        (false, None) => Err(Error::OutputMissing),
    }
}

pub(crate) fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn parse_key(key: &str) -> Result<Key, Error> {
    let bytes = hex::decode(key).map_err(|_| Error::InvalidSbkHex)?;
    Key::try_from(bytes.as_slice()).map_err(|_| Error::InvalidSbkLength(bytes.len()))
}

/// Fields are named as in [`DataType`], ignoring case.
fn parse_field(name: &str) -> Result<DataType, Error> {
    DataType::ALL
        .into_iter()
        .find(|ty| format!("{ty:?}").eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::UnknownField(name.to_owned()))
}

fn parse_value(value: &str) -> Result<Value, Error> {
    if let Ok(number) = parse_u32(value) {
        return Ok(Value::Number(number));
    }
    hex::decode(value)
        .map(Value::Bytes)
        .map_err(|_| Error::InvalidValue(value.to_owned()))
}

#[derive(Debug)]
pub enum Error {
    ChipInConfigAndCli,
    Cli(clap::Error),
    Config(ConfigError),
    InPlaceAndOutputSpecified,
    InvalidSbkHex,
    InvalidSbkLength(usize),
    InvalidValue(String),
    OutputMissing,
    SbkInConfigAndCli,
    SbkMissing,
    UnknownField(String),
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
            Error::ChipInConfigAndCli => write!(f, "chip id specified in both config and cli"),
            Error::Cli(e) => write!(f, "{}", e.render().ansi()),
            Error::Config(e) => write!(f, "config error: {e}"),
            Error::InPlaceAndOutputSpecified => {
                write!(f, "cannot specify both --in-place and --output (-o)")
            }
            Error::InvalidSbkHex => write!(f, "user specified invalid secure boot key hex"),
            Error::InvalidSbkLength(len) => {
                write!(f, "secure boot key of {len} bytes, expected 16")
            }
            Error::InvalidValue(value) => {
                write!(f, r#"user specified invalid value: "{value}""#)
            }
            Error::OutputMissing => write!(f, "specify either --in-place or --output (-o)"),
            Error::SbkInConfigAndCli => {
                write!(f, "secure boot key specified in both config and cli")
            }
            Error::SbkMissing => write!(f, "encrypting requires a secure boot key"),
            Error::UnknownField(name) => write!(f, r#"unknown BCT field: "{name}""#),
            Error::UnsupportedChip(id) => write!(f, "unsupported chip id {id:#x}"),
        }
    }
}

impl std::error::Error for Error {}
