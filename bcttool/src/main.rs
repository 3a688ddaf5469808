// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use {
    colored::Colorize,
    nv3p_server::crypto::{seal_bct, sign, BctPolicy, BctReceiver, CryptoError, Key},
    nvbct::{Bct, DataType, HASH_DATA_OFFSET},
    std::{
        ffi::OsString,
        io::{Read, Seek, Write},
        path::Path,
    },
};

mod args;

#[cfg(test)]
mod tests;

fn main() -> std::process::ExitCode {
    main_args(
        std::env::args_os(),
        &mut std::io::stdout(),
        &mut std::io::stderr(),
    )
    .into()
}

fn main_args<I, T>(args: I, stdout: impl Write, mut stderr: impl Write) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match run(args, stdout) {
        Ok(()) => ExitCode(0),
        Err(Error::Args(e @ args::Error::Cli(_))) => {
            // Clap already does the "error: {}" formatting.
            writeln!(stderr, "{e}").expect("write error to stderr");
            ExitCode(1)
        }
        Err(e) => {
            writeln!(stderr, "{} {e}", "error:".bold().red()).expect("write error to stderr");
            ExitCode(1)
        }
    }
}

fn run<I, T>(args: I, mut stdout: impl Write) -> Result<(), Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = args::args(args)?;
    match args.command {
        args::Command::Dump { input, sbk } => {
            let bct = read_bct(&input, args.chip_id)?;
            dump(&bct, &sbk, &mut stdout).map_err(Error::Stdout)?;
        }
        args::Command::Get {
            input,
            field,
            instance,
        } => {
            let bct = read_bct(&input, args.chip_id)?;
            let bytes = bct.get_bytes(field, instance)?;
            writeln!(&mut stdout, "{}", hex::encode(bytes)).map_err(Error::Stdout)?;
        }
        args::Command::Set {
            input,
            field,
            instance,
            value,
            output,
        } => {
            let mut bct = read_bct(&input, args.chip_id)?;
            let size = bct.data_size(field)?.size;
            match value {
                args::Value::Number(number) if size == 1 => {
                    let byte = u8::try_from(number).map_err(|_| Error::ValueTooLarge {
                        field,
                        value: number,
                    })?;
                    bct.set_u8(field, instance, byte)?;
                }
                args::Value::Number(number) if size == 4 => bct.set_u32(field, instance, number)?,
                args::Value::Number(number) => {
                    return Err(Error::NumberForBytes { field, size, value: number })
                }
                args::Value::Bytes(bytes) => bct.set_bytes(field, instance, &bytes)?,
            }

            let written = write_output(&input, &output, bct.as_bytes())?;
            // Sanity check that the output file still opens as a BCT. If not, it's
            // possible the output file was being used by another process.
            Bct::init(args.chip_id, Some(written)).map_err(Error::ParseOutputFile)?;
        }
        args::Command::Sign {
            input,
            sbk,
            encrypt,
            output,
        } => {
            let bct = read_bct(&input, args.chip_id)?;
            let plain = bct.into_bytes();
            let mut sealed = plain.clone();
            seal_bct(&mut sealed, &sbk, encrypt).map_err(Error::Seal)?;

            let written = write_output(&input, &output, &sealed)?;
            // Check the output the way a device would before trusting it.
            let mut receiver = BctReceiver::new(
                plain.len(),
                &sbk,
                BctPolicy::Authenticate { decrypt: encrypt },
            );
            receiver.feed(&written).map_err(Error::VerifyOutputFile)?;
            let verified = receiver.finish().map_err(Error::VerifyOutputFile)?;
            if verified.as_bytes()[HASH_DATA_OFFSET..] != plain[HASH_DATA_OFFSET..] {
                return Err(Error::VerifyOutputFile(CryptoError::Mismatch));
            }
        }
    }
    Ok(())
}

fn read_bct(path: &Path, chip_id: u32) -> Result<Bct, Error> {
    let mut input_buf = Vec::new();
    std::fs::File::open(path)
        .map_err(Error::OpenInputFile)?
        .read_to_end(&mut input_buf)
        .map_err(Error::ReadInputFile)?;
    Ok(Bct::init(chip_id, Some(input_buf))?)
}

fn dump(bct: &Bct, sbk: &Key, mut stdout: impl Write) -> std::io::Result<()> {
    let u32_of = |ty: DataType, instance: usize| bct.get_u32(ty, instance).unwrap_or_default();
    let size = bct.size();
    writeln!(stdout, "{:12} {:#x}", "chip".bold(), bct.chip_id())?;
    writeln!(
        stdout,
        "{:12} {} ({size})",
        "size".bold(),
        humansize::format_size(size, humansize::BINARY),
    )?;
    writeln!(stdout, "{:12} {:#010x}", "version".bold(), u32_of(DataType::Version, 0))?;

    let image = bct.as_bytes();
    let signature = &image[..HASH_DATA_OFFSET];
    let valid = sign(sbk, &image[HASH_DATA_OFFSET..]).as_slice() == signature;
    writeln!(
        stdout,
        "{:12} {} {}",
        "signature".bold(),
        hex::encode(signature),
        if valid { "(valid)".green() } else { "(invalid)".red() },
    )?;
    writeln!(stdout, "{:12} {:#010x}", "odm option".bold(), u32_of(DataType::OdmOption, 0))?;
    writeln!(
        stdout,
        "{:12} {}",
        "bct part".bold(),
        bct.get_u8(DataType::BctPartitionId, 0).unwrap_or_default(),
    )?;
    for (name, ty) in [
        ("block size", DataType::BootDeviceBlockSizeLog2),
        ("page size", DataType::BootDevicePageSizeLog2),
    ] {
        let log2 = u32_of(ty, 0);
        let size = 1u64.checked_shl(log2).unwrap_or_default();
        writeln!(
            stdout,
            "{:12} {} (log2 {log2})",
            name.bold(),
            humansize::format_size(size, humansize::BINARY),
        )?;
    }

    let enabled = u32_of(DataType::NumEnabledBootLoaders, 0);
    writeln!(stdout, "{:12} {enabled} enabled", "bootloaders".bold())?;
    let slots = bct
        .data_size(DataType::BootLoaderAttribute)
        .map(|s| s.instances)
        .unwrap_or_default();
    for slot in 0..slots {
        let partition = u32_of(DataType::BootLoaderAttribute, slot);
        if partition == 0 {
            continue;
        }
        let length = u32_of(DataType::BootLoaderLength, slot);
        writeln!(
            stdout,
            "  [{slot}] partition {partition}, block {} page {}, {}, load {:#010x}, entry {:#010x}",
            u32_of(DataType::BootLoaderStartBlock, slot),
            u32_of(DataType::BootLoaderStartSector, slot),
            humansize::format_size(length, humansize::BINARY),
            u32_of(DataType::BootLoaderLoadAddress, slot),
            u32_of(DataType::BootLoaderEntryPoint, slot),
        )?;
        let hash = bct
            .get_bytes(DataType::BootLoaderCryptoHash, slot)
            .unwrap_or_default();
        writeln!(stdout, "      hash {}", hex::encode(hash))?;
    }
    Ok(())
}

/// Write `data` to the output and read back what landed there.
fn write_output(input_path: &Path, output: &args::Output, data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut file = match output {
        args::Output::InPlace => {
            // When working in-place, first write to a temporary file. The temporary
            // file is then moved over the input file.
            let mut temp = tempfile::NamedTempFile::new().map_err(Error::CreateTempFile)?;
            temp.write_all(data).map_err(Error::WriteOutputFile)?;
            let input = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(input_path)
                .map_err(Error::OpenInputFile)?;
            move_file(temp.as_file(), temp.path(), &input, input_path)
                .map_err(Error::MoveTempFile)?;
            // The input handle may still point at the replaced file.
            std::fs::File::open(input_path).map_err(Error::OpenOutputFile)?
        }
        args::Output::File(path) => {
            let mut file = std::fs::OpenOptions::new()
                // After being written, the output file is read back as a sanity check.
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(Error::OpenOutputFile)?;
            file.write_all(data).map_err(Error::WriteOutputFile)?;
            file
        }
    };
    file.seek(std::io::SeekFrom::Start(0))
        .map_err(Error::SeekOutputFile)?;
    let mut output_buf = Vec::new();
    file.read_to_end(&mut output_buf)
        .map_err(Error::ReadOutputFile)?;
    Ok(output_buf)
}

fn move_file(
    mut from_file: &std::fs::File,
    from_path: &Path,
    mut to_file: &std::fs::File,
    to_path: &Path,
) -> std::io::Result<()> {
    if std::fs::rename(from_path, to_path).is_err() {
        // If rename fails, the files might be on different filesystems.
        // Fall back to copying and removing the original file.
        from_file.seek(std::io::SeekFrom::Start(0))?;
        to_file.set_len(0)?;
        to_file.seek(std::io::SeekFrom::Start(0))?;
        std::io::copy(&mut from_file, &mut to_file)?;
        std::fs::remove_file(from_path)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitCode(u8);

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        code.0.into()
    }
}

#[derive(Debug)]
enum Error {
    Args(args::Error),
    Bct(nvbct::Error),
    CreateTempFile(std::io::Error),
    MoveTempFile(std::io::Error),
    NumberForBytes {
        field: DataType,
        size: usize,
        value: u32,
    },
    OpenInputFile(std::io::Error),
    OpenOutputFile(std::io::Error),
    ParseOutputFile(nvbct::Error),
    ReadInputFile(std::io::Error),
    ReadOutputFile(std::io::Error),
    Seal(CryptoError),
    SeekOutputFile(std::io::Error),
    Stdout(std::io::Error),
    ValueTooLarge {
        field: DataType,
        value: u32,
    },
    VerifyOutputFile(CryptoError),
    WriteOutputFile(std::io::Error),
}

impl From<args::Error> for Error {
    fn from(e: args::Error) -> Self {
        Error::Args(e)
    }
}

impl From<nvbct::Error> for Error {
    fn from(e: nvbct::Error) -> Self {
        Error::Bct(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Args(e) => write!(f, "{e}"),
            Error::Bct(e) => write!(f, "{e}"),
            Error::CreateTempFile(e) => write!(f, "failed to create temporary file: {e}"),
            Error::MoveTempFile(e) => write!(f, "failed to move temporary file to output: {e}"),
            Error::NumberForBytes { field, size, value } => write!(
                f,
                "{field:?} is {size} bytes, give it as hex bytes rather than the number {value}"
            ),
            Error::OpenInputFile(e) => write!(f, "failed to open input file: {e}"),
            Error::OpenOutputFile(e) => write!(f, "failed to open output file: {e}"),
            Error::ParseOutputFile(e) => write!(
                f,
                "failed to parse output file after writing: {e}; is another process using it?"
            ),
            Error::ReadInputFile(e) => write!(f, "failed to read input file: {e}"),
            Error::ReadOutputFile(e) => write!(f, "failed to read output file: {e}"),
            Error::Seal(e) => write!(f, "failed to sign BCT: {e}"),
            Error::SeekOutputFile(e) => write!(f, "failed to seek output file: {e}"),
            Error::Stdout(e) => write!(f, "failed to write to stdout: {e}"),
            Error::ValueTooLarge { field, value } => {
                write!(f, "{value} does not fit the one byte {field:?} field")
            }
            Error::VerifyOutputFile(e) => write!(
                f,
                "output file does not verify after writing: {e}; is another process using it?"
            ),
            Error::WriteOutputFile(e) => write!(f, "failed to write to output file: {e}"),
        }
    }
}

impl std::error::Error for Error {}
