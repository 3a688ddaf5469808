// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use {
    crate::ExitCode,
    consts::{CHIP_ID_AP20, CHIP_ID_T30},
    nv3p_server::crypto::{sign, BctPolicy, BctReceiver, ZERO_KEY},
    nvbct::{Bct, DataType},
    std::io::Write,
};

const SBK_HEX: &str = "000102030405060708090a0b0c0d0e0f";
const SBK: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

/// A T30 BCT with one bootable bootloader.
fn sample_bct() -> Bct {
    let mut bct = Bct::init(CHIP_ID_T30, None).unwrap();
    bct.set_u32(DataType::BootDeviceBlockSizeLog2, 0, 14).unwrap();
    bct.set_u32(DataType::BootDevicePageSizeLog2, 0, 9).unwrap();
    bct.set_u32(DataType::NumEnabledBootLoaders, 0, 1).unwrap();
    bct.set_u32(DataType::BootLoaderAttribute, 0, 4).unwrap();
    bct.set_u32(DataType::BootLoaderStartBlock, 0, 20).unwrap();
    bct.set_u32(DataType::BootLoaderLength, 0, 2048).unwrap();
    bct.set_u32(DataType::BootLoaderLoadAddress, 0, 0x0010_8000).unwrap();
    bct.set_u32(DataType::BootLoaderEntryPoint, 0, 0x0010_8000).unwrap();
    bct.set_bytes(DataType::BootLoaderCryptoHash, 0, &[0xab; 16]).unwrap();
    bct.set_u32(DataType::OdmOption, 0, 0xdead_beef).unwrap();
    bct
}

fn read_bct(path: &std::path::Path) -> Bct {
    Bct::init(CHIP_ID_T30, Some(std::fs::read(path).unwrap())).unwrap()
}

/// Dump a BCT with one bootloader.
#[test]
fn dump_bct() {
    let file = create_file(sample_bct().as_bytes());
    let output = test(["dump", "-i", file.path().to_str().unwrap()]);
    assert_eq!(output.exit_code, ExitCode(0));

    // Prints the chip and size.
    assert!(output.stdout.contains("0x30"));
    assert!(output.stdout.contains("(6128)"));
    // Prints the ODM option.
    assert!(output.stdout.contains("0xdeadbeef"));
    // Prints the block and page size.
    assert!(output.stdout.contains("16 KiB (log2 14)"));
    assert!(output.stdout.contains("512 B (log2 9)"));
    // Prints the bootloader record.
    assert!(output.stdout.contains("1 enabled"));
    assert!(output.stdout.contains("partition 4, block 20 page 0, 2 KiB"));
    assert!(output.stdout.contains("load 0x00108000"));
    assert!(output.stdout.contains(&"ab".repeat(16)));
    // An unsigned BCT has no valid signature.
    assert!(output.stdout.contains("(invalid)"));
    assert!(output.stderr.is_empty());
}

/// Dump reports a signature that matches the key.
#[test]
fn dump_signed_bct() {
    let mut image = sample_bct().into_bytes();
    let signature = sign(&SBK, &image[16..]);
    image[..16].copy_from_slice(&signature);
    let file = create_file(&image);

    let output = test(["dump", "-i", file.path().to_str().unwrap(), "--sbk", SBK_HEX]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.contains(&hex::encode(signature)));
    assert!(output.stdout.contains("(valid)"));

    let output = test(["dump", "-i", file.path().to_str().unwrap()]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.contains("(invalid)"));
}

/// Dump an AP20 BCT, with the chip taken from the config file.
#[test]
fn dump_chip_from_config() {
    let config = create_file(b"chip_id = 0x20\n");
    let file = create_file(Bct::init(CHIP_ID_AP20, None).unwrap().as_bytes());
    let output = test([
        "dump",
        "-c",
        config.path().to_str().unwrap(),
        "-i",
        file.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.contains("(4080)"));
    assert!(output.stdout.contains("0 enabled"));
}

/// A file shorter than a BCT is refused.
#[test]
fn dump_short_file() {
    let file = create_file(b"Hello, world!");
    let output = test(["dump", "-i", file.path().to_str().unwrap()]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stdout.is_empty());
    assert!(output
        .stderr
        .contains("buffer too small: need 6128 bytes, got 13"));
}

#[test]
fn get_field() {
    let file = create_file(sample_bct().as_bytes());
    let output = test([
        "get",
        "-i",
        file.path().to_str().unwrap(),
        "--field",
        "odmoption",
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert_eq!(output.stdout, "efbeadde\n");

    let output = test([
        "get",
        "-i",
        file.path().to_str().unwrap(),
        "--field",
        "BootLoaderCryptoHash",
        "--instance",
        "1",
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert_eq!(output.stdout, format!("{}\n", "00".repeat(16)));
}

#[test]
fn get_errors() {
    let file = create_file(sample_bct().as_bytes());
    let output = test(["get", "-i", file.path().to_str().unwrap(), "--field", "Colour"]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains(r#"unknown BCT field: "Colour""#));

    let output = test([
        "get",
        "-i",
        file.path().to_str().unwrap(),
        "--field",
        "BootLoaderLength",
        "--instance",
        "4",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("instance 4 out of range"));
}

/// Set numbers and bytes into a new output file.
#[test]
fn set_fields() {
    let input = create_file(sample_bct().as_bytes());
    let output_file = tempfile::NamedTempFile::new().unwrap();
    let output = test([
        "set",
        "-i",
        input.path().to_str().unwrap(),
        "--field",
        "BootLoaderLoadAddress",
        "--instance",
        "0",
        "--value",
        "0x40008000",
        "-o",
        output_file.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.is_empty());
    let bct = read_bct(output_file.path());
    assert_eq!(bct.get_u32(DataType::BootLoaderLoadAddress, 0), Ok(0x4000_8000));
    // Everything else is unchanged, including the input.
    assert_eq!(bct.get_u32(DataType::OdmOption, 0), Ok(0xdead_beef));
    assert_eq!(
        read_bct(input.path()).get_u32(DataType::BootLoaderLoadAddress, 0),
        Ok(0x0010_8000)
    );

    let output = test([
        "set",
        "-i",
        input.path().to_str().unwrap(),
        "--field",
        "BctPartitionId",
        "--value",
        "2",
        "-o",
        output_file.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert_eq!(read_bct(output_file.path()).get_u8(DataType::BctPartitionId, 0), Ok(2));

    let hash = "00112233445566778899aabbccddeeff";
    let output = test([
        "set",
        "-i",
        input.path().to_str().unwrap(),
        "--field",
        "BootLoaderCryptoHash",
        "--instance",
        "2",
        "--value",
        hash,
        "-o",
        output_file.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert_eq!(
        read_bct(output_file.path()).get_bytes(DataType::BootLoaderCryptoHash, 2),
        Ok(hex::decode(hash).unwrap())
    );
}

#[test]
fn set_in_place() {
    let file = create_file(sample_bct().as_bytes());
    let output = test([
        "set",
        "-i",
        file.path().to_str().unwrap(),
        "--field",
        "OdmOption",
        "--value",
        "7",
        "--in-place",
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert_eq!(read_bct(file.path()).get_u32(DataType::OdmOption, 0), Ok(7));
}

#[test]
fn set_errors() {
    let file = create_file(sample_bct().as_bytes());
    let path = file.path().to_str().unwrap();
    let output_file = tempfile::NamedTempFile::new().unwrap();
    let output_path = output_file.path().to_str().unwrap();

    let output = test([
        "set", "-i", path, "--field", "OdmOption", "--value", "1", "--in-place", "-o",
        output_path,
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("cannot specify both --in-place and --output (-o)"));

    let output = test(["set", "-i", path, "--field", "OdmOption", "--value", "1"]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("specify either --in-place or --output (-o)"));

    let output = test([
        "set", "-i", path, "--field", "Version", "--value", "1", "-o", output_path,
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("Version is read only"));

    let output = test([
        "set", "-i", path, "--field", "EnableFailback", "--value", "300", "-o", output_path,
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("300 does not fit"));

    let output = test([
        "set", "-i", path, "--field", "BootLoaderCryptoHash", "--value", "5", "-o", output_path,
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("give it as hex bytes"));

    let output = test([
        "set", "-i", path, "--field", "OdmOption", "--value", "xyz", "-o", output_path,
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains(r#"invalid value: "xyz""#));

    // The input is untouched by all of this.
    assert_eq!(read_bct(file.path()).as_bytes(), sample_bct().as_bytes());
}

/// Sign without encryption, with the zero key.
#[test]
fn sign_plain() {
    let file = create_file(sample_bct().as_bytes());
    let output = test(["sign", "-i", file.path().to_str().unwrap(), "--in-place"]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.is_empty());

    let signed = std::fs::read(file.path()).unwrap();
    assert_eq!(signed[..16], sign(&ZERO_KEY, &signed[16..]));
    assert_eq!(signed[16..], sample_bct().as_bytes()[16..]);
}

/// Sign and encrypt with the key from the config file. A device with the key
/// recovers the original.
#[test]
fn sign_encrypted_with_key_from_config() {
    let input = create_file(sample_bct().as_bytes());
    let output_file = tempfile::NamedTempFile::new().unwrap();
    let config = create_file(format!("sbk = \"{SBK_HEX}\"\n").as_bytes());
    let output = test([
        "sign",
        "-c",
        config.path().to_str().unwrap(),
        "-i",
        input.path().to_str().unwrap(),
        "--encrypt",
        "-o",
        output_file.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));

    let sealed = std::fs::read(output_file.path()).unwrap();
    assert_ne!(sealed[16..], sample_bct().as_bytes()[16..]);
    let mut receiver =
        BctReceiver::new(sealed.len(), &SBK, BctPolicy::Authenticate { decrypt: true });
    receiver.feed(&sealed).unwrap();
    let verified = receiver.finish().unwrap();
    assert_eq!(verified.as_bytes()[16..], sample_bct().as_bytes()[16..]);
}

#[test]
fn sign_errors() {
    let file = create_file(sample_bct().as_bytes());
    let path = file.path().to_str().unwrap();

    let output = test(["sign", "-i", path, "--encrypt", "--in-place"]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("encrypting requires a secure boot key"));

    let output = test(["sign", "-i", path, "--sbk", "0011", "--in-place"]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("secure boot key of 2 bytes, expected 16"));

    let output = test(["sign", "-i", path, "--sbk", "not hex", "--in-place"]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("invalid secure boot key hex"));

    assert_eq!(read_bct(file.path()).as_bytes(), sample_bct().as_bytes());
}

/// Anything given both in the config file and on the command line is refused.
#[test]
fn config_and_cli_conflicts() {
    let file = create_file(sample_bct().as_bytes());
    let path = file.path().to_str().unwrap();
    let config = create_file(format!("chip_id = 0x30\nsbk = \"{SBK_HEX}\"\n").as_bytes());
    let config_path = config.path().to_str().unwrap();

    let output = test(["sign", "-c", config_path, "-i", path, "--sbk", SBK_HEX, "--in-place"]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("secure boot key specified in both config and cli"));

    let output = test(["dump", "-c", config_path, "--chip", "0x30", "-i", path]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("chip id specified in both config and cli"));

    let output = test(["dump", "--chip", "0x40", "-i", path]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("unsupported chip id 0x40"));
}

#[test]
fn config_errors() {
    let file = create_file(sample_bct().as_bytes());
    let path = file.path().to_str().unwrap();

    let config = create_file(b"chip_id = [");
    let output = test(["dump", "-c", config.path().to_str().unwrap(), "-i", path]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("config file format error in TOML"));

    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.toml");
    let output = test(["dump", "-c", missing.to_str().unwrap(), "-i", path]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("failed to read config file"));
}

/// Clap reports usage errors itself.
#[test]
fn missing_subcommand() {
    let output = test([]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stdout.is_empty());
    assert!(output.stderr.contains("Usage"));
}

fn test<const N: usize>(args: [&str; N]) -> Output {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let exit_code = crate::main_args(
        std::iter::once("bcttool").chain(args),
        &mut stdout,
        &mut stderr,
    );
    println!("* args: {:?}", args);
    println!("* exit_code: {:?}", exit_code);
    println!("* stdout:\n{}", String::from_utf8_lossy(&stdout));
    println!("* stderr:\n{}", String::from_utf8_lossy(&stderr));
    Output {
        exit_code,
        stdout: String::from_utf8(stdout).unwrap(),
        stderr: String::from_utf8(stderr).unwrap(),
    }
}

#[derive(Debug)]
struct Output {
    exit_code: ExitCode,
    stdout: String,
    stderr: String,
}

fn create_file(data: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(data).unwrap();
    file
}
