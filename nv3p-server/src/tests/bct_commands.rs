// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use super::*;
use crate::crypto::{seal_bct, Key, ZERO_KEY};
use nv3p_protocol::BctSection;

const SBK: Key = *b"secure-boot-key!";
const BCT_LEN: u32 = 6128;

/// A BCT image with the given ODM option.
fn image_with_option(options: u32) -> Vec<u8> {
    let mut bct = blank_bct();
    bct.set_u32(DataType::OdmOption, 0, options).unwrap();
    bct.into_bytes()
}

fn download(image: &[u8]) -> ScriptTransport {
    ScriptTransport::default()
        .command(Command::DownloadBct {
            length: image.len() as u32,
        })
        .data(image)
}

#[test]
fn get_bct_sends_the_live_bct() {
    let session = run(ScriptTransport::default().command(Command::GetBct));
    assert_eq!(
        session.events(),
        [
            Event::Complete(Response::Bct { length: BCT_LEN }),
            Event::Sent(blank_bct().into_bytes()),
            Event::Status(StatusCode::Ok),
        ]
    );
}

/// A BCT of the wrong size is refused before any data is taken.
#[test]
fn download_bct_checks_length() {
    let script = ScriptTransport::default().command(Command::DownloadBct { length: 100 });
    let session = run(script);
    assert_eq!(
        session.events(),
        [
            Event::Nack(NackCode::BadData),
            Event::Status(StatusCode::InvalidState),
        ]
    );
    assert_eq!(session.received(), 0);
}

/// Non-secure parts take the BCT as sent.
#[test]
fn download_bct_replaces_the_live_bct() {
    let image = image_with_option(0x1234);
    let session = run(download(&image));
    assert_eq!(
        session.events(),
        [
            Event::Complete(Response::None),
            Event::Data(BCT_LEN as usize),
            Event::Status(StatusCode::Ok),
        ]
    );
    assert_eq!(session.server.bct().get_u32(DataType::OdmOption, 0), Ok(0x1234));
}

/// Secure parts only take a BCT encrypted and signed with their key.
#[test]
fn secure_download_bct() {
    let mut sealed = image_with_option(0x77);
    seal_bct(&mut sealed, &SBK, true).unwrap();

    let session = run_with(download(&sealed), storage(), platform().with_secure_boot_key(SBK));
    assert_eq!(session.last_status(), StatusCode::Ok);
    assert_eq!(session.server.bct().get_u32(DataType::OdmOption, 0), Ok(0x77));

    let mut tampered = sealed.clone();
    tampered[100] ^= 1;
    let session = run_with(download(&tampered), storage(), platform().with_secure_boot_key(SBK));
    assert_eq!(session.last_status(), StatusCode::BlValidationFailure);
    assert_eq!(session.server.bct().as_bytes(), blank_bct().as_bytes());

    // Signed with the wrong key.
    let mut foreign = image_with_option(0x77);
    seal_bct(&mut foreign, &ZERO_KEY, true).unwrap();
    let session = run_with(download(&foreign), storage(), platform().with_secure_boot_key(SBK));
    assert_eq!(session.last_status(), StatusCode::BlValidationFailure);
}

/// The live record takes the hash of the signed record with the same load
/// address.
#[test]
fn set_bl_hash() {
    let mut live = blank_bct();
    live.set_u32(DataType::BootLoaderAttribute, 0, EBT_ID).unwrap();
    live.set_u32(DataType::BootLoaderLoadAddress, 0, AOS_ENTRY_POINT).unwrap();
    let mut platform = platform();
    platform.live_bct = Some(live.into_bytes());

    let mut signed = blank_bct();
    signed.set_u32(DataType::BootLoaderLoadAddress, 1, AOS_ENTRY_POINT).unwrap();
    signed.set_bytes(DataType::BootLoaderCryptoHash, 1, &[0xab; 16]).unwrap();
    let mut signed = signed.into_bytes();
    seal_bct(&mut signed, &ZERO_KEY, false).unwrap();

    let command = Command::SetBlHash {
        length: BCT_LEN,
        bl_index: EBT_ID,
    };
    let script = ScriptTransport::default().command(command.clone()).data(&signed);
    let session = run_with(script, storage(), platform.clone());
    assert_eq!(session.last_status(), StatusCode::Ok);
    assert_eq!(
        session.server.bct().get_bytes(DataType::BootLoaderCryptoHash, 0),
        Ok(vec![0xab; 16])
    );

    let mut unsigned = signed.clone();
    unsigned[0] ^= 1;
    let script = ScriptTransport::default().command(command).data(&unsigned);
    let session = run_with(script, storage(), platform.clone());
    assert_eq!(session.last_status(), StatusCode::BlValidationFailure);
    assert_eq!(
        session.server.bct().get_bytes(DataType::BootLoaderCryptoHash, 0),
        Ok(vec![0; 16])
    );

    // No live record for the partition.
    let script = ScriptTransport::default()
        .command(Command::SetBlHash {
            length: BCT_LEN,
            bl_index: APP_ID,
        })
        .data(&signed);
    let session = run_with(script, storage(), platform);
    assert_eq!(session.last_status(), StatusCode::InvalidBct);
}

/// Only the fields of the named section are copied.
#[test]
fn update_bct_copies_one_section() {
    let mut source = blank_bct();
    source.set_u32(DataType::BootDeviceBlockSizeLog2, 0, 15).unwrap();
    source.set_u32(DataType::BootDevicePageSizeLog2, 0, 11).unwrap();
    source.set_u32(DataType::PartitionSize, 0, 0x1000).unwrap();
    source.set_u32(DataType::OdmOption, 0, 99).unwrap();
    let source = source.into_bytes();

    let script = ScriptTransport::default()
        .command(Command::UpdateBct {
            length: BCT_LEN,
            section: BctSection::BootDevInfo,
        })
        .data(&source)
        .command(Command::UpdateBct {
            length: 16,
            section: BctSection::Sdram,
        });
    let session = run(script);

    assert_eq!(
        session.statuses(),
        [StatusCode::Ok, StatusCode::InvalidState]
    );
    let bct = session.server.bct();
    assert_eq!(bct.get_u32(DataType::BootDeviceBlockSizeLog2, 0), Ok(15));
    assert_eq!(bct.get_u32(DataType::BootDevicePageSizeLog2, 0), Ok(11));
    assert_eq!(bct.get_u32(DataType::PartitionSize, 0), Ok(0x1000));
    assert_eq!(bct.get_u32(DataType::OdmOption, 0), Ok(0));
}

#[test]
fn odm_options() {
    let session = run(ScriptTransport::default().command(Command::OdmOptions { options: 0xabc }));
    assert_eq!(
        session.events(),
        [Event::Complete(Response::None), Event::Status(StatusCode::Ok)]
    );
    assert_eq!(session.server.bct().get_u32(DataType::OdmOption, 0), Ok(0xabc));
}

/// Private data lands in the BCT written by the next sync.
#[test]
fn private_data_is_written_on_sync() {
    let image = pattern(1024);
    let script = flash_table(ScriptTransport::default())
        .command(Command::NvPrivData { length: 0 })
        .command(Command::NvPrivData { length: 3 })
        .data(&[9, 8, 7])
        .command(Command::DownloadPartition {
            id: EBT_ID,
            length: image.len() as u64,
        })
        .data(&image)
        .command(Command::Sync)
        .command(Command::Go);
    let session = run(script);

    assert!(session.result.is_ok());
    assert_eq!(
        session.statuses()[TABLE_COMMANDS..],
        [
            StatusCode::BadParameter,
            StatusCode::Ok,
            StatusCode::Ok,
            StatusCode::Ok,
            StatusCode::Ok,
        ]
    );
    let written = session.server.storage().file_contents(BCT_ID).unwrap();
    let written = Bct::init(CHIP_ID_T30, Some(written)).unwrap();
    let mut expected = vec![0; 16];
    expected[..3].copy_from_slice(&[9, 8, 7]);
    assert_eq!(written.get_bytes(DataType::InternalInfoOneTimeRaw, 0), Ok(expected));
}
