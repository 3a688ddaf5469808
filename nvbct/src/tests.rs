// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use super::*;
use consts::{CHIP_ID_AP20, CHIP_ID_T30};

#[test]
fn odm_option_round_trip() {
    let size = Bct::size_for(CHIP_ID_T30).unwrap();
    let image = vec![0; size];
    let mut bct = Bct::init(CHIP_ID_T30, Some(image)).unwrap();

    let written = bct
        .set_data(DataType::OdmOption, 0, &0xDEAD_BEEFu32.to_le_bytes())
        .unwrap();
    assert_eq!(written, DataSize { size: 4, instances: 1 });

    let mut buf = [0u8; 4];
    bct.get_data(DataType::OdmOption, 0, &mut buf).unwrap();
    assert_eq!(u32::from_le_bytes(buf), 0xDEAD_BEEF);
    assert_eq!(bct.get_u32(DataType::OdmOption, 0).unwrap(), 0xDEAD_BEEF);
}

#[test]
fn unknown_chip_is_not_supported() {
    assert_eq!(
        Bct::size_for(0x40),
        Err(Error::NotSupported { chip_id: 0x40 })
    );
    assert!(matches!(
        Bct::init(0x35, None),
        Err(Error::NotSupported { chip_id: 0x35 })
    ));
}

#[test]
fn blank_bct_carries_version() {
    let ap20 = Bct::init(CHIP_ID_AP20, None).unwrap();
    assert_eq!(ap20.size(), 4080);
    assert_eq!(ap20.get_u32(DataType::Version, 0).unwrap(), 0x0002_0001);

    let t30 = Bct::init(CHIP_ID_T30, None).unwrap();
    assert_eq!(t30.size(), 6128);
    assert_eq!(t30.get_u32(DataType::Version, 0).unwrap(), 0x0003_0001);
    assert_eq!(t30.get_u32(DataType::BctSize, 0).unwrap(), 6128);
    assert_eq!(t30.get_u32(DataType::HashDataOffset, 0).unwrap(), 0x10);
    assert_eq!(t30.get_u32(DataType::HashDataLength, 0).unwrap(), 6128 - 0x10);
    assert_eq!(t30.hashed_range(), 0x10..6128);
}

#[test]
fn short_image_is_rejected_and_long_image_truncated() {
    assert_eq!(
        Bct::init(CHIP_ID_AP20, Some(vec![0; 100])).unwrap_err(),
        Error::InsufficientMemory {
            needed: 4080,
            provided: 100
        }
    );

    let bct = Bct::init(CHIP_ID_AP20, Some(vec![0xa5; 5000])).unwrap();
    assert_eq!(bct.size(), 4080);
    assert_eq!(bct.as_bytes()[4079], 0xa5);
}

#[test]
fn empty_buffer_is_a_size_query() {
    for chip in [CHIP_ID_AP20, CHIP_ID_T30] {
        let mut bct = Bct::init(chip, None).unwrap();
        let before = bct.as_bytes().to_vec();
        for ty in DataType::ALL {
            let Ok(expected) = bct.data_size(ty) else {
                // Generation without this field.
                assert_eq!(bct.get_data(ty, 0, &mut []), Err(Error::UnknownDataType(ty)));
                continue;
            };
            assert_eq!(bct.get_data(ty, 0, &mut []).unwrap(), expected);
            // Instance is not checked by a size query.
            assert_eq!(bct.set_data(ty, 99, &[]).unwrap(), expected);
        }
        assert_eq!(bct.as_bytes(), &before[..]);
    }
}

#[test]
fn instance_out_of_range() {
    let mut bct = Bct::init(CHIP_ID_T30, None).unwrap();
    let size = bct.data_size(DataType::BootLoaderLoadAddress).unwrap();
    assert_eq!(size.instances, 4);

    assert_eq!(
        bct.get_u32(DataType::BootLoaderLoadAddress, 4),
        Err(Error::BadParameter {
            instance: 4,
            instances: 4
        })
    );
    assert!(bct.set_u32(DataType::BootLoaderLoadAddress, 3, 0x8000).is_ok());
    assert_eq!(bct.get_u32(DataType::BootLoaderLoadAddress, 3).unwrap(), 0x8000);
}

#[test]
fn get_ignores_extra_buffer_space() {
    let mut bct = Bct::init(CHIP_ID_AP20, None).unwrap();
    bct.set_u32(DataType::OdmOption, 0, 0x0102_0304).unwrap();
    bct.set_u8(DataType::BctPartitionId, 0, 2).unwrap();

    let mut buf = [0xffu8; 16];
    let size = bct.get_data(DataType::OdmOption, 0, &mut buf).unwrap();
    assert_eq!(size.size, 4);
    assert_eq!(&buf[..4], &[4, 3, 2, 1]);
    // Nothing past the field is written, and the neighbouring field is not read.
    assert!(buf[4..].iter().all(|&b| b == 0xff));

    let mut short = [0u8; 2];
    assert_eq!(
        bct.get_data(DataType::OdmOption, 0, &mut short),
        Err(Error::InsufficientMemory {
            needed: 4,
            provided: 2
        })
    );
}

#[test]
fn set_requires_exact_size() {
    let mut bct = Bct::init(CHIP_ID_T30, None).unwrap();
    assert_eq!(
        bct.set_data(DataType::OdmOption, 0, &[1, 2, 3, 4, 5]),
        Err(Error::InvalidSize {
            expected: 4,
            actual: 5
        })
    );
    assert_eq!(
        bct.get_u8(DataType::OdmOption, 0),
        Err(Error::InvalidSize {
            expected: 4,
            actual: 1
        })
    );
}

#[test]
fn read_only_fields_are_refused() {
    let mut bct = Bct::init(CHIP_ID_T30, None).unwrap();
    for ty in [
        DataType::Version,
        DataType::BctSize,
        DataType::HashDataOffset,
        DataType::HashDataLength,
        DataType::InternalInfoVersion,
    ] {
        assert_eq!(bct.set_u32(ty, 0, 7), Err(Error::ReadOnly(ty)));
    }
    assert_eq!(
        bct.set_bytes(DataType::Reserved, 0, &[1, 2, 3]),
        Err(Error::ReadOnly(DataType::Reserved))
    );
    assert_eq!(bct.get_u32(DataType::Version, 0).unwrap(), 0x0003_0001);
}

#[test]
fn full_contents_replaces_image() {
    let mut source = Bct::init(CHIP_ID_AP20, None).unwrap();
    source.set_u32(DataType::PartitionSize, 0, 0x0100_0000).unwrap();
    source
        .set_bytes(DataType::BootLoaderCryptoHash, 1, &[0x5a; 16])
        .unwrap();

    let mut live = Bct::init(CHIP_ID_AP20, None).unwrap();
    live.set_data(DataType::FullContents, 0, source.as_bytes())
        .unwrap();
    assert_eq!(live.get_u32(DataType::PartitionSize, 0).unwrap(), 0x0100_0000);
    assert_eq!(
        live.get_bytes(DataType::BootLoaderCryptoHash, 1).unwrap(),
        vec![0x5a; 16]
    );
}

#[test]
fn aux_info_round_trip() {
    let mut bct = Bct::init(CHIP_ID_T30, None).unwrap();
    assert_eq!(bct.aux_info().unwrap(), AuxInfo::default());

    let info = AuxInfo {
        start_logical_sector: 0x120,
        num_logical_sectors: 8,
    };
    bct.set_aux_info(info).unwrap();
    assert_eq!(bct.aux_info().unwrap(), info);
    let aligned = bct.get_bytes(DataType::AuxDataAligned, 0).unwrap();
    assert_eq!(&aligned[..4], &[0x20, 0x01, 8, 0]);
}

#[test]
fn ap20_has_no_hashed_partitions() {
    let bct = Bct::init(CHIP_ID_AP20, None).unwrap();
    assert_eq!(
        bct.data_size(DataType::HashedPartitionPartId).unwrap().instances,
        0
    );
    assert_eq!(
        bct.data_size(DataType::InternalInfoOneTimeRaw),
        Err(Error::UnknownDataType(DataType::InternalInfoOneTimeRaw))
    );
}

fn assert_layout_is_disjoint(layout: &dyn ChipLayout) {
    let mut ranges = Vec::new();
    for ty in DataType::ALL {
        let Some(field) = layout.field(ty) else {
            continue;
        };
        assert!(field.stride >= field.size, "{ty:?} instances overlap");
        for instance in 0..field.instances {
            let range = field.range(instance);
            assert!(range.end <= layout.bct_size(), "{ty:?} past the end");
            ranges.push((ty, range));
        }
    }
    ranges.sort_by_key(|(_, range)| range.start);
    for pair in ranges.windows(2) {
        let (a, ra) = &pair[0];
        let (b, rb) = &pair[1];
        assert!(ra.end <= rb.start, "{a:?} {ra:?} overlaps {b:?} {rb:?}");
    }
}

#[test]
fn layouts_are_disjoint() {
    assert_layout_is_disjoint(&Ap20);
    assert_layout_is_disjoint(&T30);
}
