// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use super::*;
use crate::storage::{OpenMode, Storage, StorageError};

const SECTOR: usize = 512;

/// A BCT, a table partition and one data partition, saved to the device.
fn saved_table() -> MemStorage {
    let mut storage = storage();
    storage.create_table_start(3).unwrap();
    for request in [
        create_request(BCT_ID, "BCT", PartitionType::Bct, 4096),
        create_request(PT_ID, "PT", PartitionType::PartitionTable, 4096),
        create_request(APP_ID, "APP", PartitionType::Data, 8192),
    ] {
        storage.add_table_entry(boot_device(), &request).unwrap();
    }
    storage.create_table_finish().unwrap();
    storage.save_table(PT_ID).unwrap();
    storage
}

fn flip_byte(storage: &mut MemStorage, sector: u32, offset: usize) {
    let mut buf = vec![0; SECTOR];
    storage.read_sectors(boot_device(), sector, &mut buf).unwrap();
    buf[offset] ^= 0xff;
    storage.write_sectors(boot_device(), sector, &buf).unwrap();
}

/// Sequential partitions follow one another, absolute ones round up to a
/// sector and may not overlap.
#[test]
fn placement() {
    let mut storage = storage();
    storage.create_table_start(3).unwrap();

    let mut absolute = create_request(BCT_ID, "BCT", PartitionType::Bct, 1024);
    absolute.allocation_policy = AllocationPolicy::Absolute;
    absolute.address = 1000;
    let bct = storage.add_table_entry(boot_device(), &absolute).unwrap();
    assert_eq!(bct.start_logical_sector, 2);
    assert_eq!(bct.num_logical_sectors, 2);
    assert_eq!(bct.end_physical_sector, 3);
    assert_eq!(bct.address(), 1024);

    let mut overlapping = create_request(PT_ID, "PT", PartitionType::PartitionTable, 512);
    overlapping.allocation_policy = AllocationPolicy::Absolute;
    overlapping.address = 1536;
    assert!(matches!(
        storage.add_table_entry(boot_device(), &overlapping),
        Err(StorageError::NoSpace { requested: 512, .. })
    ));

    let pt = storage
        .add_table_entry(boot_device(), &create_request(PT_ID, "PT", PartitionType::PartitionTable, 100))
        .unwrap();
    assert_eq!(pt.start_logical_sector, 4);
    assert_eq!(pt.num_logical_sectors, 1);
    assert_eq!(pt.capacity(), 512);

    let mut rest = create_request(APP_ID, "APP", PartitionType::Data, 0);
    rest.allocation_attribute = AllocationAttribute::ALLOCATE_REMAINING;
    let app = storage.add_table_entry(boot_device(), &rest).unwrap();
    assert_eq!(app.start_logical_sector, 5);
    assert_eq!(u64::from(app.end_physical_sector) + 1, geometry().total_sectors());
    storage.create_table_finish().unwrap();
}

/// Entries are counted, unique and need a table under construction.
#[test]
fn table_building_errors() {
    let mut storage = storage();
    let request = create_request(APP_ID, "APP", PartitionType::Data, 512);
    assert_eq!(
        storage.add_table_entry(boot_device(), &request),
        Err(StorageError::NoTable)
    );
    assert_eq!(storage.create_table_finish(), Err(StorageError::NoTable));

    storage.create_table_start(2).unwrap();
    storage.add_table_entry(boot_device(), &request).unwrap();
    assert_eq!(
        storage.add_table_entry(boot_device(), &request),
        Err(StorageError::DuplicatePartition(APP_ID))
    );
    assert_eq!(
        storage.create_table_finish(),
        Err(StorageError::TableIncomplete { remaining: 1 })
    );

    let other = Device {
        kind: DeviceType::Nand,
        instance: 0,
    };
    let elsewhere = create_request(EBT_ID, "EBT", PartitionType::Bootloader, 512);
    assert_eq!(
        storage.add_table_entry(other, &elsewhere),
        Err(StorageError::NoDevice(DeviceType::Nand))
    );

    let too_big = create_request(EBT_ID, "EBT", PartitionType::Bootloader, 1 << 30);
    assert!(matches!(
        storage.add_table_entry(boot_device(), &too_big),
        Err(StorageError::NoSpace { .. })
    ));
    storage.add_table_entry(boot_device(), &elsewhere).unwrap();
    assert_eq!(
        storage.add_table_entry(boot_device(), &create_request(9, "X", PartitionType::Data, 512)),
        Err(StorageError::TableFull)
    );
    storage.create_table_finish().unwrap();
}

/// A saved table loads back after being dropped from memory.
#[test]
fn table_round_trips_through_the_device() {
    let mut storage = saved_table();
    let loaded = storage.partition(PT_ID).unwrap();
    let ids = storage.partition_ids();

    storage.unload_table();
    assert!(storage.partition_ids().is_empty());
    assert_eq!(storage.partition(PT_ID), Err(StorageError::PartitionNotFound(PT_ID)));

    storage
        .load_table(boot_device(), loaded.start_logical_sector, loaded.num_logical_sectors)
        .unwrap();
    assert_eq!(storage.partition_ids(), ids);
    assert_eq!(storage.partition(PT_ID).unwrap(), loaded);
}

/// A modified table fails authentication.
#[test]
fn tampered_table_is_rejected() {
    let mut storage = saved_table();
    let pt = storage.partition(PT_ID).unwrap();
    storage.verify_critical_partitions(boot_device()).unwrap();

    flip_byte(&mut storage, pt.start_logical_sector, 6);
    assert_eq!(
        storage.verify_critical_partitions(boot_device()),
        Err(StorageError::BadTable("signature mismatch"))
    );
    storage.unload_table();
    assert_eq!(
        storage.load_table(boot_device(), pt.start_logical_sector, pt.num_logical_sectors),
        Err(StorageError::BadTable("signature mismatch"))
    );
}

/// Files keep their size, reads stop there, writes stop at the partition end.
#[test]
fn file_access() {
    let mut storage = saved_table();
    let data = pattern(5000);

    let mut file = storage.open(APP_ID, OpenMode::Write).unwrap();
    file.write(&data[..3000]).unwrap();
    file.write(&data[3000..]).unwrap();
    assert_eq!(file.position(), 5000);
    assert!(matches!(
        file.write(&[0; 8192]),
        Err(StorageError::NoSpace { available: 8192, .. })
    ));
    file.close().unwrap();
    assert_eq!(storage.file_size(APP_ID), Ok(5000));
    assert_eq!(storage.file_contents(APP_ID).unwrap(), data);

    let mut file = storage.open(APP_ID, OpenMode::Read).unwrap();
    let mut buf = vec![0; 8192];
    assert_eq!(file.read(&mut buf), Ok(5000));
    assert_eq!(file.read(&mut buf), Ok(0));
    assert_eq!(file.write(&[1]), Err(StorageError::Device("file opened for reading")));
    file.close().unwrap();

    let mut file = storage.open(APP_ID, OpenMode::Read).unwrap();
    assert_eq!(file.read_exact(&mut buf), Err(StorageError::EndOfFile));
    file.close().unwrap();

    // Opening for writing truncates.
    storage.open(APP_ID, OpenMode::Write).unwrap().close().unwrap();
    assert_eq!(storage.file_size(APP_ID), Ok(0));

    assert_eq!(
        storage.open(99, OpenMode::Read).err(),
        Some(StorageError::PartitionNotFound(99))
    );
}

/// A write protected partition can be written once.
#[test]
fn write_protected_partition() {
    let mut storage = storage();
    let mut request = create_request(APP_ID, "APP", PartitionType::Data, 512);
    request.allocation_attribute = AllocationAttribute::WRITE_PROTECTED;
    storage.create_table_start(1).unwrap();
    storage.add_table_entry(boot_device(), &request).unwrap();
    storage.create_table_finish().unwrap();

    let mut file = storage.open(APP_ID, OpenMode::Write).unwrap();
    file.write(b"once").unwrap();
    file.close().unwrap();

    assert_eq!(
        storage.open(APP_ID, OpenMode::Write).err(),
        Some(StorageError::WriteProtected(APP_ID))
    );
    assert_eq!(storage.file_contents(APP_ID).unwrap(), b"once");

    storage.format_partition(APP_ID).unwrap();
    assert!(storage.open(APP_ID, OpenMode::Write).is_ok());
}

/// Formatting clears contents and forgets file sizes.
#[test]
fn formatting() {
    let mut storage = saved_table();
    let mut file = storage.open(APP_ID, OpenMode::Write).unwrap();
    file.write(&pattern(600)).unwrap();
    file.close().unwrap();

    storage.format_partition(APP_ID).unwrap();
    assert_eq!(storage.file_size(APP_ID), Ok(0));
    let app = storage.partition(APP_ID).unwrap();
    let data = storage.device_data(boot_device()).unwrap();
    assert!(data[app.address() as usize..][..600].iter().all(|&b| b == 0));

    storage.format_device(boot_device()).unwrap();
    assert_eq!(storage.file_size(PT_ID), Ok(0));
    assert!(storage.device_data(boot_device()).unwrap().iter().all(|&b| b == 0));
}

/// Raw access is in whole sectors within the device.
#[test]
fn sector_access() {
    let mut storage = storage();
    let data = pattern(2 * SECTOR);
    storage.write_sectors(boot_device(), 7, &data).unwrap();
    let mut buf = vec![0; 2 * SECTOR];
    storage.read_sectors(boot_device(), 7, &mut buf).unwrap();
    assert_eq!(buf, data);
    assert_eq!(&storage.device_data(boot_device()).unwrap()[7 * SECTOR..9 * SECTOR], &data[..]);

    assert_eq!(
        storage.read_sectors(boot_device(), 0, &mut [0; 100]),
        Err(StorageError::Unaligned {
            len: 100,
            sector_size: 512,
        })
    );
    let last = (geometry().total_sectors() - 1) as u32;
    assert!(storage.write_sectors(boot_device(), last, &data[..SECTOR]).is_ok());
    assert!(matches!(
        storage.write_sectors(boot_device(), last, &data),
        Err(StorageError::OutOfRange { .. })
    ));
    assert_eq!(storage.logical_to_physical(boot_device(), 12), Ok(12));
    assert!(storage.logical_to_physical(boot_device(), last + 1).is_err());
}

/// Bad blocks are reported per device.
#[test]
fn bad_blocks() {
    let mut storage = MemStorage::new();
    storage.add_device(boot_device(), geometry(), vec![3, 17]);
    assert_eq!(storage.bad_blocks(boot_device()), Ok(vec![3, 17]));
    assert_eq!(storage.device_info(boot_device()), Ok(geometry()));
    let spi = Device {
        kind: DeviceType::Spi,
        instance: 0,
    };
    assert_eq!(storage.bad_blocks(spi), Err(StorageError::NoDevice(DeviceType::Spi)));
}
