//! End-to-end scans over a synthetic GPT + NTFS image held in memory.

use exhume_mft::paths::{find_by_path, reconstruct_paths};
use exhume_mft::runlist::encode_data_run;
use exhume_mft::{FileRecord, MftScanner, ScanError, ScanOptions};
use std::io::Cursor;

const BLOCK: usize = 512;
const CLUSTER: usize = 4096;
const RECORD: usize = 1024;
const PARTITION_LBA: u64 = 64;
const PARTITION_OFFSET: usize = PARTITION_LBA as usize * BLOCK;
const MFT_LCN: usize = 4;

/// Windows basic data partition type, on-disk byte order.
const BASIC_DATA: [u8; 16] = [
    0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7,
];
/// EFI system partition type, on-disk byte order.
const EFI_SYSTEM: [u8; 16] = [
    0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B,
];

fn pad8(mut v: Vec<u8>) -> Vec<u8> {
    while v.len() % 8 != 0 {
        v.push(0);
    }
    let len = v.len() as u32;
    v[4..8].copy_from_slice(&len.to_le_bytes());
    v
}

fn resident(type_code: u32, value: &[u8]) -> Vec<u8> {
    let mut a = vec![0u8; 24];
    a[0..4].copy_from_slice(&type_code.to_le_bytes());
    a[16..20].copy_from_slice(&(value.len() as u32).to_le_bytes());
    a[20..22].copy_from_slice(&24u16.to_le_bytes());
    a.extend_from_slice(value);
    pad8(a)
}

fn non_resident(runs: &[u8], real_size: u64) -> Vec<u8> {
    let mut a = vec![0u8; 64];
    a[0..4].copy_from_slice(&0x80u32.to_le_bytes());
    a[8] = 1;
    a[32..34].copy_from_slice(&64u16.to_le_bytes());
    a[48..56].copy_from_slice(&real_size.to_le_bytes());
    a[56..64].copy_from_slice(&real_size.to_le_bytes());
    a.extend_from_slice(runs);
    a.push(0);
    pad8(a)
}

fn file_name(parent: u64, namespace: u8, name: &str) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let mut v = vec![0u8; 66];
    v[0..8].copy_from_slice(&(parent | (3u64 << 48)).to_le_bytes());
    v[64] = units.len() as u8;
    v[65] = namespace;
    for u in units {
        v.extend_from_slice(&u.to_le_bytes());
    }
    resident(0x30, &v)
}

fn record(id: u32, flags: u16, attributes: &[Vec<u8>]) -> Vec<u8> {
    let mut r = vec![0u8; RECORD];
    r[0..4].copy_from_slice(b"FILE");
    r[20..22].copy_from_slice(&0x38u16.to_le_bytes());
    r[22..24].copy_from_slice(&flags.to_le_bytes());
    r[44..48].copy_from_slice(&id.to_le_bytes());
    let mut at = 0x38;
    for a in attributes {
        r[at..at + a.len()].copy_from_slice(a);
        at += a.len();
    }
    r[at..at + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    r[24..28].copy_from_slice(&((at + 8) as u32).to_le_bytes());
    r[28..32].copy_from_slice(&(RECORD as u32).to_le_bytes());
    r
}

fn put(image: &mut [u8], offset: usize, bytes: &[u8]) {
    image[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn cluster(lcn: usize) -> usize {
    PARTITION_OFFSET + lcn * CLUSTER
}

fn gpt(image: &mut [u8], partitions: &[([u8; 16], u64, u64, &str)]) {
    let mut header = vec![0u8; BLOCK];
    header[0..8].copy_from_slice(b"EFI PART");
    header[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
    header[12..16].copy_from_slice(&92u32.to_le_bytes());
    header[24..32].copy_from_slice(&1u64.to_le_bytes());
    header[72..80].copy_from_slice(&2u64.to_le_bytes());
    header[80..84].copy_from_slice(&4u32.to_le_bytes());
    header[84..88].copy_from_slice(&128u32.to_le_bytes());
    put(image, BLOCK, &header);

    // Slot 1 stays empty so the parser has to step over a zeroed entry.
    let slots = [0usize, 2, 3];
    for (slot, (type_guid, first, last, name)) in slots.iter().zip(partitions) {
        let mut entry = vec![0u8; 128];
        entry[0..16].copy_from_slice(type_guid);
        entry[16] = 0x42 + *slot as u8;
        entry[32..40].copy_from_slice(&first.to_le_bytes());
        entry[40..48].copy_from_slice(&last.to_le_bytes());
        for (i, u) in name.encode_utf16().enumerate() {
            entry[56 + 2 * i..58 + 2 * i].copy_from_slice(&u.to_le_bytes());
        }
        put(image, 2 * BLOCK + slot * 128, &entry);
    }
}

fn boot_sector(image: &mut [u8], oem: &[u8; 8]) {
    let mut boot = vec![0u8; BLOCK];
    boot[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
    boot[3..11].copy_from_slice(oem);
    boot[0x0B..0x0D].copy_from_slice(&(BLOCK as u16).to_le_bytes());
    boot[0x0D] = (CLUSTER / BLOCK) as u8;
    boot[0x30..0x38].copy_from_slice(&(MFT_LCN as i64).to_le_bytes());
    boot[0x40] = 0xF6;
    boot[0x1FE..0x200].copy_from_slice(&[0x55, 0xAA]);
    put(image, PARTITION_OFFSET, &boot);
}

/// A fragmented MFT: 8 clusters at LCN 4, 2 at LCN 40, 1 at LCN 20.
fn mft(image: &mut [u8]) {
    let mut runs = encode_data_run(8, Some(MFT_LCN as i64), None, None);
    runs.extend(encode_data_run(2, Some(36), None, None));
    runs.extend(encode_data_run(1, Some(-20), None, None));
    let first = cluster(MFT_LCN);
    put(
        image,
        first,
        &record(0, 0x0001, &[file_name(5, 3, "$MFT"), non_resident(&runs, 11 * CLUSTER as u64)]),
    );

    // Reserved metafiles occupy slots 1..26 and are never read.
    put(image, first + 5 * RECORD, &record(5, 0x0003, &[file_name(5, 3, ".")]));

    let big_runs = encode_data_run(2, Some(50), None, None);
    let user = [
        record(26, 0x0003, &[file_name(5, 1, "docs")]),
        record(
            27,
            0x0001,
            &[file_name(26, 1, "a.txt"), resident(0x80, b"hello world!")],
        ),
        record(28, 0x0001, &[file_name(26, 1, "big.bin"), non_resident(&big_runs, 8000)]),
        record(29, 0x0000, &[file_name(5, 1, "gone.txt")]),
    ];
    for (i, r) in user.iter().enumerate() {
        put(image, first + (26 + i) * RECORD, r);
    }

    let second = cluster(40);
    put(image, second, &record(32, 0x0003, &[file_name(26, 1, "sub")]));
    put(
        image,
        second + RECORD,
        &record(
            33,
            0x0001,
            &[file_name(32, 2, "DEEP~1.TXT"), file_name(32, 1, "deep.txt")],
        ),
    );

    // The third fragment is full; the record right after it must not be read.
    let third = cluster(20);
    put(image, third, &record(40, 0x0001, &[file_name(999, 1, "orphan.txt")]));
    for i in 1..4 {
        let name = format!("n{i}.txt");
        put(
            image,
            third + i * RECORD,
            &record(40 + i as u32, 0x0001, &[file_name(5, 1, &name)]),
        );
    }
    put(image, cluster(21), &record(90, 0x0001, &[file_name(5, 1, "beyond.txt")]));

    put(image, cluster(50), b"big file payload");
}

fn build_image() -> Vec<u8> {
    let mut image = vec![0u8; PARTITION_OFFSET + 64 * CLUSTER];
    gpt(
        &mut image,
        &[
            (EFI_SYSTEM, 34, 63, "EFI system partition"),
            (BASIC_DATA, PARTITION_LBA, PARTITION_LBA + 511, "Basic data partition"),
        ],
    );
    boot_sector(&mut image, b"NTFS    ");
    mft(&mut image);
    image
}

fn scan(image: Vec<u8>) -> (Vec<FileRecord>, exhume_mft::ScanSummary) {
    let mut scanner = MftScanner::open(Cursor::new(image), ScanOptions::default()).unwrap();
    let mut records: Vec<FileRecord> = Vec::new();
    let summary = scanner.scan(&mut records).unwrap();
    reconstruct_paths(&mut records);
    (records, summary)
}

fn by_name<'a>(records: &'a [FileRecord], name: &str) -> &'a FileRecord {
    records
        .iter()
        .find(|r| r.file_name == name)
        .unwrap_or_else(|| panic!("{name} not scanned"))
}

#[test]
fn test_partition_discovery() {
    let scanner = MftScanner::open(Cursor::new(build_image()), ScanOptions::default()).unwrap();
    let layout = scanner.layout.as_ref().unwrap();
    assert_eq!(layout.partitions.len(), 2);
    assert_eq!(layout.ntfs.index, 2);
    assert_eq!(layout.ntfs.name, "Basic data partition");
    assert_eq!(scanner.geometry.partition_offset, PARTITION_OFFSET as u64);
    assert_eq!(scanner.geometry.cluster_size, CLUSTER as u64);
}

#[test]
fn test_fragmented_mft_walk() {
    let (records, summary) = scan(build_image());
    assert_eq!(summary.extents, 3);
    assert_eq!(summary.records_visited, 4 + 2 + 4);
    assert_eq!(summary.records_emitted, 10);

    let names: Vec<&str> = records.iter().map(|r| r.file_name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "docs", "a.txt", "big.bin", "gone.txt", "sub", "deep.txt", "orphan.txt", "n1.txt",
            "n2.txt", "n3.txt"
        ]
    );
    assert!(!names.contains(&"beyond.txt"));
    assert!(!names.contains(&"."));
}

#[test]
fn test_paths_and_flags() {
    let (records, _) = scan(build_image());

    let docs = by_name(&records, "docs");
    assert!(docs.is_folder);
    assert_eq!(docs.full_path.as_deref(), Some("docs"));

    assert_eq!(by_name(&records, "a.txt").full_path.as_deref(), Some("docs\\a.txt"));
    assert_eq!(
        by_name(&records, "deep.txt").full_path.as_deref(),
        Some("docs\\sub\\deep.txt")
    );
    assert_eq!(
        by_name(&records, "orphan.txt").full_path.as_deref(),
        Some("orphan.txt")
    );

    let gone = by_name(&records, "gone.txt");
    assert!(!gone.is_active);
    assert_eq!(gone.full_path.as_deref(), Some("gone.txt"));
}

#[test]
fn test_content_locations() {
    let image = build_image();
    let (records, _) = scan(image.clone());

    let small = by_name(&records, "a.txt");
    assert_eq!(small.content_length, 12);
    let at = small.content_offset as usize;
    assert_eq!(&image[at..at + 12], b"hello world!");

    let big = by_name(&records, "big.bin");
    assert_eq!(big.content_offset, cluster(50) as u64);
    assert_eq!(big.content_length, 8000);
    let at = big.content_offset as usize;
    assert_eq!(&image[at..at + 16], b"big file payload");
}

#[test]
fn test_find_by_full_path() {
    let (records, _) = scan(build_image());
    let hits = find_by_path(&records, "C:/Docs/Sub/DEEP.TXT");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record_id, 33);
    assert!(find_by_path(&records, "docs\\missing.txt").is_empty());
}

#[test]
fn test_open_at_known_offset() {
    let mut image = build_image();
    // Without a GPT the partition can still be scanned at a known offset.
    put(&mut image, BLOCK, &[0u8; BLOCK]);
    let mut scanner = MftScanner::open_at(
        Cursor::new(image),
        PARTITION_OFFSET as u64,
        ScanOptions::default(),
    )
    .unwrap();
    assert!(scanner.layout.is_none());
    let mut records: Vec<FileRecord> = Vec::new();
    let summary = scanner.scan(&mut records).unwrap();
    assert_eq!(summary.records_emitted, 10);
}

#[test]
fn test_full_data_runs_option() {
    let options = ScanOptions {
        full_data_runs: true,
        ..Default::default()
    };
    let mut scanner = MftScanner::open(Cursor::new(build_image()), options).unwrap();
    let mut records: Vec<FileRecord> = Vec::new();
    scanner.scan(&mut records).unwrap();
    let big = by_name(&records, "big.bin");
    assert_eq!(big.content_extents.len(), 1);
    assert_eq!(big.content_extents[0].offset, cluster(50) as u64);
    assert_eq!(big.content_extents[0].length, 2 * CLUSTER as u64);
}

#[test]
fn test_missing_gpt_signature() {
    let mut image = build_image();
    put(&mut image, BLOCK, b"NOT GPT!");
    let err = MftScanner::open(Cursor::new(image), ScanOptions::default()).unwrap_err();
    assert!(matches!(err, ScanError::InvalidGptSignature(_)));
}

#[test]
fn test_no_basic_data_partition() {
    let mut image = vec![0u8; PARTITION_OFFSET + 64 * CLUSTER];
    gpt(&mut image, &[(EFI_SYSTEM, 34, 63, "EFI system partition")]);
    let err = MftScanner::open(Cursor::new(image), ScanOptions::default()).unwrap_err();
    assert!(matches!(err, ScanError::BasicPartitionNotFound));
}

#[test]
fn test_wrong_oem_id() {
    let mut image = build_image();
    boot_sector(&mut image, b"EXFAT   ");
    let err = MftScanner::open(Cursor::new(image), ScanOptions::default()).unwrap_err();
    assert!(matches!(err, ScanError::InvalidOemId(_)));
}

#[test]
fn test_entry_array_lba_overflow() {
    let mut image = build_image();
    put(&mut image, BLOCK + 72, &(u64::MAX / 256).to_le_bytes());
    let err = MftScanner::open(Cursor::new(image), ScanOptions::default()).unwrap_err();
    assert!(matches!(err, ScanError::MalformedGpt(_)));
}

#[test]
fn test_partition_start_lba_overflow() {
    let mut image = vec![0u8; PARTITION_OFFSET + 64 * CLUSTER];
    gpt(
        &mut image,
        &[(BASIC_DATA, u64::MAX / 256, u64::MAX / 256, "Basic data partition")],
    );
    let err = MftScanner::open(Cursor::new(image), ScanOptions::default()).unwrap_err();
    assert!(matches!(err, ScanError::MalformedGpt(_)));
}
