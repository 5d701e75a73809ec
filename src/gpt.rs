// Sources:
// - https://uefi.org/specs/UEFI/2.10/05_GUID_Partition_Table_Format.html
// - https://learn.microsoft.com/en-us/windows/win32/api/winioctl/ns-winioctl-partition_information_gpt

use log::{debug, info};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::io::{Read, Seek};

use crate::error::{Result, ScanError};
use crate::reader::{ByteView, DiskReader};

pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
pub const GPT_HEADER_LBA: u64 = 1;
pub const MIN_ENTRY_SIZE: u32 = 128;
/// Hard cap on the partition entry array we are willing to read.
const MAX_TABLE_BYTES: u64 = 4 * 1024 * 1024;

/// Windows basic data partition: EBD0A0A2-B9E5-4433-87C0-68B6B72699C7
pub const BASIC_DATA_PARTITION: Guid = Guid([
    0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7,
]);

/// A 128-bit GUID stored as raw on-disk bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Guid(pub [u8; 16]);

impl fmt::Display for Guid {
    // First three groups are little-endian on disk, the rest big-endian.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.0;
        write!(
            f,
            "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            d[3], d[2], d[1], d[0], d[5], d[4], d[7], d[6], d[8], d[9], d[10], d[11], d[12], d[13],
            d[14], d[15]
        )
    }
}

/// GPT header found at LBA 1.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct GptHeader {
    pub signature: [u8; 8],      // 0x00 "EFI PART"
    pub revision: u32,           // 0x08
    pub header_size: u32,        // 0x0C
    pub header_crc32: u32,       // 0x10
    pub current_lba: u64,        // 0x18
    pub backup_lba: u64,         // 0x20
    pub first_usable_lba: u64,   // 0x28
    pub last_usable_lba: u64,    // 0x30
    pub disk_guid: Guid,         // 0x38
    pub entries_lba: u64,        // 0x48
    pub entry_count: u32,        // 0x50
    pub entry_size: u32,         // 0x54
    pub entries_crc32: u32,      // 0x58
}

impl GptHeader {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let v = ByteView::new(buf);
        Ok(Self {
            signature: v.array::<8>(0x00)?,
            revision: v.u32_at(0x08)?,
            header_size: v.u32_at(0x0C)?,
            header_crc32: v.u32_at(0x10)?,
            current_lba: v.u64_at(0x18)?,
            backup_lba: v.u64_at(0x20)?,
            first_usable_lba: v.u64_at(0x28)?,
            last_usable_lba: v.u64_at(0x30)?,
            disk_guid: Guid(v.array::<16>(0x38)?),
            entries_lba: v.u64_at(0x48)?,
            entry_count: v.u32_at(0x50)?,
            entry_size: v.u32_at(0x54)?,
            entries_crc32: v.u32_at(0x58)?,
        })
    }

    pub fn signature_is_valid(&self) -> bool {
        self.signature == GPT_SIGNATURE
    }

    /// Size in bytes of the partition entry array.
    pub fn table_size(&self) -> u64 {
        self.entry_count as u64 * self.entry_size as u64
    }

    /// Absolute byte offset of the partition entry array.
    pub fn entries_offset(&self, block_size: u64) -> Result<u64> {
        lba_to_offset(self.entries_lba, block_size)
    }
}

/// One populated slot of the partition entry array.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PartitionEntry {
    pub index: u32,
    pub type_guid: Guid,
    pub unique_guid: Guid,
    pub starting_lba: u64,
    pub ending_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl PartitionEntry {
    pub fn from_bytes(index: u32, buf: &[u8]) -> Result<Self> {
        let v = ByteView::new(buf);
        let name_units: Vec<u16> = v
            .slice(0x38, 72)?
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .take_while(|u| *u != 0)
            .collect();
        Ok(Self {
            index,
            type_guid: Guid(v.array::<16>(0x00)?),
            unique_guid: Guid(v.array::<16>(0x10)?),
            starting_lba: v.u64_at(0x20)?,
            ending_lba: v.u64_at(0x28)?,
            attributes: v.u64_at(0x30)?,
            name: String::from_utf16_lossy(&name_units),
        })
    }

    pub fn is_basic_data(&self) -> bool {
        self.type_guid == BASIC_DATA_PARTITION
    }

    /// Absolute byte offset of the first sector of the partition.
    pub fn byte_offset(&self, block_size: u64) -> Result<u64> {
        lba_to_offset(self.starting_lba, block_size)
    }
}

fn lba_to_offset(lba: u64, block_size: u64) -> Result<u64> {
    lba.checked_mul(block_size).ok_or_else(|| {
        ScanError::MalformedGpt(format!(
            "LBA {} with {}-byte blocks is past any device",
            lba, block_size
        ))
    })
}

/// Read and validate the GPT header stored at LBA 1.
pub fn read_gpt_header<T: Read + Seek>(
    reader: &mut DiskReader<T>,
    block_size: u64,
) -> Result<GptHeader> {
    let buf = reader.read_at(lba_to_offset(GPT_HEADER_LBA, block_size)?, block_size as usize)?;
    let header = GptHeader::from_bytes(&buf)?;
    if !header.signature_is_valid() {
        return Err(ScanError::InvalidGptSignature(header.signature));
    }
    debug!(
        "GPT header: entries at LBA {} ({} x {} bytes)",
        header.entries_lba, header.entry_count, header.entry_size
    );
    Ok(header)
}

/// Split a raw entry array into its populated partitions, preserving order.
pub fn parse_partition_table(
    buf: &[u8],
    entry_size: u32,
    entry_count: u32,
) -> Result<Vec<PartitionEntry>> {
    if entry_size < MIN_ENTRY_SIZE {
        return Err(ScanError::MalformedGpt(format!(
            "partition entry size {} is below {}",
            entry_size, MIN_ENTRY_SIZE
        )));
    }
    let table = ByteView::new(buf);
    let mut partitions = Vec::new();
    for index in 0..entry_count {
        let slot = table.view(index as usize * entry_size as usize, entry_size as usize)?;
        if slot.is_zeroed() {
            continue;
        }
        partitions.push(PartitionEntry::from_bytes(index, slot.bytes())?);
    }
    Ok(partitions)
}

/// Read the partition entry array described by `header`.
pub fn read_partition_table<T: Read + Seek>(
    reader: &mut DiskReader<T>,
    header: &GptHeader,
    block_size: u64,
) -> Result<Vec<PartitionEntry>> {
    let table_size = header.table_size();
    if table_size > MAX_TABLE_BYTES {
        return Err(ScanError::MalformedGpt(format!(
            "partition entry array of {} bytes is implausible",
            table_size
        )));
    }
    let buf = reader.read_at(header.entries_offset(block_size)?, table_size as usize)?;
    let partitions = parse_partition_table(&buf, header.entry_size, header.entry_count)?;
    info!("Number of partitions identified: {}", partitions.len());
    Ok(partitions)
}

/// First partition carrying the Windows basic data type GUID.
pub fn find_basic_data_partition(partitions: &[PartitionEntry]) -> Option<&PartitionEntry> {
    partitions.iter().find(|p| p.is_basic_data())
}

pub fn partitions_to_json(partitions: &[PartitionEntry]) -> Value {
    json!({ "partitions": partitions })
}

pub fn partitions_to_string(partitions: &[PartitionEntry]) -> String {
    let mut t = Table::new();
    t.add_row(row!["#", "Type", "Unique GUID", "First LBA", "Last LBA", "Name"]);
    for p in partitions {
        let kind = if p.is_basic_data() {
            "Basic data".to_string()
        } else {
            p.type_guid.to_string()
        };
        t.add_row(row![
            p.index,
            kind,
            p.unique_guid,
            p.starting_lba,
            p.ending_lba,
            p.name
        ]);
    }
    t.to_string()
}
