// Sources:
// - https://en.wikipedia.org/wiki/NTFS
// - https://learn.microsoft.com/en-us/previous-versions/windows/it-pro/windows-2000-server/cc976796(v=technet.10)

//! NTFS partition boot sector (BPB + extended BPB).

use log::{debug, error};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::{Read, Seek};

use crate::error::{Result, ScanError};
use crate::reader::{ByteView, DiskReader};

pub const BOOT_SECTOR_SIZE: usize = 512;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PartitionBootSector {
    pub jump_instruction: [u8; 3], // 0x00
    pub oem_id: [u8; 8],           // 0x03 "NTFS    "

    /* -- BIOS Parameter Block ------------------------------ */
    pub bytes_per_sector: u16,   // 0x0B
    pub sectors_per_cluster: u8, // 0x0D
    pub reserved_sectors: u16,   // 0x0E
    pub media_descriptor: u8,    // 0x15 (0xF8 = hard disk)
    pub sectors_per_track: u16,  // 0x18
    pub number_of_heads: u16,    // 0x1A
    pub hidden_sectors: u32,     // 0x1C

    /* -- Extended BPB -------------------------------------- */
    pub total_sectors: u64,            // 0x28
    pub mft_cluster: i64,              // 0x30
    pub mft_mirror_cluster: i64,       // 0x38
    pub clusters_per_file_record: i8,  // 0x40 (negative = 2^-n bytes)
    pub clusters_per_index_buffer: i8, // 0x44
    pub volume_serial_number: u64,     // 0x48
    pub checksum: u32,                 // 0x50

    pub end_of_sector_marker: u16, // 0x1FE (0xAA55)
}

impl PartitionBootSector {
    pub const NTFS_OEM_ID: [u8; 8] = *b"NTFS    ";

    /// Parse a 512-byte boot sector. Validation is left to the caller.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let v = ByteView::new(buf);
        v.slice(0, BOOT_SECTOR_SIZE)?;
        Ok(Self {
            jump_instruction: v.array::<3>(0x00)?,
            oem_id: v.array::<8>(0x03)?,
            bytes_per_sector: v.u16_at(0x0B)?,
            sectors_per_cluster: v.u8_at(0x0D)?,
            reserved_sectors: v.u16_at(0x0E)?,
            media_descriptor: v.u8_at(0x15)?,
            sectors_per_track: v.u16_at(0x18)?,
            number_of_heads: v.u16_at(0x1A)?,
            hidden_sectors: v.u32_at(0x1C)?,
            total_sectors: v.u64_at(0x28)?,
            mft_cluster: v.i64_at(0x30)?,
            mft_mirror_cluster: v.i64_at(0x38)?,
            clusters_per_file_record: v.i8_at(0x40)?,
            clusters_per_index_buffer: v.i8_at(0x44)?,
            volume_serial_number: v.u64_at(0x48)?,
            checksum: v.u32_at(0x50)?,
            end_of_sector_marker: v.u16_at(0x1FE)?,
        })
    }

    pub fn oem_id_is_valid(&self) -> bool {
        self.oem_id == Self::NTFS_OEM_ID
    }

    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    /// Bytes per file-record segment as advertised by the BPB.
    pub fn file_record_size(&self) -> u64 {
        if self.clusters_per_file_record > 0 {
            self.clusters_per_file_record as u64 * self.cluster_size()
        } else {
            1u64 << (-(self.clusters_per_file_record as i32)).clamp(0, 31)
        }
    }

    /// Absolute device offset of MFT record 0.
    pub fn mft_offset(&self, partition_offset: u64) -> Option<u64> {
        let relative = self.mft_cluster.checked_mul(self.cluster_size() as i64)?;
        partition_offset.checked_add_signed(relative)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    pub fn to_string(&self) -> String {
        let mut t = Table::new();
        t.add_row(row!["Partition Boot Sector"]);
        t.add_row(row![b -> "OEM ID", String::from_utf8_lossy(&self.oem_id)]);
        t.add_row(row![b -> "Bytes per sector", self.bytes_per_sector]);
        t.add_row(row![b -> "Sectors per cluster", self.sectors_per_cluster]);
        t.add_row(row![b -> "Cluster size", self.cluster_size()]);
        t.add_row(row![b -> "Total sectors", self.total_sectors]);
        t.add_row(row![b -> "$MFT cluster", self.mft_cluster]);
        t.add_row(row![b -> "$MFTMirr cluster", self.mft_mirror_cluster]);
        t.add_row(row![b -> "File record size", self.file_record_size()]);
        t.add_row(row![b -> "Volume serial", format!("{:016X}", self.volume_serial_number)]);
        t.add_row(row![b -> "Marker", format!("0x{:04X}", self.end_of_sector_marker)]);
        t.to_string()
    }
}

/// Read the boot sector at `partition_offset` and make sure it is NTFS.
pub fn read_boot_sector<T: Read + Seek>(
    reader: &mut DiskReader<T>,
    partition_offset: u64,
) -> Result<PartitionBootSector> {
    let buf = reader.read_at(partition_offset, BOOT_SECTOR_SIZE)?;
    let pbs = PartitionBootSector::from_bytes(&buf)?;
    if !pbs.oem_id_is_valid() {
        error!("The OEM Identifier is not valid.");
        return Err(ScanError::InvalidOemId(
            String::from_utf8_lossy(&pbs.oem_id).into_owned(),
        ));
    }
    if pbs.cluster_size() == 0 {
        return Err(ScanError::InvalidGeometry {
            bytes_per_sector: pbs.bytes_per_sector,
            sectors_per_cluster: pbs.sectors_per_cluster,
        });
    }
    debug!(
        "NTFS boot sector: {} bytes/sector, {} sectors/cluster, $MFT at cluster {}",
        pbs.bytes_per_sector, pbs.sectors_per_cluster, pbs.mft_cluster
    );
    Ok(pbs)
}
