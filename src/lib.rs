// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/GUID_Partition_Table
// - http://ntfs.com/ntfs-system-files.htm

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Seek};

use error::Result;
use gpt::{GptHeader, PartitionEntry};
use mft::{NameDecoding, ParseContext, has_file_signature, locate_mft_extents, parse_mft_record};
use pbs::PartitionBootSector;
use reader::DiskReader;
use runlist::Extent;
use sink::RecordSink;

pub mod error;
pub mod gpt;
pub mod mft;
pub mod paths;
pub mod pbs;
pub mod reader;
pub mod runlist;
pub mod sink;

pub use error::ScanError;
pub use mft::FileRecord;

/// The first MFT entries are NTFS metafiles ($MFT, $MFTMirr, $LogFile, ...).
pub const RESERVED_MFT_RECORDS: u64 = 26;
pub const DEFAULT_RECORD_SIZE: usize = 1024;
pub const DEFAULT_BLOCK_SIZE: u64 = 512;

/// Coordinate system of one NTFS volume on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct VolumeGeometry {
    /// Absolute byte offset of the partition on the device.
    pub partition_offset: u64,
    pub cluster_size: u64,
}

impl VolumeGeometry {
    /// Absolute device offset of logical cluster `lcn`.
    pub fn cluster_to_offset(&self, lcn: u64) -> u64 {
        self.partition_offset
            .saturating_add(lcn.saturating_mul(self.cluster_size))
    }
}

/// Knobs for a scan; the CLI maps its flags onto this.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScanOptions {
    /// GPT logical block size.
    pub block_size: u64,
    pub record_size: usize,
    /// Records skipped at the start of the first MFT extent only.
    pub skip_records: u64,
    pub unicode_names: bool,
    /// Resolve every data run of file content, not only the first one.
    pub full_data_runs: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            record_size: DEFAULT_RECORD_SIZE,
            skip_records: RESERVED_MFT_RECORDS,
            unicode_names: false,
            full_data_runs: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScanSummary {
    pub extents: usize,
    pub records_visited: u64,
    pub records_emitted: u64,
}

/// Where the NTFS volume was found on the device.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PartitionLayout {
    pub header: GptHeader,
    pub partitions: Vec<PartitionEntry>,
    pub ntfs: PartitionEntry,
}

/// Walk the GPT and return the Windows basic data partition.
pub fn discover_partition<T: Read + Seek>(
    reader: &mut DiskReader<T>,
    block_size: u64,
) -> Result<PartitionLayout> {
    info!("Parsing GPT header");
    let header = gpt::read_gpt_header(reader, block_size)?;
    let entries_offset = header.entries_offset(block_size)?;
    info!(
        "Partition table at LBA {} (seek offset {}), {} entries of {} bytes",
        header.entries_lba,
        entries_offset,
        header.entry_count,
        header.entry_size
    );
    let partitions = gpt::read_partition_table(reader, &header, block_size)?;
    let ntfs = gpt::find_basic_data_partition(&partitions)
        .cloned()
        .ok_or(ScanError::BasicPartitionNotFound)?;
    let ntfs_offset = ntfs.byte_offset(block_size)?;
    info!("Found basic partition starting at offset: {}", ntfs_offset);
    Ok(PartitionLayout {
        header,
        partitions,
        ntfs,
    })
}

/// Scanner bound to one NTFS volume on a device.
#[derive(Debug)]
pub struct MftScanner<T: Read + Seek> {
    pub pbs: PartitionBootSector,
    pub geometry: VolumeGeometry,
    pub layout: Option<PartitionLayout>,
    options: ScanOptions,
    reader: DiskReader<T>,
    mft_extents: Option<Vec<Extent>>, // Cached from the $DATA run list of $MFT
}

impl<T: Read + Seek> MftScanner<T> {
    /// Locate the NTFS partition through the GPT and open it.
    pub fn open(body: T, options: ScanOptions) -> Result<Self> {
        let mut reader = DiskReader::new(body);
        let layout = discover_partition(&mut reader, options.block_size)?;
        let offset = layout.ntfs.byte_offset(options.block_size)?;
        let mut scanner = Self::open_reader(reader, offset, options)?;
        scanner.layout = Some(layout);
        Ok(scanner)
    }

    /// Open an NTFS volume whose partition offset is already known.
    pub fn open_at(body: T, partition_offset: u64, options: ScanOptions) -> Result<Self> {
        Self::open_reader(DiskReader::new(body), partition_offset, options)
    }

    fn open_reader(
        mut reader: DiskReader<T>,
        partition_offset: u64,
        options: ScanOptions,
    ) -> Result<Self> {
        info!("Parsing NTFS header at offset {}", partition_offset);
        let pbs = pbs::read_boot_sector(&mut reader, partition_offset)?;
        info!(
            "Validated NTFS volume: {} bytes/sector, {} sectors/cluster",
            pbs.bytes_per_sector, pbs.sectors_per_cluster
        );
        if pbs.file_record_size() != options.record_size as u64 {
            warn!(
                "Boot sector advertises {}-byte file records, scanning with {}",
                pbs.file_record_size(),
                options.record_size
            );
        }
        let geometry = VolumeGeometry {
            partition_offset,
            cluster_size: pbs.cluster_size(),
        };
        Ok(Self {
            pbs,
            geometry,
            layout: None,
            options,
            reader,
            mft_extents: None,
        })
    }

    fn parse_context(&self) -> ParseContext {
        ParseContext {
            geometry: self.geometry,
            name_decoding: if self.options.unicode_names {
                NameDecoding::Utf16
            } else {
                NameDecoding::ZeroStripped
            },
            full_data_runs: self.options.full_data_runs,
        }
    }

    /// All MFT extents, discovered from record 0 on first use.
    pub fn mft_extents(&mut self) -> Result<&[Extent]> {
        if self.mft_extents.is_none() {
            let mft_offset = self
                .pbs
                .mft_offset(self.geometry.partition_offset)
                .ok_or_else(|| {
                    ScanError::MftDataMissing(format!(
                        "$MFT cluster {} is outside the device",
                        self.pbs.mft_cluster
                    ))
                })?;
            info!("Master File Table ($MFT) found at offset {}", mft_offset);
            let record = self.reader.read_at(mft_offset, self.options.record_size)?;
            let extents = locate_mft_extents(&record, &self.geometry)?;
            info!("Found {} MFT extents", extents.len());
            self.mft_extents = Some(extents);
        } else {
            debug!("Using cached MFT extents.");
        }
        Ok(self.mft_extents.as_deref().unwrap_or_default())
    }

    /// Stream the records of one extent into `sink`, skipping `skip` leading
    /// records. Returns `(FILE records visited, records handed to the sink)`.
    pub fn iterate_extent(
        &mut self,
        extent: Extent,
        skip: u64,
        sink: &mut dyn RecordSink,
    ) -> Result<(u64, u64)> {
        let ctx = self.parse_context();
        let record_size = self.options.record_size as u64;
        let end = extent.offset.saturating_add(extent.length);
        let mut position = extent.offset.saturating_add(skip.saturating_mul(record_size));
        let mut buf = vec![0u8; self.options.record_size];
        let (mut visited, mut emitted) = (0u64, 0u64);

        while position.saturating_add(record_size) <= end {
            match self.reader.read_exact_at(position, &mut buf) {
                Ok(()) => {}
                Err(ScanError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    debug!("Device ends inside the extent at 0x{:X}", position);
                    break;
                }
                Err(e) => return Err(e),
            }
            if !has_file_signature(&buf) {
                debug!("End of populated MFT region at 0x{:X}", position);
                break;
            }
            visited += 1;
            let record = parse_mft_record(&buf, position, &ctx);
            if !record.is_zero() {
                sink.accept(record)?;
                emitted += 1;
            }
            position += record_size;
        }
        Ok((visited, emitted))
    }

    /// Run the whole pipeline: extents → records → sink.
    pub fn scan(&mut self, sink: &mut dyn RecordSink) -> Result<ScanSummary> {
        let extents = self.mft_extents()?.to_vec();
        info!("Parsing Master File Table (this can take a while)");
        let mut summary = ScanSummary {
            extents: extents.len(),
            ..Default::default()
        };
        for (index, extent) in extents.into_iter().enumerate() {
            let skip = if index == 0 { self.options.skip_records } else { 0 };
            let (visited, emitted) = self.iterate_extent(extent, skip, sink)?;
            debug!(
                "Extent {} at 0x{:X}: {} records visited",
                index, extent.offset, visited
            );
            summary.records_visited += visited;
            summary.records_emitted += emitted;
        }
        sink.finish()?;
        info!("Found {} files in the $MFT records", summary.records_visited);
        Ok(summary)
    }

    pub fn into_inner(self) -> T {
        self.reader.into_inner()
    }
}
