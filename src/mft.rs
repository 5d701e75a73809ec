// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://flatcap.github.io/linux-ntfs/ntfs/concepts/file_record.html
// - https://flatcap.github.io/linux-ntfs/ntfs/concepts/attribute_header.html

use chrono::{TimeZone, Utc};
use log::{debug, trace, warn};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::VolumeGeometry;
use crate::error::{Result, ScanError};
use crate::reader::ByteView;
use crate::runlist::{Extent, decode_first_run, decode_run_list, resolve_extents};

pub const FILE_SIGNATURE: [u8; 4] = *b"FILE";
pub const END_OF_ATTRIBUTES: u32 = 0xFFFF_FFFF;
pub const ROOT_DIRECTORY_ID: u64 = 5;

pub const RECORD_IN_USE: u16 = 0x0001;
pub const RECORD_IS_DIRECTORY: u16 = 0x0002;

const ATTR_FLAG_COMPRESSED: u16 = 0x0001;
const ATTR_FLAG_SPARSE: u16 = 0x8000;
const NAMESPACE_DOS: u8 = 2;
const SECTOR_SIZE: usize = 512;

/// Header found at the very beginning of every **FILE** record (offset 0).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FileRecordHeader {
    pub signature: [u8; 4],
    pub usa_offset: u16,
    pub usa_count: u16,
    pub lsn: u64,
    pub sequence_number: u16,
    pub hard_link_count: u16,
    pub attrs_offset: u16,
    pub flags: u16,
    pub bytes_in_use: u32,
    pub bytes_allocated: u32,
    pub base_file_record: u64,
    pub next_attr_id: u16,
    pub record_number: u32,
}

impl FileRecordHeader {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let v = ByteView::new(buf);
        let signature = v.array::<4>(0)?;
        if signature != FILE_SIGNATURE {
            return Err(ScanError::BadRecordSignature);
        }
        Ok(Self {
            signature,
            usa_offset: v.u16_at(4)?,
            usa_count: v.u16_at(6)?,
            lsn: v.u64_at(8)?,
            sequence_number: v.u16_at(16)?,
            hard_link_count: v.u16_at(18)?,
            attrs_offset: v.u16_at(20)?,
            flags: v.u16_at(22)?,
            bytes_in_use: v.u32_at(24)?,
            bytes_allocated: v.u32_at(28)?,
            base_file_record: v.u64_at(32)?,
            next_attr_id: v.u16_at(40)?,
            record_number: v.u32_at(44)?,
        })
    }
}

pub fn has_file_signature(buf: &[u8]) -> bool {
    buf.len() >= 4 && buf[0..4] == FILE_SIGNATURE
}

// At the end of every 512-byte sector NTFS overwrites the last two bytes with the Update-Sequence Number (USN).
// The whole array is verified before anything is patched.
pub fn apply_fixups(buf: &mut [u8], usa_offset: usize, usa_count: usize) -> Result<()> {
    if usa_count < 2 {
        return Ok(());
    }
    if usa_offset + 2 * usa_count > buf.len() {
        return Err(ScanError::FixupVerificationFailed(
            "USA table outside record".into(),
        ));
    }
    let usn = [buf[usa_offset], buf[usa_offset + 1]];
    for i in 1..usa_count {
        let sector_end = i * SECTOR_SIZE - 2;
        if sector_end + 2 > buf.len() {
            return Err(ScanError::FixupVerificationFailed(format!(
                "sector {} ends after record",
                i
            )));
        }
        if buf[sector_end..sector_end + 2] != usn {
            return Err(ScanError::FixupVerificationFailed(format!(
                "bad USN at sector {}",
                i
            )));
        }
    }
    for i in 1..usa_count {
        let sector_end = i * SECTOR_SIZE - 2;
        let fix_pos = usa_offset + 2 * i;
        buf[sector_end] = buf[fix_pos];
        buf[sector_end + 1] = buf[fix_pos + 1];
    }
    Ok(())
}

/// The attribute types this scanner decodes; everything else is stepped over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum AttributeKind {
    StandardInformation,
    FileName,
    Data,
    Other(u32),
}

impl From<u32> for AttributeKind {
    fn from(value: u32) -> Self {
        match value {
            0x10 => AttributeKind::StandardInformation,
            0x30 => AttributeKind::FileName,
            0x80 => AttributeKind::Data,
            other => AttributeKind::Other(other),
        }
    }
}

/// Common header part for resident & non-resident attributes.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct AttributeHeader {
    pub kind: AttributeKind,
    pub type_code: u32,
    pub length: u32,
    pub non_resident: bool,
    pub name_length: u8,
    pub name_offset: u16,
    pub flags: u16,
    pub id: u16,
}

impl AttributeHeader {
    pub fn parse(attr: ByteView<'_>) -> Result<Self> {
        let type_code = attr.u32_at(0)?;
        Ok(Self {
            kind: AttributeKind::from(type_code),
            type_code,
            length: attr.u32_at(4)?,
            non_resident: attr.u8_at(8)? != 0,
            name_length: attr.u8_at(9)?,
            name_offset: attr.u16_at(10)?,
            flags: attr.u16_at(12)?,
            id: attr.u16_at(14)?,
        })
    }
}

fn is_end_marker(type_code: u32) -> bool {
    type_code == END_OF_ATTRIBUTES || type_code & 0xFFFF == 0xFFFF
}

/// Steps through the attribute stream of one record, yielding
/// `(offset within record, attribute bytes)`.
#[derive(Debug, Clone)]
pub struct AttributeWalk<'a> {
    record: ByteView<'a>,
    cursor: usize,
    done: bool,
}

impl<'a> AttributeWalk<'a> {
    pub fn new(record: &'a [u8], first_attribute: usize) -> Self {
        Self {
            record: ByteView::new(record),
            cursor: first_attribute,
            done: false,
        }
    }
}

impl<'a> Iterator for AttributeWalk<'a> {
    type Item = (usize, ByteView<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.done = true;
        let type_code = self.record.u32_at(self.cursor).ok()?;
        if is_end_marker(type_code) {
            return None;
        }
        let length = self.record.u32_at(self.cursor + 4).ok()? as usize;
        if length == 0 {
            debug!("Zero-length attribute at 0x{:X}, stopping walk", self.cursor);
            return None;
        }
        let Ok(body) = self.record.view(self.cursor, length) else {
            debug!(
                "Attribute at 0x{:X} claims {} bytes past the record end",
                self.cursor, length
            );
            return None;
        };
        let at = self.cursor;
        self.cursor += length;
        self.done = false;
        Some((at, body))
    }
}

/// How `$FILE_NAME` UTF-16 units become a `String`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum NameDecoding {
    /// Drop every zero byte and map the rest to Latin-1 (exact for ASCII names).
    #[default]
    ZeroStripped,
    /// Full UTF-16, invalid sequences replaced.
    Utf16,
}

pub fn decode_name(raw: &[u8], decoding: NameDecoding) -> String {
    match decoding {
        NameDecoding::ZeroStripped => raw
            .iter()
            .filter(|b| **b != 0)
            .map(|b| char::from(*b))
            .collect(),
        NameDecoding::Utf16 => String::from_utf16_lossy(
            &raw.chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .collect::<Vec<_>>(),
        ),
    }
}

/// Everything the attribute decoders need besides the bytes.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext {
    pub geometry: VolumeGeometry,
    pub name_decoding: NameDecoding,
    pub full_data_runs: bool,
}

/// Timestamps and permissions from `$STANDARD_INFORMATION`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StandardInformation {
    pub created: u64,
    pub modified: u64,
    pub mft_modified: u64,
    pub accessed: u64,
    pub permissions: u32,
    pub owner_id: u32,
}

pub fn decode_standard_information(attr: ByteView<'_>) -> Result<StandardInformation> {
    let value = attr.u16_at(20)? as usize;
    Ok(StandardInformation {
        created: attr.u64_at(value)?,
        modified: attr.u64_at(value + 8)?,
        mft_modified: attr.u64_at(value + 16)?,
        accessed: attr.u64_at(value + 24)?,
        permissions: attr.u32_at(value + 32)?,
        // NTFS 1.2 records stop before the owner id.
        owner_id: attr.u32_at(value + 48).unwrap_or(0),
    })
}

/// Name and parent from `$FILE_NAME`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FileNameInfo {
    pub parent_id: u64,
    pub parent_sequence: u16,
    pub namespace: u8,
    pub name: String,
}

pub fn decode_file_name(attr: ByteView<'_>, decoding: NameDecoding) -> Result<FileNameInfo> {
    let value = attr.u16_at(20)? as usize;
    let name_len = attr.u8_at(value + 64)? as usize;
    Ok(FileNameInfo {
        parent_id: attr.uint_at(value, 6)?,
        parent_sequence: attr.u16_at(value + 6)?,
        namespace: attr.u8_at(value + 65)?,
        name: decode_name(attr.slice(value + 66, name_len * 2)?, decoding),
    })
}

/// Where the unnamed `$DATA` stream lives on the device.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DataLocation {
    pub resident: bool,
    pub offset: u64,
    pub length: u64,
    pub extents: Vec<Extent>,
}

pub fn decode_data(
    attr: ByteView<'_>,
    header: &AttributeHeader,
    cursor: usize,
    record_offset: u64,
    ctx: &ParseContext,
) -> Result<DataLocation> {
    if !header.non_resident {
        let length = attr.u32_at(16)? as u64;
        let value = attr.u16_at(20)? as u64;
        // Resident content sits inside the MFT record itself.
        return Ok(DataLocation {
            resident: true,
            offset: record_offset + cursor as u64 + value,
            length,
            extents: Vec::new(),
        });
    }

    let length = attr.u64_at(48)?;
    let runs_offset = attr.u16_at(32)? as usize;
    if runs_offset + 1 >= attr.len() {
        debug!("Exceptional case where $DATA is empty, ignoring this entry");
        return Ok(DataLocation::default());
    }
    if header.flags & (ATTR_FLAG_COMPRESSED | ATTR_FLAG_SPARSE) != 0 {
        debug!(
            "Compressed or sparse $DATA (flags 0x{:04X}) left unresolved",
            header.flags
        );
        return Ok(DataLocation {
            resident: false,
            offset: 0,
            length,
            extents: Vec::new(),
        });
    }

    let runs = &attr.bytes()[runs_offset..];
    let offset = match decode_first_run(runs)? {
        Some(run) => match run.cluster_offset {
            Some(lcn) if lcn >= 0 => ctx.geometry.cluster_to_offset(lcn as u64),
            Some(lcn) => {
                return Err(ScanError::MalformedDataRun(format!(
                    "first run starts at negative cluster {}",
                    lcn
                )));
            }
            None => 0,
        },
        None => 0,
    };
    let extents = if ctx.full_data_runs {
        resolve_extents(&decode_run_list(runs)?, &ctx.geometry)?
    } else {
        Vec::new()
    };
    Ok(DataLocation {
        resident: false,
        offset,
        length,
        extents,
    })
}

/// Partial result of one attribute decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeUpdate {
    StandardInformation(StandardInformation),
    FileName(FileNameInfo),
    Data(DataLocation),
}

/// Decode one attribute according to its kind. `Ok(None)` for kinds we skip.
pub fn decode_attribute(
    attr: ByteView<'_>,
    cursor: usize,
    record_offset: u64,
    ctx: &ParseContext,
) -> Result<Option<AttributeUpdate>> {
    let header = AttributeHeader::parse(attr)?;
    trace!(
        "Attribute 0x{:X} ({:?}) at 0x{:X}, {} bytes",
        header.type_code, header.kind, cursor, header.length
    );
    Ok(match header.kind {
        AttributeKind::StandardInformation => Some(AttributeUpdate::StandardInformation(
            decode_standard_information(attr)?,
        )),
        AttributeKind::FileName => Some(AttributeUpdate::FileName(decode_file_name(
            attr,
            ctx.name_decoding,
        )?)),
        // Named $DATA attributes are alternate streams.
        AttributeKind::Data if header.name_length == 0 => Some(AttributeUpdate::Data(
            decode_data(attr, &header, cursor, record_offset, ctx)?,
        )),
        AttributeKind::Data | AttributeKind::Other(_) => None,
    })
}

/// The inventory entry produced for every MFT record.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FileRecord {
    pub record_id: u64,
    pub parent_directory_id: u64,
    pub file_name: String,
    pub is_folder: bool,
    pub is_active: bool,
    pub created: u64,
    pub modified: u64,
    pub mft_modified: u64,
    pub last_read: u64,
    pub permission_flags: u32,
    pub owner_id: u32,
    pub content_length: u64,
    pub content_offset: u64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub content_extents: Vec<Extent>,
    pub full_path: Option<String>,
}

impl FileRecord {
    /// True for the all-default record produced from unusable buffers.
    pub fn is_zero(&self) -> bool {
        *self == FileRecord::default()
    }

    pub fn is_root_level(&self) -> bool {
        self.parent_directory_id == self.record_id
            || self.parent_directory_id == ROOT_DIRECTORY_ID
    }

    /// Full path when reconstructed, bare name otherwise.
    pub fn display_path(&self) -> &str {
        self.full_path.as_deref().unwrap_or(&self.file_name)
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{:>10} {} {} parent={:<10} offset={:<14} length={:<12} {}",
            self.record_id,
            if self.is_active { "A" } else { "D" },
            if self.is_folder { "F" } else { "-" },
            self.parent_directory_id,
            self.content_offset,
            self.content_length,
            self.display_path()
        )
    }

    pub fn to_json(&self) -> Value {
        json!({
            "record_id": self.record_id,
            "name": self.file_name,
            "full_path": self.full_path,
            "parent_id": self.parent_directory_id,
            "is_folder": self.is_folder,
            "is_active": self.is_active,
            "offset": self.content_offset,
            "length": self.content_length,
            "extents": self.content_extents,
            "created": filetime_to_datetime(self.created),
            "modified": filetime_to_datetime(self.modified),
            "mft_modified": filetime_to_datetime(self.mft_modified),
            "accessed": filetime_to_datetime(self.last_read),
            "permissions": self.permission_flags,
            "owner_id": self.owner_id,
        })
    }

    pub fn to_string(&self) -> String {
        let mut t = Table::new();
        t.add_row(row!["MFT Record", self.record_id]);
        t.add_row(row![b -> "Name", self.file_name]);
        t.add_row(row![b -> "Path", self.display_path()]);
        t.add_row(row![b -> "Parent", self.parent_directory_id]);
        t.add_row(row![b -> "State", if self.is_active { "Allocated" } else { "Deleted" }]);
        t.add_row(row![b -> "Directory", self.is_folder]);
        t.add_row(row![b -> "Offset", self.content_offset]);
        t.add_row(row![b -> "Length", self.content_length]);
        for (i, e) in self.content_extents.iter().enumerate() {
            t.add_row(row![format!("Extent {}", i), format!("{} (+{})", e.offset, e.length)]);
        }
        t.add_row(row![b -> "Created", filetime_to_datetime(self.created).unwrap_or_default()]);
        t.add_row(row![b -> "Modified", filetime_to_datetime(self.modified).unwrap_or_default()]);
        t.add_row(row![b -> "MFT Modified", filetime_to_datetime(self.mft_modified).unwrap_or_default()]);
        t.add_row(row![b -> "Accessed", filetime_to_datetime(self.last_read).unwrap_or_default()]);
        t.add_row(row![b -> "Flags", format!("0x{:08X}", self.permission_flags)]);
        t.add_row(row![b -> "Owner ID", self.owner_id]);
        t.to_string()
    }
}

/// Accumulates attribute updates into a `FileRecord`.
#[derive(Debug, Default)]
struct RecordBuilder {
    record: FileRecord,
    name_namespace: Option<u8>,
    data_seen: bool,
}

impl RecordBuilder {
    fn apply(&mut self, update: AttributeUpdate) {
        match update {
            AttributeUpdate::StandardInformation(si) => {
                self.record.created = si.created;
                self.record.modified = si.modified;
                self.record.mft_modified = si.mft_modified;
                self.record.last_read = si.accessed;
                self.record.permission_flags = si.permissions;
                self.record.owner_id = si.owner_id;
            }
            AttributeUpdate::FileName(fname) => {
                // Long names beat 8.3 aliases; otherwise the first name wins.
                let replace = match self.name_namespace {
                    None => true,
                    Some(current) => current == NAMESPACE_DOS && fname.namespace != NAMESPACE_DOS,
                };
                if replace {
                    self.name_namespace = Some(fname.namespace);
                    self.record.parent_directory_id = fname.parent_id;
                    self.record.file_name = fname.name;
                }
            }
            AttributeUpdate::Data(data) => {
                if self.data_seen {
                    return;
                }
                self.data_seen = true;
                self.record.content_offset = data.offset;
                self.record.content_length = data.length;
                self.record.content_extents = data.extents;
            }
        }
    }
}

/// Parse one raw MFT record located at absolute device offset `record_offset`.
///
/// Never fails: a buffer without the `FILE` magic yields an all-zero record,
/// and attributes that cannot be decoded are skipped.
pub fn parse_mft_record(raw: &[u8], record_offset: u64, ctx: &ParseContext) -> FileRecord {
    let header = match FileRecordHeader::from_bytes(raw) {
        Ok(h) => h,
        Err(e) => {
            trace!("Record at 0x{:X} not parsed: {}", record_offset, e);
            return FileRecord::default();
        }
    };

    let mut buf = raw.to_vec();
    if let Err(e) = apply_fixups(
        &mut buf,
        header.usa_offset as usize,
        header.usa_count as usize,
    ) {
        debug!("Record at 0x{:X}: {}, using it unpatched", record_offset, e);
    }

    let mut builder = RecordBuilder::default();
    builder.record.record_id = header.record_number as u64;
    builder.record.is_active = header.flags & RECORD_IN_USE != 0;
    builder.record.is_folder = header.flags & RECORD_IS_DIRECTORY != 0;

    for (cursor, attr) in AttributeWalk::new(&buf, header.attrs_offset as usize) {
        match decode_attribute(attr, cursor, record_offset, ctx) {
            Ok(Some(update)) => builder.apply(update),
            Ok(None) => {}
            Err(e) if e.is_recoverable() => debug!(
                "Record {}: attribute at 0x{:X} skipped: {}",
                header.record_number, cursor, e
            ),
            Err(e) => warn!(
                "Record {}: unexpected failure on attribute at 0x{:X}: {}",
                header.record_number, cursor, e
            ),
        }
    }
    builder.record
}

/// Find every extent of the MFT from the `$DATA` run list of record 0.
pub fn locate_mft_extents(raw: &[u8], geometry: &VolumeGeometry) -> Result<Vec<Extent>> {
    let header = FileRecordHeader::from_bytes(raw)?;
    let mut buf = raw.to_vec();
    if let Err(e) = apply_fixups(
        &mut buf,
        header.usa_offset as usize,
        header.usa_count as usize,
    ) {
        warn!("$MFT record: {}, using it unpatched", e);
    }

    let (cursor, attr) = AttributeWalk::new(&buf, header.attrs_offset as usize)
        .find(|(_, attr)| {
            AttributeHeader::parse(*attr).is_ok_and(|h| h.kind == AttributeKind::Data)
        })
        .ok_or_else(|| ScanError::MftDataMissing("no $DATA attribute".into()))?;
    debug!("$DATA attribute of $MFT found at record offset: {}", cursor);

    let data = AttributeHeader::parse(attr)?;
    if !data.non_resident {
        return Err(ScanError::MftDataMissing("$DATA is resident".into()));
    }
    let runs_offset = attr.u16_at(32)? as usize;
    let runs = attr
        .slice(runs_offset, attr.len().saturating_sub(runs_offset))
        .map_err(|e| ScanError::MftDataMissing(e.to_string()))?;
    let extents = decode_run_list(runs)
        .and_then(|runs| resolve_extents(&runs, geometry))
        .map_err(|e| ScanError::MftDataMissing(e.to_string()))?;
    if extents.is_empty() {
        return Err(ScanError::MftDataMissing("empty run list".into()));
    }
    Ok(extents)
}

/// Render a Windows FILETIME (100 ns ticks since 1601) as RFC 3339.
pub fn filetime_to_datetime(ft: u64) -> Option<String> {
    if ft == 0 {
        return None;
    }
    const DELTA_MICROS: i64 = 11_644_473_600_000_000;
    let unix_micros = (ft / 10) as i64 - DELTA_MICROS;
    let secs = unix_micros.div_euclid(1_000_000);
    let nanos = unix_micros.rem_euclid(1_000_000) * 1_000;
    Utc.timestamp_opt(secs, nanos as u32)
        .single()
        .map(|dt| dt.to_rfc3339())
}
