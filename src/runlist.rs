// Sources:
// - https://flatcap.github.io/linux-ntfs/ntfs/concepts/data_runs.html
// - https://github.com/libyal/libfsntfs/blob/main/documentation/New%20Technologies%20File%20System%20(NTFS).asciidoc

//! Data runs (mapping pairs) of non-resident attributes.
//!
//! Every entry starts with a header byte: low nibble = size of the cluster
//! count, high nibble = size of the cluster offset. The offset is a signed
//! delta against the previous run's LCN. A header byte of 0 ends the list.

use serde::{Deserialize, Serialize};

use crate::VolumeGeometry;
use crate::error::{Result, ScanError};

/// One decoded mapping pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct DataRun {
    pub cluster_count: u64,
    /// Signed delta to the previous run, `None` for a sparse run.
    pub cluster_offset: Option<i64>,
}

impl DataRun {
    pub fn is_sparse(&self) -> bool {
        self.cluster_offset.is_none()
    }
}

/// A contiguous byte range on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

/// Split a run header into (offset field length, count field length).
/// `Ok(None)` marks the end of the list.
pub fn parse_run_header(header: u8) -> Result<Option<(usize, usize)>> {
    if header == 0 {
        return Ok(None);
    }
    let offset_len = (header >> 4) as usize;
    let count_len = (header & 0x0F) as usize;
    if offset_len > 8 || count_len > 8 {
        return Err(ScanError::MalformedDataRun(format!(
            "header byte 0x{:02X} has a field wider than 8 bytes",
            header
        )));
    }
    Ok(Some((offset_len, count_len)))
}

/// Little-endian unsigned integer of up to 8 bytes.
pub fn read_unsigned_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

/// Little-endian two's-complement integer of up to 8 bytes, sign-extended.
pub fn read_signed_le(bytes: &[u8]) -> i64 {
    let raw = read_unsigned_le(bytes);
    match bytes.last() {
        Some(msb) if msb & 0x80 != 0 && bytes.len() < 8 => {
            (raw | (!0u64 << (bytes.len() * 8))) as i64
        }
        _ => raw as i64,
    }
}

/// Lazily walks a raw mapping-pairs array.
#[derive(Debug, Clone)]
pub struct DataRunIter<'a> {
    raw: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> DataRunIter<'a> {
    pub fn new(raw: &'a [u8]) -> Self {
        Self {
            raw,
            pos: 0,
            done: false,
        }
    }

    fn decode_next(&mut self) -> Result<Option<DataRun>> {
        // Running off the end without a terminator is tolerated.
        let Some(&header) = self.raw.get(self.pos) else {
            return Ok(None);
        };
        let Some((offset_len, count_len)) = parse_run_header(header)? else {
            return Ok(None);
        };
        let count_start = self.pos + 1;
        let offset_start = count_start + count_len;
        let end = offset_start + offset_len;
        if end > self.raw.len() {
            return Err(ScanError::MalformedDataRun(format!(
                "run at byte {} needs {} bytes, only {} left",
                self.pos,
                end - self.pos,
                self.raw.len() - self.pos
            )));
        }
        let cluster_count = read_unsigned_le(&self.raw[count_start..offset_start]);
        let cluster_offset = (offset_len > 0).then(|| read_signed_le(&self.raw[offset_start..end]));
        self.pos = end;
        Ok(Some(DataRun {
            cluster_count,
            cluster_offset,
        }))
    }
}

impl Iterator for DataRunIter<'_> {
    type Item = Result<DataRun>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.decode_next() {
            Ok(Some(run)) => Some(Ok(run)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Decode every run of a mapping-pairs array.
pub fn decode_run_list(raw: &[u8]) -> Result<Vec<DataRun>> {
    DataRunIter::new(raw).collect()
}

/// Decode only the first run.
pub fn decode_first_run(raw: &[u8]) -> Result<Option<DataRun>> {
    DataRunIter::new(raw).next().transpose()
}

/// Turn decoded runs into absolute device extents by accumulating the
/// offset deltas. Sparse runs occupy no disk space and are left out.
pub fn resolve_extents(runs: &[DataRun], geometry: &VolumeGeometry) -> Result<Vec<Extent>> {
    let mut lcn: i64 = 0;
    let mut extents = Vec::with_capacity(runs.len());
    for run in runs {
        let Some(delta) = run.cluster_offset else {
            continue;
        };
        lcn = lcn
            .checked_add(delta)
            .filter(|l| *l >= 0)
            .ok_or_else(|| {
                ScanError::MalformedDataRun(format!(
                    "cluster position {} + {} is invalid",
                    lcn, delta
                ))
            })?;
        extents.push(Extent {
            offset: geometry.cluster_to_offset(lcn as u64),
            length: run.cluster_count.saturating_mul(geometry.cluster_size),
        });
    }
    Ok(extents)
}

/// Smallest number of bytes holding `value` as a two's-complement integer.
fn signed_width(value: i64) -> usize {
    (1..=8)
        .find(|n| {
            let bits = n * 8;
            bits == 64 || (value >= -(1i64 << (bits - 1)) && value < (1i64 << (bits - 1)))
        })
        .unwrap_or(8)
}

fn unsigned_width(value: u64) -> usize {
    (1..=8).find(|n| *n == 8 || value < (1u64 << (n * 8))).unwrap_or(8)
}

/// Encode one mapping pair. `None` widths pick the smallest field that fits.
/// Used to build synthetic $DATA attributes and images.
pub fn encode_data_run(
    cluster_count: u64,
    cluster_offset: Option<i64>,
    count_len: Option<usize>,
    offset_len: Option<usize>,
) -> Vec<u8> {
    let count_len = count_len.unwrap_or_else(|| unsigned_width(cluster_count)).min(8);
    let offset_len = match cluster_offset {
        Some(off) => offset_len.unwrap_or_else(|| signed_width(off)).min(8),
        None => 0,
    };
    let mut out = Vec::with_capacity(1 + count_len + offset_len);
    out.push(((offset_len as u8) << 4) | count_len as u8);
    out.extend_from_slice(&cluster_count.to_le_bytes()[..count_len]);
    if let Some(off) = cluster_offset {
        out.extend_from_slice(&off.to_le_bytes()[..offset_len]);
    }
    out
}
