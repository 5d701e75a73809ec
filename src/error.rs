//! Error types for the MFT scanner.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Failed to open device '{0}': {1}")]
    DeviceOpen(String, std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid GPT signature: expected \"EFI PART\", found {0:02X?}")]
    InvalidGptSignature([u8; 8]),

    #[error("Malformed GPT: {0}")]
    MalformedGpt(String),

    #[error("No Windows basic data partition found in the GPT")]
    BasicPartitionNotFound,

    #[error("The OEM identifier {0:?} is not \"NTFS    \"")]
    InvalidOemId(String),

    #[error("Invalid cluster geometry: {bytes_per_sector} bytes/sector, {sectors_per_cluster} sectors/cluster")]
    InvalidGeometry {
        bytes_per_sector: u16,
        sectors_per_cluster: u8,
    },

    #[error("Read of {len} bytes at offset {offset} exceeds buffer of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("Record signature is not 'FILE'")]
    BadRecordSignature,

    #[error("MFT fixup verification failed: {0}")]
    FixupVerificationFailed(String),

    #[error("Data run decode error: {0}")]
    MalformedDataRun(String),

    #[error("$MFT record 0 has no usable $DATA attribute: {0}")]
    MftDataMissing(String),

    #[error("Record sink failed: {0}")]
    Sink(String),
}

pub type Result<T> = std::result::Result<T, ScanError>;

impl ScanError {
    /// Errors confined to a single record or attribute; the scan goes on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ScanError::OutOfBounds { .. }
                | ScanError::BadRecordSignature
                | ScanError::FixupVerificationFailed(_)
                | ScanError::MalformedDataRun(_)
        )
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(e: serde_json::Error) -> Self {
        ScanError::Sink(e.to_string())
    }
}
