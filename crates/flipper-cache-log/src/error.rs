use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheLogError {
    #[error("cache log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why an existing log file was thrown away instead of replayed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DiscardReason {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported container version {found} (expected {expected})")]
    FormatVersion { found: u32, expected: u32 },
    #[error("schema version {found} does not match {expected}")]
    SchemaVersion { found: u32, expected: u32 },
    #[error("host fingerprint does not match the active configuration")]
    FingerprintMismatch,
    #[error("record size {found} does not match {expected}")]
    RecordSizeMismatch { found: u32, expected: u32 },
    #[error("file truncated at byte {offset}")]
    Truncated { offset: u64 },
    #[error("checksum mismatch in record at byte {offset}")]
    ChecksumMismatch { offset: u64 },
    #[error("header declares {declared} records but {found} are present")]
    CountMismatch { declared: u64, found: u64 },
    #[error("a replayed record could not be reconstructed")]
    Rejected,
}
