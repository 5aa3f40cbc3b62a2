//! Append-only on-disk logs backing the shader and pipeline caches.
//!
//! Two formats live here:
//! - [`LinearLog`]: variable-length key/blob records (compiled shader binaries, pipeline cache
//!   data) behind a header carrying a schema version and a host fingerprint.
//! - [`UidLog`]: fixed-size identity records, one per program identity ever requested.
//!
//! Neither format is ever repaired. A header mismatch, a short record, a checksum failure or a
//! record count that disagrees with the header causes the whole file to be truncated back to an
//! empty log, and the caller is told why through [`OpenOutcome`].
//!
//! This crate knows nothing about GPUs; keys and values are opaque bytes.

mod error;
mod format;
mod linear;
mod uid_log;

pub use error::{CacheLogError, DiscardReason};
pub use format::{
    LogHeader, LINEAR_LOG_FORMAT_VERSION, LINEAR_LOG_HEADER_SIZE, LINEAR_LOG_MAGIC,
    RECORD_HEADER_SIZE, RECORD_TRAILER_SIZE, UID_LOG_HEADER_SIZE, UID_LOG_MAGIC,
};
pub use linear::{LinearLog, LogRecord, OpenedLinearLog};
pub use uid_log::{OpenedUidLog, UidLog};

/// What happened to an existing file when a log was opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    /// No file existed; an empty log was created.
    Created,
    /// The file was valid and its records were returned.
    Loaded { records: usize },
    /// The file existed but was unusable and has been reset to an empty log.
    Discarded(DiscardReason),
}

impl OpenOutcome {
    pub fn was_discarded(&self) -> bool {
        matches!(self, Self::Discarded(_))
    }
}
