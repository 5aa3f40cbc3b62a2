use crate::DiscardReason;
use xxhash_rust::xxh3::Xxh3;

pub const LINEAR_LOG_MAGIC: [u8; 4] = *b"FLCL";
pub const LINEAR_LOG_FORMAT_VERSION: u32 = 1;

/// magic (4) + container version (4) + schema version (4) + record count (8) + fingerprint (32)
pub const LINEAR_LOG_HEADER_SIZE: usize = 52;
pub(crate) const RECORD_COUNT_OFFSET: u64 = 12;

/// key length (4) + value length (4)
pub const RECORD_HEADER_SIZE: usize = 8;
/// xxh3-64 over both lengths, the key and the value
pub const RECORD_TRAILER_SIZE: usize = 8;

/// "PUID" read as a little-endian u32.
pub const UID_LOG_MAGIC: u32 = 0x4449_5550;
/// magic (4) + version (4) + record size (4)
pub const UID_LOG_HEADER_SIZE: usize = 12;

/// Identity of a linear log: records written under a different schema or host fingerprint are
/// never replayed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogHeader {
    pub schema_version: u32,
    pub fingerprint: [u8; 32],
}

impl LogHeader {
    pub fn new(schema_version: u32, fingerprint: [u8; 32]) -> Self {
        Self {
            schema_version,
            fingerprint,
        }
    }

    pub(crate) fn encode(&self, record_count: u64) -> [u8; LINEAR_LOG_HEADER_SIZE] {
        let mut out = [0u8; LINEAR_LOG_HEADER_SIZE];
        out[0..4].copy_from_slice(&LINEAR_LOG_MAGIC);
        out[4..8].copy_from_slice(&LINEAR_LOG_FORMAT_VERSION.to_le_bytes());
        out[8..12].copy_from_slice(&self.schema_version.to_le_bytes());
        out[12..20].copy_from_slice(&record_count.to_le_bytes());
        out[20..52].copy_from_slice(&self.fingerprint);
        out
    }

    /// Validates a header against `self` and returns the declared record count.
    pub(crate) fn check(&self, bytes: &[u8]) -> Result<u64, DiscardReason> {
        if bytes.len() < LINEAR_LOG_HEADER_SIZE {
            return Err(DiscardReason::Truncated {
                offset: bytes.len() as u64,
            });
        }
        if bytes[0..4] != LINEAR_LOG_MAGIC {
            return Err(DiscardReason::BadMagic);
        }
        let version = read_u32(bytes, 4);
        if version != LINEAR_LOG_FORMAT_VERSION {
            return Err(DiscardReason::FormatVersion {
                found: version,
                expected: LINEAR_LOG_FORMAT_VERSION,
            });
        }
        let schema = read_u32(bytes, 8);
        if schema != self.schema_version {
            return Err(DiscardReason::SchemaVersion {
                found: schema,
                expected: self.schema_version,
            });
        }
        if bytes[20..52] != self.fingerprint {
            return Err(DiscardReason::FingerprintMismatch);
        }
        Ok(read_u64(bytes, 12))
    }
}

pub(crate) fn encode_uid_header(version: u32, record_size: u32) -> [u8; UID_LOG_HEADER_SIZE] {
    let mut out = [0u8; UID_LOG_HEADER_SIZE];
    out[0..4].copy_from_slice(&UID_LOG_MAGIC.to_le_bytes());
    out[4..8].copy_from_slice(&version.to_le_bytes());
    out[8..12].copy_from_slice(&record_size.to_le_bytes());
    out
}

pub(crate) fn record_checksum(key: &[u8], value: &[u8]) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(&(key.len() as u32).to_le_bytes());
    hasher.update(&(value.len() as u32).to_le_bytes());
    hasher.update(key);
    hasher.update(value);
    hasher.digest()
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}
