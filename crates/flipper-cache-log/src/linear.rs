use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::format::{
    read_u32, read_u64, record_checksum, LogHeader, LINEAR_LOG_HEADER_SIZE, RECORD_COUNT_OFFSET,
    RECORD_HEADER_SIZE, RECORD_TRAILER_SIZE,
};
use crate::{CacheLogError, DiscardReason, OpenOutcome};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// An append-only key/blob log.
///
/// The header's record count is rewritten after every append, so a file cut short on a record
/// boundary is detected the same way as one cut mid-record.
#[derive(Debug)]
pub struct LinearLog {
    path: PathBuf,
    file: File,
    header: LogHeader,
    end: u64,
    record_count: u64,
}

#[derive(Debug)]
pub struct OpenedLinearLog {
    pub log: LinearLog,
    pub records: Vec<LogRecord>,
    pub outcome: OpenOutcome,
}

impl LinearLog {
    /// Opens (or creates) the log at `path` and returns every record it holds.
    ///
    /// Only I/O failures are errors. A file that does not match `header` or fails validation is
    /// truncated to an empty log and reported as [`OpenOutcome::Discarded`].
    pub fn open(path: impl Into<PathBuf>, header: LogHeader) -> Result<OpenedLinearLog, CacheLogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let existing = match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        let Some(bytes) = existing else {
            let log = Self::create_empty(path, header)?;
            info!(path = %log.path.display(), "created shader cache log");
            return Ok(OpenedLinearLog {
                log,
                records: Vec::new(),
                outcome: OpenOutcome::Created,
            });
        };

        match parse_records(&bytes, &header) {
            Ok(records) => {
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                let log = Self {
                    path,
                    file,
                    header,
                    end: bytes.len() as u64,
                    record_count: records.len() as u64,
                };
                Ok(OpenedLinearLog {
                    log,
                    outcome: OpenOutcome::Loaded {
                        records: records.len(),
                    },
                    records,
                })
            }
            Err(reason) => {
                warn!(path = %path.display(), %reason, "discarding shader cache log");
                let log = Self::create_empty(path, header)?;
                Ok(OpenedLinearLog {
                    log,
                    records: Vec::new(),
                    outcome: OpenOutcome::Discarded(reason),
                })
            }
        }
    }

    fn create_empty(path: PathBuf, header: LogHeader) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&header.encode(0))?;
        Ok(Self {
            path,
            file,
            header,
            end: LINEAR_LOG_HEADER_SIZE as u64,
            record_count: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<(), CacheLogError> {
        let key_len = u32::try_from(key.len()).map_err(|_| oversized())?;
        let value_len = u32::try_from(value.len()).map_err(|_| oversized())?;

        let mut buf =
            Vec::with_capacity(RECORD_HEADER_SIZE + key.len() + value.len() + RECORD_TRAILER_SIZE);
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(&value_len.to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        buf.extend_from_slice(&record_checksum(key, value).to_le_bytes());

        self.file.seek(SeekFrom::Start(self.end))?;
        self.file.write_all(&buf)?;
        self.end += buf.len() as u64;
        self.record_count += 1;

        self.file.seek(SeekFrom::Start(RECORD_COUNT_OFFSET))?;
        self.file.write_all(&self.record_count.to_le_bytes())?;
        Ok(())
    }

    /// Drops every record, leaving a valid empty log behind.
    pub fn discard(&mut self, reason: DiscardReason) -> Result<(), CacheLogError> {
        warn!(path = %self.path.display(), %reason, "discarding shader cache log");
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode(0))?;
        self.end = LINEAR_LOG_HEADER_SIZE as u64;
        self.record_count = 0;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), CacheLogError> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

fn oversized() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "cache record exceeds 4 GiB")
}

fn parse_records(bytes: &[u8], header: &LogHeader) -> Result<Vec<LogRecord>, DiscardReason> {
    let declared = header.check(bytes)?;

    let mut records = Vec::new();
    let mut offset = LINEAR_LOG_HEADER_SIZE;
    while offset < bytes.len() {
        let rest = &bytes[offset..];
        let truncated = DiscardReason::Truncated {
            offset: offset as u64,
        };
        if rest.len() < RECORD_HEADER_SIZE {
            return Err(truncated);
        }

        // Lengths are untrusted; validate against the remaining bytes before slicing.
        let key_len = read_u32(rest, 0) as usize;
        let value_len = read_u32(rest, 4) as usize;
        let record_len = key_len
            .checked_add(value_len)
            .and_then(|n| n.checked_add(RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE))
            .ok_or(truncated)?;
        if rest.len() < record_len {
            return Err(truncated);
        }

        let key = &rest[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + key_len];
        let value = &rest[RECORD_HEADER_SIZE + key_len..RECORD_HEADER_SIZE + key_len + value_len];
        let checksum = read_u64(rest, RECORD_HEADER_SIZE + key_len + value_len);
        if checksum != record_checksum(key, value) {
            return Err(DiscardReason::ChecksumMismatch {
                offset: offset as u64,
            });
        }

        records.push(LogRecord {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        offset += record_len;
    }

    if records.len() as u64 != declared {
        return Err(DiscardReason::CountMismatch {
            declared,
            found: records.len() as u64,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn header() -> LogHeader {
        LogHeader::new(1, [0x11; 32])
    }

    #[test]
    fn reopen_replays_appended_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vk-specialized-ps.cache");

        let opened = LinearLog::open(&path, header()).unwrap();
        assert_eq!(opened.outcome, OpenOutcome::Created);
        let mut log = opened.log;
        log.append(b"key-a", b"blob-a").unwrap();
        log.append(b"key-b", b"").unwrap();
        drop(log);

        let reopened = LinearLog::open(&path, header()).unwrap();
        assert_eq!(reopened.outcome, OpenOutcome::Loaded { records: 2 });
        assert_eq!(
            reopened.records,
            vec![
                LogRecord {
                    key: b"key-a".to_vec(),
                    value: b"blob-a".to_vec(),
                },
                LogRecord {
                    key: b"key-b".to_vec(),
                    value: Vec::new(),
                },
            ]
        );
        assert_eq!(reopened.log.record_count(), 2);
    }

    #[test]
    fn appends_after_reopen_keep_the_count_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.cache");

        let mut log = LinearLog::open(&path, header()).unwrap().log;
        log.append(b"a", b"1").unwrap();
        drop(log);

        let mut log = LinearLog::open(&path, header()).unwrap().log;
        log.append(b"b", b"2").unwrap();
        drop(log);

        let reopened = LinearLog::open(&path, header()).unwrap();
        assert_eq!(reopened.outcome, OpenOutcome::Loaded { records: 2 });
    }

    #[test]
    fn truncation_on_a_record_boundary_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.cache");

        let mut log = LinearLog::open(&path, header()).unwrap().log;
        log.append(b"a", b"1").unwrap();
        let boundary = log.end;
        log.append(b"b", b"2").unwrap();
        drop(log);

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..boundary as usize]).unwrap();

        let reopened = LinearLog::open(&path, header()).unwrap();
        assert_eq!(
            reopened.outcome,
            OpenOutcome::Discarded(DiscardReason::CountMismatch {
                declared: 2,
                found: 1
            })
        );
        assert!(reopened.records.is_empty());
    }

    #[test]
    fn discard_leaves_a_valid_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.cache");

        let mut log = LinearLog::open(&path, header()).unwrap().log;
        log.append(b"a", b"1").unwrap();
        log.discard(DiscardReason::Rejected).unwrap();
        log.append(b"c", b"3").unwrap();
        drop(log);

        let reopened = LinearLog::open(&path, header()).unwrap();
        assert_eq!(reopened.outcome, OpenOutcome::Loaded { records: 1 });
        assert_eq!(reopened.records[0].key, b"c".to_vec());
    }
}
