use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::format::{encode_uid_header, read_u32, UID_LOG_HEADER_SIZE, UID_LOG_MAGIC};
use crate::{CacheLogError, DiscardReason, OpenOutcome};

/// Append-only log of fixed-size identity records.
///
/// Unlike [`crate::LinearLog`] this carries no host fingerprint: identities stay meaningful
/// across driver changes, which is the point of keeping them separately from binaries.
#[derive(Debug)]
pub struct UidLog {
    path: PathBuf,
    file: File,
    version: u32,
    record_size: usize,
    record_count: u64,
}

#[derive(Debug)]
pub struct OpenedUidLog {
    pub log: UidLog,
    pub records: Vec<Vec<u8>>,
    pub outcome: OpenOutcome,
}

impl UidLog {
    pub fn open(
        path: impl Into<PathBuf>,
        version: u32,
        record_size: usize,
    ) -> Result<OpenedUidLog, CacheLogError> {
        assert!(record_size > 0, "identity records cannot be empty");
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let log = Self::create_empty(path, version, record_size)?;
                info!(path = %log.path.display(), "created pipeline uid log");
                return Ok(OpenedUidLog {
                    log,
                    records: Vec::new(),
                    outcome: OpenOutcome::Created,
                });
            }
            Err(err) => return Err(err.into()),
        };

        match split_records(&bytes, version, record_size) {
            Ok(records) => {
                let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
                file.seek(SeekFrom::End(0))?;
                Ok(OpenedUidLog {
                    log: Self {
                        path,
                        file,
                        version,
                        record_size,
                        record_count: records.len() as u64,
                    },
                    outcome: OpenOutcome::Loaded {
                        records: records.len(),
                    },
                    records,
                })
            }
            Err(reason) => {
                warn!(path = %path.display(), %reason, "pipeline uid log is unusable, recreating");
                let log = Self::create_empty(path, version, record_size)?;
                Ok(OpenedUidLog {
                    log,
                    records: Vec::new(),
                    outcome: OpenOutcome::Discarded(reason),
                })
            }
        }
    }

    fn create_empty(path: PathBuf, version: u32, record_size: usize) -> io::Result<Self> {
        let record_size_u32 = u32::try_from(record_size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record size too large"))?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&encode_uid_header(version, record_size_u32))?;
        Ok(Self {
            path,
            file,
            version,
            record_size,
            record_count: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn append(&mut self, record: &[u8]) -> Result<(), CacheLogError> {
        assert_eq!(
            record.len(),
            self.record_size,
            "identity record has the wrong size"
        );
        self.file.write_all(record)?;
        self.record_count += 1;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), CacheLogError> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

fn split_records(
    bytes: &[u8],
    version: u32,
    record_size: usize,
) -> Result<Vec<Vec<u8>>, DiscardReason> {
    if bytes.len() < UID_LOG_HEADER_SIZE {
        return Err(DiscardReason::Truncated {
            offset: bytes.len() as u64,
        });
    }
    if read_u32(bytes, 0) != UID_LOG_MAGIC {
        return Err(DiscardReason::BadMagic);
    }
    let found_version = read_u32(bytes, 4);
    if found_version != version {
        return Err(DiscardReason::SchemaVersion {
            found: found_version,
            expected: version,
        });
    }
    let found_size = read_u32(bytes, 8);
    if found_size as usize != record_size {
        return Err(DiscardReason::RecordSizeMismatch {
            found: found_size,
            expected: record_size as u32,
        });
    }

    let body = &bytes[UID_LOG_HEADER_SIZE..];
    if body.len() % record_size != 0 {
        let whole = body.len() - body.len() % record_size;
        return Err(DiscardReason::Truncated {
            offset: (UID_LOG_HEADER_SIZE + whole) as u64,
        });
    }
    Ok(body.chunks_exact(record_size).map(<[u8]>::to_vec).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.uidcache");

        let mut log = UidLog::open(&path, 3, 4).unwrap().log;
        log.append(&[1, 2, 3, 4]).unwrap();
        log.append(&[5, 6, 7, 8]).unwrap();
        drop(log);

        let reopened = UidLog::open(&path, 3, 4).unwrap();
        assert_eq!(reopened.outcome, OpenOutcome::Loaded { records: 2 });
        assert_eq!(reopened.records, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
    }

    #[test]
    fn version_or_size_mismatch_restarts_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.uidcache");

        let mut log = UidLog::open(&path, 3, 4).unwrap().log;
        log.append(&[1, 2, 3, 4]).unwrap();
        drop(log);

        let reopened = UidLog::open(&path, 4, 4).unwrap();
        assert_eq!(
            reopened.outcome,
            OpenOutcome::Discarded(DiscardReason::SchemaVersion {
                found: 3,
                expected: 4
            })
        );
        drop(reopened);

        let reopened = UidLog::open(&path, 4, 8).unwrap();
        assert_eq!(
            reopened.outcome,
            OpenOutcome::Discarded(DiscardReason::RecordSizeMismatch {
                found: 4,
                expected: 8
            })
        );
        assert!(reopened.records.is_empty());
        assert_eq!(fs::read(&path).unwrap().len(), UID_LOG_HEADER_SIZE);
    }

    #[test]
    fn partial_trailing_record_discards_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.uidcache");

        let mut log = UidLog::open(&path, 1, 4).unwrap().log;
        log.append(&[9; 4]).unwrap();
        drop(log);

        let mut bytes = fs::read(&path).unwrap();
        bytes.push(0);
        fs::write(&path, bytes).unwrap();

        let reopened = UidLog::open(&path, 1, 4).unwrap();
        assert!(reopened.outcome.was_discarded());
        assert!(reopened.records.is_empty());
    }
}
