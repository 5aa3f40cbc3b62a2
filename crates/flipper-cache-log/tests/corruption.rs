use std::fs;

use flipper_cache_log::{LinearLog, LogHeader, OpenOutcome, UidLog, LINEAR_LOG_HEADER_SIZE};
use proptest::prelude::*;

fn header() -> LogHeader {
    LogHeader::new(2, [0x5A; 32])
}

fn write_sample_log(path: &std::path::Path) -> Vec<u8> {
    let mut log = LinearLog::open(path, header()).unwrap().log;
    log.append(b"vs:0001", &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
    log.append(b"vs:0002", &[1; 64]).unwrap();
    log.append(b"ps:0001", b"pixel shader binary").unwrap();
    drop(log);
    fs::read(path).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn flipping_any_byte_empties_the_log(index in 0usize..4096, mask in 1u8..=255) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.cache");
        let mut bytes = write_sample_log(&path);
        let index = index % bytes.len();
        bytes[index] ^= mask;
        fs::write(&path, &bytes).unwrap();

        let opened = LinearLog::open(&path, header()).unwrap();
        prop_assert!(opened.outcome.was_discarded());
        prop_assert!(opened.records.is_empty());
    }

    #[test]
    fn truncating_anywhere_empties_the_log(cut in 0usize..4096) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.cache");
        let bytes = write_sample_log(&path);
        let cut = cut % bytes.len();
        fs::write(&path, &bytes[..cut]).unwrap();

        let opened = LinearLog::open(&path, header()).unwrap();
        prop_assert!(opened.outcome.was_discarded());
        prop_assert!(opened.records.is_empty());
    }
}

#[test]
fn discarded_log_is_reusable_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reuse.cache");
    let bytes = write_sample_log(&path);
    fs::write(&path, &bytes[..LINEAR_LOG_HEADER_SIZE + 3]).unwrap();

    let mut log = LinearLog::open(&path, header()).unwrap().log;
    log.append(b"ps:0002", b"fresh").unwrap();
    drop(log);

    let opened = LinearLog::open(&path, header()).unwrap();
    assert_eq!(opened.outcome, OpenOutcome::Loaded { records: 1 });
}

#[test]
fn linear_and_uid_logs_reject_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared-name.cache");
    write_sample_log(&path);

    let opened = UidLog::open(&path, 2, 16).unwrap();
    assert!(opened.outcome.was_discarded());
}
