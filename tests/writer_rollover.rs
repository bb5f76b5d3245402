use jlog::admin::{index_report, IndexReport};
use jlog::header::HEADER_SIZE;
use jlog::{Error, Log, LogConfig, LogId, Safety};
use tempfile::tempdir;

#[test]
fn appends_without_rollover_are_strictly_increasing() {
    let dir = tempdir().expect("tempdir");
    let log = Log::create(dir.path().join("events"), LogConfig::default()).expect("create");
    let mut writer = log.writer().expect("writer");

    let ids: Vec<LogId> = (0..100u32)
        .map(|i| writer.append(&i.to_le_bytes()).expect("append"))
        .collect();
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(ids.last().copied(), Some(LogId::new(0, 100)));
    assert_eq!(
        index_report(&log, 0),
        IndexReport::Details {
            messages: 100,
            closed: false
        }
    );
}

#[test]
fn size_limit_rolls_to_next_segment_with_marker_reset() {
    let dir = tempdir().expect("tempdir");
    let config = LogConfig {
        unit_limit: 100,
        ..LogConfig::default()
    };
    let log = Log::create(dir.path(), config).expect("create");
    let mut writer = log.writer().expect("writer");

    let payload = vec![b'x'; 64 - HEADER_SIZE];
    assert_eq!(writer.append(&payload).expect("append"), LogId::new(0, 1));
    assert_eq!(writer.append(&payload).expect("append"), LogId::new(0, 2));
    // 128 bytes written, past the 100 byte limit.
    assert_eq!(writer.append(&payload).expect("append"), LogId::new(1, 1));
    assert_eq!(writer.append(&payload).expect("append"), LogId::new(1, 2));
    assert_eq!(writer.append(&payload).expect("append"), LogId::new(2, 1));

    assert_eq!(log.segments().expect("segments"), vec![0, 1, 2]);
    assert_eq!(log.stat(0).expect("stat"), 128);
    assert_eq!(
        index_report(&log, 1),
        IndexReport::Details {
            messages: 2,
            closed: true
        }
    );
    assert_eq!(log.first_log_id().expect("first"), LogId::new(0, 1));
    assert_eq!(log.last_log_id().expect("last"), LogId::new(2, 1));
    assert_eq!(log.raw_size().expect("raw size"), 5 * 64);
}

#[test]
fn reaching_the_size_limit_exactly_rolls() {
    let dir = tempdir().expect("tempdir");
    let config = LogConfig {
        unit_limit: 128,
        ..LogConfig::default()
    };
    let log = Log::create(dir.path(), config).expect("create");
    let mut writer = log.writer().expect("writer");

    let payload = vec![b'x'; 64 - HEADER_SIZE];
    assert_eq!(writer.append(&payload).expect("append"), LogId::new(0, 1));
    assert_eq!(writer.append(&payload).expect("append"), LogId::new(0, 2));
    assert_eq!(log.stat(0).expect("stat"), 128);
    assert_eq!(writer.append(&payload).expect("append"), LogId::new(1, 1));
    assert_eq!(log.stat(0).expect("stat"), 128);
}

#[test]
fn oversized_message_still_gets_its_own_segment() {
    let dir = tempdir().expect("tempdir");
    let config = LogConfig {
        unit_limit: 32,
        ..LogConfig::default()
    };
    let log = Log::create(dir.path(), config).expect("create");
    let mut writer = log.writer().expect("writer");
    let big = vec![7u8; 1024];
    assert_eq!(writer.append(&big).expect("append"), LogId::new(0, 1));
    assert_eq!(writer.append(&big).expect("append"), LogId::new(1, 1));
    assert_eq!(log.read_message(LogId::new(1, 1)).expect("read").payload, big);
}

#[test]
fn reopened_writer_continues_where_it_left_off() {
    let dir = tempdir().expect("tempdir");
    let config = LogConfig {
        max_messages: Some(3),
        safety: Safety::Safe,
        ..LogConfig::default()
    };
    let log = Log::create(dir.path(), config).expect("create");
    {
        let mut writer = log.writer().expect("writer");
        for _ in 0..4 {
            writer.append(b"m").expect("append");
        }
        writer.flush().expect("flush");
    }

    let mut writer = log.writer().expect("reopen");
    assert_eq!(writer.last_log_id().expect("last"), LogId::new(1, 1));
    assert_eq!(writer.append(b"m").expect("append"), LogId::new(1, 2));
    assert_eq!(writer.meta().config, config);
}

#[test]
fn writer_on_rolled_empty_segment_reports_previous_last() {
    let dir = tempdir().expect("tempdir");
    let log = Log::create(dir.path(), LogConfig::default()).expect("create");
    {
        let mut writer = log.writer().expect("writer");
        writer.append(b"only").expect("append");
        writer.roll().expect("roll");
    }
    let writer = log.writer().expect("reopen");
    assert_eq!(writer.segment(), 1);
    assert_eq!(writer.last_log_id().expect("last"), LogId::new(0, 1));
    assert_eq!(log.last_log_id().expect("last"), LogId::new(0, 1));
}

#[test]
fn writer_requires_an_existing_log() {
    let dir = tempdir().expect("tempdir");
    let missing = dir.path().join("missing");
    std::fs::create_dir_all(&missing).expect("mkdir");
    assert!(matches!(
        jlog::LogWriter::open(&missing),
        Err(Error::NotALog(_))
    ));
    assert!(!missing.join("writer.lock").exists());
}
