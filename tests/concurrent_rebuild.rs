use std::fs;
use std::thread;

use jlog::{IndexState, Log, LogConfig};
use tempfile::tempdir;

const MESSAGES: u32 = 5_000;
const READERS: usize = 4;

#[test]
fn readers_rebuilding_the_same_index_all_succeed() {
    let dir = tempdir().expect("tempdir");
    let log = Log::create(dir.path(), LogConfig::default()).expect("create");
    {
        let mut writer = log.writer().expect("writer");
        for _ in 0..MESSAGES {
            writer.append(b"payload").expect("append");
        }
        writer.roll().expect("roll");
    }
    let (_, index) = log.segment_paths(0);

    for _ in 0..20 {
        fs::remove_file(&index).expect("remove index");
        let counts: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..READERS)
                .map(|_| {
                    let log = log.clone();
                    scope.spawn(move || log.segment_len(0))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("reader thread"))
                .collect()
        });
        for count in counts {
            assert_eq!(count.expect("segment_len"), MESSAGES);
        }
        assert!(matches!(
            log.index_state(0).expect("index state"),
            IndexState::Valid(header) if header.message_count == MESSAGES && header.closed
        ));
    }

    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .expect("read_dir")
        .map(|entry| entry.expect("entry").file_name())
        .filter(|name| name.to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
}
