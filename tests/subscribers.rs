use jlog::admin::subscriber_reports;
use jlog::{Error, Log, LogConfig, LogId, StartPolicy};
use tempfile::tempdir;

#[test]
fn removing_an_unknown_subscriber_fails() {
    let dir = tempdir().expect("tempdir");
    let log = Log::create(dir.path(), LogConfig::default()).expect("create");
    let err = log.remove_subscriber("never-added").unwrap_err();
    assert!(matches!(err, Error::UnknownSubscriber(ref name) if name == "never-added"));
    assert_eq!(
        err.to_string(),
        "subscriber 'never-added' not found, nothing to erase"
    );
}

#[test]
fn subscriber_lifecycle_is_visible_to_every_handle() {
    let dir = tempdir().expect("tempdir");
    let log = Log::create(dir.path(), LogConfig::default()).expect("create");
    let other = Log::open(dir.path()).expect("second handle");

    log.add_subscriber("alpha", StartPolicy::Beginning)
        .expect("add alpha");
    assert!(matches!(
        other.add_subscriber("alpha", StartPolicy::Tail),
        Err(Error::DuplicateSubscriber(_))
    ));
    other
        .add_subscriber("beta", StartPolicy::Tail)
        .expect("add beta");

    let names: Vec<String> = subscriber_reports(&log)
        .expect("reports")
        .into_iter()
        .map(|report| report.name)
        .collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    other.remove_subscriber("alpha").expect("remove");
    assert!(matches!(log.checkpoint("alpha"), Err(Error::UnknownSubscriber(_))));
}

#[test]
fn start_policy_picks_initial_checkpoint() {
    let dir = tempdir().expect("tempdir");
    let log = Log::create(dir.path(), LogConfig::default()).expect("create");
    let mut writer = log.writer().expect("writer");
    for _ in 0..7 {
        writer.append(b"history").expect("append");
    }

    let begin = log
        .add_subscriber("replay", StartPolicy::Beginning)
        .expect("add replay");
    let tail = log
        .add_subscriber("live", StartPolicy::Tail)
        .expect("add live");
    assert_eq!(begin, LogId::new(0, 0));
    assert_eq!(tail, LogId::new(0, 7));
    assert!(log.read_interval("live").expect("interval").is_none());

    writer.append(b"fresh").expect("append");
    let live = log.read_interval("live").expect("interval").expect("data");
    assert_eq!(live.from, LogId::new(0, 7));
    assert_eq!(live.to, LogId::new(0, 8));
}

#[test]
fn names_that_cannot_be_files_are_rejected() {
    let dir = tempdir().expect("tempdir");
    let log = Log::create(dir.path(), LogConfig::default()).expect("create");
    for bad in ["", "../escape", "has/slash", ".hidden"] {
        assert!(matches!(
            log.add_subscriber(bad, StartPolicy::Beginning),
            Err(Error::InvalidSubscriberName(_))
        ));
    }
    assert!(log.subscribers().expect("list").is_empty());
}
