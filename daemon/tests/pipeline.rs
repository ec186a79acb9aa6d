//! End-to-end pipeline tests: a real inotify worker on a tempdir, with a
//! memory transport collecting what the routes deliver.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use fswatch_daemon::dispatch::{Dispatcher, MemoryTransport, Transport};
use fswatch_daemon::eventlog::{EventLog, FileEventLog, LogQuery, LogWriter};
use fswatch_daemon::observer::SelfObserver;
use fswatch_daemon::settings::{RouteSpec, SchedulerSpec};
use fswatch_daemon::tracker::FileTracker;
use fswatch_daemon::worker::{Worker, WorkerContext};

const HOLD: Duration = Duration::from_millis(300);

struct Harness {
    dir: TempDir,
    watched: PathBuf,
    transport: Arc<MemoryTransport>,
    tracker: Arc<FileTracker>,
    log: Arc<FileEventLog>,
    worker: Arc<Worker>,
}

fn route(tag: &str, events: &str, format: &str) -> RouteSpec {
    RouteSpec {
        tag: tag.to_string(),
        pattern: ".*".to_string(),
        events: events.to_string(),
        format: format.to_string(),
        scheduler: SchedulerSpec::Direct,
        groups: Vec::new(),
    }
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let watched = dir.path().join("watched");
    fs::create_dir(&watched).unwrap();

    let transport = Arc::new(MemoryTransport::default());
    let dispatcher = Arc::new(
        Dispatcher::new(
            vec![
                route("logs", "IN_ALL_EVENTS", "{ev_name} {ev_src} {ev_dest}"),
                route("tracks", "EX_MODIFY_CONFIG", "Modified {ev_src}"),
            ],
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
        .unwrap(),
    );

    let tracker = Arc::new(
        FileTracker::new(
            &dir.path().join(".track"),
            vec![(r".*\.(ini|INI)".to_string(), "INI".to_string())],
            -1,
        )
        .unwrap(),
    );

    let log = Arc::new(FileEventLog::new(
        dir.path().join("events.jsonl"),
        dir.path().join("events.aux.jsonl"),
    ));
    let (log_writer, _log_task) = LogWriter::spawn(Arc::clone(&log) as Arc<dyn EventLog>);

    let observer = SelfObserver::new(Arc::clone(&dispatcher), 0.9, Duration::from_secs(60));

    let log_mask = dispatcher.route_mask();
    let worker = Worker::spawn(
        0,
        vec![watched.clone()],
        WorkerContext {
            dispatcher,
            tracker: Arc::clone(&tracker),
            observer,
            log: log_writer,
            log_mask,
            hold: HOLD,
            probe_procs: false,
        },
    )
    .unwrap();

    Harness {
        dir,
        watched,
        transport,
        tracker,
        log,
        worker,
    }
}

/// Polls the transport until `pred` holds; panics with what was seen.
async fn wait_for(
    transport: &MemoryTransport,
    what: &str,
    pred: impl Fn(&[(String, String)]) -> bool,
) -> Vec<(String, String)> {
    for _ in 0..120 {
        let messages = transport.messages();
        if pred(&messages) {
            return messages;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}; saw {:?}", transport.messages());
}

fn any_with(messages: &[(String, String)], needle: &str) -> bool {
    messages.iter().any(|(_, msg)| msg.contains(needle))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_is_reported_and_logged() {
    let h = harness().await;
    let file = h.watched.join("fresh.txt");
    fs::write(&file, "x").unwrap();

    wait_for(&h.transport, "IN_CREATE", |m| any_with(m, "IN_CREATE")).await;

    // The event log eventually carries the same event.
    for _ in 0..120 {
        let rows = h.log.query(&LogQuery::default()).unwrap();
        if rows.iter().any(|r| r.src_path.ends_with("fresh.txt")) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("create never reached the event log");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_within_the_tree_is_coalesced() {
    let h = harness().await;
    let old = h.watched.join("a.txt");
    fs::write(&old, "x").unwrap();
    wait_for(&h.transport, "creation", |m| any_with(m, "IN_CREATE")).await;

    fs::rename(&old, h.watched.join("b.txt")).unwrap();
    let messages = wait_for(&h.transport, "EX_RENAME", |m| any_with(m, "EX_RENAME")).await;
    let rename = messages
        .iter()
        .find(|(_, msg)| msg.contains("EX_RENAME"))
        .unwrap();
    assert!(rename.1.contains("a.txt"));
    assert!(rename.1.contains("b.txt"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn move_out_of_the_tree_becomes_delete() {
    let h = harness().await;
    let old = h.watched.join("doomed.txt");
    fs::write(&old, "x").unwrap();
    wait_for(&h.transport, "creation", |m| any_with(m, "IN_CREATE")).await;

    // Destination is outside the watched tree: no IN_MOVED_TO will pair.
    fs::rename(&old, h.dir.path().join("elsewhere.txt")).unwrap();
    let messages = wait_for(&h.transport, "IN_DELETE", |m| any_with(m, "IN_DELETE")).await;
    let deleted = messages
        .iter()
        .find(|(_, msg)| msg.contains("IN_DELETE"))
        .unwrap();
    assert!(deleted.1.contains("doomed.txt"));
    assert!(!deleted.1.contains("EX_RENAME"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn modify_burst_begins_and_ends_once() {
    let h = harness().await;
    let file = h.watched.join("burst.txt");
    fs::write(&file, "0").unwrap();
    wait_for(&h.transport, "creation", |m| any_with(m, "IN_CREATE")).await;

    for i in 0..5 {
        fs::write(&file, format!("{i}")).unwrap();
    }

    let messages = wait_for(&h.transport, "EX_END_MODIFY", |m| {
        any_with(m, "EX_BEGIN_MODIFY") && any_with(m, "EX_END_MODIFY")
    })
    .await;

    // Mid-burst markers are suppressed before dispatch: anything carrying
    // the marker must be the burst's begin.
    for (_, msg) in &messages {
        if msg.contains("EX_IN_MODIFY") {
            assert!(msg.contains("EX_BEGIN_MODIFY"), "leaked marker: {msg}");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn created_subdirectories_are_watched() {
    let h = harness().await;
    let sub = h.watched.join("deep");
    fs::create_dir(&sub).unwrap();
    wait_for(&h.transport, "mkdir", |m| any_with(m, "deep")).await;

    fs::write(sub.join("inner.txt"), "x").unwrap();
    wait_for(&h.transport, "nested create", |m| any_with(m, "inner.txt")).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rescan_keeps_events_flowing() {
    let h = harness().await;
    h.worker.rescan().unwrap();

    fs::write(h.watched.join("after.txt"), "x").unwrap();
    wait_for(&h.transport, "post-rescan create", |m| any_with(m, "after.txt")).await;
    assert!(!h.worker.is_crashed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tracked_ini_change_reaches_the_tracks_route() {
    let h = harness().await;
    let file = h.watched.join("x.ini");
    fs::write(&file, "[a]\nk = 1\n").unwrap();
    // Prime like the monitor does at startup.
    h.tracker.consider(&file).await.unwrap();

    fs::write(&file, "[a]\nk = 2\n").unwrap();
    let messages = wait_for(&h.transport, "MODIFY_CONFIG", |m| {
        m.iter().any(|(tag, _)| tag == "tracks")
    })
    .await;
    assert!(messages
        .iter()
        .any(|(tag, msg)| tag == "tracks" && msg.contains("x.ini")));

    let v0 = h.tracker.checkout(&file, 0).await.unwrap();
    assert_eq!(v0.to_value(), json!({"a": {"k": "1"}}));
    let latest = h.tracker.checkout(&file, -1).await.unwrap();
    assert_eq!(latest.to_value(), json!({"a": {"k": "2"}}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_is_clean_and_idempotent() {
    let h = harness().await;
    h.worker.stop().await;
    h.worker.stop().await;
    assert!(!h.worker.is_crashed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn monitor_serves_the_operator_verbs() {
    use fswatch_daemon::monitor::{CommandOutcome, Monitor};
    use fswatch_daemon::settings::Settings;

    let dir = tempfile::tempdir().unwrap();
    let watched = dir.path().join("watched");
    fs::create_dir(&watched).unwrap();
    let ini = watched.join("cfg.ini");
    fs::write(&ini, "[a]\nk = 1\n").unwrap();

    let settings = Settings {
        paths: vec![watched.clone()],
        tracker_cachedir: dir.path().join(".track"),
        log_path: dir.path().join("events.jsonl"),
        aux_log_path: dir.path().join("events.aux.jsonl"),
        buffer_queue_delay: 0.3,
        dispatcher_type: "log".into(),
        ..Settings::default()
    };
    let monitor = Monitor::start(settings).await.unwrap();

    let output = |outcome: CommandOutcome| match outcome {
        CommandOutcome::Output(text) => text,
        CommandOutcome::Exit => panic!("unexpected exit"),
    };

    // Startup primed the tracker on the existing file.
    let listing = output(monitor.handle_command("list tracker").await);
    assert!(listing.contains("cfg.ini"), "tracker listing: {listing}");

    let workers = output(monitor.handle_command("list worker").await);
    assert!(workers.contains("running"), "worker listing: {workers}");

    // A content change must bump the version and become checkout-able.
    fs::write(&ini, "[a]\nk = 2\n").unwrap();
    let mut listing = String::new();
    for _ in 0..120 {
        listing = output(monitor.handle_command("list tracker").await);
        if listing.contains("\tv1\t") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(listing.contains("\tv1\t"), "tracker listing: {listing}");

    let checkout = output(
        monitor
            .handle_command(&format!("checkout {} -v 0", ini.display()))
            .await,
    );
    assert!(checkout.contains("\"k\": \"1\""), "checkout: {checkout}");

    // The event log answers queries once the writer catches up.
    let mut rows = String::new();
    for _ in 0..120 {
        rows = output(monitor.handle_command("query --pattern cfg").await);
        if rows.contains("cfg.ini") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(rows.contains("cfg.ini"), "query: {rows}");

    assert!(output(monitor.handle_command("recover").await).contains("rescanned"));
    assert!(output(monitor.handle_command("bogus").await).contains("unknown command"));
    assert_eq!(monitor.handle_command("exit").await, CommandOutcome::Exit);

    monitor.shutdown().await;
}
