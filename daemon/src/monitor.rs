//! The supervisor: binds settings, dispatcher, event log, tracker,
//! self-observer, and workers together, and serves the operator verbs.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatch::{
    DispatchError, Dispatcher, FileTransport, TracingTransport, Transport,
};
use crate::event::{EventMask, UnknownEventName};
use crate::eventlog::{EventLog, FileEventLog, LogQuery, LogWriter};
use crate::observer::SelfObserver;
use crate::schedule::BadInterval;
use crate::settings::{Settings, SettingsError};
use crate::tracker::{FileTracker, TrackerError};
use crate::worker::{Worker, WorkerContext, WorkerError};

fn lock_or_recover<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    ExtraMask(#[from] UnknownEventName),
    #[error(transparent)]
    Observer(#[from] BadInterval),
    #[error("unknown dispatcher type: {0:?}")]
    UnknownDispatcher(String),
    #[error("no paths to monitor")]
    NoPaths,
}

/// What the shell should do with a handled command.
#[derive(Debug, PartialEq)]
pub enum CommandOutcome {
    Output(String),
    Exit,
}

pub struct Monitor {
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<FileTracker>,
    observer: Arc<SelfObserver>,
    event_log: Arc<dyn EventLog>,
    ctx: StdMutex<Option<WorkerContext>>,
    log_task: StdMutex<Option<JoinHandle<()>>>,
    workers: StdMutex<Vec<Arc<Worker>>>,
}

impl Monitor {
    pub async fn start(settings: Settings) -> Result<Arc<Monitor>, MonitorError> {
        if settings.paths.is_empty() {
            return Err(MonitorError::NoPaths);
        }

        let transport: Arc<dyn Transport> = match settings.dispatcher_type.as_str() {
            "file" => Arc::new(FileTransport::new(".")),
            "log" => Arc::new(TracingTransport),
            other => return Err(MonitorError::UnknownDispatcher(other.to_string())),
        };
        let dispatcher = Arc::new(Dispatcher::new(settings.routes()?, transport)?);

        let tracker = Arc::new(FileTracker::new(
            &settings.tracker_cachedir,
            settings.tracker_classes()?,
            settings.tracker_depth,
        )?);

        let event_log: Arc<dyn EventLog> =
            Arc::new(FileEventLog::new(&settings.log_path, &settings.aux_log_path));
        let (log_writer, log_task) = LogWriter::spawn(Arc::clone(&event_log));

        let basic = Duration::from_secs(settings.controller_basic_interval);
        let max = Duration::from_secs(settings.controller_max_interval);
        let observer = SelfObserver::new(
            Arc::clone(&dispatcher),
            settings.controller_limit_threshold,
            basic,
        );
        observer.start(basic, max)?;

        let log_mask =
            dispatcher.route_mask() | EventMask::parse(&settings.worker_extra_mask)?;
        let ctx = WorkerContext {
            dispatcher: Arc::clone(&dispatcher),
            tracker: Arc::clone(&tracker),
            observer: Arc::clone(&observer),
            log: log_writer,
            log_mask,
            hold: Duration::from_secs_f64(settings.buffer_queue_delay),
            probe_procs: settings.probe_procs,
        };

        let worker_roots: Vec<Vec<PathBuf>> = if settings.worker_every_path {
            settings.paths.iter().map(|p| vec![p.clone()]).collect()
        } else {
            vec![settings.paths.clone()]
        };
        let mut workers = Vec::with_capacity(worker_roots.len());
        for (tid, roots) in worker_roots.into_iter().enumerate() {
            workers.push(Worker::spawn(tid, roots, ctx.clone())?);
        }

        for path in &settings.paths {
            tracker.watch_dir(path).await;
        }

        info!("monitoring {} path set(s)", workers.len());
        Ok(Arc::new(Monitor {
            dispatcher,
            tracker,
            observer,
            event_log,
            ctx: StdMutex::new(Some(ctx)),
            log_task: StdMutex::new(Some(log_task)),
            workers: StdMutex::new(workers),
        }))
    }

    /// Parses and executes one operator line. Verb failures are reported
    /// in the output, never escalated.
    pub async fn handle_command(&self, line: &str) -> CommandOutcome {
        let words: Vec<&str> = line.split_whitespace().collect();
        let output = match words.split_first() {
            None => String::new(),
            Some((&"exit", _)) => return CommandOutcome::Exit,
            Some((&"checkout", rest)) => self.cmd_checkout(rest).await,
            Some((&"list", rest)) => self.cmd_list(rest),
            Some((&"clear", rest)) if rest.first() == Some(&"tracker") => {
                format!("removed {} stale entries", self.tracker.wipe().await)
            }
            Some((&"clear", _)) => "usage: clear tracker".to_string(),
            Some((&"stop", rest)) => self.cmd_stop(rest).await,
            Some((&"recover", rest)) => self.cmd_recover(rest).await,
            Some((&"watch", rest)) => self.cmd_watch(rest),
            Some((&"query", rest)) => self.cmd_query(rest),
            Some((verb, _)) => format!(
                "unknown command {verb:?}; expected one of exit, checkout, list, \
                 clear, stop, recover, watch, query"
            ),
        };
        CommandOutcome::Output(output)
    }

    async fn cmd_checkout(&self, args: &[&str]) -> String {
        let Some(path) = args.first() else {
            return "usage: checkout <path> -v <version>".to_string();
        };
        let version = match flag_value(args, "-v").map(str::parse::<i64>) {
            Some(Ok(version)) => version,
            Some(Err(_)) => return "checkout: -v expects an integer".to_string(),
            None => -1,
        };
        match self.tracker.checkout(Path::new(path), version).await {
            Ok(parsed) => serde_json::to_string_pretty(&parsed.to_value())
                .unwrap_or_else(|err| format!("checkout: {err}")),
            Err(err) => format!("checkout: {err}"),
        }
    }

    fn cmd_list(&self, args: &[&str]) -> String {
        match args.first() {
            Some(&"tracker") => {
                let entries = self.tracker.entries();
                if entries.is_empty() {
                    return "no tracked files".to_string();
                }
                entries
                    .iter()
                    .map(|e| {
                        format!("{}\t{}\tv{}\t{}", e.fid, e.path, e.version, e.format.name())
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Some(&"worker") => lock_or_recover(&self.workers)
                .iter()
                .map(|w| {
                    format!(
                        "{}\t{:?}\t{} watches\t{}",
                        w.tid,
                        w.roots(),
                        w.watch_count(),
                        if w.is_crashed() { "crashed" } else { "running" }
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
            _ => "usage: list {tracker|worker}".to_string(),
        }
    }

    async fn cmd_stop(&self, args: &[&str]) -> String {
        let Some(Ok(tid)) = flag_value(args, "-t").map(str::parse::<usize>) else {
            return "usage: stop -t <tid>".to_string();
        };
        let worker = lock_or_recover(&self.workers)
            .iter()
            .find(|w| w.tid == tid)
            .cloned();
        match worker {
            Some(worker) => {
                worker.stop().await;
                format!("worker {tid} stopped")
            }
            None => format!("no worker {tid}"),
        }
    }

    /// Respawns crashed workers and rescans running ones.
    async fn cmd_recover(&self, args: &[&str]) -> String {
        let tid_filter = match flag_value(args, "-t").map(str::parse::<usize>) {
            Some(Ok(tid)) => Some(tid),
            Some(Err(_)) => return "recover: -t expects an integer".to_string(),
            None => None,
        };
        let Some(ctx) = lock_or_recover(&self.ctx).clone() else {
            return "monitor is shutting down".to_string();
        };
        let snapshot: Vec<Arc<Worker>> = lock_or_recover(&self.workers).clone();
        let mut report = Vec::new();
        for worker in snapshot {
            if tid_filter.is_some_and(|tid| tid != worker.tid) {
                continue;
            }
            if worker.is_crashed() {
                worker.stop().await;
                match Worker::spawn(worker.tid, worker.roots(), ctx.clone()) {
                    Ok(replacement) => {
                        let mut workers = lock_or_recover(&self.workers);
                        if let Some(slot) =
                            workers.iter_mut().find(|w| w.tid == worker.tid)
                        {
                            *slot = replacement;
                        }
                        report.push(format!("worker {} respawned", worker.tid));
                    }
                    Err(err) => report.push(format!("worker {}: {err}", worker.tid)),
                }
            } else {
                match worker.rescan() {
                    Ok(()) => report.push(format!("worker {} rescanned", worker.tid)),
                    Err(err) => report.push(format!("worker {}: {err}", worker.tid)),
                }
            }
        }
        if report.is_empty() {
            "nothing to recover".to_string()
        } else {
            report.join("\n")
        }
    }

    fn cmd_watch(&self, args: &[&str]) -> String {
        let Some(Ok(tid)) = flag_value(args, "-t").map(str::parse::<usize>) else {
            return "usage: watch <paths...> -t <tid>".to_string();
        };
        let paths: Vec<PathBuf> = args
            .iter()
            .take_while(|&&word| word != "-t")
            .map(|word| PathBuf::from(*word))
            .collect();
        if paths.is_empty() {
            return "usage: watch <paths...> -t <tid>".to_string();
        }
        let worker = lock_or_recover(&self.workers)
            .iter()
            .find(|w| w.tid == tid)
            .cloned();
        match worker {
            Some(worker) => match worker.rewatch(paths) {
                Ok(()) => format!("worker {tid} re-pointed"),
                Err(err) => format!("watch: {err}"),
            },
            None => format!("no worker {tid}"),
        }
    }

    fn cmd_query(&self, args: &[&str]) -> String {
        let mut query = LogQuery::default();
        if let Some(raw) = flag_value(args, "--from_time") {
            match parse_time(raw) {
                Some(time) => query.from = Some(time),
                None => return format!("query: cannot parse time {raw:?}"),
            }
        }
        if let Some(raw) = flag_value(args, "--to_time") {
            match parse_time(raw) {
                Some(time) => query.to = Some(time),
                None => return format!("query: cannot parse time {raw:?}"),
            }
        }
        if let Some(raw) = flag_value(args, "--pattern") {
            match regex::Regex::new(raw) {
                Ok(pattern) => query.pattern = Some(pattern),
                Err(err) => return format!("query: {err}"),
            }
        }
        if let Some(raw) = flag_value(args, "--mask") {
            match parse_mask(raw) {
                Some(mask) => query.mask = Some(mask),
                None => return format!("query: cannot parse mask {raw:?}"),
            }
        }
        if let Some(raw) = flag_value(args, "--pid") {
            match raw.parse() {
                Ok(pid) => query.pid = Some(pid),
                Err(_) => return "query: --pid expects an integer".to_string(),
            }
        }
        match self.event_log.query(&query) {
            Ok(rows) if rows.is_empty() => "no matching events".to_string(),
            Ok(rows) => rows
                .iter()
                .map(|row| {
                    format!(
                        "{}\t{}\t{}\t{}\tpid {}",
                        row.unique_time,
                        EventMask(row.mask).full_name(),
                        row.src_path,
                        row.dest_path.as_deref().unwrap_or("-"),
                        row.monitor_pid
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Err(err) => format!("query: {err}"),
        }
    }

    pub async fn shutdown(&self) {
        let workers: Vec<Arc<Worker>> = lock_or_recover(&self.workers).drain(..).collect();
        futures::future::join_all(workers.iter().map(|worker| worker.stop())).await;
        drop(workers);
        self.observer.stop().await;
        self.dispatcher.shutdown().await;
        // Dropping the last writer handle lets the log task drain and end.
        lock_or_recover(&self.ctx).take();
        let log_task = lock_or_recover(&self.log_task).take();
        if let Some(task) = log_task {
            if let Err(err) = task.await {
                warn!("event-log writer ended badly: {err}");
            }
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("workers", &lock_or_recover(&self.workers).len())
            .finish()
    }
}

fn flag_value<'a>(args: &[&'a str], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|&word| word == flag)
        .and_then(|pos| args.get(pos + 1))
        .copied()
}

/// Epoch seconds (possibly fractional) or `YYYY-mm-dd HH:MM:SS`, taken as
/// UTC.
fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(epoch) = raw.parse::<f64>() {
        return DateTime::from_timestamp_micros((epoch * 1e6) as i64);
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Numeric (decimal or `0x...`) or `|`-joined symbolic event names.
fn parse_mask(raw: &str) -> Option<u64> {
    if let Some(hex) = raw.strip_prefix("0x") {
        return u64::from_str_radix(hex, 16).ok();
    }
    if let Ok(value) = raw.parse::<u64>() {
        return Some(value);
    }
    EventMask::parse(raw).ok().map(|mask| mask.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parsing() {
        let args = ["a", "-t", "3", "--pattern", ".*"];
        assert_eq!(flag_value(&args, "-t"), Some("3"));
        assert_eq!(flag_value(&args, "--pattern"), Some(".*"));
        assert_eq!(flag_value(&args, "--missing"), None);
    }

    #[test]
    fn time_and_mask_parsing() {
        assert_eq!(
            parse_time("1000.5"),
            DateTime::from_timestamp_micros(1_000_500_000)
        );
        assert!(parse_time("2024-06-01 12:00:00").is_some());
        assert!(parse_time("junk").is_none());

        assert_eq!(parse_mask("0x100"), Some(0x100));
        assert_eq!(parse_mask("256"), Some(256));
        assert_eq!(parse_mask("IN_CREATE|IN_DELETE"), Some(0x300));
        assert_eq!(parse_mask("IN_JUNK"), None);
    }
}
