//! Append-only event log. One row per emitted event, keyed by a
//! globally-unique microsecond timestamp (a 4-digit suffix disambiguates
//! same-microsecond rows). A background writer drains a channel with a
//! bounded retry ladder; persistent failure of the primary file falls back
//! to the auxiliary sink.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::event::Event;

const MAX_RETRY: usize = 3;
const UID_DIGITS: u32 = 4;

/// A persisted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRow {
    pub unique_time: String,
    pub mask: u64,
    pub src_path: String,
    pub dest_path: Option<String>,
    pub monitor_pid: u32,
}

/// A row waiting for its unique key; the log assigns it on append.
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub micros: u64,
    pub mask: u64,
    pub src_path: String,
    pub dest_path: Option<String>,
    pub monitor_pid: u32,
}

impl PendingRow {
    pub fn from_event(event: &Event, pid: u32) -> PendingRow {
        let micros = event
            .wall_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        PendingRow {
            micros,
            mask: event.mask.0,
            src_path: event.src_path.to_string_lossy().into_owned(),
            dest_path: event
                .dest_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            monitor_pid: pid,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct LogQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Matched against source and destination paths.
    pub pattern: Option<regex::Regex>,
    pub mask: Option<u64>,
    pub pid: Option<u32>,
}

pub trait EventLog: Send + Sync {
    fn append(&self, row: &PendingRow) -> io::Result<()>;
    fn append_aux(&self, row: &PendingRow) -> io::Result<()>;
    fn query(&self, query: &LogQuery) -> io::Result<Vec<LogRow>>;
}

/// JSONL-file event log. This process is the only writer, so uniqueness is
/// kept by remembering the last assigned key.
pub struct FileEventLog {
    path: PathBuf,
    aux_path: PathBuf,
    last: StdMutex<(u64, u32)>,
}

impl FileEventLog {
    pub fn new(path: impl Into<PathBuf>, aux_path: impl Into<PathBuf>) -> FileEventLog {
        FileEventLog {
            path: path.into(),
            aux_path: aux_path.into(),
            last: StdMutex::new((0, 0)),
        }
    }

    fn write_row(path: &PathBuf, row: &LogRow) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(row)?;
        writeln!(file, "{line}")
    }

    fn key(micros: u64, uid: Option<u32>) -> String {
        let sec = micros / 1_000_000;
        let usec = micros % 1_000_000;
        match uid {
            Some(uid) => format!("{sec}.{usec:06}{uid:04}"),
            None => format!("{sec}.{usec:06}"),
        }
    }

    /// `sec.usec` prefix of a key as microseconds since the epoch.
    fn key_micros(key: &str) -> Option<u64> {
        let (sec, rest) = key.split_once('.')?;
        let usec = rest.get(..6)?;
        Some(sec.parse::<u64>().ok()? * 1_000_000 + usec.parse::<u64>().ok()?)
    }
}

impl EventLog for FileEventLog {
    fn append(&self, row: &PendingRow) -> io::Result<()> {
        let uid = {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            let uid = if last.0 == row.micros { last.1 + 1 } else { 0 };
            if uid >= 10u32.pow(UID_DIGITS) {
                // Out of same-microsecond ids; the caller routes to aux.
                return Err(io::Error::other("unique-id space exhausted"));
            }
            *last = (row.micros, uid);
            uid
        };
        Self::write_row(
            &self.path,
            &LogRow {
                unique_time: Self::key(row.micros, Some(uid)),
                mask: row.mask,
                src_path: row.src_path.clone(),
                dest_path: row.dest_path.clone(),
                monitor_pid: row.monitor_pid,
            },
        )
    }

    fn append_aux(&self, row: &PendingRow) -> io::Result<()> {
        Self::write_row(
            &self.aux_path,
            &LogRow {
                unique_time: Self::key(row.micros, None),
                mask: row.mask,
                src_path: row.src_path.clone(),
                dest_path: row.dest_path.clone(),
                monitor_pid: row.monitor_pid,
            },
        )
    }

    fn query(&self, query: &LogQuery) -> io::Result<Vec<LogRow>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let from = query.from.map(|t| t.timestamp_micros().max(0) as u64);
        let to = query.to.map(|t| t.timestamp_micros().max(0) as u64);
        let mut rows = Vec::new();
        for line in text.lines() {
            let Ok(row) = serde_json::from_str::<LogRow>(line) else {
                continue;
            };
            let Some(micros) = Self::key_micros(&row.unique_time) else {
                continue;
            };
            if from.is_some_and(|from| micros < from) || to.is_some_and(|to| micros >= to) {
                continue;
            }
            if query.mask.is_some_and(|mask| row.mask & mask == 0) {
                continue;
            }
            if query.pid.is_some_and(|pid| row.monitor_pid != pid) {
                continue;
            }
            if let Some(pattern) = &query.pattern {
                let dest_hit = row.dest_path.as_deref().is_some_and(|d| pattern.is_match(d));
                if !pattern.is_match(&row.src_path) && !dest_hit {
                    continue;
                }
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

impl std::fmt::Debug for FileEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEventLog")
            .field("path", &self.path)
            .field("aux_path", &self.aux_path)
            .finish()
    }
}

/// Handle to the background writer task.
#[derive(Debug, Clone)]
pub struct LogWriter {
    tx: mpsc::Sender<PendingRow>,
}

impl LogWriter {
    pub fn spawn(log: Arc<dyn EventLog>) -> (LogWriter, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<PendingRow>(10_000);
        let handle = tokio::spawn(async move {
            while let Some(row) = rx.recv().await {
                let mut written = false;
                for _ in 0..MAX_RETRY {
                    if log.append(&row).is_ok() {
                        written = true;
                        break;
                    }
                }
                if !written {
                    warn!("cannot record {} in the event log, trying aux", row.src_path);
                    if let Err(err) = log.append_aux(&row) {
                        error!("cannot record {} in the aux log either: {err}", row.src_path);
                    }
                }
            }
        });
        (LogWriter { tx }, handle)
    }

    /// Queues one event for persistence. Uses `try_send` so a stalled log
    /// never blocks the event pipeline; overflow drops the row.
    pub fn submit(&self, event: &Event, pid: u32) {
        let _ = self.tx.try_send(PendingRow::from_event(event, pid));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMask;

    fn pending(micros: u64, mask: EventMask, src: &str, pid: u32) -> PendingRow {
        PendingRow {
            micros,
            mask: mask.0,
            src_path: src.to_string(),
            dest_path: None,
            monitor_pid: pid,
        }
    }

    #[test]
    fn same_microsecond_rows_get_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileEventLog::new(dir.path().join("log"), dir.path().join("aux"));
        log.append(&pending(1_000_001, EventMask::CREATE, "/a", 1)).unwrap();
        log.append(&pending(1_000_001, EventMask::CREATE, "/b", 1)).unwrap();
        log.append(&pending(1_000_002, EventMask::CREATE, "/c", 1)).unwrap();

        let rows = log.query(&LogQuery::default()).unwrap();
        assert_eq!(rows[0].unique_time, "1.0000010000");
        assert_eq!(rows[1].unique_time, "1.0000010001");
        assert_eq!(rows[2].unique_time, "1.0000020000");
    }

    #[test]
    fn query_filters_compose() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileEventLog::new(dir.path().join("log"), dir.path().join("aux"));
        log.append(&pending(1_000_000, EventMask::CREATE, "/etc/a.ini", 1)).unwrap();
        log.append(&pending(2_000_000, EventMask::DELETE, "/etc/b.ini", 1)).unwrap();
        log.append(&pending(3_000_000, EventMask::CREATE, "/var/c.log", 2)).unwrap();

        let by_mask = log
            .query(&LogQuery {
                mask: Some(EventMask::CREATE.0),
                ..LogQuery::default()
            })
            .unwrap();
        assert_eq!(by_mask.len(), 2);

        let by_pattern = log
            .query(&LogQuery {
                pattern: Some(regex::Regex::new(r"\.ini").unwrap()),
                ..LogQuery::default()
            })
            .unwrap();
        assert_eq!(by_pattern.len(), 2);

        let by_pid = log
            .query(&LogQuery {
                pid: Some(2),
                ..LogQuery::default()
            })
            .unwrap();
        assert_eq!(by_pid.len(), 1);

        let since = log
            .query(&LogQuery {
                from: Some(DateTime::from_timestamp(2, 0).unwrap()),
                ..LogQuery::default()
            })
            .unwrap();
        assert_eq!(since.len(), 2);

        let until = log
            .query(&LogQuery {
                to: Some(DateTime::from_timestamp(2, 0).unwrap()),
                ..LogQuery::default()
            })
            .unwrap();
        assert_eq!(until.len(), 1);
    }

    #[tokio::test]
    async fn writer_falls_back_to_aux() {
        let dir = tempfile::tempdir().unwrap();
        // Primary path cannot be created; every append fails.
        let log = Arc::new(FileEventLog::new(
            dir.path().join("missing/dir/log"),
            dir.path().join("aux"),
        ));
        let (writer, handle) = LogWriter::spawn(Arc::clone(&log) as Arc<dyn EventLog>);

        let event = Event::meta("overflow warning");
        writer.submit(&event, 7);
        drop(writer);
        handle.await.unwrap();

        let aux = std::fs::read_to_string(dir.path().join("aux")).unwrap();
        assert_eq!(aux.lines().count(), 1);
    }
}
