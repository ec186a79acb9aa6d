//! Logical event model: the 64-bit event mask (kernel bits plus the
//! synthetic high bits attached by the coalescer and the tracker) and the
//! immutable `Event` record that flows through the pipeline.

use std::fmt;
use std::fs;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::inotify::RawEvent;

/// Union of kernel inotify bits (low 32) and synthetic bits (above bit 32).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EventMask(pub u64);

impl EventMask {
    pub const ACCESS: EventMask = EventMask(0x0000_0001);
    pub const MODIFY: EventMask = EventMask(0x0000_0002);
    pub const ATTRIB: EventMask = EventMask(0x0000_0004);
    pub const CLOSE_WRITE: EventMask = EventMask(0x0000_0008);
    pub const CLOSE_NOWRITE: EventMask = EventMask(0x0000_0010);
    pub const OPEN: EventMask = EventMask(0x0000_0020);
    pub const MOVED_FROM: EventMask = EventMask(0x0000_0040);
    pub const MOVED_TO: EventMask = EventMask(0x0000_0080);
    pub const CREATE: EventMask = EventMask(0x0000_0100);
    pub const DELETE: EventMask = EventMask(0x0000_0200);
    pub const DELETE_SELF: EventMask = EventMask(0x0000_0400);
    pub const MOVE_SELF: EventMask = EventMask(0x0000_0800);
    pub const UNMOUNT: EventMask = EventMask(0x0000_2000);
    pub const Q_OVERFLOW: EventMask = EventMask(0x0000_4000);
    pub const IGNORED: EventMask = EventMask(0x0000_8000);
    pub const ISDIR: EventMask = EventMask(0x4000_0000);

    pub const ALL_EVENTS: EventMask = EventMask(0x0000_0fff);
    pub const MOVE: EventMask = EventMask(0x0000_00c0);
    pub const CLOSE: EventMask = EventMask(0x0000_0018);

    // Synthetic bits, kept above bit 32 so they can never collide with
    // anything the kernel reports.
    pub const META: EventMask = EventMask(1 << 32);
    pub const RENAME: EventMask = EventMask(1 << 33);
    pub const BEGIN_MODIFY: EventMask = EventMask(1 << 34);
    pub const IN_MODIFY: EventMask = EventMask(1 << 35);
    pub const END_MODIFY: EventMask = EventMask(1 << 36);
    pub const MODIFY_CONFIG: EventMask = EventMask(1 << 37);

    const EXTENDED_BITS: u64 = 0x3f_0000_0000;

    pub fn empty() -> EventMask {
        EventMask(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    /// The low 32 bits, suitable for `inotify_add_watch`.
    pub fn kernel_bits(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    /// Lowest set bit, `0` if none.
    pub fn lowest(self) -> EventMask {
        EventMask(self.0 & self.0.wrapping_neg())
    }

    /// The single bit that names this event: the lowest set synthetic bit
    /// if any, otherwise the lowest set kernel bit.
    pub fn significant(self) -> EventMask {
        let extended = self.0 & Self::EXTENDED_BITS;
        if extended != 0 {
            EventMask(extended & extended.wrapping_neg())
        } else {
            self.lowest()
        }
    }

    /// Symbolic name of the significant bit.
    pub fn name(self) -> &'static str {
        let bit = self.significant().0;
        for &(value, name) in EXTENDED_NAMES.iter().chain(BASE_NAMES) {
            if value == bit {
                return name;
            }
        }
        "UNDEFINED"
    }

    /// All set named bits joined by `|`, in ascending bit order.
    pub fn full_name(self) -> String {
        let mut names = Vec::new();
        for &(value, name) in BASE_NAMES.iter().chain(EXTENDED_NAMES) {
            if self.0 & value == value {
                names.push(name);
            }
        }
        names.join("|")
    }

    /// Parses a `|`-joined list of symbolic names (`IN_MODIFY|EX_RENAME`).
    pub fn parse(spec: &str) -> Result<EventMask, UnknownEventName> {
        let mut mask = EventMask::empty();
        for part in spec.split('|') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            mask |= lookup_name(part).ok_or_else(|| UnknownEventName(part.to_string()))?;
        }
        Ok(mask)
    }
}

impl BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventMask {
    type Output = EventMask;
    fn bitand(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 & rhs.0)
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown event name: {0}")]
pub struct UnknownEventName(pub String);

const BASE_NAMES: &[(u64, &str)] = &[
    (0x0000_0001, "IN_ACCESS"),
    (0x0000_0002, "IN_MODIFY"),
    (0x0000_0004, "IN_ATTRIB"),
    (0x0000_0008, "IN_CLOSE_WRITE"),
    (0x0000_0010, "IN_CLOSE_NOWRITE"),
    (0x0000_0020, "IN_OPEN"),
    (0x0000_0040, "IN_MOVED_FROM"),
    (0x0000_0080, "IN_MOVED_TO"),
    (0x0000_0100, "IN_CREATE"),
    (0x0000_0200, "IN_DELETE"),
    (0x0000_0400, "IN_DELETE_SELF"),
    (0x0000_0800, "IN_MOVE_SELF"),
    (0x0000_2000, "IN_UNMOUNT"),
    (0x0000_4000, "IN_Q_OVERFLOW"),
    (0x0000_8000, "IN_IGNORED"),
    (0x4000_0000, "IN_ISDIR"),
];

const EXTENDED_NAMES: &[(u64, &str)] = &[
    (1 << 32, "EX_META"),
    (1 << 33, "EX_RENAME"),
    (1 << 34, "EX_BEGIN_MODIFY"),
    (1 << 35, "EX_IN_MODIFY"),
    (1 << 36, "EX_END_MODIFY"),
    (1 << 37, "EX_MODIFY_CONFIG"),
];

fn lookup_name(name: &str) -> Option<EventMask> {
    match name {
        "IN_ALL_EVENTS" => return Some(EventMask::ALL_EVENTS),
        "IN_MOVE" => return Some(EventMask::MOVE),
        "IN_CLOSE" => return Some(EventMask::CLOSE),
        _ => {}
    }
    BASE_NAMES
        .iter()
        .chain(EXTENDED_NAMES)
        .find(|&&(_, n)| n == name)
        .map(|&(v, _)| EventMask(v))
}

/// A logical filesystem event. Immutable once constructed; the coalescer
/// produces updated copies through [`Event::derive`].
#[derive(Debug, Clone)]
pub struct Event {
    pub mask: EventMask,
    pub cookie: u32,
    pub wd: i32,
    pub src_path: PathBuf,
    pub dest_path: Option<PathBuf>,
    /// Monotonic time used by the delay buffer and meters.
    pub time: Instant,
    /// Wall-clock time used for the event log and formatted output.
    pub wall_time: SystemTime,
    /// Enrichment fields (`before`, `after`, `diff`, `msg`, ...).
    pub fields: Map<String, Value>,
}

impl Event {
    pub fn from_raw(raw: &RawEvent, src_path: PathBuf) -> Event {
        Event {
            mask: EventMask(raw.mask as u64),
            cookie: raw.cookie,
            wd: raw.wd,
            src_path,
            dest_path: None,
            time: Instant::now(),
            wall_time: SystemTime::now(),
            fields: Map::new(),
        }
    }

    /// Copy of this event with `extra` OR-ed into the mask and, optionally,
    /// a destination path. Cookie and timestamps are preserved so derived
    /// events keep their position in the delay window.
    pub fn derive(&self, extra: EventMask, dest_path: Option<PathBuf>) -> Event {
        Event {
            mask: self.mask | extra,
            dest_path: dest_path.or_else(|| self.dest_path.clone()),
            fields: self.fields.clone(),
            ..self.clone()
        }
    }

    /// Synthetic `EX_META` event carrying an operator-facing message.
    pub fn meta(msg: impl Into<String>) -> Event {
        let mut fields = Map::new();
        fields.insert("msg".to_string(), Value::String(msg.into()));
        fields.insert(
            "msg_time".to_string(),
            Value::String(format_wall_time(SystemTime::now())),
        );
        Event {
            mask: EventMask::META,
            cookie: 0,
            wd: -1,
            src_path: PathBuf::new(),
            dest_path: None,
            time: Instant::now(),
            wall_time: SystemTime::now(),
            fields,
        }
    }

    /// `EX_MODIFY_CONFIG` event emitted by the version tracker.
    pub fn modify_config(path: &Path, before: Value, after: Value, diff: Value) -> Event {
        let mut fields = Map::new();
        fields.insert("before".to_string(), before);
        fields.insert("after".to_string(), after);
        fields.insert("diff".to_string(), diff);
        Event {
            mask: EventMask::MODIFY_CONFIG,
            cookie: 0,
            wd: -1,
            src_path: path.to_path_buf(),
            dest_path: None,
            time: Instant::now(),
            wall_time: SystemTime::now(),
            fields,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mask.intersects(EventMask::ISDIR)
    }

    pub fn is_create_dir(&self) -> bool {
        self.mask.contains(EventMask::ISDIR | EventMask::CREATE)
    }

    pub fn is_overflow(&self) -> bool {
        self.mask.intersects(EventMask::Q_OVERFLOW)
    }

    pub fn is_ignored(&self) -> bool {
        self.mask.intersects(EventMask::IGNORED)
    }

    /// Suppressed mid-burst modify marker: dropped by the consumer.
    pub fn is_suppressed(&self) -> bool {
        self.mask.significant() == EventMask::IN_MODIFY
    }

    /// The fields available to route format templates.
    pub fn render_fields(&self) -> Map<String, Value> {
        let mut fields = self.fields.clone();
        fields.insert(
            "ev_src".to_string(),
            Value::String(self.src_path.to_string_lossy().into_owned()),
        );
        fields.insert(
            "ev_dest".to_string(),
            match &self.dest_path {
                Some(p) => Value::String(p.to_string_lossy().into_owned()),
                None => Value::Null,
            },
        );
        fields.insert(
            "ev_time".to_string(),
            Value::String(format_wall_time(self.wall_time)),
        );
        fields.insert("ev_name".to_string(), Value::String(self.mask.full_name()));
        fields
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.mask.name(), self.src_path.display())
    }
}

pub fn format_wall_time(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Pids of processes currently holding `path` open, found by walking
/// `/proc/*/fd`. Best effort: unreadable entries are skipped.
pub fn procs_for_path(path: &Path) -> Vec<u32> {
    let mut pids = Vec::new();
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return pids,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let pid: u32 = match name.to_string_lossy().parse() {
            Ok(pid) => pid,
            Err(_) => continue,
        };
        let fd_dir = format!("/proc/{pid}/fd");
        let fds = match fs::read_dir(&fd_dir) {
            Ok(fds) => fds,
            Err(_) => continue,
        };
        for fd in fds.flatten() {
            if let Ok(target) = fs::read_link(fd.path()) {
                if target == path {
                    pids.push(pid);
                    break;
                }
            }
        }
    }
    pids
}
