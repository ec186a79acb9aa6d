//! Runtime configuration: a pure struct built at startup, optionally
//! overlaid from a JSON file. There is no process-wide mutable config;
//! everything downstream receives what it needs at construction.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("route option lists must have equal lengths (tags {tags}, patterns {patterns}, events {events}, formats {formats}, schedulers {schedulers})")]
    MismatchedRoutes {
        tags: usize,
        patterns: usize,
        events: usize,
        formats: usize,
        schedulers: usize,
    },
    #[error("tracker option lists must have equal lengths (patterns {patterns}, filetypes {filetypes})")]
    MismatchedTracker { patterns: usize, filetypes: usize },
    #[error("unknown scheduler declaration: {0:?}")]
    BadScheduler(String),
}

/// One compiled-from-config route declaration, assembled from the parallel
/// `route_*` lists by index.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub tag: String,
    pub pattern: String,
    pub events: String,
    pub format: String,
    pub scheduler: SchedulerSpec,
    pub groups: Vec<String>,
}

/// `direct` (pass-through) or `hist CAP INT KEY` (flush on capacity or
/// interval, grouped by a payload field).
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerSpec {
    Direct,
    Histogram {
        capacity: usize,
        interval: f64,
        key: String,
    },
}

impl SchedulerSpec {
    pub fn parse(decl: &str) -> Result<SchedulerSpec, SettingsError> {
        let mut words = decl.split_whitespace();
        let spec = match words.next() {
            Some("direct") | Some("proxy") => SchedulerSpec::Direct,
            Some("hist") | Some("histogram") => {
                let capacity = match words.next() {
                    Some(word) => word
                        .parse()
                        .map_err(|_| SettingsError::BadScheduler(decl.to_string()))?,
                    None => 100,
                };
                let interval = match words.next() {
                    Some(word) => word
                        .parse()
                        .map_err(|_| SettingsError::BadScheduler(decl.to_string()))?,
                    None => 0.0,
                };
                let key = words.next().unwrap_or("ev_name").to_string();
                SchedulerSpec::Histogram {
                    capacity,
                    interval,
                    key,
                }
            }
            _ => return Err(SettingsError::BadScheduler(decl.to_string())),
        };
        if words.next().is_some() {
            return Err(SettingsError::BadScheduler(decl.to_string()));
        }
        Ok(spec)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Roots to monitor.
    pub paths: Vec<PathBuf>,
    /// One worker (and one inotify instance) per root instead of a single
    /// worker for all of them.
    pub worker_every_path: bool,
    /// Extra events recorded to the event log on top of the route masks.
    pub worker_extra_mask: String,

    /// Seconds IN_MOVED_FROM / IN_MODIFY stay in the delay queue waiting
    /// for their counterpart.
    pub buffer_queue_delay: f64,

    pub route_tags: Vec<String>,
    pub route_patterns: Vec<String>,
    pub route_events: Vec<String>,
    pub route_formats: Vec<String>,
    pub route_schedulers: Vec<String>,
    /// Messages of tags not listed in `route_groups` go to this group.
    pub route_default_group: String,
    pub route_groups: HashMap<String, Vec<String>>,

    /// Regex patterns of the tracked file classes, parallel to
    /// `tracker_filetypes`.
    pub tracker_patterns: Vec<String>,
    pub tracker_filetypes: Vec<String>,
    pub tracker_cachedir: PathBuf,
    /// Maximum number of versions kept per file; -1 for unlimited, 0 to
    /// keep backups only.
    pub tracker_depth: i64,

    pub controller_basic_interval: u64,
    pub controller_max_interval: u64,
    /// Warn when used inotify instances or watches exceed this ratio.
    pub controller_limit_threshold: f64,

    /// Record the pids holding a file open on each event.
    pub probe_procs: bool,

    pub log_path: PathBuf,
    pub aux_log_path: PathBuf,

    /// `file` appends rendered messages to `.fswatch.<tag>.buf`; `log`
    /// emits them into the process log.
    pub dispatcher_type: String,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            paths: Vec::new(),
            worker_every_path: false,
            worker_extra_mask: String::new(),
            buffer_queue_delay: 0.5,
            route_tags: vec!["logs".into(), "warnings".into(), "tracks".into()],
            route_patterns: vec![".*".into(), ".*".into(), ".*".into()],
            route_events: vec![
                "IN_ALL_EVENTS".into(),
                "EX_META".into(),
                "EX_MODIFY_CONFIG".into(),
            ],
            route_formats: vec![
                "Event {ev_name} on {ev_src}".into(),
                "Alert at {msg_time}: {msg}".into(),
                "Modified {ev_src}".into(),
            ],
            route_schedulers: vec!["direct".into(), "direct".into(), "direct".into()],
            route_default_group: String::new(),
            route_groups: HashMap::new(),
            tracker_patterns: vec![
                r".*\.(ini|INI)".into(),
                r".*\.(json|JSON)".into(),
                r".*\.(txt|TXT)".into(),
            ],
            tracker_filetypes: vec!["INI".into(), "JSON".into(), "GENERIC".into()],
            tracker_cachedir: PathBuf::from(".track"),
            tracker_depth: -1,
            controller_basic_interval: 600,
            controller_max_interval: 24 * 60 * 60,
            controller_limit_threshold: 0.9,
            probe_procs: false,
            log_path: PathBuf::from(".fswatch.logs.jsonl"),
            aux_log_path: PathBuf::from(".fswatch.logs.aux.jsonl"),
            dispatcher_type: "file".into(),
        }
    }
}

impl Settings {
    /// Defaults overlaid with whatever keys the JSON file provides.
    pub fn from_file(path: &Path) -> Result<Settings, SettingsError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Assembles the parallel `route_*` lists into per-route declarations.
    pub fn routes(&self) -> Result<Vec<RouteSpec>, SettingsError> {
        let lengths = (
            self.route_tags.len(),
            self.route_patterns.len(),
            self.route_events.len(),
            self.route_formats.len(),
            self.route_schedulers.len(),
        );
        if lengths.0 != lengths.1
            || lengths.0 != lengths.2
            || lengths.0 != lengths.3
            || lengths.0 != lengths.4
        {
            return Err(SettingsError::MismatchedRoutes {
                tags: lengths.0,
                patterns: lengths.1,
                events: lengths.2,
                formats: lengths.3,
                schedulers: lengths.4,
            });
        }
        let mut specs = Vec::with_capacity(self.route_tags.len());
        for i in 0..self.route_tags.len() {
            let tag = self.route_tags[i].clone();
            let groups = match self.route_groups.get(&tag) {
                Some(groups) => groups.clone(),
                None if self.route_default_group.is_empty() => Vec::new(),
                None => vec![self.route_default_group.clone()],
            };
            specs.push(RouteSpec {
                tag,
                pattern: self.route_patterns[i].clone(),
                events: self.route_events[i].clone(),
                format: self.route_formats[i].clone(),
                scheduler: SchedulerSpec::parse(&self.route_schedulers[i])?,
                groups,
            });
        }
        Ok(specs)
    }

    /// The `(pattern, filetype)` pairs for the tracker, length-checked.
    pub fn tracker_classes(&self) -> Result<Vec<(String, String)>, SettingsError> {
        if self.tracker_patterns.len() != self.tracker_filetypes.len() {
            return Err(SettingsError::MismatchedTracker {
                patterns: self.tracker_patterns.len(),
                filetypes: self.tracker_filetypes.len(),
            });
        }
        Ok(self
            .tracker_patterns
            .iter()
            .cloned()
            .zip(self.tracker_filetypes.iter().cloned())
            .collect())
    }
}
