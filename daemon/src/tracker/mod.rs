//! Config-file version tracker: matches files against configured
//! patterns, keeps the latest parse as a backup plus a chain of structural
//! diffs, and emits `EX_MODIFY_CONFIG` events when tracked content
//! changes. The file id (`fid`) survives renames.
//!
//! Cache layout under the tracker directory:
//!
//! ```text
//! .track
//! ├── backup
//! │   └── <fid>.json
//! ├── diff
//! │   └── <fid>.<version>.json
//! └── index.json
//! ```

pub mod format;
pub mod index;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::event::Event;
use format::{diff, reset, Diff, FileFormat, ParseError, Parsed};
use index::{Index, IndexEntry, JsonIndex};

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("file is not tracked: {0}")]
    NotTracked(PathBuf),
    #[error("invalid target version {target}, current version is {latest}")]
    OutOfRange { target: i64, latest: u64 },
    #[error("tracker class pattern {pattern:?} does not compile: {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("unknown tracker file type: {0:?}")]
    UnknownFormat(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

struct TrackerClass {
    pattern: regex::Regex,
    format: FileFormat,
}

/// File tracker with simple version control. `max_depth` bounds how many
/// diffs are kept per file: -1 for unlimited, 0 for backups only.
pub struct FileTracker {
    backup_dir: PathBuf,
    diff_dir: PathBuf,
    classes: Vec<TrackerClass>,
    max_depth: i64,
    index: Box<dyn Index>,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FileTracker {
    /// `classes` pairs a path regex with a parser name (`INI`, `JSON`,
    /// `GENERIC`); the first matching class wins.
    pub fn new(
        cache_dir: &Path,
        classes: Vec<(String, String)>,
        max_depth: i64,
    ) -> Result<FileTracker, TrackerError> {
        let backup_dir = cache_dir.join("backup");
        let diff_dir = cache_dir.join("diff");
        std::fs::create_dir_all(&backup_dir)?;
        std::fs::create_dir_all(&diff_dir)?;

        let mut compiled = Vec::with_capacity(classes.len());
        for (pattern, name) in classes {
            let format = FileFormat::parse_name(&name)
                .ok_or_else(|| TrackerError::UnknownFormat(name.clone()))?;
            let pattern_full = format!("^(?:{pattern})$");
            let pattern = regex::Regex::new(&pattern_full).map_err(|source| {
                TrackerError::BadPattern { pattern, source }
            })?;
            compiled.push(TrackerClass { pattern, format });
        }

        let index = JsonIndex::open(cache_dir.join("index.json"))?;
        Ok(FileTracker {
            backup_dir,
            diff_dir,
            classes: compiled,
            max_depth,
            index: Box::new(index),
            locks: StdMutex::new(HashMap::new()),
        })
    }

    fn match_class(&self, path: &str) -> Option<FileFormat> {
        self.classes
            .iter()
            .find(|class| class.pattern.is_match(path))
            .map(|class| class.format)
    }

    fn backup_path(&self, fid: u64) -> PathBuf {
        self.backup_dir.join(format!("{fid}.json"))
    }

    fn diff_path(&self, fid: u64, version: u64) -> PathBuf {
        self.diff_dir.join(format!("{fid}.{version}.json"))
    }

    /// Per-path advisory lock; process-local, as the JSON index backend has
    /// no distributed locking.
    async fn lock_path(&self, path: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(path.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Examines one path: starts tracking it on first sight, otherwise
    /// diffs it against the backup and, on change, advances the version and
    /// returns the `EX_MODIFY_CONFIG` event to emit. Read and parse errors
    /// are logged and end processing without touching the index.
    pub async fn consider(&self, path: &Path) -> Result<Option<Event>, TrackerError> {
        let abs = absolute(path);
        let path_str = abs.to_string_lossy().into_owned();
        let Some(format) = self.match_class(&path_str) else {
            return Ok(None);
        };
        let text = match tokio::fs::read_to_string(&abs).await {
            Ok(text) => text,
            Err(err) => {
                warn!("cannot read {path_str}: {err}");
                return Ok(None);
            }
        };
        let parsed = match Parsed::parse(format, &text) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("cannot parse {path_str}: {err}");
                return Ok(None);
            }
        };

        let _guard = self.lock_path(&path_str).await;
        let Some(fid) = self.index.fid_for_path(&path_str) else {
            let fid = self.index.insert(&path_str, format)?;
            self.write_blob(&self.backup_path(fid), &parsed.to_value())
                .await?;
            info!("tracking {path_str} as fid {fid}");
            return Ok(None);
        };

        let before = self.read_blob(&self.backup_path(fid)).await?;
        let old = Parsed::from_value(format, before.clone())?;
        let Some(delta) = diff(&old, &parsed) else {
            return Ok(None);
        };

        let after = parsed.to_value();
        let version = self.index.bump_version(fid)?;
        self.write_blob(&self.backup_path(fid), &after).await?;
        if self.max_depth != 0 {
            self.write_blob(&self.diff_path(fid, version), &delta.to_value())
                .await?;
            if self.max_depth > 0 && version as i64 > self.max_depth {
                let stale = self.diff_path(fid, version - self.max_depth as u64);
                if let Err(err) = tokio::fs::remove_file(&stale).await {
                    if err.kind() != io::ErrorKind::NotFound {
                        warn!("cannot prune {}: {err}", stale.display());
                    }
                }
            }
        }
        debug!("{path_str} advanced to version {version}");
        Ok(Some(Event::modify_config(
            &abs,
            before,
            after,
            delta.to_value(),
        )))
    }

    /// Reconstructs `path` at `version` by reverse-applying diffs from the
    /// latest backup. Negative versions count back from the latest.
    pub async fn checkout(&self, path: &Path, version: i64) -> Result<Parsed, TrackerError> {
        let abs = absolute(path);
        let path_str = abs.to_string_lossy().into_owned();
        let entry = self
            .index
            .fid_for_path(&path_str)
            .and_then(|fid| self.index.entry(fid))
            .ok_or_else(|| TrackerError::NotTracked(abs.clone()))?;

        let latest = entry.version;
        let target = if version >= 0 {
            version
        } else {
            latest as i64 + version
        };
        if target < 0 || target > latest as i64 {
            return Err(TrackerError::OutOfRange { target, latest });
        }
        if self.max_depth >= 0 && latest as i64 - target > self.max_depth {
            return Err(TrackerError::OutOfRange { target, latest });
        }

        let _guard = self.lock_path(&path_str).await;
        let mut parsed =
            Parsed::from_value(entry.format, self.read_blob(&self.backup_path(entry.fid)).await?)?;
        for v in ((target + 1) as u64..=latest).rev() {
            let blob = self.read_blob(&self.diff_path(entry.fid, v)).await?;
            let delta = Diff::from_value(entry.format, blob)?;
            parsed = reset(&parsed, &delta);
        }
        Ok(parsed)
    }

    /// Primes tracking for every regular file directly under `dir`.
    pub async fn watch_dir(&self, dir: &Path) {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cannot prime {}: {err}", dir.display());
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                if let Err(err) = self.consider(&entry.path()).await {
                    warn!("cannot prime {}: {err}", entry.path().display());
                }
            }
        }
    }

    /// Re-points a tracked file at its new path after a rename; the fid and
    /// version history carry over.
    pub async fn rename(&self, old: &Path, new: &Path) -> Result<(), TrackerError> {
        let old_str = absolute(old).to_string_lossy().into_owned();
        let _guard = self.lock_path(&old_str).await;
        if let Some(fid) = self.index.fid_for_path(&old_str) {
            let new_str = absolute(new).to_string_lossy().into_owned();
            self.index.set_path(fid, &new_str)?;
            debug!("fid {fid} followed rename {old_str} -> {new_str}");
        }
        Ok(())
    }

    /// Drops index entries whose file no longer exists, along with their
    /// backups and diffs. Returns how many were removed.
    pub async fn wipe(&self) -> usize {
        let mut removed = 0;
        for entry in self.index.all() {
            if Path::new(&entry.path).exists() {
                continue;
            }
            if let Err(err) = self.index.remove(entry.fid) {
                warn!("cannot drop fid {}: {err}", entry.fid);
                continue;
            }
            let _ = tokio::fs::remove_file(self.backup_path(entry.fid)).await;
            for version in 1..=entry.version {
                let _ = tokio::fs::remove_file(self.diff_path(entry.fid, version)).await;
            }
            removed += 1;
        }
        removed
    }

    pub fn entries(&self) -> Vec<IndexEntry> {
        self.index.all()
    }

    async fn read_blob(&self, path: &Path) -> Result<Value, TrackerError> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&text).map_err(ParseError::Json)?)
    }

    async fn write_blob(&self, path: &Path, value: &Value) -> Result<(), TrackerError> {
        let text = serde_json::to_string(value).map_err(ParseError::Json)?;
        Ok(tokio::fs::write(path, text).await?)
    }
}

impl std::fmt::Debug for FileTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTracker")
            .field("classes", &self.classes.len())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
