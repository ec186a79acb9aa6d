//! The tracker index: `fid` is the primary key, the path the secondary
//! one. Backed by a JSON file that is rewritten in full on mutation; the
//! interface is a trait so a database-backed index can slot in.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::format::FileFormat;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub fid: u64,
    pub path: String,
    pub version: u64,
    pub format: FileFormat,
}

pub trait Index: Send + Sync {
    fn entry(&self, fid: u64) -> Option<IndexEntry>;
    fn fid_for_path(&self, path: &str) -> Option<u64>;
    /// Inserts a new entry at version 0 and returns its fid.
    fn insert(&self, path: &str, format: FileFormat) -> io::Result<u64>;
    fn set_path(&self, fid: u64, path: &str) -> io::Result<()>;
    /// Increments the version and returns the new value.
    fn bump_version(&self, fid: u64) -> io::Result<u64>;
    fn remove(&self, fid: u64) -> io::Result<()>;
    fn all(&self) -> Vec<IndexEntry>;
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
struct JsonIndexState {
    by_fid: BTreeMap<u64, IndexEntry>,
    fid_by_path: HashMap<String, u64>,
    next_fid: u64,
}

/// File-backed index, loaded once at startup.
#[derive(Debug)]
pub struct JsonIndex {
    path: PathBuf,
    state: Mutex<JsonIndexState>,
}

impl JsonIndex {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<JsonIndex> {
        let path = path.into();
        let mut state = JsonIndexState::default();
        match fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => {
                let entries: Vec<IndexEntry> = serde_json::from_str(&text)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                for entry in entries {
                    state.next_fid = state.next_fid.max(entry.fid + 1);
                    state.fid_by_path.insert(entry.path.clone(), entry.fid);
                    state.by_fid.insert(entry.fid, entry);
                }
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        Ok(JsonIndex {
            path,
            state: Mutex::new(state),
        })
    }

    fn flush(&self, state: &JsonIndexState) -> io::Result<()> {
        let entries: Vec<&IndexEntry> = state.by_fid.values().collect();
        let text = serde_json::to_string(&entries)?;
        fs::write(&self.path, text)
    }
}

impl Index for JsonIndex {
    fn entry(&self, fid: u64) -> Option<IndexEntry> {
        lock_or_recover(&self.state).by_fid.get(&fid).cloned()
    }

    fn fid_for_path(&self, path: &str) -> Option<u64> {
        lock_or_recover(&self.state).fid_by_path.get(path).copied()
    }

    fn insert(&self, path: &str, format: FileFormat) -> io::Result<u64> {
        let mut state = lock_or_recover(&self.state);
        let fid = state.next_fid;
        state.next_fid += 1;
        state.fid_by_path.insert(path.to_string(), fid);
        state.by_fid.insert(
            fid,
            IndexEntry {
                fid,
                path: path.to_string(),
                version: 0,
                format,
            },
        );
        self.flush(&state)?;
        Ok(fid)
    }

    fn set_path(&self, fid: u64, path: &str) -> io::Result<()> {
        let mut state = lock_or_recover(&self.state);
        let Some(entry) = state.by_fid.get_mut(&fid) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown fid"));
        };
        let old_path = std::mem::replace(&mut entry.path, path.to_string());
        state.fid_by_path.remove(&old_path);
        state.fid_by_path.insert(path.to_string(), fid);
        self.flush(&state)
    }

    fn bump_version(&self, fid: u64) -> io::Result<u64> {
        let mut state = lock_or_recover(&self.state);
        let Some(entry) = state.by_fid.get_mut(&fid) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown fid"));
        };
        entry.version += 1;
        let version = entry.version;
        self.flush(&state)?;
        Ok(version)
    }

    fn remove(&self, fid: u64) -> io::Result<()> {
        let mut state = lock_or_recover(&self.state);
        if let Some(entry) = state.by_fid.remove(&fid) {
            state.fid_by_path.remove(&entry.path);
            self.flush(&state)?;
        }
        Ok(())
    }

    fn all(&self) -> Vec<IndexEntry> {
        lock_or_recover(&self.state).by_fid.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let fid = {
            let index = JsonIndex::open(&path).unwrap();
            let fid = index.insert("/etc/a.ini", FileFormat::Ini).unwrap();
            index.bump_version(fid).unwrap();
            index.bump_version(fid).unwrap();
            fid
        };

        let index = JsonIndex::open(&path).unwrap();
        let entry = index.entry(fid).unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(entry.format, FileFormat::Ini);
        assert_eq!(index.fid_for_path("/etc/a.ini"), Some(fid));

        // New fids never reuse old ones.
        let other = index.insert("/etc/b.json", FileFormat::Json).unwrap();
        assert!(other > fid);
    }

    #[test]
    fn set_path_keeps_the_fid() {
        let dir = tempfile::tempdir().unwrap();
        let index = JsonIndex::open(dir.path().join("index.json")).unwrap();
        let fid = index.insert("/old", FileFormat::Generic).unwrap();
        index.set_path(fid, "/new").unwrap();
        assert_eq!(index.fid_for_path("/new"), Some(fid));
        assert_eq!(index.fid_for_path("/old"), None);
        assert_eq!(index.entry(fid).unwrap().version, 0);
    }

    #[test]
    fn unknown_fid_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let index = JsonIndex::open(dir.path().join("index.json")).unwrap();
        assert!(index.bump_version(42).is_err());
        assert!(index.set_path(42, "/x").is_err());
    }
}
