//! Watch bookkeeping for one inotify instance: the `path <-> wd` bijection,
//! recursive tree watches, symlink indirection, the per-wd scratch used to
//! pair the two halves of a directory move, and overflow recovery.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use nix::errno::Errno;
use tracing::{debug, warn};

use crate::inotify::Inotify;

/// Helper to lock a std::sync::Mutex, recovering from poisoning.
/// The data is still valid after a panic, so we just unwrap the poison error.
fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// An `inotify_add_watch` errno outside the tolerated set. Fatal to the
    /// owning worker.
    #[error("inotify_add_watch({path}) failed: {source}")]
    Add {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Transient per-wd annotations while a directory move is in flight.
#[derive(Debug, Default, Clone)]
pub struct MoveScratch {
    pub parent_wd: Option<i32>,
    pub child_wd: Option<i32>,
    pub to_path: Option<PathBuf>,
}

/// What `finish_move` did with a pending move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The subtree was rebased onto its committed destination.
    Rebased { from: PathBuf, to: PathBuf },
    /// No destination was recorded; the subtree was unwatched.
    Removed(PathBuf),
    /// The wd was not known (already pruned).
    Unknown,
}

#[derive(Debug, Default)]
struct WatchState {
    path_by_wd: HashMap<i32, PathBuf>,
    wd_by_path: HashMap<PathBuf, i32>,
    scratch_by_wd: HashMap<i32, MoveScratch>,
    /// `None` in the set marks that the target is also watched directly, so
    /// removing the last real link must not tear the target watch down.
    links_by_target: HashMap<PathBuf, HashSet<Option<PathBuf>>>,
    target_by_link: HashMap<PathBuf, PathBuf>,
}

pub struct WatchManager {
    inotify: Arc<Inotify>,
    state: Mutex<WatchState>,
}

impl WatchManager {
    pub fn new(inotify: Arc<Inotify>) -> WatchManager {
        WatchManager {
            inotify,
            state: Mutex::new(WatchState::default()),
        }
    }

    /// Watches `path` and every non-symlink subdirectory reachable from it,
    /// then installs a link watch for every symlink encountered on the walk.
    pub fn add_tree(&self, path: &Path, mask: u32) -> Result<(), WatchError> {
        let mut links = Vec::new();
        {
            let mut state = lock_or_recover(&self.state);
            if self.add_watch_locked(&mut state, path, mask)?.is_none() {
                return Ok(());
            }
            let mut stack = vec![path.to_path_buf()];
            while let Some(dir) = stack.pop() {
                let entries = match fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(err) => {
                        warn!("cannot walk {}: {err}", dir.display());
                        continue;
                    }
                };
                for entry in entries.flatten() {
                    let file_type = match entry.file_type() {
                        Ok(t) => t,
                        Err(_) => continue,
                    };
                    let child = entry.path();
                    if file_type.is_symlink() {
                        links.push(child);
                    } else if file_type.is_dir()
                        && self.add_watch_locked(&mut state, &child, mask)?.is_some()
                    {
                        stack.push(child);
                    }
                }
            }
        }
        for link in links {
            self.add_link(&link, mask)?;
        }
        Ok(())
    }

    /// Watches a directory discovered at runtime (created, or moved into the
    /// tree). An `EEXIST` here can mean the watch moved with a directory
    /// rename: if the event's originating wd has a `MOVED_FROM` child
    /// recorded in scratch, the new path is committed there, to be applied
    /// when the matching `MOVE_SELF`/`IGNORED` arrives. Any other `EEXIST`
    /// is a benign redundant add.
    pub fn add_child_watch(
        &self,
        path: &Path,
        mask: u32,
        origin_wd: i32,
    ) -> Result<(), WatchError> {
        let added = {
            let mut state = lock_or_recover(&self.state);
            match self.inotify.add_watch(path, mask | libc::IN_MASK_CREATE) {
                Ok(wd) => {
                    state.path_by_wd.insert(wd, path.to_path_buf());
                    state.wd_by_path.insert(path.to_path_buf(), wd);
                    true
                }
                Err(err) if errno_of(&err) == Some(Errno::EEXIST) => {
                    let pending_child = state
                        .scratch_by_wd
                        .get(&origin_wd)
                        .and_then(|scratch| scratch.child_wd);
                    match pending_child {
                        Some(child_wd) => {
                            debug!(
                                "watch for {} travels with wd {child_wd}",
                                path.display()
                            );
                            state
                                .scratch_by_wd
                                .entry(child_wd)
                                .or_default()
                                .to_path = Some(path.to_path_buf());
                        }
                        None => debug!("already watching {}", path.display()),
                    }
                    false
                }
                Err(err) if is_expected_watch_error(&err) => {
                    warn!("skipping watch on {}: {err}", path.display());
                    false
                }
                Err(err) => {
                    return Err(WatchError::Add {
                        path: path.to_path_buf(),
                        source: err,
                    })
                }
            }
        };
        if added {
            // The directory may already have children (mkdir -p, a tree
            // moved in from outside). Walk it like any other root.
            self.add_tree(path, mask)?;
        }
        Ok(())
    }

    /// Tears down `wd` and every currently known descendant watch.
    pub fn remove_tree(&self, wd: i32) {
        let mut state = lock_or_recover(&self.state);
        self.remove_tree_locked(&mut state, wd);
    }

    /// Dereferences one level of symlink; if the target is a directory, the
    /// target gets a shared tree watch whose lifetime is the longest link
    /// holder plus an optional direct watch. Cycles terminate because an
    /// already-linked target is never followed again.
    pub fn add_link(&self, link: &Path, mask: u32) -> Result<(), WatchError> {
        let target = match fs::read_link(link) {
            Ok(target) if target.is_absolute() => target,
            Ok(target) => link.parent().unwrap_or(Path::new("")).join(target),
            Err(err) => {
                warn!("cannot resolve link {}: {err}", link.display());
                return Ok(());
            }
        };
        match fs::metadata(&target) {
            Ok(meta) if meta.is_dir() => {}
            _ => return Ok(()),
        }

        let needs_tree = {
            let mut state = lock_or_recover(&self.state);
            if state.target_by_link.contains_key(link) {
                return Ok(());
            }
            let first = !state.links_by_target.contains_key(&target);
            let watched_directly = state.wd_by_path.contains_key(&target);
            let holders = state.links_by_target.entry(target.clone()).or_default();
            if first && watched_directly {
                holders.insert(None);
            }
            holders.insert(Some(link.to_path_buf()));
            state
                .target_by_link
                .insert(link.to_path_buf(), target.clone());
            first && !watched_directly
        };
        if needs_tree {
            debug!("link {} -> {}", link.display(), target.display());
            self.add_tree(&target, mask)?;
        }
        Ok(())
    }

    /// Drops a link; the target watch survives while other links or the
    /// direct-watch sentinel still hold it.
    pub fn remove_link(&self, link: &Path) {
        let mut state = lock_or_recover(&self.state);
        let Some(target) = state.target_by_link.remove(link) else {
            return;
        };
        let drop_target = match state.links_by_target.get_mut(&target) {
            Some(holders) => {
                holders.remove(&Some(link.to_path_buf()));
                holders.is_empty()
            }
            None => false,
        };
        if drop_target {
            state.links_by_target.remove(&target);
            if let Some(&wd) = state.wd_by_path.get(&target) {
                self.remove_tree_locked(&mut state, wd);
            }
        }
    }

    /// Whether `path` is a known symlink alias.
    pub fn is_link(&self, path: &Path) -> bool {
        lock_or_recover(&self.state).target_by_link.contains_key(path)
    }

    /// Records the first half of a directory move: `MOVED_FROM` seen on
    /// `parent_wd` for a child that is itself watched.
    pub fn record_moved_from(&self, parent_wd: i32, child_path: &Path) {
        let mut state = lock_or_recover(&self.state);
        let Some(&child_wd) = state.wd_by_path.get(child_path) else {
            return;
        };
        state
            .scratch_by_wd
            .entry(parent_wd)
            .or_default()
            .child_wd = Some(child_wd);
        state
            .scratch_by_wd
            .entry(child_wd)
            .or_default()
            .parent_wd = Some(parent_wd);
    }

    /// Settles a pending move on `MOVE_SELF`/`IGNORED` for `wd`: rebases the
    /// whole subtree onto the committed destination, or unwatches it when no
    /// destination was recorded.
    pub fn finish_move(&self, wd: i32) -> MoveOutcome {
        let mut state = lock_or_recover(&self.state);
        let scratch = state.scratch_by_wd.remove(&wd).unwrap_or_default();
        if let Some(parent_wd) = scratch.parent_wd {
            if let Some(parent) = state.scratch_by_wd.get_mut(&parent_wd) {
                parent.child_wd = None;
            }
        }
        let Some(old) = state.path_by_wd.get(&wd).cloned() else {
            return MoveOutcome::Unknown;
        };
        match scratch.to_path {
            Some(new) => {
                let moved: Vec<(i32, PathBuf)> = state
                    .path_by_wd
                    .iter()
                    .filter(|(_, path)| path.starts_with(&old))
                    .map(|(&w, path)| (w, path.clone()))
                    .collect();
                for (w, path) in moved {
                    let rebased = match path.strip_prefix(&old) {
                        Ok(suffix) if suffix.as_os_str().is_empty() => new.clone(),
                        Ok(suffix) => new.join(suffix),
                        Err(_) => continue,
                    };
                    state.wd_by_path.remove(&path);
                    state.wd_by_path.insert(rebased.clone(), w);
                    state.path_by_wd.insert(w, rebased);
                }
                debug!("rebased {} -> {}", old.display(), new.display());
                MoveOutcome::Rebased { from: old, to: new }
            }
            None => {
                self.remove_tree_locked(&mut state, wd);
                MoveOutcome::Removed(old)
            }
        }
    }

    /// Overflow recovery: drop every watch, then rebuild from the roots.
    /// Events between the overflow and completion are lost by design.
    pub fn rescan(&self, roots: &[PathBuf], mask: u32) -> Result<(), WatchError> {
        {
            let mut state = lock_or_recover(&self.state);
            for (&wd, _) in state.path_by_wd.iter() {
                let _ = self.inotify.rm_watch(wd);
            }
            *state = WatchState::default();
        }
        for root in roots {
            self.add_tree(root, mask)?;
        }
        Ok(())
    }

    /// Alternative spellings of `path` reachable through known symlinks,
    /// used by route matching.
    pub fn resolve_aliases(&self, path: &Path) -> Vec<PathBuf> {
        let state = lock_or_recover(&self.state);
        let mut aliases = Vec::new();
        for (link, target) in &state.target_by_link {
            if let Ok(suffix) = path.strip_prefix(target) {
                aliases.push(if suffix.as_os_str().is_empty() {
                    link.clone()
                } else {
                    link.join(suffix)
                });
            }
        }
        aliases
    }

    pub fn path_for_wd(&self, wd: i32) -> Option<PathBuf> {
        lock_or_recover(&self.state).path_by_wd.get(&wd).cloned()
    }

    pub fn wd_for_path(&self, path: &Path) -> Option<i32> {
        lock_or_recover(&self.state).wd_by_path.get(path).copied()
    }

    pub fn watch_count(&self) -> usize {
        lock_or_recover(&self.state).path_by_wd.len()
    }

    /// Both maps agree in both directions. Holds at every quiescent point.
    pub fn bijection_holds(&self) -> bool {
        let state = lock_or_recover(&self.state);
        state.path_by_wd.len() == state.wd_by_path.len()
            && state
                .path_by_wd
                .iter()
                .all(|(wd, path)| state.wd_by_path.get(path) == Some(wd))
    }

    fn add_watch_locked(
        &self,
        state: &mut WatchState,
        path: &Path,
        mask: u32,
    ) -> Result<Option<i32>, WatchError> {
        match self.inotify.add_watch(path, mask | libc::IN_MASK_CREATE) {
            Ok(wd) => {
                state.path_by_wd.insert(wd, path.to_path_buf());
                state.wd_by_path.insert(path.to_path_buf(), wd);
                Ok(Some(wd))
            }
            Err(err) if errno_of(&err) == Some(Errno::EEXIST) => {
                Ok(state.wd_by_path.get(path).copied())
            }
            Err(err) if is_expected_watch_error(&err) => {
                warn!("skipping watch on {}: {err}", path.display());
                Ok(None)
            }
            Err(err) => Err(WatchError::Add {
                path: path.to_path_buf(),
                source: err,
            }),
        }
    }

    fn remove_tree_locked(&self, state: &mut WatchState, wd: i32) {
        let Some(root) = state.path_by_wd.get(&wd).cloned() else {
            return;
        };
        let doomed: Vec<(i32, PathBuf)> = state
            .path_by_wd
            .iter()
            .filter(|(_, path)| path.starts_with(&root))
            .map(|(&w, path)| (w, path.clone()))
            .collect();
        for (w, path) in doomed {
            let _ = self.inotify.rm_watch(w);
            state.path_by_wd.remove(&w);
            state.wd_by_path.remove(&path);
            state.scratch_by_wd.remove(&w);
        }
    }
}

impl std::fmt::Debug for WatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchManager")
            .field("watches", &self.watch_count())
            .finish()
    }
}

fn errno_of(err: &io::Error) -> Option<Errno> {
    err.raw_os_error().map(Errno::from_raw)
}

fn is_expected_watch_error(err: &io::Error) -> bool {
    matches!(
        errno_of(err),
        Some(Errno::ENOENT | Errno::ENOTDIR | Errno::EACCES)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn manager() -> WatchManager {
        WatchManager::new(Arc::new(Inotify::init().unwrap()))
    }

    const MASK: u32 = libc::IN_ALL_EVENTS;

    #[test]
    fn add_tree_watches_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();

        let watches = manager();
        watches.add_tree(dir.path(), MASK).unwrap();

        assert_eq!(watches.watch_count(), 4);
        assert!(watches.wd_for_path(&dir.path().join("a/b/c")).is_some());
        assert!(watches.bijection_holds());
    }

    #[test]
    fn remove_tree_drops_descendants_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("keep")).unwrap();
        fs::create_dir_all(dir.path().join("drop/sub")).unwrap();

        let watches = manager();
        watches.add_tree(dir.path(), MASK).unwrap();
        let wd = watches.wd_for_path(&dir.path().join("drop")).unwrap();
        watches.remove_tree(wd);

        assert!(watches.wd_for_path(&dir.path().join("drop")).is_none());
        assert!(watches.wd_for_path(&dir.path().join("drop/sub")).is_none());
        assert!(watches.wd_for_path(&dir.path().join("keep")).is_some());
        assert!(watches.bijection_holds());
    }

    #[test]
    fn link_shares_the_target_watch() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let root = dir.path().join("root");
        fs::create_dir_all(&target).unwrap();
        fs::create_dir_all(&root).unwrap();
        symlink(&target, root.join("ln")).unwrap();

        let watches = manager();
        watches.add_tree(&root, MASK).unwrap();

        assert!(watches.is_link(&root.join("ln")));
        assert!(watches.wd_for_path(&target).is_some());
        let aliases = watches.resolve_aliases(&target.join("f.ini"));
        assert_eq!(aliases, vec![root.join("ln/f.ini")]);

        watches.remove_link(&root.join("ln"));
        assert!(watches.wd_for_path(&target).is_none());
    }

    #[test]
    fn direct_watch_survives_link_removal() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        let link = dir.path().join("ln");
        symlink(&target, &link).unwrap();

        let watches = manager();
        watches.add_tree(&target, MASK).unwrap();
        watches.add_link(&link, MASK).unwrap();
        watches.remove_link(&link);

        assert!(watches.wd_for_path(&target).is_some());
    }

    #[test]
    fn rescan_restores_the_bijection() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();

        let watches = manager();
        let roots = vec![dir.path().to_path_buf()];
        watches.add_tree(dir.path(), MASK).unwrap();
        let before = watches.watch_count();

        watches.rescan(&roots, MASK).unwrap();
        assert_eq!(watches.watch_count(), before);
        assert!(watches.bijection_holds());
    }

    #[test]
    fn directory_move_rebases_the_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old");
        fs::create_dir_all(old.join("sub")).unwrap();

        let watches = manager();
        watches.add_tree(dir.path(), MASK).unwrap();
        let root_wd = watches.wd_for_path(dir.path()).unwrap();
        let child_wd = watches.wd_for_path(&old).unwrap();

        // The sequence the worker drives on a rename within the tree:
        // MOVED_FROM scratch, EEXIST on the destination add, MOVE_SELF.
        watches.record_moved_from(root_wd, &old);
        let new = dir.path().join("new");
        fs::rename(&old, &new).unwrap();
        watches.add_child_watch(&new, MASK, root_wd).unwrap();

        let outcome = watches.finish_move(child_wd);
        assert_eq!(
            outcome,
            MoveOutcome::Rebased { from: old.clone(), to: new.clone() }
        );
        assert_eq!(watches.wd_for_path(&new), Some(child_wd));
        assert!(watches.wd_for_path(&new.join("sub")).is_some());
        assert!(watches.wd_for_path(&old).is_none());
        assert!(watches.bijection_holds());
    }

    #[test]
    fn uncommitted_move_unwatches_the_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old");
        fs::create_dir_all(old.join("sub")).unwrap();

        let watches = manager();
        watches.add_tree(dir.path(), MASK).unwrap();
        let root_wd = watches.wd_for_path(dir.path()).unwrap();
        let child_wd = watches.wd_for_path(&old).unwrap();

        watches.record_moved_from(root_wd, &old);
        let outcome = watches.finish_move(child_wd);
        assert_eq!(outcome, MoveOutcome::Removed(old.clone()));
        assert!(watches.wd_for_path(&old).is_none());
        assert!(watches.wd_for_path(&old.join("sub")).is_none());
        assert!(watches.bijection_holds());
    }
}
