//! One worker per monitored path set: owns an inotify instance, keeps its
//! watch tree aligned with the filesystem, coalesces raw events through
//! the delay buffer, and drives dispatch, the event log, and the tracker.

use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use serde_json::json;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::buffer::EventBuffer;
use crate::dispatch::Dispatcher;
use crate::event::{procs_for_path, Event, EventMask};
use crate::eventlog::LogWriter;
use crate::inotify::{Inotify, RawEvent, DEFAULT_BUFFER_SIZE};
use crate::observer::SelfObserver;
use crate::tracker::FileTracker;
use crate::watches::{WatchError, WatchManager};

fn lock_or_recover<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("cannot create inotify instance: {0}")]
    Init(#[from] std::io::Error),
    #[error(transparent)]
    Watch(#[from] WatchError),
}

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub dispatcher: Arc<Dispatcher>,
    pub tracker: Arc<FileTracker>,
    pub observer: Arc<SelfObserver>,
    pub log: LogWriter,
    /// Events recorded to the log: the route masks plus `extra_mask`.
    pub log_mask: EventMask,
    /// Delay-buffer hold interval.
    pub hold: Duration,
    pub probe_procs: bool,
}

struct FdHandle(Arc<Inotify>);

impl AsRawFd for FdHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

pub struct Worker {
    pub tid: usize,
    watches: Arc<WatchManager>,
    buffer: Arc<EventBuffer>,
    ctx: WorkerContext,
    kernel_mask: u32,
    pid: u32,
    roots: StdMutex<Vec<PathBuf>>,
    crashed: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Builds the watch tree for `roots` and starts the reader and
    /// consumer tasks. An unexpected `inotify_add_watch` errno here or
    /// later is fatal to this worker only.
    pub fn spawn(
        tid: usize,
        roots: Vec<PathBuf>,
        ctx: WorkerContext,
    ) -> Result<Arc<Worker>, WorkerError> {
        let inotify = Arc::new(Inotify::init()?);
        let watches = Arc::new(WatchManager::new(Arc::clone(&inotify)));
        let kernel_mask = libc::IN_ALL_EVENTS;
        for root in &roots {
            watches.add_tree(root, kernel_mask)?;
        }
        debug!("worker {tid}: watching {} directories", watches.watch_count());

        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = Arc::new(Worker {
            tid,
            watches,
            buffer: Arc::new(EventBuffer::new(ctx.hold)),
            ctx,
            kernel_mask,
            pid: std::process::id(),
            roots: StdMutex::new(roots),
            crashed: Arc::new(AtomicBool::new(false)),
            stop_tx,
            tasks: StdMutex::new(Vec::new()),
        });

        let afd = AsyncFd::with_interest(FdHandle(inotify), Interest::READABLE)?;
        let reader = tokio::spawn(Arc::clone(&worker).reader_loop(afd, stop_rx));
        let consumer = tokio::spawn(Arc::clone(&worker).consumer_loop());
        *lock_or_recover(&worker.tasks) = vec![reader, consumer];
        Ok(worker)
    }

    async fn reader_loop(
        self: Arc<Worker>,
        afd: AsyncFd<FdHandle>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
        loop {
            let raws = tokio::select! {
                _ = stop_rx.changed() => break,
                guard = afd.readable() => {
                    let mut guard = match guard {
                        Ok(guard) => guard,
                        Err(err) => {
                            error!("worker {}: reactor failure: {err}", self.tid);
                            self.crashed.store(true, Ordering::SeqCst);
                            break;
                        }
                    };
                    match guard.try_io(|inner| inner.get_ref().0.read_raw(&mut buf)) {
                        Err(_would_block) => continue,
                        Ok(Ok(raws)) => raws,
                        Ok(Err(err)) if err.raw_os_error() == Some(libc::EBADF) => break,
                        Ok(Err(err)) => {
                            error!("worker {}: inotify read failed: {err}", self.tid);
                            self.crashed.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            };
            if raws.is_empty() {
                continue;
            }
            self.ctx.observer.record_read(raws.len());
            match self.process_batch(raws) {
                Ok(events) => self.buffer.push_batch(events).await,
                Err(err) => {
                    error!("worker {} crashed: {err}", self.tid);
                    self.crashed.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
        self.buffer.close().await;
    }

    /// Resolves paths, applies per-event watch side effects, and turns one
    /// raw batch into logical events for the buffer.
    fn process_batch(&self, raws: Vec<RawEvent>) -> Result<Vec<Event>, WatchError> {
        let mut events = Vec::with_capacity(raws.len());
        for raw in raws {
            let mask = EventMask(raw.mask as u64);
            if mask.intersects(EventMask::Q_OVERFLOW) {
                self.ctx.observer.signal_overflow();
                error!(
                    "worker {}: inotify queue overflow, events were lost; rescanning roots",
                    self.tid
                );
                let roots = lock_or_recover(&self.roots).clone();
                self.watches.rescan(&roots, self.kernel_mask)?;
                continue;
            }
            let Some(dir) = self.watches.path_for_wd(raw.wd) else {
                // Stale wd from a watch already pruned.
                continue;
            };
            let path = if raw.name.is_empty() {
                dir
            } else {
                dir.join(std::ffi::OsStr::from_bytes(&raw.name))
            };
            let mut event = Event::from_raw(&raw, path.clone());

            if mask.intersects(EventMask::IGNORED) || mask.intersects(EventMask::MOVE_SELF) {
                // Settle a pending directory move, or drop the watch state
                // of a deleted directory.
                self.watches.finish_move(raw.wd);
                events.push(event);
                continue;
            }

            if mask.contains(EventMask::ISDIR | EventMask::CREATE)
                || mask.contains(EventMask::ISDIR | EventMask::MOVED_TO)
            {
                self.watches.add_child_watch(&path, self.kernel_mask, raw.wd)?;
            }
            if mask.contains(EventMask::ISDIR | EventMask::MOVED_FROM) {
                self.watches.record_moved_from(raw.wd, &path);
            }
            if !mask.intersects(EventMask::ISDIR) {
                if mask.intersects(EventMask::CREATE) && path.is_symlink() {
                    self.watches.add_link(&path, self.kernel_mask)?;
                }
                if mask.intersects(EventMask::DELETE) && self.watches.is_link(&path) {
                    self.watches.remove_link(&path);
                }
            }

            if self.ctx.probe_procs {
                event
                    .fields
                    .insert("ev_proc".to_string(), json!(procs_for_path(&path)));
            }
            events.push(event);
        }
        Ok(events)
    }

    async fn consumer_loop(self: Arc<Worker>) {
        while let Some(event) = self.buffer.next().await {
            if event.is_suppressed() {
                // Mid-burst modify markers exist only to pair; drop them.
                continue;
            }
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&self, event: Event) {
        if event.mask.contains(EventMask::RENAME) && !event.is_dir() {
            if let Some(dest) = event.dest_path.clone() {
                if let Err(err) = self.ctx.tracker.rename(&event.src_path, &dest).await {
                    warn!("tracker rename failed: {err}");
                }
            }
        }

        let tracker_mask = EventMask::CREATE | EventMask::MODIFY | EventMask::MOVED_TO;
        if !event.is_dir() && event.mask.intersects(tracker_mask) {
            let target = event
                .dest_path
                .clone()
                .unwrap_or_else(|| event.src_path.clone());
            match self.ctx.tracker.consider(&target).await {
                Ok(Some(config_event)) => self.emit(config_event),
                Ok(None) => {}
                Err(err) => warn!("tracker failed on {}: {err}", target.display()),
            }
        }

        self.emit(event);
    }

    fn emit(&self, event: Event) {
        let mut aliases = self.watches.resolve_aliases(&event.src_path);
        if let Some(dest) = &event.dest_path {
            aliases.extend(self.watches.resolve_aliases(dest));
        }
        self.ctx.dispatcher.dispatch(&event, &aliases);
        if self.ctx.log_mask.intersects(event.mask) {
            self.ctx.log.submit(&event, self.pid);
        }
    }

    /// Full teardown-and-rebuild of the watch tree, as after an overflow.
    pub fn rescan(&self) -> Result<(), WatchError> {
        let roots = lock_or_recover(&self.roots).clone();
        self.watches.rescan(&roots, self.kernel_mask)
    }

    /// Re-points this worker at a new set of roots.
    pub fn rewatch(&self, roots: Vec<PathBuf>) -> Result<(), WatchError> {
        *lock_or_recover(&self.roots) = roots;
        self.rescan()
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        lock_or_recover(&self.roots).clone()
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    pub fn watch_count(&self) -> usize {
        self.watches.watch_count()
    }

    /// Stops both tasks and drains the buffer. Safe to call twice.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        self.buffer.close().await;
        let tasks: Vec<JoinHandle<()>> = lock_or_recover(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("tid", &self.tid)
            .field("roots", &self.roots())
            .field("watches", &self.watches.watch_count())
            .field("crashed", &self.is_crashed())
            .finish()
    }
}
