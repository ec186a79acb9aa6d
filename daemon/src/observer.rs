//! The monitor watching itself: kernel-level inotify limit utilization,
//! sliding-window read/event/overflow rates, and the adaptive schedulers
//! that decide how often to look.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tracing::warn;

use crate::dispatch::Dispatcher;
use crate::schedule::{BadInterval, IntervalScheduler, SlidingAverageMeter};

const EPS: f64 = 1e-8;

fn lock_or_recover<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InotifyInfo {
    pub max_queued_events: u64,
    pub max_user_instances: u64,
    pub max_user_watches: u64,
    pub total_instances: u64,
    pub total_watches: u64,
}

fn read_limit(name: &str) -> io::Result<u64> {
    let text = fs::read_to_string(Path::new("/proc/sys/fs/inotify").join(name))?;
    text.trim()
        .parse()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Watch counts of every inotify fd on the system, by pid. Unreadable
/// processes are skipped, so the numbers are a lower bound.
pub fn inotify_procs() -> HashMap<u32, Vec<u64>> {
    let mut procs = HashMap::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return procs;
    };
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(fds) = fs::read_dir(format!("/proc/{pid}/fd")) else {
            continue;
        };
        let mut instances = Vec::new();
        for fd in fds.flatten() {
            let Ok(target) = fs::read_link(fd.path()) else {
                continue;
            };
            if target.as_os_str() != "anon_inode:inotify" && target.as_os_str() != "inotify" {
                continue;
            }
            let fd_name = fd.file_name();
            let fdinfo = format!("/proc/{pid}/fdinfo/{}", fd_name.to_string_lossy());
            let watches = fs::read_to_string(fdinfo)
                .map(|text| {
                    text.lines()
                        .filter(|line| line.starts_with("inotify wd:"))
                        .count() as u64
                })
                .unwrap_or(0);
            instances.push(watches);
        }
        if !instances.is_empty() {
            procs.insert(pid, instances);
        }
    }
    procs
}

/// Kernel limits plus current system-wide usage.
pub fn inotify_info() -> io::Result<InotifyInfo> {
    let procs = inotify_procs();
    Ok(InotifyInfo {
        max_queued_events: read_limit("max_queued_events")?,
        max_user_instances: read_limit("max_user_instances")?,
        max_user_watches: read_limit("max_user_watches")?,
        total_instances: procs.values().map(|v| v.len() as u64).sum(),
        total_watches: procs.values().flatten().sum(),
    })
}

/// Adaptive self-observation: one scheduler checks limit utilization, the
/// other summarizes read/event/overflow rates. Overflows are warned about
/// at most once until a clean window clears the latch.
pub struct SelfObserver {
    dispatcher: Arc<Dispatcher>,
    threshold: f64,
    warned_overflow: AtomicBool,
    n_reads: Arc<StdMutex<SlidingAverageMeter>>,
    n_events: Arc<StdMutex<SlidingAverageMeter>>,
    n_overflows: Arc<StdMutex<SlidingAverageMeter>>,
    schedulers: StdMutex<Vec<IntervalScheduler>>,
}

impl SelfObserver {
    pub fn new(dispatcher: Arc<Dispatcher>, threshold: f64, window: Duration) -> Arc<SelfObserver> {
        Arc::new(SelfObserver {
            dispatcher,
            threshold,
            warned_overflow: AtomicBool::new(false),
            n_reads: Arc::new(StdMutex::new(SlidingAverageMeter::new(window))),
            n_events: Arc::new(StdMutex::new(SlidingAverageMeter::new(window))),
            n_overflows: Arc::new(StdMutex::new(SlidingAverageMeter::new(window))),
            schedulers: StdMutex::new(Vec::new()),
        })
    }

    /// Spawns the two interval schedulers. Bad intervals fail here, at
    /// start, not in the background.
    pub fn start(self: &Arc<Self>, basic: Duration, max: Duration) -> Result<(), BadInterval> {
        let limit_check = {
            let this = Arc::clone(self);
            IntervalScheduler::spawn("limit-check", move || this.warn_limits(), basic, basic, max, Vec::new())?
        };
        let stats = {
            let this = Arc::clone(self);
            IntervalScheduler::spawn(
                "stats-notify",
                move || this.notify_stats(),
                basic,
                basic,
                max,
                vec![
                    Arc::clone(&self.n_reads),
                    Arc::clone(&self.n_events),
                    Arc::clone(&self.n_overflows),
                ],
            )?
        };
        let mut schedulers = lock_or_recover(&self.schedulers);
        schedulers.push(limit_check);
        schedulers.push(stats);
        Ok(())
    }

    pub async fn stop(&self) {
        let drained: Vec<IntervalScheduler> =
            lock_or_recover(&self.schedulers).drain(..).collect();
        for scheduler in drained {
            scheduler.stop().await;
        }
    }

    /// One kernel read completed, carrying `events` records.
    pub fn record_read(&self, events: usize) {
        lock_or_recover(&self.n_reads).update(Some(1.0));
        lock_or_recover(&self.n_events).update(Some(events as f64));
    }

    /// Fire-and-forget from the reader: overflow is counted always, warned
    /// about once per latch.
    pub fn signal_overflow(self: &Arc<Self>) {
        lock_or_recover(&self.n_overflows).update(Some(1.0));
        if !self.warned_overflow.swap(true, Ordering::SeqCst) {
            let dispatcher = Arc::clone(&self.dispatcher);
            // Deliver off the reader's back.
            tokio::spawn(async move {
                dispatcher.dispatch_meta("Inotify overflow occurred");
            });
        }
    }

    fn warn_limits(&self) -> f64 {
        let info = match inotify_info() {
            Ok(info) => info,
            Err(err) => {
                warn!("cannot read inotify limits: {err}");
                return 0.0;
            }
        };
        let instance_used = info.total_instances as f64 / (info.max_user_instances as f64 + EPS);
        let watch_used = info.total_watches as f64 / (info.max_user_watches as f64 + EPS);
        if instance_used > self.threshold || watch_used > self.threshold {
            self.dispatcher.dispatch_meta(format!(
                "Used instances: {} / {} ({:.2}%)\nUsed watches: {} / {} ({:.2}%)",
                info.total_instances,
                info.max_user_instances,
                instance_used * 100.0,
                info.total_watches,
                info.max_user_watches,
                watch_used * 100.0,
            ));
            -1.0
        } else {
            5.0
        }
    }

    fn notify_stats(&self) -> f64 {
        let duration = lock_or_recover(&self.n_overflows).duration();
        let (_, reads) = Self::window(&self.n_reads);
        let (prev_events, events) = Self::window(&self.n_events);
        let (prev_overflows, overflows) = Self::window(&self.n_overflows);

        if overflows > 0.0 {
            self.dispatcher.dispatch_meta(format!(
                "Over past {} secs: {reads} reads, {events} events, {overflows} overflows",
                duration.as_secs(),
            ));
        } else {
            // A clean window re-arms the instant overflow warning.
            self.warned_overflow.store(false, Ordering::SeqCst);
        }

        let prev_ope = prev_overflows / (prev_events + EPS);
        let ope = overflows / (events + EPS);
        if ope > prev_ope {
            1.0
        } else if ope < prev_ope {
            -1.0
        } else {
            0.0
        }
    }

    fn window(meter: &Arc<StdMutex<SlidingAverageMeter>>) -> (f64, f64) {
        let mut meter = lock_or_recover(meter);
        let prev = meter.previous().sum;
        let current = meter.get().sum;
        (prev, current)
    }
}

impl std::fmt::Debug for SelfObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfObserver")
            .field("threshold", &self.threshold)
            .field("warned_overflow", &self.warned_overflow)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{MemoryTransport, Transport};
    use crate::inotify::Inotify;
    use crate::settings::Settings;

    fn meta_dispatcher() -> (Arc<Dispatcher>, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::default());
        let dispatcher = Dispatcher::new(
            Settings::default().routes().unwrap(),
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
        .unwrap();
        (Arc::new(dispatcher), transport)
    }

    #[test]
    fn limits_are_populated() {
        let info = inotify_info().unwrap();
        assert!(info.max_user_instances > 0);
        assert!(info.max_user_watches > 0);
    }

    #[test]
    fn our_own_instance_is_counted() {
        let _inotify = Inotify::init().unwrap();
        let info = inotify_info().unwrap();
        assert!(info.total_instances >= 1);
    }

    #[tokio::test]
    async fn overflow_warns_once_until_the_window_is_clean() {
        let (dispatcher, transport) = meta_dispatcher();
        let observer = SelfObserver::new(dispatcher, 0.9, Duration::from_secs(60));

        // Baseline pass: nothing measured yet, ratio unchanged.
        assert_eq!(observer.notify_stats(), 0.0);

        observer.signal_overflow();
        observer.signal_overflow();
        tokio::task::yield_now().await;
        let overflow_warnings = |transport: &MemoryTransport| {
            transport
                .messages()
                .iter()
                .filter(|(_, msg)| msg.contains("overflow occurred"))
                .count()
        };
        assert_eq!(overflow_warnings(&transport), 1);

        // Overflows in the window: the stats callback reports and speeds up.
        assert_eq!(observer.notify_stats(), 1.0);

        // Drain the window, then a clean pass re-arms the latch.
        lock_or_recover(&observer.n_overflows).reset_duration(Duration::ZERO);
        lock_or_recover(&observer.n_events).reset_duration(Duration::ZERO);
        assert_eq!(observer.notify_stats(), -1.0);
        observer.signal_overflow();
        tokio::task::yield_now().await;
        assert_eq!(overflow_warnings(&transport), 2);
    }

    #[tokio::test]
    async fn schedulers_start_and_stop() {
        let (dispatcher, _transport) = meta_dispatcher();
        let observer = SelfObserver::new(dispatcher, 0.9, Duration::from_secs(600));
        observer
            .start(Duration::from_secs(600), Duration::from_secs(86400))
            .unwrap();
        observer.stop().await;
    }
}
