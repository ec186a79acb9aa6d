//! Meters and schedulers: sliding-window and histogram meters, the
//! adaptive interval scheduler used by the self-observer, and the
//! histogram batcher attached to routes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::dispatch::{render_value, Payload, RouteMeta, Transport};

const EPS: f64 = 1e-8;

fn lock_or_recover<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterStats {
    pub sum: f64,
    pub avg: f64,
}

/// Sum/average over a sliding time window.
#[derive(Debug)]
pub struct SlidingAverageMeter {
    queue: VecDeque<(Instant, f64)>,
    duration: Duration,
    prev: Option<MeterStats>,
}

impl SlidingAverageMeter {
    pub fn new(duration: Duration) -> SlidingAverageMeter {
        SlidingAverageMeter {
            queue: VecDeque::new(),
            duration,
            prev: None,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn reset_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    pub fn update(&mut self, value: Option<f64>) {
        let now = Instant::now();
        if let Some(value) = value {
            self.queue.push_back((now, value));
        }
        while let Some(&(t, _)) = self.queue.front() {
            if t + self.duration <= now {
                self.queue.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current window stats; also remembered as the `previous` snapshot.
    pub fn get(&mut self) -> MeterStats {
        self.update(None);
        let sum: f64 = self.queue.iter().map(|&(_, v)| v).sum();
        let avg = sum / (self.queue.len() as f64 + EPS);
        let stats = MeterStats { sum, avg };
        self.prev = Some(stats);
        stats
    }

    /// The snapshot taken by the last `get`, or a fresh one if none exists.
    pub fn previous(&mut self) -> MeterStats {
        match self.prev {
            Some(stats) => {
                self.update(None);
                stats
            }
            None => self.get(),
        }
    }
}

/// Groups payloads by a key field between flushes.
#[derive(Debug)]
pub struct HistogramMeter {
    key: String,
    data: BTreeMap<String, Vec<Value>>,
    count: usize,
    tic: DateTime<Utc>,
    toc: DateTime<Utc>,
}

impl HistogramMeter {
    pub fn new(key: impl Into<String>) -> HistogramMeter {
        let now = Utc::now();
        HistogramMeter {
            key: key.into(),
            data: BTreeMap::new(),
            count: 0,
            tic: now,
            toc: now,
        }
    }

    pub fn update(&mut self, value: Option<&Payload>) {
        self.toc = Utc::now();
        if let Some(value) = value {
            // A payload without the key field lands under the empty key so
            // counts still reconcile with `count`.
            let key = value.get(&self.key).map(render_value).unwrap_or_default();
            self.data
                .entry(key)
                .or_default()
                .push(Value::Object(value.clone()));
            self.count += 1;
        }
    }

    pub fn size(&self) -> usize {
        self.count
    }

    /// Drains the window into a flush payload and starts the next one.
    pub fn take(&mut self) -> Payload {
        self.update(None);
        let histogram: Payload = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.len())))
            .collect();
        let all_data: Payload = std::mem::take(&mut self.data)
            .into_iter()
            .map(|(k, v)| (k, Value::Array(v)))
            .collect();
        let mut payload = Payload::new();
        payload.insert(
            "from_time".to_string(),
            Value::String(self.tic.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
        );
        payload.insert(
            "to_time".to_string(),
            Value::String(self.toc.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
        );
        payload.insert("all_data".to_string(), Value::Object(all_data));
        payload.insert("histogram".to_string(), Value::Object(histogram));
        payload.insert("count".to_string(), Value::from(self.count));
        self.count = 0;
        self.tic = self.toc;
        payload
    }
}

#[derive(Debug, thiserror::Error)]
#[error("bad interval values: init {init:?}, min {min:?}, max {max:?}")]
pub struct BadInterval {
    pub init: Duration,
    pub min: Duration,
    pub max: Duration,
}

/// `interval * 2^(-priority)`, clamped to `[min, max]`.
pub fn scale_interval(
    interval: Duration,
    priority: f64,
    min: Duration,
    max: Duration,
) -> Duration {
    let scaled = interval.as_secs_f64() * 2f64.powf(-priority);
    Duration::from_secs_f64(scaled.clamp(min.as_secs_f64(), max.as_secs_f64()))
}

/// Calls a callback on a self-adjusting period: the callback returns a
/// signed priority, a positive one shortens the period and a negative one
/// stretches it, within `[min, max]`.
#[derive(Debug)]
pub struct IntervalScheduler {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl IntervalScheduler {
    pub fn spawn<F>(
        name: &'static str,
        mut callback: F,
        init: Duration,
        min: Duration,
        max: Duration,
        stats: Vec<Arc<StdMutex<SlidingAverageMeter>>>,
    ) -> Result<IntervalScheduler, BadInterval>
    where
        F: FnMut() -> f64 + Send + 'static,
    {
        if init < min || init > max || min < Duration::from_secs(1) {
            return Err(BadInterval { init, min, max });
        }
        let stop = Arc::new(Notify::new());
        let stopped = Arc::clone(&stop);
        let handle = tokio::spawn(async move {
            let mut interval = init;
            let mut timeout = interval;
            loop {
                tokio::select! {
                    _ = stopped.notified() => break,
                    _ = tokio::time::sleep(timeout) => {
                        let started = Instant::now();
                        let priority = callback();
                        let prev = interval;
                        interval = scale_interval(interval, priority, min, max);
                        if interval != prev {
                            debug!("{name}: interval {prev:?} -> {interval:?}");
                        }
                        for meter in &stats {
                            lock_or_recover(meter).reset_duration(interval);
                        }
                        // Only in case the callback took longer than the
                        // whole interval.
                        timeout = match interval.checked_sub(started.elapsed()) {
                            Some(left) if left > Duration::ZERO => left,
                            _ => {
                                error!("{name}: callback overran its interval");
                                min
                            }
                        };
                    }
                }
            }
        });
        Ok(IntervalScheduler { stop, handle })
    }

    pub async fn stop(self) {
        self.stop.notify_one();
        let _ = self.handle.await;
    }
}

/// Route-local batcher: flushes when the histogram reaches capacity
/// (synchronously, in the caller) or when the interval elapses (in a
/// background task). The two race on the meter lock.
pub struct HistogramScheduler {
    meter: Arc<StdMutex<HistogramMeter>>,
    capacity: usize,
    kick: Arc<Notify>,
    stop: Arc<Notify>,
    meta: Arc<RouteMeta>,
    transport: Arc<dyn Transport>,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl HistogramScheduler {
    pub fn spawn(
        capacity: usize,
        interval: Option<Duration>,
        key: impl Into<String>,
        meta: Arc<RouteMeta>,
        transport: Arc<dyn Transport>,
    ) -> HistogramScheduler {
        let meter = Arc::new(StdMutex::new(HistogramMeter::new(key)));
        let kick = Arc::new(Notify::new());
        let stop = Arc::new(Notify::new());
        let handle = tokio::spawn(Self::flush_loop(
            Arc::clone(&meter),
            interval,
            Arc::clone(&kick),
            Arc::clone(&stop),
            Arc::clone(&meta),
            Arc::clone(&transport),
        ));
        HistogramScheduler {
            meter,
            capacity,
            kick,
            stop,
            meta,
            transport,
            handle: StdMutex::new(Some(handle)),
        }
    }

    pub fn put(&self, payload: Payload) {
        let flushed = {
            let mut meter = lock_or_recover(&self.meter);
            meter.update(Some(&payload));
            if self.capacity > 0 && meter.size() >= self.capacity {
                Some(meter.take())
            } else {
                None
            }
        };
        if let Some(data) = flushed {
            self.transport.emit(&self.meta, &data);
            // Restart the interval window after a capacity flush.
            self.kick.notify_one();
        }
    }

    async fn flush_loop(
        meter: Arc<StdMutex<HistogramMeter>>,
        interval: Option<Duration>,
        kick: Arc<Notify>,
        stop: Arc<Notify>,
        meta: Arc<RouteMeta>,
        transport: Arc<dyn Transport>,
    ) {
        loop {
            match interval {
                Some(interval) => {
                    tokio::select! {
                        _ = stop.notified() => break,
                        _ = kick.notified() => continue,
                        _ = tokio::time::sleep(interval) => {
                            let data = {
                                let mut meter = lock_or_recover(&meter);
                                (meter.size() > 0).then(|| meter.take())
                            };
                            if let Some(data) = data {
                                transport.emit(&meta, &data);
                            }
                        }
                    }
                }
                None => {
                    stop.notified().await;
                    break;
                }
            }
        }
        // Drain whatever is pending on shutdown.
        let data = {
            let mut meter = lock_or_recover(&meter);
            (meter.size() > 0).then(|| meter.take())
        };
        if let Some(data) = data {
            transport.emit(&meta, &data);
        }
    }

    pub async fn stop(&self) {
        self.stop.notify_one();
        let handle = lock_or_recover(&self.handle).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for HistogramScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistogramScheduler")
            .field("capacity", &self.capacity)
            .field("tag", &self.meta.tag)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MemoryTransport;

    #[test]
    fn interval_scaling_stays_clamped() {
        let min = Duration::from_secs(60);
        let max = Duration::from_secs(3600);
        let mut interval = Duration::from_secs(600);
        for &priority in &[5.0, 5.0, 5.0, -1.0, -1.0, -30.0, 8.0, 0.0] {
            interval = scale_interval(interval, priority, min, max);
            assert!(interval >= min && interval <= max);
        }
        // Extreme positive priority pins to min, negative to max.
        assert_eq!(scale_interval(max, 50.0, min, max), min);
        assert_eq!(scale_interval(min, -50.0, min, max), max);
    }

    #[test]
    fn bad_intervals_fail_at_start() {
        assert!(matches!(
            IntervalScheduler::spawn(
                "bad",
                || 0.0,
                Duration::from_secs(1),
                Duration::from_secs(10),
                Duration::from_secs(100),
                Vec::new(),
            ),
            Err(BadInterval { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_meter_trims_its_window() {
        let mut meter = SlidingAverageMeter::new(Duration::from_secs(10));
        meter.update(Some(1.0));
        tokio::time::advance(Duration::from_secs(6)).await;
        meter.update(Some(2.0));
        assert_eq!(meter.get().sum, 3.0);

        tokio::time::advance(Duration::from_secs(5)).await;
        let stats = meter.get();
        assert_eq!(stats.sum, 2.0);
        assert_eq!(meter.previous().sum, 2.0);
    }

    #[test]
    fn histogram_meter_groups_by_key() {
        let mut meter = HistogramMeter::new("ev_name");
        for name in ["IN_CREATE", "IN_CREATE", "IN_DELETE"] {
            let mut payload = Payload::new();
            payload.insert("ev_name".to_string(), Value::String(name.to_string()));
            meter.update(Some(&payload));
        }
        assert_eq!(meter.size(), 3);

        let flush = meter.take();
        assert_eq!(flush["count"], Value::from(3));
        assert_eq!(flush["histogram"]["IN_CREATE"], Value::from(2));
        assert_eq!(flush["histogram"]["IN_DELETE"], Value::from(1));
        assert_eq!(meter.size(), 0);
    }

    #[tokio::test]
    async fn histogram_scheduler_flushes_on_capacity() {
        let transport = Arc::new(MemoryTransport::default());
        let meta = Arc::new(RouteMeta {
            tag: "stats".to_string(),
            format: "{count} events".to_string(),
            groups: Vec::new(),
        });
        let scheduler = HistogramScheduler::spawn(
            2,
            None,
            "ev_name",
            meta,
            Arc::clone(&transport) as Arc<dyn Transport>,
        );

        let mut payload = Payload::new();
        payload.insert("ev_name".to_string(), Value::String("IN_CREATE".into()));
        scheduler.put(payload.clone());
        assert!(transport.messages().is_empty());
        scheduler.put(payload);
        let messages = transport.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].1, "2 events");
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn histogram_scheduler_flushes_on_interval() {
        let transport = Arc::new(MemoryTransport::default());
        let meta = Arc::new(RouteMeta {
            tag: "stats".to_string(),
            format: "{count} events".to_string(),
            groups: Vec::new(),
        });
        let scheduler = HistogramScheduler::spawn(
            100,
            Some(Duration::from_secs(5)),
            "ev_name",
            meta,
            Arc::clone(&transport) as Arc<dyn Transport>,
        );

        let mut payload = Payload::new();
        payload.insert("ev_name".to_string(), Value::String("IN_CREATE".into()));
        scheduler.put(payload);

        // Paused time: the sleep auto-advances through the scheduler's
        // 5 s flush timer before completing.
        tokio::time::sleep(Duration::from_secs(6)).await;
        let messages = transport.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].1, "1 events");
        scheduler.stop().await;
    }
}
