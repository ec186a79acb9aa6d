//! Linux filesystem monitor built on raw inotify.
//!
//! The pipeline: the kernel event source feeds the watch manager and the
//! coalescing delay buffer; workers drain logical events into the route
//! dispatcher, the append-only event log, and the config-file version
//! tracker, while the self-observer watches inotify resource usage.

pub mod buffer;
pub mod dispatch;
pub mod event;
pub mod eventlog;
pub mod inotify;
pub mod monitor;
pub mod observer;
pub mod schedule;
pub mod settings;
pub mod tracker;
pub mod watches;
pub mod worker;

pub use event::{Event, EventMask};
pub use monitor::{CommandOutcome, Monitor, MonitorError};
pub use settings::Settings;
