//! Route matching and dispatch: compiled routes select events by mask and
//! path pattern, then hand the rendered payload to their scheduler, which
//! eventually calls the transport.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info};

use crate::event::{Event, EventMask};
use crate::schedule::HistogramScheduler;
use crate::settings::{RouteSpec, SchedulerSpec};

/// The field map handed to schedulers and transports.
pub type Payload = serde_json::Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("route {tag}: bad pattern: {source}")]
    BadPattern {
        tag: String,
        #[source]
        source: regex::Error,
    },
    #[error("route {tag}: {source}")]
    BadEvents {
        tag: String,
        #[source]
        source: crate::event::UnknownEventName,
    },
}

/// The parts of a route a transport needs to render and address a message.
#[derive(Debug, Clone)]
pub struct RouteMeta {
    pub tag: String,
    pub format: String,
    pub groups: Vec<String>,
}

/// Message sink contract. Concrete backends (file appender here; AMQP,
/// Redis elsewhere) decide their own delivery semantics.
pub trait Transport: Send + Sync {
    fn emit(&self, meta: &RouteMeta, data: &Payload);
}

enum RouteScheduler {
    Direct,
    Histogram(HistogramScheduler),
}

pub struct Route {
    pub meta: Arc<RouteMeta>,
    pub mask: EventMask,
    pattern: regex::bytes::Regex,
    scheduler: RouteScheduler,
}

impl Route {
    fn matches_path(&self, path: &Path) -> bool {
        self.pattern.is_match(path.as_os_str().as_bytes())
    }

    /// Mask intersection plus a full match on the source path, the
    /// destination path, or any symlink alias of the source.
    pub fn matches(&self, event: &Event, aliases: &[PathBuf]) -> bool {
        if !self.mask.intersects(event.mask) {
            return false;
        }
        self.matches_path(&event.src_path)
            || event
                .dest_path
                .as_deref()
                .is_some_and(|dest| self.matches_path(dest))
            || aliases.iter().any(|alias| self.matches_path(alias))
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("tag", &self.meta.tag)
            .field("mask", &self.mask)
            .field("pattern", &self.pattern.as_str())
            .finish()
    }
}

/// Compiled routes plus the shared transport. Compilation happens once at
/// start; a bad pattern, event name, or scheduler is a start-time error.
pub struct Dispatcher {
    routes: Vec<Route>,
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(
        specs: Vec<RouteSpec>,
        transport: Arc<dyn Transport>,
    ) -> Result<Dispatcher, DispatchError> {
        let mut routes = Vec::with_capacity(specs.len());
        for spec in specs {
            let pattern = regex::bytes::Regex::new(&format!("^(?:{})$", spec.pattern))
                .map_err(|source| DispatchError::BadPattern {
                    tag: spec.tag.clone(),
                    source,
                })?;
            let mask = EventMask::parse(&spec.events).map_err(|source| {
                DispatchError::BadEvents {
                    tag: spec.tag.clone(),
                    source,
                }
            })?;
            let meta = Arc::new(RouteMeta {
                tag: spec.tag,
                format: spec.format,
                groups: spec.groups,
            });
            let scheduler = match spec.scheduler {
                SchedulerSpec::Direct => RouteScheduler::Direct,
                SchedulerSpec::Histogram {
                    capacity,
                    interval,
                    key,
                } => RouteScheduler::Histogram(HistogramScheduler::spawn(
                    capacity,
                    (interval > 0.0).then(|| Duration::from_secs_f64(interval)),
                    key,
                    Arc::clone(&meta),
                    Arc::clone(&transport),
                )),
            };
            routes.push(Route {
                meta,
                mask,
                pattern,
                scheduler,
            });
        }
        Ok(Dispatcher { routes, transport })
    }

    pub fn select_routes<'a>(&'a self, event: &Event, aliases: &[PathBuf]) -> Vec<&'a Route> {
        self.routes
            .iter()
            .filter(|route| route.matches(event, aliases))
            .collect()
    }

    /// Fans one event out to every matching route's scheduler.
    pub fn dispatch(&self, event: &Event, aliases: &[PathBuf]) {
        let fields = event.render_fields();
        for route in self.select_routes(event, aliases) {
            let mut data = fields.clone();
            data.insert("tag".to_string(), Value::String(route.meta.tag.clone()));
            match &route.scheduler {
                RouteScheduler::Direct => self.transport.emit(&route.meta, &data),
                RouteScheduler::Histogram(scheduler) => scheduler.put(data),
            }
        }
    }

    /// Operator-facing message, delivered through whatever routes accept
    /// `EX_META` events.
    pub fn dispatch_meta(&self, msg: impl Into<String>) {
        self.dispatch(&Event::meta(msg), &[]);
    }

    /// Union of all route masks; the worker extends this with its
    /// `extra_mask` to decide what reaches the event log.
    pub fn route_mask(&self) -> EventMask {
        let mut mask = EventMask::empty();
        for route in &self.routes {
            mask |= route.mask;
        }
        mask
    }

    /// Stops histogram flush tasks, draining pending windows.
    pub async fn shutdown(&self) {
        for route in &self.routes {
            if let RouteScheduler::Histogram(scheduler) = &route.scheduler {
                scheduler.stop().await;
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.routes)
            .finish()
    }
}

/// Renders a payload value for message text: strings bare, scalars via
/// `Display`, anything structured as compact JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Expands `{field}` references against the payload. Unknown fields render
/// empty; doubled braces escape literal ones.
pub fn format_template(template: &str, data: &Payload) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                // Tolerate format specs after a colon; only the name binds.
                let name = name.split(':').next().unwrap_or("");
                if let Some(value) = data.get(name) {
                    out.push_str(&render_value(value));
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Appends rendered messages to `.fswatch.<tag>.buf`, one line each: the
/// sink a local observer tails.
pub struct FileTransport {
    dir: PathBuf,
    lock: StdMutex<()>,
}

impl FileTransport {
    pub fn new(dir: impl Into<PathBuf>) -> FileTransport {
        FileTransport {
            dir: dir.into(),
            lock: StdMutex::new(()),
        }
    }
}

impl Transport for FileTransport {
    fn emit(&self, meta: &RouteMeta, data: &Payload) {
        let rendered = format_template(&meta.format, data);
        let path = self.dir.join(format!(".fswatch.{}.buf", meta.tag));
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{rendered}"));
        if let Err(err) = result {
            error!("cannot append to {}: {err}", path.display());
        }
    }
}

impl fmt::Debug for FileTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileTransport").field("dir", &self.dir).finish()
    }
}

/// Emits rendered messages into the process log.
#[derive(Debug, Default)]
pub struct TracingTransport;

impl Transport for TracingTransport {
    fn emit(&self, meta: &RouteMeta, data: &Payload) {
        info!(tag = %meta.tag, "{}", format_template(&meta.format, data));
    }
}

/// Collects `(tag, rendered)` pairs in memory; a debugging sink, also used
/// by the test suites.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    messages: StdMutex<Vec<(String, String)>>,
}

impl MemoryTransport {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Transport for MemoryTransport {
    fn emit(&self, meta: &RouteMeta, data: &Payload) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((meta.tag.clone(), format_template(&meta.format, data)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inotify::RawEvent;

    fn event(mask: EventMask, path: &str) -> Event {
        let raw = RawEvent {
            wd: 1,
            mask: mask.kernel_bits(),
            cookie: 0,
            name: Vec::new(),
        };
        Event::from_raw(&raw, PathBuf::from(path))
    }

    fn spec(tag: &str, pattern: &str, events: &str, format: &str) -> RouteSpec {
        RouteSpec {
            tag: tag.to_string(),
            pattern: pattern.to_string(),
            events: events.to_string(),
            format: format.to_string(),
            scheduler: SchedulerSpec::Direct,
            groups: Vec::new(),
        }
    }

    #[test]
    fn template_expansion_is_tolerant() {
        let mut data = Payload::new();
        data.insert("ev_name".to_string(), Value::String("IN_CREATE".into()));
        data.insert("count".to_string(), Value::from(3));
        assert_eq!(
            format_template("Event {ev_name} x{count} {missing}!", &data),
            "Event IN_CREATE x3 !"
        );
        assert_eq!(format_template("{{literal}}", &data), "{literal}");
    }

    #[test]
    fn compile_rejects_bad_routes() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::default());
        let bad_pattern = spec("t", "(", "IN_ALL_EVENTS", "");
        assert!(matches!(
            Dispatcher::new(vec![bad_pattern], Arc::clone(&transport)),
            Err(DispatchError::BadPattern { .. })
        ));
        let bad_events = spec("t", ".*", "IN_NOPE", "");
        assert!(matches!(
            Dispatcher::new(vec![bad_events], transport),
            Err(DispatchError::BadEvents { .. })
        ));
    }

    #[test]
    fn routes_select_on_mask_and_paths() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::default());
        let dispatcher = Dispatcher::new(
            vec![
                spec("ini", r".*\.ini", "IN_MODIFY|IN_CREATE", "{ev_name}"),
                spec("meta", r".*", "EX_META", "{msg}"),
            ],
            transport,
        )
        .unwrap();

        let create = event(EventMask::CREATE, "/etc/app.ini");
        assert_eq!(dispatcher.select_routes(&create, &[]).len(), 1);

        let elsewhere = event(EventMask::CREATE, "/etc/app.conf");
        assert!(dispatcher.select_routes(&elsewhere, &[]).is_empty());

        // An alias under a watched symlink can satisfy the pattern instead.
        let aliases = vec![PathBuf::from("/alias/app.ini")];
        assert_eq!(dispatcher.select_routes(&elsewhere, &aliases).len(), 1);

        let meta = Event::meta("warning");
        let selected = dispatcher.select_routes(&meta, &[]);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].meta.tag, "meta");
    }

    #[test]
    fn rename_matches_on_destination() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::default());
        let dispatcher = Dispatcher::new(
            vec![spec("ini", r".*\.ini", "IN_ALL_EVENTS", "{ev_name}")],
            transport,
        )
        .unwrap();

        let rename = event(EventMask::MOVED_TO, "/tmp/a.tmp")
            .derive(EventMask::RENAME, Some(PathBuf::from("/tmp/a.ini")));
        assert_eq!(dispatcher.select_routes(&rename, &[]).len(), 1);
    }

    #[test]
    fn dispatch_renders_through_the_transport() {
        let memory = Arc::new(MemoryTransport::default());
        let dispatcher = Dispatcher::new(
            vec![spec("logs", r".*", "IN_ALL_EVENTS", "Event {ev_name} on {ev_src}")],
            Arc::clone(&memory) as Arc<dyn Transport>,
        )
        .unwrap();

        dispatcher.dispatch(&event(EventMask::CREATE, "/tmp/f"), &[]);
        let messages = memory.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], ("logs".to_string(), "Event IN_CREATE on /tmp/f".to_string()));
    }
}
