//! Log and state-change notifications for whatever hosts the sync engine

use anyhow::Result;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Notification consumer. Sinks are invoked inline from the session and
/// server; implementations should return quickly and must not call back
/// into the session.
pub trait EventSink: Send + Sync {
    fn on_log(&self, _message: &str) {}
    fn on_running_changed(&self, _running: bool) {}
    fn on_connection_changed(&self, _connected: bool, _peer: &str) {}
}

/// Handle returned by [`EventBus::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkId(u64);

/// Registered observer list. Delivery order across sinks is unspecified.
#[derive(Default)]
pub struct EventBus {
    sinks: RwLock<Vec<(u64, Arc<dyn EventSink>)>>,
    next_id: Mutex<u64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn EventSink>) -> SinkId {
        let mut next = self.next_id.lock();
        let id = *next;
        *next += 1;
        drop(next);
        self.sinks.write().push((id, sink));
        SinkId(id)
    }

    pub fn unregister(&self, id: SinkId) {
        self.sinks.write().retain(|(sid, _)| *sid != id.0);
    }

    pub fn log(&self, message: &str) {
        for (_, sink) in self.sinks.read().iter() {
            sink.on_log(message);
        }
    }

    pub fn running_changed(&self, running: bool) {
        for (_, sink) in self.sinks.read().iter() {
            sink.on_running_changed(running);
        }
    }

    pub fn connection_changed(&self, connected: bool, peer: &str) {
        for (_, sink) in self.sinks.read().iter() {
            sink.on_connection_changed(connected, peer);
        }
    }
}

/// Sink that mirrors everything to stderr.
pub struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn on_log(&self, message: &str) {
        eprintln!("{message}");
    }
    fn on_running_changed(&self, running: bool) {
        eprintln!("server {}", if running { "running" } else { "stopped" });
    }
    fn on_connection_changed(&self, connected: bool, peer: &str) {
        if connected {
            eprintln!("client connected: {peer}");
        } else {
            eprintln!("client disconnected: {peer}");
        }
    }
}

/// Sink that appends timestamped lines to a log file.
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(f) })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl EventSink for FileSink {
    fn on_log(&self, message: &str) {
        self.line(message);
    }
    fn on_running_changed(&self, running: bool) {
        self.line(&format!("RUNNING {running}"));
    }
    fn on_connection_changed(&self, connected: bool, peer: &str) {
        self.line(&format!("CONNECTED {connected} peer={peer}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        logs: AtomicUsize,
    }

    impl EventSink for CountingSink {
        fn on_log(&self, _message: &str) {
            self.logs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn register_and_unregister() {
        let bus = EventBus::new();
        let sink = Arc::new(CountingSink::default());
        let id = bus.register(sink.clone());

        bus.log("one");
        bus.log("two");
        assert_eq!(sink.logs.load(Ordering::SeqCst), 2);

        bus.unregister(id);
        bus.log("three");
        assert_eq!(sink.logs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn multiple_sinks_all_notified() {
        let bus = EventBus::new();
        let a = Arc::new(CountingSink::default());
        let b = Arc::new(CountingSink::default());
        bus.register(a.clone());
        bus.register(b.clone());

        bus.log("hello");
        assert_eq!(a.logs.load(Ordering::SeqCst), 1);
        assert_eq!(b.logs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.log");
        let sink = FileSink::new(&path).unwrap();
        sink.on_log("first");
        sink.on_connection_changed(true, "10.0.0.2:4242");

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("first"));
        assert!(text.contains("CONNECTED true peer=10.0.0.2:4242"));
    }
}
