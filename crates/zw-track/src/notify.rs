use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use zw_proto::{EventKind, ZoneEvent};

/// One-way delivery of a titled message. Nothing is reported back.
pub trait NotificationSink: Send {
    fn notify(&mut self, title: &str, body: &str);

    fn notify_event(&mut self, ev: &ZoneEvent) {
        self.notify(&ev.title, &ev.body);
    }
}

impl NotificationSink for Box<dyn NotificationSink> {
    fn notify(&mut self, title: &str, body: &str) {
        (**self).notify(title, body)
    }

    fn notify_event(&mut self, ev: &ZoneEvent) {
        (**self).notify_event(ev)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&mut self, title: &str, body: &str) {
        info!(target: "zonewatch::notify", "{}: {}", title, body);
    }
}

/// Writes each notification as one JSON file in a spool directory.
///
/// Files are named `<unix nanos>-<seq>.json` and never overwritten, so
/// names sort in delivery order.
#[derive(Debug, Clone)]
pub struct SpoolSink {
    dir: PathBuf,
    seq: u64,
}

impl SpoolSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), seq: 0 }
    }

    fn write(&mut self, body: &[u8]) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("notify: spool dir {} unavailable: {}", self.dir.display(), e);
            return;
        }
        let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        loop {
            self.seq += 1;
            let name = self.dir.join(format!("{}-{:06}.json", nanos, self.seq));
            let res = OpenOptions::new().write(true).create_new(true).open(&name)
                .and_then(|mut f| f.write_all(body));
            match res {
                Ok(()) => return,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    warn!("notify: spool write {} failed: {}", name.display(), e);
                    return;
                }
            }
        }
    }
}

impl NotificationSink for SpoolSink {
    fn notify(&mut self, title: &str, body: &str) {
        let v = serde_json::json!({ "title": title, "body": body });
        self.write(v.to_string().as_bytes());
    }

    fn notify_event(&mut self, ev: &ZoneEvent) {
        match serde_json::to_vec(ev) {
            Ok(b) => self.write(&b),
            Err(e) => warn!("notify: encode event failed: {}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Delivered {
    pub title: String,
    pub body: String,
    pub kind: Option<EventKind>,
}

/// Keeps every notification in memory. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    log: Arc<Mutex<Vec<Delivered>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.delivered().into_iter().filter_map(|d| d.kind).collect()
    }

    pub fn len(&self) -> usize {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, d: Delivered) {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).push(d);
    }
}

impl NotificationSink for MemorySink {
    fn notify(&mut self, title: &str, body: &str) {
        self.push(Delivered { title: title.to_string(), body: body.to_string(), kind: None });
    }

    fn notify_event(&mut self, ev: &ZoneEvent) {
        self.push(Delivered { title: ev.title.clone(), body: ev.body.clone(), kind: Some(ev.kind) });
    }
}
