//! tracing configuration.
//!
//! Structured JSON events go to stdout (or `LOG_FORMAT=standard` plain fmt),
//! optionally to a file, and always into an in-memory ring buffer the
//! control plane streams over SSE.
use std::{collections::VecDeque, fmt, fs::OpenOptions, path::Path, sync::Arc};

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{
    field::{Field, Visit},
    Event, Subscriber,
};
use tracing_subscriber::{
    filter::EnvFilter,
    fmt as fmt_layer,
    layer::{Context, Layer},
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

/// log as "json" or "standard" (unstructured)
static DEFAULT_LOG_FORMAT: &str = "standard";

/// lines retained for SSE subscribers
const LOG_BUFFER_MAX: usize = 1000;

/// Bounded in-memory log ring. Each line carries a monotonic sequence number
/// so SSE pollers can ask for "everything since".
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<Ring>>,
}

#[derive(Debug, Default)]
struct Ring {
    next_seq: u64,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: String) {
        let mut ring = self.inner.lock();
        let seq = ring.next_seq;
        ring.next_seq += 1;
        ring.lines.push_back((seq, line));
        if ring.lines.len() > LOG_BUFFER_MAX {
            ring.lines.pop_front();
        }
    }

    /// Everything currently buffered plus the cursor to poll from
    pub fn snapshot(&self) -> (u64, Vec<String>) {
        let ring = self.inner.lock();
        (
            ring.next_seq,
            ring.lines.iter().map(|(_, l)| l.clone()).collect(),
        )
    }

    /// Lines appended at or after `seq`, plus the new cursor
    pub fn since(&self, seq: u64) -> (u64, Vec<String>) {
        let ring = self.inner.lock();
        let lines = ring
            .lines
            .iter()
            .filter(|(s, _)| *s >= seq)
            .map(|(_, l)| l.clone())
            .collect();
        (ring.next_seq, lines)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Layer that renders every event as one JSON line into the ring buffer
#[derive(Debug)]
pub struct BufferLayer {
    buffer: LogBuffer,
}

impl BufferLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for BufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        let mut entry = Map::new();
        entry.insert(
            "timestamp".into(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        entry.insert("level".into(), json!(meta.level().to_string()));
        entry.insert("module".into(), json!(meta.target()));
        for key in ["vlan_id", "source_ip", "target_ip"] {
            entry.insert(key.into(), Value::Null);
        }
        entry.insert(
            "message".into(),
            json!(visitor.message.unwrap_or_default()),
        );
        for (key, value) in visitor.fields {
            entry.insert(key, value);
        }
        self.buffer.push(Value::Object(entry).to_string());
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, json!(format!("{value:?}")));
    }
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, json!(value));
    }
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, json!(value));
    }
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, json!(value));
    }
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, json!(value));
    }
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, json!(value));
    }
}

/// Install the global subscriber: env-filtered stdout fmt (json or standard
/// per `LOG_FORMAT`), optional JSON file sink, and the SSE ring buffer.
pub fn init(level: &str, log_file: Option<&Path>, buffer: LogBuffer) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))?
        .add_directive("hyper=off".parse()?);
    let log_frmt =
        std::env::var("LOG_FORMAT").unwrap_or_else(|_| DEFAULT_LOG_FORMAT.to_string());

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt_layer::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(BufferLayer::new(buffer))
        .with(file_layer);

    match &log_frmt[..] {
        "json" => registry.with(fmt_layer::layer().json()).try_init()?,
        _ => registry.with(fmt_layer::layer()).try_init()?,
    }
    Ok(())
}
