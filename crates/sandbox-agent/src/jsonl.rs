use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};

// ─── JsonlSink ────────────────────────────────────────────────────────────

/// Append-only JSON-lines log file.
///
/// Each record is written as one object: `event`, `level` and an RFC 3339
/// `timestamp`, followed by the fields of the record itself. Cloning shares
/// the underlying file handle, so several tasks may write to one sink.
///
/// Write failures are logged and dropped: the durable log is best-effort
/// and must never take down the workload it describes.
#[derive(Clone)]
pub struct JsonlSink {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl std::fmt::Debug for JsonlSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlSink").field("path", &self.path).finish()
    }
}

impl JsonlSink {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info<T: Serialize>(&self, event: &str, fields: &T) {
        self.record("info", event, fields);
    }

    pub fn warning<T: Serialize>(&self, event: &str, fields: &T) {
        self.record("warning", event, fields);
    }

    fn record<T: Serialize>(&self, level: &str, event: &str, fields: &T) {
        let line = match render(level, event, fields) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "jsonl record not serializable");
                return;
            }
        };

        let result = match self.file.lock() {
            Ok(mut f) => f.write_all(line.as_bytes()).and_then(|_| f.flush()),
            Err(_) => Err(std::io::Error::other("jsonl sink lock poisoned")),
        };
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "jsonl write failed");
        }
    }
}

fn render<T: Serialize>(level: &str, event: &str, fields: &T) -> serde_json::Result<String> {
    let mut obj = Map::new();
    obj.insert("event".into(), Value::String(event.to_string()));
    obj.insert("level".into(), Value::String(level.to_string()));
    obj.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));

    match serde_json::to_value(fields)? {
        Value::Object(extra) => obj.extend(extra),
        Value::Null => {}
        other => {
            obj.insert("value".into(), other);
        }
    }

    let mut line = serde_json::to_string(&Value::Object(obj))?;
    line.push('\n');
    Ok(line)
}

// ─── Tests ────────────────────────────────────────────────────────────────
