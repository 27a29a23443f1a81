//! JSONL diagnostic log shared by the engine, the store, and the CLI.
//!
//! Nothing is written until a sink is installed with [`init_run_logger`];
//! until then [`append_run_log`] is a no-op.

use crate::errors::InterposerError;
use serde::{Deserialize, Serialize};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct LogEvent<'a> {
    pub level: Level,
    pub event_type: &'a str,
    pub payload: Value,
}

/// One line of the log file.
#[derive(Debug, Serialize)]
struct LogLine<'a> {
    at: String,
    level: Level,
    event_type: &'a str,
    payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), InterposerError> {
        let mut line = serde_json::to_string(&LogLine {
            at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level: event.level,
            event_type: event.event_type,
            payload: truncate_json(event.payload.clone(), self.max_payload_bytes),
        })
        .map_err(io_err)?;
        line.push('\n');
        // A line goes out in a single write.
        self.open_log()?.write_all(line.as_bytes()).map_err(io_err)
    }

    fn open_log(&self) -> Result<File, InterposerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)
    }
}

fn io_err(error: impl std::fmt::Display) -> InterposerError {
    InterposerError::Io(error.to_string())
}

static RUN_LOGGER: OnceLock<Mutex<Option<Arc<JsonlLogger>>>> = OnceLock::new();

fn logger_slot() -> &'static Mutex<Option<Arc<JsonlLogger>>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

/// Route every subsequent [`append_run_log`] to `path`.
pub fn init_run_logger(path: impl AsRef<Path>) -> Result<(), InterposerError> {
    let logger = Arc::new(JsonlLogger::new(path));
    let mut slot = logger_slot()
        .lock()
        .map_err(|_| io_err("run logger lock poisoned"))?;
    *slot = Some(logger);
    Ok(())
}

pub fn clear_run_logger() {
    if let Ok(mut slot) = logger_slot().lock() {
        *slot = None;
    }
}

pub fn append_run_log(level: Level, event_type: &str, payload: Value) {
    let logger = match logger_slot().lock() {
        Ok(slot) => slot.as_ref().map(Arc::clone),
        Err(_) => None,
    };
    // Diagnostics never fail the caller.
    if let Some(logger) = logger {
        let _ = logger.append(&LogEvent {
            level,
            event_type,
            payload,
        });
    }
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}

#[cfg(test)]
mod tests {
    use super::{truncate_json, JsonlLogger, Level, LogEvent};
    use chrono::DateTime;
    use serde_json::{json, Value};

    #[test]
    fn logger_truncates_large_payloads_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tape.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.max_payload_bytes = 20;

        logger
            .append(&LogEvent {
                level: Level::Debug,
                event_type: "tape.result.recorded",
                payload: json!({"text": "abcdefghijklmnopqrstuvwxyz"}),
            })
            .expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"event_type\":\"tape.result.recorded\""));
        assert!(text.contains("..."));
    }

    #[test]
    fn each_line_carries_a_timestamp_and_lowercase_level() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("tape.jsonl");
        let logger = JsonlLogger::new(&path);
        for event_type in ["tape_store.opened", "tape_store.closed"] {
            logger
                .append(&LogEvent {
                    level: Level::Warn,
                    event_type,
                    payload: json!({"path": "tape.db"}),
                })
                .expect("append");
        }

        let text = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["level"], "warn");
        assert_eq!(lines[1]["event_type"], "tape_store.closed");
        let at = lines[0]["at"].as_str().expect("at");
        assert!(DateTime::parse_from_rfc3339(at).is_ok(), "bad timestamp {at}");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let value = json!({"text": "ééééééééééééééééé"});
        let truncated = truncate_json(value, 12);
        let text = truncated.as_str().expect("string");
        assert!(text.ends_with("..."));
    }

    #[test]
    fn levels_order_by_severity() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Warn < Level::Error);
        assert_eq!(Level::Trace.as_str(), "trace");
    }
}
