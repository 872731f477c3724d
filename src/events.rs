//! Append-only event log for lifecycle events and API calls.
//!
//! Events go to the console through `tracing` and, for [`FileEventSink`], to one
//! file per level per UTC day under the log directory. Sink failures never reach
//! the caller.

use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

const OUTPUT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }
}

/// Destination for structured events.
///
/// Implementors only provide [`EventSink::record`]; the lifecycle helpers build
/// the message and data payload consistently for every sink.
pub trait EventSink: Send + Sync {
    fn record(&self, level: EventLevel, message: &str, data: Option<Value>);

    fn flush(&self) {}

    fn close(&self) {
        self.flush();
    }

    fn debug(&self, message: &str, data: Option<Value>) {
        self.record(EventLevel::Debug, message, data);
    }

    fn info(&self, message: &str, data: Option<Value>) {
        self.record(EventLevel::Info, message, data);
    }

    fn warn(&self, message: &str, data: Option<Value>) {
        self.record(EventLevel::Warn, message, data);
    }

    fn error(&self, message: &str, data: Option<Value>) {
        self.record(EventLevel::Error, message, data);
    }

    fn question_created(&self, question_id: &str, question_text: &str) {
        self.info(
            &format!("Question created: {}", question_id),
            Some(json!({ "questionId": question_id, "questionText": question_text })),
        );
    }

    fn answer_submitted(&self, question_id: &str, selected_option: &str, comment: Option<&str>) {
        self.info(
            &format!("Answer submitted: {}", question_id),
            Some(json!({
                "questionId": question_id,
                "selectedOption": selected_option,
                "comment": comment,
            })),
        );
    }

    fn answer_cancelled(&self, question_id: &str) {
        self.info(
            &format!("Answer cancelled: {}", question_id),
            Some(json!({ "questionId": question_id })),
        );
    }

    fn api_call(&self, method: &str, endpoint: &str, status: u16, duration_ms: u128) {
        self.info(
            &format!("API {} {}", method, endpoint),
            Some(json!({
                "method": method,
                "endpoint": endpoint,
                "status": status,
                "duration": format!("{}ms", duration_ms),
            })),
        );
    }

    fn delegate_call(
        &self,
        command: &str,
        args: &[String],
        success: bool,
        output: &str,
        error: Option<&str>,
    ) {
        let level = if success {
            EventLevel::Info
        } else {
            EventLevel::Error
        };
        self.record(
            level,
            &format!("Delegate call: {}", command),
            Some(json!({
                "command": command,
                "args": args,
                "success": success,
                "output": preview(output),
                "error": error,
            })),
        );
    }
}

/// First 200 characters of delegate output
pub fn preview(output: &str) -> String {
    output.chars().take(OUTPUT_PREVIEW_CHARS).collect()
}

/// `[<timestamp>] [<LEVEL>] <message> | Data: <json>`
pub fn format_line(timestamp: &str, level: EventLevel, message: &str, data: Option<&Value>) -> String {
    let data_str = data
        .map(|d| format!(" | Data: {}", d))
        .unwrap_or_default();
    format!(
        "[{}] [{}] {}{}",
        timestamp,
        level.as_str().to_uppercase(),
        message,
        data_str
    )
}

fn console(level: EventLevel, message: &str) {
    match level {
        EventLevel::Debug => tracing::debug!("{}", message),
        EventLevel::Info => tracing::info!("{}", message),
        EventLevel::Warn => tracing::warn!("{}", message),
        EventLevel::Error => tracing::error!("{}", message),
    }
}

#[derive(Default)]
struct OpenFiles {
    closed: bool,
    handles: HashMap<PathBuf, File>,
}

/// Event sink mirroring every record to the console and to daily per-level log files
pub struct FileEventSink {
    log_dir: PathBuf,
    debug_enabled: bool,
    files: Mutex<OpenFiles>,
}

impl FileEventSink {
    /// Create the log directory and return a sink writing into it
    pub fn open(log_dir: impl Into<PathBuf>, debug_enabled: bool) -> std::io::Result<Self> {
        let log_dir = log_dir.into();
        std::fs::create_dir_all(&log_dir)?;
        Ok(Self {
            log_dir,
            debug_enabled,
            files: Mutex::new(OpenFiles::default()),
        })
    }

    /// `<log_dir>/<level>_<YYYY-MM-DD>.log` for the current UTC day
    pub fn log_file_for(&self, level: EventLevel) -> PathBuf {
        let date = Utc::now().format("%Y-%m-%d");
        self.log_dir.join(format!("{}_{}.log", level.as_str(), date))
    }

    /// Blocking write on the calling thread. Lines are short and appended to an
    /// already-open handle, so the lock is held only for one small write.
    fn append(&self, level: EventLevel, line: &str) -> std::io::Result<()> {
        let path = self.log_file_for(level);
        let mut files = self
            .files
            .lock()
            .map_err(|_| std::io::Error::other("event log lock poisoned"))?;
        if files.closed {
            return Ok(());
        }
        // Handles from a previous day are dropped when the date rolls over.
        if !files.handles.contains_key(&path) {
            let prefix = format!("{}_", level.as_str());
            files.handles.retain(|p, _| {
                !p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix))
            });
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            files.handles.insert(path.clone(), file);
        }
        if let Some(file) = files.handles.get_mut(&path) {
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }
}

impl EventSink for FileEventSink {
    fn record(&self, level: EventLevel, message: &str, data: Option<Value>) {
        if level == EventLevel::Debug && !self.debug_enabled {
            return;
        }
        console(level, message);

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let line = format_line(&timestamp, level, message, data.as_ref());
        if let Err(e) = self.append(level, &line) {
            tracing::error!("Failed to write event log: {}", e);
        }
    }

    fn flush(&self) {
        if let Ok(mut files) = self.files.lock() {
            for (path, file) in files.handles.iter_mut() {
                if let Err(e) = file.flush() {
                    tracing::error!("Failed to flush event log {}: {}", path.display(), e);
                }
            }
        }
    }

    fn close(&self) {
        self.flush();
        if let Ok(mut files) = self.files.lock() {
            files.handles.clear();
            files.closed = true;
        }
    }
}

/// A recorded event, as kept by [`MemorySink`]
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub level: EventLevel,
    pub message: String,
    pub data: Option<Value>,
}

/// In-memory sink for tests
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<EventRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Records whose message starts with `prefix`
    pub fn matching(&self, prefix: &str) -> Vec<EventRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.message.starts_with(prefix))
            .collect()
    }
}

impl EventSink for MemorySink {
    fn record(&self, level: EventLevel, message: &str, data: Option<Value>) {
        if let Ok(mut records) = self.records.lock() {
            records.push(EventRecord {
                level,
                message: message.to_string(),
                data,
            });
        }
    }
}
