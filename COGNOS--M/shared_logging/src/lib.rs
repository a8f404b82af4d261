#![deny(clippy::all, clippy::pedantic, clippy::nursery, rust_2018_idioms)]
#![warn(missing_docs)]

//! Structured JSON-lines logging shared by every Cognos crate.
//!
//! Records are appended to a file and mirrored to `tracing` so that a process
//! running with a fmt subscriber sees the same stream on stderr.

use std::{
    fs::{self, File},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Warning indicator.
    Warn,
    /// Error indicator.
    Error,
}

impl LogLevel {
    /// Emits the record through `tracing` at the matching level.
    pub fn mirror(self, module: &str, message: &str, metadata: &serde_json::Map<String, serde_json::Value>) {
        let fields = serde_json::Value::Object(metadata.clone());
        match self {
            Self::Debug => tracing::debug!(target: "cognos", module, %fields, "{message}"),
            Self::Info => tracing::info!(target: "cognos", module, %fields, "{message}"),
            Self::Warn => tracing::warn!(target: "cognos", module, %fields, "{message}"),
            Self::Error => tracing::error!(target: "cognos", module, %fields, "{message}"),
        }
    }
}

/// Structured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Component emitting the log (`scheduler`, `dma.pipeline`, ...).
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Dotted event name, e.g. `scheduler.round.completed`.
    pub message: String,
    /// Arbitrary JSON payload for correlation ids and measurements.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record with the provided info.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Attaches a single metadata field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Merges every key of a JSON object into the metadata; other values are ignored.
    #[must_use]
    pub fn with_metadata(mut self, metadata: &serde_json::Value) -> Self {
        if let Some(obj) = metadata.as_object() {
            for (key, value) in obj {
                self.metadata.insert(key.clone(), value.clone());
            }
        }
        self
    }
}

/// Thread-safe JSON logger with append-only semantics.
#[derive(Debug)]
pub struct JsonLogger {
    path: PathBuf,
    min_level: LogLevel,
    writer: Mutex<File>,
}

impl JsonLogger {
    /// Creates or opens a logger at the desired path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        Ok(Self {
            path,
            min_level: LogLevel::Debug,
            writer: Mutex::new(file),
        })
    }

    /// Drops records below `level` before they reach the file.
    #[must_use]
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Writes a log record as JSON line and mirrors it to `tracing`.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        record
            .level
            .mirror(&record.module, &record.message, &record.metadata);
        if record.level < self.min_level {
            return Ok(());
        }
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Returns the underlying file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads every record back from a JSON-lines log, skipping lines that do not parse.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<LogRecord>> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("opening log file {}", path.as_ref().display()))?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Ok(record) = serde_json::from_str::<LogRecord>(&line) {
            records.push(record);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_json_lines() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("runtime.log")).unwrap();
        logger
            .log(&LogRecord::new("scheduler", LogLevel::Info, "scheduler.round").with_field("round", 4))
            .unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("\"message\":\"scheduler.round\""));
        assert!(content.contains("\"round\":4"));
    }

    #[test]
    fn min_level_filters_file_output() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("nested/runtime.log"))
            .unwrap()
            .with_min_level(LogLevel::Warn);
        logger
            .log(&LogRecord::new("bus", LogLevel::Info, "bus.dispatch"))
            .unwrap();
        logger
            .log(&LogRecord::new("bus", LogLevel::Warn, "bus.breaker.opened"))
            .unwrap();
        let records = read_records(logger.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "bus.breaker.opened");
    }

    #[test]
    fn metadata_merges_objects_only() {
        let record = LogRecord::new("dma", LogLevel::Debug, "dma.stage")
            .with_metadata(&serde_json::json!({ "stage": "aggregation", "results": 3 }))
            .with_metadata(&serde_json::json!("ignored"));
        assert_eq!(record.metadata.len(), 2);
    }
}
