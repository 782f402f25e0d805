//! Journal - append-only event record sink.
//!
//! Not part of the hot path: the executor works fine without one. When
//! attached, immutable [`JournalRecord`]s buffer in memory and flush to
//! disk as `.json` or `.csv` files named
//! `{prefix}{-timestamp}{-hash}.{ext}` under the configured directory.
//! Flushing happens when the buffer reaches its capacity, on an explicit
//! `flush()`, and on `shutdown()` when `dump_at_exit` is set.
//!
//! Uses `BufWriter` to batch I/O operations.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::config::{JournalConfig, JournalFormat};
use crate::element::Element;
use crate::error::ConfigError;
use crate::id::Id;
use crate::logging::TRACE_TARGET;

// ============================================================
// RECORDS
// ============================================================

/// One immutable structured record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub id: Id,
    pub created_at: DateTime<Utc>,
    /// Record discriminator, e.g. `api_call`.
    pub kind: String,
    pub content: Value,
}

impl JournalRecord {
    pub fn new(kind: impl Into<String>, content: Value) -> Self {
        Self {
            id: Id::new(),
            created_at: Utc::now(),
            kind: kind.into(),
            content,
        }
    }

    /// Snapshot any serializable element as a record.
    pub fn of<T: Element + Serialize>(kind: impl Into<String>, element: &T) -> Self {
        let content = serde_json::to_value(element).unwrap_or(Value::Null);
        Self::new(kind, content)
    }
}

// ============================================================
// JOURNAL
// ============================================================

/// Buffered journal writing JSON or CSV files.
pub struct Journal {
    config: JournalConfig,
    buffer: Mutex<Vec<JournalRecord>>,
}

impl Journal {
    pub fn new(config: JournalConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            buffer: Mutex::new(Vec::new()),
        })
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Append a record; flushes automatically at capacity. Write errors
    /// are logged, never propagated into the caller's path.
    pub fn record(&self, record: JournalRecord) {
        let full = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.push(record);
            buffer.len() >= self.config.capacity
        };
        if full {
            if let Err(err) = self.flush() {
                error!(target: TRACE_TARGET, %err, "journal flush failed");
            }
        }
    }

    /// Async-context convenience; the write itself is small and buffered.
    pub async fn record_async(&self, record: JournalRecord) {
        self.record(record);
    }

    /// Write all buffered records to a new file. Returns the path, or
    /// `None` when the buffer was empty.
    pub fn flush(&self) -> io::Result<Option<PathBuf>> {
        let records: Vec<JournalRecord> = {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.is_empty() {
                return Ok(None);
            }
            std::mem::take(&mut *buffer)
        };

        fs::create_dir_all(&self.config.dir)?;
        let path = self.config.dir.join(self.file_name(&records));
        let mut writer = BufWriter::new(File::create(&path)?);
        match self.config.format {
            JournalFormat::Json => {
                serde_json::to_writer_pretty(&mut writer, &records)
                    .map_err(|e| io::Error::other(e))?;
            }
            JournalFormat::Csv => {
                writeln!(writer, "id,created_at,kind,content")?;
                for record in &records {
                    writeln!(
                        writer,
                        "{},{},{},{}",
                        record.id,
                        record.created_at.to_rfc3339(),
                        csv_field(&record.kind),
                        csv_field(&record.content.to_string()),
                    )?;
                }
            }
        }
        writer.flush()?;
        info!(
            target: TRACE_TARGET,
            path = %path.display(),
            records = records.len(),
            "journal flushed"
        );
        Ok(Some(path))
    }

    /// Final flush, honoring `dump_at_exit`.
    pub fn shutdown(&self) -> io::Result<Option<PathBuf>> {
        if self.config.dump_at_exit {
            self.flush()
        } else {
            Ok(None)
        }
    }

    fn file_name(&self, records: &[JournalRecord]) -> String {
        let mut name = self.config.prefix.clone();
        if self.config.with_timestamp {
            name.push_str(&Utc::now().format("-%Y%m%d%H%M%S").to_string());
        }
        if self.config.with_hash {
            let joined: String = records.iter().map(|r| r.id.to_string()).collect();
            let digest = md5::compute(joined.as_bytes());
            name.push_str(&format!("-{:.8}", format!("{digest:x}")));
        }
        let ext = match self.config.format {
            JournalFormat::Json => "json",
            JournalFormat::Csv => "csv",
        };
        format!("{name}.{ext}")
    }
}

/// Quote a CSV field, doubling embedded quotes.
fn csv_field(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}
