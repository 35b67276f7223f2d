//! Per-utterance telemetry.
//!
//! The pipeline emits one [`UtteranceRecord`] per utterance that reached the
//! classifier, in arrival order per session. Sinks are synchronous and cheap;
//! a failing sink is logged and never stalls the pipeline.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Result, VigilError};

pub const CSV_HEADER: &str = "timestamp,user,text,toxic_labels,stt_time,ai_time,latency_ms,user_count";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub struct UtteranceRecord {
    pub timestamp: DateTime<Local>,
    pub speaker: String,
    pub text: String,
    /// `SAFE` or the `;`-joined label names.
    pub labels: String,
    /// `safe`, `labels` or `unavailable`.
    pub classifier_status: String,
    pub stt: Duration,
    pub classify: Duration,
    pub user_count: usize,
}

impl UtteranceRecord {
    pub fn total(&self) -> Duration {
        self.stt + self.classify
    }

    pub fn stt_ms(&self) -> f64 {
        self.stt.as_secs_f64() * 1000.0
    }

    pub fn classify_ms(&self) -> f64 {
        self.classify.as_secs_f64() * 1000.0
    }

    pub fn total_ms(&self) -> f64 {
        self.total().as_secs_f64() * 1000.0
    }

    pub fn formatted_timestamp(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    /// One CSV line without the trailing newline.
    pub fn to_csv_row(&self) -> String {
        [
            self.formatted_timestamp(),
            csv_field(&self.speaker),
            csv_field(&self.text),
            csv_field(&self.labels),
            format!("{:.2}", self.stt_ms()),
            format!("{:.2}", self.classify_ms()),
            format!("{:.2}", self.total_ms()),
            self.user_count.to_string(),
        ]
        .join(",")
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: &UtteranceRecord) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&self, _record: &UtteranceRecord) -> Result<()> {
        Ok(())
    }
}

/// Keeps records in memory, mostly for tests and `/api` inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<UtteranceRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UtteranceRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, record: &UtteranceRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Appends rows to a CSV file. The header is written once, when the file is
/// created or found empty.
pub struct CsvSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl CsvSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{CSV_HEADER}")?;
            info!(path = %path.display(), "telemetry csv created");
        } else {
            debug!(path = %path.display(), "appending to existing telemetry csv");
        }
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySink for CsvSink {
    fn record(&self, record: &UtteranceRecord) -> Result<()> {
        let mut file = self.file.lock();
        writeln!(file, "{}", record.to_csv_row())
            .and_then(|_| file.flush())
            .map_err(|e| VigilError::Telemetry(format!("{}: {e}", self.path.display())))
    }
}

/// Fans one record out to several sinks. Every sink is attempted; the first
/// error is returned.
pub struct FanoutSink {
    sinks: Vec<std::sync::Arc<dyn TelemetrySink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }
}

impl TelemetrySink for FanoutSink {
    fn record(&self, record: &UtteranceRecord) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(record) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
