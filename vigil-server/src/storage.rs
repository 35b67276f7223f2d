//! SQLite utterance log.
//!
//! Stores the same row as the CSV sink plus the classifier status, so a
//! fail-open "SAFE" can be told apart from a genuine one after the fact.

use std::path::{Path, PathBuf};

use chrono::{Duration, Local, TimeZone};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use vigil_core::{
    error::{Result as CoreResult, VigilError},
    TelemetrySink, UtteranceRecord,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredUtterance {
    pub id: i64,
    pub created_at: String,
    pub speaker: String,
    pub text: String,
    pub labels: String,
    pub classifier_status: String,
    pub stt_ms: f64,
    pub ai_ms: f64,
    pub latency_ms: f64,
    pub user_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationStats {
    pub range_days: usize,
    pub total_utterances: usize,
    pub labelled: usize,
    pub classifier_unavailable: usize,
    pub avg_latency_ms: f64,
}

pub struct UtteranceStore {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl UtteranceStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, String> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let conn = Connection::open(&db_path).map_err(|e| e.to_string())?;
        init_schema(&conn)?;
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn insert(&self, record: &UtteranceRecord) -> Result<i64, String> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO utterances
            (created_at, speaker, text, labels, classifier_status, stt_ms, ai_ms, latency_ms, user_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.timestamp.timestamp(),
                record.speaker,
                record.text,
                record.labels,
                record.classifier_status,
                record.stt_ms(),
                record.classify_ms(),
                record.total_ms(),
                record.user_count as i64
            ],
        )
        .map_err(|e| e.to_string())?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<StoredUtterance>, String> {
        let limit = limit.clamp(1, 500);
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, created_at, speaker, text, labels, classifier_status, stt_ms, ai_ms, latency_ms, user_count
                 FROM utterances
                 ORDER BY id DESC
                 LIMIT ?1",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let ts: i64 = row.get(1)?;
                Ok(StoredUtterance {
                    id: row.get(0)?,
                    created_at: ts_to_local(ts),
                    speaker: row.get(2)?,
                    text: row.get(3)?,
                    labels: row.get(4)?,
                    classifier_status: row.get(5)?,
                    stt_ms: row.get(6)?,
                    ai_ms: row.get(7)?,
                    latency_ms: row.get(8)?,
                    user_count: row.get::<_, i64>(9)? as usize,
                })
            })
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())
    }

    pub fn stats(&self, range_days: usize) -> Result<ModerationStats, String> {
        let range_days = range_days.clamp(1, 365);
        let cutoff = Local::now() - Duration::days(range_days as i64);
        let conn = self.conn.lock();
        let (total, labelled, unavailable, avg): (i64, i64, i64, Option<f64>) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN classifier_status = 'labels' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN classifier_status = 'unavailable' THEN 1 ELSE 0 END), 0),
                        AVG(latency_ms)
                 FROM utterances
                 WHERE created_at >= ?1",
                params![cutoff.timestamp()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map_err(|e| e.to_string())?;

        Ok(ModerationStats {
            range_days,
            total_utterances: total as usize,
            labelled: labelled as usize,
            classifier_unavailable: unavailable as usize,
            avg_latency_ms: avg.unwrap_or(0.0),
        })
    }
}

impl TelemetrySink for UtteranceStore {
    fn record(&self, record: &UtteranceRecord) -> CoreResult<()> {
        self.insert(record)
            .map(|_| ())
            .map_err(|e| VigilError::Telemetry(format!("{}: {e}", self.db_path.display())))
    }
}

fn init_schema(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS utterances (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          created_at INTEGER NOT NULL,
          speaker TEXT NOT NULL,
          text TEXT NOT NULL,
          labels TEXT NOT NULL,
          classifier_status TEXT NOT NULL,
          stt_ms REAL NOT NULL DEFAULT 0,
          ai_ms REAL NOT NULL DEFAULT 0,
          latency_ms REAL NOT NULL DEFAULT 0,
          user_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_utterances_created_at ON utterances(created_at DESC);
        "#,
    )
    .map_err(|e| e.to_string())
}

fn ts_to_local(ts: i64) -> String {
    Local
        .timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}
