//! Session recording for offline analysis.
//!
//! Streams telemetry rows to disk while a session runs and writes the final
//! summary when it ends.
//!
//! # Storage Format
//!
//! Each recording is a directory `<output_dir>/<unix-seconds>-<uuid>/`:
//! - `telemetry.csv`: one row per Racer round or Fortress block
//! - `summary.json`: metadata, the session configuration and its summary

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::session::{SessionSummary, TelemetryRecord};

const CSV_HEADER: &str = concat!(
    "round_id,active_protocol,channel_state,raw_bits_emitted,",
    "sifted_bits,secure_bits,cumulative_leaked_bits,event"
);

// ---------------------------------------------------------------------------
// Metadata (summary.json)
// ---------------------------------------------------------------------------

/// Written to summary.json when the recording is finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingMeta {
    pub version: u32,
    pub id: String,
    /// Unix milliseconds.
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub duration_ms: u64,
    pub rows: u64,
    pub config: SessionConfig,
    pub summary: SessionSummary,
    pub tags: HashMap<String, String>,
    pub note: Option<String>,
    pub aether_version: String,
}

/// Where and how to record.
#[derive(Debug, Clone)]
pub struct RecordConfig {
    pub output_dir: PathBuf,
    pub tags: HashMap<String, String>,
    pub note: Option<String>,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("sessions"),
            tags: HashMap::new(),
            note: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Incremental writer for one recording directory.
pub struct TelemetryWriter {
    dir: PathBuf,
    csv: BufWriter<File>,
    rows: u64,
    started_at: SystemTime,
    started_instant: Instant,
    id: String,
    record: RecordConfig,
}

impl TelemetryWriter {
    /// Create the recording directory and the CSV header.
    pub fn new(record: RecordConfig) -> std::io::Result<Self> {
        let id = Uuid::new_v4().to_string();
        let started_at = SystemTime::now();
        let secs = started_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let dir = record.output_dir.join(format!("{secs}-{id}"));
        fs::create_dir_all(&dir)?;

        let mut csv = BufWriter::new(File::create(dir.join("telemetry.csv"))?);
        writeln!(csv, "{CSV_HEADER}")?;
        csv.flush()?;

        log::debug!("recording to {}", dir.display());

        Ok(Self {
            dir,
            csv,
            rows: 0,
            started_at,
            started_instant: Instant::now(),
            id,
            record,
        })
    }

    /// Append one telemetry row.
    pub fn write_record(&mut self, r: &TelemetryRecord) -> std::io::Result<()> {
        let event = r.event.map(|k| k.to_string()).unwrap_or_default();
        writeln!(
            self.csv,
            "{},{},{},{},{},{},{},{}",
            r.round_id,
            r.active_protocol,
            r.channel_state,
            r.raw_bits_emitted,
            r.sifted_bits,
            r.secure_bits,
            r.cumulative_leaked_bits,
            event
        )?;
        self.csv.flush()?;
        self.rows += 1;
        Ok(())
    }

    /// Append rows in order.
    pub fn write_all(&mut self, records: &[TelemetryRecord]) -> std::io::Result<()> {
        for r in records {
            self.write_record(r)?;
        }
        Ok(())
    }

    /// Write summary.json and return the recording directory.
    pub fn finish(
        mut self,
        config: &SessionConfig,
        summary: &SessionSummary,
    ) -> std::io::Result<PathBuf> {
        self.csv.flush()?;

        let meta = RecordingMeta {
            version: 1,
            id: self.id,
            started_at_ms: unix_ms(self.started_at),
            ended_at_ms: unix_ms(SystemTime::now()),
            duration_ms: self.started_instant.elapsed().as_millis() as u64,
            rows: self.rows,
            config: config.clone(),
            summary: summary.clone(),
            tags: self.record.tags,
            note: self.record.note,
            aether_version: crate::VERSION.to_string(),
        };

        let json = serde_json::to_string_pretty(&meta).map_err(std::io::Error::other)?;
        fs::write(self.dir.join("summary.json"), json)?;

        Ok(self.dir)
    }

    /// Directory this recording writes into.
    pub fn session_dir(&self) -> &Path {
        &self.dir
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
