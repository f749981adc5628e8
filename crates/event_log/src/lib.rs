use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use core_types::{EngineError, FillStatus, Side, Trade, TradeOutcome};
use risk_engine::RunTotals;
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 1;

/// One line of `events.jsonl`. The envelope fields come first so external
/// tailers can cut on them without parsing the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub schema_version: u32,
    pub run_id: String,
    pub seq: u64,
    pub ts_ms: i64,
    #[serde(flatten)]
    pub body: EventBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum EventBody {
    #[serde(rename = "RUN_START")]
    RunStart {
        mode: String,
        notional_per_trade: f64,
        max_trades_per_run: u32,
        config_sha256: String,
    },
    #[serde(rename = "SKIP")]
    Skip {
        session_id: String,
        zone: String,
        elapsed_sec: f64,
        reason: String,
    },
    #[serde(rename = "ENTRY")]
    Entry {
        zone: String,
        elapsed_sec: f64,
        regime: String,
        oscillations_5m: u32,
        trade: Trade,
    },
    #[serde(rename = "FILL")]
    Fill {
        trade_id: u64,
        session_id: String,
        order_id: String,
        status: FillStatus,
        avg_price: f64,
        filled_size: f64,
        latency_ms: u64,
        slippage_bps: f64,
    },
    #[serde(rename = "SETTLED")]
    Settled {
        trade_id: u64,
        session_id: String,
        winner: Side,
        outcome: TradeOutcome,
        pnl: f64,
        cumulative_pnl: f64,
        consecutive_losses: u32,
        settle_reason: String,
    },
    #[serde(rename = "KILL")]
    Kill { reason: String, detail: String },
    #[serde(rename = "RUN_END")]
    RunEnd { reason: String, totals: RunTotals },
}

impl EventBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStart { .. } => "RUN_START",
            Self::Skip { .. } => "SKIP",
            Self::Entry { .. } => "ENTRY",
            Self::Fill { .. } => "FILL",
            Self::Settled { .. } => "SETTLED",
            Self::Kill { .. } => "KILL",
            Self::RunEnd { .. } => "RUN_END",
        }
    }
}

/// Append-only writer for the primary event stream. Each record goes out as
/// one `writeln!` so a line either lands whole or not at all; SETTLED and
/// shutdown force a flush through to the OS.
pub struct TradeLogWriter {
    path: PathBuf,
    file: File,
    run_id: String,
    seq: u64,
}

impl TradeLogWriter {
    pub fn create(path: impl AsRef<Path>, run_id: impl Into<String>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            run_id: run_id.into(),
            seq: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_seq(&self) -> u64 {
        self.seq + 1
    }

    pub fn append(&mut self, ts_ms: i64, body: EventBody) -> Result<EventRecord, EngineError> {
        self.seq += 1;
        let record = EventRecord {
            schema_version: SCHEMA_VERSION,
            run_id: self.run_id.clone(),
            seq: self.seq,
            ts_ms,
            body,
        };
        let line = serde_json::to_string(&record)
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        writeln!(self.file, "{line}")?;
        if matches!(record.body, EventBody::Settled { .. }) {
            self.file.flush()?;
        }
        tracing::debug!(kind = record.body.kind(), seq = record.seq, "event logged");
        Ok(record)
    }

    pub fn flush(&mut self) -> Result<(), EngineError> {
        self.file.flush()?;
        Ok(())
    }
}

/// Parses a full event stream back. Used by the replay/verification tooling
/// and the round-trip tests; the hot path never reads.
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<EventRecord>, EngineError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: EventRecord =
            serde_json::from_str(&line).map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        out.push(record);
    }
    Ok(out)
}
