use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use core_types::{EngineError, Side, Trade, TradeOutcome, TICK};
use serde::{Deserialize, Serialize};

/// Terminal classification of a settled trade's price path. Strictly
/// observational; nothing downstream of the gate chain reads it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SampleReason {
    #[serde(rename = "clean_conviction")]
    CleanConviction,
    #[serde(rename = "reversal_held")]
    ReversalHeld,
    #[serde(rename = "strong_follow_through")]
    StrongFollowThrough,
    #[serde(rename = "whipsaw")]
    Whipsaw,
    #[serde(rename = "late_flip")]
    LateFlip,
    #[serde(rename = "trend_built_against")]
    TrendBuiltAgainst,
    #[serde(rename = "weak_follow_through")]
    WeakFollowThrough,
}

impl SampleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CleanConviction => "clean_conviction",
            Self::ReversalHeld => "reversal_held",
            Self::StrongFollowThrough => "strong_follow_through",
            Self::Whipsaw => "whipsaw",
            Self::LateFlip => "late_flip",
            Self::TrendBuiltAgainst => "trend_built_against",
            Self::WeakFollowThrough => "weak_follow_through",
        }
    }
}

impl fmt::Display for SampleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of `metrics.jsonl`, finalized at settlement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub trade_id: u64,
    pub session_id: String,
    pub mode: String,
    pub side: Side,
    pub entry_price: f64,
    pub entry_edge: f64,
    pub entry_elapsed_sec: f64,
    pub entry_ts_ms: i64,
    pub hour_of_day: u32,
    pub winner: Side,
    pub result: TradeOutcome,
    pub pnl: f64,
    pub entry_crossings: u32,
    pub time_in_favor_pct: f64,
    pub peak_favorable_pct: f64,
    pub max_adverse_pct: f64,
    pub direction_flipped: bool,
    pub prev_winner: Option<Side>,
    pub consecutive_wins: u32,
    pub consecutive_losses: u32,
    pub settle_reason: String,
    pub reason: SampleReason,
}

#[derive(Debug)]
struct ActiveSample {
    session_id: String,
    side: Side,
    entry_price: f64,
    entry_edge: f64,
    entry_elapsed_sec: f64,
    entry_ts_ms: i64,
    hour_of_day: u32,
    prev_winner: Option<Side>,
    consec_wins_at_entry: u32,
    consec_losses_at_entry: u32,
    ticks: u32,
    ticks_in_favor: u32,
    peak_favorable_pct: f64,
    max_adverse_pct: f64,
    crossings: u32,
    last_sign: i8,
    direction_flipped: bool,
}

/// Rolling per-trade excursion statistics. Fed on every post-entry tick and
/// finalized exactly once at settlement; never mutates the Trade and never
/// participates in admission.
#[derive(Debug)]
pub struct MetricsRecorder {
    mode: String,
    active: HashMap<u64, ActiveSample>,
    last_winner: Option<Side>,
    consec_wins: u32,
    consec_losses: u32,
}

impl MetricsRecorder {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            active: HashMap::new(),
            last_winner: None,
            consec_wins: 0,
            consec_losses: 0,
        }
    }

    pub fn on_entry(&mut self, trade: &Trade, entry_elapsed_sec: f64, hour_of_day: u32) {
        self.active.insert(
            trade.trade_id,
            ActiveSample {
                session_id: trade.session_id.clone(),
                side: trade.side,
                entry_price: trade.ask_at_decision,
                entry_edge: trade.edge_at_decision,
                entry_elapsed_sec,
                entry_ts_ms: trade.open_ts_ms,
                hour_of_day,
                prev_winner: self.last_winner,
                consec_wins_at_entry: self.consec_wins,
                consec_losses_at_entry: self.consec_losses,
                ticks: 0,
                ticks_in_favor: 0,
                peak_favorable_pct: 0.0,
                max_adverse_pct: 0.0,
                crossings: 0,
                last_sign: 0,
                direction_flipped: false,
            },
        );
    }

    /// Updates the excursion stats with the current mids of both sides.
    pub fn on_tick(&mut self, trade_id: u64, chosen_mid: f64, opposite_mid: f64) {
        let Some(sample) = self.active.get_mut(&trade_id) else {
            return;
        };
        let fav = chosen_mid - sample.entry_price;
        if sample.entry_price > 0.0 {
            let ratio = fav / sample.entry_price;
            sample.peak_favorable_pct = sample.peak_favorable_pct.max(ratio);
            sample.max_adverse_pct = sample.max_adverse_pct.min(ratio);
        }
        sample.ticks += 1;
        if fav > 0.0 {
            sample.ticks_in_favor += 1;
        }
        let sign = if fav > 0.0 {
            1
        } else if fav < 0.0 {
            -1
        } else {
            0
        };
        if sign != 0 {
            if sample.last_sign != 0 && sign != sample.last_sign {
                sample.crossings += 1;
            }
            sample.last_sign = sign;
        }
        if opposite_mid - chosen_mid >= TICK - 1e-9 {
            sample.direction_flipped = true;
        }
    }

    pub fn has_active(&self, trade_id: u64) -> bool {
        self.active.contains_key(&trade_id)
    }

    /// Drops tracking for a trade that never held a position (cancelled or
    /// unfilled degraded placement). No sample is written.
    pub fn discard(&mut self, trade_id: u64) {
        self.active.remove(&trade_id);
    }

    /// Finalizes the sample for a settled trade. Must be called before the
    /// SETTLED event is appended to the trade log.
    pub fn finalize(
        &mut self,
        trade_id: u64,
        winner: Side,
        pnl: f64,
        settle_reason: &str,
    ) -> Option<MetricSample> {
        let sample = self.active.remove(&trade_id)?;
        let result = if sample.side == winner {
            TradeOutcome::Win
        } else {
            TradeOutcome::Loss
        };
        let time_in_favor_pct = if sample.ticks == 0 {
            0.0
        } else {
            sample.ticks_in_favor as f64 / sample.ticks as f64
        };
        let reason = classify(
            result,
            sample.crossings,
            time_in_favor_pct,
            sample.peak_favorable_pct,
            sample.max_adverse_pct,
        );

        let out = MetricSample {
            trade_id,
            session_id: sample.session_id,
            mode: self.mode.clone(),
            side: sample.side,
            entry_price: sample.entry_price,
            entry_edge: sample.entry_edge,
            entry_elapsed_sec: sample.entry_elapsed_sec,
            entry_ts_ms: sample.entry_ts_ms,
            hour_of_day: sample.hour_of_day,
            winner,
            result,
            pnl,
            entry_crossings: sample.crossings,
            time_in_favor_pct,
            peak_favorable_pct: sample.peak_favorable_pct,
            max_adverse_pct: sample.max_adverse_pct,
            direction_flipped: sample.direction_flipped,
            prev_winner: sample.prev_winner,
            consecutive_wins: sample.consec_wins_at_entry,
            consecutive_losses: sample.consec_losses_at_entry,
            settle_reason: settle_reason.to_string(),
            reason,
        };

        self.last_winner = Some(winner);
        match result {
            TradeOutcome::Win => {
                self.consec_wins += 1;
                self.consec_losses = 0;
            }
            TradeOutcome::Loss => {
                self.consec_losses += 1;
                self.consec_wins = 0;
            }
        }
        Some(out)
    }
}

/// Mutually exclusive classification, applied in this order.
fn classify(
    result: TradeOutcome,
    crossings: u32,
    time_in_favor_pct: f64,
    peak_favorable_pct: f64,
    max_adverse_pct: f64,
) -> SampleReason {
    match result {
        TradeOutcome::Win => {
            if crossings == 0 {
                SampleReason::CleanConviction
            } else if max_adverse_pct <= -0.10 && peak_favorable_pct >= 0.0 {
                SampleReason::ReversalHeld
            } else {
                SampleReason::StrongFollowThrough
            }
        }
        TradeOutcome::Loss => {
            if crossings >= 3 {
                SampleReason::Whipsaw
            } else if time_in_favor_pct >= 0.55 {
                SampleReason::LateFlip
            } else if peak_favorable_pct <= 0.02 {
                SampleReason::TrendBuiltAgainst
            } else {
                SampleReason::WeakFollowThrough
            }
        }
    }
}

/// Append-only jsonl sink for finalized samples, paired with the event log
/// by run directory.
pub struct MetricsWriter {
    path: PathBuf,
    file: File,
}

impl MetricsWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, sample: &MetricSample) -> Result<(), EngineError> {
        let line = serde_json::to_string(sample)
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        tracing::debug!(
            trade_id = sample.trade_id,
            reason = %sample.reason,
            "metric sample finalized"
        );
        Ok(())
    }
}
