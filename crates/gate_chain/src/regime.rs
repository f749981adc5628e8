use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

const WINDOW_MS: i64 = 300_000;
const MAX_POINTS: usize = 600;
const MIN_POINTS: usize = 10;
const MIN_RECORD_INTERVAL_MS: i64 = 1_000;
/// Minimum absolute move for a direction change to count as significant.
const MOVE_THRESHOLD: f64 = 0.001;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Regime {
    #[serde(rename = "stable")]
    Stable,
    #[serde(rename = "neutral")]
    Neutral,
    #[serde(rename = "choppy")]
    Choppy,
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stable => "stable",
            Self::Neutral => "neutral",
            Self::Choppy => "choppy",
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct PricePoint {
    ts_ms: i64,
    price: f64,
}

/// Rolling 5-minute oscillation counter over the UP mid.
///
/// An oscillation is a significant move in one direction followed by a
/// significant move the other way (anchor-based, so micro-noise below the
/// move threshold never counts). The count feeds the optional EDGE regime
/// modifier and is attached to ENTRY events for offline analysis either way.
#[derive(Debug)]
pub struct OscillationTracker {
    buffer: VecDeque<PricePoint>,
    last_record_ms: i64,
}

impl Default for OscillationTracker {
    fn default() -> Self {
        Self {
            buffer: VecDeque::with_capacity(MAX_POINTS),
            last_record_ms: i64::MIN,
        }
    }
}

impl OscillationTracker {
    /// Records an UP mid sample, rate-limited to one per second so the
    /// buffer always spans the full window under bursty feeds.
    pub fn record(&mut self, ts_ms: i64, up_mid: f64) {
        if up_mid <= 0.0 {
            return;
        }
        if ts_ms.saturating_sub(self.last_record_ms) < MIN_RECORD_INTERVAL_MS {
            return;
        }
        self.last_record_ms = ts_ms;
        if self.buffer.len() == MAX_POINTS {
            self.buffer.pop_front();
        }
        self.buffer.push_back(PricePoint {
            ts_ms,
            price: up_mid,
        });
    }

    /// Direction reversals within the window. Returns 0 until at least ten
    /// in-window samples exist.
    pub fn oscillations(&self, now_ms: i64) -> u32 {
        let window_start = now_ms - WINDOW_MS;
        let points: Vec<&PricePoint> = self
            .buffer
            .iter()
            .filter(|p| p.ts_ms >= window_start)
            .collect();
        if points.len() < MIN_POINTS {
            return 0;
        }

        let mut last_direction: Option<bool> = None;
        let mut last_anchor = points[0].price;
        let mut crossings = 0_u32;
        for point in &points[1..] {
            let step = point.price - last_anchor;
            if step.abs() >= MOVE_THRESHOLD {
                let rising = step > 0.0;
                if let Some(prev) = last_direction {
                    if prev != rising {
                        crossings += 1;
                    }
                }
                last_direction = Some(rising);
                last_anchor = point.price;
            }
        }
        crossings
    }

    pub fn regime(&self, now_ms: i64) -> (Regime, u32) {
        let crossings = self.oscillations(now_ms);
        let regime = if crossings >= 6 {
            Regime::Choppy
        } else if crossings <= 2 {
            Regime::Stable
        } else {
            Regime::Neutral
        };
        (regime, crossings)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
