use std::fmt;

use chrono::{DateTime, Duration, Timelike, Utc};
use core_types::{Session, SESSION_SECONDS};
use serde::{Deserialize, Serialize};

/// Elapsed-time band within a session. Only CORE admits trades.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Zone {
    #[serde(rename = "EARLY")]
    Early,
    #[serde(rename = "CORE")]
    Core,
    #[serde(rename = "DEAD")]
    Dead,
    #[serde(rename = "LATE")]
    Late,
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Early => "EARLY",
            Self::Core => "CORE",
            Self::Dead => "DEAD",
            Self::Late => "LATE",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClockView {
    pub session_id: String,
    pub session_start: DateTime<Utc>,
    pub elapsed_sec: f64,
    pub zone: Zone,
}

/// Maps wall-clock time onto the venue's fifteen-minute session cadence.
/// Sessions start at wall minutes :00, :15, :30, :45.
#[derive(Debug, Clone)]
pub struct SessionClock {
    core_lo_sec: u32,
    core_hi_sec: u32,
}

impl Default for SessionClock {
    fn default() -> Self {
        Self {
            core_lo_sec: 150,
            core_hi_sec: 225,
        }
    }
}

impl SessionClock {
    /// The CORE band is clamped inside the pre-dead-zone 300 s window.
    pub fn new(core_lo_sec: u32, core_hi_sec: u32) -> Self {
        let lo = core_lo_sec.min(300);
        let hi = core_hi_sec.clamp(lo, 300);
        Self {
            core_lo_sec: lo,
            core_hi_sec: hi,
        }
    }

    pub fn core_bounds(&self) -> (u32, u32) {
        (self.core_lo_sec, self.core_hi_sec)
    }

    pub fn observe(&self, now: DateTime<Utc>) -> ClockView {
        let start = session_start(now);
        let elapsed_sec = (now - start).num_milliseconds() as f64 / 1000.0;
        ClockView {
            session_id: session_id(start),
            session_start: start,
            elapsed_sec,
            zone: self.zone_for(elapsed_sec),
        }
    }

    pub fn zone_for(&self, elapsed_sec: f64) -> Zone {
        if elapsed_sec < self.core_lo_sec as f64 {
            Zone::Early
        } else if elapsed_sec < self.core_hi_sec as f64 {
            Zone::Core
        } else if elapsed_sec < 300.0 {
            Zone::Dead
        } else {
            Zone::Late
        }
    }
}

pub fn session_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let trunc = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let back = trunc.minute() % 15;
    trunc - Duration::minutes(back as i64)
}

pub fn session_id(start: DateTime<Utc>) -> String {
    start.format("%Y%m%d-%H%M").to_string()
}

/// Builds the immutable session record for a boundary instant. Contract ids
/// default to a derivation from the session id; a discovery layer may
/// override them before orders are routed.
pub fn session_for(start: DateTime<Utc>) -> Session {
    let id = session_id(start);
    Session {
        session_id: id.clone(),
        start,
        end: start + Duration::seconds(SESSION_SECONDS as i64),
        contract_up_id: format!("up-{id}"),
        contract_down_id: format!("down-{id}"),
    }
}
