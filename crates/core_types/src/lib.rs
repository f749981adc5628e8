use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Venue price tick. Quotes live on a 0.01 grid in [0, 1].
pub const TICK: f64 = 0.01;

/// One fifteen-minute contract period.
pub const SESSION_SECONDS: u32 = 900;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
        })
    }
}

/// Inbound top-of-book update for one outcome side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookUpdate {
    pub session_id: String,
    pub side: Side,
    pub bid: f64,
    pub ask: f64,
    pub server_ts_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TopOfBook {
    pub bid: f64,
    pub ask: f64,
    pub last_update_ms: i64,
}

impl TopOfBook {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}

/// Atomic two-sided view of the active session's book. A side that has not
/// quoted yet, or whose quote has gone stale, is absent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct BookSnapshot {
    pub up: Option<TopOfBook>,
    pub down: Option<TopOfBook>,
}

impl BookSnapshot {
    pub fn side(&self, side: Side) -> Option<&TopOfBook> {
        match side {
            Side::Up => self.up.as_ref(),
            Side::Down => self.down.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FillStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "DEGRADED")]
    Degraded,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl fmt::Display for FillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "PENDING",
            Self::Filled => "FILLED",
            Self::Degraded => "DEGRADED",
            Self::Cancelled => "CANCELLED",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuyOrder {
    pub session_id: String,
    pub contract_id: String,
    pub side: Side,
    pub price_limit: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FillReport {
    pub order_id: String,
    pub status: FillStatus,
    pub avg_price: f64,
    pub filled_size: f64,
    pub latency_ms: u64,
    pub slippage_bps: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeOutcome {
    #[serde(rename = "WIN")]
    Win,
    #[serde(rename = "LOSS")]
    Loss,
}

impl fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Win => "WIN",
            Self::Loss => "LOSS",
        })
    }
}

/// One directional position, created on gate admission and archived after
/// settlement. At most one per session by construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub trade_id: u64,
    pub session_id: String,
    pub contract_id: String,
    pub side: Side,
    pub ask_at_decision: f64,
    pub edge_at_decision: f64,
    pub required_edge_at_decision: f64,
    pub spread_at_decision: f64,
    pub notional: f64,
    pub shares: f64,
    pub fill_status: FillStatus,
    pub avg_fill_price: f64,
    pub order_id: String,
    pub open_ts_ms: i64,
    pub settle_ts_ms: Option<i64>,
    pub outcome: Option<TradeOutcome>,
    pub pnl: Option<f64>,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Immutable descriptor of one fifteen-minute session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub contract_up_id: String,
    pub contract_down_id: String,
}

impl Session {
    pub fn contract_id(&self, side: Side) -> &str {
        match side {
            Side::Up => &self.contract_up_id,
            Side::Down => &self.contract_down_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient feed failure: {0}")]
    TransientFeed(String),
    #[error("stale book on {0}")]
    StaleBook(Side),
    #[error("placement timed out after {0} ms")]
    PlacementTimeout(u64),
    #[error("placement rejected: {0}")]
    PlacementReject(String),
    #[error("settlement unavailable for session {0}")]
    SettlementUnavailable(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("log io error")]
    Io(#[from] std::io::Error),
}

pub type DynStream<T> = BoxStream<'static, Result<T>>;

/// Market data capability. Implementations deliver best-bid/best-ask updates
/// per outcome side, in order per side; gaps are permitted.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn stream_updates(&self) -> Result<DynStream<BookUpdate>>;
}

/// Order placement capability. Called exactly once per admitted trade.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn submit_buy(&self, order: BuyOrder) -> Result<FillReport, EngineError>;

    /// Connectivity probe for the `verify` subcommand.
    async fn check_connectivity(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Settlement truth capability: which side won a finished session.
/// `Ok(None)` means the venue has not reported yet.
#[async_trait]
pub trait OutcomeOracle: Send + Sync {
    async fn winning_side(&self, session: &Session) -> Result<Option<Side>, EngineError>;
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
