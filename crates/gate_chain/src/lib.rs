use std::fmt;

use core_types::{BookSnapshot, Side, TopOfBook};
use risk_engine::{RiskLimits, RiskView};
use serde::{Deserialize, Serialize};
use session_clock::Zone;

pub mod regime;

pub use regime::{OscillationTracker, Regime};

/// Ask band boundaries for the dynamic edge thresholds. These are part of
/// the locked rule, not tunables: cheap entries get the forgiving threshold,
/// expensive entries the ruthless one.
const EDGE_BAND_LO_ASK: f64 = 0.66;
const EDGE_BAND_HI_ASK: f64 = 0.69;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateConfig {
    pub edge_base: f64,
    pub edge_mid: f64,
    pub edge_high: f64,
    pub ask_cap: f64,
    pub spread_max: f64,
    pub max_trades_per_session: u32,
    pub regime_mod_enabled: bool,
    pub regime_mod_bump: f64,
    /// Modifier applies when the 5-minute oscillation count exceeds this.
    pub regime_choppy_oscillations: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            edge_base: 0.64,
            edge_mid: 0.67,
            edge_high: 0.70,
            ask_cap: 0.68,
            spread_max: 0.02,
            max_trades_per_session: 1,
            regime_mod_enabled: false,
            regime_mod_bump: 0.03,
            regime_choppy_oscillations: 6,
        }
    }
}

/// Skip reasons in gate order. The string forms are the `reason` field of
/// SKIP events and are load-bearing for offline analysis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SkipReason {
    #[serde(rename = "ZONE_GATE")]
    Zone,
    #[serde(rename = "BOOK_GATE")]
    Book,
    #[serde(rename = "SESSION_CAP")]
    SessionCap,
    #[serde(rename = "EDGE_GATE")]
    Edge,
    #[serde(rename = "HARD_PRICE_GATE")]
    HardPrice,
    #[serde(rename = "PRICE_GATE")]
    Price,
    #[serde(rename = "BAD_BOOK_GATE")]
    BadBook,
    #[serde(rename = "SPREAD_GATE")]
    Spread,
    #[serde(rename = "EXECUTOR_GATE")]
    Executor,
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zone => "ZONE_GATE",
            Self::Book => "BOOK_GATE",
            Self::SessionCap => "SESSION_CAP",
            Self::Edge => "EDGE_GATE",
            Self::HardPrice => "HARD_PRICE_GATE",
            Self::Price => "PRICE_GATE",
            Self::BadBook => "BAD_BOOK_GATE",
            Self::Spread => "SPREAD_GATE",
            Self::Executor => "EXECUTOR_GATE",
            Self::MinNotional => "MIN_NOTIONAL",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a single admission decision reads. Built fresh by the
/// orchestrator each tick; gates are pure over it and never suspend.
#[derive(Debug, Clone)]
pub struct GateInput<'a> {
    pub zone: Zone,
    pub book: &'a BookSnapshot,
    pub session_trades: u32,
    pub oscillations_5m: u32,
    pub risk: RiskView,
    pub limits: &'a RiskLimits,
    pub now_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmitPlan {
    pub side: Side,
    pub bid: f64,
    pub ask: f64,
    pub edge: f64,
    pub required_edge: f64,
    pub spread: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateDecision {
    Admit(AdmitPlan),
    Skip(SkipReason),
}

/// Strictly ordered admission chain. The order is part of the contract:
/// earlier gates are cheaper and more interpretable, and the first failure
/// is the reported reason.
#[derive(Debug, Clone)]
pub struct GateChain {
    cfg: GateConfig,
}

impl GateChain {
    pub fn new(cfg: GateConfig) -> Self {
        Self { cfg }
    }

    pub fn cfg(&self) -> &GateConfig {
        &self.cfg
    }

    /// The price-conditional edge threshold, before any regime modifier.
    pub fn required_edge(&self, ask: f64) -> f64 {
        if ask <= EDGE_BAND_LO_ASK {
            self.cfg.edge_base
        } else if ask <= EDGE_BAND_HI_ASK {
            self.cfg.edge_mid
        } else {
            self.cfg.edge_high
        }
    }

    pub fn evaluate(&self, input: &GateInput<'_>) -> GateDecision {
        // 1. ZONE
        if input.zone != Zone::Core {
            return GateDecision::Skip(SkipReason::Zone);
        }

        // 2. BOOK: both sides fresh with positive quotes.
        let (Some(up), Some(down)) = (input.book.up, input.book.down) else {
            return GateDecision::Skip(SkipReason::Book);
        };
        if up.bid <= 0.0 || up.ask <= 0.0 || down.bid <= 0.0 || down.ask <= 0.0 {
            return GateDecision::Skip(SkipReason::Book);
        }

        // Direction is fixed here, before EDGE is evaluated. Ties go to UP.
        let (side, top) = choose_side(&up, &down);

        // 3. SESSION_CAP
        if input.session_trades >= self.cfg.max_trades_per_session {
            return GateDecision::Skip(SkipReason::SessionCap);
        }

        // 4. EDGE (dynamic, price-conditional)
        let ask = top.ask;
        let edge = top.mid();
        let mut required = self.required_edge(ask);
        if self.cfg.regime_mod_enabled
            && input.oscillations_5m > self.cfg.regime_choppy_oscillations
        {
            required += self.cfg.regime_mod_bump;
        }
        if edge < required {
            return GateDecision::Skip(SkipReason::Edge);
        }

        // 5. HARD_PRICE (inclusive ceiling) and 6. PRICE (strict cap).
        // Degenerate under one cap value, but logged distinctly: a breach of
        // 5 means the book moved past the ceiling, a breach of 6 means it
        // sits exactly on it.
        if ask > self.cfg.ask_cap {
            return GateDecision::Skip(SkipReason::HardPrice);
        }
        if ask >= self.cfg.ask_cap {
            return GateDecision::Skip(SkipReason::Price);
        }

        // 7. BAD_BOOK sanity on the chosen side.
        let spread = top.spread();
        if spread < 0.0 || top.bid > top.ask {
            return GateDecision::Skip(SkipReason::BadBook);
        }

        // 8. SPREAD hygiene.
        if spread > self.cfg.spread_max {
            return GateDecision::Skip(SkipReason::Spread);
        }

        // 9. EXECUTOR: aggregated runtime risk caps.
        if !self.executor_allows(input) {
            return GateDecision::Skip(SkipReason::Executor);
        }

        GateDecision::Admit(AdmitPlan {
            side,
            bid: top.bid,
            ask,
            edge,
            required_edge: required,
            spread,
        })
    }

    fn executor_allows(&self, input: &GateInput<'_>) -> bool {
        let risk = &input.risk;
        if risk.kill_engaged || risk.manual_kill {
            return false;
        }
        if risk.trades_this_run >= input.limits.max_trades_per_run {
            return false;
        }
        if risk.cumulative_pnl <= input.limits.pnl_floor {
            return false;
        }
        if let Some(last_ms) = risk.last_entry_ms {
            let elapsed_ms = input.now_ms.saturating_sub(last_ms);
            if (elapsed_ms as u64) < input.limits.cooldown_sec.saturating_mul(1_000) {
                return false;
            }
        }
        true
    }
}

fn choose_side(up: &TopOfBook, down: &TopOfBook) -> (Side, TopOfBook) {
    if up.mid() >= down.mid() {
        (Side::Up, *up)
    } else {
        (Side::Down, *down)
    }
}
