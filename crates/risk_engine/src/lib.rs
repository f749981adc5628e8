use core_types::TradeOutcome;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskLimits {
    pub max_trades_per_run: u32,
    pub pnl_floor: f64,
    /// Loss-streak kill threshold. The locked configuration disables it with
    /// a large sentinel; the streak itself is still tracked for telemetry.
    pub max_consec_losses: u32,
    pub cooldown_sec: u64,
    pub degraded_kill_count: u32,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_trades_per_run: 1,
            pnl_floor: -50.0,
            max_consec_losses: 999,
            cooldown_sec: 30,
            degraded_kill_count: 2,
        }
    }
}

/// Read-only view handed to the EXECUTOR gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskView {
    pub kill_engaged: bool,
    pub manual_kill: bool,
    pub trades_this_run: u32,
    pub cumulative_pnl: f64,
    pub last_entry_ms: Option<i64>,
}

/// Run-lifetime totals for the RUN_END record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunTotals {
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
    pub cumulative_pnl: f64,
}

/// Process-wide risk counters and the kill latch. Owned by the orchestrator
/// and mutated from the decision task only.
#[derive(Debug)]
pub struct RiskState {
    limits: RiskLimits,
    trades_this_run: u32,
    consecutive_losses: u32,
    consecutive_wins: u32,
    cumulative_pnl: f64,
    degraded_fill_count: u32,
    kill_engaged: bool,
    manual_kill: bool,
    kill_reason: Option<String>,
    wins: u32,
    losses: u32,
    last_entry_ms: Option<i64>,
}

impl RiskState {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            trades_this_run: 0,
            consecutive_losses: 0,
            consecutive_wins: 0,
            cumulative_pnl: 0.0,
            degraded_fill_count: 0,
            kill_engaged: false,
            manual_kill: false,
            kill_reason: None,
            wins: 0,
            losses: 0,
            last_entry_ms: None,
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn view(&self) -> RiskView {
        RiskView {
            kill_engaged: self.kill_engaged,
            manual_kill: self.manual_kill,
            trades_this_run: self.trades_this_run,
            cumulative_pnl: self.cumulative_pnl,
            last_entry_ms: self.last_entry_ms,
        }
    }

    /// Counted before placement: an admitted trade consumes the budget even
    /// if the fill later degrades.
    pub fn on_entry_admitted(&mut self, now_ms: i64) {
        self.trades_this_run = self.trades_this_run.saturating_add(1);
        self.last_entry_ms = Some(now_ms);
    }

    /// Returns true when this degraded fill engaged the kill latch.
    pub fn on_degraded_fill(&mut self) -> bool {
        self.degraded_fill_count = self.degraded_fill_count.saturating_add(1);
        if !self.kill_engaged && self.degraded_fill_count >= self.limits.degraded_kill_count {
            self.engage(format!("{} degraded fills", self.degraded_fill_count));
            return true;
        }
        false
    }

    /// Applies a settled result. Returns true when the loss streak crossed
    /// the configured threshold and engaged the kill latch (disabled under
    /// the default sentinel).
    pub fn on_settlement(&mut self, outcome: TradeOutcome, pnl: f64) -> bool {
        self.cumulative_pnl += pnl;
        match outcome {
            TradeOutcome::Win => {
                self.wins = self.wins.saturating_add(1);
                self.consecutive_wins = self.consecutive_wins.saturating_add(1);
                self.consecutive_losses = 0;
            }
            TradeOutcome::Loss => {
                self.losses = self.losses.saturating_add(1);
                self.consecutive_losses = self.consecutive_losses.saturating_add(1);
                self.consecutive_wins = 0;
            }
        }
        if !self.kill_engaged && self.consecutive_losses >= self.limits.max_consec_losses {
            self.engage(format!("{} consecutive losses", self.consecutive_losses));
            return true;
        }
        false
    }

    /// Manual kill latches for the life of the process.
    pub fn assert_manual_kill(&mut self) {
        if !self.manual_kill {
            self.manual_kill = true;
            tracing::warn!("manual kill asserted");
        }
    }

    pub fn kill_engaged(&self) -> bool {
        self.kill_engaged
    }

    pub fn manual_kill(&self) -> bool {
        self.manual_kill
    }

    pub fn kill_reason(&self) -> Option<&str> {
        self.kill_reason.as_deref()
    }

    pub fn trades_this_run(&self) -> u32 {
        self.trades_this_run
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    pub fn consecutive_wins(&self) -> u32 {
        self.consecutive_wins
    }

    pub fn cumulative_pnl(&self) -> f64 {
        self.cumulative_pnl
    }

    pub fn degraded_fill_count(&self) -> u32 {
        self.degraded_fill_count
    }

    pub fn totals(&self) -> RunTotals {
        let settled = self.wins + self.losses;
        RunTotals {
            trades: self.trades_this_run,
            wins: self.wins,
            losses: self.losses,
            win_rate: if settled == 0 {
                0.0
            } else {
                self.wins as f64 / settled as f64
            },
            cumulative_pnl: self.cumulative_pnl,
        }
    }

    fn engage(&mut self, reason: String) {
        self.kill_engaged = true;
        tracing::warn!(reason = %reason, "kill latch engaged");
        self.kill_reason = Some(reason);
    }
}
