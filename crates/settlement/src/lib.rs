use std::time::Duration;

use core_types::{EngineError, OutcomeOracle, Session, Side, Trade, TradeOutcome};

/// Winning side pays one unit per share; the losing side pays zero. Entry
/// premium is sunk either way.
pub fn pnl_for(outcome: TradeOutcome, avg_fill_price: f64, shares: f64) -> f64 {
    match outcome {
        TradeOutcome::Win => (1.0 - avg_fill_price) * shares,
        TradeOutcome::Loss => -avg_fill_price * shares,
    }
}

/// Applies a resolved winner to an open trade. Idempotent: a trade that
/// already carries an outcome is left untouched.
pub fn settle_trade(trade: &mut Trade, winner: Side, settle_ts_ms: i64) -> Option<(TradeOutcome, f64)> {
    if trade.outcome.is_some() {
        return None;
    }
    let outcome = if trade.side == winner {
        TradeOutcome::Win
    } else {
        TradeOutcome::Loss
    };
    let pnl = pnl_for(outcome, trade.avg_fill_price, trade.shares);
    trade.outcome = Some(outcome);
    trade.pnl = Some(pnl);
    trade.settle_ts_ms = Some(settle_ts_ms);
    Some((outcome, pnl))
}

/// Paper-mode winner rule: UP wins iff the final UP mid is at or above the
/// first UP mid seen in the session. Swapping this for the venue-reported
/// outcome is a one-line substitution at the call site.
#[derive(Debug, Default, Clone)]
pub struct PaperOutcomeRule {
    open_up_mid: Option<f64>,
    last_up_mid: Option<f64>,
}

impl PaperOutcomeRule {
    pub fn observe_up_mid(&mut self, up_mid: f64) {
        if self.open_up_mid.is_none() {
            self.open_up_mid = Some(up_mid);
        }
        self.last_up_mid = Some(up_mid);
    }

    pub fn winner(&self) -> Option<Side> {
        let open = self.open_up_mid?;
        let last = self.last_up_mid?;
        Some(if last >= open { Side::Up } else { Side::Down })
    }

    pub fn reset(&mut self) {
        self.open_up_mid = None;
        self.last_up_mid = None;
    }
}

/// Bounded poll of the venue outcome oracle. Gives the venue a grace window
/// to publish; past it the caller leaves trades PENDING for a human.
pub async fn fetch_winner_with_grace(
    oracle: &dyn OutcomeOracle,
    session: &Session,
    attempts: u32,
    poll_interval_ms: u64,
) -> Result<Side, EngineError> {
    for attempt in 0..attempts.max(1) {
        match oracle.winning_side(session).await {
            Ok(Some(side)) => return Ok(side),
            Ok(None) => {
                tracing::debug!(
                    session_id = %session.session_id,
                    attempt,
                    "outcome not yet reported"
                );
            }
            Err(err) => {
                tracing::warn!(
                    session_id = %session.session_id,
                    error = %err,
                    "outcome oracle error"
                );
            }
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(Duration::from_millis(poll_interval_ms)).await;
        }
    }
    Err(EngineError::SettlementUnavailable(
        session.session_id.clone(),
    ))
}
