use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use book_store::BookStore;
use chrono::{DateTime, Utc};
use core_types::{
    BookUpdate, BuyOrder, EngineError, FillStatus, MarketDataSource, OrderGateway, OutcomeOracle,
    Session, Side, Trade,
};
use event_log::{EventBody, TradeLogWriter};
use futures::StreamExt;
use gate_chain::{AdmitPlan, GateChain, GateDecision, OscillationTracker, SkipReason};
use metrics_exporter_prometheus::PrometheusHandle;
use risk_engine::RiskState;
use session_clock::{session_for, ClockView, SessionClock};
use settlement::{fetch_winner_with_grace, settle_trade, PaperOutcomeRule};
use tokio::sync::mpsc;
use trade_metrics::{MetricsRecorder, MetricsWriter};

use crate::config::RunConfig;
use crate::kill::SentinelKill;

/// The decision task. Owns the session, the book, the risk state, and all
/// open trades; everything else reaches it through capability handles. One
/// tick = drain feed, poll kill, run the gate chain, age open trades.
pub struct Orchestrator {
    cfg: RunConfig,
    run_dir: PathBuf,
    clock: SessionClock,
    gates: GateChain,
    risk: RiskState,
    book: BookStore,
    session: Session,
    session_trades: u32,
    open_trades: Vec<Trade>,
    archived: Vec<Trade>,
    paper_rule: PaperOutcomeRule,
    oscillations: OscillationTracker,
    recorder: MetricsRecorder,
    metrics_out: MetricsWriter,
    log: TradeLogWriter,
    gateway: Arc<dyn OrderGateway>,
    oracle: Option<Arc<dyn OutcomeOracle>>,
    trade_seq: u64,
    last_skip: Option<SkipReason>,
    manual_kill_logged: bool,
    kill_latch_logged: bool,
}

impl Orchestrator {
    pub async fn new(
        cfg: RunConfig,
        gateway: Arc<dyn OrderGateway>,
        oracle: Option<Arc<dyn OutcomeOracle>>,
        start: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        let run_dir = cfg.run_dir();
        cfg.persist_snapshot(&run_dir)?;

        let mut log = TradeLogWriter::create(run_dir.join("events.jsonl"), cfg.run_id.clone())?;
        let metrics_out = MetricsWriter::create(run_dir.join("metrics.jsonl"))?;

        let config_sha256 = cfg.sha256()?;
        log.append(
            start.timestamp_millis(),
            EventBody::RunStart {
                mode: cfg.mode.clone(),
                notional_per_trade: cfg.notional_per_trade,
                max_trades_per_run: cfg.max_trades_per_run,
                config_sha256,
            },
        )?;

        let clock = SessionClock::new(cfg.core_lo_sec, cfg.core_hi_sec);
        let view = clock.observe(start);
        let session = session_for(view.session_start);
        let book = BookStore::new(session.session_id.clone(), cfg.book_staleness_ms);

        tracing::info!(
            run_id = %cfg.run_id,
            mode = %cfg.mode,
            session_id = %session.session_id,
            "engine started"
        );

        Ok(Self {
            gates: GateChain::new(cfg.gate_config()),
            risk: RiskState::new(cfg.risk_limits()),
            recorder: MetricsRecorder::new(cfg.mode.clone()),
            clock,
            book,
            session,
            session_trades: 0,
            open_trades: Vec::new(),
            archived: Vec::new(),
            paper_rule: PaperOutcomeRule::default(),
            oscillations: OscillationTracker::default(),
            metrics_out,
            log,
            gateway,
            oracle,
            trade_seq: 0,
            last_skip: None,
            manual_kill_logged: false,
            kill_latch_logged: false,
            run_dir,
            cfg,
        })
    }

    pub fn run_dir(&self) -> &PathBuf {
        &self.run_dir
    }

    pub fn tick_interval_ms(&self) -> u64 {
        self.cfg.tick_interval_ms
    }

    pub fn risk(&self) -> &RiskState {
        &self.risk
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    /// Most recent skip reason, for status surfaces.
    pub fn last_skip(&self) -> Option<SkipReason> {
        self.last_skip
    }

    pub fn open_trades(&self) -> &[Trade] {
        &self.open_trades
    }

    pub fn archived_trades(&self) -> &[Trade] {
        &self.archived
    }

    /// Applies one inbound book update. Updates tagged with another session
    /// are dropped by the store; accepted UP quotes also feed the
    /// oscillation tracker and the paper outcome rule.
    pub fn handle_update(&mut self, update: &BookUpdate, recv_ms: i64) {
        if !self.book.apply(update) {
            metrics::counter!("feed.updates_dropped").increment(1);
            return;
        }
        metrics::counter!("feed.updates_applied").increment(1);
        if update.side == Side::Up && update.bid > 0.0 && update.ask > 0.0 {
            let mid = (update.bid + update.ask) / 2.0;
            self.oscillations.record(recv_ms, mid);
            self.paper_rule.observe_up_mid(mid);
        }
    }

    /// Latches the manual kill. Emits the KILL event exactly once.
    pub fn assert_manual_kill(&mut self, now_ms: i64) -> Result<(), EngineError> {
        self.risk.assert_manual_kill();
        if !self.manual_kill_logged {
            self.manual_kill_logged = true;
            self.log.append(
                now_ms,
                EventBody::Kill {
                    reason: "manual".to_string(),
                    detail: "KILL_SWITCH asserted".to_string(),
                },
            )?;
        }
        Ok(())
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let view = self.clock.observe(now);
        let now_ms = now.timestamp_millis();

        if view.session_id != self.session.session_id {
            self.roll_session(&view, now_ms).await?;
        }

        if !self.has_open_trade() {
            let decision = {
                let snapshot = self.book.snapshot(now_ms);
                let input = gate_chain::GateInput {
                    zone: view.zone,
                    book: &snapshot,
                    session_trades: self.session_trades,
                    oscillations_5m: self.oscillations.oscillations(now_ms),
                    risk: self.risk.view(),
                    limits: self.risk.limits(),
                    now_ms,
                };
                self.gates.evaluate(&input)
            };
            match decision {
                GateDecision::Admit(plan) => self.enter(plan, &view, now_ms).await?,
                GateDecision::Skip(reason) => self.log_skip(&view, reason, now_ms)?,
            }
        }

        self.feed_open_trade_metrics(now_ms);
        Ok(())
    }

    /// Finalizes the current run: settle outstanding trades with the
    /// shutdown reason, write RUN_END, flush everything.
    pub async fn shutdown(&mut self, reason: &str, now_ms: i64) -> Result<(), EngineError> {
        self.settle_open_trades("shutdown", now_ms).await?;
        self.log.append(
            now_ms,
            EventBody::RunEnd {
                reason: reason.to_string(),
                totals: self.risk.totals(),
            },
        )?;
        self.log.flush()?;
        tracing::info!(reason, totals = ?self.risk.totals(), "engine stopped");
        Ok(())
    }

    fn has_open_trade(&self) -> bool {
        self.open_trades
            .iter()
            .any(|t| t.session_id == self.session.session_id)
    }

    async fn roll_session(&mut self, view: &ClockView, now_ms: i64) -> Result<(), EngineError> {
        // Settlement of the outgoing session strictly precedes any gate
        // evaluation (and so any ENTRY) in the incoming one.
        self.settle_open_trades("session_end", now_ms).await?;

        self.session = session_for(view.session_start);
        self.book.reset_for_session(self.session.session_id.clone());
        self.paper_rule.reset();
        self.session_trades = 0;
        self.last_skip = None;
        metrics::counter!("engine.sessions").increment(1);
        tracing::info!(session_id = %self.session.session_id, "session rolled");
        Ok(())
    }

    fn log_skip(
        &mut self,
        view: &ClockView,
        reason: SkipReason,
        now_ms: i64,
    ) -> Result<(), EngineError> {
        metrics::counter!("engine.skips", "reason" => reason.as_str()).increment(1);
        // One SKIP line per reason change, not one per tick; the stream
        // records decisions, not the tick cadence.
        if self.last_skip == Some(reason) {
            return Ok(());
        }
        self.last_skip = Some(reason);
        self.log.append(
            now_ms,
            EventBody::Skip {
                session_id: view.session_id.clone(),
                zone: view.zone.to_string(),
                elapsed_sec: view.elapsed_sec,
                reason: reason.as_str().to_string(),
            },
        )?;
        Ok(())
    }

    async fn enter(
        &mut self,
        plan: AdmitPlan,
        view: &ClockView,
        now_ms: i64,
    ) -> Result<(), EngineError> {
        let gran = self.cfg.share_granularity;
        let shares = ((self.cfg.notional_per_trade / plan.ask) / gran).floor() * gran;
        if shares * plan.ask < self.cfg.venue_min_notional {
            return self.log_skip(view, SkipReason::MinNotional, now_ms);
        }

        self.trade_seq += 1;
        let mut trade = Trade {
            trade_id: self.trade_seq,
            session_id: self.session.session_id.clone(),
            contract_id: self.session.contract_id(plan.side).to_string(),
            side: plan.side,
            ask_at_decision: plan.ask,
            edge_at_decision: plan.edge,
            required_edge_at_decision: plan.required_edge,
            spread_at_decision: plan.spread,
            notional: self.cfg.notional_per_trade,
            shares,
            fill_status: FillStatus::Pending,
            avg_fill_price: 0.0,
            order_id: String::new(),
            open_ts_ms: now_ms,
            settle_ts_ms: None,
            outcome: None,
            pnl: None,
        };

        // Budget is consumed on admission, before placement.
        self.risk.on_entry_admitted(now_ms);
        self.session_trades += 1;
        self.last_skip = None;
        metrics::counter!("engine.entries").increment(1);

        let (regime, oscillations) = self.oscillations.regime(now_ms);
        tracing::info!(
            session_id = %trade.session_id,
            side = %trade.side,
            ask = plan.ask,
            edge = plan.edge,
            required_edge = plan.required_edge,
            spread = plan.spread,
            regime = %regime,
            "entry admitted"
        );
        self.log.append(
            now_ms,
            EventBody::Entry {
                zone: view.zone.to_string(),
                elapsed_sec: view.elapsed_sec,
                regime: regime.to_string(),
                oscillations_5m: oscillations,
                trade: trade.clone(),
            },
        )?;
        self.recorder.on_entry(
            &trade,
            view.elapsed_sec,
            chrono::Timelike::hour(&view.session_start),
        );

        // At-most-once placement; degraded outcomes are data, not errors.
        let report = match self
            .gateway
            .submit_buy(BuyOrder {
                session_id: trade.session_id.clone(),
                contract_id: trade.contract_id.clone(),
                side: trade.side,
                price_limit: plan.ask,
                size: shares,
            })
            .await
        {
            Ok(report) => report,
            Err(err) => {
                tracing::warn!(error = %err, "placement failed, marking degraded");
                core_types::FillReport {
                    order_id: "FAILED".to_string(),
                    status: FillStatus::Degraded,
                    avg_price: 0.0,
                    filled_size: 0.0,
                    latency_ms: 0,
                    slippage_bps: 0.0,
                }
            }
        };

        metrics::counter!("engine.fills", "status" => match report.status {
            FillStatus::Filled => "filled",
            FillStatus::Degraded => "degraded",
            FillStatus::Cancelled => "cancelled",
            FillStatus::Pending => "pending",
        })
        .increment(1);

        trade.fill_status = report.status;
        trade.order_id = report.order_id.clone();
        if report.filled_size > 0.0 {
            trade.avg_fill_price = report.avg_price;
            trade.shares = report.filled_size;
        }

        self.log.append(
            now_ms,
            EventBody::Fill {
                trade_id: trade.trade_id,
                session_id: trade.session_id.clone(),
                order_id: report.order_id,
                status: report.status,
                avg_price: report.avg_price,
                filled_size: report.filled_size,
                latency_ms: report.latency_ms,
                slippage_bps: report.slippage_bps,
            },
        )?;

        if report.status == FillStatus::Degraded {
            metrics::counter!("engine.degraded_fills").increment(1);
            let latched = self.risk.on_degraded_fill();
            if latched {
                self.emit_latch_kill("degraded_fills", now_ms)?;
            }
        }

        let holds_position =
            matches!(report.status, FillStatus::Filled | FillStatus::Degraded)
                && report.filled_size > 0.0;
        if holds_position {
            self.open_trades.push(trade);
        } else {
            // Nothing to settle; the FILL record is the terminal event.
            self.recorder.discard(trade.trade_id);
            self.archived.push(trade);
        }
        Ok(())
    }

    fn feed_open_trade_metrics(&mut self, now_ms: i64) {
        let snapshot = self.book.snapshot(now_ms);
        for trade in &self.open_trades {
            if trade.session_id != self.session.session_id || trade.open_ts_ms == now_ms {
                continue;
            }
            let (Some(chosen), Some(opposite)) = (
                snapshot.side(trade.side),
                snapshot.side(trade.side.opposite()),
            ) else {
                continue;
            };
            self.recorder
                .on_tick(trade.trade_id, chosen.mid(), opposite.mid());
        }
    }

    async fn settle_open_trades(
        &mut self,
        settle_reason: &str,
        now_ms: i64,
    ) -> Result<(), EngineError> {
        let closing = self.session.session_id.clone();
        if !self.open_trades.iter().any(|t| t.session_id == closing) {
            return Ok(());
        }
        let winner = self.resolve_winner().await;
        let mut remaining = Vec::new();
        for mut trade in std::mem::take(&mut self.open_trades) {
            // A winner resolved here is the closing session's truth; trades
            // already stuck pending from older sessions stay untouched.
            if trade.session_id != closing {
                remaining.push(trade);
                continue;
            }
            let Some(winner) = winner else {
                // Venue never reported; leave the trade PENDING for a human.
                tracing::warn!(
                    trade_id = trade.trade_id,
                    session_id = %trade.session_id,
                    "settlement unavailable, trade left pending"
                );
                metrics::counter!("engine.settlement_unavailable").increment(1);
                remaining.push(trade);
                continue;
            };
            let Some((outcome, pnl)) = settle_trade(&mut trade, winner, now_ms) else {
                remaining.push(trade);
                continue;
            };

            let streak_latched = self.risk.on_settlement(outcome, pnl);
            metrics::counter!("engine.settlements", "outcome" => match outcome {
                core_types::TradeOutcome::Win => "win",
                core_types::TradeOutcome::Loss => "loss",
            })
            .increment(1);
            metrics::gauge!("engine.cumulative_pnl").set(self.risk.cumulative_pnl());

            // The metric sample lands before the SETTLED event, so a tailer
            // that sees SETTLED can rely on the sample being present.
            if let Some(sample) =
                self.recorder
                    .finalize(trade.trade_id, winner, pnl, settle_reason)
            {
                self.metrics_out.append(&sample)?;
            }

            tracing::info!(
                trade_id = trade.trade_id,
                session_id = %trade.session_id,
                outcome = %outcome,
                pnl,
                cumulative_pnl = self.risk.cumulative_pnl(),
                "trade settled"
            );
            self.log.append(
                now_ms,
                EventBody::Settled {
                    trade_id: trade.trade_id,
                    session_id: trade.session_id.clone(),
                    winner,
                    outcome,
                    pnl,
                    cumulative_pnl: self.risk.cumulative_pnl(),
                    consecutive_losses: self.risk.consecutive_losses(),
                    settle_reason: settle_reason.to_string(),
                },
            )?;

            if streak_latched {
                self.emit_latch_kill("consec_losses", now_ms)?;
            }
            self.archived.push(trade);
        }
        self.open_trades = remaining;
        Ok(())
    }

    async fn resolve_winner(&mut self) -> Option<Side> {
        match &self.oracle {
            Some(oracle) => {
                match fetch_winner_with_grace(
                    oracle.as_ref(),
                    &self.session,
                    self.cfg.settle_grace_attempts,
                    self.cfg.settle_poll_interval_ms,
                )
                .await
                {
                    Ok(side) => Some(side),
                    Err(err) => {
                        tracing::warn!(error = %err, "outcome oracle exhausted grace window");
                        None
                    }
                }
            }
            None => self.paper_rule.winner(),
        }
    }

    fn emit_latch_kill(&mut self, reason: &str, now_ms: i64) -> Result<(), EngineError> {
        if self.kill_latch_logged {
            return Ok(());
        }
        self.kill_latch_logged = true;
        self.log.append(
            now_ms,
            EventBody::Kill {
                reason: reason.to_string(),
                detail: self.risk.kill_reason().unwrap_or_default().to_string(),
            },
        )?;
        Ok(())
    }
}

fn spawn_feed_pump(feed: Arc<dyn MarketDataSource>, tx: mpsc::Sender<BookUpdate>) {
    tokio::spawn(async move {
        let mut streamed = false;
        let mut backoff_ms = 500_u64;
        loop {
            match feed.stream_updates().await {
                Ok(mut stream) => {
                    streamed = true;
                    backoff_ms = 500;
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(update) => {
                                if tx.send(update).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                metrics::counter!("feed.event_errors").increment(1);
                                tracing::warn!(error = %err, "feed event error");
                            }
                        }
                    }
                    tracing::info!("market data stream ended, resubscribing");
                }
                Err(err) => {
                    if streamed {
                        // A one-shot source (replay) is exhausted.
                        tracing::info!(error = %err, "market data source exhausted");
                        return;
                    }
                    tracing::warn!(error = %err, backoff_ms, "feed subscribe failed, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(10_000);
                }
            }
        }
    });
}

/// The process main loop: one decision task fed by queues, a tick timer,
/// the kill sentinel, and SIGINT for graceful shutdown.
pub async fn run_loop(
    mut orch: Orchestrator,
    feed: Arc<dyn MarketDataSource>,
    kill: SentinelKill,
    prometheus: Option<PrometheusHandle>,
) -> Result<(), EngineError> {
    let (tx, mut rx) = mpsc::channel::<BookUpdate>(4_096);
    spawn_feed_pump(feed, tx);

    let mut ticker = tokio::time::interval(Duration::from_millis(orch.tick_interval_ms().max(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut snapshot_ticker = tokio::time::interval(Duration::from_secs(60));

    let mut feed_done = false;
    let stop_reason = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received interrupt, shutting down");
                break "signal";
            }
            _ = ticker.tick() => {
                let now = Utc::now();
                let now_ms = now.timestamp_millis();
                loop {
                    match rx.try_recv() {
                        Ok(update) => orch.handle_update(&update, now_ms),
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            feed_done = true;
                            break;
                        }
                    }
                }
                if kill.asserted() {
                    orch.assert_manual_kill(now_ms)?;
                }
                orch.tick(now).await?;
                if feed_done {
                    break "feed_end";
                }
            }
            _ = snapshot_ticker.tick() => {
                if let Some(handle) = &prometheus {
                    observability::write_prometheus_snapshot(handle, orch.run_dir());
                }
            }
        }
    };

    orch.shutdown(stop_reason, Utc::now().timestamp_millis())
        .await?;
    if let Some(handle) = &prometheus {
        observability::write_prometheus_snapshot(handle, orch.run_dir());
    }
    Ok(())
}
