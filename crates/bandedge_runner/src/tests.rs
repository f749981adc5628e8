use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use core_types::{
    BookUpdate, BuyOrder, EngineError, FillReport, FillStatus, OrderGateway, Side, TradeOutcome,
};
use event_log::{read_events, EventBody};
use execution::PaperGateway;

use crate::config::RunConfig;
use crate::engine::Orchestrator;

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 2, h, m, s).unwrap()
}

fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn test_cfg(tag: &str) -> RunConfig {
    RunConfig {
        run_id: format!("test-{tag}"),
        log_dir: std::env::temp_dir().join(format!(
            "bandedge_engine_{}_{}",
            tag,
            std::process::id()
        )),
        ..RunConfig::default()
    }
}

fn wipe(cfg: &RunConfig) {
    let _ = fs::remove_dir_all(&cfg.log_dir);
}

fn update(session: &str, side: Side, bid: f64, ask: f64, ts_ms: i64) -> BookUpdate {
    BookUpdate {
        session_id: session.to_string(),
        side,
        bid,
        ask,
        server_ts_ms: ts_ms,
    }
}

async fn paper_orchestrator(cfg: &RunConfig, start: DateTime<Utc>) -> Orchestrator {
    let gateway = Arc::new(PaperGateway::new(cfg.paper_seed(), cfg.paper_max_slip_ticks));
    Orchestrator::new(cfg.clone(), gateway, None, start)
        .await
        .expect("orchestrator")
}

fn feed_both(orch: &mut Orchestrator, session: &str, up: (f64, f64), down: (f64, f64), ts_ms: i64) {
    orch.handle_update(&update(session, Side::Up, up.0, up.1, ts_ms), ts_ms);
    orch.handle_update(&update(session, Side::Down, down.0, down.1, ts_ms), ts_ms);
}

fn events_path(cfg: &RunConfig) -> PathBuf {
    cfg.run_dir().join("events.jsonl")
}

fn kinds(cfg: &RunConfig) -> Vec<String> {
    read_events(events_path(cfg))
        .expect("read events")
        .into_iter()
        .map(|e| e.body.kind().to_string())
        .collect()
}

/// Drives one clean session: early skip, CORE entry, favorable drift, then
/// the boundary settles the trade as a win.
#[tokio::test]
async fn paper_win_end_to_end() {
    let cfg = test_cfg("win");
    wipe(&cfg);
    let mut orch = paper_orchestrator(&cfg, at(14, 30, 0)).await;

    // EARLY zone: gate chain skips on ZONE.
    let t0 = at(14, 31, 0);
    feed_both(&mut orch, "20260802-1430", (0.64, 0.66), (0.34, 0.36), ms(t0));
    orch.tick(t0).await.expect("tick");

    // CORE zone: admit, paper fill at the ask.
    let t1 = at(14, 32, 40);
    feed_both(&mut orch, "20260802-1430", (0.64, 0.66), (0.34, 0.36), ms(t1));
    orch.tick(t1).await.expect("tick");
    assert_eq!(orch.open_trades().len(), 1);
    let trade = &orch.open_trades()[0];
    assert_eq!(trade.side, Side::Up);
    assert!((trade.ask_at_decision - 0.66).abs() < 1e-9);
    assert!((trade.avg_fill_price - 0.66).abs() < 1e-9);
    let shares = trade.shares;
    assert!((shares - (5.0_f64 / 0.66 / 0.0001).floor() * 0.0001).abs() < 1e-9);

    // Post-entry drift in favor.
    for (i, mids) in [(1_u32, (0.66, 0.68)), (2, (0.68, 0.70))] {
        let t = at(14, 32, 40 + i);
        feed_both(&mut orch, "20260802-1430", mids, (0.30, 0.32), ms(t));
        orch.tick(t).await.expect("tick");
    }

    // Boundary crossing settles the prior session before anything else.
    let t2 = at(14, 45, 1);
    orch.tick(t2).await.expect("tick");
    assert!(orch.open_trades().is_empty());
    assert_eq!(orch.session_id(), "20260802-1445");

    let settled = &orch.archived_trades()[0];
    assert_eq!(settled.outcome, Some(TradeOutcome::Win));
    let expected_pnl = (1.0 - 0.66) * shares;
    assert!((settled.pnl.unwrap() - expected_pnl).abs() < 1e-9);
    assert!((orch.risk().cumulative_pnl() - expected_pnl).abs() < 1e-9);
    assert_eq!(orch.risk().consecutive_losses(), 0);

    let kinds = kinds(&cfg);
    assert_eq!(kinds[0], "RUN_START");
    let entry_at = kinds.iter().position(|k| k.as_str() == "ENTRY").expect("entry");
    let fill_at = kinds.iter().position(|k| k.as_str() == "FILL").expect("fill");
    let settled_at = kinds
        .iter()
        .position(|k| k.as_str() == "SETTLED")
        .expect("settled");
    assert!(entry_at < fill_at && fill_at < settled_at);
    assert!(kinds[1..entry_at].iter().all(|k| k.as_str() == "SKIP"));

    // The metric sample was finalized with the settlement.
    let metrics_raw = fs::read_to_string(cfg.run_dir().join("metrics.jsonl")).expect("metrics");
    let sample: trade_metrics::MetricSample =
        serde_json::from_str(metrics_raw.lines().next().expect("one sample")).expect("parse");
    assert_eq!(sample.trade_id, settled.trade_id);
    assert_eq!(sample.result, TradeOutcome::Win);
    assert_eq!(sample.settle_reason, "session_end");

    wipe(&cfg);
}

#[tokio::test]
async fn losing_trade_costs_the_premium() {
    let cfg = test_cfg("loss");
    wipe(&cfg);
    let mut orch = paper_orchestrator(&cfg, at(14, 30, 0)).await;

    let t1 = at(14, 32, 40);
    feed_both(&mut orch, "20260802-1430", (0.64, 0.66), (0.34, 0.36), ms(t1));
    orch.tick(t1).await.expect("tick");
    let shares = orch.open_trades()[0].shares;

    // Book collapses: final UP mid below the first observed one.
    let t2 = at(14, 33, 0);
    feed_both(&mut orch, "20260802-1430", (0.40, 0.42), (0.58, 0.60), ms(t2));
    orch.tick(t2).await.expect("tick");

    orch.tick(at(14, 45, 1)).await.expect("tick");
    let settled = &orch.archived_trades()[0];
    assert_eq!(settled.outcome, Some(TradeOutcome::Loss));
    assert!((settled.pnl.unwrap() + 0.66 * shares).abs() < 1e-9);
    assert_eq!(orch.risk().consecutive_losses(), 1);

    wipe(&cfg);
}

#[tokio::test]
async fn at_most_one_entry_per_session() {
    let cfg = RunConfig {
        max_trades_per_run: 5,
        cooldown_sec: 0,
        ..test_cfg("session_cap")
    };
    wipe(&cfg);
    let mut orch = paper_orchestrator(&cfg, at(14, 30, 0)).await;

    for s in 0..30_u32 {
        let t = at(14, 32, 40 + s);
        feed_both(&mut orch, "20260802-1430", (0.64, 0.66), (0.34, 0.36), ms(t));
        orch.tick(t).await.expect("tick");
    }

    let entries = kinds(&cfg)
        .iter()
        .filter(|k| k.as_str() == "ENTRY")
        .count();
    assert_eq!(entries, 1);

    wipe(&cfg);
}

struct DegradedGateway;

#[async_trait]
impl OrderGateway for DegradedGateway {
    async fn submit_buy(&self, order: BuyOrder) -> Result<FillReport, EngineError> {
        Ok(FillReport {
            order_id: "LIVE-DEGRADED".to_string(),
            status: FillStatus::Degraded,
            avg_price: order.price_limit + 0.03,
            filled_size: order.size,
            latency_ms: 1_450,
            slippage_bps: 450.0,
        })
    }
}

/// Two degraded fills engage the latch; afterwards admissible ticks skip on
/// EXECUTOR_GATE until restart.
#[tokio::test]
async fn degraded_fill_latch_blocks_future_entries() {
    let cfg = RunConfig {
        max_trades_per_run: 5,
        ..test_cfg("degraded")
    };
    wipe(&cfg);
    let mut orch = Orchestrator::new(cfg.clone(), Arc::new(DegradedGateway), None, at(14, 30, 0))
        .await
        .expect("orchestrator");

    // First degraded fill.
    let t1 = at(14, 32, 40);
    feed_both(&mut orch, "20260802-1430", (0.64, 0.66), (0.34, 0.36), ms(t1));
    orch.tick(t1).await.expect("tick");
    assert_eq!(orch.risk().degraded_fill_count(), 1);
    assert!(!orch.risk().kill_engaged());

    // Next session, second degraded fill engages the latch.
    orch.tick(at(14, 45, 1)).await.expect("roll");
    let t2 = at(14, 47, 40);
    feed_both(&mut orch, "20260802-1445", (0.64, 0.66), (0.34, 0.36), ms(t2));
    orch.tick(t2).await.expect("tick");
    assert_eq!(orch.risk().degraded_fill_count(), 2);
    assert!(orch.risk().kill_engaged());

    // Third session: same admissible book now skips on EXECUTOR_GATE.
    orch.tick(at(15, 0, 1)).await.expect("roll");
    let t3 = at(15, 2, 40);
    feed_both(&mut orch, "20260802-1500", (0.64, 0.66), (0.34, 0.36), ms(t3));
    orch.tick(t3).await.expect("tick");
    assert_eq!(orch.open_trades().len(), 0);

    let events = read_events(events_path(&cfg)).expect("events");
    assert!(events.iter().any(|e| matches!(
        &e.body,
        EventBody::Kill { reason, .. } if reason == "degraded_fills"
    )));
    let last_skip = events
        .iter()
        .rev()
        .find_map(|e| match &e.body {
            EventBody::Skip { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .expect("skip");
    assert_eq!(last_skip, "EXECUTOR_GATE");

    wipe(&cfg);
}

#[tokio::test]
async fn manual_kill_latches_and_blocks() {
    let cfg = test_cfg("manual_kill");
    wipe(&cfg);
    let mut orch = paper_orchestrator(&cfg, at(14, 30, 0)).await;

    orch.assert_manual_kill(ms(at(14, 32, 30))).expect("kill");
    let t1 = at(14, 32, 40);
    feed_both(&mut orch, "20260802-1430", (0.64, 0.66), (0.34, 0.36), ms(t1));
    orch.tick(t1).await.expect("tick");
    assert!(orch.open_trades().is_empty());
    assert_eq!(
        orch.last_skip().map(|r| r.as_str()),
        Some("EXECUTOR_GATE")
    );

    let events = read_events(events_path(&cfg)).expect("events");
    let kills = events
        .iter()
        .filter(|e| matches!(&e.body, EventBody::Kill { reason, .. } if reason == "manual"))
        .count();
    assert_eq!(kills, 1);

    wipe(&cfg);
}

#[tokio::test]
async fn min_notional_skip() {
    let cfg = RunConfig {
        venue_min_notional: 10.0,
        ..test_cfg("min_notional")
    };
    wipe(&cfg);
    let mut orch = paper_orchestrator(&cfg, at(14, 30, 0)).await;

    let t1 = at(14, 32, 40);
    feed_both(&mut orch, "20260802-1430", (0.64, 0.66), (0.34, 0.36), ms(t1));
    orch.tick(t1).await.expect("tick");
    assert!(orch.open_trades().is_empty());
    assert_eq!(orch.last_skip().map(|r| r.as_str()), Some("MIN_NOTIONAL"));

    wipe(&cfg);
}

#[tokio::test]
async fn shutdown_settles_pending_trades() {
    let cfg = test_cfg("shutdown");
    wipe(&cfg);
    let mut orch = paper_orchestrator(&cfg, at(14, 30, 0)).await;

    let t1 = at(14, 32, 40);
    feed_both(&mut orch, "20260802-1430", (0.64, 0.66), (0.34, 0.36), ms(t1));
    orch.tick(t1).await.expect("tick");
    assert_eq!(orch.open_trades().len(), 1);

    orch.shutdown("signal", ms(at(14, 33, 0))).await.expect("shutdown");
    assert!(orch.open_trades().is_empty());

    let events = read_events(events_path(&cfg)).expect("events");
    let settle_reason = events
        .iter()
        .find_map(|e| match &e.body {
            EventBody::Settled { settle_reason, .. } => Some(settle_reason.clone()),
            _ => None,
        })
        .expect("settled");
    assert_eq!(settle_reason, "shutdown");
    let EventBody::RunEnd { reason, totals } = &events.last().expect("run end").body else {
        panic!("last event must be RUN_END");
    };
    assert_eq!(reason, "signal");
    assert_eq!(totals.trades, 1);

    // Ledger consistency: summed SETTLED pnl equals the RUN_END cumulative.
    let pnl_sum: f64 = events
        .iter()
        .filter_map(|e| match &e.body {
            EventBody::Settled { pnl, .. } => Some(*pnl),
            _ => None,
        })
        .sum();
    assert!((pnl_sum - totals.cumulative_pnl).abs() < 1e-9);

    wipe(&cfg);
}

/// Same scripted feed, same run id, same injected clock: the two event logs
/// must be byte-identical.
#[tokio::test]
async fn paper_replay_is_deterministic() {
    async fn drive(cfg: &RunConfig) -> Vec<u8> {
        let mut orch = paper_orchestrator(cfg, at(14, 30, 0)).await;
        let script = [
            (at(14, 31, 0), (0.62, 0.64), (0.34, 0.36)),
            (at(14, 32, 40), (0.64, 0.66), (0.34, 0.36)),
            (at(14, 33, 0), (0.66, 0.68), (0.30, 0.32)),
        ];
        for (t, up, down) in script {
            feed_both(&mut orch, "20260802-1430", up, down, ms(t));
            orch.tick(t).await.expect("tick");
        }
        orch.tick(at(14, 45, 1)).await.expect("roll");
        orch.shutdown("feed_end", ms(at(14, 45, 2)))
            .await
            .expect("shutdown");
        fs::read(events_path(cfg)).expect("read log")
    }

    let cfg = RunConfig {
        run_id: "fixed-run".to_string(),
        log_dir: std::env::temp_dir().join(format!("bandedge_det_{}", std::process::id())),
        ..RunConfig::default()
    };
    wipe(&cfg);
    let log_a = drive(&cfg).await;
    wipe(&cfg);
    let log_b = drive(&cfg).await;
    assert!(!log_a.is_empty());
    assert_eq!(log_a, log_b);

    wipe(&cfg);
}

/// Stale quotes make a side read absent, which the BOOK gate rejects.
#[tokio::test]
async fn stale_book_is_skipped() {
    let cfg = test_cfg("stale");
    wipe(&cfg);
    let mut orch = paper_orchestrator(&cfg, at(14, 30, 0)).await;

    // Quotes arrive two seconds before the tick observes them.
    let t_feed = at(14, 32, 38);
    feed_both(
        &mut orch,
        "20260802-1430",
        (0.64, 0.66),
        (0.34, 0.36),
        ms(t_feed),
    );
    let t_tick = at(14, 32, 40);
    orch.tick(t_tick).await.expect("tick");
    assert!(orch.open_trades().is_empty());
    assert_eq!(orch.last_skip().map(|r| r.as_str()), Some("BOOK_GATE"));

    wipe(&cfg);
}
