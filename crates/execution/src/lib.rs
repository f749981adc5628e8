use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use core_types::{BuyOrder, EngineError, FillReport, FillStatus, OrderGateway, TICK};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Fill quality predicates for the live adapter. A fill that completes but
/// violates any of them is reported DEGRADED.
const DEGRADE_SLIP_TICKS: f64 = 2.0;
const PLACEMENT_TIMEOUT_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Paper,
    Live,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Live => "real",
        }
    }
}

/// External venue order client. Signing, wallet routing, and nonce handling
/// live behind this seam; the core never sees them.
#[async_trait]
pub trait VenueOrderClient: Send + Sync {
    async fn submit_buy(
        &self,
        contract_id: &str,
        price_limit: f64,
        size: f64,
    ) -> Result<VenueFill, EngineError>;

    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VenueFill {
    pub order_id: String,
    pub avg_price: f64,
    pub filled_size: f64,
}

/// Paper placement: synthesizes a full fill at the submitted limit with a
/// bounded, seeded slippage model. Zero slip ticks (the default) fills at
/// the decision ask, which keeps paper P&L directly comparable to the
/// backtests.
pub struct PaperGateway {
    rng: Mutex<StdRng>,
    max_slip_ticks: u32,
    seq: AtomicU64,
}

impl PaperGateway {
    pub fn new(seed: u64, max_slip_ticks: u32) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            max_slip_ticks,
            seq: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn submit_buy(&self, order: BuyOrder) -> Result<FillReport, EngineError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let slip_ticks = if self.max_slip_ticks == 0 {
            0
        } else {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.random_range(0..=self.max_slip_ticks)
        };
        let avg_price = (order.price_limit + slip_ticks as f64 * TICK).min(1.0 - TICK);
        let slippage_bps = if order.price_limit > 0.0 {
            (avg_price - order.price_limit) / order.price_limit * 10_000.0
        } else {
            0.0
        };
        tracing::debug!(
            session_id = %order.session_id,
            side = %order.side,
            price = order.price_limit,
            size = order.size,
            "paper fill"
        );
        Ok(FillReport {
            order_id: format!("PAPER-{seq:04}"),
            status: FillStatus::Filled,
            avg_price,
            filled_size: order.size,
            latency_ms: 0,
            slippage_bps,
        })
    }
}

/// Live placement: one shot through the venue client with a hard timeout.
/// Partial fills, slippage beyond two ticks, and slow fills all come back
/// DEGRADED; rejects and timeouts are DEGRADED terminals with zero filled
/// size. Never retries.
pub struct LiveGateway {
    client: Arc<dyn VenueOrderClient>,
    timeout_ms: u64,
}

impl LiveGateway {
    pub fn new(client: Arc<dyn VenueOrderClient>) -> Self {
        Self {
            client,
            timeout_ms: PLACEMENT_TIMEOUT_MS,
        }
    }
}

#[async_trait]
impl OrderGateway for LiveGateway {
    async fn submit_buy(&self, order: BuyOrder) -> Result<FillReport, EngineError> {
        let started = tokio::time::Instant::now();
        let submit = self
            .client
            .submit_buy(&order.contract_id, order.price_limit, order.size);
        let outcome = tokio::time::timeout(Duration::from_millis(self.timeout_ms), submit).await;

        let latency_ms = started.elapsed().as_millis() as u64;
        let fill = match outcome {
            Err(_) => {
                tracing::warn!(
                    session_id = %order.session_id,
                    timeout_ms = self.timeout_ms,
                    "placement timed out, marking degraded"
                );
                return Ok(degraded_unfilled("TIMEOUT", self.timeout_ms));
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    session_id = %order.session_id,
                    error = %err,
                    "placement rejected, marking degraded"
                );
                return Ok(degraded_unfilled("REJECTED", latency_ms));
            }
            Ok(Ok(fill)) => fill,
        };

        let partial = fill.filled_size + 1e-9 < order.size;
        let slipped = fill.avg_price > order.price_limit + DEGRADE_SLIP_TICKS * TICK + 1e-9;
        let slow = latency_ms > self.timeout_ms;
        let status = if partial || slipped || slow {
            FillStatus::Degraded
        } else {
            FillStatus::Filled
        };
        let slippage_bps = if order.price_limit > 0.0 {
            (fill.avg_price - order.price_limit) / order.price_limit * 10_000.0
        } else {
            0.0
        };
        Ok(FillReport {
            order_id: fill.order_id,
            status,
            avg_price: fill.avg_price,
            filled_size: fill.filled_size,
            latency_ms,
            slippage_bps,
        })
    }

    async fn check_connectivity(&self) -> Result<(), EngineError> {
        self.client.ping().await
    }
}

/// Placement stand-in for real mode with the EXECUTION_ENABLED safety lock
/// still open. Reports every submission CANCELLED without touching the
/// venue, so the rest of the pipeline (gates, logs, metrics) runs exactly
/// as it would live.
pub struct BlockedGateway;

#[async_trait]
impl OrderGateway for BlockedGateway {
    async fn submit_buy(&self, order: BuyOrder) -> Result<FillReport, EngineError> {
        tracing::warn!(
            session_id = %order.session_id,
            side = %order.side,
            price = order.price_limit,
            "execution disabled, order blocked"
        );
        Ok(FillReport {
            order_id: "EXEC_OFF".to_string(),
            status: FillStatus::Cancelled,
            avg_price: 0.0,
            filled_size: 0.0,
            latency_ms: 0,
            slippage_bps: 0.0,
        })
    }
}

fn degraded_unfilled(tag: &str, latency_ms: u64) -> FillReport {
    FillReport {
        order_id: tag.to_string(),
        status: FillStatus::Degraded,
        avg_price: 0.0,
        filled_size: 0.0,
        latency_ms,
        slippage_bps: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::Side;

    fn order(price: f64, size: f64) -> BuyOrder {
        BuyOrder {
            session_id: "s1".to_string(),
            contract_id: "up-s1".to_string(),
            side: Side::Up,
            price_limit: price,
            size,
        }
    }

    struct StubClient {
        fill: VenueFill,
        delay_ms: u64,
        reject: bool,
    }

    #[async_trait]
    impl VenueOrderClient for StubClient {
        async fn submit_buy(
            &self,
            _contract_id: &str,
            _price_limit: f64,
            _size: f64,
        ) -> Result<VenueFill, EngineError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.reject {
                return Err(EngineError::PlacementReject("insufficient balance".into()));
            }
            Ok(self.fill.clone())
        }
    }

    fn clean_fill(price: f64, size: f64) -> VenueFill {
        VenueFill {
            order_id: "o1".to_string(),
            avg_price: price,
            filled_size: size,
        }
    }

    #[tokio::test]
    async fn paper_fills_at_limit_by_default() {
        let gw = PaperGateway::new(7, 0);
        let report = gw.submit_buy(order(0.64, 7.8125)).await.expect("fill");
        assert_eq!(report.status, FillStatus::Filled);
        assert!((report.avg_price - 0.64).abs() < 1e-12);
        assert!((report.filled_size - 7.8125).abs() < 1e-12);
        assert_eq!(report.order_id, "PAPER-0001");
    }

    #[tokio::test]
    async fn paper_slippage_is_seed_deterministic() {
        let a = PaperGateway::new(42, 3);
        let b = PaperGateway::new(42, 3);
        for _ in 0..10 {
            let ra = a.submit_buy(order(0.64, 5.0)).await.expect("fill");
            let rb = b.submit_buy(order(0.64, 5.0)).await.expect("fill");
            assert_eq!(ra.avg_price.to_bits(), rb.avg_price.to_bits());
        }
    }

    #[tokio::test]
    async fn live_clean_fill_passes() {
        let gw = LiveGateway::new(Arc::new(StubClient {
            fill: clean_fill(0.64, 5.0),
            delay_ms: 0,
            reject: false,
        }));
        let report = gw.submit_buy(order(0.64, 5.0)).await.expect("fill");
        assert_eq!(report.status, FillStatus::Filled);
    }

    #[tokio::test]
    async fn live_partial_fill_is_degraded() {
        let gw = LiveGateway::new(Arc::new(StubClient {
            fill: clean_fill(0.64, 2.0),
            delay_ms: 0,
            reject: false,
        }));
        let report = gw.submit_buy(order(0.64, 5.0)).await.expect("fill");
        assert_eq!(report.status, FillStatus::Degraded);
        assert!((report.filled_size - 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn live_slip_beyond_two_ticks_is_degraded() {
        let gw = LiveGateway::new(Arc::new(StubClient {
            fill: VenueFill {
                order_id: "o1".to_string(),
                avg_price: 0.67,
                filled_size: 5.0,
            },
            delay_ms: 0,
            reject: false,
        }));
        let report = gw.submit_buy(order(0.64, 5.0)).await.expect("fill");
        assert_eq!(report.status, FillStatus::Degraded);
        assert!(report.slippage_bps > 400.0);
    }

    #[tokio::test]
    async fn live_slip_within_two_ticks_passes() {
        let gw = LiveGateway::new(Arc::new(StubClient {
            fill: VenueFill {
                order_id: "o1".to_string(),
                avg_price: 0.66,
                filled_size: 5.0,
            },
            delay_ms: 0,
            reject: false,
        }));
        let report = gw.submit_buy(order(0.64, 5.0)).await.expect("fill");
        assert_eq!(report.status, FillStatus::Filled);
    }

    #[tokio::test(start_paused = true)]
    async fn live_timeout_is_degraded_unfilled() {
        let gw = LiveGateway::new(Arc::new(StubClient {
            fill: clean_fill(0.64, 5.0),
            delay_ms: 5_000,
            reject: false,
        }));
        let report = gw.submit_buy(order(0.64, 5.0)).await.expect("report");
        assert_eq!(report.status, FillStatus::Degraded);
        assert_eq!(report.filled_size, 0.0);
        assert_eq!(report.order_id, "TIMEOUT");
    }

    #[tokio::test]
    async fn live_reject_is_degraded_unfilled() {
        let gw = LiveGateway::new(Arc::new(StubClient {
            fill: clean_fill(0.64, 5.0),
            delay_ms: 0,
            reject: true,
        }));
        let report = gw.submit_buy(order(0.64, 5.0)).await.expect("report");
        assert_eq!(report.status, FillStatus::Degraded);
        assert_eq!(report.order_id, "REJECTED");
    }
}
