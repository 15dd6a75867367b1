// ===============================
// src/lifecycle.rs
// ===============================
//
// Position cleaner. The account must be flat when the engine starts and when
// it stops, whatever the snipers believe they hold: both sweeps work off the
// broker's own position list.
//
// startup : liquidate leftovers -> wait -> re-check, anything left is fatal
// shutdown: latch snipers + cancel their open orders -> wait ->
//           liquidate -> wait -> re-check, retried with backoff up to
//           `max_shutdown_attempts` times
//
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::domain::{OrderRequest, Position, ProductType};
use crate::gateway::{with_timeout, GatewayError, MarketGateway};
use crate::metrics::{LIQUIDATIONS, SHUTDOWN_ATTEMPTS};
use crate::sniper::Sniper;

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleConfig {
    pub settlement_delay: Duration,
    pub cancel_settlement_delay: Duration,
    pub retry_backoff: Duration,
    pub max_shutdown_attempts: u32,
    pub call_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            settlement_delay: Duration::from_secs(3),
            cancel_settlement_delay: Duration::from_secs(2),
            retry_backoff: Duration::from_secs(30),
            max_shutdown_attempts: 3,
            call_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("gateway: {0}")]
    Gateway(#[from] GatewayError),
    #[error("account not flat at startup, {} position(s) left", .0.len())]
    DirtyStartup(Vec<Position>),
    #[error("account not flat after {attempts} shutdown attempt(s), {} position(s) left", .residual.len())]
    ShutdownNotFlat { attempts: u32, residual: Vec<Position> },
}

pub struct PositionCleaner {
    gw: Arc<dyn MarketGateway>,
    cfg: LifecycleConfig,
}

fn open_positions(v: Vec<Position>) -> Vec<Position> {
    v.into_iter().filter(|p| p.leaves_qty > 0).collect()
}

impl PositionCleaner {
    pub fn new(gw: Arc<dyn MarketGateway>, cfg: LifecycleConfig) -> Self {
        Self { gw, cfg }
    }

    async fn positions(&self) -> Result<Vec<Position>, GatewayError> {
        let v = with_timeout(self.cfg.call_timeout, self.gw.get_positions(ProductType::Margin)).await?;
        Ok(open_positions(v))
    }

    async fn liquidate(&self, pos: &Position, phase: &'static str) -> Result<String, GatewayError> {
        let req = OrderRequest::liquidate(pos);
        let id = with_timeout(self.cfg.call_timeout, self.gw.send_order(&req)).await?;
        LIQUIDATIONS.with_label_values(&[phase]).inc();
        info!(phase, symbol = %pos.symbol, qty = pos.leaves_qty, order_id = %id, "liquidation sent");
        Ok(id)
    }

    /// Any failure here must stop the process before it trades.
    pub async fn startup_sweep(&self) -> Result<(), LifecycleError> {
        let leftovers = self.positions().await?;
        if leftovers.is_empty() {
            info!("startup sweep: account flat");
            return Ok(());
        }

        warn!(count = leftovers.len(), "startup sweep: leftover positions, liquidating");
        for p in &leftovers {
            self.liquidate(p, "startup").await?;
        }

        sleep(self.cfg.settlement_delay).await;
        let residual = self.positions().await?;
        if !residual.is_empty() {
            for p in &residual {
                error!(symbol = %p.symbol, qty = p.leaves_qty, "startup sweep: still open");
            }
            return Err(LifecycleError::DirtyStartup(residual));
        }
        info!("startup sweep: account flat after liquidation");
        Ok(())
    }

    /// Cancel everything the snipers have working, then liquidate until the
    /// broker reports flat or the attempts run out.
    pub async fn shutdown_sweep(&self, snipers: &[Arc<Sniper>]) -> Result<(), LifecycleError> {
        for s in snipers {
            s.force_exit();
            for o in s.open_orders() {
                match with_timeout(self.cfg.call_timeout, self.gw.cancel_order(&o.id)).await {
                    Ok(()) => {
                        s.mark_canceled(&o.id);
                        info!(symbol = %s.symbol(), order_id = %o.id, "open order canceled");
                    }
                    Err(e) => warn!(symbol = %s.symbol(), order_id = %o.id, %e, "cancel failed"),
                }
            }
        }
        sleep(self.cfg.cancel_settlement_delay).await;

        let max = self.cfg.max_shutdown_attempts.max(1);
        let mut residual: Vec<Position> = Vec::new();
        for attempt in 1..=max {
            SHUTDOWN_ATTEMPTS.inc();
            match self.sweep_once(attempt).await {
                Ok(left) if left.is_empty() => {
                    info!(attempt, "shutdown sweep: account flat");
                    return Ok(());
                }
                Ok(left) => {
                    for p in &left {
                        error!(attempt, symbol = %p.symbol, qty = p.leaves_qty, "shutdown sweep: still open");
                    }
                    residual = left;
                }
                Err(e) => error!(attempt, %e, "shutdown sweep: venue call failed"),
            }
            if attempt < max {
                sleep(self.cfg.retry_backoff).await;
            }
        }
        Err(LifecycleError::ShutdownNotFlat { attempts: max, residual })
    }

    /// One liquidate/settle/re-check round. Returns what is still open.
    async fn sweep_once(&self, attempt: u32) -> Result<Vec<Position>, GatewayError> {
        let open = self.positions().await?;
        if open.is_empty() {
            return Ok(open);
        }
        for p in &open {
            if let Err(e) = self.liquidate(p, "shutdown").await {
                warn!(attempt, symbol = %p.symbol, %e, "liquidation failed");
            }
        }
        sleep(self.cfg.settlement_delay).await;
        self.positions().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Side, Signal};
    use crate::gateway::{FillMode, MockConfig, MockGateway};
    use crate::order::Order;
    use crate::sniper::OrderProfile;
    use crate::strategy::{Brain, Strategy, StrategyInput};

    fn fast() -> LifecycleConfig {
        LifecycleConfig {
            settlement_delay: Duration::from_millis(5),
            cancel_settlement_delay: Duration::from_millis(5),
            retry_backoff: Duration::from_millis(5),
            max_shutdown_attempts: 3,
            call_timeout: Duration::from_millis(500),
        }
    }

    fn venue(fill: FillMode) -> MockGateway {
        MockGateway::new(MockConfig { fill, ..Default::default() })
    }

    fn leftover(symbol: &str, qty: u64) -> Position {
        Position {
            symbol: symbol.into(),
            leaves_qty: qty,
            price: 3990.0,
            exchange: Default::default(),
            trade_type: Default::default(),
            account_type: Default::default(),
        }
    }

    struct Never;
    impl Strategy for Never {
        fn evaluate(&mut self, _input: &StrategyInput) -> Signal {
            Signal::hold()
        }
    }

    #[tokio::test]
    async fn clean_startup_sends_nothing() {
        let gw = venue(FillMode::Immediate);
        PositionCleaner::new(Arc::new(gw.clone()), fast()).startup_sweep().await.unwrap();
        assert!(gw.sent_orders().is_empty());
    }

    #[tokio::test]
    async fn startup_liquidates_leftover() {
        let gw = venue(FillMode::Immediate);
        gw.seed_position(leftover("9433", 100));
        PositionCleaner::new(Arc::new(gw.clone()), fast()).startup_sweep().await.unwrap();

        let sent = gw.sent_orders();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].side, Side::Sell);
        assert_eq!(sent[0].qty, 100);
        assert_eq!(sent[0].symbol, "9433");
    }

    #[tokio::test]
    async fn startup_fails_when_venue_never_fills() {
        let gw = venue(FillMode::Never);
        gw.seed_position(leftover("9433", 100));
        let err = PositionCleaner::new(Arc::new(gw.clone()), fast()).startup_sweep().await.unwrap_err();
        match err {
            LifecycleError::DirtyStartup(left) => assert_eq!(left[0].leaves_qty, 100),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn startup_submit_failure_is_fatal() {
        let gw = venue(FillMode::Immediate);
        gw.seed_position(leftover("9433", 100));
        gw.set_reject_orders(true);
        let err = PositionCleaner::new(Arc::new(gw), fast()).startup_sweep().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Gateway(GatewayError::Rejected(_))));
    }

    #[tokio::test]
    async fn shutdown_cancels_then_flattens() {
        let gw = venue(FillMode::Immediate);
        gw.seed_position(leftover("9433", 200));
        let sniper = Arc::new(Sniper::new("9433", "never", Brain::Plain(Box::new(Never)), OrderProfile::default()));

        PositionCleaner::new(Arc::new(gw.clone()), fast()).shutdown_sweep(&[sniper.clone()]).await.unwrap();
        assert!(sniper.is_exiting());
        assert!(gw.get_positions(ProductType::Margin).await.unwrap().is_empty());
        let sent = gw.sent_orders();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].qty, 200);
    }

    #[tokio::test]
    async fn shutdown_gives_up_after_bounded_attempts() {
        let gw = venue(FillMode::Never);
        let sniper = Arc::new(Sniper::new("9433", "never", Brain::Plain(Box::new(Never)), OrderProfile::default()));

        // a working buy the sniper knows about
        let buy = crate::domain::OrderRequest { side: Side::Buy, ..OrderRequest::liquidate(&leftover("9433", 100)) };
        let id = gw.send_order(&buy).await.unwrap();
        sniper.record_order(Order::new(id.clone(), "9433", Side::Buy, 0.0, 100));
        gw.seed_position(leftover("9433", 100));

        let err = PositionCleaner::new(Arc::new(gw.clone()), fast())
            .shutdown_sweep(&[sniper.clone()])
            .await
            .unwrap_err();

        assert_eq!(gw.canceled_orders(), vec![id]);
        assert!(sniper.open_orders().is_empty());
        match err {
            LifecycleError::ShutdownNotFlat { attempts, residual } => {
                assert_eq!(attempts, 3);
                assert_eq!(residual.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        let sells = gw.sent_orders().iter().filter(|r| r.side == Side::Sell).count();
        assert_eq!(sells, 3);
    }
}
