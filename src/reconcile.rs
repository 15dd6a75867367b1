// ===============================
// src/reconcile.rs
// ===============================
//
// Fill reconciliation. The venue only lets us see fills by polling the
// order list, so every poll returns the full history again. The reconciler
// remembers which execution ids it already emitted and turns the rest into
// ExecutionReports.
//
use ahash::AHashSet as HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    sync::{mpsc, watch},
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::domain::ExecutionReport;
use crate::gateway::MarketGateway;
use crate::metrics::{EXEC_REPORTS_EMITTED, POLL_ERRORS};
use crate::order::Order;

#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    pub interval: Duration,
    pub call_timeout: Duration,
    pub capacity: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            call_timeout: Duration::from_secs(5),
            capacity: 1024,
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecutionReconciler {
    seen: HashSet<String>,
}

impl ExecutionReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports for every execution id not seen in an earlier call. Rows with
    /// an empty execution id are skipped.
    pub fn reconcile(&mut self, orders: &[Order]) -> Vec<ExecutionReport> {
        let mut out = Vec::new();
        for o in orders {
            for e in &o.executions {
                if e.id.is_empty() || !self.seen.insert(e.id.clone()) {
                    continue;
                }
                out.push(ExecutionReport {
                    order_id: o.id.clone(),
                    execution_id: e.id.clone(),
                    symbol: o.symbol.clone(),
                    side: o.side,
                    price: e.price,
                    qty: e.qty,
                });
            }
        }
        out
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

/// Poll `get_orders` until shutdown or until the consumer drops `tx`.
/// Errors and timeouts are logged and retried on the next interval.
pub async fn run_poller(
    gw: Arc<dyn MarketGateway>,
    cfg: PollerConfig,
    tx: mpsc::Sender<ExecutionReport>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reconciler = ExecutionReconciler::new();
    let mut every = interval(cfg.interval);
    every.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_ms = cfg.interval.as_millis() as u64, "execution poller started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() { break; }
            }
            _ = every.tick() => {
                let orders = match timeout(cfg.call_timeout, gw.get_orders()).await {
                    Ok(Ok(o)) => o,
                    Ok(Err(e)) => {
                        POLL_ERRORS.with_label_values(&["error"]).inc();
                        warn!(%e, "order poll failed");
                        continue;
                    }
                    Err(_) => {
                        POLL_ERRORS.with_label_values(&["timeout"]).inc();
                        warn!(timeout_ms = cfg.call_timeout.as_millis() as u64, "order poll timed out");
                        continue;
                    }
                };
                let reports = reconciler.reconcile(&orders);
                if !reports.is_empty() {
                    debug!(new = reports.len(), seen = reconciler.seen_count(), "new executions");
                }
                for rep in reports {
                    EXEC_REPORTS_EMITTED.inc();
                    if tx.send(rep).await.is_err() {
                        info!("execution consumer gone, poller stopping");
                        return;
                    }
                }
            }
        }
    }
    info!("execution poller stopped");
}

/// Spawn `run_poller` and hand back its report stream.
pub fn spawn_poller(
    gw: Arc<dyn MarketGateway>,
    cfg: PollerConfig,
    shutdown: watch::Receiver<bool>,
) -> mpsc::Receiver<ExecutionReport> {
    let (tx, rx) = mpsc::channel(cfg.capacity.max(1));
    tokio::spawn(run_poller(gw, cfg, tx, shutdown));
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use crate::gateway::{FillMode, MockConfig, MockGateway};
    use crate::order::Execution;

    fn order(id: &str, execs: &[(&str, u64)]) -> Order {
        let mut o = Order::new(id, "9433", Side::Buy, 0.0, 1_000);
        for (eid, qty) in execs {
            o.executions.push(Execution { id: eid.to_string(), price: 3990.0, qty: *qty });
        }
        o
    }

    #[test]
    fn same_execution_is_reported_once_across_polls() {
        let mut r = ExecutionReconciler::new();
        let first = r.reconcile(&[order("O1", &[("E1", 100)])]);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].execution_id, "E1");
        assert_eq!(first[0].order_id, "O1");

        let second = r.reconcile(&[order("O1", &[("E1", 100), ("E2", 50)])]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].execution_id, "E2");

        assert!(r.reconcile(&[order("O1", &[("E1", 100), ("E2", 50)])]).is_empty());
    }

    #[test]
    fn empty_execution_ids_are_skipped() {
        let mut r = ExecutionReconciler::new();
        let out = r.reconcile(&[order("O1", &[("", 0), ("E1", 100)])]);
        assert_eq!(out.len(), 1);
        assert_eq!(r.seen_count(), 1);
    }

    #[test]
    fn dedup_is_by_execution_id_not_order_id() {
        let mut r = ExecutionReconciler::new();
        let out = r.reconcile(&[order("O1", &[("E1", 10)]), order("O2", &[("E2", 10)])]);
        assert_eq!(out.len(), 2);
        // an id repeated under a different order still counts as seen
        assert!(r.reconcile(&[order("O3", &[("E1", 10)])]).is_empty());
    }

    #[tokio::test]
    async fn poller_streams_fills_and_stops_on_shutdown() {
        let gw = MockGateway::new(MockConfig { fill: FillMode::Immediate, ..Default::default() });
        let req = crate::domain::OrderRequest::liquidate(&crate::domain::Position {
            symbol: "9433".into(),
            leaves_qty: 100,
            price: 3990.0,
            exchange: Default::default(),
            trade_type: Default::default(),
            account_type: Default::default(),
        });
        gw.send_order(&req).await.unwrap();

        let (sd_tx, sd_rx) = watch::channel(false);
        let cfg = PollerConfig { interval: Duration::from_millis(5), ..Default::default() };
        let mut rx = spawn_poller(Arc::new(gw.clone()), cfg, sd_rx);

        let rep = rx.recv().await.unwrap();
        assert_eq!(rep.qty, 100);
        assert_eq!(rep.side, Side::Sell);

        // nothing new on later polls
        let quiet = timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(quiet.is_err());

        sd_tx.send(true).unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn failed_polls_are_skipped_and_polling_continues() {
        let gw = MockGateway::new(MockConfig { fill: FillMode::Immediate, ..Default::default() });
        let req = crate::domain::OrderRequest::liquidate(&crate::domain::Position {
            symbol: "9433".into(),
            leaves_qty: 100,
            price: 3990.0,
            exchange: Default::default(),
            trade_type: Default::default(),
            account_type: Default::default(),
        });
        let order_id = gw.send_order(&req).await.unwrap();
        gw.fail_polls(3);
        let errors_before = POLL_ERRORS.with_label_values(&["error"]).get();

        let (sd_tx, sd_rx) = watch::channel(false);
        let cfg = PollerConfig { interval: Duration::from_millis(5), ..Default::default() };
        let mut rx = spawn_poller(Arc::new(gw.clone()), cfg, sd_rx);

        let rep = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(rep.order_id, order_id);
        assert_eq!(rep.qty, 100);
        assert_eq!(gw.pending_poll_failures(), 0);
        assert!(POLL_ERRORS.with_label_values(&["error"]).get() >= errors_before + 3);

        sd_tx.send(true).unwrap();
        assert!(rx.recv().await.is_none());
    }
}
