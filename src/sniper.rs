// ===============================
// src/sniper.rs
// ===============================
//
// One Sniper per watched symbol. It owns the strategy, the lots it believes
// it holds and the orders it has placed that are still working. All state
// sits behind one lock per Sniper so different symbols never contend.
//
// The Sniper does no I/O: `tick` only returns the request to send, and the
// caller reports the venue's answer back through `record_order`.
//
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::domain::{
    AccountType, Action, ClosePositionOrder, Exchange, ExecutionReport, MarginTradeType,
    MarketState, OrderRequest, Position, SecurityType, Side, Signal,
};
use crate::order::{Execution, Order};
use crate::strategy::{Brain, StrategyInput};

/// Fixed order attributes stamped on every request a Sniper builds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OrderProfile {
    pub exchange: Exchange,
    pub security_type: SecurityType,
    pub margin_trade_type: MarginTradeType,
    pub account_type: AccountType,
    pub close_position_order: ClosePositionOrder,
}

/// What `on_execution` did with a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Applied,
    Duplicate,
    UnknownOrder,
}

struct Inner {
    brain: Brain,
    lots: VecDeque<Position>,
    orders: HashMap<String, Order>,
    is_exiting: bool,
}

pub struct Sniper {
    symbol: String,
    strategy_name: String,
    profile: OrderProfile,
    inner: Mutex<Inner>,
}

impl Sniper {
    pub fn new(symbol: impl Into<String>, strategy_name: impl Into<String>, brain: Brain, profile: OrderProfile) -> Self {
        Self {
            symbol: symbol.into(),
            strategy_name: strategy_name.into(),
            profile,
            inner: Mutex::new(Inner {
                brain,
                lots: VecDeque::new(),
                orders: HashMap::new(),
                is_exiting: false,
            }),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn strategy_name(&self) -> &str {
        &self.strategy_name
    }

    pub fn profile(&self) -> OrderProfile {
        self.profile
    }

    /// Evaluate the strategy against `state`. `None` when exiting or HOLD.
    pub fn tick(&self, state: &MarketState) -> Option<OrderRequest> {
        let mut g = self.inner.lock();
        if g.is_exiting {
            return None;
        }

        let hold_qty: u64 = g.lots.iter().map(|l| l.leaves_qty).sum();
        let total_exposure: f64 = g.lots.iter().map(|l| l.price * l.leaves_qty as f64).sum();
        let average_price = if hold_qty > 0 { total_exposure / hold_qty as f64 } else { 0.0 };
        let pending_sell: u64 = g
            .orders
            .values()
            .filter(|o| o.side == Side::Sell)
            .map(|o| o.unfilled_qty())
            .sum();

        let input = StrategyInput {
            current_price: state.current_price,
            free_qty: hold_qty.saturating_sub(pending_sell),
            average_price,
            total_exposure,
            short_ma: state.short_ma,
            long_ma: state.long_ma,
            vwap: state.vwap,
            sigma: state.sigma,
        };

        let sig = g.brain.evaluate(&input);
        let side = sig.action.side()?;
        debug!(symbol = %self.symbol, action = sig.action.as_str(), qty = sig.quantity, price = state.current_price, "signal");

        Some(OrderRequest {
            symbol: self.symbol.clone(),
            exchange: self.profile.exchange,
            security_type: self.profile.security_type,
            side,
            margin_trade_type: self.profile.margin_trade_type,
            account_type: self.profile.account_type,
            order_type: sig.order_type,
            close_position_order: self.profile.close_position_order,
            qty: sig.quantity,
            price: sig.price,
        })
    }

    /// The venue refused `req` or the call timed out. The strategy forgets the
    /// decision behind it so the next tick may make it again.
    pub fn order_failed(&self, req: &OrderRequest) {
        let mut g = self.inner.lock();
        if g.is_exiting {
            return;
        }
        let action = match req.side {
            Side::Buy => Action::Buy,
            Side::Sell => Action::Sell,
        };
        let sig = Signal { action, quantity: req.qty, price: req.price, order_type: req.order_type };
        g.brain.rejected(&sig);
        debug!(symbol = %self.symbol, side = %req.side, qty = req.qty, "strategy rolled back after failed submission");
    }

    /// Register an order the venue accepted.
    pub fn record_order(&self, order: Order) {
        let mut g = self.inner.lock();
        info!(symbol = %self.symbol, order_id = %order.id, side = %order.side, qty = order.order_qty, "order recorded");
        g.orders.insert(order.id.clone(), order);
    }

    pub fn on_execution(&self, rep: &ExecutionReport) -> ExecOutcome {
        let mut g = self.inner.lock();

        let Some(order) = g.orders.get_mut(&rep.order_id) else {
            warn!(symbol = %self.symbol, order_id = %rep.order_id, execution_id = %rep.execution_id, "execution for unknown order, dropped");
            return ExecOutcome::UnknownOrder;
        };

        let fresh = order.add_execution(Execution {
            id: rep.execution_id.clone(),
            price: rep.price,
            qty: rep.qty,
        });
        if !fresh {
            debug!(symbol = %self.symbol, execution_id = %rep.execution_id, "duplicate execution ignored");
            return ExecOutcome::Duplicate;
        }

        if order.side != rep.side {
            warn!(symbol = %self.symbol, order_id = %rep.order_id, order_side = %order.side, report_side = %rep.side, "execution side differs from order side, following the report");
        }
        let side = rep.side;
        if order.is_completed() {
            g.orders.remove(&rep.order_id);
        }

        match side {
            Side::Buy => g.lots.push_back(Position {
                symbol: self.symbol.clone(),
                leaves_qty: rep.qty,
                price: rep.price,
                exchange: self.profile.exchange,
                trade_type: self.profile.margin_trade_type,
                account_type: self.profile.account_type,
            }),
            Side::Sell => reduce_lots(&mut g.lots, rep.qty),
        }

        info!(symbol = %self.symbol, order_id = %rep.order_id, execution_id = %rep.execution_id, side = %side, qty = rep.qty, price = rep.price, "execution applied");
        ExecOutcome::Applied
    }

    /// Stop trading for good. Returns true on the first call only.
    pub fn force_exit(&self) -> bool {
        let mut g = self.inner.lock();
        if g.is_exiting {
            return false;
        }
        g.is_exiting = true;
        match g.brain.activate() {
            Some(sig) if sig.action == Action::Sell => {
                info!(symbol = %self.symbol, qty = sig.quantity, "kill switch armed, liquidation left to the position sweep");
            }
            Some(_) => info!(symbol = %self.symbol, "kill switch armed"),
            None => info!(symbol = %self.symbol, "strategy has no kill switch, sniper latched"),
        }
        true
    }

    pub fn is_exiting(&self) -> bool {
        self.inner.lock().is_exiting
    }

    /// Orders still working at the venue, oldest id first.
    pub fn open_orders(&self) -> Vec<Order> {
        let g = self.inner.lock();
        let mut v: Vec<Order> = g.orders.values().filter(|o| !o.is_completed()).cloned().collect();
        v.sort_by(|a, b| a.id.cmp(&b.id));
        v
    }

    /// The venue confirmed the cancel: the order leaves the active set.
    pub fn mark_canceled(&self, order_id: &str) {
        let mut g = self.inner.lock();
        if let Some(mut o) = g.orders.remove(order_id) {
            o.cancel();
            debug!(symbol = %self.symbol, order_id, filled = o.filled_qty(), "order canceled");
        }
    }

    pub fn hold_qty(&self) -> u64 {
        self.inner.lock().lots.iter().map(|l| l.leaves_qty).sum()
    }

    pub fn lots(&self) -> Vec<Position> {
        self.inner.lock().lots.iter().cloned().collect()
    }
}

/// Consume `qty` from the oldest lots first. Overselling empties the book.
fn reduce_lots(lots: &mut VecDeque<Position>, mut qty: u64) {
    while qty > 0 {
        let Some(front) = lots.front_mut() else { break };
        if front.leaves_qty > qty {
            front.leaves_qty -= qty;
            return;
        }
        qty -= front.leaves_qty;
        lots.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{KillSwitch, LimitBuy, Sample, Strategy, StrategyRegistry, StrategyParams};

    fn state(price: f64) -> MarketState {
        MarketState { symbol: "9433".into(), current_price: price, ..Default::default() }
    }

    fn rep(order: &str, exec: &str, side: Side, price: f64, qty: u64) -> ExecutionReport {
        ExecutionReport {
            order_id: order.into(),
            execution_id: exec.into(),
            symbol: "9433".into(),
            side,
            price,
            qty,
        }
    }

    fn idle() -> Sniper {
        Sniper::new("9433", "sample", Brain::Plain(Box::new(Sample)), OrderProfile::default())
    }

    fn round_trip() -> Sniper {
        let params = StrategyParams { entry_price: 3990.0, ..Default::default() };
        let brain = StrategyRegistry::with_builtins().build("round_trip", &params).unwrap();
        Sniper::new("9433", "round_trip", brain, OrderProfile::default())
    }

    #[test]
    fn lots_are_consumed_fifo() {
        let s = idle();
        s.record_order(Order::new("B1", "9433", Side::Buy, 0.0, 100));
        s.record_order(Order::new("B2", "9433", Side::Buy, 0.0, 100));
        s.record_order(Order::new("S1", "9433", Side::Sell, 0.0, 150));
        s.on_execution(&rep("B1", "E1", Side::Buy, 100.0, 100));
        s.on_execution(&rep("B2", "E2", Side::Buy, 110.0, 100));
        s.on_execution(&rep("S1", "E3", Side::Sell, 120.0, 150));

        let lots = s.lots();
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].leaves_qty, 50);
        assert_eq!(lots[0].price, 110.0);
    }

    #[test]
    fn oversell_clamps_to_flat() {
        let s = idle();
        s.record_order(Order::new("B1", "9433", Side::Buy, 0.0, 100));
        s.record_order(Order::new("S1", "9433", Side::Sell, 0.0, 300));
        s.on_execution(&rep("B1", "E1", Side::Buy, 100.0, 100));
        s.on_execution(&rep("S1", "E2", Side::Sell, 100.0, 300));
        assert_eq!(s.hold_qty(), 0);
        assert!(s.lots().is_empty());
    }

    #[test]
    fn duplicate_execution_changes_nothing() {
        let s = idle();
        s.record_order(Order::new("B1", "9433", Side::Buy, 0.0, 200));
        let r = rep("B1", "E1", Side::Buy, 100.0, 100);
        assert_eq!(s.on_execution(&r), ExecOutcome::Applied);
        assert_eq!(s.on_execution(&r), ExecOutcome::Duplicate);
        assert_eq!(s.hold_qty(), 100);
        assert_eq!(s.open_orders()[0].filled_qty(), 100);
    }

    #[test]
    fn unknown_order_is_dropped() {
        let s = idle();
        assert_eq!(s.on_execution(&rep("X", "E1", Side::Buy, 100.0, 100)), ExecOutcome::UnknownOrder);
        assert_eq!(s.hold_qty(), 0);
    }

    #[test]
    fn completed_order_leaves_active_set() {
        let s = idle();
        s.record_order(Order::new("B1", "9433", Side::Buy, 0.0, 100));
        s.on_execution(&rep("B1", "E1", Side::Buy, 100.0, 40));
        assert_eq!(s.open_orders().len(), 1);
        s.on_execution(&rep("B1", "E2", Side::Buy, 100.0, 60));
        assert!(s.open_orders().is_empty());
        assert_eq!(s.hold_qty(), 100);
    }

    #[test]
    fn position_change_follows_report_side() {
        let s = idle();
        s.record_order(Order::new("O1", "9433", Side::Sell, 0.0, 100));
        assert_eq!(s.on_execution(&rep("O1", "E1", Side::Buy, 100.0, 100)), ExecOutcome::Applied);
        assert_eq!(s.hold_qty(), 100);
    }

    #[test]
    fn failed_entry_is_retried_on_next_tick() {
        let s = round_trip();
        let req = s.tick(&state(3990.0)).unwrap();
        assert_eq!(req.side, Side::Buy);
        s.order_failed(&req);

        // no close order for a position that never opened
        assert!(s.tick(&state(4000.0)).is_none());
        let again = s.tick(&state(3990.0)).unwrap();
        assert_eq!(again.side, Side::Buy);
        assert_eq!(again.qty, 100);
    }

    #[test]
    fn tick_builds_request_from_profile() {
        let s = round_trip();
        assert!(s.tick(&state(4000.0)).is_none());
        let req = s.tick(&state(3990.0)).unwrap();
        assert_eq!(req.side, Side::Buy);
        assert_eq!(req.qty, 100);
        assert_eq!(req.symbol, "9433");
        assert_eq!(req.exchange, Exchange::Sor);
        assert_eq!(req.margin_trade_type, MarginTradeType::GeneralDay);
    }

    #[test]
    fn free_qty_excludes_open_sells() {
        struct Probe(std::sync::Arc<parking_lot::Mutex<u64>>);
        impl Strategy for Probe {
            fn evaluate(&mut self, input: &StrategyInput) -> crate::domain::Signal {
                *self.0.lock() = input.free_qty;
                crate::domain::Signal::hold()
            }
        }
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(u64::MAX));
        let s = Sniper::new("9433", "probe", Brain::Plain(Box::new(Probe(seen.clone()))), OrderProfile::default());
        s.record_order(Order::new("B1", "9433", Side::Buy, 0.0, 100));
        s.on_execution(&rep("B1", "E1", Side::Buy, 100.0, 100));
        s.record_order(Order::new("S1", "9433", Side::Sell, 0.0, 60));
        s.tick(&state(100.0));
        assert_eq!(*seen.lock(), 40);

        s.record_order(Order::new("S2", "9433", Side::Sell, 0.0, 100));
        s.tick(&state(100.0));
        assert_eq!(*seen.lock(), 0);
    }

    #[test]
    fn force_exit_latches_and_silences() {
        let s = round_trip();
        assert!(s.force_exit());
        assert!(!s.force_exit());
        assert!(s.is_exiting());
        for p in [3000.0, 3990.0, 5000.0] {
            assert!(s.tick(&state(p)).is_none());
        }
    }

    #[test]
    fn force_exit_without_kill_switch_still_latches() {
        let brain = Brain::Plain(Box::new(LimitBuy::new(3990.0, 100)));
        let s = Sniper::new("9433", "limit", brain, OrderProfile::default());
        s.force_exit();
        assert!(s.tick(&state(3000.0)).is_none());

        let k = Brain::Killable(KillSwitch::new(Box::new(LimitBuy::new(3990.0, 100)), 100));
        let s = Sniper::new("9433", "limit", k, OrderProfile::default());
        assert!(s.tick(&state(3000.0)).is_some());
        s.force_exit();
        assert!(s.tick(&state(3000.0)).is_none());
    }

    #[test]
    fn fills_still_apply_while_exiting() {
        let s = idle();
        s.record_order(Order::new("B1", "9433", Side::Buy, 0.0, 100));
        s.force_exit();
        assert_eq!(s.on_execution(&rep("B1", "E1", Side::Buy, 100.0, 100)), ExecOutcome::Applied);
        assert_eq!(s.hold_qty(), 100);
    }

    #[test]
    fn mark_canceled_removes_open_order() {
        let s = idle();
        s.record_order(Order::new("B1", "9433", Side::Buy, 0.0, 100));
        s.record_order(Order::new("B2", "9433", Side::Buy, 0.0, 100));
        s.mark_canceled("B1");
        let open = s.open_orders();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "B2");
    }
}
