// ===============================
// src/strategy.rs
// ===============================
//
// Strategy layer. Everything here is synchronous and free of I/O: a strategy
// sees a `StrategyInput` and answers with a `Signal`. Any history it needs
// lives in its own fields.
//
// Leaf strategies:
// 1) LimitBuy     -> buy when price drops to a target
// 2) FixedRate    -> sell when price rises a fixed rate above entry
// 3) VwapRebound  -> buy below the VWAP sigma band, sell on the rebound to VWAP
//
// Decorators (own the wrapped strategy, forward `evaluate` and `rejected`):
// - RoundTrip        : strict entry -> exit -> entry alternation
// - BudgetConstraint : drops buys that would exceed a budget
// - KillSwitch       : one-way latch that silences the wrapped strategy
//
// A Sniper holds a `Brain`: either a plain strategy or one wrapped in a
// KillSwitch, so whether `activate()` exists is decided by the variant.
//

use ahash::AHashMap as HashMap;
use thiserror::Error;

use crate::domain::{Action, Signal};

/// Pre-computed market and account view handed to a strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StrategyInput {
    pub current_price: f64,
    /// Held quantity not yet committed to an open sell order.
    pub free_qty: u64,
    pub average_price: f64,
    pub total_exposure: f64,
    pub short_ma: f64,
    pub long_ma: f64,
    pub vwap: f64,
    pub sigma: f64,
}

pub trait Strategy: Send {
    fn evaluate(&mut self, input: &StrategyInput) -> Signal;

    /// The venue refused (or never acknowledged) the order built from `sig`,
    /// the last non-HOLD signal this strategy returned. Stateful strategies
    /// undo the transition that signal made.
    fn rejected(&mut self, _sig: &Signal) {}
}

// -----------------------------------------------------------------------------
// 1) LIMIT BUY
//    Fires on every tick at or below the target; pair it with RoundTrip to
//    stop repeats.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct LimitBuy {
    target_price: f64,
    qty: u64,
}
impl LimitBuy {
    pub fn new(target_price: f64, qty: u64) -> Self {
        Self { target_price, qty }
    }
}
impl Strategy for LimitBuy {
    fn evaluate(&mut self, input: &StrategyInput) -> Signal {
        if input.current_price <= self.target_price {
            return Signal::buy(self.qty);
        }
        Signal::hold()
    }
}

// -----------------------------------------------------------------------------
// 2) FIXED RATE (take profit)
//    target = entry * (1 + rate)
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct FixedRate {
    target_price: f64,
    qty: u64,
}
impl FixedRate {
    pub fn new(entry_price: f64, rate: f64, qty: u64) -> Self {
        Self { target_price: entry_price * (1.0 + rate), qty }
    }
    pub fn target_price(&self) -> f64 {
        self.target_price
    }
}
impl Strategy for FixedRate {
    fn evaluate(&mut self, input: &StrategyInput) -> Signal {
        if input.current_price >= self.target_price {
            return Signal::sell(self.qty);
        }
        Signal::hold()
    }
}

// -----------------------------------------------------------------------------
// 3) VWAP REBOUND
//    Buy once price is `band_k` sigmas under VWAP, then sell whatever is free
//    when price gets back to VWAP. Holds while vwap/sigma are not known yet.
//    `entered` keeps a second entry from firing while the first buy is still
//    waiting for its fill.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct VwapRebound {
    band_k: f64,
    qty: u64,
    entered: bool,
}
impl VwapRebound {
    pub fn new(band_k: f64, qty: u64) -> Self {
        Self { band_k, qty, entered: false }
    }
}
impl Strategy for VwapRebound {
    fn evaluate(&mut self, input: &StrategyInput) -> Signal {
        if input.vwap <= 0.0 || input.sigma <= 0.0 {
            return Signal::hold();
        }
        if !self.entered {
            if input.current_price <= input.vwap - self.band_k * input.sigma {
                self.entered = true;
                return Signal::buy(self.qty);
            }
        } else if input.free_qty > 0 && input.current_price >= input.vwap {
            self.entered = false;
            return Signal::sell(input.free_qty);
        }
        Signal::hold()
    }

    fn rejected(&mut self, sig: &Signal) {
        match sig.action {
            Action::Buy => self.entered = false,
            Action::Sell => self.entered = true,
            Action::Hold => {}
        }
    }
}

/// Never trades. Placeholder for symbols that should only be watched.
#[derive(Debug, Clone, Default)]
pub struct Sample;
impl Strategy for Sample {
    fn evaluate(&mut self, _input: &StrategyInput) -> Signal {
        Signal::hold()
    }
}

// -----------------------------------------------------------------------------
// DECORATORS
// -----------------------------------------------------------------------------

/// Entry strategy while flat, exit strategy while holding.
pub struct RoundTrip {
    entry: Box<dyn Strategy>,
    exit: Box<dyn Strategy>,
    has_position: bool,
}
impl RoundTrip {
    pub fn new(entry: Box<dyn Strategy>, exit: Box<dyn Strategy>) -> Self {
        Self { entry, exit, has_position: false }
    }
    pub fn has_position(&self) -> bool {
        self.has_position
    }
}
impl Strategy for RoundTrip {
    fn evaluate(&mut self, input: &StrategyInput) -> Signal {
        if !self.has_position {
            let sig = self.entry.evaluate(input);
            if sig.action == Action::Buy {
                self.has_position = true;
                return sig;
            }
            // entry side never sells
            return Signal::hold();
        }
        let sig = self.exit.evaluate(input);
        if sig.action == Action::Sell {
            self.has_position = false;
            return sig;
        }
        Signal::hold()
    }

    fn rejected(&mut self, sig: &Signal) {
        match sig.action {
            Action::Buy => {
                self.has_position = false;
                self.entry.rejected(sig);
            }
            Action::Sell => {
                self.has_position = true;
                self.exit.rejected(sig);
            }
            Action::Hold => {}
        }
    }
}

/// Suppresses buys whose estimated cost would push exposure over `max_budget`.
pub struct BudgetConstraint {
    base: Box<dyn Strategy>,
    max_budget: f64,
}
impl BudgetConstraint {
    pub fn new(base: Box<dyn Strategy>, max_budget: f64) -> Self {
        Self { base, max_budget }
    }
}
impl Strategy for BudgetConstraint {
    fn evaluate(&mut self, input: &StrategyInput) -> Signal {
        let sig = self.base.evaluate(input);
        if sig.action != Action::Buy {
            return sig;
        }
        let estimated_cost = input.current_price * sig.quantity as f64;
        if input.total_exposure + estimated_cost > self.max_budget {
            return Signal::hold();
        }
        sig
    }

    fn rejected(&mut self, sig: &Signal) {
        self.base.rejected(sig);
    }
}

/// NORMAL --activate()--> TRIGGERED. No way back.
pub struct KillSwitch {
    main: Box<dyn Strategy>,
    qty: u64,
    triggered: bool,
    has_position: bool,
}
impl KillSwitch {
    pub fn new(main: Box<dyn Strategy>, qty: u64) -> Self {
        Self { main, qty, triggered: false, has_position: false }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    /// Latches the switch. Returns the liquidation signal the first time a
    /// position was believed open, HOLD otherwise.
    pub fn activate(&mut self) -> Signal {
        self.triggered = true;
        if self.has_position {
            self.has_position = false;
            return Signal::sell(self.qty);
        }
        Signal::hold()
    }
}
impl Strategy for KillSwitch {
    fn evaluate(&mut self, input: &StrategyInput) -> Signal {
        if self.triggered {
            return Signal::hold();
        }
        let sig = self.main.evaluate(input);
        match sig.action {
            Action::Buy => self.has_position = true,
            Action::Sell => self.has_position = false,
            Action::Hold => {}
        }
        sig
    }

    fn rejected(&mut self, sig: &Signal) {
        if self.triggered {
            return;
        }
        match sig.action {
            Action::Buy => self.has_position = false,
            Action::Sell => self.has_position = true,
            Action::Hold => return,
        }
        self.main.rejected(sig);
    }
}

/// What a Sniper actually drives.
pub enum Brain {
    Plain(Box<dyn Strategy>),
    Killable(KillSwitch),
}

impl Brain {
    pub fn evaluate(&mut self, input: &StrategyInput) -> Signal {
        match self {
            Brain::Plain(s) => s.evaluate(input),
            Brain::Killable(k) => k.evaluate(input),
        }
    }

    pub fn rejected(&mut self, sig: &Signal) {
        match self {
            Brain::Plain(s) => s.rejected(sig),
            Brain::Killable(k) => k.rejected(sig),
        }
    }

    /// `None` when this brain has no kill switch.
    pub fn activate(&mut self) -> Option<Signal> {
        match self {
            Brain::Plain(_) => None,
            Brain::Killable(k) => Some(k.activate()),
        }
    }
}

// -----------------------------------------------------------------------------
// REGISTRY (wiring time only)
// -----------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum StrategyError {
    #[error("strategy not found: {0}")]
    NotFound(String),
}

/// Per-target knobs a factory may use.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyParams {
    pub entry_price: f64,
    pub qty: u64,
    pub take_profit_rate: f64,
    pub max_budget: Option<f64>,
    pub band_k: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self { entry_price: 0.0, qty: 100, take_profit_rate: 0.002, max_budget: None, band_k: 2.0 }
    }
}

pub type Factory = fn(&StrategyParams) -> Brain;

pub struct StrategyRegistry {
    factories: HashMap<String, Factory>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self { factories: HashMap::new() }
    }

    pub fn with_builtins() -> Self {
        let mut r = Self::empty();
        r.register("round_trip", build_round_trip);
        r.register("vwap_rebound", build_vwap_rebound);
        r.register("sample", |_| Brain::Plain(Box::new(Sample)));
        r
    }

    pub fn register(&mut self, name: &str, factory: Factory) {
        self.factories.insert(name.to_ascii_lowercase(), factory);
    }

    pub fn build(&self, name: &str, params: &StrategyParams) -> Result<Brain, StrategyError> {
        self.factories
            .get(&name.trim().to_ascii_lowercase())
            .map(|f| f(params))
            .ok_or_else(|| StrategyError::NotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.factories.keys().cloned().collect();
        v.sort();
        v
    }
}

fn with_budget(inner: Box<dyn Strategy>, max_budget: Option<f64>) -> Box<dyn Strategy> {
    match max_budget {
        Some(b) => Box::new(BudgetConstraint::new(inner, b)),
        None => inner,
    }
}

// KillSwitch(RoundTrip(Budget?(LimitBuy), FixedRate))
// The budget filters the entry leg only, so a suppressed buy never flips
// RoundTrip into its exit state.
fn build_round_trip(p: &StrategyParams) -> Brain {
    let entry = with_budget(Box::new(LimitBuy::new(p.entry_price, p.qty)), p.max_budget);
    let exit = Box::new(FixedRate::new(p.entry_price, p.take_profit_rate, p.qty));
    Brain::Killable(KillSwitch::new(Box::new(RoundTrip::new(entry, exit)), p.qty))
}

fn build_vwap_rebound(p: &StrategyParams) -> Brain {
    Brain::Killable(KillSwitch::new(Box::new(VwapRebound::new(p.band_k, p.qty)), p.qty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn at(price: f64) -> StrategyInput {
        StrategyInput { current_price: price, ..Default::default() }
    }

    /// Scripted strategy: replays a fixed list of actions, then holds.
    struct Script(Vec<Action>);
    impl Strategy for Script {
        fn evaluate(&mut self, _input: &StrategyInput) -> Signal {
            if self.0.is_empty() {
                return Signal::hold();
            }
            match self.0.remove(0) {
                Action::Buy => Signal::buy(100),
                Action::Sell => Signal::sell(100),
                Action::Hold => Signal::hold(),
            }
        }
    }

    #[test]
    fn limit_buy_fires_at_or_below_target() {
        let mut s = LimitBuy::new(3990.0, 100);
        assert!(s.evaluate(&at(3991.0)).is_hold());
        assert_eq!(s.evaluate(&at(3990.0)), Signal::buy(100));
        // stateless: fires again
        assert_eq!(s.evaluate(&at(3980.0)), Signal::buy(100));
    }

    #[test]
    fn fixed_rate_sells_at_target() {
        let mut s = FixedRate::new(3990.0, 0.002, 100);
        assert!((s.target_price() - 3997.98).abs() < 1e-6);
        assert!(s.evaluate(&at(3997.0)).is_hold());
        assert_eq!(s.evaluate(&at(3998.0)), Signal::sell(100));
    }

    #[test]
    fn round_trip_alternates_entry_and_exit() {
        let mut rt = RoundTrip::new(
            Box::new(LimitBuy::new(3990.0, 100)),
            Box::new(FixedRate::new(3990.0, 0.002, 100)),
        );
        assert_eq!(rt.evaluate(&at(3990.0)).action, Action::Buy);
        // still cheap but holding: exit strategy decides
        assert!(rt.evaluate(&at(3985.0)).is_hold());
        assert_eq!(rt.evaluate(&at(3998.0)).action, Action::Sell);
        assert!(!rt.has_position());
        assert!(rt.evaluate(&at(3998.0)).is_hold());
        assert_eq!(rt.evaluate(&at(3990.0)).action, Action::Buy);
    }

    #[test]
    fn round_trip_never_repeats_a_side_under_random_triggers() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let entry: Vec<Action> =
                (0..200).map(|_| if rng.gen_bool(0.5) { Action::Buy } else { Action::Sell }).collect();
            let exit: Vec<Action> =
                (0..200).map(|_| if rng.gen_bool(0.5) { Action::Sell } else { Action::Buy }).collect();
            let mut rt = RoundTrip::new(Box::new(Script(entry)), Box::new(Script(exit)));

            let mut last: Option<Action> = None;
            for _ in 0..200 {
                let a = rt.evaluate(&at(1.0)).action;
                if a == Action::Hold {
                    continue;
                }
                assert_ne!(Some(a), last, "two consecutive {a:?}");
                if last.is_none() {
                    assert_eq!(a, Action::Buy, "first trade must be an entry");
                }
                last = Some(a);
            }
        }
    }

    #[test]
    fn budget_passes_within_limit() {
        let mut b = BudgetConstraint::new(Box::new(LimitBuy::new(3990.0, 100)), 1_000_000.0);
        let input = StrategyInput { current_price: 3990.0, total_exposure: 0.0, ..Default::default() };
        assert_eq!(b.evaluate(&input), Signal::buy(100));
    }

    #[test]
    fn budget_drops_buy_over_limit() {
        let mut b = BudgetConstraint::new(Box::new(LimitBuy::new(3990.0, 100)), 1_000_000.0);
        let input = StrategyInput { current_price: 3990.0, total_exposure: 900_000.0, ..Default::default() };
        assert!(b.evaluate(&input).is_hold());
    }

    #[test]
    fn budget_does_not_touch_sells() {
        let mut b = BudgetConstraint::new(Box::new(FixedRate::new(100.0, 0.0, 10)), 0.0);
        let input = StrategyInput { current_price: 100.0, total_exposure: 1e9, ..Default::default() };
        assert_eq!(b.evaluate(&input), Signal::sell(10));
    }

    #[test]
    fn suppressed_entry_keeps_round_trip_flat() {
        let params = StrategyParams { entry_price: 3990.0, max_budget: Some(1_000_000.0), ..Default::default() };
        let mut brain = StrategyRegistry::with_builtins().build("round_trip", &params).unwrap();
        let rich = StrategyInput { current_price: 3990.0, total_exposure: 900_000.0, ..Default::default() };
        assert!(brain.evaluate(&rich).is_hold());
        // a take-profit price must not trigger an exit that was never entered
        assert!(brain.evaluate(&at(3998.0)).is_hold());
        assert_eq!(brain.evaluate(&at(3990.0)), Signal::buy(100));
    }

    #[test]
    fn refused_entry_returns_round_trip_to_entry() {
        let params = StrategyParams { entry_price: 3990.0, ..Default::default() };
        let mut brain = StrategyRegistry::with_builtins().build("round_trip", &params).unwrap();
        let buy = brain.evaluate(&at(3990.0));
        assert_eq!(buy, Signal::buy(100));
        brain.rejected(&buy);

        // no exit for a position that never opened, and the entry fires again
        assert!(brain.evaluate(&at(4000.0)).is_hold());
        assert_eq!(brain.evaluate(&at(3990.0)), Signal::buy(100));
        // the kill switch no longer thinks it is flat
        assert_eq!(brain.activate(), Some(Signal::sell(100)));
    }

    #[test]
    fn refused_exit_keeps_round_trip_holding() {
        let mut rt = RoundTrip::new(
            Box::new(LimitBuy::new(3990.0, 100)),
            Box::new(FixedRate::new(3990.0, 0.002, 100)),
        );
        assert_eq!(rt.evaluate(&at(3990.0)).action, Action::Buy);
        let sell = rt.evaluate(&at(4000.0));
        assert_eq!(sell.action, Action::Sell);
        rt.rejected(&sell);
        assert!(rt.has_position());
        assert_eq!(rt.evaluate(&at(4000.0)), Signal::sell(100));
    }

    #[test]
    fn refused_kill_switch_entry_leaves_nothing_to_liquidate() {
        let mut k = KillSwitch::new(Box::new(LimitBuy::new(3990.0, 100)), 100);
        let buy = k.evaluate(&at(3990.0));
        k.rejected(&buy);
        assert!(k.activate().is_hold());
    }

    #[test]
    fn refused_vwap_entry_can_fire_again() {
        let mut v = VwapRebound::new(2.0, 100);
        let base = StrategyInput { vwap: 1000.0, sigma: 5.0, current_price: 990.0, ..Default::default() };
        let buy = v.evaluate(&base);
        assert_eq!(buy, Signal::buy(100));
        v.rejected(&buy);
        assert_eq!(v.evaluate(&base), Signal::buy(100));
    }

    #[test]
    fn kill_switch_liquidates_once_then_holds_forever() {
        let mut k = KillSwitch::new(Box::new(LimitBuy::new(3990.0, 100)), 100);
        assert_eq!(k.evaluate(&at(3990.0)).action, Action::Buy);
        assert_eq!(k.activate(), Signal::sell(100));
        assert!(k.is_triggered());
        assert!(k.activate().is_hold());

        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..500 {
            let input = StrategyInput {
                current_price: rng.gen_range(0.0..10_000.0),
                free_qty: rng.gen_range(0..1_000),
                vwap: rng.gen_range(0.0..10_000.0),
                sigma: rng.gen_range(0.0..100.0),
                ..Default::default()
            };
            assert!(k.evaluate(&input).is_hold());
        }
    }

    #[test]
    fn kill_switch_without_position_returns_hold() {
        let mut k = KillSwitch::new(Box::new(FixedRate::new(100.0, 0.0, 10)), 10);
        assert_eq!(k.evaluate(&at(100.0)).action, Action::Sell);
        assert!(k.activate().is_hold());
    }

    #[test]
    fn vwap_rebound_round_trip() {
        let mut v = VwapRebound::new(2.0, 100);
        let base = StrategyInput { vwap: 1000.0, sigma: 5.0, ..Default::default() };
        assert!(v.evaluate(&StrategyInput { current_price: 991.0, ..base }).is_hold());
        assert_eq!(v.evaluate(&StrategyInput { current_price: 990.0, ..base }), Signal::buy(100));
        // fill not seen yet: no second entry, no exit
        assert!(v.evaluate(&StrategyInput { current_price: 980.0, ..base }).is_hold());
        assert!(v.evaluate(&StrategyInput { current_price: 1001.0, free_qty: 0, ..base }).is_hold());
        assert_eq!(
            v.evaluate(&StrategyInput { current_price: 1001.0, free_qty: 100, ..base }),
            Signal::sell(100)
        );
    }

    #[test]
    fn vwap_rebound_waits_for_analytics() {
        let mut v = VwapRebound::new(2.0, 100);
        assert!(v.evaluate(&at(1.0)).is_hold());
    }

    #[test]
    fn brain_capability_follows_variant() {
        let mut plain = Brain::Plain(Box::new(Sample));
        assert!(plain.activate().is_none());

        let reg = StrategyRegistry::with_builtins();
        let params = StrategyParams { entry_price: 3990.0, ..Default::default() };
        let mut brain = reg.build("round_trip", &params).unwrap();
        assert_eq!(brain.evaluate(&at(3990.0)).action, Action::Buy);
        assert_eq!(brain.activate(), Some(Signal::sell(100)));
        assert!(brain.evaluate(&at(3000.0)).is_hold());
    }

    #[test]
    fn registry_rejects_unknown_names() {
        let reg = StrategyRegistry::with_builtins();
        assert_eq!(
            reg.build("martingale", &StrategyParams::default()).err(),
            Some(StrategyError::NotFound("martingale".into()))
        );
        assert_eq!(reg.names(), vec!["round_trip", "sample", "vwap_rebound"]);
        assert!(reg.build(" Round_Trip ", &StrategyParams::default()).is_ok());
    }
}
