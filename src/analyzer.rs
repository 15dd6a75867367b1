// ===============================
// src/analyzer.rs
// ===============================
//
// Per-symbol market analytics fed by the tick stream:
// - short / long simple moving averages of the last N prices
// - VWAP (taken from the feed when it sends one, otherwise accumulated here)
// - volume-weighted price sigma: sqrt(sum(p^2 * v) / V - vwap^2)
//
// Volume arrives as a cumulative session total, so the weight of a tick is
// the delta to the previous total. The first tick of a symbol only seeds the
// volume baseline.
//
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;

use crate::domain::{MarketState, Tick};

pub trait Analyzer: Send + Sync {
    fn update_tick(&self, tick: &Tick);
    /// Snapshot for `symbol`; a zeroed state (with the symbol set) when unseen.
    fn state(&self, symbol: &str) -> MarketState;
}

#[derive(Debug, Default)]
struct SymbolStats {
    last_price: f64,
    short_win: VecDeque<f64>,
    short_sum: f64,
    long_win: VecDeque<f64>,
    long_sum: f64,

    last_cum_volume: Option<f64>,
    sum_v: f64,
    sum_pv: f64,
    sum_p2v: f64,
    feed_vwap: Option<f64>,
}

fn push_window(win: &mut VecDeque<f64>, sum: &mut f64, cap: usize, v: f64) {
    if cap == 0 {
        return;
    }
    if win.len() == cap {
        if let Some(x) = win.pop_front() {
            *sum -= x;
        }
    }
    win.push_back(v);
    *sum += v;
}

fn sma(sum: f64, len: usize) -> f64 {
    if len > 0 { sum / len as f64 } else { 0.0 }
}

impl SymbolStats {
    fn vwap(&self) -> f64 {
        if let Some(v) = self.feed_vwap.filter(|v| *v > 0.0) {
            return v;
        }
        if self.sum_v > 0.0 { self.sum_pv / self.sum_v } else { 0.0 }
    }

    fn sigma(&self) -> f64 {
        if self.sum_v <= 0.0 {
            return 0.0;
        }
        let vwap = self.vwap();
        let var = self.sum_p2v / self.sum_v - vwap * vwap;
        // rounding can push a flat series slightly negative
        if var > 0.0 { var.sqrt() } else { 0.0 }
    }
}

pub struct DefaultAnalyzer {
    short_window: usize,
    long_window: usize,
    stats: RwLock<HashMap<String, SymbolStats>>,
}

impl DefaultAnalyzer {
    pub fn new(short_window: usize, long_window: usize) -> Self {
        Self { short_window, long_window, stats: RwLock::new(HashMap::new()) }
    }
}

impl Default for DefaultAnalyzer {
    fn default() -> Self {
        Self::new(5, 25)
    }
}

impl Analyzer for DefaultAnalyzer {
    fn update_tick(&self, tick: &Tick) {
        let mut map = self.stats.write();
        let s = map.entry(tick.symbol.clone()).or_default();

        s.last_price = tick.price;
        push_window(&mut s.short_win, &mut s.short_sum, self.short_window, tick.price);
        push_window(&mut s.long_win, &mut s.long_sum, self.long_window, tick.price);

        if tick.vwap.is_some() {
            s.feed_vwap = tick.vwap;
        }

        if let Some(cum) = tick.trading_volume {
            if let Some(prev) = s.last_cum_volume {
                let dv = cum - prev;
                if dv > 0.0 {
                    s.sum_v += dv;
                    s.sum_pv += tick.price * dv;
                    s.sum_p2v += tick.price * tick.price * dv;
                }
            }
            s.last_cum_volume = Some(cum);
        }
    }

    fn state(&self, symbol: &str) -> MarketState {
        let map = self.stats.read();
        match map.get(symbol) {
            Some(s) => MarketState {
                symbol: symbol.to_string(),
                current_price: s.last_price,
                short_ma: sma(s.short_sum, s.short_win.len()),
                long_ma: sma(s.long_sum, s.long_win.len()),
                vwap: s.vwap(),
                sigma: s.sigma(),
            },
            None => MarketState { symbol: symbol.to_string(), ..Default::default() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(price: f64, vol: Option<f64>) -> Tick {
        Tick { ts_ns: 0, symbol: "9433".into(), price, vwap: None, trading_volume: vol }
    }

    #[test]
    fn unseen_symbol_is_zeroed() {
        let a = DefaultAnalyzer::default();
        let st = a.state("7203");
        assert_eq!(st.symbol, "7203");
        assert_eq!(st.current_price, 0.0);
        assert_eq!(st.sigma, 0.0);
    }

    #[test]
    fn moving_averages_roll() {
        let a = DefaultAnalyzer::new(2, 4);
        for p in [10.0, 20.0, 30.0, 40.0, 50.0] {
            a.update_tick(&tick(p, None));
        }
        let st = a.state("9433");
        assert_eq!(st.current_price, 50.0);
        assert!((st.short_ma - 45.0).abs() < 1e-9);
        assert!((st.long_ma - 35.0).abs() < 1e-9);
    }

    #[test]
    fn first_tick_only_seeds_volume() {
        let a = DefaultAnalyzer::default();
        a.update_tick(&tick(100.0, Some(1_000.0)));
        let st = a.state("9433");
        assert_eq!(st.vwap, 0.0);
        assert_eq!(st.sigma, 0.0);
    }

    #[test]
    fn sigma_from_volume_deltas() {
        let a = DefaultAnalyzer::default();
        a.update_tick(&tick(100.0, Some(1_000.0)));
        a.update_tick(&tick(90.0, Some(1_100.0)));
        a.update_tick(&tick(110.0, Some(1_200.0)));
        let st = a.state("9433");
        // equal weights at 90 and 110: vwap 100, sigma 10
        assert!((st.vwap - 100.0).abs() < 1e-9);
        assert!((st.sigma - 10.0).abs() < 1e-9);
    }

    #[test]
    fn feed_vwap_takes_precedence() {
        let a = DefaultAnalyzer::default();
        let mut t = tick(100.0, Some(10.0));
        t.vwap = Some(99.5);
        a.update_tick(&t);
        assert_eq!(a.state("9433").vwap, 99.5);
    }
}
