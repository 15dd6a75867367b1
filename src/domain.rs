// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side. Strategies speak in `Action` (which also has Hold);
/// anything that reaches the venue is a `Side`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side { Buy, Sell }

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self { Side::Buy => write!(f, "BUY"), Side::Sell => write!(f, "SELL") }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action { Buy, Sell, Hold }

impl Action {
    pub fn side(self) -> Option<Side> {
        match self { Action::Buy => Some(Side::Buy), Action::Sell => Some(Side::Sell), Action::Hold => None }
    }
    pub fn as_str(self) -> &'static str {
        match self { Action::Buy => "buy", Action::Sell => "sell", Action::Hold => "hold" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrderType { #[default] Market, Limit }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Exchange { Tosho, #[default] Sor }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecurityType { #[default] Stock }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarginTradeType { System, General, #[default] GeneralDay }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccountType { General, #[default] Special, Corporate }

/// Which lots a closing order consumes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClosePositionOrder { #[default] DateAscProfitDesc, DateAscProfitAsc }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductType { All, Cash, Margin, Future, Option }

/// Market data tick as delivered by the feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub ts_ns: i128,
    pub symbol: String,
    pub price: f64,
    pub vwap: Option<f64>,
    /// Cumulative session volume, when the feed provides it.
    pub trading_volume: Option<f64>,
}

/// Per-symbol analytics snapshot, recomputed on every tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    pub symbol: String,
    pub current_price: f64,
    pub short_ma: f64,
    pub long_ma: f64,
    pub vwap: f64,
    pub sigma: f64,
}

/// Trade intent produced by a strategy. Consumed once by the owning Sniper.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub action: Action,
    pub quantity: u64,
    pub price: f64,
    pub order_type: OrderType,
}

impl Signal {
    pub fn hold() -> Self {
        Self { action: Action::Hold, quantity: 0, price: 0.0, order_type: OrderType::Market }
    }
    pub fn buy(quantity: u64) -> Self {
        Self { action: Action::Buy, quantity, price: 0.0, order_type: OrderType::Market }
    }
    pub fn sell(quantity: u64) -> Self {
        Self { action: Action::Sell, quantity, price: 0.0, order_type: OrderType::Market }
    }
    pub fn is_hold(&self) -> bool {
        self.action == Action::Hold
    }
}

/// Immutable order ticket handed to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub exchange: Exchange,
    pub security_type: SecurityType,
    pub side: Side,
    pub margin_trade_type: MarginTradeType,
    pub account_type: AccountType,
    pub order_type: OrderType,
    pub close_position_order: ClosePositionOrder,
    pub qty: u64,
    /// 0 for market orders
    pub price: f64,
}

impl OrderRequest {
    /// Market sell closing the whole residual of a broker position.
    pub fn liquidate(pos: &Position) -> Self {
        Self {
            symbol: pos.symbol.clone(),
            exchange: pos.exchange,
            security_type: SecurityType::Stock,
            side: Side::Sell,
            margin_trade_type: pos.trade_type,
            account_type: pos.account_type,
            order_type: OrderType::Market,
            close_position_order: ClosePositionOrder::default(),
            qty: pos.leaves_qty,
            price: 0.0,
        }
    }
}

/// One venue-confirmed fill routed back to the owning Sniper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub order_id: String,
    pub execution_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub qty: u64,
}

/// A position (or, inside a Sniper, one lot of it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub leaves_qty: u64,
    /// average cost
    pub price: f64,
    pub exchange: Exchange,
    pub trade_type: MarginTradeType,
    pub account_type: AccountType,
}

/// Recorder envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Tick(Tick),
    Req(OrderRequest),
    Accepted { order_id: String, symbol: String },
    Exec(ExecutionReport),
    Note(String),
}

pub fn now_ns() -> i128 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128
}
