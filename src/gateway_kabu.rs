// ===============================
// src/gateway_kabu.rs
// ===============================
//
// kabu station venue: REST for orders/positions, PUSH WebSocket for ticks,
// and `GET /orders` polling for fills (the venue has no fill stream).
//
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::domain::{
    AccountType, Exchange, MarginTradeType, OrderRequest, OrderType, Position, ProductType,
    SecurityType, Side,
};
use crate::feed;
use crate::gateway::{FeedStreams, GatewayError, MarketGateway};
use crate::kabu::{
    self, KabuClient, KabuOrder, KabuPosition, RegisterItem, RegisterRequest, SendOrderRequest,
};
use crate::order::{Execution, Order};
use crate::reconcile::{self, PollerConfig};

#[derive(Clone)]
pub struct KabuGateway {
    client: Arc<KabuClient>,
    ws_url: String,
    poll: PollerConfig,
    tick_capacity: usize,
}

impl KabuGateway {
    pub fn new(client: KabuClient, ws_url: impl Into<String>, poll: PollerConfig, tick_capacity: usize) -> Self {
        Self { client: Arc::new(client), ws_url: ws_url.into(), poll, tick_capacity }
    }

    /// Acquire the API token. Must succeed before any other call.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        self.client.refresh_token().await
    }
}

// ---- domain -> venue ----

pub fn exchange_code(e: Exchange) -> i32 {
    match e {
        Exchange::Tosho => kabu::EXCHANGE_TOSHO_PLUS,
        Exchange::Sor => kabu::EXCHANGE_SOR,
    }
}

fn security_code(s: SecurityType) -> i32 {
    match s {
        SecurityType::Stock => 1,
    }
}

fn margin_trade_code(t: MarginTradeType) -> i32 {
    match t {
        MarginTradeType::System => 1,
        MarginTradeType::General => 2,
        MarginTradeType::GeneralDay => 3,
    }
}

fn account_code(a: AccountType) -> i32 {
    match a {
        AccountType::General => 2,
        AccountType::Special => 4,
        AccountType::Corporate => 12,
    }
}

fn product_code(p: ProductType) -> u8 {
    match p {
        ProductType::All => 0,
        ProductType::Cash => 1,
        ProductType::Margin => 2,
        ProductType::Future => 3,
        ProductType::Option => 4,
    }
}

/// Buys open a new margin position, sells close one.
pub fn to_send_order(req: &OrderRequest) -> SendOrderRequest {
    let (side, cash_margin, deliv_type) = match req.side {
        Side::Buy => (kabu::SIDE_BUY, kabu::CASH_MARGIN_NEW, kabu::DELIV_NONE),
        Side::Sell => (kabu::SIDE_SELL, kabu::CASH_MARGIN_CLOSE, kabu::DELIV_DEPOSIT),
    };
    let (front_order_type, price) = match req.order_type {
        OrderType::Market => (kabu::FRONT_ORDER_MARKET, 0.0),
        OrderType::Limit => (kabu::FRONT_ORDER_LIMIT, req.price),
    };
    SendOrderRequest {
        symbol: req.symbol.clone(),
        exchange: exchange_code(req.exchange),
        security_type: security_code(req.security_type),
        side: side.to_string(),
        cash_margin,
        margin_trade_type: margin_trade_code(req.margin_trade_type),
        account_type: account_code(req.account_type),
        qty: req.qty,
        price,
        expire_day: 0,
        front_order_type,
        deliv_type,
        close_position_order: req.close_position_order as i32,
    }
}

// ---- venue -> domain ----

fn exchange_from(code: i32) -> Exchange {
    match code {
        kabu::EXCHANGE_TOSHO | kabu::EXCHANGE_TOSHO_PLUS => Exchange::Tosho,
        _ => Exchange::Sor,
    }
}

fn margin_trade_from(code: i32) -> MarginTradeType {
    match code {
        1 => MarginTradeType::System,
        2 => MarginTradeType::General,
        _ => MarginTradeType::GeneralDay,
    }
}

fn account_from(code: i32) -> AccountType {
    match code {
        2 => AccountType::General,
        12 => AccountType::Corporate,
        _ => AccountType::Special,
    }
}

fn side_from(code: &str) -> Side {
    if code == kabu::SIDE_BUY { Side::Buy } else { Side::Sell }
}

pub fn to_order(o: &KabuOrder) -> Order {
    let mut order = Order::new(
        o.id.clone(),
        o.symbol.clone(),
        side_from(&o.side),
        o.price,
        o.order_qty.max(0.0) as u64,
    );
    for d in &o.details {
        // status rows without an execution id carry no fill
        let Some(id) = d.execution_id.as_deref().filter(|s| !s.is_empty()) else { continue };
        order.add_execution(Execution { id: id.to_string(), price: d.price, qty: d.qty.max(0.0) as u64 });
    }
    order
}

pub fn to_position(p: &KabuPosition) -> Position {
    Position {
        symbol: p.symbol.clone(),
        leaves_qty: p.leaves_qty.max(0.0) as u64,
        price: p.price,
        exchange: exchange_from(p.exchange),
        trade_type: margin_trade_from(p.margin_trade_type),
        account_type: account_from(p.account_type),
    }
}

#[async_trait]
impl MarketGateway for KabuGateway {
    async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<FeedStreams, GatewayError> {
        let (tx, rx) = mpsc::channel(self.tick_capacity);
        tokio::spawn(feed::run_kabu(self.ws_url.clone(), tx, shutdown.clone()));

        let gw: Arc<dyn MarketGateway> = Arc::new(self.clone());
        let execs = reconcile::spawn_poller(gw, self.poll.clone(), shutdown);
        info!(api = %self.client.base_url(), ws = %self.ws_url, "kabu gateway started");
        Ok(FeedStreams { ticks: rx, execs })
    }

    async fn send_order(&self, req: &OrderRequest) -> Result<String, GatewayError> {
        let wire = to_send_order(req);
        let id = self.client.send_order(&wire).await?;
        info!(order_id = %id, symbol = %req.symbol, side = %req.side, qty = req.qty, "kabu order accepted");
        Ok(id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        self.client.cancel_order(order_id).await
    }

    async fn get_positions(&self, product: ProductType) -> Result<Vec<Position>, GatewayError> {
        if product != ProductType::Margin {
            return Err(GatewayError::Unsupported("only margin positions are traded"));
        }
        let raw = self.client.get_positions(product_code(product)).await?;
        Ok(raw
            .iter()
            // short positions are never opened by this engine
            .filter(|p| p.side.is_empty() || p.side == kabu::SIDE_BUY)
            .map(to_position)
            .filter(|p| p.leaves_qty > 0)
            .collect())
    }

    async fn get_orders(&self) -> Result<Vec<Order>, GatewayError> {
        let raw = self.client.get_orders().await?;
        Ok(raw.iter().map(to_order).collect())
    }

    async fn register_symbol(&self, symbol: &str, exchange: Exchange) -> Result<(), GatewayError> {
        // the push registry only knows primary listings
        let code = match exchange {
            Exchange::Tosho | Exchange::Sor => kabu::EXCHANGE_TOSHO,
        };
        let req = RegisterRequest { symbols: vec![RegisterItem { symbol: symbol.to_string(), exchange: code }] };
        self.client.register(&req).await?;
        info!(%symbol, "push registered");
        Ok(())
    }

    async fn unregister_all(&self) -> Result<(), GatewayError> {
        if let Err(e) = self.client.unregister_all().await {
            warn!(%e, "push unregister failed");
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ClosePositionOrder;
    use crate::kabu::KabuExecution;

    fn req(side: Side, order_type: OrderType) -> OrderRequest {
        OrderRequest {
            symbol: "9433".into(),
            exchange: Exchange::Sor,
            security_type: SecurityType::Stock,
            side,
            margin_trade_type: MarginTradeType::GeneralDay,
            account_type: AccountType::Special,
            order_type,
            close_position_order: ClosePositionOrder::DateAscProfitDesc,
            qty: 100,
            price: 3990.0,
        }
    }

    #[test]
    fn buy_opens_margin_position() {
        let w = to_send_order(&req(Side::Buy, OrderType::Market));
        assert_eq!(w.side, "2");
        assert_eq!(w.cash_margin, 2);
        assert_eq!(w.deliv_type, 0);
        assert_eq!(w.front_order_type, 10);
        assert_eq!(w.price, 0.0);
        assert_eq!(w.exchange, 9);
        assert_eq!(w.account_type, 4);
        assert_eq!(w.margin_trade_type, 3);
    }

    #[test]
    fn sell_closes_with_deposit_delivery() {
        let w = to_send_order(&req(Side::Sell, OrderType::Limit));
        assert_eq!(w.side, "1");
        assert_eq!(w.cash_margin, 3);
        assert_eq!(w.deliv_type, 2);
        assert_eq!(w.front_order_type, 20);
        assert_eq!(w.price, 3990.0);
    }

    #[test]
    fn orders_skip_blank_execution_rows() {
        let o = KabuOrder {
            id: "O1".into(),
            state: 5,
            symbol: "9433".into(),
            side: "2".into(),
            order_qty: 100.0,
            cum_qty: 100.0,
            price: 0.0,
            details: vec![
                KabuExecution { execution_id: Some(String::new()), price: 0.0, qty: 0.0 },
                KabuExecution { execution_id: None, price: 0.0, qty: 0.0 },
                KabuExecution { execution_id: Some("E1".into()), price: 3990.0, qty: 100.0 },
            ],
        };
        let d = to_order(&o);
        assert_eq!(d.side, Side::Buy);
        assert_eq!(d.executions.len(), 1);
        assert!(d.is_completed());
    }

    #[test]
    fn position_codes_map_back() {
        let p = KabuPosition {
            execution_id: Some("E1".into()),
            exchange: 27,
            account_type: 12,
            margin_trade_type: 1,
            side: "2".into(),
            symbol: "9433".into(),
            symbol_name: "KDDI".into(),
            leaves_qty: 300.0,
            hold_qty: 0.0,
            price: 3990.0,
        };
        let d = to_position(&p);
        assert_eq!(d.exchange, Exchange::Tosho);
        assert_eq!(d.account_type, AccountType::Corporate);
        assert_eq!(d.trade_type, MarginTradeType::System);
        assert_eq!(d.leaves_qty, 300);
    }
}
