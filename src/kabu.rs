// ===============================
// src/kabu.rs
// ===============================
//
// kabu station REST client and wire models. Field names follow the venue's
// PascalCase JSON. Mapping to domain types lives in gateway_kabu.rs.
//
use parking_lot::RwLock;
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::{now_ns, Tick};
use crate::gateway::GatewayError;

// ---- venue codes ----
pub const SIDE_SELL: &str = "1";
pub const SIDE_BUY: &str = "2";

pub const CASH_MARGIN_NEW: i32 = 2;
pub const CASH_MARGIN_CLOSE: i32 = 3;

pub const FRONT_ORDER_MARKET: i32 = 10;
pub const FRONT_ORDER_LIMIT: i32 = 20;

pub const DELIV_NONE: i32 = 0;
pub const DELIV_DEPOSIT: i32 = 2;

pub const EXCHANGE_TOSHO: i32 = 1;
pub const EXCHANGE_SOR: i32 = 9;
pub const EXCHANGE_TOSHO_PLUS: i32 = 27;

#[derive(Debug, Serialize)]
pub struct TokenRequest<'a> {
    #[serde(rename = "APIPassword")]
    pub api_password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(rename = "ResultCode", default)]
    pub result_code: i32,
    #[serde(rename = "Token", default)]
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendOrderRequest {
    pub symbol: String,
    pub exchange: i32,
    pub security_type: i32,
    pub side: String,
    pub cash_margin: i32,
    pub margin_trade_type: i32,
    pub account_type: i32,
    pub qty: u64,
    pub price: f64,
    pub expire_day: i32,
    pub front_order_type: i32,
    pub deliv_type: i32,
    pub close_position_order: i32,
}

#[derive(Debug, Deserialize)]
pub struct ResultResponse {
    #[serde(rename = "Result", default)]
    pub result: i32,
    #[serde(rename = "OrderId", default)]
    pub order_id: String,
}

#[derive(Debug, Serialize)]
pub struct CancelRequest<'a> {
    #[serde(rename = "OrderId")]
    pub order_id: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KabuExecution {
    #[serde(rename = "ExecutionID", default)]
    pub execution_id: Option<String>,
    #[serde(rename = "Price", default)]
    pub price: f64,
    #[serde(rename = "Qty", default)]
    pub qty: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KabuOrder {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "State", default)]
    pub state: i32,
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "Side")]
    pub side: String,
    #[serde(rename = "OrderQty", default)]
    pub order_qty: f64,
    #[serde(rename = "CumQty", default)]
    pub cum_qty: f64,
    #[serde(rename = "Price", default)]
    pub price: f64,
    #[serde(rename = "Details", default)]
    pub details: Vec<KabuExecution>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KabuPosition {
    #[serde(rename = "ExecutionID", default)]
    pub execution_id: Option<String>,
    #[serde(rename = "Exchange", default)]
    pub exchange: i32,
    #[serde(rename = "AccountType", default)]
    pub account_type: i32,
    #[serde(rename = "MarginTradeType", default)]
    pub margin_trade_type: i32,
    #[serde(rename = "Side", default)]
    pub side: String,
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "SymbolName", default)]
    pub symbol_name: String,
    #[serde(rename = "LeavesQty", default)]
    pub leaves_qty: f64,
    #[serde(rename = "HoldQty", default)]
    pub hold_qty: f64,
    #[serde(rename = "Price", default)]
    pub price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterItem {
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "Exchange")]
    pub exchange: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    #[serde(rename = "Symbols")]
    pub symbols: Vec<RegisterItem>,
}

/// One PUSH frame. The venue sends far more fields; only these are read.
#[derive(Debug, Clone, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "SymbolName", default)]
    pub symbol_name: String,
    #[serde(rename = "CurrentPrice", default)]
    pub current_price: Option<f64>,
    #[serde(rename = "CurrentPriceTime", alias = "Time", default)]
    pub time: Option<String>,
    #[serde(rename = "VWAP", default)]
    pub vwap: Option<f64>,
    #[serde(rename = "TradingVolume", default)]
    pub trading_volume: Option<f64>,
}

impl PushMessage {
    /// `None` for pre-open frames that carry no price yet.
    pub fn into_tick(self) -> Option<Tick> {
        let price = self.current_price.filter(|p| *p > 0.0)?;
        let ts_ns = self
            .time
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .and_then(|t| t.timestamp_nanos_opt())
            .map(|n| n as i128)
            .unwrap_or_else(now_ns);
        Some(Tick {
            ts_ns,
            symbol: self.symbol,
            price,
            vwap: self.vwap.filter(|v| *v > 0.0),
            trading_volume: self.trading_volume,
        })
    }
}

// -----------------------------------------------------------------------------
// REST client
// -----------------------------------------------------------------------------

pub struct KabuClient {
    http: reqwest::Client,
    base_url: String,
    password: String,
    token: RwLock<Option<String>>,
}

impl KabuClient {
    pub fn new(base_url: impl Into<String>, password: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            password: password.into(),
            token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST /token. The token is kept and sent as X-API-KEY from then on.
    pub async fn refresh_token(&self) -> Result<(), GatewayError> {
        let url = format!("{}/token", self.base_url);
        let rsp = self
            .http
            .post(url)
            .json(&TokenRequest { api_password: &self.password })
            .send()
            .await?;
        let body: TokenResponse = decode(rsp).await?;
        if body.result_code != 0 || body.token.is_empty() {
            return Err(GatewayError::Rejected(format!("token refused (ResultCode {})", body.result_code)));
        }
        *self.token.write() = Some(body.token);
        info!("kabu token acquired");
        Ok(())
    }

    async fn call<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<T, GatewayError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut req = self.http.request(method.clone(), &url);
        let token = self.token.read().clone();
        if let Some(token) = token {
            req = req.header("X-API-KEY", token);
        }
        if let Some(b) = body {
            req = req.json(b);
        }
        debug!(%method, %url, "kabu call");
        let rsp = req.send().await?;
        decode(rsp).await
    }

    pub async fn send_order(&self, req: &SendOrderRequest) -> Result<String, GatewayError> {
        let rsp: ResultResponse = self.call(Method::POST, "/sendorder", Some(req)).await?;
        if rsp.result != 0 {
            return Err(GatewayError::Rejected(format!("sendorder Result {}", rsp.result)));
        }
        Ok(rsp.order_id)
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        let rsp: ResultResponse =
            self.call(Method::PUT, "/cancelorder", Some(&CancelRequest { order_id })).await?;
        if rsp.result != 0 {
            return Err(GatewayError::Rejected(format!("cancelorder {order_id} Result {}", rsp.result)));
        }
        Ok(())
    }

    pub async fn get_orders(&self) -> Result<Vec<KabuOrder>, GatewayError> {
        self.call::<(), _>(Method::GET, "/orders", None).await
    }

    /// `product` is the venue code: 0 all, 1 cash, 2 margin, 3 future, 4 option.
    pub async fn get_positions(&self, product: u8) -> Result<Vec<KabuPosition>, GatewayError> {
        self.call::<(), _>(Method::GET, &format!("/positions?product={product}"), None).await
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<(), GatewayError> {
        let _: serde_json::Value = self.call(Method::PUT, "/register", Some(req)).await?;
        Ok(())
    }

    pub async fn unregister_all(&self) -> Result<(), GatewayError> {
        let _: serde_json::Value = self.call::<(), _>(Method::PUT, "/unregister/all", None).await?;
        Ok(())
    }
}

async fn decode<T: DeserializeOwned>(rsp: reqwest::Response) -> Result<T, GatewayError> {
    let status = rsp.status();
    let body = rsp.text().await?;
    if !status.is_success() {
        return Err(GatewayError::Status { status: status.as_u16(), body });
    }
    Ok(serde_json::from_str(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_request_uses_venue_field_names() {
        let req = SendOrderRequest {
            symbol: "9433".into(),
            exchange: EXCHANGE_SOR,
            security_type: 1,
            side: SIDE_BUY.into(),
            cash_margin: CASH_MARGIN_NEW,
            margin_trade_type: 3,
            account_type: 4,
            qty: 100,
            price: 0.0,
            expire_day: 0,
            front_order_type: FRONT_ORDER_MARKET,
            deliv_type: DELIV_NONE,
            close_position_order: 0,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["Symbol"], "9433");
        assert_eq!(v["Side"], "2");
        assert_eq!(v["CashMargin"], 2);
        assert_eq!(v["FrontOrderType"], 10);
        assert_eq!(v["MarginTradeType"], 3);
        assert_eq!(v["ClosePositionOrder"], 0);
    }

    #[test]
    fn orders_decode_with_details() {
        let raw = r#"[{"ID":"20240101A01","State":5,"Symbol":"9433","Side":"2",
            "OrderQty":100,"CumQty":100,"Price":0,
            "Details":[{"ExecutionID":"","Price":0,"Qty":0},
                       {"ExecutionID":"E20240101001","Price":3990.5,"Qty":100}]}]"#;
        let orders: Vec<KabuOrder> = serde_json::from_str(raw).unwrap();
        assert_eq!(orders[0].details.len(), 2);
        assert_eq!(orders[0].details[1].execution_id.as_deref(), Some("E20240101001"));
    }

    #[test]
    fn push_frame_becomes_tick() {
        let raw = r#"{"Symbol":"9433","SymbolName":"KDDI","CurrentPrice":3991.0,
            "CurrentPriceTime":"2024-01-04T09:00:01+09:00","VWAP":3985.2,"TradingVolume":12000}"#;
        let msg: PushMessage = serde_json::from_str(raw).unwrap();
        let tick = msg.into_tick().unwrap();
        assert_eq!(tick.symbol, "9433");
        assert_eq!(tick.price, 3991.0);
        assert_eq!(tick.vwap, Some(3985.2));
        assert_eq!(tick.trading_volume, Some(12000.0));
    }

    #[test]
    fn pre_open_frame_is_skipped() {
        let msg: PushMessage = serde_json::from_str(r#"{"Symbol":"9433","CurrentPrice":null}"#).unwrap();
        assert!(msg.into_tick().is_none());
    }
}
