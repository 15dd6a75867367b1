// ===============================
// src/gateway.rs
// ===============================
//
// Venue boundary.
// - MarketGateway : async trait every venue implements (kabu or paper)
// - GatewayError  : everything a venue call can fail with
// - MockGateway   : in-memory paper venue. Fills only show up through
//                   `get_orders`, so the reconcile poller is always in the loop.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::domain::{
    now_ns, Exchange, ExecutionReport, OrderRequest, Position, ProductType, Side, Tick,
};
use crate::feed::{self, RandomWalk};
use crate::order::{Execution, Order};
use crate::reconcile::{self, PollerConfig};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("venue returned http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("cannot decode venue response: {0}")]
    Decode(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("venue call timed out after {0:?}")]
    Timeout(Duration),
    #[error("not supported by this venue: {0}")]
    Unsupported(&'static str),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            GatewayError::Decode(e.to_string())
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Decode(e.to_string())
    }
}

/// Bound a venue call. A call that runs past `limit` becomes `Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, GatewayError>
where
    F: std::future::Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(GatewayError::Timeout(limit)),
    }
}

/// Streams handed out by `MarketGateway::start`.
pub struct FeedStreams {
    pub ticks: mpsc::Receiver<Tick>,
    pub execs: mpsc::Receiver<ExecutionReport>,
}

#[async_trait]
pub trait MarketGateway: Send + Sync {
    /// Spawn the tick source and the execution poller. Both stop once
    /// `shutdown` flips to true.
    async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<FeedStreams, GatewayError>;

    /// Returns the venue's order id.
    async fn send_order(&self, req: &OrderRequest) -> Result<String, GatewayError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError>;

    async fn get_positions(&self, product: ProductType) -> Result<Vec<Position>, GatewayError>;

    /// Every order the venue knows for this account, with its fills.
    async fn get_orders(&self) -> Result<Vec<Order>, GatewayError>;

    async fn register_symbol(&self, _symbol: &str, _exchange: Exchange) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn unregister_all(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Paper venue
// -----------------------------------------------------------------------------

/// When an accepted order gets its fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillMode {
    Immediate,
    After(Duration),
    /// Orders stay working forever (lets tests see a venue that never fills).
    Never,
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub fill: FillMode,
    pub poll: PollerConfig,
    pub tick_capacity: usize,
    /// Symbols to drive with a random walk; empty means ticks only come
    /// from `push_tick`.
    pub random_walk: Vec<RandomWalk>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            fill: FillMode::After(Duration::from_millis(200)),
            poll: PollerConfig::default(),
            tick_capacity: 4096,
            random_walk: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Book {
    next_order: u64,
    next_exec: u64,
    orders: Vec<Order>,
    positions: HashMap<String, Position>,
    last_price: HashMap<String, f64>,
    sent: Vec<OrderRequest>,
    canceled: Vec<String>,
    reject_orders: bool,
    failing_polls: u32,
    registered: Vec<String>,
}

impl Book {
    fn fill(&mut self, order_id: &str) {
        let Some(idx) = self.orders.iter().position(|o| o.id == order_id) else { return };
        if self.orders[idx].is_completed() {
            return;
        }
        self.next_exec += 1;
        let exec_id = format!("MOCK-E{:06}", self.next_exec);

        let (symbol, side, qty, limit) = {
            let o = &self.orders[idx];
            (o.symbol.clone(), o.side, o.unfilled_qty(), o.order_price)
        };
        let price = self
            .last_price
            .get(&symbol)
            .copied()
            .filter(|p| *p > 0.0)
            .unwrap_or(limit);

        self.orders[idx].add_execution(Execution { id: exec_id.clone(), price, qty });
        debug!(order_id, %exec_id, %symbol, qty, price, "paper fill");

        match side {
            Side::Buy => {
                let pos = self.positions.entry(symbol.clone()).or_insert_with(|| Position {
                    symbol: symbol.clone(),
                    leaves_qty: 0,
                    price: 0.0,
                    exchange: Exchange::default(),
                    trade_type: Default::default(),
                    account_type: Default::default(),
                });
                let cost = pos.price * pos.leaves_qty as f64 + price * qty as f64;
                pos.leaves_qty += qty;
                pos.price = cost / pos.leaves_qty as f64;
            }
            Side::Sell => {
                if let Some(pos) = self.positions.get_mut(&symbol) {
                    pos.leaves_qty = pos.leaves_qty.saturating_sub(qty);
                    if pos.leaves_qty == 0 {
                        self.positions.remove(&symbol);
                    }
                }
            }
        }
    }
}

/// Cheap to clone; clones share the same book.
#[derive(Clone)]
pub struct MockGateway {
    cfg: MockConfig,
    book: Arc<Mutex<Book>>,
    tick_tx: Arc<Mutex<Option<mpsc::Sender<Tick>>>>,
}

impl MockGateway {
    pub fn new(cfg: MockConfig) -> Self {
        Self {
            cfg,
            book: Arc::new(Mutex::new(Book::default())),
            tick_tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Put a position on the book as if it had been left over from a
    /// previous session.
    pub fn seed_position(&self, pos: Position) {
        self.book.lock().positions.insert(pos.symbol.clone(), pos);
    }

    pub fn set_reject_orders(&self, reject: bool) {
        self.book.lock().reject_orders = reject;
    }

    /// The next `n` calls to `get_orders` fail with a transport error.
    pub fn fail_polls(&self, n: u32) {
        self.book.lock().failing_polls = n;
    }

    pub fn pending_poll_failures(&self) -> u32 {
        self.book.lock().failing_polls
    }

    /// Fill every working order now, whatever the fill mode.
    pub fn fill_all(&self) {
        let mut b = self.book.lock();
        let ids: Vec<String> = b.orders.iter().filter(|o| !o.is_completed()).map(|o| o.id.clone()).collect();
        for id in ids {
            b.fill(&id);
        }
    }

    pub fn sent_orders(&self) -> Vec<OrderRequest> {
        self.book.lock().sent.clone()
    }

    pub fn canceled_orders(&self) -> Vec<String> {
        self.book.lock().canceled.clone()
    }

    pub fn registered_symbols(&self) -> Vec<String> {
        self.book.lock().registered.clone()
    }

    /// Inject a tick into the running feed. False before `start` or once the
    /// consumer is gone.
    pub async fn push_tick(&self, tick: Tick) -> bool {
        self.book.lock().last_price.insert(tick.symbol.clone(), tick.price);
        let tx = self.tick_tx.lock().clone();
        match tx {
            Some(tx) => tx.send(tick).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl MarketGateway for MockGateway {
    async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<FeedStreams, GatewayError> {
        let (tx, rx) = mpsc::channel::<Tick>(self.cfg.tick_capacity);
        *self.tick_tx.lock() = Some(tx.clone());

        for walk in self.cfg.random_walk.iter().cloned() {
            let me = self.clone();
            let sd = shutdown.clone();
            let (walk_tx, mut walk_rx) = mpsc::channel::<Tick>(64);
            tokio::spawn(feed::run_mock(walk, walk_tx, sd));
            // route through push_tick so paper fills see the walk's prices
            tokio::spawn(async move {
                while let Some(t) = walk_rx.recv().await {
                    if !me.push_tick(t).await {
                        break;
                    }
                }
            });
        }

        let gw: Arc<dyn MarketGateway> = Arc::new(self.clone());
        let execs = reconcile::spawn_poller(gw, self.cfg.poll.clone(), shutdown);
        info!(fill = ?self.cfg.fill, walks = self.cfg.random_walk.len(), "paper venue started");
        Ok(FeedStreams { ticks: rx, execs })
    }

    async fn send_order(&self, req: &OrderRequest) -> Result<String, GatewayError> {
        let id = {
            let mut b = self.book.lock();
            b.sent.push(req.clone());
            if b.reject_orders {
                return Err(GatewayError::Rejected(format!("paper venue refuses {} {}", req.side, req.symbol)));
            }
            b.next_order += 1;
            let id = format!("MOCK-O{:06}", b.next_order);
            b.orders.push(Order::new(id.clone(), req.symbol.clone(), req.side, req.price, req.qty));
            if self.cfg.fill == FillMode::Immediate {
                b.fill(&id);
            }
            id
        };

        if let FillMode::After(delay) = self.cfg.fill {
            let book = self.book.clone();
            let oid = id.clone();
            tokio::spawn(async move {
                sleep(delay).await;
                book.lock().fill(&oid);
            });
        }
        debug!(order_id = %id, symbol = %req.symbol, side = %req.side, qty = req.qty, ts_ns = now_ns() as i64, "paper order accepted");
        Ok(id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        let mut b = self.book.lock();
        let Some(o) = b.orders.iter_mut().find(|o| o.id == order_id) else {
            return Err(GatewayError::Rejected(format!("unknown order {order_id}")));
        };
        if o.is_completed() {
            return Err(GatewayError::Rejected(format!("order {order_id} already completed")));
        }
        o.cancel();
        b.canceled.push(order_id.to_string());
        Ok(())
    }

    async fn get_positions(&self, _product: ProductType) -> Result<Vec<Position>, GatewayError> {
        let b = self.book.lock();
        let mut v: Vec<Position> = b.positions.values().filter(|p| p.leaves_qty > 0).cloned().collect();
        v.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(v)
    }

    async fn get_orders(&self) -> Result<Vec<Order>, GatewayError> {
        let mut b = self.book.lock();
        if b.failing_polls > 0 {
            b.failing_polls -= 1;
            return Err(GatewayError::Transport("paper venue: order poll refused".into()));
        }
        Ok(b.orders.clone())
    }

    async fn register_symbol(&self, symbol: &str, _exchange: Exchange) -> Result<(), GatewayError> {
        self.book.lock().registered.push(symbol.to_string());
        Ok(())
    }

    async fn unregister_all(&self) -> Result<(), GatewayError> {
        self.book.lock().registered.clear();
        Ok(())
    }
}
