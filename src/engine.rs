// ===============================
// src/engine.rs
// ===============================
//
// Wiring between the venue and the snipers.
//
//   gateway ticks ──┐                      ┌─> worker(9433) ─> Sniper ─> send_order
//                   ├─> main loop ─ route ─┤
//   poller execs ───┘                      └─> worker(7203) ─> ...
//
// Each watched symbol has one worker fed by one queue, so ticks and fills for
// a symbol are handled in arrival order while a slow venue call only stalls
// its own symbol. At most `queue_capacity` ticks wait per symbol and later
// ones are dropped. Fills are never dropped and never make the main loop
// wait.
//
// The main loop stops on the shutdown signal, at the kill time, or when both
// venue streams end. Then: stop feeds, latch snipers, drain workers, sweep.
//
use ahash::AHashMap as HashMap;
use chrono::{Local, NaiveTime};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::analyzer::Analyzer;
use crate::config::{Settings, WatchTarget};
use crate::domain::{Event, ExecutionReport, Tick};
use crate::gateway::{with_timeout, GatewayError, MarketGateway};
use crate::lifecycle::{LifecycleError, PositionCleaner};
use crate::metrics::{
    CONFIG_STRATEGY_ACTIVE, CONFIG_SYMBOL, EXEC_REPORTS, HELD_QTY, LAT_SUBMIT, ORDERS_FAILED,
    ORDERS_SUBMITTED, SIGNALS_BY, TICKS_BY_SYMBOL, TICKS_DROPPED, TICKS_UNROUTED,
};
use crate::order::Order;
use crate::recorder::Recorder;
use crate::sniper::{ExecOutcome, OrderProfile, Sniper};
use crate::strategy::{StrategyError, StrategyRegistry};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub queue_capacity: usize,
    pub gateway_timeout: Duration,
    /// Local wall-clock time at which trading stops for the day.
    pub kill_time: Option<NaiveTime>,
    pub kill_check_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            gateway_timeout: Duration::from_secs(5),
            kill_time: None,
            kill_check_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            queue_capacity: s.symbol_queue_capacity,
            gateway_timeout: s.gateway_timeout,
            kill_time: s.kill_time,
            ..Default::default()
        }
    }
}

/// Why the main loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Signal,
    KillTime,
    FeedsClosed,
}

pub fn kill_time_reached(now: NaiveTime, kill: Option<NaiveTime>) -> bool {
    matches!(kill, Some(k) if now >= k)
}

/// One sniper per watch target, strategies resolved through the registry.
pub fn build_snipers(
    targets: &[WatchTarget],
    settings: &Settings,
    registry: &StrategyRegistry,
) -> Result<Vec<Arc<Sniper>>, StrategyError> {
    let mut out = Vec::with_capacity(targets.len());
    for t in targets {
        let brain = registry.build(&t.strategy, &settings.strategy_params(t))?;
        CONFIG_SYMBOL.with_label_values(&[&t.symbol]).set(1);
        CONFIG_STRATEGY_ACTIVE.with_label_values(&[&t.strategy]).inc();
        info!(symbol = %t.symbol, strategy = %t.strategy, entry = ?t.entry_price, qty = ?t.qty, "sniper armed");
        out.push(Arc::new(Sniper::new(t.symbol.clone(), t.strategy.clone(), brain, OrderProfile::default())));
    }
    Ok(out)
}

enum SymbolEvent {
    Tick(Tick),
    Exec(ExecutionReport),
}

/// Sending side of one symbol's queue.
struct SymbolQueue {
    tx: mpsc::UnboundedSender<SymbolEvent>,
    queued_ticks: Arc<AtomicUsize>,
    capacity: usize,
}

impl SymbolQueue {
    fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<SymbolEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let q = Self { tx, queued_ticks: Arc::new(AtomicUsize::new(0)), capacity: capacity.max(1) };
        (q, rx)
    }

    /// False when the tick was dropped.
    fn push_tick(&self, tick: Tick) -> bool {
        if self.queued_ticks.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.queued_ticks.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        if self.tx.send(SymbolEvent::Tick(tick)).is_err() {
            self.queued_ticks.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// False only once the worker is gone.
    fn push_exec(&self, rep: ExecutionReport) -> bool {
        self.tx.send(SymbolEvent::Exec(rep)).is_ok()
    }
}

struct Worker {
    sniper: Arc<Sniper>,
    analyzer: Arc<dyn Analyzer>,
    gw: Arc<dyn MarketGateway>,
    recorder: Recorder,
    timeout: Duration,
    queued_ticks: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<SymbolEvent>) {
        while let Some(ev) = rx.recv().await {
            match ev {
                SymbolEvent::Tick(t) => {
                    self.queued_ticks.fetch_sub(1, Ordering::AcqRel);
                    self.on_tick(t).await
                }
                SymbolEvent::Exec(rep) => self.on_exec(rep),
            }
        }
        info!(symbol = %self.sniper.symbol(), "worker drained");
    }

    async fn on_tick(&self, tick: Tick) {
        self.analyzer.update_tick(&tick);
        let state = self.analyzer.state(&tick.symbol);
        let Some(req) = self.sniper.tick(&state) else { return };

        let symbol = self.sniper.symbol();
        let side = req.side.to_string();
        SIGNALS_BY.with_label_values(&[symbol, side.as_str()]).inc();
        self.recorder.record(Event::Req(req.clone()));

        let started = Instant::now();
        match with_timeout(self.timeout, self.gw.send_order(&req)).await {
            Ok(order_id) => {
                LAT_SUBMIT.observe(started.elapsed().as_secs_f64() * 1_000.0);
                ORDERS_SUBMITTED.with_label_values(&[symbol, side.as_str()]).inc();
                self.sniper.record_order(Order::new(order_id.clone(), req.symbol.clone(), req.side, req.price, req.qty));
                self.recorder.record(Event::Accepted { order_id, symbol: req.symbol.clone() });
            }
            Err(e) => {
                let reason = match e {
                    GatewayError::Timeout(_) => "timeout",
                    GatewayError::Rejected(_) => "rejected",
                    _ => "error",
                };
                ORDERS_FAILED.with_label_values(&[symbol, reason]).inc();
                warn!(%symbol, side = %req.side, qty = req.qty, %e, "order not placed");
                self.sniper.order_failed(&req);
            }
        }
    }

    fn on_exec(&self, rep: ExecutionReport) {
        let outcome = self.sniper.on_execution(&rep);
        let label = match outcome {
            ExecOutcome::Applied => "applied",
            ExecOutcome::Duplicate => "duplicate",
            ExecOutcome::UnknownOrder => "unknown_order",
        };
        EXEC_REPORTS.with_label_values(&[label]).inc();
        if outcome == ExecOutcome::Applied {
            HELD_QTY.with_label_values(&[self.sniper.symbol()]).set(self.sniper.hold_qty() as i64);
            self.recorder.record(Event::Exec(rep));
        }
    }
}

pub struct Engine {
    gw: Arc<dyn MarketGateway>,
    analyzer: Arc<dyn Analyzer>,
    snipers: Vec<Arc<Sniper>>,
    cleaner: PositionCleaner,
    recorder: Recorder,
    cfg: EngineConfig,
}

impl Engine {
    pub fn new(
        gw: Arc<dyn MarketGateway>,
        analyzer: Arc<dyn Analyzer>,
        snipers: Vec<Arc<Sniper>>,
        cleaner: PositionCleaner,
        recorder: Recorder,
        cfg: EngineConfig,
    ) -> Self {
        Self { gw, analyzer, snipers, cleaner, recorder, cfg }
    }

    pub fn snipers(&self) -> &[Arc<Sniper>] {
        &self.snipers
    }

    /// Flatten the account and subscribe every watched symbol. Must succeed
    /// before `run`.
    pub async fn startup(&self) -> Result<(), LifecycleError> {
        self.cleaner.startup_sweep().await?;
        for s in &self.snipers {
            with_timeout(self.cfg.gateway_timeout, self.gw.register_symbol(s.symbol(), s.profile().exchange)).await?;
        }
        Ok(())
    }

    /// Trade until stopped, then run the shutdown sweep. The sweep result is
    /// the return value.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<StopReason, LifecycleError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut streams = self.gw.start(stop_rx).await?;

        let mut routes: HashMap<String, SymbolQueue> = HashMap::new();
        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(self.snipers.len());
        for s in &self.snipers {
            let (queue, rx) = SymbolQueue::new(self.cfg.queue_capacity);
            let queued_ticks = queue.queued_ticks.clone();
            routes.insert(s.symbol().to_string(), queue);
            let w = Worker {
                sniper: s.clone(),
                analyzer: self.analyzer.clone(),
                gw: self.gw.clone(),
                recorder: self.recorder.clone(),
                timeout: self.cfg.gateway_timeout,
                queued_ticks,
            };
            workers.push(tokio::spawn(w.run(rx)));
        }
        info!(symbols = routes.len(), kill_time = ?self.cfg.kill_time, "engine running");

        let mut kill_check = interval(self.cfg.kill_check_interval);
        kill_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let (mut ticks_open, mut execs_open) = (true, true);

        let reason = loop {
            if *shutdown.borrow() {
                break StopReason::Signal;
            }
            if !ticks_open && !execs_open {
                break StopReason::FeedsClosed;
            }
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() { break StopReason::Signal; }
                }
                _ = kill_check.tick() => {
                    if kill_time_reached(Local::now().time(), self.cfg.kill_time) {
                        break StopReason::KillTime;
                    }
                }
                maybe = streams.ticks.recv(), if ticks_open => match maybe {
                    Some(t) => self.route_tick(&routes, t),
                    None => {
                        warn!("tick stream ended");
                        ticks_open = false;
                    }
                },
                maybe = streams.execs.recv(), if execs_open => match maybe {
                    Some(rep) => Self::route_exec(&routes, rep),
                    None => {
                        warn!("execution stream ended");
                        execs_open = false;
                    }
                },
            }
        };
        info!(?reason, "engine stopping");

        // feeds and poller first, then no sniper may trade again
        let _ = stop_tx.send(true);
        drop(streams);
        for s in &self.snipers {
            s.force_exit();
        }
        // closing the queues lets every worker finish its in-flight call
        drop(routes);
        for h in workers {
            if let Err(e) = h.await {
                error!(?e, "worker panicked");
            }
        }

        let swept = self.cleaner.shutdown_sweep(&self.snipers).await;
        if let Err(e) = with_timeout(self.cfg.gateway_timeout, self.gw.unregister_all()).await {
            warn!(%e, "push unregister failed");
        }
        for s in &self.snipers {
            HELD_QTY.with_label_values(&[s.symbol()]).set(s.hold_qty() as i64);
        }
        match swept {
            Ok(()) => {
                self.recorder.record(Event::Note(format!("shutdown complete ({reason:?})")));
                Ok(reason)
            }
            Err(e) => {
                error!(%e, "shutdown sweep failed, positions may remain open");
                self.recorder.record(Event::Note(format!("shutdown failed: {e}")));
                Err(e)
            }
        }
    }

    fn route_tick(&self, routes: &HashMap<String, SymbolQueue>, tick: Tick) {
        let Some(queue) = routes.get(&tick.symbol) else {
            TICKS_UNROUTED.inc();
            return;
        };
        TICKS_BY_SYMBOL.with_label_values(&[&tick.symbol]).inc();
        let symbol = tick.symbol.clone();
        self.recorder.record(Event::Tick(tick.clone()));
        if !queue.push_tick(tick) {
            TICKS_DROPPED.with_label_values(&[&symbol]).inc();
        }
    }

    fn route_exec(routes: &HashMap<String, SymbolQueue>, rep: ExecutionReport) {
        match routes.get(&rep.symbol) {
            Some(queue) => {
                if !queue.push_exec(rep) {
                    warn!("worker gone, execution dropped");
                }
            }
            None => {
                EXEC_REPORTS.with_label_values(&["unknown_symbol"]).inc();
                warn!(symbol = %rep.symbol, order_id = %rep.order_id, "execution for unwatched symbol");
            }
        }
    }
}
