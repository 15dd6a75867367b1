// ===============================
// src/feed.rs
// ===============================
//
// Market data adapters:
// - run_mock : random-walk generator for the paper venue
// - run_kabu : kabu station PUSH WebSocket (one socket carries every
//              registered symbol), reconnects with exponential backoff
//
// Both stop when the shutdown watch flips to true or the receiver is gone.
//

use futures_util::StreamExt; // for .next()
use rand::Rng;
use std::time::Duration;
use tokio::{
    sync::{mpsc, watch},
    time::{sleep, MissedTickBehavior},
};
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};
use url::Url;

use crate::domain::{now_ns, Tick};
use crate::kabu::PushMessage;
use crate::metrics::{TICKS, WS_CONNECTED, WS_LAST_EVENT_TS, WS_RECONNECTS};

/// One symbol driven by the random walk.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomWalk {
    pub symbol: String,
    pub start_price: f64,
    /// Largest move per tick, in price units.
    pub max_step: f64,
    pub interval: Duration,
}

impl RandomWalk {
    pub fn new(symbol: impl Into<String>, start_price: f64) -> Self {
        Self { symbol: symbol.into(), start_price, max_step: 1.0, interval: Duration::from_millis(200) }
    }
}

fn shutdown_requested(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

/// Random walk with a synthetic cumulative volume so the analyzer can
/// compute VWAP and sigma.
pub async fn run_mock(walk: RandomWalk, tx: mpsc::Sender<Tick>, mut shutdown: watch::Receiver<bool>) {
    let floor = (walk.start_price * 0.5).max(1.0);
    let mut px = walk.start_price;
    let mut cum_volume = 0.0_f64;

    let mut every = tokio::time::interval(walk.interval);
    every.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(symbol = %walk.symbol, start = walk.start_price, "mock feed started");
    loop {
        if shutdown_requested(&shutdown) {
            break;
        }
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || shutdown_requested(&shutdown) { break; }
            }
            _ = every.tick() => {
                // don't hold ThreadRng across .await
                let (step, vol) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(-walk.max_step..=walk.max_step).round(), rng.gen_range(100..=1_000) as f64)
                };
                px = (px + step).max(floor);
                cum_volume += vol;
                let tick = Tick {
                    ts_ns: now_ns(),
                    symbol: walk.symbol.clone(),
                    price: px,
                    vwap: None,
                    trading_volume: Some(cum_volume),
                };
                if tx.send(tick).await.is_err() {
                    break;
                }
                TICKS.inc();
            }
        }
    }
    info!(symbol = %walk.symbol, "mock feed stopped");
}

/// Exponential backoff with jitter: 0.5s, 1s, 2s ... capped at 32s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.min(6);
    let base_ms = 500u64.saturating_mul(1u64 << shift);
    let jitter = rand::thread_rng().gen_range(0..=250);
    Duration::from_millis(base_ms + jitter)
}

/// kabu PUSH adapter. Every text frame is one board snapshot for one
/// registered symbol.
pub async fn run_kabu(ws_url: String, tx: mpsc::Sender<Tick>, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;
    loop {
        if shutdown_requested(&shutdown) {
            break;
        }
        let url = match Url::parse(&ws_url) {
            Ok(u) => u,
            Err(e) => {
                error!(?e, %ws_url, "bad push url");
                return;
            }
        };

        info!(%ws_url, "connecting kabu push");
        match connect_async(url).await {
            Ok((mut ws, _resp)) => {
                info!("kabu push connected");
                WS_CONNECTED.set(1);
                attempt = 0;

                loop {
                    tokio::select! {
                        res = shutdown.changed() => {
                            if res.is_err() || shutdown_requested(&shutdown) {
                                WS_CONNECTED.set(0);
                                let _ = ws.close(None).await;
                                info!("kabu push closed on shutdown");
                                return;
                            }
                        }
                        frame = ws.next() => {
                            let Some(frame) = frame else { break };
                            match frame {
                                Ok(m) if m.is_text() => {
                                    let txt = match m.into_text() {
                                        Ok(t) => t,
                                        Err(e) => {
                                            warn!(?e, "failed to read text frame");
                                            continue;
                                        }
                                    };
                                    match serde_json::from_str::<PushMessage>(&txt) {
                                        Ok(msg) => {
                                            WS_LAST_EVENT_TS.set(chrono::Utc::now().timestamp());
                                            if let Some(tick) = msg.into_tick() {
                                                if tx.send(tick).await.is_err() {
                                                    WS_CONNECTED.set(0);
                                                    return;
                                                }
                                                TICKS.inc();
                                            }
                                        }
                                        Err(e) => warn!(?e, "undecodable push frame"),
                                    }
                                }
                                Ok(_) => {
                                    // ping/pong/binary: nothing to do
                                }
                                Err(e) => {
                                    error!(?e, "push read error");
                                    break;
                                }
                            }
                        }
                    }
                }
                WS_CONNECTED.set(0);
                info!("kabu push disconnected, will reconnect");
            }
            Err(e) => {
                error!(?e, "push connect failed");
            }
        }

        attempt = attempt.saturating_add(1);
        WS_RECONNECTS.inc();
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || shutdown_requested(&shutdown) { break; }
            }
            _ = sleep(backoff_delay(attempt)) => {}
        }
    }
}
