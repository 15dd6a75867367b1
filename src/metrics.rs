// ===============================
// src/metrics.rs
// ===============================
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tracing::{error, info};

// Single custom registry (everything is registered here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// Metric names are fixed strings, so construction cannot fail at runtime.
fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("valid counter")
}
fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter vec")
}
fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("valid gauge")
}
fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    IntGaugeVec::new(Opts::new(name, help), labels).expect("valid gauge vec")
}

// -------- Market data --------
pub static TICKS: Lazy<IntCounter> = Lazy::new(|| counter("ticks_total", "market data ticks"));

pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("ticks_total_by_symbol", "ticks routed to a sniper", &["symbol"]));

pub static TICKS_UNROUTED: Lazy<IntCounter> =
    Lazy::new(|| counter("ticks_unrouted_total", "ticks for symbols nobody watches"));

pub static TICKS_DROPPED: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("ticks_dropped_total", "ticks dropped on a full symbol queue", &["symbol"]));

// -------- Trading --------
pub static SIGNALS_BY: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("signals_total_by", "non-HOLD signals (labels: symbol, action)", &["symbol", "action"])
});

pub static ORDERS_SUBMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("orders_submitted_total", "orders accepted by the venue", &["symbol", "side"])
});

pub static ORDERS_FAILED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("orders_failed_total", "order submissions that failed (label: reason)", &["symbol", "reason"])
});

// Latency from signal -> venue ack (milliseconds)
pub static LAT_SUBMIT: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new("latency_submit_ms", "send_order round trip (ms)"))
        .expect("valid histogram")
});

pub static HELD_QTY: Lazy<IntGaugeVec> =
    Lazy::new(|| gauge_vec("held_qty", "quantity a sniper believes it holds", &["symbol"]));

// -------- Reconciliation --------
pub static EXEC_REPORTS_EMITTED: Lazy<IntCounter> =
    Lazy::new(|| counter("exec_reports_emitted_total", "new executions found by the poller"));

pub static EXEC_REPORTS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("exec_reports_total", "execution reports by outcome", &["outcome"])
});

pub static POLL_ERRORS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("poll_errors_total", "failed order polls (label: kind)", &["kind"]));

// -------- Lifecycle --------
pub static LIQUIDATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("liquidations_total", "liquidation orders sent (label: phase)", &["phase"])
});

pub static SHUTDOWN_ATTEMPTS: Lazy<IntCounter> =
    Lazy::new(|| counter("shutdown_attempts_total", "shutdown sweep rounds"));

// -------- Push stream health --------
pub static WS_CONNECTED: Lazy<IntGauge> =
    Lazy::new(|| gauge("push_ws_connected", "1 if the PUSH websocket is connected"));

pub static WS_RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| counter("push_ws_reconnects_total", "PUSH websocket reconnects"));

pub static WS_LAST_EVENT_TS: Lazy<IntGauge> =
    Lazy::new(|| gauge("push_ws_last_event_ts", "unix seconds of the last PUSH frame"));

// ---- Config visibility (venue / strategies / symbols) ----
pub static CONFIG_VENUE_MODE: Lazy<IntGaugeVec> =
    Lazy::new(|| gauge_vec("config_venue_mode", "venue mode (label: mode)", &["mode"]));

pub static CONFIG_STRATEGY_ACTIVE: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec("config_strategy_active", "snipers per strategy (label: strategy)", &["strategy"])
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> =
    Lazy::new(|| gauge_vec("config_symbol", "watched symbols (label: symbol)", &["symbol"]));

pub fn init() {
    // Register all metrics to the custom registry; a second call only
    // yields AlreadyReg errors, which are ignored.
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(TICKS.clone()),
        Box::new(TICKS_BY_SYMBOL.clone()),
        Box::new(TICKS_UNROUTED.clone()),
        Box::new(TICKS_DROPPED.clone()),
        Box::new(SIGNALS_BY.clone()),
        Box::new(ORDERS_SUBMITTED.clone()),
        Box::new(ORDERS_FAILED.clone()),
        Box::new(LAT_SUBMIT.clone()),
        Box::new(HELD_QTY.clone()),
        Box::new(EXEC_REPORTS_EMITTED.clone()),
        Box::new(EXEC_REPORTS.clone()),
        Box::new(POLL_ERRORS.clone()),
        Box::new(LIQUIDATIONS.clone()),
        Box::new(SHUTDOWN_ATTEMPTS.clone()),
        Box::new(WS_CONNECTED.clone()),
        Box::new(WS_RECONNECTS.clone()),
        Box::new(WS_LAST_EVENT_TS.clone()),
        Box::new(CONFIG_VENUE_MODE.clone()),
        Box::new(CONFIG_STRATEGY_ACTIVE.clone()),
        Box::new(CONFIG_SYMBOL.clone()),
    ];
    for c in collectors {
        let _ = REGISTRY.register(c);
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let rsp = match req.uri().path() {
        "/" | "/metrics" => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::from("not found\n")),
    };
    Ok(rsp.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serve `/metrics` until the process exits. Bind failures are logged, the
/// engine keeps running without metrics.
pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    match Server::try_bind(&addr) {
        Ok(builder) => {
            info!(%addr, "metrics listening on /metrics");
            if let Err(e) = builder.serve(make_svc).await {
                error!(?e, "metrics server stopped");
            }
        }
        Err(e) => error!(?e, %addr, "metrics bind failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_series_are_exported() {
        init();
        TICKS_BY_SYMBOL.with_label_values(&["9433"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("ticks_total_by_symbol"));
        assert!(text.contains("symbol=\"9433\""));
    }
}
