// ===============================
// src/main.rs
// ===============================
/*
 # paper trading with the default watch list
 VENUE_MODE=mock RUST_LOG=info cargo run

 # what is configured / what is happening
curl -s localhost:9898/metrics | egrep '^config_(venue_mode|symbol|strategy_active)'
curl -s localhost:9898/metrics | egrep '^(held_qty|orders_submitted_total|exec_reports_total)'
*/
/*
=============================================================================
Project : sniper_bot — async intraday execution engine in Rust
Module  : main.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Watches streamed ticks per symbol, runs composable entry/exit
          strategies, submits margin orders to a kabu-station style venue
          (or an in-process paper venue), reconciles polled fills, and
          keeps the account flat on startup and shutdown. Exposes
          Prometheus metrics and records JSONL events.
=============================================================================
*/
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sniper_bot::{
    analyzer::DefaultAnalyzer,
    config::{self, Cli, Settings, VenueMode},
    domain::Event,
    engine::{self, Engine, EngineConfig},
    feed::RandomWalk,
    gateway::{FillMode, MarketGateway, MockConfig, MockGateway},
    gateway_kabu::KabuGateway,
    kabu::KabuClient,
    lifecycle::PositionCleaner,
    metrics, recorder,
    recorder::Recorder,
    strategy::StrategyRegistry,
};

async fn build_gateway(s: &Settings) -> Result<Arc<dyn MarketGateway>, String> {
    match s.venue_mode {
        VenueMode::Mock => {
            let walks = s
                .watch_list
                .iter()
                .map(|t| RandomWalk::new(t.symbol.clone(), t.entry_price.filter(|p| *p > 0.0).unwrap_or(1_000.0)))
                .collect();
            Ok(Arc::new(MockGateway::new(MockConfig {
                fill: FillMode::After(Duration::from_millis(200)),
                poll: s.poller(),
                random_walk: walks,
                ..Default::default()
            })))
        }
        VenueMode::Kabu => {
            let client = KabuClient::new(s.kabu_api_url.clone(), s.kabu_password.clone(), s.gateway_timeout)
                .map_err(|e| e.to_string())?;
            let gw = KabuGateway::new(client, s.kabu_ws_url.clone(), s.poller(), 4096);
            gw.connect().await.map_err(|e| e.to_string())?;
            Ok(Arc::new(gw))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Config ----
    let settings = match config::load(&cli) {
        Ok(s) => s,
        Err(e) => {
            error!(%e, "config rejected");
            return ExitCode::from(2);
        }
    };

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(settings.metrics_port));
    metrics::CONFIG_VENUE_MODE.with_label_values(&[settings.venue_mode.as_str()]).set(1);

    info!(
        venue_mode = settings.venue_mode.as_str(),
        watch = ?settings.watch_list.iter().map(|t| format!("{}:{}", t.symbol, t.strategy)).collect::<Vec<_>>(),
        kill_time = ?settings.kill_time,
        poll_ms = settings.poll_interval.as_millis() as u64,
        max_budget = ?settings.max_budget,
        api = %settings.kabu_api_url,
        "startup config"
    );

    // ---- Recorder (optional) ----
    let (rec, rec_task) = match settings.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            (Recorder::new(tx), Some(tokio::spawn(recorder::run(rx, path))))
        }
        None => (Recorder::disabled(), None),
    };

    // ---- Snipers ----
    let registry = StrategyRegistry::with_builtins();
    let snipers = match engine::build_snipers(&settings.watch_list, &settings, &registry) {
        Ok(s) => s,
        Err(e) => {
            error!(%e, available = ?registry.names(), "watch list names an unknown strategy");
            return ExitCode::from(2);
        }
    };

    // ---- Venue ----
    let gw = match build_gateway(&settings).await {
        Ok(g) => g,
        Err(e) => {
            error!(%e, "venue unavailable");
            return ExitCode::FAILURE;
        }
    };

    let analyzer = Arc::new(DefaultAnalyzer::new(settings.ma_short_window, settings.ma_long_window));
    let cleaner = PositionCleaner::new(gw.clone(), settings.lifecycle());
    let engine = Engine::new(gw, analyzer, snipers, cleaner, rec.clone(), EngineConfig::from_settings(&settings));

    // ---- Startup sweep: never trade on a dirty account ----
    if let Err(e) = engine.startup().await {
        error!(%e, "startup aborted");
        return ExitCode::FAILURE;
    }
    rec.record(Event::Note("startup sweep clean".into()));

    // ---- Ctrl-C -> shutdown ----
    let (sd_tx, sd_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received, shutting down"),
            Err(e) => warn!(?e, "ctrl-c handler failed, relying on kill time"),
        }
        let _ = sd_tx.send(true);
    });

    let result = engine.run(sd_rx).await;

    drop(rec);
    if let Some(h) = rec_task {
        let _ = tokio::time::timeout(Duration::from_secs(2), h).await;
    }

    match result {
        Ok(reason) => {
            info!(?reason, "stopped flat");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(%e, "stopped with exposure, manual intervention required");
            ExitCode::FAILURE
        }
    }
}
