// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : sniper_bot — async intraday execution engine in Rust
Module  : config.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Watches streamed ticks per symbol, runs composable entry/exit
          strategies, submits margin orders to a kabu-station style venue
          (or an in-process paper venue), reconciles polled fills, and
          keeps the account flat on startup and shutdown. Exposes
          Prometheus metrics and records JSONL events.
=============================================================================
*/
use chrono::NaiveTime;
use clap::Parser;
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::lifecycle::LifecycleConfig;
use crate::reconcile::PollerConfig;
use crate::strategy::StrategyParams;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid { key: &'static str, value: String, reason: String },
    #[error("bad WATCH_LIST entry {0:?} (expected symbol:strategy[:entry_price[:qty]])")]
    WatchEntry(String),
    #[error("WATCH_LIST is empty")]
    EmptyWatchList,
    #[error("KABU_PASSWORD is required for VENUE_MODE=kabu")]
    MissingPassword,
}

/// Which venue the engine trades against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VenueMode {
    Mock,
    Kabu,
}

impl VenueMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" | "paper" => Some(VenueMode::Mock),
            "kabu" | "kabusapi" => Some(VenueMode::Kabu),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueMode::Mock => "mock",
            VenueMode::Kabu => "kabu",
        }
    }
}

/// One watched symbol and the strategy it runs.
#[derive(Clone, Debug, PartialEq)]
pub struct WatchTarget {
    pub symbol: String,
    pub strategy: String,
    pub entry_price: Option<f64>,
    pub qty: Option<u64>,
}

/// Command-line overrides. Anything not given falls back to the environment.
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "sniper_bot", version, about = "intraday sniper execution engine")]
pub struct Cli {
    /// mock | kabu (VENUE_MODE)
    #[arg(long)]
    pub venue: Option<String>,
    /// symbol:strategy[:entry_price[:qty]],... (WATCH_LIST)
    #[arg(long)]
    pub watch: Option<String>,
    /// HH:MM local time, or "off" (KILL_TIME)
    #[arg(long)]
    pub kill_time: Option<String>,
    /// (METRICS_PORT)
    #[arg(long)]
    pub metrics_port: Option<u16>,
    /// JSONL output (RECORD_FILE)
    #[arg(long)]
    pub record_file: Option<String>,
    /// Load this file instead of ./.env
    #[arg(long)]
    pub env_file: Option<PathBuf>,
}

impl Cli {
    fn get(&self, key: &str) -> Option<String> {
        match key {
            "VENUE_MODE" => self.venue.clone(),
            "WATCH_LIST" => self.watch.clone(),
            "KILL_TIME" => self.kill_time.clone(),
            "METRICS_PORT" => self.metrics_port.map(|p| p.to_string()),
            "RECORD_FILE" => self.record_file.clone(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    // venue
    pub venue_mode: VenueMode,
    pub kabu_api_url: String,
    pub kabu_ws_url: String,
    pub kabu_password: String,

    // what to trade
    pub watch_list: Vec<WatchTarget>,
    pub default_qty: u64,
    pub take_profit_rate: f64,
    pub max_budget: Option<f64>,
    pub vwap_band_k: f64,
    pub kill_time: Option<NaiveTime>,

    // timing
    pub poll_interval: Duration,
    pub gateway_timeout: Duration,
    pub settlement_delay: Duration,
    pub cancel_settlement_delay: Duration,
    pub shutdown_retry_backoff: Duration,
    pub max_shutdown_attempts: u32,

    // plumbing
    pub symbol_queue_capacity: usize,
    pub metrics_port: u16,
    pub record_file: Option<String>,
    pub ma_short_window: usize,
    pub ma_long_window: usize,
}

impl Settings {
    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            settlement_delay: self.settlement_delay,
            cancel_settlement_delay: self.cancel_settlement_delay,
            retry_backoff: self.shutdown_retry_backoff,
            max_shutdown_attempts: self.max_shutdown_attempts,
            call_timeout: self.gateway_timeout,
        }
    }

    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            interval: self.poll_interval,
            call_timeout: self.gateway_timeout,
            ..Default::default()
        }
    }

    pub fn strategy_params(&self, t: &WatchTarget) -> StrategyParams {
        StrategyParams {
            entry_price: t.entry_price.unwrap_or(0.0),
            qty: t.qty.unwrap_or(self.default_qty),
            take_profit_rate: self.take_profit_rate,
            max_budget: self.max_budget,
            band_k: self.vwap_band_k,
        }
    }
}

/// `.env` (or `--env-file`), then environment, with CLI flags on top.
pub fn load(cli: &Cli) -> Result<Settings, ConfigError> {
    match &cli.env_file {
        Some(p) => {
            let _ = dotenvy::from_path(p);
        }
        None => {
            let _ = dotenv();
        }
    }
    from_lookup(|k| cli.get(k).or_else(|| env::var(k).ok()))
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: v.clone(),
            reason: e.to_string(),
        }),
    }
}

fn millis(get: &impl Fn(&str) -> Option<String>, key: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    parse_or(get, key, default_ms).map(Duration::from_millis)
}

/// Build settings from any key lookup.
pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Settings, ConfigError> {
    let venue_raw = get("VENUE_MODE").unwrap_or_else(|| "mock".to_string());
    let venue_mode = VenueMode::parse(&venue_raw).ok_or_else(|| ConfigError::Invalid {
        key: "VENUE_MODE",
        value: venue_raw.clone(),
        reason: "expected mock or kabu".into(),
    })?;

    let kabu_api_url = get("KABU_API_URL")
        .unwrap_or_else(|| "http://localhost:18080/kabusapi".to_string())
        .trim_end_matches('/')
        .to_string();
    let kabu_ws_url = get("KABU_WS_URL").unwrap_or_else(|| default_ws_url(&kabu_api_url));
    let kabu_password = get("KABU_PASSWORD").unwrap_or_default();
    if venue_mode == VenueMode::Kabu && kabu_password.is_empty() {
        return Err(ConfigError::MissingPassword);
    }

    let watch_list = parse_watch_list(&get("WATCH_LIST").unwrap_or_else(|| "9433:round_trip:3990:100".to_string()))?;

    let max_budget = match get("MAX_BUDGET").filter(|v| !v.trim().is_empty()) {
        None => None,
        Some(v) => Some(v.trim().parse::<f64>().map_err(|e| ConfigError::Invalid {
            key: "MAX_BUDGET",
            value: v.clone(),
            reason: e.to_string(),
        })?),
    };

    let kill_time = parse_kill_time(&get("KILL_TIME").unwrap_or_else(|| "14:50".to_string()))?;

    let ma_short_window = parse_or(&get, "MA_SHORT_WINDOW", 5usize)?;
    let ma_long_window = parse_or(&get, "MA_LONG_WINDOW", 25usize)?;
    if ma_short_window == 0 || ma_long_window < ma_short_window {
        return Err(ConfigError::Invalid {
            key: "MA_LONG_WINDOW",
            value: ma_long_window.to_string(),
            reason: format!("must be >= MA_SHORT_WINDOW ({ma_short_window}) and both > 0"),
        });
    }

    Ok(Settings {
        venue_mode,
        kabu_api_url,
        kabu_ws_url,
        kabu_password,
        watch_list,
        default_qty: parse_or(&get, "DEFAULT_QTY", 100u64)?,
        take_profit_rate: parse_or(&get, "TAKE_PROFIT_RATE", 0.002f64)?,
        max_budget,
        vwap_band_k: parse_or(&get, "VWAP_BAND_K", 2.0f64)?,
        kill_time,
        poll_interval: millis(&get, "POLL_INTERVAL_MS", 3_000)?,
        gateway_timeout: millis(&get, "GATEWAY_TIMEOUT_MS", 5_000)?,
        settlement_delay: millis(&get, "SETTLEMENT_DELAY_MS", 3_000)?,
        cancel_settlement_delay: millis(&get, "CANCEL_SETTLEMENT_DELAY_MS", 2_000)?,
        shutdown_retry_backoff: millis(&get, "SHUTDOWN_RETRY_BACKOFF_MS", 30_000)?,
        max_shutdown_attempts: parse_or(&get, "MAX_SHUTDOWN_ATTEMPTS", 3u32)?.max(1),
        symbol_queue_capacity: parse_or(&get, "SYMBOL_QUEUE_CAPACITY", 1024usize)?.max(1),
        metrics_port: parse_or(&get, "METRICS_PORT", 9898u16)?,
        record_file: get("RECORD_FILE").filter(|v| !v.trim().is_empty()),
        ma_short_window,
        ma_long_window,
    })
}

/// http://host:port/kabusapi -> ws://host:port/kabusapi/websocket
pub fn default_ws_url(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws}/websocket")
}

/// `9433:round_trip:3990:100,7203:vwap_rebound` (entry price and qty optional)
pub fn parse_watch_list(s: &str) -> Result<Vec<WatchTarget>, ConfigError> {
    let mut out: Vec<WatchTarget> = Vec::new();
    for raw in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let parts: Vec<&str> = raw.split(':').map(str::trim).collect();
        if parts.len() < 2 || parts.len() > 4 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(ConfigError::WatchEntry(raw.to_string()));
        }
        let entry_price = match parts.get(2) {
            Some(p) => Some(p.parse::<f64>().map_err(|_| ConfigError::WatchEntry(raw.to_string()))?),
            None => None,
        };
        let qty = match parts.get(3) {
            Some(q) => Some(q.parse::<u64>().map_err(|_| ConfigError::WatchEntry(raw.to_string()))?),
            None => None,
        };
        let symbol = parts[0].to_ascii_uppercase();
        // one sniper per symbol
        if out.iter().any(|t| t.symbol == symbol) {
            return Err(ConfigError::WatchEntry(raw.to_string()));
        }
        out.push(WatchTarget { symbol, strategy: parts[1].to_ascii_lowercase(), entry_price, qty });
    }
    if out.is_empty() {
        return Err(ConfigError::EmptyWatchList);
    }
    Ok(out)
}

/// `HH:MM` (or `HH:MM:SS`); `off`/`none` disables the time-of-day kill.
pub fn parse_kill_time(s: &str) -> Result<Option<NaiveTime>, ConfigError> {
    let t = s.trim();
    if t.is_empty() || t.eq_ignore_ascii_case("off") || t.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    NaiveTime::parse_from_str(t, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
        .map(Some)
        .map_err(|e| ConfigError::Invalid { key: "KILL_TIME", value: t.to_string(), reason: e.to_string() })
}
