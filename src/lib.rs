// ===============================
// src/lib.rs
// ===============================
pub mod analyzer;
pub mod config;
pub mod domain;
pub mod engine;
pub mod feed;
pub mod gateway;
pub mod gateway_kabu; // kabu station (REST + PUSH websocket)
pub mod kabu;         // wire models + REST client for kabu station
pub mod lifecycle;
pub mod metrics;
pub mod order;
pub mod reconcile;
pub mod recorder;
pub mod sniper;
pub mod strategy;
