// ===============================
// src/order.rs
// ===============================
use serde::{Deserialize, Serialize};

use crate::domain::Side;

/// A single fill reported by the venue. `id` is the venue's execution id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub price: f64,
    pub qty: u64,
}

/// One order and everything the venue has told us about its fills.
///
/// The venue is authoritative: `filled_qty()` may in principle exceed
/// `order_qty` and nothing here rejects that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub order_price: f64,
    pub order_qty: u64,
    pub executions: Vec<Execution>,
    pub is_canceled: bool,
}

impl Order {
    pub fn new(id: impl Into<String>, symbol: impl Into<String>, side: Side, price: f64, qty: u64) -> Self {
        Self {
            id: id.into(),
            symbol: symbol.into(),
            side,
            order_price: price,
            order_qty: qty,
            executions: Vec::new(),
            is_canceled: false,
        }
    }

    pub fn filled_qty(&self) -> u64 {
        self.executions.iter().map(|e| e.qty).sum()
    }

    pub fn unfilled_qty(&self) -> u64 {
        self.order_qty.saturating_sub(self.filled_qty())
    }

    /// Quantity-weighted fill price, 0.0 before the first fill.
    pub fn average_price(&self) -> f64 {
        let qty = self.filled_qty();
        if qty == 0 {
            return 0.0;
        }
        let cost: f64 = self.executions.iter().map(|e| e.price * e.qty as f64).sum();
        cost / qty as f64
    }

    pub fn is_completed(&self) -> bool {
        self.is_canceled || self.filled_qty() >= self.order_qty
    }

    /// Returns false when an execution with the same id is already present.
    pub fn add_execution(&mut self, exec: Execution) -> bool {
        if self.executions.iter().any(|e| e.id == exec.id) {
            return false;
        }
        self.executions.push(exec);
        true
    }

    pub fn cancel(&mut self) {
        self.is_canceled = true;
    }
}
