/*
[INPUT]:  Recon cycles, fills, executed actions and exchange reads
[OUTPUT]: Snapshot-friendly grid counters for status output
[POS]:    Shared runtime metrics owned by the grid core
[UPDATE]: When adding/removing engine-level runtime signals
*/

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::action::ExecutionReport;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridMetricsSnapshot {
    pub recon_cycles: u64,
    pub fills_handled: u64,
    pub orders_placed: u64,
    pub orders_cancelled: u64,
    pub order_failures: u64,
    pub unknown_outcomes: u64,
    pub open_orders: usize,
    pub position_qty: Decimal,
    pub last_price: Option<Decimal>,
    pub last_recon: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct GridMetrics {
    recon_cycles: u64,
    fills_handled: u64,
    orders_placed: u64,
    orders_cancelled: u64,
    order_failures: u64,
    unknown_outcomes: u64,
    open_orders: usize,
    position_qty: Decimal,
    last_price: Option<Decimal>,
    last_recon: Option<DateTime<Utc>>,
}

impl GridMetrics {
    pub fn snapshot(&self) -> GridMetricsSnapshot {
        GridMetricsSnapshot {
            recon_cycles: self.recon_cycles,
            fills_handled: self.fills_handled,
            orders_placed: self.orders_placed,
            orders_cancelled: self.orders_cancelled,
            order_failures: self.order_failures,
            unknown_outcomes: self.unknown_outcomes,
            open_orders: self.open_orders,
            position_qty: self.position_qty,
            last_price: self.last_price,
            last_recon: self.last_recon,
        }
    }

    pub fn record_recon(&mut self, open_orders: usize, position_qty: Decimal, price: Decimal) {
        self.recon_cycles += 1;
        self.open_orders = open_orders;
        self.position_qty = position_qty;
        self.last_price = Some(price);
        self.last_recon = Some(Utc::now());
    }

    pub fn record_fill(&mut self) {
        self.fills_handled += 1;
    }

    pub fn record_execution(&mut self, report: &ExecutionReport) {
        self.orders_placed += report.placed as u64;
        self.orders_cancelled += report.cancelled as u64;
        self.order_failures += report.failed as u64;
        self.unknown_outcomes += report.unknown as u64;
    }
}
