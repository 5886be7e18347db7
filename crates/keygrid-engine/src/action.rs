/*
[INPUT]:  Quota and event decisions
[OUTPUT]: Order actions handed to the engine for execution
[POS]:    Domain layer - action vocabulary shared by both pathways
[UPDATE]: When a new action reason or action kind is introduced
*/

use std::fmt;

use keygrid_exchange::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::slot::SlotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionReason {
    /// Buy slot below market missing its resting buy
    BuyQuota,
    /// Sell target short of its expected take-profit quantity
    SellQuota,
    /// Resting quantity above expectation
    Surplus,
    /// Orders at a slot that should carry nothing
    StaleExposure,
    /// Orders at prices that match no slot
    OrphanOrder,
    /// Take-profit increment after a buy fill
    EventSellIncrement,
    /// Buy refill after a sell fill
    EventRefill,
}

impl fmt::Display for ActionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActionReason::BuyQuota => "buy_quota",
            ActionReason::SellQuota => "sell_quota",
            ActionReason::Surplus => "surplus",
            ActionReason::StaleExposure => "stale_exposure",
            ActionReason::OrphanOrder => "orphan_order",
            ActionReason::EventSellIncrement => "event_sell_increment",
            ActionReason::EventRefill => "event_refill",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderAction {
    Place {
        side: Side,
        price: Decimal,
        qty: Decimal,
        slot_id: SlotId,
        reason: ActionReason,
    },
    Cancel {
        order_id: String,
        side: Side,
        price: Decimal,
        slot_id: Option<SlotId>,
        reason: ActionReason,
    },
}

impl OrderAction {
    pub fn is_place(&self) -> bool {
        matches!(self, OrderAction::Place { .. })
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, OrderAction::Cancel { .. })
    }

    pub fn reason(&self) -> ActionReason {
        match self {
            OrderAction::Place { reason, .. } | OrderAction::Cancel { reason, .. } => *reason,
        }
    }
}

/// Counts of executed actions for summaries and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub placed: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub unknown: usize,
}

impl ExecutionReport {
    pub fn is_empty(&self) -> bool {
        self.placed + self.cancelled + self.failed + self.unknown == 0
    }
}
