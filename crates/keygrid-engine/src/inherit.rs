/*
[INPUT]:  New target prices, current slots, live orders, current price
[OUTPUT]: Migration plan: next active slots, newly retired slots, cancels and requeues
[POS]:    Migration layer - positional inheritance of slot state
[UPDATE]: When inheritance, retirement or requeue rules change
*/

use keygrid_exchange::{OpenOrder, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::feed::TargetPrices;
use crate::precision::price_matches;
use crate::slot::{LifecycleAction, Slot, SlotId};
use crate::store::SlotStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedCancel {
    pub order_id: String,
    pub side: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub slot_id: SlotId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedPlace {
    pub side: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    pub slot_id: SlotId,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationPlan {
    /// Next active slot list, price descending.
    pub target_active: Vec<Slot>,
    pub newly_retired: Vec<Slot>,
    pub cancels: Vec<PlannedCancel>,
    pub places: Vec<PlannedPlace>,
}

impl MigrationPlan {
    pub fn is_noop(&self) -> bool {
        self.cancels.is_empty() && self.places.is_empty() && self.newly_retired.is_empty()
    }
}

/// Position `i` of the new list inherits the slot at position `i` of the old list.
///
/// The inheriting slot keeps its id, so inventory owned by it (and therefore its fill
/// count) carries over. Orders resting at the old price are cancelled and requeued at
/// the new price unless the requeue would cross the market. Surplus old positions are
/// retired and keep their sell exposure; only their buys are cancelled.
pub fn inherit_by_index(
    prices: &TargetPrices,
    store: &SlotStore,
    live_orders: &[OpenOrder],
    current_price: Decimal,
) -> Result<MigrationPlan> {
    let tolerance = store.tolerance();
    let old = store.slots();
    let mut next_id = store.next_slot_id().0;
    let mut plan = MigrationPlan::default();

    for (i, price) in prices.as_slice().iter().copied().enumerate() {
        let direction = if price < current_price { Side::Buy } else { Side::Sell };
        let Some(previous) = old.get(i) else {
            plan.target_active.push(Slot::new(SlotId(next_id), price, direction));
            next_id += 1;
            continue;
        };

        let mut slot = previous.clone();
        slot.reprice(price, direction);
        if !price_matches(price, previous.price(), tolerance) {
            let orders: Vec<&OpenOrder> = live_orders
                .iter()
                .filter(|o| o.status.is_resting() && price_matches(o.price, previous.price(), tolerance))
                .collect();
            for order in &orders {
                plan.cancels.push(PlannedCancel {
                    order_id: order.id.clone(),
                    side: order.side,
                    price: order.price,
                    slot_id: slot.id(),
                });
            }
            for side in [Side::Buy, Side::Sell] {
                let qty: Decimal = orders
                    .iter()
                    .filter(|o| o.side == side)
                    .map(|o| o.remaining_qty())
                    .sum();
                if qty <= Decimal::ZERO {
                    continue;
                }
                let crosses = match side {
                    Side::Buy => price >= current_price,
                    Side::Sell => price <= current_price,
                };
                if crosses {
                    debug!(slot_id = %slot.id(), side = %side, price = %price, "requeue skipped, would cross market");
                    continue;
                }
                plan.places.push(PlannedPlace {
                    side,
                    price,
                    qty,
                    slot_id: slot.id(),
                });
            }
        }
        plan.target_active.push(slot);
    }

    for previous in old.iter().skip(prices.len()) {
        let mut slot = previous.clone();
        slot.transition(LifecycleAction::Retire)?;
        // Slot orders are buys, and retiring cancels every buy at the price.
        slot.clear_order();
        for order in live_orders.iter().filter(|o| {
            o.side == Side::Buy && o.status.is_resting() && price_matches(o.price, slot.price(), tolerance)
        }) {
            plan.cancels.push(PlannedCancel {
                order_id: order.id.clone(),
                side: order.side,
                price: order.price,
                slot_id: slot.id(),
            });
        }
        plan.newly_retired.push(slot);
    }

    store.check_candidate(&plan.target_active, &plan.newly_retired)?;
    info!(
        active = plan.target_active.len(),
        retired = plan.newly_retired.len(),
        cancels = plan.cancels.len(),
        places = plan.places.len(),
        "migration plan built"
    );
    Ok(plan)
}
