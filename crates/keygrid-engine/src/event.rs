/*
[INPUT]:  A single confirmed fill plus the current book and slot store
[OUTPUT]: Inventory updates and at most one follow-up order action
[POS]:    Event pathway - scoped per-fill reaction, a subset of Recon
[UPDATE]: When fill attribution or the per-fill increment rules change
*/

use keygrid_exchange::{OpenOrder, Side, Trade};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::action::{ActionReason, OrderAction};
use crate::error::Result;
use crate::inflight::InFlightBook;
use crate::mapping::MappingBuilder;
use crate::precision::{decimal_min, Rounding};
use crate::quota::{BookView, QuotaReconciler};
use crate::slot::SlotId;
use crate::store::{InventoryRecord, SlotStore};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FillOutcome {
    /// Slot credited (buy) or debited (sell) by the fill.
    pub owner: Option<SlotId>,
    pub actions: Vec<OrderAction>,
    pub released: Vec<InventoryRecord>,
    /// Set when a bought slot has nothing above it to sell into.
    pub unmapped: Option<SlotId>,
}

/// Per-fill reaction. Every quantity it emits is capped by the deficit the
/// reconciler computes for the same slot, so Recon never has to undo it.
#[derive(Debug, Clone)]
pub struct EventIncrementer {
    reconciler: QuotaReconciler,
    mapping: MappingBuilder,
}

impl EventIncrementer {
    pub fn new(reconciler: QuotaReconciler, mapping: MappingBuilder) -> Self {
        Self { reconciler, mapping }
    }

    pub fn on_fill(
        &self,
        store: &mut SlotStore,
        trade: &Trade,
        open_orders: &[OpenOrder],
        inflight: &InFlightBook,
        current_price: Decimal,
    ) -> Result<FillOutcome> {
        match trade.side {
            Side::Buy => self.on_buy_fill(store, trade, open_orders, inflight, current_price),
            Side::Sell => Ok(self.on_sell_fill(store, trade, open_orders, inflight, current_price)),
        }
    }

    pub fn on_buy_fill(
        &self,
        store: &mut SlotStore,
        trade: &Trade,
        open_orders: &[OpenOrder],
        inflight: &InFlightBook,
        current_price: Decimal,
    ) -> Result<FillOutcome> {
        let owner = store
            .slot_for_order(&trade.order_id)
            .or_else(|| store.find_slot_by_price(trade.price).map(|s| s.id()));
        let Some(owner) = owner else {
            warn!(order_id = %trade.order_id, price = %trade.price, "buy fill matches no slot");
            return Ok(FillOutcome::default());
        };

        let mut outcome = FillOutcome {
            owner: Some(owner),
            ..FillOutcome::default()
        };
        let completed_unit =
            store.record_buy(owner, &trade.order_id, trade.price, trade.qty, trade.timestamp)?;
        if !completed_unit {
            debug!(order_id = %trade.order_id, qty = %trade.qty, "buy fill did not complete a unit");
            return Ok(outcome);
        }

        let target = match store.target_of(owner) {
            Some(target) => Some(target),
            None => {
                let target = self.mapping.target_for(store, owner);
                if let Some(target) = target {
                    store.insert_adjacency(owner, target);
                }
                target
            }
        };
        let Some(target_slot) = target.and_then(|id| store.slot(id)) else {
            warn!(owner = %owner, price = %trade.price, "filled slot has no sell target");
            outcome.unmapped = Some(owner);
            return Ok(outcome);
        };

        let book = BookView::new(open_orders, inflight, store.tolerance());
        let expected = self.reconciler.expected_sell_quotas(store);
        let record = self.reconciler.sell_record(target_slot, &expected, &book);
        if !self
            .reconciler
            .sell_placement_allowed(target_slot.price(), current_price)
        {
            debug!(target = %target_slot.id(), "sell increment held back by price buffer");
            return Ok(outcome);
        }

        let precision = self.reconciler.precision();
        let increment = precision.quantize(self.reconciler.sell_increment(), Rounding::Down);
        if let Some(qty) = precision.tradable(decimal_min(increment, record.deficit()), Rounding::Down) {
            info!(
                owner = %owner,
                target = %target_slot.id(),
                price = %target_slot.price(),
                qty = %qty,
                "buy fill: sell increment"
            );
            outcome.actions.push(OrderAction::Place {
                side: Side::Sell,
                price: target_slot.price(),
                qty,
                slot_id: target_slot.id(),
                reason: ActionReason::EventSellIncrement,
            });
        }
        Ok(outcome)
    }

    pub fn on_sell_fill(
        &self,
        store: &mut SlotStore,
        trade: &Trade,
        open_orders: &[OpenOrder],
        inflight: &InFlightBook,
        current_price: Decimal,
    ) -> FillOutcome {
        let per_unit = self.reconciler.sell_increment();
        let released = store.apply_sell_fill(&trade.order_id, trade.price, trade.qty, per_unit);
        let mut outcome = FillOutcome {
            owner: released.first().map(|r| r.owner_slot_id),
            released,
            ..FillOutcome::default()
        };
        if outcome.released.is_empty() {
            debug!(order_id = %trade.order_id, qty = %trade.qty, "sell fill closed no inventory yet");
            return outcome;
        }
        store.clear_order(&trade.order_id);

        let book = BookView::new(open_orders, inflight, store.tolerance());
        let precision = self.reconciler.precision();
        let refill = store
            .slots()
            .iter()
            .filter(|s| s.direction() == Side::Buy && s.price() < current_price)
            .map(|s| (s, self.reconciler.buy_record(store, s, &book, current_price)))
            .find(|(s, record)| {
                record.deficit() >= precision.min_qty()
                    && self.reconciler.buy_placement_allowed(s.price(), current_price)
            });
        if let Some((slot, record)) = refill {
            let unit = decimal_min(self.reconciler.buy_unit(), record.deficit());
            if let Some(qty) = precision.tradable(unit, Rounding::Down) {
                info!(slot_id = %slot.id(), price = %slot.price(), qty = %qty, "sell fill: buy refill");
                outcome.actions.push(OrderAction::Place {
                    side: Side::Buy,
                    price: slot.price(),
                    qty,
                    slot_id: slot.id(),
                    reason: ActionReason::EventRefill,
                });
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::precision::PrecisionGuard;
    use crate::quota::QuotaParams;
    use crate::slot::Slot;
    use crate::store::StoreParts;
    use chrono::Utc;
    use keygrid_exchange::OrderStatus;
    use std::str::FromStr;
    use std::time::Duration;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn reconciler() -> QuotaReconciler {
        QuotaReconciler::new(
            QuotaParams {
                unit: dec("0.001"),
                retain_ratio: dec("0.7"),
                max_fill_per_level: 1,
                buy_buffer_pct: dec("0.002"),
                sell_buffer_pct: dec("0.002"),
            },
            PrecisionGuard::new(4, dec("0.0001")),
        )
    }

    fn incrementer() -> EventIncrementer {
        EventIncrementer::new(reconciler(), MappingBuilder::new(dec("0.005")))
    }

    fn inflight() -> InFlightBook {
        InFlightBook::new(Duration::from_secs(10), dec("0.0001"))
    }

    fn grid() -> SlotStore {
        let slots = vec![
            Slot::new(SlotId(1), dec("95000"), Side::Sell),
            Slot::new(SlotId(2), dec("94500"), Side::Buy),
            Slot::new(SlotId(3), dec("94000"), Side::Buy),
        ];
        let mut store = SlotStore::from_parts(
            StoreParts {
                slots,
                ..StoreParts::default()
            },
            dec("0.0001"),
        )
        .expect("store");
        let report = MappingBuilder::new(dec("0.005")).build(&store);
        store.set_adjacency(report.adjacency);
        store
    }

    fn trade(id: &str, order_id: &str, side: Side, price: &str, qty: &str) -> Trade {
        Trade {
            id: id.to_string(),
            order_id: order_id.to_string(),
            side,
            price: dec(price),
            qty: dec(qty),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn buy_fill_places_one_increment_at_target() {
        let mut store = grid();
        store
            .attach_order(SlotId(2), "b1".into(), dec("0.001"))
            .expect("attach");

        let outcome = incrementer()
            .on_fill(
                &mut store,
                &trade("t1", "b1", Side::Buy, "94500", "0.001"),
                &[],
                &inflight(),
                dec("94400"),
            )
            .expect("fill");
        assert_eq!(outcome.owner, Some(SlotId(2)));
        assert_eq!(store.slot(SlotId(2)).expect("slot").fill_count(), 1);
        assert_eq!(
            outcome.actions,
            vec![OrderAction::Place {
                side: Side::Sell,
                price: dec("95000"),
                qty: dec("0.0007"),
                slot_id: SlotId(1),
                reason: ActionReason::EventSellIncrement,
            }]
        );
    }

    #[test]
    fn buy_fill_skips_increment_already_resting() {
        let mut store = grid();
        let resting = vec![OpenOrder {
            id: "s1".into(),
            side: Side::Sell,
            price: dec("95000"),
            qty: dec("0.0007"),
            filled_qty: Decimal::ZERO,
            status: OrderStatus::Open,
            created_at: Utc::now(),
        }];
        let outcome = incrementer()
            .on_fill(
                &mut store,
                &trade("t1", "b1", Side::Buy, "94500", "0.001"),
                &resting,
                &inflight(),
                dec("94400"),
            )
            .expect("fill");
        assert!(outcome.actions.is_empty());
    }

    #[test]
    fn top_slot_fill_reports_missing_target() {
        let mut store = grid();
        let outcome = incrementer()
            .on_fill(
                &mut store,
                &trade("t1", "b1", Side::Buy, "95000", "0.001"),
                &[],
                &inflight(),
                dec("94900"),
            )
            .expect("fill");
        assert_eq!(outcome.unmapped, Some(SlotId(1)));
        assert!(outcome.actions.is_empty());
        assert_eq!(store.slot(SlotId(1)).expect("slot").fill_count(), 1);
    }

    #[test]
    fn sell_fill_releases_inventory_and_refills_buy() {
        let mut store = grid();
        let events = incrementer();
        events
            .on_fill(
                &mut store,
                &trade("t1", "b1", Side::Buy, "94500", "0.001"),
                &[],
                &inflight(),
                dec("94400"),
            )
            .expect("buy");
        store.link_sell(SlotId(1), "s1", dec("0.0007"));

        let outcome = events.on_sell_fill(
            &mut store,
            &trade("t2", "s1", Side::Sell, "95000", "0.0007"),
            &[],
            &inflight(),
            dec("95100"),
        );
        assert_eq!(outcome.released.len(), 1);
        assert_eq!(outcome.owner, Some(SlotId(2)));
        assert_eq!(store.total_fill_count(), 0);
        assert_eq!(
            outcome.actions,
            vec![OrderAction::Place {
                side: Side::Buy,
                price: dec("94500"),
                qty: dec("0.001"),
                slot_id: SlotId(2),
                reason: ActionReason::EventRefill,
            }]
        );
    }

    #[test]
    fn partial_buy_waits_for_a_full_unit() {
        let mut store = grid();
        store.set_unit(dec("0.001"));
        store
            .attach_order(SlotId(2), "b1".into(), dec("0.001"))
            .expect("attach");
        let events = incrementer();

        let first = events
            .on_fill(
                &mut store,
                &trade("t1", "b1", Side::Buy, "94500", "0.0003"),
                &[],
                &inflight(),
                dec("94400"),
            )
            .expect("fill");
        assert!(first.actions.is_empty());
        let slot = store.slot(SlotId(2)).expect("slot");
        assert_eq!(slot.fill_count(), 0);
        assert_eq!(slot.active_order_id(), Some("b1"));

        let second = events
            .on_fill(
                &mut store,
                &trade("t2", "b1", Side::Buy, "94500", "0.0007"),
                &[],
                &inflight(),
                dec("94400"),
            )
            .expect("fill");
        assert_eq!(store.slot(SlotId(2)).expect("slot").fill_count(), 1);
        assert_eq!(second.actions.len(), 1);
        assert!(matches!(
            &second.actions[0],
            OrderAction::Place { side: Side::Sell, qty, .. } if *qty == dec("0.0007")
        ));
    }

    #[test]
    fn partial_sell_slices_release_one_record_when_complete() {
        let mut store = grid();
        store.set_unit(dec("0.001"));
        let now = Utc::now();
        store
            .record_buy(SlotId(2), "b1", dec("94500"), dec("0.001"), now)
            .expect("record");
        store
            .record_buy(SlotId(2), "b2", dec("94500"), dec("0.001"), now)
            .expect("record");
        store.link_sell(SlotId(1), "s1", dec("0.0007"));
        let events = incrementer();

        let first = events.on_sell_fill(
            &mut store,
            &trade("t1", "s1", Side::Sell, "95000", "0.0003"),
            &[],
            &inflight(),
            dec("95100"),
        );
        assert!(first.released.is_empty());
        assert!(first.actions.is_empty());
        assert_eq!(store.inventory().len(), 2);

        let second = events.on_sell_fill(
            &mut store,
            &trade("t2", "s1", Side::Sell, "95000", "0.0004"),
            &[],
            &inflight(),
            dec("95100"),
        );
        assert_eq!(second.released.len(), 1);
        assert_eq!(second.released[0].order_id, "b1");
        assert_eq!(store.inventory().len(), 1);
        assert_eq!(store.total_fill_count(), 1);
        assert!(store.sell_fills().is_empty());
    }
}
