/*
[INPUT]:  Slot store, resting orders, in-flight book, current price
[OUTPUT]: Quota records per (slot, side) and the place/cancel actions that close the gaps
[POS]:    Recon pathway - full expected-vs-actual comparison
[UPDATE]: When quota formulas, placement gates or surplus policy change
*/

use std::collections::{BTreeMap, HashSet};

use keygrid_exchange::{OpenOrder, Side};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::action::{ActionReason, OrderAction};
use crate::inflight::InFlightBook;
use crate::precision::{decimal_max, decimal_min, price_matches, PrecisionGuard, Rounding};
use crate::slot::{Slot, SlotId};
use crate::store::SlotStore;

#[derive(Debug, Clone, PartialEq)]
pub struct QuotaParams {
    /// Base quantity bought per slot fill.
    pub unit: Decimal,
    /// Share of each filled unit put up for sale at the target.
    pub retain_ratio: Decimal,
    pub max_fill_per_level: u32,
    pub buy_buffer_pct: Decimal,
    pub sell_buffer_pct: Decimal,
}

/// Expected versus resting quantity for one side of one slot.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaRecord {
    pub slot_id: SlotId,
    pub side: Side,
    pub price: Decimal,
    pub expected_qty: Decimal,
    pub open_qty: Decimal,
    pub inflight_qty: Decimal,
}

impl QuotaRecord {
    pub fn deficit(&self) -> Decimal {
        decimal_max(self.expected_qty - self.open_qty - self.inflight_qty, Decimal::ZERO)
    }

    pub fn surplus(&self) -> Decimal {
        decimal_max(self.open_qty + self.inflight_qty - self.expected_qty, Decimal::ZERO)
    }
}

/// Resting orders eligible for quota accounting.
///
/// Orders with a cancel already in flight are excluded so a second pass never
/// cancels them twice.
#[derive(Debug)]
pub struct BookView<'a> {
    orders: Vec<&'a OpenOrder>,
    inflight: &'a InFlightBook,
    tolerance: Decimal,
}

impl<'a> BookView<'a> {
    pub fn new(open_orders: &'a [OpenOrder], inflight: &'a InFlightBook, tolerance: Decimal) -> Self {
        let orders = open_orders
            .iter()
            .filter(|o| o.status.is_resting() && !inflight.is_cancel_pending(&o.id))
            .collect();
        Self {
            orders,
            inflight,
            tolerance,
        }
    }

    pub fn orders_at(&self, side: Side, price: Decimal) -> Vec<&'a OpenOrder> {
        self.orders
            .iter()
            .copied()
            .filter(|o| o.side == side && price_matches(o.price, price, self.tolerance))
            .collect()
    }

    pub fn open_qty(&self, side: Side, price: Decimal) -> Decimal {
        self.orders_at(side, price)
            .iter()
            .map(|o| o.remaining_qty())
            .sum()
    }

    pub fn inflight_qty(&self, side: Side, price: Decimal) -> Decimal {
        self.inflight.qty_at(side, price)
    }

    fn orders(&self) -> &[&'a OpenOrder] {
        &self.orders
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconPlan {
    pub records: Vec<QuotaRecord>,
    pub actions: Vec<OrderAction>,
}

impl ReconPlan {
    pub fn places(&self) -> impl Iterator<Item = &OrderAction> {
        self.actions.iter().filter(|a| a.is_place())
    }

    pub fn cancels(&self) -> impl Iterator<Item = &OrderAction> {
        self.actions.iter().filter(|a| a.is_cancel())
    }
}

#[derive(Debug, Clone)]
pub struct QuotaReconciler {
    params: QuotaParams,
    precision: PrecisionGuard,
}

impl QuotaReconciler {
    pub fn new(params: QuotaParams, precision: PrecisionGuard) -> Self {
        Self { params, precision }
    }

    pub fn params(&self) -> &QuotaParams {
        &self.params
    }

    pub fn precision(&self) -> &PrecisionGuard {
        &self.precision
    }

    /// Buy quantity for one slot fill, never below the venue minimum.
    pub fn buy_unit(&self) -> Decimal {
        decimal_max(
            self.precision.quantize(self.params.unit, Rounding::Down),
            self.precision.min_qty(),
        )
    }

    /// Take-profit quantity released by one filled unit, before quantization.
    pub fn sell_increment(&self) -> Decimal {
        self.params.unit * self.params.retain_ratio
    }

    /// Expected take-profit quantity per target slot, quantized down.
    pub fn expected_sell_quotas(&self, store: &SlotStore) -> BTreeMap<SlotId, Decimal> {
        let mut raw: BTreeMap<SlotId, Decimal> = BTreeMap::new();
        for source in store.all_slots().filter(|s| s.fill_count() > 0) {
            let Some(target) = store.target_of(source.id()) else {
                continue;
            };
            *raw.entry(target).or_insert(Decimal::ZERO) +=
                Decimal::from(source.fill_count()) * self.sell_increment();
        }
        // Partially filled take-profits already sold part of a still-open unit.
        for (order_id, progress) in store.sell_fills() {
            let target = store
                .inventory()
                .iter()
                .find(|r| r.sell_order_id.as_deref() == Some(order_id.as_str()))
                .and_then(|r| r.target_sell_slot_id);
            let Some(qty) = target.and_then(|t| raw.get_mut(&t)) else {
                continue;
            };
            let sold = progress.filled - Decimal::from(progress.released) * self.sell_increment();
            if sold > Decimal::ZERO {
                *qty = decimal_max(*qty - sold, Decimal::ZERO);
            }
        }
        raw.into_iter()
            .map(|(target, qty)| (target, self.precision.quantize(qty, Rounding::Down)))
            .collect()
    }

    pub fn expected_buy(&self, slot: &Slot, current_price: Decimal) -> Decimal {
        let wants_buy = slot.is_active()
            && slot.direction() == Side::Buy
            && slot.fill_count() < self.params.max_fill_per_level
            && slot.price() < current_price;
        if wants_buy {
            self.buy_unit()
        } else {
            Decimal::ZERO
        }
    }

    /// Buys rest only with a buffer below market.
    pub fn buy_placement_allowed(&self, price: Decimal, current_price: Decimal) -> bool {
        current_price > price * (Decimal::ONE + self.params.buy_buffer_pct)
    }

    /// Sells rest only with a buffer above market.
    pub fn sell_placement_allowed(&self, price: Decimal, current_price: Decimal) -> bool {
        price > current_price * (Decimal::ONE + self.params.sell_buffer_pct)
    }

    /// Buy quota of one slot. A partially filled buy already holds part of the unit.
    pub fn buy_record(
        &self,
        store: &SlotStore,
        slot: &Slot,
        book: &BookView<'_>,
        current_price: Decimal,
    ) -> QuotaRecord {
        let expected = self.expected_buy(slot, current_price) - store.partial_buy_qty(slot.id());
        QuotaRecord {
            slot_id: slot.id(),
            side: Side::Buy,
            price: slot.price(),
            expected_qty: decimal_max(expected, Decimal::ZERO),
            open_qty: book.open_qty(Side::Buy, slot.price()),
            inflight_qty: book.inflight_qty(Side::Buy, slot.price()),
        }
    }

    pub fn sell_record(
        &self,
        slot: &Slot,
        expected: &BTreeMap<SlotId, Decimal>,
        book: &BookView<'_>,
    ) -> QuotaRecord {
        QuotaRecord {
            slot_id: slot.id(),
            side: Side::Sell,
            price: slot.price(),
            expected_qty: expected.get(&slot.id()).copied().unwrap_or(Decimal::ZERO),
            open_qty: book.open_qty(Side::Sell, slot.price()),
            inflight_qty: book.inflight_qty(Side::Sell, slot.price()),
        }
    }

    /// Full comparison of expected quotas with resting and in-flight orders.
    pub fn reconcile(
        &self,
        store: &SlotStore,
        open_orders: &[OpenOrder],
        inflight: &InFlightBook,
        current_price: Decimal,
    ) -> ReconPlan {
        let book = BookView::new(open_orders, inflight, store.tolerance());
        let expected = self.expected_sell_quotas(store);
        let mut plan = ReconPlan::default();
        let mut cancels = Vec::new();
        let mut places = Vec::new();

        for slot in store.all_slots() {
            let buy = self.buy_record(store, slot, &book, current_price);
            let sell = self.sell_record(slot, &expected, &book);
            for record in [buy, sell] {
                let orders = book.orders_at(record.side, record.price);
                cancels.extend(self.surplus_cancels(&record, &orders));
                if let Some(place) = self.deficit_place(&record, current_price) {
                    places.push(place);
                }
                plan.records.push(record);
            }
        }

        let matched: HashSet<&str> = store
            .all_slots()
            .flat_map(|s| {
                book.orders()
                    .iter()
                    .filter(|o| price_matches(o.price, s.price(), store.tolerance()))
                    .map(|o| o.id.as_str())
                    .collect::<Vec<_>>()
            })
            .collect();
        for order in book.orders().iter().filter(|o| !matched.contains(o.id.as_str())) {
            debug!(order_id = %order.id, price = %order.price, "order matches no slot");
            cancels.push(OrderAction::Cancel {
                order_id: order.id.clone(),
                side: order.side,
                price: order.price,
                slot_id: None,
                reason: ActionReason::OrphanOrder,
            });
        }

        plan.actions = cancels;
        plan.actions.extend(places);
        if !plan.actions.is_empty() {
            info!(
                places = plan.places().count(),
                cancels = plan.cancels().count(),
                "recon plan built"
            );
        }
        plan
    }

    fn deficit_place(&self, record: &QuotaRecord, current_price: Decimal) -> Option<OrderAction> {
        let deficit = record.deficit();
        if deficit < self.precision.min_qty() || deficit.is_zero() {
            return None;
        }
        let allowed = match record.side {
            Side::Buy => self.buy_placement_allowed(record.price, current_price),
            Side::Sell => self.sell_placement_allowed(record.price, current_price),
        };
        if !allowed {
            debug!(
                slot_id = %record.slot_id,
                side = %record.side,
                price = %record.price,
                current = %current_price,
                "placement held back by price buffer"
            );
            return None;
        }
        let qty = self.precision.tradable(deficit, Rounding::Down)?;
        let reason = match record.side {
            Side::Buy => ActionReason::BuyQuota,
            Side::Sell => ActionReason::SellQuota,
        };
        Some(OrderAction::Place {
            side: record.side,
            price: record.price,
            qty,
            slot_id: record.slot_id,
            reason,
        })
    }

    fn surplus_cancels(&self, record: &QuotaRecord, orders: &[&OpenOrder]) -> Vec<OrderAction> {
        let surplus = record.surplus();
        if surplus.is_zero() || orders.is_empty() {
            return Vec::new();
        }
        let cancel = |order: &OpenOrder, reason: ActionReason| OrderAction::Cancel {
            order_id: order.id.clone(),
            side: order.side,
            price: order.price,
            slot_id: Some(record.slot_id),
            reason,
        };

        if record.expected_qty.is_zero() {
            return orders
                .iter()
                .map(|o| cancel(o, ActionReason::StaleExposure))
                .collect();
        }

        let mut oldest_first: Vec<&OpenOrder> = orders.to_vec();
        oldest_first.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let mut remaining = decimal_min(surplus, record.open_qty);
        let mut actions = Vec::new();
        for order in oldest_first {
            let qty = order.remaining_qty();
            if qty <= remaining {
                remaining -= qty;
                actions.push(cancel(order, ActionReason::Surplus));
            }
        }
        if !remaining.is_zero() {
            debug!(
                slot_id = %record.slot_id,
                side = %record.side,
                tolerated = %remaining,
                "surplus remainder left resting"
            );
        }
        actions
    }
}
