/*
[INPUT]:  Dispatched place/cancel calls and exchange open-order snapshots
[OUTPUT]: In-flight quantities per side/price and pending cancel ids
[POS]:    State layer - dispatched-but-unconfirmed order tracking
[UPDATE]: When confirmation rules or timeout handling change
*/

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use keygrid_exchange::{OpenOrder, Side};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::precision::price_matches;
use crate::slot::SlotId;

/// Tolerance for venue timestamps that trail local dispatch time.
const CLOCK_SLACK: TimeDelta = TimeDelta::seconds(2);

/// A place call whose result has not been confirmed by an open-order snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightPlace {
    /// `None` when the call timed out and the venue id is unknown.
    pub order_id: Option<String>,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub slot_id: SlotId,
    pub dispatched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub confirmed: usize,
    pub expired: usize,
    pub cancels_confirmed: usize,
}

#[derive(Debug, Clone)]
pub struct InFlightBook {
    places: Vec<InFlightPlace>,
    cancels: HashMap<String, DateTime<Utc>>,
    ttl: TimeDelta,
    tolerance: Decimal,
}

impl InFlightBook {
    pub fn new(ttl: Duration, tolerance: Decimal) -> Self {
        Self {
            places: Vec::new(),
            cancels: HashMap::new(),
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::seconds(10)),
            tolerance,
        }
    }

    pub fn record_place(
        &mut self,
        order_id: Option<String>,
        side: Side,
        price: Decimal,
        qty: Decimal,
        slot_id: SlotId,
        now: DateTime<Utc>,
    ) {
        self.places.push(InFlightPlace {
            order_id,
            side,
            price,
            qty,
            slot_id,
            dispatched_at: now,
        });
    }

    pub fn record_cancel(&mut self, order_id: &str, now: DateTime<Utc>) {
        self.cancels.insert(order_id.to_string(), now);
    }

    pub fn is_cancel_pending(&self, order_id: &str) -> bool {
        self.cancels.contains_key(order_id)
    }

    pub fn places(&self) -> &[InFlightPlace] {
        &self.places
    }

    pub fn is_empty(&self) -> bool {
        self.places.is_empty() && self.cancels.is_empty()
    }

    /// Drop a known-id place confirmed by a fill rather than by the book.
    pub fn resolve_filled(&mut self, order_id: &str) -> bool {
        let before = self.places.len();
        self.places
            .retain(|p| p.order_id.as_deref() != Some(order_id));
        before != self.places.len()
    }

    pub fn clear(&mut self) {
        self.places.clear();
        self.cancels.clear();
    }

    /// Quantity dispatched at `price` on `side` but not yet visible on the book.
    pub fn qty_at(&self, side: Side, price: Decimal) -> Decimal {
        self.places
            .iter()
            .filter(|p| p.side == side && price_matches(p.price, price, self.tolerance))
            .map(|p| p.qty)
            .sum()
    }

    /// Resolve entries against a fresh open-order snapshot.
    ///
    /// A known-id place resolves once its id shows up on the book; from then on it is
    /// counted as open. Unknown-id places are matched to an unclaimed resting order of
    /// the same shape. Anything still unseen after the ttl expires.
    pub fn sweep(&mut self, open_orders: &[OpenOrder], now: DateTime<Utc>) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let mut claimed: HashSet<&str> = open_orders
            .iter()
            .filter(|o| {
                self.places
                    .iter()
                    .any(|p| p.order_id.as_deref() == Some(o.id.as_str()))
            })
            .map(|o| o.id.as_str())
            .collect();

        let ttl = self.ttl;
        let tolerance = self.tolerance;
        let mut kept = Vec::with_capacity(self.places.len());
        for place in self.places.drain(..) {
            if let Some(order_id) = place.order_id.as_deref() {
                if claimed.contains(order_id) {
                    summary.confirmed += 1;
                } else if now - place.dispatched_at > ttl {
                    debug!(order_id = %order_id, "in-flight place never seen resting, dropped");
                    summary.expired += 1;
                } else {
                    kept.push(place);
                }
                continue;
            }
            let matched = open_orders.iter().find(|o| {
                o.side == place.side
                    && price_matches(o.price, place.price, tolerance)
                    && o.qty == place.qty
                    && o.created_at + CLOCK_SLACK >= place.dispatched_at
                    && !claimed.contains(o.id.as_str())
            });
            if let Some(order) = matched {
                debug!(order_id = %order.id, price = %place.price, "unknown-outcome place found on book");
                claimed.insert(order.id.as_str());
                summary.confirmed += 1;
            } else if now - place.dispatched_at > ttl {
                warn!(
                    side = %place.side,
                    price = %place.price,
                    qty = %place.qty,
                    "unknown-outcome place expired without appearing on book"
                );
                summary.expired += 1;
            } else {
                kept.push(place);
            }
        }
        self.places = kept;

        let before = self.cancels.len();
        self.cancels.retain(|order_id, sent_at| {
            let resting = open_orders.iter().any(|o| &o.id == order_id);
            resting && now - *sent_at <= ttl
        });
        summary.cancels_confirmed = before - self.cancels.len();
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygrid_exchange::OrderStatus;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn book() -> InFlightBook {
        InFlightBook::new(Duration::from_secs(10), dec("0.0001"))
    }

    fn open(id: &str, side: Side, price: &str, qty: &str, created_at: DateTime<Utc>) -> OpenOrder {
        OpenOrder {
            id: id.to_string(),
            side,
            price: dec(price),
            qty: dec(qty),
            filled_qty: Decimal::ZERO,
            status: OrderStatus::Open,
            created_at,
        }
    }

    #[test]
    fn known_place_resolves_on_next_snapshot() {
        let mut inflight = book();
        let now = Utc::now();
        inflight.record_place(Some("o1".into()), Side::Sell, dec("95000"), dec("0.0007"), SlotId(1), now);
        assert_eq!(inflight.qty_at(Side::Sell, dec("95000")), dec("0.0007"));

        let summary = inflight.sweep(&[open("o1", Side::Sell, "95000", "0.0007", now)], now);
        assert_eq!(summary.confirmed, 1);
        assert_eq!(inflight.qty_at(Side::Sell, dec("95000")), Decimal::ZERO);
    }

    #[test]
    fn known_place_not_yet_visible_keeps_counting() {
        let mut inflight = book();
        let now = Utc::now();
        inflight.record_place(Some("o1".into()), Side::Buy, dec("94000"), dec("0.001"), SlotId(2), now);

        inflight.sweep(&[], now + TimeDelta::seconds(1));
        assert_eq!(inflight.qty_at(Side::Buy, dec("94000")), dec("0.001"));

        let summary = inflight.sweep(&[], now + TimeDelta::seconds(11));
        assert_eq!(summary.expired, 1);
        assert!(inflight.is_empty());
    }

    #[test]
    fn unknown_place_is_matched_to_resting_order() {
        let mut inflight = book();
        let now = Utc::now();
        inflight.record_place(None, Side::Buy, dec("94000"), dec("0.001"), SlotId(2), now);

        let summary = inflight.sweep(&[open("o9", Side::Buy, "94000", "0.001", now)], now);
        assert_eq!(summary.confirmed, 1);
        assert!(inflight.places().is_empty());
    }

    #[test]
    fn unknown_place_stays_until_ttl() {
        let mut inflight = book();
        let now = Utc::now();
        inflight.record_place(None, Side::Buy, dec("94000"), dec("0.001"), SlotId(2), now);

        inflight.sweep(&[], now + TimeDelta::seconds(5));
        assert_eq!(inflight.qty_at(Side::Buy, dec("94000")), dec("0.001"));

        let summary = inflight.sweep(&[], now + TimeDelta::seconds(11));
        assert_eq!(summary.expired, 1);
        assert!(inflight.is_empty());
    }

    #[test]
    fn pending_cancel_clears_once_order_leaves_book() {
        let mut inflight = book();
        let now = Utc::now();
        inflight.record_cancel("o1", now);
        let resting = open("o1", Side::Buy, "94000", "0.001", now);

        inflight.sweep(std::slice::from_ref(&resting), now);
        assert!(inflight.is_cancel_pending("o1"));

        let summary = inflight.sweep(&[], now);
        assert_eq!(summary.cancels_confirmed, 1);
        assert!(!inflight.is_cancel_pending("o1"));
    }
}
