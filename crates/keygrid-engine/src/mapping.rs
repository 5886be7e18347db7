/*
[INPUT]:  Slot store (active slots, retired slots still holding fills)
[OUTPUT]: Adjacency map buy slot -> sell slot and the list of slots without a target
[POS]:    Mapping layer - take-profit target derivation
[UPDATE]: When profit margin rules or target eligibility change
*/

use std::collections::BTreeMap;

use keygrid_exchange::Side;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::slot::{Slot, SlotId};
use crate::store::SlotStore;

/// owner slot -> sell target slot
pub type AdjacencyMap = BTreeMap<SlotId, SlotId>;

#[derive(Debug, Clone, PartialEq)]
pub struct UnmappedSlot {
    pub slot_id: SlotId,
    pub price: Decimal,
    pub fill_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingReport {
    pub adjacency: AdjacencyMap,
    pub unmapped: Vec<UnmappedSlot>,
}

impl MappingReport {
    /// True when some buy-side slot has no slot above it to sell into.
    pub fn has_boundary_gap(&self) -> bool {
        !self.unmapped.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct MappingBuilder {
    min_profit_pct: Decimal,
}

impl MappingBuilder {
    pub fn new(min_profit_pct: Decimal) -> Self {
        Self { min_profit_pct }
    }

    pub fn build(&self, store: &SlotStore) -> MappingReport {
        let targets = target_candidates(store);
        let mut report = MappingReport::default();

        for source in store.all_slots().filter(|s| is_source(s)) {
            match self.first_above(&targets, source.price()) {
                Some(target) => {
                    debug!(
                        owner = %source.id(),
                        owner_price = %source.price(),
                        target = %target.id(),
                        target_price = %target.price(),
                        "adjacency"
                    );
                    report.adjacency.insert(source.id(), target.id());
                }
                None => report.unmapped.push(UnmappedSlot {
                    slot_id: source.id(),
                    price: source.price(),
                    fill_count: source.fill_count(),
                }),
            }
        }

        if report.has_boundary_gap() {
            let prices: Vec<String> = report.unmapped.iter().map(|u| u.price.to_string()).collect();
            warn!(prices = ?prices, "slots without an upward sell target");
        }
        info!(
            mapped = report.adjacency.len(),
            unmapped = report.unmapped.len(),
            "adjacency map rebuilt"
        );
        report
    }

    /// Target for a single slot, identical to what `build` would assign.
    pub fn target_for(&self, store: &SlotStore, owner: SlotId) -> Option<SlotId> {
        let source = store.slot(owner)?;
        let targets = target_candidates(store);
        self.first_above(&targets, source.price()).map(|t| t.id())
    }

    fn first_above<'a>(&self, ascending: &[&'a Slot], price: Decimal) -> Option<&'a Slot> {
        let threshold = price * (Decimal::ONE + self.min_profit_pct);
        ascending.iter().find(|t| t.price() > threshold).copied()
    }
}

fn is_source(slot: &Slot) -> bool {
    slot.fill_count() > 0 || (slot.is_active() && slot.direction() == Side::Buy)
}

/// Active slots plus retired slots that still carry fills, price ascending.
fn target_candidates(store: &SlotStore) -> Vec<&Slot> {
    let mut targets: Vec<&Slot> = store
        .all_slots()
        .filter(|s| s.is_active() || s.fill_count() > 0)
        .collect();
    targets.sort_by(|a, b| a.price().cmp(&b.price()));
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreParts;
    use chrono::Utc;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn store(prices: &[(&str, Side)]) -> SlotStore {
        let slots = prices
            .iter()
            .enumerate()
            .map(|(i, (p, side))| Slot::new(SlotId(i as u64 + 1), dec(p), *side))
            .collect();
        SlotStore::from_parts(
            StoreParts {
                slots,
                ..StoreParts::default()
            },
            dec("0.0001"),
        )
        .expect("store")
    }

    #[test]
    fn filled_slot_maps_to_next_slot_above_margin() {
        let mut store = store(&[
            ("95000", Side::Sell),
            ("94500", Side::Buy),
            ("94000", Side::Buy),
        ]);
        store
            .record_buy(SlotId(2), "b1", dec("94500"), dec("0.001"), Utc::now())
            .expect("record");

        let report = MappingBuilder::new(dec("0.005")).build(&store);
        assert_eq!(report.adjacency.get(&SlotId(2)), Some(&SlotId(1)));
        assert_eq!(report.adjacency.get(&SlotId(3)), Some(&SlotId(2)));
        assert!(!report.adjacency.contains_key(&SlotId(1)));
        assert!(!report.has_boundary_gap());
    }

    #[test]
    fn margin_skips_slots_too_close() {
        let store = store(&[
            ("95000", Side::Sell),
            ("94100", Side::Sell),
            ("94000", Side::Buy),
        ]);
        // 94000 * 1.005 = 94470, so 94100 is skipped
        let report = MappingBuilder::new(dec("0.005")).build(&store);
        assert_eq!(report.adjacency.get(&SlotId(3)), Some(&SlotId(1)));
    }

    #[test]
    fn highest_filled_slot_without_target_is_reported() {
        let mut store = store(&[("95000", Side::Buy), ("94000", Side::Buy)]);
        store
            .record_buy(SlotId(1), "b1", dec("95000"), dec("0.001"), Utc::now())
            .expect("record");

        let report = MappingBuilder::new(dec("0.005")).build(&store);
        assert!(report.has_boundary_gap());
        assert_eq!(report.unmapped[0].slot_id, SlotId(1));
        assert_eq!(report.unmapped[0].fill_count, 1);
        assert_eq!(report.adjacency.get(&SlotId(2)), Some(&SlotId(1)));
    }

    #[test]
    fn single_target_lookup_matches_full_build() {
        let store = store(&[
            ("96000", Side::Sell),
            ("95000", Side::Buy),
            ("94000", Side::Buy),
        ]);
        let builder = MappingBuilder::new(dec("0.005"));
        let report = builder.build(&store);
        for (owner, target) in &report.adjacency {
            assert_eq!(builder.target_for(&store, *owner), Some(*target));
        }
    }
}
