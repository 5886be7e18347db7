/*
[INPUT]:  Slot lists from migrations, fills from both pathways, exchange holdings
[OUTPUT]: Ordered slot collection, inventory ledger and destroy-safety checks
[POS]:    State layer - single choke point for slot and inventory mutation
[UPDATE]: When slot ordering rules, inventory attribution or destroy guards change
*/

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use keygrid_exchange::{OpenOrder, Side, Trade};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{GridError, Result};
use crate::mapping::AdjacencyMap;
use crate::precision::price_matches;
use crate::slot::{LifecycleAction, Slot, SlotId};
use crate::trade_store::TradeRecord;

const SETTLED_HISTORY_LIMIT: usize = 10;

/// One unclosed buy owned by a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub order_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    pub owner_slot_id: SlotId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub target_sell_slot_id: Option<SlotId>,
    #[serde(default)]
    pub sell_order_id: Option<String>,
    #[serde(default, with = "rust_decimal::serde::str")]
    pub sell_qty: Decimal,
}

impl InventoryRecord {
    /// A record holds a fill unit once its bought qty rounds to at least one unit.
    /// With no unit configured every record counts.
    pub fn is_full_unit(&self, unit: Decimal) -> bool {
        unit <= Decimal::ZERO || units_of(self.qty, unit) >= 1
    }
}

/// Cumulative progress of one sell order across partial fills.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SellFill {
    #[serde(with = "rust_decimal::serde::str")]
    pub filled: Decimal,
    pub released: u32,
}

/// `round(qty / unit)` with halves rounded up.
pub fn units_of(qty: Decimal, unit: Decimal) -> u32 {
    if unit <= Decimal::ZERO || qty <= Decimal::ZERO {
        return 0;
    }
    (qty / unit)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u32()
        .unwrap_or(u32::MAX)
}

/// Reason a retired slot must stay retired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyBlock {
    Filled { fill_count: u32 },
    LiveOrder { order_id: String, price: Decimal },
    MappedTarget { owner: SlotId },
}

impl fmt::Display for DestroyBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestroyBlock::Filled { fill_count } => {
                write!(f, "fill_count={fill_count}, unclosed inventory")
            }
            DestroyBlock::LiveOrder { order_id, price } => {
                write!(f, "live order {order_id} @ {price}")
            }
            DestroyBlock::MappedTarget { owner } => {
                write!(f, "still the sell target of {owner}")
            }
        }
    }
}

/// Destroy guard: zero fills, no live order at the price, no adjacency entry targeting it.
pub fn can_destroy(
    slot: &Slot,
    live_orders: &[OpenOrder],
    adjacency: &AdjacencyMap,
    tolerance: Decimal,
) -> std::result::Result<(), DestroyBlock> {
    if slot.fill_count() > 0 {
        return Err(DestroyBlock::Filled {
            fill_count: slot.fill_count(),
        });
    }
    if let Some(order) = live_orders
        .iter()
        .find(|o| price_matches(o.price, slot.price(), tolerance))
    {
        return Err(DestroyBlock::LiveOrder {
            order_id: order.id.clone(),
            price: order.price,
        });
    }
    if let Some((owner, _)) = adjacency.iter().find(|(_, target)| **target == slot.id()) {
        return Err(DestroyBlock::MappedTarget { owner: *owner });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryAction {
    Cleared,
    Padded,
    Trimmed,
}

/// Outcome of aligning the inventory ledger with exchange holdings.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryAdjustment {
    pub action: InventoryAction,
    pub expected: usize,
    pub before: usize,
    pub after: usize,
}

impl fmt::Display for InventoryAdjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: before={}, after={}, expected={}",
            self.action, self.before, self.after, self.expected
        )
    }
}

/// Serializable store contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreParts {
    pub slots: Vec<Slot>,
    pub retired_slots: Vec<Slot>,
    pub inventory: Vec<InventoryRecord>,
    #[serde(default)]
    pub settled_inventory: Vec<InventoryRecord>,
    #[serde(default)]
    pub adjacency: AdjacencyMap,
    #[serde(default)]
    pub next_slot_id: u64,
    /// Partially filled sell orders, keyed by order id.
    #[serde(default)]
    pub sell_fills: BTreeMap<String, SellFill>,
}

/// Owner of the slot collection and the inventory ledger.
#[derive(Debug, Clone)]
pub struct SlotStore {
    slots: Vec<Slot>,
    retired: Vec<Slot>,
    inventory: Vec<InventoryRecord>,
    settled: Vec<InventoryRecord>,
    adjacency: AdjacencyMap,
    sell_fills: BTreeMap<String, SellFill>,
    next_slot_id: u64,
    tolerance: Decimal,
    unit: Decimal,
}

impl SlotStore {
    pub fn new(tolerance: Decimal) -> Self {
        Self {
            slots: Vec::new(),
            retired: Vec::new(),
            inventory: Vec::new(),
            settled: Vec::new(),
            adjacency: AdjacencyMap::new(),
            sell_fills: BTreeMap::new(),
            next_slot_id: 1,
            tolerance,
            unit: Decimal::ZERO,
        }
    }

    pub fn from_parts(parts: StoreParts, tolerance: Decimal) -> Result<Self> {
        let max_id = parts
            .slots
            .iter()
            .chain(parts.retired_slots.iter())
            .map(|s| s.id().0)
            .max()
            .unwrap_or(0);
        let mut store = Self {
            slots: parts.slots,
            retired: parts.retired_slots,
            inventory: parts.inventory,
            settled: parts.settled_inventory,
            adjacency: parts.adjacency,
            sell_fills: parts.sell_fills,
            next_slot_id: parts.next_slot_id.max(max_id + 1),
            tolerance,
            unit: Decimal::ZERO,
        };
        store.sort_descending();
        store.ensure_valid()?;
        store.refresh_fill_counts();
        Ok(store)
    }

    pub fn to_parts(&self) -> StoreParts {
        StoreParts {
            slots: self.slots.clone(),
            retired_slots: self.retired.clone(),
            inventory: self.inventory.clone(),
            settled_inventory: self.settled.clone(),
            adjacency: self.adjacency.clone(),
            next_slot_id: self.next_slot_id,
            sell_fills: self.sell_fills.clone(),
        }
    }

    pub fn tolerance(&self) -> Decimal {
        self.tolerance
    }

    /// Base qty of one fill. Buy records below half a unit do not count as fills.
    pub fn set_unit(&mut self, unit: Decimal) {
        self.unit = unit;
        self.refresh_fill_counts();
    }

    pub fn unit(&self) -> Decimal {
        self.unit
    }

    /// Bought qty of records owned by `slot_id` that have not reached a unit.
    pub fn partial_buy_qty(&self, slot_id: SlotId) -> Decimal {
        self.inventory
            .iter()
            .filter(|r| r.owner_slot_id == slot_id && !r.is_full_unit(self.unit))
            .map(|r| r.qty)
            .sum()
    }

    pub fn sell_fills(&self) -> &BTreeMap<String, SellFill> {
        &self.sell_fills
    }

    /// Active slots, price descending.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Retired slots, price descending.
    pub fn retired(&self) -> &[Slot] {
        &self.retired
    }

    pub fn all_slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter().chain(self.retired.iter())
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.all_slots().find(|s| s.id() == id)
    }

    fn slot_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.slots
            .iter_mut()
            .chain(self.retired.iter_mut())
            .find(|s| s.id() == id)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.retired.is_empty()
    }

    pub fn next_slot_id(&self) -> SlotId {
        SlotId(self.next_slot_id)
    }

    pub fn sort_descending(&mut self) {
        self.slots.sort_by(|a, b| b.price().cmp(&a.price()));
        self.retired.sort_by(|a, b| b.price().cmp(&a.price()));
    }

    /// True when active slots and the merged active+retired collection are strictly descending.
    pub fn validate_order(&self) -> bool {
        validate_candidate(&self.slots, &self.retired, self.tolerance).is_ok()
    }

    pub fn ensure_valid(&self) -> Result<()> {
        validate_candidate(&self.slots, &self.retired, self.tolerance)
    }

    /// Validate a migration outcome against the retired slots it would live alongside.
    pub fn check_candidate(&self, active: &[Slot], newly_retired: &[Slot]) -> Result<()> {
        let mut retired: Vec<Slot> = self
            .retired
            .iter()
            .filter(|r| {
                !active.iter().any(|a| a.id() == r.id())
                    && !newly_retired.iter().any(|n| n.id() == r.id())
            })
            .cloned()
            .collect();
        retired.extend(newly_retired.iter().cloned());
        retired.sort_by(|a, b| b.price().cmp(&a.price()));
        validate_candidate(active, &retired, self.tolerance)
    }

    /// Replace the active set after a completed migration.
    pub fn commit_migration(&mut self, active: Vec<Slot>, newly_retired: Vec<Slot>) -> Result<()> {
        self.check_candidate(&active, &newly_retired)?;

        let max_id = active
            .iter()
            .chain(newly_retired.iter())
            .map(|s| s.id().0)
            .max()
            .unwrap_or(0);
        self.next_slot_id = self.next_slot_id.max(max_id + 1);
        for slot in newly_retired {
            if !self.retired.iter().any(|r| r.id() == slot.id()) {
                self.retired.push(slot);
            }
        }
        self.slots = active;
        self.sort_descending();
        self.refresh_fill_counts();
        info!(
            active = self.slots.len(),
            retired = self.retired.len(),
            "slot store committed migration"
        );
        Ok(())
    }

    pub fn find_slot_by_price(&self, price: Decimal) -> Option<&Slot> {
        self.all_slots()
            .find(|s| price_matches(price, s.price(), self.tolerance))
    }

    pub fn slot_for_order(&self, order_id: &str) -> Option<SlotId> {
        self.all_slots()
            .find(|s| s.active_order_id() == Some(order_id))
            .map(|s| s.id())
    }

    pub fn attach_order(&mut self, slot_id: SlotId, order_id: String, qty: Decimal) -> Result<()> {
        let slot = self
            .slot_mut(slot_id)
            .ok_or(GridError::UnknownSlot(slot_id))?;
        slot.attach_order(order_id, qty);
        Ok(())
    }

    pub fn clear_order(&mut self, order_id: &str) {
        for slot in self.slots.iter_mut().chain(self.retired.iter_mut()) {
            if slot.active_order_id() == Some(order_id) {
                slot.clear_order();
            }
        }
    }

    /// Drop order ids the venue no longer shows and adopt resting orders on the
    /// slot's own side for slots that have none.
    pub fn sync_active_orders(&mut self, open_orders: &[OpenOrder]) {
        let tolerance = self.tolerance;
        let mut claimed: HashSet<&str> = HashSet::new();
        for slot in self.slots.iter_mut().chain(self.retired.iter_mut()) {
            let Some(id) = slot.active_order_id() else {
                continue;
            };
            if let Some(order) = open_orders.iter().find(|o| o.id == id) {
                claimed.insert(order.id.as_str());
                continue;
            }
            debug!(slot_id = %slot.id(), order_id = %id, "active order gone from venue");
            slot.clear_order();
        }
        for slot in self.slots.iter_mut() {
            if slot.active_order_id().is_some() {
                continue;
            }
            if let Some(order) = open_orders.iter().find(|o| {
                o.side == slot.direction()
                    && price_matches(o.price, slot.price(), tolerance)
                    && !claimed.contains(o.id.as_str())
            }) {
                claimed.insert(order.id.as_str());
                slot.attach_order(order.id.clone(), order.remaining_qty());
            }
        }
    }

    pub(crate) fn set_target_qty(&mut self, slot_id: SlotId, qty: Decimal) {
        if let Some(slot) = self.slot_mut(slot_id) {
            slot.set_target_qty(qty);
        }
    }

    pub fn adjacency(&self) -> &AdjacencyMap {
        &self.adjacency
    }

    pub fn target_of(&self, owner: SlotId) -> Option<SlotId> {
        self.adjacency.get(&owner).copied()
    }

    pub fn set_adjacency(&mut self, adjacency: AdjacencyMap) {
        for record in &mut self.inventory {
            record.target_sell_slot_id = adjacency.get(&record.owner_slot_id).copied();
        }
        self.adjacency = adjacency;
    }

    pub(crate) fn insert_adjacency(&mut self, owner: SlotId, target: SlotId) {
        self.adjacency.insert(owner, target);
        for record in &mut self.inventory {
            if record.owner_slot_id == owner {
                record.target_sell_slot_id = Some(target);
            }
        }
    }

    pub fn inventory(&self) -> &[InventoryRecord] {
        &self.inventory
    }

    pub fn settled(&self) -> &[InventoryRecord] {
        &self.settled
    }

    pub fn total_fill_count(&self) -> u32 {
        self.all_slots().map(|s| s.fill_count()).sum()
    }

    /// Record a buy fill, merging partial fills of the same order.
    ///
    /// Returns true when this fill completes a unit, i.e. the record starts
    /// counting toward the owner's fill count.
    pub fn record_buy(
        &mut self,
        owner: SlotId,
        order_id: &str,
        price: Decimal,
        qty: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        if self.slot(owner).is_none() {
            return Err(GridError::UnknownSlot(owner));
        }
        let unit = self.unit;
        if let Some(existing) = self.inventory.iter_mut().find(|r| r.order_id == order_id) {
            let counted = existing.is_full_unit(unit);
            existing.qty += qty;
            debug!(order_id = %order_id, qty = %existing.qty, "partial buy merged into inventory");
            if counted || !existing.is_full_unit(unit) {
                return Ok(false);
            }
            self.clear_order(order_id);
            self.refresh_fill_counts();
            return Ok(true);
        }
        let record = InventoryRecord {
            order_id: order_id.to_string(),
            price,
            qty,
            owner_slot_id: owner,
            timestamp,
            target_sell_slot_id: self.adjacency.get(&owner).copied(),
            sell_order_id: None,
            sell_qty: Decimal::ZERO,
        };
        let counted = record.is_full_unit(unit);
        self.inventory.push(record);
        if !counted {
            debug!(order_id = %order_id, qty = %qty, "buy below one unit held as partial");
            return Ok(false);
        }
        self.clear_order(order_id);
        self.refresh_fill_counts();
        Ok(true)
    }

    /// Attach a resting sell to the oldest unlinked record that maps onto `target`.
    pub fn link_sell(&mut self, target: SlotId, order_id: &str, qty: Decimal) {
        if let Some(record) = self
            .inventory
            .iter_mut()
            .find(|r| {
                r.target_sell_slot_id == Some(target)
                    && r.sell_order_id.is_none()
                    && r.is_full_unit(self.unit)
            })
        {
            record.sell_order_id = Some(order_id.to_string());
            record.sell_qty = qty;
        }
    }

    /// Apply one sell fill slice and release the records it closes.
    ///
    /// Filled qty accumulates per order. Records are released as
    /// `round(filled / per_unit)` rises, and every linked record is released
    /// once the order's linked qty is fully filled.
    pub fn apply_sell_fill(
        &mut self,
        order_id: &str,
        price: Decimal,
        qty: Decimal,
        per_unit: Decimal,
    ) -> Vec<InventoryRecord> {
        let linked: Vec<Decimal> = self
            .inventory
            .iter()
            .filter(|r| r.sell_order_id.as_deref() == Some(order_id))
            .map(|r| r.sell_qty)
            .collect();
        let linked_qty: Decimal = linked.iter().copied().sum();

        let mut progress = self.sell_fills.remove(order_id).unwrap_or_default();
        progress.filled += qty;
        let mut closes = if per_unit > Decimal::ZERO {
            units_of(progress.filled, per_unit)
        } else {
            progress.released + 1
        };
        let fully_filled = linked_qty > Decimal::ZERO && progress.filled >= linked_qty;
        if fully_filled {
            closes = closes.max(progress.released + linked.len() as u32);
        }

        let count = closes.saturating_sub(progress.released) as usize;
        let released = self.release_for_sell(order_id, price, count);
        progress.released += released.len() as u32;
        debug!(
            order_id = %order_id,
            filled = %progress.filled,
            released = released.len(),
            "sell fill applied"
        );
        if !fully_filled {
            self.sell_fills.insert(order_id.to_string(), progress);
        }
        released
    }

    /// Forget fill progress of sell orders no longer on the book.
    pub fn prune_sell_fills(&mut self, open_orders: &[OpenOrder]) {
        self.sell_fills
            .retain(|order_id, _| open_orders.iter().any(|o| o.id == *order_id));
    }

    /// Release up to `count` full-unit records for a sell fill, oldest first.
    ///
    /// Preference: records linked to the sell order, then records whose target slot
    /// sits at the fill price, then the oldest record overall.
    fn release_for_sell(
        &mut self,
        order_id: &str,
        price: Decimal,
        count: usize,
    ) -> Vec<InventoryRecord> {
        let mut released = Vec::new();
        for _ in 0..count {
            let tolerance = self.tolerance;
            let unit = self.unit;
            let target_matches = |record: &InventoryRecord| {
                record
                    .target_sell_slot_id
                    .and_then(|id| self.slot(id))
                    .is_some_and(|slot| price_matches(price, slot.price(), tolerance))
            };
            let index = self
                .inventory
                .iter()
                .position(|r| r.sell_order_id.as_deref() == Some(order_id))
                .or_else(|| {
                    self.inventory
                        .iter()
                        .position(|r| r.is_full_unit(unit) && target_matches(r))
                })
                .or_else(|| self.inventory.iter().position(|r| r.is_full_unit(unit)));
            let Some(index) = index else {
                break;
            };
            let record = self.inventory.remove(index);
            self.settled.insert(0, record.clone());
            released.push(record);
        }
        self.settled.truncate(SETTLED_HISTORY_LIMIT);
        if !released.is_empty() {
            self.refresh_fill_counts();
        }
        released
    }

    pub fn clear_inventory(&mut self, reason: &str) {
        let cleared = self.inventory.len();
        self.inventory.clear();
        self.settled.clear();
        self.sell_fills.clear();
        self.refresh_fill_counts();
        info!(cleared, reason = %reason, "fill counters and inventory cleared");
    }

    /// Align the inventory record count with `round(holdings / unit)`.
    pub fn reconcile_holdings(
        &mut self,
        holdings: Decimal,
        unit: Decimal,
        max_fill_per_slot: u32,
        exchange_trades: &[Trade],
        ledger: &[TradeRecord],
    ) -> Option<InventoryAdjustment> {
        if unit <= Decimal::ZERO {
            return None;
        }
        let holdings = if holdings > Decimal::ZERO {
            holdings
        } else {
            Decimal::ZERO
        };
        let expected = (holdings / unit).round().to_usize().unwrap_or(0);
        let before = self.full_units(unit);

        if holdings.is_zero() {
            if self.inventory.is_empty() {
                return None;
            }
            self.clear_inventory("zero exchange holdings");
            return Some(InventoryAdjustment {
                action: InventoryAction::Cleared,
                expected: 0,
                before,
                after: 0,
            });
        }
        if before == expected {
            return None;
        }

        let action = if before < expected {
            self.pad_inventory(expected - before, unit, max_fill_per_slot, exchange_trades, ledger);
            InventoryAction::Padded
        } else {
            // Oldest full-unit records go first; partial buys stay.
            let mut excess = before - expected;
            self.inventory.retain(|r| {
                if excess > 0 && r.is_full_unit(unit) {
                    excess -= 1;
                    return false;
                }
                true
            });
            InventoryAction::Trimmed
        };
        self.refresh_fill_counts();

        let adjustment = InventoryAdjustment {
            action,
            expected,
            before,
            after: self.full_units(unit),
        };
        info!(%adjustment, holdings = %holdings, "inventory reconciled with holdings");
        Some(adjustment)
    }

    fn pad_inventory(
        &mut self,
        mut missing: usize,
        unit: Decimal,
        max_fill_per_slot: u32,
        exchange_trades: &[Trade],
        ledger: &[TradeRecord],
    ) {
        let mut known: HashSet<String> = self
            .inventory
            .iter()
            .chain(self.settled.iter())
            .map(|r| r.order_id.clone())
            .collect();
        let mut owned = self.owned_counts();

        let candidates = exchange_trades
            .iter()
            .filter(|t| t.side == Side::Buy)
            .map(|t| (t.order_id.clone(), t.price, t.qty, t.timestamp))
            .chain(
                ledger
                    .iter()
                    .filter(|r| r.side == Side::Buy)
                    .map(|r| (r.order_id.clone(), r.price, r.qty, r.timestamp)),
            );

        for (order_id, price, qty, timestamp) in candidates {
            if missing == 0 {
                break;
            }
            if known.contains(&order_id) {
                continue;
            }
            let Some(owner) = self.find_slot_by_price(price).map(|s| s.id()) else {
                continue;
            };
            let count = owned.entry(owner).or_insert(0);
            if *count >= max_fill_per_slot {
                continue;
            }
            *count += 1;
            known.insert(order_id.clone());
            self.inventory.push(InventoryRecord {
                order_id,
                price,
                qty,
                owner_slot_id: owner,
                timestamp,
                target_sell_slot_id: self.adjacency.get(&owner).copied(),
                sell_order_id: None,
                sell_qty: Decimal::ZERO,
            });
            missing -= 1;
        }

        // Fallback: attribute to the highest buy slots with spare capacity.
        let buy_slots: Vec<(SlotId, Decimal)> = self
            .slots
            .iter()
            .filter(|s| s.direction() == Side::Buy)
            .map(|s| (s.id(), s.price()))
            .collect();
        for (owner, price) in buy_slots {
            while missing > 0 {
                let count = owned.entry(owner).or_insert(0);
                if *count >= max_fill_per_slot {
                    break;
                }
                *count += 1;
                let record = self.synthetic_record(owner, price, unit);
                self.inventory.push(record);
                missing -= 1;
            }
        }

        if missing > 0 {
            match self.slots.first().map(|s| (s.id(), s.price())) {
                Some((owner, price)) => {
                    warn!(missing, owner = %owner, "no spare buy capacity; over-assigning holdings");
                    for _ in 0..missing {
                        let record = self.synthetic_record(owner, price, unit);
                        self.inventory.push(record);
                    }
                }
                None => warn!(missing, "no slots available to attribute holdings"),
            }
        }

        self.inventory.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }

    fn synthetic_record(&self, owner: SlotId, price: Decimal, unit: Decimal) -> InventoryRecord {
        InventoryRecord {
            order_id: format!("recon-{}", uuid::Uuid::new_v4()),
            price,
            qty: unit,
            owner_slot_id: owner,
            timestamp: Utc::now(),
            target_sell_slot_id: self.adjacency.get(&owner).copied(),
            sell_order_id: None,
            sell_qty: Decimal::ZERO,
        }
    }

    /// Remove a retired slot permanently. Refused unless the destroy guard passes.
    pub fn destroy(&mut self, slot_id: SlotId, live_orders: &[OpenOrder]) -> Result<Slot> {
        let index = self
            .retired
            .iter()
            .position(|s| s.id() == slot_id)
            .ok_or(GridError::UnknownSlot(slot_id))?;
        if let Err(block) = can_destroy(&self.retired[index], live_orders, &self.adjacency, self.tolerance)
        {
            return Err(GridError::DestroyRefused {
                slot_id,
                reason: block.to_string(),
            });
        }
        let mut slot = self.retired.remove(index);
        slot.transition(LifecycleAction::Destroy)?;
        self.adjacency.remove(&slot_id);
        info!(slot_id = %slot_id, price = %slot.price(), "retired slot destroyed");
        Ok(slot)
    }

    /// Move every retired slot that passes the destroy guard to DEAD.
    pub fn sweep_retired(&mut self, live_orders: &[OpenOrder]) -> Vec<Slot> {
        let ids: Vec<SlotId> = self.retired.iter().map(|s| s.id()).collect();
        let mut destroyed = Vec::new();
        for id in ids {
            match self.destroy(id, live_orders) {
                Ok(slot) => destroyed.push(slot),
                Err(err) => debug!(slot_id = %id, error = %err, "retired slot kept"),
            }
        }
        destroyed
    }

    fn full_units(&self, unit: Decimal) -> usize {
        self.inventory.iter().filter(|r| r.is_full_unit(unit)).count()
    }

    fn owned_counts(&self) -> HashMap<SlotId, u32> {
        let mut counts = HashMap::new();
        for record in self.inventory.iter().filter(|r| r.is_full_unit(self.unit)) {
            *counts.entry(record.owner_slot_id).or_insert(0) += 1;
        }
        counts
    }

    /// Fill counts are derived from inventory ownership.
    fn refresh_fill_counts(&mut self) {
        let counts = self.owned_counts();
        for slot in self.slots.iter_mut().chain(self.retired.iter_mut()) {
            slot.set_fill_count(counts.get(&slot.id()).copied().unwrap_or(0));
        }
        let orphaned: usize = counts
            .iter()
            .filter(|(id, _)| !self.slots.iter().chain(self.retired.iter()).any(|s| s.id() == **id))
            .map(|(_, count)| *count as usize)
            .sum();
        if orphaned > 0 {
            warn!(orphaned, "inventory records reference unknown slots");
        }
    }
}

fn validate_candidate(active: &[Slot], retired: &[Slot], tolerance: Decimal) -> Result<()> {
    for pair in active.windows(2) {
        if pair[0].price() <= pair[1].price() || price_matches(pair[1].price(), pair[0].price(), tolerance) {
            return Err(GridError::InvariantViolation(format!(
                "slot prices not strictly descending: {} then {}",
                pair[0].price(),
                pair[1].price()
            )));
        }
    }

    let mut merged: Vec<&Slot> = active.iter().chain(retired.iter()).collect();
    merged.sort_by(|a, b| b.price().cmp(&a.price()));
    for pair in merged.windows(2) {
        if price_matches(pair[1].price(), pair[0].price(), tolerance) {
            return Err(GridError::InvariantViolation(format!(
                "slots {} and {} share price {}",
                pair[0].id(),
                pair[1].id(),
                pair[0].price()
            )));
        }
    }

    let mut ids = HashSet::new();
    for slot in &merged {
        if !ids.insert(slot.id()) {
            return Err(GridError::InvariantViolation(format!(
                "duplicate slot id {}",
                slot.id()
            )));
        }
    }
    Ok(())
}
