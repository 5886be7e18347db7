/*
[INPUT]:  Slot creation requests and lifecycle actions
[OUTPUT]: Slot records with validated ACTIVE/RETIRED/DEAD transitions
[POS]:    Domain layer - slot type and lifecycle state machine
[UPDATE]: When lifecycle states, transitions or slot fields change
*/

use std::fmt;

use keygrid_exchange::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::GridError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Active,
    Retired,
    Dead,
}

/// Actions that can trigger lifecycle transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Retire,
    Destroy,
}

/// One price level of the grid.
///
/// Fields are only written through crate-internal operations so the slot store
/// stays the single place where ordering is enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    id: SlotId,
    #[serde(with = "rust_decimal::serde::str")]
    price: Decimal,
    direction: Side,
    state: LifecycleState,
    fill_count: u32,
    #[serde(default)]
    active_order_id: Option<String>,
    #[serde(default, with = "rust_decimal::serde::str")]
    target_qty: Decimal,
}

impl Slot {
    pub fn new(id: SlotId, price: Decimal, direction: Side) -> Self {
        Self {
            id,
            price,
            direction,
            state: LifecycleState::Active,
            fill_count: 0,
            active_order_id: None,
            target_qty: Decimal::ZERO,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    pub fn direction(&self) -> Side {
        self.direction
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == LifecycleState::Active
    }

    pub fn fill_count(&self) -> u32 {
        self.fill_count
    }

    pub fn active_order_id(&self) -> Option<&str> {
        self.active_order_id.as_deref()
    }

    pub fn target_qty(&self) -> Decimal {
        self.target_qty
    }

    /// Check if the given action is valid from the current state
    pub fn can_transition(&self, action: LifecycleAction) -> bool {
        matches!(
            (self.state, action),
            (LifecycleState::Active, LifecycleAction::Retire)
                | (LifecycleState::Retired, LifecycleAction::Destroy)
        )
    }

    /// Perform a lifecycle transition
    pub fn transition(&mut self, action: LifecycleAction) -> Result<LifecycleState, GridError> {
        if !self.can_transition(action) {
            return Err(GridError::InvalidTransition {
                slot_id: self.id,
                from: self.state,
                action,
            });
        }

        self.state = match action {
            LifecycleAction::Retire => LifecycleState::Retired,
            LifecycleAction::Destroy => LifecycleState::Dead,
        };
        Ok(self.state)
    }

    /// Move an active slot to a new price while keeping its id and accumulated state.
    pub(crate) fn reprice(&mut self, price: Decimal, direction: Side) {
        self.price = price;
        self.direction = direction;
        self.active_order_id = None;
    }

    pub(crate) fn set_fill_count(&mut self, fill_count: u32) {
        self.fill_count = fill_count;
    }

    pub(crate) fn attach_order(&mut self, order_id: String, qty: Decimal) {
        self.active_order_id = Some(order_id);
        self.target_qty = qty;
    }

    pub(crate) fn clear_order(&mut self) {
        self.active_order_id = None;
    }

    pub(crate) fn set_target_qty(&mut self, qty: Decimal) {
        self.target_qty = qty;
    }
}
