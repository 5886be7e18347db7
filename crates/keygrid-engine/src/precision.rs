/*
[INPUT]:  Raw base-asset quantities and venue quantity constraints
[OUTPUT]: Quantities aligned to the venue step, or None on underflow
[POS]:    Precision layer - pure quantization helpers shared by both pathways
[UPDATE]: When venue precision rules or rounding policy change
*/

use keygrid_exchange::ContractSpec;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;

/// Rounding direction for quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Down,
    Up,
}

impl Rounding {
    fn strategy(self) -> RoundingStrategy {
        match self {
            Rounding::Down => RoundingStrategy::ToZero,
            Rounding::Up => RoundingStrategy::AwayFromZero,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrecisionGuard {
    qty_decimals: u32,
    min_qty: Decimal,
}

impl PrecisionGuard {
    pub fn new(qty_decimals: u32, min_qty: Decimal) -> Self {
        Self {
            qty_decimals,
            min_qty,
        }
    }

    pub fn from_spec(spec: &ContractSpec) -> Self {
        Self::new(spec.qty_decimals, spec.min_qty)
    }

    pub fn min_qty(&self) -> Decimal {
        self.min_qty
    }

    /// Align to the venue step without applying the minimum.
    pub fn quantize(&self, qty: Decimal, rounding: Rounding) -> Decimal {
        if qty <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        qty.round_dp_with_strategy(self.qty_decimals, rounding.strategy())
            .normalize()
    }

    /// Align and enforce the minimum tradable quantity.
    ///
    /// Returns `None` when the aligned quantity is below the minimum; callers drop
    /// the action instead of treating it as an error.
    pub fn tradable(&self, qty: Decimal, rounding: Rounding) -> Option<Decimal> {
        let aligned = self.quantize(qty, rounding);
        if aligned < self.min_qty || aligned <= Decimal::ZERO {
            if qty > Decimal::ZERO {
                debug!(raw = %qty, aligned = %aligned, min_qty = %self.min_qty, "precision underflow");
            }
            return None;
        }
        Some(aligned)
    }
}

/// Relative price match: `|a - b| <= b * tolerance`.
pub fn price_matches(a: Decimal, b: Decimal, tolerance: Decimal) -> bool {
    if b <= Decimal::ZERO {
        return false;
    }
    (a - b).abs() <= b * tolerance
}

pub(crate) fn decimal_min(a: Decimal, b: Decimal) -> Decimal {
    if a <= b { a } else { b }
}

pub(crate) fn decimal_max(a: Decimal, b: Decimal) -> Decimal {
    if a >= b { a } else { b }
}
