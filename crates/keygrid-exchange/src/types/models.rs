/*
[INPUT]:  Executor contract schema and serde requirements
[OUTPUT]: Typed Rust structs with serialization support
[POS]:    Data layer - type definitions for the executor contract
[UPDATE]: When the executor contract changes or new types added
*/

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use super::enums::{OrderStatus, Side};

/// Resting order as reported by the venue. Quantities are base-asset units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub side: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub filled_qty: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl OpenOrder {
    pub fn remaining_qty(&self) -> Decimal {
        let remaining = self.qty - self.filled_qty;
        if remaining > Decimal::ZERO {
            remaining
        } else {
            Decimal::ZERO
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub entry_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub mark_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub order_id: String,
    pub side: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Contract sizing for venues that trade in contract units rather than base asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractSpec {
    /// Base-asset amount represented by one contract
    #[serde(with = "rust_decimal::serde::str")]
    pub contract_size: Decimal,
    /// Decimal places accepted for base-asset quantities
    pub qty_decimals: u32,
    /// Smallest base-asset quantity the venue accepts
    #[serde(with = "rust_decimal::serde::str")]
    pub min_qty: Decimal,
}

impl Default for ContractSpec {
    fn default() -> Self {
        Self {
            contract_size: Decimal::new(1, 4),
            qty_decimals: 4,
            min_qty: Decimal::new(1, 4),
        }
    }
}

impl ContractSpec {
    /// Whole contracts for a base quantity, rounded toward zero.
    pub fn base_to_contracts(&self, base_qty: Decimal) -> Decimal {
        if self.contract_size <= Decimal::ZERO || base_qty <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (base_qty / self.contract_size).round_dp_with_strategy(0, RoundingStrategy::ToZero)
    }

    pub fn contracts_to_base(&self, contracts: Decimal) -> Decimal {
        (contracts * self.contract_size).normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    #[test]
    fn contract_conversion_truncates_partial_contracts() {
        let spec = ContractSpec::default();
        assert_eq!(spec.base_to_contracts(dec("0.0014")), dec("14"));
        assert_eq!(spec.base_to_contracts(dec("0.00149")), dec("14"));
        assert_eq!(spec.contracts_to_base(dec("14")), dec("0.0014"));
    }

    #[test]
    fn contract_conversion_rejects_non_positive_input() {
        let spec = ContractSpec::default();
        assert_eq!(spec.base_to_contracts(Decimal::ZERO), Decimal::ZERO);
        assert_eq!(spec.base_to_contracts(dec("-1")), Decimal::ZERO);
    }

    #[test]
    fn open_order_serializes_decimals_as_strings() {
        let order = OpenOrder {
            id: "1".to_string(),
            side: Side::Sell,
            price: dec("95000"),
            qty: dec("0.0014"),
            filled_qty: Decimal::ZERO,
            status: OrderStatus::Open,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&order).expect("serialize");
        assert_eq!(json["price"], "95000");
        assert_eq!(json["side"], "sell");
        assert_eq!(order.remaining_qty(), dec("0.0014"));
    }
}
