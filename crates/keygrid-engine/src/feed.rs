/*
[INPUT]:  Raw target price lists from the feed or the operator
[OUTPUT]: Validated strictly-descending target prices, optionally shaped by a boundary
[POS]:    Input layer - target price validation before any migration side effect
[UPDATE]: When boundary modes or price list rules change
*/

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{GridError, Result};

/// Strictly descending, positive, non-empty price list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPrices(Vec<Decimal>);

impl TargetPrices {
    pub fn new(mut prices: Vec<Decimal>) -> Result<Self> {
        if prices.is_empty() {
            return Err(GridError::InvariantViolation("target price list is empty".into()));
        }
        if let Some(bad) = prices.iter().find(|p| **p <= Decimal::ZERO) {
            return Err(GridError::InvariantViolation(format!(
                "target price must be positive, got {bad}"
            )));
        }
        prices.iter_mut().for_each(|p| *p = p.normalize());
        if let Some(pair) = prices.windows(2).find(|w| w[0] <= w[1]) {
            return Err(GridError::InvariantViolation(format!(
                "target prices not strictly descending: {} then {}",
                pair[0], pair[1]
            )));
        }
        Ok(Self(prices))
    }

    /// Parse a comma-separated list such as `96500,94500,92500`.
    pub fn parse(list: &str) -> Result<Self> {
        let prices = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                Decimal::from_str(s)
                    .map_err(|e| GridError::InvariantViolation(format!("invalid price {s:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(prices)
    }

    pub fn as_slice(&self) -> &[Decimal] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn highest(&self) -> Decimal {
        self.0[0]
    }

    pub fn lowest(&self) -> Decimal {
        self.0[self.0.len() - 1]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryMode {
    /// Reject lists that leave the range
    #[default]
    Strict,
    /// Drop prices outside the range
    Filter,
    /// Add the bounds as slots when the list stops short of them
    Expand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualBoundary {
    #[serde(with = "rust_decimal::serde::str")]
    pub lower: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub upper: Decimal,
    #[serde(default)]
    pub mode: BoundaryMode,
}

impl ManualBoundary {
    pub fn validate(&self) -> Result<()> {
        if self.lower <= Decimal::ZERO || self.upper <= self.lower {
            return Err(GridError::InvariantViolation(format!(
                "invalid boundary [{}, {}]",
                self.lower, self.upper
            )));
        }
        Ok(())
    }

    fn contains(&self, price: Decimal) -> bool {
        price >= self.lower && price <= self.upper
    }

    pub fn apply(&self, prices: TargetPrices) -> Result<TargetPrices> {
        self.validate()?;
        match self.mode {
            BoundaryMode::Strict => {
                if let Some(outside) = prices.as_slice().iter().find(|p| !self.contains(**p)) {
                    return Err(GridError::InvariantViolation(format!(
                        "price {outside} outside boundary [{}, {}]",
                        self.lower, self.upper
                    )));
                }
                Ok(prices)
            }
            BoundaryMode::Filter => {
                let kept: Vec<Decimal> = prices
                    .as_slice()
                    .iter()
                    .copied()
                    .filter(|p| self.contains(*p))
                    .collect();
                let dropped = prices.len() - kept.len();
                if dropped > 0 {
                    debug!(dropped, "prices outside boundary filtered");
                }
                TargetPrices::new(kept)
            }
            BoundaryMode::Expand => {
                let mut expanded = prices.as_slice().to_vec();
                if prices.highest() < self.upper {
                    expanded.insert(0, self.upper);
                }
                if prices.lowest() > self.lower {
                    expanded.push(self.lower);
                }
                if expanded.len() != prices.len() {
                    info!(
                        lower = %self.lower,
                        upper = %self.upper,
                        "boundary prices added to target list"
                    );
                }
                TargetPrices::new(expanded)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    #[rstest]
    #[case("")]
    #[case("94000,95000")]
    #[case("95000,95000")]
    #[case("95000,-1")]
    #[case("95000,abc")]
    fn invalid_lists_are_rejected(#[case] list: &str) {
        assert!(matches!(
            TargetPrices::parse(list),
            Err(GridError::InvariantViolation(_))
        ));
    }

    #[test]
    fn parse_accepts_descending_list() {
        let prices = TargetPrices::parse("96500, 94500,92500").expect("valid");
        assert_eq!(prices.as_slice(), &[dec("96500"), dec("94500"), dec("92500")]);
        assert_eq!(prices.highest(), dec("96500"));
        assert_eq!(prices.lowest(), dec("92500"));
    }

    #[rstest]
    #[case(BoundaryMode::Filter, Some(vec!["95000", "94000"]))]
    #[case(BoundaryMode::Strict, None)]
    #[case(BoundaryMode::Expand, None)]
    fn boundary_modes(#[case] mode: BoundaryMode, #[case] expected: Option<Vec<&str>>) {
        let boundary = ManualBoundary {
            lower: dec("93000"),
            upper: dec("95500"),
            mode,
        };
        let prices = TargetPrices::parse("96000,95000,94000").expect("valid");
        let result = boundary.apply(prices);
        match expected {
            Some(list) => {
                let want: Vec<Decimal> = list.iter().map(|p| dec(p)).collect();
                assert_eq!(result.expect("shaped").as_slice(), want.as_slice());
            }
            None if mode == BoundaryMode::Strict => assert!(result.is_err()),
            None => {
                // 96000 is above the upper bound so only the lower bound is added
                let shaped = result.expect("expanded");
                assert_eq!(shaped.lowest(), dec("93000"));
                assert_eq!(shaped.highest(), dec("96000"));
            }
        }
    }
}
