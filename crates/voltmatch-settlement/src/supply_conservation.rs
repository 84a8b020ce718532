//! Supply conservation invariant checker.
//!
//! Invariant enforced by the in-memory ledger after every mutation:
//! ```text
//! ∀ asset: Σ(balances) + Σ(held in escrow) == Σ(deposits)
//! ```
//!
//! Escrow locks, settlements, refunds and splits only move value between
//! accounts and holds; none of them may create or destroy it.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use voltmatch_types::{Result, VoltmatchError};

/// What the ledger accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    /// Payment currency held by buyers.
    Value,
    /// Energy credits held by sellers.
    EnergyCredits,
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value => write!(f, "value"),
            Self::EnergyCredits => write!(f, "energy-credits"),
        }
    }
}

/// Tracks per-asset issuance and validates conservation.
#[derive(Debug, Default)]
pub struct SupplyConservation {
    /// Total deposited per asset.
    deposits: HashMap<Asset, Decimal>,
}

impl SupplyConservation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record value entering the ledger.
    pub fn record_deposit(&mut self, asset: Asset, amount: Decimal) {
        *self.deposits.entry(asset).or_insert(Decimal::ZERO) += amount;
    }

    /// Expected total supply for an asset.
    #[must_use]
    pub fn expected_supply(&self, asset: Asset) -> Decimal {
        self.deposits.get(&asset).copied().unwrap_or(Decimal::ZERO)
    }

    /// Verify that balances plus escrow holds match total deposits.
    ///
    /// # Errors
    /// [`VoltmatchError::Internal`] if actual ≠ expected.
    pub fn verify(&self, asset: Asset, actual_supply: Decimal) -> Result<()> {
        let expected = self.expected_supply(asset);
        if actual_supply != expected {
            return Err(VoltmatchError::Internal(format!(
                "supply invariant violated for {asset}: actual {actual_supply} != expected {expected}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_supply_is_zero() {
        let sc = SupplyConservation::new();
        assert_eq!(sc.expected_supply(Asset::Value), Decimal::ZERO);
        assert!(sc.verify(Asset::Value, Decimal::ZERO).is_ok());
    }

    #[test]
    fn deposits_increase_expected() {
        let mut sc = SupplyConservation::new();
        sc.record_deposit(Asset::Value, Decimal::new(1000, 0));
        sc.record_deposit(Asset::Value, Decimal::new(500, 0));
        assert_eq!(sc.expected_supply(Asset::Value), Decimal::new(1500, 0));
    }

    #[test]
    fn verify_fails_when_imbalanced() {
        let mut sc = SupplyConservation::new();
        sc.record_deposit(Asset::EnergyCredits, Decimal::new(10, 0));
        let err = sc.verify(Asset::EnergyCredits, Decimal::new(11, 0)).unwrap_err();
        assert!(matches!(err, VoltmatchError::Internal(_)));
        assert!(err.to_string().contains("energy-credits"));
    }

    #[test]
    fn assets_independent() {
        let mut sc = SupplyConservation::new();
        sc.record_deposit(Asset::Value, Decimal::new(50, 0));
        sc.record_deposit(Asset::EnergyCredits, Decimal::new(5, 0));
        assert!(sc.verify(Asset::Value, Decimal::new(50, 0)).is_ok());
        assert!(sc.verify(Asset::EnergyCredits, Decimal::new(5, 0)).is_ok());
    }
}
