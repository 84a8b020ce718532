//! # Escrow records
//!
//! An [`EscrowRecord`] mirrors a reservation held on the external ledger for
//! one trade: the buyer's value and the seller's pending energy credits.
//! Only the escrow coordinator creates or mutates it; matching never does.
//!
//! ## State Machine
//!
//! ```text
//!   ┌────────┐  settle / split  ┌──────────┐
//!   │ LOCKED ├─────────────────▶│ RELEASED │
//!   └───┬────┘                  └──────────┘
//!       │ refund
//!       ▼
//!   ┌──────────┐
//!   │ REFUNDED │
//!   └──────────┘
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{EscrowId, LedgerRef, Result, SettlementSplit, TradeId, VoltmatchError};

/// Lifecycle state of an escrow record. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EscrowState {
    /// Value and credits are reserved on the ledger.
    Locked,
    /// Value paid to the seller (fully or by split).
    Released,
    /// Value returned to the buyer.
    Refunded,
}

impl EscrowState {
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        matches!((self, target), (Self::Locked, Self::Released | Self::Refunded))
    }
}

impl std::fmt::Display for EscrowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked => write!(f, "LOCKED"),
            Self::Released => write!(f, "RELEASED"),
            Self::Refunded => write!(f, "REFUNDED"),
        }
    }
}

/// Escrow held for one trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowRecord {
    pub id: EscrowId,
    pub trade_id: TradeId,
    pub locked_value: Decimal,
    pub locked_energy_credits: Decimal,
    pub state: EscrowState,
    /// Reservation handle returned by the ledger.
    pub external_ref: LedgerRef,
    pub released_value: Decimal,
    pub refunded_value: Decimal,
    pub locked_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl EscrowRecord {
    #[must_use]
    pub fn locked(
        trade_id: TradeId,
        locked_value: Decimal,
        locked_energy_credits: Decimal,
        external_ref: LedgerRef,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EscrowId::new(),
            trade_id,
            locked_value,
            locked_energy_credits,
            state: EscrowState::Locked,
            external_ref,
            released_value: Decimal::ZERO,
            refunded_value: Decimal::ZERO,
            locked_at: now,
            closed_at: None,
        }
    }

    /// Close the escrow according to `split`: any payout to the seller makes
    /// it RELEASED, a pure refund makes it REFUNDED.
    ///
    /// # Errors
    /// `Internal` if the escrow is already closed or the split does not add
    /// up to the locked value.
    pub fn close(&mut self, split: &SettlementSplit, now: DateTime<Utc>) -> Result<()> {
        let target = if split.seller_value.is_zero() {
            EscrowState::Refunded
        } else {
            EscrowState::Released
        };
        if !self.state.can_transition_to(target) {
            return Err(VoltmatchError::Internal(format!(
                "cannot move {} from {} to {target}",
                self.id, self.state
            )));
        }
        if split.seller_value + split.buyer_refund != self.locked_value {
            return Err(VoltmatchError::Internal(format!(
                "split {} + {} does not match locked value {} on {}",
                split.seller_value, split.buyer_refund, self.locked_value, self.id
            )));
        }
        self.state = target;
        self.released_value = split.seller_value;
        self.refunded_value = split.buyer_refund;
        self.closed_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: i64) -> EscrowRecord {
        EscrowRecord::locked(
            TradeId::new(),
            Decimal::new(value, 0),
            Decimal::new(5, 0),
            LedgerRef("lock-1".into()),
            Utc::now(),
        )
    }

    #[test]
    fn release_closes_record() {
        let mut rec = record(50);
        let split = SettlementSplit {
            seller_value: Decimal::new(50, 0),
            buyer_refund: Decimal::ZERO,
            delivered_energy: Decimal::new(5, 0),
        };
        rec.close(&split, Utc::now()).unwrap();
        assert_eq!(rec.state, EscrowState::Released);
        assert_eq!(rec.released_value, Decimal::new(50, 0));
    }

    #[test]
    fn refund_closes_record() {
        let mut rec = record(50);
        let split = SettlementSplit {
            seller_value: Decimal::ZERO,
            buyer_refund: Decimal::new(50, 0),
            delivered_energy: Decimal::ZERO,
        };
        rec.close(&split, Utc::now()).unwrap();
        assert_eq!(rec.state, EscrowState::Refunded);
    }

    #[test]
    fn closed_record_cannot_close_again() {
        let mut rec = record(50);
        let split = SettlementSplit {
            seller_value: Decimal::new(20, 0),
            buyer_refund: Decimal::new(30, 0),
            delivered_energy: Decimal::new(2, 0),
        };
        rec.close(&split, Utc::now()).unwrap();
        assert!(rec.close(&split, Utc::now()).is_err());
    }

    #[test]
    fn unbalanced_split_rejected() {
        let mut rec = record(50);
        let split = SettlementSplit {
            seller_value: Decimal::new(20, 0),
            buyer_refund: Decimal::new(20, 0),
            delivered_energy: Decimal::new(2, 0),
        };
        assert!(rec.close(&split, Utc::now()).is_err());
        assert_eq!(rec.state, EscrowState::Locked);
    }

    #[test]
    fn state_transitions_are_monotonic() {
        assert!(EscrowState::Locked.can_transition_to(EscrowState::Released));
        assert!(!EscrowState::Released.can_transition_to(EscrowState::Locked));
        assert!(!EscrowState::Refunded.can_transition_to(EscrowState::Released));
    }
}
