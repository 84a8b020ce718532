//! Trade types and the authoritative trade transition table.
//!
//! ## State Machine
//!
//! ```text
//!   MATCHED ──lock ok──▶ ESCROW_LOCKED ──delivery ok──▶ COMPLETED
//!      │                    │     │                         ▲
//!      │ lock failed        │     │ timeout / dispute       │ release / split
//!      ▼                    │     ▼                         │
//!   CANCELLED ◀──refund──── │  DISPUTED ────────────────────┘
//!      ▲                    │     │
//!      └────────────────────┼─────┘
//! ```
//!
//! Every transition goes through [`TradeStatus::apply`]; anything not listed
//! there is rejected with [`VoltmatchError::InvalidTransition`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{LedgerRef, MarketId, OfferId, Result, TradeId, TxHash, UserId, VoltmatchError};

/// Lifecycle status of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeStatus {
    Matched,
    EscrowLocked,
    Completed,
    Cancelled,
    Disputed,
}

impl TradeStatus {
    /// The single transition table for trades.
    #[must_use]
    pub fn apply(self, event: TradeEvent) -> Option<Self> {
        use TradeEvent as E;
        match (self, event) {
            (Self::Matched, E::EscrowLocked) => Some(Self::EscrowLocked),
            (Self::Matched, E::EscrowLockFailed) => Some(Self::Cancelled),
            (Self::EscrowLocked, E::DeliveryConfirmed) => Some(Self::Completed),
            (Self::EscrowLocked, E::DeliveryTimedOut | E::DisputeRaised) => Some(Self::Disputed),
            (Self::Disputed, E::ReleasedToSeller | E::SplitSettled) => Some(Self::Completed),
            (Self::Disputed, E::RefundedToBuyer) => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Matched => write!(f, "MATCHED"),
            Self::EscrowLocked => write!(f, "ESCROW_LOCKED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Disputed => write!(f, "DISPUTED"),
        }
    }
}

/// Inputs to the trade state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeEvent {
    EscrowLocked,
    EscrowLockFailed,
    DeliveryConfirmed,
    DeliveryTimedOut,
    DisputeRaised,
    ReleasedToSeller,
    RefundedToBuyer,
    SplitSettled,
}

impl std::fmt::Display for TradeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::EscrowLocked => "lockEscrow(success)",
            Self::EscrowLockFailed => "lockEscrow(failure)",
            Self::DeliveryConfirmed => "confirmDelivery(success)",
            Self::DeliveryTimedOut => "confirmDelivery(timeout)",
            Self::DisputeRaised => "disputeRaised",
            Self::ReleasedToSeller => "resolve(releaseToSeller)",
            Self::RefundedToBuyer => "resolve(refundToBuyer)",
            Self::SplitSettled => "resolve(partialSplit)",
        };
        f.write_str(name)
    }
}

/// A match between one sell offer and one buy offer.
///
/// `sell_offer_id`, `buy_offer_id` and `matched_price` never change after
/// creation; the remaining fields track the settlement lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub market: MarketId,
    pub sell_offer_id: OfferId,
    pub buy_offer_id: OfferId,
    pub seller_id: UserId,
    pub buyer_id: UserId,
    /// Matched quantity in kWh.
    pub matched_amount: Decimal,
    /// Price per kWh, always the resting offer's price.
    pub matched_price: Decimal,
    pub status: TradeStatus,
    /// Ledger reservation handle, set once escrow is locked.
    pub escrow_ref: Option<LedgerRef>,
    /// Final transfer hash, set exactly once on completion.
    pub settlement_tx_ref: Option<TxHash>,
    pub delivery_deadline: Option<DateTime<Utc>>,
    pub delivered_amount: Option<Decimal>,
    pub evidence_ref: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub matched_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Trade {
    /// Total value owed by the buyer: `matched_amount × matched_price`.
    ///
    /// # Errors
    /// `Internal` if the product does not fit a decimal.
    pub fn value(&self) -> Result<Decimal> {
        self.matched_amount
            .checked_mul(self.matched_price)
            .ok_or_else(|| {
                VoltmatchError::Internal(format!(
                    "value of trade {} overflows: {} kWh at {}",
                    self.id, self.matched_amount, self.matched_price
                ))
            })
    }

    #[must_use]
    pub fn is_participant(&self, user: UserId) -> bool {
        user == self.buyer_id || user == self.seller_id
    }

    /// Apply `event` through the transition table.
    ///
    /// # Errors
    /// [`VoltmatchError::InvalidTransition`] if the table has no entry.
    pub fn transition(&mut self, event: TradeEvent, now: DateTime<Utc>) -> Result<()> {
        let next = self
            .status
            .apply(event)
            .ok_or(VoltmatchError::InvalidTransition {
                trade_id: self.id,
                from: self.status,
                event,
            })?;
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Whether the delivery deadline has passed while escrow is still held.
    #[must_use]
    pub fn delivery_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == TradeStatus::EscrowLocked
            && self.delivery_deadline.is_some_and(|deadline| deadline <= now)
    }
}

impl std::fmt::Display for Trade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Trade[{}] {} {} kWh @ {} ({})",
            self.id, self.market, self.matched_amount, self.matched_price, self.status,
        )
    }
}

/// Test helpers.
#[cfg(any(test, feature = "test-helpers"))]
impl Trade {
    pub fn dummy(matched_amount: Decimal, matched_price: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: TradeId::new(),
            market: MarketId::new("zone-test"),
            sell_offer_id: OfferId::new(),
            buy_offer_id: OfferId::new(),
            seller_id: UserId::new(),
            buyer_id: UserId::new(),
            matched_amount,
            matched_price,
            status: TradeStatus::Matched,
            escrow_ref: None,
            settlement_tx_ref: None,
            delivery_deadline: None,
            delivered_amount: None,
            evidence_ref: None,
            cancel_reason: None,
            created_at: now,
            matched_at: now,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listed_transitions() {
        use TradeEvent as E;
        use TradeStatus as S;
        assert_eq!(S::Matched.apply(E::EscrowLocked), Some(S::EscrowLocked));
        assert_eq!(S::Matched.apply(E::EscrowLockFailed), Some(S::Cancelled));
        assert_eq!(S::EscrowLocked.apply(E::DeliveryConfirmed), Some(S::Completed));
        assert_eq!(S::EscrowLocked.apply(E::DeliveryTimedOut), Some(S::Disputed));
        assert_eq!(S::EscrowLocked.apply(E::DisputeRaised), Some(S::Disputed));
        assert_eq!(S::Disputed.apply(E::ReleasedToSeller), Some(S::Completed));
        assert_eq!(S::Disputed.apply(E::SplitSettled), Some(S::Completed));
        assert_eq!(S::Disputed.apply(E::RefundedToBuyer), Some(S::Cancelled));
    }

    #[test]
    fn unlisted_transitions_rejected() {
        use TradeEvent as E;
        use TradeStatus as S;
        assert_eq!(S::Matched.apply(E::DeliveryConfirmed), None);
        assert_eq!(S::Matched.apply(E::DisputeRaised), None);
        assert_eq!(S::Disputed.apply(E::DisputeRaised), None);
        assert_eq!(S::Completed.apply(E::RefundedToBuyer), None);
        assert_eq!(S::Cancelled.apply(E::EscrowLocked), None);
    }

    #[test]
    fn transition_sets_completed_at_on_terminal() {
        let mut trade = Trade::dummy(Decimal::new(5, 0), Decimal::new(10, 0));
        trade.transition(TradeEvent::EscrowLocked, Utc::now()).unwrap();
        assert!(trade.completed_at.is_none());
        trade.transition(TradeEvent::DeliveryConfirmed, Utc::now()).unwrap();
        assert_eq!(trade.status, TradeStatus::Completed);
        assert!(trade.completed_at.is_some());
    }

    #[test]
    fn invalid_transition_reports_trade() {
        let mut trade = Trade::dummy(Decimal::ONE, Decimal::ONE);
        let id = trade.id;
        let err = trade
            .transition(TradeEvent::ReleasedToSeller, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            VoltmatchError::InvalidTransition { trade_id, from: TradeStatus::Matched, .. } if trade_id == id
        ));
        assert_eq!(trade.status, TradeStatus::Matched);
    }

    #[test]
    fn value_and_overdue() {
        let mut trade = Trade::dummy(Decimal::new(4, 0), Decimal::new(25, 1));
        assert_eq!(trade.value().unwrap(), Decimal::new(10, 0));
        trade.status = TradeStatus::EscrowLocked;
        trade.delivery_deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(trade.delivery_overdue(Utc::now()));
    }

    #[test]
    fn oversized_value_is_an_error() {
        let trade = Trade::dummy(Decimal::MAX, Decimal::new(2, 0));
        assert!(matches!(trade.value(), Err(VoltmatchError::Internal(_))));
    }

    #[test]
    fn trade_serde_roundtrip() {
        let trade = Trade::dummy(Decimal::new(3, 0), Decimal::new(12, 0));
        let json = serde_json::to_string(&trade).unwrap();
        let back: Trade = serde_json::from_str(&json).unwrap();
        assert_eq!(trade.id, back.id);
        assert_eq!(trade.matched_price, back.matched_price);
        assert_eq!(back.status, TradeStatus::Matched);
    }
}
