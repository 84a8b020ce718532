//! Offer types for the VoltMatch marketplace.
//!
//! An [`Offer`] is a standing intent to buy or sell energy at a fixed price
//! per kWh. The Offer Store owns its lifecycle; the order book only keeps a
//! lightweight reference while the offer is resting.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{MarketId, OfferId, Result, UserId, VoltmatchError};

/// Which side of the book this offer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum OfferSide {
    Buy,
    Sell,
}

impl OfferSide {
    /// The side this offer matches against.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OfferSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Lifecycle status of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum OfferStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
}

impl OfferStatus {
    /// FILLED, CANCELLED and EXPIRED offers never re-enter the book through
    /// normal operation.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Expired)
    }
}

impl std::fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Submitter-declared urgency carried from the trading schema.
///
/// Informational only: matching is strict price-time priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OfferPriority {
    Low,
    #[default]
    Medium,
    High,
}

/// A buy or sell offer for energy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub owner_id: UserId,
    pub market: MarketId,
    pub side: OfferSide,
    /// Originally offered quantity in kWh.
    pub energy_amount: Decimal,
    pub price_per_unit: Decimal,
    /// Quantity still available for matching.
    pub remaining_amount: Decimal,
    pub status: OfferStatus,
    pub priority: OfferPriority,
    /// Arrival order within the market, assigned by the sequencer.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters of a new offer as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferRequest {
    pub owner_id: UserId,
    pub side: OfferSide,
    pub energy_amount: Decimal,
    pub price_per_unit: Decimal,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub priority: OfferPriority,
}

impl Offer {
    /// Build a fresh OPEN offer from a client request.
    #[must_use]
    pub fn from_request(market: MarketId, request: OfferRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: OfferId::new(),
            owner_id: request.owner_id,
            market,
            side: request.side,
            energy_amount: request.energy_amount,
            price_per_unit: request.price_per_unit,
            remaining_amount: request.energy_amount,
            status: OfferStatus::Open,
            priority: request.priority,
            sequence: 0,
            created_at: now,
            expires_at: request.expires_at,
            updated_at: now,
        }
    }

    /// Reject non-positive quantities and prices and offers that are already
    /// expired at `now`.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.energy_amount <= Decimal::ZERO {
            return Err(VoltmatchError::InvalidOffer {
                offer_id: self.id,
                reason: format!("energy amount must be positive, got {}", self.energy_amount),
            });
        }
        if self.price_per_unit <= Decimal::ZERO {
            return Err(VoltmatchError::InvalidOffer {
                offer_id: self.id,
                reason: format!("price per unit must be positive, got {}", self.price_per_unit),
            });
        }
        if self.energy_amount.checked_mul(self.price_per_unit).is_none() {
            return Err(VoltmatchError::InvalidOffer {
                offer_id: self.id,
                reason: format!(
                    "value of {} kWh at {} overflows",
                    self.energy_amount, self.price_per_unit
                ),
            });
        }
        if self.expires_at <= now {
            return Err(VoltmatchError::InvalidOffer {
                offer_id: self.id,
                reason: format!("offer expired at {}", self.expires_at),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    #[must_use]
    pub fn filled_amount(&self) -> Decimal {
        self.energy_amount - self.remaining_amount
    }

    /// Consume `amount` from the remaining quantity and derive the new status.
    ///
    /// # Errors
    /// `Internal` if the fill exceeds the remaining quantity; callers only
    /// fill amounts computed by the matcher.
    pub fn apply_fill(&mut self, amount: Decimal, now: DateTime<Utc>) -> Result<()> {
        if amount <= Decimal::ZERO || amount > self.remaining_amount {
            return Err(VoltmatchError::Internal(format!(
                "fill of {amount} exceeds remaining {} on {}",
                self.remaining_amount, self.id
            )));
        }
        self.remaining_amount -= amount;
        self.status = self.fill_status();
        self.updated_at = now;
        Ok(())
    }

    /// Return `amount` to the offer after the trade that consumed it was
    /// cancelled before escrow could be locked.
    ///
    /// Offers cancelled or expired in the meantime keep their terminal
    /// status; the quantity is not resurrected. Returns `true` when the offer
    /// is live again and belongs back in the book.
    pub fn restore(&mut self, amount: Decimal, now: DateTime<Utc>) -> Result<bool> {
        if matches!(self.status, OfferStatus::Cancelled | OfferStatus::Expired) {
            return Ok(false);
        }
        if amount <= Decimal::ZERO || self.remaining_amount + amount > self.energy_amount {
            return Err(VoltmatchError::Internal(format!(
                "restoring {amount} to {} would exceed its energy amount {}",
                self.id, self.energy_amount
            )));
        }
        self.remaining_amount += amount;
        self.status = self.fill_status();
        self.updated_at = now;
        Ok(true)
    }

    fn fill_status(&self) -> OfferStatus {
        if self.remaining_amount.is_zero() {
            OfferStatus::Filled
        } else if self.remaining_amount == self.energy_amount {
            OfferStatus::Open
        } else {
            OfferStatus::PartiallyFilled
        }
    }
}

/// Test helpers.
#[cfg(any(test, feature = "test-helpers"))]
impl Offer {
    pub fn dummy(side: OfferSide, price: Decimal, amount: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: OfferId::new(),
            owner_id: UserId::new(),
            market: MarketId::new("zone-test"),
            side,
            energy_amount: amount,
            price_per_unit: price,
            remaining_amount: amount,
            status: OfferStatus::Open,
            priority: OfferPriority::Medium,
            sequence: 0,
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
            updated_at: now,
        }
    }
}

#[cfg(any(test, feature = "test-helpers"))]
impl OfferRequest {
    pub fn dummy(owner_id: UserId, side: OfferSide, price: Decimal, amount: Decimal) -> Self {
        Self {
            owner_id,
            side,
            energy_amount: amount,
            price_per_unit: price,
            expires_at: Utc::now() + chrono::Duration::hours(1),
            priority: OfferPriority::Medium,
        }
    }
}
