//! Dispute types: `NONE → INITIATED → RESOLVED`.
//!
//! A dispute references a trade but is a separate record. At most one
//! unresolved dispute exists per trade.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{DisputeId, Result, Trade, TradeId, UserId, VoltmatchError};

/// Lifecycle status of a trade's dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisputeStatus {
    /// No dispute has been raised.
    None,
    Initiated,
    Resolved,
}

impl std::fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Initiated => write!(f, "INITIATED"),
            Self::Resolved => write!(f, "RESOLVED"),
        }
    }
}

/// Why a dispute was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeReason {
    /// Free-text claim from a participant or arbiter.
    Claim(String),
    /// Delivery confirmation reported less energy than matched.
    DeliveryShortfall { expected: Decimal, delivered: Decimal },
    /// No delivery confirmation arrived before the deadline.
    DeliveryTimeout { deadline: DateTime<Utc> },
}

impl std::fmt::Display for DisputeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claim(text) => write!(f, "claim: {text}"),
            Self::DeliveryShortfall { expected, delivered } => {
                write!(f, "delivery shortfall: expected {expected} kWh, delivered {delivered} kWh")
            }
            Self::DeliveryTimeout { deadline } => write!(f, "no delivery before {deadline}"),
        }
    }
}

/// Outcome chosen when resolving a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Full escrowed value goes to the seller; trade completes.
    ReleaseToSeller,
    /// Full escrowed value returns to the buyer; trade cancels.
    RefundToBuyer,
    /// `delivered` kWh are paid at the matched price, the rest is refunded.
    PartialSplit { delivered: Decimal },
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReleaseToSeller => write!(f, "releaseToSeller"),
            Self::RefundToBuyer => write!(f, "refundToBuyer"),
            Self::PartialSplit { delivered } => write!(f, "partialSplit({delivered})"),
        }
    }
}

/// How escrowed value is divided when a trade settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementSplit {
    /// Value paid out to the seller.
    pub seller_value: Decimal,
    /// Value returned to the buyer.
    pub buyer_refund: Decimal,
    /// Energy credits transferred to the buyer.
    pub delivered_energy: Decimal,
}

impl Resolution {
    /// Compute the value split this resolution applies to `trade`.
    ///
    /// # Errors
    /// `InvalidResolution` if a partial split is not strictly between zero
    /// and the matched amount; `Internal` if the value overflows.
    pub fn split(&self, dispute_id: DisputeId, trade: &Trade) -> Result<SettlementSplit> {
        let value = trade.value()?;
        match *self {
            Self::ReleaseToSeller => Ok(SettlementSplit {
                seller_value: value,
                buyer_refund: Decimal::ZERO,
                delivered_energy: trade.matched_amount,
            }),
            Self::RefundToBuyer => Ok(SettlementSplit {
                seller_value: Decimal::ZERO,
                buyer_refund: value,
                delivered_energy: Decimal::ZERO,
            }),
            Self::PartialSplit { delivered } => {
                if delivered <= Decimal::ZERO || delivered >= trade.matched_amount {
                    return Err(VoltmatchError::InvalidResolution {
                        dispute_id,
                        reason: format!(
                            "partial split of {delivered} kWh must be between 0 and {} exclusive",
                            trade.matched_amount
                        ),
                    });
                }
                let seller_value = delivered.checked_mul(trade.matched_price).ok_or_else(|| {
                    VoltmatchError::InvalidResolution {
                        dispute_id,
                        reason: format!("value of {delivered} kWh overflows"),
                    }
                })?;
                Ok(SettlementSplit {
                    seller_value,
                    buyer_refund: value - seller_value,
                    delivered_energy: delivered,
                })
            }
        }
    }
}

/// A resolution whose ledger call may already have run.
///
/// Stored on the dispute before any value moves, so an interrupted
/// resolution is finished with the same outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingResolution {
    pub resolution: Resolution,
    pub resolved_by: UserId,
}

/// A dispute against a single trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub trade_id: TradeId,
    /// `None` when the engine raised it (shortfall / timeout).
    pub raised_by: Option<UserId>,
    pub reason: DisputeReason,
    pub status: DisputeStatus,
    pub resolution: Option<Resolution>,
    pub resolved_by: Option<UserId>,
    #[serde(default)]
    pub pending_resolution: Option<PendingResolution>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Dispute {
    /// Open a dispute (`NONE → INITIATED`).
    #[must_use]
    pub fn initiate(
        trade_id: TradeId,
        raised_by: Option<UserId>,
        reason: DisputeReason,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DisputeId::new(),
            trade_id,
            raised_by,
            reason,
            status: DisputeStatus::Initiated,
            resolution: None,
            resolved_by: None,
            pending_resolution: None,
            created_at: now,
            resolved_at: None,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == DisputeStatus::Initiated
    }

    /// Mark `resolution` as under way, or return the one already under way.
    ///
    /// # Errors
    /// `AlreadyResolved` if the dispute was closed before.
    pub fn begin_resolution(
        &mut self,
        resolution: Resolution,
        resolved_by: UserId,
    ) -> Result<PendingResolution> {
        if !self.is_active() {
            return Err(VoltmatchError::AlreadyResolved(self.id));
        }
        Ok(*self.pending_resolution.get_or_insert(PendingResolution {
            resolution,
            resolved_by,
        }))
    }

    /// Close the dispute (`INITIATED → RESOLVED`).
    ///
    /// # Errors
    /// `AlreadyResolved` if the dispute was closed before.
    pub fn resolve(
        &mut self,
        resolution: Resolution,
        resolved_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status == DisputeStatus::Resolved {
            return Err(VoltmatchError::AlreadyResolved(self.id));
        }
        self.status = DisputeStatus::Resolved;
        self.resolution = Some(resolution);
        self.resolved_by = Some(resolved_by);
        self.resolved_at = Some(now);
        self.pending_resolution = None;
        Ok(())
    }
}
