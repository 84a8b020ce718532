//! Settlement adapter: the engine's only view of the external ledger.
//!
//! Every call is keyed on [`TradeId`] and must be idempotent on the ledger
//! side: repeating a call for the same trade returns the original result and
//! moves no value twice.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use voltmatch_types::{LedgerRef, TradeId, TxHash, UserId, VoltmatchError};

/// Failure reported by a ledger call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Transient: the ledger could not be reached or timed out.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    /// Permanent: the ledger refused the operation (e.g. insufficient funds).
    #[error("ledger rejected: {0}")]
    Rejected(String),
}

impl LedgerError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Map into the engine error for `trade_id`.
    #[must_use]
    pub fn for_trade(self, trade_id: TradeId) -> VoltmatchError {
        match self {
            Self::Unavailable(reason) => VoltmatchError::LedgerUnavailable { trade_id, reason },
            Self::Rejected(reason) => VoltmatchError::LedgerRejected { trade_id, reason },
        }
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Reservation requested when a trade's escrow is locked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub trade_id: TradeId,
    /// Buyer: pays `value`.
    pub payer: UserId,
    /// Seller: delivers `energy_credits`.
    pub payee: UserId,
    pub value: Decimal,
    pub energy_credits: Decimal,
}

/// External value-transfer ledger.
#[async_trait]
pub trait SettlementAdapter: Send + Sync {
    /// Reserve the buyer's value and the seller's energy credits.
    async fn lock(&self, request: &LockRequest) -> LedgerResult<LedgerRef>;

    /// Release the full reservation: value to the seller, credits to the buyer.
    async fn settle(&self, trade_id: TradeId, escrow: &LedgerRef) -> LedgerResult<TxHash>;

    /// Return the reservation to its owners.
    async fn refund(&self, trade_id: TradeId, escrow: &LedgerRef) -> LedgerResult<()>;

    /// Pay `release_value` to the seller and refund the rest to the buyer.
    /// Credits move in the same proportion.
    async fn split(
        &self,
        trade_id: TradeId,
        escrow: &LedgerRef,
        release_value: Decimal,
    ) -> LedgerResult<TxHash>;
}
