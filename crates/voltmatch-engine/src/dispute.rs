//! Dispute desk: who may raise and resolve disputes.
//!
//! Any trade participant or configured arbiter may raise a dispute on an
//! ESCROW_LOCKED trade. Arbiters may apply any resolution. A participant
//! may only concede: the buyer can release the escrow to the seller, the
//! seller can refund the buyer. The money movement itself happens in the
//! [`EscrowCoordinator`].

use std::collections::HashSet;
use std::sync::Arc;

use voltmatch_types::{
    Dispute, DisputeId, Resolution, Result, Trade, TradeId, UserId, VoltmatchError,
};

use crate::coordinator::EscrowCoordinator;
use crate::store::Repository;

/// A resolved dispute and the trade it settled.
#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    pub dispute: Dispute,
    pub trade: Trade,
}

pub struct DisputeDesk {
    coordinator: Arc<EscrowCoordinator>,
    store: Arc<dyn Repository>,
    arbiters: HashSet<UserId>,
}

impl DisputeDesk {
    #[must_use]
    pub fn new(
        coordinator: Arc<EscrowCoordinator>,
        store: Arc<dyn Repository>,
        arbiters: impl IntoIterator<Item = UserId>,
    ) -> Self {
        Self {
            coordinator,
            store,
            arbiters: arbiters.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn is_arbiter(&self, user: UserId) -> bool {
        self.arbiters.contains(&user)
    }

    pub async fn raise(
        &self,
        trade_id: TradeId,
        raised_by: UserId,
        reason: String,
    ) -> Result<Dispute> {
        let trade = self
            .store
            .load_trade(trade_id)
            .await?
            .ok_or(VoltmatchError::TradeNotFound(trade_id))?
            .value;
        if !trade.is_participant(raised_by) && !self.is_arbiter(raised_by) {
            return Err(VoltmatchError::NotParticipant {
                trade_id,
                user: raised_by,
            });
        }
        self.coordinator.raise_dispute(trade_id, raised_by, reason).await
    }

    pub async fn resolve(
        &self,
        dispute_id: DisputeId,
        resolved_by: UserId,
        resolution: Resolution,
    ) -> Result<ResolutionOutcome> {
        let dispute = self
            .store
            .load_dispute(dispute_id)
            .await?
            .ok_or(VoltmatchError::DisputeNotFound(dispute_id))?
            .value;
        if !dispute.is_active() {
            return Err(VoltmatchError::AlreadyResolved(dispute_id));
        }
        let trade = self
            .store
            .load_trade(dispute.trade_id)
            .await?
            .ok_or(VoltmatchError::TradeNotFound(dispute.trade_id))?
            .value;
        self.authorize(&dispute, &trade, resolved_by, resolution)?;

        let (dispute, trade) = self
            .coordinator
            .resolve_dispute(dispute_id, resolved_by, resolution)
            .await?;
        Ok(ResolutionOutcome { dispute, trade })
    }

    fn authorize(
        &self,
        dispute: &Dispute,
        trade: &Trade,
        user: UserId,
        resolution: Resolution,
    ) -> Result<()> {
        if self.is_arbiter(user) {
            return Ok(());
        }
        let concession = if user == trade.buyer_id {
            Resolution::ReleaseToSeller
        } else if user == trade.seller_id {
            Resolution::RefundToBuyer
        } else {
            return Err(VoltmatchError::NotParticipant {
                trade_id: trade.id,
                user,
            });
        };
        if resolution != concession {
            return Err(VoltmatchError::ResolutionNotPermitted {
                dispute_id: dispute.id,
                user,
                reason: format!("participants may only resolve with {concession}"),
            });
        }
        Ok(())
    }
}
