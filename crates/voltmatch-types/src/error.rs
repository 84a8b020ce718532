//! Error types for the VoltMatch marketplace engine.
//!
//! All errors use the `VM_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Offer / validation errors
//! - 2xx: Ownership / authorization errors
//! - 3xx: Trade and dispute state errors
//! - 4xx: Market errors
//! - 5xx: Settlement ledger errors
//! - 6xx: Store errors
//! - 9xx: General / internal errors
//!
//! Every variant names the entity that triggered it; [`VoltmatchError::kind`]
//! classifies it for callers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DisputeId, MarketId, OfferId, OfferStatus, TradeEvent, TradeId, TradeStatus, UserId};

/// Coarse classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad input. Never retried.
    Validation,
    /// Wrong caller.
    Authorization,
    /// Operation not allowed in the entity's current state.
    State,
    /// Ledger or store trouble; retried with backoff where it matters.
    Infrastructure,
    Internal,
}

/// Central error enum for all VoltMatch operations.
#[derive(Debug, Error)]
pub enum VoltmatchError {
    // =================================================================
    // Offer Errors (1xx)
    // =================================================================
    /// The requested offer does not exist.
    #[error("VM_ERR_100: Offer not found: {0}")]
    OfferNotFound(OfferId),

    /// The offer failed validation.
    #[error("VM_ERR_101: Invalid offer {offer_id}: {reason}")]
    InvalidOffer { offer_id: OfferId, reason: String },

    /// The offer is FILLED, CANCELLED or EXPIRED.
    #[error("VM_ERR_102: Offer {offer_id} is already {status}")]
    AlreadyTerminal { offer_id: OfferId, status: OfferStatus },

    /// An offer with this ID is already resting in the book.
    #[error("VM_ERR_103: Offer already exists: {0}")]
    DuplicateOffer(OfferId),

    // =================================================================
    // Authorization Errors (2xx)
    // =================================================================
    /// Only the owner may cancel an offer.
    #[error("VM_ERR_200: User {requester} does not own {offer_id}")]
    NotOwner { offer_id: OfferId, requester: UserId },

    /// Only the buyer, seller or an arbiter may act on a trade.
    #[error("VM_ERR_201: User {user} is not a participant of {trade_id}")]
    NotParticipant { trade_id: TradeId, user: UserId },

    /// The user may not apply this resolution.
    #[error("VM_ERR_202: User {user} may not resolve {dispute_id}: {reason}")]
    ResolutionNotPermitted {
        dispute_id: DisputeId,
        user: UserId,
        reason: String,
    },

    // =================================================================
    // Trade / Dispute State Errors (3xx)
    // =================================================================
    /// The requested trade does not exist.
    #[error("VM_ERR_300: Trade not found: {0}")]
    TradeNotFound(TradeId),

    /// The trade transition table has no entry for this event.
    #[error("VM_ERR_301: {trade_id} cannot apply {event} while {from}")]
    InvalidTransition {
        trade_id: TradeId,
        from: TradeStatus,
        event: TradeEvent,
    },

    /// The requested dispute does not exist.
    #[error("VM_ERR_302: Dispute not found: {0}")]
    DisputeNotFound(DisputeId),

    /// The trade already has an unresolved dispute.
    #[error("VM_ERR_303: {trade_id} already has active {dispute_id}")]
    DisputeAlreadyActive {
        trade_id: TradeId,
        dispute_id: DisputeId,
    },

    /// The dispute was resolved before.
    #[error("VM_ERR_304: Dispute already resolved: {0}")]
    AlreadyResolved(DisputeId),

    /// The resolution does not fit the trade.
    #[error("VM_ERR_305: Invalid resolution for {dispute_id}: {reason}")]
    InvalidResolution { dispute_id: DisputeId, reason: String },

    /// No escrow record exists for the trade.
    #[error("VM_ERR_306: Escrow not found for {0}")]
    EscrowNotFound(TradeId),

    /// The delivery report cannot be applied to the trade.
    #[error("VM_ERR_307: Invalid delivery report for {trade_id}: {reason}")]
    InvalidDelivery { trade_id: TradeId, reason: String },

    // =================================================================
    // Market Errors (4xx)
    // =================================================================
    /// No market with this ID is configured.
    #[error("VM_ERR_400: Unknown market: {0}")]
    UnknownMarket(MarketId),

    /// The market is flagged inactive.
    #[error("VM_ERR_401: Market closed: {0}")]
    MarketClosed(MarketId),

    /// The market's sequencer task is gone.
    #[error("VM_ERR_402: Sequencer unavailable for {0}")]
    SequencerUnavailable(MarketId),

    // =================================================================
    // Ledger Errors (5xx)
    // =================================================================
    /// The settlement ledger could not be reached.
    #[error("VM_ERR_500: Ledger unavailable for {trade_id}: {reason}")]
    LedgerUnavailable { trade_id: TradeId, reason: String },

    /// The settlement ledger refused the operation.
    #[error("VM_ERR_501: Ledger rejected {trade_id}: {reason}")]
    LedgerRejected { trade_id: TradeId, reason: String },

    /// Retry budget exhausted against the ledger.
    #[error("VM_ERR_502: Ledger retries exhausted for {trade_id} after {attempts} attempts")]
    RetriesExhausted { trade_id: TradeId, attempts: u32 },

    // =================================================================
    // Store Errors (6xx)
    // =================================================================
    /// Optimistic concurrency check failed.
    #[error("VM_ERR_600: Version conflict on {entity}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        entity: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// The store failed for another reason.
    #[error("VM_ERR_601: Store error: {0}")]
    Store(String),

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("VM_ERR_900: Internal error: {0}")]
    Internal(String),

    /// Serialization / deserialization error.
    #[error("VM_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config file, missing fields, etc.).
    #[error("VM_ERR_902: Configuration error: {0}")]
    Configuration(String),

    /// I/O error (disk, network).
    #[error("VM_ERR_903: I/O error: {0}")]
    Io(String),
}

impl VoltmatchError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidOffer { .. }
            | Self::InvalidResolution { .. }
            | Self::InvalidDelivery { .. }
            | Self::Serialization(_)
            | Self::Configuration(_) => ErrorKind::Validation,
            Self::NotOwner { .. }
            | Self::NotParticipant { .. }
            | Self::ResolutionNotPermitted { .. } => ErrorKind::Authorization,
            Self::OfferNotFound(_)
            | Self::AlreadyTerminal { .. }
            | Self::DuplicateOffer(_)
            | Self::TradeNotFound(_)
            | Self::InvalidTransition { .. }
            | Self::DisputeNotFound(_)
            | Self::DisputeAlreadyActive { .. }
            | Self::AlreadyResolved(_)
            | Self::EscrowNotFound(_)
            | Self::UnknownMarket(_)
            | Self::MarketClosed(_)
            | Self::LedgerRejected { .. } => ErrorKind::State,
            Self::SequencerUnavailable(_)
            | Self::LedgerUnavailable { .. }
            | Self::RetriesExhausted { .. }
            | Self::VersionConflict { .. }
            | Self::Store(_)
            | Self::Io(_) => ErrorKind::Infrastructure,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The entity that triggered the error, when there is one.
    #[must_use]
    pub fn entity(&self) -> Option<String> {
        match self {
            Self::OfferNotFound(id) | Self::DuplicateOffer(id) => Some(id.to_string()),
            Self::InvalidOffer { offer_id, .. }
            | Self::AlreadyTerminal { offer_id, .. }
            | Self::NotOwner { offer_id, .. } => Some(offer_id.to_string()),
            Self::TradeNotFound(id) | Self::EscrowNotFound(id) => Some(id.to_string()),
            Self::NotParticipant { trade_id, .. }
            | Self::InvalidTransition { trade_id, .. }
            | Self::DisputeAlreadyActive { trade_id, .. }
            | Self::InvalidDelivery { trade_id, .. }
            | Self::LedgerUnavailable { trade_id, .. }
            | Self::LedgerRejected { trade_id, .. }
            | Self::RetriesExhausted { trade_id, .. } => Some(trade_id.to_string()),
            Self::DisputeNotFound(id) | Self::AlreadyResolved(id) => Some(id.to_string()),
            Self::ResolutionNotPermitted { dispute_id, .. }
            | Self::InvalidResolution { dispute_id, .. } => Some(dispute_id.to_string()),
            Self::UnknownMarket(id) | Self::MarketClosed(id) | Self::SequencerUnavailable(id) => {
                Some(id.to_string())
            }
            Self::VersionConflict { entity, .. } => Some(entity.clone()),
            Self::Store(_)
            | Self::Internal(_)
            | Self::Serialization(_)
            | Self::Configuration(_)
            | Self::Io(_) => None,
        }
    }

    /// Transient errors worth retrying after a re-read.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. } | Self::LedgerUnavailable { .. }
        )
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, VoltmatchError>;

impl From<std::io::Error> for VoltmatchError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for VoltmatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_contains_prefix() {
        let err = VoltmatchError::OfferNotFound(OfferId::new());
        let msg = format!("{err}");
        assert!(msg.starts_with("VM_ERR_100"), "Got: {msg}");
    }

    #[test]
    fn invalid_transition_display() {
        let err = VoltmatchError::InvalidTransition {
            trade_id: TradeId::new(),
            from: TradeStatus::Disputed,
            event: TradeEvent::DisputeRaised,
        };
        let msg = format!("{err}");
        assert!(msg.contains("VM_ERR_301"));
        assert!(msg.contains("DISPUTED"));
        assert!(msg.contains("disputeRaised"));
    }

    #[test]
    fn kinds_follow_taxonomy() {
        let offer_id = OfferId::new();
        assert_eq!(
            VoltmatchError::InvalidOffer { offer_id, reason: "x".into() }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            VoltmatchError::NotOwner { offer_id, requester: UserId::new() }.kind(),
            ErrorKind::Authorization
        );
        assert_eq!(
            VoltmatchError::AlreadyResolved(DisputeId::new()).kind(),
            ErrorKind::State
        );
        assert_eq!(
            VoltmatchError::RetriesExhausted { trade_id: TradeId::new(), attempts: 3 }.kind(),
            ErrorKind::Infrastructure
        );
    }

    #[test]
    fn entity_names_trigger() {
        let trade_id = TradeId::new();
        let err = VoltmatchError::LedgerUnavailable { trade_id, reason: "timeout".into() };
        assert_eq!(err.entity(), Some(trade_id.to_string()));
        assert!(err.is_retryable());
        assert_eq!(VoltmatchError::Internal("boom".into()).entity(), None);
    }

    #[test]
    fn all_errors_have_vm_err_prefix() {
        let errors: Vec<Box<dyn std::error::Error>> = vec![
            Box::new(VoltmatchError::MarketClosed(MarketId::new("zone-a"))),
            Box::new(VoltmatchError::Store("disk".into())),
            Box::new(VoltmatchError::Internal("test".into())),
            Box::new(VoltmatchError::VersionConflict {
                entity: "trade".into(),
                expected: Some(1),
                found: Some(2),
            }),
        ];
        for err in errors {
            let msg = format!("{err}");
            assert!(msg.starts_with("VM_ERR_"), "Error missing VM_ERR_ prefix: {msg}");
        }
    }
}
